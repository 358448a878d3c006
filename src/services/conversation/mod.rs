//! 对话编排
//!
//! 驱动与后端的多轮工具调用对话：每轮发送完整消息序列，
//! 后端要么发出完成信号，要么请求读取项目内的其他文件。

pub mod progress;

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::llm::{
    BackendResponse, ChatBackend, ConversationMessage, LlmError, ToolCallRequest, ToolDefinition,
};
use crate::services::file_access::{FileAccess, FILE_PATH_ARG};

pub use progress::{
    CollectingPresenter, ProgressChannel, ProgressEvent, ProgressPresenter, ProgressSink,
    SpinnerPresenter,
};

/// 默认最大轮数
pub const DEFAULT_MAX_TURNS: usize = 25;

/// 对话失败原因
#[derive(Debug, thiserror::Error)]
pub enum ConversationError {
    /// 传输层失败，本层不重试
    #[error("无法连接后端: {0}")]
    ConnectionFailure(#[source] LlmError),

    /// 后端响应形态不合法或请求了未知工具
    #[error("后端响应违反协议: {0}")]
    ProtocolViolation(String),

    #[error("对话超过最大轮数 {0}")]
    TurnLimitExceeded(usize),
}

/// 对话结果：成功时为后端生成的最终文本
pub type ConversationOutcome = Result<String, ConversationError>;

/// 一次完整对话的记录
#[derive(Debug)]
pub struct ConversationRun {
    pub outcome: ConversationOutcome,
    /// 完整消息序列
    pub messages: Vec<ConversationMessage>,
    /// 后端调用次数
    pub turns: usize,
}

/// 对话编排器
pub struct Orchestrator {
    backend: Arc<dyn ChatBackend>,
    max_turns: usize,
}

impl Orchestrator {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self {
            backend,
            max_turns: DEFAULT_MAX_TURNS,
        }
    }

    /// 设置最大轮数（至少为 1）
    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns.max(1);
        self
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    /// 执行一次对话
    pub async fn run(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        tool: &ToolDefinition,
        files: &FileAccess,
        progress: &ProgressSink,
    ) -> ConversationRun {
        let mut messages = vec![
            ConversationMessage::system(system_prompt),
            ConversationMessage::user(user_prompt),
        ];
        let mut turns = 0;

        let outcome = loop {
            if turns >= self.max_turns {
                break Err(ConversationError::TurnLimitExceeded(self.max_turns));
            }
            turns += 1;

            debug!(
                "Conversation turn {}: backend={}, messages={}",
                turns,
                self.backend.describe(),
                messages.len()
            );

            let response = match self.backend.complete(&messages, tool).await {
                Ok(response) => response,
                Err(e) if e.is_protocol_violation() => {
                    break Err(ConversationError::ProtocolViolation(e.to_string()))
                }
                Err(e) => break Err(ConversationError::ConnectionFailure(e)),
            };

            match response {
                BackendResponse::Stop { text } => {
                    info!("Conversation finished: turns={}, chars={}", turns, text.len());
                    break Ok(text);
                }
                BackendResponse::ToolCalls { calls, .. } if calls.is_empty() => {
                    break Err(ConversationError::ProtocolViolation(
                        "tool call response carried no tool calls".to_string(),
                    ));
                }
                BackendResponse::ToolCalls { text, calls } => {
                    if let Some(narrative) = text.as_deref().filter(|t| !t.trim().is_empty()) {
                        progress.emit(narrative);
                    }

                    messages.push(ConversationMessage::assistant(text, calls.clone()));

                    if let Err(e) = dispatch_calls(&calls, tool, files, progress, &mut messages).await {
                        break Err(e);
                    }
                }
            }
        };

        if let Err(e) = &outcome {
            warn!("Conversation failed after {} turns: {}", turns, e);
            progress.emit(format!("Documentation failed: {}", e));
        }

        ConversationRun {
            outcome,
            messages,
            turns,
        }
    }
}

/// 按顺序处理一轮中的全部工具调用，结果追加到消息序列
async fn dispatch_calls(
    calls: &[ToolCallRequest],
    tool: &ToolDefinition,
    files: &FileAccess,
    progress: &ProgressSink,
    messages: &mut Vec<ConversationMessage>,
) -> Result<(), ConversationError> {
    for call in calls {
        if call.name != tool.name {
            return Err(ConversationError::ProtocolViolation(format!(
                "backend requested unknown tool: {}",
                call.name
            )));
        }

        let Some(path) = call.string_argument(FILE_PATH_ARG).filter(|p| !p.trim().is_empty()) else {
            warn!("Tool call {} has no usable {} argument", call.id, FILE_PATH_ARG);
            progress.emit(format!(
                "LLM requested a file without a valid {} argument: {}",
                FILE_PATH_ARG,
                call.arguments_json()
            ));
            messages.push(ConversationMessage::tool_result(call, None));
            continue;
        };

        progress.emit(format!("LLM requested additional file: {}", path));

        let content = match files.read(path).await {
            Ok(content) => {
                debug!("Served {} ({} bytes) for call {}", path, content.len(), call.id);
                content
            }
            Err(e) => {
                if e.is_security_violation() {
                    warn!("Rejected file request {}: {}", path, e);
                } else {
                    debug!("File request {} failed: {}", path, e);
                }
                e.to_string()
            }
        };

        messages.push(ConversationMessage::tool_result(call, Some(content)));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::file_access::file_tool_definition;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::fs;
    use tempfile::TempDir;

    /// 按脚本返回响应的后端
    struct ScriptedBackend {
        script: Mutex<VecDeque<Result<BackendResponse, LlmError>>>,
        /// 脚本用完后重复返回的响应
        fallback: Option<BackendResponse>,
        seen: Mutex<Vec<Vec<ConversationMessage>>>,
    }

    impl ScriptedBackend {
        fn new(script: Vec<Result<BackendResponse, LlmError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                fallback: None,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn repeating(response: BackendResponse) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(VecDeque::new()),
                fallback: Some(response),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.seen.lock().len()
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        fn describe(&self) -> String {
            "scripted".to_string()
        }

        async fn complete(
            &self,
            messages: &[ConversationMessage],
            _tool: &ToolDefinition,
        ) -> Result<BackendResponse, LlmError> {
            self.seen.lock().push(messages.to_vec());
            if let Some(next) = self.script.lock().pop_front() {
                return next;
            }
            self.fallback
                .clone()
                .ok_or_else(|| LlmError::StreamError("script exhausted".to_string()))
        }
    }

    fn request(id: &str, arguments: Value) -> ToolCallRequest {
        ToolCallRequest {
            id: id.to_string(),
            name: "get_additional_file".to_string(),
            arguments,
        }
    }

    fn file_request(id: &str, path: &str) -> BackendResponse {
        BackendResponse::ToolCalls {
            text: None,
            calls: vec![request(id, json!({ "file_path": path }))],
        }
    }

    fn stop(text: &str) -> BackendResponse {
        BackendResponse::Stop {
            text: text.to_string(),
        }
    }

    fn project() -> (TempDir, FileAccess) {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/helpers.py"), "def helper():\n    return 1\n").unwrap();
        let access = FileAccess::new(dir.path()).unwrap();
        (dir, access)
    }

    async fn converse(backend: Arc<ScriptedBackend>, max_turns: usize) -> (ConversationRun, Vec<String>) {
        let (_dir, files) = project();
        let channel = ProgressChannel::open(CollectingPresenter::default());
        let orchestrator = Orchestrator::new(backend).with_max_turns(max_turns);
        let run = orchestrator
            .run("system", "document main.py", &file_tool_definition(), &files, channel.sink())
            .await;
        let presenter = channel.close().await.unwrap();
        (run, presenter.events)
    }

    #[tokio::test]
    async fn test_file_request_then_stop() {
        let backend = ScriptedBackend::new(vec![
            Ok(BackendResponse::ToolCalls {
                text: Some("I need to see the helpers first.".to_string()),
                calls: vec![request("call_1", json!({ "file_path": "src/helpers.py" }))],
            }),
            Ok(stop("# main.py\n\nUses helper().")),
        ]);

        let (run, events) = converse(backend.clone(), DEFAULT_MAX_TURNS).await;

        assert_eq!(run.outcome.unwrap(), "# main.py\n\nUses helper().");
        assert_eq!(run.turns, 2);
        assert_eq!(
            events,
            vec![
                "I need to see the helpers first.",
                "LLM requested additional file: src/helpers.py"
            ]
        );

        assert_eq!(run.messages.len(), 4);
        let tool_message = &run.messages[3];
        assert_eq!(tool_message.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(tool_message.content.as_deref(), Some("def helper():\n    return 1\n"));
        assert_eq!(run.messages[2].tool_calls.len(), 1);

        // 第二轮请求携带了文件内容
        let seen = backend.seen.lock();
        assert_eq!(seen[1].len(), 4);
    }

    #[tokio::test]
    async fn test_traversal_rejected_and_conversation_continues() {
        let backend = ScriptedBackend::new(vec![
            Ok(file_request("call_1", "../../etc/passwd")),
            Ok(stop("done")),
        ]);

        let (run, events) = converse(backend, DEFAULT_MAX_TURNS).await;

        assert_eq!(run.outcome.unwrap(), "done");
        let content = run.messages[3].content.as_deref().unwrap();
        assert!(content.contains("access denied"));
        assert!(!content.contains("root:"));
        assert_eq!(events, vec!["LLM requested additional file: ../../etc/passwd"]);
    }

    #[tokio::test]
    async fn test_missing_file_reported_to_backend() {
        let backend = ScriptedBackend::new(vec![Ok(file_request("c", "src/nope.py")), Ok(stop("ok"))]);
        let (run, _) = converse(backend, DEFAULT_MAX_TURNS).await;

        assert!(run.outcome.is_ok());
        assert!(run.messages[3].content.as_deref().unwrap().contains("cannot read src/nope.py"));
    }

    #[tokio::test]
    async fn test_turn_limit_exceeded() {
        let backend = ScriptedBackend::repeating(file_request("loop", "src/helpers.py"));
        let (run, events) = converse(backend.clone(), 3).await;

        assert!(matches!(run.outcome, Err(ConversationError::TurnLimitExceeded(3))));
        assert_eq!(run.turns, 3);
        assert_eq!(backend.call_count(), 3);
        assert!(events.last().unwrap().starts_with("Documentation failed"));
    }

    #[tokio::test]
    async fn test_stop_on_last_allowed_turn_succeeds() {
        let max_turns = 4;
        let mut script: Vec<Result<BackendResponse, LlmError>> = (1..max_turns)
            .map(|i| Ok(file_request(&format!("call_{}", i), "src/helpers.py")))
            .collect();
        script.push(Ok(stop("fin")));
        let backend = ScriptedBackend::new(script);

        let (run, events) = converse(backend.clone(), max_turns).await;

        assert_eq!(run.outcome.unwrap(), "fin");
        assert_eq!(run.turns, max_turns);
        assert_eq!(backend.call_count(), max_turns);
        assert_eq!(run.messages.len(), 2 + 2 * (max_turns - 1));
        assert_eq!(events.len(), max_turns - 1);
    }

    #[tokio::test]
    async fn test_messages_only_appended() {
        let backend = ScriptedBackend::new(vec![
            Ok(file_request("a", "src/helpers.py")),
            Ok(file_request("b", "../secret")),
            Ok(stop("done")),
        ]);
        let (run, _) = converse(backend.clone(), DEFAULT_MAX_TURNS).await;
        assert!(run.outcome.is_ok());

        let seen = backend.seen.lock();
        assert_eq!(seen.len(), 3);
        for pair in seen.windows(2) {
            assert!(pair[1].len() > pair[0].len());
            assert_eq!(&pair[1][..pair[0].len()], &pair[0][..]);
        }
        assert_eq!(&run.messages[..seen[2].len()], &seen[2][..]);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_protocol_violation() {
        let backend = ScriptedBackend::new(vec![Ok(BackendResponse::ToolCalls {
            text: None,
            calls: vec![ToolCallRequest {
                id: "x".to_string(),
                name: "run_shell".to_string(),
                arguments: json!({ "cmd": "ls" }),
            }],
        })]);

        let (run, _) = converse(backend, DEFAULT_MAX_TURNS).await;
        assert!(matches!(run.outcome, Err(ConversationError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_connection_failure_not_retried() {
        let backend = ScriptedBackend::new(vec![Err(LlmError::ApiError {
            status: 503,
            message: "overloaded".to_string(),
        })]);

        let (run, events) = converse(backend.clone(), DEFAULT_MAX_TURNS).await;
        assert!(matches!(run.outcome, Err(ConversationError::ConnectionFailure(_))));
        assert_eq!(backend.call_count(), 1);
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_backend_protocol_error_is_violation() {
        let backend = ScriptedBackend::new(vec![Err(LlmError::ProtocolError(
            "unexpected finish reason: length".to_string(),
        ))]);

        let (run, _) = converse(backend, DEFAULT_MAX_TURNS).await;
        assert!(matches!(run.outcome, Err(ConversationError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_malformed_arguments_answered_with_empty_result() {
        let backend = ScriptedBackend::new(vec![
            Ok(BackendResponse::ToolCalls {
                text: None,
                calls: vec![
                    request("bad_json", Value::String("{file_path: oops".to_string())),
                    request("missing", json!({})),
                    request("good", json!({ "file_path": "src/helpers.py" })),
                ],
            }),
            Ok(stop("done")),
        ]);

        let (run, events) = converse(backend, DEFAULT_MAX_TURNS).await;

        assert_eq!(run.outcome.unwrap(), "done");
        assert_eq!(run.messages.len(), 6);
        assert!(run.messages[3].content.is_none());
        assert_eq!(run.messages[3].tool_call_id.as_deref(), Some("bad_json"));
        assert!(run.messages[4].content.is_none());
        assert!(run.messages[5].content.is_some());

        assert_eq!(events.len(), 3);
        assert!(events[0].contains("without a valid file_path"));
        assert_eq!(events[2], "LLM requested additional file: src/helpers.py");
    }
}
