//! LLM 类型定义

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// 消息角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// 后端发起的工具调用请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// 调用 ID，tool 结果消息通过它与请求关联
    pub id: String,
    /// 工具名称
    pub name: String,
    /// 参数对象；无法解析为 JSON 的原始参数以字符串形式保留
    pub arguments: Value,
}

impl ToolCallRequest {
    /// 读取字符串参数，缺失或类型不对时返回 None
    pub fn string_argument(&self, key: &str) -> Option<&str> {
        self.arguments.as_object()?.get(key)?.as_str()
    }

    /// 参数的线上表示（OpenAI 要求参数为 JSON 字符串）
    pub fn arguments_json(&self) -> String {
        match &self.arguments {
            Value::String(raw) => raw.clone(),
            other => other.to_string(),
        }
    }
}

/// 会话消息
///
/// 会话是只追加的消息序列，消息一旦追加就不会被修改或移除。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// 仅 assistant 消息使用
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    /// 仅 tool 消息使用
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// 仅 tool 消息使用
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ConversationMessage {
    fn new(role: Role, content: Option<String>) -> Self {
        Self {
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, Some(content.into()))
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, Some(content.into()))
    }

    /// 带工具调用的 assistant 消息，原样记录后端的请求
    pub fn assistant(content: Option<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            tool_calls,
            ..Self::new(Role::Assistant, content)
        }
    }

    /// 工具结果消息
    pub fn tool_result(call: &ToolCallRequest, content: Option<String>) -> Self {
        Self {
            tool_call_id: Some(call.id.clone()),
            name: Some(call.name.clone()),
            ..Self::new(Role::Tool, content)
        }
    }
}

/// 工具定义，每次会话声明一次，轮次之间保持不变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema 形式的参数定义
    pub parameters: Value,
}

/// 后端单轮响应
#[derive(Debug, Clone, PartialEq)]
pub enum BackendResponse {
    /// 后端发出完成信号
    Stop { text: String },
    /// 后端请求工具调用，可附带叙述文本
    ToolCalls {
        text: Option<String>,
        calls: Vec<ToolCallRequest>,
    },
}

impl BackendResponse {
    /// 由收集到的文本、工具调用和完成原因构造响应
    ///
    /// 只有 stop 和 tool_calls 两种形态合法，其余均视为协议错误。
    pub fn from_parts(
        content: String,
        calls: Vec<ToolCallRequest>,
        finish_reason: Option<&str>,
    ) -> Result<Self, LlmError> {
        let text = if content.trim().is_empty() {
            None
        } else {
            Some(content)
        };

        match finish_reason {
            Some("stop") | Some("tool_calls") | None if !calls.is_empty() => {
                Ok(BackendResponse::ToolCalls { text, calls })
            }
            Some("stop") => Ok(BackendResponse::Stop {
                text: text.unwrap_or_default(),
            }),
            Some("tool_calls") => Err(LlmError::ProtocolError(
                "finish reason is tool_calls but no tool call was sent".to_string(),
            )),
            Some(other) => Err(LlmError::ProtocolError(format!(
                "unexpected finish reason: {}",
                other
            ))),
            None => Err(LlmError::ProtocolError(
                "response ended without a finish reason".to_string(),
            )),
        }
    }
}

/// 流式响应块
#[derive(Debug, Clone, Default)]
pub struct ChatChunk {
    /// 文本内容
    pub content: Option<String>,
    /// 工具调用增量
    pub tool_call_deltas: Vec<ToolCallDelta>,
    /// 完成原因（已归一化为 stop / tool_calls / 原始值）
    pub finish_reason: Option<String>,
}

/// 工具调用的流式增量
#[derive(Debug, Clone, Default)]
pub struct ToolCallDelta {
    /// 同一个工具调用的增量共享 index
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    /// 参数 JSON 片段
    pub arguments: Option<String>,
}

/// 聊天选项
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    /// 温度参数
    pub temperature: Option<f64>,
    /// 最大 token 数
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// 流式收集结果
#[derive(Debug, Default)]
pub struct StreamCollectResult {
    /// 完整文本内容
    pub content: String,
    /// 完成原因
    pub finish_reason: Option<String>,
    /// chunk 数量
    pub chunk_count: usize,
    tool_calls: BTreeMap<usize, PartialToolCall>,
}

impl StreamCollectResult {
    /// 合并一个流式块
    pub fn push(&mut self, chunk: ChatChunk) {
        self.chunk_count += 1;

        if let Some(content) = chunk.content {
            self.content.push_str(&content);
        }

        for delta in chunk.tool_call_deltas {
            let entry = self.tool_calls.entry(delta.index).or_default();
            if let Some(id) = delta.id {
                entry.id = id;
            }
            if let Some(name) = delta.name {
                entry.name.push_str(&name);
            }
            if let Some(arguments) = delta.arguments {
                entry.arguments.push_str(&arguments);
            }
        }

        if chunk.finish_reason.is_some() {
            self.finish_reason = chunk.finish_reason;
        }
    }

    /// 转换为后端响应
    pub fn into_response(self) -> Result<BackendResponse, LlmError> {
        let calls = self
            .tool_calls
            .into_values()
            .map(|partial| ToolCallRequest {
                id: partial.id,
                name: partial.name,
                arguments: parse_tool_arguments(&partial.arguments),
            })
            .collect();

        BackendResponse::from_parts(self.content, calls, self.finish_reason.as_deref())
    }
}

/// 解析工具参数
///
/// 空参数视为空对象；非法 JSON 原样保留为字符串，交由调用方判定为参数错误。
pub fn parse_tool_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// LLM 错误类型
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// HTTP 请求错误
    #[error("HTTP 请求失败: {0}")]
    HttpError(#[from] reqwest::Error),

    /// API 返回错误
    #[error("API 错误 ({status}): {message}")]
    ApiError { status: u16, message: String },

    /// 配置错误
    #[error("配置错误: {0}")]
    ConfigError(String),

    /// JSON 解析错误
    #[error("JSON 解析失败: {0}")]
    JsonError(#[from] serde_json::Error),

    /// 流解析错误
    #[error("流解析错误: {0}")]
    StreamError(String),

    /// 响应不符合约定的形态
    #[error("协议错误: {0}")]
    ProtocolError(String),
}

impl LlmError {
    /// 是否为响应形态错误（区别于传输层失败）
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, LlmError::ProtocolError(_) | LlmError::JsonError(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(index: usize, id: Option<&str>, name: Option<&str>, args: Option<&str>) -> ToolCallDelta {
        ToolCallDelta {
            index,
            id: id.map(String::from),
            name: name.map(String::from),
            arguments: args.map(String::from),
        }
    }

    #[test]
    fn test_collect_assembles_tool_call_fragments() {
        let mut result = StreamCollectResult::default();
        result.push(ChatChunk {
            content: Some("Let me look at ".to_string()),
            ..Default::default()
        });
        result.push(ChatChunk {
            content: Some("the helpers.".to_string()),
            tool_call_deltas: vec![call(0, Some("call_1"), Some("get_additional_file"), Some("{\"file_"))],
            ..Default::default()
        });
        result.push(ChatChunk {
            tool_call_deltas: vec![call(0, None, None, Some("path\": \"src/helpers.py\"}"))],
            finish_reason: Some("tool_calls".to_string()),
            ..Default::default()
        });

        assert_eq!(result.chunk_count, 3);
        match result.into_response().unwrap() {
            BackendResponse::ToolCalls { text, calls } => {
                assert_eq!(text.as_deref(), Some("Let me look at the helpers."));
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].id, "call_1");
                assert_eq!(calls[0].string_argument("file_path"), Some("src/helpers.py"));
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_collect_keeps_tool_call_order_by_index() {
        let mut result = StreamCollectResult::default();
        result.push(ChatChunk {
            tool_call_deltas: vec![
                call(1, Some("b"), Some("get_additional_file"), Some("{}")),
                call(0, Some("a"), Some("get_additional_file"), Some("{}")),
            ],
            finish_reason: Some("tool_calls".to_string()),
            ..Default::default()
        });

        let BackendResponse::ToolCalls { calls, .. } = result.into_response().unwrap() else {
            panic!("expected tool calls");
        };
        let ids: Vec<_> = calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_from_parts_stop() {
        let response = BackendResponse::from_parts("done".to_string(), vec![], Some("stop")).unwrap();
        assert_eq!(response, BackendResponse::Stop { text: "done".to_string() });
    }

    #[test]
    fn test_from_parts_rejects_other_shapes() {
        let err = BackendResponse::from_parts("partial".to_string(), vec![], Some("length")).unwrap_err();
        assert!(err.is_protocol_violation());

        let err = BackendResponse::from_parts(String::new(), vec![], Some("tool_calls")).unwrap_err();
        assert!(err.is_protocol_violation());

        let err = BackendResponse::from_parts(String::new(), vec![], None).unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn test_parse_tool_arguments() {
        assert_eq!(parse_tool_arguments(""), json!({}));
        assert_eq!(parse_tool_arguments("{\"file_path\":\"a.py\"}"), json!({"file_path": "a.py"}));
        assert_eq!(parse_tool_arguments("{broken"), json!("{broken"));
    }

    #[test]
    fn test_string_argument_rejects_non_string() {
        let call = ToolCallRequest {
            id: "1".to_string(),
            name: "get_additional_file".to_string(),
            arguments: json!({"file_path": 42}),
        };
        assert_eq!(call.string_argument("file_path"), None);
        assert_eq!(call.arguments_json(), "{\"file_path\":42}");
    }

    #[test]
    fn test_tool_result_correlates_call_id() {
        let call = ToolCallRequest {
            id: "call_9".to_string(),
            name: "get_additional_file".to_string(),
            arguments: json!({}),
        };
        let msg = ConversationMessage::tool_result(&call, None);
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_9"));
        assert!(msg.content.is_none());
    }
}
