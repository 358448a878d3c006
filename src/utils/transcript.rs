//! 对话记录器
//!
//! 将每个文件的对话记录追加到 JSONL 文件，便于调试 Prompt 和后端行为。

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::llm::ConversationMessage;
use crate::services::conversation::ConversationRun;

/// 记录文件名
pub const TRANSCRIPT_FILE: &str = "conversations.jsonl";

/// 对话记录条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    /// 记录 ID
    pub entry_id: String,
    /// 时间戳
    pub timestamp: DateTime<Utc>,
    /// 目标文件（项目相对路径）
    pub file_path: String,
    /// 后端描述
    pub backend: String,
    /// success / failed
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// 后端调用次数
    pub turns: usize,
    /// 持续时间（毫秒）
    pub duration_ms: u64,
    pub messages: Vec<MessagePreview>,
}

/// 消息预览
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePreview {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_preview: Option<String>,
    /// `name(arguments)` 形式的工具调用
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl MessagePreview {
    fn from_message(msg: &ConversationMessage, max_content_len: usize) -> Self {
        Self {
            role: msg.role.as_str().to_string(),
            content_preview: msg.content.as_deref().map(|c| truncate(c, max_content_len)),
            tool_calls: msg
                .tool_calls
                .iter()
                .map(|c| format!("{}({})", c.name, c.arguments_json()))
                .collect(),
            tool_call_id: msg.tool_call_id.clone(),
        }
    }
}

/// 对话记录器
pub struct TranscriptLogger {
    log_path: PathBuf,
    max_entries: usize,
    file: Mutex<Option<File>>,
}

impl TranscriptLogger {
    /// 创建新的记录器
    pub fn new(log_dir: &Path) -> std::io::Result<Self> {
        fs::create_dir_all(log_dir)?;
        Ok(Self {
            log_path: log_dir.join(TRANSCRIPT_FILE),
            max_entries: 1000,
            file: Mutex::new(None),
        })
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// 生成记录 ID
    pub fn generate_entry_id() -> String {
        Uuid::new_v4().to_string()[..8].to_string()
    }

    /// 构建记录条目
    pub fn entry(file_path: &str, backend: &str, run: &ConversationRun, elapsed: Duration) -> TranscriptEntry {
        let (status, error_message) = match &run.outcome {
            Ok(_) => ("success", None),
            Err(e) => ("failed", Some(e.to_string())),
        };

        TranscriptEntry {
            entry_id: Self::generate_entry_id(),
            timestamp: Utc::now(),
            file_path: file_path.to_string(),
            backend: backend.to_string(),
            status: status.to_string(),
            error_message,
            turns: run.turns,
            duration_ms: elapsed.as_millis() as u64,
            messages: run
                .messages
                .iter()
                .map(|m| MessagePreview::from_message(m, 500))
                .collect(),
        }
    }

    /// 追加一条对话记录
    pub fn record(&self, file_path: &str, backend: &str, run: &ConversationRun, elapsed: Duration) {
        let entry = Self::entry(file_path, backend, run, elapsed);
        self.write_entry(&entry);
    }

    /// 写入记录条目
    fn write_entry(&self, entry: &TranscriptEntry) {
        let mut file_guard = self.file.lock();

        // 懒加载文件
        if file_guard.is_none() {
            match OpenOptions::new().create(true).append(true).open(&self.log_path) {
                Ok(f) => *file_guard = Some(f),
                Err(e) => warn!("Cannot open transcript {}: {}", self.log_path.display(), e),
            }
        }

        if let Some(file) = file_guard.as_mut() {
            if let Ok(json) = serde_json::to_string(entry) {
                let _ = writeln!(file, "{}", json);
                let _ = file.flush();
            }
        }

        // 清理前关闭句柄，重写文件后重新打开
        *file_guard = None;
        drop(file_guard);
        self.cleanup_if_needed();
    }

    /// 只保留最近的记录
    fn cleanup_if_needed(&self) {
        if let Ok(file) = File::open(&self.log_path) {
            let reader = BufReader::new(file);
            let lines: Vec<String> = reader.lines().map_while(Result::ok).collect();

            if lines.len() > self.max_entries {
                let keep_lines = &lines[lines.len() - self.max_entries..];
                if let Ok(mut file) = File::create(&self.log_path) {
                    for line in keep_lines {
                        let _ = writeln!(file, "{}", line);
                    }
                }
            }
        }
    }
}

/// 截断字符串（按字符边界）
fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ToolCallRequest;
    use crate::services::conversation::ConversationError;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample_run(outcome: Result<String, ConversationError>) -> ConversationRun {
        let call = ToolCallRequest {
            id: "call_1".to_string(),
            name: "get_additional_file".to_string(),
            arguments: json!({"file_path": "src/helpers.py"}),
        };
        ConversationRun {
            outcome,
            messages: vec![
                ConversationMessage::system("system"),
                ConversationMessage::user("x".repeat(600)),
                ConversationMessage::assistant(None, vec![call.clone()]),
                ConversationMessage::tool_result(&call, Some("def helper(): pass".to_string())),
            ],
            turns: 2,
        }
    }

    #[test]
    fn test_entry_previews() {
        let entry = TranscriptLogger::entry("src/main.py", "openai:gpt-4o", &sample_run(Ok("doc".into())), Duration::from_millis(42));

        assert_eq!(entry.status, "success");
        assert_eq!(entry.entry_id.len(), 8);
        assert_eq!(entry.duration_ms, 42);
        assert_eq!(entry.messages.len(), 4);
        assert!(entry.messages[1].content_preview.as_ref().unwrap().ends_with("..."));
        assert_eq!(entry.messages[2].tool_calls, vec![r#"get_additional_file({"file_path":"src/helpers.py"})"#]);
        assert_eq!(entry.messages[3].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn test_record_appends_jsonl() {
        let dir = TempDir::new().unwrap();
        let logger = TranscriptLogger::new(dir.path()).unwrap();

        logger.record("a.py", "ollama:llama3.1", &sample_run(Ok("doc".into())), Duration::from_secs(1));
        logger.record(
            "b.py",
            "ollama:llama3.1",
            &sample_run(Err(ConversationError::TurnLimitExceeded(25))),
            Duration::from_secs(1),
        );

        let content = fs::read_to_string(logger.log_path()).unwrap();
        let entries: Vec<TranscriptEntry> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].status, "failed");
        assert!(entries[1].error_message.is_some());
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        assert_eq!(truncate("文档生成", 4), "文...");
        assert_eq!(truncate("short", 10), "short");
    }
}
