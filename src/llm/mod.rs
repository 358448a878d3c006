//! LLM 模块
//!
//! 提供统一的 LLM 客户端，支持 OpenAI、Anthropic、Google Gemini 和 Ollama 的工具调用对话。

mod anthropic;
mod client;
mod format;
mod google;
mod ollama;
mod openai;
mod sse;
mod types;

pub use client::{ChatBackend, LlmClient};
pub use format::BackendKind;
pub use types::*;
