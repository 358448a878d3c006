//! 后端类型和 URL 构建工具

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 后端类型
///
/// 启动时根据显式配置选择一次，运行期间不再变化
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// OpenAI Chat Completions API（以及兼容服务）
    #[default]
    OpenAi,
    /// Anthropic Messages API
    Anthropic,
    /// Google Gemini generateContent API
    Google,
    /// Ollama 本地服务
    Ollama,
}

impl BackendKind {
    /// 默认 API 地址
    pub fn default_base_url(&self) -> &'static str {
        match self {
            BackendKind::OpenAi => "https://api.openai.com",
            BackendKind::Anthropic => "https://api.anthropic.com",
            BackendKind::Google => "https://generativelanguage.googleapis.com",
            BackendKind::Ollama => "http://localhost:11434",
        }
    }

    /// 默认模型
    pub fn default_model(&self) -> &'static str {
        match self {
            BackendKind::OpenAi => "gpt-4o",
            BackendKind::Anthropic => "claude-3-5-sonnet-latest",
            BackendKind::Google => "gemini-1.5-pro",
            BackendKind::Ollama => "llama3.1",
        }
    }

    /// 是否需要 API Key
    pub fn requires_api_key(&self) -> bool {
        !matches!(self, BackendKind::Ollama)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::OpenAi => "openai",
            BackendKind::Anthropic => "anthropic",
            BackendKind::Google => "google",
            BackendKind::Ollama => "ollama",
        };
        f.write_str(name)
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "openai" | "open_ai" => Ok(BackendKind::OpenAi),
            "anthropic" | "claude" => Ok(BackendKind::Anthropic),
            "google" | "gemini" => Ok(BackendKind::Google),
            "ollama" => Ok(BackendKind::Ollama),
            other => Err(format!("unknown backend: {}", other)),
        }
    }
}

/// 修复 base_url
///
/// - 移除末尾斜杠
/// - 修复双斜杠（保留协议部分）
pub fn fix_base_url(base_url: &str) -> String {
    let mut url = base_url.trim_end_matches('/').to_string();

    if let Some(pos) = url.find("://") {
        let (protocol, rest) = url.split_at(pos + 3);
        let fixed_rest = rest.replace("//", "/");
        url = format!("{}{}", protocol, fixed_rest);
    }

    url
}

/// 构建 OpenAI Chat Completions 端点
pub fn build_openai_endpoint(base_url: &str) -> String {
    let url = fix_base_url(base_url);

    if url.ends_with("/chat/completions") {
        url
    } else if url.ends_with("/v1") {
        format!("{}/chat/completions", url)
    } else {
        format!("{}/v1/chat/completions", url)
    }
}

/// 构建 Anthropic Messages 端点
pub fn build_anthropic_endpoint(base_url: &str) -> String {
    let url = fix_base_url(base_url);

    if url.ends_with("/messages") {
        url
    } else if url.ends_with("/v1") {
        format!("{}/messages", url)
    } else {
        format!("{}/v1/messages", url)
    }
}

/// 构建 Ollama chat 端点
pub fn build_ollama_endpoint(base_url: &str) -> String {
    let url = fix_base_url(base_url);

    if url.ends_with("/api/chat") {
        url
    } else if url.ends_with("/api") {
        format!("{}/chat", url)
    } else {
        format!("{}/api/chat", url)
    }
}

/// 构建 Gemini generateContent 端点
pub fn build_google_endpoint(base_url: &str, model: &str) -> String {
    let url = fix_base_url(base_url);

    if url.ends_with(":generateContent") {
        url
    } else if url.ends_with("/v1beta") || url.ends_with("/v1") {
        format!("{}/models/{}:generateContent", url, model)
    } else {
        format!("{}/v1beta/models/{}:generateContent", url, model)
    }
}
