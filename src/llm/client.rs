//! 统一 LLM 客户端

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use std::pin::Pin;
use std::time::Duration;
use tracing::info;

use super::anthropic::stream_anthropic;
use super::format::BackendKind;
use super::google::chat_google;
use super::ollama::chat_ollama;
use super::openai::stream_openai;
use super::types::{
    BackendResponse, ChatChunk, ChatOptions, ConversationMessage, LlmError, StreamCollectResult,
    ToolDefinition,
};

/// 生成式后端
///
/// 编排器对后端的唯一要求：发送完整消息序列和工具定义，返回一轮响应。
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// 后端描述，用于日志
    fn describe(&self) -> String;

    /// 执行一轮对话
    async fn complete(
        &self,
        messages: &[ConversationMessage],
        tool: &ToolDefinition,
    ) -> Result<BackendResponse, LlmError>;
}

/// 统一 LLM 客户端
///
/// 支持 OpenAI、Anthropic、Google Gemini 和 Ollama，具体格式由配置中的后端类型决定
pub struct LlmClient {
    client: Client,
    kind: BackendKind,
    api_key: String,
    base_url: String,
    model: String,
    options: ChatOptions,
}

impl LlmClient {
    /// 创建新的 LLM 客户端
    pub fn new(
        kind: BackendKind,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        options: ChatOptions,
    ) -> Result<Self, LlmError> {
        let api_key = api_key.into();
        if kind.requires_api_key() && api_key.is_empty() {
            return Err(LlmError::ConfigError(format!("API Key is required for {}", kind)));
        }

        // 本地模型响应较慢，Ollama 放宽超时
        let timeout = match kind {
            BackendKind::Ollama => Duration::from_secs(600),
            _ => Duration::from_secs(120),
        };

        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(5)
            .build()
            .map_err(LlmError::HttpError)?;

        Ok(Self {
            client,
            kind,
            api_key,
            base_url: base_url.into(),
            model: model.into(),
            options,
        })
    }

    /// 流式聊天（OpenAI / Anthropic）
    fn stream_chat(
        &self,
        messages: &[ConversationMessage],
        tool: &ToolDefinition,
    ) -> Pin<Box<dyn Stream<Item = Result<ChatChunk, LlmError>> + Send>> {
        match self.kind {
            BackendKind::Anthropic => stream_anthropic(
                &self.client,
                &self.api_key,
                &self.base_url,
                messages,
                tool,
                &self.model,
                &self.options,
            ),
            _ => stream_openai(
                &self.client,
                &self.api_key,
                &self.base_url,
                messages,
                tool,
                &self.model,
                &self.options,
            ),
        }
    }

    /// 流式请求并收集完整响应
    async fn stream_and_collect(
        &self,
        messages: &[ConversationMessage],
        tool: &ToolDefinition,
    ) -> Result<StreamCollectResult, LlmError> {
        let mut stream = self.stream_chat(messages, tool);
        let mut result = StreamCollectResult::default();

        while let Some(chunk_result) = stream.next().await {
            result.push(chunk_result?);
        }

        Ok(result)
    }
}

#[async_trait]
impl ChatBackend for LlmClient {
    fn describe(&self) -> String {
        format!("{}:{}", self.kind, self.model)
    }

    async fn complete(
        &self,
        messages: &[ConversationMessage],
        tool: &ToolDefinition,
    ) -> Result<BackendResponse, LlmError> {
        info!(
            "LLM request: backend={}, model={}, messages={}",
            self.kind,
            self.model,
            messages.len()
        );

        match self.kind {
            BackendKind::Ollama => {
                chat_ollama(&self.client, &self.base_url, messages, tool, &self.model, &self.options)
                    .await
            }
            BackendKind::Google => {
                chat_google(
                    &self.client,
                    &self.api_key,
                    &self.base_url,
                    messages,
                    tool,
                    &self.model,
                    &self.options,
                )
                .await
            }
            BackendKind::OpenAi | BackendKind::Anthropic => {
                let result = self.stream_and_collect(messages, tool).await?;
                info!(
                    "LLM response: chunks={}, finish_reason={:?}",
                    result.chunk_count, result.finish_reason
                );
                result.into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_key_required_for_hosted_backends() {
        let err = LlmClient::new(BackendKind::OpenAi, "", "https://api.openai.com", "gpt-4o", ChatOptions::default());
        assert!(matches!(err, Err(LlmError::ConfigError(_))));

        let client = LlmClient::new(
            BackendKind::Ollama,
            "",
            "http://localhost:11434",
            "llama3.1",
            ChatOptions::default(),
        )
        .unwrap();
        assert_eq!(client.describe(), "ollama:llama3.1");
    }
}
