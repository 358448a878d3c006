//! OpenAI Chat Completions API 流式实现（支持工具调用）

use async_stream::try_stream;
use futures::Stream;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use tracing::{debug, error};

use super::format::build_openai_endpoint;
use super::sse::data_payloads;
use super::types::{
    ChatChunk, ChatOptions, ConversationMessage, LlmError, Role, ToolCallDelta, ToolDefinition,
};

/// OpenAI 请求载荷
#[derive(Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    tools: Vec<OpenAiTool>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct OpenAiMessage {
    role: &'static str,
    /// tool 消息必须带 content，缺失内容以空串发送
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OpenAiToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize)]
struct OpenAiToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: &'static str,
    function: OpenAiFunctionCall,
}

#[derive(Serialize)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Serialize)]
struct OpenAiTool {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: OpenAiFunction,
}

#[derive(Serialize)]
struct OpenAiFunction {
    name: String,
    description: String,
    parameters: Value,
}

/// OpenAI SSE 响应块
#[derive(Deserialize, Debug)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

/// 兼容服务常以显式 `null` 代替缺省字段
#[derive(Deserialize, Debug)]
struct OpenAiChoice {
    #[serde(default)]
    delta: Option<OpenAiDelta>,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct OpenAiDelta {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiToolCallDelta>>,
}

#[derive(Deserialize, Debug)]
struct OpenAiToolCallDelta {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    function: Option<OpenAiFunctionDelta>,
}

#[derive(Deserialize, Debug)]
struct OpenAiFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

fn to_openai_message(msg: &ConversationMessage) -> OpenAiMessage {
    let content = match msg.role {
        Role::Tool => Some(msg.content.clone().unwrap_or_default()),
        _ => msg.content.clone(),
    };

    OpenAiMessage {
        role: msg.role.as_str(),
        content,
        tool_calls: msg
            .tool_calls
            .iter()
            .map(|call| OpenAiToolCall {
                id: call.id.clone(),
                call_type: "function",
                function: OpenAiFunctionCall {
                    name: call.name.clone(),
                    arguments: call.arguments_json(),
                },
            })
            .collect(),
        tool_call_id: msg.tool_call_id.clone(),
    }
}

fn build_payload(
    messages: &[ConversationMessage],
    tool: &ToolDefinition,
    model: &str,
    options: &ChatOptions,
) -> OpenAiRequest {
    OpenAiRequest {
        model: model.to_string(),
        messages: messages.iter().map(to_openai_message).collect(),
        tools: vec![OpenAiTool {
            tool_type: "function",
            function: OpenAiFunction {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.parameters.clone(),
            },
        }],
        stream: true,
        temperature: options.temperature,
        max_tokens: options.max_tokens,
    }
}

/// 解析一条 SSE data 负载
fn parse_chunk(data: &str) -> Option<ChatChunk> {
    match serde_json::from_str::<OpenAiStreamChunk>(data) {
        Ok(chunk) => {
            let choice = chunk.choices.into_iter().next()?;
            let delta = choice.delta.unwrap_or_default();
            let tool_call_deltas = delta
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|tc| {
                    let (name, arguments) = match tc.function {
                        Some(f) => (f.name, f.arguments),
                        None => (None, None),
                    };
                    ToolCallDelta {
                        index: tc.index,
                        id: tc.id,
                        name,
                        arguments,
                    }
                })
                .collect();

            Some(ChatChunk {
                content: delta.content,
                tool_call_deltas,
                finish_reason: choice.finish_reason,
            })
        }
        Err(e) => {
            debug!("Failed to parse OpenAI response: {}, data: {}", e, data);
            None
        }
    }
}

/// 流式调用 OpenAI API
pub fn stream_openai(
    client: &Client,
    api_key: &str,
    base_url: &str,
    messages: &[ConversationMessage],
    tool: &ToolDefinition,
    model: &str,
    options: &ChatOptions,
) -> Pin<Box<dyn Stream<Item = Result<ChatChunk, LlmError>> + Send>> {
    let endpoint = build_openai_endpoint(base_url);
    let api_key = api_key.to_string();
    let client = client.clone();
    let payload = build_payload(messages, tool, model, options);

    Box::pin(try_stream! {
        debug!(
            "OpenAI API request: endpoint={}, model={}, messages={}",
            endpoint,
            payload.model,
            payload.messages.len()
        );

        let response = client
            .post(&endpoint)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let status_code = status.as_u16();
            let error_text = response.text().await.unwrap_or_default();
            error!("OpenAI API error: status={}, body={}", status_code, truncate(&error_text, 500));
            Err(LlmError::ApiError {
                status: status_code,
                message: error_text,
            })?;
            unreachable!();
        }

        let mut payloads = Box::pin(data_payloads(response.bytes_stream()));

        use futures::StreamExt;
        while let Some(data) = payloads.next().await {
            if let Some(chunk) = parse_chunk(&data?) {
                yield chunk;
            }
        }
    })
}

/// 按字符边界截断，用于日志
pub(crate) fn truncate(text: &str, max_len: usize) -> &str {
    if text.len() <= max_len {
        return text;
    }
    let mut end = max_len;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
