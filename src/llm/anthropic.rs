//! Anthropic Messages API 流式实现（支持 tool_use）

use async_stream::try_stream;
use futures::Stream;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use tracing::{debug, error};

use super::format::build_anthropic_endpoint;
use super::sse::data_payloads;
use super::openai::truncate;
use super::types::{
    ChatChunk, ChatOptions, ConversationMessage, LlmError, Role, ToolCallDelta, ToolDefinition,
};

/// Anthropic 请求载荷
#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    tools: Vec<AnthropicTool>,
    stream: bool,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Serialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: Value,
}

/// Anthropic SSE 事件
#[derive(Deserialize, Debug)]
struct AnthropicEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    index: usize,
    #[serde(default)]
    content_block: Option<AnthropicBlockStart>,
    #[serde(default)]
    delta: Option<AnthropicDelta>,
    #[serde(default)]
    error: Option<AnthropicStreamError>,
}

/// 流中途的 error 事件，例如 overloaded_error
#[derive(Deserialize, Debug)]
struct AnthropicStreamError {
    #[serde(rename = "type", default)]
    error_type: String,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize, Debug)]
struct AnthropicBlockStart {
    #[serde(rename = "type")]
    block_type: String,
    id: Option<String>,
    name: Option<String>,
}

#[derive(Deserialize, Debug)]
struct AnthropicDelta {
    #[serde(rename = "type")]
    delta_type: Option<String>,
    text: Option<String>,
    partial_json: Option<String>,
    stop_reason: Option<String>,
}

/// 拆分系统消息并转换为 Anthropic 消息
///
/// 连续的 tool 结果合并为同一条 user 消息。
fn convert_messages(messages: &[ConversationMessage]) -> (Option<String>, Vec<AnthropicMessage>) {
    let mut system: Option<String> = None;
    let mut converted: Vec<AnthropicMessage> = Vec::new();

    for msg in messages {
        match msg.role {
            Role::System => {
                system = msg.content.clone();
            }
            Role::User => converted.push(AnthropicMessage {
                role: "user",
                content: vec![ContentBlock::Text {
                    text: msg.content.clone().unwrap_or_default(),
                }],
            }),
            Role::Assistant => {
                let mut content = Vec::new();
                if let Some(text) = msg.content.as_ref().filter(|t| !t.is_empty()) {
                    content.push(ContentBlock::Text { text: text.clone() });
                }
                for call in &msg.tool_calls {
                    let input = match &call.arguments {
                        Value::Object(_) => call.arguments.clone(),
                        _ => Value::Object(Default::default()),
                    };
                    content.push(ContentBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input,
                    });
                }
                converted.push(AnthropicMessage {
                    role: "assistant",
                    content,
                });
            }
            Role::Tool => {
                let block = ContentBlock::ToolResult {
                    tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                    content: msg.content.clone().unwrap_or_default(),
                };
                match converted.last_mut() {
                    Some(last)
                        if last.role == "user"
                            && matches!(last.content.first(), Some(ContentBlock::ToolResult { .. })) =>
                    {
                        last.content.push(block);
                    }
                    _ => converted.push(AnthropicMessage {
                        role: "user",
                        content: vec![block],
                    }),
                }
            }
        }
    }

    (system, converted)
}

fn build_payload(
    messages: &[ConversationMessage],
    tool: &ToolDefinition,
    model: &str,
    options: &ChatOptions,
) -> AnthropicRequest {
    let (system, messages) = convert_messages(messages);
    AnthropicRequest {
        model: model.to_string(),
        messages,
        system,
        tools: vec![AnthropicTool {
            name: tool.name.clone(),
            description: tool.description.clone(),
            input_schema: tool.parameters.clone(),
        }],
        stream: true,
        max_tokens: options.max_tokens.unwrap_or(4096),
        temperature: options.temperature,
    }
}

/// 将 Anthropic 的 stop_reason 归一化
fn normalize_stop_reason(reason: &str) -> String {
    match reason {
        "end_turn" | "stop_sequence" => "stop".to_string(),
        "tool_use" => "tool_calls".to_string(),
        other => other.to_string(),
    }
}

/// 解析一条 SSE data 负载
///
/// error 事件属于传输层失败，作为错误返回。
fn parse_event(data: &str) -> Result<Option<ChatChunk>, LlmError> {
    let event = match serde_json::from_str::<AnthropicEvent>(data) {
        Ok(event) => event,
        Err(e) => {
            debug!("Failed to parse Anthropic response: {}, data: {}", e, data);
            return Ok(None);
        }
    };

    if event.event_type == "error" {
        let (kind, message) = event
            .error
            .map(|e| (e.error_type, e.message))
            .unwrap_or_else(|| ("unknown_error".to_string(), data.to_string()));
        error!("Anthropic stream error: {}: {}", kind, message);
        return Err(LlmError::StreamError(format!("{}: {}", kind, message)));
    }

    Ok(parse_chunk_event(event))
}

fn parse_chunk_event(event: AnthropicEvent) -> Option<ChatChunk> {
    match event.event_type.as_str() {
        "content_block_start" => {
            let block = event.content_block?;
            if block.block_type != "tool_use" {
                return None;
            }
            Some(ChatChunk {
                tool_call_deltas: vec![ToolCallDelta {
                    index: event.index,
                    id: block.id,
                    name: block.name,
                    arguments: None,
                }],
                ..Default::default()
            })
        }
        "content_block_delta" => {
            let delta = event.delta?;
            match delta.delta_type.as_deref() {
                Some("text_delta") => Some(ChatChunk {
                    content: delta.text,
                    ..Default::default()
                }),
                Some("input_json_delta") => Some(ChatChunk {
                    tool_call_deltas: vec![ToolCallDelta {
                        index: event.index,
                        arguments: delta.partial_json,
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
                _ => None,
            }
        }
        "message_delta" => {
            let stop_reason = event.delta?.stop_reason?;
            Some(ChatChunk {
                finish_reason: Some(normalize_stop_reason(&stop_reason)),
                ..Default::default()
            })
        }
        // 其他事件类型忽略
        _ => None,
    }
}

/// 流式调用 Anthropic API
pub fn stream_anthropic(
    client: &Client,
    api_key: &str,
    base_url: &str,
    messages: &[ConversationMessage],
    tool: &ToolDefinition,
    model: &str,
    options: &ChatOptions,
) -> Pin<Box<dyn Stream<Item = Result<ChatChunk, LlmError>> + Send>> {
    let endpoint = build_anthropic_endpoint(base_url);
    let api_key = api_key.to_string();
    let client = client.clone();
    let payload = build_payload(messages, tool, model, options);

    Box::pin(try_stream! {
        debug!("Anthropic API request: endpoint={}, model={}", endpoint, payload.model);

        let response = client
            .post(&endpoint)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", api_key))
            .header("x-api-key", &api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let status_code = status.as_u16();
            let error_text = response.text().await.unwrap_or_default();
            error!("Anthropic API error: status={}, body={}", status_code, truncate(&error_text, 500));
            Err(LlmError::ApiError {
                status: status_code,
                message: error_text,
            })?;
            unreachable!();
        }

        let mut payloads = Box::pin(data_payloads(response.bytes_stream()));

        use futures::StreamExt;
        while let Some(data) = payloads.next().await {
            if let Some(chunk) = parse_event(&data?)? {
                yield chunk;
            }
        }
    })
}
