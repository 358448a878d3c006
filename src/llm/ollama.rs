//! Ollama /api/chat 实现
//!
//! Ollama 的工具调用以完整响应返回，这里使用非流式请求。

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use super::format::build_ollama_endpoint;
use super::openai::truncate;
use super::types::{
    parse_tool_arguments, BackendResponse, ChatOptions, ConversationMessage, LlmError, Role,
    ToolCallRequest, ToolDefinition,
};

#[derive(Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    tools: Vec<OllamaTool>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Serialize)]
struct OllamaMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OllamaOutgoingCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_name: Option<String>,
}

#[derive(Serialize)]
struct OllamaOutgoingCall {
    function: OllamaOutgoingFunction,
}

#[derive(Serialize)]
struct OllamaOutgoingFunction {
    name: String,
    arguments: Value,
}

#[derive(Serialize)]
struct OllamaTool {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: OllamaFunction,
}

#[derive(Serialize)]
struct OllamaFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Deserialize, Debug)]
struct OllamaResponse {
    message: Option<OllamaResponseMessage>,
    done_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct OllamaResponseMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<OllamaIncomingCall>,
}

#[derive(Deserialize, Debug)]
struct OllamaIncomingCall {
    id: Option<String>,
    function: OllamaIncomingFunction,
}

#[derive(Deserialize, Debug)]
struct OllamaIncomingFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

fn build_payload(
    messages: &[ConversationMessage],
    tool: &ToolDefinition,
    model: &str,
    options: &ChatOptions,
) -> OllamaRequest {
    let messages = messages
        .iter()
        .map(|msg| OllamaMessage {
            role: msg.role.as_str(),
            content: msg.content.clone().unwrap_or_default(),
            tool_calls: msg
                .tool_calls
                .iter()
                .map(|call| OllamaOutgoingCall {
                    function: OllamaOutgoingFunction {
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    },
                })
                .collect(),
            tool_name: match msg.role {
                Role::Tool => msg.name.clone(),
                _ => None,
            },
        })
        .collect();

    let ollama_options = if options.temperature.is_some() || options.max_tokens.is_some() {
        Some(OllamaOptions {
            temperature: options.temperature,
            num_predict: options.max_tokens,
        })
    } else {
        None
    };

    OllamaRequest {
        model: model.to_string(),
        messages,
        tools: vec![OllamaTool {
            tool_type: "function",
            function: OllamaFunction {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.parameters.clone(),
            },
        }],
        stream: false,
        options: ollama_options,
    }
}

/// 将 Ollama 响应转换为后端响应
///
/// Ollama 不一定返回调用 ID，缺失时按轮内序号生成。
fn into_backend_response(response: OllamaResponse) -> Result<BackendResponse, LlmError> {
    let message = response
        .message
        .ok_or_else(|| LlmError::ProtocolError("response has no message".to_string()))?;

    let calls = message
        .tool_calls
        .into_iter()
        .enumerate()
        .map(|(i, tc)| ToolCallRequest {
            id: tc.id.unwrap_or_else(|| format!("call_{}", i)),
            name: tc.function.name,
            arguments: match tc.function.arguments {
                Value::String(raw) => parse_tool_arguments(&raw),
                Value::Null => Value::Object(Default::default()),
                other => other,
            },
        })
        .collect();

    BackendResponse::from_parts(message.content, calls, response.done_reason.as_deref())
}

/// 调用 Ollama chat API
pub async fn chat_ollama(
    client: &Client,
    base_url: &str,
    messages: &[ConversationMessage],
    tool: &ToolDefinition,
    model: &str,
    options: &ChatOptions,
) -> Result<BackendResponse, LlmError> {
    let endpoint = build_ollama_endpoint(base_url);
    let payload = build_payload(messages, tool, model, options);

    debug!("Ollama API request: endpoint={}, model={}", endpoint, model);

    let response = client.post(&endpoint).json(&payload).send().await?;

    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
        error!("Ollama API error: status={}, body={}", status.as_u16(), truncate(&text, 500));
        return Err(LlmError::ApiError {
            status: status.as_u16(),
            message: text,
        });
    }

    debug!("Ollama response: {}", truncate(&text, 2000));
    let parsed: OllamaResponse = serde_json::from_str(&text)?;
    into_backend_response(parsed)
}
