//! Google Gemini generateContent 实现
//!
//! 使用非流式请求，函数调用通过 `functionDeclarations` 声明。

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error};

use super::format::build_google_endpoint;
use super::openai::truncate;
use super::types::{
    BackendResponse, ChatOptions, ConversationMessage, LlmError, Role, ToolCallRequest,
    ToolDefinition,
};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    tools: Vec<GeminiTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Serialize, Deserialize, Debug)]
struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct FunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct FunctionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    name: String,
    response: Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiTool {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    prompt_feedback: Option<Value>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    finish_reason: Option<String>,
}

/// Gemini 的 schema 是 OpenAPI 子集，不接受 additionalProperties
fn strip_unsupported_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| k.as_str() != "additionalProperties")
                .map(|(k, v)| (k.clone(), strip_unsupported_schema(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(strip_unsupported_schema).collect()),
        other => other.clone(),
    }
}

/// 转换消息
///
/// assistant 对应 model 角色，连续的 tool 结果合并为同一条 user 消息。
fn convert_messages(messages: &[ConversationMessage]) -> (Option<GeminiContent>, Vec<GeminiContent>) {
    let mut system = None;
    let mut contents: Vec<GeminiContent> = Vec::new();

    for msg in messages {
        match msg.role {
            Role::System => {
                system = Some(GeminiContent {
                    role: None,
                    parts: vec![GeminiPart {
                        text: msg.content.clone(),
                        ..Default::default()
                    }],
                });
            }
            Role::User => contents.push(GeminiContent {
                role: Some("user".to_string()),
                parts: vec![GeminiPart {
                    text: Some(msg.content.clone().unwrap_or_default()),
                    ..Default::default()
                }],
            }),
            Role::Assistant => {
                let mut parts = Vec::new();
                if let Some(text) = msg.content.as_ref().filter(|t| !t.is_empty()) {
                    parts.push(GeminiPart {
                        text: Some(text.clone()),
                        ..Default::default()
                    });
                }
                for call in &msg.tool_calls {
                    parts.push(GeminiPart {
                        function_call: Some(FunctionCall {
                            id: None,
                            name: call.name.clone(),
                            args: match &call.arguments {
                                Value::Object(_) => call.arguments.clone(),
                                _ => json!({}),
                            },
                        }),
                        ..Default::default()
                    });
                }
                contents.push(GeminiContent {
                    role: Some("model".to_string()),
                    parts,
                });
            }
            Role::Tool => {
                let part = GeminiPart {
                    function_response: Some(FunctionResponse {
                        id: None,
                        name: msg.name.clone().unwrap_or_default(),
                        response: json!({ "content": msg.content.clone().unwrap_or_default() }),
                    }),
                    ..Default::default()
                };
                match contents.last_mut() {
                    Some(last)
                        if last.role.as_deref() == Some("user")
                            && last.parts.iter().all(|p| p.function_response.is_some()) =>
                    {
                        last.parts.push(part);
                    }
                    _ => contents.push(GeminiContent {
                        role: Some("user".to_string()),
                        parts: vec![part],
                    }),
                }
            }
        }
    }

    (system, contents)
}

fn build_payload(
    messages: &[ConversationMessage],
    tool: &ToolDefinition,
    options: &ChatOptions,
) -> GeminiRequest {
    let (system_instruction, contents) = convert_messages(messages);

    let generation_config = if options.temperature.is_some() || options.max_tokens.is_some() {
        Some(GenerationConfig {
            temperature: options.temperature,
            max_output_tokens: options.max_tokens,
        })
    } else {
        None
    };

    GeminiRequest {
        contents,
        system_instruction,
        tools: vec![GeminiTool {
            function_declarations: vec![FunctionDeclaration {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: strip_unsupported_schema(&tool.parameters),
            }],
        }],
        generation_config,
    }
}

/// 将 Gemini 的 finishReason 归一化
///
/// Gemini 发起函数调用时 finishReason 仍为 STOP。
fn normalize_finish_reason(reason: &str) -> String {
    match reason {
        "STOP" => "stop".to_string(),
        "MAX_TOKENS" => "length".to_string(),
        other => other.to_lowercase(),
    }
}

/// 将 Gemini 响应转换为后端响应
///
/// Gemini 不一定返回调用 ID，缺失时按轮内序号生成。
fn into_backend_response(response: GeminiResponse) -> Result<BackendResponse, LlmError> {
    let candidate = response.candidates.into_iter().next().ok_or_else(|| {
        LlmError::ProtocolError(format!(
            "response has no candidates (prompt feedback: {})",
            response.prompt_feedback.unwrap_or(Value::Null)
        ))
    })?;

    let mut text = String::new();
    let mut calls = Vec::new();
    for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
        if let Some(t) = part.text {
            text.push_str(&t);
        }
        if let Some(call) = part.function_call {
            let id = call.id.unwrap_or_else(|| format!("call_{}", calls.len()));
            calls.push(ToolCallRequest {
                id,
                name: call.name,
                arguments: match call.args {
                    Value::Null => json!({}),
                    other => other,
                },
            });
        }
    }

    let finish_reason = candidate.finish_reason.as_deref().map(normalize_finish_reason);
    BackendResponse::from_parts(text, calls, finish_reason.as_deref())
}

/// 调用 Gemini generateContent API
pub async fn chat_google(
    client: &Client,
    api_key: &str,
    base_url: &str,
    messages: &[ConversationMessage],
    tool: &ToolDefinition,
    model: &str,
    options: &ChatOptions,
) -> Result<BackendResponse, LlmError> {
    let endpoint = build_google_endpoint(base_url, model);
    let payload = build_payload(messages, tool, options);

    debug!("Gemini API request: endpoint={}, model={}", endpoint, model);

    let response = client
        .post(&endpoint)
        .header("x-goog-api-key", api_key)
        .json(&payload)
        .send()
        .await?;

    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
        error!("Gemini API error: status={}, body={}", status.as_u16(), truncate(&text, 500));
        return Err(LlmError::ApiError {
            status: status.as_u16(),
            message: text,
        });
    }

    debug!("Gemini response: {}", truncate(&text, 2000));
    let parsed: GeminiResponse = serde_json::from_str(&text)?;
    into_backend_response(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool() -> ToolDefinition {
        ToolDefinition {
            name: "get_additional_file".to_string(),
            description: "Retrieve a file".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {"file_path": {"type": "string"}},
                "required": ["file_path"],
                "additionalProperties": false
            }),
        }
    }

    #[test]
    fn test_payload_shape() {
        let a = ToolCallRequest {
            id: "call_0".to_string(),
            name: "get_additional_file".to_string(),
            arguments: json!({"file_path": "a.py"}),
        };
        let b = ToolCallRequest {
            id: "call_1".to_string(),
            name: "get_additional_file".to_string(),
            arguments: json!("{broken"),
        };
        let messages = vec![
            ConversationMessage::system("sys"),
            ConversationMessage::user("doc this"),
            ConversationMessage::assistant(Some("Looking.".to_string()), vec![a.clone(), b.clone()]),
            ConversationMessage::tool_result(&a, Some("x = 1".to_string())),
            ConversationMessage::tool_result(&b, None),
        ];

        let options = ChatOptions {
            temperature: Some(0.2),
            max_tokens: Some(1024),
        };
        let value = serde_json::to_value(build_payload(&messages, &tool(), &options)).unwrap();

        assert_eq!(value["systemInstruction"]["parts"][0]["text"], "sys");
        assert_eq!(value["contents"].as_array().unwrap().len(), 3);
        assert_eq!(value["contents"][1]["role"], "model");
        assert_eq!(value["contents"][1]["parts"][1]["functionCall"]["args"]["file_path"], "a.py");
        assert_eq!(value["contents"][1]["parts"][2]["functionCall"]["args"], json!({}));
        assert_eq!(value["contents"][2]["role"], "user");
        assert_eq!(value["contents"][2]["parts"][0]["functionResponse"]["response"]["content"], "x = 1");
        assert_eq!(value["contents"][2]["parts"][1]["functionResponse"]["response"]["content"], "");

        let declaration = &value["tools"][0]["functionDeclarations"][0];
        assert_eq!(declaration["name"], "get_additional_file");
        assert!(declaration["parameters"].get("additionalProperties").is_none());
        assert_eq!(declaration["parameters"]["required"][0], "file_path");
        assert_eq!(value["generationConfig"]["maxOutputTokens"], 1024);
    }

    #[test]
    fn test_function_call_response() {
        let raw = json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [
                        {"text": "Need the helpers."},
                        {"functionCall": {"name": "get_additional_file", "args": {"file_path": "src/helpers.py"}}}
                    ]
                },
                "finishReason": "STOP"
            }]
        });
        let response: GeminiResponse = serde_json::from_value(raw).unwrap();

        match into_backend_response(response).unwrap() {
            BackendResponse::ToolCalls { text, calls } => {
                assert_eq!(text.as_deref(), Some("Need the helpers."));
                assert_eq!(calls[0].id, "call_0");
                assert_eq!(calls[0].string_argument("file_path"), Some("src/helpers.py"));
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_stop_response() {
        let raw = json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "# Docs\n"}, {"text": "More."}]},
                "finishReason": "STOP"
            }]
        });
        let response: GeminiResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(
            into_backend_response(response).unwrap(),
            BackendResponse::Stop { text: "# Docs\nMore.".to_string() }
        );
    }

    #[test]
    fn test_blocked_or_truncated_is_protocol_error() {
        let blocked: GeminiResponse =
            serde_json::from_value(json!({"promptFeedback": {"blockReason": "SAFETY"}})).unwrap();
        assert!(into_backend_response(blocked).unwrap_err().is_protocol_violation());

        let truncated: GeminiResponse = serde_json::from_value(json!({
            "candidates": [{"content": {"parts": [{"text": "partial"}]}, "finishReason": "MAX_TOKENS"}]
        }))
        .unwrap();
        assert!(into_backend_response(truncated).unwrap_err().is_protocol_violation());
    }
}
