use crate::providers::base::{
    ChatRequest, CompletionProvider, CompletionResponse, FinishReason, ToolCallRequest, Usage,
};
use crate::providers::errors::ProviderErrorHandler;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

const CONNECT_TIMEOUT_SECS: u64 = 30;
const REQUEST_TIMEOUT_SECS: u64 = 120;
const TRANSCRIPTION_TIMEOUT_SECS: u64 = 60;

/// Client for an OpenAI-compatible chat-completions service.
pub struct OpenAiProvider {
    api_key: String,
    default_model: String,
    base_url: String,
    provider_name: String,
    client: Client,
}

impl OpenAiProvider {
    pub fn new(api_key: String, base_url: String, default_model: String) -> Self {
        Self {
            api_key,
            default_model,
            base_url: base_url.trim_end_matches('/').to_string(),
            provider_name: "OpenAI".to_string(),
            client: Client::builder()
                .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    fn parse_response(json: &Value) -> Result<CompletionResponse> {
        let choice = json["choices"]
            .as_array()
            .and_then(|arr| arr.first())
            .context("No choices in completion response")?;

        let message = &choice["message"];
        let content = message["content"]
            .as_str()
            .map(std::string::ToString::to_string);

        let mut tool_calls = Vec::new();
        if let Some(tool_calls_array) = message["tool_calls"].as_array() {
            for tc in tool_calls_array {
                if let Some(function) = tc["function"].as_object() {
                    let arguments = function["arguments"]
                        .as_str()
                        .and_then(|s| serde_json::from_str(s).ok())
                        .unwrap_or_else(|| json!({}));

                    tool_calls.push(ToolCallRequest {
                        id: tc["id"].as_str().unwrap_or("").to_string(),
                        name: function["name"].as_str().unwrap_or("").to_string(),
                        arguments,
                    });
                }
            }
        }

        let finish_reason = FinishReason::parse(choice["finish_reason"].as_str());
        let usage = json.get("usage").and_then(|u| {
            Some(Usage {
                prompt_tokens: u.get("prompt_tokens").and_then(Value::as_u64)?,
                completion_tokens: u.get("completion_tokens").and_then(Value::as_u64)?,
                total_tokens: u.get("total_tokens").and_then(Value::as_u64)?,
            })
        });

        Ok(CompletionResponse {
            content,
            tool_calls,
            finish_reason,
            usage,
        })
    }

    /// Transcribe an audio attachment via the `audio/transcriptions` endpoint.
    pub async fn transcribe_audio(
        &self,
        audio: Vec<u8>,
        file_name: &str,
        model: &str,
    ) -> Result<String> {
        let part = reqwest::multipart::Part::bytes(audio).file_name(file_name.to_string());
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", model.to_string());

        let resp = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(Duration::from_secs(TRANSCRIPTION_TIMEOUT_SECS))
            .multipart(form)
            .send()
            .await
            .context("Failed to send transcription request")?;

        let json = ProviderErrorHandler::check_response(resp, &self.provider_name).await?;
        json["text"]
            .as_str()
            .map(std::string::ToString::to_string)
            .context("No text in transcription response")
    }

    /// Describe an image attachment with a one-shot vision chat call.
    pub async fn describe_image(
        &self,
        image: Vec<u8>,
        media_type: &str,
        model: &str,
    ) -> Result<String> {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode(&image);

        let payload = json!({
            "model": model,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "Describe this image briefly for a support agent."},
                    {"type": "image_url", "image_url": {
                        "url": format!("data:{};base64,{}", media_type, encoded)
                    }}
                ]
            }],
            "max_tokens": 300,
        });

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .context("Failed to send vision request")?;

        let json = ProviderErrorHandler::check_response(resp, &self.provider_name).await?;
        let parsed = Self::parse_response(&json)?;
        parsed.content.context("No content in vision response")
    }
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    async fn chat(&self, req: ChatRequest<'_>) -> Result<CompletionResponse> {
        let wire_messages: Vec<Value> = req
            .messages
            .into_iter()
            .map(|msg| {
                let mut m = json!({
                    "role": msg.role,
                    "content": msg.content,
                });

                if let Some(tool_calls) = msg.tool_calls {
                    m["tool_calls"] = json!(tool_calls
                        .into_iter()
                        .map(|tc| {
                            let args_str = serde_json::to_string(&tc.arguments)
                                .unwrap_or_else(|_| "{}".to_string());
                            json!({
                                "id": tc.id,
                                "type": "function",
                                "function": {
                                    "name": tc.name,
                                    "arguments": args_str
                                }
                            })
                        })
                        .collect::<Vec<_>>());
                }

                if let Some(tool_call_id) = msg.tool_call_id {
                    m["tool_call_id"] = json!(tool_call_id);
                }

                m
            })
            .collect();

        let mut payload = json!({
            "model": req.model.unwrap_or(&self.default_model),
            "messages": wire_messages,
            "max_tokens": req.max_tokens,
            "temperature": req.temperature,
        });

        if let Some(tools) = req.tools {
            if !tools.is_empty() {
                payload["tools"] = json!(tools
                    .into_iter()
                    .map(|t| json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters
                        }
                    }))
                    .collect::<Vec<_>>());
            }
        }

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .context(format!(
                "Failed to send request to {} API",
                self.provider_name
            ))?;

        let json = ProviderErrorHandler::check_response(resp, &self.provider_name).await?;
        Self::parse_response(&json)
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }
}
