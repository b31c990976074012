//! OpenAI HTTP backend: chat completions and the assistants thread/run API.

use crate::config::LlmConfig;
use crate::error::{LlmError, Result};
use crate::llm::backend::{
    AssistantBackend, AssistantRun, ChatRequest, CompletionBackend, RunStatus,
};

use anyhow::Context as _;
use async_trait::async_trait;
use reqwest::StatusCode;

/// Header that opts into the v2 assistants API.
const ASSISTANTS_BETA: (&str, &str) = ("OpenAI-Beta", "assistants=v2");

/// HTTP client for an OpenAI-compatible API.
pub struct OpenAiClient {
    http_client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{path}", self.base_url)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http_client
            .post(self.url(path))
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.http_client.get(self.url(path)).bearer_auth(&self.api_key)
    }

    /// Send a request and return the JSON body, mapping failures onto the error taxonomy.
    async fn send(&self, request: reqwest::RequestBuilder) -> std::result::Result<serde_json::Value, LlmError> {
        let response = request.send().await.map_err(|error| {
            LlmError::BackendUnavailable {
                message: error.to_string(),
                diagnostics: format!("{error:?}"),
            }
        })?;

        let status = response.status();
        let response_text = response.text().await.map_err(|error| LlmError::BackendUnavailable {
            message: format!("failed to read response body: {error}"),
            diagnostics: format!("{error:?}"),
        })?;

        let body: Option<serde_json::Value> = serde_json::from_str(&response_text).ok();

        if !status.is_success() {
            let message = body
                .as_ref()
                .and_then(|body| body["error"]["message"].as_str())
                .unwrap_or("unknown error")
                .to_string();
            return Err(status_error(status, message, &response_text));
        }

        body.ok_or_else(|| LlmError::Unknown {
            message: format!("response ({status}) is not valid JSON"),
            diagnostics: format!("Body: {}", truncate_body(&response_text)),
        })
    }
}

/// Map an HTTP error status onto the error taxonomy.
fn status_error(status: StatusCode, message: String, body: &str) -> LlmError {
    let diagnostics = format!("HTTP {status}\nBody: {}", truncate_body(body));
    match status.as_u16() {
        429 => LlmError::RateLimited { message },
        400 | 404 | 413 | 422 => LlmError::MalformedRequest { message },
        408 | 500..=599 => LlmError::BackendUnavailable {
            message: format!("API error ({status}): {message}"),
            diagnostics,
        },
        _ => LlmError::Unknown {
            message: format!("API error ({status}): {message}"),
            diagnostics,
        },
    }
}

fn truncate_body(body: &str) -> &str {
    let limit = 500;
    match body.char_indices().nth(limit) {
        Some((byte_index, _)) => &body[..byte_index],
        None => body,
    }
}

fn string_field(body: &serde_json::Value, field: &str) -> std::result::Result<String, LlmError> {
    body[field]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| LlmError::Unknown {
            message: format!("response is missing '{field}'"),
            diagnostics: truncate_body(&body.to_string()).to_string(),
        })
}

fn parse_run(body: &serde_json::Value) -> std::result::Result<AssistantRun, LlmError> {
    let status: RunStatus =
        serde_json::from_value(body["status"].clone()).map_err(LlmError::unknown)?;
    Ok(AssistantRun {
        thread_id: string_field(body, "thread_id")?,
        run_id: string_field(body, "id")?,
        status,
    })
}

#[async_trait]
impl CompletionBackend for OpenAiClient {
    async fn chat_completion(&self, request: &ChatRequest) -> std::result::Result<String, LlmError> {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": request.messages,
            "temperature": request.temperature,
            "n": 1,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        let response = self.send(self.post("chat/completions").json(&body)).await?;

        response["choices"][0]["message"]["content"]
            .as_str()
            .map(|text| text.trim().to_string())
            .ok_or_else(|| LlmError::Unknown {
                message: "response has no message content in its first choice".into(),
                diagnostics: truncate_body(&response.to_string()).to_string(),
            })
    }
}

#[async_trait]
impl AssistantBackend for OpenAiClient {
    async fn create_thread(&self) -> std::result::Result<String, LlmError> {
        let request = self
            .post("threads")
            .header(ASSISTANTS_BETA.0, ASSISTANTS_BETA.1)
            .json(&serde_json::json!({}));
        let body = self.send(request).await?;
        string_field(&body, "id")
    }

    async fn add_user_message(&self, thread_id: &str, text: &str) -> std::result::Result<(), LlmError> {
        let request = self
            .post(&format!("threads/{thread_id}/messages"))
            .header(ASSISTANTS_BETA.0, ASSISTANTS_BETA.1)
            .json(&serde_json::json!({ "role": "user", "content": text }));
        self.send(request).await?;
        Ok(())
    }

    async fn create_run(
        &self,
        thread_id: &str,
        assistant_id: &str,
        additional_instructions: Option<&str>,
    ) -> std::result::Result<AssistantRun, LlmError> {
        let mut body = serde_json::json!({ "assistant_id": assistant_id });
        if let Some(instructions) = additional_instructions.filter(|text| !text.trim().is_empty()) {
            body["additional_instructions"] = serde_json::json!(instructions);
        }
        let request = self
            .post(&format!("threads/{thread_id}/runs"))
            .header(ASSISTANTS_BETA.0, ASSISTANTS_BETA.1)
            .json(&body);
        parse_run(&self.send(request).await?)
    }

    async fn get_run(&self, thread_id: &str, run_id: &str) -> std::result::Result<AssistantRun, LlmError> {
        let request = self
            .get(&format!("threads/{thread_id}/runs/{run_id}"))
            .header(ASSISTANTS_BETA.0, ASSISTANTS_BETA.1);
        parse_run(&self.send(request).await?)
    }

    async fn latest_message_text(&self, thread_id: &str) -> std::result::Result<String, LlmError> {
        let request = self
            .get(&format!("threads/{thread_id}/messages"))
            .header(ASSISTANTS_BETA.0, ASSISTANTS_BETA.1)
            .query(&[("limit", "1"), ("order", "desc")]);
        let body = self.send(request).await?;

        let content = body["data"][0]["content"]
            .as_array()
            .ok_or_else(|| LlmError::Unknown {
                message: format!("thread {thread_id} has no messages"),
                diagnostics: truncate_body(&body.to_string()).to_string(),
            })?;

        Ok(content
            .iter()
            .filter(|segment| segment["type"].as_str() == Some("text"))
            .filter_map(|segment| segment["text"]["value"].as_str())
            .collect::<Vec<_>>()
            .join(""))
    }
}
