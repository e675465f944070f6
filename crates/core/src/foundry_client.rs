// crates/core/src/foundry_client.rs

//! Azure AI Foundry client for the Responses API.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::config::FmConfig;
use crate::error::FmError;
use crate::fm::{Completion, FmGateway, Message, ResponseSchema, Role, TokenUsage};

/// Azure AI Foundry client using the Responses API.
///
/// Environment variables (used when the config leaves a value unset):
/// - FOUNDRY_ENDPOINT: e.g. "https://myresource.openai.azure.com"
/// - FOUNDRY_DEPLOYMENT: e.g. "gpt-4o"
/// - FOUNDRY_API_KEY: your API key
pub struct FoundryClient {
    client: Client,
    url: String,
    api_key: String,
    model: String,
    max_output_tokens: u32,
}

impl FoundryClient {
    pub fn new(endpoint: &str, deployment: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let url = format!(
            "{}/openai/responses?api-version=2025-03-01-preview",
            endpoint.trim_end_matches('/')
        );

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            url,
            api_key: api_key.to_string(),
            model: deployment.to_string(),
            max_output_tokens: 16_000,
        })
    }

    pub fn from_config(config: &FmConfig) -> Result<Self> {
        let endpoint = resolve(&config.endpoint, "FOUNDRY_ENDPOINT")?;
        let deployment = resolve(&config.deployment, "FOUNDRY_DEPLOYMENT")?;
        let api_key = resolve(&config.api_key, "FOUNDRY_API_KEY")?;

        let mut client = Self::new(
            &endpoint,
            &deployment,
            &api_key,
            Duration::from_millis(config.request_timeout_ms),
        )?;
        client.max_output_tokens = config.max_output_tokens;

        tracing::info!(deployment = %deployment, "foundation model client ready");
        Ok(client)
    }

    pub fn from_env() -> Result<Self> {
        Self::from_config(&FmConfig::default())
    }
}

fn resolve(value: &Option<String>, env: &str) -> Result<String> {
    match value {
        Some(v) if !v.is_empty() && !v.starts_with("${") => Ok(v.clone()),
        _ => std::env::var(env).with_context(|| format!("{env} not set")),
    }
}

/// Request body for Responses API.
#[derive(Serialize)]
struct ResponsesRequest<'a> {
    model: &'a str,
    input: Vec<InputMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<serde_json::Value>,
    store: bool,
    max_output_tokens: u32,
}

#[derive(Serialize)]
struct InputMessage<'a> {
    role: Role,
    content: &'a str,
}

/// Response from Responses API.
#[derive(Deserialize, Debug)]
struct ResponsesResponse {
    #[serde(default)]
    output: Vec<ResponsesOutputItem>,
    #[serde(default)]
    usage: Option<ResponsesUsage>,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
enum ResponsesOutputItem {
    #[serde(rename = "message")]
    Message {
        #[serde(default)]
        content: Vec<ResponsesContent>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
enum ResponsesContent {
    #[serde(rename = "output_text")]
    OutputText { text: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug, Default)]
struct ResponsesUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// 429, 408 and 5xx are worth retrying; anything else is a rejected request.
fn classify_status(status: StatusCode, body: &str) -> FmError {
    let preview: String = body.chars().take(500).collect();
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        FmError::Transient(format!("HTTP {status} - {preview}"))
    } else {
        FmError::Fatal(format!("HTTP {status} - {preview}"))
    }
}

fn into_completion(parsed: ResponsesResponse) -> Completion {
    let content: String = parsed
        .output
        .into_iter()
        .filter_map(|item| match item {
            ResponsesOutputItem::Message { content } => Some(content),
            ResponsesOutputItem::Unknown => None,
        })
        .flatten()
        .filter_map(|c| match c {
            ResponsesContent::OutputText { text } => Some(text),
            ResponsesContent::Other => None,
        })
        .collect();

    let usage = parsed.usage.unwrap_or_default();
    Completion {
        content,
        token_usage: TokenUsage {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
        },
    }
}

#[async_trait]
impl FmGateway for FoundryClient {
    async fn complete(
        &self,
        conversation: &[Message],
        response_schema: Option<&ResponseSchema>,
    ) -> Result<Completion, FmError> {
        // System messages travel as instructions, the rest as input.
        let instructions: Vec<&str> = conversation
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        let joined = instructions.join("\n\n");

        let input = conversation
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| InputMessage {
                role: m.role,
                content: &m.content,
            })
            .collect();

        let text = response_schema.map(|s| {
            json!({
                "format": {
                    "type": "json_schema",
                    "name": s.name,
                    "schema": s.schema,
                    "strict": true,
                }
            })
        });

        let request = ResponsesRequest {
            model: &self.model,
            input,
            instructions: (!joined.is_empty()).then_some(joined.as_str()),
            text,
            store: false,
            max_output_tokens: self.max_output_tokens,
        };

        let resp = self
            .client
            .post(&self.url)
            .header("api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| FmError::Transient(format!("network error: {e}")))?;

        let status = resp.status();
        let raw_text = resp
            .text()
            .await
            .map_err(|e| FmError::Transient(format!("failed to read response body: {e}")))?;

        if !status.is_success() {
            return Err(classify_status(status, &raw_text));
        }

        debug!(bytes = raw_text.len(), "foundation model response received");

        let parsed: ResponsesResponse = serde_json::from_str(&raw_text)
            .map_err(|e| FmError::Fatal(format!("failed to parse Foundry response: {e}")))?;

        Ok(into_completion(parsed))
    }
}
