use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::generation::{GenerationRequest, TextGenerator};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4.1-mini";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

pub fn responses_endpoint(base_url: &str) -> String {
    format!("{}/responses", base_url.trim_end_matches('/'))
}

/// Generator backed by the OpenAI Responses API.
#[derive(Debug, Clone)]
pub struct OpenAiGenerator {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    name: String,
}

impl OpenAiGenerator {
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("build reqwest client")?;
        let model = model.into();
        Ok(Self {
            client,
            endpoint: responses_endpoint(base_url),
            api_key: api_key.into(),
            name: format!("openai:{model}"),
            model,
        })
    }

    /// Reads `OPENAI_API_KEY` and, optionally, `PAGEWRIGHT_OPENAI_BASE_URL`.
    pub fn from_env(model: Option<&str>) -> anyhow::Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .context("OPENAI_API_KEY must be set for the openai engine")?;
        let base_url = std::env::var("PAGEWRIGHT_OPENAI_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_BASE_URL.to_owned());
        Self::new(&base_url, api_key, model.unwrap_or(DEFAULT_MODEL))
    }
}

#[async_trait]
impl TextGenerator for OpenAiGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &GenerationRequest) -> anyhow::Result<String> {
        tracing::debug!(
            engine = "openai",
            model = %self.model,
            max_tokens = request.max_tokens,
            "generate"
        );
        responses_text(
            &self.client,
            &self.endpoint,
            &self.api_key,
            &self.model,
            request,
        )
        .await
    }
}

#[derive(Debug, Serialize)]
struct ResponsesRequest<'a> {
    model: &'a str,
    instructions: &'a str,
    input: &'a str,
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    text: TextOptions,
    store: bool,
}

#[derive(Debug, Serialize)]
struct TextOptions {
    format: TextFormat,
}

#[derive(Debug, Serialize)]
struct TextFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ResponsesReply {
    #[serde(default)]
    output: Vec<OutputItem>,
}

#[derive(Debug, Deserialize)]
struct OutputItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: Vec<ContentPart>,
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorReply {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

/// Sends one Responses API call and returns the concatenated output text.
pub async fn responses_text(
    client: &reqwest::Client,
    endpoint: &str,
    api_key: &str,
    model: &str,
    request: &GenerationRequest,
) -> anyhow::Result<String> {
    let body = ResponsesRequest {
        model,
        instructions: &request.system_prompt,
        input: &request.prompt,
        max_output_tokens: request.max_tokens,
        // gpt-5 family rejects sampling parameters.
        temperature: (!model.starts_with("gpt-5")).then_some(request.temperature),
        text: TextOptions {
            format: TextFormat { kind: "text" },
        },
        store: false,
    };

    let response = client
        .post(endpoint)
        .bearer_auth(api_key)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("send request to {endpoint}"))?;

    let status = response.status();
    let raw = response
        .text()
        .await
        .with_context(|| format!("read response body ({status})"))?;
    if !status.is_success() {
        let message = serde_json::from_str::<ErrorReply>(&raw)
            .map(|reply| reply.error.message)
            .unwrap_or(raw);
        anyhow::bail!("OpenAI API error ({status}): {message}");
    }

    let reply: ResponsesReply = serde_json::from_str(&raw).context("decode responses reply")?;
    output_text(reply)
}

fn output_text(reply: ResponsesReply) -> anyhow::Result<String> {
    let text = reply
        .output
        .into_iter()
        .filter(|item| item.kind == "message")
        .flat_map(|item| item.content)
        .filter(|part| part.kind == "output_text")
        .filter_map(|part| part.text)
        .collect::<String>();

    if text.trim().is_empty() {
        anyhow::bail!("response carried no output text");
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_text_joins_message_parts() -> anyhow::Result<()> {
        let reply: ResponsesReply = serde_json::from_value(serde_json::json!({
            "output": [
                { "type": "reasoning", "summary": [] },
                { "type": "message", "content": [
                    { "type": "output_text", "text": "Hello, " },
                    { "type": "refusal", "refusal": "nope" },
                    { "type": "output_text", "text": "world" }
                ]}
            ]
        }))?;
        assert_eq!(output_text(reply)?, "Hello, world");
        Ok(())
    }

    #[test]
    fn empty_output_is_an_error() -> anyhow::Result<()> {
        let reply: ResponsesReply = serde_json::from_value(serde_json::json!({ "output": [] }))?;
        assert!(output_text(reply).is_err());
        Ok(())
    }

    #[test]
    fn gpt5_requests_skip_temperature() -> anyhow::Result<()> {
        let request = ResponsesRequest {
            model: "gpt-5",
            instructions: "sys",
            input: "hi",
            max_output_tokens: 10,
            temperature: None,
            text: TextOptions {
                format: TextFormat { kind: "text" },
            },
            store: false,
        };
        let value = serde_json::to_value(&request)?;
        assert!(value.get("temperature").is_none());
        assert_eq!(value["text"]["format"]["type"], "text");
        Ok(())
    }

    #[test]
    fn endpoint_ignores_trailing_slash() {
        assert_eq!(
            responses_endpoint("http://localhost:1234/v1/"),
            "http://localhost:1234/v1/responses"
        );
    }
}
