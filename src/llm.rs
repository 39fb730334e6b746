use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::config::{LlmConfig, LlmProvider};
use crate::error::{resolve_env, Result, TraderError};

/// Anything that can turn a prompt into text
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model(&self) -> &str;

    async fn complete(&self, prompt: &str, system_prompt: Option<&str>) -> Result<LLMResponse>;
}

/// LLM client speaking either the Anthropic Messages API or the
/// OpenAI-compatible chat completions API (OpenRouter, DashScope, OpenAI)
pub struct LLMClient {
    client: Client,
    provider: LlmProvider,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    model: Option<String>,
    usage: Option<MessagesUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    content_type: String,
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct MessagesUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Clone, Serialize)]
struct CompletionRequest {
    model: String,
    max_tokens: u32,
    temperature: f64,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
    model: Option<String>,
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CompletionUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorResponse {
    error: Option<ErrorDetail>,
    msg: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ErrorDetail {
    Object { message: Option<String> },
    Text(String),
}

/// Response from LLM completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LLMResponse {
    pub content: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

fn error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorResponse>(body) {
        Ok(err) => err
            .msg
            .or(err.message)
            .or_else(|| match err.error {
                Some(ErrorDetail::Object { message }) => message,
                Some(ErrorDetail::Text(text)) => Some(text),
                None => None,
            })
            .unwrap_or_else(|| body.to_string()),
        Err(_) => body.to_string(),
    }
}

impl LLMClient {
    pub fn new(provider: LlmProvider, base_url: &str, api_key: &str, model: &str) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(Duration::from_secs(120)).build()?,
            provider,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            max_tokens: 2000,
            temperature: 0.1,
        })
    }

    /// Build a client from agent config; the key is read from `api_key_env`
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let api_key = resolve_env(&config.api_key_env)?;
        let mut client = Self::new(config.provider, config.effective_base_url(), &api_key, &config.model)?;
        client.max_tokens = config.max_tokens;
        client.temperature = config.temperature;
        Ok(client)
    }

    fn endpoint(&self) -> String {
        match self.provider {
            LlmProvider::Anthropic => format!("{}/v1/messages", self.base_url),
            _ => format!("{}/chat/completions", self.base_url),
        }
    }

    fn messages_body(&self, prompt: &str, system_prompt: Option<&str>) -> Result<serde_json::Value> {
        let messages = vec![ChatMessage { role: "user".to_string(), content: prompt.to_string() }];
        let body = match self.provider {
            LlmProvider::Anthropic => serde_json::to_value(MessagesRequest {
                model: self.model.clone(),
                max_tokens: self.max_tokens,
                temperature: self.temperature,
                system: system_prompt.map(|s| s.to_string()),
                messages,
            })?,
            _ => {
                let mut all = Vec::with_capacity(2);
                if let Some(system) = system_prompt {
                    all.push(ChatMessage { role: "system".to_string(), content: system.to_string() });
                }
                all.extend(messages);
                serde_json::to_value(CompletionRequest {
                    model: self.model.clone(),
                    max_tokens: self.max_tokens,
                    temperature: self.temperature,
                    messages: all,
                })?
            }
        };
        Ok(body)
    }

    fn parse_body(&self, body: &str) -> Result<LLMResponse> {
        match self.provider {
            LlmProvider::Anthropic => {
                let resp: MessagesResponse = serde_json::from_str(body)?;
                let content = resp
                    .content
                    .iter()
                    .filter(|block| block.content_type == "text")
                    .filter_map(|block| block.text.clone())
                    .collect::<Vec<_>>()
                    .join("");
                let usage = resp.usage.unwrap_or(MessagesUsage { input_tokens: 0, output_tokens: 0 });
                Ok(LLMResponse {
                    content,
                    model: resp.model.unwrap_or_else(|| self.model.clone()),
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                })
            }
            _ => {
                let resp: CompletionResponse = serde_json::from_str(body)?;
                let content = resp
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.message.content)
                    .ok_or_else(|| TraderError::Llm("completion has no choices".to_string()))?;
                let usage = resp
                    .usage
                    .unwrap_or(CompletionUsage { prompt_tokens: 0, completion_tokens: 0 });
                Ok(LLMResponse {
                    content,
                    model: resp.model.unwrap_or_else(|| self.model.clone()),
                    input_tokens: usage.prompt_tokens,
                    output_tokens: usage.completion_tokens,
                })
            }
        }
    }
}

#[async_trait]
impl LanguageModel for LLMClient {
    fn model(&self) -> &str {
        &self.model
    }

    /// Send a prompt to the LLM and get a response
    async fn complete(&self, prompt: &str, system_prompt: Option<&str>) -> Result<LLMResponse> {
        let request = self
            .client
            .post(self.endpoint())
            .header("Content-Type", "application/json");
        let request = match self.provider {
            LlmProvider::Anthropic => request
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", "2023-06-01"),
            _ => request.bearer_auth(&self.api_key),
        };

        info!(
            model = %self.model,
            prompt_length = prompt.len(),
            "sending LLM request"
        );

        let response = request
            .json(&self.messages_body(prompt, system_prompt)?)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(TraderError::Api { status: status.as_u16(), body: error_message(&body) });
        }

        let parsed = self.parse_body(&body)?;
        if parsed.content.trim().is_empty() {
            return Err(TraderError::Llm("empty completion".to_string()));
        }

        info!(
            model = %parsed.model,
            input_tokens = parsed.input_tokens,
            output_tokens = parsed.output_tokens,
            "LLM response received"
        );
        Ok(parsed)
    }
}
