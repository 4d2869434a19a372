//! Chat-model [`Drafter`] backends.
//!
//! Both providers are asked for a single JSON object:
//!
//! - OpenAI: `POST {url}/v1/chat/completions` with
//!   `response_format = json_object`. Needs `OPENAI_API_KEY`.
//! - Ollama: `POST {url}/api/chat` with `format = "json"`.
//!
//! Transport retries are handled by [`crate::http::post_json`].

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use manual_kb_core::generation::{Comparison, Drafter, GeneratedDraft, MAX_KEYWORDS};

use crate::config::GenerationConfig;
use crate::http::{self, Endpoint};

const DRAFT_SYSTEM: &str = "You write customer-support manual entries. \
Reply with one JSON object with the keys \"keywords\" (array of strings), \
\"topic\" (string), \"background\" (string) and \"guideline\" (string). \
Do not add any other text.";

const COMPARE_SYSTEM: &str = "You compare two versions of a customer-support manual. \
Reply with one JSON object with the keys \"differences\" (array of short strings, \
one per substantive change from OLD to NEW) and \"summary\" (string). \
Do not add any other text.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    OpenAI,
    Ollama,
}

pub struct ChatDrafter {
    flavor: Flavor,
    model: String,
    url: String,
    api_key: Option<String>,
    temperature: f32,
    client: reqwest::Client,
    max_retries: u32,
}

impl ChatDrafter {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("generation.model required for {} provider", config.provider))?;

        let (flavor, url, api_key) = match config.provider.as_str() {
            "openai" => {
                let key = std::env::var("OPENAI_API_KEY")
                    .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
                let url = config
                    .url
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com".to_string());
                (Flavor::OpenAI, url, Some(key))
            }
            "ollama" => {
                let url = config
                    .url
                    .clone()
                    .unwrap_or_else(|| "http://localhost:11434".to_string());
                (Flavor::Ollama, url, None)
            }
            other => bail!("Unknown generation provider: {}", other),
        };

        Ok(Self {
            flavor,
            model,
            url: url.trim_end_matches('/').to_string(),
            api_key,
            temperature: config.temperature,
            client: http::client(config.timeout_secs)?,
            max_retries: config.max_retries,
        })
    }

    fn request(&self, system: &str, user: &str) -> (Endpoint<'static>, Value) {
        let messages = json!([
            { "role": "system", "content": system },
            { "role": "user", "content": user }
        ]);
        match self.flavor {
            Flavor::OpenAI => (
                Endpoint {
                    service: "OpenAI",
                    url: format!("{}/v1/chat/completions", self.url),
                    bearer: self.api_key.clone(),
                },
                json!({
                    "model": self.model,
                    "messages": messages,
                    "temperature": self.temperature,
                    "response_format": { "type": "json_object" }
                }),
            ),
            Flavor::Ollama => (
                Endpoint {
                    service: "Ollama",
                    url: format!("{}/api/chat", self.url),
                    bearer: None,
                },
                json!({
                    "model": self.model,
                    "messages": messages,
                    "stream": false,
                    "format": "json",
                    "options": { "temperature": self.temperature }
                }),
            ),
        }
    }

    async fn ask<T: DeserializeOwned>(&self, system: &str, user: &str) -> Result<T> {
        let (endpoint, body) = self.request(system, user);
        let response = http::post_json(&self.client, &endpoint, &body, self.max_retries).await?;
        let content = match self.flavor {
            Flavor::OpenAI => response
                .pointer("/choices/0/message/content")
                .and_then(Value::as_str),
            Flavor::Ollama => response.pointer("/message/content").and_then(Value::as_str),
        }
        .ok_or_else(|| anyhow!("{} response has no message content", endpoint.service))?;
        debug!(service = endpoint.service, chars = content.len(), "chat reply");
        parse_json_reply(content)
    }
}

/// Parse a model reply as JSON, tolerating a surrounding code fence.
fn parse_json_reply<T: DeserializeOwned>(content: &str) -> Result<T> {
    let trimmed = content.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();
    serde_json::from_str(body).with_context(|| format!("model reply is not the expected JSON: {}", body))
}

#[async_trait]
impl Drafter for ChatDrafter {
    async fn draft(&self, source_text: &str, instructions: &str) -> Result<GeneratedDraft> {
        let user = format!(
            "{}\nUse at most {} keywords.\n\n{}",
            instructions, MAX_KEYWORDS, source_text
        );
        self.ask(DRAFT_SYSTEM, &user).await
    }

    async fn compare(&self, old_text: &str, new_text: &str) -> Result<Comparison> {
        let user = format!("OLD:\n{}\n\nNEW:\n{}", old_text, new_text);
        self.ask(COMPARE_SYSTEM, &user).await
    }
}

/// Used when `generation.provider = "disabled"`. Every call fails.
pub struct DisabledDrafter;

#[async_trait]
impl Drafter for DisabledDrafter {
    async fn draft(&self, _source_text: &str, _instructions: &str) -> Result<GeneratedDraft> {
        bail!("Generation provider is disabled")
    }

    async fn compare(&self, _old_text: &str, _new_text: &str) -> Result<Comparison> {
        bail!("Generation provider is disabled")
    }
}

pub fn create_drafter(config: &GenerationConfig) -> Result<Arc<dyn Drafter>> {
    if config.is_enabled() {
        Ok(Arc::new(ChatDrafter::new(config)?))
    } else {
        Ok(Arc::new(DisabledDrafter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_reply() {
        let draft: GeneratedDraft =
            parse_json_reply("```json\n{\"keywords\": [\"CVV\"], \"topic\": \"t\"}\n```").unwrap();
        assert_eq!(draft.keywords, vec!["CVV"]);
        assert_eq!(draft.topic, "t");
    }

    #[test]
    fn rejects_prose_reply() {
        assert!(parse_json_reply::<Comparison>("The manuals differ in tone.").is_err());
    }

    #[test]
    fn ollama_request_asks_for_json() {
        let config = GenerationConfig {
            provider: "ollama".into(),
            model: Some("llama3".into()),
            ..Default::default()
        };
        let drafter = ChatDrafter::new(&config).unwrap();
        let (endpoint, body) = drafter.request("sys", "user");
        assert_eq!(endpoint.url, "http://localhost:11434/api/chat");
        assert_eq!(body["format"], "json");
        assert_eq!(body["stream"], false);
        assert_eq!(body["messages"][1]["content"], "user");
    }

    #[tokio::test]
    async fn disabled_drafter_fails() {
        let drafter = create_drafter(&GenerationConfig::default()).unwrap();
        assert!(drafter.draft("src", "do it").await.is_err());
    }
}
