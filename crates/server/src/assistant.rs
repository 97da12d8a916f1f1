use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::domain::AssistantRole;
use tracing::info;
use url::Url;

use crate::config::Settings;

const PREAMBLE: [&str; 3] = [
    "You are a helpful AI assistant.",
    "Respond in plain text only.",
    "Do not use markdown, code fences, bullet lists, headings, or tables.",
];

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> anyhow::Result<String>;
}

/// Used when no API key is configured.
pub struct MissingTextGenerator;

#[async_trait]
impl TextGenerator for MissingTextGenerator {
    async fn generate(&self, _prompt: &str) -> anyhow::Result<String> {
        Err(anyhow!("assistant API key is not configured"))
    }
}

/// OpenAI-compatible `chat/completions` client (OpenRouter by default).
pub struct OpenRouterGenerator {
    http: reqwest::Client,
    endpoint: Url,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: [CompletionMessage<'a>; 1],
}

#[derive(Serialize)]
struct CompletionMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionContent,
}

#[derive(Deserialize)]
struct CompletionContent {
    content: Option<String>,
}

impl OpenRouterGenerator {
    pub fn new(api_url: &str, api_key: String, model: String) -> anyhow::Result<Self> {
        let base = format!("{}/", api_url.trim_end_matches('/'));
        let endpoint = Url::parse(&base)
            .and_then(|base| base.join("chat/completions"))
            .with_context(|| format!("invalid assistant api url '{api_url}'"))?;
        Ok(Self {
            http: reqwest::Client::new(),
            endpoint,
            api_key,
            model,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl TextGenerator for OpenRouterGenerator {
    async fn generate(&self, prompt: &str) -> anyhow::Result<String> {
        let body = CompletionRequest {
            model: &self.model,
            messages: [CompletionMessage {
                role: "user",
                content: prompt,
            }],
        };
        let response: CompletionResponse = self
            .http
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or_else(|| anyhow!("assistant returned an empty completion"))
    }
}

pub fn generator_from_settings(settings: &Settings) -> anyhow::Result<Arc<dyn TextGenerator>> {
    match &settings.assistant_api_key {
        Some(key) => {
            let generator = OpenRouterGenerator::new(
                &settings.assistant_api_url,
                key.clone(),
                settings.assistant_model.clone(),
            )?;
            info!(
                endpoint = %generator.endpoint(),
                model = %settings.assistant_model,
                "assistant generator configured"
            );
            Ok(Arc::new(generator))
        }
        None => Ok(Arc::new(MissingTextGenerator)),
    }
}

/// Plain-text transcript prompt; empty turns are skipped.
pub fn build_prompt(turns: &[(AssistantRole, &str)]) -> String {
    let mut lines: Vec<String> = PREAMBLE.iter().map(|line| line.to_string()).collect();
    lines.push(String::new());
    lines.push("Conversation:".into());
    for (role, content) in turns {
        let content = content.trim();
        if content.is_empty() {
            continue;
        }
        let speaker = match role {
            AssistantRole::User => "User",
            AssistantRole::Assistant => "Assistant",
        };
        lines.push(format!("{speaker}: {content}"));
    }
    lines.push(String::new());
    lines.push("Assistant:".into());
    lines.join("\n")
}
