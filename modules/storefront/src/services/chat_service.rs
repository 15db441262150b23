//! Shopping assistant
//!
//! A chat-completions provider answers first. When it fails (transport,
//! non-2xx, empty answer or no API key) the fallback provider is called with
//! one combined prompt string.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ChatConfig;
use crate::metrics::Metrics;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Conversation has no user message")]
    EmptyConversation,

    #[error("{0} provider has no API key")]
    MissingApiKey(&'static str),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Provider returned HTTP {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("Provider returned an empty answer")]
    EmptyAnswer,

    #[error("All chat providers failed (primary: {primary}; fallback: {fallback})")]
    AllProvidersFailed { primary: String, fallback: String },
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        ChatError::Transport(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

/// Product line injected into the system prompt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductContext {
    pub name: String,
    pub price_minor: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default = "default_locale")]
    pub locale: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub products: Vec<ProductContext>,
}

fn default_locale() -> String {
    "ar".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatReply {
    pub reply: String,
    pub provider: String,
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn complete(&self, system_prompt: &str, history: &[ChatMessage])
        -> Result<String, ChatError>;
}

// ============================================================================
// PROMPTS
// ============================================================================

pub fn system_prompt(locale: &str, products: &[ProductContext], currency: &str) -> String {
    let mut prompt = String::from(
        "You are the shopping assistant of an online grocery store. Help customers find \
         products, suggest recipes and meal ideas, and answer questions about orders, \
         delivery, the wallet and loyalty points. Keep answers short and friendly.",
    );

    if locale.starts_with("ar") {
        prompt.push_str(" Always reply in Arabic (Egyptian dialect is welcome).");
    } else {
        prompt.push_str(" Always reply in English.");
    }

    if !products.is_empty() {
        prompt.push_str("\n\nProducts currently available:\n");
        for product in products {
            prompt.push_str(&format!(
                "- {}: {} {}\n",
                product.name,
                format_minor(product.price_minor),
                currency
            ));
        }
    }

    prompt
}

/// Single-string prompt for providers without a messages API
pub fn fallback_prompt(system_prompt: &str, history: &[ChatMessage]) -> String {
    let mut prompt = format!("{}\n\nConversation:\n", system_prompt);
    for message in history {
        let speaker = match message.role {
            ChatRole::User => "Customer",
            ChatRole::Assistant => "Assistant",
        };
        prompt.push_str(&format!("{}: {}\n", speaker, message.content));
    }
    prompt.push_str("Assistant:");
    prompt
}

fn format_minor(amount_minor: i64) -> String {
    let sign = if amount_minor < 0 { "-" } else { "" };
    let abs = amount_minor.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

// ============================================================================
// PROVIDERS
// ============================================================================

/// Chat-completions style endpoint (system message + history)
pub struct CompletionsProvider {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
}

impl CompletionsProvider {
    pub fn new(client: reqwest::Client, url: String, model: String, api_key: Option<String>) -> Self {
        Self {
            client,
            url,
            model,
            api_key,
        }
    }
}

#[async_trait]
impl ChatProvider for CompletionsProvider {
    fn name(&self) -> &'static str {
        "primary"
    }

    async fn complete(
        &self,
        system_prompt: &str,
        history: &[ChatMessage],
    ) -> Result<String, ChatError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(ChatError::MissingApiKey(self.name()))?;

        let mut messages = vec![json!({"role": "system", "content": system_prompt})];
        messages.extend(
            history
                .iter()
                .map(|m| json!({"role": m.role, "content": m.content})),
        );

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(api_key)
            .json(&json!({
                "model": self.model,
                "messages": messages,
                "temperature": 0.7,
                "max_tokens": 500,
            }))
            .send()
            .await?;

        let body = read_success(response).await?;
        non_empty(body["choices"][0]["message"]["content"].as_str())
    }
}

/// Single-prompt generate-content style endpoint
pub struct PromptProvider {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl PromptProvider {
    pub fn new(client: reqwest::Client, url: String, api_key: Option<String>) -> Self {
        Self {
            client,
            url,
            api_key,
        }
    }
}

#[async_trait]
impl ChatProvider for PromptProvider {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn complete(
        &self,
        system_prompt: &str,
        history: &[ChatMessage],
    ) -> Result<String, ChatError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(ChatError::MissingApiKey(self.name()))?;

        let response = self
            .client
            .post(&self.url)
            .query(&[("key", api_key)])
            .json(&json!({
                "contents": [{
                    "parts": [{"text": fallback_prompt(system_prompt, history)}]
                }]
            }))
            .send()
            .await?;

        let body = read_success(response).await?;
        non_empty(body["candidates"][0]["content"]["parts"][0]["text"].as_str())
    }
}

async fn read_success(response: reqwest::Response) -> Result<Value, ChatError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ChatError::Upstream {
            status: status.as_u16(),
            body: body.chars().take(500).collect(),
        });
    }
    Ok(response.json::<Value>().await?)
}

fn non_empty(answer: Option<&str>) -> Result<String, ChatError> {
    match answer.map(str::trim) {
        Some(text) if !text.is_empty() => Ok(text.to_string()),
        _ => Err(ChatError::EmptyAnswer),
    }
}

// ============================================================================
// ASSISTANT
// ============================================================================

pub struct ChatAssistant {
    primary: Arc<dyn ChatProvider>,
    fallback: Arc<dyn ChatProvider>,
    history_window: usize,
    metrics: Option<Metrics>,
}

impl ChatAssistant {
    pub fn new(
        primary: Arc<dyn ChatProvider>,
        fallback: Arc<dyn ChatProvider>,
        history_window: usize,
    ) -> Self {
        Self {
            primary,
            fallback,
            history_window: history_window.max(1),
            metrics: None,
        }
    }

    pub fn from_config(config: &ChatConfig) -> Result<Self, ChatError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        let primary = CompletionsProvider::new(
            client.clone(),
            config.primary_url.clone(),
            config.primary_model.clone(),
            config.primary_api_key.clone(),
        );
        let fallback = PromptProvider::new(
            client,
            config.fallback_url.clone(),
            config.fallback_api_key.clone(),
        );

        Ok(Self::new(
            Arc::new(primary),
            Arc::new(fallback),
            config.history_window,
        ))
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn reply(&self, request: &ChatRequest, currency: &str) -> Result<ChatReply, ChatError> {
        if !request
            .messages
            .iter()
            .any(|m| m.role == ChatRole::User && !m.content.trim().is_empty())
        {
            return Err(ChatError::EmptyConversation);
        }

        let start = request.messages.len().saturating_sub(self.history_window);
        let history = &request.messages[start..];
        let prompt = system_prompt(&request.locale, &request.products, currency);

        let primary_error = match self.call(self.primary.as_ref(), &prompt, history).await {
            Ok(reply) => return Ok(reply),
            Err(e) => e,
        };

        tracing::warn!(
            provider = self.primary.name(),
            error = %primary_error,
            "Primary chat provider failed; trying fallback"
        );

        self.call(self.fallback.as_ref(), &prompt, history)
            .await
            .map_err(|fallback_error| {
                tracing::error!(
                    provider = self.fallback.name(),
                    error = %fallback_error,
                    "Fallback chat provider failed"
                );
                ChatError::AllProvidersFailed {
                    primary: primary_error.to_string(),
                    fallback: fallback_error.to_string(),
                }
            })
    }

    async fn call(
        &self,
        provider: &dyn ChatProvider,
        prompt: &str,
        history: &[ChatMessage],
    ) -> Result<ChatReply, ChatError> {
        let started = Instant::now();
        let result = provider.complete(prompt, history).await;

        if let Some(metrics) = &self.metrics {
            let outcome = match &result {
                Ok(_) => "ok",
                Err(ChatError::MissingApiKey(_)) => "skipped",
                Err(_) => "error",
            };
            metrics
                .chat_replies_total
                .with_label_values(&[provider.name(), outcome])
                .inc();
            metrics
                .chat_provider_duration_seconds
                .with_label_values(&[provider.name()])
                .observe(started.elapsed().as_secs_f64());
        }

        result.map(|reply| ChatReply {
            reply,
            provider: provider.name().to_string(),
        })
    }
}
