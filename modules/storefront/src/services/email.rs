//! Transactional email delivery
//!
//! Messages are handed to an external email function over HTTP. Failures
//! surface as errors so the outbox can retry them.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum EmailError {
    #[error("Email transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Email function rejected the message: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct EmailMessage {
    pub to_user_id: String,
    pub template: String,
    pub data: serde_json::Value,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<(), EmailError>;
}

pub struct HttpEmailSender {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpEmailSender {
    pub fn new(url: String, api_key: Option<String>) -> Result<Self, EmailError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url,
            api_key,
        })
    }
}

#[async_trait]
impl EmailSender for HttpEmailSender {
    async fn send(&self, message: &EmailMessage) -> Result<(), EmailError> {
        let mut request = self.client.post(&self.url).json(message);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmailError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        tracing::info!(
            to_user_id = %message.to_user_id,
            template = %message.template,
            "Email handed to email function"
        );
        Ok(())
    }
}

/// Used when no email function is configured
#[derive(Debug, Default)]
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send(&self, message: &EmailMessage) -> Result<(), EmailError> {
        tracing::info!(
            to_user_id = %message.to_user_id,
            template = %message.template,
            data = %message.data,
            "Email function not configured; logging message instead"
        );
        Ok(())
    }
}
