use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::model::QueueMessage;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("queue request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("queue rejected messages with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("failed to encode message body: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid queue url: {0}")]
    Url(#[from] url::ParseError),
}

/// Delivery side of the producer. Accepts one or more messages per call.
#[async_trait]
pub trait QueueSender: Send + Sync {
    async fn send(&self, messages: &[QueueMessage]) -> Result<(), TransportError>;

    async fn send_one(&self, message: &QueueMessage) -> Result<(), TransportError> {
        self.send(std::slice::from_ref(message)).await
    }
}

/// Queue gateway client speaking JSON over HTTP.
#[derive(Clone)]
pub struct HttpQueueSender {
    http: Client,
    url: Url,
    token: String,
}

impl fmt::Debug for HttpQueueSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpQueueSender")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage<'a> {
    id: &'a str,
    body: String,
    group_id: &'a str,
    deduplication_id: &'a str,
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    messages: Vec<WireMessage<'a>>,
}

impl HttpQueueSender {
    pub fn new(url: &str, token: String, timeout: Duration) -> Result<Self, TransportError> {
        let url = Url::parse(url)?;
        let http = Client::builder()
            .user_agent("media-producer/0.1")
            .timeout(timeout)
            .build()?;
        Ok(Self { http, url, token })
    }

    pub fn from_config(cfg: &Config) -> Result<Self, TransportError> {
        Self::new(
            &cfg.queue.url,
            cfg.queue.token.clone(),
            Duration::from_secs(cfg.queue.timeout_seconds),
        )
    }

    pub fn build_request(&self, messages: &[QueueMessage]) -> Result<reqwest::Request, TransportError> {
        let payload = encode_messages(messages)?;
        let request = self
            .http
            .post(self.url.clone())
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Content-Type", "application/json")
            .json(&payload)
            .build()?;
        Ok(request)
    }
}

fn encode_messages(messages: &[QueueMessage]) -> Result<SendRequest<'_>, TransportError> {
    let messages = messages
        .iter()
        .map(|m| {
            Ok(WireMessage {
                id: &m.id,
                body: m.encode_body()?,
                group_id: &m.group_id,
                deduplication_id: &m.deduplication_id,
            })
        })
        .collect::<Result<Vec<_>, TransportError>>()?;
    Ok(SendRequest { messages })
}

#[async_trait]
impl QueueSender for HttpQueueSender {
    async fn send(&self, messages: &[QueueMessage]) -> Result<(), TransportError> {
        if messages.is_empty() {
            return Ok(());
        }
        let request = self.build_request(messages)?;
        debug!(url = %request.url(), count = messages.len(), "sending queue messages");

        let res = self.http.execute(request).await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), %body, "queue gateway rejected messages");
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}
