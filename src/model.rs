use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How the producer asks the repository for work on each tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    /// Up to `batch_limit` pending items in insertion order.
    #[default]
    Batch,
    /// The single highest-priority pending item.
    Single,
}

impl FetchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchMode::Batch => "batch",
            FetchMode::Single => "single",
        }
    }
}

/// Immutable identity of a token record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenKey {
    pub contract_address: String,
    pub token_id: String,
}

impl TokenKey {
    pub fn new(contract_address: impl Into<String>, token_id: impl Into<String>) -> Self {
        Self {
            contract_address: contract_address.into(),
            token_id: token_id.into(),
        }
    }
}

/// One on-chain token awaiting media processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub contract_address: String,
    pub token_id: String,
    pub source: String,
    pub metadata: Option<Value>,
    pub priority: Option<i64>,
    pub need_to_refresh_media_files: bool,
    pub sent_for_media_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    /// A fresh pending item, as the ingestion side would write it.
    pub fn pending(
        contract_address: impl Into<String>,
        token_id: impl Into<String>,
        source: impl Into<String>,
        metadata: Option<Value>,
    ) -> Self {
        Self {
            contract_address: contract_address.into(),
            token_id: token_id.into(),
            source: source.into(),
            metadata,
            priority: None,
            need_to_refresh_media_files: true,
            sent_for_media_at: None,
        }
    }

    pub fn key(&self) -> TokenKey {
        TokenKey::new(self.contract_address.clone(), self.token_id.clone())
    }

    pub fn image(&self) -> Option<&str> {
        self.metadata_str("image")
    }

    pub fn animation_url(&self) -> Option<&str> {
        self.metadata_str("animation_url")
    }

    // Empty strings count as absent.
    fn metadata_str(&self, field: &str) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(field))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

/// Payload carried by a queue message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessageBody {
    pub contract_address: String,
    pub token_id: String,
    pub media_files: Vec<String>,
}

/// The unit handed to the queue sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub id: String,
    pub body: QueueMessageBody,
    pub group_id: String,
    pub deduplication_id: String,
}

impl QueueMessage {
    /// String encoding of the body as transmitted to the broker.
    pub fn encode_body(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.body)
    }
}
