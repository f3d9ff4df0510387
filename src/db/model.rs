//! Row models returned by repository queries.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;
use tracing::warn;

use crate::model::WorkItem;

/// `nft_tokens` row with metadata still in its stored JSON text form.
#[derive(Debug, Clone, FromRow)]
pub struct WorkItemRow {
    pub contract_address: String,
    pub token_id: String,
    pub source: String,
    pub metadata: Option<String>,
    pub priority: Option<i64>,
    pub need_to_refresh_media_files: bool,
    pub sent_for_media_at: Option<DateTime<Utc>>,
}

impl WorkItemRow {
    /// Unparseable metadata is logged and treated as absent so the item still
    /// flows through dispatch instead of wedging every fetch.
    pub fn into_work_item(self) -> WorkItem {
        let metadata = match self.metadata.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(Value::Null) => None,
                Ok(value) => Some(value),
                Err(err) => {
                    warn!(
                        ?err,
                        contract_address = %self.contract_address,
                        token_id = %self.token_id,
                        "stored metadata is not valid JSON; ignoring"
                    );
                    None
                }
            },
        };
        WorkItem {
            contract_address: self.contract_address,
            token_id: self.token_id,
            source: self.source,
            metadata,
            priority: self.priority,
            need_to_refresh_media_files: self.need_to_refresh_media_files,
            sent_for_media_at: self.sent_for_media_at,
        }
    }
}
