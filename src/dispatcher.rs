//! Work item → queue message transformation.
use crate::model::{QueueMessage, QueueMessageBody, WorkItem};

/// Broker key-length limit forces the token id to be cut at this many characters.
pub const TOKEN_ID_KEY_CHARS: usize = 30;

/// Deterministic message identity: `{contract_address}-{token_id[0:30]}`.
/// The cut counts `char`s, so a multi-byte character is never split.
pub fn message_id(contract_address: &str, token_id: &str) -> String {
    let truncated: String = token_id.chars().take(TOKEN_ID_KEY_CHARS).collect();
    format!("{}-{}", contract_address, truncated)
}

/// Build the queue message for an item. Items without media still yield a
/// message with an empty `media_files`.
pub fn build_message(item: &WorkItem) -> QueueMessage {
    let id = message_id(&item.contract_address, &item.token_id);

    let mut media_files = Vec::with_capacity(2);
    if let Some(image) = item.image() {
        media_files.push(image.to_string());
    }
    if let Some(animation) = item.animation_url() {
        media_files.push(animation.to_string());
    }

    QueueMessage {
        group_id: id.clone(),
        deduplication_id: id.clone(),
        id,
        body: QueueMessageBody {
            contract_address: item.contract_address.clone(),
            token_id: item.token_id.clone(),
            media_files,
        },
    }
}
