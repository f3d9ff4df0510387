//! Poll-dispatch-mark loop.
//!
//! One tick fetches pending items for this deployment's source, sends one
//! message per item, then marks every attempted item processed in a single
//! batched update. Send failures are logged and the item is still marked:
//! an attempted item is never dispatched again.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tracing::{debug, info, instrument, warn};

use crate::db::{RepositoryError, WorkItemRepository};
use crate::dispatcher::build_message;
use crate::model::{FetchMode, TokenKey, WorkItem};
use crate::queue::QueueSender;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerSettings {
    pub source: String,
    pub batch_limit: u32,
    pub fetch_mode: FetchMode,
    /// Sends in flight at once within a tick. 1 means strictly sequential.
    pub dispatch_concurrency: usize,
}

impl ProducerSettings {
    pub fn from_config(cfg: &crate::config::Config) -> Self {
        Self {
            source: cfg.app.source.clone(),
            batch_limit: cfg.app.batch_limit,
            fetch_mode: cfg.app.fetch_mode,
            dispatch_concurrency: cfg.app.dispatch_concurrency,
        }
    }
}

/// What a completed tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub fetched: usize,
    pub sent: usize,
    pub failed: usize,
    /// Keys handed to the batched mark, in fetch order.
    pub marked: Vec<TokenKey>,
    pub marked_at: Option<DateTime<Utc>>,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.fetched == 0
    }
}

pub struct MediaProducer {
    repo: Arc<dyn WorkItemRepository>,
    sender: Arc<dyn QueueSender>,
    settings: ProducerSettings,
}

impl MediaProducer {
    pub fn new(
        repo: Arc<dyn WorkItemRepository>,
        sender: Arc<dyn QueueSender>,
        settings: ProducerSettings,
    ) -> Self {
        Self {
            repo,
            sender,
            settings,
        }
    }

    pub fn settings(&self) -> &ProducerSettings {
        &self.settings
    }

    /// Run one Fetching → Dispatching → Marking pass.
    ///
    /// Repository failures propagate; transport failures are absorbed per item.
    #[instrument(skip_all, fields(source = %self.settings.source))]
    pub async fn run_tick(&self) -> Result<TickReport, RepositoryError> {
        let items = self.fetch().await?;
        if items.is_empty() {
            debug!("no pending items");
            return Ok(TickReport::default());
        }
        info!(fetched = items.len(), "got pending items to dispatch");

        let mut report = TickReport {
            fetched: items.len(),
            ..TickReport::default()
        };

        // `buffered` yields results in input order, so the processed list
        // matches fetch order whatever the concurrency.
        let concurrency = self.settings.dispatch_concurrency.max(1);
        let outcomes: Vec<(TokenKey, bool)> = stream::iter(items)
            .map(move |item| async move { self.dispatch(&item).await })
            .buffered(concurrency)
            .collect()
            .await;

        let mut processed = Vec::with_capacity(outcomes.len());
        for (key, delivered) in outcomes {
            if delivered {
                report.sent += 1;
            } else {
                report.failed += 1;
            }
            processed.push(key);
        }

        if processed.is_empty() {
            debug!("nothing attempted; skipping mark");
            return Ok(report);
        }

        let now = Utc::now();
        self.repo.mark_processed_batch(&processed, now).await?;
        report.marked = processed;
        report.marked_at = Some(now);

        info!(
            fetched = report.fetched,
            sent = report.sent,
            failed = report.failed,
            "completed producing batch"
        );
        Ok(report)
    }

    async fn fetch(&self) -> Result<Vec<WorkItem>, RepositoryError> {
        match self.settings.fetch_mode {
            FetchMode::Batch => {
                self.repo
                    .find_pending(&self.settings.source, self.settings.batch_limit)
                    .await
            }
            FetchMode::Single => Ok(self
                .repo
                .find_pending_one(&self.settings.source)
                .await?
                .into_iter()
                .collect()),
        }
    }

    /// Build and send one item's message. Returns the key and whether the send
    /// succeeded; either way the item counts as attempted.
    async fn dispatch(&self, item: &WorkItem) -> (TokenKey, bool) {
        let message = build_message(item);
        let delivered = match self.sender.send_one(&message).await {
            Ok(()) => {
                debug!(
                    contract_address = %item.contract_address,
                    token_id = %item.token_id,
                    media_files = message.body.media_files.len(),
                    "queued media message"
                );
                true
            }
            Err(err) => {
                warn!(
                    %err,
                    contract_address = %item.contract_address,
                    token_id = %item.token_id,
                    "failed to queue media message"
                );
                false
            }
        };
        (item.key(), delivered)
    }
}

impl std::fmt::Debug for MediaProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaProducer")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
