use async_trait::async_trait;
use chrono::{DateTime, Utc};
use media_producer::db::{self, RepositoryError, SqliteWorkItemRepository, WorkItemRepository};
use media_producer::model::{FetchMode, QueueMessage, TokenKey, WorkItem};
use media_producer::producer::{MediaProducer, ProducerSettings};
use media_producer::queue::{QueueSender, TransportError};
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn settings(fetch_mode: FetchMode, batch_limit: u32, concurrency: usize) -> ProducerSettings {
    ProducerSettings {
        source: "opensea".into(),
        batch_limit,
        fetch_mode,
        dispatch_concurrency: concurrency,
    }
}

#[derive(Default)]
struct RecordingSender {
    failing_ids: HashSet<String>,
    calls: Mutex<Vec<Vec<QueueMessage>>>,
}

impl RecordingSender {
    fn failing(ids: &[&str]) -> Self {
        Self {
            failing_ids: ids.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    async fn sent_ids(&self) -> Vec<String> {
        self.calls
            .lock()
            .await
            .iter()
            .flat_map(|batch| batch.iter().map(|m| m.id.clone()))
            .collect()
    }

    async fn messages(&self) -> Vec<QueueMessage> {
        self.calls.lock().await.iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl QueueSender for RecordingSender {
    async fn send(&self, messages: &[QueueMessage]) -> Result<(), TransportError> {
        self.calls.lock().await.push(messages.to_vec());
        if messages.iter().any(|m| self.failing_ids.contains(&m.id)) {
            return Err(TransportError::Rejected {
                status: 503,
                body: "broker unavailable".into(),
            });
        }
        Ok(())
    }
}

/// Wraps the SQLite repository and records every mark call.
struct CountingRepository {
    inner: SqliteWorkItemRepository,
    batch_marks: Mutex<Vec<Vec<TokenKey>>>,
    fail_marks: bool,
}

impl CountingRepository {
    fn new(pool: sqlx::SqlitePool) -> Self {
        Self {
            inner: SqliteWorkItemRepository::new(pool),
            batch_marks: Mutex::new(Vec::new()),
            fail_marks: false,
        }
    }
}

#[async_trait]
impl WorkItemRepository for CountingRepository {
    async fn find_pending(&self, source: &str, limit: u32) -> Result<Vec<WorkItem>, RepositoryError> {
        self.inner.find_pending(source, limit).await
    }

    async fn find_pending_one(&self, source: &str) -> Result<Option<WorkItem>, RepositoryError> {
        self.inner.find_pending_one(source).await
    }

    async fn mark_processed(&self, key: &TokenKey, at: DateTime<Utc>) -> Result<(), RepositoryError> {
        self.inner.mark_processed(key, at).await
    }

    async fn mark_processed_batch(
        &self,
        keys: &[TokenKey],
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        self.batch_marks.lock().await.push(keys.to_vec());
        if self.fail_marks {
            return Err(RepositoryError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.mark_processed_batch(keys, at).await
    }
}

struct UnavailableRepository;

#[async_trait]
impl WorkItemRepository for UnavailableRepository {
    async fn find_pending(&self, _source: &str, _limit: u32) -> Result<Vec<WorkItem>, RepositoryError> {
        Err(RepositoryError::Database(sqlx::Error::PoolTimedOut))
    }

    async fn find_pending_one(&self, _source: &str) -> Result<Option<WorkItem>, RepositoryError> {
        Err(RepositoryError::Database(sqlx::Error::PoolTimedOut))
    }

    async fn mark_processed(&self, _key: &TokenKey, _at: DateTime<Utc>) -> Result<(), RepositoryError> {
        Err(RepositoryError::Database(sqlx::Error::PoolTimedOut))
    }

    async fn mark_processed_batch(
        &self,
        _keys: &[TokenKey],
        _at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        Err(RepositoryError::Database(sqlx::Error::PoolTimedOut))
    }
}

async fn seed(pool: &sqlx::SqlitePool, tokens: &[&str]) {
    for token in tokens {
        let item = WorkItem::pending(
            "0xabc",
            *token,
            "opensea",
            Some(json!({ "image": format!("https://cdn/{token}.png") })),
        );
        db::upsert_item(pool, &item).await.unwrap();
    }
}

#[tokio::test]
async fn empty_fetch_never_marks() {
    let pool = setup_pool().await;
    let repo = Arc::new(CountingRepository::new(pool));
    let sender = Arc::new(RecordingSender::default());
    let producer = MediaProducer::new(repo.clone(), sender.clone(), settings(FetchMode::Batch, 100, 1));

    let report = producer.run_tick().await.unwrap();
    assert!(report.is_idle());
    assert!(report.marked_at.is_none());
    assert!(repo.batch_marks.lock().await.is_empty());
    assert!(sender.sent_ids().await.is_empty());
}

#[tokio::test]
async fn dispatches_each_item_once_and_marks_batch() {
    let pool = setup_pool().await;
    seed(&pool, &["1", "2", "3"]).await;
    let repo = Arc::new(CountingRepository::new(pool.clone()));
    let sender = Arc::new(RecordingSender::default());
    let producer = MediaProducer::new(repo.clone(), sender.clone(), settings(FetchMode::Batch, 100, 1));

    let report = producer.run_tick().await.unwrap();
    assert_eq!(report.fetched, 3);
    assert_eq!(report.sent, 3);
    assert_eq!(report.failed, 0);

    // One send call per item, in fetch order.
    let calls = sender.calls.lock().await.clone();
    assert_eq!(calls.len(), 3);
    assert!(calls.iter().all(|batch| batch.len() == 1));
    assert_eq!(
        sender.sent_ids().await,
        vec!["0xabc-1", "0xabc-2", "0xabc-3"]
    );

    let marks = repo.batch_marks.lock().await.clone();
    assert_eq!(marks.len(), 1);
    assert_eq!(marks[0].len(), 3);

    let marked_at = report.marked_at.unwrap();
    for token in ["1", "2", "3"] {
        let stored = db::find_item(&pool, &TokenKey::new("0xabc", token))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            stored.sent_for_media_at.map(|t| t.timestamp_millis()),
            Some(marked_at.timestamp_millis())
        );
        assert!(!stored.need_to_refresh_media_files);
    }

    // Nothing left: the next tick is idle and sends nothing more.
    let report = producer.run_tick().await.unwrap();
    assert!(report.is_idle());
    assert_eq!(sender.sent_ids().await.len(), 3);
}

#[tokio::test]
async fn send_failure_does_not_stop_batch_or_marking() {
    let pool = setup_pool().await;
    seed(&pool, &["1", "2", "3", "4"]).await;
    let repo = Arc::new(CountingRepository::new(pool.clone()));
    let sender = Arc::new(RecordingSender::failing(&["0xabc-2"]));
    let producer = MediaProducer::new(repo.clone(), sender.clone(), settings(FetchMode::Batch, 100, 1));

    let report = producer.run_tick().await.unwrap();
    assert_eq!(report.fetched, 4);
    assert_eq!(report.sent, 3);
    assert_eq!(report.failed, 1);
    assert_eq!(sender.sent_ids().await.len(), 4);

    let marks = repo.batch_marks.lock().await.clone();
    assert_eq!(marks.len(), 1);
    let marked: Vec<&str> = marks[0].iter().map(|k| k.token_id.as_str()).collect();
    assert_eq!(marked, vec!["1", "2", "3", "4"]);

    // The failed item is not retried.
    assert_eq!(db::count_pending(&pool, "opensea").await.unwrap(), 0);
    producer.run_tick().await.unwrap();
    assert_eq!(sender.sent_ids().await.len(), 4);
}

#[tokio::test]
async fn item_without_media_is_sent_with_empty_list() {
    let pool = setup_pool().await;
    db::upsert_item(&pool, &WorkItem::pending("0xabc", "bare", "opensea", Some(json!({ "name": "x" }))))
        .await
        .unwrap();
    db::upsert_item(
        &pool,
        &WorkItem::pending(
            "0xabc",
            "both",
            "opensea",
            Some(json!({ "image": "https://cdn/i.png", "animation_url": "https://cdn/a.mp4" })),
        ),
    )
    .await
    .unwrap();

    let repo = Arc::new(SqliteWorkItemRepository::new(pool.clone()));
    let sender = Arc::new(RecordingSender::default());
    let producer = MediaProducer::new(repo, sender.clone(), settings(FetchMode::Batch, 100, 1));

    let report = producer.run_tick().await.unwrap();
    assert_eq!(report.marked.len(), 2);

    let messages = sender.messages().await;
    assert!(messages[0].body.media_files.is_empty());
    assert_eq!(
        messages[1].body.media_files,
        vec!["https://cdn/i.png".to_string(), "https://cdn/a.mp4".to_string()]
    );
    assert_eq!(db::count_pending(&pool, "opensea").await.unwrap(), 0);
}

#[tokio::test]
async fn only_this_source_is_polled_and_limit_applies() {
    let pool = setup_pool().await;
    seed(&pool, &["1", "2", "3"]).await;
    db::upsert_item(&pool, &WorkItem::pending("0xdef", "9", "rarible", None))
        .await
        .unwrap();

    let repo = Arc::new(SqliteWorkItemRepository::new(pool.clone()));
    let sender = Arc::new(RecordingSender::default());
    let producer = MediaProducer::new(repo, sender.clone(), settings(FetchMode::Batch, 2, 1));

    let report = producer.run_tick().await.unwrap();
    assert_eq!(report.fetched, 2);
    assert_eq!(sender.sent_ids().await, vec!["0xabc-1", "0xabc-2"]);

    let report = producer.run_tick().await.unwrap();
    assert_eq!(report.fetched, 1);
    assert_eq!(db::count_pending(&pool, "rarible").await.unwrap(), 1);
}

#[tokio::test]
async fn single_mode_dispatches_highest_priority_item() {
    let pool = setup_pool().await;
    seed(&pool, &["1", "2"]).await;
    let mut urgent = WorkItem::pending("0xabc", "urgent", "opensea", None);
    urgent.priority = Some(5);
    db::upsert_item(&pool, &urgent).await.unwrap();

    let repo = Arc::new(CountingRepository::new(pool.clone()));
    let sender = Arc::new(RecordingSender::default());
    let producer = MediaProducer::new(repo.clone(), sender.clone(), settings(FetchMode::Single, 100, 1));

    let report = producer.run_tick().await.unwrap();
    assert_eq!(report.fetched, 1);
    assert_eq!(sender.sent_ids().await, vec!["0xabc-urgent"]);
    assert_eq!(repo.batch_marks.lock().await[0].len(), 1);
    assert_eq!(db::count_pending(&pool, "opensea").await.unwrap(), 2);
}

#[tokio::test]
async fn concurrent_dispatch_marks_each_item_once_in_fetch_order() {
    let pool = setup_pool().await;
    let tokens: Vec<String> = (0..12).map(|i| i.to_string()).collect();
    let token_refs: Vec<&str> = tokens.iter().map(String::as_str).collect();
    seed(&pool, &token_refs).await;

    let repo = Arc::new(CountingRepository::new(pool.clone()));
    let sender = Arc::new(RecordingSender::failing(&["0xabc-3", "0xabc-7"]));
    let producer = MediaProducer::new(repo.clone(), sender.clone(), settings(FetchMode::Batch, 100, 4));

    let report = producer.run_tick().await.unwrap();
    assert_eq!(report.fetched, 12);
    assert_eq!(report.failed, 2);

    let marks = repo.batch_marks.lock().await.clone();
    assert_eq!(marks.len(), 1);
    let marked: Vec<String> = marks[0].iter().map(|k| k.token_id.clone()).collect();
    assert_eq!(marked, tokens);
}

#[tokio::test]
async fn fetch_failure_propagates_without_sending() {
    let sender = Arc::new(RecordingSender::default());
    let producer = MediaProducer::new(
        Arc::new(UnavailableRepository),
        sender.clone(),
        settings(FetchMode::Batch, 100, 1),
    );

    let err = producer.run_tick().await.unwrap_err();
    assert!(matches!(err, RepositoryError::Database(_)));
    assert!(sender.sent_ids().await.is_empty());

    let producer = MediaProducer::new(
        Arc::new(UnavailableRepository),
        sender.clone(),
        settings(FetchMode::Single, 100, 1),
    );
    assert!(producer.run_tick().await.is_err());
}

#[tokio::test]
async fn mark_failure_propagates_and_leaves_items_pending() {
    let pool = setup_pool().await;
    seed(&pool, &["1", "2"]).await;
    let mut repo = CountingRepository::new(pool.clone());
    repo.fail_marks = true;
    let repo = Arc::new(repo);
    let sender = Arc::new(RecordingSender::default());
    let producer = MediaProducer::new(repo.clone(), sender.clone(), settings(FetchMode::Batch, 100, 1));

    assert!(producer.run_tick().await.is_err());
    assert_eq!(sender.sent_ids().await.len(), 2);
    assert_eq!(db::count_pending(&pool, "opensea").await.unwrap(), 2);
}
