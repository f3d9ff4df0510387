use super::model::WorkItemRow;
use crate::model::{TokenKey, WorkItem};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{instrument, warn};

pub type Pool = SqlitePool;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

const ITEM_COLUMNS: &str = "contract_address, token_id, source, metadata, priority, \
                            need_to_refresh_media_files, sent_for_media_at";

const PENDING_FILTER: &str =
    "source = ? AND sent_for_media_at IS NULL AND need_to_refresh_media_files = 1";

/// Store contract the producer depends on.
#[async_trait]
pub trait WorkItemRepository: Send + Sync {
    /// Up to `limit` pending items for `source`, oldest first.
    async fn find_pending(&self, source: &str, limit: u32) -> Result<Vec<WorkItem>, RepositoryError>;

    /// Highest-priority pending item for `source`, if any.
    async fn find_pending_one(&self, source: &str) -> Result<Option<WorkItem>, RepositoryError>;

    async fn mark_processed(&self, key: &TokenKey, at: DateTime<Utc>) -> Result<(), RepositoryError>;

    /// All-or-nothing: either every key is marked with `at` or none is.
    async fn mark_processed_batch(
        &self,
        keys: &[TokenKey],
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;
}

pub async fn init_pool(database_url: &str) -> Result<Pool, RepositoryError> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
    sqlx::query("PRAGMA synchronous=FULL;").execute(&pool).await?;
    Ok(pool)
}

/// Expand a leading `~/` in a file-backed SQLite URL and make sure the parent
/// directory exists. Non-sqlite and in-memory URLs pass through.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let path = crate::config::expand_home(path);
    if let Some(parent) = std::path::Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                warn!(?err, dir = %parent.display(), "failed to create sqlite parent directory");
            }
        }
    }

    match query {
        Some(q) => format!("sqlite://{}?{}", path, q),
        None => format!("sqlite://{}", path),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<(), RepositoryError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Ingestion-side write: insert or replace the stored state of an item.
#[instrument(skip_all)]
pub async fn upsert_item(pool: &Pool, item: &WorkItem) -> Result<(), RepositoryError> {
    let metadata = item.metadata.as_ref().map(|m| m.to_string());
    sqlx::query(
        "INSERT INTO nft_tokens (contract_address, token_id, source, metadata, priority, \
                                 need_to_refresh_media_files, sent_for_media_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (contract_address, token_id) DO UPDATE SET \
             source = excluded.source, \
             metadata = excluded.metadata, \
             priority = excluded.priority, \
             need_to_refresh_media_files = excluded.need_to_refresh_media_files, \
             sent_for_media_at = excluded.sent_for_media_at, \
             updated_at = CURRENT_TIMESTAMP",
    )
    .bind(&item.contract_address)
    .bind(&item.token_id)
    .bind(&item.source)
    .bind(metadata)
    .bind(item.priority)
    .bind(item.need_to_refresh_media_files)
    .bind(item.sent_for_media_at)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn find_item(pool: &Pool, key: &TokenKey) -> Result<Option<WorkItem>, RepositoryError> {
    let sql = format!(
        "SELECT {} FROM nft_tokens WHERE contract_address = ? AND token_id = ?",
        ITEM_COLUMNS
    );
    let row = sqlx::query_as::<_, WorkItemRow>(&sql)
        .bind(&key.contract_address)
        .bind(&key.token_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(WorkItemRow::into_work_item))
}

#[instrument(skip_all)]
pub async fn find_pending(pool: &Pool, source: &str, limit: u32) -> Result<Vec<WorkItem>, RepositoryError> {
    let sql = format!(
        "SELECT {} FROM nft_tokens WHERE {} ORDER BY rowid ASC LIMIT ?",
        ITEM_COLUMNS, PENDING_FILTER
    );
    let rows = sqlx::query_as::<_, WorkItemRow>(&sql)
        .bind(source)
        .bind(i64::from(limit))
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(WorkItemRow::into_work_item).collect())
}

#[instrument(skip_all)]
pub async fn find_pending_one(pool: &Pool, source: &str) -> Result<Option<WorkItem>, RepositoryError> {
    let sql = format!(
        "SELECT {} FROM nft_tokens WHERE {} \
         ORDER BY priority IS NULL, priority DESC, rowid ASC LIMIT 1",
        ITEM_COLUMNS, PENDING_FILTER
    );
    let row = sqlx::query_as::<_, WorkItemRow>(&sql)
        .bind(source)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(WorkItemRow::into_work_item))
}

#[instrument(skip_all)]
pub async fn count_pending(pool: &Pool, source: &str) -> Result<i64, RepositoryError> {
    let sql = format!("SELECT COUNT(*) FROM nft_tokens WHERE {}", PENDING_FILTER);
    let count: i64 = sqlx::query_scalar(&sql).bind(source).fetch_one(pool).await?;
    Ok(count)
}

const MARK_PROCESSED: &str = "UPDATE nft_tokens \
     SET sent_for_media_at = ?, need_to_refresh_media_files = 0, updated_at = CURRENT_TIMESTAMP \
     WHERE contract_address = ? AND token_id = ?";

#[instrument(skip_all)]
pub async fn mark_processed(pool: &Pool, key: &TokenKey, at: DateTime<Utc>) -> Result<(), RepositoryError> {
    sqlx::query(MARK_PROCESSED)
        .bind(at)
        .bind(&key.contract_address)
        .bind(&key.token_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn mark_processed_batch(
    pool: &Pool,
    keys: &[TokenKey],
    at: DateTime<Utc>,
) -> Result<(), RepositoryError> {
    if keys.is_empty() {
        return Ok(());
    }
    let mut tx = pool.begin().await?;
    for key in keys {
        sqlx::query(MARK_PROCESSED)
            .bind(at)
            .bind(&key.contract_address)
            .bind(&key.token_id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// `WorkItemRepository` over the SQLite pool.
#[derive(Debug, Clone)]
pub struct SqliteWorkItemRepository {
    pool: Pool,
}

impl SqliteWorkItemRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkItemRepository for SqliteWorkItemRepository {
    async fn find_pending(&self, source: &str, limit: u32) -> Result<Vec<WorkItem>, RepositoryError> {
        find_pending(&self.pool, source, limit).await
    }

    async fn find_pending_one(&self, source: &str) -> Result<Option<WorkItem>, RepositoryError> {
        find_pending_one(&self.pool, source).await
    }

    async fn mark_processed(&self, key: &TokenKey, at: DateTime<Utc>) -> Result<(), RepositoryError> {
        mark_processed(&self.pool, key, at).await
    }

    async fn mark_processed_batch(
        &self,
        keys: &[TokenKey],
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        mark_processed_batch(&self.pool, keys, at).await
    }
}
