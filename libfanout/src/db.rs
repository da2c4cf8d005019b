//! SQLite content store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::error::{FanoutError, Result, StoreError};
use crate::store::ContentStore;
use crate::types::{
    ContentItem, ItemId, Phase, PlatformKind, PublicationResult, PublicationStatus,
};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database file and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(format!("{}: {}", parent.display(), e)))?;
        }

        // Forward slashes keep the URL valid on Windows too
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));

        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(StoreError::SqlxError)?;

        Self::migrate(pool).await
    }

    /// Private in-memory database; a single connection keeps it alive
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(StoreError::SqlxError)?;

        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(StoreError::MigrationError)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the pool; later calls report the store as unavailable
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn load_results(
        conn: &mut SqliteConnection,
        id: &ItemId,
    ) -> Result<BTreeMap<PlatformKind, PublicationResult>> {
        let rows = sqlx::query(
            r#"
            SELECT platform, status, post_id, post_url, error, attempted_at, attempt_count, next_retry_at
            FROM platform_results WHERE item_id = ?
            "#,
        )
        .bind(id.as_str())
        .fetch_all(&mut *conn)
        .await
        .map_err(StoreError::SqlxError)?;

        let mut results = BTreeMap::new();
        for row in rows {
            let platform: PlatformKind = column::<String>(&row, "platform")?
                .parse()
                .map_err(|e: FanoutError| StoreError::Corrupt(e.to_string()))?;
            let status: PublicationStatus = column::<String>(&row, "status")?
                .parse()
                .map_err(|e: FanoutError| StoreError::Corrupt(e.to_string()))?;

            results.insert(
                platform,
                PublicationResult {
                    status,
                    post_id: column(&row, "post_id")?,
                    post_url: column(&row, "post_url")?,
                    error: column(&row, "error")?,
                    attempted_at: from_millis(column(&row, "attempted_at")?)?,
                    attempt_count: to_count(column(&row, "attempt_count")?),
                    next_retry_at: opt_from_millis(column(&row, "next_retry_at")?)?,
                },
            );
        }

        Ok(results)
    }

    fn decode_item(
        row: &SqliteRow,
        platform_results: BTreeMap<PlatformKind, PublicationResult>,
    ) -> Result<ContentItem> {
        let hashtags: Vec<String> = decode_json(&column::<String>(row, "hashtags")?)?;
        let selected_platforms: BTreeSet<PlatformKind> =
            decode_json(&column::<String>(row, "selected_platforms")?)?;
        let phase: Phase = column::<String>(row, "phase")?
            .parse()
            .map_err(|e: FanoutError| StoreError::Corrupt(e.to_string()))?;

        Ok(ContentItem {
            id: ItemId::new(column::<String>(row, "id")?),
            title: column(row, "title")?,
            summary: column(row, "summary")?,
            url: column(row, "url")?,
            hashtags,
            category: column(row, "category")?,
            selected_platforms,
            platform_results,
            phase,
            attempt_count: to_count(column(row, "attempt_count")?),
            last_attempt_at: opt_from_millis(column(row, "last_attempt_at")?)?,
            next_retry_at: opt_from_millis(column(row, "next_retry_at")?)?,
            published_at: opt_from_millis(column(row, "published_at")?)?,
            created_at: from_millis(column(row, "created_at")?)?,
            version: to_version(column(row, "version")?),
        })
    }

    /// Upsert every platform result of `item`
    async fn write_results(conn: &mut SqliteConnection, item: &ContentItem) -> Result<()> {
        for (platform, result) in &item.platform_results {
            sqlx::query(
                r#"
                INSERT INTO platform_results
                    (item_id, platform, status, post_id, post_url, error, attempted_at, attempt_count, next_retry_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(item_id, platform) DO UPDATE SET
                    status = excluded.status,
                    post_id = excluded.post_id,
                    post_url = excluded.post_url,
                    error = excluded.error,
                    attempted_at = excluded.attempted_at,
                    attempt_count = excluded.attempt_count,
                    next_retry_at = excluded.next_retry_at
                "#,
            )
            .bind(item.id.as_str())
            .bind(platform.as_str())
            .bind(result.status.as_str())
            .bind(&result.post_id)
            .bind(&result.post_url)
            .bind(&result.error)
            .bind(result.attempted_at.timestamp_millis())
            .bind(i64::from(result.attempt_count))
            .bind(result.next_retry_at.map(|t| t.timestamp_millis()))
            .execute(&mut *conn)
            .await
            .map_err(StoreError::SqlxError)?;
        }
        Ok(())
    }
}

#[async_trait]
impl ContentStore for Database {
    async fn fetch_pending(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<ContentItem>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM content_items
            WHERE selected_platforms != '[]'
              AND (phase IN ('ready', 'publishing')
                   OR (phase IN ('partially_published', 'failed')
                       AND next_retry_at IS NOT NULL AND next_retry_at <= ?))
            ORDER BY created_at ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(now.timestamp_millis())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::SqlxError)?;

        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(item) = self.load(&ItemId::new(id)).await? {
                items.push(item);
            }
        }
        Ok(items)
    }

    async fn load(&self, id: &ItemId) -> Result<Option<ContentItem>> {
        // One read transaction so the row and its results come from the same version
        let mut tx = self.pool.begin().await.map_err(StoreError::SqlxError)?;

        let row = sqlx::query(
            r#"
            SELECT id, title, summary, url, hashtags, category, selected_platforms, phase,
                   attempt_count, last_attempt_at, next_retry_at, published_at, created_at, version
            FROM content_items WHERE id = ?
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(StoreError::SqlxError)?;

        let item = match row {
            Some(row) => {
                let results = Self::load_results(&mut *tx, id).await?;
                Some(Self::decode_item(&row, results)?)
            }
            None => None,
        };

        tx.commit().await.map_err(StoreError::SqlxError)?;
        Ok(item)
    }

    async fn persist(&self, item: &mut ContentItem) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(StoreError::SqlxError)?;

        // Compare-and-swap on version; published_at is set once, COALESCE keeps the first value
        let updated = sqlx::query(
            r#"
            UPDATE content_items
            SET selected_platforms = ?, phase = ?, attempt_count = ?, last_attempt_at = ?,
                next_retry_at = ?, published_at = COALESCE(published_at, ?),
                version = version + 1
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(encode_json(&item.selected_platforms)?)
        .bind(item.phase.as_str())
        .bind(i64::from(item.attempt_count))
        .bind(item.last_attempt_at.map(|t| t.timestamp_millis()))
        .bind(item.next_retry_at.map(|t| t.timestamp_millis()))
        .bind(item.published_at.map(|t| t.timestamp_millis()))
        .bind(item.id.as_str())
        .bind(from_version(item.version))
        .execute(&mut *tx)
        .await
        .map_err(StoreError::SqlxError)?;

        if updated.rows_affected() == 0 {
            let exists: Option<i64> = sqlx::query_scalar("SELECT version FROM content_items WHERE id = ?")
                .bind(item.id.as_str())
                .fetch_optional(&mut *tx)
                .await
                .map_err(StoreError::SqlxError)?;
            return Err(match exists {
                Some(_) => StoreError::Conflict(item.id.to_string()).into(),
                None => FanoutError::NotFound(item.id.to_string()),
            });
        }

        Self::write_results(&mut *tx, item).await?;

        tx.commit().await.map_err(StoreError::SqlxError)?;
        item.version += 1;
        Ok(())
    }

    async fn insert(&self, item: &ContentItem) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(StoreError::SqlxError)?;

        sqlx::query(
            r#"
            INSERT INTO content_items
                (id, title, summary, url, hashtags, category, selected_platforms, phase,
                 attempt_count, last_attempt_at, next_retry_at, published_at, created_at, version)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(item.id.as_str())
        .bind(&item.title)
        .bind(&item.summary)
        .bind(&item.url)
        .bind(encode_json(&item.hashtags)?)
        .bind(&item.category)
        .bind(encode_json(&item.selected_platforms)?)
        .bind(item.phase.as_str())
        .bind(i64::from(item.attempt_count))
        .bind(item.last_attempt_at.map(|t| t.timestamp_millis()))
        .bind(item.next_retry_at.map(|t| t.timestamp_millis()))
        .bind(item.published_at.map(|t| t.timestamp_millis()))
        .bind(item.created_at.timestamp_millis())
        .bind(from_version(item.version))
        .execute(&mut *tx)
        .await
        .map_err(StoreError::SqlxError)?;

        Self::write_results(&mut *tx, item).await?;

        tx.commit().await.map_err(StoreError::SqlxError)?;
        Ok(())
    }
}

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name)
        .map_err(|e| StoreError::Corrupt(format!("column {}: {}", name, e)).into())
}

fn to_count(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn to_version(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn from_version(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {}", millis)).into())
}

fn opt_from_millis(millis: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    millis.map(from_millis).transpose()
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| StoreError::Corrupt(e.to_string()).into())
}

fn decode_json<T: serde::de::DeserializeOwned>(text: &str) -> Result<T> {
    serde_json::from_str(text).map_err(|e| StoreError::Corrupt(e.to_string()).into())
}
