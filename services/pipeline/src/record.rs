//! Image records and the record store capability.
//!
//! The store exposes keyed get/create/update/delete plus the filter scan
//! backing the query API. Updates are field-level patches, never whole-row
//! overwrites, so concurrent handlers touching different fields of the same
//! record cannot clobber each other.

use crate::message::{ObjectLocator, ReviewStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors surfaced by a record store backend.
///
/// Absent records are not errors; they are `None`/`false` returns. A store
/// error always means infrastructure trouble and is retryable.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Record store backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Lifecycle state of an image record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageStatus {
    #[serde(rename = "pending")]
    Pending,
    Pass,
    Reject,
    #[serde(rename = "invalid")]
    Invalid,
}

impl ImageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStatus::Pending => "pending",
            ImageStatus::Pass => "Pass",
            ImageStatus::Reject => "Reject",
            ImageStatus::Invalid => "invalid",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ImageStatus::Pending),
            "Pass" => Some(ImageStatus::Pass),
            "Reject" => Some(ImageStatus::Reject),
            "invalid" => Some(ImageStatus::Invalid),
            _ => None,
        }
    }
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ReviewStatus> for ImageStatus {
    fn from(status: ReviewStatus) -> Self {
        match status {
            ReviewStatus::Pass => ImageStatus::Pass,
            ReviewStatus::Reject => ImageStatus::Reject,
        }
    }
}

/// The central entity: one stored image and its moderation state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    pub id: String,
    pub bucket: String,
    #[serde(rename = "s3Key")]
    pub object_key: String,
    pub uploaded_at: DateTime<Utc>,
    pub size: Option<i64>,
    pub content_type: Option<String>,
    /// Annotation map (caption/date/name); grows by merge, never replaced.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub status: ImageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub photographer: String,
    pub last_updated: DateTime<Utc>,
}

impl ImageRecord {
    pub fn locator(&self) -> ObjectLocator {
        ObjectLocator::new(self.bucket.clone(), self.object_key.clone())
    }
}

/// A field-level update applied to an existing record.
///
/// Only the populated fields are written; everything else is left exactly as
/// stored, which is what makes re-applying a patch harmless.
#[derive(Debug, Clone, Default)]
pub struct RecordPatch {
    pub status: Option<ImageStatus>,
    pub reason: Option<String>,
    /// Single-key metadata upsert: `current ∪ {key: value}`.
    pub metadata_upsert: Option<(String, String)>,
    pub photographer: Option<String>,
}

impl RecordPatch {
    /// Patch for a review transition: status plus its reason.
    pub fn review(status: ImageStatus, reason: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            reason: Some(reason.into()),
            ..Default::default()
        }
    }

    /// Patch merging one annotation key.
    pub fn annotation(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            metadata_upsert: Some((key.into(), value.into())),
            ..Default::default()
        }
    }
}

/// Inclusive date bracket over `uploaded_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Filter criteria for the query surface. Absent filters impose no
/// constraint; present ones combine with AND.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterCriteria {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_range: Option<DateRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ImageStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photographer: Option<String>,
}

impl FilterCriteria {
    fn matches(&self, record: &ImageRecord) -> bool {
        if let Some(ref range) = self.date_range {
            if record.uploaded_at < range.start || record.uploaded_at > range.end {
                return false;
            }
        }
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        if let Some(ref photographer) = self.photographer {
            if record.photographer != *photographer {
                return false;
            }
        }
        true
    }
}

/// Keyed storage capability for image records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Create-if-absent. Returns `false` when the id already exists.
    async fn create(&self, record: &ImageRecord) -> Result<bool, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<ImageRecord>, StoreError>;

    /// Apply a field-level patch, refreshing `last_updated`. Returns the
    /// updated record, or `None` if the id does not exist; a deleted record
    /// is never resurrected by a stale patch.
    async fn update_fields(
        &self,
        id: &str,
        patch: RecordPatch,
    ) -> Result<Option<ImageRecord>, StoreError>;

    /// Delete the record. Returns `false` when it was already gone.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    /// Scan records matching the criteria, newest upload first.
    async fn query(&self, criteria: &FilterCriteria) -> Result<Vec<ImageRecord>, StoreError>;
}

/// PostgreSQL-backed record store.
pub struct PgRecordStore {
    pool: PgPool,
}

const RECORD_COLUMNS: &str = "id, bucket, object_key, uploaded_at, size, content_type, \
                              metadata, status, reason, photographer, last_updated";

impl PgRecordStore {
    /// Connect a pool with the given settings.
    pub async fn new(config: &crate::config::DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await?;

        info!("Connected to PostgreSQL record store");

        Ok(Self { pool })
    }

    /// Run database migrations.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running record store migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    /// Get the connection pool (for health checks).
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<ImageRecord, StoreError> {
        let metadata_value: serde_json::Value = row.try_get("metadata")?;
        let metadata: BTreeMap<String, String> =
            serde_json::from_value(metadata_value).unwrap_or_default();

        let status_raw: String = row.try_get("status")?;
        let status = ImageStatus::parse(&status_raw)
            .ok_or_else(|| StoreError::Backend(format!("unknown status column value: {status_raw}")))?;

        Ok(ImageRecord {
            id: row.try_get("id")?,
            bucket: row.try_get("bucket")?,
            object_key: row.try_get("object_key")?,
            uploaded_at: row.try_get("uploaded_at")?,
            size: row.try_get("size")?,
            content_type: row.try_get("content_type")?,
            metadata,
            status,
            reason: row.try_get("reason")?,
            photographer: row.try_get("photographer")?,
            last_updated: row.try_get("last_updated")?,
        })
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    #[instrument(skip(self, record), fields(id = %record.id))]
    async fn create(&self, record: &ImageRecord) -> Result<bool, StoreError> {
        let metadata = serde_json::to_value(&record.metadata)
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO images (
                id, bucket, object_key, uploaded_at, size, content_type,
                metadata, status, reason, photographer, last_updated
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&record.id)
        .bind(&record.bucket)
        .bind(&record.object_key)
        .bind(record.uploaded_at)
        .bind(record.size)
        .bind(&record.content_type)
        .bind(&metadata)
        .bind(record.status.as_str())
        .bind(&record.reason)
        .bind(&record.photographer)
        .bind(record.last_updated)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, id: &str) -> Result<Option<ImageRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {RECORD_COLUMNS} FROM images WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::record_from_row).transpose()
    }

    #[instrument(skip(self, patch), fields(id = %id))]
    async fn update_fields(
        &self,
        id: &str,
        patch: RecordPatch,
    ) -> Result<Option<ImageRecord>, StoreError> {
        let (meta_key, meta_value) = match patch.metadata_upsert {
            Some((key, value)) => (Some(key), Some(value)),
            None => (None, None),
        };

        // Field-level conditional writes keep concurrent patches to
        // different fields from overwriting each other.
        let row = sqlx::query(&format!(
            r#"
            UPDATE images SET
                status = COALESCE($2, status),
                reason = CASE WHEN $3::text IS NULL THEN reason ELSE $3 END,
                photographer = COALESCE($4, photographer),
                metadata = CASE
                    WHEN $5::text IS NULL THEN metadata
                    ELSE jsonb_set(metadata, ARRAY[$5], to_jsonb($6::text), true)
                END,
                last_updated = $7
            WHERE id = $1
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.reason)
        .bind(patch.photographer)
        .bind(meta_key)
        .bind(meta_value)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::record_from_row).transpose()
    }

    #[instrument(skip(self), fields(id = %id))]
    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM images WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, criteria))]
    async fn query(&self, criteria: &FilterCriteria) -> Result<Vec<ImageRecord>, StoreError> {
        let mut sql = format!("SELECT {RECORD_COLUMNS} FROM images WHERE 1=1");
        let mut param = 0;

        if criteria.date_range.is_some() {
            sql.push_str(&format!(
                " AND uploaded_at >= ${} AND uploaded_at <= ${}",
                param + 1,
                param + 2
            ));
            param += 2;
        }
        if criteria.status.is_some() {
            param += 1;
            sql.push_str(&format!(" AND status = ${param}"));
        }
        if criteria.photographer.is_some() {
            param += 1;
            sql.push_str(&format!(" AND photographer = ${param}"));
        }
        sql.push_str(" ORDER BY uploaded_at DESC");

        let mut query = sqlx::query(&sql);
        if let Some(ref range) = criteria.date_range {
            query = query.bind(range.start).bind(range.end);
        }
        if let Some(status) = criteria.status {
            query = query.bind(status.as_str());
        }
        if let Some(ref photographer) = criteria.photographer {
            query = query.bind(photographer);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::record_from_row).collect()
    }
}

/// In-memory record store used by tests and local development.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: tokio::sync::RwLock<HashMap<String, ImageRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create(&self, record: &ImageRecord) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            debug!(id = %record.id, "Record already exists, create skipped");
            return Ok(false);
        }
        records.insert(record.id.clone(), record.clone());
        Ok(true)
    }

    async fn get(&self, id: &str) -> Result<Option<ImageRecord>, StoreError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn update_fields(
        &self,
        id: &str,
        patch: RecordPatch,
    ) -> Result<Option<ImageRecord>, StoreError> {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(id) else {
            return Ok(None);
        };

        if let Some(status) = patch.status {
            record.status = status;
        }
        if let Some(reason) = patch.reason {
            record.reason = Some(reason);
        }
        if let Some(photographer) = patch.photographer {
            record.photographer = photographer;
        }
        if let Some((key, value)) = patch.metadata_upsert {
            record.metadata.insert(key, value);
        }
        record.last_updated = Utc::now();

        Ok(Some(record.clone()))
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.records.write().await.remove(id).is_some())
    }

    async fn query(&self, criteria: &FilterCriteria) -> Result<Vec<ImageRecord>, StoreError> {
        let records = self.records.read().await;
        let mut matching: Vec<ImageRecord> = records
            .values()
            .filter(|record| criteria.matches(record))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        Ok(matching)
    }
}

#[cfg(test)]
pub(crate) fn test_record(id: &str) -> ImageRecord {
    ImageRecord {
        id: id.to_string(),
        bucket: "images".to_string(),
        object_key: format!("{id}.jpeg"),
        uploaded_at: Utc::now(),
        size: Some(1024),
        content_type: Some("image/jpeg".to_string()),
        metadata: BTreeMap::new(),
        status: ImageStatus::Pending,
        reason: None,
        photographer: "unknown".to_string(),
        last_updated: Utc::now(),
    }
}
