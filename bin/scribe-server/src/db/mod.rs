//! Database abstraction layer.
//!
//! [`TaskStore`] and [`SettlementStore`] define the interfaces for persisting
//! transcription tasks and settlement imports. The default implementation is
//! [`sqlite::SqliteStore`]. To swap to another database (Postgres, MySQL, …),
//! implement the traits for your new type and change the concrete type in
//! [`crate::state::AppState`].
//!
//! All trait methods use `impl Future` in their signatures (stable since Rust
//! 1.75) so no extra `async-trait` crate is required here.

pub mod sqlite;

use std::collections::HashSet;
use std::future::Future;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Lifecycle states of a transcription task.
///
/// `Failed` is reachable from every non-terminal state; `Completed` only from
/// `Processing`. The string forms are what the `transcription_tasks.status`
/// column stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Uploading,
    AwaitingAsr,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// A row in the `transcription_tasks` table.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: String,
    /// Shared by all tasks created from one batch submission; `None` for
    /// ungrouped tasks.
    pub batch_id: Option<String>,
    pub status: TaskStatus,
    /// The media source path exactly as submitted; video sources are
    /// resolved to audio inside the pipeline, not here.
    pub original_audio_path: String,
    pub cos_bucket: Option<String>,
    pub cos_key: Option<String>,
    /// Remote engine task handle; set at most once per lifecycle.
    pub asr_task_id: Option<i64>,
    pub transcription_result: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Fresh `PENDING` record for a newly submitted audio path.
    pub fn new(original_audio_path: impl Into<String>, batch_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            batch_id,
            status: TaskStatus::Pending,
            original_audio_path: original_audio_path.into(),
            cos_bucket: None,
            cos_key: None,
            asr_task_id: None,
            transcription_result: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Trait for persisting transcription task lifecycle records.
///
/// Each mutation refreshes `updated_at` so that status polling observes
/// real-time progress. There is deliberately no delete: tasks double as an
/// audit trail.
pub trait TaskStore: Send + Sync + 'static {
    fn insert_task(&self, record: TaskRecord) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    fn get_task(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<Option<TaskRecord>, sqlx::Error>> + Send;

    /// Transition to a new (non-result-bearing) status.
    fn set_task_status(
        &self,
        id: &str,
        status: TaskStatus,
    ) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    /// Record where the blob landed once the upload succeeded.
    fn set_task_upload(
        &self,
        id: &str,
        bucket: &str,
        key: &str,
    ) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    /// Record the remote engine's task handle and move to `PROCESSING`.
    fn set_task_remote_id(
        &self,
        id: &str,
        asr_task_id: i64,
    ) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    /// Terminal success: `COMPLETED` + result text.
    fn complete_task(
        &self,
        id: &str,
        transcription_result: &str,
    ) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    /// Terminal failure: `FAILED` + error message.
    fn fail_task(
        &self,
        id: &str,
        error_message: &str,
    ) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    fn list_tasks_by_batch(
        &self,
        batch_id: &str,
    ) -> impl Future<Output = Result<Vec<TaskRecord>, sqlx::Error>> + Send;

    fn list_recent_tasks(
        &self,
        limit: i64,
    ) -> impl Future<Output = Result<Vec<TaskRecord>, sqlx::Error>> + Send;
}

/// A row in the `settlement_import_batches` table.
///
/// Created once per import call; the counts are finalized by a single update
/// after processing and the row is immutable thereafter.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ImportBatchRecord {
    pub id: String,
    pub filename: String,
    pub file_hash: String,
    pub row_count: i64,
    pub imported_count: i64,
    pub skipped_count: i64,
    pub error_count: i64,
    pub encoding: String,
    pub created_at: DateTime<Utc>,
}

/// A row in the `settlement_records` table.
///
/// Monetary fields are integer minor units (cents). `serial_no` is the
/// broker-assigned business identity and is absent on cash-movement rows;
/// `raw_row_hash` is the content identity and is always present.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SettlementRecord {
    pub id: String,
    pub batch_id: String,
    pub settlement_date: Option<NaiveDate>,
    pub trade_date: Option<NaiveDate>,
    pub trade_time: Option<String>,
    pub symbol: Option<String>,
    pub symbol_name: Option<String>,
    pub trade_type: Option<String>,
    pub volume: Option<i64>,
    pub price_cent: Option<i64>,
    pub amount_cent: Option<i64>,
    pub occur_amount_cent: Option<i64>,
    pub commission_cent: Option<i64>,
    pub other_fee_cent: Option<i64>,
    pub stamp_tax_cent: Option<i64>,
    pub transfer_fee_cent: Option<i64>,
    pub share_balance: Option<i64>,
    pub cash_balance_cent: Option<i64>,
    pub deal_no: Option<String>,
    pub shareholder_account: Option<String>,
    pub serial_no: Option<String>,
    pub market: Option<String>,
    pub currency: Option<String>,
    pub raw_row_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Trait for persisting settlement imports.
pub trait SettlementStore: Send + Sync + 'static {
    fn insert_import_batch(
        &self,
        batch: ImportBatchRecord,
    ) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    /// The single post-processing update that finalizes the batch counts.
    fn finalize_import_batch(
        &self,
        id: &str,
        imported_count: i64,
        skipped_count: i64,
        error_count: i64,
    ) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    fn get_import_batch(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<Option<ImportBatchRecord>, sqlx::Error>> + Send;

    fn list_import_batches(
        &self,
        limit: i64,
    ) -> impl Future<Output = Result<Vec<ImportBatchRecord>, sqlx::Error>> + Send;

    fn insert_settlement_records(
        &self,
        records: &[SettlementRecord],
    ) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    /// Which of the given serial numbers already exist in the store.
    fn existing_serials(
        &self,
        serials: &[String],
    ) -> impl Future<Output = Result<HashSet<String>, sqlx::Error>> + Send;

    /// Which of the given row hashes already exist in the store.
    fn existing_hashes(
        &self,
        hashes: &[String],
    ) -> impl Future<Output = Result<HashSet<String>, sqlx::Error>> + Send;

    fn list_settlement_records(
        &self,
        batch_id: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> impl Future<Output = Result<Vec<SettlementRecord>, sqlx::Error>> + Send;
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn status_round_trips_through_store_strings() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Uploading,
            TaskStatus::AwaitingAsr,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            let stored = status.to_string();
            assert_eq!(TaskStatus::from_str(&stored).unwrap(), status);
        }
        assert_eq!(TaskStatus::AwaitingAsr.to_string(), "AWAITING_ASR");
    }

    #[test]
    fn only_completed_and_failed_are_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
    }
}
