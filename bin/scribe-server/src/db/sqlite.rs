//! SQLite implementation of [`TaskStore`] and [`SettlementStore`].
//!
//! Uses [`sqlx`] with the `sqlite` feature. Migrations are run automatically
//! on startup via [`SqliteStore::connect`].
//!
//! # Migrations path
//!
//! `sqlx::migrate!("./migrations")` resolves the path **at compile time**
//! relative to `CARGO_MANIFEST_DIR` (the crate root), so the directory is
//! embedded into the binary. The database file location is determined at
//! runtime by `SCRIBE_DATABASE_URL` and is **not** related to the current
//! working directory at runtime.
//!
//! # Queries
//!
//! The `sqlx::query` (runtime-verified) form is used deliberately so that no
//! `DATABASE_URL` environment variable is needed at compile time.

use std::collections::HashSet;
use std::str::FromStr;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use super::{
    ImportBatchRecord, SettlementRecord, SettlementStore, TaskRecord, TaskStatus, TaskStore,
};

const TASK_COLUMNS: &str = "id, batch_id, status, original_audio_path, cos_bucket, cos_key, \
     asr_task_id, transcription_result, error_message, created_at, updated_at";

type TaskRow = (
    String,
    Option<String>,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<i64>,
    Option<String>,
    Option<String>,
    String,
    String,
);

/// SQLite-backed store for tasks and settlement imports.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the SQLite database at `url` and run pending
    /// migrations.
    ///
    /// `url` should be a sqlx-compatible SQLite URL, e.g.
    /// `"sqlite://scribe.db"` or `"sqlite::memory:"` for tests.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // Every pooled connection to an in-memory database would see its own
        // fresh database, so that case is pinned to a single connection.
        let pool = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePool::connect_with(options).await?
        };
        // Path is resolved relative to CARGO_MANIFEST_DIR at compile time.
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }
}

fn task_from_row(row: TaskRow) -> TaskRecord {
    let (
        id,
        batch_id,
        status,
        original_audio_path,
        cos_bucket,
        cos_key,
        asr_task_id,
        transcription_result,
        error_message,
        created_at,
        updated_at,
    ) = row;
    TaskRecord {
        id,
        batch_id,
        status: TaskStatus::from_str(&status).unwrap_or_else(|_| {
            tracing::warn!(raw = %status, "unknown task status in store; treating as FAILED");
            TaskStatus::Failed
        }),
        original_audio_path,
        cos_bucket,
        cos_key,
        asr_task_id,
        transcription_result,
        error_message,
        created_at: created_at.parse().unwrap_or_else(|e: chrono::ParseError| {
            tracing::warn!(raw = %created_at, error = %e, "failed to parse task created_at; using now");
            Utc::now()
        }),
        updated_at: updated_at.parse().unwrap_or_else(|e: chrono::ParseError| {
            tracing::warn!(raw = %updated_at, error = %e, "failed to parse task updated_at; using now");
            Utc::now()
        }),
    }
}

impl TaskStore for SqliteStore {
    async fn insert_task(&self, record: TaskRecord) -> Result<(), sqlx::Error> {
        let created_at = record.created_at.to_rfc3339();
        let updated_at = record.updated_at.to_rfc3339();
        sqlx::query(
            "INSERT INTO transcription_tasks \
             (id, batch_id, status, original_audio_path, cos_bucket, cos_key, asr_task_id, \
              transcription_result, error_message, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .bind(&record.id)
        .bind(&record.batch_id)
        .bind(record.status.to_string())
        .bind(&record.original_audio_path)
        .bind(&record.cos_bucket)
        .bind(&record.cos_key)
        .bind(record.asr_task_id)
        .bind(&record.transcription_result)
        .bind(&record.error_message)
        .bind(&created_at)
        .bind(&updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<TaskRecord>, sqlx::Error> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM transcription_tasks WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(task_from_row))
    }

    async fn set_task_status(&self, id: &str, status: TaskStatus) -> Result<(), sqlx::Error> {
        let updated_at = Utc::now().to_rfc3339();
        sqlx::query("UPDATE transcription_tasks SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status.to_string())
            .bind(&updated_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_task_upload(&self, id: &str, bucket: &str, key: &str) -> Result<(), sqlx::Error> {
        let updated_at = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE transcription_tasks SET cos_bucket = ?1, cos_key = ?2, updated_at = ?3 \
             WHERE id = ?4",
        )
        .bind(bucket)
        .bind(key)
        .bind(&updated_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_task_remote_id(&self, id: &str, asr_task_id: i64) -> Result<(), sqlx::Error> {
        let updated_at = Utc::now().to_rfc3339();
        // asr_task_id is set at most once per lifecycle; the COALESCE keeps a
        // previously stored handle if a retry ever raced this update.
        sqlx::query(
            "UPDATE transcription_tasks \
             SET asr_task_id = COALESCE(asr_task_id, ?1), status = ?2, updated_at = ?3 \
             WHERE id = ?4",
        )
        .bind(asr_task_id)
        .bind(TaskStatus::Processing.to_string())
        .bind(&updated_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_task(&self, id: &str, transcription_result: &str) -> Result<(), sqlx::Error> {
        let updated_at = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE transcription_tasks \
             SET status = ?1, transcription_result = ?2, error_message = NULL, updated_at = ?3 \
             WHERE id = ?4",
        )
        .bind(TaskStatus::Completed.to_string())
        .bind(transcription_result)
        .bind(&updated_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_task(&self, id: &str, error_message: &str) -> Result<(), sqlx::Error> {
        let updated_at = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE transcription_tasks \
             SET status = ?1, error_message = ?2, updated_at = ?3 \
             WHERE id = ?4",
        )
        .bind(TaskStatus::Failed.to_string())
        .bind(error_message)
        .bind(&updated_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_tasks_by_batch(&self, batch_id: &str) -> Result<Vec<TaskRecord>, sqlx::Error> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM transcription_tasks \
             WHERE batch_id = ?1 ORDER BY original_audio_path"
        ))
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(task_from_row).collect())
    }

    async fn list_recent_tasks(&self, limit: i64) -> Result<Vec<TaskRecord>, sqlx::Error> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM transcription_tasks \
             ORDER BY created_at DESC LIMIT ?1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(task_from_row).collect())
    }
}

// ── SettlementStore ──────────────────────────────────────────────────────────

impl SettlementStore for SqliteStore {
    async fn insert_import_batch(&self, batch: ImportBatchRecord) -> Result<(), sqlx::Error> {
        let created_at = batch.created_at.to_rfc3339();
        sqlx::query(
            "INSERT INTO settlement_import_batches \
             (id, filename, file_hash, row_count, imported_count, skipped_count, error_count, \
              encoding, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&batch.id)
        .bind(&batch.filename)
        .bind(&batch.file_hash)
        .bind(batch.row_count)
        .bind(batch.imported_count)
        .bind(batch.skipped_count)
        .bind(batch.error_count)
        .bind(&batch.encoding)
        .bind(&created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finalize_import_batch(
        &self,
        id: &str,
        imported_count: i64,
        skipped_count: i64,
        error_count: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE settlement_import_batches \
             SET imported_count = ?1, skipped_count = ?2, error_count = ?3 \
             WHERE id = ?4",
        )
        .bind(imported_count)
        .bind(skipped_count)
        .bind(error_count)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_import_batch(&self, id: &str) -> Result<Option<ImportBatchRecord>, sqlx::Error> {
        sqlx::query_as(
            "SELECT id, filename, file_hash, row_count, imported_count, skipped_count, \
             error_count, encoding, created_at \
             FROM settlement_import_batches WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn list_import_batches(&self, limit: i64) -> Result<Vec<ImportBatchRecord>, sqlx::Error> {
        sqlx::query_as(
            "SELECT id, filename, file_hash, row_count, imported_count, skipped_count, \
             error_count, encoding, created_at \
             FROM settlement_import_batches ORDER BY created_at DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    async fn insert_settlement_records(
        &self,
        records: &[SettlementRecord],
    ) -> Result<(), sqlx::Error> {
        if records.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                "INSERT INTO settlement_records \
                 (id, batch_id, settlement_date, trade_date, trade_time, symbol, symbol_name, \
                  trade_type, volume, price_cent, amount_cent, occur_amount_cent, \
                  commission_cent, other_fee_cent, stamp_tax_cent, transfer_fee_cent, \
                  share_balance, cash_balance_cent, deal_no, shareholder_account, serial_no, \
                  market, currency, raw_row_hash, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, \
                         ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)",
            )
            .bind(&record.id)
            .bind(&record.batch_id)
            .bind(record.settlement_date)
            .bind(record.trade_date)
            .bind(&record.trade_time)
            .bind(&record.symbol)
            .bind(&record.symbol_name)
            .bind(&record.trade_type)
            .bind(record.volume)
            .bind(record.price_cent)
            .bind(record.amount_cent)
            .bind(record.occur_amount_cent)
            .bind(record.commission_cent)
            .bind(record.other_fee_cent)
            .bind(record.stamp_tax_cent)
            .bind(record.transfer_fee_cent)
            .bind(record.share_balance)
            .bind(record.cash_balance_cent)
            .bind(&record.deal_no)
            .bind(&record.shareholder_account)
            .bind(&record.serial_no)
            .bind(&record.market)
            .bind(&record.currency)
            .bind(&record.raw_row_hash)
            .bind(record.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn existing_serials(&self, serials: &[String]) -> Result<HashSet<String>, sqlx::Error> {
        existing_values(&self.pool, "serial_no", serials).await
    }

    async fn existing_hashes(&self, hashes: &[String]) -> Result<HashSet<String>, sqlx::Error> {
        existing_values(&self.pool, "raw_row_hash", hashes).await
    }

    async fn list_settlement_records(
        &self,
        batch_id: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SettlementRecord>, sqlx::Error> {
        const COLUMNS: &str = "id, batch_id, settlement_date, trade_date, trade_time, symbol, \
             symbol_name, trade_type, volume, price_cent, amount_cent, occur_amount_cent, \
             commission_cent, other_fee_cent, stamp_tax_cent, transfer_fee_cent, share_balance, \
             cash_balance_cent, deal_no, shareholder_account, serial_no, market, currency, \
             raw_row_hash, created_at";
        if let Some(batch_id) = batch_id {
            sqlx::query_as(&format!(
                "SELECT {COLUMNS} FROM settlement_records WHERE batch_id = ?1 \
                 ORDER BY trade_date DESC, trade_time DESC LIMIT ?2 OFFSET ?3"
            ))
            .bind(batch_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as(&format!(
                "SELECT {COLUMNS} FROM settlement_records \
                 ORDER BY trade_date DESC, trade_time DESC LIMIT ?1 OFFSET ?2"
            ))
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
        }
    }
}

/// Bind-parameter budget per query. SQLite's default limit is 999; a
/// multi-year export can carry far more rows than that, so lookups run in
/// chunks.
const IN_LIST_CHUNK: usize = 500;

/// `SELECT column ... WHERE column IN (...)` with a dynamically sized
/// placeholder list, chunked to stay under the bind-parameter limit.
async fn existing_values(
    pool: &SqlitePool,
    column: &str,
    values: &[String],
) -> Result<HashSet<String>, sqlx::Error> {
    let mut found = HashSet::new();
    for chunk in values.chunks(IN_LIST_CHUNK) {
        let placeholders = (1..=chunk.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {column} FROM settlement_records WHERE {column} IN ({placeholders})"
        );
        let mut query = sqlx::query_as::<_, (String,)>(&sql);
        for value in chunk {
            query = query.bind(value);
        }
        let rows = query.fetch_all(pool).await?;
        found.extend(rows.into_iter().map(|(v,)| v));
    }
    Ok(found)
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;

    fn record(serial_no: &str) -> SettlementRecord {
        SettlementRecord {
            id: uuid::Uuid::new_v4().to_string(),
            batch_id: "b1".to_owned(),
            settlement_date: None,
            trade_date: None,
            trade_time: None,
            symbol: None,
            symbol_name: None,
            trade_type: None,
            volume: None,
            price_cent: None,
            amount_cent: None,
            occur_amount_cent: None,
            commission_cent: None,
            other_fee_cent: None,
            stamp_tax_cent: None,
            transfer_fee_cent: None,
            share_balance: None,
            cash_balance_cent: None,
            deal_no: None,
            shareholder_account: None,
            serial_no: Some(serial_no.to_owned()),
            market: None,
            currency: None,
            raw_row_hash: format!("hash-{serial_no}"),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn serial_lookup_handles_lists_beyond_one_bind_chunk() {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
        store
            .insert_settlement_records(&[record("S0250"), record("S0750"), record("S1100")])
            .await
            .unwrap();

        // More candidates than one query's placeholder budget, with the
        // known serials spread across different chunks.
        let candidates: Vec<String> = (0..1200).map(|i| format!("S{i:04}")).collect();
        let found = store.existing_serials(&candidates).await.unwrap();
        assert_eq!(found.len(), 3);
        assert!(found.contains("S0250"));
        assert!(found.contains("S0750"));
        assert!(found.contains("S1100"));

        let none = store.existing_serials(&[]).await.unwrap();
        assert!(none.is_empty());
    }
}
