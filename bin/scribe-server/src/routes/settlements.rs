//! Settlement import endpoints.

use std::sync::Arc;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::info;

use crate::db::{ImportBatchRecord, SettlementRecord, SettlementStore};
use crate::error::ServerError;
use crate::services::settlement_import::{self, ImportError};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/import", post(import_file))
        .route("/batches", get(list_batches))
        .route("/batches/{id}", get(get_batch))
        .route("/records", get(list_records))
}

#[derive(Deserialize)]
pub struct BatchListQuery {
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct RecordListQuery {
    pub batch_id: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Accept one CSV file as the multipart field `file` and import it.
pub async fn import_file(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<ImportBatchRecord>), ServerError> {
    let mut upload: Option<(String, Vec<u8>)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::BadRequest(format!("malformed multipart body: {e}")))?
    {
        if field.name() == Some("file") {
            let filename = field
                .file_name()
                .ok_or_else(|| ServerError::BadRequest("missing filename".to_owned()))?
                .to_owned();
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ServerError::BadRequest(format!("failed to read upload: {e}")))?;
            upload = Some((filename, bytes.to_vec()));
            break;
        }
    }
    let (filename, bytes) =
        upload.ok_or_else(|| ServerError::BadRequest("missing multipart field 'file'".to_owned()))?;

    if !filename.to_ascii_lowercase().ends_with(".csv") {
        return Err(ServerError::BadRequest(
            "only .csv files are supported".to_owned(),
        ));
    }
    if bytes.is_empty() {
        return Err(ServerError::BadRequest("uploaded file is empty".to_owned()));
    }

    info!(filename, size = bytes.len(), "settlement import received");
    let batch = settlement_import::import_settlement_csv(state.store.as_ref(), &bytes, &filename)
        .await
        .map_err(|e| match e {
            ImportError::Empty | ImportError::HeaderMismatch | ImportError::Malformed(_) => {
                ServerError::BadRequest(e.to_string())
            }
            ImportError::Database(e) => ServerError::Database(e),
        })?;
    Ok((StatusCode::CREATED, Json(batch)))
}

pub async fn list_batches(
    State(state): State<Arc<AppState>>,
    Query(q): Query<BatchListQuery>,
) -> Result<Json<Vec<ImportBatchRecord>>, ServerError> {
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    Ok(Json(state.store.list_import_batches(limit).await?))
}

pub async fn get_batch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ImportBatchRecord>, ServerError> {
    let batch = state
        .store
        .get_import_batch(&id)
        .await?
        .ok_or_else(|| ServerError::NotFound(format!("import batch {id} not found")))?;
    Ok(Json(batch))
}

pub async fn list_records(
    State(state): State<Arc<AppState>>,
    Query(q): Query<RecordListQuery>,
) -> Result<Json<Vec<SettlementRecord>>, ServerError> {
    let limit = q.limit.unwrap_or(100).clamp(1, 1000);
    let offset = q.offset.unwrap_or(0).max(0);
    let records = state
        .store
        .list_settlement_records(q.batch_id.as_deref(), limit, offset)
        .await?;
    Ok(Json(records))
}
