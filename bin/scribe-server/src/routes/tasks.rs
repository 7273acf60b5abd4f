//! Transcription task endpoints.
//!
//! Submission handlers follow an insert-then-spawn pattern: the task row is
//! persisted first, then the pipeline run is detached onto the runtime and
//! the handler answers 202 immediately. Progress is observed by polling
//! `GET /tasks/{id}` or the batch results endpoint.

use std::path::Path as FsPath;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::db::{TaskRecord, TaskStore};
use crate::error::ServerError;
use crate::services::asr::AsrTaskParams;
use crate::services::media;
use crate::services::transcription::{self, BatchResults};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/audio-transcription", post(create_task))
        .route("/batch-audio-transcription", post(create_batch_from_directory))
        .route("/batch-files", post(create_batch_from_files))
        .route("/recent", get(list_recent_tasks))
        .route("/{id}", get(get_task))
        .route("/batch/{batch_id}/results", get(get_batch_results))
}

/// Engine parameter overrides accepted on every submission endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct AsrParamsRequest {
    pub engine_model_type: Option<String>,
    pub channel_num: Option<i64>,
    pub res_text_format: Option<i64>,
}

impl AsrParamsRequest {
    fn into_params(self) -> AsrTaskParams {
        let defaults = AsrTaskParams::default();
        AsrTaskParams {
            engine_model_type: self.engine_model_type.unwrap_or(defaults.engine_model_type),
            channel_num: self.channel_num.unwrap_or(defaults.channel_num),
            res_text_format: self.res_text_format.unwrap_or(defaults.res_text_format),
        }
    }
}

#[derive(Deserialize)]
pub struct CreateTaskRequest {
    /// Absolute path of the media file on the server.
    pub local_audio_path: String,
    #[serde(flatten)]
    pub params: AsrParamsRequest,
}

#[derive(Deserialize)]
pub struct BatchDirectoryRequest {
    /// Absolute path of a directory to scan for media files.
    pub directory_path: String,
    /// Optional extension filter, e.g. `"wav"`; all supported media
    /// otherwise.
    pub file_extension: Option<String>,
    #[serde(flatten)]
    pub params: AsrParamsRequest,
}

#[derive(Deserialize)]
pub struct BatchFilesRequest {
    pub file_paths: Vec<String>,
    #[serde(flatten)]
    pub params: AsrParamsRequest,
}

#[derive(Deserialize)]
pub struct RecentQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub id: String,
    pub batch_id: Option<String>,
    pub status: String,
    pub original_audio_path: String,
    pub cos_bucket: Option<String>,
    pub cos_key: Option<String>,
    pub asr_task_id: Option<i64>,
    pub transcription_result: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

fn to_response(r: TaskRecord) -> TaskResponse {
    TaskResponse {
        id: r.id,
        batch_id: r.batch_id,
        status: r.status.to_string(),
        original_audio_path: r.original_audio_path,
        cos_bucket: r.cos_bucket,
        cos_key: r.cos_key,
        asr_task_id: r.asr_task_id,
        transcription_result: r.transcription_result,
        error_message: r.error_message,
        created_at: r.created_at.to_rfc3339(),
        updated_at: r.updated_at.to_rfc3339(),
    }
}

pub async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<TaskResponse>), ServerError> {
    let path = FsPath::new(&request.local_audio_path);
    if !path.is_file() {
        return Err(ServerError::BadRequest(format!(
            "file not found: {}",
            request.local_audio_path
        )));
    }
    if !media::is_supported(path) {
        return Err(ServerError::BadRequest(format!(
            "unsupported media extension: {}",
            request.local_audio_path
        )));
    }

    let task = TaskRecord::new(request.local_audio_path, None);
    state.store.insert_task(task.clone()).await?;
    info!(task_id = %task.id, path = %task.original_audio_path, "transcription task accepted");

    let engine = state.engine.clone();
    let params = request.params.into_params();
    let response = to_response(task.clone());
    tokio::spawn(async move { engine.run_task(task, params).await });

    Ok((StatusCode::ACCEPTED, Json(response)))
}

#[derive(Debug, Serialize)]
pub struct BatchCreatedResponse {
    pub batch_id: String,
    pub task_count: usize,
    pub tasks: Vec<TaskResponse>,
}

pub async fn create_batch_from_directory(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BatchDirectoryRequest>,
) -> Result<(StatusCode, Json<BatchCreatedResponse>), ServerError> {
    let dir = FsPath::new(&request.directory_path);
    if !dir.is_dir() {
        return Err(ServerError::NotFound(format!(
            "directory not found: {}",
            request.directory_path
        )));
    }

    let extension_filter = request
        .file_extension
        .as_deref()
        .map(str::to_ascii_lowercase);
    let mut paths: Vec<String> = std::fs::read_dir(dir)
        .map_err(|e| ServerError::Internal(format!("failed to read directory: {e}")))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.is_file() && media::is_supported(p))
        .filter(|p| match &extension_filter {
            Some(ext) => p
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(ext)),
            None => true,
        })
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    // Deterministic task order regardless of directory iteration order.
    paths.sort();

    if paths.is_empty() {
        warn!(directory = %request.directory_path, "no matching media files in directory");
        return Err(ServerError::BadRequest(format!(
            "no matching media files in directory: {}",
            request.directory_path
        )));
    }
    spawn_batch(&state, paths, request.params.into_params()).await
}

pub async fn create_batch_from_files(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BatchFilesRequest>,
) -> Result<(StatusCode, Json<BatchCreatedResponse>), ServerError> {
    if request.file_paths.is_empty() {
        return Err(ServerError::BadRequest("file_paths is empty".to_owned()));
    }
    // Per-item problems (missing file, bad extension) surface as FAILED
    // tasks from the pipeline rather than rejecting the whole batch.
    spawn_batch(&state, request.file_paths, request.params.into_params()).await
}

async fn spawn_batch(
    state: &Arc<AppState>,
    paths: Vec<String>,
    params: AsrTaskParams,
) -> Result<(StatusCode, Json<BatchCreatedResponse>), ServerError> {
    let batch_id = uuid::Uuid::new_v4().to_string();
    let mut tasks = Vec::with_capacity(paths.len());
    for path in paths {
        let task = TaskRecord::new(path, Some(batch_id.clone()));
        state.store.insert_task(task.clone()).await?;
        tasks.push(task);
    }
    info!(batch_id, task_count = tasks.len(), "transcription batch accepted");

    let responses: Vec<TaskResponse> = tasks.iter().cloned().map(to_response).collect();
    let engine = state.engine.clone();
    tokio::spawn(async move { engine.run_batch(tasks, params).await });

    Ok((
        StatusCode::ACCEPTED,
        Json(BatchCreatedResponse {
            task_count: responses.len(),
            batch_id,
            tasks: responses,
        }),
    ))
}

pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskResponse>, ServerError> {
    let record = state
        .store
        .get_task(&id)
        .await?
        .ok_or_else(|| ServerError::NotFound(format!("task {id} not found")))?;
    Ok(Json(to_response(record)))
}

pub async fn list_recent_tasks(
    State(state): State<Arc<AppState>>,
    Query(q): Query<RecentQuery>,
) -> Result<Json<Vec<TaskResponse>>, ServerError> {
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    let records = state.store.list_recent_tasks(limit).await?;
    Ok(Json(records.into_iter().map(to_response).collect()))
}

pub async fn get_batch_results(
    State(state): State<Arc<AppState>>,
    Path(batch_id): Path<String>,
) -> Result<Json<BatchResults>, ServerError> {
    let results = transcription::batch_results(state.store.as_ref(), &batch_id)
        .await?
        .ok_or_else(|| ServerError::NotFound(format!("batch {batch_id} not found")))?;
    Ok(Json(results))
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;
    use crate::db::sqlite::SqliteStore;
    use crate::services::asr::{AsrError, RemoteTaskState, SpeechRecognizer};
    use crate::services::cos::{ObjectStorage, StorageError};
    use async_trait::async_trait;
    use std::time::Duration;

    struct NullStorage;

    #[async_trait]
    impl ObjectStorage for NullStorage {
        fn bucket(&self) -> &str {
            "test"
        }
        async fn upload(&self, _: &FsPath, _: &str) -> Result<(), StorageError> {
            Ok(())
        }
        async fn presign_download(&self, key: &str, _: Duration) -> Result<String, StorageError> {
            Ok(format!("https://test.example/{key}"))
        }
    }

    struct NullRecognizer;

    #[async_trait]
    impl SpeechRecognizer for NullRecognizer {
        async fn create_task(&self, _: &AsrTaskParams, _: &str) -> Result<i64, AsrError> {
            Ok(1)
        }
        async fn poll_status(&self, _: i64) -> Result<RemoteTaskState, AsrError> {
            Ok(RemoteTaskState::Success {
                result: String::new(),
            })
        }
    }

    async fn test_state() -> Arc<AppState> {
        let store = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        Arc::new(AppState::new(
            Config::from_env(),
            store,
            Arc::new(NullStorage),
            Arc::new(NullRecognizer),
        ))
    }

    #[tokio::test]
    async fn single_submission_rejects_missing_file() {
        let state = test_state().await;
        let err = create_task(
            State(state),
            Json(CreateTaskRequest {
                local_audio_path: "/no/such/clip.wav".to_owned(),
                params: AsrParamsRequest::default(),
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServerError::BadRequest(_)));
    }

    #[tokio::test]
    async fn single_submission_rejects_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let notes = dir.path().join("notes.txt");
        std::fs::write(&notes, b"hello").unwrap();

        let state = test_state().await;
        let err = create_task(
            State(state),
            Json(CreateTaskRequest {
                local_audio_path: notes.to_string_lossy().into_owned(),
                params: AsrParamsRequest::default(),
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServerError::BadRequest(_)));
    }

    #[tokio::test]
    async fn directory_scan_without_matches_is_an_error_not_an_empty_batch() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("readme.md"), b"no media here").unwrap();

        let state = test_state().await;
        let err = create_batch_from_directory(
            State(Arc::clone(&state)),
            Json(BatchDirectoryRequest {
                directory_path: dir.path().to_string_lossy().into_owned(),
                file_extension: None,
                params: AsrParamsRequest::default(),
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServerError::BadRequest(_)));
        assert!(state.store.list_recent_tasks(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_directory_is_not_found() {
        let state = test_state().await;
        let err = create_batch_from_directory(
            State(state),
            Json(BatchDirectoryRequest {
                directory_path: "/no/such/dir".to_owned(),
                file_extension: None,
                params: AsrParamsRequest::default(),
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServerError::NotFound(_)));
    }

    #[tokio::test]
    async fn unknown_task_id_is_not_found() {
        let state = test_state().await;
        let err = get_task(State(state), Path("nope".to_owned()))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::NotFound(_)));
    }

    #[tokio::test]
    async fn file_list_submission_creates_one_task_per_path_under_one_batch() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.wav");
        let b = dir.path().join("b.mp3");
        std::fs::write(&a, b"riff").unwrap();
        std::fs::write(&b, b"id3").unwrap();

        let state = test_state().await;
        let (status, Json(created)) = create_batch_from_files(
            State(Arc::clone(&state)),
            Json(BatchFilesRequest {
                file_paths: vec![
                    a.to_string_lossy().into_owned(),
                    b.to_string_lossy().into_owned(),
                ],
                params: AsrParamsRequest::default(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(created.task_count, 2);
        assert!(created
            .tasks
            .iter()
            .all(|t| t.batch_id.as_deref() == Some(created.batch_id.as_str())));
    }
}
