//! The transcription pipeline engine.
//!
//! One task runs the staged lifecycle
//! `PENDING → UPLOADING → AWAITING_ASR → PROCESSING → COMPLETED | FAILED`,
//! persisting every transition so a crash or restart leaves an honest
//! record behind. A batch is a fan-out of independent task runs: one
//! item failing never disturbs its siblings.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use futures::future::join_all;
use serde::Serialize;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::{TaskRecord, TaskStatus, TaskStore};
use crate::services::asr::{AsrTaskParams, RemoteTaskState, SpeechRecognizer};
use crate::services::cos::ObjectStorage;
use crate::services::media;

/// Orchestrates the full lifecycle of transcription tasks against a store
/// and the remote collaborators.
pub struct PipelineEngine<S> {
    store: Arc<S>,
    storage: Arc<dyn ObjectStorage>,
    recognizer: Arc<dyn SpeechRecognizer>,
    ffmpeg_path: String,
    presign_ttl: Duration,
    poll_timeout: Duration,
    poll_interval: Duration,
}

// Arc fields clone cheaply; the engine itself is cloned into spawned runs.
impl<S> Clone for PipelineEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            storage: Arc::clone(&self.storage),
            recognizer: Arc::clone(&self.recognizer),
            ffmpeg_path: self.ffmpeg_path.clone(),
            presign_ttl: self.presign_ttl,
            poll_timeout: self.poll_timeout,
            poll_interval: self.poll_interval,
        }
    }
}

impl<S: TaskStore> PipelineEngine<S> {
    pub fn new(
        config: &Config,
        store: Arc<S>,
        storage: Arc<dyn ObjectStorage>,
        recognizer: Arc<dyn SpeechRecognizer>,
    ) -> Self {
        Self {
            store,
            storage,
            recognizer,
            ffmpeg_path: config.ffmpeg_path.clone(),
            presign_ttl: config.presign_ttl,
            poll_timeout: config.asr_poll_timeout,
            poll_interval: config.asr_poll_interval,
        }
    }

    /// Drive one already-inserted task to a terminal state.
    ///
    /// This is the error boundary of the pipeline: any failure inside the
    /// staged run is caught here and recorded as a `FAILED` transition, so
    /// exactly one terminal transition happens per run.
    pub async fn run_task(&self, task: TaskRecord, params: AsrTaskParams) {
        let task_id = task.id.clone();
        match self.run_stages(&task, &params).await {
            Ok(result) => {
                if let Err(e) = self.store.complete_task(&task_id, &result).await {
                    error!(task_id, error = %e, "failed to persist completed task");
                } else {
                    info!(task_id, "transcription completed");
                }
            }
            Err(e) => {
                let message = format!("{e:#}");
                warn!(task_id, error = %message, "transcription failed");
                if let Err(e) = self.store.fail_task(&task_id, &message).await {
                    error!(task_id, error = %e, "failed to persist failed task");
                }
            }
        }
    }

    /// Run every task of a batch concurrently and wait for all of them.
    pub async fn run_batch(&self, tasks: Vec<TaskRecord>, params: AsrTaskParams) {
        let runs = tasks
            .into_iter()
            .map(|task| self.run_task(task, params.clone()));
        join_all(runs).await;
    }

    async fn run_stages(
        &self,
        task: &TaskRecord,
        params: &AsrTaskParams,
    ) -> Result<String, anyhow::Error> {
        self.store
            .set_task_status(&task.id, TaskStatus::Uploading)
            .await?;

        let audio_path =
            media::resolve_audio_path(&self.ffmpeg_path, Path::new(&task.original_audio_path))
                .await
                .context("media resolution")?;

        let key = object_key(&task.id, &audio_path);
        self.storage
            .upload(&audio_path, &key)
            .await
            .context("cos upload")?;
        self.store
            .set_task_upload(&task.id, self.storage.bucket(), &key)
            .await?;
        self.store
            .set_task_status(&task.id, TaskStatus::AwaitingAsr)
            .await?;

        let source_url = self
            .storage
            .presign_download(&key, self.presign_ttl)
            .await
            .context("presign download url")?;
        let remote_id = self
            .recognizer
            .create_task(params, &source_url)
            .await
            .context("create recognition task")?;
        self.store.set_task_remote_id(&task.id, remote_id).await?;

        self.await_remote_result(&task.id, remote_id).await
    }

    /// Poll the remote engine until it reaches a terminal state or the
    /// configured deadline passes.
    async fn await_remote_result(
        &self,
        task_id: &str,
        remote_id: i64,
    ) -> Result<String, anyhow::Error> {
        let deadline = Instant::now() + self.poll_timeout;
        loop {
            match self.recognizer.poll_status(remote_id).await? {
                RemoteTaskState::Success { result } => return Ok(result),
                RemoteTaskState::Failed { error } => {
                    return Err(anyhow!("remote recognition failed: {error}"));
                }
                RemoteTaskState::Pending | RemoteTaskState::Processing => {}
            }
            if Instant::now() >= deadline {
                return Err(anyhow!(
                    "recognition timed out after {}s",
                    self.poll_timeout.as_secs()
                ));
            }
            tracing::debug!(task_id, remote_id, "remote task still running");
            sleep(self.poll_interval).await;
        }
    }
}

/// Object key for a task's uploaded audio: namespaced by task id so retries
/// and same-named files never collide.
fn object_key(task_id: &str, audio_path: &Path) -> String {
    let file_name = audio_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "audio".to_owned());
    format!("transcriptions/{task_id}/{file_name}")
}

/// Aggregated view over all tasks of one batch.
///
/// `status` is `COMPLETED` only once every task has completed; until then it
/// stays `PROCESSING` with counts and a progress message, even when some
/// tasks have already failed.
#[derive(Debug, Serialize)]
pub struct BatchResults {
    pub batch_id: String,
    pub status: TaskStatus,
    pub total_count: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    /// Transcription texts in task order; present only once the whole batch
    /// is completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub tasks: Vec<BatchTaskResult>,
}

/// One task's contribution to a batch summary.
#[derive(Debug, Serialize)]
pub struct BatchTaskResult {
    pub task_id: String,
    pub original_audio_path: String,
    pub status: TaskStatus,
    pub transcription_result: Option<String>,
    pub error_message: Option<String>,
}

/// Collect the results of a batch, ordered by source path.
///
/// Returns `None` when no task carries the batch id.
pub async fn batch_results<S: TaskStore>(
    store: &S,
    batch_id: &str,
) -> Result<Option<BatchResults>, sqlx::Error> {
    let tasks = store.list_tasks_by_batch(batch_id).await?;
    if tasks.is_empty() {
        return Ok(None);
    }

    let mut completed_count = 0;
    let mut failed_count = 0;
    let task_results: Vec<BatchTaskResult> = tasks
        .into_iter()
        .map(|t| {
            match t.status {
                TaskStatus::Completed => completed_count += 1,
                TaskStatus::Failed => failed_count += 1,
                status => debug_assert!(!status.is_terminal()),
            }
            BatchTaskResult {
                task_id: t.id,
                original_audio_path: t.original_audio_path,
                status: t.status,
                transcription_result: t.transcription_result,
                error_message: t.error_message,
            }
        })
        .collect();

    let total_count = task_results.len();
    let all_completed = completed_count == total_count;
    let (status, results, message) = if all_completed {
        let texts = task_results
            .iter()
            .filter_map(|t| t.transcription_result.clone())
            .collect();
        (TaskStatus::Completed, Some(texts), None)
    } else {
        let mut progress = format!("{completed_count}/{total_count} tasks completed");
        if failed_count > 0 {
            let _ = write!(progress, ", {failed_count} failed");
        }
        (TaskStatus::Processing, None, Some(progress))
    };

    Ok(Some(BatchResults {
        batch_id: batch_id.to_owned(),
        status,
        total_count,
        completed_count,
        failed_count,
        results,
        message,
        tasks: task_results,
    }))
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::sqlite::SqliteStore;
    use crate::services::asr::AsrError;
    use crate::services::cos::StorageError;
    use async_trait::async_trait;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeStorage {
        fail_upload: bool,
    }

    #[async_trait]
    impl ObjectStorage for FakeStorage {
        fn bucket(&self) -> &str {
            "test-bucket"
        }

        async fn upload(&self, _local_path: &Path, _key: &str) -> Result<(), StorageError> {
            if self.fail_upload {
                Err(StorageError::UploadFailed {
                    attempts: 1,
                    message: "simulated outage".to_owned(),
                })
            } else {
                Ok(())
            }
        }

        async fn presign_download(
            &self,
            key: &str,
            _ttl: Duration,
        ) -> Result<String, StorageError> {
            Ok(format!("https://test-bucket.example/{key}"))
        }
    }

    /// Recognizer that reports `Processing` a fixed number of times before
    /// settling on a terminal state.
    struct FakeRecognizer {
        polls_until_done: usize,
        polls_seen: AtomicUsize,
        outcome: RemoteTaskState,
    }

    impl FakeRecognizer {
        fn succeeding_after(polls: usize, result: &str) -> Self {
            Self {
                polls_until_done: polls,
                polls_seen: AtomicUsize::new(0),
                outcome: RemoteTaskState::Success {
                    result: result.to_owned(),
                },
            }
        }

        fn failing(message: &str) -> Self {
            Self {
                polls_until_done: 0,
                polls_seen: AtomicUsize::new(0),
                outcome: RemoteTaskState::Failed {
                    error: message.to_owned(),
                },
            }
        }
    }

    #[async_trait]
    impl SpeechRecognizer for FakeRecognizer {
        async fn create_task(
            &self,
            _params: &AsrTaskParams,
            _source_url: &str,
        ) -> Result<i64, AsrError> {
            Ok(42)
        }

        async fn poll_status(&self, _remote_task_id: i64) -> Result<RemoteTaskState, AsrError> {
            let seen = self.polls_seen.fetch_add(1, Ordering::SeqCst);
            if seen < self.polls_until_done {
                Ok(RemoteTaskState::Processing)
            } else {
                Ok(self.outcome.clone())
            }
        }
    }

    fn test_config() -> Config {
        let mut config = Config::from_env();
        config.asr_poll_timeout = Duration::from_secs(5);
        config.asr_poll_interval = Duration::from_millis(1);
        config
    }

    fn engine(
        store: Arc<SqliteStore>,
        storage: FakeStorage,
        recognizer: FakeRecognizer,
    ) -> PipelineEngine<SqliteStore> {
        PipelineEngine::new(
            &test_config(),
            store,
            Arc::new(storage),
            Arc::new(recognizer),
        )
    }

    fn temp_audio(dir: &tempfile::TempDir, name: &str) -> String {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"riff").unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn successful_run_lands_in_completed_with_result() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        let task = TaskRecord::new(temp_audio(&dir, "call.wav"), None);
        store.insert_task(task.clone()).await.unwrap();

        let engine = engine(
            Arc::clone(&store),
            FakeStorage { fail_upload: false },
            FakeRecognizer::succeeding_after(2, "hello world"),
        );
        engine.run_task(task.clone(), AsrTaskParams::default()).await;

        let stored = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.transcription_result.as_deref(), Some("hello world"));
        assert_eq!(stored.asr_task_id, Some(42));
        assert_eq!(stored.cos_bucket.as_deref(), Some("test-bucket"));
        assert!(stored
            .cos_key
            .as_deref()
            .unwrap()
            .ends_with("/call.wav"));
        assert!(stored.error_message.is_none());
    }

    #[tokio::test]
    async fn upload_failure_lands_in_failed_with_message() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        let task = TaskRecord::new(temp_audio(&dir, "call.mp3"), None);
        store.insert_task(task.clone()).await.unwrap();

        let engine = engine(
            Arc::clone(&store),
            FakeStorage { fail_upload: true },
            FakeRecognizer::succeeding_after(0, "unused"),
        );
        engine.run_task(task.clone(), AsrTaskParams::default()).await;

        let stored = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(stored
            .error_message
            .as_deref()
            .unwrap()
            .contains("simulated outage"));
        assert!(stored.transcription_result.is_none());
    }

    #[tokio::test]
    async fn missing_source_file_fails_without_reaching_upload() {
        let store = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        let task = TaskRecord::new("/no/such/file.wav", None);
        store.insert_task(task.clone()).await.unwrap();

        let engine = engine(
            Arc::clone(&store),
            FakeStorage { fail_upload: false },
            FakeRecognizer::succeeding_after(0, "unused"),
        );
        engine.run_task(task.clone(), AsrTaskParams::default()).await;

        let stored = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(stored.cos_key.is_none());
    }

    #[tokio::test]
    async fn remote_failure_message_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        let task = TaskRecord::new(temp_audio(&dir, "call.flac"), None);
        store.insert_task(task.clone()).await.unwrap();

        let engine = engine(
            Arc::clone(&store),
            FakeStorage { fail_upload: false },
            FakeRecognizer::failing("audio too noisy"),
        );
        engine.run_task(task.clone(), AsrTaskParams::default()).await;

        let stored = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(stored
            .error_message
            .as_deref()
            .unwrap()
            .contains("audio too noisy"));
    }

    #[tokio::test]
    async fn poll_timeout_fails_the_task() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        let task = TaskRecord::new(temp_audio(&dir, "long.wav"), None);
        store.insert_task(task.clone()).await.unwrap();

        let mut config = test_config();
        config.asr_poll_timeout = Duration::from_millis(5);
        let engine = PipelineEngine::new(
            &config,
            Arc::clone(&store),
            Arc::new(FakeStorage { fail_upload: false }),
            // Never leaves Processing within the timeout.
            Arc::new(FakeRecognizer::succeeding_after(usize::MAX, "unused")),
        );
        engine.run_task(task.clone(), AsrTaskParams::default()).await;

        let stored = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(stored
            .error_message
            .as_deref()
            .unwrap()
            .contains("timed out"));
    }

    #[tokio::test]
    async fn batch_runs_isolate_failures_and_summarize_in_path_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        let batch_id = uuid::Uuid::new_v4().to_string();

        let good = TaskRecord::new(temp_audio(&dir, "a_good.wav"), Some(batch_id.clone()));
        let bad = TaskRecord::new("/no/such/b_bad.wav", Some(batch_id.clone()));
        store.insert_task(good.clone()).await.unwrap();
        store.insert_task(bad.clone()).await.unwrap();

        let engine = engine(
            Arc::clone(&store),
            FakeStorage { fail_upload: false },
            FakeRecognizer::succeeding_after(1, "text"),
        );
        engine
            .run_batch(vec![good, bad], AsrTaskParams::default())
            .await;

        let summary = batch_results(store.as_ref(), &batch_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.total_count, 2);
        assert_eq!(summary.completed_count, 1);
        assert_eq!(summary.failed_count, 1);
        // A failed sibling keeps the aggregate out of COMPLETED.
        assert_eq!(summary.status, TaskStatus::Processing);
        assert!(summary.results.is_none());
        assert_eq!(summary.message.as_deref(), Some("1/2 tasks completed, 1 failed"));
        // Lexicographic path order.
        assert!(summary.tasks[0].original_audio_path < summary.tasks[1].original_audio_path);
    }

    #[tokio::test]
    async fn completed_batch_returns_results_in_path_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        let batch_id = uuid::Uuid::new_v4().to_string();

        // Insert in reverse order so the ordering is clearly the store's.
        let second = TaskRecord::new(temp_audio(&dir, "b.wav"), Some(batch_id.clone()));
        let first = TaskRecord::new(temp_audio(&dir, "a.wav"), Some(batch_id.clone()));
        store.insert_task(second.clone()).await.unwrap();
        store.insert_task(first.clone()).await.unwrap();
        store.complete_task(&second.id, "result for b").await.unwrap();
        store.complete_task(&first.id, "result for a").await.unwrap();

        let summary = batch_results(store.as_ref(), &batch_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.status, TaskStatus::Completed);
        assert_eq!(summary.completed_count, 2);
        assert_eq!(summary.total_count, 2);
        assert_eq!(
            summary.results,
            Some(vec!["result for a".to_owned(), "result for b".to_owned()])
        );
    }

    #[tokio::test]
    async fn unknown_batch_id_yields_none() {
        let store = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        assert!(batch_results(store.as_ref(), "nope").await.unwrap().is_none());
    }
}
