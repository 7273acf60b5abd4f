//! Shared application state injected into every Axum handler.
//!
//! Remote collaborators live behind their traits so tests can swap the
//! Tencent clients for fakes without touching handler code.

use std::sync::Arc;

use crate::config::Config;
use crate::db::sqlite::SqliteStore;
use crate::services::asr::SpeechRecognizer;
use crate::services::cos::ObjectStorage;
use crate::services::transcription::PipelineEngine;

/// State shared across all HTTP handlers and the background pipeline runs.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// Persistent task and settlement store.
    pub store: Arc<SqliteStore>,
    /// Pipeline orchestrator, cloned into spawned runs.
    pub engine: PipelineEngine<SqliteStore>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<SqliteStore>,
        storage: Arc<dyn ObjectStorage>,
        recognizer: Arc<dyn SpeechRecognizer>,
    ) -> Self {
        let engine = PipelineEngine::new(&config, Arc::clone(&store), storage, recognizer);
        Self {
            config: Arc::new(config),
            store,
            engine,
        }
    }
}
