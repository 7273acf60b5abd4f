//! Axum router construction.
//!
//! [`build`] assembles the complete application router:
//! - Middleware layers (CORS, per-request tracing)
//! - Health route
//! - Transcription task routes under `/tasks`
//! - Settlement import routes under `/settlements`

mod health;
mod settlements;
mod tasks;

use axum::Router;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::middleware::cors;
use crate::state::AppState;

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(health::router())
        .nest("/tasks", tasks::router())
        .nest("/settlements", settlements::router())
        // Outermost layers execute first on the way in.
        .layer(ServiceBuilder::new().layer(cors::cors_layer(state.clone())))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
