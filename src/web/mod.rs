//! The HTTP surface of the pipeline.
//!
//! Every route is a thin layer over the [`Orchestrator`], the catalog and the
//! [`Janitor`]: the handlers translate requests and errors, nothing more.

mod delivery;
mod error;
mod handlers;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tracing::info;

use crate::{acquire::Orchestrator, janitor::Janitor, result::Result, settings::Settings};

/// Shared by every request
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub janitor: Janitor,
    pub settings: Arc<Settings>,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator, settings: Settings) -> Self {
        Self {
            orchestrator,
            janitor: Janitor::new(settings.scratch_dir.clone()),
            settings: Arc::new(settings),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/formats", post(handlers::formats))
        .route("/api/download", post(handlers::download))
        .route("/api/download/progress", post(handlers::download_progress))
        .route("/api/files/{name}", get(handlers::file))
        .route("/api/cleanup", get(handlers::cleanup).post(handlers::cleanup))
        .with_state(state)
}

/// Serve until Ctrl-C
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutting down");
            }
        })
        .await?;

    Ok(())
}
