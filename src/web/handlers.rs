use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    response::{
        sse::{Event, Sse},
        Response,
    },
    Json,
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tracing::info;

use super::{
    delivery::{self, DeleteOnDrop},
    error::JsonBody,
    AppState,
};
use crate::{
    acquire::{AcquisitionRequest, Delivery, DeliveryMode, Ready},
    catalog::{self, Catalog},
    io,
    janitor::SweepReport,
    result::{Error, Result},
    types::Extension,
};

#[derive(Debug, Deserialize)]
pub struct FormatsRequest {
    #[serde(default)]
    url: String,
}

/// `POST /api/formats`
pub async fn formats(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<FormatsRequest>,
) -> Result<Json<Catalog>> {
    let url = request.url.trim();
    if url.is_empty() {
        return Err(Error::InvalidRequest("missing url".to_owned()));
    }

    let settings = &state.settings;
    let catalog = catalog::resolve(
        state.orchestrator.extractor(),
        url,
        settings.timeouts.catalog(),
        state.orchestrator.phrases(),
        settings.min_height,
    )
    .await?;

    info!(
        "{} variants for \"{}\"",
        catalog.variants.len(),
        catalog.metadata.title
    );
    Ok(Json(catalog))
}

/// `POST /api/download`, the bytes of the chosen variant as an attachment
pub async fn download(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<AcquisitionRequest>,
) -> Result<Response> {
    let mut handle = state
        .orchestrator
        .launch(request, Delivery::Attachment, None)?;
    // Dropping this future before it resolves cancels the job
    let ready = handle.ready().await?;
    delivery::attachment(&ready, handle.into_body())
}

/// `POST /api/download/progress`, the job events as server-sent events
pub async fn download_progress(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<AcquisitionRequest>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = state
        .orchestrator
        .launch(request, Delivery::Publish, Some(tx))?;
    Ok(delivery::event_stream(rx, handle))
}

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    title: Option<String>,
}

/// `GET /api/files/{name}`, the follow-up transfer of a published file
pub async fn file(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<FileQuery>,
) -> Result<Response> {
    let path = io::served_file(&state.settings.scratch_dir, &name)?;
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::FileNotFound(name));
        }
        Err(err) => return Err(err.into()),
    };
    let size = file.metadata().await?.len();

    let ext = Extension::from_path(&path).unwrap_or_else(|| state.settings.container());
    let ready = Ready {
        mode: DeliveryMode::TempFile,
        content_length: Some(size),
        file_name: io::attachment_name(query.title.as_deref(), ext),
        mime: ext.mime_type(),
    };

    let guard = DeleteOnDrop::new(path, state.settings.delete_delay());
    let body = ReaderStream::new(file).map(move |chunk| {
        let _transfer = &guard;
        chunk
    });
    delivery::attachment(&ready, body)
}

/// `POST|GET /api/cleanup`
pub async fn cleanup(State(state): State<AppState>) -> Json<SweepReport> {
    let report = state
        .janitor
        .sweep(state.settings.stale_retention())
        .await;
    Json(report)
}
