use std::{convert::Infallible, path::PathBuf, time::Duration};

use axum::{
    body::Body,
    http::header::{
        CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, X_CONTENT_TYPE_OPTIONS,
    },
    response::{
        sse::{Event, KeepAlive, Sse},
        Response,
    },
};
use bytes::Bytes;
use futures::{Stream, TryStream};
use tokio::sync::mpsc;

use crate::{
    acquire::{JobEvent, JobHandle, Ready},
    io,
    result::{err_msg, Result},
};

/// Build the response of a file attachment around its body
pub fn attachment<S>(ready: &Ready, body: S) -> Result<Response>
where
    S: TryStream + Send + 'static,
    S::Ok: Into<Bytes>,
    S::Error: Into<axum::BoxError>,
{
    let mut builder = Response::builder()
        .header(CONTENT_TYPE, ready.mime.as_str())
        .header(
            CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", ready.file_name),
        )
        .header(CACHE_CONTROL, "no-cache")
        .header(X_CONTENT_TYPE_OPTIONS, "nosniff");
    if let Some(len) = ready.content_length {
        builder = builder.header(CONTENT_LENGTH, len);
    }

    builder
        .body(Body::from_stream(body))
        .map_err(|e| err_msg(format!("Invalid response headers: {e}")))
}

/// Turn the events of a job into server-sent events.
///
/// The stream owns the job handle: the job is cancelled when the client goes
/// away, and the stream ends with the job.
pub fn event_stream(
    events: mpsc::UnboundedReceiver<JobEvent>,
    handle: JobHandle,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let stream = futures::stream::unfold((events, handle), |(mut events, handle)| async move {
        let event = events.recv().await?;
        Some((Ok(to_sse(&event)), (events, handle)))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn to_sse(event: &JobEvent) -> Event {
    Event::default()
        .event(event.name())
        .json_data(event)
        .unwrap_or_else(|err| Event::default().event("error").data(err.to_string()))
}

/// Schedules the deletion of a served file once the transfer is over
#[derive(Debug)]
pub struct DeleteOnDrop {
    path: PathBuf,
    delay: Duration,
}

impl DeleteOnDrop {
    pub fn new(path: PathBuf, delay: Duration) -> Self {
        Self { path, delay }
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        // Outside of a runtime the janitor gets it
        if tokio::runtime::Handle::try_current().is_ok() {
            io::schedule_delete(std::mem::take(&mut self.path), self.delay);
        }
    }
}
