use std::{
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::Stream;
use serde::Serialize;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::{mpsc, oneshot, watch},
};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, trace};

use crate::{
    classify::DiagnosticTail,
    result::{err_msg, Error, Result},
    telemetry::{
        merge_percent, Fact, LineDecoder, LineSplitter, Marker, ProgressFact, SizeEstimate,
    },
    types::Stage,
    utils::MutexUtils,
};

/// How the bytes of a job reach the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// The extractor standard output is relayed as it comes
    DirectStream,
    /// The extractor writes to the scratch directory, the file is sent once complete
    TempFile,
}

/// What the caller wants out of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The bytes, as a response body
    Attachment,
    /// A file kept in the scratch directory and announced by a
    /// [`JobEvent::FileReady`], for a follow-up transfer
    Publish,
}

/// Sent once per job, before the first byte of the body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ready {
    pub mode: DeliveryMode,
    /// Only set from a byte-exact size
    pub content_length: Option<u64>,
    pub file_name: String,
    pub mime: String,
}

/// Everything a job reports while it runs, in the order it happened
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Progress(ProgressFact),
    Stage {
        stage: Stage,
        message: String,
    },
    FileReady {
        /// Where the follow-up transfer fetches the file
        path: String,
        #[serde(rename = "fileName")]
        file_name: String,
        size: u64,
    },
    Error {
        kind: &'static str,
        message: String,
    },
}

impl JobEvent {
    /// Name of the event on a server-sent event stream
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Progress(_) => "progress",
            JobEvent::Stage { .. } => "stage",
            JobEvent::FileReady { .. } => "file_ready",
            JobEvent::Error { .. } => "error",
        }
    }
}

/// What is known of a job, shared with the tasks reading its subprocesses
#[derive(Debug)]
pub(crate) struct Telemetry {
    stage: Stage,
    size: SizeEstimate,
    downloaded: u64,
    rate: Option<f64>,
    merge_duration: Option<f64>,
    events: Option<mpsc::UnboundedSender<JobEvent>>,
}

impl Telemetry {
    pub(crate) fn new(events: Option<mpsc::UnboundedSender<JobEvent>>) -> Self {
        Self {
            stage: Stage::Resolving,
            size: SizeEstimate::default(),
            downloaded: 0,
            rate: None,
            merge_duration: None,
            events,
        }
    }

    pub(crate) fn stage(&self) -> Stage {
        self.stage
    }

    pub(crate) fn exact_size(&self) -> Option<u64> {
        self.size.exact_bytes()
    }

    pub(crate) fn emit(&self, event: JobEvent) {
        if let Some(events) = &self.events {
            // The listener may be gone, the job does not depend on it
            let _ = events.send(event);
        }
    }

    /// Stop publishing events, which ends the event stream of the job
    pub(crate) fn close(&mut self) {
        self.events = None;
    }

    pub(crate) fn advance(&mut self, next: Stage, message: &str) -> Result<()> {
        if !self.stage.can_advance_to(next) {
            return Err(err_msg(format!(
                "Invalid job transition from {} to {next}",
                self.stage
            )));
        }

        self.stage = next;
        self.emit(JobEvent::Stage {
            stage: next,
            message: message.to_owned(),
        });
        Ok(())
    }

    /// Decode one diagnostic line and fold it into the job state
    fn observe(&mut self, decoder: &dyn LineDecoder, line: &str) {
        let decoded = decoder.decode(line, self.size.is_known());

        if let Some(bytes) = decoded.size_hint {
            if !self.size.is_known() {
                debug!("Detected media size: {bytes} bytes");
            }
            self.size.observe_hint(bytes);
        }

        match decoded.fact {
            Some(Fact::Transfer(transfer)) => {
                self.size.observe_total(transfer.total_bytes);
                self.downloaded = transfer.downloaded_bytes();
                if transfer.rate.is_some() {
                    self.rate = transfer.rate;
                }

                self.emit(JobEvent::Progress(ProgressFact {
                    stage: self.stage,
                    percent: transfer.percent,
                    downloaded_bytes: self.downloaded,
                    total_bytes: self.size.bytes(),
                    rate: self.rate,
                    eta: transfer.eta,
                    message: format!("Downloading {:.1}%", transfer.percent),
                }));
            }
            Some(Fact::MergeDuration(duration)) => self.merge_duration = Some(duration),
            Some(Fact::MergePosition(position)) => {
                let Some(percent) = self
                    .merge_duration
                    .and_then(|duration| merge_percent(duration, position))
                else {
                    return;
                };

                self.emit(JobEvent::Progress(ProgressFact {
                    stage: self.stage,
                    percent,
                    downloaded_bytes: self.downloaded,
                    total_bytes: self.size.bytes(),
                    rate: None,
                    eta: None,
                    message: format!("Merging {percent:.0}%"),
                }));
            }
            Some(Fact::Marker(Marker::Destination(path))) => debug!("Extractor writes {path}"),
            Some(Fact::Marker(Marker::Merging)) => info!("Extractor merges the formats itself"),
            Some(Fact::Marker(Marker::DeletingOriginal)) => {}
            None => {}
        }
    }
}

pub(crate) type SharedTelemetry = Arc<Mutex<Telemetry>>;

/// Read a diagnostic stream of a subprocess until it closes.
///
/// Every line updates the job telemetry. The end of the stream is kept to
/// classify a failure.
pub(crate) async fn pump<R>(
    mut reader: R,
    telemetry: SharedTelemetry,
    decoder: Arc<dyn LineDecoder>,
) -> DiagnosticTail
where
    R: AsyncRead + Unpin,
{
    let mut splitter = LineSplitter::new();
    let mut tail = DiagnosticTail::default();
    let mut buf = vec![0u8; 8 * 1024];

    let mut observe = |line: &str| {
        trace!("{line}");
        tail.push_line(line);
        telemetry.with_lock(|mut t| t.observe(decoder.as_ref(), line));
    };

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => splitter.push(&buf[..n]).iter().for_each(|l| observe(l)),
            Err(err) => {
                debug!("Diagnostic stream closed: {err}");
                break;
            }
        }
    }
    if let Some(line) = splitter.finish() {
        observe(&line);
    }

    tail
}

/// The caller side of a running job.
///
/// Dropping the handle, or the body taken out of it, cancels the job.
#[derive(Debug)]
pub struct JobHandle {
    stem: String,
    ready: oneshot::Receiver<Result<Ready>>,
    body: mpsc::Receiver<std::io::Result<Bytes>>,
    stage: watch::Receiver<Stage>,
    guard: DropGuard,
}

impl JobHandle {
    pub(crate) fn new(
        stem: String,
        ready: oneshot::Receiver<Result<Ready>>,
        body: mpsc::Receiver<std::io::Result<Bytes>>,
        stage: watch::Receiver<Stage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            stem,
            ready,
            body,
            stage,
            guard: cancel.drop_guard(),
        }
    }

    /// The file stem of the job in the scratch directory
    pub fn stem(&self) -> &str {
        &self.stem
    }

    /// Wait until the job can deliver, or has failed before that
    pub async fn ready(&mut self) -> Result<Ready> {
        (&mut self.ready)
            .await
            .unwrap_or_else(|_| Err(err_msg("The job ended without an answer")))
    }

    /// Follow the stage of the job
    pub fn stage(&self) -> watch::Receiver<Stage> {
        self.stage.clone()
    }

    /// The response body. It keeps the job alive until dropped.
    pub fn into_body(self) -> JobBody {
        JobBody {
            rx: self.body,
            _guard: self.guard,
        }
    }
}

/// The bytes of a job, as they are produced.
///
/// An error item means the job failed after the delivery started.
#[derive(Debug)]
pub struct JobBody {
    rx: mpsc::Receiver<std::io::Result<Bytes>>,
    _guard: DropGuard,
}

impl Stream for JobBody {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Turn a pipeline error into the error item of a body
pub(crate) fn body_error(err: &Error) -> std::io::Error {
    std::io::Error::other(format!("{} ({})", err, err.kind()))
}
