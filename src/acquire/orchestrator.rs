use std::{
    future::Future,
    path::{Path, PathBuf},
    process::ExitStatus,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::{
    io::AsyncRead,
    process::Child,
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::{io::ReaderStream, sync::CancellationToken};
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::{
    job::{body_error, pump, SharedTelemetry, Telemetry},
    AcquisitionRequest, Delivery, DeliveryMode, JobEvent, JobHandle, Ready,
};
use crate::{
    classify::{last_error_line, DiagnosticTail, PhraseTable},
    io::{self, Artifacts},
    janitor::Janitor,
    outside::{hard_kill, DownloadSpec, OutputTarget, StreamExtractor, StreamMuxer},
    result::{err_msg, Error, Result},
    settings::Settings,
    telemetry::{LineDecoder, ToolDecoder},
    types::{Extension, Stage},
    utils::MutexUtils,
};

/// Chunks of body waiting for the client before the producer is suspended
const BODY_BUFFER: usize = 8;
const CHUNK_SIZE: usize = 64 * 1024;
/// How long a failed job waits for a slow client to take its error
const ERROR_DELIVERY_BUDGET: Duration = Duration::from_secs(5);

/// Knobs of every job
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub scratch_dir: PathBuf,
    pub container: Extension,
    pub download_timeout: Duration,
    pub merge_timeout: Duration,
    pub stream_timeout: Duration,
    /// Wait before deleting a delivered file
    pub delete_delay: Duration,
    /// Wait before deleting the files of a failed job
    pub orphan_retention: Duration,
}

impl From<&Settings> for JobConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            scratch_dir: settings.scratch_dir.clone(),
            container: settings.container(),
            download_timeout: settings.timeouts.download(),
            merge_timeout: settings.timeouts.merge(),
            stream_timeout: settings.timeouts.stream(),
            delete_delay: settings.delete_delay(),
            orphan_retention: settings.orphan_retention(),
        }
    }
}

/// Starts acquisition jobs.
///
/// Jobs share nothing but the tools and the scratch directory. Each one runs
/// in its own task which exclusively owns its subprocesses.
#[derive(Clone)]
pub struct Orchestrator {
    extractor: Arc<dyn StreamExtractor>,
    muxer: Arc<dyn StreamMuxer>,
    decoder: Arc<dyn LineDecoder>,
    phrases: Arc<PhraseTable>,
    config: Arc<JobConfig>,
}

impl Orchestrator {
    pub fn new(
        extractor: Arc<dyn StreamExtractor>,
        muxer: Arc<dyn StreamMuxer>,
        settings: &Settings,
    ) -> Self {
        Self {
            extractor,
            muxer,
            decoder: Arc::new(ToolDecoder),
            phrases: Arc::new(settings.error_phrases.clone()),
            config: Arc::new(JobConfig::from(settings)),
        }
    }

    pub fn extractor(&self) -> &dyn StreamExtractor {
        self.extractor.as_ref()
    }

    pub fn phrases(&self) -> &PhraseTable {
        &self.phrases
    }

    /// Start a job in the background.
    ///
    /// Events are published on `events` if given, in the order they happen.
    /// The channel closes when the job is over.
    pub fn launch(
        &self,
        request: AcquisitionRequest,
        delivery: Delivery,
        events: Option<mpsc::UnboundedSender<JobEvent>>,
    ) -> Result<JobHandle> {
        request.validate()?;

        let stem = io::job_stem();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(BODY_BUFFER);
        let (stage_tx, stage_rx) = watch::channel(Stage::Resolving);
        let cancel = CancellationToken::new();

        let job = Job {
            ctx: self.clone(),
            request,
            delivery,
            stem: stem.clone(),
            telemetry: Arc::new(Mutex::new(Telemetry::new(events))),
            stage: stage_tx,
            ready: Some(ready_tx),
            body: body_tx,
            cancel: cancel.clone(),
        };

        let span = info_span!("job", stem = %stem);
        tokio::spawn(job.drive().instrument(span));

        Ok(JobHandle::new(stem, ready_rx, body_rx, stage_rx, cancel))
    }
}

/// A wall-clock budget shared by every wait of a phase
#[derive(Debug, Clone, Copy)]
struct Phase {
    name: &'static str,
    budget: Duration,
    deadline: Instant,
}

impl Phase {
    fn start(name: &'static str, budget: Duration) -> Self {
        Self {
            name,
            budget,
            deadline: Instant::now() + budget,
        }
    }

    fn timeout(self) -> Error {
        Error::Timeout {
            phase: self.name,
            after: self.budget,
        }
    }
}

/// Wait for `fut` unless the phase runs out of time or the job is cancelled.
///
/// A ready `fut` wins over a cancellation arriving at the same time.
async fn guarded<F>(cancel: &CancellationToken, phase: Phase, fut: F) -> Result<F::Output>
where
    F: Future,
{
    tokio::select! {
        biased;
        res = tokio::time::timeout_at(phase.deadline, fut) => res.map_err(|_| phase.timeout()),
        _ = cancel.cancelled() => Err(Error::Cancelled),
    }
}

/// The diagnostic text of every pump, once their streams are closed
async fn diagnostic_text(pumps: Vec<JoinHandle<DiagnosticTail>>) -> String {
    let mut text = String::new();
    for pump in pumps {
        text.push_str(&pump.await.unwrap_or_default().text());
    }
    text
}

/// The state of one job, owned by its task
struct Job {
    ctx: Orchestrator,
    request: AcquisitionRequest,
    delivery: Delivery,
    stem: String,
    telemetry: SharedTelemetry,
    stage: watch::Sender<Stage>,
    ready: Option<oneshot::Sender<Result<Ready>>>,
    body: mpsc::Sender<std::io::Result<Bytes>>,
    cancel: CancellationToken,
}

impl Job {
    async fn drive(mut self) {
        match self.run().await {
            Ok(()) => {
                if let Err(err) = self.advance(Stage::Complete, "Done") {
                    error!("{err}");
                }
            }
            Err(Error::Cancelled) => {
                info!("Cancelled, the files are left to the janitor");
                self.settle(Stage::Cancelled, "Cancelled by the client");
                self.answer(Err(Error::Cancelled));
            }
            Err(err) => self.fail(err).await,
        }

        self.telemetry.with_lock(|mut t| t.close());
    }

    async fn fail(&mut self, err: Error) {
        match &err {
            Error::Miette(report) => error!("Job failed: {report:?}"),
            err => warn!("Job failed: {err}"),
        }

        self.telemetry.with_lock(|t| {
            t.emit(JobEvent::Error {
                kind: err.kind(),
                message: err.to_string(),
            })
        });
        self.settle(Stage::Error, &err.to_string());

        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Err(err));
        } else {
            // The delivery started, abort it so the client does not take a
            // truncated body for a complete one
            let _ = self
                .body
                .send_timeout(Err(body_error(&err)), ERROR_DELIVERY_BUDGET)
                .await;
        }

        self.reap_later();
    }

    async fn run(&mut self) -> Result<()> {
        let ctx = self.ctx.clone();

        let direct = self.delivery == Delivery::Attachment && !self.request.fetches_two_streams();
        let mode = if direct {
            DeliveryMode::DirectStream
        } else {
            DeliveryMode::TempFile
        };
        let target = match mode {
            DeliveryMode::DirectStream => OutputTarget::Stdout,
            DeliveryMode::TempFile => {
                tokio::fs::create_dir_all(&ctx.config.scratch_dir).await?;
                OutputTarget::Template(io::output_template(&ctx.config.scratch_dir, &self.stem))
            }
        };
        let spec = DownloadSpec {
            url: self.request.url.clone(),
            format: self.request.format_selector(),
            target,
        };
        debug!("Delivery mode {mode:?} for format {}", spec.format);

        self.advance(Stage::Downloading, "Starting download")?;
        let child = ctx.extractor.spawn_download(&spec)?;

        match mode {
            DeliveryMode::DirectStream => self.relay(child).await,
            DeliveryMode::TempFile => {
                let path = self.download_to_disk(child).await?;
                self.deliver_file(path).await
            }
        }
    }

    /// Direct-stream mode: the extractor output is the body
    async fn relay(&mut self, mut child: Child) -> Result<()> {
        let phase = Phase::start("download", self.ctx.config.download_timeout);
        let diagnostics = self.spawn_pump(child.stderr.take());
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| err_msg("The extractor output is not piped"))?;
        let mut stdout = ReaderStream::with_capacity(stdout, CHUNK_SIZE);

        let sent = match self.forward(&mut stdout, phase).await {
            Ok(sent) => sent,
            Err(err) => {
                hard_kill(&mut child).await;
                return Err(err);
            }
        };

        // The output is closed, the exit is imminent and the client may
        // already be gone with every byte it asked for
        let status = match tokio::time::timeout_at(phase.deadline, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                hard_kill(&mut child).await;
                return Err(phase.timeout());
            }
        };

        let diagnostic = diagnostic_text(vec![diagnostics]).await;
        if !status.success() {
            return Err(self.ctx.phrases.download_error(&diagnostic));
        }

        if self.ready.is_some() {
            debug!("The extractor wrote nothing");
            let container = self.ctx.config.container;
            let ready = self.ready_for(DeliveryMode::DirectStream, Some(0), container);
            self.start_streaming(ready)?;
        }
        debug!("Relayed {sent} bytes");
        Ok(())
    }

    /// Temp-file mode: wait for the extractor, then find or build the final file
    async fn download_to_disk(&mut self, mut child: Child) -> Result<PathBuf> {
        let config = self.ctx.config.clone();
        let phase = Phase::start("download", config.download_timeout);

        // With a file output, the progress is printed on stdout
        let pumps = vec![
            self.spawn_pump(child.stdout.take()),
            self.spawn_pump(child.stderr.take()),
        ];
        let status = self.wait_child(&mut child, phase).await?;
        let diagnostic = diagnostic_text(pumps).await;
        if !status.success() {
            return Err(self.ctx.phrases.download_error(&diagnostic));
        }

        let merged = io::merged_path(&config.scratch_dir, &self.stem, config.container);
        if merged.is_file() {
            return Ok(merged);
        }

        info!("No merged file, looking for the downloaded parts");
        let artifacts = io::locate_artifacts(
            &config.scratch_dir,
            &self.stem,
            &self.request.video_id,
            self.request.audio_id.as_deref(),
        )?;

        match artifacts {
            Artifacts::Complete(path) => Ok(path),
            Artifacts::Parts { video, audio } => self.merge(&video, &audio).await,
            Artifacts::Missing(found) if self.request.fetches_two_streams() => {
                Err(Error::MergeFailed(format!(
                    "could not find the video and audio parts among {found:?}"
                )))
            }
            Artifacts::Missing(_) => Err(Error::DownloadFailed(
                "the extractor reported success but wrote no file".to_owned(),
            )),
        }
    }

    async fn merge(&mut self, video: &Path, audio: &Path) -> Result<PathBuf> {
        let config = self.ctx.config.clone();
        self.advance(Stage::Merging, "Merging video and audio")?;
        info!("Merging {} and {}", video.display(), audio.display());

        let phase = Phase::start("merge", config.merge_timeout);
        let output = io::remux_path(&config.scratch_dir, &self.stem, config.container);
        let mut child = self.ctx.muxer.spawn_merge(video, audio, &output)?;

        let pumps = vec![
            self.spawn_pump(child.stdout.take()),
            self.spawn_pump(child.stderr.take()),
        ];
        let status = self.wait_child(&mut child, phase).await?;
        let diagnostic = diagnostic_text(pumps).await;

        if !status.success() {
            return Err(Error::MergeFailed(last_error_line(&diagnostic)));
        }
        if !output.is_file() {
            return Err(Error::MergeFailed("the muxer wrote no output".to_owned()));
        }

        for part in [video, audio] {
            if let Err(err) = tokio::fs::remove_file(part).await {
                warn!("Could not delete {}: {err}", part.display());
            }
        }
        Ok(output)
    }

    async fn deliver_file(&mut self, path: PathBuf) -> Result<()> {
        let config = self.ctx.config.clone();
        let size = tokio::fs::metadata(&path).await?.len();
        let ext = Extension::from_path(&path).unwrap_or(config.container);
        let ready = self.ready_for(DeliveryMode::TempFile, Some(size), ext);

        match self.delivery {
            Delivery::Publish => {
                let stored = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .ok_or_else(|| err_msg("The final file has no name"))?;

                self.advance(Stage::Streaming, "File ready for download")?;
                self.telemetry.with_lock(|t| {
                    t.emit(JobEvent::FileReady {
                        path: format!("/api/files/{stored}"),
                        file_name: ready.file_name.clone(),
                        size,
                    })
                });
                self.answer(Ok(ready));
                Ok(())
            }
            Delivery::Attachment => {
                let phase = Phase::start("stream", config.stream_timeout);
                let file = tokio::fs::File::open(&path).await?;
                self.start_streaming(ready)?;

                let mut stream = ReaderStream::with_capacity(file, CHUNK_SIZE);
                let sent = self.forward(&mut stream, phase).await?;
                debug!("Sent {sent} of {size} bytes");

                io::schedule_delete(path, config.delete_delay);
                Ok(())
            }
        }
    }

    /// Hand the chunks of `stream` to the client, waiting for it to take them.
    ///
    /// In direct-stream mode, the first chunk also answers the caller.
    async fn forward<S>(&mut self, stream: &mut S, phase: Phase) -> Result<u64>
    where
        S: Stream<Item = std::io::Result<Bytes>> + Unpin,
    {
        let mut sent = 0u64;

        while let Some(chunk) = guarded(&self.cancel, phase, stream.next()).await? {
            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }

            if self.ready.is_some() {
                let length = self.telemetry.with_lock(|t| t.exact_size());
                let container = self.ctx.config.container;
                let ready = self.ready_for(DeliveryMode::DirectStream, length, container);
                self.start_streaming(ready)?;
            }

            sent += chunk.len() as u64;
            guarded(&self.cancel, phase, self.body.send(Ok(chunk)))
                .await?
                .map_err(|_| Error::Cancelled)?;
        }

        Ok(sent)
    }

    async fn wait_child(&self, child: &mut Child, phase: Phase) -> Result<ExitStatus> {
        match guarded(&self.cancel, phase, child.wait()).await {
            Ok(status) => Ok(status?),
            Err(err) => {
                hard_kill(child).await;
                Err(err)
            }
        }
    }

    fn spawn_pump<R>(&self, reader: Option<R>) -> JoinHandle<DiagnosticTail>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let telemetry = self.telemetry.clone();
        let decoder = self.ctx.decoder.clone();

        tokio::spawn(
            async move {
                match reader {
                    Some(reader) => pump(reader, telemetry, decoder).await,
                    None => DiagnosticTail::default(),
                }
            }
            .in_current_span(),
        )
    }

    fn ready_for(&self, mode: DeliveryMode, content_length: Option<u64>, ext: Extension) -> Ready {
        Ready {
            mode,
            content_length,
            file_name: io::attachment_name(self.request.title.as_deref(), ext),
            mime: ext.mime_type(),
        }
    }

    fn start_streaming(&mut self, ready: Ready) -> Result<()> {
        match ready.content_length {
            Some(length) => debug!("Delivering {length} bytes as {}", ready.file_name),
            None => debug!("Delivering an unknown size as {}", ready.file_name),
        }
        self.advance(Stage::Streaming, "Streaming")?;
        self.answer(Ok(ready));
        Ok(())
    }

    /// Answer the caller waiting for the job to be ready, once
    fn answer(&mut self, ready: Result<Ready>) {
        if let Some(tx) = self.ready.take() {
            // The caller may be gone already
            let _ = tx.send(ready);
        }
    }

    fn advance(&self, next: Stage, message: &str) -> Result<()> {
        self.telemetry.with_lock(|mut t| t.advance(next, message))?;
        info!(stage = %next, "{message}");
        self.stage.send_replace(next);
        Ok(())
    }

    /// Move to a terminal stage if the current one allows it
    fn settle(&self, terminal: Stage, message: &str) {
        let stage = self.telemetry.with_lock(|t| t.stage());
        if stage.can_advance_to(terminal) {
            let _ = self.advance(terminal, message);
        } else {
            debug!("Ending in {stage}, {terminal} not reachable");
        }
    }

    /// Once the orphan retention elapsed, sweep the scratch directory by age
    /// then delete what is left of this job
    fn reap_later(&self) {
        let janitor = Janitor::new(&self.ctx.config.scratch_dir);
        let delay = self.ctx.config.orphan_retention;
        let stem = self.stem.clone();

        tokio::spawn(
            async move {
                tokio::time::sleep(delay).await;
                janitor.sweep(delay).await;
                janitor.reap_job(&stem).await;
            }
            .in_current_span(),
        );
    }
}
