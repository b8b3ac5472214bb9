mod cli;
mod logging;

use std::{path::Path, sync::Arc, time::Duration};

use clap::Parser;
use fetchmux::{
    acquire::{AcquisitionRequest, Delivery, JobEvent, Orchestrator},
    catalog,
    janitor::Janitor,
    outside::{Ffmpeg, Ytdl},
    result::Error,
    settings::Settings,
    types::Stage,
    web::{self, AppState},
};
use futures::StreamExt;
use miette::{Context, IntoDiagnostic};
use tokio::{io::AsyncWriteExt, net::TcpListener, sync::mpsc};
use tracing::{debug, info, warn};

use crate::{
    cli::{Args, Command},
    logging::init_logging,
};

fn main() -> miette::Result<()> {
    let args = Args::parse();
    // Before the runtime starts its threads, for the local time offset
    init_logging(args.log_level)?;

    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(scratch_dir) = args.scratch_dir {
        settings.scratch_dir = scratch_dir;
    }
    debug!("{settings:?}");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .into_diagnostic()
        .wrap_err("Could not start the async runtime")?;

    runtime.block_on(run(args.command, settings))
}

async fn run(command: Command, mut settings: Settings) -> miette::Result<()> {
    match command {
        Command::Serve { listen } => {
            if let Some(listen) = listen {
                settings.listen = listen;
            }
            serve(settings).await
        }
        Command::Formats { url } => {
            let ytdl = Ytdl::new(settings.ytdl_program.as_deref(), settings.extractor.clone())
                .await
                .map_err(miette::Report::from)
                .wrap_err("Could not find the extraction tool")?;
            let catalog = catalog::resolve(
                &ytdl,
                &url,
                settings.timeouts.catalog(),
                &settings.error_phrases,
                settings.min_height,
            )
            .await?;

            let json = serde_json::to_string_pretty(&catalog).into_diagnostic()?;
            println!("{json}");
            Ok(())
        }
        Command::Fetch {
            url,
            video,
            audio,
            merge,
            title,
            output,
        } => {
            let mut request = AcquisitionRequest::new(url, video).merged(merge);
            request.audio_id = audio;
            request.title = title;
            fetch(settings, request, &output).await
        }
        Command::Sweep { max_age } => {
            let max_age = max_age.map_or_else(|| settings.stale_retention(), Duration::from_secs);
            let report = Janitor::new(&settings.scratch_dir).sweep(max_age).await;
            info!(
                "Deleted {} files, {} bytes freed",
                report.deleted_files, report.bytes_freed
            );
            for err in &report.errors {
                warn!("{err}");
            }
            Ok(())
        }
    }
}

/// Load the external components
async fn load_orchestrator(settings: &Settings) -> miette::Result<Orchestrator> {
    // Probe both tools concurrently as executing an external program
    // is not instantaneous
    let (ytdl, ffmpeg) = tokio::try_join!(
        Ytdl::new(settings.ytdl_program.as_deref(), settings.extractor.clone()),
        Ffmpeg::new(settings.ffmpeg_program.as_deref()),
    )
    .map_err(miette::Report::from)
    .wrap_err("Could not find the external tools")?;
    debug!("Using {}", ytdl.program().display());

    Ok(Orchestrator::new(Arc::new(ytdl), Arc::new(ffmpeg), settings))
}

async fn serve(settings: Settings) -> miette::Result<()> {
    tokio::fs::create_dir_all(&settings.scratch_dir)
        .await
        .into_diagnostic()
        .wrap_err("Could not create the scratch directory")?;

    let orchestrator = load_orchestrator(&settings).await?;
    let listener = TcpListener::bind(settings.listen)
        .await
        .into_diagnostic()
        .wrap_err_with(|| format!("Could not listen on {}", settings.listen))?;

    let state = AppState::new(orchestrator, settings);
    // Leftovers of a previous run
    let report = state.janitor.sweep(state.settings.stale_retention()).await;
    debug!("Start-up sweep: {report:?}");

    web::serve(listener, state).await?;
    Ok(())
}

async fn fetch(
    settings: Settings,
    request: AcquisitionRequest,
    output: &Path,
) -> miette::Result<()> {
    tokio::fs::create_dir_all(&settings.scratch_dir)
        .await
        .into_diagnostic()
        .wrap_err("Could not create the scratch directory")?;
    let orchestrator = load_orchestrator(&settings).await?;

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut handle = orchestrator.launch(request, Delivery::Attachment, Some(events_tx))?;
    let mut stage = handle.stage();

    let progress = tokio::spawn(async move {
        let mut last_percent = -1;
        while let Some(event) = events_rx.recv().await {
            match event {
                JobEvent::Progress(fact) => {
                    // One line per percent
                    let percent = fact.percent as i64;
                    if percent != last_percent {
                        last_percent = percent;
                        info!("{percent:>3}% {}", fact.message);
                    }
                }
                JobEvent::Stage { stage, message } => info!("{stage}: {message}"),
                JobEvent::Error { kind, message } => warn!("{kind}: {message}"),
                JobEvent::FileReady { .. } => {}
            }
        }
    });

    let copy = async {
        let ready = handle.ready().await?;
        debug!("Delivering {} as {}", ready.file_name, ready.mime);

        let mut file = tokio::fs::File::create(output).await?;
        let mut body = handle.into_body();
        let mut written = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok::<_, Error>(written)
    };

    // Dropping the copy drops the body, which cancels the job
    let written = tokio::select! {
        res = copy => res?,
        _ = tokio::signal::ctrl_c() => return Err(Error::Cancelled.into()),
    };

    // The job settles right after its last byte
    let _ = stage.wait_for(|stage| stage.is_terminal()).await;
    let _ = progress.await;

    let last_stage = *stage.borrow();
    if last_stage != Stage::Complete {
        return Err(Error::DownloadFailed(format!("the job ended as {last_stage}")).into());
    }
    info!("Wrote {written} bytes to {}", output.display());
    Ok(())
}

