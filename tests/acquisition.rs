#![cfg(unix)]

mod common;

use std::time::{Duration, SystemTime};

use common::{collect, drain, eventually, Sandbox, FAKE_FFMPEG, PARSE_OUTPUT, URL};
use fetchmux::{
    acquire::{AcquisitionRequest, Delivery, DeliveryMode, JobEvent},
    result::Error,
    types::Stage,
};
use indoc::{formatdoc, indoc};
use tokio::sync::mpsc;

#[tokio::test]
async fn direct_stream_relays_every_byte() {
    let sandbox = Sandbox::new();
    let orchestrator = sandbox.orchestrator(
        indoc! {r#"
            echo "[info] dQw4w9WgXcQ: Downloading 1 format(s): 18" >&2
            echo "[download] file size 200000" >&2
            sleep 0.3
            head -c 200000 /dev/zero
            echo "[download] 100% of 195.31KiB in 00:00:01" >&2
        "#},
        "exit 1",
    );

    let mut handle = orchestrator
        .launch(AcquisitionRequest::new(URL, "18"), Delivery::Attachment, None)
        .unwrap();
    let mut stage = handle.stage();

    let ready = handle.ready().await.unwrap();
    assert_eq!(ready.mode, DeliveryMode::DirectStream);
    assert_eq!(ready.content_length, Some(200_000));
    assert_eq!(ready.mime, "video/mp4");

    let body = collect(handle.into_body()).await.unwrap();
    assert_eq!(body.len(), 200_000);

    let last = *stage.wait_for(|s| s.is_terminal()).await.unwrap();
    assert_eq!(last, Stage::Complete);
    // Nothing is written to the scratch directory in this mode
    assert!(!sandbox.scratch().exists());
}

#[tokio::test]
async fn audio_id_without_merge_streams_directly() {
    let sandbox = Sandbox::new();
    let args_file = sandbox.root.path().join("args");
    let ytdl = formatdoc! {r#"
        echo "$@" > "{}"
        printf 'combined'
    "#, args_file.display()};
    let orchestrator = sandbox.orchestrator(&ytdl, "exit 1");

    let request = AcquisitionRequest::new(URL, "18")
        .with_audio("140")
        .merged(false);
    let mut handle = orchestrator
        .launch(request, Delivery::Attachment, None)
        .unwrap();

    let ready = handle.ready().await.unwrap();
    assert_eq!(ready.mode, DeliveryMode::DirectStream);
    assert_eq!(collect(handle.into_body()).await.unwrap(), b"combined");

    let args = std::fs::read_to_string(&args_file).unwrap();
    assert!(args.contains("-f 18 "), "{args}");
    assert!(!args.contains("+140"), "{args}");
    assert!(!sandbox.scratch().exists());
}

#[tokio::test]
async fn separate_streams_are_merged_then_sent() {
    let sandbox = Sandbox::new();
    let ytdl = formatdoc! {r#"
        {PARSE_OUTPUT}
        echo "[download] Destination: $stem.f137.webm"
        echo "[download]  50.0% of 10.00KiB at 1.00MiB/s ETA 00:01"
        echo "[download] 100% of 10.00KiB in 00:00:01"
        printf 'video' > "$stem.f137.webm"
        printf 'audio' > "$stem.f140.m4a"
    "#};
    let orchestrator = sandbox.orchestrator(&ytdl, FAKE_FFMPEG);

    let (tx, rx) = mpsc::unbounded_channel();
    let request = AcquisitionRequest::new(URL, "137")
        .with_audio("140")
        .merged(true);
    let mut handle = orchestrator
        .launch(request, Delivery::Attachment, Some(tx))
        .unwrap();
    let stem = handle.stem().to_owned();
    let mut stage = handle.stage();

    let ready = handle.ready().await.unwrap();
    assert_eq!(ready.mode, DeliveryMode::TempFile);
    assert_eq!(ready.content_length, Some(6));

    let body = collect(handle.into_body()).await.unwrap();
    assert_eq!(body, b"merged");
    assert_eq!(*stage.wait_for(|s| s.is_terminal()).await.unwrap(), Stage::Complete);

    let events = drain(rx).await;
    let stages: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            JobEvent::Stage { stage, .. } => Some(*stage),
            _ => None,
        })
        .collect();
    assert_eq!(
        stages,
        [
            Stage::Downloading,
            Stage::Merging,
            Stage::Streaming,
            Stage::Complete
        ]
    );

    let percents: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            JobEvent::Progress(fact) => Some((fact.stage, fact.percent)),
            _ => None,
        })
        .collect();
    assert_eq!(
        percents,
        [
            (Stage::Downloading, 50.0),
            (Stage::Downloading, 100.0),
            (Stage::Merging, 50.0),
            (Stage::Merging, 100.0)
        ]
    );

    // The parts go right after the merge, the merged file once delivered
    let scratch = sandbox.scratch().to_owned();
    assert!(!scratch.join(format!("{stem}.f137.webm")).exists());
    assert!(!scratch.join(format!("{stem}.f140.m4a")).exists());
    assert!(eventually(|| !scratch.join(format!("{stem}.merged.mp4")).exists()).await);
}

#[tokio::test]
async fn dropping_the_handle_kills_the_extractor() {
    let sandbox = Sandbox::new();
    let pid_file = sandbox.root.path().join("pid");
    let ytdl = formatdoc! {r#"
        echo $$ > "{}"
        exec sleep 30
    "#, pid_file.display()};
    let orchestrator = sandbox.orchestrator(&ytdl, "exit 1");

    let handle = orchestrator
        .launch(AcquisitionRequest::new(URL, "18"), Delivery::Attachment, None)
        .unwrap();
    let mut stage = handle.stage();

    let written = || std::fs::read_to_string(&pid_file).is_ok_and(|s| s.ends_with('\n'));
    assert!(eventually(written).await);
    let pid = std::fs::read_to_string(&pid_file).unwrap().trim().to_owned();

    drop(handle);
    let last = *stage.wait_for(|s| s.is_terminal()).await.unwrap();
    assert_eq!(last, Stage::Cancelled);

    let alive = || {
        std::process::Command::new("kill")
            .args(["-0", &pid])
            .stderr(std::process::Stdio::null())
            .status()
            .is_ok_and(|s| s.success())
    };
    assert!(eventually(|| !alive()).await, "process {pid} survived");
}

#[tokio::test]
async fn extractor_failures_are_classified() {
    let cases = [
        (
            "echo 'ERROR: unable to download video data: HTTP Error 429: Too Many Requests' >&2",
            "rate_limited",
        ),
        (
            "echo \"ERROR: [youtube] dQw4w9WgXcQ: Sign in to confirm you're not a bot\" >&2",
            "bot_detection_required",
        ),
        (
            "echo 'ERROR: [youtube] dQw4w9WgXcQ: Requested format is not available' >&2",
            "variant_unavailable",
        ),
        (
            "echo 'WARNING: slow' >&2; echo 'ERROR: Postprocessing: Conversion failed!' >&2",
            "download_failed",
        ),
    ];

    for (script, kind) in cases {
        let sandbox = Sandbox::new();
        let orchestrator = sandbox.orchestrator(&format!("{script}\nexit 1"), "exit 1");

        let mut handle = orchestrator
            .launch(AcquisitionRequest::new(URL, "18"), Delivery::Attachment, None)
            .unwrap();
        let mut stage = handle.stage();

        let err = handle.ready().await.unwrap_err();
        assert_eq!(err.kind(), kind, "{err}");
        assert_eq!(*stage.wait_for(|s| s.is_terminal()).await.unwrap(), Stage::Error);
    }
}

#[tokio::test]
async fn failed_jobs_leave_nothing_behind() {
    let mut sandbox = Sandbox::new();
    sandbox.settings.retention.orphan = 0;
    let ytdl = formatdoc! {r#"
        {PARSE_OUTPUT}
        printf 'half' > "$stem.f137.webm.part"
        printf 'video' > "$stem.f137.webm"
        echo 'ERROR: unable to download video data: HTTP Error 403: Forbidden' >&2
        exit 1
    "#};
    let orchestrator = sandbox.orchestrator(&ytdl, "exit 1");

    let (tx, rx) = mpsc::unbounded_channel();
    let request = AcquisitionRequest::new(URL, "137").merged(true);
    let mut handle = orchestrator
        .launch(request, Delivery::Attachment, Some(tx))
        .unwrap();
    let stem = handle.stem().to_owned();

    match handle.ready().await {
        Err(Error::AccessForbidden) => {}
        other => panic!("unexpected {other:?}"),
    }
    let events = drain(rx).await;
    assert!(matches!(
        events.last(),
        Some(JobEvent::Stage {
            stage: Stage::Error,
            ..
        })
    ));
    assert!(events
        .iter()
        .any(|e| matches!(e, JobEvent::Error { kind: "access_forbidden", .. })));

    let scratch = sandbox.scratch().to_owned();
    assert!(
        eventually(|| {
            std::fs::read_dir(&scratch)
                .map(|entries| {
                    entries
                        .flatten()
                        .all(|e| !e.file_name().to_string_lossy().starts_with(&stem))
                })
                .unwrap_or(true)
        })
        .await
    );
}

#[tokio::test]
async fn failed_jobs_sweep_stale_leftovers() {
    let mut sandbox = Sandbox::new();
    sandbox.settings.retention.orphan = 0;

    // Left by a job of a previous run that never got to clean up
    std::fs::create_dir_all(sandbox.scratch()).unwrap();
    let leftover = sandbox.scratch().join("dl_crashed.f137.webm");
    std::fs::write(&leftover, b"stale").unwrap();
    std::fs::File::options()
        .write(true)
        .open(&leftover)
        .unwrap()
        .set_modified(SystemTime::now() - Duration::from_secs(600))
        .unwrap();

    let orchestrator = sandbox.orchestrator(
        indoc! {"
            echo 'ERROR: unable to download video data: HTTP Error 403: Forbidden' >&2
            exit 1
        "},
        "exit 1",
    );
    let request = AcquisitionRequest::new(URL, "137").merged(true);
    let mut handle = orchestrator
        .launch(request, Delivery::Attachment, None)
        .unwrap();
    assert_eq!(handle.ready().await.unwrap_err().kind(), "access_forbidden");

    assert!(eventually(|| !leftover.exists()).await);
}

#[tokio::test]
async fn muxer_failures_are_merge_failures() {
    let sandbox = Sandbox::new();
    let ytdl = formatdoc! {r#"
        {PARSE_OUTPUT}
        printf 'video' > "$stem.f137.webm"
        printf 'audio' > "$stem.f140.m4a"
    "#};
    let ffmpeg = indoc! {"
        echo '[matroska] Could not find codec parameters for stream 0' >&2
        exit 1
    "};
    let orchestrator = sandbox.orchestrator(&ytdl, ffmpeg);

    let request = AcquisitionRequest::new(URL, "137")
        .with_audio("140")
        .merged(true);
    let mut handle = orchestrator
        .launch(request, Delivery::Attachment, None)
        .unwrap();
    let mut stage = handle.stage();

    match handle.ready().await {
        Err(Error::MergeFailed(line)) => assert!(line.contains("codec parameters"), "{line}"),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(*stage.wait_for(|s| s.is_terminal()).await.unwrap(), Stage::Error);
}

#[tokio::test]
async fn dropping_the_handle_kills_the_muxer() {
    let sandbox = Sandbox::new();
    let pid_file = sandbox.root.path().join("pid");
    let ytdl = formatdoc! {r#"
        {PARSE_OUTPUT}
        printf 'video' > "$stem.f137.webm"
        printf 'audio' > "$stem.f140.m4a"
    "#};
    let ffmpeg = formatdoc! {r#"
        echo $$ > "{}"
        exec sleep 30
    "#, pid_file.display()};
    let orchestrator = sandbox.orchestrator(&ytdl, &ffmpeg);

    let request = AcquisitionRequest::new(URL, "137")
        .with_audio("140")
        .merged(true);
    let handle = orchestrator
        .launch(request, Delivery::Attachment, None)
        .unwrap();
    let mut stage = handle.stage();

    let written = || std::fs::read_to_string(&pid_file).is_ok_and(|s| s.ends_with('\n'));
    assert!(eventually(written).await);
    let pid = std::fs::read_to_string(&pid_file).unwrap().trim().to_owned();
    assert_eq!(*stage.borrow(), Stage::Merging);

    drop(handle);
    let last = *stage.wait_for(|s| s.is_terminal()).await.unwrap();
    assert_eq!(last, Stage::Cancelled);

    let alive = || {
        std::process::Command::new("kill")
            .args(["-0", &pid])
            .stderr(std::process::Stdio::null())
            .status()
            .is_ok_and(|s| s.success())
    };
    assert!(eventually(|| !alive()).await, "process {pid} survived");
}

#[tokio::test]
async fn published_files_are_announced() {
    let sandbox = Sandbox::new();
    let ytdl = formatdoc! {r#"
        {PARSE_OUTPUT}
        echo "[Merger] Merging formats into \"$stem.mp4\""
        printf 'complete' > "$stem.mp4"
    "#};
    let orchestrator = sandbox.orchestrator(&ytdl, "exit 1");

    let (tx, rx) = mpsc::unbounded_channel();
    let mut request = AcquisitionRequest::new(URL, "137").merged(true);
    request.title = Some("Never Gonna Give You Up".to_owned());
    let mut handle = orchestrator.launch(request, Delivery::Publish, Some(tx)).unwrap();
    let stem = handle.stem().to_owned();

    let ready = handle.ready().await.unwrap();
    assert_eq!(ready.mode, DeliveryMode::TempFile);
    assert_eq!(ready.file_name, "never-gonna-give-you-up.mp4");

    let events = drain(rx).await;
    let announced = events.iter().find_map(|e| match e {
        JobEvent::FileReady { path, size, .. } => Some((path.clone(), *size)),
        _ => None,
    });
    assert_eq!(announced, Some((format!("/api/files/{stem}.mp4"), 8)));

    // Kept until the follow-up transfer
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(sandbox.scratch().join(format!("{stem}.mp4")).is_file());
}

#[tokio::test]
async fn invalid_requests_do_not_start() {
    let sandbox = Sandbox::new();
    let orchestrator = sandbox.orchestrator("exit 0", "exit 0");

    let err = orchestrator
        .launch(
            AcquisitionRequest::new("ftp://example.com/v", "18"),
            Delivery::Attachment,
            None,
        )
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_request");
}
