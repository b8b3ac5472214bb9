#![allow(dead_code)]

use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use fetchmux::{
    acquire::{JobBody, JobEvent, Orchestrator},
    outside::{ExtractorOptions, Ffmpeg, Ytdl},
    settings::Settings,
};
use futures::TryStreamExt;
use tempfile::TempDir;
use tokio::sync::mpsc;

pub const URL: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";

/// A scratch directory and a place for the fake tools
pub struct Sandbox {
    pub root: TempDir,
    pub settings: Settings,
}

impl Sandbox {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.scratch_dir = root.path().join("scratch");
        settings.delete_delay = 0;
        settings.extractor = ExtractorOptions {
            cookies_file: root.path().join("no-cookies.txt"),
            ..Default::default()
        };
        Self { root, settings }
    }

    pub fn scratch(&self) -> &Path {
        &self.settings.scratch_dir
    }

    /// Write an executable shell script
    pub fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.root.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// An orchestrator running the given fake tools
    pub fn orchestrator(&self, ytdl: &str, ffmpeg: &str) -> Orchestrator {
        let ytdl = self.script("yt-dlp", ytdl);
        let ffmpeg = self.script("ffmpeg", ffmpeg);
        Orchestrator::new(
            Arc::new(Ytdl::with_program(ytdl, self.settings.extractor.clone())),
            Arc::new(Ffmpeg::with_program(ffmpeg)),
            &self.settings,
        )
    }
}

/// Shell prelude of the fake extractor: `$out` is the `-o` argument and
/// `$stem` the output template without its `.%(ext)s` suffix
pub const PARSE_OUTPUT: &str = r#"
out=""
while [ $# -gt 0 ]; do
    if [ "$1" = "-o" ]; then out="$2"; shift; fi
    shift
done
stem="${out%".%(ext)s"}"
"#;

/// A muxer printing its progress then writing `merged` to its last argument.
/// The duration goes to stderr and the positions to stdout, as ffmpeg does.
pub const FAKE_FFMPEG: &str = r#"
for last; do :; done
echo "  Duration: 00:00:10.00, start: 0.000000, bitrate: 128 kb/s" >&2
sleep 0.3
echo "out_time=00:00:05.000000"
echo "out_time=00:00:10.000000"
echo "progress=end"
printf 'merged' > "$last"
"#;

pub async fn collect(body: JobBody) -> std::io::Result<Vec<u8>> {
    body.try_fold(Vec::new(), |mut acc, chunk| async move {
        acc.extend_from_slice(&chunk);
        Ok(acc)
    })
    .await
}

/// Every event published until the job closes its channel
pub async fn drain(mut events: mpsc::UnboundedReceiver<JobEvent>) -> Vec<JobEvent> {
    let mut all = Vec::new();
    while let Some(event) = events.recv().await {
        all.push(event);
    }
    all
}

/// Poll `check` for up to 5 seconds
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..250 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
