use std::{
    ffi::OsStr,
    fmt::Debug,
    path::{Path, PathBuf},
};

use tokio::process::Child;

use crate::result::Result;

use super::command::{
    assert_success_command, build_command, spawn_command, Capture, FFMPEG, FFXXX_DEFAULT_ARGS,
};

pub trait StreamMuxer: Send + Sync + Debug {
    /// Start combining a video and an audio elementary stream into one
    /// container at `output`, overwriting it if it exists.
    ///
    /// Both tracks are copied verbatim. Machine-readable progress
    /// (`out_time=...`) is written on stdout while the input description
    /// (`Duration: ...`) is written on stderr.
    fn spawn_merge(&self, video: &Path, audio: &Path, output: &Path) -> Result<Child>;
}

/// Interface for the [ffmpeg](https://ffmpeg.org) program
#[derive(Debug)]
pub struct Ffmpeg {
    program: PathBuf,
}

impl Ffmpeg {
    /// Verify that the configured program, or else the `ffmpeg` binary, is reachable
    pub async fn new(program: Option<&Path>) -> Result<Self> {
        let program = program.map_or_else(|| PathBuf::from(FFMPEG), Path::to_path_buf);
        assert_success_command(&program, |cmd| cmd.arg("-version")).await?;

        Ok(Self { program })
    }

    /// Use the given program without probing it
    pub fn with_program<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl StreamMuxer for Ffmpeg {
    fn spawn_merge(&self, video: &Path, audio: &Path, output: &Path) -> Result<Child> {
        let cmd = build_command(
            &self.program,
            |cmd| {
                cmd.args(FFXXX_DEFAULT_ARGS)
                    .arg("-nostats")
                    .args([OsStr::new("-i"), video.as_os_str()])
                    .args([OsStr::new("-i"), audio.as_os_str()])
                    .args(["-map", "0:v:0", "-map", "1:a:0"])
                    .args(["-c:v", "copy", "-c:a", "copy"])
                    // Move the index to the front so playback can start before the end
                    .args(["-movflags", "+faststart"])
                    .args(["-max_muxing_queue_size", "9999"])
                    .args(["-progress", "pipe:1"])
                    .arg("-y")
                    .arg(output)
            },
            Capture::STDOUT | Capture::STDERR,
        );
        spawn_command(cmd)
    }
}
