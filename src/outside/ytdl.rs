use std::{
    ffi::OsStr,
    fmt::Debug,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use super::command::{
    assert_success_command, build_command, spawn_command, Capture, YT_DL, YT_DLP,
};
use crate::result::{bail, Result};

/// Where the extractor should write the media it fetches
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    /// A live byte stream on standard output
    Stdout,
    /// A file template in the scratch directory (`<stem>.%(ext)s`)
    Template(PathBuf),
}

/// Everything needed to launch one extraction
#[derive(Debug, Clone)]
pub struct DownloadSpec {
    pub url: String,
    pub format: String,
    pub target: OutputTarget,
}

/// Interface for the program locating and fetching elementary streams
pub trait StreamExtractor: Send + Sync + Debug {
    /// Start a metadata-only query printing one JSON document on stdout.
    fn spawn_catalog(&self, url: &str) -> Result<Child>;

    /// Start fetching the given format selection.
    ///
    /// Both stdout and stderr are piped. With [`OutputTarget::Stdout`] the
    /// media bytes arrive on stdout and the progress chatter on stderr.
    fn spawn_download(&self, spec: &DownloadSpec) -> Result<Child>;
}

/// Flags shaping every extractor invocation
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtractorOptions {
    /// Cookie jar handed to the extractor when the file exists
    pub cookies_file: PathBuf,
    /// Container used when the extractor merges formats itself
    pub merge_container: String,
    /// Following options only apply when no cookie file is present
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    pub headers: Vec<String>,
    pub extractor_args: Vec<String>,
    pub impersonate: Option<String>,
    pub retries: u32,
}

impl Default for ExtractorOptions {
    fn default() -> Self {
        Self {
            cookies_file: PathBuf::from("./uploads/cookies.txt"),
            merge_container: "mp4".to_owned(),
            user_agent: Some(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
                    .to_owned(),
            ),
            referer: Some("https://www.youtube.com/".to_owned()),
            headers: vec![
                "Accept-Language:en-US,en;q=0.9".to_owned(),
                "Accept:text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"
                    .to_owned(),
            ],
            extractor_args: vec!["youtube:player_client=android,ios,web".to_owned()],
            impersonate: None,
            retries: 10,
        }
    }
}

/// Interface for the [yt-dlp](https://github.com/yt-dlp/yt-dlp) program
#[derive(Debug)]
pub struct Ytdl {
    program: PathBuf,
    options: ExtractorOptions,
}

impl Ytdl {
    /// Verify that the configured program, or else `yt-dlp` or `youtube-dl`, is reachable
    pub async fn new(program: Option<&Path>, options: ExtractorOptions) -> Result<Self> {
        if let Some(program) = program {
            assert_success_command(program, |cmd| cmd.arg("--version")).await?;
            return Ok(Self::with_program(program, options));
        }

        if assert_success_command(YT_DLP, |cmd| cmd.arg("--version"))
            .await
            .is_ok()
        {
            Ok(Self::with_program(YT_DLP, options))
        } else if assert_success_command(YT_DL, |cmd| cmd.arg("--version"))
            .await
            .is_ok()
        {
            Ok(Self::with_program(YT_DL, options))
        } else {
            bail("Neither yt-dlp nor youtube-dl found")
        }
    }

    /// Use the given program without probing it
    pub fn with_program<P: Into<PathBuf>>(program: P, options: ExtractorOptions) -> Self {
        Self {
            program: program.into(),
            options,
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn has_cookies(&self) -> bool {
        self.options.cookies_file.is_file()
    }

    /// Append the authentication flags: the cookie jar when there is one,
    /// the bot-mitigation set otherwise.
    fn auth_args<'c>(&self, cmd: &'c mut Command) -> &'c mut Command {
        if self.has_cookies() {
            info!("Using cookies file {}", self.options.cookies_file.display());
            return cmd.args([OsStr::new("--cookies"), self.options.cookies_file.as_os_str()]);
        }

        debug!("No cookies found, applying bot mitigation flags");
        let opts = &self.options;
        for extractor_args in &opts.extractor_args {
            cmd.args(["--extractor-args", extractor_args.as_str()]);
        }
        if let Some(user_agent) = &opts.user_agent {
            cmd.args(["--user-agent", user_agent.as_str()]);
        }
        if let Some(referer) = &opts.referer {
            cmd.args(["--referer", referer.as_str()]);
        }
        for header in &opts.headers {
            cmd.args(["--add-header", header.as_str()]);
        }
        if let Some(target) = &opts.impersonate {
            cmd.args(["--impersonate", target.as_str()]);
        }
        let retries = opts.retries.to_string();
        cmd.args(["--extractor-retries", retries.as_str()])
            .args(["--retries", retries.as_str()])
            .args(["--fragment-retries", retries.as_str()])
    }
}

impl StreamExtractor for Ytdl {
    fn spawn_catalog(&self, url: &str) -> Result<Child> {
        let cmd = build_command(
            &self.program,
            |cmd| {
                let cmd = cmd.arg("-J").arg("--no-playlist").arg("--skip-download");
                self.auth_args(cmd).arg("--").arg(url)
            },
            Capture::STDOUT | Capture::STDERR,
        );
        spawn_command(cmd)
    }

    fn spawn_download(&self, spec: &DownloadSpec) -> Result<Child> {
        let cmd = build_command(
            &self.program,
            |cmd| {
                let cmd = cmd.args(["-f", spec.format.as_str()]);
                let cmd = match &spec.target {
                    OutputTarget::Stdout => cmd.args(["-o", "-"]),
                    OutputTarget::Template(template) => {
                        cmd.args([OsStr::new("-o"), template.as_os_str()])
                    }
                };
                let cmd = cmd
                    .args(["--merge-output-format", self.options.merge_container.as_str()])
                    .arg("--no-playlist")
                    // One progress report per line instead of carriage returns
                    .arg("--newline");
                self.auth_args(cmd).arg("--").arg(&spec.url)
            },
            Capture::STDOUT | Capture::STDERR,
        );
        spawn_command(cmd)
    }
}
