use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::{
    classify::PhraseTable,
    outside::ExtractorOptions,
    result::{err_msg, Result},
    types::Extension,
};

/// Prefix of the environment variables overriding the configuration file
pub const ENV_PREFIX: &str = "FETCHMUX";

/// Wall-clock budget of each phase, in seconds
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Timeouts {
    pub catalog: u64,
    pub download: u64,
    pub merge: u64,
    pub stream: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            catalog: 40,
            download: 30 * 60,
            merge: 15 * 60,
            stream: 30 * 60,
        }
    }
}

/// How long files may stay in the scratch directory, in seconds
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Retention {
    /// Any file
    pub stale: u64,
    /// Files left by a failed job
    pub orphan: u64,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            stale: 30 * 60,
            orphan: 5 * 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub listen: SocketAddr,
    pub scratch_dir: PathBuf,
    /// Smallest video height offered by the catalog
    pub min_height: u32,
    /// Seconds to wait before deleting a delivered file
    pub delete_delay: u64,
    pub timeouts: Timeouts,
    pub retention: Retention,
    /// Explicit extractor program, skipping the `yt-dlp` / `youtube-dl` discovery
    pub ytdl_program: Option<PathBuf>,
    pub ffmpeg_program: Option<PathBuf>,
    pub extractor: ExtractorOptions,
    pub error_phrases: PhraseTable,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            scratch_dir: std::env::temp_dir().join("fetchmux"),
            min_height: 144,
            delete_delay: 1,
            timeouts: Timeouts::default(),
            retention: Retention::default(),
            ytdl_program: None,
            ffmpeg_program: None,
            extractor: ExtractorOptions::default(),
            error_phrases: PhraseTable::default(),
        }
    }
}

impl Settings {
    /// Load the settings from an optional TOML file, overridden by the
    /// `FETCHMUX_*` environment variables (`__` separates nested keys).
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(file) = file {
            builder = builder.add_source(File::from(file).required(false));
        }

        builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("extractor.headers")
                    .with_list_parse_key("extractor.extractor_args"),
            )
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|e| err_msg(format!("Invalid configuration: {e}")))
    }

    /// The container of every delivered file
    pub fn container(&self) -> Extension {
        Extension::parse(&self.extractor.merge_container).unwrap_or(Extension::Mp4)
    }

    pub fn delete_delay(&self) -> Duration {
        Duration::from_secs(self.delete_delay)
    }

    pub fn stale_retention(&self) -> Duration {
        Duration::from_secs(self.retention.stale)
    }

    pub fn orphan_retention(&self) -> Duration {
        Duration::from_secs(self.retention.orphan)
    }
}

impl Timeouts {
    pub fn catalog(&self) -> Duration {
        Duration::from_secs(self.catalog)
    }

    pub fn download(&self) -> Duration {
        Duration::from_secs(self.download)
    }

    pub fn merge(&self) -> Duration {
        Duration::from_secs(self.merge)
    }

    pub fn stream(&self) -> Duration {
        Duration::from_secs(self.stream)
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(Some(&dir.path().join("absent.toml"))).unwrap();

        assert_eq!(settings.retention, Retention::default());
        assert_eq!(settings.container(), Extension::Mp4);
        assert_eq!(settings.error_phrases, PhraseTable::default());
    }

    #[test]
    fn file_values_are_merged_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fetchmux.toml");
        std::fs::write(
            &path,
            indoc! {r#"
                listen = "0.0.0.0:9000"
                scratch_dir = "/srv/scratch"

                [retention]
                orphan = 60

                [extractor]
                merge_container = "mkv"
                impersonate = "chrome"

                [error_phrases]
                version = 7
                rate_limited = ["quota exceeded"]
            "#},
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.listen.port(), 9000);
        assert_eq!(settings.scratch_dir, PathBuf::from("/srv/scratch"));
        assert_eq!(settings.orphan_retention(), Duration::from_secs(60));
        assert_eq!(settings.stale_retention(), Duration::from_secs(30 * 60));
        assert_eq!(settings.container(), Extension::Mkv);
        assert_eq!(settings.extractor.impersonate.as_deref(), Some("chrome"));
        assert_eq!(settings.extractor.retries, 10);

        // Replaced as a whole version, missing kinds fall back to the defaults
        assert_eq!(settings.error_phrases.version, 7);
        assert_eq!(settings.error_phrases.rate_limited, vec!["quota exceeded"]);
        assert_eq!(
            settings.error_phrases.bot_detection,
            PhraseTable::default().bot_detection
        );
    }

    #[test]
    fn environment_overrides_nested_keys() {
        std::env::set_var("FETCHMUX_TIMEOUTS__MERGE", "42");
        let settings = Settings::load(None).unwrap();
        std::env::remove_var("FETCHMUX_TIMEOUTS__MERGE");

        assert_eq!(settings.timeouts.merge(), Duration::from_secs(42));
        assert_eq!(settings.timeouts.catalog(), Duration::from_secs(40));
    }
}
