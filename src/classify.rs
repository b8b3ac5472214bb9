//! Classification of tool failures from their diagnostic output.
//!
//! The wording of the extractor changes over time, so the phrases live in a
//! versioned table that the configuration can replace as a whole.

use std::collections::VecDeque;

use serde::Deserialize;

use crate::result::Error;

/// How much diagnostic text is kept for classification
pub const TAIL_CAPACITY: usize = 10 * 1024;

/// What a failure diagnostic is about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    BotDetection,
    RateLimited,
    Forbidden,
    Unavailable,
}

impl FailureKind {
    pub fn into_error(self) -> Error {
        match self {
            FailureKind::BotDetection => Error::BotDetectionRequired,
            FailureKind::RateLimited => Error::RateLimited,
            FailureKind::Forbidden => Error::AccessForbidden,
            FailureKind::Unavailable => Error::VariantUnavailable,
        }
    }
}

/// Known phrases of each failure kind, matched case-insensitively.
///
/// Kinds are tried in declaration order, the first matching one wins.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PhraseTable {
    pub version: u32,
    pub bot_detection: Vec<String>,
    pub rate_limited: Vec<String>,
    pub forbidden: Vec<String>,
    pub unavailable: Vec<String>,
}

impl Default for PhraseTable {
    fn default() -> Self {
        let owned = |phrases: &[&str]| phrases.iter().map(|s| s.to_string()).collect();
        Self {
            version: 1,
            bot_detection: owned(&[
                "sign in to confirm you're not a bot",
                "sign in to confirm",
                "confirm you’re not a bot",
                "login required",
                "use --cookies-from-browser or --cookies",
            ]),
            rate_limited: owned(&["http error 429", "too many requests"]),
            forbidden: owned(&["http error 403", "403: forbidden", "403 forbidden"]),
            unavailable: owned(&[
                "requested format is not available",
                "requested format not available",
                "format is not available",
            ]),
        }
    }
}

impl PhraseTable {
    /// Find the failure kind the diagnostic text talks about
    pub fn classify(&self, diagnostic: &str) -> Option<FailureKind> {
        let lower = diagnostic.to_lowercase();
        let matches = |phrases: &[String]| {
            phrases
                .iter()
                .any(|phrase| lower.contains(&phrase.to_lowercase()))
        };

        [
            (&self.bot_detection, FailureKind::BotDetection),
            (&self.rate_limited, FailureKind::RateLimited),
            (&self.forbidden, FailureKind::Forbidden),
            (&self.unavailable, FailureKind::Unavailable),
        ]
        .into_iter()
        .find(|(phrases, _)| matches(phrases))
        .map(|(_, kind)| kind)
    }

    /// Turn a failed download into the error crossing the pipeline boundary
    pub fn download_error(&self, diagnostic: &str) -> Error {
        self.classify(diagnostic).map_or_else(
            || Error::DownloadFailed(last_error_line(diagnostic)),
            FailureKind::into_error,
        )
    }
}

/// The most telling line of a diagnostic: the last `ERROR:` line, or else
/// the last non-empty one.
pub fn last_error_line(diagnostic: &str) -> String {
    let lines = || diagnostic.lines().map(str::trim).filter(|l| !l.is_empty());
    let line = lines()
        .filter(|l| l.to_lowercase().starts_with("error"))
        .last()
        .or_else(|| lines().last())
        .unwrap_or("no diagnostic output");

    line.strip_prefix("ERROR:")
        .map_or(line, str::trim)
        .to_owned()
}

/// The last [`TAIL_CAPACITY`] bytes of a diagnostic stream
#[derive(Debug, Clone, Default)]
pub struct DiagnosticTail {
    buf: VecDeque<u8>,
}

impl DiagnosticTail {
    pub fn push_line(&mut self, line: &str) {
        self.buf.extend(line.as_bytes());
        self.buf.push_back(b'\n');

        let excess = self.buf.len().saturating_sub(TAIL_CAPACITY);
        self.buf.drain(..excess);
    }

    pub fn text(&self) -> String {
        let (a, b) = self.buf.as_slices();
        let mut bytes = Vec::with_capacity(self.buf.len());
        bytes.extend_from_slice(a);
        bytes.extend_from_slice(b);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}
