//! Turn the free-text chatter of the external tools into structured facts.
//!
//! Everything here is stateless except [`LineSplitter`], which only buffers
//! the tail of a chunk until its line is complete, and [`SizeEstimate`],
//! which is owned by the job and fed by the caller.

mod patterns;
mod size;
mod splitter;

use regex::Captures;
use serde::Serialize;

use crate::types::Stage;

pub use size::SizeEstimate;
pub use splitter::LineSplitter;

use patterns::{patterns, unit_multiplier};

/// One structured observation of a job's progress
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressFact {
    pub stage: Stage,
    /// 0 to 100
    pub percent: f64,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    /// Bytes per second
    pub rate: Option<f64>,
    /// Seconds
    pub eta: Option<u64>,
    pub message: String,
}

/// A download progress report of the extractor
#[derive(Debug, Clone, PartialEq)]
pub struct Transfer {
    pub percent: f64,
    pub total_bytes: u64,
    /// The extractor only knows an approximation (`~` prefix)
    pub approximate: bool,
    pub rate: Option<f64>,
    pub eta: Option<u64>,
}

impl Transfer {
    pub fn downloaded_bytes(&self) -> u64 {
        (self.percent / 100.0 * self.total_bytes as f64).round() as u64
    }
}

/// Notable lines that are not progress reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker {
    Destination(String),
    Merging,
    DeletingOriginal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Fact {
    Transfer(Transfer),
    /// Total duration of the merge input, in seconds
    MergeDuration(f64),
    /// Current position of the merge output, in seconds
    MergePosition(f64),
    Marker(Marker),
}

/// What a single line says
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decoded {
    pub fact: Option<Fact>,
    /// A byte-exact size found by the fallback patterns
    pub size_hint: Option<u64>,
}

impl Decoded {
    pub fn is_empty(&self) -> bool {
        self.fact.is_none() && self.size_hint.is_none()
    }
}

/// A line-oriented decoder of tool diagnostics.
///
/// `size_known` tells whether the job already knows the media size, in which
/// case the byte-count fallbacks are not tried.
pub trait LineDecoder: Send + Sync {
    fn decode(&self, line: &str, size_known: bool) -> Decoded;
}

/// Decoder for the output of yt-dlp and ffmpeg
#[derive(Debug, Default, Clone, Copy)]
pub struct ToolDecoder;

impl LineDecoder for ToolDecoder {
    fn decode(&self, line: &str, size_known: bool) -> Decoded {
        let p = patterns();

        // Primary pattern: percent, size and the optional rate & ETA
        if let Some(cap) = p.transfer.captures(line) {
            return Decoded {
                fact: transfer_from(&cap, line).map(Fact::Transfer),
                size_hint: None,
            };
        }

        if let Some(cap) = p.merge_position.captures(line) {
            return fact(clock_seconds(&cap).map(Fact::MergePosition));
        }
        if let Some(cap) = p.merge_duration.captures(line) {
            return fact(clock_seconds(&cap).map(Fact::MergeDuration));
        }

        let marker = if let Some(cap) = p.destination.captures(line) {
            Some(Marker::Destination(cap["path"].trim().to_owned()))
        } else if p.merger.is_match(line) {
            Some(Marker::Merging)
        } else if p.deleting.is_match(line) {
            Some(Marker::DeletingOriginal)
        } else {
            None
        };

        let size_hint = if size_known {
            None
        } else {
            // First fallback yielding a non-zero count wins
            p.size_fallbacks
                .iter()
                .filter_map(|re| re.captures(line))
                .filter_map(|cap| cap["bytes"].parse::<u64>().ok())
                .find(|&bytes| bytes > 0)
        };

        Decoded {
            fact: marker.map(Fact::Marker),
            size_hint,
        }
    }
}

fn fact(fact: Option<Fact>) -> Decoded {
    Decoded {
        fact,
        size_hint: None,
    }
}

fn transfer_from(cap: &Captures, line: &str) -> Option<Transfer> {
    let p = patterns();

    let percent: f64 = cap["percent"].parse().ok()?;
    let size: f64 = cap["size"].parse().ok()?;
    let total_bytes = (size * unit_multiplier(&cap["unit"])).round() as u64;

    let rate = p.rate.captures(line).and_then(|cap| {
        let rate: f64 = cap["rate"].parse().ok()?;
        Some(rate * unit_multiplier(&cap["unit"]))
    });

    let eta = p.eta.captures(line).and_then(|cap| {
        let h: u64 = cap.name("h").map_or(Some(0), |h| h.as_str().parse().ok())?;
        let m: u64 = cap["m"].parse().ok()?;
        let s: u64 = cap["s"].parse().ok()?;
        Some(h * 3600 + m * 60 + s)
    });

    Some(Transfer {
        percent: percent.clamp(0.0, 100.0),
        total_bytes,
        approximate: cap.name("approx").is_some(),
        rate,
        eta,
    })
}

fn clock_seconds(cap: &Captures) -> Option<f64> {
    let h: f64 = cap["h"].parse().ok()?;
    let m: f64 = cap["m"].parse().ok()?;
    let s: f64 = cap["s"].parse().ok()?;
    Some(h * 3600.0 + m * 60.0 + s)
}

/// Merge completion from the input duration and the output position,
/// clamped to `[0, 100]`. Unknown while the duration is not positive.
pub fn merge_percent(duration: f64, position: f64) -> Option<f64> {
    (duration > 0.0).then(|| (position / duration * 100.0).clamp(0.0, 100.0))
}
