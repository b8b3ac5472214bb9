use std::sync::OnceLock;

use regex::Regex;

// Building blocks of the patterns below, kept apart so every piece
// can be read on its own instead of as one big regex string

/// A decimal number
macro_rules! number {
    () => {
        r#"\d+(?:\.\d+)?"#
    };
}
/// A 1024-based size unit, as printed by the extractor
macro_rules! unit {
    () => {
        r#"(?:[KMGT]i)?B"#
    };
}
/// A `hh:mm:ss.ss` clock value as printed by the muxer
macro_rules! clock {
    () => {
        r#"(?P<h>\d+):(?P<m>\d{2}):(?P<s>\d{2}(?:\.\d+)?)"#
    };
}

/// Download progress, e.g. `[download]  45.2% of ~381.10MiB`
const TRANSFER: &str = concat!(
    r#"(?P<percent>"#,
    number!(),
    r#")%\s+of\s+(?P<approx>~)?\s*(?P<size>"#,
    number!(),
    r#")\s*(?P<unit>"#,
    unit!(),
    r#")"#
);

/// Transfer rate, e.g. `at 2.34MiB/s`
const RATE: &str = concat!(
    r#"\bat\s+(?P<rate>"#,
    number!(),
    r#")\s*(?P<unit>"#,
    unit!(),
    r#")/s"#
);

/// Remaining time, e.g. `ETA 02:15` or `ETA 1:02:15`
const ETA: &str = r#"ETA\s+(?:(?P<h>\d+):)?(?P<m>\d{1,2}):(?P<s>\d{2})"#;

/// Byte-count fallbacks, in priority order
const FILE_SIZE: &str = r#"(?i)file size.*?(?P<bytes>\d+)"#;
const CONTENT_LENGTH: &str = r#"(?i)Content-Length.*?(?P<bytes>\d+)"#;
const BYTES: &str = r#"(?i)(?P<bytes>\d+)\s*bytes"#;

/// Input duration: `duration=00:03:00.00` or ffmpeg's `Duration: 00:03:00.00,`
const MERGE_DURATION: &str = concat!(r#"(?i)\bduration[=:]\s*"#, clock!());

/// Output position from `-progress`, e.g. `out_time=00:01:30.000000`
const MERGE_POSITION: &str = concat!(r#"\bout_time="#, clock!());

const DESTINATION: &str = r#"Destination:\s*(?P<path>.+)$"#;
const MERGER: &str = r#"\[Merger\]|Merging formats"#;
const DELETING: &str = r#"Deleting original file"#;

pub struct Patterns {
    pub transfer: Regex,
    pub rate: Regex,
    pub eta: Regex,
    pub size_fallbacks: [Regex; 3],
    pub merge_duration: Regex,
    pub merge_position: Regex,
    pub destination: Regex,
    pub merger: Regex,
    pub deleting: Regex,
}

static PATTERNS: OnceLock<Patterns> = OnceLock::new();

/// The compiled default pattern set.
///
/// The patterns are constants checked by the tests of this module,
/// so compiling them cannot fail at runtime.
pub fn patterns() -> &'static Patterns {
    PATTERNS.get_or_init(|| {
        let re = |pattern: &str| Regex::new(pattern).expect("constant pattern is valid");
        Patterns {
            transfer: re(TRANSFER),
            rate: re(RATE),
            eta: re(ETA),
            size_fallbacks: [re(FILE_SIZE), re(CONTENT_LENGTH), re(BYTES)],
            merge_duration: re(MERGE_DURATION),
            merge_position: re(MERGE_POSITION),
            destination: re(DESTINATION),
            merger: re(MERGER),
            deleting: re(DELETING),
        }
    })
}

/// Bytes per unit, 1024-based
pub fn unit_multiplier(unit: &str) -> f64 {
    match unit {
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    }
}
