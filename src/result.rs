use std::{fmt::Display, time::Duration};

use miette::miette;

/// Errors crossing the acquisition pipeline boundary.
///
/// Subprocess failures are classified once, when the exit is observed,
/// and only the classified variant travels further. Anything unexpected
/// (I/O on the scratch directory, broken pipes, ...) is carried as a
/// [`miette::Report`].
#[derive(Debug)]
pub enum Error {
    /// The extractor metadata query failed. Carries the tool diagnostic.
    CatalogFailed(String),
    /// The extractor answered but its output is not valid metadata.
    MetadataParseFailed(String),
    /// The extractor hit an authentication challenge; a cookie file is needed.
    BotDetectionRequired,
    /// The requested variant is no longer offered.
    VariantUnavailable,
    /// The extractor reported HTTP 429 / too many requests.
    RateLimited,
    /// The extractor reported a 403-class failure.
    AccessForbidden,
    /// Generic extractor failure with no specific classification.
    DownloadFailed(String),
    /// The muxer failed or its inputs could not be located.
    MergeFailed(String),
    /// A phase exceeded its wall-clock budget.
    Timeout { phase: &'static str, after: Duration },
    /// The client went away.
    Cancelled,
    /// A tool binary could not be started.
    SpawnFailed { program: String, reason: String },
    /// The caller sent something the pipeline cannot act on.
    InvalidRequest(String),
    /// No such file in the scratch directory, or not anymore.
    FileNotFound(String),

    Miette(miette::Report),
}

impl Error {
    /// Stable machine-readable code for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::CatalogFailed(_) => "catalog_failed",
            Error::MetadataParseFailed(_) => "metadata_parse_failed",
            Error::BotDetectionRequired => "bot_detection_required",
            Error::VariantUnavailable => "variant_unavailable",
            Error::RateLimited => "rate_limited",
            Error::AccessForbidden => "access_forbidden",
            Error::DownloadFailed(_) => "download_failed",
            Error::MergeFailed(_) => "merge_failed",
            Error::Timeout { .. } => "timeout",
            Error::Cancelled => "cancelled",
            Error::SpawnFailed { .. } => "spawn_failed",
            Error::InvalidRequest(_) => "invalid_request",
            Error::FileNotFound(_) => "file_not_found",
            Error::Miette(_) => "internal",
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::CatalogFailed(diag) => write!(f, "Could not query the stream catalog: {diag}"),
            Error::MetadataParseFailed(msg) => {
                write!(f, "Extractor output is not valid metadata: {msg}")
            }
            Error::BotDetectionRequired => write!(
                f,
                "The source requires a sign-in challenge. Upload a cookie file and retry"
            ),
            Error::VariantUnavailable => write!(f, "The requested quality is no longer available"),
            Error::RateLimited => write!(f, "The source is rate limiting requests. Try again later"),
            Error::AccessForbidden => write!(f, "Access to the source was denied (403)"),
            Error::DownloadFailed(diag) => write!(f, "Download failed: {diag}"),
            Error::MergeFailed(msg) => write!(f, "Merging video and audio failed: {msg}"),
            Error::Timeout { phase, after } => {
                write!(f, "The {phase} phase timed out after {}s", after.as_secs())
            }
            Error::Cancelled => write!(f, "Cancelled by the client"),
            Error::SpawnFailed { program, reason } => {
                write!(f, "Could not start '{program}': {reason}")
            }
            Error::InvalidRequest(msg) => write!(f, "Invalid request: {msg}"),
            Error::FileNotFound(name) => write!(f, "No file named '{name}'"),
            Error::Miette(report) => write!(f, "{report}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<miette::Report> for Error {
    fn from(err: miette::Report) -> Self {
        Error::Miette(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Miette(miette!("{err}"))
    }
}

impl From<Error> for miette::Report {
    fn from(err: Error) -> Self {
        match err {
            Error::Miette(err) => err,
            err => miette!("{err}"),
        }
    }
}

/// Build an internal error from a message
pub fn err_msg<D: Display + Send + Sync + 'static>(msg: D) -> Error {
    Error::Miette(miette!("{msg}"))
}

/// Return early with an internal error built from a message
pub fn bail<T, D: Display + Send + Sync + 'static>(msg: D) -> Result<T> {
    Err(err_msg(msg))
}

pub type Result<T> = std::result::Result<T, Error>;
