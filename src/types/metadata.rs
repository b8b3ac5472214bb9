use serde::{Deserialize, Serialize};

/// Top-level description of a source, as reported by the extractor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub title: String,
    pub uploader: String,
    /// Seconds
    pub duration: f64,
}

impl Default for MediaMetadata {
    fn default() -> Self {
        Self {
            title: "Video".to_owned(),
            uploader: "Unknown".to_owned(),
            duration: 0.0,
        }
    }
}
