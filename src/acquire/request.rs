use serde::Deserialize;

use crate::result::{Error, Result};

/// What a client asks for.
///
/// The field aliases accept the names older clients send.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcquisitionRequest {
    pub url: String,
    /// The chosen video variant
    #[serde(alias = "format")]
    pub video_id: String,
    /// The chosen audio variant for a merge, `bestaudio` is used when absent
    #[serde(default, alias = "bestAudioId")]
    pub audio_id: Option<String>,
    /// The video variant carries no audio track
    #[serde(default, alias = "needsAudioMerge")]
    pub merge_required: bool,
    /// Used to name the delivered file
    #[serde(default)]
    pub title: Option<String>,
}

impl AcquisitionRequest {
    pub fn new<U: Into<String>, V: Into<String>>(url: U, video_id: V) -> Self {
        Self {
            url: url.into(),
            video_id: video_id.into(),
            audio_id: None,
            merge_required: false,
            title: None,
        }
    }

    pub fn with_audio<A: Into<String>>(mut self, audio_id: A) -> Self {
        self.audio_id = Some(audio_id.into());
        self
    }

    pub fn merged(mut self, merge_required: bool) -> Self {
        self.merge_required = merge_required;
        self
    }

    /// Reject requests that cannot be handed to the extractor
    pub fn validate(&self) -> Result<()> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err(Error::InvalidRequest("missing url".to_owned()));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(Error::InvalidRequest(format!("'{url}' is not an http(s) url")));
        }

        let is_format_id = |id: &str| {
            !id.is_empty()
                && id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "-_.=".contains(c))
        };
        if !is_format_id(&self.video_id) {
            return Err(Error::InvalidRequest(format!(
                "'{}' is not a format id",
                self.video_id
            )));
        }
        if let Some(audio_id) = self.audio_id.as_deref().filter(|id| !is_format_id(id)) {
            return Err(Error::InvalidRequest(format!("'{audio_id}' is not a format id")));
        }

        Ok(())
    }

    /// Whether two elementary streams are fetched, which only a file can hold.
    ///
    /// An audio id without `merge_required` is ignored, the video variant
    /// already carries its own audio.
    pub fn fetches_two_streams(&self) -> bool {
        self.merge_required
    }

    /// The format selection handed to the extractor
    pub fn format_selector(&self) -> String {
        if !self.merge_required {
            return self.video_id.clone();
        }
        match &self.audio_id {
            Some(audio_id) => format!("{}+{audio_id}", self.video_id),
            None => format!("{}+bestaudio", self.video_id),
        }
    }
}
