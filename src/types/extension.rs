use std::path::Path;

/// Container formats the tools write into the scratch directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extension {
    Mp4,
    Webm,
    Mkv,
    M4a,
    Mp3,
    Opus,
    Ogg,
    Aac,
}

impl Extension {
    /// Return the extension with the leading dot.
    /// e.g. ".ext"
    pub fn with_dot(self) -> &'static str {
        match self {
            Extension::Mp4 => ".mp4",
            Extension::Webm => ".webm",
            Extension::Mkv => ".mkv",
            Extension::M4a => ".m4a",
            Extension::Mp3 => ".mp3",
            Extension::Opus => ".opus",
            Extension::Ogg => ".ogg",
            Extension::Aac => ".aac",
        }
    }

    /// Return the extension without the leading dot.
    /// e.g. "ext"
    pub fn with_no_dot(self) -> &'static str {
        &self.with_dot()[1..]
    }

    /// Containers that usually carry the video elementary stream
    pub fn is_video_container(self) -> bool {
        matches!(self, Extension::Mp4 | Extension::Webm | Extension::Mkv)
    }

    /// Containers that usually carry the audio elementary stream
    pub fn is_audio_container(self) -> bool {
        matches!(
            self,
            Extension::M4a | Extension::Mp3 | Extension::Opus | Extension::Ogg | Extension::Aac
        )
    }

    /// Parse an extension, without its dot.
    /// Return None in case of unknown extension.
    pub fn parse(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "mp4" => Some(Self::Mp4),
            "webm" => Some(Self::Webm),
            "mkv" => Some(Self::Mkv),
            "m4a" => Some(Self::M4a),
            "mp3" => Some(Self::Mp3),
            "opus" => Some(Self::Opus),
            "ogg" => Some(Self::Ogg),
            "aac" => Some(Self::Aac),
            _ => None,
        }
    }

    /// Parse the path file extension.
    /// Return None in case of no or invalid extension.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Option<Self> {
        path.as_ref()
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::parse)
    }

    /// MIME type to announce when delivering a file of this container
    pub fn mime_type(self) -> String {
        mime_guess::from_ext(self.with_no_dot())
            .first()
            .map_or_else(|| "application/octet-stream".to_owned(), |m| m.to_string())
    }
}
