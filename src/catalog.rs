//! Query the extractor for the stream variants of a source and keep the
//! ones worth offering.

use std::{cmp::Reverse, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    classify::{last_error_line, FailureKind, PhraseTable},
    outside::StreamExtractor,
    result::{Error, Result},
    types::MediaMetadata,
};

/// Codec tag the extractor uses for an absent track
const NO_CODEC: &str = "none";

/// One format entry of the extractor JSON document.
///
/// Numbers are read as floats as the extractor is not consistent in the
/// way it prints them.
#[derive(Debug, Deserialize)]
struct RawFormat {
    format_id: String,
    ext: Option<String>,
    format_note: Option<String>,
    height: Option<f64>,
    width: Option<f64>,
    fps: Option<f64>,
    vcodec: Option<String>,
    acodec: Option<String>,
    abr: Option<f64>,
    tbr: Option<f64>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawInfo {
    title: Option<String>,
    uploader: Option<String>,
    duration: Option<f64>,
    #[serde(default)]
    formats: Vec<RawFormat>,
}

/// One stream the extractor can produce
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamVariant {
    /// Opaque identifier used to request this variant again
    pub format_id: String,
    pub ext: String,
    pub format_note: Option<String>,
    pub height: Option<u32>,
    pub width: Option<u32>,
    pub fps: Option<f64>,
    /// Audio bitrate in kbit/s, or the total bitrate when the former is unknown
    pub abr: Option<f64>,
    pub vcodec: String,
    pub acodec: String,
    pub filesize: Option<u64>,
    /// `filesize` is the extractor's estimate, not a declared size
    pub filesize_approximate: bool,
    /// Video without audio, which must be merged with an audio variant
    pub needs_audio_merge: bool,
}

impl StreamVariant {
    pub fn has_video(&self) -> bool {
        self.vcodec != NO_CODEC
    }

    pub fn has_audio(&self) -> bool {
        self.acodec != NO_CODEC
    }

    pub fn is_audio_only(&self) -> bool {
        self.has_audio() && !self.has_video()
    }
}

/// Whether a video variant must be merged with a separate audio variant.
///
/// Only the audio codec tag decides, not the requested format string.
pub fn needs_audio_merge(acodec: &str) -> bool {
    acodec == NO_CODEC
}

/// What the extractor offers for a source
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Catalog {
    pub metadata: MediaMetadata,
    /// Sorted by descending height, at most one per height
    pub variants: Vec<StreamVariant>,
    /// The audio-only variant with the highest bitrate
    pub best_audio: Option<StreamVariant>,
}

/// Run the metadata query of the extractor and build the catalog out of it
pub async fn resolve(
    extractor: &dyn StreamExtractor,
    url: &str,
    budget: Duration,
    phrases: &PhraseTable,
    min_height: u32,
) -> Result<Catalog> {
    info!("Resolving the stream catalog of {url}");
    let child = extractor.spawn_catalog(url)?;

    // The child is killed when the pending future is dropped
    let output = tokio::time::timeout(budget, child.wait_with_output())
        .await
        .map_err(|_| Error::Timeout {
            phase: "catalog",
            after: budget,
        })??;

    let stderr = String::from_utf8_lossy(&output.stderr);
    if !output.status.success() {
        warn!("Catalog query exited with {}", output.status);

        if output.stdout.iter().all(u8::is_ascii_whitespace) {
            return Err(phrases.classify(&stderr).map_or_else(
                || Error::CatalogFailed(last_error_line(&stderr)),
                FailureKind::into_error,
            ));
        }
        debug!("Trying to use the output despite the failure");
    }

    let catalog = parse_catalog(&output.stdout, min_height)?;
    info!(
        "Found {} variants for '{}'",
        catalog.variants.len(),
        catalog.metadata.title
    );
    Ok(catalog)
}

/// Parse the extractor JSON document and apply the offering policy
pub fn parse_catalog(json: &[u8], min_height: u32) -> Result<Catalog> {
    let info: RawInfo =
        serde_json::from_slice(json).map_err(|e| Error::MetadataParseFailed(e.to_string()))?;
    Ok(build_catalog(info, min_height))
}

fn build_catalog(info: RawInfo, min_height: u32) -> Catalog {
    let default = MediaMetadata::default();
    let metadata = MediaMetadata {
        title: info.title.unwrap_or(default.title),
        uploader: info.uploader.unwrap_or(default.uploader),
        duration: info.duration.unwrap_or(default.duration),
    };

    let mut variants: Vec<StreamVariant> = info
        .formats
        .into_iter()
        .map(into_variant)
        .filter(|v| is_offered(v, min_height))
        .collect();

    variants.sort_by_key(|v| (Reverse(v.height), Reverse(v.filesize)));

    // Before deduplication, as every audio-only variant shares the same (absent) height
    let best_audio = variants
        .iter()
        .filter(|v| v.is_audio_only())
        .max_by(|a, b| {
            let key = |v: &StreamVariant| (v.abr.unwrap_or(0.0), v.filesize.unwrap_or(0));
            key(a).partial_cmp(&key(b)).unwrap_or(std::cmp::Ordering::Equal)
        })
        .cloned();

    // Sorted, so keeping the first of each height keeps the largest
    variants.dedup_by_key(|v| v.height);

    Catalog {
        metadata,
        variants,
        best_audio,
    }
}

fn into_variant(raw: RawFormat) -> StreamVariant {
    let codec = |c: Option<String>| {
        c.filter(|c| !c.is_empty())
            .unwrap_or_else(|| NO_CODEC.to_owned())
    };
    let vcodec = codec(raw.vcodec);
    let acodec = codec(raw.acodec);

    let (filesize, filesize_approximate) = match (raw.filesize, raw.filesize_approx) {
        (Some(size), _) => (Some(size.round() as u64), false),
        (None, Some(size)) => (Some(size.round() as u64), true),
        (None, None) => (None, false),
    };

    StreamVariant {
        needs_audio_merge: vcodec != NO_CODEC && needs_audio_merge(&acodec),
        format_id: raw.format_id,
        ext: raw.ext.unwrap_or_default(),
        format_note: raw.format_note,
        height: raw.height.map(|h| h.round() as u32),
        width: raw.width.map(|w| w.round() as u32),
        fps: raw.fps,
        abr: raw.abr.or(raw.tbr),
        vcodec,
        acodec,
        filesize,
        filesize_approximate,
    }
}

fn is_offered(v: &StreamVariant, min_height: u32) -> bool {
    let tall_enough = v.height.is_some_and(|h| h >= min_height);
    (v.has_video() && tall_enough) || v.is_audio_only()
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    const INFO: &str = indoc! {r#"
        {
          "id": "abc",
          "title": "A talk",
          "uploader": "Someone",
          "duration": 180.5,
          "formats": [
            {"format_id": "sb0", "ext": "mhtml", "vcodec": "none", "acodec": "none", "height": 90},
            {"format_id": "139", "ext": "m4a", "vcodec": "none", "acodec": "mp4a.40.5", "abr": 48.8, "filesize": 1000},
            {"format_id": "140", "ext": "m4a", "vcodec": "none", "acodec": "mp4a.40.2", "abr": 129.5, "filesize": 3000},
            {"format_id": "251", "ext": "webm", "vcodec": "none", "acodec": "opus", "abr": 120.1, "filesize": 2800},
            {"format_id": "160", "ext": "mp4", "vcodec": "avc1.4d400c", "acodec": "none", "height": 144, "filesize": 500},
            {"format_id": "278", "ext": "webm", "vcodec": "vp9", "acodec": "none", "height": 144, "filesize": 700},
            {"format_id": "tiny", "ext": "mp4", "vcodec": "avc1", "acodec": "none", "height": 120},
            {"format_id": "18", "ext": "mp4", "vcodec": "avc1.42001E", "acodec": "mp4a.40.2", "height": 360, "filesize_approx": 9000},
            {"format_id": "137", "ext": "mp4", "vcodec": "avc1.640028", "acodec": "none", "height": 1080, "width": 1920, "fps": 30, "filesize": 90000},
            {"format_id": "248", "ext": "webm", "vcodec": "vp9", "acodec": "none", "height": 1080, "filesize": 80000},
            {"format_id": "22", "ext": "mp4", "vcodec": "avc1", "height": 720}
          ]
        }
    "#};

    fn catalog() -> Catalog {
        parse_catalog(INFO.as_bytes(), 144).unwrap()
    }

    #[test]
    fn heights_strictly_decrease() {
        let catalog = catalog();
        let heights: Vec<_> = catalog.variants.iter().map(|v| v.height).collect();
        assert_eq!(heights, vec![Some(1080), Some(720), Some(360), Some(144), None]);
    }

    #[test]
    fn largest_variant_kept_per_height() {
        let catalog = catalog();
        let ids: Vec<_> = catalog.variants.iter().map(|v| v.format_id.as_str()).collect();
        assert_eq!(ids, vec!["137", "22", "18", "278", "140"]);
    }

    #[test]
    fn offering_policy() {
        for v in catalog().variants {
            assert!(
                (v.has_video() && v.height.unwrap_or(0) >= 144) || v.is_audio_only(),
                "{v:?}"
            );
            assert!(v.has_video() || v.has_audio());
        }
    }

    #[test]
    fn merge_flag_follows_audio_codec() {
        let catalog = catalog();
        for v in catalog.variants.iter().filter(|v| v.has_video()) {
            assert_eq!(v.needs_audio_merge, v.acodec == "none", "{v:?}");
        }

        let combined = catalog.variants.iter().find(|v| v.format_id == "18").unwrap();
        assert!(!combined.needs_audio_merge);
        assert!(combined.filesize_approximate);
        assert_eq!(combined.filesize, Some(9000));
    }

    #[test]
    fn missing_audio_codec_counts_as_none() {
        // Format 22 has no acodec at all
        let catalog = catalog();
        let v = catalog.variants.iter().find(|v| v.format_id == "22").unwrap();
        assert_eq!(v.acodec, "none");
        assert!(v.needs_audio_merge);
    }

    #[test]
    fn best_audio_has_highest_bitrate() {
        let best = catalog().best_audio.unwrap();
        assert_eq!(best.format_id, "140");
        assert!(best.is_audio_only());
    }

    #[test]
    fn metadata_defaults() {
        let empty = parse_catalog(br#"{"formats": []}"#, 144).unwrap();
        assert_eq!(empty.metadata, MediaMetadata::default());
        assert!(empty.variants.is_empty());
        assert!(empty.best_audio.is_none());

        let full = catalog();
        assert_eq!(full.metadata.title, "A talk");
        assert_eq!(full.metadata.duration, 180.5);
    }

    #[test]
    fn invalid_json_is_a_parse_failure() {
        match parse_catalog(b"WARNING: not json", 144) {
            Err(Error::MetadataParseFailed(_)) => {}
            other => panic!("unexpected {other:?}"),
        }
    }
}
