//! Naming conventions of the scratch directory.
//!
//! Every job writes files named `<stem>.<something>` where the stem is unique
//! to the job, so concurrent jobs never collide and the janitor only needs
//! the directory to do its work.

use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use heck::ToKebabCase;
use tracing::{debug, warn};

use crate::{
    result::{Error, Result},
    types::Extension,
};

/// Suffixes of files the extractor is still writing or has given up on
const INCOMPLETE_SUFFIXES: [&str; 4] = [".part", ".ytdl", ".temp", ".tmp"];

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

/// Create a new collision-resistant file stem for a job
pub fn job_stem() -> String {
    let suffix: String = std::iter::repeat_with(fastrand::alphanumeric)
        .take(8)
        .collect();
    format!("dl_{}_{suffix}", unix_millis())
}

/// The extractor output template of a job: `<dir>/<stem>.%(ext)s`
pub fn output_template(dir: &Path, stem: &str) -> PathBuf {
    dir.join(format!("{stem}.%(ext)s"))
}

/// The file the extractor writes when it merged the streams itself
pub fn merged_path(dir: &Path, stem: &str, container: Extension) -> PathBuf {
    dir.join(format!("{stem}{}", container.with_dot()))
}

/// The file our own merge writes
pub fn remux_path(dir: &Path, stem: &str, container: Extension) -> PathBuf {
    dir.join(format!("{stem}.merged{}", container.with_dot()))
}

/// Name of the attachment sent to the client.
///
/// The title is kebab-cased and restricted to ASCII so it fits in a header.
pub fn attachment_name(title: Option<&str>, ext: Extension) -> String {
    let title = title
        .map(|t| {
            t.to_kebab_case()
                .chars()
                .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
                .collect::<String>()
        })
        .map(|t| t.trim_matches('-').to_owned())
        .filter(|t| !t.is_empty());

    match title {
        Some(title) => format!("{title}{}", ext.with_dot()),
        None => format!("video_{}{}", unix_millis(), ext.with_dot()),
    }
}

/// Resolve a file name received from a client to a path inside `dir`.
///
/// Only bare file names are accepted.
pub fn served_file(dir: &Path, name: &str) -> Result<PathBuf> {
    let is_bare = !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\'])
        && Path::new(name).file_name().is_some_and(|n| n == name);

    if is_bare {
        Ok(dir.join(name))
    } else {
        Err(Error::InvalidRequest(format!("'{name}' is not a file name")))
    }
}

/// What a finished extraction left in the scratch directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifacts {
    /// One playable file, nothing to merge
    Complete(PathBuf),
    /// Separate video and audio parts to merge
    Parts { video: PathBuf, audio: PathBuf },
    /// Not enough to go on. Carries whatever files were found.
    Missing(Vec<PathBuf>),
}

/// The format id marker the extractor puts in intermediate file names:
/// `<stem>.f<id>.<ext>`
fn format_marker(path: &Path, stem: &str) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let rest = name.strip_prefix(stem)?.strip_prefix(".f")?;
    let (id, _ext) = rest.rsplit_once('.')?;
    (!id.is_empty()).then(|| id.to_owned())
}

fn is_incomplete(path: &Path) -> bool {
    let name = path.to_string_lossy();
    INCOMPLETE_SUFFIXES.iter().any(|s| name.ends_with(s))
}

/// List the finished files of a job
pub fn job_files(dir: &Path, stem: &str) -> Result<Vec<PathBuf>> {
    let prefix = format!("{stem}.");
    let mut files = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };

        let path = entry.path();
        if name.starts_with(&prefix) && path.is_file() && !is_incomplete(&path) {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}

/// Recover the outcome of an extraction from the files sharing the job stem.
///
/// The format id marker of the intermediate files decides first. Files
/// without a usable marker are recognized by their extension.
pub fn locate_artifacts(
    dir: &Path,
    stem: &str,
    video_id: &str,
    audio_id: Option<&str>,
) -> Result<Artifacts> {
    let files = job_files(dir, stem)?;
    debug!("Files left by the extraction: {files:?}");

    let marked = |wanted: &dyn Fn(&str) -> bool| {
        files
            .iter()
            .find(|p| format_marker(p, stem).is_some_and(|id| wanted(&id)))
            .cloned()
    };

    let mut video = marked(&|id: &str| id == video_id);
    let mut audio = match audio_id {
        Some(audio_id) => marked(&|id: &str| id == audio_id),
        // `bestaudio` was requested, its id is unknown
        None => marked(&|id: &str| id != video_id),
    };

    let by_ext = |check: fn(Extension) -> bool, taken: &[Option<PathBuf>]| {
        files
            .iter()
            .filter(|p| !taken.iter().flatten().any(|t| t == *p))
            .find(|p| Extension::from_path(p).is_some_and(check))
            .cloned()
    };
    if video.is_none() {
        video = by_ext(Extension::is_video_container, &[audio.clone()]);
    }
    if audio.is_none() {
        audio = by_ext(Extension::is_audio_container, &[video.clone()]);
    }

    Ok(match (video, audio) {
        (Some(video), Some(audio)) => Artifacts::Parts { video, audio },
        (Some(single), None) if files.len() == 1 && format_marker(&single, stem).is_none() => {
            Artifacts::Complete(single)
        }
        _ => Artifacts::Missing(files),
    })
}

/// Delete a file after a delay, in the background
pub fn schedule_delete(path: PathBuf, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!("Deleted {}", path.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!("Could not delete {}: {err}", path.display()),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch_all(dir: &Path, names: &[&str]) {
        for name in names {
            std::fs::write(dir.join(name), b"data").unwrap();
        }
    }

    #[test]
    fn stems_do_not_repeat() {
        let a = job_stem();
        let b = job_stem();
        assert!(a.starts_with("dl_"));
        assert_ne!(a, b);
    }

    #[test]
    fn parts_found_by_format_marker() {
        let dir = tempfile::tempdir().unwrap();
        touch_all(
            dir.path(),
            &[
                "dl_x.f137.mp4",
                "dl_x.f251.webm",
                "dl_x.f140.m4a",
                "dl_y.f140.m4a",
            ],
        );

        let found = locate_artifacts(dir.path(), "dl_x", "137", Some("251")).unwrap();
        assert_eq!(
            found,
            Artifacts::Parts {
                video: dir.path().join("dl_x.f137.mp4"),
                audio: dir.path().join("dl_x.f251.webm"),
            }
        );
    }

    #[test]
    fn best_audio_part_is_the_other_marker() {
        let dir = tempfile::tempdir().unwrap();
        touch_all(dir.path(), &["dl_x.f248.webm", "dl_x.f251.webm"]);

        let found = locate_artifacts(dir.path(), "dl_x", "248", None).unwrap();
        assert_eq!(
            found,
            Artifacts::Parts {
                video: dir.path().join("dl_x.f248.webm"),
                audio: dir.path().join("dl_x.f251.webm"),
            }
        );
    }

    #[test]
    fn parts_found_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        touch_all(dir.path(), &["dl_x.webm", "dl_x.m4a", "dl_x.webm.part"]);

        let found = locate_artifacts(dir.path(), "dl_x", "137", Some("140")).unwrap();
        assert_eq!(
            found,
            Artifacts::Parts {
                video: dir.path().join("dl_x.webm"),
                audio: dir.path().join("dl_x.m4a"),
            }
        );
    }

    #[test]
    fn single_file_is_complete() {
        let dir = tempfile::tempdir().unwrap();
        touch_all(dir.path(), &["dl_x.mkv"]);

        let found = locate_artifacts(dir.path(), "dl_x", "18", None).unwrap();
        assert_eq!(found, Artifacts::Complete(dir.path().join("dl_x.mkv")));
    }

    #[test]
    fn missing_parts() {
        let dir = tempfile::tempdir().unwrap();
        touch_all(dir.path(), &["dl_x.f137.mp4"]);

        let found = locate_artifacts(dir.path(), "dl_x", "137", Some("140")).unwrap();
        assert_eq!(found, Artifacts::Missing(vec![dir.path().join("dl_x.f137.mp4")]));
    }

    #[test]
    fn attachment_names() {
        assert_eq!(
            attachment_name(Some("My Great Video!"), Extension::Mp4),
            "my-great-video.mp4"
        );
        assert!(attachment_name(Some("日本語"), Extension::Webm).starts_with("video_"));
        assert!(attachment_name(None, Extension::Mp4).ends_with(".mp4"));
    }

    #[test]
    fn served_file_rejects_paths() {
        let dir = Path::new("/scratch");
        assert_eq!(
            served_file(dir, "dl_x.mp4").unwrap(),
            PathBuf::from("/scratch/dl_x.mp4")
        );
        for name in ["../etc/passwd", "a/b", "", ".hidden", ".."] {
            assert!(served_file(dir, name).is_err(), "{name}");
        }
    }
}
