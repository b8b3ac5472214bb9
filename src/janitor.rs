use std::{
    path::PathBuf,
    time::{Duration, SystemTime},
};

use serde::Serialize;
use tracing::{debug, info, warn};

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub deleted_files: usize,
    pub bytes_freed: u64,
    pub errors: Vec<String>,
}

/// Deletes the files of the scratch directory once they are old enough.
///
/// It only relies on file modification times, so it also reaps the files of
/// jobs that did not survive a crash.
#[derive(Debug, Clone)]
pub struct Janitor {
    scratch_dir: PathBuf,
}

impl Janitor {
    pub fn new<P: Into<PathBuf>>(scratch_dir: P) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
        }
    }

    /// Sweep from the async world, on a blocking thread
    pub async fn sweep(&self, max_age: Duration) -> SweepReport {
        let janitor = self.clone();
        tokio::task::spawn_blocking(move || janitor.sweep_blocking(max_age))
            .await
            .unwrap_or_else(|err| SweepReport {
                errors: vec![format!("sweep task failed: {err}")],
                ..Default::default()
            })
    }

    /// Delete every file whose last modification is older than `max_age`.
    ///
    /// Failures are collected in the report, never returned: a file that
    /// cannot be deleted now will be tried again on the next sweep.
    pub fn sweep_blocking(&self, max_age: Duration) -> SweepReport {
        self.delete_where(|_, age| age > max_age)
    }

    /// Delete every file of a job, whatever its age
    pub async fn reap_job(&self, stem: &str) -> SweepReport {
        let janitor = self.clone();
        let prefix = format!("{stem}.");
        let reap = move || janitor.delete_where(|name, _| name.starts_with(&prefix));
        tokio::task::spawn_blocking(reap)
            .await
            .unwrap_or_else(|err| SweepReport {
                errors: vec![format!("reap task failed: {err}")],
                ..Default::default()
            })
    }

    /// Delete the files for which `doomed(file name, age)` holds
    fn delete_where<F>(&self, doomed: F) -> SweepReport
    where
        F: Fn(&str, Duration) -> bool,
    {
        let mut report = SweepReport::default();

        let entries = match std::fs::read_dir(&self.scratch_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("No scratch directory at {}", self.scratch_dir.display());
                return report;
            }
            Err(err) => {
                report
                    .errors
                    .push(format!("{}: {err}", self.scratch_dir.display()));
                return report;
            }
        };

        let now = SystemTime::now();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    report.errors.push(err.to_string());
                    continue;
                }
            };
            let path = entry.path();

            let metadata = match entry.metadata() {
                Ok(metadata) if metadata.is_file() => metadata,
                Ok(_) => continue,
                Err(err) => {
                    report.errors.push(format!("{}: {err}", path.display()));
                    continue;
                }
            };

            // A modification time in the future counts as brand new
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            let name = entry.file_name();
            if !doomed(&name.to_string_lossy(), age) {
                continue;
            }

            match std::fs::remove_file(&path) {
                Ok(()) => {
                    debug!("Deleted {}", path.display());
                    report.deleted_files += 1;
                    report.bytes_freed += metadata.len();
                }
                Err(err) => {
                    warn!("Could not delete {}: {err}", path.display());
                    report.errors.push(format!("{}: {err}", path.display()));
                }
            }
        }

        if report.deleted_files > 0 || !report.errors.is_empty() {
            info!(
                "Sweep deleted {} files ({} bytes), {} errors",
                report.deleted_files,
                report.bytes_freed,
                report.errors.len()
            );
        }
        report
    }
}
