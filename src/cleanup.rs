//! Recording retention.
//!
//! Deletes recording files older than the configured retention window.
//! One synchronous pass runs at startup; a recurring worker repeats it on
//! the configured interval. Both are best-effort and never fatal to the
//! daemon.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::config::CleanupSettings;
use crate::worker::{StopToken, Worker};

/// Sleep slice for the recurring worker so stop requests are observed.
const WAIT_SLICE: Duration = Duration::from_millis(250);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub removed: u64,
    pub kept: u64,
}

/// One synchronous retention pass over the recordings directory.
///
/// A missing directory is not an error; nothing has been recorded yet.
pub fn run_once(settings: &CleanupSettings) -> Result<CleanupStats> {
    if !settings.recordings_dir.exists() {
        log::debug!(
            "recordings directory {} does not exist, nothing to clean",
            settings.recordings_dir.display()
        );
        return Ok(CleanupStats::default());
    }

    let window = Duration::from_secs(settings.retain_days.saturating_mul(86_400));
    let cutoff = SystemTime::now().checked_sub(window).unwrap_or(UNIX_EPOCH);
    let stats = sweep(&settings.recordings_dir, cutoff)?;

    if stats.removed > 0 {
        log::info!(
            "cleanup removed {} stale recordings ({} kept)",
            stats.removed,
            stats.kept
        );
    } else {
        log::debug!("cleanup found no stale recordings ({} kept)", stats.kept);
    }
    Ok(stats)
}

/// Remove regular files modified before `cutoff`. Subdirectories are left
/// alone. Per-entry failures are logged and skipped so one bad file does
/// not end the pass.
fn sweep(dir: &Path, cutoff: SystemTime) -> Result<CleanupStats> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("failed to read recordings directory {}", dir.display()))?;

    let mut stats = CleanupStats::default();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                log::warn!("skipping unreadable entry in {}: {}", dir.display(), err);
                continue;
            }
        };
        let path = entry.path();
        match is_stale(&path, cutoff) {
            Ok(Some(true)) => {
                if let Err(err) = fs::remove_file(&path) {
                    log::warn!("failed to remove {}: {}", path.display(), err);
                    stats.kept += 1;
                } else {
                    stats.removed += 1;
                }
            }
            Ok(Some(false)) => stats.kept += 1,
            Ok(None) => {}
            Err(err) => {
                log::warn!("skipping {}: {}", path.display(), err);
            }
        }
    }
    Ok(stats)
}

/// `Some(true)` when the path is a regular file older than the cutoff,
/// `None` when it is not a regular file at all.
fn is_stale(path: &Path, cutoff: SystemTime) -> Result<Option<bool>> {
    let metadata = fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?;
    if !metadata.is_file() {
        return Ok(None);
    }
    let modified = metadata
        .modified()
        .with_context(|| format!("failed to read mtime of {}", path.display()))?;
    Ok(Some(modified < cutoff))
}

/// Start the recurring retention worker. Each pass failure is logged and
/// the schedule continues.
pub fn start_recurring(settings: CleanupSettings) -> Result<Worker> {
    let interval = Duration::from_secs(settings.interval_hours.saturating_mul(3_600));
    let mut worker = Worker::new("cleanup", move |token| {
        while wait_interval(&token, interval) {
            if let Err(err) = run_once(&settings) {
                log::warn!("recurring cleanup pass failed: {}", err);
            }
        }
        Ok(())
    });
    worker.start()?;
    Ok(worker)
}

/// Sleep through `interval` in slices. Returns false once a stop request
/// is observed. Tracks elapsed time rather than a deadline `Instant`;
/// adding a large `Duration` to an `Instant` can overflow.
fn wait_interval(token: &StopToken, interval: Duration) -> bool {
    let started = Instant::now();
    while started.elapsed() < interval {
        if token.is_stop_requested() {
            return false;
        }
        thread::sleep(WAIT_SLICE.min(interval.saturating_sub(started.elapsed())));
    }
    !token.is_stop_requested()
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).expect("create file");
        file.write_all(b"frame data").expect("write file");
        path
    }

    #[test]
    fn sweep_removes_files_older_than_cutoff() {
        let dir = tempfile::tempdir().expect("tempdir");
        let old = write_file(dir.path(), "old.mp4");
        let keeper = write_file(dir.path(), "new.mp4");

        // A cutoff in the future makes every existing file stale.
        let future = SystemTime::now() + Duration::from_secs(3_600);
        let stats = sweep(dir.path(), future).expect("sweep");

        assert_eq!(stats.removed, 2);
        assert_eq!(stats.kept, 0);
        assert!(!old.exists());
        assert!(!keeper.exists());
    }

    #[test]
    fn sweep_keeps_files_newer_than_cutoff() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keeper = write_file(dir.path(), "fresh.mp4");

        let stats = sweep(dir.path(), UNIX_EPOCH).expect("sweep");

        assert_eq!(stats.removed, 0);
        assert_eq!(stats.kept, 1);
        assert!(keeper.exists());
    }

    #[test]
    fn sweep_leaves_subdirectories_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let subdir = dir.path().join("archive");
        fs::create_dir(&subdir).expect("create subdir");

        let future = SystemTime::now() + Duration::from_secs(3_600);
        let stats = sweep(dir.path(), future).expect("sweep");

        assert_eq!(stats.removed, 0);
        assert!(subdir.exists());
    }

    #[test]
    fn run_once_tolerates_missing_directory() {
        let settings = CleanupSettings {
            recordings_dir: "/nonexistent/vigil-recordings".into(),
            retain_days: 7,
            interval_hours: 24,
        };
        let stats = run_once(&settings).expect("missing dir is not an error");
        assert_eq!(stats, CleanupStats::default());
    }

    #[test]
    fn recurring_worker_with_huge_interval_stops_cleanly() {
        let settings = CleanupSettings {
            recordings_dir: "/nonexistent/vigil-recordings".into(),
            retain_days: 1,
            interval_hours: u64::MAX,
        };
        let mut worker = start_recurring(settings).expect("start recurring cleanup");
        thread::sleep(Duration::from_millis(50));
        worker.stop();
        worker.join().expect("worker exits without panicking");
    }
}
