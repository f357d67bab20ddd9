//! File arrival watcher for the camera's raw data folder.
//!
//! The camera backend gives no completion signal, so arrival is inferred from
//! the filesystem: take a baseline listing, poll for entries that were not in
//! it, and accept a candidate only once its size is non-zero and unchanged
//! across a stability window. A file still being written is re-examined on the
//! next poll rather than returned.
//!
//! The watcher only lists directories and reads sizes. It never deletes,
//! renames, or locks anything in the raw folder.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cancel::CancelHandle;
use crate::error::{AppResult, SnapError};

/// Choice among several candidates appearing in the same poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Directory listing order. Not deterministic across platforms.
    #[default]
    FirstListed,
    /// Most recently modified candidate first.
    NewestModified,
    /// Fail with [`SnapError::AmbiguousArrival`].
    RejectMultiple,
}

/// Polling parameters for [`FileWatcher`].
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Time between listings.
    pub poll_interval: Duration,
    /// Size must hold still this long.
    pub stability_window: Duration,
    /// Artifact extension, with or without a leading dot
    pub extension: String,
    /// Choice when several artifacts appear in one poll.
    pub tie_break: TieBreak,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            stability_window: Duration::from_secs(2),
            extension: "bin".to_string(),
            tie_break: TieBreak::FirstListed,
        }
    }
}

/// A size-stable artifact accepted by the watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrivedFile {
    /// File name.
    pub name: String,
    /// Full path.
    pub path: PathBuf,
    /// Stable size.
    pub size_bytes: u64,
}

/// Outcome of waiting for a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arrival {
    /// A new artifact.
    Found(ArrivedFile),
    /// Nothing within the timeout.
    TimedOut,
    /// The cancel handle fired.
    Cancelled,
}

/// Detects new artifacts in a raw folder by polling.
#[derive(Debug, Clone, Default)]
pub struct FileWatcher {
    config: WatcherConfig,
}

impl FileWatcher {
    /// Watcher with `config`.
    pub fn new(config: WatcherConfig) -> Self {
        Self { config }
    }

    /// Active settings.
    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    /// Snapshot the current listing of `dir`.
    ///
    /// Fails if the directory cannot be listed at all; later listing errors
    /// during [`Baseline::wait`] are treated as transient.
    pub async fn baseline(&self, dir: &Path) -> AppResult<Baseline> {
        let mut known = HashSet::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            known.insert(entry.file_name());
        }
        debug!("Baseline of '{}' holds {} entries", dir.display(), known.len());
        Ok(Baseline {
            config: self.config.clone(),
            dir: dir.to_path_buf(),
            known,
        })
    }

    /// Baseline `dir` now and wait up to `timeout` for a new artifact.
    pub async fn await_arrival(
        &self,
        dir: &Path,
        timeout: Duration,
    ) -> AppResult<Option<ArrivedFile>> {
        let baseline = self.baseline(dir).await?;
        match baseline.wait(timeout, &CancelHandle::new()).await? {
            Arrival::Found(file) => Ok(Some(file)),
            Arrival::TimedOut | Arrival::Cancelled => Ok(None),
        }
    }
}

/// Directory listing captured before a trigger.
#[derive(Debug, Clone)]
pub struct Baseline {
    config: WatcherConfig,
    dir: PathBuf,
    known: HashSet<OsString>,
}

struct Candidate {
    name: String,
    path: PathBuf,
    modified: Option<SystemTime>,
}

impl Baseline {
    /// Watched directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Poll until a new, size-stable artifact appears, `timeout` elapses, or
    /// `cancel` fires.
    pub async fn wait(&self, timeout: Duration, cancel: &CancelHandle) -> AppResult<Arrival> {
        let deadline = Instant::now() + timeout;
        info!("Waiting for new file in '{}'...", self.dir.display());

        loop {
            if cancel.is_cancelled() {
                return Ok(Arrival::Cancelled);
            }

            match self.new_candidates().await {
                Ok(candidates) => {
                    if self.config.tie_break == TieBreak::RejectMultiple && candidates.len() > 1 {
                        return Err(SnapError::AmbiguousArrival(
                            candidates.into_iter().map(|c| c.name).collect(),
                        ));
                    }
                    for candidate in candidates {
                        match self.check_stable(&candidate, cancel).await {
                            Some(Arrival::Found(file)) => {
                                info!(
                                    "New file detected: {} (size: {} bytes)",
                                    file.name, file.size_bytes
                                );
                                return Ok(Arrival::Found(file));
                            }
                            Some(other) => return Ok(other),
                            None => {}
                        }
                    }
                }
                Err(e) => warn!("Error checking for new files in '{}': {}", self.dir.display(), e),
            }

            let now = Instant::now();
            if now >= deadline {
                warn!("Timeout: no new file detected within {:?}", timeout);
                return Ok(Arrival::TimedOut);
            }
            let pause = self.config.poll_interval.min(deadline - now);
            if !cancel.sleep(pause).await {
                return Ok(Arrival::Cancelled);
            }
        }
    }

    /// `None` means "not yet": the candidate is empty, growing, or vanished.
    async fn check_stable(&self, candidate: &Candidate, cancel: &CancelHandle) -> Option<Arrival> {
        let first = match file_size(&candidate.path).await {
            Ok(size) => size,
            Err(e) => {
                warn!("Could not stat '{}': {}", candidate.path.display(), e);
                return None;
            }
        };
        if !cancel.sleep(self.config.stability_window).await {
            return Some(Arrival::Cancelled);
        }
        let second = match file_size(&candidate.path).await {
            Ok(size) => size,
            Err(e) => {
                warn!("Could not stat '{}': {}", candidate.path.display(), e);
                return None;
            }
        };

        if first == second && first > 0 {
            Some(Arrival::Found(ArrivedFile {
                name: candidate.name.clone(),
                path: candidate.path.clone(),
                size_bytes: second,
            }))
        } else {
            debug!(
                "'{}' not stable yet ({} -> {} bytes)",
                candidate.name, first, second
            );
            None
        }
    }

    async fn new_candidates(&self) -> std::io::Result<Vec<Candidate>> {
        let mut candidates = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if self.known.contains(&name) {
                continue;
            }
            let path = entry.path();
            if !has_extension(&path, &self.config.extension) {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            candidates.push(Candidate {
                name: name.to_string_lossy().into_owned(),
                path,
                modified: metadata.modified().ok(),
            });
        }

        if self.config.tie_break == TieBreak::NewestModified {
            candidates.sort_by(|a, b| b.modified.cmp(&a.modified));
        }
        Ok(candidates)
    }
}

fn has_extension(path: &Path, extension: &str) -> bool {
    let wanted = extension.trim_start_matches('.');
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(wanted))
}

async fn file_size(path: &Path) -> std::io::Result<u64> {
    Ok(tokio::fs::metadata(path).await?.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tracing_test::traced_test;

    fn fast_config() -> WatcherConfig {
        WatcherConfig {
            poll_interval: Duration::from_millis(20),
            stability_window: Duration::from_millis(60),
            ..WatcherConfig::default()
        }
    }

    #[tokio::test]
    async fn test_times_out_when_nothing_arrives() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.bin"), b"already here").unwrap();
        let watcher = FileWatcher::new(fast_config());

        let start = std::time::Instant::now();
        let found = watcher
            .await_arrival(dir.path(), Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(found, None);
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_returns_new_stable_file() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = FileWatcher::new(fast_config());
        let baseline = watcher.baseline(dir.path()).await.unwrap();

        std::fs::write(dir.path().join("ignored.txt"), b"not an artifact").unwrap();
        std::fs::write(dir.path().join("frame_0001.bin"), vec![7u8; 512]).unwrap();

        let arrival = baseline
            .wait(Duration::from_secs(2), &CancelHandle::new())
            .await
            .unwrap();
        match arrival {
            Arrival::Found(file) => {
                assert_eq!(file.name, "frame_0001.bin");
                assert_eq!(file.size_bytes, 512);
            }
            other => panic!("expected a file, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_file_is_not_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = FileWatcher::new(fast_config());
        let baseline = watcher.baseline(dir.path()).await.unwrap();
        std::fs::write(dir.path().join("empty.bin"), b"").unwrap();

        let arrival = baseline
            .wait(Duration::from_millis(250), &CancelHandle::new())
            .await
            .unwrap();
        assert_eq!(arrival, Arrival::TimedOut);
    }

    #[tokio::test]
    async fn test_growing_file_is_never_returned() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = FileWatcher::new(fast_config());
        let baseline = watcher.baseline(dir.path()).await.unwrap();

        let path = dir.path().join("growing.bin");
        let writer = tokio::spawn(async move {
            let mut file = std::fs::File::create(&path).unwrap();
            for _ in 0..40 {
                file.write_all(&[1u8; 64]).unwrap();
                file.flush().unwrap();
                tokio::time::sleep(Duration::from_millis(15)).await;
            }
        });

        let arrival = baseline
            .wait(Duration::from_millis(400), &CancelHandle::new())
            .await
            .unwrap();
        assert_eq!(arrival, Arrival::TimedOut);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_stops_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = FileWatcher::new(fast_config());
        let baseline = watcher.baseline(dir.path()).await.unwrap();
        let cancel = CancelHandle::new();
        let remote = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            remote.cancel();
        });

        let arrival = baseline.wait(Duration::from_secs(30), &cancel).await.unwrap();
        assert_eq!(arrival, Arrival::Cancelled);
    }

    #[tokio::test]
    async fn test_reject_multiple_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = FileWatcher::new(WatcherConfig {
            tie_break: TieBreak::RejectMultiple,
            ..fast_config()
        });
        let baseline = watcher.baseline(dir.path()).await.unwrap();
        std::fs::write(dir.path().join("a.bin"), b"aaaa").unwrap();
        std::fs::write(dir.path().join("b.bin"), b"bbbb").unwrap();

        let err = baseline
            .wait(Duration::from_secs(1), &CancelHandle::new())
            .await
            .unwrap_err();
        match err {
            SnapError::AmbiguousArrival(mut names) => {
                names.sort();
                assert_eq!(names, vec!["a.bin".to_string(), "b.bin".to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_newest_modified_wins() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = FileWatcher::new(WatcherConfig {
            tie_break: TieBreak::NewestModified,
            ..fast_config()
        });
        let baseline = watcher.baseline(dir.path()).await.unwrap();

        let older = std::fs::File::create(dir.path().join("a_older.bin")).unwrap();
        (&older).write_all(&[1u8; 32]).unwrap();
        older
            .set_modified(SystemTime::now() - Duration::from_secs(3600))
            .unwrap();
        drop(older);
        std::fs::write(dir.path().join("z_newer.bin"), [2u8; 32]).unwrap();

        let arrival = baseline
            .wait(Duration::from_secs(2), &CancelHandle::new())
            .await
            .unwrap();
        match arrival {
            Arrival::Found(file) => assert_eq!(file.name, "z_newer.bin"),
            other => panic!("expected a file, got {other:?}"),
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_listing_error_during_wait_is_transient() {
        let root = tempfile::tempdir().unwrap();
        let raw = root.path().join("raw");
        std::fs::create_dir(&raw).unwrap();
        let watcher = FileWatcher::new(fast_config());
        let baseline = watcher.baseline(&raw).await.unwrap();
        std::fs::remove_dir(&raw).unwrap();

        let arrival = baseline
            .wait(Duration::from_millis(150), &CancelHandle::new())
            .await
            .unwrap();

        assert_eq!(arrival, Arrival::TimedOut);
        assert!(logs_contain("Error checking for new files"));
    }

    #[tokio::test]
    async fn test_missing_directory_fails_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = FileWatcher::default();
        let result = watcher.baseline(&dir.path().join("nope")).await;
        assert!(matches!(result, Err(SnapError::Io(_))));
    }

    #[test]
    fn test_extension_filter() {
        assert!(has_extension(Path::new("x/frame.BIN"), "bin"));
        assert!(has_extension(Path::new("frame.bin"), ".bin"));
        assert!(!has_extension(Path::new("frame.hdr"), "bin"));
        assert!(!has_extension(Path::new("bin"), "bin"));
    }
}
