//! Waiting for the external acquisition service to finish a download
//!
//! The acquisition service drops archives into a scene directory. A
//! download is complete when at least one artifact exists, no partial file
//! remains and artifact sizes did not change between two polls.

use crate::types::{ForestError, ForestResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Polling parameters for [`DownloadMonitor`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadParams {
    /// First poll delay
    pub initial_interval_ms: u64,
    /// Upper bound of the poll delay
    pub max_interval_ms: u64,
    /// Delay multiplier after each poll
    pub backoff_factor: f64,
    /// Overall wait limit
    pub timeout_secs: u64,
    /// Suffix of in-progress files
    pub partial_suffix: String,
    /// Suffixes of finished artifacts
    pub artifact_suffixes: Vec<String>,
}

impl Default for DownloadParams {
    fn default() -> Self {
        Self {
            initial_interval_ms: 1_000,
            max_interval_ms: 30_000,
            backoff_factor: 2.0,
            timeout_secs: 1_800,
            partial_suffix: ".crdownload".to_string(),
            artifact_suffixes: vec![".tar".to_string()],
        }
    }
}

impl DownloadParams {
    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> ForestResult<()> {
        if self.initial_interval_ms == 0 || self.max_interval_ms < self.initial_interval_ms {
            return Err(ForestError::Config(format!(
                "poll interval must satisfy 0 < initial ({} ms) <= max ({} ms)",
                self.initial_interval_ms, self.max_interval_ms
            )));
        }
        if !(self.backoff_factor >= 1.0) {
            return Err(ForestError::Config(format!(
                "backoff factor must be >= 1, got {}",
                self.backoff_factor
            )));
        }
        if self.artifact_suffixes.is_empty() {
            return Err(ForestError::Config("no artifact suffix configured".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct DirSnapshot {
    /// (path, size) of finished artifacts, sorted by path
    artifacts: Vec<(PathBuf, u64)>,
    partial: usize,
}

/// Exponential-backoff poller for completed downloads
#[derive(Debug, Clone)]
pub struct DownloadMonitor {
    params: DownloadParams,
}

impl DownloadMonitor {
    pub fn new(params: DownloadParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &DownloadParams {
        &self.params
    }

    pub fn is_partial(&self, file_name: &str) -> bool {
        file_name.ends_with(&self.params.partial_suffix)
    }

    pub fn is_artifact(&self, file_name: &str) -> bool {
        let lower = file_name.to_ascii_lowercase();
        self.params
            .artifact_suffixes
            .iter()
            .any(|s| lower.ends_with(&s.to_ascii_lowercase()))
    }

    /// Wait until the downloads in `dir` are complete and return the artifacts
    pub async fn wait_for_artifacts(
        &self,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> ForestResult<Vec<PathBuf>> {
        let timeout = self.params.timeout();
        log::info!("Waiting up to {:?} for downloads in {}", timeout, dir.display());

        tokio::select! {
            _ = cancel.cancelled() => {
                log::warn!("Download wait cancelled: {}", dir.display());
                Err(ForestError::Cancelled)
            }
            result = tokio::time::timeout(timeout, self.poll_until_complete(dir)) => match result {
                Ok(artifacts) => artifacts,
                Err(_) => Err(ForestError::Timeout(timeout)),
            },
        }
    }

    async fn poll_until_complete(&self, dir: &Path) -> ForestResult<Vec<PathBuf>> {
        let mut delay = self.params.initial_interval();
        let mut previous: Option<Vec<(PathBuf, u64)>> = None;
        let mut polls = 0usize;

        loop {
            polls += 1;
            let snapshot = self.snapshot(dir).await?;

            if snapshot.partial == 0 && !snapshot.artifacts.is_empty() {
                if previous.as_ref() == Some(&snapshot.artifacts) {
                    log::info!(
                        "Download complete after {} polls: {} artifact(s)",
                        polls,
                        snapshot.artifacts.len()
                    );
                    return Ok(snapshot.artifacts.into_iter().map(|(p, _)| p).collect());
                }
                previous = Some(snapshot.artifacts);
            } else {
                log::debug!(
                    "Poll {}: {} partial, {} artifact(s), next in {:?}",
                    polls,
                    snapshot.partial,
                    snapshot.artifacts.len(),
                    delay
                );
                previous = None;
            }

            tokio::time::sleep(delay).await;
            delay = delay.mul_f64(self.params.backoff_factor).min(self.params.max_interval());
        }
    }

    async fn snapshot(&self, dir: &Path) -> ForestResult<DirSnapshot> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(DirSnapshot::default()),
            Err(e) => return Err(e.into()),
        };

        let mut snapshot = DirSnapshot::default();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if self.is_partial(&name) {
                snapshot.partial += 1;
            } else if self.is_artifact(&name) {
                let size = entry.metadata().await?.len();
                snapshot.artifacts.push((entry.path(), size));
            }
        }
        snapshot.artifacts.sort();
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_params() -> DownloadParams {
        DownloadParams {
            initial_interval_ms: 5,
            max_interval_ms: 20,
            timeout_secs: 5,
            ..DownloadParams::default()
        }
    }

    #[test]
    fn test_name_classification() {
        let monitor = DownloadMonitor::new(DownloadParams::default());
        assert!(monitor.is_partial("LC08_L2SP_008057_20210115.tar.crdownload"));
        assert!(monitor.is_artifact("LC08_L2SP_008057_20210115.TAR"));
        assert!(!monitor.is_artifact("LC08_L2SP_008057_20210115.tar.crdownload"));
    }

    #[test]
    fn test_validate() {
        assert!(DownloadParams::default().validate().is_ok());
        let bad = DownloadParams {
            backoff_factor: 0.5,
            ..DownloadParams::default()
        };
        assert!(matches!(bad.validate(), Err(ForestError::Config(_))));
    }

    #[tokio::test]
    async fn test_completed_download_is_found() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("scene.tar"), b"archive").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let monitor = DownloadMonitor::new(fast_params());
        let found = monitor
            .wait_for_artifacts(dir.path(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(found, vec![dir.path().join("scene.tar")]);
    }

    #[tokio::test]
    async fn test_cancelled_wait() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("scene.tar.crdownload"), b"partial").unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let monitor = DownloadMonitor::new(fast_params());
        let result = monitor.wait_for_artifacts(dir.path(), &cancel).await;
        assert!(matches!(result, Err(ForestError::Cancelled)));
    }
}
