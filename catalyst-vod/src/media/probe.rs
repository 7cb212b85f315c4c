//! Source probing with a retry ladder.
//!
//! ffprobe execution is behind [`MediaProber`]; this module owns the retry
//! policy: three exponential attempts against the URL, and one local-disk
//! retry when the probe was killed or timed out (some stores throttle
//! ranged reads hard enough to starve a remote probe).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::config::CoordinatorConfig;
use crate::error::JobError;
use crate::job::model::InputVideo;
use crate::retry::{RetryAction, RetryPolicy, retry_with_backoff};
use crate::storage::ObjectStore;

/// Error type for a single probe attempt.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("probe process was killed")]
    Killed,

    #[error("probe timed out")]
    TimedOut,

    #[error("probe failed: {reason}")]
    Failed { reason: String },
}

impl ProbeError {
    /// Killed/timed-out probes are worth retrying against a local copy.
    fn wants_local_retry(&self) -> bool {
        matches!(self, Self::Killed | Self::TimedOut)
    }
}

/// ffprobe seam. Implementations apply the configured per-attempt deadline.
#[async_trait]
pub trait MediaProber: Send + Sync {
    async fn probe_url(&self, url: &str) -> Result<InputVideo, ProbeError>;

    async fn probe_path(&self, path: &Path) -> Result<InputVideo, ProbeError>;
}

/// Probe `url` with retries, falling back to a local download once when the
/// remote probe is killed or times out.
pub async fn probe_source(
    prober: &Arc<dyn MediaProber>,
    store: &Arc<dyn ObjectStore>,
    url: &str,
) -> Result<InputVideo, JobError> {
    let policy = RetryPolicy::exponential(2, Duration::from_secs(1), Duration::from_secs(8));
    let outcome = retry_with_backoff(&policy, "probe", |_| async {
        match prober.probe_url(url).await {
            Ok(input) => RetryAction::Success(Ok(input)),
            Err(e) if e.wants_local_retry() => {
                // Bail out of the retry loop; the local path takes over.
                RetryAction::Success(Err(e))
            }
            Err(e) => RetryAction::Retry(JobError::Probe {
                reason: e.to_string(),
            }),
        }
    })
    .await?;

    let remote_err = match outcome {
        Ok(input) => return Ok(input),
        Err(e) => e,
    };

    warn!(url, error = %remote_err, "remote probe starved, retrying against a local copy");
    let bytes = store.read(url).await?;
    let mut file = tempfile::NamedTempFile::new().map_err(|e| JobError::Probe {
        reason: format!("creating local probe copy: {e}"),
    })?;
    let path = file.path().to_path_buf();
    let mut writer = tokio::fs::File::create(&path)
        .await
        .map_err(|e| JobError::Probe {
            reason: format!("writing local probe copy: {e}"),
        })?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| JobError::Probe {
            reason: format!("writing local probe copy: {e}"),
        })?;
    writer.flush().await.map_err(|e| JobError::Probe {
        reason: format!("writing local probe copy: {e}"),
    })?;

    let result = prober.probe_path(&path).await.map_err(|e| JobError::Probe {
        reason: format!("local probe after {remote_err}: {e}"),
    });
    file.close().ok();
    result
}

/// Reject inputs the pipelines cannot process.
pub fn validate_input(input: &InputVideo, config: &CoordinatorConfig) -> Result<(), JobError> {
    let video = input
        .video_track()
        .ok_or_else(|| JobError::invalid_input("no video track in source"))?;
    if video.fps <= 0.0 {
        // Motion-JPEG and similar report no frame rate.
        return Err(JobError::invalid_input(format!(
            "invalid source frame rate {}",
            video.fps
        )));
    }
    if input.size_bytes > config.max_input_size_bytes {
        return Err(JobError::invalid_input(format!(
            "source is {} bytes, over the {} byte limit",
            input.size_bytes, config.max_input_size_bytes
        )));
    }
    Ok(())
}
