//! Coordinator configuration.
//!
//! Loading is the embedding process's concern; these structs only define the
//! knobs and their defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration for the coordinator and its pipelines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Default pipeline strategy; a job payload may override it.
    pub strategy: String,
    /// Region label stamped onto every job for callbacks and metrics.
    pub catalyst_region: String,
    /// Base URL under which the segmenter writes `{request_id}/source/index.m3u8`.
    pub source_output_base_url: String,
    /// When set, output locations are rewritten onto this base for playback.
    pub publish_base_url: Option<String>,
    /// Concurrent per-segment transcode workers.
    pub transcoding_parallel_jobs: usize,
    /// Delay between transcode worker launches in milliseconds.
    pub transcoding_parallel_sleep_ms: u64,
    /// Per-segment download retry budget: attempts beyond the first.
    pub segment_download_max_retries: u32,
    /// Constant backoff between segment download retries, in milliseconds.
    pub segment_download_backoff_ms: u64,
    /// Hard budget for copying the source into working storage, in seconds.
    pub max_copy_file_duration_secs: u64,
    /// Probe deadline per attempt, in seconds.
    pub probe_timeout_secs: u64,
    /// Deadline for an external transcode, in seconds.
    pub external_transcode_timeout_secs: u64,
    /// Maximum accepted source size in bytes.
    pub max_input_size_bytes: u64,
    /// Output shaping knobs.
    #[serde(default)]
    pub outputs: OutputsConfig,
}

/// Policy knobs for MP4 / fragmented-MP4 generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputsConfig {
    /// HLS recordings longer than this never get an MP4, to bound in-memory
    /// concatenation.
    pub max_recording_mp4_duration_secs: u64,
    /// `mp4_only_short` jobs only get an MP4 when the source is at most this
    /// long.
    pub mp4_short_cutoff_secs: u64,
    /// Whether the synthetic `low-bitrate` rendition participates in MP4
    /// generation.
    pub mp4_for_low_bitrate: bool,
}

impl Default for OutputsConfig {
    fn default() -> Self {
        Self {
            max_recording_mp4_duration_secs: 12 * 60 * 60,
            mp4_short_cutoff_secs: 2 * 60,
            mp4_for_low_bitrate: false,
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            strategy: "fallback_external".to_string(),
            catalyst_region: String::new(),
            source_output_base_url: String::new(),
            publish_base_url: None,
            transcoding_parallel_jobs: 4,
            transcoding_parallel_sleep_ms: 500,
            segment_download_max_retries: 10,
            segment_download_backoff_ms: 5_000,
            max_copy_file_duration_secs: 30 * 60,
            probe_timeout_secs: 60,
            external_transcode_timeout_secs: 6 * 60 * 60,
            max_input_size_bytes: 30 * 1024 * 1024 * 1024,
            outputs: OutputsConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn transcoding_parallel_sleep(&self) -> Duration {
        Duration::from_millis(self.transcoding_parallel_sleep_ms)
    }

    pub fn segment_download_backoff(&self) -> Duration {
        Duration::from_millis(self.segment_download_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.strategy, "fallback_external");
        assert_eq!(config.segment_download_max_retries, 10);
        assert_eq!(config.segment_download_backoff(), Duration::from_secs(5));
        assert_eq!(config.max_input_size_bytes, 30 * 1024 * 1024 * 1024);
        assert_eq!(config.outputs.max_recording_mp4_duration_secs, 43_200);
        assert!(!config.outputs.mp4_for_low_bitrate);
    }

    #[test]
    fn deserializes_with_partial_outputs() {
        let config: CoordinatorConfig = serde_json::from_str(
            r#"{
                "strategy": "catalyst_ffmpeg",
                "catalyst_region": "mdw",
                "source_output_base_url": "s3+https://u:p@host/transcoding",
                "publish_base_url": null,
                "transcoding_parallel_jobs": 2,
                "transcoding_parallel_sleep_ms": 0,
                "segment_download_max_retries": 3,
                "segment_download_backoff_ms": 100,
                "max_copy_file_duration_secs": 60,
                "probe_timeout_secs": 10,
                "external_transcode_timeout_secs": 600,
                "max_input_size_bytes": 1000
            }"#,
        )
        .unwrap();
        assert_eq!(config.catalyst_region, "mdw");
        assert_eq!(config.outputs.mp4_short_cutoff_secs, 120);
    }
}
