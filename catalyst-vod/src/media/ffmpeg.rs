//! FFmpeg driver seam.
//!
//! Subprocess invocation lives outside the coordinator; the pipelines drive
//! it through this trait. Implementations are expected to honor the option
//! structs below rather than re-deciding encoder settings.

use async_trait::async_trait;
use bytes::Bytes;

use hls_vod::BoundaryEncodeSettings;

use crate::error::JobError;

/// MP4 remux flags: `movflags` value and the audio bitstream filter applied
/// when repackaging ADTS AAC out of MPEG-TS.
pub const MP4_MOVFLAGS: &str = "faststart";
pub const MP4_AUDIO_BITSTREAM_FILTER: &str = "aac_adtstoasc";

/// How the source is split into `.ts` segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentingMode {
    /// Copy codecs, mux to TS. Fast, but segment boundaries follow the
    /// source's keyframe placement.
    FastCopy,
    /// H.264 + AAC re-encode with keyframes forced roughly every 3s and
    /// timestamps reset; the fallback when fast-copy segments do not start
    /// on keyframes.
    Reencode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentingOptions {
    pub mode: SegmentingMode,
    pub target_segment_size_secs: u64,
}

/// One named output file from a mux operation.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaFile {
    pub name: String,
    pub bytes: Bytes,
}

/// The FFmpeg operations the pipelines need.
#[async_trait]
pub trait FfmpegDriver: Send + Sync {
    /// Segment `source_url` into `.ts` pieces, writing the rendition
    /// manifest at `target_manifest_url`.
    async fn segment(
        &self,
        source_url: &str,
        target_manifest_url: &str,
        opts: &SegmentingOptions,
    ) -> Result<(), JobError>;

    /// Whether every segment under the manifest starts on a keyframe.
    async fn starts_on_keyframes(&self, manifest_url: &str) -> Result<bool, JobError>;

    /// Re-encode a clip boundary segment so an I-frame lands on the cut.
    /// `from_secs` is the in-segment start of the kept range; `duration_secs`
    /// bounds it when the cut ends inside the same segment.
    async fn reencode_boundary(
        &self,
        segment: Bytes,
        from_secs: f64,
        duration_secs: Option<f64>,
        settings: &BoundaryEncodeSettings,
    ) -> Result<Bytes, JobError>;

    /// Remux concatenated TS into a progressive MP4
    /// (`movflags=faststart`, `aac_adtstoasc`).
    async fn mux_mp4(&self, ts: Bytes) -> Result<Bytes, JobError>;

    /// Repackage concatenated TS into fragmented MP4 plus the DASH manifest
    /// and fMP4 master playlist.
    async fn mux_fmp4(&self, ts: Bytes) -> Result<Vec<MediaFile>, JobError>;
}
