//! Core job types: the immutable upload request, probed input metadata, and
//! the live per-job state the coordinator mutates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use hls_vod::RenditionStats;

/// Prefix for every coordinator-managed stream name.
pub const STREAM_NAME_PREFIX: &str = "catalyst_vod_";

/// Cache key for a job.
pub fn stream_name(request_id: &str) -> String {
    format!("{STREAM_NAME_PREFIX}{request_id}")
}

/// The immutable input describing one upload job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadJobPayload {
    pub request_id: String,
    #[serde(default)]
    pub external_id: String,
    pub source_url: String,
    pub callback_url: String,
    #[serde(default)]
    pub hls_target_url: Option<String>,
    #[serde(default)]
    pub mp4_target_url: Option<String>,
    #[serde(default)]
    pub frag_mp4_target_url: Option<String>,
    #[serde(default)]
    pub thumbnails_target_url: Option<String>,
    #[serde(default)]
    pub clip_target_url: Option<String>,
    /// Restrict MP4 output to short sources.
    #[serde(default)]
    pub mp4_only_short: bool,
    #[serde(default)]
    pub profiles: Vec<EncodedProfile>,
    /// Per-job strategy override; the coordinator default applies when unset.
    #[serde(default)]
    pub pipeline_strategy: Option<String>,
    #[serde(default)]
    pub target_segment_size_secs: u64,
    #[serde(default)]
    pub generate_mp4: bool,
    /// Reuse a source already staged under the HLS target instead of copying.
    #[serde(default)]
    pub source_copy: bool,
    #[serde(default)]
    pub clip: Option<ClipRequest>,
    #[serde(default)]
    pub encryption: Option<EncryptionPayload>,
    #[serde(default)]
    pub c2pa: bool,
}

/// A clip sub-interval of an HLS recording, in wall-clock Unix milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClipRequest {
    pub enabled: bool,
    pub start_unix_millis: i64,
    pub end_unix_millis: i64,
    pub playback_id: String,
}

/// Encrypted-source key material, unwrapped by the credential seam.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncryptionPayload {
    pub encrypted_key: String,
}

/// One desired output rendition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EncodedProfile {
    pub name: String,
    #[serde(default)]
    pub width: u64,
    #[serde(default)]
    pub height: u64,
    #[serde(default)]
    pub bitrate: u64,
    #[serde(default)]
    pub fps: u64,
    #[serde(default)]
    pub quality: u32,
    /// Pass the source rendition through instead of encoding.
    #[serde(default)]
    pub copy: bool,
}

/// Probed media characteristics of the copied source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputVideo {
    pub format: String,
    pub duration_secs: f64,
    pub size_bytes: u64,
    pub tracks: Vec<InputTrack>,
}

impl InputVideo {
    pub fn video_track(&self) -> Option<&VideoTrack> {
        self.tracks.iter().find_map(|track| match track {
            InputTrack::Video(video) => Some(video),
            InputTrack::Audio(_) => None,
        })
    }

    pub fn audio_track(&self) -> Option<&AudioTrack> {
        self.tracks.iter().find_map(|track| match track {
            InputTrack::Audio(audio) => Some(audio),
            InputTrack::Video(_) => None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputTrack {
    Video(VideoTrack),
    Audio(AudioTrack),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VideoTrack {
    pub codec: String,
    pub bitrate: u64,
    pub width: u64,
    pub height: u64,
    pub fps: f64,
    #[serde(default)]
    pub pixel_format: String,
    #[serde(default)]
    pub rotation: i64,
    /// Declared aspect ratio, e.g. `16:9`; empty when the container omits it.
    #[serde(default)]
    pub display_aspect_ratio: String,
    #[serde(default)]
    pub start_time_secs: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudioTrack {
    pub codec: String,
    pub bitrate: u64,
    pub channels: u32,
    pub sample_rate: u32,
    pub sample_bits: u32,
    #[serde(default)]
    pub start_time_secs: f64,
}

/// One delivered output asset, reported in the terminal callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputAsset {
    #[serde(rename = "type")]
    pub kind: OutputKind,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

impl OutputAsset {
    pub fn new(kind: OutputKind, location: impl Into<String>) -> Self {
        Self {
            kind,
            location: location.into(),
            width: None,
            height: None,
            bitrate: None,
            size_bytes: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Manifest,
    Video,
    Mp4,
    FragMp4,
    Clip,
}

/// Successful handler outcome.
#[derive(Debug, Clone, Default)]
pub struct UploadJobResult {
    pub input_video: InputVideo,
    pub outputs: Vec<OutputAsset>,
}

/// Pipeline state of a live job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Segmenting,
    Transcoding,
    Completed,
    Failed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            JobState::Segmenting => "segmenting",
            JobState::Transcoding => "transcoding",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        write!(f, "{label}")
    }
}

/// Source characteristics duplicated out of [`InputVideo`] for metric
/// emission after the job is gone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceStats {
    pub bytes: u64,
    pub segments: usize,
    pub duration_ms: u64,
    pub video_codec: String,
    pub audio_codec: String,
    pub width: u64,
    pub height: u64,
    pub fps: f64,
    pub video_bitrate: u64,
    pub audio_bitrate: u64,
    pub channels: u32,
    pub sample_rate: u32,
    pub sample_bits: u32,
    pub video_start_time_secs: f64,
    pub audio_start_time_secs: f64,
}

impl SourceStats {
    pub fn from_input(input: &InputVideo) -> Self {
        let mut stats = Self {
            bytes: input.size_bytes,
            duration_ms: (input.duration_secs * 1000.0).round() as u64,
            ..Self::default()
        };
        if let Some(video) = input.video_track() {
            stats.video_codec = video.codec.clone();
            stats.width = video.width;
            stats.height = video.height;
            stats.fps = video.fps;
            stats.video_bitrate = video.bitrate;
            stats.video_start_time_secs = video.start_time_secs;
        }
        if let Some(audio) = input.audio_track() {
            stats.audio_codec = audio.codec.clone();
            stats.audio_bitrate = audio.bitrate;
            stats.channels = audio.channels;
            stats.sample_rate = audio.sample_rate;
            stats.sample_bits = audio.sample_bits;
            stats.audio_start_time_secs = audio.start_time_secs;
        }
        stats
    }
}

/// Live state of one job. Owned by the job cache; mutated only while the
/// per-job mutex in [`super::cache::Job`] is held.
#[derive(Debug)]
pub struct JobInfo {
    pub payload: UploadJobPayload,
    pub stream_name: String,
    pub catalyst_region: String,

    /// Probed input, cached after the copy step.
    pub input_video: InputVideo,
    pub signed_source_url: String,
    pub num_profiles: usize,

    // Pipeline-scoped fields, reset each time a handler is started.
    pub pipeline_name: &'static str,
    pub has_fallback: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub transcoded_segments: u64,
    pub state: JobState,
    pub rendition_stats: Vec<RenditionStats>,
    /// One-shot pipeline outcome; written exactly once by `finish_job`.
    pub result: Option<oneshot::Sender<bool>>,

    // Progress timestamps, monotonic per job.
    pub source_playback_done: Option<DateTime<Utc>>,
    pub download_done: Option<DateTime<Utc>>,
    pub segmenting_done: Option<DateTime<Utc>>,
    pub transcoding_done: Option<DateTime<Utc>>,

    pub source_stats: SourceStats,

    // Modes.
    pub in_fallback_mode: bool,
    pub livepeer_supported: bool,
    pub generate_mp4: bool,
    pub target_segment_size_secs: u64,
}

impl JobInfo {
    pub fn new(payload: UploadJobPayload, catalyst_region: impl Into<String>) -> Self {
        let stream_name = stream_name(&payload.request_id);
        let num_profiles = payload.profiles.len();
        let target_segment_size_secs = payload.target_segment_size_secs;
        Self {
            payload,
            stream_name,
            catalyst_region: catalyst_region.into(),
            input_video: InputVideo::default(),
            signed_source_url: String::new(),
            num_profiles,
            pipeline_name: "none",
            has_fallback: false,
            start_time: None,
            transcoded_segments: 0,
            state: JobState::Segmenting,
            rendition_stats: Vec::new(),
            result: None,
            source_playback_done: None,
            download_done: None,
            segmenting_done: None,
            transcoding_done: None,
            source_stats: SourceStats::default(),
            in_fallback_mode: false,
            livepeer_supported: false,
            generate_mp4: false,
            target_segment_size_secs,
        }
    }

    /// Reset the pipeline-scoped fields for a (re-)started handler and seed
    /// per-rendition stats from the job's profiles.
    pub fn reset_pipeline(
        &mut self,
        pipeline_name: &'static str,
        has_fallback: bool,
        result: oneshot::Sender<bool>,
    ) {
        self.pipeline_name = pipeline_name;
        self.has_fallback = has_fallback;
        self.start_time = Some(Utc::now());
        self.transcoded_segments = 0;
        self.state = JobState::Segmenting;
        self.rendition_stats = self
            .payload
            .profiles
            .iter()
            .map(|profile| RenditionStats {
                name: profile.name.clone(),
                width: profile.width,
                height: profile.height,
                ..RenditionStats::default()
            })
            .collect();
        self.result = Some(result);
    }

    /// Record the probed input and duplicate its stats for metric emission.
    pub fn set_input(&mut self, input: InputVideo, signed_source_url: String) {
        self.source_stats = SourceStats::from_input(&input);
        self.input_video = input;
        self.signed_source_url = signed_source_url;
        self.download_done = Some(Utc::now());
    }
}
