// HLS playlist arithmetic for VOD processing.
//
// Pure playlist math over `m3u8-rs` types: selecting the segments that span a
// clip interval, and assembling master + rendition manifests from transcode
// output. Network and storage I/O stay with the caller.

pub mod clip;
pub mod manifest;
pub mod playlist;

pub use clip::{
    BoundaryEncodeSettings, ClipBoundary, ClipError, ClipSelection, clip_playlist,
    program_time_to_relative, select_clip_segments,
};
pub use manifest::{RenditionStats, master_playlist, rendition_playlist, sort_renditions};
pub use playlist::{
    PlaylistError, SourceSegment, absolute_segments, is_hls_input, live_segments,
    parse_media_playlist, total_duration_secs, write_playlist,
};
