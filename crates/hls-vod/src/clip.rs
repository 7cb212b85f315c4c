// Clip selection: map a `[start, end]` second interval onto the segments of a
// media playlist, with per-boundary offsets for frame-accurate cuts.

use m3u8_rs::{MediaPlaylist, MediaPlaylistType, MediaSegment};

use crate::playlist::{live_segments, total_duration_secs};

/// Error type for clip selection.
#[derive(Debug, thiserror::Error)]
pub enum ClipError {
    #[error("clip start {requested_secs}s is beyond the playlist duration {total_secs}s")]
    OutOfRange {
        requested_secs: f64,
        total_secs: f64,
    },

    #[error("malformed playlist: segment {seq_id} has non-positive duration")]
    MalformedSegment { seq_id: u64 },

    #[error("first segment carries no PROGRAM-DATE-TIME tag, cannot clip by wall-clock time")]
    MissingProgramDateTime,

    #[error("playlist has no segments")]
    EmptyPlaylist,
}

/// One end of a clip interval, located inside a specific segment.
#[derive(Debug, Clone, PartialEq)]
pub struct ClipBoundary {
    /// Sequence id of the segment containing the boundary.
    pub seq_id: u64,
    /// Offset of the cut inside that segment, in seconds.
    pub offset_secs: f64,
    /// Whether the segment must be re-encoded to align an I-frame at the cut.
    pub needs_reencode: bool,
}

/// The spanning slice of segments for a clip interval plus boundary offsets.
///
/// `boundaries` holds one entry when start and end fall inside the same
/// segment, two otherwise (first, then last).
#[derive(Debug, Clone)]
pub struct ClipSelection {
    pub segments: Vec<MediaSegment>,
    pub boundaries: Vec<ClipBoundary>,
    pub start_secs: f64,
    pub end_secs: f64,
}

/// Encoder settings applied when a boundary segment is re-encoded.
///
/// Interior segments are copied without re-encode; audio is re-encoded on
/// boundary cuts and copied elsewhere.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundaryEncodeSettings {
    pub video_codec: &'static str,
    pub gop_size: u32,
    pub keyint_min: u32,
    pub scene_cut_threshold: u32,
    pub b_frames: u32,
    pub audio_codec: &'static str,
}

impl Default for BoundaryEncodeSettings {
    fn default() -> Self {
        Self {
            video_codec: "h264",
            gop_size: 48,
            keyint_min: 48,
            scene_cut_threshold: 50,
            b_frames: 0,
            audio_codec: "aac",
        }
    }
}

/// Walk the live segments for the one containing `target_secs`.
///
/// Returns the segment index and the residual offset into it. The play head
/// carries `target - Σ preceding durations`; the first segment where the
/// remaining head fits contains the target.
fn locate(
    segments: &[&MediaSegment],
    media_sequence: u64,
    target_secs: f64,
) -> Result<(usize, f64), ClipError> {
    let mut play_head = target_secs;
    for (index, segment) in segments.iter().enumerate() {
        let duration = segment.duration as f64;
        if duration <= 0.0 {
            return Err(ClipError::MalformedSegment {
                seq_id: media_sequence + index as u64,
            });
        }
        if play_head - duration <= 0.0 {
            return Ok((index, play_head));
        }
        play_head -= duration;
    }
    // Callers clamp or range-check before walking; reaching the end means the
    // interval exceeded the playlist by no more than floating-point slack.
    let last = segments.len() - 1;
    Ok((last, segments[last].duration as f64))
}

/// Select the contiguous segment slice spanning `[start_secs, end_secs]`.
///
/// `end_secs` beyond the playlist is clamped to the last segment's end;
/// `start_secs` beyond the playlist is an error.
pub fn select_clip_segments(
    playlist: &MediaPlaylist,
    start_secs: f64,
    end_secs: f64,
) -> Result<ClipSelection, ClipError> {
    let segments: Vec<&MediaSegment> = live_segments(playlist).collect();
    if segments.is_empty() {
        return Err(ClipError::EmptyPlaylist);
    }

    let total_secs = total_duration_secs(playlist);
    if start_secs > total_secs {
        return Err(ClipError::OutOfRange {
            requested_secs: start_secs,
            total_secs,
        });
    }

    let (start_index, start_offset) = locate(&segments, playlist.media_sequence, start_secs)?;

    let (end_index, end_offset) = if end_secs > total_secs {
        let last = segments.len() - 1;
        (last, segments[last].duration as f64)
    } else {
        locate(&segments, playlist.media_sequence, end_secs)?
    };

    let epsilon = 1e-9;
    let boundaries = if start_index == end_index {
        let duration = segments[start_index].duration as f64;
        vec![ClipBoundary {
            seq_id: playlist.media_sequence + start_index as u64,
            offset_secs: start_offset,
            needs_reencode: start_offset > epsilon || end_offset < duration - epsilon,
        }]
    } else {
        let last_duration = segments[end_index].duration as f64;
        vec![
            ClipBoundary {
                seq_id: playlist.media_sequence + start_index as u64,
                offset_secs: start_offset,
                needs_reencode: start_offset > epsilon,
            },
            ClipBoundary {
                seq_id: playlist.media_sequence + end_index as u64,
                offset_secs: end_offset,
                needs_reencode: end_offset < last_duration - epsilon,
            },
        ]
    };

    Ok(ClipSelection {
        segments: segments[start_index..=end_index]
            .iter()
            .map(|seg| (*seg).clone())
            .collect(),
        boundaries,
        start_secs,
        end_secs: end_secs.min(total_secs),
    })
}

/// Convert a wall-clock Unix-millisecond timestamp to playlist-relative
/// seconds via the first segment's PROGRAM-DATE-TIME tag.
pub fn program_time_to_relative(
    playlist: &MediaPlaylist,
    unix_millis: i64,
) -> Result<f64, ClipError> {
    let first = live_segments(playlist)
        .next()
        .ok_or(ClipError::EmptyPlaylist)?;
    let origin = first
        .program_date_time
        .ok_or(ClipError::MissingProgramDateTime)?;
    Ok((unix_millis - origin.timestamp_millis()) as f64 / 1000.0)
}

/// Build the clip's output manifest: the spanning segments under their
/// original sequence numbering, with boundary durations trimmed to the cut.
pub fn clip_playlist(source: &MediaPlaylist, selection: &ClipSelection) -> MediaPlaylist {
    let mut segments = selection.segments.clone();
    let count = segments.len();

    if count == 1 {
        let start = selection.boundaries[0].offset_secs;
        segments[0].duration = (selection.end_secs - selection.start_secs)
            .min(segments[0].duration as f64 - start) as f32;
    } else if let [first, last] = selection.boundaries.as_slice() {
        segments[0].duration -= first.offset_secs as f32;
        segments[count - 1].duration = last.offset_secs as f32;
    }

    MediaPlaylist {
        version: source.version,
        target_duration: source.target_duration,
        media_sequence: selection.boundaries[0].seq_id,
        playlist_type: Some(MediaPlaylistType::Vod),
        end_list: true,
        independent_segments: source.independent_segments,
        segments,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn playlist_with(durations: &[f32]) -> MediaPlaylist {
        MediaPlaylist {
            version: Some(3),
            target_duration: 11,
            end_list: true,
            segments: durations
                .iter()
                .enumerate()
                .map(|(i, d)| MediaSegment {
                    uri: format!("{i}.ts"),
                    duration: *d,
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn full_range_selects_everything() {
        let durations = [10.0, 5.0, 2.0];
        let playlist = playlist_with(&durations);
        let total: f64 = durations.iter().map(|d| *d as f64).sum();

        let selection = select_clip_segments(&playlist, 0.0, total).unwrap();
        assert_eq!(selection.segments.len(), 3);
        assert_eq!(selection.boundaries.len(), 2);
        assert_eq!(selection.boundaries[0].seq_id, 0);
        assert_eq!(selection.boundaries[0].offset_secs, 0.0);
        assert!(!selection.boundaries[0].needs_reencode);
        assert_eq!(selection.boundaries[1].seq_id, 2);
        assert!((selection.boundaries[1].offset_secs - 2.0).abs() < 1e-6);
        assert!(!selection.boundaries[1].needs_reencode);
    }

    #[test]
    fn start_offset_lands_in_containing_segment() {
        let playlist = playlist_with(&[10.0, 10.0, 10.0]);
        let selection = select_clip_segments(&playlist, 14.0, 30.0).unwrap();
        assert_eq!(selection.boundaries[0].seq_id, 1);
        assert!((selection.boundaries[0].offset_secs - 4.0).abs() < 1e-6);
        assert!(selection.boundaries[0].needs_reencode);
        assert_eq!(selection.segments.len(), 2);
    }

    #[test]
    fn same_segment_collapses_to_one_boundary() {
        let playlist = playlist_with(&[10.0, 10.0]);
        let selection = select_clip_segments(&playlist, 11.0, 13.0).unwrap();
        assert_eq!(selection.segments.len(), 1);
        assert_eq!(selection.boundaries.len(), 1);
        assert_eq!(selection.boundaries[0].seq_id, 1);
        assert!((selection.boundaries[0].offset_secs - 1.0).abs() < 1e-6);
        assert!(selection.boundaries[0].needs_reencode);
    }

    #[test]
    fn start_beyond_total_is_out_of_range() {
        let playlist = playlist_with(&[10.0, 10.0]);
        assert!(matches!(
            select_clip_segments(&playlist, 25.0, 30.0),
            Err(ClipError::OutOfRange { .. })
        ));
    }

    #[test]
    fn zero_duration_segment_is_malformed() {
        let playlist = playlist_with(&[10.0, 0.0, 10.0]);
        assert!(matches!(
            select_clip_segments(&playlist, 15.0, 25.0),
            Err(ClipError::MalformedSegment { seq_id: 1 })
        ));
    }

    #[test]
    fn end_beyond_total_clamps_to_last_segment() {
        let playlist = playlist_with(&[10.0, 5.0]);
        let selection = select_clip_segments(&playlist, 2.0, 100.0).unwrap();
        assert_eq!(selection.boundaries[1].seq_id, 1);
        assert!((selection.boundaries[1].offset_secs - 5.0).abs() < 1e-6);
        assert!(!selection.boundaries[1].needs_reencode);
        assert!((selection.end_secs - 15.0).abs() < 1e-6);
    }

    #[test]
    fn uneven_playlist_boundary_offsets() {
        let playlist = playlist_with(&[10.4, 5.3, 2.3]);
        let selection = select_clip_segments(&playlist, 5.5, 16.0).unwrap();
        assert_eq!(selection.segments.len(), 3);
        let [first, last] = selection.boundaries.as_slice() else {
            panic!("expected two boundaries");
        };
        assert_eq!(first.seq_id, 0);
        assert!((first.offset_secs - 5.5).abs() < 1e-3);
        assert!(first.needs_reencode);
        assert_eq!(last.seq_id, 2);
        assert!((last.offset_secs - 0.3).abs() < 1e-3);
        assert!(last.needs_reencode);
    }

    #[test]
    fn clip_manifest_preserves_sequence_and_trims_boundaries() {
        let playlist = playlist_with(&[10.4, 5.3, 2.3]);
        let selection = select_clip_segments(&playlist, 5.5, 16.0).unwrap();
        let clipped = clip_playlist(&playlist, &selection);

        assert_eq!(clipped.media_sequence, 0);
        assert_eq!(clipped.segments.len(), 3);
        assert!((clipped.segments[0].duration - 4.9).abs() < 1e-3);
        assert!((clipped.segments[1].duration - 5.3).abs() < 1e-3);
        assert!((clipped.segments[2].duration - 0.3).abs() < 1e-3);
        assert!(clipped.end_list);
    }

    #[test]
    fn wall_clock_conversion_uses_first_segment_origin() {
        let mut playlist = playlist_with(&[10.0, 10.0]);
        let origin = chrono::FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 5, 1, 12, 0, 0)
            .unwrap();
        playlist.segments[0].program_date_time = Some(origin);

        let relative = program_time_to_relative(&playlist, origin.timestamp_millis() + 5_500).unwrap();
        assert!((relative - 5.5).abs() < 1e-9);
    }

    #[test]
    fn wall_clock_conversion_requires_program_date_time() {
        let playlist = playlist_with(&[10.0]);
        assert!(matches!(
            program_time_to_relative(&playlist, 1_700_000_000_000),
            Err(ClipError::MissingProgramDateTime)
        ));
    }

    #[test]
    fn boundary_encode_defaults_align_keyframes() {
        let settings = BoundaryEncodeSettings::default();
        assert_eq!(settings.video_codec, "h264");
        assert_eq!(settings.gop_size, 48);
        assert_eq!(settings.keyint_min, 48);
        assert_eq!(settings.b_frames, 0);
        assert_eq!(settings.audio_codec, "aac");
    }
}
