//! Compatibility gate for the in-process pipeline.
//!
//! Inputs the segment-and-broadcast path cannot handle are rejected with
//! `NotSupported` so the coordinator routes them to the external pipeline.

use crate::error::JobError;
use crate::job::model::InputVideo;

/// Tolerated relative deviation between the declared display aspect ratio
/// and the resolution ratio.
const MAX_ASPECT_RATIO_DEVIATION: f64 = 0.2;

pub fn check_in_process_support(input: &InputVideo) -> Result<(), JobError> {
    let Some(video) = input.video_track() else {
        return Err(JobError::NotSupported {
            reason: "audio-only input".to_string(),
        });
    };

    if !video.codec.eq_ignore_ascii_case("h264") {
        return Err(JobError::NotSupported {
            reason: format!("video codec {} (only h264)", video.codec),
        });
    }
    if video.rotation != 0 {
        return Err(JobError::NotSupported {
            reason: format!("rotated video ({} degrees)", video.rotation),
        });
    }

    if let Some(declared) = parse_aspect_ratio(&video.display_aspect_ratio)
        && video.width > 0
        && video.height > 0
    {
        let actual = video.width as f64 / video.height as f64;
        let deviation = (declared - actual).abs() / actual;
        if deviation > MAX_ASPECT_RATIO_DEVIATION {
            return Err(JobError::NotSupported {
                reason: format!(
                    "display aspect ratio {} deviates {:.0}% from {}x{}",
                    video.display_aspect_ratio,
                    deviation * 100.0,
                    video.width,
                    video.height
                ),
            });
        }
    }

    Ok(())
}

fn parse_aspect_ratio(value: &str) -> Option<f64> {
    let (w, h) = value.split_once(':')?;
    let w: f64 = w.trim().parse().ok()?;
    let h: f64 = h.trim().parse().ok()?;
    (h > 0.0 && w > 0.0).then_some(w / h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::model::{InputTrack, VideoTrack};

    fn input(codec: &str, rotation: i64, dar: &str) -> InputVideo {
        InputVideo {
            tracks: vec![InputTrack::Video(VideoTrack {
                codec: codec.to_string(),
                width: 1920,
                height: 1080,
                fps: 30.0,
                rotation,
                display_aspect_ratio: dar.to_string(),
                ..VideoTrack::default()
            })],
            ..InputVideo::default()
        }
    }

    #[test]
    fn plain_h264_passes() {
        assert!(check_in_process_support(&input("h264", 0, "16:9")).is_ok());
        assert!(check_in_process_support(&input("H264", 0, "")).is_ok());
    }

    #[test]
    fn audio_only_is_rejected() {
        let err = check_in_process_support(&InputVideo::default()).unwrap_err();
        assert!(matches!(err, JobError::NotSupported { .. }));
    }

    #[test]
    fn non_h264_and_rotation_are_rejected() {
        assert!(check_in_process_support(&input("hevc", 0, "16:9")).is_err());
        assert!(check_in_process_support(&input("h264", 90, "16:9")).is_err());
    }

    #[test]
    fn anamorphic_aspect_ratio_is_rejected() {
        // 4:3 declared over a 16:9 raster is a 25% deviation.
        assert!(check_in_process_support(&input("h264", 0, "4:3")).is_err());
        // Within tolerance: 16:9 declared over 1920x1080.
        assert!(check_in_process_support(&input("h264", 0, "16:9")).is_ok());
        // Unparseable ratios are ignored rather than rejected.
        assert!(check_in_process_support(&input("h264", 0, "wide")).is_ok());
    }
}
