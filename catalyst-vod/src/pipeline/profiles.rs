//! Transcode profile derivation from the probed source.

use tracing::debug;

use crate::error::JobError;
use crate::job::model::{EncodedProfile, InputVideo, VideoTrack};

/// Bitrate headroom applied over the source when sizing derived profiles.
const BITRATE_FACTOR: f64 = 1.2;
/// Hard cap for the derived top rendition.
const MAX_DERIVED_BITRATE: u64 = 288_000_000;
/// Below this, sub-360p sources keep half their bitrate down to the hard
/// floor instead of being pushed up.
const LOW_BITRATE_MIN: u64 = 100_000;
const ABSOLUTE_BITRATE_FLOOR: u64 = 5_000;

fn default_ladder() -> [EncodedProfile; 2] {
    [
        EncodedProfile {
            name: "360p0".to_string(),
            width: 640,
            height: 360,
            bitrate: 1_000_000,
            ..EncodedProfile::default()
        },
        EncodedProfile {
            name: "720p0".to_string(),
            width: 1280,
            height: 720,
            bitrate: 4_000_000,
            ..EncodedProfile::default()
        },
    ]
}

/// Resolve the profiles a job transcodes to.
///
/// Caller-supplied profiles win, with one special case: a single profile
/// carrying only a bitrate is synthesized into a source-sized rendition at
/// that bitrate. With no profiles at all, a ladder is derived from the
/// probed source; non-clip HLS sources additionally get a passthrough copy
/// of the source rendition.
pub fn resolve_profiles(
    supplied: &[EncodedProfile],
    input: &InputVideo,
    hls_passthrough: bool,
) -> Result<Vec<EncodedProfile>, JobError> {
    let video = input
        .video_track()
        .ok_or_else(|| JobError::invalid_input("cannot derive profiles without a video track"))?;

    if let [only] = supplied
        && only.bitrate > 0
        && only.width == 0
        && only.height == 0
    {
        return Ok(vec![EncodedProfile {
            name: format!("{}p0", video.height),
            width: video.width,
            height: video.height,
            bitrate: only.bitrate,
            fps: only.fps,
            quality: only.quality,
            copy: false,
        }]);
    }
    if !supplied.is_empty() {
        return Ok(supplied.to_vec());
    }

    let mut profiles = derive_from_source(video);
    if hls_passthrough {
        profiles.push(EncodedProfile {
            name: "source".to_string(),
            width: video.width,
            height: video.height,
            bitrate: video.bitrate,
            copy: true,
            ..EncodedProfile::default()
        });
    }
    debug!(count = profiles.len(), "derived transcode profiles");
    Ok(profiles)
}

fn derive_from_source(video: &VideoTrack) -> Vec<EncodedProfile> {
    let ladder = default_ladder();
    if video.height < ladder[0].height {
        return vec![low_bitrate_profile(video)];
    }

    let source_area = (video.width * video.height).max(1) as f64;
    let mut profiles: Vec<EncodedProfile> = ladder
        .into_iter()
        .filter(|profile| profile.height < video.height)
        .map(|mut profile| {
            let area_ratio = (profile.width * profile.height) as f64 / source_area;
            let scaled = (BITRATE_FACTOR * video.bitrate as f64 * area_ratio) as u64;
            profile.bitrate = profile.bitrate.min(scaled);
            profile
        })
        .collect();

    profiles.push(EncodedProfile {
        name: format!("{}p0", video.height),
        width: video.width,
        height: video.height,
        bitrate: ((BITRATE_FACTOR * video.bitrate as f64) as u64).min(MAX_DERIVED_BITRATE),
        ..EncodedProfile::default()
    });
    profiles
}

fn low_bitrate_profile(video: &VideoTrack) -> EncodedProfile {
    let mut bitrate = video.bitrate / 2;
    if bitrate < LOW_BITRATE_MIN {
        bitrate = bitrate.max(ABSOLUTE_BITRATE_FLOOR);
    }
    EncodedProfile {
        name: "low-bitrate".to_string(),
        width: video.width,
        height: video.height,
        bitrate,
        ..EncodedProfile::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::model::InputTrack;

    fn source(width: u64, height: u64, bitrate: u64) -> InputVideo {
        InputVideo {
            format: "mp4".to_string(),
            duration_secs: 60.0,
            size_bytes: 1,
            tracks: vec![InputTrack::Video(VideoTrack {
                codec: "h264".to_string(),
                bitrate,
                width,
                height,
                fps: 30.0,
                ..VideoTrack::default()
            })],
        }
    }

    #[test]
    fn hd_source_gets_full_ladder() {
        let profiles = resolve_profiles(&[], &source(1920, 1080, 5_000_000), false).unwrap();
        assert_eq!(profiles.len(), 3);

        assert_eq!(profiles[0].name, "360p0");
        assert!(profiles[0].bitrate <= 1_000_000);
        assert_eq!(profiles[1].name, "720p0");
        assert!(profiles[1].bitrate <= 4_000_000);

        assert_eq!(profiles[2].name, "1080p0");
        assert_eq!(profiles[2].width, 1920);
        assert_eq!(profiles[2].bitrate, 6_000_000);
    }

    #[test]
    fn intermediate_bitrates_scale_by_area() {
        let profiles = resolve_profiles(&[], &source(1920, 1080, 5_000_000), false).unwrap();
        // 1.2 * 5 Mbps * (640*360)/(1920*1080) = 666_666
        assert_eq!(profiles[0].bitrate, 666_666);
        // 1.2 * 5 Mbps * (1280*720)/(1920*1080) = 2_666_666
        assert_eq!(profiles[1].bitrate, 2_666_666);
    }

    #[test]
    fn huge_source_bitrate_is_capped() {
        let profiles = resolve_profiles(&[], &source(3840, 2160, 500_000_000), false).unwrap();
        let top = profiles.last().unwrap();
        assert_eq!(top.name, "2160p0");
        assert_eq!(top.bitrate, MAX_DERIVED_BITRATE);
    }

    #[test]
    fn sub_360p_source_gets_low_bitrate_profile() {
        let profiles = resolve_profiles(&[], &source(426, 240, 800_000), false).unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].name, "low-bitrate");
        assert_eq!(profiles[0].bitrate, 400_000);
        assert_eq!(profiles[0].height, 240);
    }

    #[test]
    fn tiny_source_bitrate_keeps_hard_floor() {
        let profiles = resolve_profiles(&[], &source(426, 240, 8_000), false).unwrap();
        assert_eq!(profiles[0].bitrate, ABSOLUTE_BITRATE_FLOOR);
    }

    #[test]
    fn hls_passthrough_appends_copy_profile() {
        let profiles = resolve_profiles(&[], &source(1920, 1080, 5_000_000), true).unwrap();
        let copy = profiles.last().unwrap();
        assert!(copy.copy);
        assert_eq!(copy.name, "source");
        assert_eq!(copy.width, 1920);
    }

    #[test]
    fn bitrate_only_override_synthesizes_source_dimensions() {
        let supplied = [EncodedProfile {
            bitrate: 2_000_000,
            ..EncodedProfile::default()
        }];
        let profiles = resolve_profiles(&supplied, &source(1920, 1080, 5_000_000), false).unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].name, "1080p0");
        assert_eq!(profiles[0].width, 1920);
        assert_eq!(profiles[0].height, 1080);
        assert_eq!(profiles[0].bitrate, 2_000_000);
    }

    #[test]
    fn explicit_profiles_pass_through_unchanged() {
        let supplied = [EncodedProfile {
            name: "custom".to_string(),
            width: 852,
            height: 480,
            bitrate: 1_500_000,
            ..EncodedProfile::default()
        }];
        let profiles = resolve_profiles(&supplied, &source(1920, 1080, 5_000_000), false).unwrap();
        assert_eq!(profiles.as_slice(), &supplied);
    }
}
