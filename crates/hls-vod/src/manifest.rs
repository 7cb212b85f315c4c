// Master + rendition manifest assembly from transcode output stats.

use m3u8_rs::{MasterPlaylist, MediaPlaylist, MediaPlaylistType, MediaSegment, Resolution, VariantStream};

use crate::playlist::live_segments;

/// Accumulating per-rendition output stats.
///
/// `record_segment` folds each completed segment in; `bits_per_second` is
/// recomputed from the running totals so the master playlist always reflects
/// observed output, not the profile's nominal bitrate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenditionStats {
    pub name: String,
    pub width: u64,
    pub height: u64,
    pub fps: f64,
    pub bytes: u64,
    pub duration_ms: u64,
    pub manifest_location: String,
    pub bits_per_second: u64,
}

impl RenditionStats {
    /// Fold one completed segment into the running totals.
    pub fn record_segment(&mut self, bytes: u64, duration_ms: u64) {
        self.bytes += bytes;
        self.duration_ms += duration_ms;
        if self.duration_ms > 0 {
            self.bits_per_second = (self.bytes * 8 * 1000) / self.duration_ms;
        }
    }
}

/// Order renditions for the master playlist: descending `bits_per_second`,
/// ties broken by descending pixel area.
pub fn sort_renditions(stats: &mut [RenditionStats]) {
    stats.sort_by(|a, b| {
        b.bits_per_second
            .cmp(&a.bits_per_second)
            .then_with(|| (b.width * b.height).cmp(&(a.width * a.height)))
    });
}

/// Build the master playlist referencing one media playlist per rendition at
/// `{name}/index.m3u8`. Input order is preserved; sort first.
pub fn master_playlist(stats: &[RenditionStats]) -> MasterPlaylist {
    MasterPlaylist {
        version: Some(3),
        independent_segments: true,
        variants: stats
            .iter()
            .map(|rendition| VariantStream {
                uri: format!("{}/index.m3u8", rendition.name),
                bandwidth: rendition.bits_per_second,
                resolution: Some(Resolution {
                    width: rendition.width,
                    height: rendition.height,
                }),
                frame_rate: (rendition.fps > 0.0).then_some(rendition.fps),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

/// Build one rendition's media playlist from the source playlist: same
/// playlist parameters and per-segment durations, URIs renumbered `{i}.ts`,
/// closed with ENDLIST.
pub fn rendition_playlist(source: &MediaPlaylist) -> MediaPlaylist {
    MediaPlaylist {
        version: source.version,
        target_duration: source.target_duration,
        media_sequence: source.media_sequence,
        playlist_type: Some(MediaPlaylistType::Vod),
        independent_segments: source.independent_segments,
        end_list: true,
        segments: live_segments(source)
            .enumerate()
            .map(|(i, seg)| MediaSegment {
                uri: format!("{i}.ts"),
                duration: seg.duration,
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(name: &str, width: u64, height: u64, bps: u64) -> RenditionStats {
        RenditionStats {
            name: name.to_string(),
            width,
            height,
            fps: 30.0,
            bits_per_second: bps,
            ..Default::default()
        }
    }

    fn source_playlist(durations: &[f32]) -> MediaPlaylist {
        MediaPlaylist {
            version: Some(3),
            target_duration: 10,
            end_list: true,
            segments: durations
                .iter()
                .enumerate()
                .map(|(i, d)| MediaSegment {
                    uri: format!("source/{i}.ts"),
                    duration: *d,
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn record_segment_recomputes_bitrate() {
        let mut rendition = stats("720p0", 1280, 720, 0);
        rendition.record_segment(500_000, 2_000);
        assert_eq!(rendition.bits_per_second, 2_000_000);
        rendition.record_segment(250_000, 2_000);
        assert_eq!(rendition.bytes, 750_000);
        assert_eq!(rendition.duration_ms, 4_000);
        assert_eq!(rendition.bits_per_second, 1_500_000);
    }

    #[test]
    fn master_lists_renditions_by_descending_bandwidth() {
        let mut renditions = vec![
            stats("360p0", 640, 360, 1_000_000),
            stats("1080p0", 1920, 1080, 6_000_000),
            stats("720p0", 1280, 720, 4_000_000),
        ];
        sort_renditions(&mut renditions);
        let master = master_playlist(&renditions);

        let bandwidths: Vec<u64> = master.variants.iter().map(|v| v.bandwidth).collect();
        assert_eq!(bandwidths, vec![6_000_000, 4_000_000, 1_000_000]);
        assert_eq!(master.variants[0].uri, "1080p0/index.m3u8");
    }

    #[test]
    fn bandwidth_ties_break_by_resolution() {
        let mut renditions = vec![
            stats("720p0", 1280, 720, 4_000_000),
            stats("1080p0", 1920, 1080, 4_000_000),
        ];
        sort_renditions(&mut renditions);
        assert_eq!(renditions[0].name, "1080p0");
        assert_eq!(renditions[1].name, "720p0");
    }

    #[test]
    fn rendition_playlist_matches_source_segments() {
        let source = source_playlist(&[10.0, 10.0, 4.5]);
        let rendition = rendition_playlist(&source);

        assert_eq!(rendition.segments.len(), 3);
        assert_eq!(rendition.target_duration, source.target_duration);
        assert_eq!(rendition.segments[0].uri, "0.ts");
        assert_eq!(rendition.segments[2].uri, "2.ts");
        assert!(rendition.end_list);
    }

    #[test]
    fn rendition_playlist_skips_ring_buffer_tail() {
        let mut source = source_playlist(&[10.0, 10.0]);
        source.segments.push(MediaSegment::default());
        source.segments.push(MediaSegment {
            uri: "stale.ts".to_string(),
            duration: 10.0,
            ..Default::default()
        });
        assert_eq!(rendition_playlist(&source).segments.len(), 2);
    }

    #[test]
    fn rendition_playlist_round_trips_durations() {
        let source = source_playlist(&[10.0, 9.5, 3.25]);
        let mut out = Vec::new();
        rendition_playlist(&source).write_to(&mut out).unwrap();

        let parsed = crate::playlist::parse_media_playlist(&out).unwrap();
        let durations: Vec<f32> = parsed.segments.iter().map(|s| s.duration).collect();
        assert_eq!(durations, vec![10.0, 9.5, 3.25]);
    }

    #[test]
    fn master_round_trips_through_parser() {
        let mut renditions = vec![
            stats("360p0", 640, 360, 1_000_000),
            stats("720p0", 1280, 720, 4_000_000),
        ];
        sort_renditions(&mut renditions);
        let mut out = Vec::new();
        master_playlist(&renditions).write_to(&mut out).unwrap();

        let parsed = m3u8_rs::parse_master_playlist_res(&out).expect("master should parse");
        assert_eq!(parsed.variants.len(), 2);
        assert!(parsed.variants[0].bandwidth >= parsed.variants[1].bandwidth);
    }
}
