// Media playlist helpers shared by the clip selector and the manifest builder.

use m3u8_rs::{MediaPlaylist, MediaSegment};
use url::Url;

/// Error type for playlist parsing and assembly.
#[derive(Debug, thiserror::Error)]
pub enum PlaylistError {
    #[error("playlist parse error: {0}")]
    Parse(String),

    #[error("expected a media playlist, got a master playlist")]
    NotMediaPlaylist,

    #[error("invalid segment URI `{uri}`: {reason}")]
    InvalidSegmentUri { uri: String, reason: String },

    #[error("playlist serialization failed: {0}")]
    Write(#[from] std::io::Error),
}

/// A single transcodable piece of a media playlist.
///
/// Derived from a decoded playlist plus its base URL; `is_last` marks the
/// final live segment so downstream consumers can flush end-of-stream state.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSegment {
    pub url: Url,
    pub duration_ms: u64,
    pub is_last: bool,
}

/// True when the URL's basename names an HLS media playlist.
pub fn is_hls_input(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/')
        .next()
        .is_some_and(|base| base.ends_with(".m3u8"))
}

/// Parse a media playlist, rejecting master playlists.
pub fn parse_media_playlist(data: &[u8]) -> Result<MediaPlaylist, PlaylistError> {
    match m3u8_rs::parse_playlist_res(data) {
        Ok(m3u8_rs::Playlist::MediaPlaylist(media)) => Ok(media),
        Ok(m3u8_rs::Playlist::MasterPlaylist(_)) => Err(PlaylistError::NotMediaPlaylist),
        Err(e) => Err(PlaylistError::Parse(e.to_string())),
    }
}

/// Iterate the live prefix of a playlist's segment array.
///
/// Some parsers hand back a fixed-capacity segment array whose unused tail is
/// empty slots; iteration must stop at the first one instead of trusting
/// `segments.len()`.
pub fn live_segments(playlist: &MediaPlaylist) -> impl Iterator<Item = &MediaSegment> {
    playlist.segments.iter().take_while(|seg| !seg.uri.is_empty())
}

/// Total playlist duration in seconds, over the live prefix.
pub fn total_duration_secs(playlist: &MediaPlaylist) -> f64 {
    live_segments(playlist)
        .map(|seg| seg.duration as f64)
        .sum()
}

/// Resolve every live segment against the playlist's base URL.
///
/// The last entry is flagged `is_last`. Absolute segment URIs are used as-is;
/// relative ones are joined onto `base`.
pub fn absolute_segments(
    playlist: &MediaPlaylist,
    base: &Url,
) -> Result<Vec<SourceSegment>, PlaylistError> {
    let live: Vec<&MediaSegment> = live_segments(playlist).collect();
    let count = live.len();
    live.into_iter()
        .enumerate()
        .map(|(i, seg)| {
            let url = resolve_uri(base, &seg.uri).map_err(|e| PlaylistError::InvalidSegmentUri {
                uri: seg.uri.clone(),
                reason: e.to_string(),
            })?;
            Ok(SourceSegment {
                url,
                duration_ms: (seg.duration as f64 * 1000.0).round() as u64,
                is_last: i + 1 == count,
            })
        })
        .collect()
}

fn resolve_uri(base: &Url, value: &str) -> Result<Url, url::ParseError> {
    if let Ok(url) = Url::parse(value) {
        return Ok(url);
    }
    base.join(value)
}

/// Serialize a media playlist to bytes.
pub fn write_playlist(playlist: &MediaPlaylist) -> Result<Vec<u8>, PlaylistError> {
    let mut out = Vec::new();
    playlist.write_to(&mut out)?;
    Ok(out)
}
