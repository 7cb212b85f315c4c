//! MP4 assembly support: the rendition/segment output table and the
//! eligibility rule bounding in-memory concatenation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};

use crate::config::OutputsConfig;
use crate::error::JobError;

/// Two-level mapping `rendition -> segment index -> bytes`.
///
/// The outer map and each per-rendition map are guarded separately so
/// workers landing segments for different renditions do not contend.
#[derive(Debug, Default)]
pub struct RenditionTable {
    renditions: RwLock<HashMap<String, Arc<Mutex<BTreeMap<u64, Bytes>>>>>,
}

impl RenditionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, rendition: &str, index: u64, bytes: Bytes) {
        let segments = {
            let read = self.renditions.read();
            read.get(rendition).cloned()
        };
        let segments = match segments {
            Some(segments) => segments,
            None => Arc::clone(
                self.renditions
                    .write()
                    .entry(rendition.to_string())
                    .or_default(),
            ),
        };
        segments.lock().insert(index, bytes);
    }

    pub fn rendition_names(&self) -> Vec<String> {
        self.renditions.read().keys().cloned().collect()
    }

    pub fn segment_count(&self, rendition: &str) -> usize {
        self.renditions
            .read()
            .get(rendition)
            .map(|segments| segments.lock().len())
            .unwrap_or(0)
    }

    /// Concatenate a rendition's segments in index order.
    pub fn concat(&self, rendition: &str) -> Option<Bytes> {
        let segments = self.renditions.read().get(rendition).cloned()?;
        let segments = segments.lock();
        let mut joined = BytesMut::with_capacity(segments.values().map(Bytes::len).sum());
        for bytes in segments.values() {
            joined.extend_from_slice(bytes);
        }
        Some(joined.freeze())
    }

    /// Concatenate and verify the byte count against the accumulated
    /// rendition stat; a mismatch means a segment was lost or duplicated.
    pub fn concat_verified(&self, rendition: &str, expected_bytes: u64) -> Result<Bytes, JobError> {
        let joined = self.concat(rendition).ok_or_else(|| JobError::Mp4Assembly {
            reason: format!("no segments collected for rendition {rendition}"),
        })?;
        if joined.len() as u64 != expected_bytes {
            return Err(JobError::Mp4Assembly {
                reason: format!(
                    "rendition {rendition} concatenated to {} bytes, stats counted {expected_bytes}",
                    joined.len()
                ),
            });
        }
        Ok(joined)
    }
}

/// Whether a job gets MP4 output at all.
pub fn mp4_eligible(
    duration_secs: f64,
    is_hls_source: bool,
    has_mp4_target: bool,
    has_frag_mp4_target: bool,
    mp4_only_short: bool,
    outputs: &OutputsConfig,
) -> bool {
    if duration_secs <= 0.0 {
        return false;
    }
    let hls_ok = is_hls_source
        && duration_secs <= outputs.max_recording_mp4_duration_secs as f64
        && has_mp4_target;
    let short_ok = !is_hls_source
        && (!mp4_only_short || duration_secs <= outputs.mp4_short_cutoff_secs as f64);
    hls_ok || short_ok || has_frag_mp4_target
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concat_orders_by_segment_index() {
        let table = RenditionTable::new();
        table.insert("720p0", 2, Bytes::from_static(b"cc"));
        table.insert("720p0", 0, Bytes::from_static(b"aa"));
        table.insert("720p0", 1, Bytes::from_static(b"bb"));

        assert_eq!(table.segment_count("720p0"), 3);
        assert_eq!(table.concat("720p0").unwrap(), Bytes::from_static(b"aabbcc"));
    }

    #[test]
    fn concat_verified_checks_byte_totals() {
        let table = RenditionTable::new();
        table.insert("720p0", 0, Bytes::from_static(b"abcd"));

        assert!(table.concat_verified("720p0", 4).is_ok());
        assert!(matches!(
            table.concat_verified("720p0", 5),
            Err(JobError::Mp4Assembly { .. })
        ));
        assert!(table.concat_verified("1080p0", 0).is_err());
    }

    #[test]
    fn hls_sources_need_target_and_duration_bound() {
        let outputs = OutputsConfig::default();
        // 2h HLS recording with an MP4 target.
        assert!(mp4_eligible(7_200.0, true, true, false, false, &outputs));
        // Over the 12h ceiling.
        assert!(!mp4_eligible(50_000.0, true, true, false, false, &outputs));
        // No target.
        assert!(!mp4_eligible(7_200.0, true, false, false, false, &outputs));
    }

    #[test]
    fn short_cutoff_applies_to_mp4_only_short() {
        let outputs = OutputsConfig::default();
        assert!(mp4_eligible(90.0, false, true, false, true, &outputs));
        assert!(!mp4_eligible(300.0, false, true, false, true, &outputs));
        // Without the restriction, any duration qualifies.
        assert!(mp4_eligible(300.0, false, true, false, false, &outputs));
    }

    #[test]
    fn frag_mp4_target_overrides() {
        let outputs = OutputsConfig::default();
        assert!(mp4_eligible(50_000.0, true, false, true, false, &outputs));
        assert!(!mp4_eligible(0.0, true, true, true, false, &outputs));
    }
}
