//! Media handling: input copy + decryption, probing, the FFmpeg driver
//! seam, and MP4 assembly from transcoded segments.

pub mod copy;
pub mod ffmpeg;
pub mod mp4;
pub mod prepare;
pub mod probe;

pub use copy::{InputCopier, KeyUnwrapper, SourceDecryption, decrypt_aes_cbc};
pub use ffmpeg::{FfmpegDriver, MediaFile, SegmentingMode, SegmentingOptions};
pub use mp4::{RenditionTable, mp4_eligible};
pub use prepare::{InputPreparer, PreparedInput, SourcePreparer};
pub use probe::{MediaProber, ProbeError, probe_source, validate_input};
