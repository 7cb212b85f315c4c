//! Job data model, live-job cache, and progress arithmetic.

pub mod cache;
pub mod model;
pub mod progress;

pub use cache::{Job, JobCache};
pub use model::{
    AudioTrack, ClipRequest, EncodedProfile, EncryptionPayload, InputTrack, InputVideo, JobInfo,
    JobState, OutputAsset, OutputKind, SourceStats, UploadJobPayload, UploadJobResult, VideoTrack,
    stream_name,
};
pub use progress::overall_completion_ratio;
