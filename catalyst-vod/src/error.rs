//! Application-wide error types.

use crate::broadcaster::BroadcasterError;
use crate::storage::StorageError;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, JobError>;

/// Error type for job processing.
///
/// `is_unretriable` drives the `unretriable` flag on terminal callbacks:
/// callers should not resubmit a job that failed unretriably.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("invalid pipeline strategy `{value}`")]
    InvalidStrategy { value: String },

    #[error("{kind} output requested but no {kind} target URL given")]
    MissingTarget { kind: &'static str },

    #[error("clip error: {source}")]
    Clip {
        #[from]
        source: hls_vod::ClipError,
    },

    #[error("playlist error: {source}")]
    Playlist {
        #[from]
        source: hls_vod::PlaylistError,
    },

    #[error("storage error: {source}")]
    Storage {
        #[from]
        source: StorageError,
    },

    #[error("failed to copy source into working storage: {reason}")]
    Copy { reason: String },

    #[error("source copy exceeded the {limit_secs}s budget")]
    CopyTimeout { limit_secs: u64 },

    #[error("source decryption failed: {reason}")]
    Decryption { reason: String },

    #[error("probe failed: {reason}")]
    Probe { reason: String },

    #[error("segmenting failed: {reason}")]
    Segmenting { reason: String },

    #[error("broadcaster error: {source}")]
    Broadcaster {
        #[from]
        source: BroadcasterError,
    },

    #[error("transcode failed: {reason}")]
    Transcode { reason: String },

    #[error("mp4 assembly failed: {reason}")]
    Mp4Assembly { reason: String },

    #[error("external transcoder failed: {reason}")]
    External { reason: String },

    #[error("external transcoder exceeded the {limit_secs}s deadline")]
    ExternalTimeout { limit_secs: u64 },

    #[error("callback delivery failed: {reason}")]
    Callback { reason: String },

    #[error("input not supported by the in-process pipeline: {reason}")]
    NotSupported { reason: String },

    #[error("panic in pipeline handler: {detail}")]
    HandlerPanic { detail: String },

    #[error("{source}")]
    Unretriable {
        #[source]
        source: Box<JobError>,
    },
}

impl JobError {
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }

    /// Tag any error as unretriable without changing its message.
    pub fn unretriable(err: JobError) -> Self {
        match err {
            already @ Self::Unretriable { .. } => already,
            other => Self::Unretriable {
                source: Box::new(other),
            },
        }
    }

    pub fn is_unretriable(&self) -> bool {
        match self {
            Self::Unretriable { .. }
            | Self::InvalidInput { .. }
            | Self::InvalidStrategy { .. }
            | Self::MissingTarget { .. }
            | Self::Clip { .. }
            | Self::NotSupported { .. } => true,
            Self::Playlist { .. }
            | Self::Storage { .. }
            | Self::Copy { .. }
            | Self::CopyTimeout { .. }
            | Self::Decryption { .. }
            | Self::Probe { .. }
            | Self::Segmenting { .. }
            | Self::Broadcaster { .. }
            | Self::Transcode { .. }
            | Self::Mp4Assembly { .. }
            | Self::External { .. }
            | Self::ExternalTimeout { .. }
            | Self::Callback { .. }
            | Self::HandlerPanic { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unretriable_tag_is_idempotent_and_transparent() {
        let err = JobError::unretriable(JobError::Transcode {
            reason: "boom".to_string(),
        });
        assert!(err.is_unretriable());
        assert_eq!(err.to_string(), "transcode failed: boom");

        let retagged = JobError::unretriable(err);
        assert_eq!(retagged.to_string(), "transcode failed: boom");
        match retagged {
            JobError::Unretriable { source } => {
                assert!(!matches!(*source, JobError::Unretriable { .. }))
            }
            other => panic!("expected an unretriable tag, got {other}"),
        }
    }

    #[test]
    fn input_rejection_is_unretriable() {
        assert!(JobError::invalid_input("no video track").is_unretriable());
        assert!(
            JobError::InvalidStrategy {
                value: "bogus".to_string()
            }
            .is_unretriable()
        );
    }

    #[test]
    fn transient_failures_are_retriable() {
        assert!(
            !JobError::Transcode {
                reason: "broadcaster 500".to_string()
            }
            .is_unretriable()
        );
        assert!(
            !JobError::HandlerPanic {
                detail: "index out of bounds".to_string()
            }
            .is_unretriable()
        );
    }
}
