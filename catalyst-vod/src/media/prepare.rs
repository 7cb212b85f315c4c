//! Input preparation: copy the source into working storage, probe it, and
//! resolve the signed source URL.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::config::CoordinatorConfig;
use crate::error::JobError;
use crate::job::model::{InputVideo, UploadJobPayload};
use crate::media::copy::{InputCopier, KeyUnwrapper};
use crate::media::probe::{MediaProber, probe_source, validate_input};
use crate::storage::{ObjectStore, join_url};

/// Outcome of the copy + probe phase.
#[derive(Debug, Clone)]
pub struct PreparedInput {
    pub input_video: InputVideo,
    pub signed_source_url: String,
    pub copied_bytes: u64,
}

/// Seam the coordinator drives for copy + probe; swapped out in tests.
#[async_trait]
pub trait InputPreparer: Send + Sync {
    async fn prepare(&self, payload: &UploadJobPayload) -> Result<PreparedInput, JobError>;
}

/// Production preparer: [`InputCopier`] + [`MediaProber`] + validation.
pub struct SourcePreparer {
    copier: InputCopier,
    prober: Arc<dyn MediaProber>,
    store: Arc<dyn ObjectStore>,
    key_unwrapper: Option<Arc<dyn KeyUnwrapper>>,
    config: Arc<CoordinatorConfig>,
}

impl SourcePreparer {
    pub fn new(
        copier: InputCopier,
        prober: Arc<dyn MediaProber>,
        store: Arc<dyn ObjectStore>,
        key_unwrapper: Option<Arc<dyn KeyUnwrapper>>,
        config: Arc<CoordinatorConfig>,
    ) -> Self {
        Self {
            copier,
            prober,
            store,
            key_unwrapper,
            config,
        }
    }

    /// Where the working copy lands. `source_copy` jobs re-point the
    /// transfer at the HLS target's `video/` subpath: the caller has staged
    /// (or wants) the source alongside its outputs.
    fn transfer_url(&self, payload: &UploadJobPayload) -> Result<String, JobError> {
        let basename = payload
            .source_url
            .split(['?', '#'])
            .next()
            .unwrap_or(payload.source_url.as_str())
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| JobError::invalid_input("source URL has no basename"))?;

        if payload.source_copy {
            let hls_target = payload
                .hls_target_url
                .as_deref()
                .ok_or(JobError::MissingTarget { kind: "hls" })?;
            return Ok(join_url(hls_target, &["video", basename]));
        }
        Ok(join_url(
            &self.config.source_output_base_url,
            &[&payload.request_id, basename],
        ))
    }
}

#[async_trait]
impl InputPreparer for SourcePreparer {
    async fn prepare(&self, payload: &UploadJobPayload) -> Result<PreparedInput, JobError> {
        let transfer_url = self.transfer_url(payload)?;

        let decryption = match (&payload.encryption, &self.key_unwrapper) {
            (Some(encryption), Some(unwrapper)) => {
                Some(unwrapper.unwrap_key(&encryption.encrypted_key)?)
            }
            (Some(_), None) => {
                return Err(JobError::unretriable(JobError::Decryption {
                    reason: "encrypted source but no key unwrapper configured".to_string(),
                }));
            }
            (None, _) => None,
        };

        let copied_bytes = self
            .copier
            .copy_source(
                &payload.source_url,
                &transfer_url,
                decryption.as_ref(),
                Duration::from_secs(self.config.max_copy_file_duration_secs),
            )
            .await?;

        let mut input_video = probe_source(&self.prober, &self.store, &transfer_url).await?;
        if input_video.size_bytes == 0 {
            input_video.size_bytes = copied_bytes;
        }
        validate_input(&input_video, &self.config)?;

        let signed_source_url = self.copier.signed_source_url(&transfer_url).await?;
        info!(
            request_id = %payload.request_id,
            %transfer_url,
            duration_secs = input_video.duration_secs,
            size_bytes = input_video.size_bytes,
            "source prepared"
        );
        Ok(PreparedInput {
            input_video,
            signed_source_url,
            copied_bytes,
        })
    }
}
