//! External pipeline: delegate the whole transcode to a cloud provider and
//! copy its outputs onto the caller's targets.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::callback::{StatusSink, TranscodeStatus, TranscodeStatusMessage};
use crate::config::CoordinatorConfig;
use crate::error::JobError;
use crate::job::model::{EncodedProfile, InputVideo, JobInfo, OutputAsset, OutputKind, UploadJobResult};
use crate::job::progress::overall_completion_ratio;
use crate::pipeline::{HandlerOutput, PipelineHandler};
use crate::storage::{ObjectStore, join_url, rewrite_prefix};

/// What the provider is asked to do.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub signed_source_url: String,
    pub hls_target_url: Option<String>,
    pub mp4_target_url: Option<String>,
    pub profiles: Vec<EncodedProfile>,
    pub generate_mp4: bool,
    pub target_segment_size_secs: u64,
    pub input: InputVideo,
}

/// Provider outputs, still located in provider-managed storage.
#[derive(Debug, Clone, Default)]
pub struct ProviderOutputs {
    pub assets: Vec<OutputAsset>,
}

/// Progress hooks the provider client drives while the transcode runs.
pub trait ProviderCallbacks: Send + Sync {
    fn report_progress(&self, progress: f64);
    fn collect_source_size(&self, bytes: u64);
    fn collect_transcoded_segment(&self);
}

/// The cloud transcoder seam.
#[async_trait]
pub trait TranscodeProvider: Send + Sync {
    async fn transcode(
        &self,
        request: ProviderRequest,
        callbacks: Arc<dyn ProviderCallbacks>,
    ) -> Result<ProviderOutputs, JobError>;
}

struct JobCallbacks {
    request_id: String,
    callback_url: String,
    status: Arc<dyn StatusSink>,
    source_bytes: AtomicU64,
    transcoded_segments: AtomicU64,
}

impl ProviderCallbacks for JobCallbacks {
    fn report_progress(&self, progress: f64) {
        let message = TranscodeStatusMessage::progress(
            self.request_id.clone(),
            TranscodeStatus::Transcoding,
            overall_completion_ratio(TranscodeStatus::Transcoding, progress),
        );
        let status = Arc::clone(&self.status);
        let callback_url = self.callback_url.clone();
        tokio::spawn(async move {
            if let Err(e) = status.send(&callback_url, message).await {
                warn!(error = %e, "progress callback delivery failed");
            }
        });
    }

    fn collect_source_size(&self, bytes: u64) {
        self.source_bytes.store(bytes, Ordering::Relaxed);
    }

    fn collect_transcoded_segment(&self) {
        self.transcoded_segments.fetch_add(1, Ordering::Relaxed);
    }
}

/// Handler that runs a job through [`TranscodeProvider`].
pub struct ExternalPipeline {
    provider: Arc<dyn TranscodeProvider>,
    store: Arc<dyn ObjectStore>,
    status: Arc<dyn StatusSink>,
    config: Arc<CoordinatorConfig>,
}

impl ExternalPipeline {
    pub fn new(
        provider: Arc<dyn TranscodeProvider>,
        store: Arc<dyn ObjectStore>,
        status: Arc<dyn StatusSink>,
        config: Arc<CoordinatorConfig>,
    ) -> Self {
        Self {
            provider,
            store,
            status,
            config,
        }
    }

    /// Move one provider asset under the matching caller target. Assets
    /// without a matching target stay where the provider put them.
    async fn deliver_asset(
        &self,
        job: &JobInfo,
        mut asset: OutputAsset,
    ) -> Result<OutputAsset, JobError> {
        let target_base = match asset.kind {
            OutputKind::Manifest | OutputKind::Video => job.payload.hls_target_url.as_deref(),
            OutputKind::Mp4 => job.payload.mp4_target_url.as_deref(),
            OutputKind::FragMp4 => job.payload.frag_mp4_target_url.as_deref(),
            OutputKind::Clip => job.payload.clip_target_url.as_deref(),
        };
        let Some(target_base) = target_base else {
            return Ok(asset);
        };

        let basename = asset
            .location
            .rsplit('/')
            .next()
            .unwrap_or(asset.location.as_str());
        let destination = join_url(target_base, &[basename]);
        let bytes = self.store.read(&asset.location).await?;
        self.store.write(&destination, bytes).await?;
        asset.location = destination;
        Ok(asset)
    }
}

#[async_trait]
impl PipelineHandler for ExternalPipeline {
    fn name(&self) -> &'static str {
        "external"
    }

    async fn handle_start_upload_job(
        &self,
        job: &mut JobInfo,
    ) -> Result<HandlerOutput, JobError> {
        let request = ProviderRequest {
            signed_source_url: job.signed_source_url.clone(),
            hls_target_url: job.payload.hls_target_url.clone(),
            mp4_target_url: job.payload.mp4_target_url.clone(),
            profiles: job.payload.profiles.clone(),
            generate_mp4: job.generate_mp4,
            target_segment_size_secs: job.target_segment_size_secs,
            input: job.input_video.clone(),
        };
        let callbacks = Arc::new(JobCallbacks {
            request_id: job.payload.request_id.clone(),
            callback_url: job.payload.callback_url.clone(),
            status: Arc::clone(&self.status),
            source_bytes: AtomicU64::new(job.source_stats.bytes),
            transcoded_segments: AtomicU64::new(0),
        });

        let deadline = Duration::from_secs(self.config.external_transcode_timeout_secs);
        let outputs = match tokio::time::timeout(
            deadline,
            self.provider
                .transcode(request, Arc::clone(&callbacks) as Arc<dyn ProviderCallbacks>),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(JobError::ExternalTimeout {
                    limit_secs: deadline.as_secs(),
                });
            }
        };

        job.transcoded_segments = callbacks.transcoded_segments.load(Ordering::Relaxed);
        job.source_stats.bytes = callbacks.source_bytes.load(Ordering::Relaxed);
        job.transcoding_done = Some(chrono::Utc::now());

        let mut delivered = Vec::with_capacity(outputs.assets.len());
        for asset in outputs.assets {
            delivered.push(self.deliver_asset(job, asset).await?);
        }

        if let (Some(publish_base), Some(hls_target)) = (
            self.config.publish_base_url.as_deref(),
            job.payload.hls_target_url.as_deref(),
        ) {
            for asset in &mut delivered {
                asset.location = rewrite_prefix(&asset.location, hls_target, publish_base);
            }
        }

        info!(
            request_id = %job.payload.request_id,
            outputs = delivered.len(),
            "external transcode finished"
        );
        Ok(HandlerOutput::Result(UploadJobResult {
            input_video: job.input_video.clone(),
            outputs: delivered,
        }))
    }
}
