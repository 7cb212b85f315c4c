//! The job coordinator: strategy-driven lifecycle per upload job.
//!
//! One job at a time flows `created -> segmenting -> (transcoding) ->
//! completed | failed`. All handler-side mutation happens under the per-job
//! mutex; panics inside handlers are converted to job failures; the
//! `fallback_external` strategy re-runs a failed in-process job through the
//! external pipeline while presenting a single logical job to the caller.

pub mod strategy;

pub use strategy::Strategy;

use std::any::Any;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::{Instrument, error, info, info_span, warn};
use url::Url;

use crate::callback::{StatusSink, TranscodeStatus, TranscodeStatusMessage};
use crate::config::CoordinatorConfig;
use crate::error::JobError;
use crate::job::cache::{Job, JobCache};
use crate::job::model::{JobInfo, JobState, UploadJobPayload, UploadJobResult};
use crate::job::progress::overall_completion_ratio;
use crate::media::mp4::mp4_eligible;
use crate::media::prepare::InputPreparer;
use crate::metrics::{JobOutcomeRecord, JobSink, MetricsCollector};
use crate::pipeline::{HandlerOutput, PipelineHandler, check_in_process_support};

/// Everything the coordinator consumes, injected at construction so tests
/// receive fresh instances.
pub struct CoordinatorDeps {
    pub cache: Arc<JobCache>,
    pub metrics: Arc<MetricsCollector>,
    pub status: Arc<dyn StatusSink>,
    pub job_sink: Option<Arc<dyn JobSink>>,
    pub preparer: Arc<dyn InputPreparer>,
    pub ffmpeg: Arc<dyn PipelineHandler>,
    pub external: Arc<dyn PipelineHandler>,
}

pub struct VodCoordinator {
    config: Arc<CoordinatorConfig>,
    strategy: Strategy,
    cache: Arc<JobCache>,
    metrics: Arc<MetricsCollector>,
    status: Arc<dyn StatusSink>,
    job_sink: Option<Arc<dyn JobSink>>,
    preparer: Arc<dyn InputPreparer>,
    ffmpeg: Arc<dyn PipelineHandler>,
    external: Arc<dyn PipelineHandler>,
}

impl VodCoordinator {
    /// Rejects an unknown default strategy at construction.
    pub fn new(
        config: Arc<CoordinatorConfig>,
        deps: CoordinatorDeps,
    ) -> Result<Arc<Self>, JobError> {
        let strategy = Strategy::parse(&config.strategy)?;
        Ok(Arc::new(Self {
            config,
            strategy,
            cache: deps.cache,
            metrics: deps.metrics,
            status: deps.status,
            job_sink: deps.job_sink,
            preparer: deps.preparer,
            ffmpeg: deps.ffmpeg,
            external: deps.external,
        }))
    }

    pub fn cache(&self) -> &Arc<JobCache> {
        &self.cache
    }

    /// Accept a job: validate, insert into the cache, fire `preparing 0%`,
    /// and launch the copy + probe + dispatch chain in the background.
    ///
    /// The returned receiver yields the job's overall outcome (the fallback
    /// chain counts as one job). Pre-job rejections are returned directly
    /// and never produce callbacks.
    pub fn start_upload_job(
        self: &Arc<Self>,
        payload: UploadJobPayload,
    ) -> Result<oneshot::Receiver<bool>, JobError> {
        validate_payload(&payload)?;

        let info = JobInfo::new(payload, self.config.catalyst_region.clone());
        let request_id = info.payload.request_id.clone();
        let job = Job::new(info);
        self.cache.store(job.stream_name.clone(), Arc::clone(&job));
        info!(%request_id, stream_name = %job.stream_name, "accepted upload job");

        let (overall_tx, overall_rx) = oneshot::channel();
        let coordinator = Arc::clone(self);
        let span = info_span!("upload_job", %request_id, stream_name = %job.stream_name);
        tokio::spawn(
            async move {
                coordinator.prepare_and_dispatch(job, overall_tx).await;
            }
            .instrument(span),
        );
        Ok(overall_rx)
    }

    async fn prepare_and_dispatch(
        self: Arc<Self>,
        job: Arc<Job>,
        overall_tx: oneshot::Sender<bool>,
    ) {
        self.metrics.record_job_started();
        self.send_progress(&job, TranscodeStatus::Preparing, 0.0)
            .await;

        let prepared = {
            let mut info = job.info.lock().await;
            let prepare = self.prepare_input(&mut info);
            match std::panic::AssertUnwindSafe(prepare).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(JobError::HandlerPanic {
                    detail: panic_detail(panic),
                }),
            }
        };
        if let Err(err) = prepared {
            error!(error = %err, "input preparation failed");
            let mut info = job.info.lock().await;
            self.finish_job(&mut info, Err(err)).await;
            let _ = overall_tx.send(false);
            return;
        }

        self.send_progress(&job, TranscodeStatus::Preparing, 0.5)
            .await;
        self.dispatch_strategy(job, overall_tx).await;
    }

    async fn prepare_input(&self, info: &mut JobInfo) -> Result<(), JobError> {
        let prepared = self.preparer.prepare(&info.payload).await?;
        info.set_input(prepared.input_video, prepared.signed_source_url);
        // The staged working copy is what playback of the source serves.
        info.source_playback_done = Some(Utc::now());
        if prepared.copied_bytes > info.source_stats.bytes {
            info.source_stats.bytes = prepared.copied_bytes;
        }

        let wants_mp4 =
            info.payload.generate_mp4 || info.payload.frag_mp4_target_url.is_some();
        info.generate_mp4 = wants_mp4
            && mp4_eligible(
                info.input_video.duration_secs,
                hls_vod::is_hls_input(&info.payload.source_url),
                info.payload.mp4_target_url.is_some(),
                info.payload.frag_mp4_target_url.is_some(),
                info.payload.mp4_only_short,
                &self.config.outputs,
            );
        info.livepeer_supported = match check_in_process_support(&info.input_video) {
            Ok(()) => true,
            Err(err) => {
                info!(reason = %err, "input not supported in-process, external only");
                false
            }
        };
        Ok(())
    }

    async fn dispatch_strategy(self: Arc<Self>, job: Arc<Job>, overall_tx: oneshot::Sender<bool>) {
        let (requested, supported) = {
            let info = job.info.lock().await;
            let requested = info
                .payload
                .pipeline_strategy
                .as_deref()
                .and_then(|value| Strategy::parse(value).ok())
                .unwrap_or(self.strategy);
            (requested, info.livepeer_supported)
        };
        let strategy = match requested {
            Strategy::CatalystFfmpeg | Strategy::FallbackExternal if !supported => {
                Strategy::External
            }
            other => other,
        };
        info!(%strategy, "dispatching pipeline");

        match strategy {
            Strategy::External => {
                let result = self.start_one_upload_job(job, Arc::clone(&self.external), false);
                forward_result(result, overall_tx);
            }
            Strategy::CatalystFfmpeg => {
                let result = self.start_one_upload_job(job, Arc::clone(&self.ffmpeg), false);
                forward_result(result, overall_tx);
            }
            Strategy::FallbackExternal => {
                let first = self.start_one_upload_job(
                    Arc::clone(&job),
                    Arc::clone(&self.ffmpeg),
                    true,
                );
                let coordinator = Arc::clone(&self);
                tokio::spawn(async move {
                    if first.await.unwrap_or(false) {
                        let _ = overall_tx.send(true);
                        return;
                    }
                    info!("in-process pipeline failed, falling back to external");
                    {
                        let mut info = job.info.lock().await;
                        info.in_fallback_mode = true;
                    }
                    coordinator.metrics.record_job_started();
                    let second = coordinator.start_one_upload_job(
                        job,
                        Arc::clone(&coordinator.external),
                        false,
                    );
                    let _ = overall_tx.send(second.await.unwrap_or(false));
                });
            }
        }
    }

    /// Reset the pipeline-scoped state and run one handler under the job's
    /// mutex. Returns the pipeline's one-shot result.
    fn start_one_upload_job(
        self: &Arc<Self>,
        job: Arc<Job>,
        handler: Arc<dyn PipelineHandler>,
        has_fallback: bool,
    ) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        // Re-insert: a fallback re-run starts after finish_job evicted the
        // first attempt.
        self.cache.store(job.stream_name.clone(), Arc::clone(&job));

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut info = job.info.lock().await;
            info.reset_pipeline(handler.name(), has_fallback, tx);
            coordinator.run_handler(&mut info, handler.as_ref()).await;
        });
        rx
    }

    /// The panic recovery boundary around one handler invocation.
    async fn run_handler(&self, info: &mut JobInfo, handler: &dyn PipelineHandler) {
        let outcome = std::panic::AssertUnwindSafe(handler.handle_start_upload_job(info))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(HandlerOutput::Continue)) => {
                // The handler owns the rest of this job's lifecycle.
            }
            Ok(Ok(HandlerOutput::Result(result))) => {
                self.finish_job(info, Ok(result)).await;
            }
            Ok(Err(err)) => {
                self.finish_job(info, Err(err)).await;
            }
            Err(panic) => {
                let detail = panic_detail(panic);
                error!(pipeline = info.pipeline_name, %detail, "pipeline handler panicked");
                self.finish_job(info, Err(JobError::HandlerPanic { detail }))
                    .await;
            }
        }
    }

    /// Terminal bookkeeping: callback (unless suppressed by a pending
    /// fallback), cache eviction, metrics, and the one-shot result.
    async fn finish_job(&self, info: &mut JobInfo, outcome: Result<UploadJobResult, JobError>) {
        let mut success = outcome.is_ok();
        info.state = if success {
            JobState::Completed
        } else {
            JobState::Failed
        };

        let suppress_callback = info.has_fallback && !success;
        if suppress_callback {
            if let Err(err) = &outcome {
                warn!(
                    pipeline = info.pipeline_name,
                    error = %err,
                    "pipeline failed, fallback pending, suppressing error callback"
                );
            }
        } else {
            let message = match &outcome {
                Ok(result) => TranscodeStatusMessage::completed(
                    info.payload.request_id.clone(),
                    result.input_video.clone(),
                    result.outputs.clone(),
                ),
                Err(err) => TranscodeStatusMessage::failed(
                    info.payload.request_id.clone(),
                    err,
                    overall_completion_ratio(TranscodeStatus::Error, 0.0),
                ),
            };
            if let Err(err) = self
                .status
                .send(&info.payload.callback_url, message)
                .await
            {
                error!(error = %err, "terminal callback delivery failed");
                info.state = JobState::Failed;
                success = false;
            }
        }

        self.cache.remove(&info.stream_name);

        let record = JobOutcomeRecord {
            request_id: info.payload.request_id.clone(),
            external_id: info.payload.external_id.clone(),
            pipeline: info.pipeline_name.to_string(),
            catalyst_region: info.catalyst_region.clone(),
            state: info.state,
            in_fallback_mode: info.in_fallback_mode,
            duration_ms: info
                .start_time
                .map(|start| (Utc::now() - start).num_milliseconds().max(0) as u64)
                .unwrap_or(0),
            source_segments: info.source_stats.segments,
            transcoded_segments: info.transcoded_segments,
            source_bytes: info.source_stats.bytes,
            source_duration_ms: info.source_stats.duration_ms,
        };
        self.metrics.record_job_finished(&record);
        if let Some(sink) = &self.job_sink {
            if let Err(err) = sink.record(&record).await {
                warn!(error = %err, "job outcome sink failed");
            }
        }

        info!(
            pipeline = info.pipeline_name,
            state = %info.state,
            duration_ms = record.duration_ms,
            "job finished"
        );
        if let Some(result) = info.result.take() {
            let _ = result.send(success);
        }
    }

    /// Fire-and-forget progress report.
    async fn send_progress(&self, job: &Arc<Job>, status: TranscodeStatus, stage_ratio: f64) {
        let (request_id, callback_url) = {
            let info = job.info.lock().await;
            (
                info.payload.request_id.clone(),
                info.payload.callback_url.clone(),
            )
        };
        let message = TranscodeStatusMessage::progress(
            request_id,
            status,
            overall_completion_ratio(status, stage_ratio),
        );
        if let Err(err) = self.status.send(&callback_url, message).await {
            warn!(error = %err, "progress callback delivery failed");
        }
    }
}

fn forward_result(rx: oneshot::Receiver<bool>, overall_tx: oneshot::Sender<bool>) {
    tokio::spawn(async move {
        let _ = overall_tx.send(rx.await.unwrap_or(false));
    });
}

fn validate_payload(payload: &UploadJobPayload) -> Result<(), JobError> {
    if payload.request_id.is_empty() {
        return Err(JobError::invalid_input("empty request_id"));
    }
    Url::parse(&payload.source_url)
        .map_err(|e| JobError::invalid_input(format!("bad source URL: {e}")))?;
    Url::parse(&payload.callback_url)
        .map_err(|e| JobError::invalid_input(format!("bad callback URL: {e}")))?;
    if payload.generate_mp4
        && payload.mp4_target_url.is_none()
        && payload.frag_mp4_target_url.is_none()
    {
        return Err(JobError::MissingTarget { kind: "mp4" });
    }
    if let Some(strategy) = payload.pipeline_strategy.as_deref() {
        Strategy::parse(strategy)?;
    }
    Ok(())
}

fn panic_detail(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        return (*s).to_string();
    }
    if let Some(s) = panic.downcast_ref::<String>() {
        return s.clone();
    }
    "<non-string panic payload>".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_validation_rejects_bad_inputs() {
        let ok = UploadJobPayload {
            request_id: "req1".to_string(),
            source_url: "https://in/movie.mp4".to_string(),
            callback_url: "https://caller/status".to_string(),
            ..UploadJobPayload::default()
        };
        assert!(validate_payload(&ok).is_ok());

        let bad_url = UploadJobPayload {
            source_url: "not a url".to_string(),
            ..ok.clone()
        };
        assert!(validate_payload(&bad_url).is_err());

        let mp4_without_target = UploadJobPayload {
            generate_mp4: true,
            ..ok.clone()
        };
        assert!(matches!(
            validate_payload(&mp4_without_target),
            Err(JobError::MissingTarget { kind: "mp4" })
        ));

        let bad_strategy = UploadJobPayload {
            pipeline_strategy: Some("background_mist".to_string()),
            ..ok
        };
        assert!(matches!(
            validate_payload(&bad_strategy),
            Err(JobError::InvalidStrategy { .. })
        ));
    }

    #[test]
    fn panic_payloads_are_stringified() {
        assert_eq!(panic_detail(Box::new("static str")), "static str");
        assert_eq!(
            panic_detail(Box::new("owned".to_string())),
            "owned"
        );
        assert_eq!(panic_detail(Box::new(17u32)), "<non-string panic payload>");
    }
}
