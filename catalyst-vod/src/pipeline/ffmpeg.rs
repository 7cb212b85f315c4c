//! In-process pipeline: segment with FFmpeg, transcode segment-by-segment
//! against the broadcaster network, assemble manifests and MP4 outputs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use m3u8_rs::MediaPlaylist;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use hls_vod::{
    BoundaryEncodeSettings, RenditionStats, absolute_segments, clip_playlist, is_hls_input,
    master_playlist, parse_media_playlist, program_time_to_relative, rendition_playlist,
    select_clip_segments, write_playlist,
};
use transcode_pool::{PoolConfig, TranscodePool};

use crate::broadcaster::{Broadcaster, RenditionMedia, TranscodeSegmentRequest};
use crate::callback::{StatusSink, TranscodeStatus, TranscodeStatusMessage};
use crate::config::CoordinatorConfig;
use crate::error::JobError;
use crate::job::model::{
    ClipRequest, EncodedProfile, JobInfo, JobState, OutputAsset, OutputKind, UploadJobResult,
};
use crate::job::progress::overall_completion_ratio;
use crate::media::ffmpeg::{FfmpegDriver, SegmentingMode, SegmentingOptions};
use crate::media::mp4::{RenditionTable, mp4_eligible};
use crate::media::probe::MediaProber;
use crate::pipeline::{HandlerOutput, PipelineHandler, profiles::resolve_profiles};
use crate::retry::{RetryAction, RetryPolicy, retry_with_backoff};
use crate::storage::{ObjectStore, join_url, parent_url, rewrite_prefix};

/// One unit of transcode work handed to the pool.
#[derive(Debug, Clone)]
struct SegmentWork {
    seq: u64,
    url: String,
    duration_ms: u64,
}

/// The in-process "catalyst-ffmpeg" pipeline.
pub struct FfmpegPipeline {
    store: Arc<dyn ObjectStore>,
    driver: Arc<dyn FfmpegDriver>,
    prober: Arc<dyn MediaProber>,
    broadcaster: Arc<dyn Broadcaster>,
    status: Arc<dyn StatusSink>,
    config: Arc<CoordinatorConfig>,
}

impl FfmpegPipeline {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        driver: Arc<dyn FfmpegDriver>,
        prober: Arc<dyn MediaProber>,
        broadcaster: Arc<dyn Broadcaster>,
        status: Arc<dyn StatusSink>,
        config: Arc<CoordinatorConfig>,
    ) -> Self {
        Self {
            store,
            driver,
            prober,
            broadcaster,
            status,
            config,
        }
    }

    /// Best-effort progress report; delivery failures must not fail the job.
    async fn report_progress(&self, job: &JobInfo, status: TranscodeStatus, stage_ratio: f64) {
        let message = TranscodeStatusMessage::progress(
            job.payload.request_id.clone(),
            status,
            overall_completion_ratio(status, stage_ratio),
        );
        if let Err(e) = self.status.send(&job.payload.callback_url, message).await {
            warn!(request_id = %job.payload.request_id, error = %e, "progress callback failed");
        }
    }

    /// Segment the signed source, falling back to a re-encode when the fast
    /// path yields segments that do not start on keyframes.
    async fn segment_source(&self, job: &JobInfo, manifest_url: &str) -> Result<(), JobError> {
        let fast = SegmentingOptions {
            mode: SegmentingMode::FastCopy,
            target_segment_size_secs: job.target_segment_size_secs,
        };
        self.driver
            .segment(&job.signed_source_url, manifest_url, &fast)
            .await?;

        if !self.driver.starts_on_keyframes(manifest_url).await? {
            info!(
                request_id = %job.payload.request_id,
                "fast segmenting misaligned keyframes, re-encoding"
            );
            let reencode = SegmentingOptions {
                mode: SegmentingMode::Reencode,
                ..fast
            };
            self.driver
                .segment(&job.signed_source_url, manifest_url, &reencode)
                .await?;
        }
        Ok(())
    }

    async fn load_segments(
        &self,
        manifest_url: &str,
    ) -> Result<(MediaPlaylist, Vec<SegmentWork>), JobError> {
        let manifest_bytes = self.store.read(manifest_url).await?;
        let playlist = parse_media_playlist(&manifest_bytes)?;
        let base = Url::parse(manifest_url).map_err(|e| JobError::Segmenting {
            reason: format!("bad segmenting manifest URL: {e}"),
        })?;
        let segments = absolute_segments(&playlist, &base)?
            .into_iter()
            .enumerate()
            .map(|(i, segment)| SegmentWork {
                seq: i as u64,
                url: segment.url.into(),
                duration_ms: segment.duration_ms,
            })
            .collect();
        Ok((playlist, segments))
    }

    /// Recordings sometimes trail an audio-only stub segment; it cannot be
    /// transcoded, so drop it from both the playlist and the work list.
    async fn drop_trailing_audio_only(
        &self,
        playlist: &mut MediaPlaylist,
        segments: &mut Vec<SegmentWork>,
    ) {
        if segments.len() < 2 {
            return;
        }
        let last_url = match segments.last() {
            Some(last) => last.url.clone(),
            None => return,
        };
        match self.prober.probe_url(&last_url).await {
            Ok(probed) if probed.video_track().is_none() => {
                info!(url = %last_url, "dropping trailing audio-only segment");
                playlist.segments.truncate(segments.len() - 1);
                segments.pop();
            }
            Ok(_) => {}
            // An unprobeable tail segment is the transcoder's problem, not
            // grounds to silently shorten the recording.
            Err(e) => debug!(url = %last_url, error = %e, "trailing segment probe failed"),
        }
    }

    /// Clip the source playlist: re-encode boundary segments for
    /// frame-accurate cuts, copy interior segments, write the clip manifest,
    /// and swap the work list to the clipped segments.
    async fn apply_clip(
        &self,
        job: &JobInfo,
        clip: &ClipRequest,
        playlist: &MediaPlaylist,
        segments: &[SegmentWork],
    ) -> Result<(MediaPlaylist, Vec<SegmentWork>), JobError> {
        let clip_target = job
            .payload
            .clip_target_url
            .as_deref()
            .ok_or(JobError::MissingTarget { kind: "clip" })?;

        let start_secs = program_time_to_relative(playlist, clip.start_unix_millis)?;
        let end_secs = program_time_to_relative(playlist, clip.end_unix_millis)?;
        let selection = select_clip_segments(playlist, start_secs, end_secs)?;
        let clip_base = parent_url(clip_target);

        let first_seq = selection.boundaries[0].seq_id;
        let media_sequence = playlist.media_sequence;
        let reencode: HashMap<u64, f64> = boundary_cuts(&selection);

        let mut clipped = clip_playlist(playlist, &selection);
        let mut clip_segments = Vec::with_capacity(clipped.segments.len());
        for (offset, segment) in clipped.segments.iter_mut().enumerate() {
            let seq = first_seq + offset as u64;
            let source = &segments[(seq - media_sequence) as usize];
            let bytes = self.download_segment(&source.url).await?;

            let bytes = if let Some(&from_secs) = reencode.get(&seq) {
                // The first segment of a two-boundary cut keeps everything
                // from the offset onward; the others are bounded by their
                // trimmed duration.
                let first_of_two = selection.boundaries.len() == 2 && seq == first_seq;
                let duration_secs = (!first_of_two).then_some(segment.duration as f64);
                self.driver
                    .reencode_boundary(
                        bytes,
                        from_secs,
                        duration_secs,
                        &BoundaryEncodeSettings::default(),
                    )
                    .await?
            } else {
                bytes
            };

            let target = join_url(&clip_base, &[&format!("{seq}.ts")]);
            self.upload(&target, bytes).await?;
            segment.uri = format!("{seq}.ts");
            clip_segments.push(SegmentWork {
                seq,
                url: target,
                duration_ms: (segment.duration as f64 * 1000.0).round() as u64,
            });
        }

        self.upload(clip_target, Bytes::from(write_playlist(&clipped)?))
            .await?;
        info!(
            request_id = %job.payload.request_id,
            segments = clip_segments.len(),
            start_secs,
            end_secs,
            "clipped source playlist"
        );
        Ok((clipped, clip_segments))
    }

    async fn download_segment(&self, url: &str) -> Result<Bytes, JobError> {
        let policy = RetryPolicy::constant(
            self.config.segment_download_max_retries,
            self.config.segment_download_backoff(),
        );
        retry_with_backoff(&policy, "segment download", |_| async {
            match self.store.read(url).await {
                Ok(bytes) => RetryAction::Success(bytes),
                Err(e) => RetryAction::Retry(JobError::Storage { source: e }),
            }
        })
        .await
    }

    async fn upload(&self, url: &str, bytes: Bytes) -> Result<(), JobError> {
        let policy = RetryPolicy::constant(
            self.config.segment_download_max_retries,
            self.config.segment_download_backoff(),
        );
        retry_with_backoff(&policy, "output upload", |_| async {
            match self.store.write(url, bytes.clone()).await {
                Ok(()) => RetryAction::Success(()),
                Err(e) => RetryAction::Retry(JobError::Storage { source: e }),
            }
        })
        .await
    }

    /// Fan the segments out to the broadcaster network and collect rendition
    /// output into stats, uploads, and (when MP4s are wanted) the segment
    /// table.
    #[allow(clippy::too_many_arguments)]
    async fn run_transcode_pool(
        &self,
        job: &JobInfo,
        segments: Vec<SegmentWork>,
        profiles: Arc<Vec<EncodedProfile>>,
        hls_target: &str,
        stats: Arc<Mutex<HashMap<String, RenditionStats>>>,
        table: Arc<RenditionTable>,
        mp4_renditions: Arc<HashSet<String>>,
        transcoded: Arc<AtomicU64>,
    ) -> Result<(), JobError> {
        let total = segments.len();
        let completed = Arc::new(AtomicU64::new(0));

        let store = Arc::clone(&self.store);
        let broadcaster = Arc::clone(&self.broadcaster);
        let status = Arc::clone(&self.status);
        let config = Arc::clone(&self.config);
        let stream_name = job.stream_name.clone();
        let request_id = job.payload.request_id.clone();
        let callback_url = job.payload.callback_url.clone();
        let hls_target = hls_target.to_string();

        let pool = TranscodePool::new(
            segments,
            PoolConfig {
                parallel_jobs: self.config.transcoding_parallel_jobs,
                stagger: self.config.transcoding_parallel_sleep(),
            },
            move |work: SegmentWork| {
                let store = Arc::clone(&store);
                let broadcaster = Arc::clone(&broadcaster);
                let status = Arc::clone(&status);
                let config = Arc::clone(&config);
                let stats = Arc::clone(&stats);
                let table = Arc::clone(&table);
                let mp4_renditions = Arc::clone(&mp4_renditions);
                let profiles = Arc::clone(&profiles);
                let transcoded = Arc::clone(&transcoded);
                let completed = Arc::clone(&completed);
                let stream_name = stream_name.clone();
                let request_id = request_id.clone();
                let callback_url = callback_url.clone();
                let hls_target = hls_target.clone();

                async move {
                    let download_policy = RetryPolicy::constant(
                        config.segment_download_max_retries,
                        config.segment_download_backoff(),
                    );
                    let media = retry_with_backoff(&download_policy, "segment download", |_| {
                        let store = Arc::clone(&store);
                        let url = work.url.clone();
                        async move {
                            match store.read(&url).await {
                                Ok(bytes) => RetryAction::Success(bytes),
                                Err(e) => RetryAction::Retry(JobError::Storage { source: e }),
                            }
                        }
                    })
                    .await?;

                    let request = TranscodeSegmentRequest {
                        manifest_id: stream_name.clone(),
                        seq: work.seq,
                        media,
                        duration_ms: work.duration_ms,
                        profiles: profiles.as_ref().clone(),
                    };
                    let parts = retry_with_backoff(&download_policy, "segment transcode", |_| {
                        let broadcaster = Arc::clone(&broadcaster);
                        let request = request.clone();
                        async move {
                            match broadcaster.transcode_segment(&request).await {
                                Ok(parts) => RetryAction::Success(parts),
                                Err(e) if e.is_retryable() => {
                                    RetryAction::Retry(JobError::Broadcaster { source: e })
                                }
                                Err(e) => {
                                    RetryAction::Fail(JobError::Broadcaster { source: e })
                                }
                            }
                        }
                    })
                    .await?;

                    for part in parts {
                        let bytes = match part.media {
                            RenditionMedia::Bytes(bytes) => bytes,
                            RenditionMedia::Uri(uri) => {
                                store.read(&uri).await.map_err(|e| JobError::Transcode {
                                    reason: format!("fetching rendition URI {uri}: {e}"),
                                })?
                            }
                        };

                        let target =
                            join_url(&hls_target, &[&part.name, &format!("{}.ts", work.seq)]);
                        retry_with_backoff(&download_policy, "rendition upload", |_| {
                            let store = Arc::clone(&store);
                            let target = target.clone();
                            let bytes = bytes.clone();
                            async move {
                                match store.write(&target, bytes).await {
                                    Ok(()) => RetryAction::Success(()),
                                    Err(e) => {
                                        RetryAction::Retry(JobError::Storage { source: e })
                                    }
                                }
                            }
                        })
                        .await?;

                        if let Some(rendition) = stats.lock().get_mut(&part.name) {
                            rendition.record_segment(bytes.len() as u64, work.duration_ms);
                        }
                        if mp4_renditions.contains(&part.name) {
                            table.insert(&part.name, work.seq, bytes);
                        }
                        transcoded.fetch_add(1, Ordering::Relaxed);
                    }

                    let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                    let message = TranscodeStatusMessage::progress(
                        request_id.clone(),
                        TranscodeStatus::Transcoding,
                        overall_completion_ratio(
                            TranscodeStatus::Transcoding,
                            done as f64 / total.max(1) as f64,
                        ),
                    );
                    if let Err(e) = status.send(&callback_url, message).await {
                        warn!(request_id = %request_id, error = %e, "transcode progress callback failed");
                    }
                    Ok::<(), JobError>(())
                }
            },
        );

        pool.start();
        pool.wait().await
    }

    /// Build and upload the rendition playlists and the master playlist.
    /// Returns the output assets, master first.
    async fn publish_manifests(
        &self,
        playlist: &MediaPlaylist,
        stats: &mut [RenditionStats],
        hls_target: &str,
    ) -> Result<Vec<OutputAsset>, JobError> {
        hls_vod::sort_renditions(stats);

        let mut outputs = Vec::with_capacity(stats.len() + 1);
        for rendition in stats.iter_mut() {
            let location = join_url(hls_target, &[&rendition.name, "index.m3u8"]);
            let media = rendition_playlist(playlist);
            self.upload(&location, Bytes::from(write_playlist(&media)?))
                .await?;
            rendition.manifest_location = location.clone();

            let mut asset = OutputAsset::new(OutputKind::Video, location);
            asset.width = Some(rendition.width);
            asset.height = Some(rendition.height);
            asset.bitrate = Some(rendition.bits_per_second);
            asset.size_bytes = Some(rendition.bytes);
            outputs.push(asset);
        }

        let master_location = join_url(hls_target, &["index.m3u8"]);
        let master = master_playlist(stats);
        let mut bytes = Vec::new();
        master
            .write_to(&mut bytes)
            .map_err(|e| JobError::Playlist {
                source: hls_vod::PlaylistError::Write(e),
            })?;
        self.upload(&master_location, Bytes::from(bytes)).await?;
        outputs.insert(0, OutputAsset::new(OutputKind::Manifest, master_location));
        Ok(outputs)
    }

    /// Concatenate, remux, upload, and probe MP4 / fMP4 outputs.
    async fn assemble_mp4_outputs(
        &self,
        job: &JobInfo,
        stats: &[RenditionStats],
        table: &RenditionTable,
    ) -> Result<Vec<OutputAsset>, JobError> {
        let mut outputs = Vec::new();
        for rendition in table.rendition_names() {
            if rendition == "low-bitrate" && !self.config.outputs.mp4_for_low_bitrate {
                debug!("skipping MP4 for the low-bitrate rendition");
                continue;
            }
            let expected = stats
                .iter()
                .find(|s| s.name == rendition)
                .map(|s| s.bytes)
                .unwrap_or(0);
            let ts = table.concat_verified(&rendition, expected)?;

            if let Some(mp4_target) = job.payload.mp4_target_url.as_deref() {
                let mp4 = self.driver.mux_mp4(ts.clone()).await?;
                let size_bytes = mp4.len() as u64;
                let location = join_url(mp4_target, &[&format!("{rendition}.mp4")]);
                self.upload(&location, mp4).await?;

                let mut asset = OutputAsset::new(OutputKind::Mp4, location.clone());
                asset.size_bytes = Some(size_bytes);
                match self.prober.probe_url(&location).await {
                    Ok(probed) => {
                        if let Some(video) = probed.video_track() {
                            asset.width = Some(video.width);
                            asset.height = Some(video.height);
                            asset.bitrate = Some(video.bitrate);
                        }
                        asset.size_bytes = Some(probed.size_bytes.max(size_bytes));
                    }
                    Err(e) => warn!(%location, error = %e, "final MP4 probe failed"),
                }
                outputs.push(asset);
            }

            if let Some(frag_target) = job.payload.frag_mp4_target_url.as_deref() {
                let files = self.driver.mux_fmp4(ts).await?;
                let mut primary: Option<String> = None;
                for file in files {
                    let location = join_url(frag_target, &[&file.name]);
                    self.upload(&location, file.bytes).await?;
                    if primary.is_none() || file.name.ends_with(".m3u8") {
                        primary = Some(location);
                    }
                }
                if let Some(location) = primary {
                    outputs.push(OutputAsset::new(OutputKind::FragMp4, location));
                }
            }
        }
        Ok(outputs)
    }
}

/// Map boundary seq ids to their in-segment start offsets for re-encoding.
fn boundary_cuts(selection: &hls_vod::ClipSelection) -> HashMap<u64, f64> {
    let mut cuts = HashMap::new();
    match selection.boundaries.as_slice() {
        [only] => {
            if only.needs_reencode {
                cuts.insert(only.seq_id, only.offset_secs);
            }
        }
        [first, last] => {
            if first.needs_reencode {
                cuts.insert(first.seq_id, first.offset_secs);
            }
            if last.needs_reencode {
                // The last boundary keeps [0, offset).
                cuts.insert(last.seq_id, 0.0);
            }
        }
        _ => {}
    }
    cuts
}

#[async_trait]
impl PipelineHandler for FfmpegPipeline {
    fn name(&self) -> &'static str {
        "catalyst-ffmpeg"
    }

    async fn handle_start_upload_job(
        &self,
        job: &mut JobInfo,
    ) -> Result<HandlerOutput, JobError> {
        let hls_target = job
            .payload
            .hls_target_url
            .clone()
            .ok_or(JobError::MissingTarget { kind: "hls" })?;
        let manifest_url = join_url(
            &self.config.source_output_base_url,
            &[&job.payload.request_id, "source", "index.m3u8"],
        );

        self.segment_source(job, &manifest_url).await?;
        job.segmenting_done = Some(chrono::Utc::now());
        self.report_progress(job, TranscodeStatus::PreparingCompleted, 1.0)
            .await;

        let (mut playlist, mut segments) = self.load_segments(&manifest_url).await?;
        if is_hls_input(&job.payload.source_url) {
            self.drop_trailing_audio_only(&mut playlist, &mut segments)
                .await;
        }

        let clip = job.payload.clip.clone().filter(|clip| clip.enabled);
        let clip_requested = clip.is_some();
        if let Some(clip) = clip
            && is_hls_input(&job.payload.source_url)
        {
            let (clipped, clip_segments) =
                self.apply_clip(job, &clip, &playlist, &segments).await?;
            playlist = clipped;
            segments = clip_segments;
        }

        let profiles = resolve_profiles(
            &job.payload.profiles,
            &job.input_video,
            is_hls_input(&job.payload.source_url) && !clip_requested,
        )?;
        job.payload.profiles = profiles.clone();
        job.num_profiles = profiles.len();
        job.source_stats.segments = segments.len();

        let wants_mp4 = mp4_eligible(
            job.input_video.duration_secs,
            is_hls_input(&job.payload.source_url),
            job.payload.mp4_target_url.is_some(),
            job.payload.frag_mp4_target_url.is_some(),
            job.payload.mp4_only_short,
            &self.config.outputs,
        ) && job.generate_mp4;

        // For HLS input only the top rendition is buffered for MP4; direct
        // uploads buffer every rendition.
        let mp4_renditions: HashSet<String> = if !wants_mp4 {
            HashSet::new()
        } else if is_hls_input(&job.payload.source_url) {
            profiles
                .iter()
                .max_by_key(|profile| profile.bitrate)
                .map(|profile| profile.name.clone())
                .into_iter()
                .collect()
        } else {
            profiles.iter().map(|profile| profile.name.clone()).collect()
        };

        let stats: Arc<Mutex<HashMap<String, RenditionStats>>> = Arc::new(Mutex::new(
            profiles
                .iter()
                .map(|profile| {
                    (
                        profile.name.clone(),
                        RenditionStats {
                            name: profile.name.clone(),
                            width: profile.width,
                            height: profile.height,
                            ..RenditionStats::default()
                        },
                    )
                })
                .collect(),
        ));
        let table = Arc::new(RenditionTable::new());
        let transcoded = Arc::new(AtomicU64::new(0));

        job.state = JobState::Transcoding;
        self.run_transcode_pool(
            job,
            segments,
            Arc::new(profiles),
            &hls_target,
            Arc::clone(&stats),
            Arc::clone(&table),
            Arc::new(mp4_renditions),
            Arc::clone(&transcoded),
        )
        .await?;
        job.transcoded_segments = transcoded.load(Ordering::Relaxed);
        job.transcoding_done = Some(chrono::Utc::now());

        let mut stats: Vec<RenditionStats> = {
            let locked = stats.lock();
            locked.values().cloned().collect()
        };
        job.rendition_stats = stats.clone();

        let mut outputs = self
            .publish_manifests(&playlist, &mut stats, &hls_target)
            .await?;
        if wants_mp4 {
            outputs.extend(self.assemble_mp4_outputs(job, &stats, &table).await?);
        }

        if let Some(publish_base) = self.config.publish_base_url.as_deref() {
            for asset in &mut outputs {
                asset.location = rewrite_prefix(&asset.location, &hls_target, publish_base);
            }
        }

        info!(
            request_id = %job.payload.request_id,
            renditions = stats.len(),
            transcoded_segments = job.transcoded_segments,
            "in-process transcode finished"
        );
        Ok(HandlerOutput::Result(UploadJobResult {
            input_video: job.input_video.clone(),
            outputs,
        }))
    }
}
