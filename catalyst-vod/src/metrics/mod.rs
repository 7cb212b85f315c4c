//! Metrics collection for the coordinator.
//!
//! Counters are process-wide but owned by whoever constructs the collector;
//! the coordinator receives its instance at construction so tests get a
//! fresh one per case.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::job::model::JobState;

/// Metrics collector for VOD jobs.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    jobs_in_flight: AtomicU64,
    /// Terminal job counts keyed by `{pipeline}/{state}`.
    jobs_by_outcome: DashMap<String, AtomicU64>,
    job_duration_total_ms: AtomicU64,
    source_segments_total: AtomicU64,
    transcoded_segments_total: AtomicU64,
    source_bytes_total: AtomicU64,
    source_duration_total_ms: AtomicU64,
}

/// Everything `finish_job` emits about one terminal job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcomeRecord {
    pub request_id: String,
    pub external_id: String,
    pub pipeline: String,
    pub catalyst_region: String,
    pub state: JobState,
    pub in_fallback_mode: bool,
    pub duration_ms: u64,
    pub source_segments: usize,
    pub transcoded_segments: u64,
    pub source_bytes: u64,
    pub source_duration_ms: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_job_started(&self) {
        self.jobs_in_flight.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a terminal job outcome.
    pub fn record_job_finished(&self, record: &JobOutcomeRecord) {
        self.jobs_in_flight.fetch_sub(1, Ordering::Relaxed);
        self.jobs_by_outcome
            .entry(format!("{}/{}", record.pipeline, record.state))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
        self.job_duration_total_ms
            .fetch_add(record.duration_ms, Ordering::Relaxed);
        self.source_segments_total
            .fetch_add(record.source_segments as u64, Ordering::Relaxed);
        self.transcoded_segments_total
            .fetch_add(record.transcoded_segments, Ordering::Relaxed);
        self.source_bytes_total
            .fetch_add(record.source_bytes, Ordering::Relaxed);
        self.source_duration_total_ms
            .fetch_add(record.source_duration_ms, Ordering::Relaxed);
    }

    pub fn jobs_in_flight(&self) -> u64 {
        self.jobs_in_flight.load(Ordering::Relaxed)
    }

    pub fn jobs_by_outcome(&self, pipeline: &str, state: JobState) -> u64 {
        self.jobs_by_outcome
            .get(&format!("{pipeline}/{state}"))
            .map(|counter| counter.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_in_flight: self.jobs_in_flight.load(Ordering::Relaxed),
            jobs_by_outcome: self
                .jobs_by_outcome
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
                .collect(),
            job_duration_total_ms: self.job_duration_total_ms.load(Ordering::Relaxed),
            source_segments_total: self.source_segments_total.load(Ordering::Relaxed),
            transcoded_segments_total: self.transcoded_segments_total.load(Ordering::Relaxed),
            source_bytes_total: self.source_bytes_total.load(Ordering::Relaxed),
            source_duration_total_ms: self.source_duration_total_ms.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the collector, for scrape endpoints and tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub jobs_in_flight: u64,
    pub jobs_by_outcome: Vec<(String, u64)>,
    pub job_duration_total_ms: u64,
    pub source_segments_total: u64,
    pub transcoded_segments_total: u64,
    pub source_bytes_total: u64,
    pub source_duration_total_ms: u64,
}

/// Optional per-job outcome sink (e.g. an analytics table). Delivery is
/// best-effort; failures are logged and never fail the job.
#[async_trait]
pub trait JobSink: Send + Sync {
    async fn record(&self, record: &JobOutcomeRecord) -> Result<(), crate::error::JobError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pipeline: &str, state: JobState) -> JobOutcomeRecord {
        JobOutcomeRecord {
            request_id: "req1".to_string(),
            external_id: String::new(),
            pipeline: pipeline.to_string(),
            catalyst_region: "mdw".to_string(),
            state,
            in_fallback_mode: false,
            duration_ms: 1_000,
            source_segments: 3,
            transcoded_segments: 9,
            source_bytes: 4_096,
            source_duration_ms: 30_000,
        }
    }

    #[test]
    fn outcome_counters_accumulate_by_pipeline_and_state() {
        let metrics = MetricsCollector::new();
        metrics.record_job_started();
        metrics.record_job_started();
        assert_eq!(metrics.jobs_in_flight(), 2);

        metrics.record_job_finished(&record("catalyst-ffmpeg", JobState::Completed));
        metrics.record_job_finished(&record("external", JobState::Failed));

        assert_eq!(metrics.jobs_in_flight(), 0);
        assert_eq!(
            metrics.jobs_by_outcome("catalyst-ffmpeg", JobState::Completed),
            1
        );
        assert_eq!(metrics.jobs_by_outcome("external", JobState::Failed), 1);
        assert_eq!(metrics.jobs_by_outcome("external", JobState::Completed), 0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.source_segments_total, 6);
        assert_eq!(snapshot.transcoded_segments_total, 18);
        assert_eq!(snapshot.source_bytes_total, 8_192);
    }
}
