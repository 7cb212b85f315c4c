//! Concurrent cache of live jobs.
//!
//! The cache is the only ownership root for live job state: insertion
//! precedes pipeline start, removal is the last step of finalization.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;

use super::model::JobInfo;

/// One live job: its mutable state behind the per-job mutex.
///
/// All handler-side mutation happens while the mutex is held, giving each
/// job at most one in-flight mutation without any global lock.
#[derive(Debug)]
pub struct Job {
    pub stream_name: String,
    pub info: Mutex<JobInfo>,
}

impl Job {
    pub fn new(info: JobInfo) -> Arc<Self> {
        Arc::new(Self {
            stream_name: info.stream_name.clone(),
            info: Mutex::new(info),
        })
    }
}

/// Mapping `stream_name -> live job`, guarded by a reader-writer lock.
#[derive(Debug, Default)]
pub struct JobCache {
    jobs: RwLock<HashMap<String, Arc<Job>>>,
}

impl JobCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, name: impl Into<String>, job: Arc<Job>) {
        self.jobs.write().insert(name.into(), job);
    }

    /// Missing keys read as `None`, never as an error.
    pub fn get(&self, name: &str) -> Option<Arc<Job>> {
        self.jobs.read().get(name).cloned()
    }

    pub fn remove(&self, name: &str) {
        self.jobs.write().remove(name);
    }

    pub fn keys(&self) -> Vec<String> {
        self.jobs.read().keys().cloned().collect()
    }
}
