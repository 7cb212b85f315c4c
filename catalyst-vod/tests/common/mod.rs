//! Shared in-memory fakes for the integration suites.
#![allow(dead_code)]

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use catalyst_vod::callback::{StatusSink, TranscodeStatusMessage};
use catalyst_vod::error::JobError;
use catalyst_vod::job::model::{
    AudioTrack, InputTrack, InputVideo, UploadJobPayload, VideoTrack,
};
use catalyst_vod::media::prepare::{InputPreparer, PreparedInput};
use catalyst_vod::storage::{ObjectStore, StorageError};

/// Object store backed by a map.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, Bytes>>,
}

impl MemoryStore {
    pub fn put(&self, url: &str, body: impl Into<Bytes>) {
        self.objects.lock().insert(url.to_string(), body.into());
    }

    pub fn get(&self, url: &str) -> Option<Bytes> {
        self.objects.lock().get(url).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn read(&self, url: &str) -> Result<Bytes, StorageError> {
        self.get(url).ok_or_else(|| StorageError::Read {
            url: url.to_string(),
            reason: "missing object".to_string(),
        })
    }

    async fn write(&self, url: &str, body: Bytes) -> Result<(), StorageError> {
        self.put(url, body);
        Ok(())
    }

    async fn is_publicly_readable(&self, url: &str) -> bool {
        self.get(url).is_some()
    }
}

/// Status sink that records every delivered message.
#[derive(Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<TranscodeStatusMessage>>,
}

impl RecordingSink {
    pub fn messages(&self) -> Vec<TranscodeStatusMessage> {
        self.messages.lock().clone()
    }

    pub fn terminal_messages(&self) -> Vec<TranscodeStatusMessage> {
        self.messages()
            .into_iter()
            .filter(|message| message.is_terminal())
            .collect()
    }
}

#[async_trait]
impl StatusSink for RecordingSink {
    async fn send(
        &self,
        _callback_url: &str,
        message: TranscodeStatusMessage,
    ) -> Result<(), JobError> {
        self.messages.lock().push(message);
        Ok(())
    }
}

/// A 1080p H.264 + AAC source, two minutes long.
pub fn hd_input(duration_secs: f64) -> InputVideo {
    InputVideo {
        format: "mp4".to_string(),
        duration_secs,
        size_bytes: 10_000_000,
        tracks: vec![
            InputTrack::Video(VideoTrack {
                codec: "h264".to_string(),
                bitrate: 5_000_000,
                width: 1920,
                height: 1080,
                fps: 30.0,
                display_aspect_ratio: "16:9".to_string(),
                ..VideoTrack::default()
            }),
            InputTrack::Audio(AudioTrack {
                codec: "aac".to_string(),
                bitrate: 128_000,
                channels: 2,
                sample_rate: 48_000,
                sample_bits: 16,
                ..AudioTrack::default()
            }),
        ],
    }
}

/// Preparer that hands back a canned probe result.
pub struct FakePreparer {
    pub input: InputVideo,
}

#[async_trait]
impl InputPreparer for FakePreparer {
    async fn prepare(&self, payload: &UploadJobPayload) -> Result<PreparedInput, JobError> {
        Ok(PreparedInput {
            input_video: self.input.clone(),
            signed_source_url: format!("{}?signed=1", payload.source_url),
            copied_bytes: self.input.size_bytes,
        })
    }
}

/// Preparer that always fails, for pre-pipeline error paths.
pub struct FailingPreparer;

#[async_trait]
impl InputPreparer for FailingPreparer {
    async fn prepare(&self, _payload: &UploadJobPayload) -> Result<PreparedInput, JobError> {
        Err(JobError::Copy {
            reason: "source bucket unreachable".to_string(),
        })
    }
}
