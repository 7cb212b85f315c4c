//! Lifecycle callback messages and their delivery seam.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::JobError;
use crate::job::model::{InputVideo, OutputAsset};
use crate::retry::{RetryAction, RetryPolicy, retry_with_backoff};

/// Lifecycle stage reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscodeStatus {
    Preparing,
    PreparingCompleted,
    Transcoding,
    Completed,
    Error,
}

impl std::fmt::Display for TranscodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TranscodeStatus::Preparing => "preparing",
            TranscodeStatus::PreparingCompleted => "preparing_completed",
            TranscodeStatus::Transcoding => "transcoding",
            TranscodeStatus::Completed => "completed",
            TranscodeStatus::Error => "error",
        };
        write!(f, "{label}")
    }
}

/// One callback message, POSTed as JSON to the job's `callback_url`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeStatusMessage {
    pub request_id: String,
    pub status: TranscodeStatus,
    pub completion_ratio: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unretriable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_video: Option<InputVideo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<OutputAsset>>,
}

impl TranscodeStatusMessage {
    pub fn progress(request_id: impl Into<String>, status: TranscodeStatus, ratio: f64) -> Self {
        Self {
            request_id: request_id.into(),
            status,
            completion_ratio: ratio,
            error: None,
            unretriable: None,
            input_video: None,
            outputs: None,
        }
    }

    pub fn completed(
        request_id: impl Into<String>,
        input_video: InputVideo,
        outputs: Vec<OutputAsset>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            status: TranscodeStatus::Completed,
            completion_ratio: 1.0,
            error: None,
            unretriable: None,
            input_video: Some(input_video),
            outputs: Some(outputs),
        }
    }

    pub fn failed(request_id: impl Into<String>, error: &JobError, last_ratio: f64) -> Self {
        Self {
            request_id: request_id.into(),
            status: TranscodeStatus::Error,
            completion_ratio: last_ratio,
            error: Some(error.to_string()),
            unretriable: Some(error.is_unretriable()),
            input_video: None,
            outputs: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            TranscodeStatus::Completed | TranscodeStatus::Error
        )
    }
}

/// Delivery seam for callback messages.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn send(
        &self,
        callback_url: &str,
        message: TranscodeStatusMessage,
    ) -> Result<(), JobError>;
}

/// Production sink: JSON POST with transport-level retries.
pub struct HttpStatusSink {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl HttpStatusSink {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            policy: RetryPolicy::exponential(
                2,
                Duration::from_millis(500),
                Duration::from_secs(5),
            ),
        }
    }
}

#[async_trait]
impl StatusSink for HttpStatusSink {
    async fn send(
        &self,
        callback_url: &str,
        message: TranscodeStatusMessage,
    ) -> Result<(), JobError> {
        debug!(
            request_id = %message.request_id,
            status = %message.status,
            completion_ratio = message.completion_ratio,
            "delivering status callback"
        );
        retry_with_backoff(&self.policy, "status callback", |_| async {
            let response = self
                .client
                .post(callback_url)
                .json(&message)
                .send()
                .await;
            match response {
                Ok(resp) if resp.status().is_success() => RetryAction::Success(()),
                Ok(resp) if resp.status().is_server_error() => {
                    RetryAction::Retry(JobError::Callback {
                        reason: format!("callback endpoint returned {}", resp.status()),
                    })
                }
                Ok(resp) => RetryAction::Fail(JobError::Callback {
                    reason: format!("callback endpoint returned {}", resp.status()),
                }),
                Err(e) => RetryAction::Retry(JobError::Callback {
                    reason: e.to_string(),
                }),
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_wire_shape_omits_empty_fields() {
        let message = TranscodeStatusMessage::progress("req1", TranscodeStatus::Preparing, 0.0);
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["request_id"], "req1");
        assert_eq!(json["status"], "preparing");
        assert_eq!(json["completion_ratio"], 0.0);
        assert!(json.get("error").is_none());
        assert!(json.get("outputs").is_none());
    }

    #[test]
    fn failure_message_carries_retriability() {
        let err = JobError::invalid_input("no video track");
        let message = TranscodeStatusMessage::failed("req1", &err, 0.2);
        assert_eq!(message.status, TranscodeStatus::Error);
        assert_eq!(message.unretriable, Some(true));
        assert!(message.is_terminal());
        assert!(message.error.unwrap().contains("no video track"));
    }

    #[test]
    fn completed_message_is_terminal_and_full() {
        let message =
            TranscodeStatusMessage::completed("req1", InputVideo::default(), Vec::new());
        assert!(message.is_terminal());
        assert_eq!(message.completion_ratio, 1.0);
        assert!(message.input_video.is_some());
    }
}
