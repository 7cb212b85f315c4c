//! Broadcaster seam: per-segment transcode submission.
//!
//! A broadcaster accepts one `.ts` segment at a time and answers with a
//! `multipart/mixed` body carrying one part per requested rendition. Two
//! clients implement the seam: a URL-configured local broadcaster, and a
//! pool client that provisions a stream through the remote API, submits
//! against a randomly picked broadcaster, and releases the stream.

use async_trait::async_trait;
use bytes::Bytes;
use rand::RngExt;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use crate::job::model::EncodedProfile;

/// Error type for broadcaster interaction.
#[derive(Debug, thiserror::Error)]
pub enum BroadcasterError {
    #[error("broadcaster request failed: {source}")]
    Transport {
        #[from]
        source: reqwest::Error,
    },

    #[error("broadcaster returned HTTP {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },

    #[error("bad multipart response: {reason}")]
    Multipart { reason: String },

    #[error("broadcaster pool is empty")]
    NoBroadcasters,

    #[error("stream setup failed: {reason}")]
    StreamSetup { reason: String },
}

impl BroadcasterError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::StreamSetup { .. } | Self::NoBroadcasters => true,
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Multipart { .. } => false,
        }
    }
}

/// One segment submission.
#[derive(Debug, Clone)]
pub struct TranscodeSegmentRequest {
    pub manifest_id: String,
    pub seq: u64,
    pub media: Bytes,
    pub duration_ms: u64,
    pub profiles: Vec<EncodedProfile>,
}

/// One rendition out of a multipart response.
#[derive(Debug, Clone, PartialEq)]
pub struct RenditionPart {
    pub name: String,
    pub media: RenditionMedia,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RenditionMedia {
    /// Raw transcoded segment bytes.
    Bytes(Bytes),
    /// A URI the rendition can be fetched from instead of inline bytes.
    Uri(String),
}

/// Media type marking a URI part instead of raw segment bytes.
const RENDITION_URI_MEDIA_TYPE: &str = "application/vnd+livepeer.uri";

#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn transcode_segment(
        &self,
        request: &TranscodeSegmentRequest,
    ) -> Result<Vec<RenditionPart>, BroadcasterError>;
}

/// Parse a `multipart/mixed` transcode response into rendition parts.
pub async fn parse_rendition_parts(
    content_type: &str,
    body: Bytes,
) -> Result<Vec<RenditionPart>, BroadcasterError> {
    let boundary =
        multer::parse_boundary(content_type).map_err(|e| BroadcasterError::Multipart {
            reason: format!("bad content type `{content_type}`: {e}"),
        })?;
    let stream =
        futures::stream::once(async move { Ok::<Bytes, std::convert::Infallible>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut parts = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| BroadcasterError::Multipart {
            reason: e.to_string(),
        })?
    {
        let name = field
            .headers()
            .get("Rendition-Name")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if name.is_empty() {
            return Err(BroadcasterError::Multipart {
                reason: "part carries no Rendition-Name header".to_string(),
            });
        }
        let is_uri = field
            .content_type()
            .is_some_and(|mime| mime.essence_str() == RENDITION_URI_MEDIA_TYPE);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| BroadcasterError::Multipart {
                reason: format!("reading part `{name}`: {e}"),
            })?;
        let media = if is_uri {
            RenditionMedia::Uri(String::from_utf8_lossy(&bytes).into_owned())
        } else {
            RenditionMedia::Bytes(bytes)
        };
        parts.push(RenditionPart { name, media });
    }

    if parts.is_empty() {
        return Err(BroadcasterError::Multipart {
            reason: "response contained no rendition parts".to_string(),
        });
    }
    Ok(parts)
}

async fn submit_segment(
    client: &reqwest::Client,
    broadcaster_url: &str,
    request: &TranscodeSegmentRequest,
) -> Result<Vec<RenditionPart>, BroadcasterError> {
    let url = format!(
        "{}/live/{}/{}.ts",
        broadcaster_url.trim_end_matches('/'),
        request.manifest_id,
        request.seq
    );
    debug!(%url, seq = request.seq, bytes = request.media.len(), "submitting segment");

    let mut builder = client
        .post(&url)
        .header(reqwest::header::CONTENT_TYPE, "video/mp2t")
        .header(reqwest::header::ACCEPT, "multipart/mixed")
        .header("Content-Duration", request.duration_ms.to_string());
    if !request.profiles.is_empty() {
        let configuration = serde_json::json!({ "profiles": request.profiles });
        builder = builder.header(
            "Livepeer-Transcode-Configuration",
            configuration.to_string(),
        );
    }

    let response = builder.body(request.media.clone()).send().await?;
    if !response.status().is_success() {
        return Err(BroadcasterError::HttpStatus {
            status: response.status(),
            url,
        });
    }
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let body = response.bytes().await?;
    parse_rendition_parts(&content_type, body).await
}

/// A single URL-configured broadcaster.
pub struct LocalBroadcaster {
    client: reqwest::Client,
    url: String,
}

impl LocalBroadcaster {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Broadcaster for LocalBroadcaster {
    async fn transcode_segment(
        &self,
        request: &TranscodeSegmentRequest,
    ) -> Result<Vec<RenditionPart>, BroadcasterError> {
        submit_segment(&self.client, &self.url, request).await
    }
}

#[derive(Debug, Deserialize)]
struct ProvisionedStream {
    id: String,
}

#[derive(Debug, Deserialize)]
struct BroadcasterNode {
    address: String,
}

/// Pool client against the remote broadcaster API: provision a stream, pick
/// a random broadcaster, submit, release.
pub struct BroadcasterPool {
    client: reqwest::Client,
    api_url: String,
    access_token: String,
}

impl BroadcasterPool {
    pub fn new(
        client: reqwest::Client,
        api_url: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_url: api_url.into(),
            access_token: access_token.into(),
        }
    }

    async fn provision_stream(
        &self,
        request: &TranscodeSegmentRequest,
    ) -> Result<ProvisionedStream, BroadcasterError> {
        let response = self
            .client
            .post(format!("{}/stream", self.api_url.trim_end_matches('/')))
            .bearer_auth(&self.access_token)
            .json(&serde_json::json!({
                "name": request.manifest_id,
                "profiles": request.profiles,
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BroadcasterError::StreamSetup {
                reason: format!("stream create returned {}", response.status()),
            });
        }
        response
            .json()
            .await
            .map_err(|e| BroadcasterError::StreamSetup {
                reason: format!("bad stream create response: {e}"),
            })
    }

    async fn pick_broadcaster(&self) -> Result<String, BroadcasterError> {
        let response = self
            .client
            .get(format!("{}/broadcaster", self.api_url.trim_end_matches('/')))
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BroadcasterError::StreamSetup {
                reason: format!("broadcaster list returned {}", response.status()),
            });
        }
        let nodes: Vec<BroadcasterNode> =
            response
                .json()
                .await
                .map_err(|e| BroadcasterError::StreamSetup {
                    reason: format!("bad broadcaster list: {e}"),
                })?;
        if nodes.is_empty() {
            return Err(BroadcasterError::NoBroadcasters);
        }
        let picked = rand::rng().random_range(0..nodes.len());
        Ok(nodes[picked].address.clone())
    }

    async fn release_stream(&self, stream_id: &str) {
        // Best effort: a leaked stream only costs the remote side cleanup.
        let result = self
            .client
            .delete(format!(
                "{}/stream/{stream_id}",
                self.api_url.trim_end_matches('/')
            ))
            .bearer_auth(&self.access_token)
            .send()
            .await;
        if let Err(e) = result {
            debug!(stream_id, error = %e, "failed to release stream");
        }
    }
}

#[async_trait]
impl Broadcaster for BroadcasterPool {
    async fn transcode_segment(
        &self,
        request: &TranscodeSegmentRequest,
    ) -> Result<Vec<RenditionPart>, BroadcasterError> {
        let stream = self.provision_stream(request).await?;
        let broadcaster_url = match self.pick_broadcaster().await {
            Ok(url) => url,
            Err(e) => {
                self.release_stream(&stream.id).await;
                return Err(e);
            }
        };

        let mut submission = request.clone();
        submission.manifest_id = stream.id.clone();
        let result = submit_segment(&self.client, &broadcaster_url, &submission).await;
        self.release_stream(&stream.id).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn multipart_body(boundary: &str, parts: &[(&str, &str, &[u8])]) -> Bytes {
        let mut body = Vec::new();
        for (name, content_type, payload) in parts {
            body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
            body.extend_from_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
            body.extend_from_slice(format!("Rendition-Name: {name}\r\n\r\n").as_bytes());
            body.extend_from_slice(payload);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
        Bytes::from(body)
    }

    #[tokio::test]
    async fn parses_one_part_per_rendition() {
        let body = multipart_body(
            "bound",
            &[
                ("360p0", "video/mp2t", b"segment-bytes-360"),
                ("720p0", "video/mp2t", b"segment-bytes-720"),
            ],
        );
        let parts = parse_rendition_parts("multipart/mixed; boundary=bound", body)
            .await
            .unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].name, "360p0");
        assert_eq!(
            parts[0].media,
            RenditionMedia::Bytes(Bytes::from_static(b"segment-bytes-360"))
        );
    }

    #[tokio::test]
    async fn uri_parts_are_decoded_as_locations() {
        let body = multipart_body(
            "bound",
            &[(
                "720p0",
                "application/vnd+livepeer.uri",
                b"https://store/720p0/3.ts",
            )],
        );
        let parts = parse_rendition_parts("multipart/mixed; boundary=bound", body)
            .await
            .unwrap();
        assert_eq!(
            parts[0].media,
            RenditionMedia::Uri("https://store/720p0/3.ts".to_string())
        );
    }

    #[tokio::test]
    async fn missing_rendition_name_is_an_error() {
        let boundary = "bound";
        let mut body = Vec::new();
        body.extend_from_slice(b"--bound\r\nContent-Type: video/mp2t\r\n\r\npayload\r\n");
        body.extend_from_slice(b"--bound--\r\n");
        let result = parse_rendition_parts(
            &format!("multipart/mixed; boundary={boundary}"),
            Bytes::from(body),
        )
        .await;
        assert!(matches!(result, Err(BroadcasterError::Multipart { .. })));
    }

    #[tokio::test]
    async fn empty_response_is_an_error() {
        let body = Bytes::from_static(b"--bound--\r\n");
        let result = parse_rendition_parts("multipart/mixed; boundary=bound", body).await;
        assert!(matches!(result, Err(BroadcasterError::Multipart { .. })));
    }

    #[test]
    fn retryability_classification() {
        assert!(
            BroadcasterError::HttpStatus {
                status: StatusCode::BAD_GATEWAY,
                url: "http://b/live/x/0.ts".to_string()
            }
            .is_retryable()
        );
        assert!(
            !BroadcasterError::HttpStatus {
                status: StatusCode::FORBIDDEN,
                url: "http://b/live/x/0.ts".to_string()
            }
            .is_retryable()
        );
        assert!(
            !BroadcasterError::Multipart {
                reason: "truncated".to_string()
            }
            .is_retryable()
        );
    }
}
