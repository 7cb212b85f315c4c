//! Input copy into working storage.
//!
//! Plain files are copied (optionally decrypting AES-128-CBC sources on the
//! way through); HLS sources are copied as a tree: the manifest plus every
//! segment, preserving relative paths so the manifest keeps resolving.

use std::sync::Arc;
use std::time::Duration;

use aes::Aes128;
use bytes::Bytes;
use cipher::{BlockModeDecrypt, KeyIvInit, block_padding::Pkcs7};
use tracing::{debug, info};
use url::Url;

use hls_vod::{absolute_segments, is_hls_input, parse_media_playlist};

use crate::error::JobError;
use crate::retry::{RetryAction, RetryPolicy, retry_with_backoff};
use crate::storage::{ObjectStore, UrlSigner, join_url, parent_url, parse_os_url};

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Unwrapped key material for an encrypted source.
#[derive(Debug, Clone)]
pub struct SourceDecryption {
    pub key: Vec<u8>,
    pub iv: [u8; 16],
}

/// Credential seam turning a job's `encrypted_key` payload into usable key
/// material.
pub trait KeyUnwrapper: Send + Sync {
    fn unwrap_key(&self, encrypted_key: &str) -> Result<SourceDecryption, JobError>;
}

/// Decrypt an AES-128-CBC + PKCS#7 payload.
pub fn decrypt_aes_cbc(data: &[u8], decryption: &SourceDecryption) -> Result<Vec<u8>, JobError> {
    let cipher = Aes128CbcDec::new_from_slices(&decryption.key, &decryption.iv).map_err(|e| {
        JobError::Decryption {
            reason: format!("invalid key material: {e}"),
        }
    })?;
    let mut buffer = data.to_vec();
    let plain = cipher
        .decrypt_padded::<Pkcs7>(&mut buffer)
        .map_err(|e| JobError::Decryption {
            reason: format!("bad padding: {e}"),
        })?;
    Ok(plain.to_vec())
}

/// Copies sources into working storage and resolves the signed source URL.
pub struct InputCopier {
    store: Arc<dyn ObjectStore>,
    signer: Option<Arc<dyn UrlSigner>>,
    policy: RetryPolicy,
}

impl InputCopier {
    pub fn new(store: Arc<dyn ObjectStore>, signer: Option<Arc<dyn UrlSigner>>) -> Self {
        Self {
            store,
            signer,
            policy: RetryPolicy::exponential(3, Duration::from_secs(1), Duration::from_secs(30)),
        }
    }

    /// Copy `source_url` to `transfer_url` within `budget`, returning the
    /// number of bytes copied.
    pub async fn copy_source(
        &self,
        source_url: &str,
        transfer_url: &str,
        decryption: Option<&SourceDecryption>,
        budget: Duration,
    ) -> Result<u64, JobError> {
        let copy = async {
            if is_hls_input(source_url) {
                self.copy_hls_tree(source_url, transfer_url).await
            } else {
                self.copy_file(source_url, transfer_url, decryption).await
            }
        };
        match tokio::time::timeout(budget, copy).await {
            Ok(result) => result,
            Err(_) => Err(JobError::CopyTimeout {
                limit_secs: budget.as_secs(),
            }),
        }
    }

    async fn copy_file(
        &self,
        source_url: &str,
        transfer_url: &str,
        decryption: Option<&SourceDecryption>,
    ) -> Result<u64, JobError> {
        let bytes = self.read_with_retry(source_url).await?;
        let bytes = match decryption {
            Some(decryption) => Bytes::from(decrypt_aes_cbc(&bytes, decryption)?),
            None => bytes,
        };
        let copied = bytes.len() as u64;
        self.write_with_retry(transfer_url, bytes).await?;
        info!(source_url, transfer_url, bytes = copied, "copied source file");
        Ok(copied)
    }

    /// Copy an HLS tree: every live segment lands next to the manifest under
    /// its original relative path, then the manifest itself.
    async fn copy_hls_tree(&self, source_url: &str, transfer_url: &str) -> Result<u64, JobError> {
        let manifest_bytes = self.read_with_retry(source_url).await?;
        let playlist = parse_media_playlist(&manifest_bytes)?;
        let base = Url::parse(source_url).map_err(|e| JobError::Copy {
            reason: format!("invalid source manifest URL: {e}"),
        })?;
        let segments = absolute_segments(&playlist, &base)?;
        let transfer_base = parent_url(transfer_url);

        let mut copied = 0u64;
        for (segment, playlist_entry) in segments.iter().zip(&playlist.segments) {
            let bytes = self.read_with_retry(segment.url.as_str()).await?;
            copied += bytes.len() as u64;
            // Relative URIs keep their path under the transfer base, so the
            // copied manifest resolves unchanged.
            let target = join_url(&transfer_base, &[&playlist_entry.uri]);
            self.write_with_retry(&target, bytes).await?;
            debug!(segment = %segment.url, %target, "copied segment");
        }

        copied += manifest_bytes.len() as u64;
        self.write_with_retry(transfer_url, manifest_bytes).await?;
        info!(
            source_url,
            transfer_url,
            segments = segments.len(),
            bytes = copied,
            "copied HLS source tree"
        );
        Ok(copied)
    }

    /// Prefer the plain HTTPS form when the bucket answers an anonymous
    /// HEAD; otherwise fall back to URL signing.
    pub async fn signed_source_url(&self, url: &str) -> Result<String, JobError> {
        let parsed = parse_os_url(url)?;
        let public = parsed.to_https_url();
        if self.store.is_publicly_readable(&public).await {
            return Ok(public);
        }
        match &self.signer {
            Some(signer) => Ok(signer.sign(url)?),
            None => Ok(url.to_string()),
        }
    }

    async fn read_with_retry(&self, url: &str) -> Result<Bytes, JobError> {
        retry_with_backoff(&self.policy, "source read", |_| async {
            match self.store.read(url).await {
                Ok(bytes) => RetryAction::Success(bytes),
                Err(e) => RetryAction::Retry(JobError::Copy {
                    reason: e.to_string(),
                }),
            }
        })
        .await
    }

    async fn write_with_retry(&self, url: &str, bytes: Bytes) -> Result<(), JobError> {
        retry_with_backoff(&self.policy, "transfer write", |_| async {
            match self.store.write(url, bytes.clone()).await {
                Ok(()) => RetryAction::Success(()),
                Err(e) => RetryAction::Retry(JobError::Copy {
                    reason: e.to_string(),
                }),
            }
        })
        .await
    }
}
