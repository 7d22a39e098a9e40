//! Remote texture recompression over HTTP.
//!
//! Each texture ships as one multipart POST to a worker endpoint. The loop
//! is sequential (one request in flight per document); responses are
//! identity-checked against the requested texture index before splicing.

use std::time::Duration;

use rand::Rng as _;
use serde::{Deserialize, Serialize};

use crate::document::TexturePayload;
use crate::foundation::error::{MeshpressError, MeshpressResult};
use crate::optimize::textures::TextureTarget;

/// Response header carrying the echoed texture index.
pub const TEXTURE_INDEX_HEADER: &str = "x-texture-index";

/// HTTP statuses retried as transient.
pub(crate) const TRANSIENT_STATUSES: [u16; 7] = [408, 425, 429, 500, 502, 503, 504];

/// Configuration for the offload endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OffloadConfig {
    /// Worker URL accepting multipart texture uploads.
    pub endpoint: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Retries after the initial attempt, for transient failures only.
    pub max_retries: u32,
    /// Payloads above this size are rejected locally, before any network
    /// call.
    pub max_upload_bytes: usize,
}

impl OffloadConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: Duration::from_secs(20),
            max_retries: 2,
            max_upload_bytes: 25 * 1024 * 1024,
        }
    }
}

/// Recompression parameters sent alongside each texture.
#[derive(Clone, Copy, Debug)]
pub struct OffloadRequest {
    pub format: TextureTarget,
    pub quality: u8,
    pub resize: Option<[u32; 2]>,
}

/// One successfully recompressed texture.
#[derive(Clone, Debug)]
pub struct RecompressedTexture {
    pub index: usize,
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// A texture that failed after exhausting its retry budget.
#[derive(Clone, Debug)]
pub struct TextureFailure {
    pub index: usize,
    pub reason: String,
}

/// Outcome of a batch: at least one success, or the call would have failed.
#[derive(Debug, Default)]
pub struct OffloadBatch {
    pub results: Vec<RecompressedTexture>,
    pub failures: Vec<TextureFailure>,
}

pub struct TextureOffloadClient {
    config: OffloadConfig,
    client: reqwest::blocking::Client,
}

enum AttemptError {
    /// Worth another attempt (timeout, connect failure, transient status).
    Transient(String),
    /// Hard failure; retrying cannot help.
    Fatal(MeshpressError),
}

impl TextureOffloadClient {
    pub fn new(config: OffloadConfig) -> MeshpressResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| MeshpressError::network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    /// Recompress one texture, retrying transient failures.
    pub fn recompress(
        &self,
        payload: &TexturePayload,
        request: &OffloadRequest,
    ) -> MeshpressResult<RecompressedTexture> {
        if payload.image.len() > self.config.max_upload_bytes {
            return Err(MeshpressError::validation(format!(
                "texture {} is {} bytes, above the {} byte upload limit",
                payload.index,
                payload.image.len(),
                self.config.max_upload_bytes
            )));
        }

        let mut last_transient = String::new();
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                backoff(attempt);
            }
            match self.attempt(payload, request) {
                Ok(result) => return Ok(result),
                Err(AttemptError::Fatal(error)) => return Err(error),
                Err(AttemptError::Transient(reason)) => {
                    tracing::debug!(
                        texture = payload.index,
                        attempt,
                        %reason,
                        "transient offload failure"
                    );
                    last_transient = reason;
                }
            }
        }
        Err(MeshpressError::network(format!(
            "texture {}: retries exhausted: {last_transient}",
            payload.index
        )))
    }

    /// Recompress every payload sequentially, aggregating outcomes.
    ///
    /// Returns `Ok` when at least one texture succeeded; the failures list
    /// records the rest. Fails with `AggregateFailure` only when every
    /// texture failed.
    pub fn recompress_all(
        &self,
        payloads: &[TexturePayload],
        request: &OffloadRequest,
    ) -> MeshpressResult<OffloadBatch> {
        let mut batch = OffloadBatch::default();
        for payload in payloads {
            match self.recompress(payload, request) {
                Ok(result) => batch.results.push(result),
                Err(error) => batch.failures.push(TextureFailure {
                    index: payload.index,
                    reason: error.to_string(),
                }),
            }
        }

        if batch.results.is_empty() && !payloads.is_empty() {
            let reasons: Vec<String> = batch
                .failures
                .iter()
                .map(|f| format!("texture {}: {}", f.index, f.reason))
                .collect();
            return Err(MeshpressError::AggregateFailure(reasons.join("; ")));
        }
        if !batch.failures.is_empty() {
            let indices: Vec<String> =
                batch.failures.iter().map(|f| f.index.to_string()).collect();
            tracing::warn!(
                failed = %indices.join(", "),
                "some textures failed remote recompression and were skipped"
            );
        }
        Ok(batch)
    }

    fn attempt(
        &self,
        payload: &TexturePayload,
        request: &OffloadRequest,
    ) -> Result<RecompressedTexture, AttemptError> {
        let mut form = reqwest::blocking::multipart::Form::new()
            .text("index", payload.index.to_string())
            .text("format", request.format.as_str().to_owned())
            .text("quality", request.quality.to_string());
        if let Some([width, height]) = request.resize {
            form = form.text("resize", format!("{width}x{height}"));
        }
        let part = reqwest::blocking::multipart::Part::bytes(payload.image.clone())
            .file_name(payload.name.clone())
            .mime_str(&payload.mime_type)
            .map_err(|e| {
                AttemptError::Fatal(MeshpressError::network(format!(
                    "texture {}: invalid MIME type '{}': {e}",
                    payload.index, payload.mime_type
                )))
            })?;
        form = form.part("image", part);

        let response = self
            .client
            .post(&self.config.endpoint)
            .header(TEXTURE_INDEX_HEADER, payload.index.to_string())
            .multipart(form)
            .send()
            .map_err(|e| AttemptError::Transient(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let reason = format!("HTTP {}", status.as_u16());
            return if TRANSIENT_STATUSES.contains(&status.as_u16()) {
                Err(AttemptError::Transient(reason))
            } else {
                Err(AttemptError::Fatal(MeshpressError::network(format!(
                    "texture {}: {reason}",
                    payload.index
                ))))
            };
        }

        // Identity check: the worker must echo the texture index it
        // processed. A mismatch is never retried.
        let echoed = response
            .headers()
            .get(TEXTURE_INDEX_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<usize>().ok());
        match echoed {
            Some(index) if index == payload.index => {}
            Some(index) => {
                return Err(AttemptError::Fatal(MeshpressError::identity(format!(
                    "requested texture {} but response is for texture {index}",
                    payload.index
                ))));
            }
            None => {
                return Err(AttemptError::Fatal(MeshpressError::identity(format!(
                    "texture {}: response is missing the {TEXTURE_INDEX_HEADER} header",
                    payload.index
                ))));
            }
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        // A 200 with a JSON body is a worker-side error report, not image
        // data.
        if content_type.starts_with("application/json") {
            return Err(AttemptError::Fatal(MeshpressError::network(format!(
                "texture {}: worker returned JSON instead of image data",
                payload.index
            ))));
        }

        let data = response
            .bytes()
            .map_err(|e| AttemptError::Transient(format!("failed to read body: {e}")))?;
        if data.is_empty() {
            return Err(AttemptError::Fatal(MeshpressError::network(format!(
                "texture {}: worker returned an empty payload",
                payload.index
            ))));
        }

        let mime_type = if content_type.starts_with("image/") {
            content_type
        } else {
            request.format.mime_type().to_owned()
        };

        Ok(RecompressedTexture {
            index: payload.index,
            mime_type,
            data: data.to_vec(),
        })
    }
}

/// `200ms × attempt` plus up to 120ms of jitter.
fn backoff(attempt: u32) {
    let jitter = rand::thread_rng().gen_range(0..120);
    std::thread::sleep(Duration::from_millis(200 * attempt as u64 + jitter));
}
