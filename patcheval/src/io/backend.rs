//! Inference backend abstraction.
//!
//! The [`Backend`] trait decouples the stage executor from the model server
//! (currently Ollama's `/api/generate`). Tests use scripted backends that
//! return predetermined replies without network access.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::cancel::CancelToken;
use crate::io::config::BackendConfig;

/// How often a blocked generation checks for cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(200);

/// A single non-streaming generation request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    pub options: Map<String, Value>,
    pub stream: bool,
}

/// Generated text plus the timing metadata Ollama reports.
///
/// Durations are in nanoseconds.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GenerateResponse {
    pub response: String,
    #[serde(default)]
    pub prompt_eval_count: Option<u64>,
    #[serde(default)]
    pub prompt_eval_duration: Option<u64>,
    #[serde(default)]
    pub eval_count: Option<u64>,
    #[serde(default)]
    pub eval_duration: Option<u64>,
}

impl GenerateResponse {
    pub fn text(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            ..Self::default()
        }
    }
}

/// Backend failure, split by how the executor must react.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Connection refused/reset, timeout, busy server, malformed body. Retried
    /// after a backoff without consuming the stage's retry budget.
    #[error("transient backend fault: {0}")]
    Transient(String),
    /// The server refused the request itself (unknown model, bad options).
    #[error("backend rejected request (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("encode generation request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("generation cancelled")]
    Cancelled,
}

/// Abstraction over generation backends.
pub trait Backend {
    /// Run one synchronous generation. Implementations must return
    /// `BackendError::Cancelled` promptly once `cancel` fires.
    fn generate(
        &self,
        request: &GenerateRequest,
        cancel: &CancelToken,
    ) -> Result<GenerateResponse, BackendError>;
}

/// Backend speaking Ollama's `/api/generate` JSON protocol over HTTP.
#[derive(Clone)]
pub struct OllamaBackend {
    agent: ureq::Agent,
    url: String,
}

impl OllamaBackend {
    pub fn new(config: &BackendConfig) -> Self {
        let agent = ureq::Agent::config_builder()
            .timeout_connect(Some(config.connect_timeout()))
            .timeout_recv_response(Some(config.read_timeout()))
            .timeout_recv_body(Some(config.read_timeout()))
            .http_status_as_error(false)
            .build()
            .new_agent();
        Self {
            agent,
            url: config.url.clone(),
        }
    }
}

impl Backend for OllamaBackend {
    #[instrument(skip_all, fields(model = %request.model, prompt_bytes = request.prompt.len()))]
    fn generate(
        &self,
        request: &GenerateRequest,
        cancel: &CancelToken,
    ) -> Result<GenerateResponse, BackendError> {
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }
        let body = serde_json::to_string(request)?;

        // The blocking call runs on a worker so an interrupt does not have to
        // wait out the read timeout. An abandoned worker ends with the process.
        let (tx, rx) = mpsc::channel();
        let agent = self.agent.clone();
        let url = self.url.clone();
        thread::spawn(move || {
            let _ = tx.send(post_generate(&agent, &url, body));
        });

        loop {
            match rx.recv_timeout(CANCEL_POLL) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Timeout) => {
                    if cancel.is_cancelled() {
                        warn!("abandoning in-flight generation");
                        return Err(BackendError::Cancelled);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(BackendError::Transient(
                        "generation worker exited without a result".to_string(),
                    ));
                }
            }
        }
    }
}

fn post_generate(
    agent: &ureq::Agent,
    url: &str,
    body: String,
) -> Result<GenerateResponse, BackendError> {
    let mut response = agent
        .post(url)
        .header("Content-Type", "application/json")
        .send(body)
        .map_err(|err| BackendError::Transient(err.to_string()))?;
    let status = response.status().as_u16();
    let text = response
        .body_mut()
        .read_to_string()
        .map_err(|err| BackendError::Transient(format!("read response body: {err}")))?;
    debug!(status, bytes = text.len(), "generation response received");
    classify_http(status, &text)
}

/// Map an HTTP status and body onto the backend error taxonomy.
pub fn classify_http(status: u16, body: &str) -> Result<GenerateResponse, BackendError> {
    match status {
        200..=299 => serde_json::from_str(body)
            .map_err(|err| BackendError::Transient(format!("malformed response body: {err}"))),
        408 | 429 => Err(BackendError::Transient(format!("HTTP {status}: {}", body.trim()))),
        400..=499 => Err(BackendError::Rejected {
            status,
            body: body.trim().to_string(),
        }),
        _ => Err(BackendError::Transient(format!("HTTP {status}: {}", body.trim()))),
    }
}
