//! Client for the build-script generator service.
//!
//! The service turns a job payload into the shell script that runs inside
//! the VM. A non-2xx answer is fatal for the job: the job is errored, not
//! requeued, since retrying the same payload would fail the same way.

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

use crate::job::JobPayload;

/// Errors raised while fetching a build script.
#[derive(Debug, Error)]
pub enum ScriptError {
    /// Raised when the endpoint is not a valid URL.
    #[error("invalid script service endpoint: {0}")]
    Endpoint(String),
    /// Raised when the service answers outside the 2xx range.
    #[error("script service returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },
    /// Raised when the service cannot be reached.
    #[error("script service request failed: {message}")]
    Http {
        /// Transport error description.
        message: String,
    },
}

/// Source of build scripts for jobs.
#[async_trait]
pub trait ScriptGenerator: Send + Sync {
    /// Produces the build script for `payload`.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptError::Status`] on non-2xx answers and
    /// [`ScriptError::Http`] on transport failures.
    async fn generate(&self, payload: &JobPayload) -> Result<Vec<u8>, ScriptError>;
}

/// Generator backed by the build-script HTTP service.
#[derive(Debug)]
pub struct HttpScriptGenerator {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpScriptGenerator {
    /// Creates a generator posting to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptError::Endpoint`] when `endpoint` is not an
    /// absolute URL.
    pub fn new(endpoint: &str) -> Result<Self, ScriptError> {
        let endpoint = Url::parse(endpoint).map_err(|err| ScriptError::Endpoint(err.to_string()))?;
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint,
        })
    }
}

#[async_trait]
impl ScriptGenerator for HttpScriptGenerator {
    async fn generate(&self, payload: &JobPayload) -> Result<Vec<u8>, ScriptError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(payload)
            .send()
            .await
            .map_err(|err| ScriptError::Http {
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ScriptError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let bytes = response.bytes().await.map_err(|err| ScriptError::Http {
            message: err.to_string(),
        })?;
        Ok(bytes.to_vec())
    }
}
