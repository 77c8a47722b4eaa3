//! Provider abstraction for provisioning disposable build VMs.
//!
//! A [`Provider`] boots instances for jobs; an [`Instance`] is the handle
//! the pipeline uses to upload the build script, run it, and tear the VM
//! down. Implementations register themselves in [`registry`] under a
//! stable name.

use async_trait::async_trait;
use thiserror::Error;

use crate::cancel::{CancelReason, JobCancellation};
use crate::logwriter::LogWriter;

pub mod boxcar;
mod config;
pub mod fake;
pub mod registry;

pub use boxcar::BoxcarProvider;
pub use config::ProviderConfig;
pub use fake::FakeProvider;

/// Image selector derived from the job's configuration blob.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StartAttributes {
    /// Build language (for example `clojure`).
    pub language: String,
    /// Operating system family (for example `linux` or `osx`).
    pub os: String,
    /// Distribution name (for example `trusty`).
    pub dist: String,
    /// Image group (for example `stable`).
    pub group: String,
    /// Explicit macOS image name, when the job pins one.
    pub osx_image: String,
}

impl StartAttributes {
    /// Extracts the selector fields from a job configuration blob. Missing
    /// or non-string values become empty strings, which never match an
    /// alias.
    #[must_use]
    pub fn from_config(config: &serde_json::Map<String, serde_json::Value>) -> Self {
        let field = |key: &str| {
            config
                .get(key)
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_owned()
        };
        Self {
            language: field("language"),
            os: field("os"),
            dist: field("dist"),
            group: field("group"),
            osx_image: field("osx_image"),
        }
    }
}

/// Outcome of running the build script on an instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RunResult {
    /// `true` when the script ran to completion, regardless of its exit
    /// status.
    pub completed: bool,
    /// Remote exit status; zero on a clean exit.
    pub exit_code: i32,
}

/// Errors raised while constructing providers or starting instances.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Raised when a required configuration key is missing or invalid.
    #[error("provider configuration error: {0}")]
    Config(String),
    /// Raised when no alias in the precedence list matches the requested
    /// attributes.
    #[error(
        "no image alias for language {language:?}, os {os:?}, dist {dist:?}, \
         group {group:?}, osx_image {osx_image:?}"
    )]
    NoImageAlias {
        /// Requested language.
        language: String,
        /// Requested operating system.
        os: String,
        /// Requested distribution.
        dist: String,
        /// Requested group.
        group: String,
        /// Requested macOS image.
        osx_image: String,
    },
    /// Raised when the control plane answers outside the 2xx range.
    #[error("control plane returned {status}: {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },
    /// Raised when the control plane cannot be reached.
    #[error("control plane request failed: {message}")]
    Http {
        /// Transport error description.
        message: String,
    },
    /// Raised when a control plane response cannot be interpreted.
    #[error("invalid instance payload: {message}")]
    Payload {
        /// Decoder error description.
        message: String,
    },
    /// Raised when instance provisioning is cancelled.
    #[error("instance start cancelled: {reason}")]
    Cancelled {
        /// Cause of the cancellation.
        reason: CancelReason,
    },
    /// Raised when no provider is registered under the requested name.
    #[error("unknown provider: {0}")]
    Unknown(String),
}

/// Errors raised by instance operations.
#[derive(Debug, Error)]
pub enum InstanceError {
    /// Raised when a supposedly fresh VM already carries a build script.
    #[error("stale vm: build script already present")]
    StaleVm,
    /// Raised when an SSH or SFTP operation fails.
    #[error("ssh error: {message}")]
    Ssh {
        /// Underlying error description.
        message: String,
    },
    /// Raised when the script run is cancelled.
    #[error("script run cancelled: {reason}")]
    Cancelled {
        /// Cause of the cancellation.
        reason: CancelReason,
    },
    /// Raised when the control plane rejects an instance operation.
    #[error("control plane returned {status}: {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },
    /// Raised when the control plane cannot be reached.
    #[error("control plane request failed: {message}")]
    Http {
        /// Transport error description.
        message: String,
    },
}

/// Pluggable backend that boots and manages build VMs.
#[async_trait]
pub trait Provider: Send + Sync + std::fmt::Debug {
    /// One-time bootstrap, called before the first start. May perform
    /// remote authentication.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] when the backend cannot be prepared.
    async fn setup(&self) -> Result<(), ProviderError>;

    /// Boots an instance matching `attributes`.
    ///
    /// Honours `cancel`: in-flight work is aborted and any partially
    /// created instance is stopped best-effort before the cancellation
    /// error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] when no image matches, the control plane
    /// rejects the request, or provisioning is cancelled.
    async fn start(
        &self,
        cancel: &JobCancellation,
        attributes: &StartAttributes,
    ) -> Result<Box<dyn Instance>, ProviderError>;
}

/// Handle to one running VM, owned by the processor for one job.
///
/// Every started instance is stopped before its job is settled, on every
/// exit path; the pipeline's reverse-order cleanup enforces this.
#[async_trait]
pub trait Instance: Send + Sync + std::fmt::Debug {
    /// Uploads the build script and its wrapper to the VM.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::StaleVm`] when a build script is already
    /// present, or [`InstanceError::Ssh`] on transport failures.
    async fn upload_script(
        &self,
        cancel: &JobCancellation,
        script: &[u8],
    ) -> Result<(), InstanceError>;

    /// Runs the uploaded script, streaming combined output to `output`.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::Cancelled`] when the run is cancelled and
    /// [`InstanceError::Ssh`] when the session fails before the script
    /// finishes.
    async fn run_script(
        &self,
        cancel: &JobCancellation,
        output: &LogWriter,
    ) -> Result<RunResult, InstanceError>;

    /// Releases the VM. Best effort.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::Http`] when the release request cannot be
    /// sent.
    async fn stop(&self) -> Result<(), InstanceError>;

    /// Opaque identifier used in logs.
    fn id(&self) -> String;
}
