//! In-process provider used by integration tests and local smoke runs.
//!
//! The fake instance skips SSH entirely: `run_script` writes a canned
//! byte string to the log writer and reports a clean exit.

use std::sync::Arc;

use async_trait::async_trait;

use crate::cancel::JobCancellation;
use crate::logwriter::LogWriter;
use crate::provider::registry::ProviderRegistration;
use crate::provider::{
    Instance, InstanceError, Provider, ProviderError, RunResult, StartAttributes,
};

const HELP: &[(&str, &str)] = &[(
    "RUN_OUTPUT",
    "bytes the fake instance writes to the build log (default \"\")",
)];

/// Returns the registry entry for this backend.
#[must_use]
pub fn registration() -> ProviderRegistration {
    ProviderRegistration {
        name: "fake",
        label: "Fake",
        help: HELP,
        factory: |config| {
            Ok(Arc::new(FakeProvider::new(
                config.get("RUN_OUTPUT").as_bytes().to_vec(),
            )) as Arc<dyn Provider>)
        },
    }
}

/// Provider whose instances emit a fixed log and always pass.
#[derive(Debug)]
pub struct FakeProvider {
    output: Vec<u8>,
}

impl FakeProvider {
    /// Creates a provider whose instances write `output` when run.
    #[must_use]
    pub fn new(output: Vec<u8>) -> Self {
        Self { output }
    }
}

#[async_trait]
impl Provider for FakeProvider {
    async fn setup(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn start(
        &self,
        _cancel: &JobCancellation,
        _attributes: &StartAttributes,
    ) -> Result<Box<dyn Instance>, ProviderError> {
        Ok(Box::new(FakeInstance {
            output: self.output.clone(),
        }))
    }
}

#[derive(Debug)]
struct FakeInstance {
    output: Vec<u8>,
}

#[async_trait]
impl Instance for FakeInstance {
    async fn upload_script(
        &self,
        _cancel: &JobCancellation,
        _script: &[u8],
    ) -> Result<(), InstanceError> {
        Ok(())
    }

    async fn run_script(
        &self,
        _cancel: &JobCancellation,
        output: &LogWriter,
    ) -> Result<RunResult, InstanceError> {
        output
            .write(&self.output)
            .await
            .map_err(|err| InstanceError::Ssh {
                message: err.to_string(),
            })?;
        Ok(RunResult {
            completed: true,
            exit_code: 0,
        })
    }

    async fn stop(&self) -> Result<(), InstanceError> {
        Ok(())
    }

    fn id(&self) -> String {
        String::from("fake:fake-image")
    }
}
