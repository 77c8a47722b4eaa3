//! Fetches the build script for the job.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::error;

use crate::job::FinishState;
use crate::script::ScriptGenerator;

use super::{Step, StepAction, StepState};

/// Asks the generator service for the job's build script. Generation
/// failures error the job without requeueing: the same payload would fail
/// again on any worker.
pub struct GenerateScript {
    /// Script source queried for each job.
    pub generator: Arc<dyn ScriptGenerator>,
}

#[async_trait]
impl Step for GenerateScript {
    fn name(&self) -> &'static str {
        "generate-script"
    }

    async fn run(&self, state: &mut StepState) -> StepAction {
        match self.generator.generate(state.job.payload()).await {
            Ok(script) => {
                state.script = Some(script);
                StepAction::Continue
            }
            Err(err) => {
                error!(error = %err, "couldn't generate build script");
                state
                    .log_line("\nWe couldn't generate a build script for your job.\n")
                    .await;
                state.finish_job(FinishState::Errored).await;
                StepAction::Halt
            }
        }
    }
}
