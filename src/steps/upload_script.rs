//! Uploads the build script to the instance.

use async_trait::async_trait;
use tracing::{error, warn};

use crate::cancel::CancelReason;
use crate::job::FinishState;
use crate::provider::InstanceError;

use super::{Step, StepAction, StepState};

/// Pushes the build script onto the booted VM. A stale VM (one that
/// already carries a build script) requeues the job so it lands on a
/// fresh instance; any other failure errors the job.
pub struct UploadScript;

#[async_trait]
impl Step for UploadScript {
    fn name(&self) -> &'static str {
        "upload-script"
    }

    async fn run(&self, state: &mut StepState) -> StepAction {
        let (Some(instance), Some(script)) = (&state.instance, &state.script) else {
            error!("upload step reached without an instance or script");
            state.requeue_job().await;
            return StepAction::Halt;
        };
        match instance.upload_script(&state.cancel, script).await {
            Ok(()) => StepAction::Continue,
            Err(InstanceError::StaleVm) => {
                warn!(instance_id = %instance.id(), "stale vm detected, requeueing");
                state.requeue_job().await;
                StepAction::Halt
            }
            Err(InstanceError::Cancelled { reason }) => {
                warn!(%reason, "upload cancelled");
                if reason == CancelReason::Shutdown {
                    state.requeue_job().await;
                } else {
                    state.finish_job(FinishState::Failed).await;
                }
                StepAction::Halt
            }
            Err(err) => {
                error!(error = %err, "couldn't upload build script");
                state.finish_job(FinishState::Errored).await;
                StepAction::Halt
            }
        }
    }
}
