//! Boots the VM for the job.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

use crate::cancel::CancelReason;
use crate::job::FinishState;
use crate::provider::{Provider, ProviderError, StartAttributes};

use super::{Step, StepAction, StepState};

/// Starts an instance matching the job's attributes. Start failures are
/// infrastructure trouble, so the job is requeued for another attempt.
/// Cleanup stops the instance unconditionally.
pub struct StartInstance {
    /// Backend used to boot instances.
    pub provider: Arc<dyn Provider>,
}

#[async_trait]
impl Step for StartInstance {
    fn name(&self) -> &'static str {
        "start-instance"
    }

    async fn run(&self, state: &mut StepState) -> StepAction {
        let attributes = StartAttributes::from_config(&state.job.payload().config);
        match self.provider.start(&state.cancel, &attributes).await {
            Ok(instance) => {
                if let Some(hostname) = state.hostname.clone().filter(|name| !name.is_empty()) {
                    state
                        .log_line(&format!("Using worker: {hostname} ({})\n\n", instance.id()))
                        .await;
                }
                state.instance = Some(instance);
                StepAction::Continue
            }
            Err(ProviderError::Cancelled { reason }) if reason != CancelReason::Shutdown => {
                warn!(%reason, "boot cancelled");
                state.finish_job(FinishState::Failed).await;
                StepAction::Halt
            }
            Err(err) => {
                error!(error = %err, "couldn't start instance");
                state.requeue_job().await;
                StepAction::Halt
            }
        }
    }

    async fn cleanup(&self, state: &mut StepState) {
        if let Some(instance) = &state.instance {
            if let Err(err) = instance.stop().await {
                warn!(instance_id = %instance.id(), error = %err, "couldn't stop instance");
            }
        }
    }
}
