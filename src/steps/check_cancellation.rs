//! Drops jobs that were cancelled before a worker picked them up.

use async_trait::async_trait;

use crate::job::FinishState;

use super::{Step, StepAction, StepState};

/// Halts early when the control plane already cancelled the job, settling
/// the delivery so it is not redelivered.
pub struct CheckCancellation;

#[async_trait]
impl Step for CheckCancellation {
    fn name(&self) -> &'static str {
        "check-cancellation"
    }

    async fn run(&self, state: &mut StepState) -> StepAction {
        if state.cancel.is_cancelled() {
            state.finish_job(FinishState::Failed).await;
            return StepAction::Halt;
        }
        StepAction::Continue
    }
}
