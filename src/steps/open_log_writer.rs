//! Opens the per-job log writer.

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::{Step, StepAction, StepState};

/// Opens the log writer bound to the job and configures its cap and flush
/// cadence. A job cannot proceed to later steps without a working writer,
/// so an open failure requeues the job for a healthier worker.
pub struct OpenLogWriter {
    /// Flush cadence applied to the writer.
    pub timeout: Duration,
    /// Byte cap applied to the writer.
    pub max_log_length: usize,
}

#[async_trait]
impl Step for OpenLogWriter {
    fn name(&self) -> &'static str {
        "open-log-writer"
    }

    async fn run(&self, state: &mut StepState) -> StepAction {
        match state.job.log_writer().await {
            Ok(writer) => {
                writer.set_timeout(self.timeout).await;
                writer.set_max_log_length(self.max_log_length).await;
                state.log_writer = Some(writer);
                StepAction::Continue
            }
            Err(err) => {
                warn!(error = %err, "couldn't open a log writer");
                state.requeue_job().await;
                StepAction::Halt
            }
        }
    }

    async fn cleanup(&self, state: &mut StepState) {
        if let Some(writer) = &state.log_writer {
            if let Err(err) = writer.close().await {
                warn!(error = %err, "couldn't close log writer");
            }
        }
    }
}
