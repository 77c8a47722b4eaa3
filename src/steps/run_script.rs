//! Runs the build script and settles the job from its outcome.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::cancel::CancelReason;
use crate::job::FinishState;
use crate::provider::InstanceError;

use super::{Step, StepAction, StepState};

/// Marks the job started, runs the uploaded script while a watchdog
/// enforces the log-silence window, and translates the run outcome into a
/// terminal job state. The watchdog terminates before this step returns.
pub struct RunScript {
    /// Default silence window; the job payload may override it.
    pub log_silence: Duration,
}

#[async_trait]
impl Step for RunScript {
    fn name(&self) -> &'static str {
        "run-script"
    }

    async fn run(&self, state: &mut StepState) -> StepAction {
        let (Some(instance), Some(writer)) = (&state.instance, &state.log_writer) else {
            error!("run step reached without an instance or log writer");
            state.requeue_job().await;
            return StepAction::Halt;
        };

        if let Err(err) = state.job.started().await {
            warn!(error = %err, "couldn't report job start");
        }

        let silence = state
            .job
            .payload()
            .timeouts
            .log_silence
            .map_or(self.log_silence, Duration::from_secs);
        let watchdog = spawn_silence_watchdog(writer.activity(), state.cancel.clone(), silence);

        let result = instance.run_script(&state.cancel, writer).await;
        watchdog.abort();

        match result {
            Ok(run) if run.completed && run.exit_code == 0 => {
                state.finish_job(FinishState::Passed).await;
            }
            Ok(run) if run.completed => {
                info!(exit_code = run.exit_code, "script exited non-zero");
                state.finish_job(FinishState::Failed).await;
            }
            Ok(_) => {
                state.finish_job(FinishState::Errored).await;
            }
            Err(InstanceError::Cancelled { reason }) => match reason {
                CancelReason::Shutdown => {
                    state.requeue_job().await;
                }
                CancelReason::HardTimeout => {
                    state
                        .log_line("\n\nThe job exceeded its maximum time limit.\n")
                        .await;
                    state.finish_job(FinishState::Failed).await;
                }
                CancelReason::LogSilence => {
                    state
                        .log_line(
                            "\n\nNo output has been received for too long; \
                             the job has been terminated.\n",
                        )
                        .await;
                    state.finish_job(FinishState::Failed).await;
                }
                CancelReason::ControlPlane => {
                    state.finish_job(FinishState::Failed).await;
                }
            },
            Err(err) => {
                error!(error = %err, "script run failed");
                state
                    .log_line("\n\nWe couldn't run your build; the job has been errored.\n")
                    .await;
                state.finish_job(FinishState::Errored).await;
            }
        }
        StepAction::Continue
    }
}

/// Cancels the job when no log activity is observed within `silence`.
fn spawn_silence_watchdog(
    mut activity: tokio::sync::watch::Receiver<()>,
    cancel: crate::cancel::JobCancellation,
    silence: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match tokio::time::timeout(silence, activity.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => break,
                Err(_) => {
                    cancel.cancel(CancelReason::LogSilence);
                    break;
                }
            }
        }
    })
}
