//! Ordered per-job steps with guaranteed reverse-order cleanup.
//!
//! Each step advances one job: decode, open the log writer, fetch the
//! build script, boot an instance, upload, run. A step either continues
//! the pipeline or halts it; either way, every step whose `run` was
//! entered has its `cleanup` invoked in reverse order, so whatever was
//! opened gets released on every exit path.

mod check_cancellation;
mod generate_script;
mod open_log_writer;
mod run_script;
mod start_instance;
mod upload_script;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::cancel::JobCancellation;
use crate::job::BuildJob;
use crate::logwriter::LogWriter;
use crate::provider::Instance;

pub use check_cancellation::CheckCancellation;
pub use generate_script::GenerateScript;
pub use open_log_writer::OpenLogWriter;
pub use run_script::RunScript;
pub use start_instance::StartInstance;
pub use upload_script::UploadScript;

/// Whether the pipeline proceeds to the next step.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StepAction {
    /// Run the next step.
    Continue,
    /// Stop; the halting step has already settled the job.
    Halt,
}

/// Scratch state threaded through the steps of one job.
///
/// Slots are filled as steps succeed; cleanup reaches whatever was
/// created through the same slots.
pub struct StepState {
    /// Cancellation handle for this job.
    pub cancel: JobCancellation,
    /// The job being processed.
    pub job: Arc<dyn BuildJob>,
    /// Hostname advertised in the log banner, when known.
    pub hostname: Option<String>,
    /// Build script fetched from the generator service.
    pub script: Option<Vec<u8>>,
    /// Instance booted for this job.
    pub instance: Option<Box<dyn Instance>>,
    /// Log writer bound to this job.
    pub log_writer: Option<LogWriter>,
}

impl StepState {
    /// Creates the initial state for one job.
    #[must_use]
    pub fn new(cancel: JobCancellation, job: Arc<dyn BuildJob>, hostname: Option<String>) -> Self {
        Self {
            cancel,
            job,
            hostname,
            script: None,
            instance: None,
            log_writer: None,
        }
    }

    /// Writes one diagnostic line to the job log, if a writer is open.
    /// Failures only get logged; diagnostics never fail a job.
    pub(crate) async fn log_line(&self, line: &str) {
        if let Some(writer) = &self.log_writer {
            if let Err(err) = writer.write(line.as_bytes()).await {
                warn!(error = %err, "couldn't write diagnostic to job log");
            }
        }
    }

    /// Requeues the job, logging a failure to do so.
    pub(crate) async fn requeue_job(&self) {
        if let Err(err) = self.job.requeue().await {
            warn!(error = %err, "couldn't requeue job");
        }
    }

    /// Finishes the job, logging a failure to do so.
    pub(crate) async fn finish_job(&self, outcome: crate::job::FinishState) {
        if let Err(err) = self.job.finish(outcome).await {
            warn!(error = %err, "couldn't finish job");
        }
    }
}

/// One stage of the per-job pipeline.
#[async_trait]
pub trait Step: Send + Sync {
    /// Name used in trace output.
    fn name(&self) -> &'static str;

    /// Advances the job. A halting step settles the job itself.
    async fn run(&self, state: &mut StepState) -> StepAction;

    /// Releases whatever `run` created. Infallible: errors are logged by
    /// the implementation, never propagated.
    async fn cleanup(&self, state: &mut StepState) {
        let _ = state;
    }
}

/// Runs steps in order, then cleans up entered steps in reverse.
pub struct Pipeline {
    steps: Vec<Box<dyn Step>>,
}

impl Pipeline {
    /// Builds a pipeline from an ordered step list.
    #[must_use]
    pub fn new(steps: Vec<Box<dyn Step>>) -> Self {
        Self { steps }
    }

    /// Executes the pipeline against `state`.
    pub async fn run(&self, state: &mut StepState) {
        let mut entered = 0;
        for step in &self.steps {
            entered += 1;
            debug!(step = step.name(), "running step");
            match step.run(state).await {
                StepAction::Continue => {}
                StepAction::Halt => {
                    debug!(step = step.name(), "pipeline halted");
                    break;
                }
            }
        }
        for step in self.steps[..entered].iter().rev() {
            debug!(step = step.name(), "cleaning up step");
            step.cleanup(state).await;
        }
    }
}
