//! Core library for the Kiln CI build worker.
//!
//! The crate exposes the pieces of the per-job execution pipeline: a
//! provider abstraction for booting ephemeral build VMs (with a REST+SSH
//! reference backend), a buffered log writer shipping sequence-numbered
//! output parts, the job and step-pipeline machinery, and the processor
//! pool that fans N workers out over one build queue.

pub mod cancel;
pub mod config;
pub mod job;
pub mod logwriter;
pub mod pool;
pub mod processor;
pub mod provider;
pub mod script;
pub mod steps;

pub use cancel::{CancelReason, Canceller, JobCancellation};
pub use config::{ConfigError, WorkerConfig};
pub use job::{AmqpJob, BuildJob, FinishState, JobError, JobPayload, STATE_QUEUE};
pub use logwriter::{AmqpPartSink, LogPart, LogWriter, LogWriterError, PartSink, LOGS_QUEUE};
pub use pool::{PoolError, PoolSettings, ProcessorPool, COMMANDS_QUEUE};
pub use processor::Processor;
pub use provider::{
    registry, BoxcarProvider, FakeProvider, Instance, InstanceError, Provider, ProviderConfig,
    ProviderError, RunResult, StartAttributes,
};
pub use script::{HttpScriptGenerator, ScriptError, ScriptGenerator};
pub use steps::{Pipeline, Step, StepAction, StepState};
