//! One unit of work pulled from the build queue.
//!
//! A job wraps a single queue delivery: it owns the decoded payload,
//! opens the log writer bound to the job's id and uuid, publishes
//! lifecycle state reports, and settles the delivery exactly once.
//! Terminal states ack; infrastructure failures nack with requeue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicNackOptions, BasicPublishOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::logwriter::{LogWriter, LogWriterError};

/// Queue receiving job state reports.
pub const STATE_QUEUE: &str = "reporting.jobs.builds";

/// Job description decoded from a build-queue message body.
///
/// Unknown fields are ignored so the payload survives schema additions on
/// the producing side.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct JobPayload {
    /// Job kind tag (for example `test`).
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Core job attributes.
    pub job: JobSpec,
    /// Repository the job builds.
    #[serde(default)]
    pub repository: Repository,
    /// Opaque build configuration blob; image selection reads from it.
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
    /// Queue the job was published to.
    #[serde(default)]
    pub queue: String,
    /// UUID identifying the job across services.
    pub uuid: String,
    /// Optional SSH key provided with the job.
    #[serde(default)]
    pub ssh_key: Option<String>,
    /// Environment variables exported into the build.
    #[serde(default)]
    pub env_vars: Vec<EnvVar>,
    /// Per-job timeout overrides, in seconds.
    #[serde(default)]
    pub timeouts: Timeouts,
}

/// Immutable attributes of the job itself.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct JobSpec {
    /// Numeric job id; log parts and state reports are keyed by it.
    pub id: u64,
    /// Display number such as `1.1`.
    #[serde(default)]
    pub number: Option<String>,
    /// Commit being built.
    #[serde(default)]
    pub commit: String,
    /// Commit range covered by the build.
    #[serde(default)]
    pub commit_range: String,
    /// Commit message.
    #[serde(default)]
    pub commit_message: String,
    /// Branch being built.
    #[serde(default)]
    pub branch: String,
    /// Whether secure environment variables are exposed to this job.
    #[serde(default)]
    pub secure_env_enabled: bool,
    /// Whether the job belongs to a pull request.
    #[serde(default)]
    pub pull_request: bool,
}

/// Repository slug and id.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Repository {
    /// Numeric repository id.
    #[serde(default)]
    pub id: u64,
    /// Owner/name slug.
    #[serde(default)]
    pub slug: String,
}

/// One environment variable shipped with the job.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct EnvVar {
    /// Variable name.
    pub name: String,
    /// Variable value.
    #[serde(default)]
    pub value: String,
    /// Whether the value may appear in build logs.
    #[serde(default)]
    pub public: bool,
}

/// Per-job timeout overrides, in seconds. Absent values fall back to the
/// worker defaults.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Timeouts {
    /// Hard wall-clock limit for the whole job.
    #[serde(default)]
    pub hard_limit: Option<u64>,
    /// Maximum window without any log output.
    #[serde(default)]
    pub log_silence: Option<u64>,
}

/// Terminal outcome reported for a job.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FinishState {
    /// The build script completed with exit status zero.
    Passed,
    /// The build script completed with a non-zero exit status, or the job
    /// was cancelled.
    Failed,
    /// The worker could not run the job to completion.
    Errored,
}

/// Errors raised while reporting state or settling the delivery.
#[derive(Debug, Error)]
pub enum JobError {
    /// Raised when the message body is not a valid job payload.
    #[error("failed to decode job payload: {message}")]
    Payload {
        /// Decoder error description.
        message: String,
    },
    /// Raised when a state report cannot be published.
    #[error("failed to publish state report: {message}")]
    Report {
        /// Broker error description.
        message: String,
    },
    /// Raised when the delivery cannot be acked or nacked.
    #[error("failed to settle delivery: {message}")]
    Settle {
        /// Broker error description.
        message: String,
    },
    /// Raised on a second terminal action for the same delivery.
    #[error("job was already finished or requeued")]
    AlreadySettled,
}

/// Capabilities of one consumed job, independent of the queue transport.
#[async_trait]
pub trait BuildJob: Send + Sync {
    /// The decoded payload.
    fn payload(&self) -> &JobPayload;

    /// Opens the log writer bound to this job's id and uuid.
    ///
    /// # Errors
    ///
    /// Returns [`LogWriterError::Open`] when the publisher channel cannot
    /// be opened.
    async fn log_writer(&self) -> Result<LogWriter, LogWriterError>;

    /// Reports that the job has been received by a worker.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Report`] when the report cannot be published.
    async fn received(&self) -> Result<(), JobError>;

    /// Reports that the build script is about to run.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Report`] when the report cannot be published.
    async fn started(&self) -> Result<(), JobError>;

    /// Reports the terminal state and acks the delivery.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::AlreadySettled`] on a repeated terminal action
    /// and [`JobError::Report`] when the report cannot be published.
    async fn finish(&self, state: FinishState) -> Result<(), JobError>;

    /// Returns the job to the queue for another worker to attempt.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::AlreadySettled`] on a repeated terminal action
    /// and [`JobError::Settle`] when the nack fails.
    async fn requeue(&self) -> Result<(), JobError>;
}

#[derive(Serialize)]
struct StateReport<'a> {
    id: u64,
    state: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a str>,
}

/// [`BuildJob`] backed by an AMQP delivery.
pub struct AmqpJob {
    conn: Arc<Connection>,
    reporter: Channel,
    delivery: Delivery,
    payload: JobPayload,
    settled: AtomicBool,
}

impl AmqpJob {
    /// Wraps a delivery whose payload was already decoded.
    #[must_use]
    pub fn new(
        conn: Arc<Connection>,
        reporter: Channel,
        delivery: Delivery,
        payload: JobPayload,
    ) -> Self {
        Self {
            conn,
            reporter,
            delivery,
            payload,
            settled: AtomicBool::new(false),
        }
    }

    /// Decodes a build-queue message body.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Payload`] when the body is not valid JSON or is
    /// missing required fields.
    pub fn decode_payload(body: &[u8]) -> Result<JobPayload, JobError> {
        serde_json::from_slice(body).map_err(|err| JobError::Payload {
            message: err.to_string(),
        })
    }

    fn job_id(&self) -> u64 {
        self.payload.job.id
    }

    async fn report(&self, state: &str, result: Option<&str>) -> Result<(), JobError> {
        let record = StateReport {
            id: self.job_id(),
            state,
            result,
        };
        let body = serde_json::to_vec(&record).map_err(|err| JobError::Report {
            message: err.to_string(),
        })?;
        self.reporter
            .basic_publish(
                "",
                STATE_QUEUE,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(2),
            )
            .await
            .map_err(|err| JobError::Report {
                message: err.to_string(),
            })?
            .await
            .map_err(|err| JobError::Report {
                message: err.to_string(),
            })?;
        Ok(())
    }

    fn take_settlement(&self) -> Result<(), JobError> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(JobError::AlreadySettled);
        }
        Ok(())
    }
}

#[async_trait]
impl BuildJob for AmqpJob {
    fn payload(&self) -> &JobPayload {
        &self.payload
    }

    async fn log_writer(&self) -> Result<LogWriter, LogWriterError> {
        LogWriter::open(&self.conn, self.job_id(), self.payload.uuid.clone()).await
    }

    async fn received(&self) -> Result<(), JobError> {
        self.report("received", None).await
    }

    async fn started(&self) -> Result<(), JobError> {
        self.report("started", None).await
    }

    async fn finish(&self, state: FinishState) -> Result<(), JobError> {
        self.take_settlement()?;
        let report = match state {
            FinishState::Passed => self.report("finished", Some("passed")).await,
            FinishState::Failed => self.report("finished", Some("failed")).await,
            FinishState::Errored => self.report("errored", None).await,
        };
        if let Err(err) = report {
            warn!(job_id = self.job_id(), error = %err, "state report failed");
        }
        // The broker redelivers on reconnect if the ack is lost; the job is
        // not re-run by this worker.
        if let Err(err) = self.delivery.ack(BasicAckOptions::default()).await {
            warn!(job_id = self.job_id(), error = %err, "ack failed");
        }
        Ok(())
    }

    async fn requeue(&self) -> Result<(), JobError> {
        self.take_settlement()?;
        self.delivery
            .nack(BasicNackOptions {
                requeue: true,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(|err| JobError::Settle {
                message: err.to_string(),
            })
    }
}

/// Declares the durable state-report queue on `channel`.
///
/// # Errors
///
/// Returns [`JobError::Report`] when the declaration fails.
pub async fn declare_state_queue(channel: &Channel) -> Result<(), JobError> {
    channel
        .queue_declare(
            STATE_QUEUE,
            lapin::options::QueueDeclareOptions {
                durable: true,
                ..lapin::options::QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|err| JobError::Report {
            message: err.to_string(),
        })?;
    Ok(())
}
