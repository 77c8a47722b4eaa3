//! Fan-out of N processors over one queue consumer.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use lapin::options::{
    BasicCancelOptions, BasicConsumeOptions, BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::Connection;
use serde::Deserialize;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cancel::Canceller;
use crate::job::declare_state_queue;
use crate::processor::{Processor, SharedConsumer};
use crate::provider::{Provider, ProviderError};
use crate::script::ScriptGenerator;
use crate::steps::{
    CheckCancellation, GenerateScript, OpenLogWriter, Pipeline, RunScript, StartInstance,
    UploadScript,
};

/// Queue carrying out-of-band worker commands such as job cancellation.
pub const COMMANDS_QUEUE: &str = "worker.commands";

/// Tunables shared by every processor in the pool.
#[derive(Clone, Debug)]
pub struct PoolSettings {
    /// Hostname advertised in the job log banner, when known.
    pub hostname: Option<String>,
    /// Flush cadence for the per-job log writers.
    pub log_flush_timeout: Duration,
    /// Byte cap for the per-job log writers.
    pub max_log_length: usize,
    /// Default hard time limit per job.
    pub hard_timeout: Duration,
    /// Default log-silence window per job.
    pub log_silence_timeout: Duration,
}

/// Errors raised while running the pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Raised when a broker operation fails.
    #[error("broker error: {message}")]
    Broker {
        /// Broker error description.
        message: String,
    },
    /// Raised when the provider cannot be prepared.
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl PoolError {
    fn broker(err: &lapin::Error) -> Self {
        Self::Broker {
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CancelCommand {
    #[serde(rename = "type")]
    kind: String,
    job_id: u64,
}

/// Runs N processors against one build queue over a shared connection.
pub struct ProcessorPool {
    conn: Arc<Connection>,
    provider: Arc<dyn Provider>,
    generator: Arc<dyn ScriptGenerator>,
    settings: PoolSettings,
    graceful: CancellationToken,
    hard: CancellationToken,
}

impl ProcessorPool {
    /// Assembles a pool. Nothing touches the broker until
    /// [`ProcessorPool::run`].
    #[must_use]
    pub fn new(
        conn: Arc<Connection>,
        provider: Arc<dyn Provider>,
        generator: Arc<dyn ScriptGenerator>,
        settings: PoolSettings,
    ) -> Self {
        Self {
            conn,
            provider,
            generator,
            settings,
            graceful: CancellationToken::new(),
            hard: CancellationToken::new(),
        }
    }

    /// Declares the queues, opens one consumer with a prefetch of `count`,
    /// spawns `count` processors sharing it, and blocks until they all
    /// exit.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError`] when provider setup or broker bootstrap
    /// fails; processor-level errors are handled per job.
    pub async fn run(&self, count: u16, queue: &str) -> Result<(), PoolError> {
        self.provider.setup().await?;

        let channel = self
            .conn
            .create_channel()
            .await
            .map_err(|err| PoolError::broker(&err))?;
        let durable = QueueDeclareOptions {
            durable: true,
            ..QueueDeclareOptions::default()
        };
        channel
            .queue_declare(queue, durable, FieldTable::default())
            .await
            .map_err(|err| PoolError::broker(&err))?;
        declare_state_queue(&channel)
            .await
            .map_err(|err| PoolError::Broker {
                message: err.to_string(),
            })?;
        channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|err| PoolError::broker(&err))?;

        let consumer_tag = format!("kiln-{}", Uuid::new_v4().simple());
        let consumer = channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| PoolError::broker(&err))?;
        let consumer: SharedConsumer = Arc::new(tokio::sync::Mutex::new(consumer));

        let canceller = Canceller::new();
        self.spawn_command_listener(canceller.clone()).await?;

        info!(queue, count, "starting processor pool");
        let mut processors = JoinSet::new();
        for _ in 0..count {
            let processor = Processor::new(
                Arc::clone(&self.conn),
                channel.clone(),
                Arc::clone(&consumer),
                self.pipeline(),
                canceller.clone(),
                self.graceful.clone(),
                self.hard.clone(),
                self.settings.hostname.clone(),
                self.settings.hard_timeout,
            );
            processors.spawn(async move { processor.run().await });
        }
        while processors.join_next().await.is_some() {}

        if let Err(err) = channel
            .basic_cancel(&consumer_tag, BasicCancelOptions::default())
            .await
        {
            warn!(error = %err, "couldn't cancel consumer");
        }
        info!("processor pool stopped");
        Ok(())
    }

    /// Stops new deliveries and lets in-flight jobs finish. Idempotent and
    /// safe to call from any task.
    pub fn graceful_shutdown(&self) {
        info!("graceful shutdown requested");
        self.graceful.cancel();
    }

    /// Additionally cancels in-flight jobs, which requeues them.
    pub fn hard_shutdown(&self) {
        info!("hard shutdown requested");
        self.graceful.cancel();
        self.hard.cancel();
    }

    fn pipeline(&self) -> Pipeline {
        Pipeline::new(vec![
            Box::new(CheckCancellation),
            Box::new(OpenLogWriter {
                timeout: self.settings.log_flush_timeout,
                max_log_length: self.settings.max_log_length,
            }),
            Box::new(GenerateScript {
                generator: Arc::clone(&self.generator),
            }),
            Box::new(StartInstance {
                provider: Arc::clone(&self.provider),
            }),
            Box::new(UploadScript),
            Box::new(RunScript {
                log_silence: self.settings.log_silence_timeout,
            }),
        ])
    }

    /// Consumes `worker.commands` and routes cancel messages to the
    /// registered jobs. The listener exits on graceful shutdown.
    async fn spawn_command_listener(&self, canceller: Canceller) -> Result<(), PoolError> {
        let channel = self
            .conn
            .create_channel()
            .await
            .map_err(|err| PoolError::broker(&err))?;
        channel
            .queue_declare(
                COMMANDS_QUEUE,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| PoolError::broker(&err))?;
        let mut consumer = channel
            .basic_consume(
                COMMANDS_QUEUE,
                "kiln-commands",
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| PoolError::broker(&err))?;

        let graceful = self.graceful.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    () = graceful.cancelled() => break,
                    next = consumer.next() => next,
                };
                let delivery = match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(err)) => {
                        warn!(error = %err, "command delivery error");
                        continue;
                    }
                    None => break,
                };
                match serde_json::from_slice::<CancelCommand>(&delivery.data) {
                    Ok(command) if command.kind == "cancel_job" => {
                        if canceller.cancel(command.job_id) {
                            info!(job_id = command.job_id, "cancelled job on command");
                        }
                    }
                    Ok(command) => {
                        warn!(kind = %command.kind, "ignoring unknown worker command");
                    }
                    Err(err) => {
                        warn!(error = %err, "dropping undecodable worker command");
                    }
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_commands_decode() {
        let command: CancelCommand =
            serde_json::from_slice(br#"{"type":"cancel_job","job_id":42}"#)
                .unwrap_or_else(|err| panic!("command should decode: {err}"));
        assert_eq!(command.kind, "cancel_job");
        assert_eq!(command.job_id, 42);
    }
}
