//! Buffered, chunked, sequence-numbered build log shipping.
//!
//! A [`LogWriter`] accumulates build output for one job and flushes it to
//! the logs queue as JSON-encoded parts. Parts are numbered per job from
//! zero; closing the writer emits exactly one final part with empty
//! content. Where the parts go is abstracted behind [`PartSink`] so the
//! buffering and sequencing logic can be exercised against an in-memory
//! sink, with [`AmqpPartSink`] as the production implementation.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Queue receiving log parts.
pub const LOGS_QUEUE: &str = "reporting.jobs.logs";

const DEFAULT_MAX_LOG_LENGTH: usize = 4_000_000;
const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Buffer size that triggers an immediate flush instead of waiting for the
/// timer.
const CHUNK_HIGH_WATER: usize = 10_240;

/// One chunk of build output.
///
/// The wire field names are part of the reporting contract: `id`,
/// `content`, `number`, `uuid`, `final`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct LogPart {
    /// Numeric id of the job this part belongs to.
    #[serde(rename = "id")]
    pub job_id: u64,
    /// Chunk of build output, verbatim UTF-8.
    pub content: String,
    /// Per-job sequence number, starting at zero.
    pub number: u64,
    /// UUID of the job.
    pub uuid: String,
    /// Set on the last part of a job, which always has empty content.
    #[serde(rename = "final")]
    pub is_final: bool,
}

/// Errors raised by the log writer.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LogWriterError {
    /// Raised when the publisher channel cannot be opened.
    #[error("failed to open log publisher channel: {message}")]
    Open {
        /// Broker error description.
        message: String,
    },
    /// Raised when publishing a part fails.
    #[error("failed to publish log part: {message}")]
    Publish {
        /// Broker error description.
        message: String,
    },
    /// Raised when a write would push the job log past its cap.
    #[error("log exceeded the maximum length of {max} bytes")]
    MaxLengthExceeded {
        /// Configured maximum number of bytes.
        max: usize,
    },
    /// Raised when writing to a writer that has been closed.
    #[error("log writer is closed")]
    Closed,
}

/// Destination for finished log parts.
#[async_trait]
pub trait PartSink: Send + Sync {
    /// Publishes one part.
    ///
    /// # Errors
    ///
    /// Returns [`LogWriterError::Publish`] when the part cannot be
    /// delivered.
    async fn publish(&self, part: &LogPart) -> Result<(), LogWriterError>;

    /// Releases whatever the sink holds open. Called once, after the
    /// final part.
    ///
    /// # Errors
    ///
    /// Returns [`LogWriterError::Publish`] when the release fails.
    async fn close(&self) -> Result<(), LogWriterError> {
        Ok(())
    }
}

/// Publishes log parts to the logs queue with persistent delivery.
pub struct AmqpPartSink {
    channel: Channel,
}

impl AmqpPartSink {
    /// Opens a dedicated publisher channel and asserts the durable logs
    /// queue.
    ///
    /// # Errors
    ///
    /// Returns [`LogWriterError::Open`] when the channel cannot be created
    /// or the queue declaration fails.
    pub async fn open(conn: &Connection) -> Result<Self, LogWriterError> {
        let channel = conn
            .create_channel()
            .await
            .map_err(|err| LogWriterError::Open {
                message: err.to_string(),
            })?;
        channel
            .queue_declare(
                LOGS_QUEUE,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| LogWriterError::Open {
                message: err.to_string(),
            })?;
        Ok(Self { channel })
    }
}

#[async_trait]
impl PartSink for AmqpPartSink {
    async fn publish(&self, part: &LogPart) -> Result<(), LogWriterError> {
        let body = serde_json::to_vec(part).map_err(|err| LogWriterError::Publish {
            message: err.to_string(),
        })?;
        self.channel
            .basic_publish(
                "",
                LOGS_QUEUE,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(2),
            )
            .await
            .map_err(|err| LogWriterError::Publish {
                message: err.to_string(),
            })?
            .await
            .map_err(|err| LogWriterError::Publish {
                message: err.to_string(),
            })?;
        Ok(())
    }

    async fn close(&self) -> Result<(), LogWriterError> {
        self.channel
            .close(200, "log writer closed")
            .await
            .map_err(|err| LogWriterError::Publish {
                message: err.to_string(),
            })
    }
}

struct WriterState {
    buffer: Vec<u8>,
    next_number: u64,
    written: usize,
    max_length: usize,
    timeout: Duration,
    capped: bool,
    closed: bool,
    pending_error: Option<LogWriterError>,
}

struct Shared {
    job_id: u64,
    uuid: String,
    sink: Box<dyn PartSink>,
    state: tokio::sync::Mutex<WriterState>,
    dirty: Notify,
    stop: CancellationToken,
    activity: watch::Sender<()>,
}

impl Shared {
    /// Publishes the buffered bytes as one non-final part. No-op on an
    /// empty buffer.
    async fn flush_locked(&self, state: &mut WriterState) -> Result<(), LogWriterError> {
        if state.buffer.is_empty() {
            return Ok(());
        }
        let content = String::from_utf8_lossy(&state.buffer).into_owned();
        state.buffer.clear();
        self.publish_locked(state, content, false).await
    }

    async fn publish_locked(
        &self,
        state: &mut WriterState,
        content: String,
        is_final: bool,
    ) -> Result<(), LogWriterError> {
        let part = LogPart {
            job_id: self.job_id,
            content,
            number: state.next_number,
            uuid: self.uuid.clone(),
            is_final,
        };
        self.sink.publish(&part).await?;
        state.next_number += 1;
        Ok(())
    }
}

/// Streaming writer for one job's build log.
///
/// Cloneable handle; all clones share the same buffer, sequence counter,
/// and cap. Writes are totally ordered and all publishes for the job are
/// serialized on the writer's own sink.
#[derive(Clone)]
pub struct LogWriter {
    shared: Arc<Shared>,
}

impl LogWriter {
    /// Opens a writer bound to `job_id`/`uuid` publishing through a
    /// dedicated channel on `conn`.
    ///
    /// # Errors
    ///
    /// Returns [`LogWriterError::Open`] when the publisher channel cannot
    /// be opened.
    pub async fn open(
        conn: &Connection,
        job_id: u64,
        uuid: impl Into<String>,
    ) -> Result<Self, LogWriterError> {
        let sink = AmqpPartSink::open(conn).await?;
        Ok(Self::with_sink(Box::new(sink), job_id, uuid))
    }

    /// Builds a writer on top of an arbitrary sink.
    #[must_use]
    pub fn with_sink(sink: Box<dyn PartSink>, job_id: u64, uuid: impl Into<String>) -> Self {
        let (activity, _) = watch::channel(());
        let shared = Arc::new(Shared {
            job_id,
            uuid: uuid.into(),
            sink,
            state: tokio::sync::Mutex::new(WriterState {
                buffer: Vec::new(),
                next_number: 0,
                written: 0,
                max_length: DEFAULT_MAX_LOG_LENGTH,
                timeout: DEFAULT_FLUSH_TIMEOUT,
                capped: false,
                closed: false,
                pending_error: None,
            }),
            dirty: Notify::new(),
            stop: CancellationToken::new(),
            activity,
        });
        spawn_flusher(&shared);
        Self { shared }
    }

    /// Appends `bytes` to the job log.
    ///
    /// The bytes are buffered and flushed by the timer, by reaching the
    /// high-water mark, or by [`LogWriter::close`]. A write that would push
    /// the cumulative log size past the cap publishes a truncation notice
    /// and fails; so does every later write.
    ///
    /// # Errors
    ///
    /// Returns [`LogWriterError::Closed`] after close,
    /// [`LogWriterError::MaxLengthExceeded`] once capped, and
    /// [`LogWriterError::Publish`] when an eager flush fails.
    pub async fn write(&self, bytes: &[u8]) -> Result<usize, LogWriterError> {
        let shared = &self.shared;
        let mut state = shared.state.lock().await;
        if state.closed {
            return Err(LogWriterError::Closed);
        }
        if let Some(err) = state.pending_error.take() {
            return Err(err);
        }
        if state.capped {
            return Err(LogWriterError::MaxLengthExceeded {
                max: state.max_length,
            });
        }
        if state.written + bytes.len() > state.max_length {
            state.capped = true;
            let max = state.max_length;
            shared.flush_locked(&mut state).await?;
            let notice = format!(
                "\n\nThe build log has exceeded the limit of {max} bytes; \
                 the remainder of the output has been truncated.\n\n"
            );
            shared.publish_locked(&mut state, notice, false).await?;
            return Err(LogWriterError::MaxLengthExceeded { max });
        }

        state.written += bytes.len();
        state.buffer.extend_from_slice(bytes);
        let _ = shared.activity.send(());

        if state.buffer.len() >= CHUNK_HIGH_WATER {
            shared.flush_locked(&mut state).await?;
        } else {
            shared.dirty.notify_one();
        }
        Ok(bytes.len())
    }

    /// Flushes any pending buffer as a non-final part, then publishes the
    /// final part and stops the flusher. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`LogWriterError::Publish`] when either publish fails.
    pub async fn close(&self) -> Result<(), LogWriterError> {
        let shared = &self.shared;
        let mut state = shared.state.lock().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        shared.stop.cancel();
        let pending = state.pending_error.take();
        shared.flush_locked(&mut state).await?;
        shared
            .publish_locked(&mut state, String::new(), true)
            .await?;
        shared.sink.close().await?;
        match pending {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Caps the cumulative number of bytes accepted for this job.
    pub async fn set_max_log_length(&self, max: usize) {
        self.shared.state.lock().await.max_length = max;
    }

    /// Sets the flush cadence for buffered output.
    pub async fn set_timeout(&self, timeout: Duration) {
        self.shared.state.lock().await.timeout = timeout;
    }

    /// Returns a receiver notified on every accepted write, used by the
    /// log-silence watchdog.
    #[must_use]
    pub fn activity(&self) -> watch::Receiver<()> {
        self.shared.activity.subscribe()
    }

    /// Numeric id of the job this writer belongs to.
    #[must_use]
    pub fn job_id(&self) -> u64 {
        self.shared.job_id
    }
}

/// Background task that flushes the buffer once the flush window elapses
/// after a write. Holds only a weak reference so dropped writers are
/// reclaimed.
fn spawn_flusher(shared: &Arc<Shared>) {
    let weak: Weak<Shared> = Arc::downgrade(shared);
    tokio::spawn(async move {
        loop {
            let Some(shared) = weak.upgrade() else { break };
            let stopped = tokio::select! {
                () = shared.stop.cancelled() => true,
                () = shared.dirty.notified() => false,
            };
            if stopped {
                break;
            }
            let timeout = shared.state.lock().await.timeout;
            tokio::time::sleep(timeout).await;
            let mut state = shared.state.lock().await;
            if state.closed {
                break;
            }
            if let Err(err) = shared.flush_locked(&mut state).await {
                warn!(job_id = shared.job_id, error = %err, "timed log flush failed");
                state.pending_error.get_or_insert(err);
            }
        }
    });
}
