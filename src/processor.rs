//! Drives one job at a time from the shared queue consumer.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::BasicNackOptions;
use lapin::{Channel, Connection, Consumer};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cancel::{CancelReason, Canceller, JobCancellation};
use crate::job::{AmqpJob, BuildJob};
use crate::steps::{Pipeline, StepState};

/// Consumer handle shared by the processors of one pool.
pub type SharedConsumer = Arc<Mutex<Consumer>>;

/// Long-lived worker that pulls deliveries and runs them through the step
/// pipeline, one at a time.
///
/// Two shutdown signals are observed: `graceful` stops pulling new
/// deliveries and lets the current job finish; `hard` additionally
/// cancels the current job so it requeues.
pub struct Processor {
    conn: Arc<Connection>,
    reporter: Channel,
    consumer: SharedConsumer,
    pipeline: Pipeline,
    canceller: Canceller,
    graceful: CancellationToken,
    hard: CancellationToken,
    hostname: Option<String>,
    hard_timeout: Duration,
}

impl Processor {
    /// Assembles a processor around the pool's shared resources.
    #[must_use]
    #[expect(
        clippy::too_many_arguments,
        reason = "each shared handle is wired explicitly by the pool"
    )]
    pub fn new(
        conn: Arc<Connection>,
        reporter: Channel,
        consumer: SharedConsumer,
        pipeline: Pipeline,
        canceller: Canceller,
        graceful: CancellationToken,
        hard: CancellationToken,
        hostname: Option<String>,
        hard_timeout: Duration,
    ) -> Self {
        Self {
            conn,
            reporter,
            consumer,
            pipeline,
            canceller,
            graceful,
            hard,
            hostname,
            hard_timeout,
        }
    }

    /// Consumes deliveries until the consumer closes or a graceful
    /// shutdown is signalled.
    pub async fn run(&self) {
        loop {
            let next = tokio::select! {
                () = self.graceful.cancelled() => break,
                next = async { self.consumer.lock().await.next().await } => next,
            };
            match next {
                Some(Ok(delivery)) => self.process(delivery).await,
                Some(Err(err)) => {
                    warn!(error = %err, "consumer delivery error");
                }
                None => break,
            }
        }
        debug!("processor exiting");
    }

    async fn process(&self, delivery: Delivery) {
        let payload = match AmqpJob::decode_payload(&delivery.data) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "dropping undecodable job payload");
                if let Err(err) = delivery.nack(BasicNackOptions::default()).await {
                    warn!(error = %err, "couldn't drop delivery");
                }
                return;
            }
        };

        let job_id = payload.job.id;
        let hard_timeout = payload
            .timeouts
            .hard_limit
            .map_or(self.hard_timeout, Duration::from_secs);
        info!(job_id, uuid = %payload.uuid, "processing job");

        let job: Arc<dyn BuildJob> = Arc::new(AmqpJob::new(
            Arc::clone(&self.conn),
            self.reporter.clone(),
            delivery,
            payload,
        ));
        if let Err(err) = job.received().await {
            warn!(job_id, error = %err, "couldn't report job receipt");
        }

        let cancel = JobCancellation::new();
        self.canceller.register(job_id, cancel.clone());
        let sentinel = spawn_sentinel(cancel.clone(), self.hard.clone(), hard_timeout);

        let mut state = StepState::new(cancel, job, self.hostname.clone());
        self.pipeline.run(&mut state).await;

        sentinel.abort();
        self.canceller.deregister(job_id);
        info!(job_id, "job done");
    }
}

/// Cancels the job on hard shutdown or when its hard time limit elapses.
/// Aborted once the job settles.
fn spawn_sentinel(
    cancel: JobCancellation,
    hard: CancellationToken,
    hard_timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            () = hard.cancelled() => cancel.cancel(CancelReason::Shutdown),
            () = tokio::time::sleep(hard_timeout) => cancel.cancel(CancelReason::HardTimeout),
        }
    })
}
