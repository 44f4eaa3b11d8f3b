//! Consumer pool: a supervised set of workers that each pull one message at a
//! time, hand it to the dispatcher and settle it with the queue.
//!
//! The pool starts `concurrent_consumers` workers immediately. A worker that
//! receives a message while few others are idle asks the supervisor for one
//! more worker, up to `max_concurrent_consumers`. A worker that sees
//! `idle_task_execution_limit` empty receives in a row retires, as long as the
//! pool stays at or above its minimum.

use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Error, Result, anyhow};
use futures_util::FutureExt;
use tokio::{
    sync::{mpsc, watch},
    task::JoinSet,
    time::sleep,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    clients::rbmq::{MessageQueue, MessageReceiver},
    dispatcher::NotificationDispatcher,
    error::DispatchError,
    models::{
        health::ConsumerStats,
        message::InboundMessage,
        status::{AckDecision, DispatchOutcome},
    },
    reporter::ErrorReporter,
};

#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Workers kept running at all times.
    pub concurrent_consumers: usize,
    /// Ceiling the pool may grow to under load.
    pub max_concurrent_consumers: usize,
    /// Consecutive empty receives after which a surplus worker retires.
    pub idle_task_execution_limit: u32,
    /// Scale-up is requested only while fewer workers than this are idle.
    pub idle_consumer_limit: usize,
    pub receive_timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct AckPolicy {
    pub ack_on_failure: bool,
}

impl Default for AckPolicy {
    fn default() -> Self {
        Self {
            ack_on_failure: true,
        }
    }
}

impl AckPolicy {
    pub fn decide(&self, result: &Result<DispatchOutcome, DispatchError>) -> AckDecision {
        match result {
            Ok(_) => AckDecision::Acknowledge,
            Err(_) if self.ack_on_failure => AckDecision::Acknowledge,
            // Redelivery cannot fix a malformed message.
            Err(e) if e.is_permanent() => AckDecision::Acknowledge,
            Err(_) => AckDecision::Leave,
        }
    }
}

#[derive(Debug)]
pub struct PoolState {
    active: AtomicUsize,
    idle: AtomicUsize,
    processed: AtomicU64,
    minimum: usize,
    maximum: usize,
}

impl PoolState {
    fn new(settings: &PoolSettings) -> Self {
        Self {
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            processed: AtomicU64::new(0),
            minimum: settings.concurrent_consumers,
            maximum: settings.max_concurrent_consumers,
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn idle(&self) -> usize {
        self.idle.load(Ordering::SeqCst)
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            active: self.active(),
            idle: self.idle(),
            processed: self.processed(),
            minimum: self.minimum,
            maximum: self.maximum,
        }
    }

    fn try_grow(&self) -> bool {
        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.maximum).then_some(n + 1)
            })
            .is_ok()
    }

    fn try_shrink(&self) -> bool {
        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > self.minimum).then_some(n - 1)
            })
            .is_ok()
    }

    fn grow(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
enum WorkerExit {
    Shutdown,
    /// Retired by the idle policy; the active count is already decremented.
    Retired,
    Failed(Error),
}

pub struct ConsumerPool<Q: MessageQueue> {
    queue: Arc<Q>,
    dispatcher: Arc<NotificationDispatcher>,
    reporter: Arc<ErrorReporter>,
    settings: PoolSettings,
    ack_policy: AckPolicy,
    state: Arc<PoolState>,
    tag_prefix: String,
}

impl<Q: MessageQueue> ConsumerPool<Q> {
    pub fn new(
        queue: Arc<Q>,
        dispatcher: Arc<NotificationDispatcher>,
        reporter: Arc<ErrorReporter>,
        settings: PoolSettings,
        ack_policy: AckPolicy,
    ) -> Self {
        let state = Arc::new(PoolState::new(&settings));

        Self {
            queue,
            dispatcher,
            reporter,
            settings,
            ack_policy,
            state,
            tag_prefix: format!("email-dispatcher-{}", Uuid::new_v4()),
        }
    }

    pub fn state(&self) -> Arc<PoolState> {
        Arc::clone(&self.state)
    }

    /// Runs until `shutdown` flips to `true`, then waits for every worker to
    /// finish its current message.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), Error> {
        let (scale_tx, mut scale_rx) = mpsc::channel(self.settings.max_concurrent_consumers.max(1));

        let context = WorkerContext {
            queue: Arc::clone(&self.queue),
            dispatcher: Arc::clone(&self.dispatcher),
            reporter: Arc::clone(&self.reporter),
            state: Arc::clone(&self.state),
            settings: self.settings.clone(),
            ack_policy: self.ack_policy,
            scale_tx,
            shutdown: shutdown.clone(),
        };

        let mut workers = JoinSet::new();
        let mut next_id = 0usize;
        let mut stopping = *shutdown.borrow();

        info!(
            concurrent_consumers = self.settings.concurrent_consumers,
            max_concurrent_consumers = self.settings.max_concurrent_consumers,
            ack_on_failure = self.ack_policy.ack_on_failure,
            "Starting consumer pool"
        );

        if !stopping {
            for _ in 0..self.settings.concurrent_consumers {
                self.state.grow();
                self.spawn_worker(&mut workers, &context, &mut next_id, None);
            }
        }

        loop {
            if stopping && workers.is_empty() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed(), if !stopping => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(active = self.state.active(), "Shutdown requested, draining consumers");
                        stopping = true;
                    }
                }
                Some(()) = scale_rx.recv(), if !stopping => {
                    if self.state.try_grow() {
                        debug!(active = self.state.active(), "Scaling consumer pool up");
                        self.spawn_worker(&mut workers, &context, &mut next_id, None);
                    }
                }
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    match joined {
                        Ok((worker_id, WorkerExit::Retired)) => {
                            debug!(worker_id, active = self.state.active(), "Idle consumer retired");
                        }
                        Ok((worker_id, WorkerExit::Shutdown)) => {
                            self.state.release();
                            debug!(worker_id, "Consumer stopped");
                        }
                        Ok((worker_id, WorkerExit::Failed(cause))) => {
                            self.state.release();
                            self.reporter.report(worker_id, &cause);
                        }
                        Err(join_error) => {
                            self.state.release();
                            self.reporter.report(usize::MAX, &join_error);
                        }
                    }

                    while !stopping && self.state.active() < self.settings.concurrent_consumers {
                        warn!(active = self.state.active(), "Replacing failed consumer");
                        self.state.grow();
                        self.spawn_worker(
                            &mut workers,
                            &context,
                            &mut next_id,
                            Some(self.settings.receive_timeout),
                        );
                    }
                }
            }
        }

        info!(processed = self.state.processed(), "Consumer pool stopped");

        Ok(())
    }

    fn spawn_worker(
        &self,
        workers: &mut JoinSet<(usize, WorkerExit)>,
        context: &WorkerContext<Q>,
        next_id: &mut usize,
        delay: Option<Duration>,
    ) {
        let worker_id = *next_id;
        *next_id += 1;

        let context = context.clone();
        let consumer_tag = format!("{}-{}", self.tag_prefix, worker_id);

        workers.spawn(async move {
            if let Some(delay) = delay {
                sleep(delay).await;
            }

            let exit = match AssertUnwindSafe(context.run(worker_id, consumer_tag))
                .catch_unwind()
                .await
            {
                Ok(exit) => exit,
                Err(panic) => WorkerExit::Failed(anyhow!(
                    "consumer loop panicked: {}",
                    panic_message(panic.as_ref())
                )),
            };

            (worker_id, exit)
        });
    }
}

struct WorkerContext<Q: MessageQueue> {
    queue: Arc<Q>,
    dispatcher: Arc<NotificationDispatcher>,
    reporter: Arc<ErrorReporter>,
    state: Arc<PoolState>,
    settings: PoolSettings,
    ack_policy: AckPolicy,
    scale_tx: mpsc::Sender<()>,
    shutdown: watch::Receiver<bool>,
}

impl<Q: MessageQueue> Clone for WorkerContext<Q> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            dispatcher: Arc::clone(&self.dispatcher),
            reporter: Arc::clone(&self.reporter),
            state: Arc::clone(&self.state),
            settings: self.settings.clone(),
            ack_policy: self.ack_policy,
            scale_tx: self.scale_tx.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<Q: MessageQueue> WorkerContext<Q> {
    async fn run(self, worker_id: usize, consumer_tag: String) -> WorkerExit {
        let mut receiver = match self.queue.open_receiver(&consumer_tag).await {
            Ok(receiver) => receiver,
            Err(e) => return WorkerExit::Failed(e),
        };

        debug!(worker_id, consumer_tag = %consumer_tag, "Consumer started");

        let exit = self.consume(worker_id, &mut receiver).await;

        if let Err(e) = receiver.close().await {
            warn!(worker_id, error = %e, "Failed to close consumer");
        }

        exit
    }

    async fn consume(&self, worker_id: usize, receiver: &mut Q::Receiver) -> WorkerExit {
        let mut idle = IdleMarker::new(Arc::clone(&self.state));
        let mut idle_receives = 0u32;

        loop {
            if *self.shutdown.borrow() {
                return WorkerExit::Shutdown;
            }

            let message = match receiver.receive(self.settings.receive_timeout).await {
                Ok(message) => message,
                Err(e) => return WorkerExit::Failed(e),
            };

            let Some(message) = message else {
                idle.set(true);
                idle_receives = idle_receives.saturating_add(1);

                if idle_receives >= self.settings.idle_task_execution_limit
                    && self.state.try_shrink()
                {
                    return WorkerExit::Retired;
                }
                continue;
            };

            idle.set(false);
            idle_receives = 0;
            self.request_scale_up();

            if let Err(e) = self.handle(worker_id, receiver, message).await {
                return WorkerExit::Failed(e);
            }
        }
    }

    fn request_scale_up(&self) {
        if self.state.idle() < self.settings.idle_consumer_limit
            && self.state.active() < self.settings.max_concurrent_consumers
        {
            // A full channel already holds enough pending requests.
            let _ = self.scale_tx.try_send(());
        }
    }

    async fn handle(
        &self,
        worker_id: usize,
        receiver: &mut Q::Receiver,
        message: InboundMessage,
    ) -> Result<(), Error> {
        let result = match AssertUnwindSafe(self.dispatcher.dispatch(&message))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let cause = panic_message(panic.as_ref());
                self.reporter.report(worker_id, &cause);
                Err(DispatchError::Unexpected(cause))
            }
        };

        if let Err(e) = &result {
            error!(
                worker_id,
                delivery_tag = message.delivery_tag,
                message_id = ?message.message_id,
                redelivered = message.redelivered,
                stage = e.stage(),
                error = %e,
                "Failed to dispatch notification"
            );
        }

        let decision = self.ack_policy.decide(&result);
        self.state.processed.fetch_add(1, Ordering::SeqCst);

        debug!(
            worker_id,
            delivery_tag = message.delivery_tag,
            decision = %decision,
            "Settling message"
        );

        match decision {
            AckDecision::Acknowledge => receiver.acknowledge(&message).await?,
            AckDecision::Leave => {
                warn!(
                    worker_id,
                    delivery_tag = message.delivery_tag,
                    "Leaving message for redelivery"
                );
                receiver.release(&message).await?
            }
        }

        Ok(())
    }
}

/// Tracks whether a worker is counted as idle; uncounts it when dropped.
struct IdleMarker {
    state: Arc<PoolState>,
    idle: bool,
}

impl IdleMarker {
    fn new(state: Arc<PoolState>) -> Self {
        let mut marker = Self { state, idle: false };
        marker.set(true);
        marker
    }

    fn set(&mut self, idle: bool) {
        if self.idle == idle {
            return;
        }

        if idle {
            self.state.idle.fetch_add(1, Ordering::SeqCst);
        } else {
            self.state.idle.fetch_sub(1, Ordering::SeqCst);
        }
        self.idle = idle;
    }
}

impl Drop for IdleMarker {
    fn drop(&mut self) {
        self.set(false);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
