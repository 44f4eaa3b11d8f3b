use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use email_dispatcher::{
    pool::{AckPolicy, ConsumerPool, PoolSettings, PoolState},
    reporter::ErrorReporter,
};
use serde_json::json;
use tokio::{sync::watch, task::JoinHandle};

use crate::common::{
    InMemoryQueue, RecordingMailer, dispatcher, inline_renderer, pool_settings, wait_until,
};

const PATIENCE: Duration = Duration::from_secs(5);

struct RunningPool {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<Result<()>>,
}

impl RunningPool {
    async fn stop(self) -> Result<()> {
        self.shutdown.send(true)?;
        self.handle.await?
    }
}

fn start(
    queue: Arc<InMemoryQueue>,
    mailer: Arc<RecordingMailer>,
    reporter: Arc<ErrorReporter>,
    settings: PoolSettings,
    ack_policy: AckPolicy,
) -> (RunningPool, Arc<PoolState>) {
    let pool = ConsumerPool::new(
        queue,
        dispatcher(inline_renderer(), mailer, &["ops@dareu.com"]),
        reporter,
        settings,
        ack_policy,
    );
    let state = pool.state();

    let (shutdown, rx) = watch::channel(false);
    let handle = tokio::spawn(pool.run(rx));

    (RunningPool { shutdown, handle }, state)
}

fn contact(recipient: &str) -> serde_json::Value {
    json!({ "recipients": [recipient], "body": { "subject": "Hi" } })
}

/// Test: Every message published under load is delivered and acknowledged once
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_messages_are_all_delivered() -> Result<()> {
    let queue = InMemoryQueue::new();
    let mailer = Arc::new(RecordingMailer::new().with_delay(Duration::from_millis(30)));
    let reporter = Arc::new(ErrorReporter::new());

    let (pool, state) = start(
        queue.clone(),
        mailer.clone(),
        reporter.clone(),
        pool_settings(2, 5),
        AckPolicy::default(),
    );

    for i in 0..20 {
        queue.publish(Some("CONTACT_MESSAGE"), &contact(&format!("user{}@x.com", i)));
    }

    let peak = Arc::new(AtomicUsize::new(0));
    let observed = peak.clone();
    let sampled = state.clone();
    let delivered = wait_until(PATIENCE, || {
        observed.fetch_max(sampled.active(), Ordering::SeqCst);
        mailer.sent_count() == 20
    })
    .await;

    assert!(delivered, "all 20 messages should be delivered");
    assert!(wait_until(PATIENCE, || queue.acked().len() == 20).await);

    let peak = peak.load(Ordering::SeqCst);
    assert!(peak > 2, "pool should scale above its minimum (peak {})", peak);
    assert!(peak <= 5, "pool must not exceed its maximum (peak {})", peak);

    let mut acked = queue.acked();
    acked.sort_unstable();
    acked.dedup();
    assert_eq!(acked.len(), 20, "each message acknowledged exactly once");
    assert_eq!(reporter.reported_count(), 0);

    pool.stop().await?;
    assert_eq!(state.processed(), 20);

    Ok(())
}

/// Test: Surplus consumers retire once idle and the pool settles at its minimum
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_idle_surplus_consumers_retire() -> Result<()> {
    let queue = InMemoryQueue::new();
    let mailer = Arc::new(RecordingMailer::new().with_delay(Duration::from_millis(20)));
    let reporter = Arc::new(ErrorReporter::new());

    let (pool, state) = start(
        queue.clone(),
        mailer.clone(),
        reporter,
        pool_settings(1, 4),
        AckPolicy::default(),
    );

    for i in 0..12 {
        queue.publish(Some("CONTACT_MESSAGE"), &contact(&format!("user{}@x.com", i)));
    }

    assert!(wait_until(PATIENCE, || mailer.sent_count() == 12).await);
    assert!(queue.opened() > 1, "pool should have grown while busy");

    assert!(
        wait_until(PATIENCE, || state.active() == 1).await,
        "pool should shrink back to one consumer, still at {}",
        state.active()
    );
    assert!(wait_until(PATIENCE, || state.idle() == 1).await);
    assert!(
        wait_until(PATIENCE, || queue.closed() == queue.opened() - 1).await,
        "retired consumers should be closed"
    );

    pool.stop().await?;
    assert_eq!(state.active(), 0);
    assert_eq!(queue.closed(), queue.opened());

    Ok(())
}

/// Test: Failed dispatches are acknowledged under the default policy
#[tokio::test]
async fn test_failures_are_acknowledged_by_default() -> Result<()> {
    let queue = InMemoryQueue::new();
    let mailer = Arc::new(RecordingMailer::new().failing_first(1));
    let reporter = Arc::new(ErrorReporter::new());

    let (pool, _) = start(
        queue.clone(),
        mailer.clone(),
        reporter.clone(),
        pool_settings(1, 1),
        AckPolicy::default(),
    );

    let tag = queue.publish(Some("CONTACT_MESSAGE"), &contact("a@x.com"));
    let unknown = queue.publish(Some("NEWSLETTER"), &contact("b@x.com"));

    assert!(wait_until(PATIENCE, || queue.acked().len() == 2).await);
    assert_eq!(queue.acked(), vec![tag, unknown]);
    assert!(queue.released().is_empty());
    assert_eq!(mailer.attempts(), 1);
    assert_eq!(mailer.sent_count(), 0);
    assert_eq!(reporter.reported_count(), 0, "handled failures are not reported");

    pool.stop().await
}

/// Test: With redelivery enabled, transient failures are retried by the queue
#[tokio::test]
async fn test_transient_failures_are_redelivered_when_configured() -> Result<()> {
    let queue = InMemoryQueue::new();
    let mailer = Arc::new(RecordingMailer::new().failing_first(1));
    let reporter = Arc::new(ErrorReporter::new());

    let (pool, _) = start(
        queue.clone(),
        mailer.clone(),
        reporter,
        pool_settings(1, 1),
        AckPolicy {
            ack_on_failure: false,
        },
    );

    let tag = queue.publish(Some("CONTACT_MESSAGE"), &contact("a@x.com"));
    let malformed = queue.publish(Some("USER_REGISTRATION"), &json!({ "body": {} }));

    assert!(wait_until(PATIENCE, || queue.acked().len() == 2).await);

    assert_eq!(queue.released(), vec![tag], "only the transient failure is left");
    assert!(queue.acked().contains(&malformed), "malformed payloads are dropped");
    assert_eq!(mailer.attempts(), 2);
    assert_eq!(mailer.sent_count(), 1);
    assert_eq!(mailer.sent()[0].to, vec!["a@x.com".to_string()]);

    pool.stop().await
}

/// Test: A panicking send is reported and the pool keeps consuming
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panics_are_reported_and_contained() -> Result<()> {
    let queue = InMemoryQueue::new();
    let mailer = Arc::new(RecordingMailer::new().panicking_for("boom@x.com"));
    let reporter = Arc::new(ErrorReporter::new());

    let (pool, state) = start(
        queue.clone(),
        mailer.clone(),
        reporter.clone(),
        pool_settings(1, 1),
        AckPolicy::default(),
    );

    queue.publish(Some("CONTACT_MESSAGE"), &contact("boom@x.com"));
    queue.publish(Some("CONTACT_MESSAGE"), &contact("fine@x.com"));

    assert!(wait_until(PATIENCE, || mailer.sent_count() == 1).await);
    assert!(wait_until(PATIENCE, || queue.acked().len() == 2).await);

    assert_eq!(reporter.reported_count(), 1);
    assert!(reporter.recent()[0].cause.contains("mail transport exploded"));
    assert_eq!(mailer.sent()[0].to, vec!["fine@x.com".to_string()]);
    assert_eq!(state.active(), 1);

    pool.stop().await
}

/// Test: A consumer whose channel breaks is reported and replaced
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_broken_consumer_is_replaced() -> Result<()> {
    let queue = InMemoryQueue::new();
    let mailer = Arc::new(RecordingMailer::new());
    let reporter = Arc::new(ErrorReporter::new());

    let (pool, state) = start(
        queue.clone(),
        mailer.clone(),
        reporter.clone(),
        pool_settings(1, 1),
        AckPolicy::default(),
    );

    assert!(wait_until(PATIENCE, || queue.opened() == 1).await);
    queue.break_next_receive();

    assert!(wait_until(PATIENCE, || reporter.reported_count() == 1).await);
    assert!(wait_until(PATIENCE, || queue.opened() == 2).await);
    assert!(wait_until(PATIENCE, || state.active() == 1).await);

    queue.publish(Some("CONTACT_MESSAGE"), &contact("a@x.com"));
    assert!(wait_until(PATIENCE, || mailer.sent_count() == 1).await);

    pool.stop().await
}

/// Test: Shutdown stops every consumer without messages in flight
#[tokio::test]
async fn test_shutdown_drains_consumers() -> Result<()> {
    let queue = InMemoryQueue::new();
    let mailer = Arc::new(RecordingMailer::new());
    let reporter = Arc::new(ErrorReporter::new());

    let (pool, state) = start(
        queue.clone(),
        mailer,
        reporter.clone(),
        pool_settings(3, 3),
        AckPolicy::default(),
    );

    assert!(wait_until(PATIENCE, || queue.opened() == 3).await);

    tokio::time::timeout(PATIENCE, pool.stop()).await??;

    assert_eq!(state.active(), 0);
    assert_eq!(state.idle(), 0);
    assert_eq!(queue.closed(), 3, "every consumer is cancelled on the way out");
    assert_eq!(reporter.reported_count(), 0);

    Ok(())
}

/// Test: Shutdown lets a message that is mid-send finish and be acknowledged
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_waits_for_in_flight_message() -> Result<()> {
    let queue = InMemoryQueue::new();
    let mailer = Arc::new(RecordingMailer::new().with_delay(Duration::from_millis(300)));
    let reporter = Arc::new(ErrorReporter::new());

    let (pool, state) = start(
        queue.clone(),
        mailer.clone(),
        reporter.clone(),
        pool_settings(1, 1),
        AckPolicy::default(),
    );

    let tag = queue.publish(Some("CONTACT_MESSAGE"), &contact("a@x.com"));
    assert!(wait_until(PATIENCE, || mailer.attempts() == 1).await);
    assert_eq!(mailer.sent_count(), 0, "send should still be in progress");

    tokio::time::timeout(PATIENCE, pool.stop()).await??;

    assert_eq!(mailer.sent_count(), 1);
    assert_eq!(queue.acked(), vec![tag]);
    assert!(queue.released().is_empty());
    assert_eq!(state.processed(), 1);
    assert_eq!(queue.closed(), 1);
    assert_eq!(reporter.reported_count(), 0);

    Ok(())
}

/// Test: A malformed recipient address is dropped rather than redelivered
#[tokio::test]
async fn test_invalid_recipient_is_not_redelivered() -> Result<()> {
    let queue = InMemoryQueue::new();
    let mailer = Arc::new(RecordingMailer::new());
    let reporter = Arc::new(ErrorReporter::new());

    let (pool, _) = start(
        queue.clone(),
        mailer.clone(),
        reporter,
        pool_settings(1, 1),
        AckPolicy {
            ack_on_failure: false,
        },
    );

    let tag = queue.publish(Some("CONTACT_MESSAGE"), &contact("not an address"));

    assert!(wait_until(PATIENCE, || queue.acked().len() == 1).await);
    assert_eq!(queue.acked(), vec![tag]);
    assert!(queue.released().is_empty());
    assert_eq!(mailer.attempts(), 0);

    pool.stop().await
}
