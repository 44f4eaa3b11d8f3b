use std::{
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use email_dispatcher::{
    clients::{
        rbmq::{MessageQueue, MessageReceiver},
        smtp::MailSender,
        template::{FileTemplateSource, InMemoryTemplateSource, TemplateRenderer},
    },
    dispatcher::{DispatchSettings, NotificationDispatcher},
    models::{message::InboundMessage, render::OutboundEmail},
    pool::PoolSettings,
};
use serde_json::Value;
use tokio::{
    sync::{Mutex as AsyncMutex, mpsc},
    time::{Instant, sleep, timeout},
};

pub const SENDER: &str = "DareU <no-reply@dareu.com>";

/// Broker stand-in shared by every receiver it opens.
pub struct InMemoryQueue {
    tx: mpsc::UnboundedSender<InboundMessage>,
    rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<InboundMessage>>>,
    ledger: Arc<Ledger>,
    next_tag: AtomicU64,
}

#[derive(Default)]
pub struct Ledger {
    acked: Mutex<Vec<u64>>,
    released: Mutex<Vec<u64>>,
    fail_next_receive: AtomicBool,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl InMemoryQueue {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            tx,
            rx: Arc::new(AsyncMutex::new(rx)),
            ledger: Arc::new(Ledger::default()),
            next_tag: AtomicU64::new(1),
        })
    }

    /// Enqueues a message and returns its delivery tag.
    pub fn publish(&self, email_type: Option<&str>, body: &Value) -> u64 {
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        let mut message = InboundMessage::new(tag, body.to_string());
        message.message_id = Some(format!("msg-{}", tag));

        if let Some(kind) = email_type {
            message = message.with_email_type(kind);
        }

        self.tx.send(message).expect("queue receiver alive");
        tag
    }

    pub fn acked(&self) -> Vec<u64> {
        self.ledger.acked.lock().unwrap().clone()
    }

    pub fn released(&self) -> Vec<u64> {
        self.ledger.released.lock().unwrap().clone()
    }

    pub fn opened(&self) -> usize {
        self.ledger.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.ledger.closed.load(Ordering::SeqCst)
    }

    /// The next receive on any receiver fails as if the channel dropped.
    pub fn break_next_receive(&self) {
        self.ledger.fail_next_receive.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    type Receiver = InMemoryReceiver;

    async fn open_receiver(&self, _consumer_tag: &str) -> Result<Self::Receiver, Error> {
        self.ledger.opened.fetch_add(1, Ordering::SeqCst);

        Ok(InMemoryReceiver {
            tx: self.tx.clone(),
            rx: Arc::clone(&self.rx),
            ledger: Arc::clone(&self.ledger),
        })
    }
}

pub struct InMemoryReceiver {
    tx: mpsc::UnboundedSender<InboundMessage>,
    rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<InboundMessage>>>,
    ledger: Arc<Ledger>,
}

#[async_trait]
impl MessageReceiver for InMemoryReceiver {
    async fn receive(&mut self, idle_wait: Duration) -> Result<Option<InboundMessage>, Error> {
        if self.ledger.fail_next_receive.swap(false, Ordering::SeqCst) {
            return Err(anyhow!("channel closed by broker"));
        }

        let rx = Arc::clone(&self.rx);
        let next = timeout(idle_wait, async move { rx.lock().await.recv().await }).await;

        match next {
            Err(_) => Ok(None),
            Ok(None) => Err(anyhow!("queue closed")),
            Ok(Some(message)) => Ok(Some(message)),
        }
    }

    async fn acknowledge(&self, message: &InboundMessage) -> Result<(), Error> {
        self.ledger.acked.lock().unwrap().push(message.delivery_tag);
        Ok(())
    }

    async fn release(&self, message: &InboundMessage) -> Result<(), Error> {
        self.ledger.released.lock().unwrap().push(message.delivery_tag);

        let mut redelivery = message.clone();
        redelivery.redelivered = true;
        self.tx
            .send(redelivery)
            .map_err(|_| anyhow!("queue closed"))?;

        Ok(())
    }

    async fn close(&mut self) -> Result<(), Error> {
        self.ledger.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Mail sender that records accepted emails and can be told to misbehave.
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<OutboundEmail>>,
    attempts: AtomicUsize,
    failures_remaining: AtomicUsize,
    panic_for: Option<String>,
    delay: Duration,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_first(self, failures: usize) -> Self {
        self.failures_remaining.store(failures, Ordering::SeqCst);
        self
    }

    pub fn panicking_for(mut self, address: &str) -> Self {
        self.panic_for = Some(address.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn sent(&self) -> Vec<OutboundEmail> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailSender for RecordingMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<(), Error> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }

        if let Some(address) = &self.panic_for {
            if email.to.contains(address) {
                panic!("mail transport exploded for {}", address);
            }
        }

        let failed = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(anyhow!("relay temporarily unavailable"));
        }

        self.sent.lock().unwrap().push(email.clone());
        Ok(())
    }
}

pub fn bundled_renderer() -> Arc<TemplateRenderer> {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("templates");
    let source = FileTemplateSource::new(root).expect("bundled templates present");
    Arc::new(TemplateRenderer::new(Arc::new(source)))
}

pub fn inline_renderer() -> Arc<TemplateRenderer> {
    let source = InMemoryTemplateSource::new()
        .with_template("error-message", "<p>{{applicationId}}: {{message}}</p>")
        .with_template("user-registration", "<p>Welcome {{email}}</p>")
        .with_template("contact-message", "<p>{{subject}}</p>")
        .with_template("contact-message-reply", "<p>{{reply}}</p>")
        .with_template("friendship-requested", "<p>{{requesterName}}</p>");

    Arc::new(TemplateRenderer::new(Arc::new(source)))
}

pub fn dispatcher(
    renderer: Arc<TemplateRenderer>,
    mailer: Arc<RecordingMailer>,
    admin_recipients: &[&str],
) -> Arc<NotificationDispatcher> {
    Arc::new(NotificationDispatcher::new(
        renderer,
        mailer,
        DispatchSettings {
            sender: SENDER.to_string(),
            admin_recipients: admin_recipients.iter().map(|s| s.to_string()).collect(),
        },
    ))
}

pub fn pool_settings(min: usize, max: usize) -> PoolSettings {
    PoolSettings {
        concurrent_consumers: min,
        max_concurrent_consumers: max,
        idle_task_execution_limit: 3,
        idle_consumer_limit: min,
        receive_timeout: Duration::from_millis(20),
    }
}

/// Polls `condition` until it holds or `limit` elapses.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;

    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(5)).await;
    }

    condition()
}
