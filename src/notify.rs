use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::limits::NOTIFICATION_QUEUE_CAPACITY;
use crate::model::Reservation;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyError(pub String);

impl fmt::Display for NotifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "notification failed: {}", self.0)
    }
}

impl std::error::Error for NotifyError {}

/// Delivers a message to one recipient. Best effort.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, recipient: &str, subject: &str, body: &str) -> Result<(), NotifyError>;
}

/// Writes every notice to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, recipient: &str, subject: &str, body: &str) -> Result<(), NotifyError> {
        info!(recipient, subject, "{body}");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

impl Notification {
    pub fn new(
        recipient: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            recipient: recipient.into(),
            subject: subject.into(),
            body: body.into(),
        }
    }

    pub fn confirmed(to: &str, r: &Reservation) -> Self {
        Self::new(
            to,
            format!("Reservation #{} confirmed", r.id),
            format!(
                "Your appointment is booked for {} at {}. Services: {}. Total: {}.",
                r.date().format("%d/%m/%Y"),
                r.slot_time(),
                r.services.join(", "),
                r.total
            ),
        )
    }

    pub fn new_booking(to: &str, r: &Reservation) -> Self {
        Self::new(
            to,
            format!("New reservation #{}", r.id),
            format!(
                "{} booked {} at {} ({}). Phone: {}. Total: {}.",
                r.client_id,
                r.date().format("%d/%m/%Y"),
                r.slot_time(),
                r.services.join(", "),
                r.phone,
                r.total
            ),
        )
    }

    pub fn cancelled(to: &str, r: &Reservation) -> Self {
        Self::new(
            to,
            format!("Reservation #{} cancelled", r.id),
            format!(
                "The appointment on {} at {} was cancelled and the slot is free again.",
                r.date().format("%d/%m/%Y"),
                r.slot_time()
            ),
        )
    }
}

/// Fire-and-forget front of a [`Notifier`]. `dispatch` never waits; a
/// worker task drains the queue and delivers one notice at a time.
#[derive(Clone)]
pub struct NotificationDispatcher {
    tx: mpsc::Sender<Notification>,
}

impl NotificationDispatcher {
    /// Spawn the delivery worker. Must be called from inside a tokio runtime.
    pub fn spawn(notifier: Arc<dyn Notifier>) -> (Self, JoinHandle<()>) {
        Self::with_capacity(notifier, NOTIFICATION_QUEUE_CAPACITY)
    }

    pub fn with_capacity(notifier: Arc<dyn Notifier>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(deliver_loop(notifier, rx));
        (Self { tx }, handle)
    }

    /// Queue a notice. Dropped, with a warning, when the queue is full or
    /// the worker is gone.
    pub fn dispatch(&self, notification: Notification) {
        match self.tx.try_send(notification) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(n)) => {
                metrics::counter!(crate::observability::NOTIFICATIONS_TOTAL, "status" => "dropped")
                    .increment(1);
                warn!("notification queue full, dropping notice to {}", n.recipient);
            }
            Err(mpsc::error::TrySendError::Closed(n)) => {
                metrics::counter!(crate::observability::NOTIFICATIONS_TOTAL, "status" => "dropped")
                    .increment(1);
                warn!("notification worker stopped, dropping notice to {}", n.recipient);
            }
        }
    }
}

async fn deliver_loop(notifier: Arc<dyn Notifier>, mut rx: mpsc::Receiver<Notification>) {
    while let Some(n) = rx.recv().await {
        match notifier.notify(&n.recipient, &n.subject, &n.body).await {
            Ok(()) => {
                metrics::counter!(crate::observability::NOTIFICATIONS_TOTAL, "status" => "sent")
                    .increment(1);
                debug!("notified {}: {}", n.recipient, n.subject);
            }
            Err(e) => {
                metrics::counter!(crate::observability::NOTIFICATIONS_TOTAL, "status" => "failed")
                    .increment(1);
                warn!("notice to {} not delivered: {e}", n.recipient);
            }
        }
    }
}
