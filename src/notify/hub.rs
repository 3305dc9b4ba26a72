//! Notification hub — per-job subscriber registry with bounded fan-out.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::JobEvent;
use crate::error::NotifyError;

/// A client's interest in one job. Dropping it releases the slot on the
/// next publish.
#[derive(Debug)]
pub struct Subscription {
    pub client_id: Uuid,
    pub job_id: Uuid,
    pub receiver: mpsc::Receiver<JobEvent>,
}

/// Fans job events out to the subscribers of each job.
///
/// Each subscriber owns a bounded buffer. A subscriber whose buffer is
/// full is disconnected rather than allowed to stall the publisher; it
/// re-syncs by reading the job status.
pub struct NotificationHub {
    subscribers: RwLock<HashMap<Uuid, HashMap<Uuid, mpsc::Sender<JobEvent>>>>,
    buffer: usize,
}

impl NotificationHub {
    pub fn new(buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            subscribers: RwLock::new(HashMap::new()),
            buffer: buffer.max(1),
        })
    }

    /// Register a new subscriber for `job_id`.
    pub async fn subscribe(&self, job_id: Uuid) -> Subscription {
        let (tx, receiver) = mpsc::channel(self.buffer);
        let client_id = Uuid::new_v4();
        self.subscribers
            .write()
            .await
            .entry(job_id)
            .or_default()
            .insert(client_id, tx);
        debug!(job_id = %job_id, client_id = %client_id, "Subscriber registered");
        Subscription {
            client_id,
            job_id,
            receiver,
        }
    }

    /// Remove one subscriber. Returns whether it was registered.
    pub async fn unsubscribe(&self, job_id: Uuid, client_id: Uuid) -> bool {
        let mut subscribers = self.subscribers.write().await;
        let Some(clients) = subscribers.get_mut(&job_id) else {
            return false;
        };
        let removed = clients.remove(&client_id).is_some();
        if clients.is_empty() {
            subscribers.remove(&job_id);
        }
        removed
    }

    /// Deliver `event` to every subscriber of its job without blocking.
    ///
    /// Returns the number of subscribers the event was queued for.
    pub async fn publish(&self, event: JobEvent) -> usize {
        let job_id = event.job_id();
        let mut subscribers = self.subscribers.write().await;
        let Some(clients) = subscribers.get_mut(&job_id) else {
            return 0;
        };

        let mut delivered = 0;
        clients.retain(|client_id, tx| match deliver(*client_id, tx, &event) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(e @ NotifyError::Overflow { .. }) => {
                warn!(job_id = %job_id, error = %e, "Disconnecting slow subscriber");
                false
            }
            Err(e @ NotifyError::Disconnected { .. }) => {
                debug!(job_id = %job_id, error = %e, "Subscriber gone");
                false
            }
        });

        // Dropping the senders closes each receiver after it drains.
        if event.is_terminal() || clients.is_empty() {
            if event.is_terminal() {
                info!(job_id = %job_id, subscribers = delivered, "Terminal event, closing subscriptions");
            }
            subscribers.remove(&job_id);
        }
        delivered
    }

    pub async fn subscriber_count(&self, job_id: Uuid) -> usize {
        self.subscribers
            .read()
            .await
            .get(&job_id)
            .map_or(0, HashMap::len)
    }

    /// Subscribers across all jobs.
    pub async fn total_subscribers(&self) -> usize {
        self.subscribers
            .read()
            .await
            .values()
            .map(HashMap::len)
            .sum()
    }
}

/// Queue `event` for one subscriber without waiting.
fn deliver(
    client_id: Uuid,
    tx: &mpsc::Sender<JobEvent>,
    event: &JobEvent,
) -> Result<(), NotifyError> {
    tx.try_send(event.clone()).map_err(|e| match e {
        mpsc::error::TrySendError::Full(_) => NotifyError::Overflow { client_id },
        mpsc::error::TrySendError::Closed(_) => NotifyError::Disconnected { client_id },
    })
}
