//! In-process publish/subscribe bus.
//!
//! Subjects match exactly. Subscribers without a queue group each receive
//! every message; subscribers sharing a queue group on a subject split the
//! messages between them round-robin, one member per message.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{BusError, BusResult};

/// Prefix for reply subjects handed out by [`MessageBus::new_inbox`].
pub const INBOX_PREFIX: &str = "_INBOX";

pub type SubscriptionId = u64;

/// A message delivered to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub subject: String,
    /// Subject the publisher listens on for replies, if any.
    pub reply_to: Option<String>,
    pub payload: Vec<u8>,
}

/// Receiving end of a subscription.
pub struct Subscription {
    pub id: SubscriptionId,
    pub subject: String,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Subscription {
    /// Wait for the next message. Returns `None` once the subscription has
    /// been removed from the bus.
    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Take a message if one is already queued.
    pub fn try_next(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

struct Subscriber {
    id: SubscriptionId,
    queue: Option<String>,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct Registry {
    next_id: SubscriptionId,
    subjects: HashMap<String, Vec<Subscriber>>,
    /// Round-robin cursor per (subject, queue group).
    cursors: HashMap<(String, String), usize>,
}

/// Cloneable handle to a shared bus.
#[derive(Clone, Default)]
pub struct MessageBus {
    registry: Arc<Mutex<Registry>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        // Registry updates are single-step, so a poisoned lock still holds
        // consistent data.
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to `subject`, optionally as a member of a queue group.
    pub fn subscribe(&self, subject: &str, queue: Option<&str>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self.registry();
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .subjects
            .entry(subject.to_string())
            .or_default()
            .push(Subscriber {
                id,
                queue: queue.map(str::to_string),
                tx,
            });
        debug!(%subject, ?queue, subscription = id, "subscribed");
        Subscription {
            id,
            subject: subject.to_string(),
            rx,
        }
    }

    /// Remove a subscription. Its receiver drains what is queued, then ends.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut registry = self.registry();
        registry.subjects.retain(|_, subs| {
            subs.retain(|s| s.id != id);
            !subs.is_empty()
        });
        trace!(subscription = id, "unsubscribed");
    }

    /// Publish raw bytes. Returns how many subscribers the message reached.
    pub fn publish(&self, subject: &str, payload: Vec<u8>, reply_to: Option<&str>) -> usize {
        let message = Message {
            subject: subject.to_string(),
            reply_to: reply_to.map(str::to_string),
            payload,
        };

        let mut registry = self.registry();
        let Registry {
            subjects, cursors, ..
        } = &mut *registry;

        let Some(subs) = subjects.get_mut(subject) else {
            trace!(%subject, "published with no subscribers");
            return 0;
        };
        // Receivers that were dropped without unsubscribing.
        subs.retain(|s| !s.tx.is_closed());

        let mut delivered = 0;
        let mut groups: HashMap<&str, Vec<&Subscriber>> = HashMap::new();
        for sub in subs.iter() {
            match &sub.queue {
                None => {
                    if sub.tx.send(message.clone()).is_ok() {
                        delivered += 1;
                    }
                }
                Some(queue) => groups.entry(queue.as_str()).or_default().push(sub),
            }
        }

        for (queue, members) in groups {
            let cursor = cursors
                .entry((subject.to_string(), queue.to_string()))
                .or_insert(0);
            let member = members[*cursor % members.len()];
            *cursor = cursor.wrapping_add(1);
            if member.tx.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }

        trace!(%subject, delivered, "published");
        delivered
    }

    /// Serialize `value` as JSON and publish it.
    pub fn publish_json<T: Serialize>(
        &self,
        subject: &str,
        value: &T,
        reply_to: Option<&str>,
    ) -> BusResult<usize> {
        let payload = serde_json::to_vec(value).map_err(|e| BusError::Encode(e.to_string()))?;
        Ok(self.publish(subject, payload, reply_to))
    }

    /// A fresh, unique reply subject.
    pub fn new_inbox(&self) -> String {
        format!("{INBOX_PREFIX}.{}", Uuid::new_v4().simple())
    }

    /// Number of live subscriptions on a subject.
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.registry()
            .subjects
            .get(subject)
            .map(|subs| subs.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }
}
