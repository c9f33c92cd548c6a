//! Request/multi-response correlation.
//!
//! A [`Correlator`] publishes one request with a private reply inbox and
//! hands each response that arrives on the inbox to the next registered
//! handler. Every handler carries its own timeout.
//!
//! # Handler order
//!
//! Handlers are kept on a stack. Each call to [`Correlator::on_response`]
//! slides the new handler beneath the ones already registered, and responses
//! pop from the top. The net effect is registration order: after
//!
//! ```text
//! on_response(5s, a)
//! on_response(10s, b)
//! ```
//!
//! the first response goes to `a` (which must arrive within 5s of the
//! send) and the second to `b` (within 10s of the first response).
//!
//! # Termination
//!
//! - the last handler received its response: the inbox is released;
//! - a handler's timeout fires: the inbox is released, that handler gets
//!   [`CorrelationError::Timeout`], handlers beneath it are dropped;
//! - [`Correlator::cancel`]: the inbox is released, remaining handlers are
//!   dropped without being called.

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::bus::{MessageBus, Subscription};
use crate::error::CorrelationError;

type Handler<T> = Box<dyn FnOnce(Result<T, CorrelationError>) + Send>;

struct Pending<T> {
    timeout: Duration,
    handler: Handler<T>,
}

enum Phase {
    Registering,
    Sent { cancel: watch::Sender<bool> },
}

/// One outstanding request and its response handlers.
pub struct Correlator<T> {
    bus: MessageBus,
    subject: String,
    /// Top of the stack is the last element.
    pending: Vec<Pending<T>>,
    phase: Phase,
}

impl<T> Correlator<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub fn new(bus: MessageBus, subject: impl Into<String>) -> Self {
        Self {
            bus,
            subject: subject.into(),
            pending: Vec::new(),
            phase: Phase::Registering,
        }
    }

    /// Register a handler for the next unclaimed response.
    ///
    /// Handlers run on the runtime's worker and must not block.
    pub fn on_response<F>(&mut self, timeout: Duration, handler: F) -> Result<(), CorrelationError>
    where
        F: FnOnce(Result<T, CorrelationError>) + Send + 'static,
    {
        if matches!(self.phase, Phase::Sent { .. }) {
            return Err(CorrelationError::InvalidUsage(
                "handlers must be registered before send".to_string(),
            ));
        }
        self.pending.insert(
            0,
            Pending {
                timeout,
                handler: Box::new(handler),
            },
        );
        Ok(())
    }

    /// Publish the request and start waiting for responses.
    ///
    /// Must be called from within a tokio runtime.
    pub fn send<P: Serialize>(&mut self, payload: &P) -> Result<(), CorrelationError> {
        if matches!(self.phase, Phase::Sent { .. }) {
            return Err(CorrelationError::InvalidUsage("request already sent".to_string()));
        }
        if self.pending.is_empty() {
            return Err(CorrelationError::InvalidUsage(
                "no response handlers registered".to_string(),
            ));
        }
        let body = serde_json::to_vec(payload).map_err(|e| CorrelationError::Encode(e.to_string()))?;

        let inbox = self.bus.new_inbox();
        let replies = self.bus.subscribe(&inbox, None);
        let (cancel, cancelled) = watch::channel(false);
        let pending = std::mem::take(&mut self.pending);

        debug!(subject = %self.subject, %inbox, handlers = pending.len(), "sending correlated request");
        tokio::spawn(drive(self.bus.clone(), replies, pending, cancelled));
        self.bus.publish(&self.subject, body, Some(&inbox));

        self.phase = Phase::Sent { cancel };
        Ok(())
    }

    /// Stop listening. Remaining handlers are never called.
    pub fn cancel(&mut self) -> Result<(), CorrelationError> {
        match &self.phase {
            Phase::Registering => Err(CorrelationError::InvalidUsage(
                "cannot cancel a request that was not sent".to_string(),
            )),
            Phase::Sent { cancel } => {
                let _ = cancel.send(true);
                Ok(())
            }
        }
    }
}

async fn drive<T: DeserializeOwned>(
    bus: MessageBus,
    mut replies: Subscription,
    mut pending: Vec<Pending<T>>,
    mut cancelled: watch::Receiver<bool>,
) {
    while let Some(Pending { timeout, handler }) = pending.pop() {
        tokio::select! {
            biased;

            _ = wait_cancelled(&mut cancelled) => {
                debug!(inbox = %replies.subject, dropped = pending.len() + 1, "correlation cancelled");
                break;
            }

            reply = replies.next() => match reply {
                Some(msg) => {
                    let parsed = serde_json::from_slice::<T>(&msg.payload)
                        .map_err(|e| CorrelationError::Parse(e.to_string()));
                    if let Err(e) = &parsed {
                        warn!(inbox = %replies.subject, error = %e, "unparseable response");
                    }
                    handler(parsed);
                }
                None => {
                    handler(Err(CorrelationError::Closed));
                    break;
                }
            },

            _ = tokio::time::sleep(timeout) => {
                bus.unsubscribe(replies.id);
                debug!(inbox = %replies.subject, ?timeout, "correlation timed out");
                handler(Err(CorrelationError::Timeout(timeout)));
                return;
            }
        }
    }
    bus.unsubscribe(replies.id);
}

/// Resolves once `cancel` has been called. Dropping the correlator without
/// cancelling leaves the request running.
async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
