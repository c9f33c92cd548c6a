//! keel-bus — the message bus the control plane talks to the fleet over.
//!
//! [`MessageBus`] is an in-process publish/subscribe bus with NATS-style
//! semantics: exact-match subjects, queue groups that deliver each message
//! to one member, and unique reply inboxes for request/response.
//!
//! [`Correlator`] sends one request and matches a sequence of asynchronous
//! responses to caller-supplied handlers, each with its own timeout.

pub mod bus;
pub mod correlator;
pub mod error;

pub use bus::{Message, MessageBus, Subscription, SubscriptionId};
pub use correlator::Correlator;
pub use error::{BusError, BusResult, CorrelationError};
