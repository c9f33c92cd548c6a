//! Relays fleet commands from the bus to the fleet's HTTP command receiver.
//!
//! Each command is POSTed once to `http://{command_endpoint}/{subject}` with
//! the bus payload as its JSON body. A failed delivery is logged and
//! dropped; the health monitor reports the resulting drift and the
//! reconciler re-issues the command.

use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST, USER_AGENT};
use http::{Method, Request, StatusCode};
use http_body_util::Full;
use hyper_util::rt::TokioIo;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use keel_bus::{Message, MessageBus};
use keel_core::config::FleetConfig;

use crate::error::ForwardError;

pub struct FleetForwarder {
    bus: MessageBus,
    fleet: FleetConfig,
}

impl FleetForwarder {
    pub fn new(bus: MessageBus, fleet: FleetConfig) -> Self {
        Self { bus, fleet }
    }

    /// Follow the fleet command subjects until shutdown is signalled.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut subs = [
            self.bus.subscribe(&self.fleet.start_subject, None),
            self.bus.subscribe(&self.fleet.stop_instances_subject, None),
            self.bus.subscribe(&self.fleet.stop_subject, None),
        ];
        match &self.fleet.command_endpoint {
            Some(endpoint) => info!(%endpoint, "forwarding fleet commands"),
            None => info!("no fleet command endpoint configured, logging commands only"),
        }

        {
            let [start, stop_instances, stop] = &mut subs;
            loop {
                let msg = tokio::select! {
                    Some(msg) = start.next() => msg,
                    Some(msg) = stop_instances.next() => msg,
                    Some(msg) = stop.next() => msg,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("fleet forwarder shutting down");
                            break;
                        }
                        continue;
                    }
                    else => break,
                };
                self.forward(&msg).await;
            }
        }

        for sub in &subs {
            self.bus.unsubscribe(sub.id);
        }
    }

    async fn forward(&self, msg: &Message) {
        let Some(endpoint) = &self.fleet.command_endpoint else {
            debug!(
                subject = %msg.subject,
                payload = %String::from_utf8_lossy(&msg.payload),
                "fleet command"
            );
            return;
        };

        let timeout = Duration::from_millis(self.fleet.command_timeout_ms);
        match post_command(endpoint, &msg.subject, &msg.payload, timeout).await {
            Ok(status) if status.is_success() => {
                debug!(subject = %msg.subject, %status, "fleet command delivered");
            }
            Ok(status) => {
                warn!(subject = %msg.subject, %status, "fleet rejected command");
            }
            Err(e) => {
                warn!(subject = %msg.subject, error = %e, "fleet command not delivered");
            }
        }
    }
}

/// POST one command payload to `http://{endpoint}/{subject}`.
pub async fn post_command(
    endpoint: &str,
    subject: &str,
    payload: &[u8],
    timeout: Duration,
) -> Result<StatusCode, ForwardError> {
    let uri = format!("http://{endpoint}/{subject}");
    let req = Request::builder()
        .method(Method::POST)
        .uri(&uri)
        .header(HOST, endpoint)
        .header(CONTENT_TYPE, "application/json")
        .header(USER_AGENT, "keel-gateway/0.1")
        .body(Full::new(Bytes::copy_from_slice(payload)))?;

    let exchange = async {
        let stream = tokio::net::TcpStream::connect(endpoint)
            .await
            .map_err(|source| ForwardError::Connect {
                endpoint: endpoint.to_string(),
                source,
            })?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(ForwardError::Handshake)?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let resp = sender.send_request(req).await.map_err(ForwardError::Request)?;
        Ok::<_, ForwardError>(resp.status())
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| ForwardError::Timeout(timeout))?
}
