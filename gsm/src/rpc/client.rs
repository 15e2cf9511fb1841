//! Client side of the request/reply exchange.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, trace};

use crate::bus::{BusError, MessageBus, Subscription};
use crate::rpc::{RequestEnvelope, ReplySub, PING_INTERVAL_SECS, READY_UPTIME_SECS};

use super::liveness::PingReply;

/// Errors raised on the client side of an exchange.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("timed out waiting for module '{target}'")]
    ModuleTimeout { target: String },

    #[error("timed out waiting for a reply on '{reply_to}'")]
    ReplyTimeout { reply_to: String },

    #[error("reply stream closed before a terminal message on '{reply_to}'")]
    StreamClosed { reply_to: String },
}

/// A reply received on a request's `replyTo` channel.
#[derive(Debug, Clone)]
pub enum ReplyEvent {
    Ack(serde_json::Value),
    Nack(serde_json::Value),
    Output(String),
    Progress(serde_json::Value),
    Status(serde_json::Value),
    FinalStatus(serde_json::Value),
    Error(serde_json::Value),
}

impl ReplyEvent {
    /// Whether this event closes the exchange.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReplyEvent::FinalStatus(_) | ReplyEvent::Error(_))
    }

    fn from_topic(topic: &str, payload: serde_json::Value) -> Option<Self> {
        let sub = ReplySub::parse(topic.rsplit('.').next()?)?;
        Some(match sub {
            ReplySub::Ack => ReplyEvent::Ack(payload),
            ReplySub::Nack => ReplyEvent::Nack(payload),
            ReplySub::Error => ReplyEvent::Error(payload),
            ReplySub::Progress => ReplyEvent::Progress(payload),
            ReplySub::Status => ReplyEvent::Status(payload),
            ReplySub::FinalStatus => ReplyEvent::FinalStatus(payload),
            ReplySub::Output => ReplyEvent::Output(
                payload
                    .get("line")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            ),
        })
    }
}

/// An issued request with its reply subscription.
///
/// The subscription is established before the request is published, so no
/// reply can be lost to the bus's at-subscription-time delivery window.
pub struct PendingRequest {
    bus: Arc<MessageBus>,
    envelope: RequestEnvelope,
    sub: Subscription,
}

impl PendingRequest {
    /// The request's reply prefix.
    pub fn reply_to(&self) -> &str {
        &self.envelope.reply_to
    }

    /// Receive the next reply event, skipping unparseable traffic.
    pub async fn next_event(&mut self, timeout: Duration) -> Result<ReplyEvent, RpcError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or_else(|| RpcError::ReplyTimeout {
                    reply_to: self.envelope.reply_to.clone(),
                })?;
            let message = self
                .sub
                .recv_timeout(remaining)
                .await
                .map_err(|_| RpcError::ReplyTimeout {
                    reply_to: self.envelope.reply_to.clone(),
                })?
                .ok_or_else(|| RpcError::StreamClosed {
                    reply_to: self.envelope.reply_to.clone(),
                })?;
            if let Some(event) = ReplyEvent::from_topic(&message.topic, message.payload) {
                return Ok(event);
            }
            trace!(topic = %message.topic, "ignoring unknown reply sub-topic");
        }
    }

    /// Wait for the initial `ack`/`nack`/`error`.
    ///
    /// Progress traffic cannot precede the ack per the exchange contract,
    /// but anything out of order is skipped rather than treated as fatal.
    pub async fn await_ack(&mut self, timeout: Duration) -> Result<ReplyEvent, RpcError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or_else(|| RpcError::ReplyTimeout {
                    reply_to: self.envelope.reply_to.clone(),
                })?;
            let event = self.next_event(remaining).await?;
            match event {
                ReplyEvent::Ack(_) | ReplyEvent::Nack(_) | ReplyEvent::Error(_) => {
                    return Ok(event)
                }
                other => trace!(?other, "skipping pre-ack event"),
            }
        }
    }

    /// Drain events until the terminal message, invoking `on_event` for
    /// each intermediate one.
    pub async fn await_final<F: FnMut(&ReplyEvent)>(
        &mut self,
        timeout: Duration,
        mut on_event: F,
    ) -> Result<ReplyEvent, RpcError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or_else(|| RpcError::ReplyTimeout {
                    reply_to: self.envelope.reply_to.clone(),
                })?;
            let event = self.next_event(remaining).await?;
            if event.is_terminal() {
                self.bus.unsubscribe(self.sub.id);
                return Ok(event);
            }
            on_event(&event);
        }
    }

    /// Unsubscribe without waiting for a terminal message.
    pub fn abandon(self) {
        self.bus.unsubscribe(self.sub.id);
    }
}

/// Publish a request on `<target>.<operation>` and return the pending
/// exchange.
pub fn request(
    bus: &Arc<MessageBus>,
    requester: &str,
    target: &str,
    operation: &str,
    payload: serde_json::Map<String, serde_json::Value>,
) -> Result<PendingRequest, RpcError> {
    let envelope = RequestEnvelope::new(requester, payload);
    // Subscribe first: the bus has no durable queue, so a reply published
    // before the subscription exists would be lost.
    let sub = bus.subscribe(&format!("{}.#", envelope.reply_to));
    debug!(module = target, operation, reply_to = %envelope.reply_to, "issuing request");
    bus.publish(
        &format!("{target}.{operation}"),
        serde_json::to_value(&envelope).map_err(BusError::from)?,
    )?;
    Ok(PendingRequest {
        bus: Arc::clone(bus),
        envelope,
        sub,
    })
}

/// Ping `target` every second until it reports an uptime of at least five
/// seconds, or fail after `timeout`.
pub async fn wait_for_module(
    bus: &Arc<MessageBus>,
    requester: &str,
    target: &str,
    timeout: Duration,
) -> Result<PingReply, RpcError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if tokio::time::Instant::now() >= deadline {
            return Err(RpcError::ModuleTimeout {
                target: target.to_string(),
            });
        }

        let envelope = RequestEnvelope::new(requester, serde_json::Map::new());
        let mut sub = bus.subscribe(&envelope.reply_to);
        bus.publish(
            &format!("{target}.ping"),
            serde_json::to_value(&envelope).map_err(BusError::from)?,
        )?;

        let reply = sub
            .recv_timeout(Duration::from_secs(PING_INTERVAL_SECS))
            .await;
        bus.unsubscribe(sub.id);

        match reply {
            Ok(Some(message)) => {
                if let Ok(ping) = serde_json::from_value::<PingReply>(message.payload) {
                    if ping.uptime >= READY_UPTIME_SECS as f64 {
                        debug!(module = target, uptime = ping.uptime, "module ready");
                        return Ok(ping);
                    }
                    trace!(module = target, uptime = ping.uptime, "module alive but not ready");
                }
            }
            Ok(None) => {
                return Err(RpcError::StreamClosed {
                    reply_to: envelope.reply_to,
                })
            }
            Err(_elapsed) => trace!(module = target, "no ping reply this interval"),
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Convenience payload constructor for request bodies.
pub fn payload(fields: &[(&str, serde_json::Value)]) -> serde_json::Map<String, serde_json::Value> {
    let mut map = serde_json::Map::new();
    for (key, value) in fields {
        map.insert((*key).to_string(), value.clone());
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_request_reply_exchange() {
        let tmp = tempfile::tempdir().unwrap();
        let bus = Arc::new(MessageBus::new(tmp.path().join("ipc")).unwrap());

        // Fake server: ack, two outputs, then finalStatus.
        let server_bus = Arc::clone(&bus);
        let mut server_sub = bus.subscribe("demo.work");
        tokio::spawn(async move {
            let message = server_sub.recv().await.unwrap();
            let envelope = RequestEnvelope::from_value(&message.payload).unwrap();
            server_bus
                .publish(
                    &envelope.reply_topic(ReplySub::Ack),
                    json!({"subscribeTo": envelope.reply_to}),
                )
                .unwrap();
            server_bus
                .publish(&envelope.reply_topic(ReplySub::Output), json!({"line": "one"}))
                .unwrap();
            server_bus
                .publish(&envelope.reply_topic(ReplySub::Output), json!({"line": "two"}))
                .unwrap();
            server_bus
                .publish(
                    &envelope.reply_topic(ReplySub::FinalStatus),
                    json!({"reason": "completed"}),
                )
                .unwrap();
        });

        let mut pending = request(&bus, "tester", "demo", "work", payload(&[])).unwrap();
        let ack = pending.await_ack(Duration::from_secs(5)).await.unwrap();
        assert!(matches!(ack, ReplyEvent::Ack(_)));

        let mut lines = Vec::new();
        let terminal = pending
            .await_final(Duration::from_secs(5), |event| {
                if let ReplyEvent::Output(line) = event {
                    lines.push(line.clone());
                }
            })
            .await
            .unwrap();

        assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);
        match terminal {
            ReplyEvent::FinalStatus(status) => {
                assert_eq!(status["reason"], json!("completed"));
            }
            other => panic!("expected finalStatus, got {other:?}"),
        }

        bus.stop_watching().await;
    }

    #[tokio::test]
    async fn test_wait_for_module_times_out_when_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let bus = Arc::new(MessageBus::new(tmp.path().join("ipc")).unwrap());

        let err = wait_for_module(&bus, "tester", "ghostManager", Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::ModuleTimeout { .. }));

        bus.stop_watching().await;
    }

    #[tokio::test]
    async fn test_wait_for_module_ignores_young_module() {
        use crate::rpc::{Liveness, Pinger};

        let tmp = tempfile::tempdir().unwrap();
        let bus = Arc::new(MessageBus::new(tmp.path().join("ipc")).unwrap());
        // Liveness was just created, so uptime < 5 s: never ready here.
        let liveness = Liveness::new("youngManager");
        let pinger = Pinger::spawn(Arc::clone(&bus), liveness);

        let err = wait_for_module(&bus, "tester", "youngManager", Duration::from_millis(1500))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::ModuleTimeout { .. }));

        pinger.stop().await;
        bus.stop_watching().await;
    }
}
