//! Request/reply conventions on top of the message bus.
//!
//! A request is published on `<target>.<operation>` with a unique `replyTo`
//! topic prefix; every follow-up from the server is published under
//! `<replyTo>.<sub>`:
//!
//! 1. `ack` (with `subscribeTo`) or `nack` (with the reason; for a
//!    duplicate request, the in-flight task's `subscribeTo`)
//! 2. any number of `output` (raw lines) and `progress` (structured)
//! 3. exactly one terminal message: `finalStatus` or `error`
//!
//! The module also carries the liveness convention: every manager answers
//! `<module>.ping` and `_broadcast.ping`, and a peer counts as *ready*
//! once its reported uptime reaches five seconds.

mod client;
mod envelope;
mod liveness;

pub use client::{payload, request, wait_for_module, PendingRequest, ReplyEvent, RpcError};
pub use envelope::{ReplySub, RequestEnvelope};
pub use liveness::{Liveness, LivenessStatus, PingReply, Pinger};

/// Module readiness threshold: reported uptime must reach this value.
pub const READY_UPTIME_SECS: u64 = 5;

/// Cadence of readiness pings.
pub const PING_INTERVAL_SECS: u64 = 1;
