//! Process-wide exit-signal handling.
//!
//! Each manager installs one [`SignalHub`]. It owns two things:
//!
//! - a shutdown token the manager's loops watch for clean teardown, and
//! - a single *forward target* slot: the PID of the currently active
//!   external child (the content tool, the game process). On SIGINT or
//!   SIGTERM the signal is relayed to that child.
//!
//! The slot is registered once and **replaced** across successive tasks,
//! never accumulated, so a long-lived manager cannot leak listeners over
//! many downloads.
//!
//! Once a clean shutdown is initiated, a watchdog forces the process to
//! exit after [`FORCE_EXIT_AFTER_SECS`](crate::config::FORCE_EXIT_AFTER_SECS)
//! seconds in case teardown wedges.

use std::sync::{Arc, Mutex};

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::FORCE_EXIT_AFTER_SECS;

/// Shared exit-signal dispatcher.
#[derive(Clone, Debug)]
pub struct SignalHub {
    shutdown: CancellationToken,
    forward_target: Arc<Mutex<Option<u32>>>,
    /// Whether the force-exit watchdog may terminate this process.
    watchdog_armed: bool,
}

impl SignalHub {
    /// Create the hub and start listening for SIGINT/SIGTERM.
    ///
    /// # Errors
    ///
    /// Fails when the signal handlers cannot be registered.
    pub fn install() -> std::io::Result<Self> {
        let hub = Self {
            shutdown: CancellationToken::new(),
            forward_target: Arc::new(Mutex::new(None)),
            watchdog_armed: true,
        };

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let relay = hub.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }
            relay.relay_to_child();
            relay.begin_shutdown();
        });

        Ok(hub)
    }

    /// A hub that never fires and never force-exits, for tests and
    /// embedded use.
    pub fn disconnected() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            forward_target: Arc::new(Mutex::new(None)),
            watchdog_armed: false,
        }
    }

    /// Token cancelled when shutdown starts.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Register the PID the next exit signal is relayed to, replacing any
    /// previous target.
    pub fn set_forward_target(&self, pid: u32) {
        *self
            .forward_target
            .lock()
            .expect("forward target poisoned") = Some(pid);
    }

    /// Clear the relay target (the child exited or was reaped).
    pub fn clear_forward_target(&self) {
        *self
            .forward_target
            .lock()
            .expect("forward target poisoned") = None;
    }

    /// Currently registered relay target.
    pub fn forward_target(&self) -> Option<u32> {
        *self
            .forward_target
            .lock()
            .expect("forward target poisoned")
    }

    /// Start a clean shutdown and arm the force-exit watchdog.
    pub fn begin_shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        if self.watchdog_armed {
            tokio::spawn(async {
                tokio::time::sleep(std::time::Duration::from_secs(FORCE_EXIT_AFTER_SECS)).await;
                warn!("clean shutdown exceeded {FORCE_EXIT_AFTER_SECS}s, forcing exit");
                std::process::exit(1);
            });
        }
    }

    fn relay_to_child(&self) {
        if let Some(pid) = self.forward_target() {
            info!(pid, "relaying termination signal to child");
            // SAFETY: plain kill(2) with SIGTERM.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_target_is_replaced_not_accumulated() {
        let hub = SignalHub::disconnected();
        assert_eq!(hub.forward_target(), None);

        hub.set_forward_target(100);
        assert_eq!(hub.forward_target(), Some(100));

        // A later task replaces the slot.
        hub.set_forward_target(200);
        assert_eq!(hub.forward_target(), Some(200));

        hub.clear_forward_target();
        assert_eq!(hub.forward_target(), None);
    }

    #[test]
    fn test_shutdown_token_starts_live() {
        let hub = SignalHub::disconnected();
        assert!(!hub.shutdown_token().is_cancelled());
    }
}
