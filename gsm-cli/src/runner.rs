//! CLI runner for common setup and operations.
//!
//! Encapsulates settings loading, logging initialization and bus access
//! to reduce duplication across command handlers.

use std::sync::Arc;
use std::time::Duration;

use gsm::bus::MessageBus;
use gsm::config::Settings;
use gsm::logging::{init_logging, LoggingGuard};
use gsm::rpc::{self, PendingRequest, ReplyEvent};
use tracing::info;

use crate::error::CliError;

/// Identity used on `replyTo` channels of this invocation.
pub const IDENT: &str = "cli";

/// Budget for the initial ack of a client request.
pub const ACK_BUDGET: Duration = Duration::from_secs(30);

/// Budget for following a task to its terminal message.
pub const FOLLOW_BUDGET: Duration = Duration::from_secs(24 * 60 * 60);

/// Runner that manages CLI lifecycle and common operations.
pub struct CliRunner {
    /// Logging guard - keeps logging active while the runner exists.
    #[allow(dead_code)]
    logging_guard: LoggingGuard,
    settings: Settings,
    bus: Arc<MessageBus>,
}

impl CliRunner {
    /// Load settings, initialize logging and open the bus.
    pub fn new(component: &str) -> Result<Self, CliError> {
        let settings = Settings::from_env().map_err(|e| CliError::Config(e.to_string()))?;
        let logging_guard = init_logging(&settings.log_dir(), component)
            .map_err(|e| CliError::LoggingInit(e.to_string()))?;
        let bus = Arc::new(
            MessageBus::new(settings.ipc_dir()).map_err(|e| CliError::Bus(e.to_string()))?,
        );

        info!("GSM v{}", gsm::VERSION);
        info!("GSM CLI: {component} command");

        Ok(Self {
            logging_guard,
            settings,
            bus,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Issue a request and wait for its ack/nack/error.
    pub fn request(
        &self,
        target: &str,
        operation: &str,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> Result<PendingRequest, CliError> {
        rpc::request(&self.bus, IDENT, target, operation, payload).map_err(|e| {
            CliError::Request {
                target: target.to_string(),
                message: e.to_string(),
            }
        })
    }

    /// Follow an acked exchange to its terminal message, printing output
    /// and progress as it streams. Returns the process exit code.
    pub async fn follow_to_end(
        &self,
        target: &str,
        mut pending: PendingRequest,
    ) -> Result<i32, CliError> {
        let terminal = pending
            .await_final(FOLLOW_BUDGET, print_event)
            .await
            .map_err(|e| CliError::Request {
                target: target.to_string(),
                message: e.to_string(),
            })?;
        Ok(print_terminal(&terminal))
    }

    /// Late-attach to an already-running task's channel and follow it.
    pub async fn follow_channel(&self, channel: &str) -> Result<i32, CliError> {
        let mut sub = self.bus.subscribe(&format!("{channel}.#"));
        loop {
            let message = sub
                .recv_timeout(FOLLOW_BUDGET)
                .await
                .map_err(|_| CliError::Request {
                    target: channel.to_string(),
                    message: "timed out following task".to_string(),
                })?
                .ok_or_else(|| CliError::Bus("bus stopped".to_string()))?;
            let suffix = message.topic.rsplit('.').next().unwrap_or_default();
            match suffix {
                "output" => {
                    if let Some(line) = message.payload.get("line").and_then(|v| v.as_str()) {
                        println!("{line}");
                    }
                }
                "progress" => print_progress(&message.payload),
                "finalStatus" => {
                    self.bus.unsubscribe(sub.id);
                    return Ok(print_terminal(&ReplyEvent::FinalStatus(message.payload)));
                }
                "error" => {
                    self.bus.unsubscribe(sub.id);
                    return Ok(print_terminal(&ReplyEvent::Error(message.payload)));
                }
                _ => {}
            }
        }
    }

    /// Shut the bus down before exiting.
    pub async fn finish(self) {
        self.bus.stop_watching().await;
    }
}

fn print_event(event: &ReplyEvent) {
    match event {
        ReplyEvent::Output(line) => println!("{line}"),
        ReplyEvent::Progress(payload) => print_progress(payload),
        _ => {}
    }
}

fn print_progress(payload: &serde_json::Value) {
    let stage = payload.get("stage").and_then(|v| v.as_str()).unwrap_or("?");
    let state = payload
        .get("stateName")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if let Some(percent) = payload.get("percent").and_then(|v| v.as_f64()) {
        println!("[{stage}] {state} {percent:.1}%");
    }
}

fn print_terminal(event: &ReplyEvent) -> i32 {
    match event {
        ReplyEvent::FinalStatus(payload) => {
            let reason = payload
                .get("reason")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            println!("finalStatus: {reason}");
            match reason {
                "completed" | "canceled" => 0,
                _ => 1,
            }
        }
        ReplyEvent::Error(payload) => {
            let message = payload
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            eprintln!("error: {message}");
            1
        }
        _ => 1,
    }
}
