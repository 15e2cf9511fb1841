//! CLI error handling with user-friendly messages.
//!
//! Centralizes error handling for the CLI, providing consistent formatting
//! and appropriate exit codes.

use std::fmt;
use std::process;

/// CLI-specific errors with user-friendly messages.
#[derive(Debug)]
pub enum CliError {
    /// Environment configuration is unusable
    Config(String),
    /// Failed to initialize logging
    LoggingInit(String),
    /// Bus setup or publish failed
    Bus(String),
    /// A request to a manager failed or got no reply
    Request { target: String, message: String },
    /// A manager refused to start (module lock held)
    ModuleLock(String),
}

impl CliError {
    /// Exit the process with an appropriate error message and code.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {self}");

        match self {
            CliError::Request { target, .. } => {
                eprintln!();
                eprintln!("Is the {target} process running on this host?");
                eprintln!("Start it with: gsm run <manager>");
            }
            CliError::ModuleLock(_) => {
                eprintln!();
                eprintln!("Another instance of this manager already runs here.");
                eprintln!("A stale lock from a crashed process can be removed from the lock directory.");
            }
            _ => {}
        }

        process::exit(self.code())
    }

    fn code(&self) -> i32 {
        match self {
            CliError::ModuleLock(_) => 1,
            _ => 1,
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Config(msg) => write!(f, "Configuration error: {msg}"),
            CliError::LoggingInit(msg) => write!(f, "Failed to initialize logging: {msg}"),
            CliError::Bus(msg) => write!(f, "Message bus error: {msg}"),
            CliError::Request { target, message } => {
                write!(f, "Request to {target} failed: {message}")
            }
            CliError::ModuleLock(msg) => write!(f, "Manager already running: {msg}"),
        }
    }
}

impl std::error::Error for CliError {}
