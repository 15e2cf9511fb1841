//! GSM - dedicated game server management for a single host
//!
//! This library contains the building blocks of the GSM manager processes:
//! a lockfile-based mutex layer, a filesystem-backed message bus, the
//! request/reply conventions on top of it, a generic task supervisor, and
//! the drivers for downloads (Steam content tool), configuration
//! repositories (git), overlay mounts and the game process itself.
//!
//! # High-Level Shape
//!
//! Several cooperating long-lived processes run on one host, one per
//! [`manager`] module, coordinating exclusively through the [`lock`]
//! directory and the [`bus`]. The [`lifecycle`] coordinator sequences
//! them for one instance:
//!
//! ```text
//! downloadManager ──► configManager ──► overlayManager ──► gameManager
//!    base files       config layers       merged view       game process
//! ```

pub mod bus;
pub mod config;
pub mod fetch;
pub mod game;
pub mod lifecycle;
pub mod lock;
pub mod logging;
pub mod manager;
pub mod manifest;
pub mod overlay;
pub mod panic;
pub mod repo;
pub mod rpc;
pub mod signals;
pub mod steam;
pub mod task;

/// Version of the GSM library and CLI.
///
/// This is synchronized across all components in the workspace.
/// The version is defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
