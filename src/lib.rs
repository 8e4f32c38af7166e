//! Host process for the precise code-intel index queue.
//!
//! The services themselves live in `codeintel_queue`; this crate loads the
//! daemon configuration and wires the services onto a shared store.

pub mod cli;
pub mod config;
pub mod daemon;

pub use config::DaemonConfig;
pub use daemon::Daemon;
