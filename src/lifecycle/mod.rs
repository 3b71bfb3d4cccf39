//! Daemon lifecycle: signal-driven shutdown.

pub mod shutdown;

pub use shutdown::{install, ShutdownFlag};
