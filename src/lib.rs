//! keyloom: a hierarchical hotkey daemon
//!
//! Key chords are grabbed from a windowing backend and compiled into
//! nested trigger levels; a match either runs an action (a detached
//! command, a consulted child process, or a batch of window commands)
//! or descends into a child level. Everything runs single-threaded on
//! a `poll(2)` event loop; a Unix control socket speaks the same
//! command protocol that consulted children do.
//!
//! The modules mirror the daemon's seams: [`events`] is the loop,
//! [`hotkey`] the modifier algebra and trigger compilation, [`wm`] the
//! backend trait with its headless implementation, [`ipc`] the wire
//! protocol, [`actions`] the execution layer, [`config`] the TOML
//! model, [`lifecycle`] signal-driven shutdown.

pub mod actions;
pub mod config;
pub mod events;
pub mod hotkey;
pub mod ipc;
pub mod lifecycle;
pub mod wm;

pub use actions::{Action, DaemonCtx};
pub use config::Config;
pub use events::{Event, EventLoop, Watch};
pub use hotkey::{Key, Keysym, ListenOutcome, Listener, ModMask, TriggerSet};
pub use wm::{HeadlessWm, WindowId, WindowSystem};
