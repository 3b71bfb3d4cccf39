//! Event types for the cooperative dispatch loop
//!
//! Every occurrence the loop can deliver is one of three kinds:
//! readiness to read, readiness to write, or an idle timeout. Each
//! kind carries only its typed fields and has an explicit match rule.

use std::os::fd::RawFd;
use std::time::Duration;

pub mod reactor;
pub mod waiter;

pub use reactor::{EventLoop, Token};
pub use waiter::Waiter;

/// An occurrence delivered to a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The descriptor has bytes (or EOF) to read
    Readable(RawFd),

    /// The descriptor accepts writes
    Writable(RawFd),

    /// The wait timed out with nothing ready
    Idle,
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Readable(fd) => write!(f, "READABLE(fd={})", fd),
            Event::Writable(fd) => write!(f, "WRITABLE(fd={})", fd),
            Event::Idle => write!(f, "IDLE"),
        }
    }
}

/// What a registered handler subscribes to.
///
/// Fd kinds match an [`Event`] of the same kind with an equal
/// descriptor; an idle watch matches every [`Event::Idle`] and carries
/// the period at which the handler wants to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Watch {
    /// Dispatch when the descriptor is readable
    Readable(RawFd),

    /// Dispatch when the descriptor is writable
    Writable(RawFd),

    /// Dispatch on idle passes, at most once per period
    Idle(Duration),
}

impl Watch {
    /// Whether an event should be delivered to a handler holding this watch.
    pub fn matches(&self, event: &Event) -> bool {
        match (self, event) {
            (Watch::Readable(a), Event::Readable(b)) => a == b,
            (Watch::Writable(a), Event::Writable(b)) => a == b,
            (Watch::Idle(_), Event::Idle) => true,
            _ => false,
        }
    }

    /// The watched descriptor, if this is an fd watch.
    pub fn fd(&self) -> Option<RawFd> {
        match self {
            Watch::Readable(fd) | Watch::Writable(fd) => Some(*fd),
            Watch::Idle(_) => None,
        }
    }

    /// The idle period, if this is an idle watch.
    pub fn period(&self) -> Option<Duration> {
        match self {
            Watch::Idle(p) => Some(*p),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fd_watch_matches_same_fd_only() {
        let watch = Watch::Readable(3);
        assert!(watch.matches(&Event::Readable(3)));
        assert!(!watch.matches(&Event::Readable(4)));
        assert!(!watch.matches(&Event::Writable(3)));
        assert!(!watch.matches(&Event::Idle));
    }

    #[test]
    fn test_idle_watch_matches_any_idle() {
        let watch = Watch::Idle(Duration::from_secs(4));
        assert!(watch.matches(&Event::Idle));
        assert!(!watch.matches(&Event::Readable(0)));
    }

    #[test]
    fn test_watch_accessors() {
        assert_eq!(Watch::Writable(7).fd(), Some(7));
        assert_eq!(Watch::Idle(Duration::from_secs(1)).fd(), None);
        assert_eq!(
            Watch::Idle(Duration::from_secs(1)).period(),
            Some(Duration::from_secs(1))
        );
        assert_eq!(Watch::Readable(7).period(), None);
    }
}
