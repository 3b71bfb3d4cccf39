//! Cooperative single-threaded event loop
//!
//! One logical thread owns every descriptor in the process and
//! multiplexes them with `poll(2)`. Handlers run to completion and are
//! expected never to block; anything long-running belongs in a child
//! process whose pipes are registered here like any other descriptor.

use std::os::fd::{BorrowedFd, RawFd};
use std::time::Instant;

use anyhow::{bail, Result};
use rustix::event::{poll, PollFd, PollFlags};
use rustix::io::Errno;
use tracing::{debug, trace, warn};

use super::{Event, Watch};

/// Handler invoked for events matching its watch. Dispatch hands the
/// handler the loop itself, so it can register, unregister, and quit.
pub type Handler = Box<dyn FnMut(&Event, &mut EventLoop) -> Result<()>>;

/// Opaque registration id. Never reused within one loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Idle,
    Running,
    Quitting,
}

struct Entry {
    token: Token,
    watch: Watch,
    /// Taken out for the duration of a dispatch, put back afterwards
    /// unless the entry was unregistered meanwhile.
    handler: Option<Handler>,
    last_idle: Instant,
}

/// Ordered handler registry plus the dispatch loop itself.
///
/// Within a pass, readable events are dispatched before writable ones,
/// each to the first handler (in registration order) whose watch
/// matches. A pass with nothing ready dispatches [`Event::Idle`] to
/// every idle handler whose period has elapsed.
pub struct EventLoop {
    entries: Vec<Entry>,
    state: LoopState,
    next_token: u64,
}

impl EventLoop {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            state: LoopState::Idle,
            next_token: 0,
        }
    }

    /// Register a handler. Registrations made while a pass is being
    /// dispatched take effect the following pass.
    pub fn register<F>(&mut self, watch: Watch, handler: F) -> Token
    where
        F: FnMut(&Event, &mut EventLoop) -> Result<()> + 'static,
    {
        let token = Token(self.next_token);
        self.next_token += 1;
        trace!(?token, ?watch, "handler registered");
        self.entries.push(Entry {
            token,
            watch,
            handler: Some(Box::new(handler)),
            last_idle: Instant::now(),
        });
        token
    }

    /// Remove a registration. Safe to call from the handler being
    /// dispatched, for itself or for any other entry.
    pub fn unregister(&mut self, token: Token) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.token != token);
        let removed = self.entries.len() != before;
        if removed {
            trace!(?token, "handler unregistered");
        }
        removed
    }

    /// Remove the first registration with an identical watch.
    pub fn unregister_watch(&mut self, watch: &Watch) -> bool {
        match self.entries.iter().position(|e| e.watch == *watch) {
            Some(idx) => {
                let token = self.entries[idx].token;
                self.entries.remove(idx);
                trace!(?token, ?watch, "handler unregistered by watch");
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, token: Token) -> bool {
        self.entries.iter().any(|e| e.token == token)
    }

    pub fn handler_count(&self) -> usize {
        self.entries.len()
    }

    /// Request exit: the running pass completes, then `run()` returns.
    /// Outside `run()` this is a no-op; every run starts fresh.
    pub fn quit(&mut self) {
        debug!("loop quit requested");
        self.state = LoopState::Quitting;
    }

    /// Dispatch one event to the first matching handler. Returns whether
    /// any handler was invoked. This is the same path `run()` uses and
    /// lets callers drive handlers with synthetic events.
    pub fn dispatch(&mut self, event: &Event) -> Result<bool> {
        self.dispatch_limited(event, u64::MAX)
    }

    /// Wait for and dispatch events until `quit()`.
    ///
    /// The wait bound is the GCD of the active idle periods; with no
    /// idle handlers the wait is unbounded. `EINTR` is a normal wakeup.
    /// A handler error ends the run after cleanup of the loop state;
    /// handlers that must survive their own failures catch them.
    pub fn run(&mut self) -> Result<()> {
        if self.state == LoopState::Running {
            bail!("event loop is already running");
        }
        self.state = LoopState::Running;
        let result = self.run_inner();
        self.state = LoopState::Idle;
        result
    }

    fn run_inner(&mut self) -> Result<()> {
        loop {
            if self.state == LoopState::Quitting {
                return Ok(());
            }
            // Entries added during this pass get tokens >= this bound
            // and are not eligible until the next pass.
            let pass_bound = self.next_token;

            let mut fds: Vec<PollFd> = Vec::new();
            let mut meta: Vec<(RawFd, bool)> = Vec::new();
            for entry in &self.entries {
                let (fd, writable) = match entry.watch {
                    Watch::Readable(fd) if fd >= 0 => (fd, false),
                    Watch::Writable(fd) if fd >= 0 => (fd, true),
                    _ => continue,
                };
                // The registry stores raw descriptors; the owning
                // handler keeps them open for as long as it stays
                // registered.
                let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
                let flags = if writable {
                    PollFlags::OUT
                } else {
                    PollFlags::IN
                };
                fds.push(PollFd::from_borrowed_fd(borrowed, flags));
                meta.push((fd, writable));
            }

            match poll(&mut fds, self.idle_timeout_ms()) {
                Ok(_) => {}
                Err(Errno::INTR) => {
                    trace!("poll interrupted");
                    continue;
                }
                Err(e) => return Err(std::io::Error::from(e).into()),
            }

            let mut ready_read: Vec<RawFd> = Vec::new();
            let mut ready_write: Vec<RawFd> = Vec::new();
            for (pfd, (fd, writable)) in fds.iter().zip(&meta) {
                let revents = pfd.revents();
                if revents.is_empty() {
                    continue;
                }
                // HUP/ERR/NVAL are delivered as readiness so the owning
                // handler observes the failure and unregisters.
                let gone = PollFlags::ERR | PollFlags::HUP | PollFlags::NVAL;
                if *writable {
                    if revents.intersects(PollFlags::OUT | gone) && !ready_write.contains(fd) {
                        ready_write.push(*fd);
                    }
                } else if revents.intersects(PollFlags::IN | gone) && !ready_read.contains(fd) {
                    ready_read.push(*fd);
                }
            }
            drop(fds);

            if ready_read.is_empty() && ready_write.is_empty() {
                self.dispatch_idle(pass_bound)?;
            } else {
                for fd in ready_read {
                    self.dispatch_limited(&Event::Readable(fd), pass_bound)?;
                }
                for fd in ready_write {
                    self.dispatch_limited(&Event::Writable(fd), pass_bound)?;
                }
            }
        }
    }

    /// Idle dispatch honors each handler's own period; the poll timeout
    /// (their GCD) only bounds the wait.
    fn dispatch_idle(&mut self, pass_bound: u64) -> Result<()> {
        let now = Instant::now();
        let due: Vec<Token> = self
            .entries
            .iter()
            .filter(|e| {
                e.token.0 < pass_bound
                    && matches!(e.watch, Watch::Idle(p) if now.duration_since(e.last_idle) >= p)
            })
            .map(|e| e.token)
            .collect();
        for token in due {
            if let Some(entry) = self.entries.iter_mut().find(|e| e.token == token) {
                entry.last_idle = now;
            }
            self.dispatch_token(token)?;
        }
        Ok(())
    }

    fn idle_timeout_ms(&self) -> i32 {
        let mut g: u64 = 0;
        for entry in &self.entries {
            if let Watch::Idle(p) = entry.watch {
                g = gcd(g, (p.as_millis() as u64).max(1));
            }
        }
        if g == 0 {
            -1
        } else {
            g.min(i32::MAX as u64) as i32
        }
    }

    fn dispatch_limited(&mut self, event: &Event, pass_bound: u64) -> Result<bool> {
        let token = match self
            .entries
            .iter()
            .find(|e| e.token.0 < pass_bound && e.watch.matches(event) && e.handler.is_some())
        {
            Some(entry) => entry.token,
            None => {
                trace!(%event, "no handler matched");
                return Ok(false);
            }
        };
        self.call_handler(token, event).map(|()| true)
    }

    fn dispatch_token(&mut self, token: Token) -> Result<()> {
        if self.entries.iter().any(|e| e.token == token) {
            self.call_handler(token, &Event::Idle)?;
        }
        Ok(())
    }

    fn call_handler(&mut self, token: Token, event: &Event) -> Result<()> {
        let mut handler = match self
            .entries
            .iter_mut()
            .find(|e| e.token == token)
            .and_then(|e| e.handler.take())
        {
            Some(h) => h,
            None => return Ok(()),
        };
        let result = handler(event, self);
        // Put the handler back unless the entry was unregistered while
        // it ran; tokens are never reused, so a lookup is enough.
        if let Some(entry) = self.entries.iter_mut().find(|e| e.token == token) {
            entry.handler = Some(handler);
        }
        if result.is_err() {
            warn!(?token, %event, "handler failed, ending run");
        }
        result
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;
    use std::time::Duration;

    fn pair() -> (UnixStream, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (a, b)
    }

    #[test]
    fn test_readable_dispatch_runs_handler() {
        let (mut a, b) = pair();
        a.write_all(b"x").unwrap();

        let calls = Rc::new(Cell::new(0));
        let calls2 = Rc::clone(&calls);
        let mut lp = EventLoop::new();
        lp.register(Watch::Readable(b.as_raw_fd()), move |_, lp| {
            let mut buf = [0u8; 8];
            let _ = (&b).read(&mut buf);
            calls2.set(calls2.get() + 1);
            lp.quit();
            Ok(())
        });
        lp.run().unwrap();
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_readable_dispatched_before_writable() {
        let (mut a, b) = pair();
        a.write_all(b"x").unwrap();

        let order = Rc::new(RefCell::new(Vec::new()));
        let mut lp = EventLoop::new();

        // a is immediately writable; registered first on purpose.
        let o1 = Rc::clone(&order);
        lp.register(Watch::Writable(a.as_raw_fd()), move |_, lp| {
            o1.borrow_mut().push("writable");
            lp.quit();
            Ok(())
        });
        let o2 = Rc::clone(&order);
        lp.register(Watch::Readable(b.as_raw_fd()), move |_, _| {
            let mut buf = [0u8; 8];
            let _ = (&b).read(&mut buf);
            o2.borrow_mut().push("readable");
            Ok(())
        });

        lp.run().unwrap();
        assert_eq!(*order.borrow(), vec!["readable", "writable"]);
    }

    #[test]
    fn test_registration_during_pass_takes_effect_next_pass() {
        let (mut a1, b1) = pair();
        let (mut a2, b2) = pair();
        a1.write_all(b"x").unwrap();
        a2.write_all(b"y").unwrap();

        let order = Rc::new(RefCell::new(Vec::new()));
        let mut lp = EventLoop::new();
        let o1 = Rc::clone(&order);
        lp.register(Watch::Readable(b1.as_raw_fd()), move |_, lp| {
            let mut buf = [0u8; 8];
            let _ = (&b1).read(&mut buf);
            o1.borrow_mut().push("first");
            let o2 = Rc::clone(&o1);
            let b2 = b2.try_clone().unwrap();
            lp.register(Watch::Readable(b2.as_raw_fd()), move |_, lp| {
                let mut buf = [0u8; 8];
                let _ = (&b2).read(&mut buf);
                o2.borrow_mut().push("second");
                lp.quit();
                Ok(())
            });
            Ok(())
        });

        lp.run().unwrap();
        assert_eq!(*order.borrow(), vec!["first", "second"]);
    }

    #[test]
    fn test_handler_can_unregister_itself() {
        let (mut a, b) = pair();
        a.write_all(b"xy").unwrap();

        let calls = Rc::new(Cell::new(0));
        let token: Rc<Cell<Option<Token>>> = Rc::new(Cell::new(None));

        let mut lp = EventLoop::new();
        let calls2 = Rc::clone(&calls);
        let token2 = Rc::clone(&token);
        let t = lp.register(Watch::Readable(b.as_raw_fd()), move |_, lp| {
            let mut buf = [0u8; 8];
            let _ = (&b).read(&mut buf);
            calls2.set(calls2.get() + 1);
            assert!(lp.unregister(token2.get().unwrap()));
            Ok(())
        });
        token.set(Some(t));
        lp.register(Watch::Idle(Duration::from_millis(5)), |_, lp| {
            lp.quit();
            Ok(())
        });

        lp.run().unwrap();
        assert_eq!(calls.get(), 1);
        assert_eq!(lp.handler_count(), 1);
    }

    #[test]
    fn test_idle_handlers_respect_their_periods() {
        let fast = Rc::new(Cell::new(0));
        let slow = Rc::new(Cell::new(0));

        let mut lp = EventLoop::new();
        let f = Rc::clone(&fast);
        lp.register(Watch::Idle(Duration::from_millis(5)), move |_, lp| {
            f.set(f.get() + 1);
            if f.get() == 12 {
                lp.quit();
            }
            Ok(())
        });
        let s = Rc::clone(&slow);
        lp.register(Watch::Idle(Duration::from_millis(50)), move |_, _| {
            s.set(s.get() + 1);
            Ok(())
        });

        lp.run().unwrap();
        assert_eq!(fast.get(), 12);
        // 12 fast periods cover at least 60ms, so the slow handler was
        // due at least once but nowhere near 12 times.
        assert!(slow.get() >= 1);
        assert!(slow.get() < 6);
    }

    #[test]
    fn test_quit_before_run_starts_fresh() {
        let (mut a, b) = pair();
        a.write_all(b"x").unwrap();

        let calls = Rc::new(Cell::new(0));
        let calls2 = Rc::clone(&calls);
        let mut lp = EventLoop::new();
        lp.quit();
        lp.register(Watch::Readable(b.as_raw_fd()), move |_, lp| {
            let mut buf = [0u8; 8];
            let _ = (&b).read(&mut buf);
            calls2.set(calls2.get() + 1);
            lp.quit();
            Ok(())
        });
        lp.run().unwrap();
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_dispatch_goes_to_first_match_only() {
        let mut lp = EventLoop::new();
        let hits = Rc::new(RefCell::new(Vec::new()));
        let h1 = Rc::clone(&hits);
        let first = lp.register(Watch::Readable(9), move |_, _| {
            h1.borrow_mut().push("first");
            Ok(())
        });
        let h2 = Rc::clone(&hits);
        lp.register(Watch::Readable(9), move |_, _| {
            h2.borrow_mut().push("second");
            Ok(())
        });

        assert!(lp.dispatch(&Event::Readable(9)).unwrap());
        assert_eq!(*hits.borrow(), vec!["first"]);

        assert!(lp.unregister(first));
        assert!(lp.dispatch(&Event::Readable(9)).unwrap());
        assert_eq!(*hits.borrow(), vec!["first", "second"]);
    }

    #[test]
    fn test_unregister_watch_removes_first_match() {
        let mut lp = EventLoop::new();
        lp.register(Watch::Readable(4), |_, _| Ok(()));
        lp.register(Watch::Readable(4), |_, _| Ok(()));
        assert_eq!(lp.handler_count(), 2);
        assert!(lp.unregister_watch(&Watch::Readable(4)));
        assert_eq!(lp.handler_count(), 1);
        assert!(lp.unregister_watch(&Watch::Readable(4)));
        assert!(!lp.unregister_watch(&Watch::Readable(4)));
    }

    #[test]
    fn test_reentrant_run_is_rejected() {
        let (mut a, b) = pair();
        a.write_all(b"x").unwrap();

        let mut lp = EventLoop::new();
        lp.register(Watch::Readable(b.as_raw_fd()), move |_, lp| {
            let mut buf = [0u8; 8];
            let _ = (&b).read(&mut buf);
            assert!(lp.run().is_err());
            lp.quit();
            Ok(())
        });
        lp.run().unwrap();
    }

    #[test]
    fn test_handler_error_propagates_out_of_run() {
        let (mut a, b) = pair();
        a.write_all(b"x").unwrap();

        let mut lp = EventLoop::new();
        lp.register(Watch::Readable(b.as_raw_fd()), move |_, _| {
            let mut buf = [0u8; 8];
            let _ = (&b).read(&mut buf);
            Err(anyhow::anyhow!("boom"))
        });
        let err = lp.run().unwrap_err();
        assert!(err.to_string().contains("boom"));
        // The loop is reusable after a failed run.
        assert_eq!(lp.handler_count(), 1);
    }
}
