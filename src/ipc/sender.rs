//! Backpressure-safe queued writer
//!
//! Byte blocks queue in push order and drain one `write` per writable
//! event, so a slow or stalled peer can never block the loop. The
//! writable registration exists only while there is something to send.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::io::Write;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::events::{EventLoop, Token, Watch};

/// Where queued bytes go: a nonblocking writable descriptor.
pub trait SendTarget: Write {
    fn raw_fd(&self) -> RawFd;

    /// Half-close the write side once the queue drains.
    fn close_write(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct QueuedSender<W: SendTarget> {
    target: W,
    queue: VecDeque<Vec<u8>>,
    pending: Option<(Vec<u8>, usize)>,
    token: Option<Token>,
    close_on_drain: bool,
    label: String,
}

impl<W: SendTarget + 'static> QueuedSender<W> {
    pub fn new(target: W, label: impl Into<String>) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            target,
            queue: VecDeque::new(),
            pending: None,
            token: None,
            close_on_drain: false,
            label: label.into(),
        }))
    }

    /// Half-close the target once everything queued has been written.
    pub fn set_close_on_drain(this: &Rc<RefCell<Self>>) {
        this.borrow_mut().close_on_drain = true;
    }

    /// Queue one block and make sure the writable handler is in place.
    /// Empty blocks are dropped.
    pub fn push(this: &Rc<RefCell<Self>>, lp: &mut EventLoop, block: impl Into<Vec<u8>>) {
        let block = block.into();
        if block.is_empty() {
            return;
        }
        this.borrow_mut().queue.push_back(block);
        Self::ensure_registered(this, lp);
    }

    pub fn push_all<I, B>(this: &Rc<RefCell<Self>>, lp: &mut EventLoop, blocks: I)
    where
        I: IntoIterator<Item = B>,
        B: Into<Vec<u8>>,
    {
        for block in blocks {
            Self::push(this, lp, block);
        }
    }

    pub fn is_registered(&self) -> bool {
        self.token.is_some()
    }

    pub fn queued(&self) -> usize {
        self.queue.len() + usize::from(self.pending.is_some())
    }

    fn ensure_registered(this: &Rc<RefCell<Self>>, lp: &mut EventLoop) {
        let fd = {
            let s = this.borrow();
            if s.token.is_some() {
                return;
            }
            s.target.raw_fd()
        };
        let sender = Rc::clone(this);
        let token = lp.register(Watch::Writable(fd), move |_event, lp| {
            Self::on_writable(&sender, lp);
            Ok(())
        });
        this.borrow_mut().token = Some(token);
    }

    /// One writable event: one write attempt.
    fn on_writable(this: &Rc<RefCell<Self>>, lp: &mut EventLoop) {
        let mut s = this.borrow_mut();
        let (block, offset) = match s.pending.take() {
            Some(p) => p,
            None => match s.queue.pop_front() {
                Some(b) => (b, 0),
                None => {
                    Self::finish(&mut s, lp, true);
                    return;
                }
            },
        };
        match s.target.write(&block[offset..]) {
            Ok(0) => {
                warn!(label = %s.label, "send target accepted zero bytes, keeping block");
                s.pending = Some((block, offset));
            }
            Ok(n) => {
                let next = offset + n;
                if next < block.len() {
                    s.pending = Some((block, next));
                }
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                s.pending = Some((block, offset));
            }
            Err(e) => {
                debug!(label = %s.label, ?e, "send target gone, dropping queue");
                s.queue.clear();
                Self::finish(&mut s, lp, false);
            }
        }
    }

    fn finish(s: &mut Self, lp: &mut EventLoop, drained: bool) {
        if let Some(token) = s.token.take() {
            lp.unregister(token);
        }
        if drained && s.close_on_drain {
            if let Err(e) = s.target.close_write() {
                debug!(label = %s.label, ?e, "close after drain failed");
            }
        }
    }
}
