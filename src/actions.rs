//! Actions bound to triggers
//!
//! An action either spawns a shell command, wires a child into the
//! command protocol over its pipes, or feeds a canned command list to
//! the protocol directly. Spawned children are reaped from an idle
//! handler so the daemon never blocks on a wait.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::io::Read;
use std::os::fd::BorrowedFd;
use std::os::unix::io::{AsRawFd, RawFd};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use rustix::fs::{fcntl_getfl, fcntl_setfl, OFlags};
use tracing::{debug, info, warn};

use crate::events::{EventLoop, Watch};
use crate::hotkey::ModifierMap;
use crate::ipc::protocol::{Consultant, LogResponder, SenderResponder};
use crate::ipc::sender::{QueuedSender, SendTarget};
use crate::ipc::LineBuffer;
use crate::wm::{MatcherRegistry, WindowSystem};

/// How often finished children are collected.
const REAP_PERIOD: Duration = Duration::from_secs(2);

/// Everything command handlers and actions need. Cloning shares the
/// same single-threaded registries.
#[derive(Clone)]
pub struct DaemonCtx {
    pub wm: Rc<dyn WindowSystem>,
    pub map: Rc<ModifierMap>,
    pub actions: Rc<ActionRegistry>,
    pub matchers: Rc<MatcherRegistry>,
    pub procs: Rc<ProcessSet>,
}

/// What a trigger or an action-table entry executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Fire-and-forget shell command.
    Run(String),
    /// Shell command wired to the command protocol over its pipes.
    Consult(String),
    /// `;`-separated protocol commands; replies are only logged.
    Do(String),
    /// Ordered sequence.
    Seq(Vec<Action>),
}

impl Action {
    /// Build from the verbs of a config entry, in verb order run,
    /// consult, do. Several verbs become a sequence.
    pub fn from_verbs(
        run: Option<String>,
        consult: Option<String>,
        do_: Option<String>,
    ) -> Option<Action> {
        let mut parts = Vec::new();
        if let Some(cmd) = run {
            parts.push(Action::Run(cmd));
        }
        if let Some(cmd) = consult {
            parts.push(Action::Consult(cmd));
        }
        if let Some(script) = do_ {
            parts.push(Action::Do(script));
        }
        match parts.len() {
            0 => None,
            1 => parts.pop(),
            _ => Some(Action::Seq(parts)),
        }
    }

    pub fn execute(&self, ctx: &DaemonCtx, lp: &mut EventLoop) -> Result<()> {
        match self {
            Action::Run(cmd) => spawn_detached(ctx, cmd),
            Action::Consult(cmd) => spawn_consult(ctx, lp, cmd),
            Action::Do(script) => {
                let lines: Vec<String> = script
                    .split(';')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                let mut consultant = Consultant::new(ctx.clone(), "do");
                let mut responder = LogResponder::new("do");
                consultant.incoming(&lines, &mut responder, lp);
                Ok(())
            }
            Action::Seq(actions) => {
                for action in actions {
                    action.execute(ctx, lp)?;
                }
                Ok(())
            }
        }
    }
}

/// The `[action.NAME]` table.
#[derive(Debug, Clone, Default)]
pub struct ActionRegistry {
    actions: RefCell<HashMap<String, Action>>,
}

impl ActionRegistry {
    pub fn insert(&self, name: impl Into<String>, action: Action) {
        self.actions.borrow_mut().insert(name.into(), action);
    }

    pub fn get(&self, name: &str) -> Option<Action> {
        self.actions.borrow().get(name).cloned()
    }

    /// Swap in another table. Contexts holding this registry see the
    /// new entries on their next lookup.
    pub fn replace(&self, other: &ActionRegistry) {
        *self.actions.borrow_mut() = other.actions.borrow().clone();
    }

    pub fn len(&self) -> usize {
        self.actions.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.borrow().is_empty()
    }
}

/// Children spawned by actions, reaped periodically.
#[derive(Default)]
pub struct ProcessSet {
    children: RefCell<Vec<(Child, String)>>,
}

impl ProcessSet {
    pub fn adopt(&self, child: Child, label: impl Into<String>) {
        let label = label.into();
        debug!(pid = child.id(), %label, "child adopted");
        self.children.borrow_mut().push((child, label));
    }

    /// Collect exit statuses of finished children, keep the rest.
    pub fn reap(&self) {
        self.children
            .borrow_mut()
            .retain_mut(|(child, label)| match child.try_wait() {
                Ok(Some(status)) => {
                    log_exit(label, status);
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    warn!(?e, %label, "wait failed, dropping child");
                    false
                }
            });
    }

    pub fn install(self: &Rc<Self>, lp: &mut EventLoop) {
        let procs = Rc::clone(self);
        lp.register(Watch::Idle(REAP_PERIOD), move |_, _| {
            procs.reap();
            Ok(())
        });
    }

    pub fn len(&self) -> usize {
        self.children.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.borrow().is_empty()
    }
}

fn log_exit(label: &str, status: ExitStatus) {
    if status.success() {
        debug!(%label, "child exited");
    } else {
        warn!(%label, %status, "child exited abnormally");
    }
}

fn spawn_detached(ctx: &DaemonCtx, cmd: &str) -> Result<()> {
    info!(%cmd, "run");
    let child = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .spawn()
        .with_context(|| format!("spawning {cmd:?}"))?;
    ctx.procs.adopt(child, cmd);
    Ok(())
}

/// Spawn a consultant child: its stdout lines are protocol commands,
/// replies go back down its stdin through a queued sender.
fn spawn_consult(ctx: &DaemonCtx, lp: &mut EventLoop, cmd: &str) -> Result<()> {
    info!(%cmd, "consult");
    let mut child = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawning {cmd:?}"))?;
    let stdin = child.stdin.take().context("consult child lacks stdin")?;
    let mut stdout = child.stdout.take().context("consult child lacks stdout")?;
    set_nonblocking(stdin.as_raw_fd())?;
    set_nonblocking(stdout.as_raw_fd())?;

    let label = cmd.to_string();
    let sender = QueuedSender::new(PipeTarget(stdin), label.clone());
    let mut consultant = Consultant::new(ctx.clone(), label.clone());
    let procs = Rc::clone(&ctx.procs);
    let stdout_fd = stdout.as_raw_fd();
    let mut child = Some(child);
    let mut buf = LineBuffer::default();

    lp.register(Watch::Readable(stdout_fd), move |_, lp| {
        let mut eof = false;
        loop {
            let mut chunk = [0u8; 4096];
            match stdout.read(&mut chunk) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => buf.push(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(?e, label = %label, "consult stdout read failed");
                    eof = true;
                    break;
                }
            }
        }
        let lines = buf.take_lines();
        if !lines.is_empty() {
            let mut responder = SenderResponder::new(Rc::clone(&sender));
            if !consultant.incoming(&lines, &mut responder, lp) {
                // The child said bye: close its stdin once the reply
                // has gone out.
                QueuedSender::set_close_on_drain(&sender);
            }
        }
        if eof {
            debug!(label = %label, "consult finished");
            lp.unregister_watch(&Watch::Readable(stdout_fd));
            if let Some(mut c) = child.take() {
                match c.try_wait() {
                    Ok(Some(status)) => log_exit(&label, status),
                    Ok(None) => procs.adopt(c, label.clone()),
                    Err(e) => warn!(?e, label = %label, "wait failed"),
                }
            }
        }
        Ok(())
    });
    Ok(())
}

struct PipeTarget(ChildStdin);

impl io::Write for PipeTarget {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl SendTarget for PipeTarget {
    fn raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    let flags = fcntl_getfl(fd)?;
    fcntl_setfl(fd, flags | OFlags::NONBLOCK)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::wm::HeadlessWm;

    /// A context over a fresh headless backend, with empty registries.
    pub(crate) fn ctx() -> (Rc<HeadlessWm>, DaemonCtx) {
        ctx_with(ActionRegistry::default(), MatcherRegistry::default())
    }

    pub(crate) fn ctx_with(
        actions: ActionRegistry,
        matchers: MatcherRegistry,
    ) -> (Rc<HeadlessWm>, DaemonCtx) {
        let wm = Rc::new(HeadlessWm::new().unwrap());
        let map = Rc::new(ModifierMap::from_layout(&wm.modifier_layout()));
        let ctx = DaemonCtx {
            wm: Rc::clone(&wm) as Rc<dyn WindowSystem>,
            map,
            actions: Rc::new(actions),
            matchers: Rc::new(matchers),
            procs: Rc::new(ProcessSet::default()),
        };
        (wm, ctx)
    }
}
