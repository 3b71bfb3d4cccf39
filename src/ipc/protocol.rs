//! Command protocol
//!
//! Newline-delimited text commands, `command` or `command:argument`
//! with the first `:` splitting. The same dispatcher serves control
//! connections, consult children, and autonomous `do` scripts; only
//! where the replies go differs.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::actions::DaemonCtx;
use crate::events::{EventLoop, Waiter};
use crate::hotkey::Key;
use crate::ipc::sender::{QueuedSender, SendTarget};
use crate::wm::{GeometryChange, StateAction, WindowId, WmError, WmSnapshot, WmStateProp};

/// What a command handler decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// One reply line, sent verbatim.
    Reply(String),
    /// Several reply lines, sent in order.
    ReplyMany(Vec<String>),
    /// Flush the window system, then `OK`.
    Ack,
    /// `Failed`.
    Nack,
}

/// Where reply lines go.
pub trait Responder {
    fn send_line(&mut self, line: &str, lp: &mut EventLoop);
}

/// Replies queued onto a nonblocking sender.
pub struct SenderResponder<W: SendTarget> {
    sender: Rc<RefCell<QueuedSender<W>>>,
}

impl<W: SendTarget> SenderResponder<W> {
    pub fn new(sender: Rc<RefCell<QueuedSender<W>>>) -> Self {
        Self { sender }
    }
}

impl<W: SendTarget + 'static> Responder for SenderResponder<W> {
    fn send_line(&mut self, line: &str, lp: &mut EventLoop) {
        let mut block = Vec::with_capacity(line.len() + 1);
        block.extend_from_slice(line.as_bytes());
        block.push(b'\n');
        QueuedSender::push(&self.sender, lp, block);
    }
}

/// Replies are only logged; for autonomous scripts with no peer.
pub struct LogResponder {
    label: String,
}

impl LogResponder {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl Responder for LogResponder {
    fn send_line(&mut self, line: &str, _lp: &mut EventLoop) {
        debug!(label = %self.label, %line, "reply");
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    #[error("bad argument {arg:?}: {reason}")]
    BadArgument { arg: String, reason: String },

    #[error(transparent)]
    Wm(#[from] WmError),

    #[error("bad snapshot: {0}")]
    Json(#[from] serde_json::Error),
}

fn bad_arg(arg: &str, reason: impl Into<String>) -> ProtocolError {
    ProtocolError::BadArgument {
        arg: arg.to_string(),
        reason: reason.into(),
    }
}

fn parse_window(arg: &str) -> Result<WindowId, ProtocolError> {
    arg.trim()
        .parse()
        .map_err(|_| bad_arg(arg, "expected a window id"))
}

/// The command dispatcher: one per control connection, consult child,
/// or `do` script.
pub struct Consultant {
    ctx: DaemonCtx,
    label: String,
}

impl Consultant {
    pub fn new(ctx: DaemonCtx, label: impl Into<String>) -> Self {
        Self {
            ctx,
            label: label.into(),
        }
    }

    /// Process one batch of decoded lines. `bye` replies `bye`, drops
    /// the rest of the batch and returns false; the connection itself
    /// stays usable. Unknown commands are logged and get no reply; a
    /// recognized command that fails answers `Failed`.
    pub fn incoming(
        &mut self,
        lines: &[String],
        responder: &mut dyn Responder,
        lp: &mut EventLoop,
    ) -> bool {
        for raw in lines {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            if line == "bye" {
                debug!(label = %self.label, "bye");
                responder.send_line("bye", lp);
                return false;
            }
            let (cmd, arg) = match line.split_once(':') {
                Some((cmd, arg)) => (cmd, arg),
                None => (line, ""),
            };
            match self.dispatch(cmd, arg, lp) {
                Ok(CommandOutcome::Reply(reply)) => responder.send_line(&reply, lp),
                Ok(CommandOutcome::ReplyMany(replies)) => {
                    for reply in replies {
                        responder.send_line(&reply, lp);
                    }
                }
                Ok(CommandOutcome::Ack) => match self.ctx.wm.flush() {
                    Ok(()) => responder.send_line("OK", lp),
                    Err(e) => {
                        warn!(label = %self.label, %line, ?e, "flush after command failed");
                        responder.send_line("Failed", lp);
                    }
                },
                Ok(CommandOutcome::Nack) => responder.send_line("Failed", lp),
                Err(ProtocolError::UnknownCommand(cmd)) => {
                    warn!(label = %self.label, %cmd, "unknown command ignored");
                }
                Err(e) => {
                    warn!(label = %self.label, %line, %e, "command failed");
                    responder.send_line("Failed", lp);
                }
            }
        }
        true
    }

    fn dispatch(
        &mut self,
        cmd: &str,
        arg: &str,
        lp: &mut EventLoop,
    ) -> Result<CommandOutcome, ProtocolError> {
        match cmd {
            "raise" => {
                self.ctx.wm.raise_window(parse_window(arg)?)?;
                Ok(CommandOutcome::Ack)
            }
            "close" => {
                self.ctx.wm.close_window(parse_window(arg)?)?;
                Ok(CommandOutcome::Ack)
            }
            "minimize" => {
                self.ctx.wm.minimize_window(parse_window(arg)?)?;
                Ok(CommandOutcome::Ack)
            }
            "activate" => Ok(report(self.ctx.wm.activate_window(parse_window(arg)?)?)),
            "focus" => Ok(report(self.ctx.wm.focus_window(parse_window(arg)?)?)),
            "maximize" => self.wm_state(
                arg,
                &[WmStateProp::MaximizedVert, WmStateProp::MaximizedHorz],
            ),
            "fullscreen" => self.wm_state(arg, &[WmStateProp::Fullscreen]),
            "sticky" => self.wm_state(arg, &[WmStateProp::Sticky]),
            "above" => self.wm_state(arg, &[WmStateProp::Above]),
            "below" => self.wm_state(arg, &[WmStateProp::Below]),
            "skip_pager" => self.wm_state(arg, &[WmStateProp::SkipPager]),
            "skip_taskbar" => self.wm_state(arg, &[WmStateProp::SkipTaskbar]),
            "frame" => {
                let (action, rest) = StateAction::parse_prefix(arg.trim());
                self.ctx.wm.set_frame(parse_window(rest)?, action)?;
                Ok(CommandOutcome::Ack)
            }
            "geometry" => self.geometry(arg),
            "desktop" => {
                let (action, rest) = StateAction::parse_prefix(arg.trim());
                if !rest.is_empty() {
                    return Err(bad_arg(arg, "expected only a +/-/! prefix"));
                }
                self.ctx.wm.show_desktop(action)?;
                Ok(CommandOutcome::Ack)
            }
            "key" | "send_keys" => self.send_keys(arg),
            "action" => Ok(self.run_action(arg, lp)),
            "select-windows" => self.select_windows(arg),
            "save_state" => {
                let snapshot = self.ctx.wm.save_state()?;
                let json = serde_json::to_string(&snapshot)?;
                Ok(CommandOutcome::Reply(format!("save_state {json}")))
            }
            "restore_state" => {
                let snapshot: WmSnapshot = serde_json::from_str(arg.trim())?;
                self.ctx.wm.restore_state(&snapshot)?;
                Ok(CommandOutcome::Ack)
            }
            _ => Err(ProtocolError::UnknownCommand(cmd.to_string())),
        }
    }

    fn wm_state(
        &self,
        arg: &str,
        props: &[WmStateProp],
    ) -> Result<CommandOutcome, ProtocolError> {
        let (action, rest) = StateAction::parse_prefix(arg.trim());
        let w = parse_window(rest)?;
        for prop in props {
            self.ctx.wm.set_wm_state(w, *prop, action)?;
        }
        Ok(CommandOutcome::Ack)
    }

    /// `geometry:<w>` replies the current geometry; with a
    /// `[WxH][±X±Y]` spec it resizes and moves. Negative offsets anchor
    /// the outer frame to the right/bottom workarea edge.
    fn geometry(&self, arg: &str) -> Result<CommandOutcome, ProtocolError> {
        let arg = arg.trim();
        let (win_part, spec_part) = match arg.split_once(' ') {
            Some((w, s)) => (w, s.trim()),
            None => (arg, ""),
        };
        let w = parse_window(win_part)?;
        let wm = &self.ctx.wm;
        if spec_part.is_empty() {
            let g = wm.geometry(w)?;
            return Ok(CommandOutcome::Reply(g.to_string()));
        }

        let spec =
            parse_geom_spec(spec_part).ok_or_else(|| bad_arg(spec_part, "expected [WxH][±X±Y]"))?;
        let current = wm.geometry(w)?;
        let mut change = GeometryChange::default();
        if let Some((width, height)) = spec.size {
            change.width = Some(width);
            change.height = Some(height);
        }
        if let Some((x, x_from_right, y, y_from_bottom)) = spec.pos {
            let area = wm.workarea()?;
            let frame = wm.frame_extents(w)?;
            let width = spec.size.map_or(current.width, |s| s.0);
            let height = spec.size.map_or(current.height, |s| s.1);
            let outer_w = (width + frame.left + frame.right) as i32;
            let outer_h = (height + frame.top + frame.bottom) as i32;
            change.x = Some(if x_from_right {
                area.x + area.width as i32 - outer_w - x
            } else {
                area.x + x
            });
            change.y = Some(if y_from_bottom {
                area.y + area.height as i32 - outer_h - y
            } else {
                area.y + y
            });
        }
        wm.set_geometry(w, change)?;
        Ok(CommandOutcome::Ack)
    }

    /// `key:<w> <chord>…` synthesizes each chord into the window.
    fn send_keys(&self, arg: &str) -> Result<CommandOutcome, ProtocolError> {
        let arg = arg.trim();
        let (win_part, chords) = arg
            .split_once(' ')
            .ok_or_else(|| bad_arg(arg, "expected <window> <chord>…"))?;
        let w = parse_window(win_part)?;
        for chord in chords.split_whitespace() {
            let key = Key::parse(chord, &self.ctx.map)
                .map_err(|e| bad_arg(chord, e.to_string()))?;
            self.ctx
                .wm
                .send_key(w, key.keysym(), key.named_mods().mask())?;
        }
        Ok(CommandOutcome::Ack)
    }

    fn run_action(&self, name: &str, lp: &mut EventLoop) -> CommandOutcome {
        let name = name.trim();
        let Some(action) = self.ctx.actions.get(name) else {
            warn!(label = %self.label, %name, "unknown action");
            return CommandOutcome::Nack;
        };
        match action.execute(&self.ctx, lp) {
            Ok(()) => CommandOutcome::Ack,
            Err(e) => {
                warn!(label = %self.label, %name, ?e, "action failed");
                CommandOutcome::Nack
            }
        }
    }

    /// `select-windows:<matcher> [waiting <seconds>]` runs a configured
    /// query, optionally polling until it is non-empty.
    fn select_windows(&self, arg: &str) -> Result<CommandOutcome, ProtocolError> {
        let arg = arg.trim();
        let (name, waiting) = match arg.split_once(" waiting ") {
            Some((n, secs)) => (n.trim(), Some(secs.trim())),
            None => (arg, None),
        };
        let query = self
            .ctx
            .matchers
            .get(name)
            .ok_or_else(|| bad_arg(name, "unknown matcher"))?;
        let mut found = query.select(self.ctx.wm.as_ref())?;
        if let Some(secs) = waiting {
            let secs: u64 = secs
                .parse()
                .map_err(|_| bad_arg(secs, "expected whole seconds"))?;
            let waiter = Waiter::new(Some(Duration::from_secs(secs)));
            while found.is_empty() && waiter.wait() {
                found = query.select(self.ctx.wm.as_ref())?;
            }
            if found.is_empty() {
                return Ok(CommandOutcome::Nack);
            }
        }
        let mut reply = format!("select-windows:{name}");
        for info in &found {
            reply.push(' ');
            reply.push_str(&info.id.to_string());
        }
        Ok(CommandOutcome::Reply(reply))
    }
}

fn report(ok: bool) -> CommandOutcome {
    if ok {
        CommandOutcome::Ack
    } else {
        CommandOutcome::Nack
    }
}

struct GeomSpec {
    size: Option<(u32, u32)>,
    /// (x, anchored right, y, anchored bottom)
    pos: Option<(i32, bool, i32, bool)>,
}

fn parse_geom_spec(s: &str) -> Option<GeomSpec> {
    let mut rest = s;
    let mut size = None;
    if rest.starts_with(|c: char| c.is_ascii_digit()) {
        let end = rest.find(['+', '-']).unwrap_or(rest.len());
        let (sz, tail) = rest.split_at(end);
        let (w, h) = sz.split_once('x')?;
        size = Some((w.parse().ok()?, h.parse().ok()?));
        rest = tail;
    }
    let mut pos = None;
    if !rest.is_empty() {
        let x_from_right = match rest.as_bytes()[0] {
            b'+' => false,
            b'-' => true,
            _ => return None,
        };
        let tail = &rest[1..];
        let idx = tail.find(['+', '-'])?;
        let x: i32 = tail[..idx].parse().ok()?;
        let y_from_bottom = tail.as_bytes()[idx] == b'-';
        let y: i32 = tail[idx + 1..].parse().ok()?;
        pos = Some((x, x_from_right, y, y_from_bottom));
    }
    if size.is_none() && pos.is_none() {
        return None;
    }
    Some(GeomSpec { size, pos })
}
