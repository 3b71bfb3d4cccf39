//! Hotkey listeners
//!
//! A listener owns one compiled trigger level and its child listeners.
//! A listen cycle grabs the level's keys, waits on the event loop for a
//! matching press, releases every grab and registration on the way out,
//! then descends into the matched trigger's child level or executes its
//! action.

use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;

use anyhow::{Context as _, Result};
use tracing::{debug, info, warn};

use super::keys::ModifierMap;
use super::trigger::{CompileError, CompiledLevel, MapEntry, Trigger, TriggerSet};
use crate::actions::DaemonCtx;
use crate::events::{EventLoop, Watch};
use crate::wm::Notification;

/// How a listen cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenOutcome {
    /// A trigger matched; its action or child level has already run.
    Matched { trigger: String },
    /// The loop was quit from outside before any match.
    Cancelled,
}

pub struct Listener {
    level: usize,
    name: String,
    compiled: Rc<CompiledLevel>,
    triggers: Vec<Trigger>,
    children: HashMap<usize, Listener>,
}

impl Listener {
    /// Compile a trigger set and, recursively, every nested set.
    pub fn build(mut set: TriggerSet, map: &ModifierMap, level: usize) -> Result<Self, CompileError> {
        let compiled = Rc::new(CompiledLevel::compile(&set, map)?);
        let mut children = HashMap::new();
        for (idx, trigger) in set.triggers.iter_mut().enumerate() {
            if let Some(nested) = trigger.nested.take() {
                children.insert(idx, Listener::build(nested, map, level + 1)?);
            }
        }
        let name = std::mem::take(&mut set.name);
        Ok(Self {
            level,
            name,
            compiled,
            triggers: set.triggers,
            children,
        })
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn grab_count(&self) -> usize {
        self.compiled.grabs().len()
    }

    /// One listen cycle. Grab failures are warnings; every grab taken
    /// and the handler registration are released on all exit paths.
    pub fn listen(&self, ctx: &DaemonCtx, lp: &mut EventLoop) -> Result<ListenOutcome> {
        info!(
            level = self.level,
            name = %self.name,
            grabs = self.compiled.grabs().len(),
            "listening"
        );
        let mut held = Vec::new();
        for &(keysym, mask) in self.compiled.grabs() {
            match ctx.wm.grab_key(keysym, mask) {
                Ok(()) => held.push((keysym, mask)),
                Err(e) => warn!(%e, "grab failed"),
            }
        }

        let slot: Rc<Cell<Option<MapEntry>>> = Rc::new(Cell::new(None));
        let result = match ctx.wm.flush().context("flush after grabs") {
            Ok(()) => self.wait_for_match(ctx, lp, &slot),
            Err(e) => Err(e),
        };
        for &(keysym, mask) in &held {
            if let Err(e) = ctx.wm.ungrab_key(keysym, mask) {
                warn!(%e, "ungrab failed");
            }
        }
        if let Err(e) = ctx.wm.flush() {
            warn!(%e, "flush after release failed");
        }
        result?;

        let Some(entry) = slot.get() else {
            debug!(level = self.level, "listen cancelled");
            return Ok(ListenOutcome::Cancelled);
        };
        let trigger = &self.triggers[entry.trigger];
        info!(level = self.level, trigger = %trigger.label, "matched");

        if let Some(child) = self.children.get(&entry.trigger) {
            return child.listen(ctx, lp);
        }
        if let Some(action) = &trigger.action {
            if let Err(e) = action.execute(ctx, lp) {
                warn!(trigger = %trigger.label, ?e, "action failed");
            }
        }
        Ok(ListenOutcome::Matched {
            trigger: trigger.label.clone(),
        })
    }

    /// Register the key-press handler, run the loop, unregister. The
    /// matched entry, if any, lands in `slot`.
    fn wait_for_match(
        &self,
        ctx: &DaemonCtx,
        lp: &mut EventLoop,
        slot: &Rc<Cell<Option<MapEntry>>>,
    ) -> Result<()> {
        let wm = Rc::clone(&ctx.wm);
        let compiled = Rc::clone(&self.compiled);
        let slot = Rc::clone(slot);
        let token = lp.register(Watch::Readable(ctx.wm.raw_fd()), move |_, lp| {
            while let Some(n) = wm.next_notification() {
                let (keysyms, state) = match n {
                    Notification::KeyPress { keysyms, state } => (keysyms, state),
                    _ => continue,
                };
                if let Some(entry) = compiled.find_entry(&keysyms, state) {
                    debug!(keysym = %entry.keysym, state = %state, "press matched");
                    slot.set(Some(*entry));
                    lp.quit();
                    break;
                }
                debug!(state = %state, "press matched nothing");
            }
            Ok(())
        });
        let result = lp.run();
        lp.unregister(token);
        result
    }
}
