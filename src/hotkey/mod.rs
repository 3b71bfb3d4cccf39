//! Hotkey module: keysyms, modifier algebra, trigger compilation and
//! the listen cycle that turns grabbed key presses into actions.

pub mod keys;
pub mod keysym;
pub mod listener;
pub mod trigger;

pub use keys::{parse_mod_spec, Key, KeyParseError, ModMask, Modifier, ModifierMap, Modifiers};
pub use keysym::Keysym;
pub use listener::{ListenOutcome, Listener};
pub use trigger::{CompileError, CompiledLevel, MapEntry, Trigger, TriggerSet};
