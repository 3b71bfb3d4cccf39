//! Window-system boundary
//!
//! The daemon talks to an already-connected windowing client through the
//! object-safe [`WindowSystem`] trait. Backends use interior mutability;
//! everything here is single-threaded.

pub mod headless;
pub mod query;

pub use headless::HeadlessWm;
pub use query::{MatcherRegistry, QueryFields, WindowQuery};

use std::io;
use std::os::unix::io::RawFd;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hotkey::{Keysym, ModMask};

/// A window id as reported by the backend.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct WindowId(pub u32);

impl std::fmt::Display for WindowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl FromStr for WindowId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            u32::from_str_radix(hex, 16).map(WindowId)
        } else {
            s.parse().map(WindowId)
        }
    }
}

/// How a window-state change is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateAction {
    Add,
    Remove,
    Toggle,
}

impl StateAction {
    /// Split a leading `+`/`-`/`!` off a command argument. No prefix
    /// means toggle.
    pub fn parse_prefix(arg: &str) -> (StateAction, &str) {
        match arg.as_bytes().first() {
            Some(b'+') => (StateAction::Add, &arg[1..]),
            Some(b'-') => (StateAction::Remove, &arg[1..]),
            Some(b'!') => (StateAction::Toggle, &arg[1..]),
            _ => (StateAction::Toggle, arg),
        }
    }

    pub fn apply(self, present: bool) -> bool {
        match self {
            StateAction::Add => true,
            StateAction::Remove => false,
            StateAction::Toggle => !present,
        }
    }
}

/// Window-state properties a backend can set, remove, or toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WmStateProp {
    MaximizedVert,
    MaximizedHorz,
    Fullscreen,
    Sticky,
    Above,
    Below,
    SkipPager,
    SkipTaskbar,
}

impl WmStateProp {
    pub fn as_str(&self) -> &'static str {
        match self {
            WmStateProp::MaximizedVert => "maximized_vert",
            WmStateProp::MaximizedHorz => "maximized_horz",
            WmStateProp::Fullscreen => "fullscreen",
            WmStateProp::Sticky => "sticky",
            WmStateProp::Above => "above",
            WmStateProp::Below => "below",
            WmStateProp::SkipPager => "skip_pager",
            WmStateProp::SkipTaskbar => "skip_taskbar",
        }
    }
}

impl std::fmt::Display for WmStateProp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outer window geometry. Offsets are relative to the root origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
    pub x: i32,
    pub y: i32,
}

impl std::fmt::Display for Geometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}{:+}{:+}", self.width, self.height, self.x, self.y)
    }
}

/// A partial geometry update; `None` fields are left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GeometryChange {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub x: Option<i32>,
    pub y: Option<i32>,
}

impl GeometryChange {
    pub fn apply_to(&self, g: Geometry) -> Geometry {
        Geometry {
            width: self.width.unwrap_or(g.width),
            height: self.height.unwrap_or(g.height),
            x: self.x.unwrap_or(g.x),
            y: self.y.unwrap_or(g.y),
        }
    }
}

/// Decoration sizes the window manager puts around a client window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameExtents {
    pub left: u32,
    pub right: u32,
    pub top: u32,
    pub bottom: u32,
}

/// One entry of `list_windows()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowInfo {
    pub id: WindowId,
    pub title: String,
    pub class: String,
    pub instance: String,
    pub pid: Option<u32>,
    pub toplevel: bool,
    pub focused: bool,
}

/// One decoded event from the windowing connection.
///
/// Key events carry the candidate keysyms for the pressed key, the
/// unshifted one first, plus the physical modifier state at press time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    KeyPress { keysyms: Vec<Keysym>, state: ModMask },
    KeyRelease { keysyms: Vec<Keysym>, state: ModMask },
    Other,
}

/// What `save_state` captures and `restore_state` re-applies.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WmSnapshot {
    pub desktop: Option<u32>,
    pub active_window: Option<WindowId>,
    pub focused_window: Option<WindowId>,
}

/// Backend failures.
#[derive(Debug, Error)]
pub enum WmError {
    #[error("grab failed for {keysym} with mask {mods}")]
    GrabFailed { keysym: Keysym, mods: ModMask },

    #[error("unknown window {0}")]
    UnknownWindow(WindowId),

    #[error("backend does not support {0}")]
    Unsupported(&'static str),

    #[error("window system i/o: {0}")]
    Io(#[from] io::Error),
}

/// The already-connected windowing client the daemon drives.
///
/// All methods take `&self`; implementations keep their own state behind
/// interior mutability so the trait stays object-safe and shareable via
/// `Rc<dyn WindowSystem>`.
pub trait WindowSystem {
    /// The connection descriptor the event loop polls readable.
    fn raw_fd(&self) -> RawFd;

    /// The `(keysym, bit)` rows of the current modifier mapping.
    fn modifier_layout(&self) -> Vec<(Keysym, u8)>;

    fn grab_key(&self, keysym: Keysym, mods: ModMask) -> Result<(), WmError>;
    fn ungrab_key(&self, keysym: Keysym, mods: ModMask) -> Result<(), WmError>;

    /// Drain one pending notification without blocking.
    fn next_notification(&self) -> Option<Notification>;

    fn flush(&self) -> Result<(), WmError>;
    fn sync(&self) -> Result<(), WmError>;

    fn list_windows(&self) -> Result<Vec<WindowInfo>, WmError>;
    fn raise_window(&self, w: WindowId) -> Result<(), WmError>;
    fn close_window(&self, w: WindowId) -> Result<(), WmError>;
    fn minimize_window(&self, w: WindowId) -> Result<(), WmError>;
    fn activate_window(&self, w: WindowId) -> Result<bool, WmError>;
    fn focus_window(&self, w: WindowId) -> Result<bool, WmError>;

    fn set_wm_state(
        &self,
        w: WindowId,
        prop: WmStateProp,
        action: StateAction,
    ) -> Result<(), WmError>;

    /// Toggle window-manager decorations.
    fn set_frame(&self, w: WindowId, action: StateAction) -> Result<(), WmError>;

    fn geometry(&self, w: WindowId) -> Result<Geometry, WmError>;
    fn set_geometry(&self, w: WindowId, change: GeometryChange) -> Result<(), WmError>;
    fn frame_extents(&self, w: WindowId) -> Result<FrameExtents, WmError>;

    /// The usable desktop area (panels excluded).
    fn workarea(&self) -> Result<Geometry, WmError>;
    fn current_desktop(&self) -> Result<u32, WmError>;
    fn show_desktop(&self, action: StateAction) -> Result<(), WmError>;

    /// Synthesize a key press/release pair into a window.
    fn send_key(&self, w: WindowId, keysym: Keysym, mods: ModMask) -> Result<(), WmError>;

    fn save_state(&self) -> Result<WmSnapshot, WmError>;
    fn restore_state(&self, snapshot: &WmSnapshot) -> Result<(), WmError>;
}
