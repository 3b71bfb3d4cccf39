//! In-memory windowing backend
//!
//! Drives the daemon without a display server. Notifications queue in
//! memory and are signalled through a real socketpair, one byte per
//! notification, so the event loop polls an actual readable descriptor.
//! Grabs and window operations are recorded for inspection.

use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::io;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use tracing::debug;

use super::{
    FrameExtents, Geometry, GeometryChange, Notification, StateAction, WindowId, WindowInfo,
    WindowSystem, WmError, WmSnapshot, WmStateProp,
};
use crate::hotkey::{Keysym, ModMask};

struct Window {
    info: WindowInfo,
    geometry: Geometry,
    frame: FrameExtents,
    decorated: bool,
    minimized: bool,
    states: HashSet<WmStateProp>,
}

#[derive(Default)]
struct Inner {
    layout: Vec<(Keysym, u8)>,
    notifications: VecDeque<Notification>,
    grabs: Vec<(Keysym, ModMask)>,
    grab_log: Vec<(Keysym, ModMask)>,
    ungrab_log: Vec<(Keysym, ModMask)>,
    fail_grabs: HashSet<(Keysym, ModMask)>,
    refuse: HashSet<WindowId>,
    windows: Vec<Window>,
    raised: Vec<WindowId>,
    closed: Vec<WindowId>,
    sent_keys: Vec<(WindowId, Keysym, ModMask)>,
    active: Option<WindowId>,
    focused: Option<WindowId>,
    desktop: u32,
    showing_desktop: bool,
    workarea: Geometry,
    flushes: u32,
    syncs: u32,
}

impl Inner {
    fn window(&self, w: WindowId) -> Result<&Window, WmError> {
        self.windows
            .iter()
            .find(|win| win.info.id == w)
            .ok_or(WmError::UnknownWindow(w))
    }

    fn window_mut(&mut self, w: WindowId) -> Result<&mut Window, WmError> {
        self.windows
            .iter_mut()
            .find(|win| win.info.id == w)
            .ok_or(WmError::UnknownWindow(w))
    }
}

pub struct HeadlessWm {
    wake_rx: UnixStream,
    wake_tx: UnixStream,
    inner: RefCell<Inner>,
}

impl HeadlessWm {
    pub fn new() -> io::Result<Self> {
        Self::with_layout(Self::default_layout())
    }

    pub fn with_layout(layout: Vec<(Keysym, u8)>) -> io::Result<Self> {
        let (wake_rx, wake_tx) = UnixStream::pair()?;
        wake_rx.set_nonblocking(true)?;
        wake_tx.set_nonblocking(true)?;
        Ok(Self {
            wake_rx,
            wake_tx,
            inner: RefCell::new(Inner {
                layout,
                workarea: Geometry {
                    width: 1280,
                    height: 1024,
                    x: 0,
                    y: 0,
                },
                ..Inner::default()
            }),
        })
    }

    /// Shift, Caps_Lock, Control, Alt, Num_Lock, Super on the usual
    /// bits of a stock us layout.
    pub fn default_layout() -> Vec<(Keysym, u8)> {
        vec![
            (Keysym(0xffe1), 0), // Shift_L
            (Keysym(0xffe5), 1), // Caps_Lock
            (Keysym(0xffe3), 2), // Control_L
            (Keysym(0xffe9), 3), // Alt_L
            (Keysym(0xff7f), 4), // Num_Lock
            (Keysym(0xffeb), 6), // Super_L
        ]
    }

    /// Queue a notification and signal the wake socket.
    pub fn inject(&self, n: Notification) {
        self.inner.borrow_mut().notifications.push_back(n);
        match (&self.wake_tx).write(&[1]) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => debug!(?e, "headless wake write failed"),
        }
    }

    pub fn inject_key_press(&self, keysyms: &[Keysym], state: ModMask) {
        self.inject(Notification::KeyPress {
            keysyms: keysyms.to_vec(),
            state,
        });
    }

    pub fn inject_key_release(&self, keysyms: &[Keysym], state: ModMask) {
        self.inject(Notification::KeyRelease {
            keysyms: keysyms.to_vec(),
            state,
        });
    }

    /// Make a later `grab_key` of this combination fail.
    pub fn fail_grab(&self, keysym: Keysym, mods: ModMask) {
        self.inner.borrow_mut().fail_grabs.insert((keysym, mods));
    }

    /// Make activate/focus report failure for this window.
    pub fn refuse_activation(&self, w: WindowId) {
        self.inner.borrow_mut().refuse.insert(w);
    }

    pub fn add_window(&self, info: WindowInfo) {
        self.inner.borrow_mut().windows.push(Window {
            info,
            geometry: Geometry {
                width: 800,
                height: 600,
                x: 0,
                y: 0,
            },
            frame: FrameExtents::default(),
            decorated: true,
            minimized: false,
            states: HashSet::new(),
        });
    }

    pub fn add_simple_window(&self, id: u32, title: &str, class: &str) {
        self.add_window(WindowInfo {
            id: WindowId(id),
            title: title.to_string(),
            class: class.to_string(),
            instance: class.to_ascii_lowercase(),
            pid: Some(1000 + id),
            toplevel: true,
            focused: false,
        });
    }

    pub fn set_window_frame_extents(&self, w: WindowId, frame: FrameExtents) {
        if let Ok(win) = self.inner.borrow_mut().window_mut(w) {
            win.frame = frame;
        }
    }

    pub fn set_workarea(&self, area: Geometry) {
        self.inner.borrow_mut().workarea = area;
    }

    pub fn held_grabs(&self) -> Vec<(Keysym, ModMask)> {
        self.inner.borrow().grabs.clone()
    }

    pub fn grab_count(&self) -> usize {
        self.inner.borrow().grab_log.len()
    }

    pub fn ungrab_count(&self) -> usize {
        self.inner.borrow().ungrab_log.len()
    }

    pub fn raised(&self) -> Vec<WindowId> {
        self.inner.borrow().raised.clone()
    }

    pub fn closed(&self) -> Vec<WindowId> {
        self.inner.borrow().closed.clone()
    }

    pub fn sent_keys(&self) -> Vec<(WindowId, Keysym, ModMask)> {
        self.inner.borrow().sent_keys.clone()
    }

    pub fn is_minimized(&self, w: WindowId) -> bool {
        self.inner
            .borrow()
            .window(w)
            .map(|win| win.minimized)
            .unwrap_or(false)
    }

    pub fn has_state(&self, w: WindowId, prop: WmStateProp) -> bool {
        self.inner
            .borrow()
            .window(w)
            .map(|win| win.states.contains(&prop))
            .unwrap_or(false)
    }

    pub fn is_decorated(&self, w: WindowId) -> bool {
        self.inner
            .borrow()
            .window(w)
            .map(|win| win.decorated)
            .unwrap_or(false)
    }

    pub fn active_window(&self) -> Option<WindowId> {
        self.inner.borrow().active
    }

    pub fn focused_window(&self) -> Option<WindowId> {
        self.inner.borrow().focused
    }

    pub fn showing_desktop(&self) -> bool {
        self.inner.borrow().showing_desktop
    }

    pub fn set_desktop(&self, desktop: u32) {
        self.inner.borrow_mut().desktop = desktop;
    }

    pub fn flush_count(&self) -> u32 {
        self.inner.borrow().flushes
    }
}

impl WindowSystem for HeadlessWm {
    fn raw_fd(&self) -> RawFd {
        self.wake_rx.as_raw_fd()
    }

    fn modifier_layout(&self) -> Vec<(Keysym, u8)> {
        self.inner.borrow().layout.clone()
    }

    fn grab_key(&self, keysym: Keysym, mods: ModMask) -> Result<(), WmError> {
        let mut inner = self.inner.borrow_mut();
        if inner.fail_grabs.contains(&(keysym, mods)) {
            return Err(WmError::GrabFailed { keysym, mods });
        }
        inner.grabs.push((keysym, mods));
        inner.grab_log.push((keysym, mods));
        Ok(())
    }

    fn ungrab_key(&self, keysym: Keysym, mods: ModMask) -> Result<(), WmError> {
        let mut inner = self.inner.borrow_mut();
        if let Some(pos) = inner.grabs.iter().position(|g| *g == (keysym, mods)) {
            inner.grabs.remove(pos);
        }
        inner.ungrab_log.push((keysym, mods));
        Ok(())
    }

    fn next_notification(&self) -> Option<Notification> {
        let mut byte = [0u8; 1];
        let _ = (&self.wake_rx).read(&mut byte);
        self.inner.borrow_mut().notifications.pop_front()
    }

    fn flush(&self) -> Result<(), WmError> {
        self.inner.borrow_mut().flushes += 1;
        Ok(())
    }

    fn sync(&self) -> Result<(), WmError> {
        self.inner.borrow_mut().syncs += 1;
        Ok(())
    }

    fn list_windows(&self) -> Result<Vec<WindowInfo>, WmError> {
        let inner = self.inner.borrow();
        Ok(inner
            .windows
            .iter()
            .map(|w| {
                let mut info = w.info.clone();
                info.focused = inner.focused == Some(info.id);
                info
            })
            .collect())
    }

    fn raise_window(&self, w: WindowId) -> Result<(), WmError> {
        let mut inner = self.inner.borrow_mut();
        inner.window(w)?;
        inner.raised.push(w);
        Ok(())
    }

    fn close_window(&self, w: WindowId) -> Result<(), WmError> {
        let mut inner = self.inner.borrow_mut();
        let pos = inner
            .windows
            .iter()
            .position(|win| win.info.id == w)
            .ok_or(WmError::UnknownWindow(w))?;
        inner.windows.remove(pos);
        inner.closed.push(w);
        Ok(())
    }

    fn minimize_window(&self, w: WindowId) -> Result<(), WmError> {
        self.inner.borrow_mut().window_mut(w)?.minimized = true;
        Ok(())
    }

    fn activate_window(&self, w: WindowId) -> Result<bool, WmError> {
        let mut inner = self.inner.borrow_mut();
        inner.window(w)?;
        if inner.refuse.contains(&w) {
            return Ok(false);
        }
        inner.active = Some(w);
        inner.focused = Some(w);
        Ok(true)
    }

    fn focus_window(&self, w: WindowId) -> Result<bool, WmError> {
        let mut inner = self.inner.borrow_mut();
        inner.window(w)?;
        if inner.refuse.contains(&w) {
            return Ok(false);
        }
        inner.focused = Some(w);
        Ok(true)
    }

    fn set_wm_state(
        &self,
        w: WindowId,
        prop: WmStateProp,
        action: StateAction,
    ) -> Result<(), WmError> {
        let mut inner = self.inner.borrow_mut();
        let win = inner.window_mut(w)?;
        if action.apply(win.states.contains(&prop)) {
            win.states.insert(prop);
        } else {
            win.states.remove(&prop);
        }
        Ok(())
    }

    fn set_frame(&self, w: WindowId, action: StateAction) -> Result<(), WmError> {
        let mut inner = self.inner.borrow_mut();
        let win = inner.window_mut(w)?;
        win.decorated = action.apply(win.decorated);
        Ok(())
    }

    fn geometry(&self, w: WindowId) -> Result<Geometry, WmError> {
        Ok(self.inner.borrow().window(w)?.geometry)
    }

    fn set_geometry(&self, w: WindowId, change: GeometryChange) -> Result<(), WmError> {
        let mut inner = self.inner.borrow_mut();
        let win = inner.window_mut(w)?;
        win.geometry = change.apply_to(win.geometry);
        Ok(())
    }

    fn frame_extents(&self, w: WindowId) -> Result<FrameExtents, WmError> {
        Ok(self.inner.borrow().window(w)?.frame)
    }

    fn workarea(&self) -> Result<Geometry, WmError> {
        Ok(self.inner.borrow().workarea)
    }

    fn current_desktop(&self) -> Result<u32, WmError> {
        Ok(self.inner.borrow().desktop)
    }

    fn show_desktop(&self, action: StateAction) -> Result<(), WmError> {
        let mut inner = self.inner.borrow_mut();
        inner.showing_desktop = action.apply(inner.showing_desktop);
        Ok(())
    }

    fn send_key(&self, w: WindowId, keysym: Keysym, mods: ModMask) -> Result<(), WmError> {
        let mut inner = self.inner.borrow_mut();
        inner.window(w)?;
        inner.sent_keys.push((w, keysym, mods));
        Ok(())
    }

    fn save_state(&self) -> Result<WmSnapshot, WmError> {
        let inner = self.inner.borrow();
        Ok(WmSnapshot {
            desktop: Some(inner.desktop),
            active_window: inner.active,
            focused_window: inner.focused,
        })
    }

    fn restore_state(&self, snapshot: &WmSnapshot) -> Result<(), WmError> {
        let mut inner = self.inner.borrow_mut();
        if let Some(desktop) = snapshot.desktop {
            inner.desktop = desktop;
        }
        if let Some(w) = snapshot.active_window {
            inner.active = Some(w);
        }
        if let Some(w) = snapshot.focused_window {
            inner.focused = Some(w);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_injected_notifications_drain_in_order() {
        let wm = HeadlessWm::new().unwrap();
        wm.inject_key_press(&[Keysym(0x74)], ModMask(0b100));
        wm.inject(Notification::Other);
        assert!(matches!(
            wm.next_notification(),
            Some(Notification::KeyPress { .. })
        ));
        assert!(matches!(wm.next_notification(), Some(Notification::Other)));
        assert!(wm.next_notification().is_none());
    }

    #[test]
    fn test_grab_failure_injection() {
        let wm = HeadlessWm::new().unwrap();
        wm.fail_grab(Keysym(0x74), ModMask(0b100));
        assert!(matches!(
            wm.grab_key(Keysym(0x74), ModMask(0b100)),
            Err(WmError::GrabFailed { .. })
        ));
        wm.grab_key(Keysym(0x74), ModMask(0b1100)).unwrap();
        assert_eq!(wm.held_grabs().len(), 1);
    }

    #[test]
    fn test_ungrab_releases_held_grab() {
        let wm = HeadlessWm::new().unwrap();
        wm.grab_key(Keysym(0x61), ModMask(0b1)).unwrap();
        wm.ungrab_key(Keysym(0x61), ModMask(0b1)).unwrap();
        assert!(wm.held_grabs().is_empty());
        assert_eq!(wm.grab_count(), 1);
        assert_eq!(wm.ungrab_count(), 1);
    }

    #[test]
    fn test_window_state_toggles() {
        let wm = HeadlessWm::new().unwrap();
        wm.add_simple_window(1, "shell", "xterm");
        let w = WindowId(1);
        wm.set_wm_state(w, WmStateProp::Sticky, StateAction::Toggle)
            .unwrap();
        assert!(wm.has_state(w, WmStateProp::Sticky));
        wm.set_wm_state(w, WmStateProp::Sticky, StateAction::Toggle)
            .unwrap();
        assert!(!wm.has_state(w, WmStateProp::Sticky));
        wm.set_wm_state(w, WmStateProp::Sticky, StateAction::Add)
            .unwrap();
        wm.set_wm_state(w, WmStateProp::Sticky, StateAction::Add)
            .unwrap();
        assert!(wm.has_state(w, WmStateProp::Sticky));
    }

    #[test]
    fn test_close_removes_window() {
        let wm = HeadlessWm::new().unwrap();
        wm.add_simple_window(1, "shell", "xterm");
        wm.close_window(WindowId(1)).unwrap();
        assert!(wm.list_windows().unwrap().is_empty());
        assert!(matches!(
            wm.raise_window(WindowId(1)),
            Err(WmError::UnknownWindow(_))
        ));
    }

    #[test]
    fn test_activation_refusal_reports_false() {
        let wm = HeadlessWm::new().unwrap();
        wm.add_simple_window(1, "shell", "xterm");
        wm.refuse_activation(WindowId(1));
        assert!(!wm.activate_window(WindowId(1)).unwrap());
        assert!(wm.active_window().is_none());
    }

    #[test]
    fn test_focus_is_reflected_in_window_list() {
        let wm = HeadlessWm::new().unwrap();
        wm.add_simple_window(1, "shell", "xterm");
        wm.add_simple_window(2, "page", "Firefox");
        assert!(wm.focus_window(WindowId(2)).unwrap());
        let focused: Vec<WindowId> = wm
            .list_windows()
            .unwrap()
            .into_iter()
            .filter(|w| w.focused)
            .map(|w| w.id)
            .collect();
        assert_eq!(focused, vec![WindowId(2)]);
    }

    #[test]
    fn test_snapshot_save_and_restore() {
        let wm = HeadlessWm::new().unwrap();
        wm.add_simple_window(1, "shell", "xterm");
        wm.set_desktop(3);
        wm.activate_window(WindowId(1)).unwrap();
        let snap = wm.save_state().unwrap();

        wm.set_desktop(0);
        wm.restore_state(&snap).unwrap();
        assert_eq!(wm.current_desktop().unwrap(), 3);
        assert_eq!(wm.active_window(), Some(WindowId(1)));
    }
}
