//! Key identifier registry
//!
//! Names follow the X keysym vocabulary: printable Latin-1 characters
//! are their own codepoint, everything else comes from a static table.
//! The table carries what a hotkey configuration plausibly binds;
//! backends are free to hand out values beyond it.

use serde::{Deserialize, Serialize};

/// A window-system key identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Keysym(pub u32);

/// Canonical name to value. Modifier names first; the parser prefers
/// modifiers, so order within the table does not matter beyond reading.
const NAMES: &[(&str, u32)] = &[
    ("Shift_L", 0xffe1),
    ("Shift_R", 0xffe2),
    ("Control_L", 0xffe3),
    ("Control_R", 0xffe4),
    ("Caps_Lock", 0xffe5),
    ("Shift_Lock", 0xffe6),
    ("Meta_L", 0xffe7),
    ("Meta_R", 0xffe8),
    ("Alt_L", 0xffe9),
    ("Alt_R", 0xffea),
    ("Super_L", 0xffeb),
    ("Super_R", 0xffec),
    ("Hyper_L", 0xffed),
    ("Hyper_R", 0xffee),
    ("Num_Lock", 0xff7f),
    ("Scroll_Lock", 0xff14),
    ("Mode_switch", 0xff7e),
    ("ISO_Level3_Shift", 0xfe03),
    ("Pointer_EnableKeys", 0xfef9),
    // Editing and motion
    ("BackSpace", 0xff08),
    ("Tab", 0xff09),
    ("Return", 0xff0d),
    ("Pause", 0xff13),
    ("Escape", 0xff1b),
    ("Home", 0xff50),
    ("Left", 0xff51),
    ("Up", 0xff52),
    ("Right", 0xff53),
    ("Down", 0xff54),
    ("Page_Up", 0xff55),
    ("Page_Down", 0xff56),
    ("End", 0xff57),
    ("Insert", 0xff63),
    ("Menu", 0xff67),
    ("Print", 0xff61),
    ("Delete", 0xffff),
    ("space", 0x0020),
    // Function keys
    ("F1", 0xffbe),
    ("F2", 0xffbf),
    ("F3", 0xffc0),
    ("F4", 0xffc1),
    ("F5", 0xffc2),
    ("F6", 0xffc3),
    ("F7", 0xffc4),
    ("F8", 0xffc5),
    ("F9", 0xffc6),
    ("F10", 0xffc7),
    ("F11", 0xffc8),
    ("F12", 0xffc9),
    // Media keys
    ("XF86MonBrightnessUp", 0x1008ff02),
    ("XF86MonBrightnessDown", 0x1008ff03),
    ("XF86AudioLowerVolume", 0x1008ff11),
    ("XF86AudioMute", 0x1008ff12),
    ("XF86AudioRaiseVolume", 0x1008ff13),
    ("XF86AudioPlay", 0x1008ff14),
    ("XF86AudioStop", 0x1008ff15),
    ("XF86AudioPrev", 0x1008ff16),
    ("XF86AudioNext", 0x1008ff17),
    ("XF86Calculator", 0x1008ff1d),
    ("XF86Sleep", 0x1008ff2f),
    ("XF86AudioMicMute", 0x1008ffb2),
];

impl Keysym {
    /// Resolve a configuration token to a keysym: exact table name,
    /// then case-insensitive table name, then a single printable
    /// Latin-1 character as its own codepoint.
    pub fn from_name(name: &str) -> Option<Keysym> {
        if let Some(&(_, value)) = NAMES.iter().find(|(n, _)| *n == name) {
            return Some(Keysym(value));
        }
        if let Some(&(_, value)) = NAMES.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            return Some(Keysym(value));
        }
        let mut chars = name.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) if (c as u32) >= 0x20 && (c as u32) <= 0xff => {
                Some(Keysym(c as u32))
            }
            _ => None,
        }
    }

    /// The canonical name, if the value is in the table or printable.
    pub fn name(&self) -> Option<String> {
        if let Some(&(name, _)) = NAMES.iter().find(|(_, v)| *v == self.0) {
            return Some(name.to_string());
        }
        match char::from_u32(self.0) {
            Some(c) if self.0 >= 0x21 && self.0 <= 0xff => Some(c.to_string()),
            _ => None,
        }
    }

    /// The canonical name with any `_L`/`_R` suffix dropped.
    pub fn friendly_name(&self) -> Option<String> {
        self.name().map(|n| {
            n.strip_suffix("_L")
                .or_else(|| n.strip_suffix("_R"))
                .map(str::to_string)
                .unwrap_or(n)
        })
    }
}

impl std::fmt::Display for Keysym {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "keysym:0x{:x}", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_lookup() {
        assert_eq!(Keysym::from_name("Return"), Some(Keysym(0xff0d)));
        assert_eq!(Keysym::from_name("Num_Lock"), Some(Keysym(0xff7f)));
        assert_eq!(Keysym::from_name("XF86AudioMicMute"), Some(Keysym(0x1008ffb2)));
    }

    #[test]
    fn test_case_insensitive_lookup() {
        assert_eq!(Keysym::from_name("return"), Some(Keysym(0xff0d)));
        assert_eq!(Keysym::from_name("num_lock"), Some(Keysym(0xff7f)));
        assert_eq!(Keysym::from_name("ESCAPE"), Some(Keysym(0xff1b)));
    }

    #[test]
    fn test_single_character_is_its_codepoint() {
        assert_eq!(Keysym::from_name("t"), Some(Keysym(0x74)));
        assert_eq!(Keysym::from_name("T"), Some(Keysym(0x54)));
        assert_eq!(Keysym::from_name("7"), Some(Keysym(0x37)));
        assert_eq!(Keysym::from_name("ä"), Some(Keysym(0xe4)));
    }

    #[test]
    fn test_unknown_name() {
        assert_eq!(Keysym::from_name("NoSuchKey"), None);
        assert_eq!(Keysym::from_name(""), None);
    }

    #[test]
    fn test_reverse_lookup_and_display() {
        assert_eq!(Keysym(0xff0d).name().as_deref(), Some("Return"));
        assert_eq!(Keysym(0x74).name().as_deref(), Some("t"));
        assert_eq!(Keysym(0xffe3).friendly_name().as_deref(), Some("Control"));
        assert_eq!(format!("{}", Keysym(0xffe9)), "Alt_L");
        assert_eq!(format!("{}", Keysym(0x12345678)), "keysym:0x12345678");
    }
}
