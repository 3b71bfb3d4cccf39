//! Modifier-bitmask algebra
//!
//! Modifier sets support union, intersection, complement relative to
//! the registry universe, and subset enumeration. Triggers are compiled
//! and matched entirely in terms of the bitmasks produced here.

use std::rc::Rc;

use thiserror::Error;

use super::keysym::Keysym;

/// Raw modifier bitmask as carried in key events and grab requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct ModMask(pub u16);

impl ModMask {
    pub const EMPTY: ModMask = ModMask(0);

    pub fn contains(&self, other: ModMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for ModMask {
    type Output = ModMask;
    fn bitor(self, rhs: ModMask) -> ModMask {
        ModMask(self.0 | rhs.0)
    }
}

impl std::ops::BitAnd for ModMask {
    type Output = ModMask;
    fn bitand(self, rhs: ModMask) -> ModMask {
        ModMask(self.0 & rhs.0)
    }
}

impl std::fmt::Display for ModMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// One named modifier from the window system's modifier mapping.
#[derive(Debug, Clone)]
pub struct Modifier {
    keysym: Keysym,
    bit: u8,
    name: String,
    friendly: String,
}

impl Modifier {
    fn new(keysym: Keysym, bit: u8) -> Self {
        let name = keysym.name().unwrap_or_else(|| keysym.to_string());
        let friendly = keysym.friendly_name().unwrap_or_else(|| name.clone());
        Self {
            keysym,
            bit,
            name,
            friendly,
        }
    }

    pub fn keysym(&self) -> Keysym {
        self.keysym
    }

    pub fn bit(&self) -> u8 {
        self.bit
    }

    pub fn mask(&self) -> ModMask {
        ModMask(1 << self.bit)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn friendly(&self) -> &str {
        &self.friendly
    }
}

impl PartialEq for Modifier {
    fn eq(&self, other: &Self) -> bool {
        self.bit == other.bit && self.name == other.name
    }
}

impl Eq for Modifier {}

impl std::fmt::Display for Modifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.friendly)
    }
}

/// Alias keysyms that share a bit with a preferred name.
const BIT_ALIASES: &[&str] = &["Pointer_EnableKeys", "Shift_Lock"];

/// Shorthand accepted in configuration on top of the friendly names.
const NAME_ALIASES: &[(&str, &str)] = &[
    ("ctrl", "control"),
    ("win", "super"),
    ("cmd", "super"),
    ("lock", "caps_lock"),
];

/// The process-wide modifier registry, built once from the window
/// system's modifier mapping.
#[derive(Debug, Clone, Default)]
pub struct ModifierMap {
    mods: Vec<Rc<Modifier>>,
}

impl ModifierMap {
    /// Build the registry from `(keysym, bit)` layout rows. Rows with
    /// no bound keysym are skipped; duplicates collapse to the first.
    pub fn from_layout(layout: &[(Keysym, u8)]) -> Self {
        let mut mods: Vec<Rc<Modifier>> = Vec::new();
        for &(keysym, bit) in layout {
            if keysym.0 == 0 || bit > 15 {
                continue;
            }
            let m = Modifier::new(keysym, bit);
            if !mods.iter().any(|e| **e == m) {
                mods.push(Rc::new(m));
            }
        }
        Self { mods }
    }

    pub fn len(&self) -> usize {
        self.mods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mods.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rc<Modifier>> {
        self.mods.iter()
    }

    /// Every populated bit, represented by one preferred modifier each.
    /// Alias names (`Pointer_EnableKeys` on the `Num_Lock` bit) lose to
    /// the non-alias sharing their bit.
    pub fn universe(&self) -> Modifiers {
        let mut result = Modifiers::default();
        let mut seen = ModMask::EMPTY;
        for m in &self.mods {
            if !(seen & m.mask()).is_empty() {
                continue;
            }
            seen = seen | m.mask();
            let preferred = if BIT_ALIASES.contains(&m.name()) {
                self.mods
                    .iter()
                    .find(|c| c.bit() == m.bit() && !BIT_ALIASES.contains(&c.name()))
                    .unwrap_or(m)
            } else {
                m
            };
            result.push(Rc::clone(preferred));
        }
        result
    }

    pub fn universe_mask(&self) -> ModMask {
        self.mods
            .iter()
            .fold(ModMask::EMPTY, |acc, m| acc | m.mask())
    }

    /// Resolve a configuration token: canonical name, case-insensitive
    /// canonical, case-insensitive friendly, then shorthand aliases.
    pub fn by_name(&self, token: &str) -> Option<Rc<Modifier>> {
        if let Some(m) = self.mods.iter().find(|m| m.name() == token) {
            return Some(Rc::clone(m));
        }
        if let Some(m) = self
            .mods
            .iter()
            .find(|m| m.name().eq_ignore_ascii_case(token))
        {
            return Some(Rc::clone(m));
        }
        if let Some(m) = self
            .mods
            .iter()
            .find(|m| m.friendly().eq_ignore_ascii_case(token))
        {
            return Some(Rc::clone(m));
        }
        let lowered = token.to_ascii_lowercase();
        let target = NAME_ALIASES
            .iter()
            .find(|(alias, _)| *alias == lowered)
            .map(|(_, target)| *target)?;
        self.mods
            .iter()
            .find(|m| m.friendly().eq_ignore_ascii_case(target))
            .map(Rc::clone)
    }

    pub fn by_keysym(&self, keysym: Keysym) -> Option<Rc<Modifier>> {
        self.mods.iter().find(|m| m.keysym() == keysym).map(Rc::clone)
    }
}

/// An ordered, de-duplicated set of modifiers.
#[derive(Debug, Clone, Default)]
pub struct Modifiers {
    mods: Vec<Rc<Modifier>>,
}

impl Modifiers {
    pub fn push(&mut self, m: Rc<Modifier>) {
        if !self.mods.iter().any(|e| **e == *m) {
            self.mods.push(m);
        }
    }

    pub fn contains(&self, m: &Modifier) -> bool {
        self.mods.iter().any(|e| **e == *m)
    }

    pub fn len(&self) -> usize {
        self.mods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mods.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rc<Modifier>> {
        self.mods.iter()
    }

    pub fn mask(&self) -> ModMask {
        self.mods
            .iter()
            .fold(ModMask::EMPTY, |acc, m| acc | m.mask())
    }

    pub fn union(&self, other: &Modifiers) -> Modifiers {
        let mut result = self.clone();
        for m in &other.mods {
            result.push(Rc::clone(m));
        }
        result
    }

    pub fn intersection(&self, other: &Modifiers) -> Modifiers {
        self.mods
            .iter()
            .filter(|m| other.contains(m))
            .cloned()
            .collect()
    }

    /// Members of the registry universe on bits this set does not touch.
    pub fn complement(&self, map: &ModifierMap) -> Modifiers {
        let mask = self.mask();
        map.universe()
            .iter()
            .filter(|m| (m.mask() & mask).is_empty())
            .cloned()
            .collect()
    }

    /// All subsets over this set's distinct bits, built by doubling:
    /// the empty set first, the full set last, 2^k in total for k bits.
    pub fn subsets(&self) -> Vec<Modifiers> {
        let mut result = vec![Modifiers::default()];
        let mut seen = ModMask::EMPTY;
        for m in &self.mods {
            if !(seen & m.mask()).is_empty() {
                continue;
            }
            seen = seen | m.mask();
            let mut grown = Vec::with_capacity(result.len() * 2);
            for s in &result {
                grown.push(s.clone());
                let mut with = s.clone();
                with.push(Rc::clone(m));
                grown.push(with);
            }
            result = grown;
        }
        result
    }
}

impl FromIterator<Rc<Modifier>> for Modifiers {
    fn from_iter<I: IntoIterator<Item = Rc<Modifier>>>(iter: I) -> Self {
        let mut result = Modifiers::default();
        for m in iter {
            result.push(m);
        }
        result
    }
}

impl std::fmt::Display for Modifiers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.mods.iter().map(|m| m.friendly()).collect();
        write!(f, "{}", names.join("+"))
    }
}

/// A parsed chord: a keysym plus its effective modifier set.
///
/// A leading `not ` inside the modifier list flips the chord to "the
/// complement of the listed modifiers"; the effective set is resolved
/// against the registry at parse time.
#[derive(Debug, Clone)]
pub struct Key {
    keysym: Keysym,
    named: Modifiers,
    negated: bool,
    effective: Modifiers,
    text: String,
}

impl Key {
    /// Parse `a+b+c` chord text: each token is a modifier name if the
    /// registry knows it, otherwise a keysym. Exactly one keysym token
    /// is required.
    pub fn parse(descr: &str, map: &ModifierMap) -> Result<Key, KeyParseError> {
        let (mods, negated, keysym) = parse_tokens(descr, map, true)?;
        let keysym = keysym.ok_or_else(|| KeyParseError::MissingKey(descr.to_string()))?;
        let effective = if negated {
            mods.complement(map)
        } else {
            mods.clone()
        };
        Ok(Key {
            keysym,
            named: mods,
            negated,
            effective,
            text: descr.trim().to_string(),
        })
    }

    pub fn keysym(&self) -> Keysym {
        self.keysym
    }

    /// The effective modifier set (complemented when negated).
    pub fn mods(&self) -> &Modifiers {
        &self.effective
    }

    pub fn mask(&self) -> ModMask {
        self.effective.mask()
    }

    pub fn named_mods(&self) -> &Modifiers {
        &self.named
    }

    pub fn negated(&self) -> bool {
        self.negated
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.keysym == other.keysym && self.mask() == other.mask()
    }
}

impl Eq for Key {}

impl std::hash::Hash for Key {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.keysym.hash(state);
        self.mask().hash(state);
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.text)
    }
}

/// Parse a modifiers-only spec such as a filter mask. Negation resolves
/// to the complement of the listed set.
pub fn parse_mod_spec(descr: &str, map: &ModifierMap) -> Result<Modifiers, KeyParseError> {
    let (mods, negated, _) = parse_tokens(descr, map, false)?;
    Ok(if negated { mods.complement(map) } else { mods })
}

fn parse_tokens(
    descr: &str,
    map: &ModifierMap,
    allow_keysym: bool,
) -> Result<(Modifiers, bool, Option<Keysym>), KeyParseError> {
    let mut negated = false;
    let mut mods = Modifiers::default();
    let mut keysym = None;
    for raw in descr.split('+') {
        let mut token = raw.trim();
        while let Some(rest) = token.strip_prefix("not ") {
            negated = !negated;
            token = rest.trim_start();
        }
        if token.is_empty() {
            return Err(KeyParseError::EmptyToken(descr.to_string()));
        }
        if let Some(m) = map.by_name(token) {
            mods.push(m);
            continue;
        }
        if !allow_keysym {
            return Err(KeyParseError::NotAModifier {
                token: token.to_string(),
                descr: descr.to_string(),
            });
        }
        match Keysym::from_name(token) {
            Some(ks) => {
                if keysym.replace(ks).is_some() {
                    return Err(KeyParseError::MultipleKeys(descr.to_string()));
                }
            }
            None => {
                return Err(KeyParseError::UnknownToken {
                    token: token.to_string(),
                    descr: descr.to_string(),
                })
            }
        }
    }
    Ok((mods, negated, keysym))
}

/// Errors from chord and filter-mask parsing.
#[derive(Debug, Error)]
pub enum KeyParseError {
    #[error("unknown key or modifier {token:?} in {descr:?}")]
    UnknownToken { token: String, descr: String },

    #[error("{token:?} is not a modifier in {descr:?}")]
    NotAModifier { token: String, descr: String },

    #[error("no key in chord {0:?}")]
    MissingKey(String),

    #[error("more than one key in chord {0:?}")]
    MultipleKeys(String),

    #[error("empty token in {0:?}")]
    EmptyToken(String),
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// shift, lock, control, alt, num-lock (with an alias on its bit),
    /// super: the layout most algebra tests run against.
    pub(crate) fn layout() -> ModifierMap {
        ModifierMap::from_layout(&[
            (Keysym::from_name("Shift_L").unwrap(), 0),
            (Keysym::from_name("Caps_Lock").unwrap(), 1),
            (Keysym::from_name("Control_L").unwrap(), 2),
            (Keysym::from_name("Control_R").unwrap(), 2),
            (Keysym::from_name("Alt_L").unwrap(), 3),
            (Keysym::from_name("Num_Lock").unwrap(), 4),
            (Keysym::from_name("Pointer_EnableKeys").unwrap(), 4),
            (Keysym::from_name("Super_L").unwrap(), 6),
            (Keysym(0), 7),
        ])
    }

    /// control, alt, super only; for tests that enumerate grabs.
    pub(crate) fn small_layout() -> ModifierMap {
        ModifierMap::from_layout(&[
            (Keysym::from_name("Control_L").unwrap(), 2),
            (Keysym::from_name("Alt_L").unwrap(), 3),
            (Keysym::from_name("Super_L").unwrap(), 6),
        ])
    }

    pub(crate) fn mods(map: &ModifierMap, names: &[&str]) -> Modifiers {
        names
            .iter()
            .map(|n| map.by_name(n).unwrap_or_else(|| panic!("no {n}")))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::{layout as test_layout, mods};
    use super::*;

    #[test]
    fn test_registry_skips_unbound_rows_and_dedups() {
        let map = test_layout();
        // 8 rows, one unbound, one exact duplicate would collapse; the
        // Control_R row is a distinct modifier on the same bit.
        assert_eq!(map.len(), 8);
        assert_eq!(map.universe_mask(), ModMask(0b0101_1111));
    }

    #[test]
    fn test_universe_prefers_non_alias_names() {
        let map = test_layout();
        let universe = map.universe();
        // One member per populated bit.
        assert_eq!(universe.len(), 6);
        assert!(universe.iter().any(|m| m.name() == "Num_Lock"));
        assert!(!universe.iter().any(|m| m.name() == "Pointer_EnableKeys"));
    }

    #[test]
    fn test_by_name_aliases_and_case() {
        let map = test_layout();
        assert_eq!(map.by_name("Control_L").unwrap().bit(), 2);
        assert_eq!(map.by_name("control").unwrap().bit(), 2);
        assert_eq!(map.by_name("ctrl").unwrap().bit(), 2);
        assert_eq!(map.by_name("ALT").unwrap().bit(), 3);
        assert_eq!(map.by_name("win").unwrap().bit(), 6);
        assert!(map.by_name("hyper").is_none());
    }

    #[test]
    fn test_complement_is_universe_minus_set() {
        let map = test_layout();
        let m = mods(&map, &["control"]);
        let c = m.complement(&map);
        assert_eq!(c.mask(), ModMask(map.universe_mask().0 & !m.mask().0));
    }

    #[test]
    fn test_complement_is_an_involution_on_masks() {
        let map = test_layout();
        let m = mods(&map, &["control", "alt"]);
        assert_eq!(m.complement(&map).complement(&map).mask(), m.mask());
    }

    #[test]
    fn test_subset_enumeration_doubles_per_bit() {
        let map = test_layout();
        let m = mods(&map, &["shift", "control", "alt"]);
        let subsets = m.subsets();
        assert_eq!(subsets.len(), 8);
        let masks: std::collections::HashSet<u16> =
            subsets.iter().map(|s| s.mask().0).collect();
        assert_eq!(masks.len(), 8, "subset masks must be pairwise distinct");
        assert!(masks.contains(&0));
        assert!(masks.contains(&m.mask().0));
    }

    #[test]
    fn test_subsets_count_shared_bits_once() {
        let map = test_layout();
        let mut m = mods(&map, &["Control_L"]);
        m.push(map.by_name("Control_R").unwrap());
        assert_eq!(m.len(), 2);
        assert_eq!(m.subsets().len(), 2);
    }

    #[test]
    fn test_union_and_intersection() {
        let map = test_layout();
        let a = mods(&map, &["shift", "control"]);
        let b = mods(&map, &["control", "alt"]);
        assert_eq!(a.union(&b).mask(), ModMask(0b1101));
        assert_eq!(a.intersection(&b).mask(), ModMask(0b0100));
    }

    #[test]
    fn test_key_parse_plain_chord() {
        let map = test_layout();
        let key = Key::parse("ctrl+alt+t", &map).unwrap();
        assert_eq!(key.keysym(), Keysym(0x74));
        assert_eq!(key.mask(), ModMask(0b1100));
        assert!(!key.negated());
    }

    #[test]
    fn test_key_parse_negated_chord() {
        let map = test_layout();
        let key = Key::parse("not num_lock+F1", &map).unwrap();
        assert_eq!(key.keysym(), Keysym::from_name("F1").unwrap());
        assert!(key.negated());
        // Everything in the universe except the num-lock bit.
        assert_eq!(
            key.mask(),
            ModMask(map.universe_mask().0 & !(1 << 4))
        );
    }

    #[test]
    fn test_key_parse_double_negation_cancels() {
        let map = test_layout();
        let key = Key::parse("not shift+not lock+x", &map).unwrap();
        assert!(!key.negated());
        assert_eq!(key.mask(), ModMask(0b0011));
    }

    #[test]
    fn test_key_parse_errors() {
        let map = test_layout();
        assert!(matches!(
            Key::parse("ctrl+alt", &map),
            Err(KeyParseError::MissingKey(_))
        ));
        assert!(matches!(
            Key::parse("ctrl+t+u", &map),
            Err(KeyParseError::MultipleKeys(_))
        ));
        assert!(matches!(
            Key::parse("ctrl+NoSuchKey+t", &map),
            Err(KeyParseError::UnknownToken { .. })
        ));
        assert!(matches!(
            Key::parse("ctrl++t", &map),
            Err(KeyParseError::EmptyToken(_))
        ));
    }

    #[test]
    fn test_keys_equal_by_keysym_and_effective_mask() {
        let map = test_layout();
        let a = Key::parse("Control_L+t", &map).unwrap();
        let b = Key::parse("ctrl+t", &map).unwrap();
        assert_eq!(a, b);
        let c = Key::parse("ctrl+u", &map).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_mod_spec_parsing() {
        let map = test_layout();
        let spec = parse_mod_spec("ctrl+alt", &map).unwrap();
        assert_eq!(spec.mask(), ModMask(0b1100));

        let negated = parse_mod_spec("not num_lock", &map).unwrap();
        assert_eq!(
            negated.mask(),
            ModMask(map.universe_mask().0 & !(1 << 4))
        );

        assert!(matches!(
            parse_mod_spec("ctrl+t", &map),
            Err(KeyParseError::NotAModifier { .. })
        ));
    }
}
