//! Trigger compilation and matching
//!
//! A level's triggers compile into concrete grab registrations: for
//! each trigger, every subset of its don't-care set (the complement of
//! its filter) widens the chord mask into one grab. Matching compares
//! physical state on the filter and chord bits only; chord bits are
//! required exactly.

use std::collections::HashMap;

use thiserror::Error;

use super::keys::{Key, ModMask, ModifierMap, Modifiers};
use super::keysym::Keysym;
use crate::actions::Action;

/// One configured binding: a chord, the modifier bits compared exactly
/// (the filter), and either an action or a nested level.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub key: Key,
    pub filter: Modifiers,
    pub action: Option<Action>,
    pub nested: Option<TriggerSet>,
    pub label: String,
}

impl Trigger {
    /// A trigger that declares no filter defaults to comparing exactly
    /// the chord's own modifiers.
    pub fn new(
        label: impl Into<String>,
        key: Key,
        filter: Option<Modifiers>,
        action: Option<Action>,
        nested: Option<TriggerSet>,
    ) -> Self {
        let filter = filter.unwrap_or_else(|| key.mods().clone());
        Self {
            key,
            filter,
            action,
            nested,
            label: label.into(),
        }
    }
}

/// The ordered triggers of one level.
#[derive(Debug, Clone, Default)]
pub struct TriggerSet {
    pub name: String,
    pub triggers: Vec<Trigger>,
}

/// One concrete compiled binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapEntry {
    pub keysym: Keysym,
    /// chord bits | one enumerated don't-care subset
    pub grab_mask: ModMask,
    /// filter bits | chord bits
    pub match_mask: ModMask,
    /// chord bits
    pub required: ModMask,
    /// index into the owning level's triggers
    pub trigger: usize,
}

/// The compiled form of one level: per-keysym ordered entry lists plus
/// the distinct grabs to register.
#[derive(Debug, Default)]
pub struct CompiledLevel {
    entries: HashMap<Keysym, Vec<MapEntry>>,
    grabs: Vec<(Keysym, ModMask)>,
}

impl CompiledLevel {
    pub fn compile(set: &TriggerSet, map: &ModifierMap) -> Result<Self, CompileError> {
        let mut level = CompiledLevel::default();
        for (idx, trigger) in set.triggers.iter().enumerate() {
            let chord_mask = trigger.key.mask();
            let match_mask = chord_mask | trigger.filter.mask();
            let dont_care = trigger.filter.complement(map);
            let mut seen = Vec::new();
            for subset in dont_care.subsets() {
                let grab_mask = chord_mask | subset.mask();
                if seen.contains(&grab_mask) {
                    continue;
                }
                seen.push(grab_mask);
                level.add_entry(
                    &set.triggers,
                    MapEntry {
                        keysym: trigger.key.keysym(),
                        grab_mask,
                        match_mask,
                        required: chord_mask,
                        trigger: idx,
                    },
                )?;
            }
        }
        Ok(level)
    }

    fn add_entry(&mut self, triggers: &[Trigger], entry: MapEntry) -> Result<(), CompileError> {
        let list = self.entries.entry(entry.keysym).or_default();
        for existing in list.iter() {
            let identical = existing.grab_mask == entry.grab_mask
                && existing.match_mask == entry.match_mask
                && existing.required == entry.required;
            if identical && existing.trigger != entry.trigger {
                return Err(CompileError::DuplicateBinding {
                    keysym: entry.keysym,
                    mask: entry.grab_mask,
                    first: triggers[existing.trigger].label.clone(),
                    second: triggers[entry.trigger].label.clone(),
                });
            }
            if identical {
                return Ok(());
            }
        }
        list.push(entry);
        if !self.grabs.contains(&(entry.keysym, entry.grab_mask)) {
            self.grabs.push((entry.keysym, entry.grab_mask));
        }
        Ok(())
    }

    /// The distinct (keysym, grab mask) pairs this level registers.
    pub fn grabs(&self) -> &[(Keysym, ModMask)] {
        &self.grabs
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// First entry matching the physical state, scanning the candidate
    /// key ids in order, each entry list in declaration order. Bits
    /// outside an entry's match mask are don't-care.
    pub fn find_entry(&self, keysyms: &[Keysym], state: ModMask) -> Option<&MapEntry> {
        for ks in keysyms {
            if let Some(list) = self.entries.get(ks) {
                for entry in list {
                    if state & entry.match_mask == entry.required {
                        return Some(entry);
                    }
                }
            }
        }
        None
    }
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("bindings {first:?} and {second:?} compile to the same grab of {keysym} with mask {mask}")]
    DuplicateBinding {
        keysym: Keysym,
        mask: ModMask,
        first: String,
        second: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hotkey::keys::testutil::{layout, mods, small_layout};

    fn trigger(map: &ModifierMap, chord: &str, filter: Option<&[&str]>) -> Trigger {
        Trigger::new(
            chord,
            Key::parse(chord, map).unwrap(),
            filter.map(|names| mods(map, names)),
            None,
            None,
        )
    }

    fn level(map: &ModifierMap, triggers: Vec<Trigger>) -> CompiledLevel {
        CompiledLevel::compile(
            &TriggerSet {
                name: "test".into(),
                triggers,
            },
            map,
        )
        .unwrap()
    }

    #[test]
    fn test_unfiltered_chord_grabs_every_dont_care_subset() {
        // Universe {control, alt, super}; the default filter is the
        // chord's own modifiers, so only the super bit is don't-care.
        let map = small_layout();
        let lvl = level(&map, vec![trigger(&map, "ctrl+alt+t", None)]);

        let t = Keysym::from_name("t").unwrap();
        let ctrl_alt = ModMask(0b1100);
        let with_super = ModMask(0b1100 | (1 << 6));
        assert_eq!(lvl.grabs().len(), 2);
        assert!(lvl.grabs().contains(&(t, ctrl_alt)));
        assert!(lvl.grabs().contains(&(t, with_super)));

        assert!(lvl.find_entry(&[t], ctrl_alt).is_some());
        assert!(lvl.find_entry(&[t], with_super).is_some());
        assert!(lvl.find_entry(&[t], ModMask(0b0100)).is_none());
    }

    #[test]
    fn test_match_rule_compares_filter_and_chord_bits_only() {
        // Chord ctrl+t with filter {alt}: alt must be absent, ctrl must
        // be present, every other bit is ignored.
        let map = layout();
        let lvl = level(&map, vec![trigger(&map, "ctrl+t", Some(&["alt"]))]);

        let t = Keysym::from_name("t").unwrap();
        let ctrl = 0b100u16;
        let alt = 0b1000u16;
        let num = 1u16 << 4;
        assert!(lvl.find_entry(&[t], ModMask(ctrl)).is_some());
        assert!(lvl.find_entry(&[t], ModMask(ctrl | num)).is_some());
        assert!(lvl.find_entry(&[t], ModMask(ctrl | alt)).is_none());
        assert!(lvl.find_entry(&[t], ModMask(alt)).is_none());
        assert!(lvl.find_entry(&[t], ModMask(0)).is_none());
    }

    #[test]
    fn test_empty_filter_ignores_all_other_bits() {
        let map = layout();
        let mut t = trigger(&map, "ctrl+t", None);
        t.filter = Modifiers::default();
        let lvl = level(&map, vec![t]);

        let ks = Keysym::from_name("t").unwrap();
        let ctrl = 0b100u16;
        let everything = map.universe_mask().0;
        assert!(lvl.find_entry(&[ks], ModMask(ctrl)).is_some());
        assert!(lvl.find_entry(&[ks], ModMask(everything)).is_some());
        assert!(lvl.find_entry(&[ks], ModMask(everything & !ctrl)).is_none());
    }

    #[test]
    fn test_identical_bindings_from_two_triggers_are_an_error() {
        let map = small_layout();
        let result = CompiledLevel::compile(
            &TriggerSet {
                name: "test".into(),
                triggers: vec![
                    trigger(&map, "ctrl+t", None),
                    trigger(&map, "ctrl+t", None),
                ],
            },
            &map,
        );
        assert!(matches!(
            result,
            Err(CompileError::DuplicateBinding { .. })
        ));
    }

    #[test]
    fn test_overlapping_distinct_bindings_resolve_by_declaration_order() {
        let map = small_layout();
        let first = trigger(&map, "ctrl+t", Some(&["ctrl", "alt"]));
        let second = trigger(&map, "ctrl+t", Some(&["ctrl"]));
        let lvl = level(&map, vec![first, second]);

        // State ctrl satisfies both; the first declared wins.
        let ks = Keysym::from_name("t").unwrap();
        let hit = lvl.find_entry(&[ks], ModMask(0b100)).unwrap();
        assert_eq!(hit.trigger, 0);

        // Only the second tolerates alt being held.
        let hit = lvl.find_entry(&[ks], ModMask(0b1100)).unwrap();
        assert_eq!(hit.trigger, 1);
    }

    #[test]
    fn test_candidate_keysyms_scan_in_order() {
        let map = small_layout();
        let lvl = level(&map, vec![trigger(&map, "ctrl+T", None)]);
        let t = Keysym::from_name("t").unwrap();
        let shifted = Keysym::from_name("T").unwrap();
        let hit = lvl.find_entry(&[t, shifted], ModMask(0b100)).unwrap();
        assert_eq!(hit.keysym, shifted);
    }

    #[test]
    fn test_empty_set_compiles_to_empty_level() {
        let map = small_layout();
        let lvl = level(&map, Vec::new());
        assert!(lvl.is_empty());
        assert!(lvl.grabs().is_empty());
        assert!(lvl
            .find_entry(&[Keysym::from_name("t").unwrap()], ModMask(0))
            .is_none());
    }

    #[test]
    fn test_shared_grabs_between_triggers_are_not_duplicated() {
        // ctrl+t widens over {alt, super} and ctrl+alt+t over {super},
        // so both produce the grab (t, ctrl|alt); the list carries it
        // once.
        let map = small_layout();
        let first = trigger(&map, "ctrl+t", None);
        let second = trigger(&map, "ctrl+alt+t", None);
        let lvl = level(&map, vec![first, second]);
        let t = Keysym::from_name("t").unwrap();
        let shared = (t, ModMask(0b1100));
        assert_eq!(
            lvl.grabs().iter().filter(|g| **g == shared).count(),
            1
        );
        assert_eq!(lvl.grabs().len(), 4);
    }
}
