//! Named window queries
//!
//! A `[match.NAME]` config section compiles into a [`WindowQuery`]: glob
//! patterns over window fields plus flag checks, combined with any/all.

use std::cell::RefCell;
use std::collections::HashMap;

use globset::{Glob, GlobMatcher};
use serde::Deserialize;

use super::{WindowInfo, WindowSystem, WmError};

/// How the individual criteria of a query combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    Any,
    #[default]
    All,
}

/// Raw fields of a `[match.NAME]` section. `pid` is a glob over the
/// decimal pid text.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryFields {
    pub title: Option<String>,
    pub class: Option<String>,
    pub instance: Option<String>,
    pub pid: Option<String>,
    pub focused: Option<bool>,
    pub toplevel: Option<bool>,
    #[serde(default, rename = "match")]
    pub combine: MatchMode,
}

/// A compiled window query. A query with no criteria matches every
/// window.
#[derive(Debug, Clone)]
pub struct WindowQuery {
    name: String,
    title: Option<GlobMatcher>,
    class: Option<GlobMatcher>,
    instance: Option<GlobMatcher>,
    pid: Option<GlobMatcher>,
    focused: Option<bool>,
    toplevel: Option<bool>,
    mode: MatchMode,
}

impl WindowQuery {
    pub fn compile(name: &str, fields: &QueryFields) -> Result<Self, globset::Error> {
        fn glob(pattern: &Option<String>) -> Result<Option<GlobMatcher>, globset::Error> {
            pattern
                .as_deref()
                .map(|p| Glob::new(p).map(|g| g.compile_matcher()))
                .transpose()
        }
        Ok(Self {
            name: name.to_string(),
            title: glob(&fields.title)?,
            class: glob(&fields.class)?,
            instance: glob(&fields.instance)?,
            pid: glob(&fields.pid)?,
            focused: fields.focused,
            toplevel: fields.toplevel,
            mode: fields.combine,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matches(&self, info: &WindowInfo) -> bool {
        let mut checks = Vec::new();
        if let Some(m) = &self.title {
            checks.push(m.is_match(&info.title));
        }
        if let Some(m) = &self.class {
            checks.push(m.is_match(&info.class));
        }
        if let Some(m) = &self.instance {
            checks.push(m.is_match(&info.instance));
        }
        if let Some(m) = &self.pid {
            checks.push(match info.pid {
                Some(pid) => m.is_match(pid.to_string()),
                None => false,
            });
        }
        if let Some(want) = self.focused {
            checks.push(info.focused == want);
        }
        if let Some(want) = self.toplevel {
            checks.push(info.toplevel == want);
        }
        if checks.is_empty() {
            return true;
        }
        match self.mode {
            MatchMode::Any => checks.iter().any(|&ok| ok),
            MatchMode::All => checks.iter().all(|&ok| ok),
        }
    }

    /// Filter the backend's window list through this query.
    pub fn select(&self, wm: &dyn WindowSystem) -> Result<Vec<WindowInfo>, WmError> {
        Ok(wm
            .list_windows()?
            .into_iter()
            .filter(|w| self.matches(w))
            .collect())
    }
}

/// The named queries loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct MatcherRegistry {
    queries: RefCell<HashMap<String, WindowQuery>>,
}

impl MatcherRegistry {
    pub fn insert(&self, query: WindowQuery) {
        self.queries.borrow_mut().insert(query.name.clone(), query);
    }

    pub fn get(&self, name: &str) -> Option<WindowQuery> {
        self.queries.borrow().get(name).cloned()
    }

    /// Swap in another set of queries. Contexts holding this registry
    /// see the new entries on their next lookup.
    pub fn replace(&self, other: &MatcherRegistry) {
        *self.queries.borrow_mut() = other.queries.borrow().clone();
    }

    pub fn len(&self) -> usize {
        self.queries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.borrow().is_empty()
    }
}
