//! Configuration loading
//!
//! A TOML file describes the trigger tree, the action table and the
//! window matchers. Strings pass through shellexpand, with `--option`
//! overrides consulted before the environment. Loading produces plain
//! data; compiling it against a backend's modifier map happens in
//! `build_listener`.

use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::actions::{Action, ActionRegistry};
use crate::hotkey::{
    parse_mod_spec, CompileError, Key, KeyParseError, Listener, ModifierMap, Trigger, TriggerSet,
};
use crate::wm::{MatcherRegistry, QueryFields, WindowQuery};

const DEFAULT_RELOAD_POLL: Duration = Duration::from_secs(4);

/// A loaded and validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub path: PathBuf,
    mtime: Option<SystemTime>,
    /// `[daemon] socket`, overridable on the command line.
    pub socket: Option<PathBuf>,
    pub reload_poll: Duration,
    pub root: TriggerSet,
    /// `[start] execute` actions, run once at daemon start.
    pub startup: Vec<Action>,
    pub actions: ActionRegistry,
    pub matchers: MatcherRegistry,
}

impl Config {
    pub fn load(
        path: &Path,
        map: &ModifierMap,
        options: &HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        let mtime = fs::metadata(path).and_then(|m| m.modified()).ok();
        let file: ConfigFile = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;
        let expander = Expander { options };

        let matchers = MatcherRegistry::default();
        for (name, fields) in &file.matchers {
            let query = WindowQuery::compile(name, fields).map_err(|source| {
                ConfigError::BadPattern {
                    place: format!("match.{name}"),
                    source,
                }
            })?;
            matchers.insert(query);
        }

        let actions = ActionRegistry::default();
        for (name, entry) in &file.action {
            let place = format!("action.{name}");
            let run = expander.opt(&place, &entry.run)?;
            let consult = expander.opt(&place, &entry.consult)?;
            let do_ = expander.opt(&place, &entry.do_)?;
            if let Some(script) = &do_ {
                validate_do_refs(&place, script, &file)?;
            }
            let action = Action::from_verbs(run, consult, do_).ok_or_else(|| {
                ConfigError::EmptyAction { name: name.clone() }
            })?;
            actions.insert(name.clone(), action);
        }

        let mut stack = Vec::new();
        let root = build_level(
            &file,
            &file.start,
            "start",
            "start",
            map,
            &expander,
            &actions,
            &mut stack,
        )?;

        let mut startup = Vec::new();
        for name in &file.start.execute {
            let name = expander.str("start.execute", name)?;
            let action = actions.get(&name).ok_or_else(|| ConfigError::UnknownAction {
                place: "start.execute".into(),
                name: name.clone(),
            })?;
            startup.push(action);
        }

        let daemon = file.daemon.unwrap_or_default();
        let socket = expander
            .opt("daemon.socket", &daemon.socket)?
            .map(PathBuf::from);
        // A zero poll period would spin the loop; one second is the floor.
        let reload_poll = daemon
            .reload_poll_secs
            .map_or(DEFAULT_RELOAD_POLL, |secs| {
                Duration::from_secs(secs.max(1))
            });

        debug!(
            path = %path.display(),
            binds = root.triggers.len(),
            actions = actions.len(),
            matchers = matchers.len(),
            "configuration loaded"
        );
        Ok(Self {
            path: path.to_owned(),
            mtime,
            socket,
            reload_poll,
            root,
            startup,
            actions,
            matchers,
        })
    }

    /// Compile the trigger tree into the root listener.
    pub fn build_listener(&self, map: &ModifierMap) -> Result<Listener, CompileError> {
        Listener::build(self.root.clone(), map, 0)
    }

    /// Whether the file's mtime differs from the one seen at load.
    /// An unreadable file counts as changed so the reload path gets to
    /// report the problem.
    pub fn changed(&self) -> bool {
        match fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(now) => self.mtime != Some(now),
            Err(_) => true,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("in {place}: cannot expand {text:?}: {source}")]
    Expand {
        place: String,
        text: String,
        #[source]
        source: shellexpand::LookupError<env::VarError>,
    },

    #[error("in {place}: {source}")]
    BadKey {
        place: String,
        #[source]
        source: KeyParseError,
    },

    #[error("in {place}: {source}")]
    BadPattern {
        place: String,
        #[source]
        source: globset::Error,
    },

    #[error("in {place}: exactly one of run, do, action, mode required")]
    VerbCount { place: String },

    #[error("action {name:?} has no verbs")]
    EmptyAction { name: String },

    #[error("in {place}: execute is only valid in [start]")]
    ExecuteOutsideStart { place: String },

    #[error("in {place}: unknown mode {name:?}")]
    UnknownMode { place: String, name: String },

    #[error("in {place}: unknown action {name:?}")]
    UnknownAction { place: String, name: String },

    #[error("in {place}: unknown matcher {name:?}")]
    UnknownMatcher { place: String, name: String },

    #[error("in {place}: mode {name:?} refers back to itself")]
    ModeCycle { place: String, name: String },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    daemon: Option<DaemonSection>,
    start: LevelSection,
    #[serde(default)]
    mode: BTreeMap<String, LevelSection>,
    #[serde(default)]
    action: BTreeMap<String, ActionEntry>,
    #[serde(default, rename = "match")]
    matchers: BTreeMap<String, QueryFields>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DaemonSection {
    socket: Option<String>,
    #[serde(rename = "reload-poll-secs")]
    reload_poll_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LevelSection {
    mask: Option<String>,
    #[serde(default)]
    execute: Vec<String>,
    #[serde(default)]
    bind: Vec<BindEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BindEntry {
    key: String,
    mask: Option<String>,
    run: Option<String>,
    #[serde(rename = "do")]
    do_: Option<String>,
    action: Option<String>,
    mode: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ActionEntry {
    run: Option<String>,
    consult: Option<String>,
    #[serde(rename = "do")]
    do_: Option<String>,
}

struct Expander<'a> {
    options: &'a HashMap<String, String>,
}

impl Expander<'_> {
    /// shellexpand with `--option` values shadowing the environment.
    /// An undefined variable is an error, not a silent empty string.
    fn str(&self, place: &str, text: &str) -> Result<String, ConfigError> {
        let lookup = |name: &str| -> Result<Option<String>, env::VarError> {
            if let Some(v) = self.options.get(name) {
                return Ok(Some(v.clone()));
            }
            env::var(name).map(Some)
        };
        shellexpand::full_with_context(text, || env::var("HOME").ok(), lookup)
            .map(|cow| cow.into_owned())
            .map_err(|source| ConfigError::Expand {
                place: place.into(),
                text: text.into(),
                source,
            })
    }

    fn opt(&self, place: &str, text: &Option<String>) -> Result<Option<String>, ConfigError> {
        text.as_deref().map(|t| self.str(place, t)).transpose()
    }
}

/// Check config-level names referenced from a `do` script. Only the
/// two command forms that name configured objects are inspected.
fn validate_do_refs(place: &str, script: &str, file: &ConfigFile) -> Result<(), ConfigError> {
    for cmd in script.split(';').map(str::trim) {
        if let Some(arg) = cmd.strip_prefix("select-windows:") {
            let name = match arg.split_once(" waiting ") {
                Some((name, _)) => name,
                None => arg,
            }
            .trim();
            if !file.matchers.contains_key(name) {
                return Err(ConfigError::UnknownMatcher {
                    place: place.into(),
                    name: name.into(),
                });
            }
        } else if let Some(name) = cmd.strip_prefix("action:") {
            let name = name.trim();
            if !file.action.contains_key(name) {
                return Err(ConfigError::UnknownAction {
                    place: place.into(),
                    name: name.into(),
                });
            }
        }
    }
    Ok(())
}

enum Verb<'a> {
    Run(&'a str),
    Do(&'a str),
    Action(&'a str),
    Mode(&'a str),
}

#[allow(clippy::too_many_arguments)]
fn build_level(
    file: &ConfigFile,
    section: &LevelSection,
    place: &str,
    name: &str,
    map: &ModifierMap,
    expander: &Expander<'_>,
    actions: &ActionRegistry,
    stack: &mut Vec<String>,
) -> Result<TriggerSet, ConfigError> {
    if place != "start" && !section.execute.is_empty() {
        return Err(ConfigError::ExecuteOutsideStart {
            place: place.into(),
        });
    }
    let section_mask = match &section.mask {
        Some(text) => {
            let text = expander.str(place, text)?;
            Some(
                parse_mod_spec(&text, map).map_err(|source| ConfigError::BadKey {
                    place: place.into(),
                    source,
                })?,
            )
        }
        None => None,
    };

    let mut triggers = Vec::new();
    for bind in &section.bind {
        let bplace = format!("{place}.bind {:?}", bind.key);
        let key_text = expander.str(&bplace, &bind.key)?;
        let key = Key::parse(&key_text, map).map_err(|source| ConfigError::BadKey {
            place: bplace.clone(),
            source,
        })?;
        let filter = match &bind.mask {
            Some(text) => {
                let text = expander.str(&bplace, text)?;
                Some(
                    parse_mod_spec(&text, map).map_err(|source| ConfigError::BadKey {
                        place: bplace.clone(),
                        source,
                    })?,
                )
            }
            None => section_mask.clone(),
        };

        let verb = match (&bind.run, &bind.do_, &bind.action, &bind.mode) {
            (Some(cmd), None, None, None) => Verb::Run(cmd),
            (None, Some(script), None, None) => Verb::Do(script),
            (None, None, Some(name), None) => Verb::Action(name),
            (None, None, None, Some(name)) => Verb::Mode(name),
            _ => return Err(ConfigError::VerbCount { place: bplace }),
        };
        let (action, nested) = match verb {
            Verb::Run(cmd) => (Some(Action::Run(expander.str(&bplace, cmd)?)), None),
            Verb::Do(script) => {
                let script = expander.str(&bplace, script)?;
                validate_do_refs(&bplace, &script, file)?;
                (Some(Action::Do(script)), None)
            }
            Verb::Action(name) => {
                let name = expander.str(&bplace, name)?;
                let action = actions.get(&name).ok_or_else(|| ConfigError::UnknownAction {
                    place: bplace.clone(),
                    name: name.clone(),
                })?;
                (Some(action), None)
            }
            Verb::Mode(name) => {
                let mode_name = expander.str(&bplace, name)?;
                let mode_section =
                    file.mode
                        .get(&mode_name)
                        .ok_or_else(|| ConfigError::UnknownMode {
                            place: bplace.clone(),
                            name: mode_name.clone(),
                        })?;
                if stack.iter().any(|n| n == &mode_name) {
                    return Err(ConfigError::ModeCycle {
                        place: bplace,
                        name: mode_name,
                    });
                }
                stack.push(mode_name.clone());
                let nested = build_level(
                    file,
                    mode_section,
                    &format!("mode.{mode_name}"),
                    &mode_name,
                    map,
                    expander,
                    actions,
                    stack,
                )?;
                stack.pop();
                (None, Some(nested))
            }
        };
        triggers.push(Trigger::new(key_text, key, filter, action, nested));
    }

    Ok(TriggerSet {
        name: name.to_owned(),
        triggers,
    })
}
