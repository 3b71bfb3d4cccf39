//! keyloomd: hierarchical hotkey daemon
//!
//! Grabs configured key chords, walks nested trigger levels on each
//! match, runs the bound actions, and serves a line-oriented command
//! protocol on a Unix control socket. Configuration reloads are picked
//! up between listen cycles.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{bail, Result};
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use keyloom::actions::{DaemonCtx, ProcessSet};
use keyloom::config::Config;
use keyloom::events::{EventLoop, Watch};
use keyloom::hotkey::{ListenOutcome, Listener, ModifierMap};
use keyloom::ipc::{default_socket_path, ControlServer};
use keyloom::lifecycle;
use keyloom::wm::{HeadlessWm, WindowSystem};

/// Hierarchical hotkey daemon.
#[derive(Debug, Parser)]
#[command(name = "keyloomd", version, about)]
struct Args {
    /// Configuration file
    #[arg(long, short = 'c')]
    config: PathBuf,

    /// Control socket path (overrides the configuration)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Windowing backend
    #[arg(long, default_value = "headless")]
    backend: String,

    /// NAME=VALUE expansion, consulted before the environment
    #[arg(long = "option", value_name = "NAME=VALUE")]
    option: Vec<String>,
}

fn parse_options(raw: &[String]) -> Result<HashMap<String, String>> {
    let mut options = HashMap::new();
    for item in raw {
        let Some((name, value)) = item.split_once('=') else {
            bail!("--option needs NAME=VALUE, got {item:?}");
        };
        if options.insert(name.to_string(), value.to_string()).is_some() {
            bail!("--option {name:?} given twice");
        }
    }
    Ok(options)
}

fn make_backend(name: &str) -> Result<Rc<dyn WindowSystem>> {
    match name {
        "headless" => Ok(Rc::new(HeadlessWm::new()?)),
        other => bail!("unknown backend {other:?} (available: headless)"),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "keyloomd starting");

    let options = parse_options(&args.option)?;
    let wm = make_backend(&args.backend)?;
    let map = Rc::new(ModifierMap::from_layout(&wm.modifier_layout()));

    let config = Config::load(&args.config, &map, &options)?;
    let mut listener = config.build_listener(&map)?;
    let socket_path = args
        .socket
        .clone()
        .or_else(|| config.socket.clone())
        .unwrap_or_else(default_socket_path);
    let reload_poll = config.reload_poll;

    let procs = Rc::new(ProcessSet::default());
    let ctx = DaemonCtx {
        wm,
        map: Rc::clone(&map),
        actions: Rc::new(config.actions.clone()),
        matchers: Rc::new(config.matchers.clone()),
        procs: Rc::clone(&procs),
    };
    let config = Rc::new(RefCell::new(config));

    let mut lp = EventLoop::new();

    let startup = config.borrow().startup.clone();
    for action in startup {
        if let Err(e) = action.execute(&ctx, &mut lp) {
            warn!(?e, "startup action failed");
        }
    }

    let server = ControlServer::bind(&socket_path)?;
    server.install(&ctx, &mut lp);
    procs.install(&mut lp);
    let shutdown = lifecycle::install(&mut lp)?;

    // Reload check between passes; a failed load keeps the running
    // configuration and never takes the loop down.
    let pending: Rc<RefCell<Option<(Config, Listener)>>> = Rc::new(RefCell::new(None));
    {
        let pending = Rc::clone(&pending);
        let config = Rc::clone(&config);
        let map = Rc::clone(&map);
        let path = args.config.clone();
        let options = options.clone();
        lp.register(Watch::Idle(reload_poll), move |_, lp| {
            if !config.borrow().changed() {
                return Ok(());
            }
            info!(path = %path.display(), "configuration changed, reloading");
            match Config::load(&path, &map, &options) {
                Ok(new) => match new.build_listener(&map) {
                    Ok(listener) => {
                        *pending.borrow_mut() = Some((new, listener));
                        lp.quit();
                    }
                    Err(e) => warn!(%e, "reload failed, keeping configuration"),
                },
                Err(e) => warn!(%e, "reload failed, keeping configuration"),
            }
            Ok(())
        });
    }

    info!(socket = %socket_path.display(), "daemon ready");

    let mut loop_result = Ok(());
    loop {
        match listener.listen(&ctx, &mut lp) {
            Ok(ListenOutcome::Matched { trigger }) => {
                debug!(%trigger, "cycle complete");
            }
            Ok(ListenOutcome::Cancelled) => {
                if shutdown.is_set() {
                    info!("shutdown requested");
                    break;
                }
                if let Some((new_config, new_listener)) = pending.borrow_mut().take() {
                    info!("configuration swapped in");
                    listener = new_listener;
                    // Swap registry contents in place so the control
                    // server's context sees the new tables too.
                    ctx.actions.replace(&new_config.actions);
                    ctx.matchers.replace(&new_config.matchers);
                    *config.borrow_mut() = new_config;
                }
            }
            Err(e) => {
                loop_result = Err(e);
                break;
            }
        }
    }

    server.shutdown();
    info!("keyloomd stopped");
    loop_result
}
