//! Signal handling for graceful shutdown
//!
//! SIGTERM and SIGINT are turned into bytes on a socketpair so the
//! event loop sees them as an ordinary readable descriptor.

use std::cell::Cell;
use std::io::{self, Read};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;

use anyhow::{Context, Result};
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::info;

use crate::events::{EventLoop, Watch};

/// Shared flag the main loop consults after every cancelled cycle.
#[derive(Clone, Default)]
pub struct ShutdownFlag(Rc<Cell<bool>>);

impl ShutdownFlag {
    pub fn is_set(&self) -> bool {
        self.0.get()
    }

    pub fn set(&self) {
        self.0.set(true);
    }
}

/// Route SIGTERM and SIGINT through a self-pipe into the loop. The
/// handler drains the pipe, sets the flag and quits the running cycle.
pub fn install(lp: &mut EventLoop) -> Result<ShutdownFlag> {
    let (tx, mut rx) = UnixStream::pair().context("signal socketpair")?;
    tx.set_nonblocking(true).context("signal pipe nonblocking")?;
    rx.set_nonblocking(true).context("signal pipe nonblocking")?;
    signal_hook::low_level::pipe::register(SIGTERM, tx.try_clone().context("cloning signal pipe")?)
        .context("registering SIGTERM")?;
    signal_hook::low_level::pipe::register(SIGINT, tx).context("registering SIGINT")?;

    let flag = ShutdownFlag::default();
    let handler_flag = flag.clone();
    lp.register(Watch::Readable(rx.as_raw_fd()), move |_, lp| {
        let mut sink = [0u8; 64];
        loop {
            match rx.read(&mut sink) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        info!("shutdown signal received");
        handler_flag.set();
        lp.quit();
        Ok(())
    });
    Ok(flag)
}
