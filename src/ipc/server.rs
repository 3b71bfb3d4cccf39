//! Unix domain socket server for remote control
//!
//! Accepts line-oriented client connections and feeds each one through
//! its own command dispatcher. Replies are queued per connection and
//! written as the socket drains, so a slow client never stalls the
//! daemon.

use std::env;
use std::fs;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use super::protocol::{Consultant, SenderResponder};
use super::sender::{QueuedSender, SendTarget};
use super::LineBuffer;
use crate::actions::DaemonCtx;
use crate::events::{EventLoop, Watch};

/// Control socket server.
pub struct ControlServer {
    path: PathBuf,
    listener: Rc<UnixListener>,
}

impl ControlServer {
    /// Bind the control socket: create the parent directory, replace a
    /// stale socket file, restrict permissions to the owner.
    pub fn bind(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).context("creating socket directory")?;
            }
        }
        if path.exists() {
            fs::remove_file(path).context("removing stale socket")?;
        }
        let listener = UnixListener::bind(path)
            .with_context(|| format!("binding control socket {}", path.display()))?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .context("restricting socket permissions")?;
        listener
            .set_nonblocking(true)
            .context("setting socket nonblocking")?;
        info!(path = %path.display(), "control socket listening");
        Ok(Self {
            path: path.to_owned(),
            listener: Rc::new(listener),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Register the accept handler. Each readable event drains every
    /// pending connection.
    pub fn install(&self, ctx: &DaemonCtx, lp: &mut EventLoop) {
        let listener = Rc::clone(&self.listener);
        let ctx = ctx.clone();
        let mut next_conn: u64 = 0;
        lp.register(Watch::Readable(self.listener.as_raw_fd()), move |_, lp| {
            loop {
                match listener.accept() {
                    Ok((stream, _)) => {
                        next_conn += 1;
                        if let Err(e) = serve_client(&ctx, lp, stream, next_conn) {
                            warn!(?e, "client setup failed");
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!(?e, "accept failed");
                        break;
                    }
                }
            }
            Ok(())
        });
    }

    /// Remove the socket file.
    pub fn shutdown(&self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(?e, path = %self.path.display(), "removing socket failed");
            }
        }
        info!("control socket closed");
    }
}

/// `$XDG_RUNTIME_DIR/keyloom.sock`, or a per-user path under `/tmp`.
pub fn default_socket_path() -> PathBuf {
    if let Some(dir) = env::var_os("XDG_RUNTIME_DIR") {
        return PathBuf::from(dir).join("keyloom.sock");
    }
    let uid = rustix::process::getuid().as_raw();
    PathBuf::from(format!("/tmp/keyloom-{uid}.sock"))
}

/// Wire one accepted connection into the loop: nonblocking, buffered
/// line reads into a dispatcher, replies through a queued sender. EOF
/// unregisters the read handler; queued replies may still drain.
fn serve_client(ctx: &DaemonCtx, lp: &mut EventLoop, stream: UnixStream, id: u64) -> Result<()> {
    stream
        .set_nonblocking(true)
        .context("setting client nonblocking")?;
    let label = format!("ctl#{id}");
    debug!(conn = %label, "client connected");
    let stream = Rc::new(stream);
    let fd = stream.as_raw_fd();
    let sender = QueuedSender::new(ConnWriter(Rc::clone(&stream)), label.clone());
    let mut consultant = Consultant::new(ctx.clone(), label.clone());
    let mut buf = LineBuffer::default();

    lp.register(Watch::Readable(fd), move |_, lp| {
        let mut eof = false;
        loop {
            let mut chunk = [0u8; 4096];
            match (&*stream).read(&mut chunk) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => buf.push(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(conn = %label, ?e, "client read failed");
                    eof = true;
                    break;
                }
            }
        }
        let lines = buf.take_lines();
        if !lines.is_empty() {
            let mut responder = SenderResponder::new(Rc::clone(&sender));
            // bye only ends the batch; the connection stays open for
            // the next one.
            consultant.incoming(&lines, &mut responder, lp);
        }
        if eof {
            debug!(conn = %label, "client disconnected");
            QueuedSender::set_close_on_drain(&sender);
            lp.unregister_watch(&Watch::Readable(fd));
        }
        Ok(())
    });
    Ok(())
}

/// Write half of a control connection, shared with the read handler.
struct ConnWriter(Rc<UnixStream>);

impl Write for ConnWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self.0).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&*self.0).flush()
    }
}

impl SendTarget for ConnWriter {
    fn raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }

    fn close_write(&mut self) -> io::Result<()> {
        self.0.shutdown(Shutdown::Write)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::testutil::ctx;
    use std::time::Duration;

    /// Quit once only the accept handler and this beat remain, that is
    /// after every connection has been read to EOF and fully drained.
    fn quit_when_settled(lp: &mut EventLoop) {
        lp.register(Watch::Idle(Duration::from_millis(5)), |_, lp| {
            if lp.handler_count() == 2 {
                lp.quit();
            }
            Ok(())
        });
    }

    #[test]
    fn test_client_batch_replies_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let (wm, ctx) = ctx();
        wm.add_simple_window(1, "shell", "xterm");

        let server = ControlServer::bind(&path).unwrap();
        let mut lp = EventLoop::new();
        server.install(&ctx, &mut lp);
        quit_when_settled(&mut lp);

        let mut client = UnixStream::connect(&path).unwrap();
        client
            .write_all(b"raise:0x1\nfrobnicate:9\nbye\nraise:0x1\n")
            .unwrap();
        client.shutdown(Shutdown::Write).unwrap();
        lp.run().unwrap();

        // Unknown command gets nothing; lines after bye are dropped.
        let mut reply = String::new();
        client.read_to_string(&mut reply).unwrap();
        assert_eq!(reply, "OK\nbye\n");
        assert_eq!(wm.raised().len(), 1);

        server.shutdown();
        assert!(!path.exists());
    }

    #[test]
    fn test_two_clients_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let (wm, ctx) = ctx();
        wm.add_simple_window(1, "one", "xterm");
        wm.add_simple_window(2, "two", "xterm");

        let server = ControlServer::bind(&path).unwrap();
        let mut lp = EventLoop::new();
        server.install(&ctx, &mut lp);
        quit_when_settled(&mut lp);

        let mut a = UnixStream::connect(&path).unwrap();
        let mut b = UnixStream::connect(&path).unwrap();
        a.write_all(b"raise:0x1\n").unwrap();
        b.write_all(b"raise:0x2\n").unwrap();
        a.shutdown(Shutdown::Write).unwrap();
        b.shutdown(Shutdown::Write).unwrap();
        lp.run().unwrap();

        let mut ra = String::new();
        let mut rb = String::new();
        a.read_to_string(&mut ra).unwrap();
        b.read_to_string(&mut rb).unwrap();
        assert_eq!(ra, "OK\n");
        assert_eq!(rb, "OK\n");
        assert_eq!(wm.raised().len(), 2);
    }

    #[test]
    fn test_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let first = ControlServer::bind(&path).unwrap();
        drop(first);
        // The file is still there; a fresh bind must replace it.
        assert!(path.exists());
        let second = ControlServer::bind(&path).unwrap();
        assert_eq!(second.path(), path);
        second.shutdown();
        assert!(!path.exists());
    }

    #[test]
    fn test_split_lines_across_reads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let (wm, ctx) = ctx();
        wm.add_simple_window(1, "shell", "xterm");

        let server = ControlServer::bind(&path).unwrap();
        let mut lp = EventLoop::new();
        server.install(&ctx, &mut lp);

        let mut client = UnixStream::connect(&path).unwrap();
        client.write_all(b"rai").unwrap();
        // First idle beat completes the line, the next one quits.
        let mut sent_rest = false;
        lp.register(Watch::Idle(Duration::from_millis(5)), move |_, lp| {
            if !sent_rest {
                client.write_all(b"se:0x1\n").unwrap();
                sent_rest = true;
            } else {
                lp.quit();
            }
            Ok(())
        });
        lp.run().unwrap();

        assert_eq!(wm.raised().len(), 1);
    }
}
