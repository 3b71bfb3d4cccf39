//! Remote control plumbing
//!
//! A line-oriented command protocol served over a Unix socket and over
//! child-process pipes, with a backpressure-safe queued sender for
//! replies.

pub mod protocol;
pub mod sender;
pub mod server;

pub use protocol::{CommandOutcome, Consultant, Responder};
pub use sender::{QueuedSender, SendTarget};
pub use server::{default_socket_path, ControlServer};

/// Assembles complete newline-terminated lines out of arbitrary read
/// chunks. The partial tail stays buffered until its newline arrives.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub(crate) fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Take every complete line, lossily decoded. A trailing `\r` is
    /// stripped so CRLF clients work too.
    pub(crate) fn take_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let rest = self.buf.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.buf, rest);
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_split_across_pushes() {
        let mut buf = LineBuffer::default();
        buf.push(b"ra");
        assert!(buf.take_lines().is_empty());
        buf.push(b"ise:1\nclo");
        assert_eq!(buf.take_lines(), vec!["raise:1".to_string()]);
        buf.push(b"se:2\n");
        assert_eq!(buf.take_lines(), vec!["close:2".to_string()]);
    }

    #[test]
    fn test_multiple_lines_in_one_chunk() {
        let mut buf = LineBuffer::default();
        buf.push(b"a\nb\r\nc\npartial");
        assert_eq!(
            buf.take_lines(),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        buf.push(b"\n");
        assert_eq!(buf.take_lines(), vec!["partial".to_string()]);
    }

    #[test]
    fn test_invalid_utf8_is_decoded_lossily() {
        let mut buf = LineBuffer::default();
        buf.push(&[b'o', b'k', 0xff, b'\n']);
        let lines = buf.take_lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("ok"));
    }
}
