//! Shared plumbing for the line-oriented TCP servers: non-blocking
//! listeners that can be polled against the shutdown flag, and a
//! timeout-tolerant newline-delimited reader that never chokes on
//! non-UTF-8 bytes.

use std::io::{BufRead, BufReader, ErrorKind};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

/// How long accept loops sleep between polls.
pub const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Read timeout on accepted client sockets; bounds shutdown latency.
pub const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Bind a listener and switch it to non-blocking accepts.
pub fn bind_listener(host: &str, port: u16) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind((host, port))?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// One poll of a line-oriented client socket.
pub enum LineEvent {
    /// A complete line, decoded lossily and trimmed.
    Line(String),
    /// The peer closed the connection.
    Closed,
    /// Read timeout expired with no complete line; poll again.
    Timeout,
    /// Unrecoverable socket error.
    Failed,
}

/// Newline-delimited reader over a client socket. Partial lines survive
/// across read timeouts; invalid UTF-8 is replaced, never an error.
pub struct LineReader {
    reader: BufReader<TcpStream>,
    pending: Vec<u8>,
}

impl LineReader {
    pub fn new(stream: TcpStream) -> std::io::Result<Self> {
        stream.set_read_timeout(Some(CLIENT_READ_TIMEOUT))?;
        Ok(Self {
            reader: BufReader::new(stream),
            pending: Vec::new(),
        })
    }

    /// The underlying stream, for writing responses.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        self.reader.get_mut()
    }

    pub fn poll_line(&mut self) -> LineEvent {
        match self.reader.read_until(b'\n', &mut self.pending) {
            Ok(0) => LineEvent::Closed,
            Ok(_) => {
                let line = String::from_utf8_lossy(&self.pending)
                    .trim()
                    .to_string();
                self.pending.clear();
                LineEvent::Line(line)
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                LineEvent::Timeout
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => LineEvent::Timeout,
            Err(_) => LineEvent::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reads_lines_and_survives_invalid_utf8() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        let mut reader = LineReader::new(server_side).unwrap();

        client.write_all(b"hello\n\xff\xfe\n").unwrap();
        match reader.poll_line() {
            LineEvent::Line(line) => assert_eq!(line, "hello"),
            _ => panic!("expected a line"),
        }
        match reader.poll_line() {
            LineEvent::Line(line) => assert!(!line.is_empty()),
            _ => panic!("expected a lossily decoded line"),
        }

        drop(client);
        assert!(matches!(reader.poll_line(), LineEvent::Closed));
    }

    #[test]
    fn partial_line_completes_after_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        server_side
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let mut reader = LineReader {
            reader: BufReader::new(server_side),
            pending: Vec::new(),
        };

        client.write_all(b"par").unwrap();
        client.flush().unwrap();
        assert!(matches!(reader.poll_line(), LineEvent::Timeout));
        client.write_all(b"tial\n").unwrap();
        match reader.poll_line() {
            LineEvent::Line(line) => assert_eq!(line, "partial"),
            _ => panic!("expected completed line"),
        }
    }
}
