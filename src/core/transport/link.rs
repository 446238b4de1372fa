//! Blocking link abstraction and buffered read primitives
//!
//! Everything in this module runs on an I/O worker thread, never on the
//! async runtime.

use super::TransportError;
use std::io;
use std::time::{Duration, Instant};

/// Longest single blocking read; keeps deadline checks responsive.
const READ_SLICE: Duration = Duration::from_millis(50);

/// Chunk size for a single read call
const CHUNK_SIZE: usize = 256;

/// A byte-oriented, blocking device link (serial port, simulated device, test double)
#[cfg_attr(test, mockall::automock)]
pub trait SerialLink: Send {
    /// Write every byte and flush
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Read whatever is available, waiting at most `timeout`.
    ///
    /// Returns `Ok(0)` when nothing arrived in time.
    fn read_some(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Drop any bytes buffered by the driver
    fn clear_input(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Release the underlying device
    fn close(&mut self) {}
}

/// Total frame length derived from its first bytes
pub type FrameLength = fn(&[u8]) -> usize;

/// How much to read after a write
#[derive(Debug, Clone)]
pub enum ReadSpec {
    /// Exactly `n` bytes, error on timeout
    Exact(usize),
    /// Until `terminator` appears, `max_bytes` is reached, or the timeout elapses
    Until {
        /// Terminator byte sequence (included in the result)
        terminator: Vec<u8>,
        /// Upper bound on returned bytes
        max_bytes: usize,
    },
    /// Everything that arrives before the timeout, up to `max_bytes`
    Available {
        /// Upper bound on returned bytes
        max_bytes: usize,
    },
    /// `header` bytes, then as many more as `total_len(header)` asks for
    Framed {
        /// Bytes needed to know the frame length
        header: usize,
        /// Full frame length computed from the header
        total_len: FrameLength,
    },
}

impl ReadSpec {
    /// Read until CR LF
    pub fn crlf(max_bytes: usize) -> Self {
        Self::Until {
            terminator: b"\r\n".to_vec(),
            max_bytes,
        }
    }
}

/// A link plus the bytes read past the end of the previous request
pub(crate) struct LinkState {
    link: Box<dyn SerialLink>,
    pending: Vec<u8>,
}

impl LinkState {
    pub(crate) fn new(link: Box<dyn SerialLink>) -> Self {
        Self {
            link,
            pending: Vec::new(),
        }
    }

    pub(crate) fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.link.write_all(data).map_err(TransportError::IoError)
    }

    pub(crate) fn discard_input(&mut self) -> Result<(), TransportError> {
        self.pending.clear();
        self.link.clear_input().map_err(TransportError::IoError)
    }

    pub(crate) fn close(&mut self) {
        self.pending.clear();
        self.link.close();
    }

    pub(crate) fn read(&mut self, spec: &ReadSpec, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        match spec {
            ReadSpec::Exact(n) => self.read_exact(*n, timeout),
            ReadSpec::Until {
                terminator,
                max_bytes,
            } => self.read_until(terminator, *max_bytes, timeout),
            ReadSpec::Available { max_bytes } => self.read_until(&[], *max_bytes, timeout),
            ReadSpec::Framed { header, total_len } => self.read_framed(*header, *total_len, timeout),
        }
    }

    fn read_framed(
        &mut self,
        header: usize,
        total_len: FrameLength,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut frame = self.read_exact(header, timeout)?;
        let total = total_len(&frame).max(header);
        if total == header {
            return Ok(frame);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.read_exact(total - header, remaining) {
            Ok(tail) => {
                frame.extend_from_slice(&tail);
                Ok(frame)
            }
            Err(TransportError::Timeout { received, .. }) => {
                // Put the header back so the partial frame stays together
                frame.append(&mut self.pending);
                self.pending = frame;
                Err(TransportError::Timeout {
                    expected: total,
                    received: header + received,
                })
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) fn read_exact(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut buf = std::mem::take(&mut self.pending);

        while buf.len() < n {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let received = buf.len();
                self.pending = buf;
                return Err(TransportError::Timeout {
                    expected: n,
                    received,
                });
            }
            let want = n - buf.len();
            self.fill(&mut buf, want, remaining)?;
        }

        self.pending = buf.split_off(n);
        Ok(buf)
    }

    /// Return whatever arrives first, up to `max_bytes`; empty at the deadline.
    pub(crate) fn read_any(&mut self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut buf = std::mem::take(&mut self.pending);

        while buf.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            self.fill(&mut buf, max_bytes, remaining)?;
        }

        if buf.len() > max_bytes {
            self.pending = buf.split_off(max_bytes);
        }
        Ok(buf)
    }

    /// An empty terminator reads until `max_bytes` or the deadline.
    pub(crate) fn read_until(
        &mut self,
        terminator: &[u8],
        max_bytes: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut buf = std::mem::take(&mut self.pending);

        loop {
            if let Some(end) = find_terminator(&buf, terminator) {
                let cut = end.min(max_bytes);
                self.pending = buf.split_off(cut);
                return Ok(buf);
            }
            if buf.len() >= max_bytes {
                self.pending = buf.split_off(max_bytes);
                return Ok(buf);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                // Partial data on timeout is a result, not an error
                return Ok(buf);
            }
            let want = max_bytes - buf.len();
            self.fill(&mut buf, want, remaining)?;
        }
    }

    fn fill(&mut self, buf: &mut Vec<u8>, want: usize, remaining: Duration) -> Result<usize, TransportError> {
        let mut chunk = [0u8; CHUNK_SIZE];
        let want = want.clamp(1, CHUNK_SIZE);
        let n = self
            .link
            .read_some(&mut chunk[..want], remaining.min(READ_SLICE))
            .map_err(TransportError::IoError)?;
        buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }
}

/// End offset (exclusive) of the first occurrence of `terminator`
fn find_terminator(buf: &[u8], terminator: &[u8]) -> Option<usize> {
    if terminator.is_empty() || buf.len() < terminator.len() {
        return None;
    }
    buf.windows(terminator.len())
        .position(|w| w == terminator)
        .map(|pos| pos + terminator.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replays queued chunks, one per read call
    struct ChunkLink {
        chunks: VecDeque<Vec<u8>>,
        written: Vec<u8>,
    }

    impl ChunkLink {
        fn new(chunks: &[&[u8]]) -> Self {
            Self {
                chunks: chunks.iter().map(|c| c.to_vec()).collect(),
                written: Vec::new(),
            }
        }
    }

    impl SerialLink for ChunkLink {
        fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
            self.written.extend_from_slice(data);
            Ok(())
        }

        fn read_some(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
            match self.chunks.pop_front() {
                Some(mut chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        self.chunks.push_front(chunk.split_off(n));
                    }
                    Ok(n)
                }
                None => {
                    std::thread::sleep(timeout);
                    Ok(0)
                }
            }
        }
    }

    #[test]
    fn test_read_until_keeps_bytes_after_terminator() {
        let mut state = LinkState::new(Box::new(ChunkLink::new(&[b"OK\r\nNEXT", b"\r\n"])));
        let first = state.read_until(b"\r\n", 64, Duration::from_millis(200)).unwrap();
        assert_eq!(first, b"OK\r\n");
        let second = state.read_until(b"\r\n", 64, Duration::from_millis(200)).unwrap();
        assert_eq!(second, b"NEXT\r\n");
    }

    #[test]
    fn test_read_until_returns_partial_on_timeout() {
        let mut state = LinkState::new(Box::new(ChunkLink::new(&[b"+CSQ: 1"])));
        let data = state.read_until(b"\r\n", 64, Duration::from_millis(120)).unwrap();
        assert_eq!(data, b"+CSQ: 1");
    }

    #[test]
    fn test_read_until_stops_at_max_bytes() {
        let mut state = LinkState::new(Box::new(ChunkLink::new(&[b"ABCDEFGH"])));
        let data = state.read_until(b"\r\n", 4, Duration::from_millis(200)).unwrap();
        assert_eq!(data, b"ABCD");
        let rest = state.read_until(&[], 16, Duration::from_millis(60)).unwrap();
        assert_eq!(rest, b"EFGH");
    }

    #[test]
    fn test_read_exact_times_out_with_count() {
        let mut state = LinkState::new(Box::new(ChunkLink::new(&[b"\x01\x03"])));
        match state.read_exact(5, Duration::from_millis(100)) {
            Err(TransportError::Timeout { expected, received }) => {
                assert_eq!(expected, 5);
                assert_eq!(received, 2);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_read_exact_across_chunks() {
        let mut state = LinkState::new(Box::new(ChunkLink::new(&[b"\x01", b"\x03\x02", b"\x00\x2A\xFF"])));
        let data = state.read_exact(5, Duration::from_millis(200)).unwrap();
        assert_eq!(data, vec![0x01, 0x03, 0x02, 0x00, 0x2A]);
    }

    #[test]
    fn test_read_framed_uses_header_length() {
        let mut state = LinkState::new(Box::new(ChunkLink::new(&[b"\x01\x83", b"\x02\xC0\xF1\x99"])));
        let spec = ReadSpec::Framed {
            header: 2,
            total_len: |head| if head[1] & 0x80 != 0 { 5 } else { 7 },
        };
        let frame = state.read(&spec, Duration::from_millis(200)).unwrap();
        assert_eq!(frame, vec![0x01, 0x83, 0x02, 0xC0, 0xF1]);
    }

    #[test]
    fn test_write_error_propagates() {
        let mut link = MockSerialLink::new();
        link.expect_write_all()
            .returning(|_| Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged")));
        let mut state = LinkState::new(Box::new(link));
        assert!(matches!(state.write(b"AT\r\n"), Err(TransportError::IoError(_))));
    }
}
