//! Uniform byte I/O over files, memory buffers, and partial/gather views.
//!
//! The codec and protocol layers are written against `Read`/`Write`/`Seek`
//! directly wherever possible; this module supplies the few adapters the
//! standard library doesn't: a growable in-memory stream for
//! building encoded output before it has a home, a read-only gather view
//! that concatenates several byte slices without copying them, and a
//! bounded reader that limits how much of an underlying stream a caller may
//! consume (used to hand a session handler exactly one attached stream's
//! worth of bytes).

use std::io::{self, Read, Seek, SeekFrom, Write};

/// An in-memory, growable, seekable byte buffer.
///
/// Used as the staging area for encoded chunks and block indexes before
/// they are handed to the RAID layer, and in tests in place of a real file.
#[derive(Default, Debug, Clone)]
pub struct MemoryStream {
    data: Vec<u8>,
    pos: usize,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    pub fn get_ref(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Read for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let avail = &self.data[self.pos.min(self.data.len())..];
        let n = avail.len().min(buf.len());
        buf[..n].copy_from_slice(&avail[..n]);
        self.pos += n;
        Ok(n)
    }
}

impl Write for MemoryStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.pos == self.data.len() {
            self.data.extend_from_slice(buf);
        } else {
            let end = self.pos + buf.len();
            if end > self.data.len() {
                self.data.resize(end, 0);
            }
            self.data[self.pos..end].copy_from_slice(buf);
        }
        self.pos += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::End(p) => self.data.len() as i64 + p,
            SeekFrom::Current(p) => self.pos as i64 + p,
        };
        if new_pos < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative position",
            ));
        }
        self.pos = new_pos as usize;
        Ok(self.pos as u64)
    }
}

/// A read-only view that concatenates several owned byte buffers as if they
/// were one contiguous stream, without copying them into a single `Vec`.
///
/// Mirrors the role of a gather-stream: the file codec assembles a stream
/// out of a header, a filename, an attribute blob, and a run of chunks that
/// were each built independently; `GatherReader` lets a caller iterate that
/// sequence as a single `Read` without a preceding concatenation pass.
pub struct GatherReader {
    parts: std::collections::VecDeque<Vec<u8>>,
    offset: usize,
}

impl GatherReader {
    pub fn new() -> Self {
        Self {
            parts: std::collections::VecDeque::new(),
            offset: 0,
        }
    }

    pub fn push(&mut self, part: Vec<u8>) {
        if !part.is_empty() {
            self.parts.push_back(part);
        }
    }

    pub fn total_len(&self) -> usize {
        self.parts.iter().map(|p| p.len()).sum()
    }
}

impl Default for GatherReader {
    fn default() -> Self {
        Self::new()
    }
}

impl Read for GatherReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let front = match self.parts.front() {
                Some(f) => f,
                None => return Ok(0),
            };
            let avail = &front[self.offset..];
            if avail.is_empty() {
                self.parts.pop_front();
                self.offset = 0;
                continue;
            }
            let n = avail.len().min(buf.len());
            buf[..n].copy_from_slice(&avail[..n]);
            self.offset += n;
            return Ok(n);
        }
    }
}

/// A `Read` adapter that stops after a fixed number of bytes, regardless of
/// how much the underlying stream could still produce.
///
/// Session handlers use this to read exactly one attached stream's worth of
/// bytes off the connection without risking a read into the next command
/// frame.
pub struct BoundedReader<R> {
    inner: R,
    remaining: u64,
}

impl<R: Read> BoundedReader<R> {
    pub fn new(inner: R, limit: u64) -> Self {
        Self {
            inner,
            remaining: limit,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for BoundedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let max = (buf.len() as u64).min(self.remaining) as usize;
        let n = self.inner.read(&mut buf[..max])?;
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Cooperative keep-alive / deadline check, threaded through long-running
/// scans (diff matching, housekeeping) so callers can bound wall-clock time
/// or service a liveness ping without the callee knowing about sockets or
/// timers.
pub trait KeepAlive {
    /// Called frequently (once per scan iteration). Return `false` to abort
    /// the operation early.
    fn keep_going(&mut self) -> bool;
}

impl KeepAlive for () {
    fn keep_going(&mut self) -> bool {
        true
    }
}

/// A deadline-based [`KeepAlive`] that aborts once a wall-clock limit has
/// elapsed.
pub struct DeadlineKeepAlive {
    deadline: std::time::Instant,
}

impl DeadlineKeepAlive {
    pub fn new(timeout: std::time::Duration) -> Self {
        Self {
            deadline: std::time::Instant::now() + timeout,
        }
    }
}

impl KeepAlive for DeadlineKeepAlive {
    fn keep_going(&mut self) -> bool {
        std::time::Instant::now() < self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_stream_round_trip() {
        let mut s = MemoryStream::new();
        s.write_all(b"hello world").unwrap();
        s.seek(SeekFrom::Start(0)).unwrap();
        let mut out = Vec::new();
        s.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn gather_reader_concatenates() {
        let mut g = GatherReader::new();
        g.push(b"abc".to_vec());
        g.push(b"".to_vec());
        g.push(b"defg".to_vec());
        assert_eq!(g.total_len(), 7);
        let mut out = Vec::new();
        g.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"abcdefg");
    }

    #[test]
    fn bounded_reader_stops_early() {
        let data = b"0123456789".to_vec();
        let mut r = BoundedReader::new(&data[..], 4);
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"0123");
    }
}
