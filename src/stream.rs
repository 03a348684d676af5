//! Stream plumbing shared by the loader and the parsers
//!
//! # Invariants
//! - A [`SubStream`] never reads outside `start..start + len` of its parent.
//! - A [`StreamCheckpoint`] puts the stream back where it found it unless
//!   [`StreamCheckpoint::commit`] was called, including on early returns.

use std::io::{self, Read, Seek, SeekFrom, Write};

use sha2::{Digest, Sha256};

/// Any seekable byte source
pub trait ReadSeek: Read + Seek {}

impl<T: Read + Seek + ?Sized> ReadSeek for T {}

const COPY_CHUNK: usize = 64 * 1024;

/// Bounded, independently positioned view of a parent stream.
///
/// Offsets seen through the view start at 0. The parent's position is
/// re-established before every read, so several views over the same parent
/// can be used one after another.
pub struct SubStream<'a> {
    inner: &'a mut dyn ReadSeek,
    start: u64,
    len: u64,
    pos: u64,
}

impl<'a> SubStream<'a> {
    /// View `len` bytes of `inner` beginning at absolute offset `start`
    pub fn new(inner: &'a mut dyn ReadSeek, start: u64, len: u64) -> Self {
        Self { inner, start, len, pos: 0 }
    }

    /// View from the parent's current position to its end
    pub fn from_current(inner: &'a mut dyn ReadSeek) -> io::Result<Self> {
        let start = inner.stream_position()?;
        let end = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(start))?;
        Ok(Self::new(inner, start, end.saturating_sub(start)))
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes left between the current position and the end of the view
    pub fn remaining(&self) -> u64 {
        self.len.saturating_sub(self.pos)
    }

    /// Narrower view relative to this one
    pub fn slice(&mut self, offset: u64, len: u64) -> io::Result<SubStream<'_>> {
        if offset.checked_add(len).map_or(true, |end| end > self.len) {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("slice {}+{} exceeds stream of {} bytes", offset, len, self.len),
            ));
        }
        Ok(SubStream::new(self, offset, len))
    }
}

impl Read for SubStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.remaining();
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        self.inner.seek(SeekFrom::Start(self.start + self.pos))?;
        let n = self.inner.read(&mut buf[..want])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for SubStream<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(d) => self.len.checked_add_signed(d),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of sub-stream")
        })?;
        self.pos = target;
        Ok(target)
    }
}

/// Scoped record of a stream position.
///
/// Dropping the checkpoint seeks back to the recorded position; `commit`
/// keeps whatever position the stream reached.
pub struct StreamCheckpoint<'a> {
    stream: &'a mut dyn ReadSeek,
    position: u64,
    committed: bool,
}

impl<'a> StreamCheckpoint<'a> {
    pub fn new(stream: &'a mut dyn ReadSeek) -> io::Result<Self> {
        let position = stream.stream_position()?;
        Ok(Self { stream, position, committed: false })
    }

    /// Position recorded at creation
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn stream(&mut self) -> &mut dyn ReadSeek {
        &mut *self.stream
    }

    /// Keep the current position when the checkpoint is dropped
    pub fn commit(mut self) {
        self.committed = true;
    }

    /// Seek back to the recorded position now
    pub fn restore(&mut self) -> io::Result<()> {
        self.stream.seek(SeekFrom::Start(self.position)).map(|_| ())
    }
}

impl Drop for StreamCheckpoint<'_> {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = self.restore() {
                tracing::warn!(position = self.position, error = %e, "failed to restore stream position");
            }
        }
    }
}

/// Fill `buf` from `reader`, returning how many bytes were available
/// (short only at end of stream)
pub fn read_up_to<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Read exactly `len` bytes at `offset`
pub fn read_at<S: Read + Seek + ?Sized>(stream: &mut S, offset: u64, len: usize) -> io::Result<Vec<u8>> {
    stream.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

/// SHA-256 (lowercase hex) of `len` bytes at `offset`
pub fn hash_range<S: Read + Seek + ?Sized>(stream: &mut S, offset: u64, len: u64) -> io::Result<String> {
    let mut hasher = Sha256::new();
    for_each_chunk(stream, offset, len, |chunk| {
        hasher.update(chunk);
        Ok(())
    })?;
    Ok(hex::encode(hasher.finalize()))
}

/// Copy `len` bytes at `offset` into `out`
pub fn copy_range<S: Read + Seek + ?Sized, W: Write + ?Sized>(
    stream: &mut S,
    offset: u64,
    len: u64,
    out: &mut W,
) -> io::Result<()> {
    for_each_chunk(stream, offset, len, |chunk| out.write_all(chunk))
}

/// Whether `len` bytes at `offset` are all zero
pub fn is_zero_range<S: Read + Seek + ?Sized>(stream: &mut S, offset: u64, len: u64) -> io::Result<bool> {
    let mut zero = true;
    for_each_chunk(stream, offset, len, |chunk| {
        zero &= chunk.iter().all(|&b| b == 0);
        Ok(())
    })?;
    Ok(zero)
}

fn for_each_chunk<S, F>(stream: &mut S, offset: u64, len: u64, mut f: F) -> io::Result<()>
where
    S: Read + Seek + ?Sized,
    F: FnMut(&[u8]) -> io::Result<()>,
{
    stream.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut remaining = len;
    while remaining > 0 {
        let want = COPY_CHUNK.min(usize::try_from(remaining).unwrap_or(COPY_CHUNK));
        let n = read_up_to(stream, &mut buf[..want])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream ended {} bytes early", remaining),
            ));
        }
        f(&buf[..n])?;
        remaining -= n as u64;
    }
    Ok(())
}
