//! Windowed reader over a seekable source
//!
//! Used to serve byte ranges of page images without loading the whole file.

use std::io::{self, Read, Seek, SeekFrom};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReaderError {
    #[error("invalid offset")]
    InvalidOffset,

    #[error("invalid whence")]
    InvalidWhence,
}

impl From<ReaderError> for io::Error {
    fn from(err: ReaderError) -> Self {
        io::Error::new(io::ErrorKind::InvalidInput, err)
    }
}

/// Reads at most `limit` bytes starting at `base` of the inner reader.
pub struct LimitedReader<R> {
    inner: R,
    base: u64,
    limit: u64,
    pos: u64,
}

impl<R: Read + Seek> LimitedReader<R> {
    pub fn new(mut inner: R, base: u64, limit: u64) -> io::Result<Self> {
        inner.seek(SeekFrom::Start(base))?;
        Ok(Self {
            inner,
            base,
            limit,
            pos: 0,
        })
    }

    /// Build a reader for an HTTP `Range` header value against a source of `total` bytes.
    pub fn from_range(inner: R, range: &str, total: u64) -> Result<Self, RangeError> {
        let (start, end) = parse_range(range, total)?;
        Ok(Self::new(inner, start, end - start + 1)?)
    }

    pub fn len(&self) -> u64 {
        self.limit
    }

    pub fn is_empty(&self) -> bool {
        self.limit == 0
    }

    pub fn base(&self) -> u64 {
        self.base
    }
}

impl<R: Read> Read for LimitedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.limit {
            return Ok(0);
        }
        let remaining = (self.limit - self.pos) as usize;
        let max = buf.len().min(remaining);
        let n = self.inner.read(&mut buf[..max])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Seek> Seek for LimitedReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(offset) => self.pos as i128 + offset as i128,
            SeekFrom::End(offset) => self.limit as i128 + offset as i128,
        };
        if target < 0 || target > self.limit as i128 {
            return Err(ReaderError::InvalidOffset.into());
        }
        let target = target as u64;
        self.inner.seek(SeekFrom::Start(self.base + target))?;
        self.pos = target;
        Ok(target)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RangeError {
    #[error(transparent)]
    Reader(#[from] ReaderError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Parse `bytes=a-b`, `bytes=a-` or `bytes=-n` into an inclusive range.
pub fn parse_range(range: &str, total: u64) -> Result<(u64, u64), ReaderError> {
    let spec = range
        .trim()
        .strip_prefix("bytes=")
        .ok_or(ReaderError::InvalidWhence)?;
    // Only single ranges are served
    if spec.contains(',') {
        return Err(ReaderError::InvalidWhence);
    }
    let (start, end) = spec.split_once('-').ok_or(ReaderError::InvalidWhence)?;
    if total == 0 {
        return Err(ReaderError::InvalidOffset);
    }

    let (start, end) = match (start.trim(), end.trim()) {
        ("", "") => return Err(ReaderError::InvalidOffset),
        ("", suffix) => {
            let n: u64 = suffix.parse().map_err(|_| ReaderError::InvalidOffset)?;
            if n == 0 {
                return Err(ReaderError::InvalidOffset);
            }
            (total.saturating_sub(n), total - 1)
        }
        (start, "") => {
            let s: u64 = start.parse().map_err(|_| ReaderError::InvalidOffset)?;
            (s, total - 1)
        }
        (start, end) => {
            let s: u64 = start.parse().map_err(|_| ReaderError::InvalidOffset)?;
            let e: u64 = end.parse().map_err(|_| ReaderError::InvalidOffset)?;
            (s, e.min(total - 1))
        }
    };

    if start > end || start >= total {
        return Err(ReaderError::InvalidOffset);
    }
    Ok((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_reads_only_window() {
        let data: Vec<u8> = (0u8..100).collect();
        let mut reader = LimitedReader::new(Cursor::new(data), 10, 5).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, vec![10, 11, 12, 13, 14]);
    }

    #[test]
    fn test_seek_within_window() {
        let data: Vec<u8> = (0u8..100).collect();
        let mut reader = LimitedReader::new(Cursor::new(data), 20, 10).unwrap();

        assert_eq!(reader.seek(SeekFrom::End(-2)).unwrap(), 8);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, vec![28, 29]);
    }

    #[test]
    fn test_seek_out_of_window() {
        let data: Vec<u8> = (0u8..100).collect();
        let mut reader = LimitedReader::new(Cursor::new(data), 0, 10).unwrap();

        assert!(reader.seek(SeekFrom::Start(11)).is_err());
        assert!(reader.seek(SeekFrom::Current(-1)).is_err());
    }

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range("bytes=0-99", 1000), Ok((0, 99)));
        assert_eq!(parse_range("bytes=900-", 1000), Ok((900, 999)));
        assert_eq!(parse_range("bytes=-100", 1000), Ok((900, 999)));
        assert_eq!(parse_range("bytes=0-5000", 1000), Ok((0, 999)));
        assert_eq!(parse_range("items=0-1", 1000), Err(ReaderError::InvalidWhence));
        assert_eq!(parse_range("bytes=1000-", 1000), Err(ReaderError::InvalidOffset));
        assert_eq!(parse_range("bytes=5-2", 1000), Err(ReaderError::InvalidOffset));
    }
}
