//! Delimiter-framed text.
//!
//! [`LineBuffer`] owns a byte buffer the caller reads into through
//! [`LineBuffer::spare_mut`]. When the buffer is full the consumed prefix is
//! discarded first; only if that frees nothing does the buffer grow by half.
//! Delimiter scanning resumes where the previous scan stopped.

use serde::{Deserialize, Serialize};

use crate::WireError;

/// Initial line buffer size
pub const DEFAULT_LINE_BUFFER_SIZE: usize = 1024;

/// Character encoding for text lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Charset {
    /// UTF-8; malformed input decodes to U+FFFD
    #[default]
    Utf8,
    /// ISO-8859-1; unmappable characters encode as `?`
    Latin1,
}

impl Charset {
    /// Encode `text`
    pub fn encode(&self, text: &str) -> Vec<u8> {
        match self {
            Charset::Utf8 => text.as_bytes().to_vec(),
            Charset::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                .collect(),
        }
    }

    /// Decode `bytes`
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            Charset::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Charset::Latin1 => bytes.iter().map(|&b| char::from(b)).collect(),
        }
    }
}

/// Growable buffer that yields delimiter-terminated lines
#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    start: usize,
    end: usize,
    mark: usize,
    delimiter: Vec<u8>,
    charset: Charset,
}

impl LineBuffer {
    /// Create a buffer splitting on `delimiter`
    pub fn new(charset: Charset, delimiter: &str) -> Result<Self, WireError> {
        Self::with_capacity(charset, delimiter, DEFAULT_LINE_BUFFER_SIZE)
    }

    /// Create a buffer with an explicit initial size
    pub fn with_capacity(charset: Charset, delimiter: &str, capacity: usize) -> Result<Self, WireError> {
        let delimiter = charset.encode(delimiter);
        if delimiter.is_empty() {
            return Err(WireError::EmptyDelimiter);
        }
        Ok(Self {
            buf: vec![0; capacity.max(1)],
            start: 0,
            end: 0,
            mark: 0,
            delimiter,
            charset,
        })
    }

    /// Charset used to decode lines
    pub fn charset(&self) -> Charset {
        self.charset
    }

    /// Next complete line without its delimiter, if one is buffered
    pub fn next_line(&mut self) -> Option<String> {
        let delimiter = std::mem::take(&mut self.delimiter);
        let line = self
            .consume_through(&delimiter)
            .map(|(from, to)| self.charset.decode(&self.buf[from..to]));
        self.delimiter = delimiter;
        line
    }

    /// Discard input through the first occurrence of `marker`.
    ///
    /// Returns false when the marker is not buffered yet; the scan resumes
    /// from the same place after more input arrives.
    pub fn skip_until(&mut self, marker: &[u8]) -> bool {
        marker.is_empty() || self.consume_through(marker).is_some()
    }

    /// Writable space for the next read
    pub fn spare_mut(&mut self) -> &mut [u8] {
        if self.end == self.buf.len() {
            self.compact();
            if self.end == self.buf.len() {
                let len = self.buf.len();
                self.buf.resize(len + (len / 2).max(1), 0);
            }
        }
        &mut self.buf[self.end..]
    }

    /// Record `n` bytes written into the space from [`LineBuffer::spare_mut`]
    pub fn filled(&mut self, n: usize) {
        self.end = (self.end + n).min(self.buf.len());
    }

    /// Bytes buffered but not yet returned
    pub fn buffered(&self) -> usize {
        self.end - self.start
    }

    /// Current size of the underlying buffer
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Scan for `needle` from the resume mark; on a match return the range
    /// before it and consume through it.
    fn consume_through(&mut self, needle: &[u8]) -> Option<(usize, usize)> {
        let n = needle.len();
        while self.mark + n <= self.end {
            if &self.buf[self.mark..self.mark + n] == needle {
                let range = (self.start, self.mark);
                self.start = self.mark + n;
                self.mark = self.start;
                return Some(range);
            }
            self.mark += 1;
        }
        None
    }

    fn compact(&mut self) {
        if self.start == 0 {
            return;
        }
        self.buf.copy_within(self.start..self.end, 0);
        self.end -= self.start;
        self.mark -= self.start;
        self.start = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(lines: &mut LineBuffer, mut input: &[u8]) {
        while !input.is_empty() {
            let spare = lines.spare_mut();
            let n = spare.len().min(input.len());
            spare[..n].copy_from_slice(&input[..n]);
            lines.filled(n);
            input = &input[n..];
        }
    }

    fn drain(lines: &mut LineBuffer) -> Vec<String> {
        std::iter::from_fn(|| lines.next_line()).collect()
    }

    #[test]
    fn test_lines_in_order() {
        let mut lines = LineBuffer::new(Charset::Utf8, "\n").unwrap();
        feed(&mut lines, b"one\ntwo\nthr");
        assert_eq!(drain(&mut lines), vec!["one", "two"]);
        feed(&mut lines, b"ee\n");
        assert_eq!(drain(&mut lines), vec!["three"]);
        assert_eq!(lines.buffered(), 0);
    }

    #[test]
    fn test_multibyte_delimiter_split_across_reads() {
        let mut lines = LineBuffer::new(Charset::Latin1, "\r\n").unwrap();
        feed(&mut lines, b"HELO\r");
        assert!(lines.next_line().is_none());
        feed(&mut lines, b"\nQUIT\r\n");
        assert_eq!(drain(&mut lines), vec!["HELO", "QUIT"]);
    }

    #[test]
    fn test_compacts_before_growing() {
        let mut lines = LineBuffer::with_capacity(Charset::Utf8, "\n", 8).unwrap();
        feed(&mut lines, b"abc\ndefg");
        assert_eq!(drain(&mut lines), vec!["abc"]);
        assert_eq!(lines.spare_mut().len(), 4);
        assert_eq!(lines.capacity(), 8);
    }

    #[test]
    fn test_grows_by_half_for_long_lines() {
        let mut lines = LineBuffer::with_capacity(Charset::Utf8, "\n", 8).unwrap();
        feed(&mut lines, b"0123456789abcdef\n");
        assert_eq!(lines.capacity(), 18);
        assert_eq!(drain(&mut lines), vec!["0123456789abcdef"]);
    }

    #[test]
    fn test_skip_until_marker() {
        let mut lines = LineBuffer::new(Charset::Utf8, "\n").unwrap();
        feed(&mut lines, b"banner junk <<");
        assert!(!lines.skip_until(b"<<>>"));
        feed(&mut lines, b">>first\n");
        assert!(lines.skip_until(b"<<>>"));
        assert_eq!(drain(&mut lines), vec!["first"]);
    }

    #[test]
    fn test_latin1_roundtrip() {
        let bytes = Charset::Latin1.encode("caf\u{e9} \u{20ac}");
        assert_eq!(bytes, vec![b'c', b'a', b'f', 0xE9, b' ', b'?']);
        assert_eq!(Charset::Latin1.decode(&bytes), "caf\u{e9} ?");
    }

    #[test]
    fn test_empty_delimiter_rejected() {
        assert!(matches!(
            LineBuffer::new(Charset::Utf8, ""),
            Err(WireError::EmptyDelimiter)
        ));
    }
}
