//! Line framing for the stdio transport.
//!
//! One JSON document per newline-terminated line. The size check runs
//! BEFORE bytes are appended, so the resident buffer can never exceed
//! the configured maximum even transiently mid-line. Framing operates on
//! raw bytes: a multi-byte character split across read chunks only
//! becomes text once its line completes.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("message exceeds max buffer size ({size} > {max} bytes)")]
    BufferOverflow { size: usize, max: usize },
}

/// Accumulates stdin chunks into complete lines under a hard byte cap.
pub struct LineBuffer {
    buffer: Vec<u8>,
    max_bytes: usize,
}

impl LineBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_bytes,
        }
    }

    /// Feed a chunk; returns any lines completed by it.
    ///
    /// On overflow the partial line is discarded (the stream stays
    /// usable from the next newline) and the error carries the size the
    /// buffer would have reached.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<String>, FramingError> {
        let mut lines = Vec::new();
        let mut rest = chunk;

        while let Some(newline) = rest.iter().position(|&b| b == b'\n') {
            let (head, tail) = rest.split_at(newline);
            rest = &tail[1..];

            let projected = self.buffer.len() + head.len();
            if projected > self.max_bytes {
                self.buffer.clear();
                return Err(FramingError::BufferOverflow {
                    size: projected,
                    max: self.max_bytes,
                });
            }
            self.buffer.extend_from_slice(head);
            let line_bytes = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&line_bytes).into_owned();
            if !line.trim().is_empty() {
                lines.push(line);
            }
        }

        let projected = self.buffer.len() + rest.len();
        if projected > self.max_bytes {
            self.buffer.clear();
            return Err(FramingError::BufferOverflow {
                size: projected,
                max: self.max_bytes,
            });
        }
        self.buffer.extend_from_slice(rest);
        Ok(lines)
    }

    /// Bytes currently buffered (always ≤ max).
    pub fn resident_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_line() {
        let mut buffer = LineBuffer::new(1024);
        let lines = buffer.feed(b"{\"a\":1}\n").unwrap();
        assert_eq!(lines, vec!["{\"a\":1}"]);
        assert_eq!(buffer.resident_bytes(), 0);
    }

    #[test]
    fn test_split_across_chunks() {
        let mut buffer = LineBuffer::new(1024);
        assert!(buffer.feed(b"{\"a\"").unwrap().is_empty());
        assert_eq!(buffer.resident_bytes(), 4);
        let lines = buffer.feed(b":1}\nnext").unwrap();
        assert_eq!(lines, vec!["{\"a\":1}"]);
        assert_eq!(buffer.resident_bytes(), 4);
    }

    #[test]
    fn test_multibyte_char_split_across_chunks() {
        let mut buffer = LineBuffer::new(1024);
        let text = "{\"p\":\"héllo\"}\n".as_bytes();
        // Split in the middle of the two-byte 'é'.
        let split = text.iter().position(|&b| b == 0xc3).unwrap() + 1;
        buffer.feed(&text[..split]).unwrap();
        let lines = buffer.feed(&text[split..]).unwrap();
        assert_eq!(lines, vec!["{\"p\":\"héllo\"}"]);
    }

    #[test]
    fn test_multiple_lines_one_chunk() {
        let mut buffer = LineBuffer::new(1024);
        let lines = buffer.feed(b"one\ntwo\nthree\n").unwrap();
        assert_eq!(lines, vec!["one", "two", "three"]);
    }

    #[test]
    fn test_blank_lines_skipped() {
        let mut buffer = LineBuffer::new(1024);
        let lines = buffer.feed(b"one\n\n  \ntwo\n").unwrap();
        assert_eq!(lines, vec!["one", "two"]);
    }

    #[test]
    fn test_overflow_checked_before_append() {
        let max = 64;
        let mut buffer = LineBuffer::new(max);
        // Nearly fill the buffer with an unterminated line.
        buffer.feed(&vec![b'a'; max - 10]).unwrap();
        assert_eq!(buffer.resident_bytes(), max - 10);

        // The next chunk would push past the cap: rejected without ever
        // residing in the buffer.
        let err = buffer.feed(&vec![b'b'; 100]).unwrap_err();
        assert!(matches!(err, FramingError::BufferOverflow { .. }));
        assert_eq!(buffer.resident_bytes(), 0);

        // Stream is usable again afterwards.
        let lines = buffer.feed(b"ok\n").unwrap();
        assert_eq!(lines, vec!["ok"]);
    }

    #[test]
    fn test_oversize_complete_line_rejected() {
        let mut buffer = LineBuffer::new(16);
        let mut chunk = vec![b'x'; 32];
        chunk.push(b'\n');
        let err = buffer.feed(&chunk).unwrap_err();
        assert_eq!(err, FramingError::BufferOverflow { size: 32, max: 16 });
    }

    #[test]
    fn test_resident_bytes_never_exceed_max() {
        let max = 32;
        let mut buffer = LineBuffer::new(max);
        for chunk in [
            &b"aaaaaaaaaa"[..],
            &b"bbbbbbbbbbbbbbbbbbbb"[..],
            &b"cc\n"[..],
            &b"ddddddddddddddddddddddddddddddddddd"[..],
        ] {
            let _ = buffer.feed(chunk);
            assert!(buffer.resident_bytes() <= max);
        }
    }
}
