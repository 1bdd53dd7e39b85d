//! Byte-level line splitting for child process output.

/// Splits a byte stream into lines on `\n`, `\r\n` or a bare `\r`.
///
/// Input is buffered as raw bytes so multi-byte UTF-8 sequences split
/// across reads are decoded intact. A single line longer than
/// `max_line_bytes` is truncated; the dropped byte count is reported by
/// [`LineBuffer::consume_overflowed_bytes`].
#[derive(Debug)]
pub struct LineBuffer {
    buffer: Vec<u8>,
    max_line_bytes: usize,
    overflowed_bytes: usize,
    pending_cr: bool,
}

impl LineBuffer {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_line_bytes,
            overflowed_bytes: 0,
            pending_cr: false,
        }
    }

    /// Feed a chunk, returning every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            // `\r\n` straddling two chunks is still one terminator.
            if std::mem::take(&mut self.pending_cr) && byte == b'\n' {
                continue;
            }
            match byte {
                b'\n' => lines.push(self.take_line()),
                b'\r' => {
                    lines.push(self.take_line());
                    self.pending_cr = true;
                }
                _ if self.buffer.len() < self.max_line_bytes => self.buffer.push(byte),
                _ => self.overflowed_bytes = self.overflowed_bytes.saturating_add(1),
            }
        }
        lines
    }

    /// Return the unterminated remainder, if any.
    pub fn flush(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.take_line())
        }
    }

    pub fn consume_overflowed_bytes(&mut self) -> usize {
        std::mem::take(&mut self.overflowed_bytes)
    }

    fn take_line(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        line
    }
}

#[cfg(test)]
mod tests {
    use super::LineBuffer;

    #[test]
    fn splits_mixed_newlines() {
        let mut buffer = LineBuffer::new(1024);
        let lines = buffer.push(b"a\nb\r\nc\rd");
        assert_eq!(lines, vec!["a", "b", "c"]);
        assert_eq!(buffer.flush().as_deref(), Some("d"));
        assert_eq!(buffer.flush(), None);
    }

    #[test]
    fn crlf_split_across_chunks_is_one_terminator() {
        let mut buffer = LineBuffer::new(1024);
        assert_eq!(buffer.push(b"first\r"), vec!["first"]);
        assert_eq!(buffer.push(b"\nsecond\n"), vec!["second"]);
    }

    #[test]
    fn multibyte_char_split_across_chunks() {
        let bytes = "héllo\n".as_bytes();
        let mut buffer = LineBuffer::new(1024);
        assert!(buffer.push(&bytes[..2]).is_empty());
        assert_eq!(buffer.push(&bytes[2..]), vec!["héllo"]);
    }

    #[test]
    fn truncates_long_lines() {
        let mut buffer = LineBuffer::new(4);
        let lines = buffer.push(b"abcdef\n");
        assert_eq!(lines, vec!["abcd"]);
        assert_eq!(buffer.consume_overflowed_bytes(), 2);
        assert_eq!(buffer.consume_overflowed_bytes(), 0);
    }
}
