use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

/// One complete line of child output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// Live output callback. Invoked from the reader task as each line
/// completes, so it must not block.
pub type OutputCallback = Arc<dyn Fn(OutputLine) + Send + Sync>;

/// Bounded tail of a stream, kept for post-mortem diagnostic parsing.
#[derive(Debug)]
pub(crate) struct OutputTail {
    lines: VecDeque<String>,
    total_bytes: usize,
    max_lines: usize,
    max_bytes: usize,
}

impl OutputTail {
    pub(crate) fn new(max_lines: usize, max_bytes: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            total_bytes: 0,
            max_lines,
            max_bytes,
        }
    }

    pub(crate) fn push(&mut self, line: String) {
        self.total_bytes = self.total_bytes.saturating_add(line.len());
        self.lines.push_back(line);

        while self.lines.len() > self.max_lines || self.total_bytes > self.max_bytes {
            match self.lines.pop_front() {
                Some(removed) => self.total_bytes = self.total_bytes.saturating_sub(removed.len()),
                None => break,
            }
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_drops_oldest_lines_over_line_limit() {
        let mut tail = OutputTail::new(2, 1024);
        tail.push("one".into());
        tail.push("two".into());
        tail.push("three".into());
        assert_eq!(tail.snapshot(), vec!["two", "three"]);
    }

    #[test]
    fn tail_drops_oldest_lines_over_byte_limit() {
        let mut tail = OutputTail::new(100, 8);
        tail.push("aaaa".into());
        tail.push("bbbb".into());
        tail.push("cc".into());
        assert_eq!(tail.snapshot(), vec!["bbbb", "cc"]);
    }
}
