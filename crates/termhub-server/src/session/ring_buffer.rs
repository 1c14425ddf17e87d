//! Bounded line buffer for stateless output previews.
//!
//! Keeps the last N lines of control-stripped process output so a caller can
//! peek at what a session is doing without attaching a stream.

use super::ansi::{incomplete_escape_start, strip_control};
use std::collections::VecDeque;

/// Default number of lines retained per session.
pub const DEFAULT_BUFFER_LINES: usize = 50;

/// An unterminated line longer than this is flushed as a line of its own.
const MAX_PARTIAL_LINE: usize = 4096;

/// A fixed-capacity FIFO of text lines.
#[derive(Debug)]
pub struct OutputBuffer {
    lines: VecDeque<String>,
    capacity: usize,
    /// Trailing fragment not yet terminated by `\n`.
    partial: String,
    /// Raw tail of the last chunk that ended inside an escape sequence.
    carry: String,
}

impl OutputBuffer {
    /// Create a new buffer holding at most `capacity` lines.
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
            partial: String::new(),
            carry: String::new(),
        }
    }

    /// Append a complete line, evicting the oldest if full.
    pub fn push_line(&mut self, line: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    /// Append a raw output chunk: control sequences are stripped, the text is
    /// split on newlines, and any unterminated tail is held until completed.
    /// An escape sequence cut off at the end of a chunk waits for the next one.
    pub fn push_output(&mut self, raw: &str) {
        let mut pending = std::mem::take(&mut self.carry);
        pending.push_str(raw);
        if let Some(at) = incomplete_escape_start(&pending) {
            if pending.len() - at <= MAX_PARTIAL_LINE {
                self.carry = pending.split_off(at);
            }
        }

        let clean = strip_control(&pending);
        let mut segments = clean.split('\n');

        if let Some(first) = segments.next() {
            self.partial.push_str(first);
        }
        for segment in segments {
            let line = std::mem::take(&mut self.partial);
            self.push_line(line);
            self.partial.push_str(segment);
        }

        if self.partial.len() > MAX_PARTIAL_LINE {
            let line = std::mem::take(&mut self.partial);
            self.push_line(line);
        }
    }

    /// The newest `max` lines, oldest first. A pending fragment counts as the
    /// newest line.
    pub fn recent(&self, max: usize) -> Vec<String> {
        let pending = (!self.partial.is_empty()).then_some(&self.partial);
        let total = self.lines.len() + usize::from(pending.is_some());
        self.lines
            .iter()
            .chain(pending)
            .skip(total.saturating_sub(max))
            .cloned()
            .collect()
    }

    /// Number of complete lines stored.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether nothing has been captured yet.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.partial.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Clear the buffer.
    pub fn clear(&mut self) {
        self.lines.clear();
        self.partial.clear();
        self.carry.clear();
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_LINES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_lines() {
        let mut buf = OutputBuffer::new(50);
        for i in 1..=60 {
            buf.push_line(format!("line {i}"));
        }
        let lines = buf.recent(usize::MAX);
        assert_eq!(lines.len(), 50);
        assert_eq!(lines.first().map(String::as_str), Some("line 11"));
        assert_eq!(lines.last().map(String::as_str), Some("line 60"));
        let expected: Vec<String> = (11..=60).map(|i| format!("line {i}")).collect();
        assert_eq!(lines, expected);
    }

    #[test]
    fn splits_chunks_across_reads() {
        let mut buf = OutputBuffer::new(10);
        buf.push_output("$ echo hi\r\nh");
        buf.push_output("i\r\n$ ");
        assert_eq!(buf.recent(10), vec!["$ echo hi", "hi", "$ "]);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn strips_before_storing() {
        let mut buf = OutputBuffer::new(10);
        buf.push_output("\x1b[31merror\x1b[0m: boom\n");
        assert_eq!(buf.recent(1), vec!["error: boom"]);
    }

    #[test]
    fn escape_split_across_chunks() {
        let mut buf = OutputBuffer::new(10);
        buf.push_output("\x1b[3");
        buf.push_output("1mred\x1b[0m\n");
        assert_eq!(buf.recent(10), vec!["red"]);

        buf.push_output("\x1b]0;user@host: ~/pr");
        buf.push_output("oj\x07$ ");
        assert_eq!(buf.recent(10), vec!["red", "$ "]);
    }

    #[test]
    fn lone_trailing_escape_waits() {
        let mut buf = OutputBuffer::new(10);
        buf.push_output("done\n\x1b");
        assert_eq!(buf.recent(10), vec!["done"]);
        buf.push_output("[Kprompt");
        assert_eq!(buf.recent(10), vec!["done", "prompt"]);
    }

    #[test]
    fn recent_limits_count() {
        let mut buf = OutputBuffer::new(10);
        buf.push_output("a\nb\nc\nd");
        assert_eq!(buf.recent(2), vec!["c", "d"]);
        assert_eq!(buf.recent(0), Vec::<String>::new());
    }

    #[test]
    fn empty_buffer() {
        let buf = OutputBuffer::default();
        assert!(buf.is_empty());
        assert!(buf.recent(10).is_empty());
        assert_eq!(buf.capacity(), DEFAULT_BUFFER_LINES);
    }

    #[test]
    fn runaway_partial_is_flushed() {
        let mut buf = OutputBuffer::new(4);
        buf.push_output(&"x".repeat(MAX_PARTIAL_LINE + 1));
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn zero_capacity() {
        let mut buf = OutputBuffer::new(0);
        buf.push_line("test");
        assert_eq!(buf.len(), 0);
    }
}
