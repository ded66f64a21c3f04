//! Line decoding over streaming HTTP bodies.
//!
//! Providers stream either Server-Sent Events (`data: {...}` lines, blank
//! separators) or newline-delimited JSON (Ollama). [`LineBuffer`] splits a
//! byte stream into complete lines regardless of how chunks land on line
//! boundaries; [`data_payload`] strips the SSE `data:` prefix.

/// Incremental splitter: push byte chunks, pop complete lines.
#[derive(Default)]
pub struct LineBuffer {
    buf: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns all lines completed by it. Lines are
    /// trimmed of the trailing `\r`, never of leading whitespace.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let mut line: String = self.buf.drain(..=pos).collect();
            line.pop(); // '\n'
            if line.ends_with('\r') {
                line.pop();
            }
            lines.push(line);
        }
        lines
    }

    /// Remaining partial line, if any.
    pub fn take_rest(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buf))
        }
    }
}

/// Returns the payload of an SSE `data:` line, or `None` for other lines.
pub fn data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data: ")
        .or_else(|| line.strip_prefix("data:"))
}
