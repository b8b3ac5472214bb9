/// Longest line kept, the rest of a longer line is dropped
pub const MAX_LINE: usize = 10 * 1024;

/// Reassemble lines from arbitrary chunks of tool output.
///
/// Both `\n` and `\r` end a line, as progress bars redraw themselves
/// with carriage returns. Empty lines are dropped.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();

        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                self.flush_into(&mut lines);
            } else if self.pending.len() < MAX_LINE {
                self.pending.push(byte);
            }
        }

        lines
    }

    /// Return the last, unterminated line, if any
    pub fn finish(&mut self) -> Option<String> {
        let mut lines = Vec::with_capacity(1);
        self.flush_into(&mut lines);
        lines.pop()
    }

    fn flush_into(&mut self, lines: &mut Vec<String>) {
        if !self.pending.is_empty() {
            lines.push(String::from_utf8_lossy(&self.pending).into_owned());
            self.pending.clear();
        }
    }
}
