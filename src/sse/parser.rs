//! Event-stream framing.
//!
//! Frames look like:
//!
//! ```text
//! <STREAM_HEADER>\n
//! data: <codec-encoded-bytes>\n
//! \n
//! ```
//!
//! The header line starts an event and resets the accumulator; following
//! lines are appended newline-trimmed; the blank line ends the event.
//! Multiple `data:` continuation lines concatenate. Anything before the
//! first header is ignored.

/// Line marking the start of an event.
pub const STREAM_HEADER: &str = "event: message";

/// Prefix stripped (once, with one optional following space) from the
/// accumulated event body before decoding.
const DATA_PREFIX: &str = "data:";

/// Accumulates lines into event bodies.
#[derive(Debug, Default)]
pub(crate) struct FrameAccumulator {
    decoding: bool,
    data: String,
}

impl FrameAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line (without its trailing newline). Returns the raw event
    /// body when the line completes an event.
    pub fn push_line(&mut self, line: &str) -> Option<Vec<u8>> {
        let line = line.trim_end_matches('\r');

        if line.is_empty() {
            if !self.decoding {
                return None;
            }
            self.decoding = false;
            if self.data.is_empty() {
                return None;
            }
            let body = self
                .data
                .strip_prefix(DATA_PREFIX)
                .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
                .unwrap_or(&self.data)
                .as_bytes()
                .to_vec();
            self.data.clear();
            return Some(body);
        }

        if line.trim() == STREAM_HEADER {
            self.decoding = true;
            self.data.clear();
            return None;
        }

        self.data.push_str(line);
        None
    }
}
