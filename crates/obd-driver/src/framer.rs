//! Response framing on the adapter prompt character

use tracing::warn;

/// Prompt an ELM327-class adapter prints after every reply
pub const PROMPT: u8 = b'>';

/// Unterminated bytes kept before the oldest are discarded
const MAX_BUFFERED: usize = 8192;

/// Accumulates link bytes and cuts them into reply frames
#[derive(Debug)]
pub struct ResponseFramer {
    buffer: Vec<u8>,
    terminator: u8,
    trimmed: u64,
}

impl Default for ResponseFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseFramer {
    pub fn new() -> Self {
        Self::with_terminator(PROMPT)
    }

    pub fn with_terminator(terminator: u8) -> Self {
        Self {
            buffer: Vec::with_capacity(256),
            terminator,
            trimmed: 0,
        }
    }

    /// Append incoming bytes
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
        if self.buffer.len() > MAX_BUFFERED && !self.buffer.contains(&self.terminator) {
            let excess = self.buffer.len() - MAX_BUFFERED / 2;
            self.buffer.drain(..excess);
            self.trimmed += 1;
            warn!("Response buffer overflow, dropped {} bytes", excess);
        }
    }

    /// Extract the next complete frame, if a terminator has arrived.
    ///
    /// Everything before the first terminator is consumed along with it;
    /// line breaks inside the frame are folded into single spaces.
    pub fn next_frame(&mut self) -> Option<String> {
        let end = self.buffer.iter().position(|b| *b == self.terminator)?;
        let raw: Vec<u8> = self.buffer.drain(..=end).collect();
        Some(sanitize(&raw[..end]))
    }

    /// Bytes waiting for a terminator
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Times the buffer had to be trimmed
    pub fn overflow_count(&self) -> u64 {
        self.trimmed
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

fn sanitize(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_split_across_chunks() {
        let mut framer = ResponseFramer::new();
        framer.feed(b"41 0C ");
        assert_eq!(framer.next_frame(), None);
        framer.feed(b"1A F8\r\r>");
        assert_eq!(framer.next_frame().as_deref(), Some("41 0C 1A F8"));
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_multiline_frame_is_joined() {
        let mut framer = ResponseFramer::new();
        framer.feed(b"SEARCHING...\r\n43 01 33 00 00\r\n\r>");
        assert_eq!(
            framer.next_frame().as_deref(),
            Some("SEARCHING... 43 01 33 00 00")
        );
    }

    #[test]
    fn test_one_frame_at_a_time() {
        let mut framer = ResponseFramer::new();
        framer.feed(b"OK\r>ELM327 v1.5\r>41 0D");
        assert_eq!(framer.next_frame().as_deref(), Some("OK"));
        assert_eq!(framer.next_frame().as_deref(), Some("ELM327 v1.5"));
        assert_eq!(framer.next_frame(), None);
        assert_eq!(framer.buffered(), 5);
    }

    #[test]
    fn test_empty_frame() {
        let mut framer = ResponseFramer::new();
        framer.feed(b"\r\r>");
        assert_eq!(framer.next_frame().as_deref(), Some(""));
    }

    #[test]
    fn test_overflow_without_terminator_is_trimmed() {
        let mut framer = ResponseFramer::new();
        framer.feed(&vec![b'A'; MAX_BUFFERED + 10]);
        assert!(framer.buffered() <= MAX_BUFFERED);
        assert_eq!(framer.overflow_count(), 1);
    }
}
