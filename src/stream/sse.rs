//! SSE frame decoder.
//!
//! The transport delivers an unbounded sequence of byte chunks with no
//! alignment to message boundaries: one chunk can carry several messages, and
//! one message can span several chunks. [`FrameDecoder`] owns the carry-over
//! buffer between chunks and yields the `data:` payload of every complete
//! `\n\n`-terminated message.

const MESSAGE_DELIMITER: &[u8] = b"\n\n";
const DATA_FIELD: &str = "data:";

/// Incremental decoder for the SSE wire framing.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    /// Creates a decoder with an empty carry-over buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and drains every complete message it unlocked.
    ///
    /// Returned strings are the payloads following the `data:` field of each
    /// message, in wire order. Messages without a `data:` field (comments,
    /// keep-alives) produce nothing. The decode is chunk-boundary independent:
    /// any split of the same byte sequence yields the same payload sequence.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut payloads = Vec::new();
        while let Some(end) = find_delimiter(&self.buffer) {
            let message: Vec<u8> = self
                .buffer
                .drain(..end + MESSAGE_DELIMITER.len())
                .collect();
            if let Some(payload) = extract_data(&message[..end]) {
                payloads.push(payload);
            }
        }
        payloads
    }

    /// Number of buffered bytes not yet forming a complete message.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

fn find_delimiter(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(MESSAGE_DELIMITER.len())
        .position(|window| window == MESSAGE_DELIMITER)
}

/// Collects the `data:` lines of one complete message.
///
/// UTF-8 is decoded per message, so multi-byte code points split across
/// chunk boundaries are reassembled before decoding. Multiple `data:` lines
/// join with `\n` per the SSE specification.
fn extract_data(message: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(message);

    let mut lines = Vec::new();
    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if let Some(rest) = line.strip_prefix(DATA_FIELD) {
            lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }

    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}
