//! Incremental parser for the backend's `data:`-framed SSE stream.
//!
//! Chunk boundaries from the transport land anywhere, including mid-line, so
//! the parser keeps the trailing incomplete line in a carry-over buffer
//! between `feed` calls. A malformed payload drops that one line, never the
//! stream.

use tracing::warn;

use crate::protocol::DeltaFrame;

const DATA_PREFIX: &str = "data: ";
const DONE_SENTINEL: &str = "[DONE]";

/// Newline-framed SSE decoder. One instance per run; not restartable.
#[derive(Default)]
pub struct SseParser {
    carry: String,
}

impl SseParser {
    pub fn new() -> Self {
        SseParser {
            carry: String::new(),
        }
    }

    /// Feed one raw chunk from the response body. Returns every frame whose
    /// line completed inside this chunk.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<DeltaFrame> {
        self.carry.push_str(&String::from_utf8_lossy(chunk));

        let mut frames = Vec::new();
        while let Some(line_end) = self.carry.find('\n') {
            let line = self.carry[..line_end].trim().to_string();
            self.carry.drain(..=line_end);

            let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
                continue;
            };
            let payload = payload.trim();
            if payload == DONE_SENTINEL {
                continue;
            }

            match serde_json::from_str::<DeltaFrame>(payload) {
                Ok(frame) => frames.push(frame),
                Err(err) => {
                    warn!(error = %err, "skipping undecodable stream frame");
                }
            }
        }
        frames
    }

    /// Bytes of the trailing incomplete line still held between feeds.
    pub fn carry_len(&self) -> usize {
        self.carry.len()
    }
}
