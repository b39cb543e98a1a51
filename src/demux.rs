//! Routes decoded delta frames to per-index stream buffers.
//!
//! The demultiplexer is the only place that mutates buffer content. The
//! "token" metric is the character count of applied deltas — an
//! approximation inherited from the source system, kept so rate figures
//! stay comparable; no real tokenizer is involved.

use tokio::time::Instant;
use tracing::debug;

use crate::protocol::DeltaFrame;

/// One growing per-index buffer. Content is append-only within a run.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamBuffer {
    pub index: usize,
    pub content: String,
    pub complete: bool,
    pub token_count: u64,
}

/// Progress-callback payload: a self-contained snapshot per applied delta.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamUpdate {
    pub index: usize,
    pub content: String,
    pub complete: bool,
    pub tokens_per_sec: u64,
    pub total_tokens: u64,
}

/// Characters-per-second across all indices, rounded to the nearest integer.
/// Zero elapsed time yields zero rather than a division blowup.
pub fn token_rate(total_tokens: u64, elapsed: std::time::Duration) -> u64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        0
    } else {
        (total_tokens as f64 / secs).round() as u64
    }
}

pub struct Demultiplexer {
    buffers: Vec<StreamBuffer>,
    total_tokens: u64,
    started_at: Instant,
}

impl Demultiplexer {
    /// Fresh run: N empty buffers.
    pub fn new(stream_count: usize) -> Self {
        Self::with_seeds(vec![String::new(); stream_count])
    }

    /// Continuation run: buffer i starts from `seeds[i]`. Seed characters do
    /// not count toward the token metric.
    pub fn with_seeds(seeds: Vec<String>) -> Self {
        let buffers = seeds
            .into_iter()
            .enumerate()
            .map(|(index, content)| StreamBuffer {
                index,
                content,
                complete: false,
                token_count: 0,
            })
            .collect();
        Demultiplexer {
            buffers,
            total_tokens: 0,
            started_at: Instant::now(),
        }
    }

    pub fn stream_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffers(&self) -> &[StreamBuffer] {
        &self.buffers
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_tokens
    }

    /// Current rate snapshot.
    pub fn rate(&self) -> u64 {
        token_rate(self.total_tokens, self.started_at.elapsed())
    }

    /// Apply every in-range `(index, deltaText)` pair in `frame`, invoking
    /// `on_update` once per applied delta.
    pub fn apply(&mut self, frame: &DeltaFrame, on_update: &mut dyn FnMut(StreamUpdate)) {
        for choice in &frame.choices {
            let Some(text) = choice.delta.content.as_deref() else {
                continue;
            };
            let Ok(index) = usize::try_from(choice.index) else {
                debug!(index = choice.index, "dropping delta with negative index");
                continue;
            };
            if index >= self.buffers.len() {
                debug!(index, streams = self.buffers.len(), "dropping out-of-range delta");
                continue;
            }

            let buffer = &mut self.buffers[index];
            buffer.content.push_str(text);
            let chars = text.chars().count() as u64;
            buffer.token_count += chars;
            self.total_tokens += chars;

            on_update(StreamUpdate {
                index,
                content: buffer.content.clone(),
                complete: false,
                tokens_per_sec: self.rate(),
                total_tokens: self.total_tokens,
            });
        }
    }

    /// End of stream: one final `complete=true` callback per non-empty
    /// buffer. Empty buffers stay incomplete and get no callback.
    pub fn finish(&mut self, on_update: &mut dyn FnMut(StreamUpdate)) {
        let rate = self.rate();
        let total = self.total_tokens;
        for buffer in &mut self.buffers {
            if buffer.content.is_empty() {
                continue;
            }
            buffer.complete = true;
            on_update(StreamUpdate {
                index: buffer.index,
                content: buffer.content.clone(),
                complete: true,
                tokens_per_sec: rate,
                total_tokens: total,
            });
        }
    }
}
