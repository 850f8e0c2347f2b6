//! Character-by-character "typing" output.
//!
//! Used when a function supplies reply text directly: instead of dumping the
//! text in one write, each character is emitted on its own with a short
//! pause, so the caller sees the reply being typed. Short replies type
//! slowly, long replies type fast.

use std::time::Duration;

use axum::body::Bytes;
use futures::Stream;
use serde::Deserialize;

/// Pacing parameters for [`typed_stream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TypingConfig {
    /// Chunk length (in characters) at and above which the minimum delay applies.
    pub max_length: usize,
    /// Per-character delay for long chunks, in milliseconds.
    pub min_delay_ms: u64,
    /// Per-character delay for very short chunks, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            max_length: 200,
            min_delay_ms: 30,
            max_delay_ms: 100,
        }
    }
}

impl TypingConfig {
    /// Per-character delay for a chunk of `chunk_len` characters.
    #[must_use]
    pub fn delay_for(&self, chunk_len: usize) -> Duration {
        typing_delay(
            chunk_len,
            self.max_length,
            Duration::from_millis(self.min_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

/// Linear interpolation from `max` (empty chunk) down to `min` (chunk of
/// `max_len` characters or more), never below `min`.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_sign_loss)]
pub fn typing_delay(chunk_len: usize, max_len: usize, min: Duration, max: Duration) -> Duration {
    if max_len == 0 {
        return min;
    }
    let min_ms = min.as_secs_f64() * 1000.0;
    let max_ms = max.as_secs_f64() * 1000.0;
    let ratio = chunk_len as f64 / max_len as f64;
    let delay_ms = (max_ms - (max_ms - min_ms) * ratio).max(min_ms);
    Duration::from_micros((delay_ms * 1000.0).round() as u64)
}

/// Emit every character of every chunk, in order, each followed by the
/// chunk's delay. The stream ends after the last character of the last chunk.
pub fn typed_stream(
    chunks: Vec<String>,
    config: TypingConfig,
) -> impl Stream<Item = Bytes> + Send + 'static {
    async_stream::stream! {
        for chunk in chunks {
            let delay = config.delay_for(chunk.chars().count());
            tracing::trace!(
                chars = chunk.chars().count(),
                delay_ms = delay.as_millis() as u64,
                "Typing chunk"
            );
            for ch in chunk.chars() {
                let mut buf = [0u8; 4];
                yield Bytes::copy_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                tokio::time::sleep(delay).await;
            }
        }
    }
}
