// SPDX-License-Identifier: MPL-2.0

//! Decode stage: recycle lane → decode → ready lane.

use std::sync::Arc;

use crate::buffer::PixelBuffer;
use crate::controller::{Counters, Shared};
use crate::error::DecodeError;
use crate::exchange::{BufferExchange, Closed, Lane};

/// Source of frame pixels, keyed by an opaque frame identifier.
///
/// Implementations decode into the caller's buffer so that a run never
/// allocates pixel storage per frame.
pub trait FrameDecoder: Send + 'static {
    /// Identifies one frame of a sequence, e.g. a file path.
    type Id: Clone + std::fmt::Debug + Send + Sync + 'static;

    /// Read the pixel size of a frame without decoding it.
    fn probe_dimensions(&mut self, id: &Self::Id) -> Result<(u32, u32), DecodeError>;

    /// Decode a frame as RGBA8 into `buffer`, overwriting its pixels.
    ///
    /// Must fail with [`DecodeError::DimensionMismatch`] instead of writing
    /// when the frame is not the buffer's size.
    fn decode_into(&mut self, id: &Self::Id, buffer: &mut PixelBuffer) -> Result<(), DecodeError>;
}

/// The decoder side of a run.
///
/// Its cursor runs ahead of presentation and wraps at the end of the
/// sequence; how far ahead is bounded by the exchange capacity.
pub(crate) struct DecodeStage<D: FrameDecoder> {
    decoder: D,
    frames: Arc<[D::Id]>,
    cursor: usize,
    retries: u32,
}

/// What the decode thread hands back when it exits.
pub(crate) struct DecodeOutcome<D: FrameDecoder> {
    pub stage: DecodeStage<D>,
    /// Buffers the stage still owned when the exchange closed.
    pub held: Vec<PixelBuffer>,
}

impl<D: FrameDecoder> DecodeStage<D> {
    pub fn new(decoder: D, frames: Arc<[D::Id]>, cursor: usize, retries: u32) -> Self {
        let cursor = cursor % frames.len().max(1);
        Self {
            decoder,
            frames,
            cursor,
            retries,
        }
    }

    /// Index of the next frame to decode.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn into_decoder(self) -> D {
        self.decoder
    }

    pub fn advance(&mut self) {
        self.cursor = (self.cursor + 1) % self.frames.len();
    }

    /// Decode the frame under the cursor into `buffer`.
    ///
    /// A failing frame is attempted `retries + 1` times. If it still fails the
    /// buffer is marked skipped so the renderer keeps the sequence position.
    /// Returns whether the frame was decoded.
    pub fn fill(&mut self, buffer: &mut PixelBuffer, counters: &Counters) -> bool {
        let index = self.cursor;
        let id = &self.frames[index];
        let attempts = self.retries.saturating_add(1);

        for attempt in 1..=attempts {
            match self.decoder.decode_into(id, buffer) {
                Ok(()) => {
                    buffer.mark_decoded(index);
                    tracing::trace!(frame = index, slot = buffer.slot(), "frame decoded");
                    return true;
                }

                Err(why) => {
                    tracing::warn!(frame = index, ?id, attempt, attempts, %why, "frame decode failed");
                    if attempt < attempts {
                        counters.add_decode_retry();
                    }
                }
            }
        }

        counters.add_skipped();
        buffer.mark_skipped(index);
        false
    }

    /// Loop until the run stops or the exchange closes.
    pub fn run(mut self, exchange: &BufferExchange, shared: &Shared) -> DecodeOutcome<D> {
        let span = tracing::debug_span!("decode", frames = self.frames.len());
        let _handle = span.enter();

        tracing::debug!(cursor = self.cursor, "decode stage started");
        let mut held = Vec::new();

        while shared.is_running() {
            let Ok(mut buffer) = exchange.take(Lane::Recycle) else {
                break;
            };

            self.fill(&mut buffer, &shared.counters);

            if let Err(Closed(buffer)) = exchange.put(Lane::Ready, buffer) {
                held.push(buffer);
                break;
            }

            self.advance();
        }

        tracing::debug!(cursor = self.cursor, held = held.len(), "decode stage stopped");
        DecodeOutcome { stage: self, held }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedDecoder, capture_warnings};

    fn stage(decoder: ScriptedDecoder, frames: &[u32], retries: u32) -> DecodeStage<ScriptedDecoder> {
        DecodeStage::new(decoder, frames.to_vec().into(), 0, retries)
    }

    #[test]
    fn cursor_wraps_after_last_frame() {
        let mut stage = stage(ScriptedDecoder::new((1, 1)), &[0, 1, 2], 0);
        let visited: Vec<usize> = (0..5)
            .map(|_| {
                let cursor = stage.cursor();
                stage.advance();
                cursor
            })
            .collect();
        assert_eq!(visited, [0, 1, 2, 0, 1]);
    }

    #[test]
    fn fill_retries_then_succeeds() {
        let decoder = ScriptedDecoder::new((2, 2)).fail(7, 1);
        let mut stage = stage(decoder, &[7], 2);
        let counters = Counters::default();
        let mut buffer = PixelBuffer::new(0, 2, 2);

        assert!(stage.fill(&mut buffer, &counters));
        assert_eq!(buffer.frame(), Some(0));
        assert!(buffer.is_presentable());
        assert_eq!(buffer.pixels()[0], 7);
        assert_eq!(counters.snapshot().decode_retries, 1);
    }

    #[test]
    fn fill_marks_skipped_after_retries_exhausted() {
        let decoder = ScriptedDecoder::new((2, 2)).fail(3, 10);
        let mut stage = stage(decoder, &[3], 1);
        let counters = Counters::default();
        let mut buffer = PixelBuffer::new(0, 2, 2);

        assert!(!stage.fill(&mut buffer, &counters));
        assert_eq!(buffer.frame(), Some(0));
        assert!(!buffer.is_presentable());

        let stats = counters.snapshot();
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.decode_retries, 1);
    }

    #[test]
    fn decode_failures_are_logged_as_warnings() {
        let decoder = ScriptedDecoder::new((2, 2)).fail(4, 10);
        let mut stage = stage(decoder, &[4], 1);
        let counters = Counters::default();
        let mut buffer = PixelBuffer::new(0, 2, 2);

        let (decoded, logs) = capture_warnings(|| stage.fill(&mut buffer, &counters));

        assert!(!decoded);
        assert_eq!(logs.matches("frame decode failed").count(), 2);
        assert!(logs.contains("WARN"));
        assert!(logs.contains("scripted failure of 4"));
    }

    #[test]
    fn start_offset_is_wrapped() {
        let stage = DecodeStage::new(ScriptedDecoder::new((1, 1)), vec![0u32, 1].into(), 5, 0);
        assert_eq!(stage.cursor(), 1);
    }
}
