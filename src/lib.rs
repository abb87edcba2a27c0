// SPDX-License-Identifier: MPL-2.0

//! Looping image-sequence animations with decoding pipelined ahead of
//! presentation.
//!
//! An [`AnimationController`] owns a fixed set of [`PixelBuffer`]s that
//! circulate between a decode thread and a render thread through a bounded
//! [`exchange`]. The decode thread fills recycled buffers with the next
//! frames of the sequence; the render thread presents one ready buffer per
//! frame duration on a [`RenderTarget`] and hands it back.

pub mod buffer;
pub mod controller;
pub mod decoder;
pub mod draw;
pub mod error;
pub mod exchange;
pub mod image_source;
pub mod render_loop;
pub mod scaler;

#[cfg(test)]
mod testing;

pub use buffer::{PixelBuffer, Rect};
pub use controller::{
    AnimationController, EventSink, PlaybackEvent, PlaybackStats, RepeatPolicy, Settings,
};
pub use decoder::FrameDecoder;
pub use error::{ControllerError, DecodeError, PresentError};
pub use exchange::{BufferExchange, ExchangeStats, Lane};
pub use image_source::ImageFileDecoder;
pub use render_loop::{Canvas, LoopState, RenderTarget};
pub use scaler::FrameScaler;
