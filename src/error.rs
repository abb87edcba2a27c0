// SPDX-License-Identifier: MPL-2.0

//! Error types for the frame pipeline.

use std::path::PathBuf;

/// A frame could not be decoded. Never fatal for the animation.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("failed to read {path}: {why}")]
    Io { path: PathBuf, why: std::io::Error },

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error("jpeg-xl: {0}")]
    Jxl(String),

    #[error("frame is {found:?}, expected {expected:?}")]
    DimensionMismatch {
        expected: (u32, u32),
        found: (u32, u32),
    },

    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// A render target refused or failed a presentation. Never fatal for the animation.
#[derive(Debug, thiserror::Error)]
pub enum PresentError {
    #[error("render target is not available")]
    Unavailable,

    #[error("present rejected: {0}")]
    Rejected(String),

    #[error("scaling failed: {0}")]
    Scale(String),
}

/// Misconfiguration and lifecycle errors reported by the controller.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("frame source is empty")]
    EmptyFrameSource,

    #[error("no frame source configured")]
    NoFrameSource,

    #[error("frame duration must be positive")]
    ZeroFrameDuration,

    #[error("buffer count must be at least 1")]
    ZeroBufferCount,

    #[error("frame {index} is {found:?}, sequence is {expected:?}")]
    DimensionMismatch {
        index: usize,
        expected: (u32, u32),
        found: (u32, u32),
    },

    #[error("frames of {width}x{height} exceed the limit of {limit} bytes")]
    FrameTooLarge { width: u32, height: u32, limit: usize },

    #[error("failed to probe first frame: {0}")]
    Probe(#[source] DecodeError),

    #[error("animation is running; stop it before reconfiguring")]
    Running,

    #[error("a pipeline stage was lost and cannot be restarted")]
    StageLost,

    #[error("failed to spawn pipeline thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("render event loop: {0}")]
    EventLoop(String),
}
