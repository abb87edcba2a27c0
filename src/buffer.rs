// SPDX-License-Identifier: MPL-2.0

//! Reusable pixel storage circulating between the decode and render stages.

/// Bytes per RGBA8 pixel.
pub const BYTES_PER_PIXEL: usize = 4;

/// Largest frame a sequence may use, in bytes: a 16384x8192 RGBA8 image.
pub const MAX_FRAME_BYTES: usize = 16384 * 8192 * BYTES_PER_PIXEL;

/// Bytes needed for one RGBA8 frame, or `None` if that overflows `usize`.
#[must_use]
pub fn frame_len(width: u32, height: u32) -> Option<usize> {
    usize::try_from(width)
        .ok()?
        .checked_mul(usize::try_from(height).ok()?)?
        .checked_mul(BYTES_PER_PIXEL)
}

/// What a [`PixelBuffer`] currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Contents {
    /// Freshly allocated or recycled, no frame in it.
    Empty,
    /// Holds the decoded pixels of a frame.
    Decoded(usize),
    /// Decoding the frame failed; the slot still advances the sequence.
    Skipped(usize),
}

/// Mutable RGBA8 storage for one decoded frame.
///
/// A run allocates a fixed number of these once. They are moved between the
/// exchange channels and the stages, and overwritten in place by each decode.
pub struct PixelBuffer {
    /// Stable identity of this buffer within its run.
    slot: usize,
    width: u32,
    height: u32,
    data: Vec<u8>,
    contents: Contents,
}

impl PixelBuffer {
    /// Allocate a zeroed buffer for frames of the given size.
    ///
    /// The size must have been checked against [`MAX_FRAME_BYTES`].
    #[must_use]
    pub fn new(slot: usize, width: u32, height: u32) -> Self {
        Self {
            slot,
            width,
            height,
            data: vec![0; width as usize * height as usize * BYTES_PER_PIXEL],
            contents: Contents::Empty,
        }
    }

    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Bytes per row.
    #[must_use]
    pub fn stride(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL
    }

    /// Raw RGBA8 pixels, row-major.
    #[must_use]
    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// Raw RGBA8 pixels for decoding into.
    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    #[must_use]
    pub fn contents(&self) -> Contents {
        self.contents
    }

    /// Index of the source frame this buffer was last filled for.
    #[must_use]
    pub fn frame(&self) -> Option<usize> {
        match self.contents {
            Contents::Empty => None,
            Contents::Decoded(frame) | Contents::Skipped(frame) => Some(frame),
        }
    }

    /// Whether the pixels can be put on screen.
    #[must_use]
    pub fn is_presentable(&self) -> bool {
        matches!(self.contents, Contents::Decoded(_))
    }

    pub fn mark_decoded(&mut self, frame: usize) {
        self.contents = Contents::Decoded(frame);
    }

    pub fn mark_skipped(&mut self, frame: usize) {
        self.contents = Contents::Skipped(frame);
    }

    /// Forget the frame without touching the pixels.
    pub fn recycle(&mut self) {
        self.contents = Contents::Empty;
    }
}

impl std::fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("slot", &self.slot)
            .field("size", &(self.width, self.height))
            .field("contents", &self.contents)
            .finish()
    }
}

/// An axis-aligned pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    #[must_use]
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Rectangle covering a whole surface of the given size.
    #[must_use]
    pub const fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    #[must_use]
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_tracks_contents() {
        let mut buffer = PixelBuffer::new(1, 3, 2);
        assert_eq!(buffer.pixels().len(), 3 * 2 * 4);
        assert_eq!(buffer.stride(), 12);
        assert_eq!(buffer.frame(), None);
        assert!(!buffer.is_presentable());

        buffer.mark_decoded(5);
        assert_eq!(buffer.frame(), Some(5));
        assert!(buffer.is_presentable());

        buffer.mark_skipped(6);
        assert_eq!(buffer.frame(), Some(6));
        assert!(!buffer.is_presentable());

        buffer.pixels_mut()[0] = 9;
        buffer.recycle();
        assert_eq!(buffer.contents(), Contents::Empty);
        assert_eq!(buffer.pixels()[0], 9);
    }

    #[test]
    fn frame_len_checks_overflow() {
        assert_eq!(frame_len(3, 2), Some(24));
        assert_eq!(frame_len(0, 7), Some(0));
        assert_eq!(frame_len(16384, 8192), Some(MAX_FRAME_BYTES));
        if usize::BITS == 32 {
            assert_eq!(frame_len(u32::MAX, u32::MAX), None);
        } else {
            assert!(frame_len(u32::MAX, u32::MAX).is_some_and(|len| len > MAX_FRAME_BYTES));
        }
    }

    #[test]
    fn rect_helpers() {
        assert!(Rect::full(0, 10).is_empty());
        assert_eq!(Rect::new(1, 2, 3, 4).size(), (3, 4));
    }
}
