// SPDX-License-Identifier: MPL-2.0

//! Frame placement for fit, stretch and zoom, and resizing into it.

use cosmic_frames_config::{FilterMethod, ScalingMode};
use fast_image_resize::{
    PixelType, ResizeOptions, Resizer,
    images::{Image, ImageRef},
};

use crate::buffer::{BYTES_PER_PIXEL, PixelBuffer, Rect};
use crate::error::PresentError;

/// Source region of a frame and the canvas region it is drawn into.
#[must_use]
pub fn placement(mode: ScalingMode, frame: (u32, u32), canvas: (u32, u32)) -> (Rect, Rect) {
    let (w, h) = frame;
    let (layer_width, layer_height) = canvas;

    if w == 0 || h == 0 || layer_width == 0 || layer_height == 0 {
        return (Rect::default(), Rect::default());
    }

    let source = Rect::full(w, h);
    let full = Rect::full(layer_width, layer_height);

    match mode {
        ScalingMode::Stretch => (source, full),

        ScalingMode::Fit(_) => {
            let ratio = (layer_width as f64 / w as f64).min(layer_height as f64 / h as f64);
            let (new_width, new_height) = (
                ((w as f64 * ratio).round() as u32).clamp(1, layer_width),
                ((h as f64 * ratio).round() as u32).clamp(1, layer_height),
            );

            let dest = Rect::new(
                (layer_width - new_width) / 2,
                (layer_height - new_height) / 2,
                new_width,
                new_height,
            );

            (source, dest)
        }

        ScalingMode::Zoom => {
            let ratio = (layer_width as f64 / w as f64).max(layer_height as f64 / h as f64);
            let (crop_width, crop_height) = (
                ((layer_width as f64 / ratio).round() as u32).clamp(1, w),
                ((layer_height as f64 / ratio).round() as u32).clamp(1, h),
            );

            let source = Rect::new(
                (w - crop_width) / 2,
                (h - crop_height) / 2,
                crop_width,
                crop_height,
            );

            (source, full)
        }
    }
}

/// Color behind a letterboxed frame, as 8-bit RGB.
#[must_use]
pub fn background(mode: ScalingMode) -> [u8; 3] {
    match mode {
        ScalingMode::Fit(color) => color.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8),
        ScalingMode::Stretch | ScalingMode::Zoom => [0, 0, 0],
    }
}

/// RGBA8 rows ready to be drawn at their destination size.
pub struct ScaledView<'a> {
    pixels: &'a [u8],
    stride: usize,
    pub width: u32,
    pub height: u32,
}

impl<'a> ScaledView<'a> {
    /// One row of `width` pixels.
    #[must_use]
    pub fn row(&self, y: usize) -> &'a [u8] {
        let start = y * self.stride;
        &self.pixels[start..start + self.width as usize * BYTES_PER_PIXEL]
    }
}

/// Resizes frames with `fast_image_resize`, reusing its output image.
pub struct FrameScaler {
    resizer: Resizer,
    filter: FilterMethod,
    scaled: Option<Image<'static>>,
}

impl FrameScaler {
    pub fn new(filter: FilterMethod) -> Self {
        Self {
            resizer: Resizer::new(),
            filter,
            scaled: None,
        }
    }

    /// Scale the `source` region of `buffer` to `size`.
    ///
    /// Regions already at the requested size are borrowed from the buffer.
    pub fn scale<'a>(
        &'a mut self,
        buffer: &'a PixelBuffer,
        source: Rect,
        size: (u32, u32),
    ) -> Result<ScaledView<'a>, PresentError> {
        let (width, height) = size;
        let fits = source.x.saturating_add(source.width) <= buffer.width()
            && source.y.saturating_add(source.height) <= buffer.height();

        if !fits || source.is_empty() || width == 0 || height == 0 {
            return Err(PresentError::Scale(format!(
                "cannot scale {source:?} of {:?} to {size:?}",
                buffer.dimensions()
            )));
        }

        if source.size() == size {
            let offset = source.y as usize * buffer.stride() + source.x as usize * BYTES_PER_PIXEL;
            return Ok(ScaledView {
                pixels: &buffer.pixels()[offset..],
                stride: buffer.stride(),
                width,
                height,
            });
        }

        let frame = ImageRef::new(
            buffer.width(),
            buffer.height(),
            buffer.pixels(),
            PixelType::U8x4,
        )
        .map_err(|why| PresentError::Scale(why.to_string()))?;

        let reuse = self
            .scaled
            .as_ref()
            .is_some_and(|scaled| scaled.width() == width && scaled.height() == height);

        let scaled = if reuse {
            self.scaled.as_mut()
        } else {
            self.scaled.insert(Image::new(width, height, PixelType::U8x4));
            self.scaled.as_mut()
        };

        let Some(scaled) = scaled else {
            return Err(PresentError::Scale("no output image".into()));
        };

        let options = ResizeOptions::new()
            .resize_alg(self.filter.into())
            .crop(
                f64::from(source.x),
                f64::from(source.y),
                f64::from(source.width),
                f64::from(source.height),
            );

        self.resizer
            .resize(&frame, scaled, &options)
            .map_err(|why| PresentError::Scale(why.to_string()))?;

        Ok(ScaledView {
            pixels: scaled.buffer(),
            stride: width as usize * BYTES_PER_PIXEL,
            width,
            height,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_letterboxes_centered() {
        let (source, dest) = placement(ScalingMode::Fit([0.0; 3]), (100, 50), (200, 200));
        assert_eq!(source, Rect::full(100, 50));
        assert_eq!(dest, Rect::new(0, 50, 200, 100));
    }

    #[test]
    fn zoom_crops_source() {
        let (source, dest) = placement(ScalingMode::Zoom, (100, 50), (200, 200));
        assert_eq!(dest, Rect::full(200, 200));
        assert_eq!(source, Rect::new(25, 0, 50, 50));
    }

    #[test]
    fn stretch_maps_whole_to_whole() {
        let (source, dest) = placement(ScalingMode::Stretch, (3, 7), (10, 2));
        assert_eq!(source, Rect::full(3, 7));
        assert_eq!(dest, Rect::full(10, 2));
    }

    #[test]
    fn empty_canvas_places_nothing() {
        let (source, dest) = placement(ScalingMode::Zoom, (3, 7), (0, 2));
        assert!(source.is_empty());
        assert!(dest.is_empty());
    }

    #[test]
    fn fit_background_color() {
        assert_eq!(background(ScalingMode::Fit([1.0, 0.5, 0.0])), [255, 128, 0]);
        assert_eq!(background(ScalingMode::Zoom), [0, 0, 0]);
    }

    #[test]
    fn same_size_borrows_frame() {
        let mut buffer = PixelBuffer::new(0, 4, 2);
        for (index, px) in buffer.pixels_mut().chunks_exact_mut(4).enumerate() {
            px[0] = index as u8;
        }

        let mut scaler = FrameScaler::new(FilterMethod::Nearest);
        let view = scaler.scale(&buffer, Rect::new(1, 1, 2, 1), (2, 1)).unwrap();
        assert_eq!(view.row(0)[0], 5);
        assert_eq!(view.row(0)[4], 6);
    }

    #[test]
    fn resize_fills_requested_size() {
        let mut buffer = PixelBuffer::new(0, 2, 2);
        for px in buffer.pixels_mut().chunks_exact_mut(4) {
            px.copy_from_slice(&[200, 100, 50, 255]);
        }

        let mut scaler = FrameScaler::new(FilterMethod::Nearest);
        let view = scaler.scale(&buffer, Rect::full(2, 2), (4, 4)).unwrap();
        assert_eq!((view.width, view.height), (4, 4));
        assert_eq!(view.row(3).len(), 16);
        assert_eq!(&view.row(3)[12..], &[200, 100, 50, 255]);
    }

    #[test]
    fn out_of_bounds_source_is_an_error() {
        let buffer = PixelBuffer::new(0, 2, 2);
        let mut scaler = FrameScaler::new(FilterMethod::Linear);
        assert!(scaler.scale(&buffer, Rect::new(1, 1, 2, 2), (4, 4)).is_err());
    }
}
