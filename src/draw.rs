// SPDX-License-Identifier: MPL-2.0

//! Drawing scaled frames onto XRGB8888 shm canvases.

use rayon::prelude::*;

use crate::buffer::{BYTES_PER_PIXEL, Rect};
use crate::scaler::ScaledView;

/// Pack an RGB color as a little-endian XRGB8888 pixel.
#[inline]
fn xrgb8888([r, g, b]: [u8; 3]) -> [u8; 4] {
    let r = u32::from(r) << 16;
    let g = u32::from(g) << 8;
    let b = u32::from(b);
    (r | g | b).to_le_bytes()
}

/// Fill the whole canvas with `color`.
pub fn clear(canvas: &mut [u8], color: [u8; 3]) {
    let pixel = xrgb8888(color);
    canvas
        .par_chunks_exact_mut(BYTES_PER_PIXEL)
        .for_each(|px| px.copy_from_slice(&pixel));
}

/// Draw `view` at `dest`, blending its alpha over what the canvas holds.
///
/// `dest` is clipped to the canvas.
pub fn blit_xrgb8888(canvas: &mut [u8], stride: usize, view: &ScaledView<'_>, dest: Rect) {
    if stride == 0 {
        return;
    }

    let canvas_width = stride / BYTES_PER_PIXEL;
    let x = dest.x as usize;
    let width = (dest.width.min(view.width) as usize).min(canvas_width.saturating_sub(x));
    let height = dest.height.min(view.height) as usize;

    if width == 0 {
        return;
    }

    canvas
        .par_chunks_exact_mut(stride)
        .skip(dest.y as usize)
        .take(height)
        .enumerate()
        .for_each(|(y, row)| {
            let src = view.row(y);
            let dst = &mut row[x * BYTES_PER_PIXEL..(x + width) * BYTES_PER_PIXEL];

            for (out, px) in dst
                .chunks_exact_mut(BYTES_PER_PIXEL)
                .zip(src.chunks_exact(BYTES_PER_PIXEL))
            {
                let [r, g, b, a] = [px[0], px[1], px[2], px[3]];
                let rgb = if a == u8::MAX {
                    [r, g, b]
                } else {
                    // little-endian XRGB: b, g, r, x
                    let under = [out[2], out[1], out[0]];
                    let blend = |over: u8, under: u8| {
                        let a = u32::from(a);
                        ((u32::from(over) * a + u32::from(under) * (255 - a) + 127) / 255) as u8
                    };
                    [blend(r, under[0]), blend(g, under[1]), blend(b, under[2])]
                };

                out.copy_from_slice(&xrgb8888(rgb));
            }
        });
}
