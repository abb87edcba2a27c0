// SPDX-License-Identifier: MPL-2.0

//! Frame sequences read from image files on disk.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use image::{ColorType, ImageDecoder, ImageReader};
use jxl_oxide::{EnumColourEncoding, JxlImage, PixelFormat};
use walkdir::WalkDir;

use crate::buffer::{BYTES_PER_PIXEL, PixelBuffer};
use crate::decoder::FrameDecoder;
use crate::error::DecodeError;

const EXTENSIONS: &[&str] = &["bmp", "gif", "jpeg", "jpg", "jxl", "png", "webp"];

fn is_jxl(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("jxl"))
}

fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| EXTENSIONS.iter().any(|e| ext.eq_ignore_ascii_case(e)))
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('.'))
}

/// Frames of `source`: the images of a directory in natural order, or the
/// file itself.
pub fn list_frames(source: &Path) -> Result<Vec<PathBuf>, DecodeError> {
    let source = source.canonicalize().map_err(|why| DecodeError::Io {
        path: source.to_path_buf(),
        why,
    })?;

    if source.is_file() {
        return Ok(vec![source]);
    }

    let mut frames: Vec<PathBuf> = WalkDir::new(&source)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .into_iter()
        .filter_map(Result::ok)
        .map(walkdir::DirEntry::into_path)
        .filter(|path| path.is_file() && !is_hidden(path) && is_supported(path))
        .collect();

    frames.sort_by(|a, b| natural_cmp(&a.to_string_lossy(), &b.to_string_lossy()));
    tracing::debug!(?source, frames = frames.len(), "frames listed");
    Ok(frames)
}

/// Compare strings with runs of digits ordered by value, so `2` < `10`.
fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut a = a.chars().peekable();
    let mut b = b.chars().peekable();

    loop {
        match (a.peek().copied(), b.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,

            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let take_number = |chars: &mut std::iter::Peekable<std::str::Chars<'_>>| {
                    let mut digits = String::new();
                    while let Some(c) = chars.next_if(char::is_ascii_digit) {
                        digits.push(c);
                    }
                    digits
                };

                let x = take_number(&mut a);
                let y = take_number(&mut b);
                let (x_trim, y_trim) = (x.trim_start_matches('0'), y.trim_start_matches('0'));

                let order = x_trim
                    .len()
                    .cmp(&y_trim.len())
                    .then_with(|| x_trim.cmp(y_trim))
                    .then_with(|| x.len().cmp(&y.len()));

                if order != Ordering::Equal {
                    return order;
                }
            }

            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(&y);
                }
                a.next();
                b.next();
            }
        }
    }
}

/// Decodes image files with `image`, and JPEG XL with `jxl-oxide`.
#[derive(Debug, Default)]
pub struct ImageFileDecoder {
    /// Decode target for formats that are not RGBA8 on disk.
    scratch: Vec<u8>,
}

impl ImageFileDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

fn open(path: &Path) -> Result<ImageReader<std::io::BufReader<std::fs::File>>, DecodeError> {
    let io = |why| DecodeError::Io {
        path: path.to_path_buf(),
        why,
    };

    ImageReader::open(path)
        .map_err(io)?
        .with_guessed_format()
        .map_err(io)
}

fn open_jxl(path: &Path) -> Result<JxlImage, DecodeError> {
    JxlImage::builder()
        .open(path)
        .map_err(|why| DecodeError::Jxl(format!("failed to read image header: {why}")))
}

fn check_size(buffer: &PixelBuffer, found: (u32, u32)) -> Result<(), DecodeError> {
    let expected = buffer.dimensions();
    if found == expected {
        Ok(())
    } else {
        Err(DecodeError::DimensionMismatch { expected, found })
    }
}

/// Storage of one channel value, as `image` decoders emit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sample {
    U8,
    U16,
    F32,
}

impl Sample {
    fn of(color: ColorType) -> Option<Self> {
        match color {
            ColorType::L8 | ColorType::La8 | ColorType::Rgb8 | ColorType::Rgba8 => Some(Self::U8),
            ColorType::L16 | ColorType::La16 | ColorType::Rgb16 | ColorType::Rgba16 => {
                Some(Self::U16)
            }
            ColorType::Rgb32F | ColorType::Rgba32F => Some(Self::F32),
            _ => None,
        }
    }

    fn size(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
            Self::F32 => 4,
        }
    }

    /// Native-endian sample bytes to an 8-bit value.
    fn to_u8(self, bytes: &[u8]) -> u8 {
        match self {
            Self::U8 => bytes.first().copied().unwrap_or_default(),
            Self::U16 => {
                let value = u16::from_ne_bytes(bytes.try_into().unwrap_or_default());
                ((u32::from(value) + 128) / 257) as u8
            }
            Self::F32 => {
                let value = f32::from_ne_bytes(bytes.try_into().unwrap_or_default());
                (value.clamp(0.0, 1.0) * 255. + 0.5) as u8
            }
        }
    }

    /// Rewrite `samples` as one byte per channel, reusing its storage.
    fn narrow_in_place(self, samples: &mut Vec<u8>) {
        let size = self.size();
        if size == 1 {
            return;
        }

        let count = samples.len() / size;
        for index in 0..count {
            let start = index * size;
            samples[index] = self.to_u8(&samples[start..start + size]);
        }
        samples.truncate(count);
    }
}

/// Expand packed gray, gray-alpha or RGB pixels to RGBA8.
fn expand_to_rgba(src: &[u8], channels: usize, dst: &mut [u8]) {
    for (out, px) in dst
        .chunks_exact_mut(BYTES_PER_PIXEL)
        .zip(src.chunks_exact(channels))
    {
        let rgba = match *px {
            [l] => [l, l, l, u8::MAX],
            [l, a] => [l, l, l, a],
            [r, g, b] => [r, g, b, u8::MAX],
            [r, g, b, a, ..] => [r, g, b, a],
            [] => [0, 0, 0, u8::MAX],
        };
        out.copy_from_slice(&rgba);
    }
}

impl ImageFileDecoder {
    fn decode_jxl(&mut self, path: &Path, buffer: &mut PixelBuffer) -> Result<(), DecodeError> {
        let mut image = open_jxl(path)?;
        check_size(buffer, (image.width(), image.height()))?;

        image.request_color_encoding(EnumColourEncoding::srgb(
            jxl_oxide::RenderingIntent::Relative,
        ));

        match image.pixel_format() {
            PixelFormat::Gray | PixelFormat::Graya | PixelFormat::Rgb | PixelFormat::Rgba => (),
            format => {
                return Err(DecodeError::Jxl(format!(
                    "unsupported pixel format {format:?}"
                )));
            }
        }

        let render = image
            .render_frame(0)
            .map_err(|why| DecodeError::Jxl(format!("failed to render image frame: {why}")))?;

        let framebuffer = render.image_all_channels();
        let channels = framebuffer.channels();

        self.scratch.clear();
        self.scratch.extend(
            framebuffer
                .buf()
                .iter()
                .map(|x| (x.clamp(0.0, 1.0) * 255. + 0.5) as u8),
        );

        if channels == 0 || self.scratch.len() < buffer.pixels().len() / BYTES_PER_PIXEL * channels {
            return Err(DecodeError::Malformed(format!(
                "{} has a short framebuffer",
                path.display()
            )));
        }

        expand_to_rgba(&self.scratch, channels, buffer.pixels_mut());
        Ok(())
    }
}

impl FrameDecoder for ImageFileDecoder {
    type Id = PathBuf;

    fn probe_dimensions(&mut self, path: &PathBuf) -> Result<(u32, u32), DecodeError> {
        if is_jxl(path) {
            let image = open_jxl(path)?;
            return Ok((image.width(), image.height()));
        }

        Ok(open(path)?.into_dimensions()?)
    }

    fn decode_into(&mut self, path: &PathBuf, buffer: &mut PixelBuffer) -> Result<(), DecodeError> {
        if is_jxl(path) {
            return self.decode_jxl(path, buffer);
        }

        let decoder = open(path)?.into_decoder()?;
        check_size(buffer, decoder.dimensions())?;

        let color = decoder.color_type();
        if color == ColorType::Rgba8 {
            decoder.read_image(buffer.pixels_mut())?;
            return Ok(());
        }

        let Some(sample) = Sample::of(color) else {
            return Err(DecodeError::Malformed(format!(
                "{} has unsupported color type {color:?}",
                path.display()
            )));
        };

        let total = usize::try_from(decoder.total_bytes())
            .map_err(|_| DecodeError::Malformed(format!("{} is too large", path.display())))?;
        self.scratch.resize(total, 0);
        decoder.read_image(&mut self.scratch)?;
        sample.narrow_in_place(&mut self.scratch);

        expand_to_rgba(
            &self.scratch,
            usize::from(color.channel_count()),
            buffer.pixels_mut(),
        );
        Ok(())
    }
}
