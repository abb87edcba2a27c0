// SPDX-License-Identifier: MPL-2.0

//! In-memory decoder and render target for pipeline tests.
//!
//! Frames are `u32` labels. A decoded frame has every pixel set to
//! `[label, 0, 0, 255]`, so whatever a target presents identifies the frame.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::level_filters::LevelFilter;

use crate::buffer::{PixelBuffer, Rect};
use crate::decoder::FrameDecoder;
use crate::error::{DecodeError, PresentError};
use crate::render_loop::{Canvas, RenderTarget};

#[derive(Default)]
struct Script {
    failures: HashMap<u32, u32>,
    delays: HashMap<u32, Duration>,
    sizes: HashMap<u32, (u32, u32)>,
    decoded: Vec<u32>,
}

/// Decoder following a script of failures and delays. Clones share state.
#[derive(Clone)]
pub struct ScriptedDecoder {
    size: (u32, u32),
    script: Arc<Mutex<Script>>,
}

impl ScriptedDecoder {
    pub fn new(size: (u32, u32)) -> Self {
        Self {
            size,
            script: Arc::default(),
        }
    }

    /// Fail the next `times` decodes of `label`.
    pub fn fail(self, label: u32, times: u32) -> Self {
        self.script.lock().failures.insert(label, times);
        self
    }

    /// Sleep for `delay` before each decode of `label`.
    pub fn delay(self, label: u32, delay: Duration) -> Self {
        self.script.lock().delays.insert(label, delay);
        self
    }

    /// Report `label` with a different size.
    pub fn mismatch(self, label: u32, size: (u32, u32)) -> Self {
        self.script.lock().sizes.insert(label, size);
        self
    }

    /// Labels decoded successfully, in order.
    pub fn decoded(&self) -> Vec<u32> {
        self.script.lock().decoded.clone()
    }
}

impl FrameDecoder for ScriptedDecoder {
    type Id = u32;

    fn probe_dimensions(&mut self, label: &u32) -> Result<(u32, u32), DecodeError> {
        Ok(self
            .script
            .lock()
            .sizes
            .get(label)
            .copied()
            .unwrap_or(self.size))
    }

    fn decode_into(&mut self, label: &u32, buffer: &mut PixelBuffer) -> Result<(), DecodeError> {
        let delay = self.script.lock().delays.get(label).copied();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let mut script = self.script.lock();
        if let Some(remaining) = script.failures.get_mut(label) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DecodeError::Malformed(format!("scripted failure of {label}")));
            }
        }

        let found = script.sizes.get(label).copied().unwrap_or(self.size);
        if found != buffer.dimensions() {
            return Err(DecodeError::DimensionMismatch {
                expected: buffer.dimensions(),
                found,
            });
        }

        let value = *label as u8;
        for px in buffer.pixels_mut().chunks_exact_mut(4) {
            px.copy_from_slice(&[value, 0, 0, 255]);
        }

        script.decoded.push(*label);
        Ok(())
    }
}

#[derive(Default)]
struct Record {
    presented: Vec<u8>,
    presented_at: Vec<Instant>,
    failing: Vec<u8>,
    unavailable: bool,
    acquired: usize,
    released: usize,
}

/// Render target recording what it is asked to present. Clones share state.
#[derive(Clone)]
pub struct RecordingTarget {
    size: (u32, u32),
    record: Arc<Mutex<Record>>,
}

impl RecordingTarget {
    pub fn new(size: (u32, u32)) -> Self {
        Self {
            size,
            record: Arc::default(),
        }
    }

    /// Reject every present of frames labelled `label`.
    pub fn fail_on(self, label: u8) -> Self {
        self.record.lock().failing.push(label);
        self
    }

    pub fn set_available(&self, available: bool) {
        self.record.lock().unavailable = !available;
    }

    pub fn presented(&self) -> Vec<u8> {
        self.record.lock().presented.clone()
    }

    pub fn presented_at(&self) -> Vec<Instant> {
        self.record.lock().presented_at.clone()
    }

    pub fn acquired(&self) -> usize {
        self.record.lock().acquired
    }

    pub fn released(&self) -> usize {
        self.record.lock().released
    }
}

pub struct RecordingCanvas<'a> {
    size: (u32, u32),
    record: &'a Mutex<Record>,
}

impl RenderTarget for RecordingTarget {
    type Canvas<'a> = RecordingCanvas<'a>;

    fn acquire(&mut self) -> Result<Self::Canvas<'_>, PresentError> {
        let mut record = self.record.lock();
        if record.unavailable {
            return Err(PresentError::Unavailable);
        }
        record.acquired += 1;
        drop(record);

        Ok(RecordingCanvas {
            size: self.size,
            record: &self.record,
        })
    }
}

impl Canvas for RecordingCanvas<'_> {
    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn present(
        &mut self,
        buffer: &PixelBuffer,
        source: Rect,
        _dest: Rect,
    ) -> Result<(), PresentError> {
        let offset = source.y as usize * buffer.stride() + source.x as usize * 4;
        let label = buffer.pixels()[offset];

        let mut record = self.record.lock();
        if record.failing.contains(&label) {
            return Err(PresentError::Rejected(format!("scripted rejection of {label}")));
        }

        record.presented.push(label);
        record.presented_at.push(Instant::now());
        Ok(())
    }
}

impl Drop for RecordingCanvas<'_> {
    fn drop(&mut self) {
        self.record.lock().released += 1;
    }
}

/// Writer appending formatted log lines to a shared buffer.
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Run `f` on this thread and return what it logged at `warn` or above.
pub fn capture_warnings<R>(f: impl FnOnce() -> R) -> (R, String) {
    let logs = LogBuffer::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::WARN)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();

    let result = tracing::subscriber::with_default(subscriber, f);
    let output = String::from_utf8_lossy(&logs.0.lock()).into_owned();
    (result, output)
}
