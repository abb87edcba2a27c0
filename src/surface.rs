// SPDX-License-Identifier: MPL-2.0

//! Background layer surfaces as a render target.

use std::sync::Arc;

use cosmic_frames::{
    FrameScaler, PixelBuffer, Rect, Settings,
    draw,
    error::PresentError,
    render_loop::{Canvas, RenderTarget},
    scaler,
};
use cosmic_frames_config::ScalingMode;
use parking_lot::{Mutex, MutexGuard};
use sctk::{
    reexports::client::{
        Connection,
        protocol::{wl_output::WlOutput, wl_shm},
    },
    shell::{WaylandSurface, wlr_layer::LayerSurface},
    shm::{
        Shm,
        slot::{Buffer, SlotPool},
    },
};

/// A background surface on one output.
pub struct FrameLayer {
    pub layer: LayerSurface,
    pub wl_output: WlOutput,
    /// Set by the first configure.
    pub size: Option<(u32, u32)>,
    pool: Option<SlotPool>,
    /// Buffer attached to the surface; kept alive until the next frame.
    attached: Option<Buffer>,
}

impl FrameLayer {
    pub fn new(layer: LayerSurface, wl_output: WlOutput) -> Self {
        Self {
            layer,
            wl_output,
            size: None,
            pool: None,
            attached: None,
        }
    }

    pub fn configure(&mut self, size: (u32, u32), shm: &Shm) {
        let (w, h) = size;
        let len = w as usize * h as usize * 4;

        match self.pool.as_mut() {
            Some(pool) => {
                if let Err(why) = pool.resize(len) {
                    tracing::error!(?why, "failed to resize the pool");
                }
            }

            None => match SlotPool::new(len, shm) {
                Ok(pool) => self.pool = Some(pool),
                Err(why) => tracing::error!(?why, "failed to create pool"),
            },
        }

        self.size = Some(size);
    }

    pub fn is_configured(&self) -> bool {
        self.size.is_some_and(|(w, h)| w > 0 && h > 0) && self.pool.is_some()
    }
}

pub type SharedLayers = Arc<Mutex<Vec<FrameLayer>>>;

/// Presents frames on every configured layer.
pub struct LayerTarget {
    layers: SharedLayers,
    conn: Connection,
    scaling: ScalingMode,
    scaler: FrameScaler,
}

impl LayerTarget {
    pub fn new(layers: SharedLayers, conn: Connection, settings: &Settings) -> Self {
        Self {
            layers,
            conn,
            scaling: settings.scaling,
            scaler: FrameScaler::new(settings.filter),
        }
    }
}

/// The locked layer set. Dropping it commits what was drawn.
pub struct LayerCanvas<'a> {
    layers: MutexGuard<'a, Vec<FrameLayer>>,
    conn: &'a Connection,
    scaling: ScalingMode,
    scaler: &'a mut FrameScaler,
    size: (u32, u32),
    damaged: Vec<usize>,
}

impl RenderTarget for LayerTarget {
    type Canvas<'a> = LayerCanvas<'a>;

    fn acquire(&mut self) -> Result<Self::Canvas<'_>, PresentError> {
        let layers = self.layers.lock();
        let size = layers
            .iter()
            .find(|layer| layer.is_configured())
            .and_then(|layer| layer.size)
            .ok_or(PresentError::Unavailable)?;

        Ok(LayerCanvas {
            layers,
            conn: &self.conn,
            scaling: self.scaling,
            scaler: &mut self.scaler,
            size,
            damaged: Vec::new(),
        })
    }
}

impl Canvas for LayerCanvas<'_> {
    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn present(
        &mut self,
        buffer: &PixelBuffer,
        source: Rect,
        dest: Rect,
    ) -> Result<(), PresentError> {
        let background = scaler::background(self.scaling);
        let mut failure = None;

        for (index, layer) in self.layers.iter_mut().enumerate() {
            if !layer.is_configured() {
                continue;
            }

            let Some((width, height)) = layer.size else {
                continue;
            };

            // Outputs of another size get their own placement.
            let (source, dest) = if (width, height) == self.size {
                (source, dest)
            } else {
                scaler::placement(self.scaling, buffer.dimensions(), (width, height))
            };

            let Some(pool) = layer.pool.as_mut() else {
                continue;
            };

            let stride = width as usize * 4;
            let (wl_buffer, canvas) = match pool.create_buffer(
                width as i32,
                height as i32,
                stride as i32,
                wl_shm::Format::Xrgb8888,
            ) {
                Ok(created) => created,
                Err(why) => {
                    failure = Some(PresentError::Rejected(why.to_string()));
                    continue;
                }
            };

            draw::clear(canvas, background);
            match self.scaler.scale(buffer, source, dest.size()) {
                Ok(view) => draw::blit_xrgb8888(canvas, stride, &view, dest),
                Err(why) => {
                    failure = Some(why);
                    continue;
                }
            }

            let wl_surface = layer.layer.wl_surface();
            wl_surface.damage_buffer(0, 0, width as i32, height as i32);

            if let Err(why) = wl_buffer.attach_to(wl_surface) {
                tracing::error!(?why, "buffer attachment failed");
                failure = Some(PresentError::Rejected(format!("{why:?}")));
                continue;
            }

            layer.attached = Some(wl_buffer);
            self.damaged.push(index);
        }

        match failure {
            Some(why) if self.damaged.is_empty() => Err(why),
            _ => Ok(()),
        }
    }
}

impl Drop for LayerCanvas<'_> {
    fn drop(&mut self) {
        for &index in &self.damaged {
            if let Some(layer) = self.layers.get(index) {
                layer.layer.wl_surface().commit();
            }
        }

        if let Err(why) = self.conn.flush() {
            tracing::warn!(?why, "failed to flush wayland connection");
        }
    }
}
