// SPDX-License-Identifier: MPL-2.0

mod source_watch;
mod surface;

use std::path::PathBuf;

use cosmic_frames::{AnimationController, ImageFileDecoder, Settings, image_source};
use cosmic_frames_config::{self as config, Entry};
use eyre::{WrapErr, eyre};
use notify::RecommendedWatcher;
use sctk::{
    compositor::{CompositorHandler, CompositorState},
    delegate_compositor, delegate_layer, delegate_output, delegate_registry, delegate_shm,
    output::{OutputHandler, OutputState},
    reexports::{
        calloop::{
            EventLoop, LoopHandle,
            signals::{Signal, Signals},
        },
        calloop_wayland_source::WaylandSource,
        client::{
            Connection, QueueHandle,
            globals::registry_queue_init,
            protocol::{wl_output, wl_surface},
        },
    },
    registry::{ProvidesRegistryState, RegistryState},
    registry_handlers,
    shell::{
        WaylandSurface,
        wlr_layer::{
            Anchor, KeyboardInteractivity, Layer, LayerShell, LayerShellHandler, LayerSurface,
            LayerSurfaceConfigure,
        },
    },
    shm::{Shm, ShmHandler},
};
use surface::{FrameLayer, LayerTarget, SharedLayers};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

type Controller = AnimationController<ImageFileDecoder, LayerTarget>;

pub struct CosmicFrames {
    registry_state: RegistryState,
    output_state: OutputState,
    compositor_state: CompositorState,
    shm: Shm,
    layer_shell: LayerShell,
    pub loop_handle: LoopHandle<'static, CosmicFrames>,

    entry: Entry,
    layers: SharedLayers,
    controller: Controller,
    frames: Vec<PathBuf>,
    pub reload_pending: bool,
    exit: bool,
}

fn init_logger() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

/// Resolve the entry from the command line: a `.ron` file replaces the
/// stored configuration, any other path only replaces its frame source.
fn load_entry(arg: Option<PathBuf>) -> eyre::Result<Entry> {
    let Some(arg) = arg else {
        return Ok(config::load_or_fallback());
    };

    if arg.extension().is_some_and(|ext| ext == "ron") {
        return config::load_file(&arg).wrap_err("failed to load animation entry");
    }

    Ok(config::load_or_fallback().with_source(arg))
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    init_logger();

    let entry = load_entry(std::env::args_os().nth(1).map(PathBuf::from))?;
    entry.validate()?;
    tracing::info!(source = ?entry.source, output = %entry.output, "loaded animation entry");

    let conn = Connection::connect_to_env().wrap_err("failed to connect to wayland")?;
    let (globals, event_queue) = registry_queue_init(&conn)?;
    let qh = event_queue.handle();

    let mut event_loop: EventLoop<'static, CosmicFrames> = EventLoop::try_new()?;
    WaylandSource::new(conn.clone(), event_queue)
        .insert(event_loop.handle())
        .map_err(|why| eyre!("failed to insert wayland source: {}", why.error))?;

    let settings = Settings::from(&entry);
    let layers = SharedLayers::default();
    let target = LayerTarget::new(layers.clone(), conn.clone(), &settings);
    let mut controller = AnimationController::new(ImageFileDecoder::new(), target, settings)?;
    controller.set_repeat_times(entry.repeat.into())?;
    controller.set_event_sink(|event| tracing::debug!(?event, "playback"));

    let signals = Signals::new(&[Signal::SIGINT, Signal::SIGTERM])?;
    event_loop
        .handle()
        .insert_source(signals, |event, _, state: &mut CosmicFrames| {
            tracing::info!(signal = ?event.signal(), "shutting down");
            state.controller.stop();
            state.exit = true;
        })
        .map_err(|why| eyre!("failed to insert signal source: {}", why.error))?;

    let mut state = CosmicFrames {
        registry_state: RegistryState::new(&globals),
        output_state: OutputState::new(&globals, &qh),
        compositor_state: CompositorState::bind(&globals, &qh)?,
        shm: Shm::bind(&globals, &qh)?,
        layer_shell: LayerShell::bind(&globals, &qh)?,
        loop_handle: event_loop.handle(),
        entry,
        layers,
        controller,
        frames: Vec::new(),
        reload_pending: false,
        exit: false,
    };

    state.reload_frames();
    let _watcher = state.watch_source();

    while !state.exit {
        event_loop.dispatch(None, &mut state)?;
    }

    state.controller.stop();
    Ok(())
}

/// Playback resumes only when the first surface becomes drawable.
fn surfaces_appeared(was_configured: bool, is_configured: bool) -> bool {
    !was_configured && is_configured
}

impl CosmicFrames {
    fn watch_source(&self) -> Option<RecommendedWatcher> {
        match source_watch::watch(&self.loop_handle, &self.entry.source) {
            Ok(watcher) => Some(watcher),
            Err(why) => {
                tracing::warn!(?why, "frame source will not be watched");
                None
            }
        }
    }

    fn has_configured_layer(&self) -> bool {
        self.layers.lock().iter().any(FrameLayer::is_configured)
    }

    /// Start playback if there is something to show it on.
    fn resume(&mut self) {
        if self.frames.is_empty() || !self.has_configured_layer() {
            return;
        }

        if let Err(why) = self.controller.start() {
            tracing::error!(%why, "failed to start animation");
        }
    }

    /// List the frame source again and restart playback if it changed.
    pub fn reload_frames(&mut self) {
        let frames = match image_source::list_frames(&self.entry.source) {
            Ok(frames) => frames,
            Err(why) => {
                tracing::error!(%why, "failed to list frames");
                Vec::new()
            }
        };

        if !frames.is_empty() && frames == self.frames {
            return;
        }

        self.controller.stop();
        self.frames.clear();

        if frames.is_empty() {
            tracing::warn!(source = ?self.entry.source, "no frames to play");
            return;
        }

        match self.controller.set_frame_source(frames.clone()) {
            Ok(()) => self.frames = frames,
            Err(why) => {
                tracing::error!(%why, "frame source rejected");
                return;
            }
        }

        self.resume();
    }

    fn remove_layers(&mut self, predicate: impl Fn(&FrameLayer) -> bool) {
        let remaining = {
            let mut layers = self.layers.lock();
            layers.retain(|layer| !predicate(layer));
            layers.iter().any(FrameLayer::is_configured)
        };

        if !remaining {
            tracing::debug!("no surfaces left");
            self.controller.stop();
        }
    }
}

impl CompositorHandler for CosmicFrames {
    fn scale_factor_changed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _new_factor: i32,
    ) {
    }

    fn transform_changed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _new_transform: wl_output::Transform,
    ) {
    }

    fn frame(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _time: u32,
    ) {
    }

    fn surface_enter(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _output: &wl_output::WlOutput,
    ) {
    }

    fn surface_leave(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _output: &wl_output::WlOutput,
    ) {
    }
}

impl OutputHandler for CosmicFrames {
    fn output_state(&mut self) -> &mut OutputState {
        &mut self.output_state
    }

    fn new_output(
        &mut self,
        _conn: &Connection,
        qh: &QueueHandle<Self>,
        wl_output: wl_output::WlOutput,
    ) {
        let Some(output_info) = self.output_state.info(&wl_output) else {
            return;
        };

        if !self.entry.output.matches(output_info.name.as_deref()) {
            return;
        }

        if self
            .layers
            .lock()
            .iter()
            .any(|layer| layer.wl_output == wl_output)
        {
            return;
        }

        let surface = self.compositor_state.create_surface(qh);
        let layer = self.layer_shell.create_layer_surface(
            qh,
            surface,
            Layer::Background,
            Some("frames"),
            Some(&wl_output),
        );

        layer.set_anchor(Anchor::all());
        layer.set_exclusive_zone(-1);
        layer.set_keyboard_interactivity(KeyboardInteractivity::None);
        layer.set_size(0, 0);
        layer.commit();

        tracing::debug!(output = ?output_info.name, "layer surface created");
        self.layers.lock().push(FrameLayer::new(layer, wl_output));
    }

    fn update_output(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _output: wl_output::WlOutput,
    ) {
    }

    fn output_destroyed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        output: wl_output::WlOutput,
    ) {
        self.remove_layers(|layer| layer.wl_output == output);
    }
}

impl LayerShellHandler for CosmicFrames {
    fn closed(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, layer: &LayerSurface) {
        self.remove_layers(|frame_layer| &frame_layer.layer == layer);
    }

    fn configure(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        layer: &LayerSurface,
        configure: LayerSurfaceConfigure,
        _serial: u32,
    ) {
        let appeared = {
            let mut layers = self.layers.lock();
            let was_configured = layers.iter().any(FrameLayer::is_configured);
            let Some(frame_layer) = layers.iter_mut().find(|l| &l.layer == layer) else {
                return;
            };

            let size = match configure.new_size {
                (0, 0) => self
                    .output_state
                    .info(&frame_layer.wl_output)
                    .and_then(|info| info.logical_size)
                    .map_or((0, 0), |(w, h)| (w.max(0) as u32, h.max(0) as u32)),
                size => size,
            };

            tracing::debug!(?size, "layer configured");
            frame_layer.configure(size, &self.shm);
            surfaces_appeared(was_configured, layers.iter().any(FrameLayer::is_configured))
        };

        if appeared {
            self.resume();
        }
    }
}

impl ShmHandler for CosmicFrames {
    fn shm_state(&mut self) -> &mut Shm {
        &mut self.shm
    }
}

delegate_compositor!(CosmicFrames);
delegate_output!(CosmicFrames);
delegate_shm!(CosmicFrames);

delegate_layer!(CosmicFrames);

delegate_registry!(CosmicFrames);

impl ProvidesRegistryState for CosmicFrames {
    fn registry(&mut self) -> &mut RegistryState {
        &mut self.registry_state
    }
    registry_handlers![OutputState];
}
