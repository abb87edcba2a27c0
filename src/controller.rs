// SPDX-License-Identifier: MPL-2.0

//! Orchestrates the decode and render stages of an animation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use calloop::ping::{Ping, make_ping};
use cosmic_frames_config::{self as config, FilterMethod, ScalingMode};
use parking_lot::{Condvar, Mutex};

use crate::buffer::{MAX_FRAME_BYTES, PixelBuffer, frame_len};
use crate::decoder::{DecodeOutcome, DecodeStage, FrameDecoder};
use crate::error::ControllerError;
use crate::exchange::{ExchangeStats, Lane, SharedExchange, new_shared_exchange};
use crate::render_loop::{LoopState, RenderLoop, RenderOutcome, RenderTarget};

/// Frame index before the first presentation of a run.
pub const INITIAL: isize = -1;

/// Frame index a run starts from.
pub const START: isize = 0;

/// How often the sequence plays after its first pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepeatPolicy {
    #[default]
    Infinite,
    Times(u32),
}

impl RepeatPolicy {
    /// Interpret a repeat count where any negative value means forever.
    #[must_use]
    pub fn from_count(count: i64) -> Self {
        if count < 0 {
            RepeatPolicy::Infinite
        } else {
            RepeatPolicy::Times(u32::try_from(count).unwrap_or(u32::MAX))
        }
    }
}

impl From<config::Repeat> for RepeatPolicy {
    fn from(repeat: config::Repeat) -> Self {
        match repeat {
            config::Repeat::Infinite => RepeatPolicy::Infinite,
            config::Repeat::Times(times) => RepeatPolicy::Times(times),
        }
    }
}

/// Tunables of a controller.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub frame_duration: Duration,
    /// Buffers in flight, also the bound on decode-ahead.
    pub buffer_count: usize,
    /// Extra decode attempts before a frame is skipped.
    pub decode_retries: u32,
    /// Warn when the render stage waits this long for a frame.
    pub stall_timeout: Option<Duration>,
    pub scaling: ScalingMode,
    pub filter: FilterMethod,
}

impl Default for Settings {
    fn default() -> Self {
        Self::from(&config::Entry::fallback())
    }
}

impl From<&config::Entry> for Settings {
    fn from(entry: &config::Entry) -> Self {
        Self {
            frame_duration: Duration::from_millis(entry.frame_duration_ms),
            buffer_count: entry.buffer_count,
            decode_retries: entry.decode_retries,
            stall_timeout: (entry.stall_timeout_ms > 0)
                .then(|| Duration::from_millis(entry.stall_timeout_ms)),
            scaling: entry.scaling_mode,
            filter: entry.filter_method,
        }
    }
}

/// Notable transitions of playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    Started,
    /// The sequence ended and playback wrapped around to the first frame.
    Restarted { repeat: u32 },
    /// The sequence ended with no repeats left.
    Finished,
    /// Playback was stopped before finishing.
    Stopped,
}

pub type EventSink = Arc<dyn Fn(PlaybackEvent) + Send + Sync>;

/// Counters accumulated over the lifetime of a controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    pub presented: u64,
    pub skipped: u64,
    pub present_failures: u64,
    pub decode_retries: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    presented: AtomicU64,
    skipped: AtomicU64,
    present_failures: AtomicU64,
    decode_retries: AtomicU64,
}

impl Counters {
    pub fn add_presented(&self) {
        self.presented.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_present_failure(&self) {
        self.present_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_decode_retry(&self) {
        self.decode_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PlaybackStats {
        PlaybackStats {
            presented: self.presented.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            present_failures: self.present_failures.load(Ordering::Relaxed),
            decode_retries: self.decode_retries.load(Ordering::Relaxed),
        }
    }
}

/// State read by the stage threads and the controller.
pub(crate) struct Shared {
    frame_index: AtomicIsize,
    repeated: AtomicU32,
    running: AtomicBool,
    loop_state: AtomicU8,
    done: Mutex<bool>,
    done_signal: Condvar,
    pub counters: Counters,
    events: Mutex<Option<EventSink>>,
}

impl Default for Shared {
    fn default() -> Self {
        Self {
            frame_index: AtomicIsize::new(INITIAL),
            repeated: AtomicU32::new(0),
            running: AtomicBool::new(false),
            loop_state: AtomicU8::new(encode_state(LoopState::Idle)),
            done: Mutex::new(true),
            done_signal: Condvar::new(),
            counters: Counters::default(),
            events: Mutex::new(None),
        }
    }
}

const fn encode_state(state: LoopState) -> u8 {
    match state {
        LoopState::Idle => 0,
        LoopState::Running => 1,
        LoopState::Stopped => 2,
    }
}

impl Shared {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn frame_index(&self) -> isize {
        self.frame_index.load(Ordering::Acquire)
    }

    pub fn set_frame_index(&self, index: isize) {
        self.frame_index.store(index, Ordering::Release);
    }

    /// Claim the index for a new run. Fails if a run already owns it.
    fn claim_start(&self) -> bool {
        self.frame_index
            .compare_exchange(INITIAL, START, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn loop_state(&self) -> LoopState {
        match self.loop_state.load(Ordering::Acquire) {
            0 => LoopState::Idle,
            1 => LoopState::Running,
            _ => LoopState::Stopped,
        }
    }

    pub fn set_loop_state(&self, state: LoopState) {
        self.loop_state.store(encode_state(state), Ordering::Release);
    }

    fn begin_run(&self) {
        *self.done.lock() = false;
        self.running.store(true, Ordering::Release);
    }

    /// Clear the running flag, returning whether it was set.
    fn halt(&self) -> bool {
        self.running.swap(false, Ordering::AcqRel)
    }

    pub fn mark_done(&self) {
        let mut done = self.done.lock();
        if !*done {
            *done = true;
            self.done_signal.notify_all();
        }
    }

    fn wait_done(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock();
        while !*done {
            if self.done_signal.wait_until(&mut done, deadline).timed_out() {
                return *done;
            }
        }
        true
    }

    pub fn emit(&self, event: PlaybackEvent) {
        let sink = self.events.lock().clone();
        if let Some(sink) = sink {
            sink(event);
        }
    }

    /// Called by the render stage when the last frame was presented.
    ///
    /// Returns whether playback continues from the first frame.
    pub fn complete_sequence(&self, repeat: RepeatPolicy) -> bool {
        let repeated = self.repeated.load(Ordering::Acquire);
        let again = match repeat {
            RepeatPolicy::Infinite => true,
            RepeatPolicy::Times(times) => repeated < times,
        };

        if !again {
            tracing::debug!(repeated, "sequence finished");
            self.halt();
            self.emit(PlaybackEvent::Finished);
            return false;
        }

        let repeat = repeated.saturating_add(1);
        self.repeated.store(repeat, Ordering::Release);
        self.set_frame_index(INITIAL);
        tracing::debug!(repeat, "sequence restarted");
        self.emit(PlaybackEvent::Restarted { repeat });
        true
    }
}

/// Buffers decoded ahead of a run that has not started yet.
struct Primed<D: FrameDecoder> {
    stage: DecodeStage<D>,
    exchange: SharedExchange,
}

/// An active or finished-but-unreaped run.
struct Run<D: FrameDecoder, T: RenderTarget> {
    exchange: SharedExchange,
    wake: Ping,
    decode: JoinHandle<DecodeOutcome<D>>,
    render: JoinHandle<RenderOutcome<T>>,
}

/// Plays a frame sequence on a render target.
///
/// Decoding and presentation run on two threads of their own that exchange a
/// fixed set of pixel buffers. All methods are called from the owning
/// thread; none of them decode or present while a run is active.
pub struct AnimationController<D: FrameDecoder, T: RenderTarget> {
    settings: Settings,
    repeat: RepeatPolicy,
    frames: Option<Arc<[D::Id]>>,
    dimensions: Option<(u32, u32)>,
    shared: Arc<Shared>,
    decoder: Option<D>,
    target: Option<T>,
    primed: Option<Primed<D>>,
    run: Option<Run<D, T>>,
    reclaimed: usize,
}

impl<D: FrameDecoder, T: RenderTarget> AnimationController<D, T> {
    pub fn new(decoder: D, target: T, settings: Settings) -> Result<Self, ControllerError> {
        if settings.frame_duration.is_zero() {
            return Err(ControllerError::ZeroFrameDuration);
        }

        if settings.buffer_count == 0 {
            return Err(ControllerError::ZeroBufferCount);
        }

        Ok(Self {
            settings,
            repeat: RepeatPolicy::default(),
            frames: None,
            dimensions: None,
            shared: Arc::new(Shared::default()),
            decoder: Some(decoder),
            target: Some(target),
            primed: None,
            run: None,
            reclaimed: 0,
        })
    }

    /// Replace the frame sequence and decode its first frames ahead of time.
    ///
    /// Every frame is probed up front; a sequence whose frames differ in size
    /// is rejected without touching the current one.
    pub fn set_frame_source(&mut self, frames: Vec<D::Id>) -> Result<(), ControllerError> {
        self.reject_while_running()?;

        if frames.is_empty() {
            return Err(ControllerError::EmptyFrameSource);
        }

        self.reap();
        self.release_primed();

        let decoder = self.decoder.as_mut().ok_or(ControllerError::StageLost)?;
        let expected = decoder
            .probe_dimensions(&frames[0])
            .map_err(ControllerError::Probe)?;

        let (width, height) = expected;
        if frame_len(width, height).is_none_or(|len| len > MAX_FRAME_BYTES) {
            tracing::error!(width, height, "frame size rejected");
            return Err(ControllerError::FrameTooLarge {
                width,
                height,
                limit: MAX_FRAME_BYTES,
            });
        }

        for (index, id) in frames.iter().enumerate().skip(1) {
            match decoder.probe_dimensions(id) {
                Ok(found) if found != expected => {
                    return Err(ControllerError::DimensionMismatch {
                        index,
                        expected,
                        found,
                    });
                }

                Ok(_) => (),

                // Decided at decode time, where failures are retried and skipped.
                Err(why) => tracing::warn!(index, ?id, %why, "failed to probe frame"),
            }
        }

        tracing::info!(
            frames = frames.len(),
            width = expected.0,
            height = expected.1,
            "frame source set"
        );

        self.frames = Some(frames.into());
        self.dimensions = Some(expected);
        self.shared.set_frame_index(INITIAL);
        self.prime()
    }

    pub fn set_repeat_times(&mut self, repeat: RepeatPolicy) -> Result<(), ControllerError> {
        self.reject_while_running()?;
        self.repeat = repeat;
        Ok(())
    }

    pub fn set_frame_duration(&mut self, duration: Duration) -> Result<(), ControllerError> {
        self.reject_while_running()?;
        if duration.is_zero() {
            return Err(ControllerError::ZeroFrameDuration);
        }
        self.settings.frame_duration = duration;
        Ok(())
    }

    pub fn set_event_sink(&mut self, sink: impl Fn(PlaybackEvent) + Send + Sync + 'static) {
        *self.shared.events.lock() = Some(Arc::new(sink));
    }

    /// Start playback from the first frame. Does nothing while running.
    pub fn start(&mut self) -> Result<(), ControllerError> {
        if self.shared.is_running() {
            tracing::debug!("start ignored, already running");
            return Ok(());
        }

        // A run that finished by itself still has its threads to join.
        self.reap();

        let Some(frames) = self.frames.clone() else {
            return Err(ControllerError::NoFrameSource);
        };

        if !self.shared.claim_start() {
            tracing::debug!(index = self.shared.frame_index(), "start ignored, index claimed");
            return Ok(());
        }

        if let Err(why) = self.launch(frames) {
            self.shared.set_frame_index(INITIAL);
            return Err(why);
        }

        Ok(())
    }

    fn launch(&mut self, frames: Arc<[D::Id]>) -> Result<(), ControllerError> {
        if self.primed.is_none() {
            self.prime()?;
        }

        let target = self.target.take().ok_or(ControllerError::StageLost)?;
        let Some(Primed { stage, exchange }) = self.primed.take() else {
            self.target = Some(target);
            return Err(ControllerError::StageLost);
        };

        let (wake, wake_source) = match make_ping() {
            Ok(ping) => ping,
            Err(why) => {
                self.target = Some(target);
                self.primed = Some(Primed { stage, exchange });
                return Err(ControllerError::EventLoop(why.to_string()));
            }
        };

        self.shared.repeated.store(0, Ordering::Release);
        self.shared.begin_run();
        self.shared.emit(PlaybackEvent::Started);

        let decode = {
            let exchange = exchange.clone();
            let shared = self.shared.clone();
            thread::Builder::new()
                .name("frame-decode".into())
                .spawn(move || stage.run(&exchange, &shared))
        };

        let decode = match decode {
            Ok(handle) => handle,
            Err(why) => {
                // The stage moved into the failed closure; the decoder is gone.
                self.shared.halt();
                self.shared.mark_done();
                self.target = Some(target);
                self.free(exchange, Vec::new());
                return Err(ControllerError::Spawn(why));
            }
        };

        let render = RenderLoop::new(
            target,
            exchange.clone(),
            self.shared.clone(),
            frames.len(),
            self.settings.frame_duration,
            self.settings.stall_timeout,
            self.settings.scaling,
            self.repeat,
        );

        let render = thread::Builder::new()
            .name("frame-render".into())
            .spawn(move || render.run(wake_source));

        let render = match render {
            Ok(handle) => handle,
            Err(why) => {
                self.shared.halt();
                self.shared.mark_done();
                exchange.close();
                let held = self.join_decode(decode);
                self.free(exchange, held);
                return Err(ControllerError::Spawn(why));
            }
        };

        tracing::info!(
            frames = frames.len(),
            buffers = exchange.capacity(),
            duration = ?self.settings.frame_duration,
            repeat = ?self.repeat,
            "animation started"
        );

        self.run = Some(Run {
            exchange,
            wake,
            decode,
            render,
        });

        Ok(())
    }

    /// Stop playback and free every buffer.
    ///
    /// Blocked stages are interrupted, so this returns promptly even while
    /// the renderer waits for a slow decoder.
    pub fn stop(&mut self) {
        let interrupted = self.shared.halt();
        if let Some(run) = self.run.as_ref() {
            run.exchange.close();
            run.wake.ping();
        }

        self.reap();
        self.release_primed();

        if interrupted {
            tracing::info!(frame = self.shared.frame_index(), "animation stopped");
            self.shared.emit(PlaybackEvent::Stopped);
        }
    }

    /// Block until the current run ends by itself or `timeout` passes.
    ///
    /// Returns `true` when no run is active.
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        self.shared.wait_done(timeout)
    }

    /// Index of the frame on screen, if any frame was presented in this pass.
    #[must_use]
    pub fn current_frame(&self) -> Option<usize> {
        let index = self.shared.frame_index();
        usize::try_from(index).ok().and_then(|next| next.checked_sub(1))
    }

    /// Raw frame cursor: [`INITIAL`] before the first presentation of a
    /// pass, otherwise one past the last presented frame.
    #[must_use]
    pub fn frame_index(&self) -> isize {
        self.shared.frame_index()
    }

    #[must_use]
    pub fn repeated_count(&self) -> u32 {
        self.shared.repeated.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    #[must_use]
    pub fn render_state(&self) -> LoopState {
        self.shared.loop_state()
    }

    #[must_use]
    pub fn stats(&self) -> PlaybackStats {
        self.shared.counters.snapshot()
    }

    /// Buffers recovered by the last teardown.
    #[must_use]
    pub fn last_reclaimed(&self) -> usize {
        self.reclaimed
    }

    /// Buffer positions of the active run or of the pre-decoded frames.
    #[must_use]
    pub fn exchange_stats(&self) -> Option<ExchangeStats> {
        self.run
            .as_ref()
            .map(|run| &run.exchange)
            .or(self.primed.as_ref().map(|primed| &primed.exchange))
            .map(|exchange| exchange.stats())
    }

    #[must_use]
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.dimensions
    }

    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frames.as_ref().map_or(0, |frames| frames.len())
    }

    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The render target, while no run owns it.
    pub fn target_mut(&mut self) -> Option<&mut T> {
        self.target.as_mut()
    }

    fn reject_while_running(&self) -> Result<(), ControllerError> {
        if self.shared.is_running() {
            Err(ControllerError::Running)
        } else {
            Ok(())
        }
    }

    /// Allocate the buffers of the next run and decode its first frames.
    fn prime(&mut self) -> Result<(), ControllerError> {
        let (Some(frames), Some((width, height))) = (self.frames.clone(), self.dimensions) else {
            return Err(ControllerError::NoFrameSource);
        };

        let decoder = self.decoder.take().ok_or(ControllerError::StageLost)?;
        let mut stage = DecodeStage::new(decoder, frames, 0, self.settings.decode_retries);
        let exchange = new_shared_exchange(self.settings.buffer_count, width, height);

        while let Some(mut buffer) = exchange.try_take(Lane::Recycle) {
            stage.fill(&mut buffer, &self.shared.counters);
            stage.advance();
            if let Err(closed) = exchange.put(Lane::Ready, buffer) {
                tracing::error!(slot = closed.0.slot(), "exchange closed while priming");
                break;
            }
        }

        tracing::debug!(
            ready = exchange.len(Lane::Ready),
            cursor = stage.cursor(),
            "frames decoded ahead"
        );

        self.primed = Some(Primed { stage, exchange });
        Ok(())
    }

    fn release_primed(&mut self) {
        if let Some(Primed { stage, exchange }) = self.primed.take() {
            self.decoder = Some(stage.into_decoder());
            exchange.close();
            self.free(exchange, Vec::new());
        }
    }

    /// Join the threads of the last run and recover its collaborators.
    fn reap(&mut self) {
        let Some(run) = self.run.take() else {
            return;
        };

        run.exchange.close();
        run.wake.ping();

        let mut held = match run.render.join() {
            Ok(outcome) => {
                self.target = Some(outcome.target);
                outcome.held
            }

            Err(_) => {
                tracing::error!("render thread panicked, render target lost");
                Vec::new()
            }
        };

        held.extend(self.join_decode(run.decode));
        self.shared.halt();
        self.shared.mark_done();
        self.shared.set_loop_state(LoopState::Stopped);
        self.shared.set_frame_index(INITIAL);
        self.free(run.exchange, held);
    }

    fn join_decode(&mut self, handle: JoinHandle<DecodeOutcome<D>>) -> Vec<PixelBuffer> {
        match handle.join() {
            Ok(outcome) => {
                self.decoder = Some(outcome.stage.into_decoder());
                outcome.held
            }

            Err(_) => {
                tracing::error!("decode thread panicked, decoder lost");
                Vec::new()
            }
        }
    }

    /// Drop every buffer of `exchange`, checking none went missing.
    fn free(&mut self, exchange: SharedExchange, mut held: Vec<PixelBuffer>) {
        let registered = exchange.stats().registered;
        held.extend(exchange.drain());
        self.reclaimed = held.len();

        if self.reclaimed == registered {
            tracing::debug!(buffers = registered, "buffers released");
        } else {
            tracing::error!(
                reclaimed = self.reclaimed,
                registered,
                "buffers were lost by a pipeline stage"
            );
        }
    }
}

impl<D: FrameDecoder, T: RenderTarget> Drop for AnimationController<D, T> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_counts_mean_forever() {
        assert_eq!(RepeatPolicy::from_count(-1), RepeatPolicy::Infinite);
        assert_eq!(RepeatPolicy::from_count(-40), RepeatPolicy::Infinite);
        assert_eq!(RepeatPolicy::from_count(0), RepeatPolicy::Times(0));
        assert_eq!(RepeatPolicy::from_count(3), RepeatPolicy::Times(3));
        assert_eq!(
            RepeatPolicy::from_count(i64::MAX),
            RepeatPolicy::Times(u32::MAX)
        );
    }

    #[test]
    fn settings_from_entry() {
        let entry = config::Entry::fallback()
            .frame_duration_ms(40)
            .buffer_count(3)
            .stall_timeout_ms(0);
        let settings = Settings::from(&entry);
        assert_eq!(settings.frame_duration, Duration::from_millis(40));
        assert_eq!(settings.buffer_count, 3);
        assert_eq!(settings.stall_timeout, None);
    }

    #[test]
    fn completion_follows_repeat_policy() {
        let shared = Shared::default();
        shared.begin_run();
        shared.set_frame_index(4);

        assert!(shared.complete_sequence(RepeatPolicy::Times(1)));
        assert_eq!(shared.frame_index(), INITIAL);
        assert!(shared.is_running());

        assert!(!shared.complete_sequence(RepeatPolicy::Times(1)));
        assert!(!shared.is_running());

        assert!(shared.complete_sequence(RepeatPolicy::Infinite));
    }

    #[test]
    fn start_claim_is_exclusive() {
        let shared = Shared::default();
        assert!(shared.claim_start());
        assert!(!shared.claim_start());
        shared.set_frame_index(INITIAL);
        assert!(shared.claim_start());
    }

    #[test]
    fn wait_done_times_out_while_running() {
        let shared = Shared::default();
        assert!(shared.wait_done(Duration::ZERO));

        shared.begin_run();
        assert!(!shared.wait_done(Duration::from_millis(5)));

        shared.mark_done();
        assert!(shared.wait_done(Duration::from_millis(5)));
    }
}
