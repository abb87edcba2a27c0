// SPDX-License-Identifier: MPL-2.0

//! Render stage: a calloop timer that presents one ready buffer per tick.
//!
//! Each tick takes the next decoded buffer (waiting for the decoder if it is
//! behind), presents it inside a scoped acquisition of the render target,
//! returns the buffer to the recycle lane and re-arms itself one frame
//! duration after the tick started.

use std::sync::Arc;
use std::time::{Duration, Instant};

use calloop::{
    EventLoop, LoopSignal,
    ping::PingSource,
    timer::{TimeoutAction, Timer},
};
use cosmic_frames_config::ScalingMode;

use crate::buffer::{PixelBuffer, Rect};
use crate::controller::{RepeatPolicy, Shared};
use crate::error::PresentError;
use crate::exchange::{Closed, Lane, SharedExchange};

/// A surface frames are presented on.
///
/// [`acquire`](RenderTarget::acquire) hands out exclusive access for a single
/// presentation. Dropping the returned canvas releases it; implementations
/// post the frame there, so release happens on every exit path.
pub trait RenderTarget: Send + 'static {
    type Canvas<'a>: Canvas
    where
        Self: 'a;

    fn acquire(&mut self) -> Result<Self::Canvas<'_>, PresentError>;
}

/// Drawable area acquired from a [`RenderTarget`].
pub trait Canvas {
    /// Size of the drawable area in pixels.
    fn size(&self) -> (u32, u32);

    /// Draw the `source` region of `buffer` into the `dest` region.
    fn present(
        &mut self,
        buffer: &PixelBuffer,
        source: Rect,
        dest: Rect,
    ) -> Result<(), PresentError>;
}

/// Lifecycle of the render stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopState {
    #[default]
    Idle,
    Running,
    Stopped,
}

/// What the render thread hands back when it exits.
pub(crate) struct RenderOutcome<T> {
    pub target: T,
    /// Buffers the stage still owned when the exchange closed.
    pub held: Vec<PixelBuffer>,
}

pub(crate) struct RenderLoop<T: RenderTarget> {
    target: T,
    exchange: SharedExchange,
    shared: Arc<Shared>,
    frame_count: usize,
    frame_duration: Duration,
    stall_timeout: Option<Duration>,
    scaling: ScalingMode,
    repeat: RepeatPolicy,
    held: Vec<PixelBuffer>,
    signal: Option<LoopSignal>,
}

impl<T: RenderTarget> RenderLoop<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        target: T,
        exchange: SharedExchange,
        shared: Arc<Shared>,
        frame_count: usize,
        frame_duration: Duration,
        stall_timeout: Option<Duration>,
        scaling: ScalingMode,
        repeat: RepeatPolicy,
    ) -> Self {
        Self {
            target,
            exchange,
            shared,
            frame_count,
            frame_duration,
            stall_timeout,
            scaling,
            repeat,
            held: Vec::new(),
            signal: None,
        }
    }

    /// Drive ticks until the run stops. `wake` interrupts the wait between ticks.
    pub fn run(mut self, wake: PingSource) -> RenderOutcome<T> {
        let span = tracing::debug_span!("render", frames = self.frame_count);
        let _handle = span.enter();

        if let Err(why) = self.event_loop(wake) {
            tracing::error!(%why, "render loop failed");
        }

        self.finish();
        RenderOutcome {
            target: self.target,
            held: self.held,
        }
    }

    fn event_loop(&mut self, wake: PingSource) -> Result<(), calloop::Error> {
        let mut event_loop: EventLoop<Self> = EventLoop::try_new()?;
        let handle = event_loop.handle();
        self.signal = Some(event_loop.get_signal());

        handle
            .insert_source(wake, |(), &mut (), state: &mut Self| {
                if !state.shared.is_running() {
                    state.finish();
                }
            })
            .map_err(|why| why.error)?;

        handle
            .insert_source(Timer::immediate(), |_, &mut (), state: &mut Self| state.tick())
            .map_err(|why| why.error)?;

        self.shared.set_loop_state(LoopState::Running);
        tracing::debug!(duration = ?self.frame_duration, "render stage started");

        event_loop.run(None, self, |_| {})?;
        Ok(())
    }

    /// Transition to `Stopped`: close the exchange so the decoder exits too.
    fn finish(&mut self) {
        self.exchange.close();
        self.shared.mark_done();
        self.shared.set_loop_state(LoopState::Stopped);
        if let Some(signal) = self.signal.take() {
            signal.stop();
            signal.wakeup();
        }
    }

    fn tick(&mut self) -> TimeoutAction {
        let tick_start = Instant::now();

        if !self.shared.is_running() {
            self.finish();
            return TimeoutAction::Drop;
        }

        let buffer = self
            .exchange
            .take_watched(Lane::Ready, self.stall_timeout, |waited| {
                tracing::warn!(?waited, "decoder is stalled, waiting for the next frame");
            });

        let Ok(mut buffer) = buffer else {
            self.finish();
            return TimeoutAction::Drop;
        };

        // Stopped while waiting: keep the buffer for teardown, present nothing.
        if !self.shared.is_running() {
            self.held.push(buffer);
            self.finish();
            return TimeoutAction::Drop;
        }

        let frame = buffer.frame();
        if buffer.is_presentable() {
            self.present(&buffer);
        } else {
            tracing::debug!(?frame, "no pixels for frame, keeping previous frame");
        }

        buffer.recycle();
        if let Err(Closed(buffer)) = self.exchange.put(Lane::Recycle, buffer) {
            self.held.push(buffer);
            self.finish();
            return TimeoutAction::Drop;
        }

        let Some(frame) = frame else {
            tracing::warn!("ready lane delivered an empty buffer");
            return TimeoutAction::ToInstant(tick_start + self.frame_duration);
        };

        let next = frame + 1;
        self.shared.set_frame_index(next as isize);

        if next >= self.frame_count && !self.shared.complete_sequence(self.repeat) {
            self.finish();
            return TimeoutAction::Drop;
        }

        tracing::trace!(frame, elapsed = ?tick_start.elapsed(), "tick");
        TimeoutAction::ToInstant(tick_start + self.frame_duration)
    }

    fn present(&mut self, buffer: &PixelBuffer) {
        let start = Instant::now();

        match present_on(&mut self.target, self.scaling, buffer) {
            Ok(()) => {
                self.shared.counters.add_presented();
                tracing::trace!(frame = ?buffer.frame(), elapsed = ?start.elapsed(), "frame presented");
            }

            Err(why) => {
                self.shared.counters.add_present_failure();
                tracing::warn!(frame = ?buffer.frame(), %why, "frame could not be presented");
            }
        }
    }
}

/// Acquire `target`, present `buffer` placed per `scaling`, release.
pub fn present_on<T: RenderTarget>(
    target: &mut T,
    scaling: ScalingMode,
    buffer: &PixelBuffer,
) -> Result<(), PresentError> {
    let mut canvas = target.acquire()?;
    let (source, dest) = crate::scaler::placement(scaling, buffer.dimensions(), canvas.size());
    if dest.is_empty() || source.is_empty() {
        return Err(PresentError::Unavailable);
    }
    canvas.present(buffer, source, dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::new_shared_exchange;
    use crate::testing::{RecordingTarget, capture_warnings};

    #[test]
    fn present_releases_canvas_on_failure() {
        let mut target = RecordingTarget::new((4, 4)).fail_on(9);
        let mut buffer = PixelBuffer::new(0, 2, 2);
        buffer.pixels_mut().fill(9);
        buffer.mark_decoded(0);

        let scaling = ScalingMode::Stretch;
        assert!(present_on(&mut target, scaling, &buffer).is_err());

        buffer.pixels_mut().fill(4);
        assert!(present_on(&mut target, scaling, &buffer).is_ok());

        assert_eq!(target.presented(), [4]);
        assert_eq!(target.acquired(), 2);
        assert_eq!(target.released(), 2);
    }

    #[test]
    fn present_failure_is_counted_and_logged() {
        let shared = Arc::new(Shared::default());
        let mut render = RenderLoop::new(
            RecordingTarget::new((2, 2)).fail_on(3),
            new_shared_exchange(1, 2, 2),
            shared.clone(),
            1,
            Duration::from_millis(10),
            None,
            ScalingMode::Stretch,
            RepeatPolicy::Times(0),
        );

        let mut buffer = PixelBuffer::new(0, 2, 2);
        buffer.pixels_mut().fill(3);
        buffer.mark_decoded(0);

        let ((), logs) = capture_warnings(|| render.present(&buffer));

        assert_eq!(shared.counters.snapshot().present_failures, 1);
        assert_eq!(shared.counters.snapshot().presented, 0);
        assert!(logs.contains("WARN"));
        assert!(logs.contains("frame could not be presented"));
        assert!(logs.contains("scripted rejection of 3"));
    }

    #[test]
    fn present_fails_on_unavailable_target() {
        let mut target = RecordingTarget::new((4, 4));
        target.set_available(false);
        let mut buffer = PixelBuffer::new(0, 2, 2);
        buffer.mark_decoded(0);

        assert!(matches!(
            present_on(&mut target, ScalingMode::Zoom, &buffer),
            Err(PresentError::Unavailable)
        ));
        assert_eq!(target.acquired(), 0);
    }

    #[test]
    fn zero_sized_canvas_is_unavailable() {
        let mut target = RecordingTarget::new((0, 0));
        let mut buffer = PixelBuffer::new(0, 2, 2);
        buffer.mark_decoded(0);

        assert!(present_on(&mut target, ScalingMode::Stretch, &buffer).is_err());
        assert_eq!(target.acquired(), target.released());
    }
}
