// SPDX-License-Identifier: MPL-2.0

//! Bounded buffer exchange between the decode and render threads.
//!
//! Two FIFO lanes move ownership of a fixed set of [`PixelBuffer`]s in
//! opposite directions:
//!
//! ```text
//! ┌─────────────┐   put(Ready)    ┌─────────────┐
//! │ Decoder     │ ──────────────► │ Renderer    │
//! │ thread      │                 │ thread      │
//! │             │ ◄────────────── │             │
//! └─────────────┘  put(Recycle)   └─────────────┘
//! ```
//!
//! # Key Guarantees
//!
//! - **Nothing is dropped**: `put` waits for room instead of discarding, and
//!   hands the buffer back once the exchange is closed.
//! - **Bounded skew**: each lane holds at most `capacity` buffers, so the
//!   decoder can never run more than `capacity` frames ahead.
//! - **Interruptible waits**: [`BufferExchange::close`] wakes every blocked
//!   `take`/`put`, which then return [`Interrupted`]/[`Closed`].
//! - **Conservation**: buffers in both lanes plus buffers taken and not yet
//!   returned always equals the number seeded.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::buffer::PixelBuffer;

/// Number of buffers kept in flight when nothing else is configured.
pub const DEFAULT_CAPACITY: usize = 2;

/// One direction of the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    /// Decoded frames waiting to be presented.
    Ready,
    /// Presented buffers waiting to be decoded into again.
    Recycle,
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lane::Ready => f.write_str("ready"),
            Lane::Recycle => f.write_str("recycle"),
        }
    }
}

/// A blocking `take` was cut short by [`BufferExchange::close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

/// A `put` after [`BufferExchange::close`]; the buffer goes back to the caller.
#[derive(Debug)]
pub struct Closed(pub PixelBuffer);

/// Snapshot of the exchange taken under its lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeStats {
    /// Per-lane capacity.
    pub capacity: usize,
    /// Buffers seeded into the exchange.
    pub registered: usize,
    /// Buffers waiting in the ready lane.
    pub ready: usize,
    /// Buffers waiting in the recycle lane.
    pub recycle: usize,
    /// Buffers taken by a stage and not yet put back.
    pub outstanding: usize,
    /// Total puts into the ready lane.
    pub published: u64,
    /// Total puts into the recycle lane.
    pub recycled: u64,
}

impl ExchangeStats {
    /// Whether every seeded buffer is accounted for.
    #[must_use]
    pub fn is_conserved(&self) -> bool {
        self.ready + self.recycle + self.outstanding == self.registered
    }

    /// Frames decoded and not yet presented.
    #[must_use]
    pub fn skew(&self) -> usize {
        self.ready
    }
}

struct Lanes {
    ready: VecDeque<PixelBuffer>,
    recycle: VecDeque<PixelBuffer>,
    registered: usize,
    outstanding: usize,
    published: u64,
    recycled: u64,
    closed: bool,
}

impl Lanes {
    fn queue(&mut self, lane: Lane) -> &mut VecDeque<PixelBuffer> {
        match lane {
            Lane::Ready => &mut self.ready,
            Lane::Recycle => &mut self.recycle,
        }
    }
}

struct Signals {
    not_empty: Condvar,
    not_full: Condvar,
}

impl Signals {
    fn new() -> Self {
        Self {
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }
}

/// Two bounded single-producer/single-consumer lanes sharing one lock.
pub struct BufferExchange {
    lanes: Mutex<Lanes>,
    capacity: usize,
    ready_signals: Signals,
    recycle_signals: Signals,
}

impl BufferExchange {
    /// Create an exchange whose lanes each hold up to `capacity` buffers.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);

        Self {
            lanes: Mutex::new(Lanes {
                ready: VecDeque::with_capacity(capacity),
                recycle: VecDeque::with_capacity(capacity),
                registered: 0,
                outstanding: 0,
                published: 0,
                recycled: 0,
                closed: false,
            }),
            capacity,
            ready_signals: Signals::new(),
            recycle_signals: Signals::new(),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn signals(&self, lane: Lane) -> &Signals {
        match lane {
            Lane::Ready => &self.ready_signals,
            Lane::Recycle => &self.recycle_signals,
        }
    }

    /// Hand freshly allocated buffers to the recycle lane.
    ///
    /// Buffers beyond the lane capacity are dropped with a warning.
    pub fn seed(&self, buffers: impl IntoIterator<Item = PixelBuffer>) {
        let mut lanes = self.lanes.lock();
        for buffer in buffers {
            if lanes.recycle.len() >= self.capacity {
                tracing::warn!(slot = buffer.slot(), "exchange full, not seeding buffer");
                continue;
            }
            lanes.recycle.push_back(buffer);
            lanes.registered += 1;
        }
        self.recycle_signals.not_empty.notify_one();
    }

    /// Take the oldest buffer from `lane`, waiting until one arrives.
    pub fn take(&self, lane: Lane) -> Result<PixelBuffer, Interrupted> {
        self.take_watched(lane, None, |_| {})
    }

    /// Like [`take`](Self::take), calling `on_stall` with the time spent
    /// waiting every time `stall_timeout` elapses without a buffer.
    pub fn take_watched(
        &self,
        lane: Lane,
        stall_timeout: Option<Duration>,
        mut on_stall: impl FnMut(Duration),
    ) -> Result<PixelBuffer, Interrupted> {
        let started = Instant::now();
        let signals = self.signals(lane);
        let mut lanes = self.lanes.lock();

        loop {
            if lanes.closed {
                return Err(Interrupted);
            }

            if let Some(buffer) = lanes.queue(lane).pop_front() {
                lanes.outstanding += 1;
                signals.not_full.notify_one();
                tracing::trace!(%lane, slot = buffer.slot(), "buffer taken");
                return Ok(buffer);
            }

            match stall_timeout {
                Some(timeout) => {
                    if signals.not_empty.wait_for(&mut lanes, timeout).timed_out()
                        && !lanes.closed
                        && lanes.queue(lane).is_empty()
                    {
                        on_stall(started.elapsed());
                    }
                }
                None => signals.not_empty.wait(&mut lanes),
            }
        }
    }

    /// Non-blocking take.
    pub fn try_take(&self, lane: Lane) -> Option<PixelBuffer> {
        let mut lanes = self.lanes.lock();
        if lanes.closed {
            return None;
        }
        let buffer = lanes.queue(lane).pop_front()?;
        lanes.outstanding += 1;
        self.signals(lane).not_full.notify_one();
        Some(buffer)
    }

    /// Append a buffer to `lane`, waiting while the lane is full.
    pub fn put(&self, lane: Lane, buffer: PixelBuffer) -> Result<(), Closed> {
        let signals = self.signals(lane);
        let mut lanes = self.lanes.lock();

        while !lanes.closed && lanes.queue(lane).len() >= self.capacity {
            signals.not_full.wait(&mut lanes);
        }

        if lanes.closed {
            return Err(Closed(buffer));
        }

        tracing::trace!(%lane, slot = buffer.slot(), "buffer put");
        lanes.queue(lane).push_back(buffer);
        lanes.outstanding = lanes.outstanding.saturating_sub(1);
        match lane {
            Lane::Ready => lanes.published += 1,
            Lane::Recycle => lanes.recycled += 1,
        }
        signals.not_empty.notify_one();
        Ok(())
    }

    /// Close both lanes and wake every waiter. Idempotent.
    pub fn close(&self) {
        let mut lanes = self.lanes.lock();
        if lanes.closed {
            return;
        }
        lanes.closed = true;
        drop(lanes);

        for signals in [&self.ready_signals, &self.recycle_signals] {
            signals.not_empty.notify_all();
            signals.not_full.notify_all();
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lanes.lock().closed
    }

    /// Remove every queued buffer from both lanes, ready lane first.
    pub fn drain(&self) -> Vec<PixelBuffer> {
        let mut lanes = self.lanes.lock();
        let mut buffers: Vec<PixelBuffer> = lanes.ready.drain(..).collect();
        buffers.extend(lanes.recycle.drain(..));
        buffers
    }

    /// Get current lane length.
    pub fn len(&self, lane: Lane) -> usize {
        self.lanes.lock().queue(lane).len()
    }

    /// Get exchange statistics.
    pub fn stats(&self) -> ExchangeStats {
        let lanes = self.lanes.lock();
        ExchangeStats {
            capacity: self.capacity,
            registered: lanes.registered,
            ready: lanes.ready.len(),
            recycle: lanes.recycle.len(),
            outstanding: lanes.outstanding,
            published: lanes.published,
            recycled: lanes.recycled,
        }
    }
}

impl Default for BufferExchange {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Shared handle to a buffer exchange.
pub type SharedExchange = Arc<BufferExchange>;

/// Create a new shared exchange with `capacity` freshly allocated buffers in
/// its recycle lane.
pub fn new_shared_exchange(capacity: usize, width: u32, height: u32) -> SharedExchange {
    let exchange = BufferExchange::new(capacity);
    let capacity = exchange.capacity();
    exchange.seed((0..capacity).map(|slot| PixelBuffer::new(slot, width, height)));
    Arc::new(exchange)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_take_put_fifo() {
        let exchange = new_shared_exchange(2, 1, 1);
        assert_eq!(exchange.len(Lane::Recycle), 2);

        let mut first = exchange.take(Lane::Recycle).unwrap();
        let mut second = exchange.take(Lane::Recycle).unwrap();
        first.mark_decoded(0);
        second.mark_decoded(1);

        exchange.put(Lane::Ready, first).unwrap();
        exchange.put(Lane::Ready, second).unwrap();

        assert_eq!(exchange.take(Lane::Ready).unwrap().frame(), Some(0));
        assert_eq!(exchange.take(Lane::Ready).unwrap().frame(), Some(1));
    }

    #[test]
    fn test_conservation_accounts_for_held_buffers() {
        let exchange = new_shared_exchange(3, 1, 1);
        assert!(exchange.stats().is_conserved());

        let held = exchange.take(Lane::Recycle).unwrap();
        let stats = exchange.stats();
        assert_eq!(stats.outstanding, 1);
        assert_eq!(stats.recycle, 2);
        assert!(stats.is_conserved());

        exchange.put(Lane::Ready, held).unwrap();
        let stats = exchange.stats();
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.ready, 1);
        assert_eq!(stats.published, 1);
        assert!(stats.is_conserved());
    }

    #[test]
    fn test_take_blocks_until_put() {
        let exchange = new_shared_exchange(1, 1, 1);
        let buffer = exchange.take(Lane::Recycle).unwrap();

        let consumer = {
            let exchange = Arc::clone(&exchange);
            thread::spawn(move || exchange.take(Lane::Ready).map(|b| b.slot()))
        };

        thread::sleep(Duration::from_millis(20));
        exchange.put(Lane::Ready, buffer).unwrap();
        assert_eq!(consumer.join().unwrap(), Ok(0));
    }

    #[test]
    fn test_close_interrupts_blocked_take() {
        let exchange = new_shared_exchange(2, 1, 1);

        let consumer = {
            let exchange = Arc::clone(&exchange);
            thread::spawn(move || exchange.take(Lane::Ready).map(|b| b.slot()))
        };

        thread::sleep(Duration::from_millis(20));
        exchange.close();
        assert_eq!(consumer.join().unwrap(), Err(Interrupted));
    }

    #[test]
    fn test_put_after_close_returns_buffer() {
        let exchange = new_shared_exchange(1, 1, 1);
        let buffer = exchange.take(Lane::Recycle).unwrap();
        exchange.close();
        assert!(exchange.is_closed());

        let Err(Closed(returned)) = exchange.put(Lane::Ready, buffer) else {
            panic!("put succeeded on a closed exchange");
        };
        assert_eq!(returned.slot(), 0);
        assert!(exchange.drain().is_empty());
    }

    #[test]
    fn test_put_blocks_while_full_until_closed() {
        let exchange = Arc::new(BufferExchange::new(1));
        exchange.seed([PixelBuffer::new(0, 1, 1)]);

        let producer = {
            let exchange = Arc::clone(&exchange);
            thread::spawn(move || exchange.put(Lane::Recycle, PixelBuffer::new(1, 1, 1)).is_err())
        };

        thread::sleep(Duration::from_millis(20));
        exchange.close();
        assert!(producer.join().unwrap());
        assert_eq!(exchange.drain().len(), 1);
    }

    #[test]
    fn test_stall_callback_fires() {
        let exchange = new_shared_exchange(1, 1, 1);
        let mut stalls = 0;

        let closer = {
            let exchange = Arc::clone(&exchange);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(60));
                exchange.close();
            })
        };

        let result =
            exchange.take_watched(Lane::Ready, Some(Duration::from_millis(10)), |_| stalls += 1);
        closer.join().unwrap();

        assert_eq!(result.map(|b| b.slot()), Err(Interrupted));
        assert!(stalls >= 1);
    }

    #[test]
    fn test_seed_respects_capacity() {
        let exchange = BufferExchange::new(1);
        exchange.seed([PixelBuffer::new(0, 1, 1), PixelBuffer::new(1, 1, 1)]);
        let stats = exchange.stats();
        assert_eq!(stats.registered, 1);
        assert_eq!(stats.recycle, 1);
    }
}
