//! Incoming buffer queue and the double-buffer interrupt protocol.
//!
//! Two hardware events bracket every capture epoch: the front-end fires
//! when a new frame starts entering the pipeline, and the memory writer
//! fires when a finished frame has fully landed in a buffer. The pair of
//! in-flight references `prev`/`next` bridges those two events; they are
//! plain slot indices that never own anything, so a late event that finds
//! them cleared simply does nothing.
//!
//! Every operation here is O(1) and non-blocking under one lock, so both
//! event handlers can run from atomic context while control operations
//! enqueue and drain from process context.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crossbeam::utils::CachePadded;
use metrics::counter;
use tracing::{trace, warn};

use crate::capture::frame::{BufferState, CapturedFrame, FrameBuffer, PlaneAddrs};
use crate::error::ConfigError;
use crate::pipeline::stages::WriterOps;

#[derive(Default)]
struct Stats {
    captured: AtomicU64,
    dropped: AtomicU64,
    skipped: AtomicU64,
    errored: AtomicU64,
}

/// Snapshot of the queue counters.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct QueueStats {
    /// Buffers finalized `Done`.
    pub captured: u64,
    /// Epochs that found no buffer to capture into.
    pub dropped: u64,
    /// Warm-up epochs that deliberately armed nothing.
    pub skipped: u64,
    /// Buffers completed with `Error`.
    pub errored: u64,
}

struct Inner {
    pool: Vec<FrameBuffer>,
    incoming: VecDeque<usize>,
    prev: Option<usize>,
    next: Option<usize>,
    skip: u32,
    sequence: u32,
    disconnected: bool,
    drop_corrupted: bool,
}

/// The per-stream buffer queue.
///
/// Completed buffers leave through a flume channel; the stream end of it
/// backs blocking and non-blocking dequeue.
pub struct BufferQueue {
    inner: Mutex<Inner>,
    stats: CachePadded<Stats>,
    done_tx: flume::Sender<CapturedFrame>,
}

impl BufferQueue {
    pub fn new(drop_corrupted: bool) -> (Self, flume::Receiver<CapturedFrame>) {
        let (done_tx, done_rx) = flume::unbounded();
        let queue = Self {
            inner: Mutex::new(Inner {
                pool: Vec::new(),
                incoming: VecDeque::new(),
                prev: None,
                next: None,
                skip: 0,
                sequence: 0,
                disconnected: false,
                drop_corrupted,
            }),
            stats: CachePadded::new(Stats::default()),
            done_tx,
        };
        (queue, done_rx)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install a freshly allocated pool, dropping the old one. Only legal
    /// while nothing is queued or in flight.
    pub fn install_pool(&self, planes: Vec<PlaneAddrs>) {
        let mut q = self.lock();
        debug_assert!(q.incoming.is_empty() && q.prev.is_none() && q.next.is_none());
        q.pool = planes
            .into_iter()
            .enumerate()
            .map(|(i, p)| FrameBuffer::new(i, p))
            .collect();
    }

    pub fn pool_len(&self) -> usize {
        self.lock().pool.len()
    }

    pub fn buffer(&self, index: usize) -> Result<FrameBuffer, ConfigError> {
        let q = self.lock();
        q.pool.get(index).copied().ok_or(ConfigError::BadBufferIndex(index))
    }

    /// Number of buffers waiting in the incoming queue.
    pub fn queued(&self) -> usize {
        self.lock().incoming.len()
    }

    /// True while any buffer is queued or being captured into.
    pub fn is_busy(&self) -> bool {
        let q = self.lock();
        !q.incoming.is_empty() || q.prev.is_some() || q.next.is_some()
    }

    /// Append a buffer to the incoming queue tail.
    ///
    /// On a disconnected stream the buffer is completed with `Error`
    /// immediately instead, so nothing can strand across a removal race.
    pub fn enqueue(&self, index: usize) -> Result<(), ConfigError> {
        let mut q = self.lock();
        let buf = q.pool.get(index).ok_or(ConfigError::BadBufferIndex(index))?;
        if matches!(buf.state, BufferState::QueuedIncoming | BufferState::Active) {
            return Err(ConfigError::BufferBusy(index));
        }
        if q.disconnected {
            q.pool[index].state = BufferState::Error;
            self.complete(index, BufferState::Error, 0);
            return Ok(());
        }
        q.pool[index].state = BufferState::QueuedIncoming;
        q.incoming.push_back(index);
        trace!(index, depth = q.incoming.len(), "buffer queued");
        Ok(())
    }

    /// Drain the incoming queue, completing every buffer with `state`.
    pub fn return_all(&self, state: BufferState) {
        debug_assert!(state.is_terminal());
        let mut q = self.lock();
        while let Some(index) = q.incoming.pop_front() {
            q.pool[index].state = state;
            self.complete(index, state, 0);
        }
    }

    /// Forget any in-flight pair. Called on the stop path so a completion
    /// event that straggles in after teardown finds nothing to finalize.
    pub fn clear_in_flight(&self) {
        let mut q = self.lock();
        q.prev = None;
        q.next = None;
    }

    /// Mark the stream disconnected; future enqueues fail their buffers
    /// immediately.
    pub fn set_disconnected(&self) {
        self.lock().disconnected = true;
    }

    /// Reset per-start state: sequence numbering and the warm-up skip
    /// counter.
    pub fn reset_for_start(&self, warmup: u32) {
        let mut q = self.lock();
        q.sequence = 0;
        q.skip = warmup;
    }

    pub fn skip_remaining(&self) -> u32 {
        self.lock().skip
    }

    /// Program the queue head's address into the writer so the first epoch
    /// after start lands in a real buffer. No-op on an empty queue.
    pub fn arm_initial(&self, writer: &dyn WriterOps) {
        let q = self.lock();
        if let Some(&head) = q.incoming.front() {
            let planes = q.pool[head].planes;
            if let Err(err) = writer.set_base_address(&planes) {
                warn!(%err, "initial writer address arm failed");
            }
        }
    }

    /// Re-program the writer with whatever address the protocol currently
    /// has armed. Used after a control operation borrowed the writer (the
    /// last-frame snapshot path).
    pub fn rearm(&self, writer: &dyn WriterOps) {
        let q = self.lock();
        let armed = q.next.or_else(|| q.incoming.front().copied());
        if let Some(index) = armed {
            let planes = q.pool[index].planes;
            if let Err(err) = writer.set_base_address(&planes) {
                warn!(%err, "writer address re-arm failed");
            }
        }
    }

    /// Front-end event: a new capture epoch is starting.
    ///
    /// Stages the head buffer as `prev`, arms the second buffer's address
    /// as `next` for the following epoch, and always leaves the writer
    /// output disabled — the base-address latch is what re-arms it at the
    /// epoch boundary, not this handler.
    pub fn epoch_start(&self, corrupted: bool, writer: &dyn WriterOps) {
        let mut q = self.lock();
        q.prev = None;
        q.next = None;

        if q.skip > 0 {
            q.skip -= 1;
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            counter!("artemis_epochs_skipped").increment(1);
            trace!(remaining = q.skip, "warm-up epoch skipped");
        } else if q.incoming.is_empty() {
            // No destination for this frame; it falls on the floor.
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            counter!("artemis_frames_dropped").increment(1);
        } else {
            let head = q.incoming[0];
            q.pool[head].state = BufferState::Active;
            q.prev = Some(head);

            let arm_next = q.incoming.len() >= 2 && !(q.drop_corrupted && corrupted);
            if arm_next {
                let second = q.incoming[1];
                q.next = Some(second);
                let planes = q.pool[second].planes;
                // Latched by hardware: takes effect at the next epoch
                // boundary, arming the destination of the frame after the
                // one now in flight.
                if let Err(err) = writer.set_base_address(&planes) {
                    warn!(%err, "writer address arm failed");
                }
            }
        }

        if let Err(err) = writer.disable() {
            warn!(%err, "writer output disable failed");
        }
    }

    /// Writer event: the frame armed one epoch ago has fully landed.
    ///
    /// Finalizes `prev` only when both halves of the in-flight pair are
    /// set; anything else is a dropped frame and touches nothing.
    pub fn write_complete(&self) {
        let mut q = self.lock();
        let (Some(prev), Some(_next)) = (q.prev, q.next) else {
            trace!("write completion with incomplete in-flight pair, nothing finalized");
            return;
        };

        if q.incoming.front() == Some(&prev) {
            q.incoming.pop_front();
        } else {
            // Queue changed under the pair (stop raced in); drop the
            // stale references and finalize nothing.
            warn!(prev, "in-flight pair no longer matches the queue head");
            q.prev = None;
            q.next = None;
            return;
        }

        let sequence = q.sequence;
        q.sequence = q.sequence.wrapping_add(1);
        q.pool[prev].state = BufferState::Done;
        q.prev = None;
        q.next = None;
        self.stats.captured.fetch_add(1, Ordering::Relaxed);
        counter!("artemis_frames_captured").increment(1);
        self.complete(prev, BufferState::Done, sequence);
    }

    /// The application took the buffer back; the slot is idle again.
    pub fn mark_dequeued(&self, index: usize) {
        let mut q = self.lock();
        if let Some(buf) = q.pool.get_mut(index) {
            if buf.state.is_terminal() {
                buf.state = BufferState::Idle;
            }
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            captured: self.stats.captured.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            skipped: self.stats.skipped.load(Ordering::Relaxed),
            errored: self.stats.errored.load(Ordering::Relaxed),
        }
    }

    fn complete(&self, index: usize, state: BufferState, sequence: u32) {
        if state == BufferState::Error {
            self.stats.errored.fetch_add(1, Ordering::Relaxed);
            counter!("artemis_buffers_errored").increment(1);
        }
        let frame = CapturedFrame { index, state, sequence, timestamp: Instant::now() };
        if self.done_tx.send(frame).is_err() {
            warn!(index, "completion receiver is gone, buffer result lost");
        }
    }
}
