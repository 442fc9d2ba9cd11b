//! The capture stream: one logical capture endpoint composing the
//! pipeline topology, format state, buffer queue and start/stop machine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use tracing::{debug, info, warn};

use crate::capture::frame::{BufferState, CapturedFrame, FrameBuffer, PlaneAddrs, MAX_PLANES};
use crate::capture::queue::{BufferQueue, QueueStats};
use crate::capture::state::{self, SequenceParams, StreamPhase};
use crate::error::{ConfigError, StreamError};
use crate::pipeline::format::{ActiveFormat, FormatTable, PixelFormat, Rect};
use crate::pipeline::source::{negotiate_source, VideoSourceInfo};
use crate::pipeline::stages::{PipelineDescriptor, PipelineHw, Topology, LUT_LEN};
use crate::{HandoverFlags, StreamConfig, TuningConfig};

const BUFFER_ALIGN: u64 = 4096;

fn align_up(v: u64) -> u64 {
    (v + BUFFER_ALIGN - 1) & !(BUFFER_ALIGN - 1)
}

/// Address of the most recent persisted frame snapshot.
#[derive(Debug, Clone, Copy)]
pub struct LastFrame {
    pub address: u64,
    pub captured_at: Instant,
}

struct ControlState {
    phase: StreamPhase,
    sessions: u32,
    format: ActiveFormat,
    crop: Rect,
    compose: Rect,
    source_info: VideoSourceInfo,
    handover: HandoverFlags,
    topology: Topology,
}

/// One capture endpoint.
///
/// Control operations serialize on an internal mutex that may block (it
/// covers slow things like clock enable and source negotiation); the two
/// hardware event intakes only ever take the queue's own non-blocking
/// lock.
pub struct CaptureStream {
    hw: PipelineHw,
    table: FormatTable,
    tuning: TuningConfig,
    buffer_base: u64,
    snapshot_base: u64,
    ctrl: Mutex<ControlState>,
    queue: BufferQueue,
    done_rx: flume::Receiver<CapturedFrame>,
    last_frame: ArcSwapOption<LastFrame>,
    live: AtomicBool,
    disconnected: AtomicBool,
}

impl CaptureStream {
    pub fn new(
        config: StreamConfig,
        desc: &PipelineDescriptor,
        hw: PipelineHw,
    ) -> Result<Self, ConfigError> {
        let topology = Topology::resolve(desc)?;
        hw.check_against(&topology)?;

        let entry = config
            .formats
            .validate(config.format, config.width, config.height)?;
        let format = ActiveFormat {
            pixel: config.format,
            code: entry.code,
            width: config.width,
            height: config.height,
        };

        let (queue, done_rx) = BufferQueue::new(config.drop_corrupted);
        info!(
            format = ?format.pixel,
            width = format.width,
            height = format.height,
            "capture stream created"
        );

        Ok(Self {
            hw,
            table: config.formats,
            tuning: config.tuning,
            buffer_base: config.buffer_base,
            snapshot_base: config.snapshot_base,
            ctrl: Mutex::new(ControlState {
                phase: StreamPhase::Idle,
                sessions: 0,
                format,
                crop: config.crop,
                compose: config.compose,
                source_info: VideoSourceInfo::default(),
                handover: config.handover,
                topology,
            }),
            queue,
            done_rx,
            last_frame: ArcSwapOption::empty(),
            live: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
        })
    }

    fn ctrl(&self) -> MutexGuard<'_, ControlState> {
        self.ctrl.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- session ----------------------------------------------------

    pub fn open(&self) -> Result<(), StreamError> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(StreamError::Disconnected);
        }
        let mut ctrl = self.ctrl();
        ctrl.sessions += 1;
        debug!(sessions = ctrl.sessions, "session opened");
        Ok(())
    }

    /// Close one session. The last close of a streaming endpoint tears the
    /// pipeline down and fails every queued buffer back to its owner.
    pub fn close(&self) {
        let mut ctrl = self.ctrl();
        ctrl.sessions = ctrl.sessions.saturating_sub(1);
        if ctrl.sessions == 0 && ctrl.phase == StreamPhase::Streaming {
            debug!("last session closed while streaming, stopping pipeline");
            if let Err(err) = self.stop_locked(&mut ctrl) {
                warn!(%err, "stop on close was degraded");
            }
        }
    }

    // ---- format -----------------------------------------------------

    pub fn format(&self) -> ActiveFormat {
        self.ctrl().format
    }

    /// Validate without committing; returns what `set_format` would set.
    pub fn try_format(
        &self,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Result<ActiveFormat, StreamError> {
        let entry = self.table.validate(format, width, height)?;
        Ok(ActiveFormat { pixel: format, code: entry.code, width, height })
    }

    pub fn set_format(
        &self,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Result<ActiveFormat, StreamError> {
        let mut ctrl = self.ctrl();
        if ctrl.phase != StreamPhase::Idle {
            return Err(StreamError::Busy("format change while streaming"));
        }
        if self.queue.is_busy() {
            return Err(StreamError::Busy("format change with buffers in flight"));
        }
        let entry = self.table.validate(format, width, height)?;
        let active = ActiveFormat { pixel: format, code: entry.code, width, height };
        ctrl.format = active;
        debug!(?active, "format set");
        Ok(active)
    }

    // ---- buffers ----------------------------------------------------

    /// Allocate a pool of `count` buffers laid out behind the configured
    /// memory base. `count == 0` frees the pool.
    pub fn request_buffers(&self, count: usize) -> Result<usize, StreamError> {
        let ctrl = self.ctrl();
        if ctrl.phase != StreamPhase::Idle {
            return Err(StreamError::Busy("buffer reallocation while streaming"));
        }
        if self.queue.is_busy() {
            return Err(StreamError::Busy("buffer reallocation with buffers in flight"));
        }
        if count == 0 {
            self.queue.install_pool(Vec::new());
            return Ok(0);
        }

        let entry = self
            .table
            .entry(ctrl.format.pixel)
            .ok_or(ConfigError::UnsupportedFormat(ctrl.format.pixel))?;
        let sizes = entry.plane_sizes(ctrl.format.width, ctrl.format.height);

        let mut cursor = self.buffer_base;
        let mut pool = Vec::with_capacity(count);
        for _ in 0..count {
            let mut planes = PlaneAddrs { addrs: [0; MAX_PLANES], count: entry.planes };
            for (plane, size) in sizes.iter().take(entry.planes).enumerate() {
                planes.addrs[plane] = cursor;
                cursor += align_up(*size);
            }
            pool.push(planes);
        }
        self.queue.install_pool(pool);
        debug!(count, "buffer pool installed");
        Ok(count)
    }

    pub fn query_buffer(&self, index: usize) -> Result<FrameBuffer, StreamError> {
        Ok(self.queue.buffer(index)?)
    }

    pub fn enqueue_buffer(&self, index: usize) -> Result<(), StreamError> {
        Ok(self.queue.enqueue(index)?)
    }

    /// Take the next completed buffer. `blocking` waits for one; otherwise
    /// `WouldBlock` is returned immediately when none is ready.
    pub fn dequeue_buffer(&self, blocking: bool) -> Result<CapturedFrame, StreamError> {
        let frame = if blocking {
            self.done_rx.recv().map_err(|_| StreamError::Disconnected)?
        } else {
            self.done_rx.try_recv().map_err(|err| match err {
                flume::TryRecvError::Empty => StreamError::WouldBlock,
                flume::TryRecvError::Disconnected => StreamError::Disconnected,
            })?
        };
        self.queue.mark_dequeued(frame.index);
        Ok(frame)
    }

    /// Clone of the completion channel, for callers that want to await
    /// results asynchronously instead of polling `dequeue_buffer`.
    pub fn completions(&self) -> flume::Receiver<CapturedFrame> {
        self.done_rx.clone()
    }

    // ---- streaming --------------------------------------------------

    pub fn start_streaming(&self) -> Result<(), StreamError> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(StreamError::Disconnected);
        }
        let mut ctrl = self.ctrl();
        if ctrl.phase != StreamPhase::Idle {
            return Err(StreamError::Busy("stream already running"));
        }
        ctrl.phase = StreamPhase::Starting;

        let info = negotiate_source(self.hw.source.as_ref(), &self.tuning);
        ctrl.source_info = info;

        let format = ctrl.format;
        let crop = ctrl.crop;
        let compose = ctrl.compose;
        let handover = ctrl.handover;
        let res = state::start_pipeline(SequenceParams {
            hw: &self.hw,
            topology: &mut ctrl.topology,
            info: &info,
            format: &format,
            crop,
            compose,
            handover,
            tuning: &self.tuning,
            queue: &self.queue,
        });

        self.live.store(true, Ordering::SeqCst);
        ctrl.phase = StreamPhase::Streaming;
        info!(interlaced = info.interlaced, degraded = res.is_err(), "streaming started");
        res
    }

    pub fn stop_streaming(&self) -> Result<(), StreamError> {
        let mut ctrl = self.ctrl();
        if ctrl.phase != StreamPhase::Streaming {
            return Err(StreamError::NotStreaming);
        }
        self.stop_locked(&mut ctrl)
    }

    fn stop_locked(&self, ctrl: &mut ControlState) -> Result<(), StreamError> {
        ctrl.phase = StreamPhase::Stopping;
        // Event intake stops first; the explicit in-flight clear below is
        // what guarantees a straggling completion finds nothing to do.
        self.live.store(false, Ordering::SeqCst);

        let info = ctrl.source_info;
        let format = ctrl.format;
        let crop = ctrl.crop;
        let compose = ctrl.compose;
        let handover = ctrl.handover;
        let res = state::stop_pipeline(SequenceParams {
            hw: &self.hw,
            topology: &mut ctrl.topology,
            info: &info,
            format: &format,
            crop,
            compose,
            handover,
            tuning: &self.tuning,
            queue: &self.queue,
        });

        self.queue.clear_in_flight();
        self.queue.return_all(BufferState::Error);
        ctrl.phase = StreamPhase::Idle;
        info!(degraded = res.is_err(), "streaming stopped");
        res
    }

    // ---- hardware events --------------------------------------------

    /// Front-end interrupt intake: a new capture epoch is starting.
    pub fn epoch_start(&self, corrupted: bool) {
        if !self.live.load(Ordering::SeqCst) {
            return;
        }
        self.queue.epoch_start(corrupted, self.hw.writer.as_ref());
    }

    /// Writer interrupt intake: a frame write has retired. Safe at any
    /// time; a stale event finds the in-flight pair cleared and does
    /// nothing.
    pub fn write_complete(&self) {
        self.queue.write_complete();
    }

    // ---- private control surface ------------------------------------

    /// Sample the writer's current output address over several intervals
    /// and report whether the transport is making progress.
    pub fn transport_alive(&self) -> Result<bool, StreamError> {
        let _ctrl = self.ctrl();
        let mut last = self.hw.writer.current_address()?;
        for _ in 1..self.tuning.liveness_samples.max(2) {
            thread::sleep(Duration::from_millis(self.tuning.liveness_interval_ms));
            let now = self.hw.writer.current_address()?;
            if now != last {
                return Ok(true);
            }
            last = now;
        }
        Ok(false)
    }

    /// Address of the most recent persisted frame snapshot, if any.
    pub fn last_frame(&self) -> Option<LastFrame> {
        self.last_frame.load_full().map(|lf| *lf)
    }

    /// Redirect the writer into the spare snapshot region for a settle
    /// window, then hand the register back to the capture protocol and
    /// persist the snapshot address.
    pub fn snapshot_last_frame(&self) -> Result<u64, StreamError> {
        if self.snapshot_base == 0 {
            return Err(StreamError::Config(ConfigError::NoSnapshotRegion));
        }
        let _ctrl = self.ctrl();
        self.hw
            .writer
            .set_base_address(&PlaneAddrs::single(self.snapshot_base))?;
        thread::sleep(Duration::from_millis(self.tuning.snapshot_settle_ms));
        self.queue.rearm(self.hw.writer.as_ref());

        let snap = LastFrame { address: self.snapshot_base, captured_at: Instant::now() };
        self.last_frame.store(Some(Arc::new(snap)));
        debug!(address = snap.address, "last-frame snapshot taken");
        Ok(snap.address)
    }

    pub fn set_handover_flags(&self, flags: HandoverFlags) {
        self.ctrl().handover = flags;
    }

    /// Push a front-end lookup table. The payload length is fixed.
    pub fn load_lut(&self, payload: &[u8]) -> Result<(), StreamError> {
        if payload.len() != LUT_LEN {
            return Err(StreamError::Config(ConfigError::BadLutLength {
                expected: LUT_LEN,
                got: payload.len(),
            }));
        }
        let _ctrl = self.ctrl();
        self.hw.front_end.load_lut(payload)?;
        Ok(())
    }

    /// Mark the underlying device as gone. Queued buffers fail back to the
    /// application immediately and future enqueues fail their buffers on
    /// entry.
    pub fn set_disconnected(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
        self.live.store(false, Ordering::SeqCst);
        self.queue.set_disconnected();
        self.queue.clear_in_flight();
        self.queue.return_all(BufferState::Error);
        warn!("capture stream marked disconnected");
    }

    // ---- observability ----------------------------------------------

    pub fn phase(&self) -> StreamPhase {
        self.ctrl().phase
    }

    pub fn source_info(&self) -> VideoSourceInfo {
        self.ctrl().source_info
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn queued(&self) -> usize {
        self.queue.queued()
    }
}
