//! Virtual hardware backend.
//!
//! A software register model of the whole pipeline: every stage adapter,
//! the clock, the interrupt controller and a scriptable source device,
//! plus an epoch driver that fires the two capture events in hardware
//! order. The demo binary and the test suite run the full
//! bring-up/capture/tear-down cycle against it without silicon.

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use crate::capture::frame::PlaneAddrs;
use crate::capture::stream::CaptureStream;
use crate::error::HwError;
use crate::pipeline::format::{HwFormat, Rect};
use crate::pipeline::source::{
    BusConfig, SignalStatus, SourceDevice, SourceTiming, VideoSourceInfo,
};
use crate::pipeline::stages::{
    CompositorOps, DeinterlaceOps, FrontEndOps, IrqController, IrqLine, PipelineDescriptor,
    PipelineHw, ScalerOps, StageDesc, StageId, StageOps, StreamClock, WriterOps,
};

pub const FRONT_END_IRQ: u32 = 14;
pub const WRITER_IRQ: u32 = 15;

/// Behavior knobs for the modelled board.
#[derive(Debug, Clone)]
pub struct VirtProfile {
    pub width: u32,
    pub height: u32,
    pub interlaced: bool,
    pub hsync_active_low: bool,
    pub vsync_active_low: bool,
    /// Source status queries that fail before the signal locks.
    pub status_failures: u32,
    /// Pin `frame_complete` low to exercise the bounded stop poll.
    pub hold_frame_complete: bool,
}

impl Default for VirtProfile {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            interlaced: false,
            hsync_active_low: false,
            vsync_active_low: false,
            status_failures: 0,
            hold_frame_complete: false,
        }
    }
}

impl VirtProfile {
    pub fn interlaced(width: u32, height: u32) -> Self {
        Self { width, height, interlaced: true, ..Default::default() }
    }
}

#[derive(Default)]
struct StageRegs {
    in_reset: bool,
    enabled: bool,
    plugged: bool,
}

struct WriterRegs {
    /// Shadow register written by `set_base_address`.
    base: PlaneAddrs,
    /// Address in effect for the current epoch; copied from `base` at
    /// every epoch boundary.
    latched: PlaneAddrs,
    output: bool,
    frame_complete: bool,
    /// DMA progress cursor; only its movement is meaningful.
    write_ptr: u64,
    frame_bytes: u64,
}

impl Default for WriterRegs {
    fn default() -> Self {
        Self {
            base: PlaneAddrs::default(),
            latched: PlaneAddrs::default(),
            output: false,
            // An idle writer has no write outstanding.
            frame_complete: true,
            write_ptr: 0,
            frame_bytes: 0,
        }
    }
}

struct SourceRegs {
    powered: bool,
    initialized: bool,
    streaming: bool,
    failures_left: u32,
}

struct Inner {
    profile: VirtProfile,
    journal: Mutex<Vec<String>>,
    fe: Mutex<StageRegs>,
    di: Mutex<StageRegs>,
    sc: Mutex<StageRegs>,
    co: Mutex<StageRegs>,
    wr_stage: Mutex<StageRegs>,
    wr: Mutex<WriterRegs>,
    clock_on: Mutex<bool>,
    irq_lines: Mutex<HashSet<u32>>,
    src: Mutex<SourceRegs>,
    lut: Mutex<Option<Bytes>>,
}

impl Inner {
    fn regs(&self, id: StageId) -> &Mutex<StageRegs> {
        match id {
            StageId::FrontEnd => &self.fe,
            StageId::Deinterlacer => &self.di,
            StageId::Scaler => &self.sc,
            StageId::Compositor => &self.co,
            StageId::Writer => &self.wr_stage,
        }
    }

    fn note(&self, entry: impl Into<String>) {
        lock(&self.journal).push(entry.into());
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to the modelled board. Cheap to clone; all adapters built from
/// one `VirtHw` share the same register state.
#[derive(Clone)]
pub struct VirtHw {
    inner: Arc<Inner>,
}

impl VirtHw {
    pub fn new(profile: VirtProfile) -> Self {
        let failures = profile.status_failures;
        Self {
            inner: Arc::new(Inner {
                profile,
                journal: Mutex::new(Vec::new()),
                fe: Mutex::new(StageRegs::default()),
                di: Mutex::new(StageRegs::default()),
                sc: Mutex::new(StageRegs::default()),
                co: Mutex::new(StageRegs::default()),
                wr_stage: Mutex::new(StageRegs::default()),
                wr: Mutex::new(WriterRegs::default()),
                clock_on: Mutex::new(false),
                irq_lines: Mutex::new(HashSet::new()),
                src: Mutex::new(SourceRegs {
                    powered: false,
                    initialized: false,
                    streaming: false,
                    failures_left: failures,
                }),
                lut: Mutex::new(None),
            }),
        }
    }

    /// Platform description matching the modelled board: the full
    /// five-stage pipeline with both interrupt lines wired.
    pub fn descriptor(&self) -> PipelineDescriptor {
        PipelineDescriptor {
            front_end: StageDesc::with_irq(FRONT_END_IRQ),
            deinterlacer: StageDesc::present(),
            scaler: StageDesc::present(),
            compositor: StageDesc::present(),
            writer: StageDesc::with_irq(WRITER_IRQ),
        }
    }

    /// Adapter set for the full pipeline.
    pub fn pipeline_hw(&self) -> PipelineHw {
        PipelineHw {
            front_end: Arc::new(VirtFrontEnd { inner: self.inner.clone() }),
            deinterlacer: Some(Arc::new(VirtDeinterlacer { inner: self.inner.clone() })),
            scaler: Some(Arc::new(VirtScaler { inner: self.inner.clone() })),
            compositor: Some(Arc::new(VirtCompositor { inner: self.inner.clone() })),
            writer: Arc::new(VirtWriter { inner: self.inner.clone() }),
            clock: Arc::new(VirtClock { inner: self.inner.clone() }),
            irq: Arc::new(VirtIrq { inner: self.inner.clone() }),
            source: Arc::new(VirtSource { inner: self.inner.clone() }),
        }
    }

    /// Every register access in call order, for sequencing assertions.
    pub fn journal(&self) -> Vec<String> {
        lock(&self.inner.journal).clone()
    }

    pub fn loaded_lut(&self) -> Option<Bytes> {
        lock(&self.inner.lut).clone()
    }

    /// Address currently latched into the writer (in effect this epoch).
    pub fn latched_address(&self) -> u64 {
        lock(&self.inner.wr).latched.base()
    }

    /// Address sitting in the writer's shadow register (armed for the
    /// next epoch boundary).
    pub fn armed_address(&self) -> u64 {
        lock(&self.inner.wr).base.base()
    }

    pub fn clock_on(&self) -> bool {
        *lock(&self.inner.clock_on)
    }

    pub fn irq_requested(&self, line: u32) -> bool {
        lock(&self.inner.irq_lines).contains(&line)
    }

    pub fn stage_enabled(&self, id: StageId) -> bool {
        lock(self.inner.regs(id)).enabled
    }

    pub fn source_powered(&self) -> bool {
        lock(&self.inner.src).powered
    }

    pub fn source_streaming(&self) -> bool {
        lock(&self.inner.src).streaming
    }

    /// Run one capture epoch the way the hardware would: latch the shadow
    /// address at the boundary, raise the front-end event, retire the
    /// write, raise the completion event.
    pub fn drive_epoch(&self, stream: &CaptureStream, corrupted: bool) {
        {
            let mut wr = lock(&self.inner.wr);
            wr.latched = wr.base;
            wr.frame_complete = false;
        }
        stream.epoch_start(corrupted);
        {
            let mut wr = lock(&self.inner.wr);
            if wr.output {
                wr.write_ptr = wr.write_ptr.wrapping_add(wr.frame_bytes.max(1));
            }
            wr.frame_complete = true;
        }
        stream.write_complete();
    }
}

/// Background thread firing epochs at a fixed cadence.
pub struct EpochPump {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EpochPump {
    pub fn spawn(
        hw: VirtHw,
        stream: Arc<CaptureStream>,
        period: Duration,
    ) -> io::Result<EpochPump> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::Builder::new().name("virt-epoch".into()).spawn(move || {
            debug!("epoch pump running");
            while !flag.load(Ordering::Relaxed) {
                hw.drive_epoch(&stream, false);
                thread::sleep(period);
            }
            debug!("epoch pump stopped");
        })?;
        Ok(EpochPump { stop, handle: Some(handle) })
    }

    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EpochPump {
    fn drop(&mut self) {
        self.halt();
    }
}

macro_rules! virt_stage_ops {
    ($ty:ty, $id:expr, $tag:literal) => {
        impl StageOps for $ty {
            fn id(&self) -> StageId {
                $id
            }
            fn reset_assert(&self) -> Result<(), HwError> {
                let mut regs = lock(self.inner.regs($id));
                regs.in_reset = true;
                regs.enabled = false;
                self.inner.note(concat!($tag, ".reset_assert"));
                Ok(())
            }
            fn reset_release(&self) -> Result<(), HwError> {
                lock(self.inner.regs($id)).in_reset = false;
                self.inner.note(concat!($tag, ".reset_release"));
                Ok(())
            }
            fn enable(&self) -> Result<(), HwError> {
                let mut regs = lock(self.inner.regs($id));
                if regs.in_reset {
                    return Err(HwError::Fault("stage held in reset"));
                }
                regs.enabled = true;
                self.inner.note(concat!($tag, ".enable"));
                Ok(())
            }
            fn disable(&self) -> Result<(), HwError> {
                lock(self.inner.regs($id)).enabled = false;
                self.inner.note(concat!($tag, ".disable"));
                Ok(())
            }
            fn plug_in(&self) -> Result<(), HwError> {
                lock(self.inner.regs($id)).plugged = true;
                self.inner.note(concat!($tag, ".plug_in"));
                Ok(())
            }
            fn plug_out(&self) -> Result<(), HwError> {
                let mut regs = lock(self.inner.regs($id));
                if !regs.plugged {
                    return Err(HwError::Fault("stage not plugged"));
                }
                regs.plugged = false;
                self.inner.note(concat!($tag, ".plug_out"));
                Ok(())
            }
            fn plug_state(&self) -> Result<bool, HwError> {
                Ok(lock(self.inner.regs($id)).plugged)
            }
        }
    };
}

struct VirtFrontEnd {
    inner: Arc<Inner>,
}

virt_stage_ops!(VirtFrontEnd, StageId::FrontEnd, "fe");

impl FrontEndOps for VirtFrontEnd {
    fn configure(
        &self,
        info: &VideoSourceInfo,
        format: HwFormat,
        crop: Rect,
    ) -> Result<(), HwError> {
        self.inner.note(format!(
            "fe.configure({}x{}{} code={:#x} crop={}x{}+{}+{})",
            info.width,
            info.height,
            if info.interlaced { "i" } else { "p" },
            format.0,
            crop.width,
            crop.height,
            crop.left,
            crop.top,
        ));
        Ok(())
    }

    fn load_lut(&self, table: &[u8]) -> Result<(), HwError> {
        *lock(&self.inner.lut) = Some(Bytes::copy_from_slice(table));
        self.inner.note("fe.load_lut");
        Ok(())
    }

    fn as_stage(&self) -> &dyn StageOps {
        self
    }
}

struct VirtDeinterlacer {
    inner: Arc<Inner>,
}

virt_stage_ops!(VirtDeinterlacer, StageId::Deinterlacer, "di");

impl DeinterlaceOps for VirtDeinterlacer {
    fn configure(&self, width: u32, height: u32) -> Result<(), HwError> {
        self.inner.note(format!("di.configure({width}x{height})"));
        Ok(())
    }

    fn as_stage(&self) -> &dyn StageOps {
        self
    }
}

struct VirtScaler {
    inner: Arc<Inner>,
}

virt_stage_ops!(VirtScaler, StageId::Scaler, "sc");

impl ScalerOps for VirtScaler {
    fn configure(&self, input: Rect, out_width: u32, out_height: u32) -> Result<(), HwError> {
        self.inner.note(format!(
            "sc.configure({}x{} -> {}x{})",
            input.width, input.height, out_width, out_height
        ));
        Ok(())
    }

    fn as_stage(&self) -> &dyn StageOps {
        self
    }
}

struct VirtCompositor {
    inner: Arc<Inner>,
}

virt_stage_ops!(VirtCompositor, StageId::Compositor, "co");

impl CompositorOps for VirtCompositor {
    fn configure(
        &self,
        canvas_width: u32,
        canvas_height: u32,
        compose: Rect,
    ) -> Result<(), HwError> {
        self.inner.note(format!(
            "co.configure({canvas_width}x{canvas_height} compose={}x{}+{}+{})",
            compose.width, compose.height, compose.left, compose.top
        ));
        Ok(())
    }

    fn as_stage(&self) -> &dyn StageOps {
        self
    }
}

struct VirtWriter {
    inner: Arc<Inner>,
}

impl VirtWriter {
    fn writer_regs(&self) -> MutexGuard<'_, WriterRegs> {
        lock(&self.inner.wr)
    }
}

// Hand-written rather than macro-generated: the writer's enable/disable
// gate its DMA output register, not just the stage enable bit.
impl StageOps for VirtWriter {
    fn id(&self) -> StageId {
        StageId::Writer
    }

    fn reset_assert(&self) -> Result<(), HwError> {
        let mut regs = lock(self.inner.regs(StageId::Writer));
        regs.in_reset = true;
        regs.enabled = false;
        self.writer_regs().output = false;
        self.inner.note("writer.reset_assert");
        Ok(())
    }

    fn reset_release(&self) -> Result<(), HwError> {
        lock(self.inner.regs(StageId::Writer)).in_reset = false;
        self.inner.note("writer.reset_release");
        Ok(())
    }

    fn enable(&self) -> Result<(), HwError> {
        let mut regs = lock(self.inner.regs(StageId::Writer));
        if regs.in_reset {
            return Err(HwError::Fault("stage held in reset"));
        }
        regs.enabled = true;
        self.writer_regs().output = true;
        self.inner.note("writer.enable");
        Ok(())
    }

    fn disable(&self) -> Result<(), HwError> {
        lock(self.inner.regs(StageId::Writer)).enabled = false;
        self.writer_regs().output = false;
        self.inner.note("writer.disable");
        Ok(())
    }

    fn plug_in(&self) -> Result<(), HwError> {
        lock(self.inner.regs(StageId::Writer)).plugged = true;
        self.inner.note("writer.plug_in");
        Ok(())
    }

    fn plug_out(&self) -> Result<(), HwError> {
        let mut regs = lock(self.inner.regs(StageId::Writer));
        if !regs.plugged {
            return Err(HwError::Fault("stage not plugged"));
        }
        regs.plugged = false;
        self.inner.note("writer.plug_out");
        Ok(())
    }

    fn plug_state(&self) -> Result<bool, HwError> {
        Ok(lock(self.inner.regs(StageId::Writer)).plugged)
    }
}

impl WriterOps for VirtWriter {
    fn configure(&self, format: HwFormat, width: u32, height: u32) -> Result<(), HwError> {
        let mut wr = self.writer_regs();
        wr.frame_bytes = u64::from(width) * u64::from(height) * 2;
        self.inner
            .note(format!("writer.configure(code={:#x} {width}x{height})", format.0));
        Ok(())
    }

    fn set_base_address(&self, planes: &PlaneAddrs) -> Result<(), HwError> {
        let mut wr = self.writer_regs();
        wr.base = *planes;
        // The latch contract: a base-address write re-arms output for the
        // next epoch boundary.
        wr.output = true;
        self.inner.note(format!("writer.set_base({:#x})", planes.base()));
        Ok(())
    }

    fn current_address(&self) -> Result<u64, HwError> {
        Ok(self.writer_regs().write_ptr)
    }

    fn frame_complete(&self) -> Result<bool, HwError> {
        if self.inner.profile.hold_frame_complete {
            return Ok(false);
        }
        Ok(self.writer_regs().frame_complete)
    }

    fn as_stage(&self) -> &dyn StageOps {
        self
    }
}

struct VirtClock {
    inner: Arc<Inner>,
}

impl StreamClock for VirtClock {
    fn enable(&self) -> Result<(), HwError> {
        *lock(&self.inner.clock_on) = true;
        self.inner.note("clock.enable");
        Ok(())
    }

    fn disable(&self) -> Result<(), HwError> {
        *lock(&self.inner.clock_on) = false;
        self.inner.note("clock.disable");
        Ok(())
    }
}

struct VirtIrq {
    inner: Arc<Inner>,
}

impl IrqController for VirtIrq {
    fn request(&self, line: IrqLine) -> Result<(), HwError> {
        if !lock(&self.inner.irq_lines).insert(line.0) {
            return Err(HwError::Busy("irq line"));
        }
        self.inner.note(format!("irq.request({})", line.0));
        Ok(())
    }

    fn free(&self, line: IrqLine) -> Result<(), HwError> {
        if !lock(&self.inner.irq_lines).remove(&line.0) {
            return Err(HwError::Fault("irq line not requested"));
        }
        self.inner.note(format!("irq.free({})", line.0));
        Ok(())
    }

    fn clear_pending(&self, line: IrqLine) -> Result<(), HwError> {
        self.inner.note(format!("irq.clear({})", line.0));
        Ok(())
    }
}

struct VirtSource {
    inner: Arc<Inner>,
}

impl SourceDevice for VirtSource {
    fn power(&self, on: bool) -> Result<(), HwError> {
        lock(&self.inner.src).powered = on;
        self.inner.note(format!("source.power({on})"));
        Ok(())
    }

    fn init(&self) -> Result<(), HwError> {
        lock(&self.inner.src).initialized = true;
        self.inner.note("source.init");
        Ok(())
    }

    fn set_stream(&self, on: bool) -> Result<(), HwError> {
        let mut src = lock(&self.inner.src);
        if on && !src.initialized {
            return Err(HwError::Fault("source not initialized"));
        }
        src.streaming = on;
        self.inner.note(format!("source.stream({on})"));
        Ok(())
    }

    fn status(&self) -> Result<SignalStatus, HwError> {
        let mut src = lock(&self.inner.src);
        if src.failures_left > 0 {
            src.failures_left -= 1;
            return Err(HwError::NoSignal);
        }
        Ok(SignalStatus { locked: true })
    }

    fn timing(&self) -> Result<SourceTiming, HwError> {
        let p = &self.inner.profile;
        Ok(SourceTiming { width: p.width, height: p.height, interlaced: p.interlaced })
    }

    fn bus_config(&self) -> Result<BusConfig, HwError> {
        let p = &self.inner.profile;
        Ok(BusConfig {
            hsync_active_low: p.hsync_active_low,
            vsync_active_low: p.vsync_active_low,
        })
    }
}
