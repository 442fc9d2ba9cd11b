//! Stream start/stop sequencing.
//!
//! Both directions are best-effort and total: every step runs, every
//! failure is logged, and the caller gets one aggregate result at the end.
//! No step is retried.

use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::capture::queue::BufferQueue;
use crate::error::{HwError, StreamError};
use crate::pipeline::format::{ActiveFormat, Rect};
use crate::pipeline::source::VideoSourceInfo;
use crate::pipeline::stages::{PipelineHw, StageId, Topology};
use crate::{HandoverFlags, TuningConfig};

/// Control-side phase of a capture stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Starting,
    Streaming,
    Stopping,
}

pub(crate) struct SequenceParams<'a> {
    pub hw: &'a PipelineHw,
    pub topology: &'a mut Topology,
    pub info: &'a VideoSourceInfo,
    pub format: &'a ActiveFormat,
    pub crop: Rect,
    pub compose: Rect,
    pub handover: HandoverFlags,
    pub tuning: &'a TuningConfig,
    pub queue: &'a BufferQueue,
}

struct StepLog {
    direction: &'static str,
    failed: u32,
}

impl StepLog {
    fn new(direction: &'static str) -> Self {
        Self { direction, failed: 0 }
    }

    fn run(&mut self, step: &'static str, res: Result<(), HwError>) {
        if let Err(err) = res {
            warn!(step, direction = self.direction, %err, "pipeline step failed");
            self.failed += 1;
        }
    }

    fn fail(&mut self, step: &'static str, reason: &'static str) {
        warn!(step, direction = self.direction, reason, "pipeline step failed");
        self.failed += 1;
    }
}

/// Bring the pipeline up: source, clock, resets, interrupts, then stage
/// configuration in pipeline order.
pub(crate) fn start_pipeline(p: SequenceParams<'_>) -> Result<(), StreamError> {
    let mut log = StepLog::new("start");
    let hw = p.hw;

    // 1. External source, unless a previous owner left it running.
    if p.handover.contains(HandoverFlags::SOURCE_RUNNING) {
        debug!("source handed over running, skipping power-up");
    } else {
        log.run("source power", hw.source.power(true));
        log.run("source init", hw.source.init());
        log.run("source stream on", hw.source.set_stream(true));
    }

    // 2. Stream clock.
    log.run("clock enable", hw.clock.enable());

    // 3. Pulse every present stage through reset, reverse plug order in,
    //    forward order out, unless the device is handed over hot.
    if p.handover.contains(HandoverFlags::DEVICE_RUNNING) {
        debug!("device handed over running, skipping stage reset");
    } else {
        for handle in p.topology.stages_rev() {
            if let Some(stage) = hw.stage(handle.id) {
                log.run("reset assert", stage.reset_assert());
            }
        }
        for handle in p.topology.stages() {
            if let Some(stage) = hw.stage(handle.id) {
                log.run("reset release", stage.reset_release());
            }
        }
    }

    // 4. Interrupts, strictly after the resets: a reset issued with live
    //    interrupt lines can leave stale pending state serviced against a
    //    half-configured pipeline.
    for id in [StageId::FrontEnd, StageId::Writer] {
        match p.topology.irq(id) {
            Some(line) => log.run("irq request", hw.irq.request(line)),
            None => log.fail("irq request", "no interrupt line wired"),
        }
    }

    // 5. Configure present stages in pipeline order.
    let crop = p.crop.resolve(p.info.width, p.info.height);
    let compose = p.compose.resolve(p.format.width, p.format.height);

    log.run(
        "front-end configure",
        hw.front_end.configure(p.info, p.format.code, crop),
    );

    if let Some(di) = &hw.deinterlacer {
        if p.info.interlaced {
            log.run("deinterlacer configure", di.configure(crop.width, crop.height));
            log.run("deinterlacer plug", di.plug_in());
            p.topology.set_plugged(StageId::Deinterlacer, true);
        }
    }

    if let Some(scaler) = &hw.scaler {
        log.run(
            "scaler configure",
            scaler.configure(crop, compose.width, compose.height),
        );
        log.run("scaler plug", scaler.plug_in());
        p.topology.set_plugged(StageId::Scaler, true);
    }

    if let Some(comp) = &hw.compositor {
        log.run(
            "compositor configure",
            comp.configure(p.format.width, p.format.height, compose),
        );
        log.run("compositor plug", comp.plug_in());
        p.topology.set_plugged(StageId::Compositor, true);
    }

    log.run(
        "writer configure",
        hw.writer.configure(p.format.code, p.format.width, p.format.height),
    );
    p.queue.arm_initial(hw.writer.as_ref());
    log.run("writer enable", hw.writer.enable());
    log.run("front-end enable", hw.front_end.enable());

    // Motion-adaptive deinterlace needs several fields before its 3D mode
    // may engage; progressive sources only cover pipeline latency.
    let warmup = if p.info.interlaced {
        p.tuning.warmup_interlaced
    } else {
        1
    };
    p.queue.reset_for_start(warmup);
    debug!(warmup, failed = log.failed, "pipeline start sequence done");

    if log.failed == 0 {
        Ok(())
    } else {
        Err(StreamError::StartDegraded(log.failed))
    }
}

/// Tear the pipeline down. Runs every step no matter what came before it.
pub(crate) fn stop_pipeline(p: SequenceParams<'_>) -> Result<(), StreamError> {
    let mut log = StepLog::new("stop");
    let hw = p.hw;

    // 1. Quiesce the writer and give the in-flight frame a bounded window
    //    to retire.
    log.run("writer disable", hw.writer.disable());
    let mut retired = false;
    for _ in 0..p.tuning.stop_poll_iterations {
        match hw.writer.frame_complete() {
            Ok(true) => {
                retired = true;
                break;
            }
            Ok(false) => {
                thread::sleep(Duration::from_millis(p.tuning.stop_poll_delay_ms))
            }
            Err(err) => {
                warn!(%err, "frame-complete poll failed");
                log.failed += 1;
                retired = true; // pointless to keep polling a dead register
                break;
            }
        }
    }
    if !retired {
        log.fail("writer quiesce", "frame still outstanding after bounded poll");
    }

    // 2. Unplug optional stages, but only the ones the hardware says are
    //    actually plugged.
    for id in [StageId::Deinterlacer, StageId::Scaler, StageId::Compositor] {
        let Some(stage) = hw.stage(id) else { continue };
        if p.topology.handle(id).is_none() {
            continue;
        }
        match stage.plug_state() {
            Ok(true) => {
                log.run("stage unplug", stage.plug_out());
                p.topology.set_plugged(id, false);
            }
            Ok(false) => {}
            Err(err) => {
                warn!(stage = id.label(), %err, "plug state query failed");
                log.failed += 1;
            }
        }
    }

    // 3. Stop the front-end from feeding the pipeline.
    log.run("front-end disable", hw.front_end.disable());

    // 4. Release both interrupts, pending status first.
    for id in [StageId::FrontEnd, StageId::Writer] {
        if let Some(line) = p.topology.irq(id) {
            log.run("irq clear", hw.irq.clear_pending(line));
            log.run("irq free", hw.irq.free(line));
        }
    }

    // 5./6. Park the stages in reset and gate the clock, unless a next
    //    owner keeps the device hot.
    if p.handover.contains(HandoverFlags::DEVICE_RUNNING) {
        debug!("device handed over, leaving stages and clock running");
    } else {
        for handle in p.topology.stages() {
            if let Some(stage) = hw.stage(handle.id) {
                log.run("reset assert", stage.reset_assert());
            }
        }
        log.run("clock disable", hw.clock.disable());
    }

    // 7. Stop the external source last.
    if p.handover.contains(HandoverFlags::SOURCE_RUNNING) {
        debug!("source handed over, leaving it streaming");
    } else {
        log.run("source stream off", hw.source.set_stream(false));
    }

    debug!(failed = log.failed, "pipeline stop sequence done");
    if log.failed == 0 {
        Ok(())
    } else {
        Err(StreamError::StopDegraded(log.failed))
    }
}
