//! Pipeline stage handles and the capability traits the orchestrator
//! drives them through.
//!
//! Register encodings live behind these traits in stage-specific adapters;
//! the capture core only sees configure/enable/plug style operations.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::capture::frame::PlaneAddrs;
use crate::error::{ConfigError, HwError};
use crate::pipeline::format::{HwFormat, Rect};
use crate::pipeline::source::{SourceDevice, VideoSourceInfo};

/// Byte length of a front-end lookup-table payload: 256 entries of 32 bits.
pub const LUT_LEN: usize = 256 * 4;

/// The hardware blocks a capture pipeline is assembled from, in pipeline
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageId {
    FrontEnd,
    Deinterlacer,
    Scaler,
    Compositor,
    Writer,
}

impl StageId {
    pub const ALL: [StageId; 5] = [
        StageId::FrontEnd,
        StageId::Deinterlacer,
        StageId::Scaler,
        StageId::Compositor,
        StageId::Writer,
    ];

    pub fn label(self) -> &'static str {
        match self {
            StageId::FrontEnd => "front-end",
            StageId::Deinterlacer => "deinterlacer",
            StageId::Scaler => "scaler",
            StageId::Compositor => "compositor",
            StageId::Writer => "writer",
        }
    }
}

/// An interrupt line number as wired on the SoC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IrqLine(pub u32);

/// Static description of one stage, as supplied by platform configuration.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StageDesc {
    pub present: bool,
    pub irq: Option<u32>,
}

impl StageDesc {
    pub fn present() -> Self {
        Self { present: true, irq: None }
    }

    pub fn with_irq(irq: u32) -> Self {
        Self { present: true, irq: Some(irq) }
    }

    pub fn absent() -> Self {
        Self { present: false, irq: None }
    }
}

/// Platform description of the whole pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineDescriptor {
    pub front_end: StageDesc,
    pub deinterlacer: StageDesc,
    pub scaler: StageDesc,
    pub compositor: StageDesc,
    pub writer: StageDesc,
}

impl PipelineDescriptor {
    fn desc(&self, id: StageId) -> StageDesc {
        match id {
            StageId::FrontEnd => self.front_end,
            StageId::Deinterlacer => self.deinterlacer,
            StageId::Scaler => self.scaler,
            StageId::Compositor => self.compositor,
            StageId::Writer => self.writer,
        }
    }
}

/// Runtime handle for one stage. Identity and interrupt binding are fixed
/// at resolution time; only `plugged` moves, and only the state machine
/// moves it.
#[derive(Debug, Clone, Copy)]
pub struct StageHandle {
    pub id: StageId,
    pub irq: Option<IrqLine>,
    pub plugged: bool,
}

/// The resolved stage set, ordered front-end first.
#[derive(Debug, Clone)]
pub struct Topology {
    stages: Vec<StageHandle>,
}

impl Topology {
    /// Work out which stages exist. The front-end and the writer are
    /// mandatory; everything between them is optional.
    pub fn resolve(desc: &PipelineDescriptor) -> Result<Topology, ConfigError> {
        for id in [StageId::FrontEnd, StageId::Writer] {
            if !desc.desc(id).present {
                return Err(ConfigError::MissingStage(id));
            }
        }
        let stages = StageId::ALL
            .iter()
            .filter(|id| desc.desc(**id).present)
            .map(|id| StageHandle {
                id: *id,
                irq: desc.desc(*id).irq.map(IrqLine),
                plugged: false,
            })
            .collect();
        Ok(Topology { stages })
    }

    /// Present stages in pipeline (plug) order.
    pub fn stages(&self) -> impl Iterator<Item = &StageHandle> {
        self.stages.iter()
    }

    /// Present stages in reverse plug order.
    pub fn stages_rev(&self) -> impl Iterator<Item = &StageHandle> {
        self.stages.iter().rev()
    }

    pub fn handle(&self, id: StageId) -> Option<&StageHandle> {
        self.stages.iter().find(|h| h.id == id)
    }

    pub(crate) fn set_plugged(&mut self, id: StageId, plugged: bool) {
        if let Some(h) = self.stages.iter_mut().find(|h| h.id == id) {
            h.plugged = plugged;
        }
    }

    /// Interrupt line of a stage, if configuration wired one.
    pub fn irq(&self, id: StageId) -> Option<IrqLine> {
        self.handle(id).and_then(|h| h.irq)
    }
}

/// Operations shared by every stage adapter.
pub trait StageOps: Send + Sync {
    fn id(&self) -> StageId;

    fn reset_assert(&self) -> Result<(), HwError>;
    fn reset_release(&self) -> Result<(), HwError>;

    fn enable(&self) -> Result<(), HwError>;
    fn disable(&self) -> Result<(), HwError>;

    fn plug_in(&self) -> Result<(), HwError>;
    fn plug_out(&self) -> Result<(), HwError>;
    /// Ask the hardware whether the stage is currently routed into the
    /// pipeline. Teardown trusts this over any cached notion.
    fn plug_state(&self) -> Result<bool, HwError>;
}

/// Capture front-end: samples the external source into the pipeline.
pub trait FrontEndOps: StageOps {
    /// Program source timing, input format and the read-side crop.
    fn configure(
        &self,
        info: &VideoSourceInfo,
        format: HwFormat,
        crop: Rect,
    ) -> Result<(), HwError>;

    /// Load the 256-entry lookup table consumed by the sampling path.
    fn load_lut(&self, table: &[u8]) -> Result<(), HwError>;

    fn as_stage(&self) -> &dyn StageOps;
}

/// Optional field-merging deinterlacer.
pub trait DeinterlaceOps: StageOps {
    fn configure(&self, width: u32, height: u32) -> Result<(), HwError>;

    fn as_stage(&self) -> &dyn StageOps;
}

/// Optional resizer between crop size and destination size.
pub trait ScalerOps: StageOps {
    fn configure(&self, input: Rect, out_width: u32, out_height: u32) -> Result<(), HwError>;

    fn as_stage(&self) -> &dyn StageOps;
}

/// Positions the frame on the destination canvas.
pub trait CompositorOps: StageOps {
    fn configure(&self, canvas_width: u32, canvas_height: u32, compose: Rect)
        -> Result<(), HwError>;

    fn as_stage(&self) -> &dyn StageOps;
}

/// Terminal DMA stage writing pipeline output to memory.
///
/// `set_base_address` latches: the write only takes effect at the next
/// epoch boundary, and it re-arms output that a front-end interrupt
/// handler disabled earlier in the epoch.
pub trait WriterOps: StageOps {
    fn configure(&self, format: HwFormat, width: u32, height: u32) -> Result<(), HwError>;

    fn set_base_address(&self, planes: &PlaneAddrs) -> Result<(), HwError>;

    /// Address the DMA engine is writing at right now.
    fn current_address(&self) -> Result<u64, HwError>;

    /// Whether the most recent frame write has fully retired.
    fn frame_complete(&self) -> Result<bool, HwError>;

    fn as_stage(&self) -> &dyn StageOps;
}

/// Stream clock gate.
pub trait StreamClock: Send + Sync {
    fn enable(&self) -> Result<(), HwError>;
    fn disable(&self) -> Result<(), HwError>;
}

/// Interrupt request/free surface of the host driver framework.
pub trait IrqController: Send + Sync {
    fn request(&self, line: IrqLine) -> Result<(), HwError>;
    fn free(&self, line: IrqLine) -> Result<(), HwError>;
    fn clear_pending(&self, line: IrqLine) -> Result<(), HwError>;
}

/// The hardware adapters a stream drives, injected at construction.
#[derive(Clone)]
pub struct PipelineHw {
    pub front_end: Arc<dyn FrontEndOps>,
    pub deinterlacer: Option<Arc<dyn DeinterlaceOps>>,
    pub scaler: Option<Arc<dyn ScalerOps>>,
    pub compositor: Option<Arc<dyn CompositorOps>>,
    pub writer: Arc<dyn WriterOps>,
    pub clock: Arc<dyn StreamClock>,
    pub irq: Arc<dyn IrqController>,
    pub source: Arc<dyn SourceDevice>,
}

impl PipelineHw {
    /// Common-ops view of one stage, if an adapter is wired.
    pub fn stage(&self, id: StageId) -> Option<&dyn StageOps> {
        match id {
            StageId::FrontEnd => Some(self.front_end.as_stage()),
            StageId::Deinterlacer => self.deinterlacer.as_deref().map(|s| s.as_stage()),
            StageId::Scaler => self.scaler.as_deref().map(|s| s.as_stage()),
            StageId::Compositor => self.compositor.as_deref().map(|s| s.as_stage()),
            StageId::Writer => Some(self.writer.as_stage()),
        }
    }

    /// Every described stage must come with an adapter.
    pub fn check_against(&self, topology: &Topology) -> Result<(), ConfigError> {
        for handle in topology.stages() {
            if self.stage(handle.id).is_none() {
                return Err(ConfigError::MissingAdapter(handle.id));
            }
        }
        Ok(())
    }
}
