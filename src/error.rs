//! Error taxonomy for the capture core.
//!
//! Configuration problems are synchronous and returned to the caller;
//! transient hardware trouble is logged and degraded around; teardown
//! never aborts early, it only reports an aggregate failure at the end.

use thiserror::Error;

use crate::pipeline::format::PixelFormat;
use crate::pipeline::stages::StageId;

/// Synchronous configuration failures returned to control operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("pixel format {0:?} is not in the format table")]
    UnsupportedFormat(PixelFormat),

    #[error("invalid frame size {width}x{height}")]
    InvalidSize { width: u32, height: u32 },

    #[error("mandatory {0:?} stage missing from pipeline description")]
    MissingStage(StageId),

    #[error("{0:?} stage is described but no hardware adapter was supplied")]
    MissingAdapter(StageId),

    #[error("buffer index {0} is out of range")]
    BadBufferIndex(usize),

    #[error("buffer {0} is already queued or being captured into")]
    BufferBusy(usize),

    #[error("lookup table payload must be {expected} bytes, got {got}")]
    BadLutLength { expected: usize, got: usize },

    #[error("buffer count must be non-zero")]
    NoBuffers,

    #[error("no snapshot region configured")]
    NoSnapshotRegion,
}

/// Faults reported by hardware adapters.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HwError {
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("{0} is already in use")]
    Busy(&'static str),

    #[error("register access fault: {0}")]
    Fault(&'static str),

    #[error("no signal from source")]
    NoSignal,
}

/// Failures surfaced by the capture stream control surface.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Hw(#[from] HwError),

    #[error("stream is busy: {0}")]
    Busy(&'static str),

    #[error("stream is not streaming")]
    NotStreaming,

    #[error("no completed buffer available")]
    WouldBlock,

    #[error("device disconnected")]
    Disconnected,

    /// Bring-up ran every step but at least one of them failed.
    #[error("pipeline start completed with {0} failed step(s)")]
    StartDegraded(u32),

    /// Teardown ran every step but at least one of them failed.
    #[error("pipeline stop completed with {0} failed step(s)")]
    StopDegraded(u32),
}
