//! Artemis video-input capture core.
//!
//! Orchestrates a fixed SoC capture pipeline (front-end, optional
//! deinterlacer and scaler, compositor, memory writer) behind per-stage
//! capability traits, and runs the interrupt-driven double-buffer
//! protocol that hands finished frames to application buffers.

pub mod capture;
pub mod error;
pub mod pipeline;
pub mod virt;

use serde::{Deserialize, Serialize};

pub use capture::{BufferState, CaptureStream, CapturedFrame, QueueStats, StreamPhase};
pub use error::{ConfigError, HwError, StreamError};
pub use pipeline::{
    ActiveFormat, FormatTable, PipelineDescriptor, PipelineHw, PixelFormat, Rect, StageId,
    VideoSourceInfo,
};

/// Bitmask of pipeline pieces a previous owner (bootloader or sibling
/// driver) left running; flagged pieces are neither re-initialized on
/// start nor torn down on stop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoverFlags(pub u32);

impl HandoverFlags {
    pub const NONE: HandoverFlags = HandoverFlags(0);
    /// The external source is already powered and streaming.
    pub const SOURCE_RUNNING: HandoverFlags = HandoverFlags(1 << 0);
    /// The pipeline stages are already out of reset and configured.
    pub const DEVICE_RUNNING: HandoverFlags = HandoverFlags(1 << 1);

    pub fn contains(self, other: HandoverFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: HandoverFlags) -> HandoverFlags {
        HandoverFlags(self.0 | other.0)
    }
}

/// Empirical pacing values, kept configurable rather than baked in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    /// Wait before the first source status query, for sources that need
    /// time to lock after power-up.
    pub stabilization_delay_ms: u64,
    pub status_retries: u32,
    pub status_retry_delay_ms: u64,
    /// Bound on the writer quiesce poll at stop.
    pub stop_poll_iterations: u32,
    pub stop_poll_delay_ms: u64,
    /// Warm-up epochs before an interlaced stream arms its first buffer.
    pub warmup_interlaced: u32,
    /// Write-address samples taken by the transport liveness probe.
    pub liveness_samples: u32,
    pub liveness_interval_ms: u64,
    /// How long the writer is parked on the spare buffer during a
    /// last-frame snapshot.
    pub snapshot_settle_ms: u64,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            stabilization_delay_ms: 0,
            status_retries: 3,
            status_retry_delay_ms: 20,
            stop_poll_iterations: 10,
            stop_poll_delay_ms: 20,
            warmup_interlaced: 5, // several fields for motion-adaptive deinterlace
            liveness_samples: 4,
            liveness_interval_ms: 20,
            snapshot_settle_ms: 50,
        }
    }
}

/// Per-stream configuration, injected at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Read region at the front-end; zero-sized means full source frame.
    pub crop: Rect,
    /// Write region at the compositor; zero-sized means full destination.
    pub compose: Rect,
    /// Device address the buffer pool is laid out behind.
    pub buffer_base: u64,
    /// Spare region the last-frame snapshot writes into; 0 disables it.
    pub snapshot_base: u64,
    /// Skip arming on epochs the hardware flags as corrupted.
    pub drop_corrupted: bool,
    pub handover: HandoverFlags,
    #[serde(default)]
    pub formats: FormatTable,
    #[serde(default)]
    pub tuning: TuningConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            format: PixelFormat::Yuyv,
            width: 1280,
            height: 720,
            crop: Rect::default(),
            compose: Rect::default(),
            buffer_base: 0x4000_0000,
            snapshot_base: 0x4f00_0000,
            drop_corrupted: false,
            handover: HandoverFlags::NONE,
            formats: FormatTable::default(),
            tuning: TuningConfig::default(),
        }
    }
}
