use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Hardware planes a single frame buffer can span.
pub const MAX_PLANES: usize = 3;

/// Lifecycle of an application buffer as seen by the capture core.
///
/// `QueuedIncoming` buffers belong to the incoming queue; ownership moves
/// to the completion path the moment a buffer goes `Done` or `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferState {
    Idle,
    QueuedIncoming,
    Active,
    Done,
    Error,
}

impl BufferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, BufferState::Done | BufferState::Error)
    }
}

/// Device addresses of each plane of one buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaneAddrs {
    pub addrs: [u64; MAX_PLANES],
    pub count: usize,
}

impl PlaneAddrs {
    pub fn single(addr: u64) -> Self {
        Self { addrs: [addr, 0, 0], count: 1 }
    }

    pub fn base(&self) -> u64 {
        self.addrs[0]
    }
}

/// One slot of the buffer pool.
#[derive(Debug, Clone, Copy)]
pub struct FrameBuffer {
    pub index: usize,
    pub planes: PlaneAddrs,
    pub state: BufferState,
}

impl FrameBuffer {
    pub fn new(index: usize, planes: PlaneAddrs) -> Self {
        Self { index, planes, state: BufferState::Idle }
    }
}

/// What the completion path hands back to the application for one buffer.
#[derive(Debug, Clone, Copy)]
pub struct CapturedFrame {
    pub index: usize,
    /// `Done` for a good capture, `Error` otherwise.
    pub state: BufferState,
    /// Monotonically increasing per stream start; only meaningful on `Done`.
    pub sequence: u32,
    pub timestamp: Instant,
}
