pub mod frame;
pub mod queue;
pub mod state;
pub mod stream;

pub use frame::{BufferState, CapturedFrame, FrameBuffer, PlaneAddrs};
pub use queue::{BufferQueue, QueueStats};
pub use state::StreamPhase;
pub use stream::{CaptureStream, LastFrame};
