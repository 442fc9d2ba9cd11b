pub mod format;
pub mod source;
pub mod stages;

pub use format::{ActiveFormat, FormatTable, HwFormat, PixelFormat, Rect};
pub use source::{negotiate_source, SourceDevice, VideoSourceInfo};
pub use stages::{PipelineDescriptor, PipelineHw, StageId, Topology};
