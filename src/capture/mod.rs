pub mod device;
pub mod frame;
pub mod source;

pub use device::{AcceptAllProbe, DeviceProbe, DeviceRegistry, V4l2Probe, ValidationReport};
pub use frame::{Frame, FrameMeta};
pub use source::{
    FrameSource, SourceFactory, TestPatternFactory, TestPatternSource, V4l2Source,
    V4l2SourceFactory,
};
