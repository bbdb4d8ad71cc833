pub mod convert;
pub mod frame;
pub mod source;

pub use frame::{ColorSpace, Frame, FrameMetadata, FrameShape, MediaFrame, PixelFormat, TimeBase};
pub use source::{FrameSource, ImageSequenceSource};
