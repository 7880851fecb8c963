pub mod driver;
pub mod frame;
pub mod mock;
pub mod pool;
pub mod v4l2;

pub use driver::{StreamObserver, UvcDriver};
pub use frame::{FrameBuffer, FrameDisposition, PixelFormat, StreamEvent, StreamHandle};
pub use mock::MockDriver;
pub use pool::FrameBufferPool;
pub use v4l2::V4l2Driver;
