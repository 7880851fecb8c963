pub mod dispatch;
pub mod events;
pub mod queue;
pub mod session;

pub use dispatch::{CallbackRegistry, FrameCallback, FrameDispatcher, FrameSink};
pub use events::StreamEventSink;
pub use queue::{FrameHandoffQueue, QueueStats};
pub use session::{ConnectionState, DeviceSession, SessionHandle, SessionStats};
