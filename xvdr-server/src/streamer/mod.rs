//! Live channel streaming.

pub mod live;
pub mod receiver;
pub mod registry;

pub use live::{LiveStreamer, StreamError, StreamerConfig};
pub use receiver::LiveReceiver;
pub use registry::StreamRegistry;
