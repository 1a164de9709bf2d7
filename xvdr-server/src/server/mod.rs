//! Server implementation: listener, per-connection handling, commands and
//! status fan-out.

pub mod commands;
pub mod connection;
pub mod listener;
pub mod registry;
pub mod writer;

pub use commands::{BuiltinCommands, CommandHandler};
pub use connection::{Connection, ConnectionContext, Services};
pub use listener::{Server, ServerConfig};
pub use registry::{ConnectionRegistry, StatusEvent};
pub use writer::ClientWriter;
