//! IPC layer: JSON-RPC protocol types, line framing, the stream
//! notification bridge, and the stdio server.

pub mod bridge;
pub mod encoding;
pub mod handler;
pub mod protocol;
pub mod server;

pub use bridge::{BufferPool, Outbound};
pub use encoding::{FramingError, LineBuffer};
pub use handler::RpcHandler;
pub use protocol::{codes, JsonRpcRequest, JsonRpcResponse, RpcError};
pub use server::run_stdio;
