/// WebSocket RPC 模块
///
/// Agent 与控制端之间基于 WebSocket 的双向 RPC 消息定义

pub mod message;
pub mod error;
pub mod types;

pub use message::{RpcMessage, MessageType};
pub use error::{RpcError, RpcErrorCode};
pub use types::*;
