/// WebSocket 客户端模块
///
/// Agent 通过 WebSocket 连接到控制端

pub mod client;
pub mod handler;

pub use client::WsClient;
pub use handler::{Notifier, RpcHandlerRegistry};
