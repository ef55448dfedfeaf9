/// WebSocket 客户端
///
/// Agent 连接到控制端的 WebSocket 客户端：注册、心跳、断线重连

use common::ws_rpc::{MessageType, RegisterRequest, RpcMessage};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::handler::RpcHandlerRegistry;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// WebSocket 客户端状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Registered,
}

/// WebSocket 客户端
#[derive(Clone)]
pub struct WsClient {
    server_url: String,

    /// 注册信息
    registration: RegisterRequest,

    state: Arc<RwLock<ClientState>>,

    handler_registry: Arc<RpcHandlerRegistry>,

    /// 重连间隔（秒）
    reconnect_interval: u64,

    /// 心跳间隔（秒）
    heartbeat_interval: u64,
}

impl WsClient {
    pub fn new(
        server_url: impl Into<String>,
        registration: RegisterRequest,
        heartbeat_interval: u64,
        handler_registry: Arc<RpcHandlerRegistry>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            registration,
            state: Arc::new(RwLock::new(ClientState::Disconnected)),
            handler_registry,
            reconnect_interval: 5,
            heartbeat_interval: heartbeat_interval.max(1),
        }
    }

    /// 启动客户端（连接并保持）
    pub async fn run(&self) -> Result<(), BoxError> {
        loop {
            info!("尝试连接到 Server: {}", self.server_url);

            match self.connect_and_run().await {
                Ok(_) => info!("连接正常关闭"),
                Err(e) => error!("连接错误: {}", e),
            }

            self.handler_registry.notifier().clear_sender();
            self.set_state(ClientState::Disconnected).await;

            warn!("{}秒后重新连接...", self.reconnect_interval);
            tokio::time::sleep(Duration::from_secs(self.reconnect_interval)).await;
        }
    }

    async fn set_state(&self, state: ClientState) {
        *self.state.write().await = state;
    }

    async fn connect_and_run(&self) -> Result<(), BoxError> {
        self.set_state(ClientState::Connecting).await;

        let (ws_stream, _) = connect_async(&self.server_url).await?;
        info!("✅ WebSocket 连接成功");
        self.set_state(ClientState::Connected).await;

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        // 注册
        let register_msg = RpcMessage::request("register", serde_json::to_value(&self.registration)?);
        ws_sender.send(Message::Text(register_msg.to_json()?)).await?;
        debug!("已发送注册请求: node_id={}", self.registration.node_id);

        match ws_receiver.next().await {
            Some(msg) => {
                let rpc_msg = parse_message(msg?)?;
                if !rpc_msg.is_success() {
                    let reason = rpc_msg
                        .error
                        .map(|e| e.message)
                        .unwrap_or_else(|| "未知原因".to_string());
                    return Err(format!("注册失败: {}", reason).into());
                }
                info!("✅ 注册成功: {}", self.registration.hostname);
                self.set_state(ClientState::Registered).await;
            }
            None => return Err("注册响应前连接已关闭".into()),
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<RpcMessage>();
        self.handler_registry.notifier().set_sender(tx.clone());

        // 心跳
        let tx_heartbeat = tx.clone();
        let heartbeat_interval = self.heartbeat_interval;
        let heartbeat_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(heartbeat_interval));
            loop {
                interval.tick().await;
                let heartbeat_msg = RpcMessage::notification(
                    "heartbeat",
                    serde_json::json!({ "timestamp": chrono::Utc::now().timestamp() }),
                );
                if tx_heartbeat.send(heartbeat_msg).is_err() {
                    break;
                }
                debug!("发送心跳");
            }
        });

        // 发送
        let send_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let json = match msg.to_json() {
                    Ok(j) => j,
                    Err(e) => {
                        error!("序列化消息失败: {}", e);
                        continue;
                    }
                };
                if let Err(e) = ws_sender.send(Message::Text(json)).await {
                    error!("发送消息失败: {}", e);
                    break;
                }
            }
            debug!("发送任务结束");
        });

        // 接收，每个消息独立处理
        let handler_registry = self.handler_registry.clone();
        let recv_task = tokio::spawn(async move {
            while let Some(result) = ws_receiver.next().await {
                match result {
                    Ok(msg) => {
                        let handler_registry = handler_registry.clone();
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            handle_message(msg, &handler_registry, &tx).await;
                        });
                    }
                    Err(e) => {
                        error!("接收消息错误: {}", e);
                        break;
                    }
                }
            }
            debug!("接收任务结束");
        });

        tokio::select! {
            _ = send_task => debug!("发送任务已结束"),
            _ = recv_task => debug!("接收任务已结束"),
        }
        heartbeat_task.abort();

        Ok(())
    }
}

fn parse_message(msg: Message) -> Result<RpcMessage, BoxError> {
    match msg {
        Message::Text(text) => Ok(RpcMessage::from_json(&text)?),
        Message::Binary(data) => Ok(RpcMessage::from_json(&String::from_utf8(data)?)?),
        _ => Err("不支持的消息类型".into()),
    }
}

async fn handle_message(
    msg: Message,
    handler_registry: &RpcHandlerRegistry,
    tx: &mpsc::UnboundedSender<RpcMessage>,
) {
    let rpc_msg = match msg {
        Message::Close(_) => {
            warn!("收到连接关闭消息");
            return;
        }
        Message::Text(_) | Message::Binary(_) => match parse_message(msg) {
            Ok(rpc_msg) => rpc_msg,
            Err(e) => {
                error!("解析消息失败: {}", e);
                return;
            }
        },
        _ => {
            debug!("收到其他类型消息，忽略");
            return;
        }
    };

    debug!("收到消息: type={:?}, method={:?}", rpc_msg.message_type, rpc_msg.method);

    match rpc_msg.message_type {
        MessageType::Request => {
            let response = handler_registry.handle_request(rpc_msg).await;
            if let Err(e) = tx.send(response) {
                error!("发送响应失败: {}", e);
            }
        }
        MessageType::Response => {
            debug!("收到 Server 响应: id={}", rpc_msg.id);
        }
        MessageType::Notification => {
            let Some(method) = rpc_msg.method.clone() else {
                error!("通知缺少方法名");
                return;
            };
            let payload = rpc_msg.payload.unwrap_or(serde_json::Value::Null);
            if let Err(e) = handler_registry.handle_notification(&method, payload).await {
                error!("处理通知失败: method={}, error={}", method, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_binary_message() {
        let msg = RpcMessage::notification("heartbeat", serde_json::json!({ "timestamp": 1 }));
        let data = msg.to_json().unwrap().into_bytes();
        let parsed = parse_message(Message::Binary(data)).unwrap();
        assert_eq!(parsed.method.as_deref(), Some("heartbeat"));
        assert!(parse_message(Message::Ping(Vec::new())).is_err());
    }
}
