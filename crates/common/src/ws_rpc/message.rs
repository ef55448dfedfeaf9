/// WebSocket RPC 消息信封

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::RpcError;

/// RPC 消息类型
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// 请求消息（期望响应）
    Request,
    /// 响应消息
    Response,
    /// 通知消息（不需要响应）
    Notification,
}

/// RPC 消息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcMessage {
    /// 消息唯一ID
    pub id: String,

    /// 消息类型
    #[serde(rename = "type")]
    pub message_type: MessageType,

    /// RPC 方法名（request/notification 时必需）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// 消息负载
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,

    /// 错误信息（仅 response 时可能有值）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorInfo>,
}

/// RPC 错误信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorInfo {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl RpcMessage {
    /// 创建请求消息
    pub fn request(method: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: format!("req-{}", Uuid::new_v4()),
            message_type: MessageType::Request,
            method: Some(method.into()),
            payload: Some(payload),
            error: None,
        }
    }

    /// 创建响应消息
    pub fn response(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            message_type: MessageType::Response,
            method: None,
            payload: Some(payload),
            error: None,
        }
    }

    /// 创建错误响应消息
    pub fn error_response(
        id: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: id.into(),
            message_type: MessageType::Response,
            method: None,
            payload: None,
            error: Some(RpcErrorInfo {
                code: code.into(),
                message: message.into(),
                details,
            }),
        }
    }

    /// 根据处理结果构造响应
    pub fn from_result(
        id: impl Into<String>,
        result: Result<serde_json::Value, RpcError>,
    ) -> Self {
        match result {
            Ok(payload) => Self::response(id, payload),
            Err(err) => Self::error_response(id, err.code.as_str(), err.message, err.details),
        }
    }

    /// 创建通知消息
    pub fn notification(method: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: format!("notif-{}", Uuid::new_v4()),
            message_type: MessageType::Notification,
            method: Some(method.into()),
            payload: Some(payload),
            error: None,
        }
    }

    /// 序列化为 JSON 字符串
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// 从 JSON 字符串反序列化
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// 判断是否是成功响应
    pub fn is_success(&self) -> bool {
        self.message_type == MessageType::Response && self.error.is_none()
    }

    /// 判断是否是错误响应
    pub fn is_error(&self) -> bool {
        self.message_type == MessageType::Response && self.error.is_some()
    }
}
