/// WebSocket RPC 错误定义

use serde::{Deserialize, Serialize};
use std::fmt;

/// RPC 错误码
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RpcErrorCode {
    // 通用错误
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    SerializationError,

    // 业务错误
    InstanceNotFound,
    InstanceAlreadyExists,
    InvalidStateTransition,
    SpawnFailed,
    MigrationPreCheckFailed,
    MigrationFailed,
    TransportError,
    NotSupported,
    HypervisorError,
    StorageError,
}

impl RpcErrorCode {
    /// 转换为字符串码
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::MethodNotFound => "METHOD_NOT_FOUND",
            Self::InvalidParams => "INVALID_PARAMS",
            Self::InternalError => "INTERNAL_ERROR",
            Self::SerializationError => "SERIALIZATION_ERROR",

            Self::InstanceNotFound => "INSTANCE_NOT_FOUND",
            Self::InstanceAlreadyExists => "INSTANCE_ALREADY_EXISTS",
            Self::InvalidStateTransition => "INVALID_STATE_TRANSITION",
            Self::SpawnFailed => "SPAWN_FAILED",
            Self::MigrationPreCheckFailed => "MIGRATION_PRECHECK_FAILED",
            Self::MigrationFailed => "MIGRATION_FAILED",
            Self::TransportError => "TRANSPORT_ERROR",
            Self::NotSupported => "NOT_SUPPORTED",
            Self::HypervisorError => "HYPERVISOR_ERROR",
            Self::StorageError => "STORAGE_ERROR",
        }
    }
}

impl fmt::Display for RpcErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// RPC 错误
#[derive(Debug, Clone)]
pub struct RpcError {
    pub code: RpcErrorCode,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl RpcError {
    /// 创建新的 RPC 错误
    pub fn new(code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// 方法不存在错误
    pub fn method_not_found(method: impl Into<String>) -> Self {
        Self::new(
            RpcErrorCode::MethodNotFound,
            format!("方法不存在: {}", method.into()),
        )
    }

    /// 参数错误
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::InvalidParams, message)
    }

    /// 序列化错误
    pub fn serialization_error(err: impl fmt::Display) -> Self {
        Self::new(
            RpcErrorCode::SerializationError,
            format!("序列化错误: {}", err),
        )
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization_error(err)
    }
}

impl From<crate::Error> for RpcError {
    fn from(err: crate::Error) -> Self {
        use crate::Error;

        let code = match &err {
            Error::NotFound(_) => RpcErrorCode::InstanceNotFound,
            Error::AlreadyExists(_) => RpcErrorCode::InstanceAlreadyExists,
            Error::InvalidArgument(_) => RpcErrorCode::InvalidParams,
            Error::InvalidStateTransition(_) => RpcErrorCode::InvalidStateTransition,
            Error::Spawn(_) => RpcErrorCode::SpawnFailed,
            Error::MigrationPreCheck(_) => RpcErrorCode::MigrationPreCheckFailed,
            Error::MigrationExecution(_) => RpcErrorCode::MigrationFailed,
            Error::Transport(_) => RpcErrorCode::TransportError,
            Error::NotSupported(_) => RpcErrorCode::NotSupported,
            Error::Hypervisor(_) => RpcErrorCode::HypervisorError,
            Error::Storage(_) => RpcErrorCode::StorageError,
            Error::Serialization(_) => RpcErrorCode::SerializationError,
            Error::Config(_) | Error::Internal(_) | Error::Other(_) => RpcErrorCode::InternalError,
        };
        Self::new(code, err.to_string())
    }
}

impl From<RpcError> for crate::Error {
    fn from(err: RpcError) -> Self {
        crate::Error::Internal(err.to_string())
    }
}
