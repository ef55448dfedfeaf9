/// 错误类型定义

use thiserror::Error;

/// 统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("资源已存在: {0}")]
    AlreadyExists(String),

    #[error("无效参数: {0}")]
    InvalidArgument(String),

    /// 当前状态下不允许该操作（包括同一实例已有操作在进行中）
    #[error("无效的状态转换: {0}")]
    InvalidStateTransition(String),

    /// 创建虚拟机失败，返回前已清理残留资源
    #[error("创建虚拟机失败: {0}")]
    Spawn(String),

    /// 迁移前置检查失败，两端均未产生副作用
    #[error("迁移前置检查失败: {0}")]
    MigrationPreCheck(String),

    /// 迁移执行失败，返回前已执行回滚
    #[error("迁移执行失败: {0}")]
    MigrationExecution(String),

    /// 与 hypervisor 管理接口通信失败（区别于业务错误）
    #[error("传输错误: {0}")]
    Transport(String),

    #[error("不支持的操作: {0}")]
    NotSupported(String),

    #[error("虚拟化错误: {0}")]
    Hypervisor(String),

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("内部错误: {0}")]
    Internal(String),

    #[error("其他错误: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// 是否为资源不存在错误
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// 是否为传输层错误
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

/// 统一结果类型
pub type Result<T> = std::result::Result<T, Error>;
