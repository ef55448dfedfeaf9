/// 配置管理

use common::models::constants;
use serde::Deserialize;
use std::time::Duration;

/// 虚拟化后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HypervisorBackend {
    Memory,
    Libvirt,
}

impl std::str::FromStr for HypervisorBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(HypervisorBackend::Memory),
            "libvirt" => Ok(HypervisorBackend::Libvirt),
            other => Err(anyhow::anyhow!("未知的虚拟化后端: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub node_id: String,
    pub node_name: String,
    pub node_ip: String,
    pub server_ws_url: String,
    pub heartbeat_interval: u64,
    pub log_level: String,
    pub hypervisor_backend: HypervisorBackend,
    pub libvirt_uri: String,
    /// 事件轮询间隔（秒）
    pub event_poll_interval: u64,
    pub image_cache_dir: String,
    pub instances_dir: String,
    /// 未使用的基础镜像保留时长（秒）
    pub image_cache_max_age: u64,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Config {
    /// 从环境变量加载配置
    pub fn from_env() -> anyhow::Result<Self> {
        let node_id = std::env::var("NODE_ID")
            .unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());

        let node_name = std::env::var("NODE_NAME")
            .unwrap_or_else(|_| hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()));

        let heartbeat_interval = env_or(
            "HEARTBEAT_INTERVAL",
            &constants::DEFAULT_HEARTBEAT_INTERVAL.to_string(),
        )
        .parse()?;

        let event_poll_interval = env_or(
            "EVENT_POLL_INTERVAL",
            &constants::DEFAULT_EVENT_POLL_INTERVAL.to_string(),
        )
        .parse()?;

        let image_cache_max_age = env_or(
            "IMAGE_CACHE_MAX_AGE",
            &constants::DEFAULT_IMAGE_CACHE_MAX_AGE.to_string(),
        )
        .parse()?;

        Ok(Self {
            node_id,
            node_name,
            node_ip: env_or("NODE_IP", "127.0.0.1"),
            server_ws_url: env_or("SERVER_WS_URL", "ws://localhost:3000/ws/agent"),
            heartbeat_interval,
            log_level: env_or("LOG_LEVEL", "debug"),
            hypervisor_backend: env_or("HYPERVISOR_BACKEND", "memory").parse()?,
            libvirt_uri: env_or("LIBVIRT_URI", "qemu:///system"),
            event_poll_interval,
            image_cache_dir: env_or("IMAGE_CACHE_DIR", "/var/lib/hv-agent/_base"),
            instances_dir: env_or("INSTANCES_DIR", "/var/lib/hv-agent/instances"),
            image_cache_max_age,
        })
    }

    pub fn event_poll_interval(&self) -> Duration {
        Duration::from_secs(self.event_poll_interval.max(1))
    }
}
