/// 共享数据模型
///
/// 定义 Agent 与控制端共享的实例、迁移、事件数据结构

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 实例生命周期状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    NotExist,
    Spawning,
    Running,
    Paused,
    Suspended,
    PoweredOff,
    Rescuing,
    Rescued,
    Unrescuing,
    Destroying,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::NotExist => "not_exist",
            InstanceState::Spawning => "spawning",
            InstanceState::Running => "running",
            InstanceState::Paused => "paused",
            InstanceState::Suspended => "suspended",
            InstanceState::PoweredOff => "powered_off",
            InstanceState::Rescuing => "rescuing",
            InstanceState::Rescued => "rescued",
            InstanceState::Unrescuing => "unrescuing",
            InstanceState::Destroying => "destroying",
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// hypervisor 上报的电源状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    Running,
    Paused,
    Suspended,
    Stopped,
}

impl PowerState {
    /// 映射为实例生命周期状态
    pub fn to_instance_state(self) -> InstanceState {
        match self {
            PowerState::Running => InstanceState::Running,
            PowerState::Paused => InstanceState::Paused,
            PowerState::Suspended => InstanceState::Suspended,
            PowerState::Stopped => InstanceState::PoweredOff,
        }
    }
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PowerState::Running => "running",
            PowerState::Paused => "paused",
            PowerState::Suspended => "suspended",
            PowerState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// 重启类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RebootType {
    /// 向客户机发送重启信号（尽力而为）
    Soft,
    /// 直接对虚拟机断电重启
    Hard,
}

/// 迁移类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MigrationType {
    Live,
    Cold,
    Resize,
}

/// 块设备描述
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockDevice {
    /// 卷ID，同时作为磁盘序列号
    pub volume_id: String,
    pub path: String,
    #[serde(default = "default_disk_format")]
    pub format: String,
    /// 是否为启动盘（从卷启动）
    #[serde(default)]
    pub boot: bool,
}

fn default_disk_format() -> String {
    "qcow2".to_string()
}

/// 网络端点描述
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkEndpoint {
    pub id: String,
    pub bridge_name: String,
    pub mac_address: Option<String>,
    #[serde(default)]
    pub model: String,
}

/// 规格
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Flavor {
    pub name: String,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub root_gb: u64,
}

/// 镜像元数据
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageMeta {
    pub id: String,
    #[serde(default = "default_disk_format")]
    pub disk_format: String,
}

/// 注入到客户机的文件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InjectedFile {
    pub path: String,
    pub contents: String,
}

/// 实例（编排器视角的虚拟机）
///
/// `state` 只是调用方记录的状态，编排器每次操作都会重新向 hypervisor 查询。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Instance {
    pub uuid: Uuid,
    pub name: String,
    pub state: InstanceState,
    pub host: Option<String>,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub root_gb: u64,
    #[serde(default)]
    pub image_ref: Option<String>,
    #[serde(default)]
    pub block_devices: Vec<BlockDevice>,
    #[serde(default)]
    pub network_endpoints: Vec<NetworkEndpoint>,
}

impl Instance {
    /// 创建一个尚未存在于 hypervisor 上的实例描述
    pub fn new(name: impl Into<String>, vcpus: u32, memory_mb: u64, root_gb: u64) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            state: InstanceState::NotExist,
            host: None,
            vcpus,
            memory_mb,
            root_gb,
            image_ref: None,
            block_devices: Vec::new(),
            network_endpoints: Vec::new(),
        }
    }

    /// 是否从卷启动
    pub fn is_boot_from_volume(block_devices: &[BlockDevice]) -> bool {
        block_devices.iter().any(|d| d.boot)
    }
}

/// 实例运行信息（get_info 返回值）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceInfo {
    pub state: InstanceState,
    pub max_mem_kb: u64,
    pub mem_kb: u64,
    pub num_cpu: u32,
    pub cpu_time_ns: u64,
}

/// hypervisor 异步状态变化事件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostEvent {
    pub instance_id: Uuid,
    pub state: PowerState,
    /// 监听器内单调递增的序号
    pub sequence: u64,
    pub timestamp: i64,
}

/// 计算节点信息（迁移前置检查使用）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComputeNodeInfo {
    pub host: String,
    pub hypervisor_type: String,
    pub hypervisor_version: u64,
    #[serde(default)]
    pub cpu_features: Vec<String>,
    pub free_memory_mb: u64,
    pub free_disk_gb: u64,
}

/// 迁移记录（冷迁移/变更规格）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Migration {
    pub id: String,
    pub instance_id: Uuid,
    pub source_host: String,
    pub dest_host: String,
    pub migration_type: MigrationType,
}

/// 目标端热迁移前置检查结果，由目标端产生、源端消费
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LiveMigrationCheckData {
    pub dest_host: String,
    pub block_migration: bool,
    pub disk_over_commit: bool,
    pub hypervisor_type: String,
    pub hypervisor_version: u64,
    #[serde(default)]
    pub cpu_features: Vec<String>,
}

/// 导出的磁盘
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportedDisk {
    pub disk_id: String,
    pub path: String,
    pub format: String,
    pub size_bytes: u64,
    /// 是否为启动盘
    #[serde(default)]
    pub boot: bool,
}

/// 冷迁移磁盘描述，由源端 migrate_disk_and_power_off 产生，目标端 finish_migration 消费
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationDiskInfo {
    pub instance_id: Uuid,
    pub source_host: String,
    pub disks: Vec<ExportedDisk>,
}

/// 常量定义
pub mod constants {
    /// 默认心跳间隔（秒）
    pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 30;

    /// 默认事件轮询间隔（秒）
    pub const DEFAULT_EVENT_POLL_INTERVAL: u64 = 2;

    /// 基础镜像默认保留时长（秒）
    pub const DEFAULT_IMAGE_CACHE_MAX_AGE: u64 = 86400;

    /// 救援盘的磁盘ID后缀
    pub const RESCUE_DISK_SUFFIX: &str = "rescue";

    /// 根盘的磁盘ID后缀
    pub const ROOT_DISK_SUFFIX: &str = "root";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_state_mapping() {
        assert_eq!(PowerState::Running.to_instance_state(), InstanceState::Running);
        assert_eq!(PowerState::Stopped.to_instance_state(), InstanceState::PoweredOff);
        assert_eq!(PowerState::Suspended.to_instance_state(), InstanceState::Suspended);
    }

    #[test]
    fn test_instance_state_serde() {
        let json = serde_json::to_string(&InstanceState::PoweredOff).unwrap();
        assert_eq!(json, "\"powered_off\"");
        let state: InstanceState = serde_json::from_str("\"not_exist\"").unwrap();
        assert_eq!(state, InstanceState::NotExist);
    }

    #[test]
    fn test_boot_from_volume() {
        let mut devices = vec![BlockDevice {
            volume_id: "vol-1".to_string(),
            path: "/dev/sdb".to_string(),
            format: "raw".to_string(),
            boot: false,
        }];
        assert!(!Instance::is_boot_from_volume(&devices));
        devices[0].boot = true;
        assert!(Instance::is_boot_from_volume(&devices));
    }
}
