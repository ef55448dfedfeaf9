/// WebSocket RPC 数据类型定义
///
/// 每个驱动操作对应一个请求结构

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{
    BlockDevice, ComputeNodeInfo, Flavor, ImageMeta, InjectedFile, Instance, InstanceState,
    LiveMigrationCheckData, Migration, MigrationDiskInfo, NetworkEndpoint, RebootType,
};

fn default_true() -> bool {
    true
}

// ============================================================================
// Agent 注册
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub node_id: String,
    pub hostname: String,
    pub ip_address: String,
}

// ============================================================================
// 通用响应
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<InstanceState>,
}

// ============================================================================
// 实例生命周期
// ============================================================================

/// 只需要实例本身的操作（pause/unpause/suspend/resume/get_info/unrescue 等）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRequest {
    pub instance: Instance,
    #[serde(default)]
    pub network_info: Vec<NetworkEndpoint>,
    #[serde(default)]
    pub block_device_info: Vec<BlockDevice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub instance: Instance,
    pub image: ImageMeta,
    #[serde(default)]
    pub injected_files: Vec<InjectedFile>,
    #[serde(default)]
    pub admin_password: Option<String>,
    #[serde(default)]
    pub network_info: Vec<NetworkEndpoint>,
    #[serde(default)]
    pub block_device_info: Vec<BlockDevice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyRequest {
    pub instance: Instance,
    #[serde(default)]
    pub network_info: Vec<NetworkEndpoint>,
    #[serde(default)]
    pub block_device_info: Vec<BlockDevice>,
    #[serde(default = "default_true")]
    pub destroy_disks: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebootRequest {
    pub instance: Instance,
    #[serde(default)]
    pub network_info: Vec<NetworkEndpoint>,
    pub reboot_type: RebootType,
}

/// timeout/retry_interval 为 0 表示立即强制关机
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerOffRequest {
    pub instance: Instance,
    #[serde(default)]
    pub timeout: u64,
    #[serde(default)]
    pub retry_interval: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RescueRequest {
    pub instance: Instance,
    #[serde(default)]
    pub network_info: Vec<NetworkEndpoint>,
    pub rescue_image: ImageMeta,
    #[serde(default)]
    pub rescue_password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub instance: Instance,
    pub image_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeRequest {
    pub instance: Instance,
    pub connection_info: BlockDevice,
    #[serde(default)]
    pub mountpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManageImageCacheRequest {
    pub all_instances: Vec<Instance>,
}

// ============================================================================
// 热迁移
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckLiveMigrateDestinationRequest {
    pub instance: Instance,
    pub src_compute_info: ComputeNodeInfo,
    pub dst_compute_info: ComputeNodeInfo,
    #[serde(default)]
    pub block_migration: bool,
    #[serde(default)]
    pub disk_over_commit: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckLiveMigrateSourceRequest {
    pub instance: Instance,
    pub dest_check_data: LiveMigrationCheckData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreLiveMigrationRequest {
    pub instance: Instance,
    #[serde(default)]
    pub block_device_info: Vec<BlockDevice>,
    #[serde(default)]
    pub network_info: Vec<NetworkEndpoint>,
    #[serde(default)]
    pub migrate_data: Option<LiveMigrationCheckData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveMigrationRequest {
    pub instance: Instance,
    pub dest: String,
    #[serde(default)]
    pub block_migration: bool,
    #[serde(default)]
    pub migrate_data: Option<LiveMigrationCheckData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostLiveMigrationAtDestinationRequest {
    pub instance: Instance,
    #[serde(default)]
    pub network_info: Vec<NetworkEndpoint>,
    #[serde(default)]
    pub block_migration: bool,
}

/// 热迁移结束后 Agent 发给控制端的通知
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveMigrationNotification {
    pub instance_id: Uuid,
    pub dest: String,
    pub block_migration: bool,
    pub success: bool,
    pub message: String,
}

// ============================================================================
// 冷迁移 / 变更规格
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateDiskAndPowerOffRequest {
    pub instance: Instance,
    pub dest: String,
    pub flavor: Flavor,
    #[serde(default)]
    pub network_info: Vec<NetworkEndpoint>,
    #[serde(default)]
    pub block_device_info: Vec<BlockDevice>,
    #[serde(default)]
    pub timeout: u64,
    #[serde(default)]
    pub retry_interval: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishMigrationRequest {
    pub migration: Migration,
    pub instance: Instance,
    pub disk_info: MigrationDiskInfo,
    #[serde(default)]
    pub network_info: Vec<NetworkEndpoint>,
    pub image_meta: ImageMeta,
    #[serde(default)]
    pub resize_instance: bool,
    #[serde(default)]
    pub block_device_info: Vec<BlockDevice>,
    #[serde(default = "default_true")]
    pub power_on: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmMigrationRequest {
    pub migration: Migration,
    pub instance: Instance,
    #[serde(default)]
    pub network_info: Vec<NetworkEndpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishRevertMigrationRequest {
    pub instance: Instance,
    #[serde(default)]
    pub network_info: Vec<NetworkEndpoint>,
    #[serde(default)]
    pub block_device_info: Vec<BlockDevice>,
    #[serde(default = "default_true")]
    pub power_on: bool,
}
