/// Hypervisor 管理网关抽象
///
/// 编排器和迁移协调器只通过该接口访问 hypervisor。所有调用都是同步往返，
/// 网关本身不提供事务语义；传输失败返回 `Error::Transport`，与业务错误区分。

use async_trait::async_trait;
use common::models::{ExportedDisk, InjectedFile, NetworkEndpoint, PowerState};
use common::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 电源操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PowerAction {
    /// 启动；从暂停或挂起状态恢复运行
    Start,
    /// 强制断电
    Stop,
    /// 请求客户机正常关机（不等待结果）
    Shutdown,
    /// 请求客户机重启（依赖客户机代理）
    Reboot,
    /// 强制复位
    Reset,
    Pause,
    Suspend,
}

impl std::fmt::Display for PowerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PowerAction::Start => "start",
            PowerAction::Stop => "stop",
            PowerAction::Shutdown => "shutdown",
            PowerAction::Reboot => "reboot",
            PowerAction::Reset => "reset",
            PowerAction::Pause => "pause",
            PowerAction::Suspend => "suspend",
        };
        f.write_str(s)
    }
}

/// 挂载到虚拟机上的磁盘
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedDisk {
    pub disk_id: String,
    pub path: String,
    pub format: String,
    pub boot: bool,
}

/// 网关返回的虚拟机快照
#[derive(Debug, Clone)]
pub struct VmHandle {
    pub id: Uuid,
    pub name: String,
    pub power_state: PowerState,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub cpu_time_ns: u64,
    pub disks: Vec<AttachedDisk>,
}

impl VmHandle {
    /// 查找指定磁盘
    pub fn disk(&self, disk_id: &str) -> Option<&AttachedDisk> {
        self.disks.iter().find(|d| d.disk_id == disk_id)
    }
}

/// 配置驱动器内容（注入文件与管理员密码）
#[derive(Debug, Clone, Default)]
pub struct ConfigDrive {
    pub injected_files: Vec<InjectedFile>,
    pub admin_password: Option<String>,
}

/// 创建虚拟机的规格
#[derive(Debug, Clone)]
pub struct VmSpec {
    pub id: Uuid,
    pub name: String,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub disks: Vec<AttachedDisk>,
    pub nics: Vec<NetworkEndpoint>,
    pub config_drive: Option<ConfigDrive>,
}

/// 主机虚拟化能力
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySet {
    pub host: String,
    pub hypervisor_type: String,
    pub hypervisor_version: u64,
    pub cpu_features: Vec<String>,
    pub live_migration_enabled: bool,
}

#[async_trait]
pub trait HypervisorGateway: Send + Sync + 'static {
    /// 本网关所在主机名
    fn host(&self) -> &str;

    /// 查询虚拟机，不存在时返回 `Error::NotFound`
    async fn get_instance(&self, id: Uuid) -> Result<VmHandle>;

    /// 列出本机全部虚拟机
    async fn list_instances(&self) -> Result<Vec<VmHandle>>;

    /// 定义虚拟机（不启动）
    async fn create_instance(&self, spec: &VmSpec) -> Result<VmHandle>;

    /// 删除虚拟机对象，可选删除其磁盘
    async fn destroy_instance(&self, id: Uuid, destroy_disks: bool) -> Result<()>;

    async fn set_power_state(&self, id: Uuid, action: PowerAction) -> Result<()>;

    async fn attach_disk(&self, id: Uuid, disk: &AttachedDisk) -> Result<()>;

    async fn detach_disk(&self, id: Uuid, disk_id: &str) -> Result<()>;

    /// 导出虚拟机全部磁盘（虚拟机需处于关机状态）
    async fn export_disks(&self, id: Uuid) -> Result<Vec<ExportedDisk>>;

    /// 导入磁盘并挂载到虚拟机，返回本机上的磁盘
    async fn import_disk(&self, id: Uuid, disk: &ExportedDisk) -> Result<AttachedDisk>;

    async fn resize_disk(&self, id: Uuid, disk_id: &str, new_size_gb: u64) -> Result<()>;

    async fn query_capabilities(&self) -> Result<CapabilitySet>;

    /// 将运行中的虚拟机热迁移到目标主机
    async fn live_migrate(&self, id: Uuid, dest: &str) -> Result<()>;

    /// 检查虚拟机是否存在
    async fn exists(&self, id: Uuid) -> Result<bool> {
        match self.get_instance(id).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// 查询虚拟机当前电源状态
    async fn power_state(&self, id: Uuid) -> Result<PowerState> {
        Ok(self.get_instance(id).await?.power_state)
    }
}
