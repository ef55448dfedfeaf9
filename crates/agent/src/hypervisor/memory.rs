/// 内存虚拟化后端
///
/// 不依赖宿主机上的任何虚拟化组件，用于开发环境和测试。
/// 支持一次性故障注入、调用记录、模拟调用延迟、模拟带外电源变化，
/// 多个实例之间可以互联以模拟跨主机热迁移。

use async_trait::async_trait;
use common::models::{ExportedDisk, PowerState};
use common::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use super::gateway::{
    AttachedDisk, CapabilitySet, HypervisorGateway, PowerAction, VmHandle, VmSpec,
};

const GIB: u64 = 1024 * 1024 * 1024;

/// 网关操作类型（用于故障注入）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayOp {
    GetInstance,
    ListInstances,
    CreateInstance,
    DestroyInstance,
    SetPowerState,
    AttachDisk,
    DetachDisk,
    ExportDisks,
    ImportDisk,
    ResizeDisk,
    QueryCapabilities,
    LiveMigrate,
}

/// 调用记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    GetInstance(Uuid),
    ListInstances,
    CreateInstance(Uuid),
    DestroyInstance(Uuid),
    SetPowerState(Uuid, PowerAction),
    AttachDisk(Uuid, String),
    DetachDisk(Uuid, String),
    ExportDisks(Uuid),
    ImportDisk(Uuid, String),
    ResizeDisk(Uuid, String, u64),
    QueryCapabilities,
    LiveMigrate(Uuid, String),
}

impl GatewayCall {
    fn op(&self) -> GatewayOp {
        match self {
            GatewayCall::GetInstance(_) => GatewayOp::GetInstance,
            GatewayCall::ListInstances => GatewayOp::ListInstances,
            GatewayCall::CreateInstance(_) => GatewayOp::CreateInstance,
            GatewayCall::DestroyInstance(_) => GatewayOp::DestroyInstance,
            GatewayCall::SetPowerState(..) => GatewayOp::SetPowerState,
            GatewayCall::AttachDisk(..) => GatewayOp::AttachDisk,
            GatewayCall::DetachDisk(..) => GatewayOp::DetachDisk,
            GatewayCall::ExportDisks(_) => GatewayOp::ExportDisks,
            GatewayCall::ImportDisk(..) => GatewayOp::ImportDisk,
            GatewayCall::ResizeDisk(..) => GatewayOp::ResizeDisk,
            GatewayCall::QueryCapabilities => GatewayOp::QueryCapabilities,
            GatewayCall::LiveMigrate(..) => GatewayOp::LiveMigrate,
        }
    }
}

/// 注入的故障
#[derive(Debug, Clone)]
pub enum InjectedFailure {
    Transport(String),
    Hypervisor(String),
}

impl InjectedFailure {
    fn into_error(self) -> Error {
        match self {
            InjectedFailure::Transport(msg) => Error::Transport(msg),
            InjectedFailure::Hypervisor(msg) => Error::Hypervisor(msg),
        }
    }
}

struct MemoryVm {
    name: String,
    power_state: PowerState,
    vcpus: u32,
    memory_mb: u64,
    cpu_time_ns: u64,
    disks: Vec<AttachedDisk>,
    disk_sizes: HashMap<String, u64>,
    /// 客户机是否响应正常关机请求
    responds_to_shutdown: bool,
    /// 客户机代理是否可用（软重启依赖）
    guest_agent: bool,
}

impl MemoryVm {
    fn handle(&self, id: Uuid) -> VmHandle {
        VmHandle {
            id,
            name: self.name.clone(),
            power_state: self.power_state,
            vcpus: self.vcpus,
            memory_mb: self.memory_mb,
            cpu_time_ns: self.cpu_time_ns,
            disks: self.disks.clone(),
        }
    }
}

#[derive(Default)]
struct MemoryState {
    vms: HashMap<Uuid, MemoryVm>,
    calls: Vec<GatewayCall>,
    failures: HashMap<GatewayOp, VecDeque<InjectedFailure>>,
}

impl MemoryState {
    fn vm_mut(&mut self, id: Uuid) -> Result<&mut MemoryVm> {
        self.vms
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("虚拟机不存在: {}", id)))
    }
}

/// 内存虚拟化后端
pub struct InMemoryHypervisor {
    host: String,
    state: Mutex<MemoryState>,
    capabilities: RwLock<CapabilitySet>,
    peers: RwLock<HashMap<String, Arc<InMemoryHypervisor>>>,
    latency: RwLock<Duration>,
}

impl InMemoryHypervisor {
    pub fn new(host: impl Into<String>) -> Self {
        let host = host.into();
        Self {
            capabilities: RwLock::new(CapabilitySet {
                host: host.clone(),
                hypervisor_type: "memory".to_string(),
                hypervisor_version: 1,
                cpu_features: vec!["sse4_2".to_string(), "avx".to_string()],
                live_migration_enabled: true,
            }),
            host,
            state: Mutex::new(MemoryState::default()),
            peers: RwLock::new(HashMap::new()),
            latency: RwLock::new(Duration::ZERO),
        }
    }

    /// 互联另一台内存主机，用于热迁移
    pub async fn connect_peer(&self, peer: Arc<InMemoryHypervisor>) {
        let mut peers = self.peers.write().await;
        peers.insert(peer.host.clone(), peer);
    }

    /// 设置每次调用的模拟延迟
    pub async fn set_latency(&self, latency: Duration) {
        *self.latency.write().await = latency;
    }

    pub async fn set_capabilities(&self, capabilities: CapabilitySet) {
        *self.capabilities.write().await = capabilities;
    }

    /// 让指定操作的下一次调用失败
    pub async fn inject_failure(&self, op: GatewayOp, failure: InjectedFailure) {
        let mut state = self.state.lock().await;
        state.failures.entry(op).or_default().push_back(failure);
    }

    /// 设置客户机是否响应正常关机请求
    pub async fn set_responds_to_shutdown(&self, id: Uuid, responds: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        state.vm_mut(id)?.responds_to_shutdown = responds;
        Ok(())
    }

    /// 设置客户机代理是否可用
    pub async fn set_guest_agent(&self, id: Uuid, available: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        state.vm_mut(id)?.guest_agent = available;
        Ok(())
    }

    /// 模拟编排器之外发生的电源变化（如客户机崩溃）
    pub async fn set_external_power_state(&self, id: Uuid, power_state: PowerState) -> Result<()> {
        let mut state = self.state.lock().await;
        state.vm_mut(id)?.power_state = power_state;
        Ok(())
    }

    /// 获取调用记录
    pub async fn calls(&self) -> Vec<GatewayCall> {
        self.state.lock().await.calls.clone()
    }

    /// 清空调用记录
    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }

    /// 查询磁盘大小（字节）
    pub async fn disk_size(&self, id: Uuid, disk_id: &str) -> Option<u64> {
        let state = self.state.lock().await;
        state.vms.get(&id).and_then(|vm| vm.disk_sizes.get(disk_id).copied())
    }

    /// 记录调用并检查故障注入
    async fn begin(&self, call: GatewayCall) -> Result<MutexGuardState<'_>> {
        let latency = *self.latency.read().await;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock().await;
        debug!("[{}] 网关调用: {:?}", self.host, call);
        let op = call.op();
        state.calls.push(call);
        if let Some(failure) = state.failures.get_mut(&op).and_then(|q| q.pop_front()) {
            return Err(failure.into_error());
        }
        Ok(state)
    }

    async fn receive_migrated(&self, id: Uuid, vm: MemoryVm) -> std::result::Result<(), MemoryVm> {
        let mut state = self.state.lock().await;
        if state.vms.contains_key(&id) {
            return Err(vm);
        }
        state.vms.insert(id, vm);
        Ok(())
    }
}

type MutexGuardState<'a> = tokio::sync::MutexGuard<'a, MemoryState>;

#[async_trait]
impl HypervisorGateway for InMemoryHypervisor {
    fn host(&self) -> &str {
        &self.host
    }

    async fn get_instance(&self, id: Uuid) -> Result<VmHandle> {
        let mut state = self.begin(GatewayCall::GetInstance(id)).await?;
        Ok(state.vm_mut(id)?.handle(id))
    }

    async fn list_instances(&self) -> Result<Vec<VmHandle>> {
        let state = self.begin(GatewayCall::ListInstances).await?;
        Ok(state.vms.iter().map(|(id, vm)| vm.handle(*id)).collect())
    }

    async fn create_instance(&self, spec: &VmSpec) -> Result<VmHandle> {
        let mut state = self.begin(GatewayCall::CreateInstance(spec.id)).await?;
        if state.vms.contains_key(&spec.id) {
            return Err(Error::AlreadyExists(format!("虚拟机已存在: {}", spec.id)));
        }

        let vm = MemoryVm {
            name: spec.name.clone(),
            power_state: PowerState::Stopped,
            vcpus: spec.vcpus,
            memory_mb: spec.memory_mb,
            cpu_time_ns: 0,
            disk_sizes: spec.disks.iter().map(|d| (d.disk_id.clone(), 0)).collect(),
            disks: spec.disks.clone(),
            responds_to_shutdown: true,
            guest_agent: true,
        };
        let handle = vm.handle(spec.id);
        state.vms.insert(spec.id, vm);
        Ok(handle)
    }

    async fn destroy_instance(&self, id: Uuid, _destroy_disks: bool) -> Result<()> {
        let mut state = self.begin(GatewayCall::DestroyInstance(id)).await?;
        state
            .vms
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("虚拟机不存在: {}", id)))
    }

    async fn set_power_state(&self, id: Uuid, action: PowerAction) -> Result<()> {
        let mut state = self.begin(GatewayCall::SetPowerState(id, action)).await?;
        let vm = state.vm_mut(id)?;

        match action {
            PowerAction::Start => {
                vm.power_state = PowerState::Running;
                vm.cpu_time_ns += 1_000_000;
            }
            PowerAction::Stop => vm.power_state = PowerState::Stopped,
            PowerAction::Shutdown => {
                if vm.responds_to_shutdown {
                    vm.power_state = PowerState::Stopped;
                }
            }
            PowerAction::Reboot => {
                if !vm.guest_agent {
                    return Err(Error::NotSupported("客户机代理不可用，无法软重启".to_string()));
                }
                if vm.power_state != PowerState::Running {
                    return Err(Error::InvalidStateTransition(format!(
                        "虚拟机未运行，当前状态: {}",
                        vm.power_state
                    )));
                }
            }
            PowerAction::Reset => vm.power_state = PowerState::Running,
            PowerAction::Pause => {
                if vm.power_state != PowerState::Running {
                    return Err(Error::InvalidStateTransition(format!(
                        "只能暂停运行中的虚拟机，当前状态: {}",
                        vm.power_state
                    )));
                }
                vm.power_state = PowerState::Paused;
            }
            PowerAction::Suspend => {
                if !matches!(vm.power_state, PowerState::Running | PowerState::Paused) {
                    return Err(Error::InvalidStateTransition(format!(
                        "只能挂起运行中的虚拟机，当前状态: {}",
                        vm.power_state
                    )));
                }
                vm.power_state = PowerState::Suspended;
            }
        }
        Ok(())
    }

    async fn attach_disk(&self, id: Uuid, disk: &AttachedDisk) -> Result<()> {
        let mut state = self
            .begin(GatewayCall::AttachDisk(id, disk.disk_id.clone()))
            .await?;
        let vm = state.vm_mut(id)?;
        if vm.disks.iter().any(|d| d.disk_id == disk.disk_id) {
            return Err(Error::AlreadyExists(format!("磁盘已挂载: {}", disk.disk_id)));
        }
        vm.disk_sizes.entry(disk.disk_id.clone()).or_insert(0);
        vm.disks.push(disk.clone());
        Ok(())
    }

    async fn detach_disk(&self, id: Uuid, disk_id: &str) -> Result<()> {
        let mut state = self
            .begin(GatewayCall::DetachDisk(id, disk_id.to_string()))
            .await?;
        let vm = state.vm_mut(id)?;
        let before = vm.disks.len();
        vm.disks.retain(|d| d.disk_id != disk_id);
        if vm.disks.len() == before {
            return Err(Error::NotFound(format!("磁盘未挂载: {}", disk_id)));
        }
        vm.disk_sizes.remove(disk_id);
        Ok(())
    }

    async fn export_disks(&self, id: Uuid) -> Result<Vec<ExportedDisk>> {
        let mut state = self.begin(GatewayCall::ExportDisks(id)).await?;
        let vm = state.vm_mut(id)?;
        if vm.power_state != PowerState::Stopped {
            return Err(Error::InvalidStateTransition(format!(
                "导出磁盘前虚拟机必须关机，当前状态: {}",
                vm.power_state
            )));
        }

        Ok(vm
            .disks
            .iter()
            .map(|d| ExportedDisk {
                disk_id: d.disk_id.clone(),
                path: d.path.clone(),
                format: d.format.clone(),
                size_bytes: vm.disk_sizes.get(&d.disk_id).copied().unwrap_or(0),
                boot: d.boot,
            })
            .collect())
    }

    async fn import_disk(&self, id: Uuid, disk: &ExportedDisk) -> Result<AttachedDisk> {
        let mut state = self
            .begin(GatewayCall::ImportDisk(id, disk.disk_id.clone()))
            .await?;
        let host = self.host.clone();
        let vm = state.vm_mut(id)?;

        let file_name = disk.path.rsplit('/').next().unwrap_or(&disk.disk_id);
        let attached = AttachedDisk {
            disk_id: disk.disk_id.clone(),
            path: format!("/var/lib/hv-agent/{}/{}/{}", host, id, file_name),
            format: disk.format.clone(),
            boot: disk.boot,
        };
        vm.disks.retain(|d| d.disk_id != disk.disk_id);
        vm.disks.push(attached.clone());
        vm.disk_sizes.insert(disk.disk_id.clone(), disk.size_bytes);
        Ok(attached)
    }

    async fn resize_disk(&self, id: Uuid, disk_id: &str, new_size_gb: u64) -> Result<()> {
        let mut state = self
            .begin(GatewayCall::ResizeDisk(id, disk_id.to_string(), new_size_gb))
            .await?;
        let vm = state.vm_mut(id)?;
        let current = vm
            .disk_sizes
            .get_mut(disk_id)
            .ok_or_else(|| Error::NotFound(format!("磁盘未挂载: {}", disk_id)))?;
        let new_size = new_size_gb * GIB;
        if new_size < *current {
            return Err(Error::InvalidArgument(format!(
                "不支持缩小磁盘: {} -> {}GB",
                disk_id, new_size_gb
            )));
        }
        *current = new_size;
        Ok(())
    }

    async fn query_capabilities(&self) -> Result<CapabilitySet> {
        drop(self.begin(GatewayCall::QueryCapabilities).await?);
        Ok(self.capabilities.read().await.clone())
    }

    async fn live_migrate(&self, id: Uuid, dest: &str) -> Result<()> {
        let vm = {
            let mut state = self
                .begin(GatewayCall::LiveMigrate(id, dest.to_string()))
                .await?;
            let vm = state.vm_mut(id)?;
            if !matches!(vm.power_state, PowerState::Running | PowerState::Paused) {
                return Err(Error::InvalidStateTransition(format!(
                    "只能热迁移运行中的虚拟机，当前状态: {}",
                    vm.power_state
                )));
            }
            if !self.peers.read().await.contains_key(dest) {
                return Err(Error::Transport(format!("无法连接到目标主机: {}", dest)));
            }
            state
                .vms
                .remove(&id)
                .ok_or_else(|| Error::NotFound(format!("虚拟机不存在: {}", id)))?
        };

        let peer = self.peers.read().await.get(dest).cloned();
        let peer = match peer {
            Some(peer) => peer,
            None => {
                self.state.lock().await.vms.insert(id, vm);
                return Err(Error::Transport(format!("无法连接到目标主机: {}", dest)));
            }
        };

        if let Err(vm) = peer.receive_migrated(id, vm).await {
            self.state.lock().await.vms.insert(id, vm);
            return Err(Error::Hypervisor(format!("目标主机上已存在同名虚拟机: {}", id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: Uuid) -> VmSpec {
        VmSpec {
            id,
            name: "test-vm".to_string(),
            vcpus: 1,
            memory_mb: 512,
            disks: vec![AttachedDisk {
                disk_id: format!("{}-root", id),
                path: "/images/root.qcow2".to_string(),
                format: "qcow2".to_string(),
                boot: true,
            }],
            nics: Vec::new(),
            config_drive: None,
        }
    }

    #[tokio::test]
    async fn test_injected_failure_is_one_shot() {
        let hv = InMemoryHypervisor::new("host-a");
        let id = Uuid::new_v4();
        hv.create_instance(&spec(id)).await.unwrap();

        hv.inject_failure(GatewayOp::GetInstance, InjectedFailure::Transport("超时".to_string()))
            .await;
        assert!(hv.get_instance(id).await.unwrap_err().is_transport());
        assert!(hv.get_instance(id).await.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_ignored_by_unresponsive_guest() {
        let hv = InMemoryHypervisor::new("host-a");
        let id = Uuid::new_v4();
        hv.create_instance(&spec(id)).await.unwrap();
        hv.set_power_state(id, PowerAction::Start).await.unwrap();
        hv.set_responds_to_shutdown(id, false).await.unwrap();

        hv.set_power_state(id, PowerAction::Shutdown).await.unwrap();
        assert_eq!(hv.power_state(id).await.unwrap(), PowerState::Running);

        hv.set_power_state(id, PowerAction::Stop).await.unwrap();
        assert_eq!(hv.power_state(id).await.unwrap(), PowerState::Stopped);
    }

    #[tokio::test]
    async fn test_live_migrate_moves_vm_to_peer() {
        let src = InMemoryHypervisor::new("host-a");
        let dst = Arc::new(InMemoryHypervisor::new("host-b"));
        src.connect_peer(dst.clone()).await;

        let id = Uuid::new_v4();
        src.create_instance(&spec(id)).await.unwrap();
        src.set_power_state(id, PowerAction::Start).await.unwrap();

        src.live_migrate(id, "host-b").await.unwrap();
        assert!(!src.exists(id).await.unwrap());
        assert_eq!(dst.power_state(id).await.unwrap(), PowerState::Running);
    }

    #[tokio::test]
    async fn test_live_migrate_unknown_peer_keeps_vm() {
        let src = InMemoryHypervisor::new("host-a");
        let id = Uuid::new_v4();
        src.create_instance(&spec(id)).await.unwrap();
        src.set_power_state(id, PowerAction::Start).await.unwrap();

        let err = src.live_migrate(id, "host-z").await.unwrap_err();
        assert!(err.is_transport());
        assert!(src.exists(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_export_requires_stopped_vm() {
        let hv = InMemoryHypervisor::new("host-a");
        let id = Uuid::new_v4();
        hv.create_instance(&spec(id)).await.unwrap();
        hv.set_power_state(id, PowerAction::Start).await.unwrap();
        assert!(hv.export_disks(id).await.is_err());

        hv.set_power_state(id, PowerAction::Stop).await.unwrap();
        let disks = hv.export_disks(id).await.unwrap();
        assert_eq!(disks.len(), 1);
        assert!(disks[0].boot);
    }
}
