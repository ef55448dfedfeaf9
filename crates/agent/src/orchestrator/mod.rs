/// 虚拟机生命周期编排
///
/// 每个操作都重新向 hypervisor 查询实际状态，操作完成后再次校验，
/// 不在调用之间缓存实例状态。同一实例的操作由 `InstanceLocks` 互斥。

pub mod locks;
pub mod power;
pub mod rescue;

use common::models::{
    constants, BlockDevice, Instance, InstanceInfo, InstanceState, NetworkEndpoint, PowerState,
    RebootType,
};
use common::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::hypervisor::{AttachedDisk, ConfigDrive, HypervisorGateway, PowerAction, VmSpec};

pub use locks::{InstanceGuard, InstanceLocks};
pub use power::PowerOffPolicy;

/// 根盘磁盘ID
pub fn root_disk_id(id: Uuid) -> String {
    format!("{}-{}", id, constants::ROOT_DISK_SUFFIX)
}

/// 救援盘磁盘ID
pub fn rescue_disk_id(id: Uuid) -> String {
    format!("{}-{}", id, constants::RESCUE_DISK_SUFFIX)
}

pub(crate) fn block_device_to_disk(device: &BlockDevice) -> AttachedDisk {
    AttachedDisk {
        disk_id: device.volume_id.clone(),
        path: device.path.clone(),
        format: device.format.clone(),
        boot: device.boot,
    }
}

/// spawn 参数
pub struct SpawnParams<'a> {
    pub instance: &'a Instance,
    /// 镜像缓存准备好的根盘（从卷启动时为 None）
    pub root_disk: Option<AttachedDisk>,
    pub block_devices: &'a [BlockDevice],
    pub network_info: &'a [NetworkEndpoint],
    pub config_drive: Option<ConfigDrive>,
}

pub struct LifecycleOrchestrator {
    gateway: Arc<dyn HypervisorGateway>,
    locks: InstanceLocks,
    /// 救援前的电源状态，unrescue 时恢复
    rescue_baseline: Mutex<HashMap<Uuid, PowerState>>,
}

impl LifecycleOrchestrator {
    pub fn new(gateway: Arc<dyn HypervisorGateway>, locks: InstanceLocks) -> Self {
        Self {
            gateway,
            locks,
            rescue_baseline: Mutex::new(HashMap::new()),
        }
    }

    pub fn gateway(&self) -> &Arc<dyn HypervisorGateway> {
        &self.gateway
    }

    pub fn locks(&self) -> &InstanceLocks {
        &self.locks
    }

    /// 独占实例，供组合操作（救援补偿、迁移）使用
    pub fn lock(&self, id: Uuid, operation: &'static str) -> Result<InstanceGuard> {
        self.locks.try_acquire(id, operation)
    }

    /// 校验 hypervisor 上的实际状态与期望一致
    pub(crate) async fn verify_state(&self, id: Uuid, expected: PowerState) -> Result<InstanceState> {
        let actual = self.gateway.power_state(id).await?;
        if actual != expected {
            error!("❌ 状态校验失败: {} 期望 {}，实际 {}", id, expected, actual);
            return Err(Error::Hypervisor(format!(
                "实例 {} 状态校验失败: 期望 {}，实际 {}",
                id, expected, actual
            )));
        }
        Ok(expected.to_instance_state())
    }

    /// 删除创建失败的残留虚拟机
    pub(crate) async fn teardown(&self, id: Uuid) {
        match self.gateway.destroy_instance(id, true).await {
            Ok(()) => info!("🧹 已清理残留虚拟机: {}", id),
            Err(e) if e.is_not_found() => {}
            Err(e) => error!("❌ 清理残留虚拟机失败: {} ({})", id, e),
        }
    }

    /// 创建并启动虚拟机
    pub async fn spawn(&self, params: SpawnParams<'_>) -> Result<InstanceState> {
        let guard = self.lock(params.instance.uuid, "spawn")?;
        self.spawn_locked(&guard, params).await
    }

    pub(crate) async fn spawn_locked(
        &self,
        guard: &InstanceGuard,
        params: SpawnParams<'_>,
    ) -> Result<InstanceState> {
        let instance = params.instance;
        let id = guard.instance_id();

        if self.gateway.exists(id).await? {
            return Err(Error::AlreadyExists(format!("虚拟机已存在: {}", id)));
        }

        info!("🚀 创建虚拟机: {} ({})", instance.name, id);

        let mut disks: Vec<AttachedDisk> = params.root_disk.into_iter().collect();
        disks.extend(params.block_devices.iter().map(block_device_to_disk));

        let spec = VmSpec {
            id,
            name: instance.name.clone(),
            vcpus: instance.vcpus,
            memory_mb: instance.memory_mb,
            disks,
            nics: params.network_info.to_vec(),
            config_drive: params.config_drive,
        };

        if let Err(e) = self.gateway.create_instance(&spec).await {
            // 创建调用失败时虚拟机可能已部分定义
            self.teardown(id).await;
            return Err(Error::Spawn(e.to_string()));
        }

        let started = async {
            self.gateway.set_power_state(id, PowerAction::Start).await?;
            self.verify_state(id, PowerState::Running).await
        }
        .await;

        match started {
            Ok(state) => {
                info!("✅ 虚拟机创建成功: {}", id);
                Ok(state)
            }
            Err(e) => {
                error!("❌ 启动虚拟机失败，开始清理: {} ({})", id, e);
                self.teardown(id).await;
                Err(Error::Spawn(e.to_string()))
            }
        }
    }

    /// 删除虚拟机，虚拟机不存在时直接成功
    pub async fn destroy(&self, instance: &Instance, destroy_disks: bool) -> Result<InstanceState> {
        let id = instance.uuid;
        let _guard = self.lock(id, "destroy")?;
        self.destroy_locked(id, destroy_disks).await
    }

    pub(crate) async fn destroy_locked(&self, id: Uuid, destroy_disks: bool) -> Result<InstanceState> {
        let handle = match self.gateway.get_instance(id).await {
            Ok(handle) => handle,
            Err(e) if e.is_not_found() => {
                info!("ℹ️ 虚拟机不存在，跳过删除: {}", id);
                self.forget_rescue(id);
                return Ok(InstanceState::NotExist);
            }
            Err(e) => return Err(e),
        };

        info!("🗑️ 删除虚拟机: {} (删除磁盘: {})", id, destroy_disks);

        if handle.power_state != PowerState::Stopped {
            self.gateway.set_power_state(id, PowerAction::Stop).await?;
        }

        match self.gateway.destroy_instance(id, destroy_disks).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.forget_rescue(id);

        if self.gateway.exists(id).await? {
            return Err(Error::Hypervisor(format!("虚拟机删除后仍然存在: {}", id)));
        }

        info!("✅ 虚拟机删除成功: {}", id);
        Ok(InstanceState::NotExist)
    }

    /// 重启虚拟机
    pub async fn reboot(&self, instance: &Instance, reboot_type: RebootType) -> Result<InstanceState> {
        let id = instance.uuid;
        let _guard = self.lock(id, "reboot")?;

        // 不存在时返回 NotFound
        self.gateway.get_instance(id).await?;

        match reboot_type {
            RebootType::Soft => {
                info!("🔄 软重启虚拟机: {}", id);
                match self.gateway.set_power_state(id, PowerAction::Reboot).await {
                    Ok(()) => {}
                    Err(Error::NotSupported(msg)) => {
                        warn!("⚠️ 客户机不支持软重启，忽略: {} ({})", id, msg);
                    }
                    Err(e) => return Err(e),
                }
                Ok(self.gateway.power_state(id).await?.to_instance_state())
            }
            RebootType::Hard => {
                info!("⚡ 硬重启虚拟机: {}", id);
                self.gateway.set_power_state(id, PowerAction::Reset).await?;
                self.verify_state(id, PowerState::Running).await
            }
        }
    }

    /// 在 from 与 to 之间切换；已处于 to 时不做任何操作
    async fn toggle(
        &self,
        instance: &Instance,
        operation: &'static str,
        from: PowerState,
        to: PowerState,
        action: PowerAction,
    ) -> Result<InstanceState> {
        let id = instance.uuid;
        let _guard = self.lock(id, operation)?;

        let current = self.gateway.power_state(id).await?;
        if current == to {
            info!("ℹ️ 虚拟机已处于 {} 状态: {}", to, id);
            return Ok(to.to_instance_state());
        }
        if current != from {
            return Err(Error::InvalidStateTransition(format!(
                "实例 {} 当前状态为 {}，不能执行 {}",
                id, current, operation
            )));
        }

        info!("🔧 {} 虚拟机: {}", operation, id);
        self.gateway.set_power_state(id, action).await?;
        self.verify_state(id, to).await
    }

    pub async fn pause(&self, instance: &Instance) -> Result<InstanceState> {
        self.toggle(instance, "pause", PowerState::Running, PowerState::Paused, PowerAction::Pause)
            .await
    }

    pub async fn unpause(&self, instance: &Instance) -> Result<InstanceState> {
        self.toggle(instance, "unpause", PowerState::Paused, PowerState::Running, PowerAction::Start)
            .await
    }

    pub async fn suspend(&self, instance: &Instance) -> Result<InstanceState> {
        self.toggle(
            instance,
            "suspend",
            PowerState::Running,
            PowerState::Suspended,
            PowerAction::Suspend,
        )
        .await
    }

    pub async fn resume(&self, instance: &Instance) -> Result<InstanceState> {
        self.toggle(instance, "resume", PowerState::Suspended, PowerState::Running, PowerAction::Start)
            .await
    }

    /// 关机（先正常关机，超时后强制断电）
    pub async fn power_off(&self, instance: &Instance, policy: PowerOffPolicy) -> Result<InstanceState> {
        let guard = self.lock(instance.uuid, "power_off")?;
        self.power_off_locked(&guard, policy).await
    }

    /// 开机，先补挂缺失的块设备
    pub async fn power_on(&self, instance: &Instance, block_devices: &[BlockDevice]) -> Result<InstanceState> {
        let guard = self.lock(instance.uuid, "power_on")?;
        self.power_on_locked(&guard, block_devices).await
    }

    pub(crate) async fn power_on_locked(
        &self,
        guard: &InstanceGuard,
        block_devices: &[BlockDevice],
    ) -> Result<InstanceState> {
        let id = guard.instance_id();
        let handle = self.gateway.get_instance(id).await?;

        for device in block_devices {
            if handle.disk(&device.volume_id).is_none() {
                info!("🔗 补挂块设备: {} -> {}", device.volume_id, id);
                self.gateway.attach_disk(id, &block_device_to_disk(device)).await?;
            }
        }

        if handle.power_state == PowerState::Running {
            return Ok(InstanceState::Running);
        }

        info!("▶️ 启动虚拟机: {}", id);
        self.gateway.set_power_state(id, PowerAction::Start).await?;
        self.verify_state(id, PowerState::Running).await
    }

    /// 宿主机重启后恢复实例状态
    pub async fn resume_state_on_host_boot(
        &self,
        instance: &Instance,
        block_devices: &[BlockDevice],
    ) -> Result<InstanceState> {
        let guard = self.lock(instance.uuid, "resume_state_on_host_boot")?;
        let current = self.gateway.power_state(instance.uuid).await?;

        if instance.state == InstanceState::Running && current != PowerState::Running {
            info!("🔁 宿主机重启后恢复运行: {} (当前 {})", instance.uuid, current);
            return self.power_on_locked(&guard, block_devices).await;
        }
        Ok(current.to_instance_state())
    }

    /// 查询运行信息（含救援状态）
    pub async fn get_info(&self, instance: &Instance) -> Result<InstanceInfo> {
        let handle = self.gateway.get_instance(instance.uuid).await?;
        let state = if self.is_rescued(instance.uuid) && handle.disk(&rescue_disk_id(handle.id)).is_some() {
            InstanceState::Rescued
        } else {
            handle.power_state.to_instance_state()
        };

        Ok(InstanceInfo {
            state,
            max_mem_kb: handle.memory_mb * 1024,
            mem_kb: handle.memory_mb * 1024,
            num_cpu: handle.vcpus,
            cpu_time_ns: handle.cpu_time_ns,
        })
    }

    pub async fn list_instances(&self) -> Result<Vec<String>> {
        Ok(self
            .gateway
            .list_instances()
            .await?
            .into_iter()
            .map(|vm| vm.name)
            .collect())
    }

    pub async fn list_instance_uuids(&self) -> Result<Vec<Uuid>> {
        Ok(self
            .gateway
            .list_instances()
            .await?
            .into_iter()
            .map(|vm| vm.id)
            .collect())
    }

    pub async fn get_instance_disk_info(&self, instance: &Instance) -> Result<Vec<AttachedDisk>> {
        Ok(self.gateway.get_instance(instance.uuid).await?.disks)
    }

    fn baseline(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, PowerState>> {
        self.rescue_baseline
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_rescued(&self, id: Uuid) -> bool {
        self.baseline().contains_key(&id)
    }

    fn forget_rescue(&self, id: Uuid) {
        self.baseline().remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::memory::{GatewayOp, InjectedFailure};
    use crate::hypervisor::InMemoryHypervisor;
    use std::time::Duration;

    fn setup() -> (Arc<InMemoryHypervisor>, LifecycleOrchestrator) {
        let hv = Arc::new(InMemoryHypervisor::new("host-a"));
        let orch = LifecycleOrchestrator::new(hv.clone(), InstanceLocks::new());
        (hv, orch)
    }

    async fn spawn(orch: &LifecycleOrchestrator, instance: &Instance) -> Result<InstanceState> {
        orch.spawn(SpawnParams {
            instance,
            root_disk: Some(AttachedDisk {
                disk_id: root_disk_id(instance.uuid),
                path: "/var/lib/hv-agent/root.qcow2".to_string(),
                format: "qcow2".to_string(),
                boot: true,
            }),
            block_devices: &[],
            network_info: &[],
            config_drive: None,
        })
        .await
    }

    #[tokio::test]
    async fn test_spawn_pause_unpause_destroy() {
        let (hv, orch) = setup();
        let instance = Instance::new("vm-1", 2, 1024, 10);

        assert_eq!(spawn(&orch, &instance).await.unwrap(), InstanceState::Running);
        assert_eq!(orch.pause(&instance).await.unwrap(), InstanceState::Paused);
        // 重复暂停不做任何操作
        assert_eq!(orch.pause(&instance).await.unwrap(), InstanceState::Paused);
        assert_eq!(orch.unpause(&instance).await.unwrap(), InstanceState::Running);
        assert_eq!(orch.destroy(&instance, true).await.unwrap(), InstanceState::NotExist);

        assert!(orch.get_info(&instance).await.unwrap_err().is_not_found());
        assert!(!hv.exists(instance.uuid).await.unwrap());
    }

    #[tokio::test]
    async fn test_spawn_existing_fails() {
        let (_hv, orch) = setup();
        let instance = Instance::new("vm-1", 1, 512, 10);
        spawn(&orch, &instance).await.unwrap();

        let err = spawn(&orch, &instance).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_spawn_failure_tears_down() {
        let (hv, orch) = setup();
        let instance = Instance::new("vm-1", 1, 512, 10);
        hv.inject_failure(GatewayOp::SetPowerState, InjectedFailure::Hypervisor("启动失败".into()))
            .await;

        let err = spawn(&orch, &instance).await.unwrap_err();
        assert!(matches!(err, Error::Spawn(_)));
        assert!(!hv.exists(instance.uuid).await.unwrap());
        assert!(orch.locks().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let (_hv, orch) = setup();
        let instance = Instance::new("vm-1", 1, 512, 10);
        spawn(&orch, &instance).await.unwrap();

        assert_eq!(orch.destroy(&instance, true).await.unwrap(), InstanceState::NotExist);
        assert_eq!(orch.destroy(&instance, true).await.unwrap(), InstanceState::NotExist);
    }

    #[tokio::test]
    async fn test_invalid_transitions() {
        let (_hv, orch) = setup();
        let instance = Instance::new("vm-1", 1, 512, 10);
        spawn(&orch, &instance).await.unwrap();
        orch.power_off(&instance, PowerOffPolicy::immediate()).await.unwrap();

        assert!(matches!(
            orch.pause(&instance).await.unwrap_err(),
            Error::InvalidStateTransition(_)
        ));
        assert!(matches!(
            orch.resume(&instance).await.unwrap_err(),
            Error::InvalidStateTransition(_)
        ));
    }

    #[tokio::test]
    async fn test_suspend_resume() {
        let (_hv, orch) = setup();
        let instance = Instance::new("vm-1", 1, 512, 10);
        spawn(&orch, &instance).await.unwrap();

        assert_eq!(orch.suspend(&instance).await.unwrap(), InstanceState::Suspended);
        assert_eq!(orch.resume(&instance).await.unwrap(), InstanceState::Running);
    }

    #[tokio::test]
    async fn test_soft_reboot_without_guest_agent_is_noop() {
        let (hv, orch) = setup();
        let instance = Instance::new("vm-1", 1, 512, 10);
        spawn(&orch, &instance).await.unwrap();
        hv.set_guest_agent(instance.uuid, false).await.unwrap();

        let state = orch.reboot(&instance, RebootType::Soft).await.unwrap();
        assert_eq!(state, InstanceState::Running);
    }

    #[tokio::test]
    async fn test_reboot_missing_instance() {
        let (_hv, orch) = setup();
        let instance = Instance::new("ghost", 1, 512, 10);
        let err = orch.reboot(&instance, RebootType::Hard).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_power_on_reattaches_block_devices() {
        let (hv, orch) = setup();
        let instance = Instance::new("vm-1", 1, 512, 10);
        spawn(&orch, &instance).await.unwrap();
        orch.power_off(&instance, PowerOffPolicy::immediate()).await.unwrap();

        let volume = BlockDevice {
            volume_id: "vol-1".to_string(),
            path: "/dev/sdb".to_string(),
            format: "raw".to_string(),
            boot: false,
        };
        orch.power_on(&instance, std::slice::from_ref(&volume)).await.unwrap();
        // 再次开机不会重复挂载
        orch.power_on(&instance, std::slice::from_ref(&volume)).await.unwrap();

        let handle = hv.get_instance(instance.uuid).await.unwrap();
        assert_eq!(handle.power_state, PowerState::Running);
        assert_eq!(handle.disks.iter().filter(|d| d.disk_id == "vol-1").count(), 1);
    }

    #[tokio::test]
    async fn test_resume_state_on_host_boot() {
        let (hv, orch) = setup();
        let mut instance = Instance::new("vm-1", 1, 512, 10);
        spawn(&orch, &instance).await.unwrap();
        hv.set_external_power_state(instance.uuid, PowerState::Stopped)
            .await
            .unwrap();

        instance.state = InstanceState::Running;
        let state = orch.resume_state_on_host_boot(&instance, &[]).await.unwrap();
        assert_eq!(state, InstanceState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_operations_exactly_one_succeeds() {
        let (hv, orch) = setup();
        let instance = Instance::new("vm-1", 1, 512, 10);
        spawn(&orch, &instance).await.unwrap();
        hv.set_latency(Duration::from_millis(100)).await;

        let (destroyed, paused) = tokio::join!(orch.destroy(&instance, true), orch.pause(&instance));
        assert!(destroyed.is_ok() ^ paused.is_ok());
        let failed = destroyed.err().or(paused.err()).unwrap();
        assert!(matches!(failed, Error::InvalidStateTransition(_)));
        assert!(orch.locks().is_empty());
    }

    #[tokio::test]
    async fn test_transport_error_surfaces_distinctly() {
        let (hv, orch) = setup();
        let instance = Instance::new("vm-1", 1, 512, 10);
        spawn(&orch, &instance).await.unwrap();
        hv.inject_failure(GatewayOp::GetInstance, InjectedFailure::Transport("连接断开".into()))
            .await;

        assert!(orch.pause(&instance).await.unwrap_err().is_transport());
    }
}
