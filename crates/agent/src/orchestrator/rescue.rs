/// 救援模式
///
/// rescue 与 unrescue 是一对补偿操作，两者都要求调用方已持有实例锁。
/// 救援前的电源状态记录在编排器中，unrescue 时按记录恢复。

use common::models::{InstanceState, PowerState};
use common::{Error, Result};
use tracing::{info, warn};

use super::{rescue_disk_id, InstanceGuard, LifecycleOrchestrator};
use crate::hypervisor::{AttachedDisk, PowerAction};

impl LifecycleOrchestrator {
    /// 检查实例可以进入救援模式（无副作用）
    pub async fn check_rescuable(&self, guard: &InstanceGuard) -> Result<()> {
        let id = guard.instance_id();
        let handle = self.gateway().get_instance(id).await?;
        if self.is_rescued(id) || handle.disk(&rescue_disk_id(id)).is_some() {
            return Err(Error::InvalidStateTransition(format!("实例已处于救援模式: {}", id)));
        }
        Ok(())
    }

    /// 进入救援模式：关机、挂载救援盘作为启动盘、开机
    pub async fn rescue_locked(
        &self,
        guard: &InstanceGuard,
        rescue_image_path: &str,
    ) -> Result<InstanceState> {
        let id = guard.instance_id();
        let gateway = self.gateway();
        let handle = gateway.get_instance(id).await?;

        info!("🛟 进入救援模式: {} (原状态 {})", id, handle.power_state);
        self.baseline().insert(id, handle.power_state);

        if handle.power_state != PowerState::Stopped {
            gateway.set_power_state(id, PowerAction::Stop).await?;
        }

        let rescue_disk = AttachedDisk {
            disk_id: rescue_disk_id(id),
            path: rescue_image_path.to_string(),
            format: "qcow2".to_string(),
            boot: true,
        };
        gateway.attach_disk(id, &rescue_disk).await?;
        gateway.set_power_state(id, PowerAction::Start).await?;
        self.verify_state(id, PowerState::Running).await?;

        info!("✅ 已进入救援模式: {}", id);
        Ok(InstanceState::Rescued)
    }

    /// 退出救援模式并恢复救援前的电源状态
    ///
    /// 实例不存在或未处于救援模式时不做任何操作。
    pub async fn unrescue_locked(&self, guard: &InstanceGuard) -> Result<InstanceState> {
        let id = guard.instance_id();
        let gateway = self.gateway();

        let handle = match gateway.get_instance(id).await {
            Ok(handle) => handle,
            Err(e) if e.is_not_found() => {
                self.forget_rescue(id);
                return Ok(InstanceState::NotExist);
            }
            Err(e) => return Err(e),
        };

        let rescue_id = rescue_disk_id(id);
        let attached = handle.disk(&rescue_id).is_some();
        let baseline = self.baseline().get(&id).copied();
        if !attached && baseline.is_none() {
            info!("ℹ️ 实例未处于救援模式，跳过: {}", id);
            return Ok(handle.power_state.to_instance_state());
        }

        let target = baseline.unwrap_or(PowerState::Running);
        info!("🛟 退出救援模式: {} (恢复为 {})", id, target);

        if handle.power_state != PowerState::Stopped {
            gateway.set_power_state(id, PowerAction::Stop).await?;
        }
        if attached {
            match gateway.detach_disk(id, &rescue_id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => warn!("⚠️ 救援盘已不存在: {}", rescue_id),
                Err(e) => return Err(e),
            }
        }

        let actions: &[PowerAction] = match target {
            PowerState::Running => &[PowerAction::Start],
            PowerState::Stopped => &[],
            PowerState::Paused => &[PowerAction::Start, PowerAction::Pause],
            PowerState::Suspended => &[PowerAction::Start, PowerAction::Suspend],
        };
        for action in actions {
            gateway.set_power_state(id, *action).await?;
        }

        let state = self.verify_state(id, target).await?;
        self.forget_rescue(id);
        info!("✅ 已退出救援模式: {}", id);
        Ok(state)
    }

    pub async fn unrescue(&self, instance_id: uuid::Uuid) -> Result<InstanceState> {
        let guard = self.lock(instance_id, "unrescue")?;
        self.unrescue_locked(&guard).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::memory::{GatewayOp, InjectedFailure};
    use crate::hypervisor::{HypervisorGateway, InMemoryHypervisor, VmSpec};
    use crate::orchestrator::InstanceLocks;
    use common::models::Instance;
    use std::sync::Arc;

    async fn setup(state: PowerState) -> (Arc<InMemoryHypervisor>, LifecycleOrchestrator, Instance) {
        let hv = Arc::new(InMemoryHypervisor::new("host-a"));
        let orch = LifecycleOrchestrator::new(hv.clone(), InstanceLocks::new());
        let instance = Instance::new("vm-1", 1, 512, 10);
        hv.create_instance(&VmSpec {
            id: instance.uuid,
            name: instance.name.clone(),
            vcpus: 1,
            memory_mb: 512,
            disks: Vec::new(),
            nics: Vec::new(),
            config_drive: None,
        })
        .await
        .unwrap();
        hv.set_external_power_state(instance.uuid, state).await.unwrap();
        (hv, orch, instance)
    }

    #[tokio::test]
    async fn test_rescue_then_unrescue_restores_paused() {
        let (hv, orch, instance) = setup(PowerState::Paused).await;

        let guard = orch.lock(instance.uuid, "rescue").unwrap();
        assert_eq!(
            orch.rescue_locked(&guard, "/images/rescue.qcow2").await.unwrap(),
            InstanceState::Rescued
        );
        drop(guard);
        assert_eq!(orch.get_info(&instance).await.unwrap().state, InstanceState::Rescued);

        assert_eq!(orch.unrescue(instance.uuid).await.unwrap(), InstanceState::Paused);
        let handle = hv.get_instance(instance.uuid).await.unwrap();
        assert!(handle.disk(&rescue_disk_id(instance.uuid)).is_none());
        assert!(!orch.is_rescued(instance.uuid));
    }

    #[tokio::test]
    async fn test_unrescue_not_rescued_is_noop() {
        let (hv, orch, instance) = setup(PowerState::Running).await;
        hv.clear_calls().await;

        assert_eq!(orch.unrescue(instance.uuid).await.unwrap(), InstanceState::Running);
        assert_eq!(hv.calls().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unrescue_after_partial_rescue() {
        let (hv, orch, instance) = setup(PowerState::Running).await;
        hv.inject_failure(GatewayOp::AttachDisk, InjectedFailure::Hypervisor("挂载失败".into()))
            .await;

        let guard = orch.lock(instance.uuid, "rescue").unwrap();
        assert!(orch.rescue_locked(&guard, "/images/rescue.qcow2").await.is_err());
        // 此时虚拟机已被关机
        assert_eq!(hv.power_state(instance.uuid).await.unwrap(), PowerState::Stopped);

        assert_eq!(orch.unrescue_locked(&guard).await.unwrap(), InstanceState::Running);
    }

    #[tokio::test]
    async fn test_check_rescuable_rejects_rescued() {
        let (_hv, orch, instance) = setup(PowerState::Running).await;
        let guard = orch.lock(instance.uuid, "rescue").unwrap();
        orch.rescue_locked(&guard, "/images/rescue.qcow2").await.unwrap();

        assert!(matches!(
            orch.check_rescuable(&guard).await.unwrap_err(),
            Error::InvalidStateTransition(_)
        ));
    }
}
