/// 冷迁移与变更规格
///
/// 源端关机并导出磁盘，目标端创建虚拟机并导入磁盘。确认之前源端虚拟机保留，
/// 可以通过 finish_revert_migration 回滚；确认后源端虚拟机及磁盘被删除。

use common::models::{
    BlockDevice, Flavor, Instance, InstanceState, Migration, MigrationDiskInfo, MigrationType,
    NetworkEndpoint, PowerState,
};
use common::{Error, Result};
use tracing::{error, info};

use super::precheck;
use super::{MigrationContext, MigrationCoordinator, MigrationRole};
use crate::hypervisor::{PowerAction, VmSpec};
use crate::orchestrator::{block_device_to_disk, PowerOffPolicy};

/// finish_migration 参数
pub struct FinishMigrationParams<'a> {
    pub migration: &'a Migration,
    pub instance: &'a Instance,
    pub disk_info: &'a MigrationDiskInfo,
    pub network_info: &'a [NetworkEndpoint],
    pub block_devices: &'a [BlockDevice],
    pub resize_instance: bool,
    pub power_on: bool,
}

fn migration_type_for(instance: &Instance, flavor: &Flavor) -> MigrationType {
    if flavor.vcpus != instance.vcpus
        || flavor.memory_mb != instance.memory_mb
        || flavor.root_gb != instance.root_gb
    {
        MigrationType::Resize
    } else {
        MigrationType::Cold
    }
}

impl MigrationCoordinator {
    /// 源端：关机并导出磁盘
    pub async fn migrate_disk_and_power_off(
        &self,
        instance: &Instance,
        dest: &str,
        flavor: &Flavor,
        policy: PowerOffPolicy,
    ) -> Result<MigrationDiskInfo> {
        let id = instance.uuid;
        precheck::check_resize(instance, flavor)?;

        let guard = self.orchestrator.lock(id, "migrate_disk_and_power_off")?;
        self.contexts.register(MigrationContext::new(
            id,
            MigrationRole::Source,
            self.gateway().host(),
            dest,
            migration_type_for(instance, flavor),
        ))?;

        info!("📦 冷迁移: 关机并导出磁盘 {} -> {}", id, dest);

        if let Err(e) = self.orchestrator.power_off_locked(&guard, policy).await {
            self.contexts.remove(id);
            return Err(e);
        }

        match self.gateway().export_disks(id).await {
            Ok(disks) => {
                info!("✅ 已导出 {} 块磁盘: {}", disks.len(), id);
                Ok(MigrationDiskInfo {
                    instance_id: id,
                    source_host: self.gateway().host().to_string(),
                    disks,
                })
            }
            Err(e) => {
                error!("❌ 导出磁盘失败，重新开机: {} ({})", id, e);
                if let Err(pe) = self.orchestrator.power_on_locked(&guard, &[]).await {
                    error!("❌ 重新开机失败: {} ({})", id, pe);
                }
                self.contexts.remove(id);
                Err(Error::MigrationExecution(format!("导出磁盘失败: {}", e)))
            }
        }
    }

    /// 目标端：创建虚拟机、导入磁盘，失败时删除残留虚拟机
    pub async fn finish_migration(&self, params: FinishMigrationParams<'_>) -> Result<InstanceState> {
        let id = params.instance.uuid;
        let _guard = self.orchestrator.lock(id, "finish_migration")?;

        if self.gateway().exists(id).await? {
            return Err(Error::AlreadyExists(format!("目标端已存在虚拟机: {}", id)));
        }

        self.contexts.register(MigrationContext::new(
            id,
            MigrationRole::Destination,
            params.migration.source_host.clone(),
            self.gateway().host(),
            params.migration.migration_type,
        ))?;

        info!("📥 冷迁移: 目标端导入 {} (来自 {})", id, params.migration.source_host);

        let result = self.import_instance(&params).await;
        let context = self.contexts.remove(id);

        match result {
            Ok(state) => {
                if let Some(context) = context {
                    info!("✅ 冷迁移导入完成: {} (磁盘映射: {:?})", id, context.disk_mapping);
                }
                Ok(state)
            }
            Err(e) => {
                error!("❌ 冷迁移导入失败，删除残留虚拟机: {} ({})", id, e);
                self.orchestrator.teardown(id).await;
                Err(Error::MigrationExecution(e.to_string()))
            }
        }
    }

    async fn import_instance(&self, params: &FinishMigrationParams<'_>) -> Result<InstanceState> {
        let instance = params.instance;
        let id = instance.uuid;
        let gateway = self.gateway();

        gateway
            .create_instance(&VmSpec {
                id,
                name: instance.name.clone(),
                vcpus: instance.vcpus,
                memory_mb: instance.memory_mb,
                disks: params.block_devices.iter().map(block_device_to_disk).collect(),
                nics: params.network_info.to_vec(),
                config_drive: None,
            })
            .await?;

        for disk in &params.disk_info.disks {
            let imported = gateway.import_disk(id, disk).await?;
            self.contexts.update(id, |c| {
                c.disk_mapping.insert(disk.path.clone(), imported.path.clone());
            })?;

            if params.resize_instance && disk.boot {
                info!("📏 调整根盘大小: {} -> {}GB", disk.disk_id, instance.root_gb);
                gateway.resize_disk(id, &disk.disk_id, instance.root_gb).await?;
            }
        }

        if params.power_on {
            gateway.set_power_state(id, PowerAction::Start).await?;
            self.orchestrator.verify_state(id, PowerState::Running).await
        } else {
            self.orchestrator.verify_state(id, PowerState::Stopped).await
        }
    }

    /// 源端确认迁移：删除源端虚拟机及磁盘，此后不可回滚
    pub async fn confirm_migration(&self, migration: &Migration, instance: &Instance) -> Result<()> {
        let id = instance.uuid;
        let _guard = self.orchestrator.lock(id, "confirm_migration")?;

        info!("🧾 确认迁移 {}: 删除源端虚拟机 {}", migration.id, id);
        let _ = self.contexts.update(id, |c| c.confirmed = true);
        self.orchestrator.destroy_locked(id, true).await?;
        self.contexts.remove(id);
        Ok(())
    }

    /// 源端回滚：恢复源端虚拟机，仅在确认之前有效
    pub async fn finish_revert_migration(
        &self,
        instance: &Instance,
        block_devices: &[BlockDevice],
        power_on: bool,
    ) -> Result<InstanceState> {
        let id = instance.uuid;
        let guard = self.orchestrator.lock(id, "finish_revert_migration")?;

        let context = self.contexts.get(id).ok_or_else(|| {
            Error::InvalidStateTransition(format!("没有可回滚的迁移（可能已确认）: {}", id))
        })?;
        if context.confirmed || context.role != MigrationRole::Source {
            return Err(Error::InvalidStateTransition(format!("迁移已确认，无法回滚: {}", id)));
        }
        if !self.gateway().exists(id).await? {
            return Err(Error::MigrationExecution(format!("源端虚拟机不存在，无法回滚: {}", id)));
        }

        info!("↩️ 回滚冷迁移: {} (开机: {})", id, power_on);

        let state = if power_on {
            self.orchestrator.power_on_locked(&guard, block_devices).await?
        } else {
            self.gateway().power_state(id).await?.to_instance_state()
        };
        self.contexts.remove(id);
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::memory::{GatewayOp, InjectedFailure};
    use crate::hypervisor::{AttachedDisk, HypervisorGateway, InMemoryHypervisor};
    use crate::orchestrator::{root_disk_id, InstanceLocks, LifecycleOrchestrator};
    use std::sync::Arc;

    const GIB: u64 = 1024 * 1024 * 1024;

    struct Host {
        hv: Arc<InMemoryHypervisor>,
        coordinator: MigrationCoordinator,
    }

    fn host(name: &str) -> Host {
        let hv = Arc::new(InMemoryHypervisor::new(name));
        let orch = Arc::new(LifecycleOrchestrator::new(hv.clone(), InstanceLocks::new()));
        Host {
            hv,
            coordinator: MigrationCoordinator::new(orch),
        }
    }

    async fn running_instance(src: &Host) -> Instance {
        let instance = Instance::new("vm-1", 1, 512, 10);
        src.hv
            .create_instance(&VmSpec {
                id: instance.uuid,
                name: instance.name.clone(),
                vcpus: 1,
                memory_mb: 512,
                disks: vec![AttachedDisk {
                    disk_id: root_disk_id(instance.uuid),
                    path: format!("/var/lib/hv-agent/host-a/{}/root.qcow2", instance.uuid),
                    format: "qcow2".to_string(),
                    boot: true,
                }],
                nics: Vec::new(),
                config_drive: None,
            })
            .await
            .unwrap();
        src.hv.set_power_state(instance.uuid, PowerAction::Start).await.unwrap();
        instance
    }

    fn flavor(root_gb: u64) -> Flavor {
        Flavor {
            name: format!("r{}", root_gb),
            vcpus: 1,
            memory_mb: 512,
            root_gb,
        }
    }

    fn migration(instance: &Instance) -> Migration {
        Migration {
            id: "m-1".to_string(),
            instance_id: instance.uuid,
            source_host: "host-a".to_string(),
            dest_host: "host-b".to_string(),
            migration_type: MigrationType::Resize,
        }
    }

    #[tokio::test]
    async fn test_resize_then_confirm() {
        let src = host("host-a");
        let dst = host("host-b");
        let mut instance = running_instance(&src).await;

        let disk_info = src
            .coordinator
            .migrate_disk_and_power_off(&instance, "host-b", &flavor(20), PowerOffPolicy::immediate())
            .await
            .unwrap();
        assert_eq!(disk_info.disks.len(), 1);
        assert_eq!(src.hv.power_state(instance.uuid).await.unwrap(), PowerState::Stopped);

        instance.root_gb = 20;
        let state = dst
            .coordinator
            .finish_migration(FinishMigrationParams {
                migration: &migration(&instance),
                instance: &instance,
                disk_info: &disk_info,
                network_info: &[],
                block_devices: &[],
                resize_instance: true,
                power_on: true,
            })
            .await
            .unwrap();
        assert_eq!(state, InstanceState::Running);
        assert_eq!(
            dst.hv.disk_size(instance.uuid, &root_disk_id(instance.uuid)).await,
            Some(20 * GIB)
        );

        src.coordinator
            .confirm_migration(&migration(&instance), &instance)
            .await
            .unwrap();
        assert!(!src.hv.exists(instance.uuid).await.unwrap());

        // 确认后不能回滚
        let err = src
            .coordinator
            .finish_revert_migration(&instance, &[], true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition(_)));
    }

    #[tokio::test]
    async fn test_revert_restores_source() {
        let src = host("host-a");
        let instance = running_instance(&src).await;

        src.coordinator
            .migrate_disk_and_power_off(&instance, "host-b", &flavor(10), PowerOffPolicy::immediate())
            .await
            .unwrap();

        let state = src
            .coordinator
            .finish_revert_migration(&instance, &[], true)
            .await
            .unwrap();
        assert_eq!(state, InstanceState::Running);
        assert!(src.coordinator.contexts().is_empty());
    }

    #[tokio::test]
    async fn test_shrink_refused_without_side_effects() {
        let src = host("host-a");
        let instance = running_instance(&src).await;

        let err = src
            .coordinator
            .migrate_disk_and_power_off(&instance, "host-b", &flavor(5), PowerOffPolicy::immediate())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MigrationPreCheck(_)));
        assert_eq!(src.hv.power_state(instance.uuid).await.unwrap(), PowerState::Running);
        assert!(src.coordinator.contexts().is_empty());
    }

    #[tokio::test]
    async fn test_export_failure_powers_back_on() {
        let src = host("host-a");
        let instance = running_instance(&src).await;
        src.hv
            .inject_failure(GatewayOp::ExportDisks, InjectedFailure::Hypervisor("导出失败".into()))
            .await;

        let err = src
            .coordinator
            .migrate_disk_and_power_off(&instance, "host-b", &flavor(10), PowerOffPolicy::immediate())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MigrationExecution(_)));
        assert_eq!(src.hv.power_state(instance.uuid).await.unwrap(), PowerState::Running);
        assert!(src.coordinator.contexts().is_empty());
    }

    #[tokio::test]
    async fn test_finish_migration_failure_destroys_partial_vm() {
        let src = host("host-a");
        let dst = host("host-b");
        let instance = running_instance(&src).await;
        let disk_info = src
            .coordinator
            .migrate_disk_and_power_off(&instance, "host-b", &flavor(10), PowerOffPolicy::immediate())
            .await
            .unwrap();

        dst.hv
            .inject_failure(GatewayOp::ImportDisk, InjectedFailure::Transport("传输中断".into()))
            .await;
        let err = dst
            .coordinator
            .finish_migration(FinishMigrationParams {
                migration: &migration(&instance),
                instance: &instance,
                disk_info: &disk_info,
                network_info: &[],
                block_devices: &[],
                resize_instance: false,
                power_on: true,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::MigrationExecution(_)));
        assert!(!dst.hv.exists(instance.uuid).await.unwrap());
        assert!(dst.coordinator.contexts().is_empty());
    }
}
