/// 热迁移

use common::models::{
    ComputeNodeInfo, Instance, InstanceState, LiveMigrationCheckData, MigrationType, PowerState,
};
use common::{Error, Result};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::precheck::{self, CompatibilityError};
use super::{MigrationCallback, MigrationContext, MigrationCoordinator, MigrationRole};
use crate::hypervisor::PowerAction;

impl MigrationCoordinator {
    /// 目标端检查（无副作用）
    pub async fn check_can_live_migrate_destination(
        &self,
        instance: &Instance,
        src_info: &ComputeNodeInfo,
        dst_info: &ComputeNodeInfo,
        block_migration: bool,
        disk_over_commit: bool,
    ) -> Result<LiveMigrationCheckData> {
        let caps = self.gateway().query_capabilities().await?;
        precheck::check_destination(
            instance,
            src_info,
            dst_info,
            caps.live_migration_enabled,
            block_migration,
            disk_over_commit,
        )?;

        debug!("目标端热迁移检查通过: {} -> {}", instance.uuid, dst_info.host);
        Ok(LiveMigrationCheckData {
            dest_host: dst_info.host.clone(),
            block_migration,
            disk_over_commit,
            hypervisor_type: dst_info.hypervisor_type.clone(),
            hypervisor_version: dst_info.hypervisor_version,
            cpu_features: dst_info.cpu_features.clone(),
        })
    }

    /// 目标端检查的清理钩子，检查本身不分配任何资源
    pub async fn check_can_live_migrate_destination_cleanup(
        &self,
        dest_check_data: &LiveMigrationCheckData,
    ) -> Result<()> {
        debug!("目标端检查清理: {}", dest_check_data.dest_host);
        Ok(())
    }

    /// 源端检查（无副作用）
    pub async fn check_can_live_migrate_source(
        &self,
        instance: &Instance,
        dest_check_data: &LiveMigrationCheckData,
    ) -> Result<LiveMigrationCheckData> {
        let handle = match self.gateway().get_instance(instance.uuid).await {
            Ok(handle) => handle,
            Err(e) if e.is_not_found() => {
                return Err(Error::MigrationPreCheck(format!(
                    "源端不存在该实例: {}",
                    instance.uuid
                )))
            }
            Err(e) => return Err(e),
        };

        let caps = self.gateway().query_capabilities().await?;
        precheck::check_source(
            handle.power_state,
            caps.hypervisor_version,
            &caps.cpu_features,
            dest_check_data,
        )?;

        debug!("源端热迁移检查通过: {}", instance.uuid);
        Ok(dest_check_data.clone())
    }

    /// 目标端准备，登记目标端迁移上下文
    pub async fn pre_live_migration(
        &self,
        instance: &Instance,
        migrate_data: Option<&LiveMigrationCheckData>,
    ) -> Result<()> {
        let caps = self.gateway().query_capabilities().await?;
        if !caps.live_migration_enabled {
            return Err(CompatibilityError::LiveMigrationDisabled(caps.host).into());
        }

        let mut context = MigrationContext::new(
            instance.uuid,
            MigrationRole::Destination,
            instance.host.clone().unwrap_or_default(),
            self.gateway().host(),
            MigrationType::Live,
        );
        context.block_migration = migrate_data.is_some_and(|d| d.block_migration);
        context.dest_check_data = migrate_data.cloned();
        self.contexts.register(context)?;

        info!("📥 目标端已准备接收热迁移: {}", instance.uuid);
        Ok(())
    }

    /// 源端执行热迁移
    ///
    /// 成功后调用一次 `post_method`；失败时确认源端虚拟机仍在运行，
    /// 调用一次 `recover_method`，再返回 `MigrationExecution`。
    pub async fn live_migration(
        &self,
        instance: &Instance,
        dest: &str,
        post_method: MigrationCallback,
        recover_method: MigrationCallback,
        block_migration: bool,
        migrate_data: Option<LiveMigrationCheckData>,
    ) -> Result<()> {
        let id = instance.uuid;
        let guard = self.orchestrator.lock(id, "live_migration")?;

        let mut context = MigrationContext::new(
            id,
            MigrationRole::Source,
            self.gateway().host(),
            dest,
            MigrationType::Live,
        );
        context.block_migration = block_migration;
        context.dest_check_data = migrate_data;
        self.contexts.register(context)?;

        info!("🚚 开始热迁移: {} -> {} (块迁移: {})", id, dest, block_migration);

        match self.gateway().live_migrate(id, dest).await {
            Ok(()) => {
                self.contexts.remove(id);
                drop(guard);
                info!("✅ 热迁移完成: {} -> {}", id, dest);
                post_method(instance.clone(), dest.to_string(), block_migration).await
            }
            Err(e) => {
                error!("❌ 热迁移失败: {} -> {} ({})", id, dest, e);

                if let Err(re) = self.ensure_running_on_source(id).await {
                    error!("❌ 源端虚拟机恢复运行失败: {} ({})", id, re);
                }
                self.contexts.remove(id);
                drop(guard);

                if let Err(re) = recover_method(instance.clone(), dest.to_string(), block_migration).await {
                    error!("❌ 热迁移回滚回调失败: {} ({})", id, re);
                }
                Err(Error::MigrationExecution(format!("热迁移到 {} 失败: {}", dest, e)))
            }
        }
    }

    async fn ensure_running_on_source(&self, id: Uuid) -> Result<()> {
        match self.gateway().power_state(id).await? {
            PowerState::Running | PowerState::Paused => Ok(()),
            state => {
                warn!("⚠️ 热迁移失败后源端虚拟机处于 {}，重新启动: {}", state, id);
                self.gateway().set_power_state(id, PowerAction::Start).await?;
                self.orchestrator.verify_state(id, PowerState::Running).await?;
                Ok(())
            }
        }
    }

    /// 源端收尾
    ///
    /// 返回源端虚拟机是否已不存在，不存在时调用方才能删除本机实例文件。
    pub async fn post_live_migration(&self, instance: &Instance) -> Result<bool> {
        let id = instance.uuid;
        let source_gone = !self.gateway().exists(id).await?;
        if !source_gone {
            warn!("⚠️ 热迁移完成后源端仍存在虚拟机: {}", id);
        }
        self.contexts.remove(id);
        info!("🧾 源端热迁移收尾完成: {}", id);
        Ok(source_gone)
    }

    /// 目标端收尾：校验虚拟机已在本机运行，移除上下文
    pub async fn post_live_migration_at_destination(&self, instance: &Instance) -> Result<InstanceState> {
        let id = instance.uuid;
        let state = self.gateway().power_state(id).await?;
        if !matches!(state, PowerState::Running | PowerState::Paused) {
            return Err(Error::MigrationExecution(format!(
                "热迁移后目标端虚拟机状态异常: {} ({})",
                id, state
            )));
        }
        self.contexts.remove(id);

        info!("✅ 目标端热迁移收尾完成: {}", id);
        Ok(state.to_instance_state())
    }

    /// 目标端回滚：删除残留虚拟机
    pub async fn rollback_live_migration_at_destination(
        &self,
        instance: &Instance,
        destroy_disks: bool,
    ) -> Result<()> {
        let id = instance.uuid;
        let _guard = self.orchestrator.lock(id, "rollback_live_migration")?;

        info!("↩️ 目标端热迁移回滚: {}", id);
        self.orchestrator.destroy_locked(id, destroy_disks).await?;
        self.contexts.remove(id);
        Ok(())
    }
}
