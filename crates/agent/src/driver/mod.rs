/// 计算驱动
///
/// 控制端的每个请求对应 `ComputeDriver` 的一个方法。驱动层负责协调
/// 编排器、迁移协调器和外部协作者（卷、镜像、快照、控制台），
/// 所有补偿动作在错误离开驱动层之前完成。

pub mod host;

use async_trait::async_trait;
use common::models::{
    BlockDevice, ComputeNodeInfo, Flavor, ImageMeta, InjectedFile, Instance, InstanceInfo,
    InstanceState, LiveMigrationCheckData, Migration, MigrationDiskInfo, NetworkEndpoint,
    RebootType,
};
use common::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::collaborators::{ConsoleInfo, VolumeConnector};
use crate::events::StateSink;
use crate::hypervisor::AttachedDisk;
use crate::migration::MigrationCallback;

pub use host::HostDriver;

/// 驱动能力
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DriverCapabilities {
    pub has_imagecache: bool,
    pub supports_recreate: bool,
    /// 冷迁移在确认前保留源端虚拟机，同一主机上无法并存两份
    pub supports_migrate_to_same_host: bool,
}

#[async_trait]
pub trait ComputeDriver: Send + Sync {
    // ------------------------------------------------------------------
    // 主机
    // ------------------------------------------------------------------

    /// 启动状态事件订阅，事件经对账后交给 `sink`
    async fn init_host(&self, sink: Arc<dyn StateSink>) -> Result<()>;

    /// 停止状态事件订阅
    async fn cleanup_host(&self) -> Result<()>;

    fn capabilities(&self) -> DriverCapabilities;

    async fn list_instances(&self) -> Result<Vec<String>>;

    async fn list_instance_uuids(&self) -> Result<Vec<Uuid>>;

    // ------------------------------------------------------------------
    // 生命周期
    // ------------------------------------------------------------------

    async fn spawn(
        &self,
        instance: &Instance,
        image: &ImageMeta,
        injected_files: &[InjectedFile],
        admin_password: Option<&str>,
        network_info: &[NetworkEndpoint],
        block_device_info: &[BlockDevice],
    ) -> Result<InstanceState>;

    async fn destroy(
        &self,
        instance: &Instance,
        network_info: &[NetworkEndpoint],
        block_device_info: &[BlockDevice],
        destroy_disks: bool,
    ) -> Result<InstanceState>;

    /// 实例删除后的额外清理钩子
    async fn cleanup(
        &self,
        instance: &Instance,
        network_info: &[NetworkEndpoint],
        block_device_info: &[BlockDevice],
        destroy_disks: bool,
    ) -> Result<()>;

    async fn reboot(
        &self,
        instance: &Instance,
        network_info: &[NetworkEndpoint],
        reboot_type: RebootType,
    ) -> Result<InstanceState>;

    async fn pause(&self, instance: &Instance) -> Result<InstanceState>;

    async fn unpause(&self, instance: &Instance) -> Result<InstanceState>;

    async fn suspend(&self, instance: &Instance) -> Result<InstanceState>;

    async fn resume(
        &self,
        instance: &Instance,
        network_info: &[NetworkEndpoint],
        block_device_info: &[BlockDevice],
    ) -> Result<InstanceState>;

    /// `timeout` 为 0 时立即强制关机
    async fn power_off(&self, instance: &Instance, timeout: u64, retry_interval: u64) -> Result<InstanceState>;

    async fn power_on(
        &self,
        instance: &Instance,
        network_info: &[NetworkEndpoint],
        block_device_info: &[BlockDevice],
    ) -> Result<InstanceState>;

    async fn resume_state_on_host_boot(
        &self,
        instance: &Instance,
        network_info: &[NetworkEndpoint],
        block_device_info: &[BlockDevice],
    ) -> Result<InstanceState>;

    async fn rescue(
        &self,
        instance: &Instance,
        network_info: &[NetworkEndpoint],
        rescue_image: &ImageMeta,
        rescue_password: Option<&str>,
    ) -> Result<InstanceState>;

    async fn unrescue(&self, instance: &Instance, network_info: &[NetworkEndpoint]) -> Result<InstanceState>;

    async fn get_info(&self, instance: &Instance) -> Result<InstanceInfo>;

    async fn get_instance_disk_info(&self, instance: &Instance) -> Result<Vec<AttachedDisk>>;

    async fn snapshot(&self, instance: &Instance, image_id: &str) -> Result<String>;

    // ------------------------------------------------------------------
    // 卷与控制台
    // ------------------------------------------------------------------

    async fn attach_volume(
        &self,
        instance: &Instance,
        connection_info: &BlockDevice,
        mountpoint: Option<&str>,
    ) -> Result<()>;

    async fn detach_volume(
        &self,
        instance: &Instance,
        connection_info: &BlockDevice,
        mountpoint: Option<&str>,
    ) -> Result<()>;

    fn get_volume_connector(&self, instance: &Instance) -> VolumeConnector;

    async fn get_serial_console(&self, instance: &Instance) -> Result<ConsoleInfo>;

    async fn get_console_output(&self, instance: &Instance) -> Result<String>;

    async fn get_rdp_console(&self, instance: &Instance) -> Result<ConsoleInfo>;

    async fn manage_image_cache(&self, all_instances: &[Instance]) -> Result<Vec<String>>;

    // ------------------------------------------------------------------
    // 网络
    // ------------------------------------------------------------------

    async fn plug_vifs(&self, instance: &Instance, network_info: &[NetworkEndpoint]) -> Result<()>;

    async fn unplug_vifs(&self, instance: &Instance, network_info: &[NetworkEndpoint]) -> Result<()>;

    async fn ensure_filtering_rules_for_instance(
        &self,
        instance: &Instance,
        network_info: &[NetworkEndpoint],
    ) -> Result<()>;

    async fn unfilter_instance(&self, instance: &Instance, network_info: &[NetworkEndpoint]) -> Result<()>;

    // ------------------------------------------------------------------
    // 热迁移
    // ------------------------------------------------------------------

    async fn check_can_live_migrate_destination(
        &self,
        instance: &Instance,
        src_compute_info: &ComputeNodeInfo,
        dst_compute_info: &ComputeNodeInfo,
        block_migration: bool,
        disk_over_commit: bool,
    ) -> Result<LiveMigrationCheckData>;

    async fn check_can_live_migrate_destination_cleanup(
        &self,
        dest_check_data: &LiveMigrationCheckData,
    ) -> Result<()>;

    async fn check_can_live_migrate_source(
        &self,
        instance: &Instance,
        dest_check_data: &LiveMigrationCheckData,
    ) -> Result<LiveMigrationCheckData>;

    async fn pre_live_migration(
        &self,
        instance: &Instance,
        block_device_info: &[BlockDevice],
        network_info: &[NetworkEndpoint],
        migrate_data: Option<&LiveMigrationCheckData>,
    ) -> Result<()>;

    /// 成功时调用一次 `post_method`，失败时调用一次 `recover_method`
    async fn live_migration(
        &self,
        instance: &Instance,
        dest: &str,
        post_method: MigrationCallback,
        recover_method: MigrationCallback,
        block_migration: bool,
        migrate_data: Option<LiveMigrationCheckData>,
    ) -> Result<()>;

    async fn post_live_migration(&self, instance: &Instance, block_device_info: &[BlockDevice]) -> Result<()>;

    async fn post_live_migration_at_destination(
        &self,
        instance: &Instance,
        network_info: &[NetworkEndpoint],
        block_migration: bool,
    ) -> Result<InstanceState>;

    async fn rollback_live_migration_at_destination(
        &self,
        instance: &Instance,
        network_info: &[NetworkEndpoint],
        block_device_info: &[BlockDevice],
        destroy_disks: bool,
    ) -> Result<()>;

    // ------------------------------------------------------------------
    // 冷迁移 / 变更规格
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn migrate_disk_and_power_off(
        &self,
        instance: &Instance,
        dest: &str,
        flavor: &Flavor,
        network_info: &[NetworkEndpoint],
        block_device_info: &[BlockDevice],
        timeout: u64,
        retry_interval: u64,
    ) -> Result<MigrationDiskInfo>;

    #[allow(clippy::too_many_arguments)]
    async fn finish_migration(
        &self,
        migration: &Migration,
        instance: &Instance,
        disk_info: &MigrationDiskInfo,
        network_info: &[NetworkEndpoint],
        image_meta: &ImageMeta,
        resize_instance: bool,
        block_device_info: &[BlockDevice],
        power_on: bool,
    ) -> Result<InstanceState>;

    async fn confirm_migration(
        &self,
        migration: &Migration,
        instance: &Instance,
        network_info: &[NetworkEndpoint],
    ) -> Result<()>;

    async fn finish_revert_migration(
        &self,
        instance: &Instance,
        network_info: &[NetworkEndpoint],
        block_device_info: &[BlockDevice],
        power_on: bool,
    ) -> Result<InstanceState>;
}
