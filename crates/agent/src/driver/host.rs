/// 本机计算驱动

use async_trait::async_trait;
use common::models::{
    BlockDevice, ComputeNodeInfo, Flavor, ImageMeta, InjectedFile, Instance, InstanceInfo,
    InstanceState, LiveMigrationCheckData, Migration, MigrationDiskInfo, NetworkEndpoint,
    RebootType,
};
use common::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{ComputeDriver, DriverCapabilities};
use crate::collaborators::{Collaborators, ConsoleInfo, VolumeConnector};
use crate::events::{EventListener, EventReconciler, StateSink, Subscription};
use crate::hypervisor::{AttachedDisk, ConfigDrive, HypervisorGateway};
use crate::migration::cold::FinishMigrationParams;
use crate::migration::{MigrationCallback, MigrationCoordinator};
use crate::orchestrator::{LifecycleOrchestrator, PowerOffPolicy, SpawnParams};

pub struct HostDriver {
    orchestrator: Arc<LifecycleOrchestrator>,
    migrations: MigrationCoordinator,
    collaborators: Collaborators,
    listener: EventListener,
    subscription: Mutex<Option<Subscription>>,
}

impl HostDriver {
    pub fn new(
        orchestrator: Arc<LifecycleOrchestrator>,
        collaborators: Collaborators,
        event_poll_interval: Duration,
    ) -> Self {
        let listener = EventListener::new(orchestrator.gateway().clone(), event_poll_interval);
        Self {
            migrations: MigrationCoordinator::new(orchestrator.clone()),
            orchestrator,
            collaborators,
            listener,
            subscription: Mutex::new(None),
        }
    }

    pub fn orchestrator(&self) -> &Arc<LifecycleOrchestrator> {
        &self.orchestrator
    }

    pub fn migrations(&self) -> &MigrationCoordinator {
        &self.migrations
    }

    fn gateway(&self) -> &Arc<dyn HypervisorGateway> {
        self.orchestrator.gateway()
    }

    /// 依次连接卷，中途失败时断开已连接的卷
    async fn connect_volumes(&self, devices: &[BlockDevice]) -> Result<Vec<BlockDevice>> {
        let mut connected = Vec::with_capacity(devices.len());
        for device in devices {
            match self.collaborators.volumes.connect_volume(device).await {
                Ok(device) => connected.push(device),
                Err(e) => {
                    error!("❌ 连接存储卷失败: {} ({})", device.volume_id, e);
                    self.disconnect_volumes(&connected).await;
                    return Err(e);
                }
            }
        }
        Ok(connected)
    }

    async fn disconnect_volumes(&self, devices: &[BlockDevice]) {
        for device in devices {
            if let Err(e) = self.collaborators.volumes.disconnect_volume(device).await {
                warn!("⚠️ 断开存储卷失败: {} ({})", device.volume_id, e);
            }
        }
    }

    /// 虚拟机已不存在后的文件清理，失败只记录日志，重试删除是安全的
    async fn remove_instance_files(&self, id: Uuid) {
        if let Err(e) = self.collaborators.images.remove_instance_files(id).await {
            warn!("⚠️ 清理实例文件失败: {} ({})", id, e);
        }
    }
}

#[async_trait]
impl ComputeDriver for HostDriver {
    async fn init_host(&self, sink: Arc<dyn StateSink>) -> Result<()> {
        let reconciler = EventReconciler::new(self.orchestrator.locks().clone(), sink);
        let subscription = self.listener.subscribe(move |event| {
            reconciler.handle(event);
        });

        let previous = self.subscription.lock().await.replace(subscription);
        if let Some(previous) = previous {
            previous.unsubscribe().await;
        }

        info!("✅ 主机初始化完成: {}", self.gateway().host());
        Ok(())
    }

    async fn cleanup_host(&self) -> Result<()> {
        let subscription = self.subscription.lock().await.take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe().await;
        }
        Ok(())
    }

    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            has_imagecache: true,
            supports_recreate: false,
            supports_migrate_to_same_host: false,
        }
    }

    async fn list_instances(&self) -> Result<Vec<String>> {
        self.orchestrator.list_instances().await
    }

    async fn list_instance_uuids(&self) -> Result<Vec<Uuid>> {
        self.orchestrator.list_instance_uuids().await
    }

    async fn spawn(
        &self,
        instance: &Instance,
        image: &ImageMeta,
        injected_files: &[InjectedFile],
        admin_password: Option<&str>,
        network_info: &[NetworkEndpoint],
        block_device_info: &[BlockDevice],
    ) -> Result<InstanceState> {
        let id = instance.uuid;
        let guard = self.orchestrator.lock(id, "spawn")?;

        // 已存在的实例不能碰它的磁盘
        if self.gateway().exists(id).await? {
            return Err(Error::AlreadyExists(format!("虚拟机已存在: {}", id)));
        }

        let root_disk = if Instance::is_boot_from_volume(block_device_info) {
            None
        } else {
            match self.collaborators.images.prepare_root_disk(instance, image).await {
                Ok(disk) => Some(disk),
                Err(e) => {
                    error!("❌ 准备根盘失败: {} ({})", id, e);
                    self.remove_instance_files(id).await;
                    return Err(Error::Spawn(format!("准备根盘失败: {}", e)));
                }
            }
        };

        let devices = match self.connect_volumes(block_device_info).await {
            Ok(devices) => devices,
            Err(e) => {
                self.remove_instance_files(id).await;
                return Err(Error::Spawn(format!("连接存储卷失败: {}", e)));
            }
        };

        let config_drive = if injected_files.is_empty() && admin_password.is_none() {
            None
        } else {
            Some(ConfigDrive {
                injected_files: injected_files.to_vec(),
                admin_password: admin_password.map(str::to_string),
            })
        };

        let params = SpawnParams {
            instance,
            root_disk,
            block_devices: &devices,
            network_info,
            config_drive,
        };
        match self.orchestrator.spawn_locked(&guard, params).await {
            Ok(state) => Ok(state),
            Err(e) => {
                self.disconnect_volumes(&devices).await;
                self.remove_instance_files(id).await;
                Err(match e {
                    Error::Spawn(_) => e,
                    other => Error::Spawn(other.to_string()),
                })
            }
        }
    }

    async fn destroy(
        &self,
        instance: &Instance,
        _network_info: &[NetworkEndpoint],
        block_device_info: &[BlockDevice],
        destroy_disks: bool,
    ) -> Result<InstanceState> {
        let id = instance.uuid;
        let _guard = self.orchestrator.lock(id, "destroy")?;

        let state = self.orchestrator.destroy_locked(id, destroy_disks).await?;
        self.disconnect_volumes(block_device_info).await;
        if destroy_disks {
            self.remove_instance_files(id).await;
        }
        Ok(state)
    }

    async fn cleanup(
        &self,
        instance: &Instance,
        _network_info: &[NetworkEndpoint],
        _block_device_info: &[BlockDevice],
        _destroy_disks: bool,
    ) -> Result<()> {
        debug!("cleanup: {} 无需额外清理", instance.uuid);
        Ok(())
    }

    async fn reboot(
        &self,
        instance: &Instance,
        _network_info: &[NetworkEndpoint],
        reboot_type: RebootType,
    ) -> Result<InstanceState> {
        self.orchestrator.reboot(instance, reboot_type).await
    }

    async fn pause(&self, instance: &Instance) -> Result<InstanceState> {
        self.orchestrator.pause(instance).await
    }

    async fn unpause(&self, instance: &Instance) -> Result<InstanceState> {
        self.orchestrator.unpause(instance).await
    }

    async fn suspend(&self, instance: &Instance) -> Result<InstanceState> {
        self.orchestrator.suspend(instance).await
    }

    async fn resume(
        &self,
        instance: &Instance,
        _network_info: &[NetworkEndpoint],
        _block_device_info: &[BlockDevice],
    ) -> Result<InstanceState> {
        self.orchestrator.resume(instance).await
    }

    async fn power_off(&self, instance: &Instance, timeout: u64, retry_interval: u64) -> Result<InstanceState> {
        self.orchestrator
            .power_off(instance, PowerOffPolicy::new(timeout, retry_interval))
            .await
    }

    async fn power_on(
        &self,
        instance: &Instance,
        _network_info: &[NetworkEndpoint],
        block_device_info: &[BlockDevice],
    ) -> Result<InstanceState> {
        let devices = self.connect_volumes(block_device_info).await?;
        self.orchestrator.power_on(instance, &devices).await
    }

    async fn resume_state_on_host_boot(
        &self,
        instance: &Instance,
        _network_info: &[NetworkEndpoint],
        block_device_info: &[BlockDevice],
    ) -> Result<InstanceState> {
        let devices = self.connect_volumes(block_device_info).await?;
        self.orchestrator
            .resume_state_on_host_boot(instance, &devices)
            .await
    }

    async fn rescue(
        &self,
        instance: &Instance,
        _network_info: &[NetworkEndpoint],
        rescue_image: &ImageMeta,
        rescue_password: Option<&str>,
    ) -> Result<InstanceState> {
        let id = instance.uuid;
        let guard = self.orchestrator.lock(id, "rescue")?;

        self.orchestrator.check_rescuable(&guard).await?;
        let image_path = self
            .collaborators
            .images
            .get_rescue_image(instance, rescue_image)
            .await?;
        if rescue_password.is_some() {
            debug!("救援密码由救援镜像自行处理: {}", id);
        }

        match self.orchestrator.rescue_locked(&guard, &image_path).await {
            Ok(state) => Ok(state),
            Err(e) => {
                error!("❌ 进入救援模式失败，执行 unrescue 补偿: {} ({})", id, e);
                if let Err(ue) = self.orchestrator.unrescue_locked(&guard).await {
                    error!("❌ unrescue 补偿失败: {} ({})", id, ue);
                }
                Err(e)
            }
        }
    }

    async fn unrescue(&self, instance: &Instance, _network_info: &[NetworkEndpoint]) -> Result<InstanceState> {
        self.orchestrator.unrescue(instance.uuid).await
    }

    async fn get_info(&self, instance: &Instance) -> Result<InstanceInfo> {
        self.orchestrator.get_info(instance).await
    }

    async fn get_instance_disk_info(&self, instance: &Instance) -> Result<Vec<AttachedDisk>> {
        self.orchestrator.get_instance_disk_info(instance).await
    }

    async fn snapshot(&self, instance: &Instance, image_id: &str) -> Result<String> {
        let _guard = self.orchestrator.lock(instance.uuid, "snapshot")?;
        let path = self.collaborators.snapshots.snapshot(instance, image_id).await?;
        info!("✅ 快照完成: {} -> {}", instance.uuid, path);
        Ok(path)
    }

    async fn attach_volume(
        &self,
        instance: &Instance,
        connection_info: &BlockDevice,
        mountpoint: Option<&str>,
    ) -> Result<()> {
        let _guard = self.orchestrator.lock(instance.uuid, "attach_volume")?;
        debug!("挂载点: {:?}", mountpoint);
        self.collaborators
            .volumes
            .attach_volume(instance, connection_info)
            .await
    }

    async fn detach_volume(
        &self,
        instance: &Instance,
        connection_info: &BlockDevice,
        _mountpoint: Option<&str>,
    ) -> Result<()> {
        let _guard = self.orchestrator.lock(instance.uuid, "detach_volume")?;
        self.collaborators
            .volumes
            .detach_volume(instance, connection_info)
            .await
    }

    fn get_volume_connector(&self, instance: &Instance) -> VolumeConnector {
        self.collaborators.volumes.volume_connector(instance)
    }

    async fn get_serial_console(&self, instance: &Instance) -> Result<ConsoleInfo> {
        self.collaborators.consoles.get_serial_console(instance).await
    }

    async fn get_console_output(&self, instance: &Instance) -> Result<String> {
        self.collaborators.consoles.get_console_output(instance).await
    }

    async fn get_rdp_console(&self, instance: &Instance) -> Result<ConsoleInfo> {
        self.collaborators.consoles.get_rdp_console(instance).await
    }

    async fn manage_image_cache(&self, all_instances: &[Instance]) -> Result<Vec<String>> {
        self.collaborators.images.manage_image_cache(all_instances).await
    }

    async fn plug_vifs(&self, instance: &Instance, _network_info: &[NetworkEndpoint]) -> Result<()> {
        Err(Error::NotSupported(format!("不支持单独插入网卡: {}", instance.uuid)))
    }

    async fn unplug_vifs(&self, instance: &Instance, _network_info: &[NetworkEndpoint]) -> Result<()> {
        Err(Error::NotSupported(format!("不支持单独拔出网卡: {}", instance.uuid)))
    }

    async fn ensure_filtering_rules_for_instance(
        &self,
        instance: &Instance,
        _network_info: &[NetworkEndpoint],
    ) -> Result<()> {
        debug!("ensure_filtering_rules_for_instance: {} (无操作)", instance.uuid);
        Ok(())
    }

    async fn unfilter_instance(&self, instance: &Instance, _network_info: &[NetworkEndpoint]) -> Result<()> {
        debug!("unfilter_instance: {} (无操作)", instance.uuid);
        Ok(())
    }

    async fn check_can_live_migrate_destination(
        &self,
        instance: &Instance,
        src_compute_info: &ComputeNodeInfo,
        dst_compute_info: &ComputeNodeInfo,
        block_migration: bool,
        disk_over_commit: bool,
    ) -> Result<LiveMigrationCheckData> {
        self.migrations
            .check_can_live_migrate_destination(
                instance,
                src_compute_info,
                dst_compute_info,
                block_migration,
                disk_over_commit,
            )
            .await
    }

    async fn check_can_live_migrate_destination_cleanup(
        &self,
        dest_check_data: &LiveMigrationCheckData,
    ) -> Result<()> {
        self.migrations
            .check_can_live_migrate_destination_cleanup(dest_check_data)
            .await
    }

    async fn check_can_live_migrate_source(
        &self,
        instance: &Instance,
        dest_check_data: &LiveMigrationCheckData,
    ) -> Result<LiveMigrationCheckData> {
        self.migrations
            .check_can_live_migrate_source(instance, dest_check_data)
            .await
    }

    async fn pre_live_migration(
        &self,
        instance: &Instance,
        block_device_info: &[BlockDevice],
        _network_info: &[NetworkEndpoint],
        migrate_data: Option<&LiveMigrationCheckData>,
    ) -> Result<()> {
        let id = instance.uuid;
        self.migrations.pre_live_migration(instance, migrate_data).await?;

        let devices = match self.connect_volumes(block_device_info).await {
            Ok(devices) => devices,
            Err(e) => {
                self.migrations.contexts().remove(id);
                return Err(e);
            }
        };

        // 非块迁移时目标端需要同一个基础镜像作为 backing file
        if !Instance::is_boot_from_volume(block_device_info) {
            if let Some(image_ref) = &instance.image_ref {
                let image = ImageMeta {
                    id: image_ref.clone(),
                    disk_format: "qcow2".to_string(),
                };
                if let Err(e) = self.collaborators.images.get_cached_image(&image).await {
                    error!("❌ 目标端缺少基础镜像: {} ({})", image_ref, e);
                    self.disconnect_volumes(&devices).await;
                    self.migrations.contexts().remove(id);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn live_migration(
        &self,
        instance: &Instance,
        dest: &str,
        post_method: MigrationCallback,
        recover_method: MigrationCallback,
        block_migration: bool,
        migrate_data: Option<LiveMigrationCheckData>,
    ) -> Result<()> {
        self.migrations
            .live_migration(
                instance,
                dest,
                post_method,
                recover_method,
                block_migration,
                migrate_data,
            )
            .await
    }

    async fn post_live_migration(&self, instance: &Instance, block_device_info: &[BlockDevice]) -> Result<()> {
        let source_gone = self.migrations.post_live_migration(instance).await?;
        self.disconnect_volumes(block_device_info).await;
        if source_gone {
            self.remove_instance_files(instance.uuid).await;
        }
        Ok(())
    }

    async fn post_live_migration_at_destination(
        &self,
        instance: &Instance,
        _network_info: &[NetworkEndpoint],
        _block_migration: bool,
    ) -> Result<InstanceState> {
        self.migrations
            .post_live_migration_at_destination(instance)
            .await
    }

    async fn rollback_live_migration_at_destination(
        &self,
        instance: &Instance,
        _network_info: &[NetworkEndpoint],
        block_device_info: &[BlockDevice],
        destroy_disks: bool,
    ) -> Result<()> {
        self.migrations
            .rollback_live_migration_at_destination(instance, destroy_disks)
            .await?;
        self.disconnect_volumes(block_device_info).await;
        if destroy_disks {
            self.remove_instance_files(instance.uuid).await;
        }
        Ok(())
    }

    async fn migrate_disk_and_power_off(
        &self,
        instance: &Instance,
        dest: &str,
        flavor: &Flavor,
        _network_info: &[NetworkEndpoint],
        _block_device_info: &[BlockDevice],
        timeout: u64,
        retry_interval: u64,
    ) -> Result<MigrationDiskInfo> {
        // 卷在确认迁移前保持连接，回滚时还要用
        self.migrations
            .migrate_disk_and_power_off(
                instance,
                dest,
                flavor,
                PowerOffPolicy::new(timeout, retry_interval),
            )
            .await
    }

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
    ) -> Result<InstanceState> {
        debug!("finish_migration: {} (镜像 {})", instance.uuid, image_meta.id);
        let devices = self.connect_volumes(block_device_info).await?;

        let params = FinishMigrationParams {
            migration,
            instance,
            disk_info,
            network_info,
            block_devices: &devices,
            resize_instance,
            power_on,
        };
        match self.migrations.finish_migration(params).await {
            Ok(state) => Ok(state),
            Err(e) => {
                self.disconnect_volumes(&devices).await;
                if !matches!(e, Error::AlreadyExists(_) | Error::InvalidStateTransition(_)) {
                    self.remove_instance_files(instance.uuid).await;
                }
                Err(e)
            }
        }
    }

    async fn confirm_migration(
        &self,
        migration: &Migration,
        instance: &Instance,
        _network_info: &[NetworkEndpoint],
    ) -> Result<()> {
        self.migrations.confirm_migration(migration, instance).await?;
        self.disconnect_volumes(&instance.block_devices).await;
        self.remove_instance_files(instance.uuid).await;
        Ok(())
    }

    async fn finish_revert_migration(
        &self,
        instance: &Instance,
        _network_info: &[NetworkEndpoint],
        block_device_info: &[BlockDevice],
        power_on: bool,
    ) -> Result<InstanceState> {
        self.migrations
            .finish_revert_migration(instance, block_device_info, power_on)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::local::{LocalConsoleOps, LocalSnapshotOps, LocalVolumeOps};
    use crate::collaborators::ImageCache;
    use crate::hypervisor::memory::{GatewayOp, InjectedFailure};
    use crate::hypervisor::InMemoryHypervisor;
    use crate::orchestrator::{rescue_disk_id, root_disk_id, InstanceLocks};
    use common::models::{HostEvent, MigrationType, PowerState};
    use futures_util::FutureExt;
    use std::sync::Mutex as StdMutex;

    /// 不依赖 qemu-img 的镜像缓存
    #[derive(Default)]
    struct StubImages {
        missing: StdMutex<bool>,
        virtual_size: StdMutex<u64>,
        fail_remove: StdMutex<bool>,
        removed: StdMutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl ImageCache for StubImages {
        async fn get_cached_image(&self, image: &ImageMeta) -> Result<String> {
            if *self.missing.lock().unwrap() {
                return Err(Error::NotFound(format!("镜像未缓存: {}", image.id)));
            }
            Ok(format!("/images/{}.{}", image.id, image.disk_format))
        }

        async fn prepare_root_disk(&self, instance: &Instance, image: &ImageMeta) -> Result<AttachedDisk> {
            self.get_cached_image(image).await?;
            Ok(AttachedDisk {
                disk_id: root_disk_id(instance.uuid),
                path: format!("/instances/{}/root.qcow2", instance.uuid),
                format: "qcow2".to_string(),
                boot: true,
            })
        }

        async fn image_virtual_size(&self, _path: &str) -> Result<u64> {
            Ok(*self.virtual_size.lock().unwrap())
        }

        async fn remove_instance_files(&self, instance_id: Uuid) -> Result<()> {
            if *self.fail_remove.lock().unwrap() {
                return Err(Error::Storage(format!("实例目录被占用: {}", instance_id)));
            }
            self.removed.lock().unwrap().push(instance_id);
            Ok(())
        }

        async fn manage_image_cache(&self, _all_instances: &[Instance]) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct RecordingSink(StdMutex<Vec<HostEvent>>);

    impl StateSink for RecordingSink {
        fn instance_state_changed(&self, event: &HostEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    struct Fixture {
        hv: Arc<InMemoryHypervisor>,
        images: Arc<StubImages>,
        volumes: Arc<LocalVolumeOps>,
        driver: HostDriver,
    }

    fn fixture(host: &str) -> Fixture {
        let hv = Arc::new(InMemoryHypervisor::new(host));
        let images = Arc::new(StubImages::default());
        let volumes = Arc::new(LocalVolumeOps::new(hv.clone(), host, "10.0.0.1"));
        let scratch = std::env::temp_dir().join(format!("hv-agent-test-{}", Uuid::new_v4()));
        let collaborators = Collaborators {
            volumes: volumes.clone(),
            images: images.clone(),
            snapshots: Arc::new(LocalSnapshotOps::new(hv.clone(), scratch.join("images"))),
            consoles: Arc::new(LocalConsoleOps::new(hv.clone(), host, scratch.join("instances"))),
        };
        let orchestrator = Arc::new(LifecycleOrchestrator::new(hv.clone(), InstanceLocks::new()));
        Fixture {
            hv,
            images,
            volumes,
            driver: HostDriver::new(orchestrator, collaborators, Duration::from_secs(1)),
        }
    }

    fn image() -> ImageMeta {
        ImageMeta {
            id: "img-1".to_string(),
            disk_format: "qcow2".to_string(),
        }
    }

    fn data_volume() -> BlockDevice {
        BlockDevice {
            volume_id: "vol-1".to_string(),
            path: "/dev/sdb".to_string(),
            format: "raw".to_string(),
            boot: false,
        }
    }

    async fn spawn(f: &Fixture, instance: &Instance, devices: &[BlockDevice]) -> Result<InstanceState> {
        f.driver
            .spawn(instance, &image(), &[], None, &[], devices)
            .await
    }

    #[tokio::test]
    async fn test_lifecycle_scenario() {
        let f = fixture("host-a");
        let instance = Instance::new("vm-1", 2, 1024, 10);

        assert_eq!(spawn(&f, &instance, &[]).await.unwrap(), InstanceState::Running);
        assert_eq!(f.driver.pause(&instance).await.unwrap(), InstanceState::Paused);
        assert_eq!(f.driver.unpause(&instance).await.unwrap(), InstanceState::Running);
        assert_eq!(
            f.driver.destroy(&instance, &[], &[], true).await.unwrap(),
            InstanceState::NotExist
        );
        assert!(f.driver.get_info(&instance).await.unwrap_err().is_not_found());
        assert_eq!(*f.images.removed.lock().unwrap(), vec![instance.uuid]);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let f = fixture("host-a");
        let instance = Instance::new("vm-1", 1, 512, 10);
        spawn(&f, &instance, &[data_volume()]).await.unwrap();
        assert!(f.volumes.is_connected("vol-1"));

        for _ in 0..2 {
            let state = f
                .driver
                .destroy(&instance, &[], &[data_volume()], true)
                .await
                .unwrap();
            assert_eq!(state, InstanceState::NotExist);
        }
        assert!(!f.volumes.is_connected("vol-1"));
    }

    #[tokio::test]
    async fn test_spawn_existing_instance_leaves_files() {
        let f = fixture("host-a");
        let instance = Instance::new("vm-1", 1, 512, 10);
        spawn(&f, &instance, &[]).await.unwrap();

        let err = spawn(&f, &instance, &[]).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        assert!(f.images.removed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_releases_resources() {
        let f = fixture("host-a");
        let instance = Instance::new("vm-1", 1, 512, 10);
        f.hv
            .inject_failure(GatewayOp::SetPowerState, InjectedFailure::Hypervisor("启动失败".into()))
            .await;

        let err = spawn(&f, &instance, &[data_volume()]).await.unwrap_err();
        assert!(matches!(err, Error::Spawn(_)));
        assert!(!f.hv.exists(instance.uuid).await.unwrap());
        assert!(!f.volumes.is_connected("vol-1"));
        assert_eq!(*f.images.removed.lock().unwrap(), vec![instance.uuid]);
    }

    #[tokio::test]
    async fn test_spawn_with_config_drive_from_volume() {
        let f = fixture("host-a");
        let instance = Instance::new("vm-1", 1, 512, 10);
        let boot_volume = BlockDevice {
            boot: true,
            ..data_volume()
        };
        let files = vec![InjectedFile {
            path: "/etc/motd".to_string(),
            contents: "hello".to_string(),
        }];

        f.driver
            .spawn(&instance, &image(), &files, Some("secret"), &[], &[boot_volume])
            .await
            .unwrap();

        let disks = f.driver.get_instance_disk_info(&instance).await.unwrap();
        assert_eq!(disks.len(), 1);
        assert_eq!(disks[0].disk_id, "vol-1");
        assert!(disks[0].boot);
    }

    #[tokio::test]
    async fn test_rescue_failure_restores_pre_rescue_state() {
        let f = fixture("host-a");
        let instance = Instance::new("vm-1", 1, 512, 10);
        spawn(&f, &instance, &[]).await.unwrap();
        f.driver.pause(&instance).await.unwrap();

        f.hv
            .inject_failure(GatewayOp::AttachDisk, InjectedFailure::Hypervisor("挂载失败".into()))
            .await;
        assert!(f.driver.rescue(&instance, &[], &image(), None).await.is_err());

        let info = f.driver.get_info(&instance).await.unwrap();
        assert_eq!(info.state, InstanceState::Paused);
        assert!(!f.driver.orchestrator().is_rescued(instance.uuid));
        let handle = f.hv.get_instance(instance.uuid).await.unwrap();
        assert!(handle.disk(&rescue_disk_id(instance.uuid)).is_none());
    }

    #[tokio::test]
    async fn test_rescue_and_unrescue() {
        let f = fixture("host-a");
        let instance = Instance::new("vm-1", 1, 512, 10);
        spawn(&f, &instance, &[]).await.unwrap();

        assert_eq!(
            f.driver.rescue(&instance, &[], &image(), Some("pw")).await.unwrap(),
            InstanceState::Rescued
        );
        assert_eq!(f.driver.get_info(&instance).await.unwrap().state, InstanceState::Rescued);

        assert_eq!(f.driver.unrescue(&instance, &[]).await.unwrap(), InstanceState::Running);
        // 再次 unrescue 不做任何操作
        assert_eq!(f.driver.unrescue(&instance, &[]).await.unwrap(), InstanceState::Running);
    }

    #[tokio::test]
    async fn test_rescue_without_cached_image_has_no_side_effects() {
        let f = fixture("host-a");
        let instance = Instance::new("vm-1", 1, 512, 10);
        spawn(&f, &instance, &[]).await.unwrap();
        *f.images.missing.lock().unwrap() = true;

        let err = f.driver.rescue(&instance, &[], &image(), None).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(
            f.hv.power_state(instance.uuid).await.unwrap(),
            PowerState::Running
        );
    }

    #[tokio::test]
    async fn test_rescue_image_larger_than_root_disk_refused() {
        let f = fixture("host-a");
        let instance = Instance::new("vm-1", 1, 512, 10);
        spawn(&f, &instance, &[]).await.unwrap();
        *f.images.virtual_size.lock().unwrap() = 20 * 1024 * 1024 * 1024;

        let err = f.driver.rescue(&instance, &[], &image(), None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(
            f.hv.power_state(instance.uuid).await.unwrap(),
            PowerState::Running
        );
        assert!(!f.driver.orchestrator().is_rescued(instance.uuid));
        let handle = f.hv.get_instance(instance.uuid).await.unwrap();
        assert!(handle.disk(&rescue_disk_id(instance.uuid)).is_none());
    }

    #[tokio::test]
    async fn test_destroy_succeeds_when_file_cleanup_fails() {
        let f = fixture("host-a");
        let instance = Instance::new("vm-1", 1, 512, 10);
        spawn(&f, &instance, &[]).await.unwrap();
        *f.images.fail_remove.lock().unwrap() = true;

        let state = f.driver.destroy(&instance, &[], &[], true).await.unwrap();
        assert_eq!(state, InstanceState::NotExist);
        assert!(!f.hv.exists(instance.uuid).await.unwrap());

        // 重试删除只清理文件
        *f.images.fail_remove.lock().unwrap() = false;
        f.driver.destroy(&instance, &[], &[], true).await.unwrap();
        assert_eq!(*f.images.removed.lock().unwrap(), vec![instance.uuid]);
    }

    #[tokio::test]
    async fn test_post_live_migration_removes_source_files() {
        let src = fixture("host-a");
        let dst = fixture("host-b");
        src.hv.connect_peer(dst.hv.clone()).await;
        let instance = Instance::new("vm-1", 1, 512, 10);
        spawn(&src, &instance, &[data_volume()]).await.unwrap();

        let noop = || -> MigrationCallback { Box::new(|_, _, _| async { Ok(()) }.boxed()) };
        src.driver
            .live_migration(&instance, "host-b", noop(), noop(), true, None)
            .await
            .unwrap();
        src.driver
            .post_live_migration(&instance, &[data_volume()])
            .await
            .unwrap();

        assert!(!src.hv.exists(instance.uuid).await.unwrap());
        assert!(dst.hv.exists(instance.uuid).await.unwrap());
        assert!(!src.volumes.is_connected("vol-1"));
        assert_eq!(*src.images.removed.lock().unwrap(), vec![instance.uuid]);
    }

    #[tokio::test]
    async fn test_conflicting_operations_one_succeeds() {
        let f = fixture("host-a");
        let instance = Instance::new("vm-1", 1, 512, 10);
        spawn(&f, &instance, &[]).await.unwrap();
        f.hv.set_latency(Duration::from_millis(20)).await;

        let (paused, destroyed) = tokio::join!(
            f.driver.pause(&instance),
            f.driver.destroy(&instance, &[], &[], true),
        );
        assert_eq!(paused.is_ok() as u8 + destroyed.is_ok() as u8, 1);
        let rejected = paused.err().or(destroyed.err()).unwrap();
        assert!(matches!(rejected, Error::InvalidStateTransition(_)));
    }

    #[tokio::test]
    async fn test_power_off_zero_timeout_is_immediate() {
        let f = fixture("host-a");
        let instance = Instance::new("vm-1", 1, 512, 10);
        spawn(&f, &instance, &[]).await.unwrap();

        assert_eq!(
            f.driver.power_off(&instance, 0, 0).await.unwrap(),
            InstanceState::PoweredOff
        );
        assert_eq!(
            f.driver.power_on(&instance, &[], &[]).await.unwrap(),
            InstanceState::Running
        );
    }

    #[tokio::test]
    async fn test_vifs_not_supported() {
        let f = fixture("host-a");
        let instance = Instance::new("vm-1", 1, 512, 10);
        assert!(matches!(
            f.driver.plug_vifs(&instance, &[]).await.unwrap_err(),
            Error::NotSupported(_)
        ));
        assert!(matches!(
            f.driver.unplug_vifs(&instance, &[]).await.unwrap_err(),
            Error::NotSupported(_)
        ));
        assert!(f.driver.ensure_filtering_rules_for_instance(&instance, &[]).await.is_ok());
        assert!(f.driver.unfilter_instance(&instance, &[]).await.is_ok());
        assert!(!f.driver.capabilities().supports_migrate_to_same_host);
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_host_forwards_state_changes() {
        let f = fixture("host-a");
        let instance = Instance::new("vm-1", 1, 512, 10);
        spawn(&f, &instance, &[]).await.unwrap();

        let sink = Arc::new(RecordingSink::default());
        f.driver.init_host(sink.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        f.hv
            .set_external_power_state(instance.uuid, PowerState::Stopped)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        f.driver.cleanup_host().await.unwrap();

        let events = sink.0.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].instance_id, instance.uuid);
        assert_eq!(events[0].state, PowerState::Stopped);
    }

    #[tokio::test]
    async fn test_pre_live_migration_without_image_removes_context() {
        let f = fixture("host-b");
        let mut instance = Instance::new("vm-1", 1, 512, 10);
        instance.image_ref = Some("img-1".to_string());
        *f.images.missing.lock().unwrap() = true;

        let err = f
            .driver
            .pre_live_migration(&instance, &[data_volume()], &[], None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(f.driver.migrations().contexts().is_empty());
        assert!(!f.volumes.is_connected("vol-1"));
    }

    #[tokio::test]
    async fn test_cold_migration_confirm() {
        let src = fixture("host-a");
        let dst = fixture("host-b");
        let instance = Instance::new("vm-1", 1, 512, 10);
        spawn(&src, &instance, &[]).await.unwrap();

        let flavor = Flavor {
            name: "m1.small".to_string(),
            vcpus: 1,
            memory_mb: 512,
            root_gb: 10,
        };
        let disk_info = src
            .driver
            .migrate_disk_and_power_off(&instance, "host-b", &flavor, &[], &[], 0, 0)
            .await
            .unwrap();

        let migration = Migration {
            id: "mig-1".to_string(),
            instance_id: instance.uuid,
            source_host: "host-a".to_string(),
            dest_host: "host-b".to_string(),
            migration_type: MigrationType::Cold,
        };
        let state = dst
            .driver
            .finish_migration(&migration, &instance, &disk_info, &[], &image(), false, &[], true)
            .await
            .unwrap();
        assert_eq!(state, InstanceState::Running);

        src.driver.confirm_migration(&migration, &instance, &[]).await.unwrap();
        assert!(!src.hv.exists(instance.uuid).await.unwrap());
        assert_eq!(*src.images.removed.lock().unwrap(), vec![instance.uuid]);

        // 确认之后不能回滚
        let err = src
            .driver
            .finish_revert_migration(&instance, &[], &[], true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition(_)));
    }
}
