/// 本机协作者实现
///
/// 镜像和实例磁盘都是本地（或共享挂载）目录下的 qcow2/raw 文件，
/// 通过 qemu-img 创建差分盘和导出快照。

use async_trait::async_trait;
use common::models::{BlockDevice, ImageMeta, Instance};
use common::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{ConsoleInfo, ConsoleOps, ImageCache, SnapshotOps, VolumeConnector, VolumeOps};
use crate::hypervisor::{AttachedDisk, HypervisorGateway};
use crate::orchestrator::root_disk_id;

/// 执行 qemu-img，返回标准输出
async fn qemu_img(args: &[&str]) -> Result<String> {
    debug!("qemu-img {}", args.join(" "));
    let output = Command::new("qemu-img")
        .args(args)
        .output()
        .await
        .map_err(|e| Error::Storage(format!("执行 qemu-img 失败: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!("qemu-img {} 失败: {}", args.first().unwrap_or(&""), stderr);
        return Err(Error::Storage(format!("qemu-img 执行失败: {}", stderr)));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// 从 `qemu-img info --output=json` 的输出中取虚拟大小
fn parse_virtual_size(info: &str) -> Result<u64> {
    let value: serde_json::Value = serde_json::from_str(info)?;
    value
        .get("virtual-size")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| Error::Storage("qemu-img info 输出缺少 virtual-size".to_string()))
}

// ============================================================================
// 卷
// ============================================================================

pub struct LocalVolumeOps {
    gateway: Arc<dyn HypervisorGateway>,
    host: String,
    ip: String,
    connected: Mutex<HashMap<String, BlockDevice>>,
}

impl LocalVolumeOps {
    pub fn new(gateway: Arc<dyn HypervisorGateway>, host: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            gateway,
            host: host.into(),
            ip: ip.into(),
            connected: Mutex::new(HashMap::new()),
        }
    }

    fn connected(&self) -> std::sync::MutexGuard<'_, HashMap<String, BlockDevice>> {
        self.connected.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_connected(&self, volume_id: &str) -> bool {
        self.connected().contains_key(volume_id)
    }
}

#[async_trait]
impl VolumeOps for LocalVolumeOps {
    async fn connect_volume(&self, device: &BlockDevice) -> Result<BlockDevice> {
        info!("🔗 连接存储卷: {} ({})", device.volume_id, device.path);
        self.connected().insert(device.volume_id.clone(), device.clone());
        Ok(device.clone())
    }

    async fn disconnect_volume(&self, device: &BlockDevice) -> Result<()> {
        if self.connected().remove(&device.volume_id).is_some() {
            info!("🔌 断开存储卷: {}", device.volume_id);
        }
        Ok(())
    }

    async fn attach_volume(&self, instance: &Instance, device: &BlockDevice) -> Result<()> {
        let device = self.connect_volume(device).await?;
        let disk = AttachedDisk {
            disk_id: device.volume_id.clone(),
            path: device.path.clone(),
            format: device.format.clone(),
            boot: device.boot,
        };

        if let Err(e) = self.gateway.attach_disk(instance.uuid, &disk).await {
            self.disconnect_volume(&device).await?;
            return Err(e);
        }
        info!("✅ 存储卷挂载成功: vm_id={}, volume_id={}", instance.uuid, device.volume_id);
        Ok(())
    }

    async fn detach_volume(&self, instance: &Instance, device: &BlockDevice) -> Result<()> {
        match self.gateway.detach_disk(instance.uuid, &device.volume_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                warn!("⚠️ 存储卷未挂载，跳过分离: vm_id={}, volume_id={}", instance.uuid, device.volume_id);
            }
            Err(e) => return Err(e),
        }
        self.disconnect_volume(device).await
    }

    fn volume_connector(&self, _instance: &Instance) -> VolumeConnector {
        VolumeConnector {
            host: self.host.clone(),
            ip: self.ip.clone(),
            initiator: None,
        }
    }
}

// ============================================================================
// 镜像缓存
// ============================================================================

pub struct LocalImageCache {
    base_dir: PathBuf,
    instances_dir: PathBuf,
    max_age: Duration,
}

impl LocalImageCache {
    pub fn new(base_dir: impl Into<PathBuf>, instances_dir: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            base_dir: base_dir.into(),
            instances_dir: instances_dir.into(),
            max_age,
        }
    }

    fn base_image_path(&self, image: &ImageMeta) -> PathBuf {
        self.base_dir.join(format!("{}.{}", image.id, image.disk_format))
    }

    pub fn instance_dir(&self, instance_id: Uuid) -> PathBuf {
        self.instances_dir.join(instance_id.to_string())
    }

    /// 从文件名中提取镜像ID
    fn image_id_of(path: &Path) -> Option<String> {
        path.file_stem().and_then(|s| s.to_str()).map(|s| s.to_string())
    }
}

#[async_trait]
impl ImageCache for LocalImageCache {
    async fn get_cached_image(&self, image: &ImageMeta) -> Result<String> {
        let path = self.base_image_path(image);
        if fs::metadata(&path).await.is_err() {
            return Err(Error::NotFound(format!("镜像未缓存: {} ({:?})", image.id, path)));
        }
        Ok(path.to_string_lossy().to_string())
    }

    async fn prepare_root_disk(&self, instance: &Instance, image: &ImageMeta) -> Result<AttachedDisk> {
        let base = self.get_cached_image(image).await?;
        let dir = self.instance_dir(instance.uuid);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Storage(format!("创建实例目录失败: {}", e)))?;

        let root = dir.join("root.qcow2");
        let root_str = root.to_string_lossy().to_string();
        let size = format!("{}G", instance.root_gb);

        info!("💽 创建根盘: {} (基础镜像: {})", root_str, base);
        let mut args = vec![
            "create", "-f", "qcow2", "-F", &image.disk_format, "-b", &base, &root_str,
        ];
        if instance.root_gb > 0 {
            args.push(&size);
        }
        qemu_img(&args).await?;

        Ok(AttachedDisk {
            disk_id: root_disk_id(instance.uuid),
            path: root_str,
            format: "qcow2".to_string(),
            boot: true,
        })
    }

    async fn image_virtual_size(&self, path: &str) -> Result<u64> {
        let info = qemu_img(&["info", "--output=json", path]).await?;
        parse_virtual_size(&info)
    }

    async fn remove_instance_files(&self, instance_id: Uuid) -> Result<()> {
        let dir = self.instance_dir(instance_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!("🧹 已删除实例目录: {:?}", dir);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!("删除实例目录失败: {}", e))),
        }
    }

    async fn manage_image_cache(&self, all_instances: &[Instance]) -> Result<Vec<String>> {
        let in_use: HashSet<&str> = all_instances
            .iter()
            .filter_map(|i| i.image_ref.as_deref())
            .collect();

        let mut entries = match fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Storage(format!("读取镜像缓存目录失败: {}", e))),
        };

        let mut removed = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Storage(format!("读取镜像缓存目录失败: {}", e)))?
        {
            let path = entry.path();
            let Some(image_id) = Self::image_id_of(&path) else {
                continue;
            };
            if in_use.contains(image_id.as_str()) {
                continue;
            }

            let age = entry
                .metadata()
                .await
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.elapsed().ok())
                .unwrap_or_default();
            if age < self.max_age {
                continue;
            }

            match fs::remove_file(&path).await {
                Ok(()) => {
                    info!("🧹 删除过期基础镜像: {:?}", path);
                    removed.push(path.to_string_lossy().to_string());
                }
                Err(e) => warn!("⚠️ 删除基础镜像失败: {:?} ({})", path, e),
            }
        }
        Ok(removed)
    }
}

// ============================================================================
// 快照
// ============================================================================

pub struct LocalSnapshotOps {
    gateway: Arc<dyn HypervisorGateway>,
    image_dir: PathBuf,
}

impl LocalSnapshotOps {
    pub fn new(gateway: Arc<dyn HypervisorGateway>, image_dir: impl Into<PathBuf>) -> Self {
        Self {
            gateway,
            image_dir: image_dir.into(),
        }
    }
}

#[async_trait]
impl SnapshotOps for LocalSnapshotOps {
    async fn snapshot(&self, instance: &Instance, image_id: &str) -> Result<String> {
        let handle = self.gateway.get_instance(instance.uuid).await?;
        let root = handle
            .disks
            .iter()
            .find(|d| d.boot)
            .ok_or_else(|| Error::NotFound(format!("实例没有启动盘: {}", instance.uuid)))?;

        fs::create_dir_all(&self.image_dir)
            .await
            .map_err(|e| Error::Storage(format!("创建镜像目录失败: {}", e)))?;
        let target = self.image_dir.join(format!("{}.qcow2", image_id));
        let target_str = target.to_string_lossy().to_string();

        info!("📸 创建快照: {} -> {}", instance.uuid, target_str);
        qemu_img(&["convert", "-O", "qcow2", &root.path, &target_str]).await?;
        Ok(target_str)
    }
}

// ============================================================================
// 控制台
// ============================================================================

pub struct LocalConsoleOps {
    gateway: Arc<dyn HypervisorGateway>,
    host: String,
    instances_dir: PathBuf,
}

impl LocalConsoleOps {
    pub fn new(gateway: Arc<dyn HypervisorGateway>, host: impl Into<String>, instances_dir: impl Into<PathBuf>) -> Self {
        Self {
            gateway,
            host: host.into(),
            instances_dir: instances_dir.into(),
        }
    }

    fn instance_file(&self, instance_id: Uuid, name: &str) -> PathBuf {
        self.instances_dir.join(instance_id.to_string()).join(name)
    }
}

#[async_trait]
impl ConsoleOps for LocalConsoleOps {
    async fn get_serial_console(&self, instance: &Instance) -> Result<ConsoleInfo> {
        // 不存在时返回 NotFound
        self.gateway.get_instance(instance.uuid).await?;
        Ok(ConsoleInfo {
            kind: "serial".to_string(),
            host: self.host.clone(),
            path: self
                .instance_file(instance.uuid, "serial.sock")
                .to_string_lossy()
                .to_string(),
        })
    }

    async fn get_console_output(&self, instance: &Instance) -> Result<String> {
        self.gateway.get_instance(instance.uuid).await?;
        let log = self.instance_file(instance.uuid, "console.log");
        match fs::read(&log).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(Error::Storage(format!("读取控制台日志失败: {}", e))),
        }
    }

    async fn get_rdp_console(&self, _instance: &Instance) -> Result<ConsoleInfo> {
        Err(Error::NotSupported("当前虚拟化后端不提供 RDP 控制台".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::{InMemoryHypervisor, VmSpec};

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("hv-agent-test-{}", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_manage_image_cache_keeps_images_in_use() {
        let base = scratch_dir();
        fs::create_dir_all(&base).await.unwrap();
        fs::write(base.join("img-used.qcow2"), b"used").await.unwrap();
        fs::write(base.join("img-stale.qcow2"), b"stale").await.unwrap();

        let cache = LocalImageCache::new(&base, scratch_dir(), Duration::ZERO);
        let mut instance = Instance::new("vm", 1, 512, 10);
        instance.image_ref = Some("img-used".to_string());

        let removed = cache.manage_image_cache(&[instance]).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert!(removed[0].ends_with("img-stale.qcow2"));
        assert!(fs::metadata(base.join("img-used.qcow2")).await.is_ok());

        fs::remove_dir_all(&base).await.unwrap();
    }

    #[tokio::test]
    async fn test_uncached_image_not_found() {
        let cache = LocalImageCache::new(scratch_dir(), scratch_dir(), Duration::ZERO);
        let image = ImageMeta {
            id: "missing".to_string(),
            disk_format: "qcow2".to_string(),
        };
        assert!(cache.get_cached_image(&image).await.unwrap_err().is_not_found());
        // 实例目录不存在时删除直接成功
        assert!(cache.remove_instance_files(Uuid::new_v4()).await.is_ok());
    }

    #[test]
    fn test_parse_virtual_size() {
        let info = r#"{"virtual-size": 2147483648, "filename": "rescue.qcow2", "format": "qcow2"}"#;
        assert_eq!(parse_virtual_size(info).unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_virtual_size(r#"{"format": "raw"}"#).is_err());
        assert!(parse_virtual_size("not json").is_err());
    }

    #[tokio::test]
    async fn test_attach_detach_volume() {
        let hv = Arc::new(InMemoryHypervisor::new("host-a"));
        let instance = Instance::new("vm", 1, 512, 10);
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

        let volumes = LocalVolumeOps::new(hv.clone(), "host-a", "10.0.0.1");
        let device = BlockDevice {
            volume_id: "vol-1".to_string(),
            path: "/dev/sdb".to_string(),
            format: "raw".to_string(),
            boot: false,
        };

        volumes.attach_volume(&instance, &device).await.unwrap();
        assert!(volumes.is_connected("vol-1"));
        assert!(hv.get_instance(instance.uuid).await.unwrap().disk("vol-1").is_some());

        volumes.detach_volume(&instance, &device).await.unwrap();
        // 重复分离不报错
        volumes.detach_volume(&instance, &device).await.unwrap();
        assert!(!volumes.is_connected("vol-1"));
    }

    #[tokio::test]
    async fn test_rdp_console_not_supported() {
        let hv = Arc::new(InMemoryHypervisor::new("host-a"));
        let consoles = LocalConsoleOps::new(hv, "host-a", scratch_dir());
        let instance = Instance::new("vm", 1, 512, 10);
        assert!(matches!(
            consoles.get_rdp_console(&instance).await.unwrap_err(),
            Error::NotSupported(_)
        ));
        assert!(consoles.get_console_output(&instance).await.unwrap_err().is_not_found());
    }
}
