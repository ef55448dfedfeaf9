/// 外部协作接口
///
/// 卷连接、镜像缓存、快照、控制台只通过这些接口由驱动层调用，
/// 编排器和迁移协调器不直接依赖它们。

pub mod local;

use async_trait::async_trait;
use common::models::{BlockDevice, ImageMeta, Instance};
use common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::hypervisor::AttachedDisk;

const GIB: u64 = 1024 * 1024 * 1024;

/// 卷连接器信息（供存储端做访问授权）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeConnector {
    pub host: String,
    pub ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initiator: Option<String>,
}

/// 控制台连接信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsoleInfo {
    pub kind: String,
    pub host: String,
    pub path: String,
}

#[async_trait]
pub trait VolumeOps: Send + Sync {
    /// 在本机建立卷连接，返回本机可用的块设备
    async fn connect_volume(&self, device: &BlockDevice) -> Result<BlockDevice>;

    async fn disconnect_volume(&self, device: &BlockDevice) -> Result<()>;

    /// 把已连接的卷挂载到虚拟机
    async fn attach_volume(&self, instance: &Instance, device: &BlockDevice) -> Result<()>;

    async fn detach_volume(&self, instance: &Instance, device: &BlockDevice) -> Result<()>;

    fn volume_connector(&self, instance: &Instance) -> VolumeConnector;
}

#[async_trait]
pub trait ImageCache: Send + Sync {
    /// 返回本机缓存的基础镜像路径
    async fn get_cached_image(&self, image: &ImageMeta) -> Result<String>;

    /// 基于缓存镜像为实例准备根盘
    async fn prepare_root_disk(&self, instance: &Instance, image: &ImageMeta) -> Result<AttachedDisk>;

    /// 镜像的虚拟大小（字节）
    async fn image_virtual_size(&self, path: &str) -> Result<u64>;

    /// 返回救援镜像路径，救援镜像不能大于实例根盘
    async fn get_rescue_image(&self, instance: &Instance, image: &ImageMeta) -> Result<String> {
        let path = self.get_cached_image(image).await?;
        if instance.root_gb == 0 {
            return Ok(path);
        }
        let image_size = self.image_virtual_size(&path).await?;
        let root_size = instance.root_gb * GIB;
        if image_size > root_size {
            return Err(Error::InvalidArgument(format!(
                "救援镜像 {} 大于实例根盘: {} > {} 字节",
                image.id, image_size, root_size
            )));
        }
        Ok(path)
    }

    /// 删除实例目录
    async fn remove_instance_files(&self, instance_id: Uuid) -> Result<()>;

    /// 清理不再被任何实例使用的过期基础镜像，返回被删除的文件
    async fn manage_image_cache(&self, all_instances: &[Instance]) -> Result<Vec<String>>;
}

#[async_trait]
pub trait SnapshotOps: Send + Sync {
    /// 把实例根盘导出为镜像，返回镜像路径
    async fn snapshot(&self, instance: &Instance, image_id: &str) -> Result<String>;
}

#[async_trait]
pub trait ConsoleOps: Send + Sync {
    async fn get_serial_console(&self, instance: &Instance) -> Result<ConsoleInfo>;

    async fn get_console_output(&self, instance: &Instance) -> Result<String>;

    async fn get_rdp_console(&self, instance: &Instance) -> Result<ConsoleInfo>;
}

/// 驱动层使用的全部协作者
#[derive(Clone)]
pub struct Collaborators {
    pub volumes: Arc<dyn VolumeOps>,
    pub images: Arc<dyn ImageCache>,
    pub snapshots: Arc<dyn SnapshotOps>,
    pub consoles: Arc<dyn ConsoleOps>,
}
