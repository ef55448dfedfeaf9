/// 虚拟化管理
///
/// `HypervisorGateway` 是编排层访问 hypervisor 的唯一入口，
/// 提供内存后端（默认）和 libvirt 后端（`libvirt` feature）。

pub mod gateway;
pub mod memory;

#[cfg(feature = "libvirt")]
pub mod libvirt;

use std::sync::Arc;

use crate::config::{Config, HypervisorBackend};

pub use gateway::{
    AttachedDisk, CapabilitySet, ConfigDrive, HypervisorGateway, PowerAction, VmHandle, VmSpec,
};
pub use memory::InMemoryHypervisor;

/// 按配置创建虚拟化后端
pub fn connect(config: &Config) -> common::Result<Arc<dyn HypervisorGateway>> {
    match config.hypervisor_backend {
        HypervisorBackend::Memory => {
            tracing::warn!("⚠️ 使用内存虚拟化后端，虚拟机不会真正运行");
            Ok(Arc::new(InMemoryHypervisor::new(config.node_name.clone())))
        }
        #[cfg(feature = "libvirt")]
        HypervisorBackend::Libvirt => Ok(Arc::new(libvirt::LibvirtHypervisor::connect(
            &config.libvirt_uri,
            config.node_name.clone(),
        )?)),
        #[cfg(not(feature = "libvirt"))]
        HypervisorBackend::Libvirt => Err(common::Error::Config(
            "未启用 libvirt feature，无法使用 libvirt 后端".to_string(),
        )),
    }
}
