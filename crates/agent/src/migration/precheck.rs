/// 迁移前置检查
///
/// 纯函数，只比较两端上报的能力信息，不访问 hypervisor，无副作用。

use common::models::{ComputeNodeInfo, Flavor, Instance, LiveMigrationCheckData, PowerState};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompatibilityError {
    #[error("虚拟化类型不一致 (源端: {src}, 目标端: {dst})")]
    HypervisorType { src: String, dst: String },

    #[error("目标端虚拟化版本过旧 (源端: {src}, 目标端: {dst})")]
    HypervisorVersion { src: u64, dst: u64 },

    #[error("主机 {0} 未启用热迁移")]
    LiveMigrationDisabled(String),

    #[error("目标主机缺少 CPU 特性: {0:?}")]
    MissingCpuFeatures(Vec<String>),

    #[error("目标主机内存不足 (需要: {required}MB, 可用: {available}MB)")]
    InsufficientMemory { required: u64, available: u64 },

    #[error("目标主机磁盘不足 (需要: {required}GB, 可用: {available}GB)")]
    InsufficientDisk { required: u64, available: u64 },

    #[error("实例处于 {0} 状态，无法热迁移")]
    InstanceNotMigratable(PowerState),

    #[error("不支持缩小根盘 ({current}GB -> {requested}GB)")]
    RootDiskShrink { current: u64, requested: u64 },
}

impl From<CompatibilityError> for common::Error {
    fn from(err: CompatibilityError) -> Self {
        common::Error::MigrationPreCheck(err.to_string())
    }
}

fn missing_features(src: &[String], dst: &[String]) -> Vec<String> {
    src.iter().filter(|f| !dst.contains(f)).cloned().collect()
}

/// 目标端检查
pub fn check_destination(
    instance: &Instance,
    src: &ComputeNodeInfo,
    dst: &ComputeNodeInfo,
    dst_live_migration_enabled: bool,
    block_migration: bool,
    disk_over_commit: bool,
) -> Result<(), CompatibilityError> {
    if src.hypervisor_type != dst.hypervisor_type {
        return Err(CompatibilityError::HypervisorType {
            src: src.hypervisor_type.clone(),
            dst: dst.hypervisor_type.clone(),
        });
    }
    if dst.hypervisor_version < src.hypervisor_version {
        return Err(CompatibilityError::HypervisorVersion {
            src: src.hypervisor_version,
            dst: dst.hypervisor_version,
        });
    }
    if !dst_live_migration_enabled {
        return Err(CompatibilityError::LiveMigrationDisabled(dst.host.clone()));
    }

    let missing = missing_features(&src.cpu_features, &dst.cpu_features);
    if !missing.is_empty() {
        return Err(CompatibilityError::MissingCpuFeatures(missing));
    }

    if dst.free_memory_mb < instance.memory_mb {
        return Err(CompatibilityError::InsufficientMemory {
            required: instance.memory_mb,
            available: dst.free_memory_mb,
        });
    }

    // 共享存储或允许超分时不检查磁盘
    if block_migration && !disk_over_commit && dst.free_disk_gb < instance.root_gb {
        return Err(CompatibilityError::InsufficientDisk {
            required: instance.root_gb,
            available: dst.free_disk_gb,
        });
    }
    Ok(())
}

/// 源端检查
pub fn check_source(
    power_state: PowerState,
    src_version: u64,
    src_cpu_features: &[String],
    dest: &LiveMigrationCheckData,
) -> Result<(), CompatibilityError> {
    if !matches!(power_state, PowerState::Running | PowerState::Paused) {
        return Err(CompatibilityError::InstanceNotMigratable(power_state));
    }

    let missing = missing_features(src_cpu_features, &dest.cpu_features);
    if !missing.is_empty() {
        return Err(CompatibilityError::MissingCpuFeatures(missing));
    }

    if dest.hypervisor_version < src_version {
        return Err(CompatibilityError::HypervisorVersion {
            src: src_version,
            dst: dest.hypervisor_version,
        });
    }
    Ok(())
}

/// 变更规格检查：不允许缩小根盘
pub fn check_resize(instance: &Instance, flavor: &Flavor) -> Result<(), CompatibilityError> {
    if flavor.root_gb < instance.root_gb {
        return Err(CompatibilityError::RootDiskShrink {
            current: instance.root_gb,
            requested: flavor.root_gb,
        });
    }
    Ok(())
}
