/// libvirt 虚拟化后端
///
/// 通过 libvirt 管理本机 QEMU/KVM 虚拟机，需要系统安装 libvirt-dev
/// 并启用 `libvirt` feature。磁盘以 `<serial>` 记录磁盘ID。

use async_trait::async_trait;
use common::models::{ExportedDisk, PowerState};
use common::{Error, Result};
use std::fmt::Write;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;
use virt::connect::Connect;
use virt::domain::Domain;

use super::gateway::{
    AttachedDisk, CapabilitySet, HypervisorGateway, PowerAction, VmHandle, VmSpec,
};

// libvirt 域状态常量
const VIR_DOMAIN_RUNNING: u32 = 1;
const VIR_DOMAIN_BLOCKED: u32 = 2;
const VIR_DOMAIN_PAUSED: u32 = 3;
const VIR_DOMAIN_SHUTDOWN: u32 = 4;
const VIR_DOMAIN_PMSUSPENDED: u32 = 7;

const VIR_DOMAIN_AFFECT_CONFIG: u32 = 2;

// VIR_MIGRATE_LIVE | PEER2PEER | PERSIST_DEST | UNDEFINE_SOURCE
const MIGRATE_FLAGS: u32 = 1 | 2 | 8 | 16;

fn hv_err(context: &str, e: impl std::fmt::Display) -> Error {
    Error::Hypervisor(format!("{}: {}", context, e))
}

/// 在阻塞线程池上执行耗时的 libvirt 调用，调用期间不持有连接锁
async fn run_blocking<T, F>(op: &str, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("{} 任务异常退出: {}", op, e)))?
}

pub struct LibvirtHypervisor {
    host: String,
    conn: Arc<Mutex<Connect>>,
}

impl LibvirtHypervisor {
    pub fn connect(uri: &str, host: impl Into<String>) -> Result<Self> {
        let conn = Connect::open(Some(uri))
            .map_err(|e| Error::Transport(format!("无法连接到 libvirt ({}): {}", uri, e)))?;

        tracing::info!("✅ 成功连接到 libvirt: {}", uri);

        Ok(Self {
            host: host.into(),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 通过 UUID 或名称查找虚拟机
    fn lookup(conn: &Connect, id: Uuid) -> Result<Domain> {
        let id_str = id.to_string();
        Domain::lookup_by_uuid_string(conn, &id_str)
            .or_else(|_| Domain::lookup_by_name(conn, &id_str))
            .map_err(|e| Error::NotFound(format!("虚拟机不存在: {} ({})", id, e)))
    }

    fn power_state_of(domain: &Domain) -> Result<PowerState> {
        let (state, _reason) = domain
            .get_state()
            .map_err(|e| hv_err("无法获取虚拟机状态", e))?;

        let power_state = match state {
            VIR_DOMAIN_RUNNING | VIR_DOMAIN_BLOCKED | VIR_DOMAIN_SHUTDOWN => PowerState::Running,
            VIR_DOMAIN_PAUSED => PowerState::Paused,
            VIR_DOMAIN_PMSUSPENDED => PowerState::Suspended,
            _ => {
                // 关机状态下存在 managed save 镜像视为挂起
                if domain.has_managed_save(0).unwrap_or(false) {
                    PowerState::Suspended
                } else {
                    PowerState::Stopped
                }
            }
        };
        Ok(power_state)
    }

    fn handle_of(domain: &Domain) -> Result<VmHandle> {
        let uuid = domain
            .get_uuid_string()
            .map_err(|e| hv_err("无法获取虚拟机UUID", e))?;
        let id = Uuid::parse_str(&uuid).map_err(|e| hv_err("无效的虚拟机UUID", e))?;
        let name = domain
            .get_name()
            .map_err(|e| hv_err("无法获取虚拟机名称", e))?;
        let info = domain.get_info().map_err(|e| hv_err("无法获取虚拟机信息", e))?;
        let xml = domain
            .get_xml_desc(0)
            .map_err(|e| hv_err("获取虚拟机XML失败", e))?;

        Ok(VmHandle {
            id,
            name,
            power_state: Self::power_state_of(domain)?,
            vcpus: info.nr_virt_cpu,
            memory_mb: info.max_mem / 1024,
            cpu_time_ns: info.cpu_time,
            disks: parse_disks(&xml)?,
        })
    }

    /// 生成虚拟机 XML 配置
    fn generate_vm_xml(spec: &VmSpec) -> Result<String> {
        let mut xml = String::new();
        let w = |e: std::fmt::Error| hv_err("生成XML失败", e);

        writeln!(xml, "<domain type='kvm'>").map_err(w)?;
        writeln!(xml, "  <name>{}</name>", spec.name).map_err(w)?;
        writeln!(xml, "  <uuid>{}</uuid>", spec.id).map_err(w)?;
        writeln!(xml, "  <memory unit='MiB'>{}</memory>", spec.memory_mb).map_err(w)?;
        writeln!(xml, "  <currentMemory unit='MiB'>{}</currentMemory>", spec.memory_mb).map_err(w)?;
        writeln!(xml, "  <vcpu placement='static'>{}</vcpu>", spec.vcpus).map_err(w)?;
        writeln!(xml, "  <cpu mode='host-passthrough' check='none'/>").map_err(w)?;
        writeln!(xml, "  <os>").map_err(w)?;
        writeln!(xml, "    <type arch='x86_64' machine='pc-q35-7.2'>hvm</type>").map_err(w)?;
        writeln!(xml, "  </os>").map_err(w)?;
        writeln!(xml, "  <features><acpi/><apic/></features>").map_err(w)?;
        writeln!(xml, "  <clock offset='utc'/>").map_err(w)?;
        writeln!(xml, "  <on_poweroff>destroy</on_poweroff>").map_err(w)?;
        writeln!(xml, "  <on_reboot>restart</on_reboot>").map_err(w)?;
        writeln!(xml, "  <on_crash>destroy</on_crash>").map_err(w)?;
        writeln!(xml, "  <devices>").map_err(w)?;
        writeln!(xml, "    <emulator>/usr/bin/qemu-system-x86_64</emulator>").map_err(w)?;

        for (idx, disk) in spec.disks.iter().enumerate() {
            xml.push_str(&build_disk_xml(disk, &disk_device_name(idx), disk.boot.then_some(1)));
        }

        for nic in &spec.nics {
            writeln!(xml, "    <interface type='bridge'>").map_err(w)?;
            if let Some(mac) = &nic.mac_address {
                writeln!(xml, "      <mac address='{}'/>", mac).map_err(w)?;
            }
            let bridge = if nic.bridge_name.is_empty() { "virbr0" } else { &nic.bridge_name };
            let model = if nic.model.is_empty() { "virtio" } else { &nic.model };
            writeln!(xml, "      <source bridge='{}'/>", bridge).map_err(w)?;
            writeln!(xml, "      <model type='{}'/>", model).map_err(w)?;
            writeln!(xml, "    </interface>").map_err(w)?;
        }

        // 串口控制台
        writeln!(xml, "    <serial type='pty'><target port='0'/></serial>").map_err(w)?;
        writeln!(xml, "    <console type='pty'><target type='serial' port='0'/></console>").map_err(w)?;

        // QEMU Guest Agent，软重启依赖
        writeln!(xml, "    <channel type='unix'>").map_err(w)?;
        writeln!(xml, "      <source mode='bind'/>").map_err(w)?;
        writeln!(xml, "      <target type='virtio' name='org.qemu.guest_agent.0'/>").map_err(w)?;
        writeln!(xml, "    </channel>").map_err(w)?;

        writeln!(xml, "    <graphics type='vnc' port='-1' autoport='yes' listen='0.0.0.0'/>").map_err(w)?;
        writeln!(xml, "  </devices>").map_err(w)?;
        writeln!(xml, "</domain>").map_err(w)?;

        Ok(xml)
    }

    async fn disk_size(path: &str) -> u64 {
        tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
    }
}

fn disk_device_name(idx: usize) -> String {
    format!("vd{}", (b'a' + (idx % 26) as u8) as char)
}

/// 构建磁盘XML配置
fn build_disk_xml(disk: &AttachedDisk, device_name: &str, boot_order: Option<u32>) -> String {
    let boot = boot_order
        .map(|order| format!("\n      <boot order='{}'/>", order))
        .unwrap_or_default();
    format!(
        r#"    <disk type='file' device='disk'>
      <driver name='qemu' type='{}' cache='writeback'/>
      <source file='{}'/>
      <target dev='{}' bus='virtio'/>
      <serial>{}</serial>{}
    </disk>
"#,
        disk.format, disk.path, device_name, disk.disk_id, boot
    )
}

/// 解析XML中的磁盘（以 serial 作为磁盘ID）
fn parse_disks(xml: &str) -> Result<Vec<AttachedDisk>> {
    let doc = roxmltree::Document::parse(xml).map_err(|e| hv_err("解析XML失败", e))?;

    let mut disks = Vec::new();
    for node in doc.descendants().filter(|n| n.has_tag_name("disk")) {
        let child = |name: &str| node.children().find(|n| n.has_tag_name(name));

        let Some(disk_id) = child("serial").and_then(|n| n.text()) else {
            continue;
        };
        disks.push(AttachedDisk {
            disk_id: disk_id.trim().to_string(),
            path: child("source")
                .and_then(|n| n.attribute("file"))
                .unwrap_or_default()
                .to_string(),
            format: child("driver")
                .and_then(|n| n.attribute("type"))
                .unwrap_or("qcow2")
                .to_string(),
            boot: child("boot").is_some(),
        });
    }
    Ok(disks)
}

/// 解析宿主机 capabilities XML 中的 CPU 特性
fn parse_cpu_features(xml: &str) -> Result<Vec<String>> {
    let doc = roxmltree::Document::parse(xml).map_err(|e| hv_err("解析XML失败", e))?;
    let features = doc
        .descendants()
        .filter(|n| n.has_tag_name("cpu") && n.parent().is_some_and(|p| p.has_tag_name("host")))
        .flat_map(|cpu| cpu.children().filter(|n| n.has_tag_name("feature")))
        .filter_map(|n| n.attribute("name").map(str::to_string))
        .collect();
    Ok(features)
}

#[async_trait]
impl HypervisorGateway for LibvirtHypervisor {
    fn host(&self) -> &str {
        &self.host
    }

    async fn get_instance(&self, id: Uuid) -> Result<VmHandle> {
        let conn = self.conn.lock().await;
        let domain = Self::lookup(&conn, id)?;
        Self::handle_of(&domain)
    }

    async fn list_instances(&self) -> Result<Vec<VmHandle>> {
        let conn = self.conn.lock().await;
        let domains = conn
            .list_all_domains(0)
            .map_err(|e| hv_err("无法列出虚拟机", e))?;

        let mut handles = Vec::with_capacity(domains.len());
        for domain in domains {
            match Self::handle_of(&domain) {
                Ok(handle) => handles.push(handle),
                // 名称不是 UUID 的域不归本 Agent 管理
                Err(e) => tracing::debug!("跳过虚拟机: {}", e),
            }
        }
        Ok(handles)
    }

    async fn create_instance(&self, spec: &VmSpec) -> Result<VmHandle> {
        if spec.config_drive.is_some() {
            tracing::warn!("⚠️ libvirt 后端暂不生成配置驱动器，忽略注入内容: {}", spec.id);
        }

        let xml = Self::generate_vm_xml(spec)?;
        tracing::debug!("虚拟机 XML 配置:\n{}", xml);

        let conn = self.conn.lock().await;
        if Self::lookup(&conn, spec.id).is_ok() {
            return Err(Error::AlreadyExists(format!("虚拟机已存在: {}", spec.id)));
        }
        let domain = Domain::define_xml(&conn, &xml).map_err(|e| hv_err("无法定义虚拟机", e))?;
        Self::handle_of(&domain)
    }

    async fn destroy_instance(&self, id: Uuid, destroy_disks: bool) -> Result<()> {
        let paths: Vec<String> = {
            let conn = self.conn.lock().await;
            let domain = Self::lookup(&conn, id)?;
            let xml = domain
                .get_xml_desc(0)
                .map_err(|e| hv_err("获取虚拟机XML失败", e))?;
            if Self::power_state_of(&domain)? != PowerState::Stopped {
                let _ = domain.destroy();
            }
            let _ = domain.managed_save_remove(0);
            domain
                .undefine()
                .map_err(|e| hv_err("无法删除虚拟机定义", e))?;
            parse_disks(&xml)?.into_iter().map(|d| d.path).collect()
        };

        if destroy_disks {
            for path in paths {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    tracing::warn!("⚠️ 删除磁盘文件失败: {} ({})", path, e);
                }
            }
        }
        Ok(())
    }

    async fn set_power_state(&self, id: Uuid, action: PowerAction) -> Result<()> {
        let conn = self.conn.lock().await;
        let domain = Self::lookup(&conn, id)?;
        let current = Self::power_state_of(&domain)?;

        let result = match action {
            PowerAction::Start => match current {
                PowerState::Running => return Ok(()),
                PowerState::Paused => domain.resume().map(|_| ()),
                _ => domain.create().map(|_| ()),
            },
            PowerAction::Stop => {
                if current == PowerState::Stopped {
                    return Ok(());
                }
                if current == PowerState::Suspended {
                    domain.managed_save_remove(0).map(|_| ())
                } else {
                    domain.destroy().map(|_| ())
                }
            }
            PowerAction::Shutdown => domain.shutdown().map(|_| ()),
            PowerAction::Reboot => {
                return domain.reboot(0).map(|_| ()).map_err(|e| {
                    Error::NotSupported(format!("客户机未响应重启请求: {}", e))
                })
            }
            PowerAction::Reset => {
                if current == PowerState::Stopped {
                    domain.create().map(|_| ())
                } else {
                    domain.reset().map(|_| ())
                }
            }
            PowerAction::Pause => domain.suspend().map(|_| ()),
            PowerAction::Suspend => domain.managed_save(0).map(|_| ()),
        };

        result.map_err(|e| hv_err(&format!("电源操作 {} 失败", action), e))
    }

    async fn attach_disk(&self, id: Uuid, disk: &AttachedDisk) -> Result<()> {
        let conn = self.conn.lock().await;
        let domain = Self::lookup(&conn, id)?;
        let xml = domain
            .get_xml_desc(0)
            .map_err(|e| hv_err("获取虚拟机XML失败", e))?;
        let disks = parse_disks(&xml)?;
        if disks.iter().any(|d| d.disk_id == disk.disk_id) {
            return Err(Error::AlreadyExists(format!("磁盘已挂载: {}", disk.disk_id)));
        }

        let device = disk_device_name(disks.len());
        let disk_xml = build_disk_xml(disk, &device, disk.boot.then_some(1));
        tracing::debug!("磁盘XML配置: {}", disk_xml);

        domain
            .attach_device_flags(&disk_xml, VIR_DOMAIN_AFFECT_CONFIG)
            .map_err(|e| hv_err("挂载磁盘失败", e))?;
        Ok(())
    }

    async fn detach_disk(&self, id: Uuid, disk_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let domain = Self::lookup(&conn, id)?;
        let xml = domain
            .get_xml_desc(0)
            .map_err(|e| hv_err("获取虚拟机XML失败", e))?;
        let disks = parse_disks(&xml)?;
        let (idx, disk) = disks
            .iter()
            .enumerate()
            .find(|(_, d)| d.disk_id == disk_id)
            .ok_or_else(|| Error::NotFound(format!("磁盘未挂载: {}", disk_id)))?;

        let disk_xml = build_disk_xml(disk, &disk_device_name(idx), None);
        domain
            .detach_device_flags(&disk_xml, VIR_DOMAIN_AFFECT_CONFIG)
            .map_err(|e| hv_err("分离磁盘失败", e))?;
        Ok(())
    }

    async fn export_disks(&self, id: Uuid) -> Result<Vec<ExportedDisk>> {
        let disks = {
            let conn = self.conn.lock().await;
            let domain = Self::lookup(&conn, id)?;
            let state = Self::power_state_of(&domain)?;
            if state != PowerState::Stopped {
                return Err(Error::InvalidStateTransition(format!(
                    "导出磁盘前虚拟机必须关机，当前状态: {}",
                    state
                )));
            }
            let xml = domain
                .get_xml_desc(0)
                .map_err(|e| hv_err("获取虚拟机XML失败", e))?;
            parse_disks(&xml)?
        };

        let mut exported = Vec::with_capacity(disks.len());
        for disk in disks {
            exported.push(ExportedDisk {
                size_bytes: Self::disk_size(&disk.path).await,
                disk_id: disk.disk_id,
                path: disk.path,
                format: disk.format,
                boot: disk.boot,
            });
        }
        Ok(exported)
    }

    async fn import_disk(&self, id: Uuid, disk: &ExportedDisk) -> Result<AttachedDisk> {
        // 磁盘位于共享存储上，直接按原路径挂载
        let attached = AttachedDisk {
            disk_id: disk.disk_id.clone(),
            path: disk.path.clone(),
            format: disk.format.clone(),
            boot: disk.boot,
        };
        self.attach_disk(id, &attached).await?;
        Ok(attached)
    }

    async fn resize_disk(&self, id: Uuid, disk_id: &str, new_size_gb: u64) -> Result<()> {
        let path = {
            let conn = self.conn.lock().await;
            let domain = Self::lookup(&conn, id)?;
            let xml = domain
                .get_xml_desc(0)
                .map_err(|e| hv_err("获取虚拟机XML失败", e))?;
            parse_disks(&xml)?
                .into_iter()
                .find(|d| d.disk_id == disk_id)
                .map(|d| d.path)
                .ok_or_else(|| Error::NotFound(format!("磁盘未挂载: {}", disk_id)))?
        };

        let output = tokio::process::Command::new("qemu-img")
            .args(["resize", &path, &format!("{}G", new_size_gb)])
            .output()
            .await
            .map_err(|e| Error::Storage(format!("执行 qemu-img 失败: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Storage(format!("调整磁盘大小失败: {}", stderr)));
        }
        Ok(())
    }

    async fn query_capabilities(&self) -> Result<CapabilitySet> {
        let conn = self.conn.lock().await;
        let hypervisor_type = conn.get_type().map_err(|e| hv_err("无法获取虚拟化类型", e))?;
        let hypervisor_version = conn
            .get_hyp_version()
            .map_err(|e| hv_err("无法获取虚拟化版本", e))?;
        let caps_xml = conn
            .get_capabilities()
            .map_err(|e| hv_err("无法获取宿主机能力", e))?;

        Ok(CapabilitySet {
            host: self.host.clone(),
            hypervisor_type,
            hypervisor_version: hypervisor_version as u64,
            cpu_features: parse_cpu_features(&caps_xml)?,
            live_migration_enabled: true,
        })
    }

    async fn live_migrate(&self, id: Uuid, dest: &str) -> Result<()> {
        let domain = {
            let conn = self.conn.lock().await;
            Self::lookup(&conn, id)?
        };
        let uri = format!("qemu+tcp://{}/system", dest);
        let dest = dest.to_string();

        tracing::info!("🚚 libvirt 热迁移: {} -> {}", id, uri);
        run_blocking("热迁移", move || {
            domain
                .migrate_to_uri(&uri, MIGRATE_FLAGS, 0)
                .map_err(|e| Error::Transport(format!("热迁移到 {} 失败: {}", dest, e)))
        })
        .await
    }
}
