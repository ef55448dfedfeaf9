/// RPC 请求处理器
///
/// 把控制端的请求路由到 `ComputeDriver` 的对应方法

use common::models::{HostEvent, LiveMigrationCheckData};
use common::ws_rpc::types::*;
use common::ws_rpc::{RpcError, RpcErrorCode, RpcMessage};
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::driver::ComputeDriver;
use crate::events::StateSink;
use crate::migration::MigrationCallback;

/// 向控制端发送通知，连接断开期间的通知直接丢弃
#[derive(Clone, Default)]
pub struct Notifier {
    sender: Arc<RwLock<Option<mpsc::UnboundedSender<RpcMessage>>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// 连接建立后设置发送通道
    pub fn set_sender(&self, sender: mpsc::UnboundedSender<RpcMessage>) {
        let mut slot = self.sender.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(sender);
    }

    pub fn clear_sender(&self) {
        let mut slot = self.sender.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = None;
    }

    /// 返回通知是否已交给发送通道
    pub fn notify<T: Serialize>(&self, method: &str, payload: &T) -> bool {
        let payload = match serde_json::to_value(payload) {
            Ok(payload) => payload,
            Err(e) => {
                error!("序列化通知失败: method={}, error={}", method, e);
                return false;
            }
        };

        let slot = self.sender.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        match slot.as_ref() {
            Some(sender) => sender.send(RpcMessage::notification(method, payload)).is_ok(),
            None => {
                warn!("⚠️ 未连接到 Server，丢弃通知: {}", method);
                false
            }
        }
    }
}

impl StateSink for Notifier {
    fn instance_state_changed(&self, event: &HostEvent) {
        self.notify("instance_state_changed", event);
    }
}

fn parse<T: DeserializeOwned>(payload: Value) -> Result<T, RpcError> {
    serde_json::from_value(payload)
        .map_err(|e| RpcError::invalid_params(format!("解析请求参数失败: {}", e)))
}

fn to_payload<T: Serialize>(value: &T) -> Result<Value, RpcError> {
    Ok(serde_json::to_value(value)?)
}

fn operation_response(
    message: impl Into<String>,
    state: Option<common::models::InstanceState>,
) -> Result<Value, RpcError> {
    to_payload(&OperationResponse {
        success: true,
        message: message.into(),
        state,
    })
}

/// 热迁移回调：把结果作为通知发给控制端
fn migration_callback(notifier: Notifier, fired: Arc<AtomicBool>, success: bool) -> MigrationCallback {
    Box::new(move |instance, dest, block_migration| {
        async move {
            fired.store(true, Ordering::SeqCst);
            let message = if success {
                "热迁移完成".to_string()
            } else {
                "热迁移失败，已在源端恢复".to_string()
            };
            notifier.notify(
                "live_migration_result",
                &LiveMigrationNotification {
                    instance_id: instance.uuid,
                    dest,
                    block_migration,
                    success,
                    message,
                },
            );
            Ok(())
        }
        .boxed()
    })
}

/// RPC 处理器注册表
pub struct RpcHandlerRegistry {
    driver: Arc<dyn ComputeDriver>,
    notifier: Notifier,
}

impl RpcHandlerRegistry {
    pub fn new(driver: Arc<dyn ComputeDriver>, notifier: Notifier) -> Self {
        Self { driver, notifier }
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// 处理 RPC 请求
    pub async fn handle_request(&self, msg: RpcMessage) -> RpcMessage {
        let method = match &msg.method {
            Some(m) => m.clone(),
            None => {
                return RpcMessage::error_response(
                    msg.id,
                    RpcErrorCode::InvalidRequest.as_str(),
                    "缺少方法名",
                    None,
                );
            }
        };

        let payload = msg.payload.unwrap_or(Value::Null);
        debug!("处理 RPC 请求: method={}, id={}", method, msg.id);

        let result = self.dispatch(&method, payload).await;
        if let Err(e) = &result {
            if e.code == RpcErrorCode::MethodNotFound {
                warn!("⚠️ 未知方法: {}", method);
            } else {
                error!("❌ RPC 请求失败: method={}, error={}", method, e);
            }
        }
        RpcMessage::from_result(msg.id, result)
    }

    async fn dispatch(&self, method: &str, payload: Value) -> Result<Value, RpcError> {
        let driver = &self.driver;
        match method {
            // 主机
            "get_capabilities" => to_payload(&driver.capabilities()),
            "list_instances" => to_payload(&driver.list_instances().await?),
            "list_instance_uuids" => to_payload(&driver.list_instance_uuids().await?),

            // 生命周期
            "spawn" => {
                let req: SpawnRequest = parse(payload)?;
                info!("🚀 创建虚拟机: {} ({})", req.instance.name, req.instance.uuid);
                let state = driver
                    .spawn(
                        &req.instance,
                        &req.image,
                        &req.injected_files,
                        req.admin_password.as_deref(),
                        &req.network_info,
                        &req.block_device_info,
                    )
                    .await?;
                operation_response("虚拟机创建成功", Some(state))
            }
            "destroy" => {
                let req: DestroyRequest = parse(payload)?;
                let state = driver
                    .destroy(&req.instance, &req.network_info, &req.block_device_info, req.destroy_disks)
                    .await?;
                operation_response("虚拟机已删除", Some(state))
            }
            "cleanup" => {
                let req: DestroyRequest = parse(payload)?;
                driver
                    .cleanup(&req.instance, &req.network_info, &req.block_device_info, req.destroy_disks)
                    .await?;
                operation_response("清理完成", None)
            }
            "reboot" => {
                let req: RebootRequest = parse(payload)?;
                let state = driver
                    .reboot(&req.instance, &req.network_info, req.reboot_type)
                    .await?;
                operation_response("重启完成", Some(state))
            }
            "pause" => {
                let req: InstanceRequest = parse(payload)?;
                operation_response("已暂停", Some(driver.pause(&req.instance).await?))
            }
            "unpause" => {
                let req: InstanceRequest = parse(payload)?;
                operation_response("已恢复运行", Some(driver.unpause(&req.instance).await?))
            }
            "suspend" => {
                let req: InstanceRequest = parse(payload)?;
                operation_response("已挂起", Some(driver.suspend(&req.instance).await?))
            }
            "resume" => {
                let req: InstanceRequest = parse(payload)?;
                let state = driver
                    .resume(&req.instance, &req.network_info, &req.block_device_info)
                    .await?;
                operation_response("已唤醒", Some(state))
            }
            "power_off" => {
                let req: PowerOffRequest = parse(payload)?;
                let state = driver
                    .power_off(&req.instance, req.timeout, req.retry_interval)
                    .await?;
                operation_response("已关机", Some(state))
            }
            "power_on" => {
                let req: InstanceRequest = parse(payload)?;
                let state = driver
                    .power_on(&req.instance, &req.network_info, &req.block_device_info)
                    .await?;
                operation_response("已开机", Some(state))
            }
            "resume_state_on_host_boot" => {
                let req: InstanceRequest = parse(payload)?;
                let state = driver
                    .resume_state_on_host_boot(&req.instance, &req.network_info, &req.block_device_info)
                    .await?;
                operation_response("状态已恢复", Some(state))
            }
            "rescue" => {
                let req: RescueRequest = parse(payload)?;
                let state = driver
                    .rescue(
                        &req.instance,
                        &req.network_info,
                        &req.rescue_image,
                        req.rescue_password.as_deref(),
                    )
                    .await?;
                operation_response("已进入救援模式", Some(state))
            }
            "unrescue" => {
                let req: InstanceRequest = parse(payload)?;
                let state = driver.unrescue(&req.instance, &req.network_info).await?;
                operation_response("已退出救援模式", Some(state))
            }
            "get_info" => {
                let req: InstanceRequest = parse(payload)?;
                to_payload(&driver.get_info(&req.instance).await?)
            }
            "get_instance_disk_info" => {
                let req: InstanceRequest = parse(payload)?;
                to_payload(&driver.get_instance_disk_info(&req.instance).await?)
            }
            "snapshot" => {
                let req: SnapshotRequest = parse(payload)?;
                let path = driver.snapshot(&req.instance, &req.image_id).await?;
                Ok(json!({ "image_id": req.image_id, "path": path }))
            }

            // 卷与控制台
            "attach_volume" => {
                let req: VolumeRequest = parse(payload)?;
                driver
                    .attach_volume(&req.instance, &req.connection_info, req.mountpoint.as_deref())
                    .await?;
                operation_response("存储卷挂载成功", None)
            }
            "detach_volume" => {
                let req: VolumeRequest = parse(payload)?;
                driver
                    .detach_volume(&req.instance, &req.connection_info, req.mountpoint.as_deref())
                    .await?;
                operation_response("存储卷分离成功", None)
            }
            "get_volume_connector" => {
                let req: InstanceRequest = parse(payload)?;
                to_payload(&driver.get_volume_connector(&req.instance))
            }
            "get_serial_console" => {
                let req: InstanceRequest = parse(payload)?;
                to_payload(&driver.get_serial_console(&req.instance).await?)
            }
            "get_console_output" => {
                let req: InstanceRequest = parse(payload)?;
                let output = driver.get_console_output(&req.instance).await?;
                Ok(json!({ "output": output }))
            }
            "get_rdp_console" => {
                let req: InstanceRequest = parse(payload)?;
                to_payload(&driver.get_rdp_console(&req.instance).await?)
            }
            "manage_image_cache" => {
                let req: ManageImageCacheRequest = parse(payload)?;
                let removed = driver.manage_image_cache(&req.all_instances).await?;
                Ok(json!({ "removed": removed }))
            }

            // 网络
            "plug_vifs" => {
                let req: InstanceRequest = parse(payload)?;
                driver.plug_vifs(&req.instance, &req.network_info).await?;
                operation_response("网卡已插入", None)
            }
            "unplug_vifs" => {
                let req: InstanceRequest = parse(payload)?;
                driver.unplug_vifs(&req.instance, &req.network_info).await?;
                operation_response("网卡已拔出", None)
            }
            "ensure_filtering_rules_for_instance" => {
                let req: InstanceRequest = parse(payload)?;
                driver
                    .ensure_filtering_rules_for_instance(&req.instance, &req.network_info)
                    .await?;
                operation_response("过滤规则已就绪", None)
            }
            "unfilter_instance" => {
                let req: InstanceRequest = parse(payload)?;
                driver.unfilter_instance(&req.instance, &req.network_info).await?;
                operation_response("过滤规则已移除", None)
            }

            // 热迁移
            "check_can_live_migrate_destination" => {
                let req: CheckLiveMigrateDestinationRequest = parse(payload)?;
                let data = driver
                    .check_can_live_migrate_destination(
                        &req.instance,
                        &req.src_compute_info,
                        &req.dst_compute_info,
                        req.block_migration,
                        req.disk_over_commit,
                    )
                    .await?;
                to_payload(&data)
            }
            "check_can_live_migrate_destination_cleanup" => {
                let data: LiveMigrationCheckData = parse(payload)?;
                driver.check_can_live_migrate_destination_cleanup(&data).await?;
                operation_response("清理完成", None)
            }
            "check_can_live_migrate_source" => {
                let req: CheckLiveMigrateSourceRequest = parse(payload)?;
                let data = driver
                    .check_can_live_migrate_source(&req.instance, &req.dest_check_data)
                    .await?;
                to_payload(&data)
            }
            "pre_live_migration" => {
                let req: PreLiveMigrationRequest = parse(payload)?;
                driver
                    .pre_live_migration(
                        &req.instance,
                        &req.block_device_info,
                        &req.network_info,
                        req.migrate_data.as_ref(),
                    )
                    .await?;
                operation_response("目标端已就绪", None)
            }
            "post_live_migration" => {
                let req: InstanceRequest = parse(payload)?;
                driver
                    .post_live_migration(&req.instance, &req.block_device_info)
                    .await?;
                operation_response("源端收尾完成", None)
            }
            "post_live_migration_at_destination" => {
                let req: PostLiveMigrationAtDestinationRequest = parse(payload)?;
                let state = driver
                    .post_live_migration_at_destination(&req.instance, &req.network_info, req.block_migration)
                    .await?;
                operation_response("目标端收尾完成", Some(state))
            }
            "rollback_live_migration_at_destination" => {
                let req: DestroyRequest = parse(payload)?;
                driver
                    .rollback_live_migration_at_destination(
                        &req.instance,
                        &req.network_info,
                        &req.block_device_info,
                        req.destroy_disks,
                    )
                    .await?;
                operation_response("目标端已回滚", None)
            }

            // 冷迁移 / 变更规格
            "migrate_disk_and_power_off" => {
                let req: MigrateDiskAndPowerOffRequest = parse(payload)?;
                let disk_info = driver
                    .migrate_disk_and_power_off(
                        &req.instance,
                        &req.dest,
                        &req.flavor,
                        &req.network_info,
                        &req.block_device_info,
                        req.timeout,
                        req.retry_interval,
                    )
                    .await?;
                to_payload(&disk_info)
            }
            "finish_migration" => {
                let req: FinishMigrationRequest = parse(payload)?;
                let state = driver
                    .finish_migration(
                        &req.migration,
                        &req.instance,
                        &req.disk_info,
                        &req.network_info,
                        &req.image_meta,
                        req.resize_instance,
                        &req.block_device_info,
                        req.power_on,
                    )
                    .await?;
                operation_response("迁移导入完成", Some(state))
            }
            "confirm_migration" => {
                let req: ConfirmMigrationRequest = parse(payload)?;
                driver
                    .confirm_migration(&req.migration, &req.instance, &req.network_info)
                    .await?;
                operation_response("迁移已确认", None)
            }
            "finish_revert_migration" => {
                let req: FinishRevertMigrationRequest = parse(payload)?;
                let state = driver
                    .finish_revert_migration(
                        &req.instance,
                        &req.network_info,
                        &req.block_device_info,
                        req.power_on,
                    )
                    .await?;
                operation_response("迁移已回滚", Some(state))
            }

            _ => Err(RpcError::method_not_found(method)),
        }
    }

    /// 处理异步通知的统一入口
    pub async fn handle_notification(&self, method: &str, payload: Value) -> Result<(), RpcError> {
        debug!("处理异步通知: method={}", method);

        match method {
            "live_migration_async" => {
                let req: LiveMigrationRequest = parse(payload)?;
                self.spawn_live_migration(req);
                Ok(())
            }
            _ => {
                warn!("未知的通知方法: {}", method);
                Err(RpcError::method_not_found(method))
            }
        }
    }

    /// 在后台执行热迁移，结果通过 `live_migration_result` 通知上报
    fn spawn_live_migration(&self, req: LiveMigrationRequest) {
        let driver = self.driver.clone();
        let notifier = self.notifier.clone();

        tokio::spawn(async move {
            let fired = Arc::new(AtomicBool::new(false));
            let post = migration_callback(notifier.clone(), fired.clone(), true);
            let recover = migration_callback(notifier.clone(), fired.clone(), false);

            info!("🚚 异步热迁移: {} -> {}", req.instance.uuid, req.dest);
            let result = driver
                .live_migration(
                    &req.instance,
                    &req.dest,
                    post,
                    recover,
                    req.block_migration,
                    req.migrate_data,
                )
                .await;

            if let Err(e) = result {
                error!("❌ 异步热迁移失败: {} ({})", req.instance.uuid, e);
                // 迁移开始前就被拒绝时两个回调都不会执行
                if !fired.load(Ordering::SeqCst) {
                    notifier.notify(
                        "live_migration_result",
                        &LiveMigrationNotification {
                            instance_id: req.instance.uuid,
                            dest: req.dest.clone(),
                            block_migration: req.block_migration,
                            success: false,
                            message: e.to_string(),
                        },
                    );
                }
            }
        });
    }
}
