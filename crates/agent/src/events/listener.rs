/// 虚拟机状态事件监听
///
/// 每个订阅一个后台轮询任务：按 `poll_interval` 对所有虚拟机的电源状态做快照，
/// 与上一次快照比较，对每个变化产生一个 `HostEvent` 并交给回调（至多一次）。
/// 第一次快照只作为基线，不产生事件。

use common::models::{HostEvent, PowerState};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::hypervisor::HypervisorGateway;

type Snapshot = HashMap<Uuid, PowerState>;

/// 比较两次快照，返回状态发生变化（含新出现）的虚拟机；消失的虚拟机不产生事件
pub fn diff_snapshots(previous: &Snapshot, current: &Snapshot) -> Vec<(Uuid, PowerState)> {
    let mut changed: Vec<(Uuid, PowerState)> = current
        .iter()
        .filter(|(id, state)| previous.get(id) != Some(state))
        .map(|(id, state)| (*id, *state))
        .collect();
    changed.sort_by_key(|(id, _)| *id);
    changed
}

pub struct EventListener {
    gateway: Arc<dyn HypervisorGateway>,
    poll_interval: Duration,
}

/// 事件订阅，调用 `unsubscribe` 或 Drop 时停止轮询
pub struct Subscription {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Subscription {
    /// 停止轮询并等待后台任务退出
    pub async fn unsubscribe(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl EventListener {
    pub fn new(gateway: Arc<dyn HypervisorGateway>, poll_interval: Duration) -> Self {
        Self {
            gateway,
            poll_interval,
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(HostEvent) + Send + Sync + 'static,
    {
        let cancel = CancellationToken::new();
        let gateway = self.gateway.clone();
        let poll_interval = self.poll_interval;
        let token = cancel.clone();

        info!("👂 启动虚拟机状态监听 (间隔: {:?})", poll_interval);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            let mut previous: Option<Snapshot> = None;
            let mut sequence = 0u64;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let vms = match gateway.list_instances().await {
                    Ok(vms) => vms,
                    Err(e) => {
                        warn!("⚠️ 轮询虚拟机状态失败: {}", e);
                        continue;
                    }
                };
                let current: Snapshot = vms.into_iter().map(|vm| (vm.id, vm.power_state)).collect();

                if let Some(previous) = &previous {
                    for (instance_id, state) in diff_snapshots(previous, &current) {
                        if token.is_cancelled() {
                            break;
                        }
                        sequence += 1;
                        debug!("📣 虚拟机状态变化: {} -> {} (#{})", instance_id, state, sequence);
                        callback(HostEvent {
                            instance_id,
                            state,
                            sequence,
                            timestamp: chrono::Utc::now().timestamp(),
                        });
                    }
                }
                previous = Some(current);
            }

            info!("🔕 虚拟机状态监听已停止");
        });

        Subscription {
            cancel,
            handle: Some(handle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::memory::{GatewayOp, InjectedFailure};
    use crate::hypervisor::{InMemoryHypervisor, PowerAction, VmSpec};
    use std::sync::Mutex;

    async fn running_vm(hv: &InMemoryHypervisor) -> Uuid {
        let id = Uuid::new_v4();
        hv.create_instance(&VmSpec {
            id,
            name: "vm".to_string(),
            vcpus: 1,
            memory_mb: 512,
            disks: Vec::new(),
            nics: Vec::new(),
            config_drive: None,
        })
        .await
        .unwrap();
        hv.set_power_state(id, PowerAction::Start).await.unwrap();
        id
    }

    fn collector() -> (Arc<Mutex<Vec<HostEvent>>>, impl Fn(HostEvent) + Send + Sync + 'static) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        (events, move |event| sink.lock().unwrap().push(event))
    }

    #[test]
    fn test_diff_ignores_vanished_instances() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let previous = HashMap::from([(a, PowerState::Running), (b, PowerState::Running)]);
        let current = HashMap::from([(a, PowerState::Paused)]);
        assert_eq!(diff_snapshots(&previous, &current), vec![(a, PowerState::Paused)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_event_after_baseline() {
        let hv = Arc::new(InMemoryHypervisor::new("host-a"));
        let id = running_vm(&hv).await;
        let listener = EventListener::new(hv.clone(), Duration::from_secs(1));
        let (events, callback) = collector();

        let subscription = listener.subscribe(callback);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(events.lock().unwrap().is_empty());

        hv.set_external_power_state(id, PowerState::Stopped).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        subscription.unsubscribe().await;
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].instance_id, id);
        assert_eq!(events[0].state, PowerState::Stopped);
        assert_eq!(events[0].sequence, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_failure_keeps_subscription_alive() {
        let hv = Arc::new(InMemoryHypervisor::new("host-a"));
        let id = running_vm(&hv).await;
        let listener = EventListener::new(hv.clone(), Duration::from_secs(1));
        let (events, callback) = collector();

        let subscription = listener.subscribe(callback);
        tokio::time::sleep(Duration::from_millis(500)).await;

        hv.inject_failure(GatewayOp::ListInstances, InjectedFailure::Transport("超时".into()))
            .await;
        hv.set_external_power_state(id, PowerState::Paused).await.unwrap();
        // 第一次轮询失败，第二次轮询发现变化
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(subscription.is_active());
        subscription.unsubscribe().await;
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_events_after_unsubscribe() {
        let hv = Arc::new(InMemoryHypervisor::new("host-a"));
        let id = running_vm(&hv).await;
        let listener = EventListener::new(hv.clone(), Duration::from_secs(1));
        let (events, callback) = collector();

        let subscription = listener.subscribe(callback);
        tokio::time::sleep(Duration::from_millis(500)).await;
        subscription.unsubscribe().await;

        hv.set_external_power_state(id, PowerState::Paused).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(events.lock().unwrap().is_empty());
    }
}
