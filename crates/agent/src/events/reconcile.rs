/// 事件对账
///
/// 正在执行操作的实例，其状态由操作本身校验，监听到的事件直接丢弃；
/// 其余事件转发给 `StateSink`。

use common::models::HostEvent;
use std::sync::Arc;
use tracing::debug;

use crate::orchestrator::InstanceLocks;

/// 状态变化的接收方
pub trait StateSink: Send + Sync {
    fn instance_state_changed(&self, event: &HostEvent);
}

#[derive(Clone)]
pub struct EventReconciler {
    locks: InstanceLocks,
    sink: Arc<dyn StateSink>,
}

impl EventReconciler {
    pub fn new(locks: InstanceLocks, sink: Arc<dyn StateSink>) -> Self {
        Self { locks, sink }
    }

    /// 处理一个事件，返回是否已转发
    pub fn handle(&self, event: HostEvent) -> bool {
        if let Some(operation) = self.locks.in_flight(event.instance_id) {
            debug!(
                "丢弃事件: {} 正在执行 {} (#{})",
                event.instance_id, operation, event.sequence
            );
            return false;
        }
        self.sink.instance_state_changed(&event);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::models::PowerState;
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<HostEvent>>);

    impl StateSink for RecordingSink {
        fn instance_state_changed(&self, event: &HostEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    fn event(id: Uuid) -> HostEvent {
        HostEvent {
            instance_id: id,
            state: PowerState::Paused,
            sequence: 1,
            timestamp: 0,
        }
    }

    #[test]
    fn test_events_for_busy_instance_dropped() {
        let locks = InstanceLocks::new();
        let sink = Arc::new(RecordingSink::default());
        let reconciler = EventReconciler::new(locks.clone(), sink.clone());

        let busy = Uuid::new_v4();
        let _guard = locks.try_acquire(busy, "pause").unwrap();

        assert!(!reconciler.handle(event(busy)));
        assert!(reconciler.handle(event(Uuid::new_v4())));
        assert_eq!(sink.0.lock().unwrap().len(), 1);
    }
}
