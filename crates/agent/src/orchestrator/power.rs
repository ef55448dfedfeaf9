/// 有界关机策略

use common::models::{InstanceState, PowerState};
use common::utils::bounded_attempts;
use common::Result;
use std::time::Duration;
use tracing::{info, warn};

use super::{InstanceGuard, LifecycleOrchestrator};
use crate::hypervisor::PowerAction;

/// 关机策略
///
/// 每隔 `retry_interval` 秒请求一次正常关机，总时长不超过 `timeout` 秒，
/// 之后强制断电。`timeout` 为 0 表示立即强制断电。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PowerOffPolicy {
    pub timeout: u64,
    pub retry_interval: u64,
}

impl PowerOffPolicy {
    pub fn new(timeout: u64, retry_interval: u64) -> Self {
        Self { timeout, retry_interval }
    }

    /// 立即强制断电
    pub fn immediate() -> Self {
        Self::default()
    }

    pub fn max_attempts(&self) -> u64 {
        bounded_attempts(self.timeout, self.retry_interval)
    }

    fn wait_interval(&self) -> u64 {
        if self.retry_interval == 0 {
            self.timeout
        } else {
            self.retry_interval
        }
    }
}

impl LifecycleOrchestrator {
    pub(crate) async fn power_off_locked(
        &self,
        guard: &InstanceGuard,
        policy: PowerOffPolicy,
    ) -> Result<InstanceState> {
        let id = guard.instance_id();
        let gateway = self.gateway();

        if gateway.power_state(id).await? == PowerState::Stopped {
            info!("ℹ️ 虚拟机已关机: {}", id);
            return Ok(InstanceState::PoweredOff);
        }

        let attempts = policy.max_attempts();
        let mut remaining = policy.timeout;

        for attempt in 1..=attempts {
            info!("🔄 请求正常关机: {} (第 {}/{} 次)", id, attempt, attempts);
            if let Err(e) = gateway.set_power_state(id, PowerAction::Shutdown).await {
                warn!("⚠️ 正常关机请求失败，改为强制断电: {} ({})", id, e);
                break;
            }

            let wait = policy.wait_interval().min(remaining);
            tokio::time::sleep(Duration::from_secs(wait)).await;
            remaining -= wait;

            if gateway.power_state(id).await? == PowerState::Stopped {
                info!("✅ 虚拟机已正常关机: {}", id);
                return self.verify_state(id, PowerState::Stopped).await;
            }
        }

        if attempts > 0 {
            warn!("⚠️ 正常关机超时，强制断电: {}", id);
        } else {
            info!("⚡ 强制断电: {}", id);
        }
        gateway.set_power_state(id, PowerAction::Stop).await?;
        self.verify_state(id, PowerState::Stopped).await
    }
}
