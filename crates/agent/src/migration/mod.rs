/// 迁移协调
///
/// 热迁移分为目标端检查、源端检查、目标端准备、源端执行、两端收尾五个阶段；
/// 冷迁移/变更规格分为源端关机导出、目标端导入、确认或回滚三个阶段。
/// 每个实例同时只允许一个迁移上下文，执行阶段持有实例锁。

pub mod cold;
pub mod context;
pub mod live;
pub mod precheck;

use common::models::Instance;
use common::Result;
use futures_util::future::BoxFuture;
use std::sync::Arc;

use crate::hypervisor::HypervisorGateway;
use crate::orchestrator::LifecycleOrchestrator;

pub use context::{MigrationContext, MigrationContexts, MigrationRole};
pub use precheck::CompatibilityError;

/// 热迁移完成/失败回调，参数为 (实例, 目标主机, 是否块迁移)，只调用一次
pub type MigrationCallback =
    Box<dyn FnOnce(Instance, String, bool) -> BoxFuture<'static, Result<()>> + Send>;

pub struct MigrationCoordinator {
    orchestrator: Arc<LifecycleOrchestrator>,
    contexts: MigrationContexts,
}

impl MigrationCoordinator {
    pub fn new(orchestrator: Arc<LifecycleOrchestrator>) -> Self {
        Self {
            orchestrator,
            contexts: MigrationContexts::new(),
        }
    }

    pub fn contexts(&self) -> &MigrationContexts {
        &self.contexts
    }

    fn gateway(&self) -> &Arc<dyn HypervisorGateway> {
        self.orchestrator.gateway()
    }
}
