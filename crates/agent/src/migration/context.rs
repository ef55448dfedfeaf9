/// 迁移上下文
///
/// 迁移发起时创建，按阶段更新，成功或回滚后丢弃。只保存在内存中，
/// 每个实例同时最多一个。

use chrono::{DateTime, Utc};
use common::models::{LiveMigrationCheckData, MigrationType};
use common::{Error, Result};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// 本机在迁移中的角色
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationRole {
    Source,
    Destination,
}

#[derive(Debug, Clone)]
pub struct MigrationContext {
    pub instance_id: Uuid,
    pub role: MigrationRole,
    pub source_host: String,
    pub dest_host: String,
    pub migration_type: MigrationType,
    pub block_migration: bool,
    pub dest_check_data: Option<LiveMigrationCheckData>,
    /// 源端磁盘路径 -> 目标端磁盘路径
    pub disk_mapping: HashMap<String, String>,
    pub confirmed: bool,
    pub created_at: DateTime<Utc>,
}

impl MigrationContext {
    pub fn new(
        instance_id: Uuid,
        role: MigrationRole,
        source_host: impl Into<String>,
        dest_host: impl Into<String>,
        migration_type: MigrationType,
    ) -> Self {
        Self {
            instance_id,
            role,
            source_host: source_host.into(),
            dest_host: dest_host.into(),
            migration_type,
            block_migration: false,
            dest_check_data: None,
            disk_mapping: HashMap::new(),
            confirmed: false,
            created_at: Utc::now(),
        }
    }
}

#[derive(Default)]
pub struct MigrationContexts {
    inner: Mutex<HashMap<Uuid, MigrationContext>>,
}

impl MigrationContexts {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<Uuid, MigrationContext>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 登记上下文，同一实例已有迁移时拒绝
    pub fn register(&self, context: MigrationContext) -> Result<()> {
        let mut table = self.table();
        if let Some(existing) = table.get(&context.instance_id) {
            return Err(Error::InvalidStateTransition(format!(
                "实例 {} 已有进行中的迁移 ({} -> {})",
                context.instance_id, existing.source_host, existing.dest_host
            )));
        }
        table.insert(context.instance_id, context);
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Option<MigrationContext> {
        self.table().get(&id).cloned()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.table().contains_key(&id)
    }

    pub fn update<F>(&self, id: Uuid, f: F) -> Result<()>
    where
        F: FnOnce(&mut MigrationContext),
    {
        let mut table = self.table();
        let context = table
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("迁移上下文不存在: {}", id)))?;
        f(context);
        Ok(())
    }

    pub fn remove(&self, id: Uuid) -> Option<MigrationContext> {
        self.table().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_context_per_instance() {
        let contexts = MigrationContexts::new();
        let id = Uuid::new_v4();
        let ctx = MigrationContext::new(id, MigrationRole::Source, "a", "b", MigrationType::Live);

        contexts.register(ctx.clone()).unwrap();
        assert!(matches!(
            contexts.register(ctx),
            Err(Error::InvalidStateTransition(_))
        ));

        contexts.update(id, |c| c.confirmed = true).unwrap();
        assert!(contexts.remove(id).unwrap().confirmed);
        assert!(contexts.is_empty());
    }
}
