/// 实例级互斥锁表
///
/// 按实例 UUID 懒创建，释放时移除。同一实例同时只允许一个操作，
/// 第二个操作立即以 `InvalidStateTransition` 拒绝，不排队。

use common::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

type LockTable = HashMap<Uuid, &'static str>;

#[derive(Clone, Default)]
pub struct InstanceLocks {
    table: Arc<Mutex<LockTable>>,
}

/// 持有期间该实例被独占，Drop 时释放
pub struct InstanceGuard {
    id: Uuid,
    operation: &'static str,
    table: Arc<Mutex<LockTable>>,
}

impl InstanceGuard {
    pub fn instance_id(&self) -> Uuid {
        self.id
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        lock_table(&self.table).remove(&self.id);
    }
}

fn lock_table(table: &Mutex<LockTable>) -> MutexGuard<'_, LockTable> {
    // 表内只有简单插入删除，中毒后数据仍然一致
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InstanceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 尝试独占实例
    pub fn try_acquire(&self, id: Uuid, operation: &'static str) -> Result<InstanceGuard> {
        let mut table = lock_table(&self.table);
        if let Some(current) = table.get(&id) {
            return Err(Error::InvalidStateTransition(format!(
                "实例 {} 正在执行操作 {}，拒绝 {}",
                id, current, operation
            )));
        }
        table.insert(id, operation);

        Ok(InstanceGuard {
            id,
            operation,
            table: self.table.clone(),
        })
    }

    /// 实例是否有进行中的操作
    pub fn is_busy(&self, id: Uuid) -> bool {
        lock_table(&self.table).contains_key(&id)
    }

    /// 当前进行中的操作名
    pub fn in_flight(&self, id: Uuid) -> Option<&'static str> {
        lock_table(&self.table).get(&id).copied()
    }

    pub fn len(&self) -> usize {
        lock_table(&self.table).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
