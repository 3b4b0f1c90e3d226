//! 任务注册表
//!
//! 运行期任务记录的权威工作副本。所有动作对记录的读写都必须经过
//! 这里的独占区域；对外只发放拷贝快照，观察者不会拿到活引用。

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use tokio::sync::{RwLock, RwLockWriteGuard};

use super::task::TaskRecord;

/// 任务注册表
#[derive(Debug, Default)]
pub struct TaskRegistry {
    /// 任务记录（id -> TaskRecord）
    items: RwLock<HashMap<i64, TaskRecord>>,
    /// 下一个可分配的任务 ID
    next_id: AtomicI64,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    /// 启动时用持久化内容整体替换，并把 ID 计数器推到已有最大值之后
    pub async fn replace_all(&self, items: HashMap<i64, TaskRecord>) {
        let max_id = items.keys().copied().max().unwrap_or(0);
        self.next_id.fetch_max(max_id + 1, Ordering::SeqCst);
        *self.items.write().await = items;
    }

    /// 分配下一个任务 ID
    pub fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// 插入或覆盖一条记录
    pub async fn upsert(&self, record: TaskRecord) {
        self.items.write().await.insert(record.id, record);
    }

    /// 移除一条记录，返回被移除的内容
    pub async fn remove(&self, id: i64) -> Option<TaskRecord> {
        self.items.write().await.remove(&id)
    }

    /// 读取一条记录的拷贝
    pub async fn get(&self, id: i64) -> Option<TaskRecord> {
        self.items.read().await.get(&id).cloned()
    }

    /// 在注册表独占区域内完成一次完整的读-改-写
    ///
    /// 闭包执行期间持有写锁，并发动作对同一记录的竞争因此收敛为
    /// 后写者胜，不会出现撕裂状态。记录不存在时返回 None。
    pub async fn update<F, R>(&self, id: i64, f: F) -> Option<R>
    where
        F: FnOnce(&mut TaskRecord) -> R,
    {
        let mut items = self.items.write().await;
        items.get_mut(&id).map(f)
    }

    /// 独占写入句柄，供复合动作在一次持锁期间完成全部修改
    pub async fn write(&self) -> RwLockWriteGuard<'_, HashMap<i64, TaskRecord>> {
        self.items.write().await
    }

    /// 完整拷贝快照，O(n)，永远不是部分拷贝
    pub async fn snapshot(&self) -> HashMap<i64, TaskRecord> {
        self.items.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::task::{DownloadSettings, TaskStatus};

    fn record(id: i64) -> TaskRecord {
        TaskRecord::new(
            id,
            format!("https://example.com/{}", id),
            "videos".to_string(),
            false,
            DownloadSettings::new(),
        )
    }

    #[tokio::test]
    async fn test_upsert_get_remove() {
        let registry = TaskRegistry::new();
        registry.upsert(record(7)).await;

        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.get(7).await.unwrap().id, 7);
        assert!(registry.get(8).await.is_none());

        let removed = registry.remove(7).await;
        assert!(removed.is_some());
        assert!(registry.is_empty().await);
        assert!(registry.remove(7).await.is_none());
    }

    #[tokio::test]
    async fn test_update_holds_whole_read_modify_write() {
        let registry = TaskRegistry::new();
        registry.upsert(record(1)).await;

        let result = registry
            .update(1, |rec| {
                rec.mark_downloading();
                rec.status
            })
            .await;
        assert_eq!(result, Some(TaskStatus::Downloading));
        assert_eq!(registry.get(1).await.unwrap().status, TaskStatus::Downloading);

        assert!(registry.update(99, |rec| rec.mark_completed()).await.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_is_detached_copy() {
        let registry = TaskRegistry::new();
        registry.upsert(record(1)).await;

        let snapshot = registry.snapshot().await;
        registry.upsert(record(2)).await;

        // 快照不跟随后续变更
        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_next_id_advances_past_loaded_records() {
        let registry = TaskRegistry::new();
        let mut items = HashMap::new();
        items.insert(3, record(3));
        items.insert(17, record(17));
        registry.replace_all(items).await;

        assert_eq!(registry.next_id(), 18);
        assert_eq!(registry.next_id(), 19);
    }
}
