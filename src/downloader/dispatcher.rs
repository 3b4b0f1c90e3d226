//! 动作调度器
//!
//! 每个客户端动作（download / cancel / retry / remove）是一个独立的
//! 并发执行单元，彼此不做全局串行化；对任一任务记录的修改必须在
//! 注册表独占区域内完成整个读-改-写，落库之后向观察者广播最新快照。
//! 同一任务上并发动作的竞争收敛为后写者胜。
//!
//! 抓取协作方不直接修改共享状态：进度与终态经 mpsc 通道回送，由
//! 这里唯一的事件循环统一处理。

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::persistence::RecordStore;

use super::fetcher::{FetchEvent, FetchJob, Fetcher};
use super::registry::TaskRegistry;
use super::task::{DownloadSettings, TaskRecord, TaskStatus};

/// 客户端提交的下载请求
#[derive(Debug, Clone, Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub video_identifier: String,
    pub folder_name: String,
    #[serde(default)]
    pub audio_only: bool,
}

/// 广播给观察者的下载列表快照
pub type DownloadListSnapshot = HashMap<i64, TaskRecord>;

/// 动作调度器
pub struct ActionDispatcher {
    /// 任务注册表（权威工作副本）
    registry: Arc<TaskRegistry>,
    /// 任务记录存储
    store: Arc<RecordStore>,
    /// 抓取协作方
    fetcher: Arc<dyn Fetcher>,
    /// 已配置的文件夹档案（folder_name -> 下载设置）
    folder_profiles: HashMap<String, DownloadSettings>,
    /// 每个运行中任务的取消令牌
    cancellation_tokens: RwLock<HashMap<i64, CancellationToken>>,
    /// 抓取事件回送通道（克隆给每个抓取作业）
    fetch_tx: mpsc::UnboundedSender<FetchEvent>,
    /// 观察者快照通道
    snapshot_tx: mpsc::UnboundedSender<DownloadListSnapshot>,
}

impl ActionDispatcher {
    /// 创建调度器并启动抓取事件循环
    pub fn new(
        registry: Arc<TaskRegistry>,
        store: Arc<RecordStore>,
        fetcher: Arc<dyn Fetcher>,
        folder_profiles: HashMap<String, DownloadSettings>,
        snapshot_tx: mpsc::UnboundedSender<DownloadListSnapshot>,
    ) -> Arc<Self> {
        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();

        let dispatcher = Arc::new(Self {
            registry,
            store,
            fetcher,
            folder_profiles,
            cancellation_tokens: RwLock::new(HashMap::new()),
            fetch_tx,
            snapshot_tx,
        });

        let event_loop = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            event_loop.run_fetch_events(fetch_rx).await;
        });

        dispatcher
    }

    /// 处理下载动作
    ///
    /// 未知的 folder_name 在任何状态变更之前拒绝并记日志，不重试。
    pub async fn download(&self, request: DownloadRequest) {
        let Some(settings) = self.folder_profiles.get(&request.folder_name) else {
            warn!("拒绝下载请求，未知的目标文件夹: {}", request.folder_name);
            return;
        };

        let id = self.registry.next_id();
        let mut record = TaskRecord::new(
            id,
            request.url,
            request.folder_name,
            request.audio_only,
            settings.clone(),
        );
        record.title = request.title;
        record.video_identifier = request.video_identifier;

        self.registry.upsert(record.clone()).await;
        self.persist_full_and_notify().await;
        info!("新建下载任务 {}: {}", id, record.url);

        self.spawn_fetch(record).await;
    }

    /// 处理取消动作
    ///
    /// 取消是协作式的：触发令牌后由抓取方自行退出，状态在这里写入。
    pub async fn cancel_items(&self, ids: Vec<i64>) {
        for id in ids {
            let cancelled = self
                .registry
                .update(id, |rec| {
                    if rec.status.is_cancellable() {
                        rec.mark_cancelled();
                        true
                    } else {
                        false
                    }
                })
                .await
                .unwrap_or(false);

            if !cancelled {
                debug!("取消请求忽略任务 {}（不存在或已完成）", id);
                continue;
            }

            if let Some(token) = self.cancellation_tokens.write().await.remove(&id) {
                token.cancel();
            }
            self.store.update_status(id, TaskStatus::Cancelled);
            info!("任务 {} 已取消", id);
        }
        self.notify_observers().await;
    }

    /// 处理重试动作
    ///
    /// 只有 failed / cancelled 的任务可以重试：清空进度、回到排队态、
    /// 重新交给抓取协作方。
    pub async fn retry_items(&self, ids: Vec<i64>) {
        let mut touched = false;
        for id in ids {
            let record = self
                .registry
                .update(id, |rec| {
                    if rec.status.is_retryable() {
                        rec.mark_queued();
                        Some(rec.clone())
                    } else {
                        None
                    }
                })
                .await
                .flatten();

            let Some(record) = record else {
                debug!("重试请求忽略任务 {}（不存在或状态不可重试）", id);
                continue;
            };

            touched = true;
            info!("任务 {} 重新入队", id);
            self.spawn_fetch(record).await;
        }

        if touched {
            self.persist_full_and_notify().await;
        }
    }

    /// 处理移除动作
    ///
    /// 行删除只发生在这里，任务永远不会被隐式销毁。
    pub async fn remove_items(&self, ids: Vec<i64>) {
        for id in ids {
            if let Some(token) = self.cancellation_tokens.write().await.remove(&id) {
                token.cancel();
            }

            if self.registry.remove(id).await.is_some() {
                self.store.delete_one(id);
                info!("任务 {} 已移除", id);
            } else {
                debug!("移除请求忽略任务 {}（不存在）", id);
            }
        }
        self.notify_observers().await;
    }

    /// 进程退出前触发所有令牌并保存最终快照
    pub async fn shutdown(&self) {
        let tokens: Vec<CancellationToken> = {
            let mut guard = self.cancellation_tokens.write().await;
            guard.drain().map(|(_, token)| token).collect()
        };
        for token in tokens {
            token.cancel();
        }

        let snapshot = self.registry.snapshot().await;
        self.store.save_all(&snapshot);
        info!("调度器已停止，最终快照包含 {} 条记录", snapshot.len());
    }

    /// 把任务交给抓取协作方，在独立的并发单元中运行
    ///
    /// 状态复查与令牌登记在同一次注册表持锁期间完成：落在记录可见
    /// 之后、启动之前的并发取消要么让这里直接跳过，要么拿得到已登
    /// 记的令牌。抓取本身可能持续整个下载周期，必须在任何锁之外进行。
    async fn spawn_fetch(&self, record: TaskRecord) {
        let token = CancellationToken::new();
        {
            let items = self.registry.write().await;
            let mut tokens = self.cancellation_tokens.write().await;
            match items.get(&record.id) {
                Some(rec) if rec.status == TaskStatus::Queued => {
                    tokens.insert(record.id, token.clone());
                }
                _ => {
                    debug!("任务 {} 已不在排队状态，跳过抓取启动", record.id);
                    return;
                }
            }
        }

        let job = FetchJob {
            task_id: record.id,
            url: record.url,
            download_settings: record.download_settings,
            audio_only: record.audio_only,
        };
        let fetcher = Arc::clone(&self.fetcher);
        let events = self.fetch_tx.clone();

        tokio::spawn(async move {
            fetcher.fetch(job, events, token).await;
        });
    }

    /// 抓取事件循环：唯一允许因协作方事件修改注册表的地方
    async fn run_fetch_events(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<FetchEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                FetchEvent::Progress { task_id, progress } => {
                    // 进度更新频繁，只进内存并广播，不单独落库
                    let started = self
                        .registry
                        .update(task_id, |rec| {
                            match rec.status {
                                TaskStatus::Queued => {
                                    rec.mark_downloading();
                                    rec.progress = progress;
                                    true
                                }
                                TaskStatus::Downloading => {
                                    rec.progress = progress;
                                    false
                                }
                                // 已取消/终态任务的迟到进度直接丢弃
                                _ => false,
                            }
                        })
                        .await
                        .unwrap_or(false);

                    if started {
                        self.store.update_status(task_id, TaskStatus::Downloading);
                    }
                    self.notify_observers().await;
                }
                FetchEvent::Completed { task_id } => {
                    self.finish_task(task_id, None).await;
                }
                FetchEvent::Failed { task_id, error } => {
                    self.finish_task(task_id, Some(error)).await;
                }
            }
        }
    }

    /// 写入终态：协作方的错误记入 status/progress，不向上传播
    async fn finish_task(&self, task_id: i64, error: Option<String>) {
        self.cancellation_tokens.write().await.remove(&task_id);

        let applied = self
            .registry
            .update(task_id, |rec| {
                // 已取消的任务不被迟到的终态覆盖
                if rec.status == TaskStatus::Cancelled {
                    return None;
                }
                match &error {
                    None => rec.mark_completed(),
                    Some(msg) => rec.mark_failed(msg.clone()),
                }
                Some(rec.status)
            })
            .await
            .flatten();

        match (applied, &error) {
            (Some(_), None) => info!("任务 {} 下载完成", task_id),
            (Some(_), Some(msg)) => warn!("任务 {} 下载失败: {}", task_id, msg),
            (None, _) => {
                debug!("任务 {} 的终态事件被忽略（不存在或已取消）", task_id);
                return;
            }
        }

        let status = if error.is_none() {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        if !self.store.update_status(task_id, status) {
            // 内存里有但库里没有，说明之前的保存被降级跳过，补一次全量
            self.store.save_all(&self.registry.snapshot().await);
        }
        self.notify_observers().await;
    }

    /// 全量落库并广播快照
    async fn persist_full_and_notify(&self) {
        let snapshot = self.registry.snapshot().await;
        self.store.save_all(&snapshot);
        let _ = self.snapshot_tx.send(snapshot);
    }

    /// 只广播快照（点更新已单独落库）
    async fn notify_observers(&self) {
        let _ = self.snapshot_tx.send(self.registry.snapshot().await);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// 脚本化的抓取替身：按预定剧本消费作业，默认驻留直到取消
    #[derive(Debug, Clone, PartialEq)]
    enum Script {
        /// 立即回送完成
        Complete,
        /// 立即回送失败
        Fail(&'static str),
        /// 回送一次进度后驻留直到取消
        ProgressThenPark(&'static str),
        /// 什么都不回送，驻留直到取消
        Park,
    }

    struct ScriptedFetcher {
        scripts: Mutex<VecDeque<Script>>,
        jobs: Mutex<Vec<FetchJob>>,
    }

    impl ScriptedFetcher {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                jobs: Mutex::new(Vec::new()),
            })
        }

        fn job_count(&self) -> usize {
            self.jobs.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(
            &self,
            job: FetchJob,
            events: mpsc::UnboundedSender<FetchEvent>,
            cancel: CancellationToken,
        ) {
            let task_id = job.task_id;
            self.jobs.lock().unwrap().push(job);
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Script::Park);

            match script {
                Script::Complete => {
                    let _ = events.send(FetchEvent::Completed { task_id });
                }
                Script::Fail(msg) => {
                    let _ = events.send(FetchEvent::Failed {
                        task_id,
                        error: msg.to_string(),
                    });
                }
                Script::ProgressThenPark(progress) => {
                    let _ = events.send(FetchEvent::Progress {
                        task_id,
                        progress: progress.to_string(),
                    });
                    cancel.cancelled().await;
                }
                Script::Park => {
                    cancel.cancelled().await;
                }
            }
        }
    }

    struct Harness {
        dispatcher: Arc<ActionDispatcher>,
        registry: Arc<TaskRegistry>,
        store: Arc<RecordStore>,
        fetcher: Arc<ScriptedFetcher>,
        snapshot_rx: mpsc::UnboundedReceiver<DownloadListSnapshot>,
        dir: TempDir,
    }

    fn harness(scripts: Vec<Script>) -> Harness {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(TaskRegistry::new());
        let store = Arc::new(RecordStore::new(dir.path()).unwrap());
        let fetcher = ScriptedFetcher::new(scripts);
        let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel();

        let mut profiles = HashMap::new();
        let mut settings = DownloadSettings::new();
        settings.insert("location".to_string(), Value::String("/data/videos".to_string()));
        profiles.insert("videos".to_string(), settings);

        let dispatcher = ActionDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            fetcher.clone() as Arc<dyn Fetcher>,
            profiles,
            snapshot_tx,
        );

        Harness {
            dispatcher,
            registry,
            store,
            fetcher,
            snapshot_rx,
            dir,
        }
    }

    fn request(folder: &str) -> DownloadRequest {
        DownloadRequest {
            url: "https://example.com/v/abc".to_string(),
            title: "some video".to_string(),
            video_identifier: "abc".to_string(),
            folder_name: folder.to_string(),
            audio_only: false,
        }
    }

    /// 轮询等待任务达到指定状态
    async fn wait_for_status(registry: &TaskRegistry, id: i64, status: TaskStatus) {
        for _ in 0..200 {
            if registry.get(id).await.map(|r| r.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("任务 {} 未在限期内达到 {:?}", id, status);
    }

    #[tokio::test]
    async fn test_unknown_folder_rejected_without_state_change() {
        let mut h = harness(vec![]);
        h.dispatcher.download(request("nonexistent")).await;

        assert!(h.registry.is_empty().await);
        assert!(h.store.load_all().is_empty());
        assert_eq!(h.fetcher.job_count(), 0);
        // 拒绝发生在任何变更之前，没有快照广播
        assert!(h.snapshot_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_download_creates_queued_task_with_profile_settings() {
        let mut h = harness(vec![Script::Park]);
        h.dispatcher.download(request("videos")).await;

        let record = h.registry.get(1).await.unwrap();
        assert_eq!(record.status, TaskStatus::Queued);
        assert_eq!(record.progress, "0%");
        assert_eq!(
            record.download_settings.get("location"),
            Some(&Value::String("/data/videos".to_string()))
        );

        // 立即落库，且观察者收到包含新任务的快照
        assert_eq!(h.store.load_all()[&1].status, TaskStatus::Queued);
        let snapshot = h.snapshot_rx.recv().await.unwrap();
        assert!(snapshot.contains_key(&1));
    }

    #[tokio::test]
    async fn test_completion_persists_across_restart() {
        let h = harness(vec![Script::Complete]);
        h.dispatcher.download(request("videos")).await;
        wait_for_status(&h.registry, 1, TaskStatus::Completed).await;

        // 模拟重启：关闭后用同一目录新建存储
        h.store.close();
        let reopened = RecordStore::new(h.dir.path()).unwrap();
        let loaded = reopened.load_all();
        assert_eq!(loaded[&1].status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_fetch_failure_recorded_not_propagated() {
        let h = harness(vec![Script::Fail("network unreachable")]);
        h.dispatcher.download(request("videos")).await;
        wait_for_status(&h.registry, 1, TaskStatus::Failed).await;

        let record = h.registry.get(1).await.unwrap();
        assert_eq!(record.progress, "network unreachable");
        assert_eq!(h.store.load_all()[&1].status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_progress_moves_queued_to_downloading() {
        let h = harness(vec![Script::ProgressThenPark("42.5%")]);
        h.dispatcher.download(request("videos")).await;
        wait_for_status(&h.registry, 1, TaskStatus::Downloading).await;

        assert_eq!(h.registry.get(1).await.unwrap().progress, "42.5%");
        assert_eq!(h.store.load_all()[&1].status, TaskStatus::Downloading);
    }

    #[tokio::test]
    async fn test_cancel_running_task() {
        let h = harness(vec![Script::ProgressThenPark("10%")]);
        h.dispatcher.download(request("videos")).await;
        wait_for_status(&h.registry, 1, TaskStatus::Downloading).await;

        h.dispatcher.cancel_items(vec![1]).await;

        assert_eq!(h.registry.get(1).await.unwrap().status, TaskStatus::Cancelled);
        assert_eq!(h.store.load_all()[&1].status, TaskStatus::Cancelled);
        // 令牌已触发并被回收
        assert!(h.dispatcher.cancellation_tokens.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_between_insert_and_launch_skips_fetch() {
        let h = harness(vec![Script::Park]);

        // 重现 download 内部的间隙：记录已可见、抓取尚未启动时被取消
        let id = h.registry.next_id();
        let record = TaskRecord::new(
            id,
            "https://example.com/v/abc".to_string(),
            "videos".to_string(),
            false,
            DownloadSettings::new(),
        );
        h.registry.upsert(record.clone()).await;
        h.dispatcher.cancel_items(vec![id]).await;

        h.dispatcher.spawn_fetch(record).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        // 已取消的任务不会开跑，也不会留下无人触发的令牌
        assert_eq!(h.fetcher.job_count(), 0);
        assert!(h.dispatcher.cancellation_tokens.read().await.is_empty());
        assert_eq!(h.registry.get(id).await.unwrap().status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_concurrent_download_and_cancel_never_torn() {
        let h = harness(vec![Script::ProgressThenPark("10%")]);
        let dispatcher = Arc::clone(&h.dispatcher);

        let download = dispatcher.download(request("videos"));
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(2)).await;
            h.dispatcher.cancel_items(vec![1]).await;
        };
        tokio::join!(download, cancel);

        // 等记录离开排队态：进度事件与取消至少有一个会写入
        let mut status = TaskStatus::Queued;
        for _ in 0..200 {
            status = h.registry.get(1).await.unwrap().status;
            if status != TaskStatus::Queued {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // 竞争收敛为后写者胜：结果只能是其一，不会撕裂
        assert!(
            matches!(status, TaskStatus::Downloading | TaskStatus::Cancelled),
            "意外状态: {:?}",
            status
        );
    }

    #[tokio::test]
    async fn test_cancel_ignores_completed_and_missing() {
        let h = harness(vec![Script::Complete]);
        h.dispatcher.download(request("videos")).await;
        wait_for_status(&h.registry, 1, TaskStatus::Completed).await;

        h.dispatcher.cancel_items(vec![1, 99]).await;

        assert_eq!(h.registry.get(1).await.unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_retry_failed_task_requeues() {
        let h = harness(vec![Script::Fail("boom"), Script::Park]);
        h.dispatcher.download(request("videos")).await;
        wait_for_status(&h.registry, 1, TaskStatus::Failed).await;

        h.dispatcher.retry_items(vec![1]).await;
        wait_for_status(&h.registry, 1, TaskStatus::Queued).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let record = h.registry.get(1).await.unwrap();
        assert_eq!(record.progress, "0%");
        assert_eq!(h.fetcher.job_count(), 2);
        assert_eq!(h.store.load_all()[&1].status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn test_retry_ignores_non_retryable() {
        let h = harness(vec![Script::Park]);
        h.dispatcher.download(request("videos")).await;

        // queued 不可重试
        h.dispatcher.retry_items(vec![1]).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.fetcher.job_count(), 1);
    }

    #[tokio::test]
    async fn test_remove_erases_registry_and_row() {
        let h = harness(vec![Script::Park]);
        h.dispatcher.download(request("videos")).await;
        assert!(h.store.load_all().contains_key(&1));

        h.dispatcher.remove_items(vec![1]).await;

        assert!(h.registry.is_empty().await);
        assert!(!h.store.load_all().contains_key(&1));

        // 重启后也不会复活
        h.store.close();
        let reopened = RecordStore::new(h.dir.path()).unwrap();
        assert!(reopened.load_all().is_empty());
    }

    #[tokio::test]
    async fn test_late_failure_does_not_override_cancelled() {
        let h = harness(vec![Script::Park]);
        h.dispatcher.download(request("videos")).await;
        h.dispatcher.cancel_items(vec![1]).await;

        // 模拟抓取方被杀后迟到的失败事件
        let _ = h.dispatcher.fetch_tx.send(FetchEvent::Failed {
            task_id: 1,
            error: "killed".to_string(),
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(h.registry.get(1).await.unwrap().status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_shutdown_saves_final_snapshot() {
        let h = harness(vec![Script::Park]);
        h.dispatcher.download(request("videos")).await;
        let _ = h
            .registry
            .update(1, |rec| rec.progress = "55%".to_string())
            .await;

        h.dispatcher.shutdown().await;

        assert_eq!(h.store.load_all()[&1].progress, "55%");
        assert!(h.dispatcher.cancellation_tokens.read().await.is_empty());
    }
}
