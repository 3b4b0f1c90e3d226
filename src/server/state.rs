// 应用状态

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::downloader::{ActionDispatcher, TaskRegistry, YtDlpFetcher};
use crate::persistence::RecordStore;
use crate::server::websocket::{WebSocketManager, WsServerMessage};

/// 应用全局状态
#[derive(Clone)]
pub struct AppState {
    /// 应用配置
    pub config: Arc<AppConfig>,
    /// 任务注册表
    pub registry: Arc<TaskRegistry>,
    /// 任务记录存储
    pub store: Arc<RecordStore>,
    /// 动作调度器
    pub dispatcher: Arc<ActionDispatcher>,
    /// WebSocket 管理器
    pub ws_manager: Arc<WebSocketManager>,
}

impl AppState {
    /// 创建应用状态
    ///
    /// 启动顺序：存储初始化（失败即终止）→ 全量重载进注册表 →
    /// 构建调度器与观察者转发。注册表填充完成之前不接受任何动作。
    pub async fn new(config: AppConfig) -> Result<Self> {
        let store = Arc::new(
            RecordStore::new(&config.storage.config_folder).context("初始化任务数据库失败")?,
        );

        let registry = Arc::new(TaskRegistry::new());
        registry.replace_all(store.load_all()).await;
        info!("注册表已就绪，包含 {} 条任务", registry.len().await);

        let folder_profiles = config.folders.profiles();
        if folder_profiles.is_empty() {
            warn!("未配置任何文件夹档案，所有下载请求都会被拒绝");
        }

        let ws_manager = Arc::new(WebSocketManager::new());

        // 调度器广播的快照转发给所有 WebSocket 观察者
        let (snapshot_tx, mut snapshot_rx) = mpsc::unbounded_channel();
        let ws_forward = Arc::clone(&ws_manager);
        tokio::spawn(async move {
            while let Some(items) = snapshot_rx.recv().await {
                ws_forward.broadcast(WsServerMessage::download_list(items));
            }
        });

        let fetcher = Arc::new(YtDlpFetcher::new(config.fetch.ytdlp_binary.clone()));
        let dispatcher = ActionDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            fetcher,
            folder_profiles,
            snapshot_tx,
        );

        Ok(Self {
            config: Arc::new(config),
            registry,
            store,
            dispatcher,
            ws_manager,
        })
    }
}
