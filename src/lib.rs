// TubeTube 后端核心库

// 配置管理模块
pub mod config;

// 下载任务模块
pub mod downloader;

// 日志模块
pub mod logging;

// 持久化模块
pub mod persistence;

// Web服务器模块
pub mod server;

// 导出常用类型
pub use config::AppConfig;
pub use downloader::{
    ActionDispatcher, DownloadRequest, DownloadSettings, FetchEvent, FetchJob, Fetcher,
    TaskRecord, TaskRegistry, TaskStatus, YtDlpFetcher,
};
pub use persistence::{RecordStore, StoreError};
pub use server::AppState;
