// 下载任务模块

pub mod dispatcher;
pub mod fetcher;
pub mod registry;
pub mod task;

pub use dispatcher::{ActionDispatcher, DownloadListSnapshot, DownloadRequest};
pub use fetcher::{FetchEvent, FetchJob, Fetcher, YtDlpFetcher};
pub use registry::TaskRegistry;
pub use task::{DownloadSettings, TaskRecord, TaskStatus};
