use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 下载设置（创建任务时从文件夹档案捕获，内容不做解释）
pub type DownloadSettings = Map<String, Value>;

/// 下载任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// 排队中
    Queued,
    /// 下载中
    Downloading,
    /// 已完成
    Completed,
    /// 失败
    Failed,
    /// 已取消
    Cancelled,
    /// 已跳过
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Skipped => "skipped",
        }
    }

    /// 从数据库文本解析状态
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(TaskStatus::Queued),
            "downloading" => Some(TaskStatus::Downloading),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            "skipped" => Some(TaskStatus::Skipped),
            _ => None,
        }
    }

    /// 是否允许取消（已完成的任务不可取消）
    pub fn is_cancellable(&self) -> bool {
        !matches!(self, TaskStatus::Completed)
    }

    /// 是否允许重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

/// 下载任务记录（downloads 表的一行）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    /// 任务 ID（主键，进程内分配，任务生命周期内不变）
    pub id: i64,
    /// 外部视频标识
    #[serde(default)]
    pub video_identifier: String,
    /// 标题
    #[serde(default)]
    pub title: String,
    /// 源地址
    pub url: String,
    /// 任务状态
    pub status: TaskStatus,
    /// 进度描述（百分比或阶段文本，更新频繁，与 status 无事务一致性要求）
    #[serde(default)]
    pub progress: String,
    /// 目标文件夹名称，必须命中已配置的文件夹档案
    pub folder_name: String,
    /// 仅下载音频
    #[serde(default)]
    pub audio_only: bool,
    /// 跳过标记，独立于 status 保留历史状态
    #[serde(default)]
    pub skipped: bool,
    /// 下载设置
    #[serde(default)]
    pub download_settings: DownloadSettings,
}

impl TaskRecord {
    pub fn new(
        id: i64,
        url: String,
        folder_name: String,
        audio_only: bool,
        download_settings: DownloadSettings,
    ) -> Self {
        Self {
            id,
            video_identifier: String::new(),
            title: String::new(),
            url,
            status: TaskStatus::Queued,
            progress: "0%".to_string(),
            folder_name,
            audio_only,
            skipped: false,
            download_settings,
        }
    }

    /// 标记为下载中
    pub fn mark_downloading(&mut self) {
        self.status = TaskStatus::Downloading;
    }

    /// 标记为已完成
    pub fn mark_completed(&mut self) {
        self.status = TaskStatus::Completed;
        self.progress = "100%".to_string();
    }

    /// 标记为失败，错误信息记入 progress
    pub fn mark_failed(&mut self, error: String) {
        self.status = TaskStatus::Failed;
        self.progress = error;
    }

    /// 标记为已取消
    pub fn mark_cancelled(&mut self) {
        self.status = TaskStatus::Cancelled;
    }

    /// 重置为排队状态（重试时清空进度）
    pub fn mark_queued(&mut self) {
        self.status = TaskStatus::Queued;
        self.progress = "0%".to_string();
    }
}
