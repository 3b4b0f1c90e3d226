//! WebSocket 消息类型定义

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::downloader::{DownloadRequest, TaskRecord};

/// 客户端发送给服务端的消息
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsClientMessage {
    /// 心跳 Ping
    Ping {
        /// 客户端时间戳（毫秒）
        timestamp: i64,
    },
    /// 提交下载
    Download {
        /// 下载请求内容
        item: DownloadRequest,
    },
    /// 取消任务
    CancelItems {
        /// 任务 ID 列表
        ids: Vec<i64>,
    },
    /// 重试任务
    RetryItems {
        /// 任务 ID 列表
        ids: Vec<i64>,
    },
    /// 移除任务
    RemoveItems {
        /// 任务 ID 列表
        ids: Vec<i64>,
    },
}

/// 服务端发送给客户端的消息
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsServerMessage {
    /// 心跳 Pong
    Pong {
        /// 服务端时间戳（毫秒）
        timestamp: i64,
        /// 回显客户端时间戳（用于计算延迟）
        client_timestamp: Option<i64>,
    },
    /// 推送完整下载列表快照
    UpdateDownloadList {
        /// 全部任务记录
        items: HashMap<i64, TaskRecord>,
    },
    /// 推送文件夹档案名称
    UpdateFolderLocations {
        /// 音频文件夹
        audio: Vec<String>,
        /// 视频文件夹
        video: Vec<String>,
    },
    /// 错误消息
    Error {
        /// 错误码
        code: String,
        /// 错误信息
        message: String,
    },
}

impl WsServerMessage {
    /// 创建 Pong 消息
    pub fn pong(client_timestamp: Option<i64>) -> Self {
        Self::Pong {
            timestamp: chrono::Utc::now().timestamp_millis(),
            client_timestamp,
        }
    }

    /// 创建下载列表推送
    pub fn download_list(items: HashMap<i64, TaskRecord>) -> Self {
        Self::UpdateDownloadList { items }
    }

    /// 创建文件夹档案推送
    pub fn folder_locations(audio: Vec<String>, video: Vec<String>) -> Self {
        Self::UpdateFolderLocations { audio, video }
    }

    /// 创建错误消息
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}
