//! 配置管理模块

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::downloader::DownloadSettings;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务器配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 存储配置
    #[serde(default)]
    pub storage: StorageConfig,
    /// 文件夹档案配置
    #[serde(default)]
    pub folders: FolderConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
    /// 抓取配置
    #[serde(default)]
    pub fetch: FetchConfig,
}

impl AppConfig {
    /// 从 TOML 文件加载配置，文件缺失或解析失败时回退到默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => match toml::from_str::<AppConfig>(&content) {
                Ok(config) => config,
                Err(e) => {
                    warn!("配置文件 {} 解析失败，使用默认配置: {}", path, e);
                    AppConfig::default()
                }
            },
            Err(_) => {
                warn!("配置文件 {} 不存在，使用默认配置", path);
                AppConfig::default()
            }
        }
    }
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    #[serde(default = "default_host")]
    pub host: String,
    /// 监听端口
    #[serde(default = "default_port")]
    pub port: u16,
    /// CORS允许的源
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: default_cors_origins(),
        }
    }
}

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// 数据库与运行数据所在目录
    #[serde(default = "default_config_folder")]
    pub config_folder: PathBuf,
}

fn default_config_folder() -> PathBuf {
    PathBuf::from("config")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            config_folder: default_config_folder(),
        }
    }
}

/// 单个文件夹档案：目标文件夹及其下载设置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FolderProfile {
    /// 下载设置（原样传递给抓取协作方）
    #[serde(default)]
    pub settings: DownloadSettings,
}

/// 文件夹档案配置
///
/// download 动作提交时 folder_name 必须命中其中之一，
/// 未命中的请求在任何状态变更之前被拒绝。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FolderConfig {
    /// 视频目标文件夹
    #[serde(default)]
    pub video: HashMap<String, FolderProfile>,
    /// 音频目标文件夹
    #[serde(default)]
    pub audio: HashMap<String, FolderProfile>,
}

impl FolderConfig {
    /// 合并出 folder_name -> 下载设置 的档案表
    pub fn profiles(&self) -> HashMap<String, DownloadSettings> {
        let mut profiles = HashMap::new();
        for (name, profile) in &self.audio {
            profiles.insert(name.clone(), profile.settings.clone());
        }
        for (name, profile) in &self.video {
            if profiles
                .insert(name.clone(), profile.settings.clone())
                .is_some()
            {
                warn!("文件夹档案 {} 在 audio 与 video 中重名，以 video 为准", name);
            }
        }
        profiles
    }

    /// 音频/视频档案名称列表（推送给客户端用）
    pub fn location_names(&self) -> (Vec<String>, Vec<String>) {
        let mut audio: Vec<String> = self.audio.keys().cloned().collect();
        let mut video: Vec<String> = self.video.keys().cloned().collect();
        audio.sort();
        video.sort();
        (audio, video)
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}

/// 抓取配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// yt-dlp 可执行文件路径
    #[serde(default = "default_ytdlp_binary")]
    pub ytdlp_binary: PathBuf,
}

fn default_ytdlp_binary() -> PathBuf {
    PathBuf::from("yt-dlp")
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            ytdlp_binary: default_ytdlp_binary(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.storage.config_folder, PathBuf::from("config"));
        assert!(config.folders.profiles().is_empty());
        assert!(config.log.enabled);
    }

    #[test]
    fn test_parse_full_config() {
        let toml_text = r#"
            [server]
            host = "127.0.0.1"
            port = 8080

            [storage]
            config_folder = "/data/config"

            [folders.video.videos]
            settings = { location = "/data/videos", format = "bestvideo+bestaudio" }

            [folders.audio.podcasts]
            settings = { location = "/data/podcasts", extract_audio = true }

            [log]
            enabled = false
            level = "debug"
        "#;

        let config: AppConfig = toml::from_str(toml_text).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert!(!config.log.enabled);

        let profiles = config.folders.profiles();
        assert_eq!(profiles.len(), 2);
        assert_eq!(
            profiles["videos"].get("location"),
            Some(&Value::String("/data/videos".to_string()))
        );
        assert_eq!(
            profiles["podcasts"].get("extract_audio"),
            Some(&Value::Bool(true))
        );

        let (audio, video) = config.folders.location_names();
        assert_eq!(audio, vec!["podcasts".to_string()]);
        assert_eq!(video, vec!["videos".to_string()]);
    }

    #[test]
    fn test_video_profile_wins_on_duplicate_name() {
        let toml_text = r#"
            [folders.video.music]
            settings = { location = "/data/video-music" }

            [folders.audio.music]
            settings = { location = "/data/audio-music" }
        "#;

        let config: AppConfig = toml::from_str(toml_text).unwrap();
        let profiles = config.folders.profiles();
        assert_eq!(
            profiles["music"].get("location"),
            Some(&Value::String("/data/video-music".to_string()))
        );
    }
}
