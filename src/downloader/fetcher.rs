//! 媒体抓取协作方
//!
//! 调度器只负责任务状态与持久化，实际的媒体传输交给 `Fetcher` 实现。
//! 进度与终态通过事件通道回送，由调度器的事件循环统一修改注册表、
//! 落库并广播，抓取方不直接触碰共享状态。

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::task::DownloadSettings;

/// 抓取作业描述
#[derive(Debug, Clone)]
pub struct FetchJob {
    pub task_id: i64,
    pub url: String,
    pub download_settings: DownloadSettings,
    pub audio_only: bool,
}

/// 抓取过程回送的事件
#[derive(Debug, Clone, PartialEq)]
pub enum FetchEvent {
    /// 进度更新（百分比或阶段文本）
    Progress { task_id: i64, progress: String },
    /// 下载完成
    Completed { task_id: i64 },
    /// 下载失败
    Failed { task_id: i64, error: String },
}

/// 抓取协作方接口
///
/// 实现方应观察 `cancel` 令牌并尽快停止（协作式取消，没有强制
/// 终止）。取消本身不需要回送终态，取消后的状态由调度器写入。
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        job: FetchJob,
        events: mpsc::UnboundedSender<FetchEvent>,
        cancel: CancellationToken,
    );
}

/// 基于 yt-dlp 子进程的抓取实现
///
/// download_settings 按 `--key value` 原样传给命令行（布尔 true 只传
/// 开关），进度从 stdout 的百分比行解析。
pub struct YtDlpFetcher {
    /// yt-dlp 可执行文件路径
    binary: PathBuf,
    /// stdout 百分比行的解析正则，构造时编译一次
    percent_re: Regex,
}

impl YtDlpFetcher {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            percent_re: Regex::new(r"(\d{1,3}(?:\.\d+)?)%").expect("进度正则非法"),
        }
    }

    /// 把下载设置展开为命令行参数
    fn build_args(job: &FetchJob) -> Vec<String> {
        let mut args = vec!["--newline".to_string(), "--no-colors".to_string()];

        if job.audio_only {
            args.push("--extract-audio".to_string());
        }

        for (key, value) in &job.download_settings {
            let flag = format!("--{}", key.replace('_', "-"));
            match value {
                serde_json::Value::Bool(true) => args.push(flag),
                serde_json::Value::Bool(false) => {}
                serde_json::Value::String(s) => {
                    args.push(flag);
                    args.push(s.clone());
                }
                other => {
                    args.push(flag);
                    args.push(other.to_string());
                }
            }
        }

        args.push(job.url.clone());
        args
    }
}

impl Default for YtDlpFetcher {
    fn default() -> Self {
        Self::new("yt-dlp")
    }
}

#[async_trait]
impl Fetcher for YtDlpFetcher {
    async fn fetch(
        &self,
        job: FetchJob,
        events: mpsc::UnboundedSender<FetchEvent>,
        cancel: CancellationToken,
    ) {
        let task_id = job.task_id;
        let args = Self::build_args(&job);
        debug!("启动 yt-dlp: 任务 {} 参数 {:?}", task_id, args);

        let mut child = match Command::new(&self.binary)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                let _ = events.send(FetchEvent::Failed {
                    task_id,
                    error: format!("无法启动 yt-dlp: {}", e),
                });
                return;
            }
        };

        // stdout 行形如 "[download]  42.5% of ..."
        let stdout = child.stdout.take();
        let mut lines = stdout.map(|out| BufReader::new(out).lines());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!("终止 yt-dlp 失败: 任务 {} - {}", task_id, e);
                    }
                    debug!("任务 {} 的抓取已按取消令牌停止", task_id);
                    // 取消后的状态由调度器负责，不回送终态
                    return;
                }
                line = async {
                    match lines.as_mut() {
                        Some(lines) => lines.next_line().await,
                        None => Ok(None),
                    }
                } => {
                    match line {
                        Ok(Some(line)) => {
                            if let Some(caps) = self.percent_re.captures(&line) {
                                let _ = events.send(FetchEvent::Progress {
                                    task_id,
                                    progress: format!("{}%", &caps[1]),
                                });
                            }
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
            }
        }

        match child.wait().await {
            Ok(status) if status.success() => {
                let _ = events.send(FetchEvent::Completed { task_id });
            }
            Ok(status) => {
                let _ = events.send(FetchEvent::Failed {
                    task_id,
                    error: format!("yt-dlp 退出码 {}", status.code().unwrap_or(-1)),
                });
            }
            Err(e) => {
                let _ = events.send(FetchEvent::Failed {
                    task_id,
                    error: format!("等待 yt-dlp 退出失败: {}", e),
                });
            }
        }
    }
}
