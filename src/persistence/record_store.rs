//! 下载任务 SQLite 持久化
//!
//! downloads 表是持久状态的唯一来源：整表原子替换、单行状态更新、
//! 单行删除和全量重载。所有操作经过同一把存储锁串行化，任务量是
//! 个人规模的下载列表，粗粒度锁足够且最简单。
//!
//! 保存相对于内存中的权威副本是尽力而为的：操作失败时丢弃连接并
//! 重连重试一次（有界，不循环），仍失败则记日志并保留磁盘上之前
//! 的数据，不向调用方抛错。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::downloader::task::{DownloadSettings, TaskRecord, TaskStatus};

/// 数据库文件名
const DB_FILE_NAME: &str = "downloads.db";

/// 存储层错误
#[derive(Debug, Error)]
pub enum StoreError {
    /// 后备存储无法创建或打开，init 阶段遇到即为致命错误
    #[error("存储不可用: {0}")]
    StorageUnavailable(#[from] rusqlite::Error),
    /// 存储目录创建失败
    #[error("创建存储目录 {path:?} 失败: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// 任务记录存储
///
/// 连接放在 `Option` 里：close 之后或重连前为 None，
/// 后续操作会透明地重新打开。
pub struct RecordStore {
    /// 数据库文件路径
    db_path: PathBuf,
    /// SQLite 连接，整库一把锁串行化全部读写
    conn: Mutex<Option<Connection>>,
}

impl RecordStore {
    /// 打开（或创建）数据库并确保表结构存在
    ///
    /// 失败即 `StorageUnavailable`，调用方不得在失败后继续使用存储。
    pub fn new(config_folder: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(config_folder).map_err(|e| StoreError::CreateDir {
            path: config_folder.to_path_buf(),
            source: e,
        })?;

        let db_path = config_folder.join(DB_FILE_NAME);
        let conn = Self::open_connection(&db_path)?;
        info!("下载数据库已初始化: {:?}", db_path);

        Ok(Self {
            db_path,
            conn: Mutex::new(Some(conn)),
        })
    }

    /// 打开连接并建表
    fn open_connection(db_path: &Path) -> Result<Connection, StoreError> {
        let conn = Connection::open(db_path)?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS downloads (
                id INTEGER PRIMARY KEY,
                video_identifier TEXT,
                title TEXT,
                url TEXT,
                status TEXT,
                progress TEXT,
                folder_name TEXT,
                audio_only INTEGER,
                skipped INTEGER,
                download_settings TEXT
            )
            "#,
            [],
        )?;
        Ok(conn)
    }

    /// 取出连接，必要时透明重连
    fn ensure_connection<'a>(
        &self,
        guard: &'a mut Option<Connection>,
    ) -> Result<&'a mut Connection, StoreError> {
        if guard.is_none() {
            let conn = Self::open_connection(&self.db_path)?;
            debug!("数据库连接已重新打开: {:?}", self.db_path);
            *guard = Some(conn);
        }
        // 上面刚保证过 Some
        Ok(guard.as_mut().unwrap())
    }

    /// 整表原子替换：一个事务内先清空再写入全部记录
    ///
    /// 要么新集合完整可见，要么（失败时）磁盘保留之前的集合，
    /// 后续读取不会观察到部分替换。
    pub fn save_all(&self, items: &HashMap<i64, TaskRecord>) {
        let mut guard = match self.conn.lock() {
            Ok(guard) => guard,
            Err(_) => {
                error!("存储锁已中毒，放弃本次保存");
                return;
            }
        };

        match self.save_all_inner(&mut guard, items) {
            Ok(()) => debug!("已保存 {} 条下载记录", items.len()),
            Err(e) => {
                warn!("保存下载记录失败，重连后重试一次: {}", e);
                *guard = None;
                if let Err(e) = self.save_all_inner(&mut guard, items) {
                    error!("重连后保存仍失败，磁盘保留之前的记录集: {}", e);
                    *guard = None;
                }
            }
        }
    }

    fn save_all_inner(
        &self,
        guard: &mut Option<Connection>,
        items: &HashMap<i64, TaskRecord>,
    ) -> Result<(), StoreError> {
        let conn = self.ensure_connection(guard)?;
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM downloads", [])?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO downloads (
                    id, video_identifier, title, url, status, progress,
                    folder_name, audio_only, skipped, download_settings
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
            )?;

            for record in items.values() {
                let settings_json = serde_json::to_string(&record.download_settings)
                    .unwrap_or_else(|_| "{}".to_string());
                stmt.execute(params![
                    record.id,
                    record.video_identifier,
                    record.title,
                    record.url,
                    record.status.as_str(),
                    record.progress,
                    record.folder_name,
                    record.audio_only as i64,
                    record.skipped as i64,
                    settings_json,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// 全量读取
    ///
    /// 单行的 download_settings 解析失败降级为空设置并告警，不影响
    /// 其他行。表不可读且重连一次仍失败时返回空集合而不是错误。
    pub fn load_all(&self) -> HashMap<i64, TaskRecord> {
        let mut guard = match self.conn.lock() {
            Ok(guard) => guard,
            Err(_) => {
                error!("存储锁已中毒，返回空记录集");
                return HashMap::new();
            }
        };

        match self.load_all_inner(&mut guard) {
            Ok(items) => {
                info!("已从数据库载入 {} 条下载记录", items.len());
                items
            }
            Err(e) => {
                warn!("载入下载记录失败，重连后重试一次: {}", e);
                *guard = None;
                match self.load_all_inner(&mut guard) {
                    Ok(items) => items,
                    Err(e) => {
                        error!("重连后载入仍失败，返回空记录集: {}", e);
                        *guard = None;
                        HashMap::new()
                    }
                }
            }
        }
    }

    fn load_all_inner(
        &self,
        guard: &mut Option<Connection>,
    ) -> Result<HashMap<i64, TaskRecord>, StoreError> {
        let conn = self.ensure_connection(guard)?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, video_identifier, title, url, status, progress,
                   folder_name, audio_only, skipped, download_settings
            FROM downloads
            "#,
        )?;

        let rows = stmt.query_map([], |row| {
            let id: i64 = row.get(0)?;
            let status_text: String = row.get(4)?;
            let settings_raw: String = row.get(9)?;
            Ok(TaskRecord {
                id,
                video_identifier: row.get(1)?,
                title: row.get(2)?,
                url: row.get(3)?,
                status: decode_status(id, &status_text),
                progress: row.get(5)?,
                folder_name: row.get(6)?,
                audio_only: row.get::<_, i64>(7)? != 0,
                skipped: row.get::<_, i64>(8)? != 0,
                download_settings: decode_settings(id, &settings_raw),
            })
        })?;

        let mut items = HashMap::new();
        for row in rows {
            let record = row?;
            items.insert(record.id, record);
        }
        Ok(items)
    }

    /// 更新单行的 status 字段，不触碰其他字段
    ///
    /// 返回是否有行被更新；目标不存在以 false 表达，不是错误。
    pub fn update_status(&self, id: i64, status: TaskStatus) -> bool {
        let mut guard = match self.conn.lock() {
            Ok(guard) => guard,
            Err(_) => {
                error!("存储锁已中毒，放弃状态更新");
                return false;
            }
        };

        match self.update_status_inner(&mut guard, id, status) {
            Ok(affected) => affected,
            Err(e) => {
                warn!("更新任务 {} 状态失败，重连后重试一次: {}", id, e);
                *guard = None;
                match self.update_status_inner(&mut guard, id, status) {
                    Ok(affected) => affected,
                    Err(e) => {
                        error!("重连后更新任务 {} 状态仍失败: {}", id, e);
                        *guard = None;
                        false
                    }
                }
            }
        }
    }

    fn update_status_inner(
        &self,
        guard: &mut Option<Connection>,
        id: i64,
        status: TaskStatus,
    ) -> Result<bool, StoreError> {
        let conn = self.ensure_connection(guard)?;
        let affected = conn.execute(
            "UPDATE downloads SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;

        if affected > 0 {
            debug!("任务 {} 状态已写入数据库: {}", id, status.as_str());
            Ok(true)
        } else {
            warn!("任务 {} 不在数据库中，状态更新未生效", id);
            Ok(false)
        }
    }

    /// 删除单行，返回是否有行被删除
    pub fn delete_one(&self, id: i64) -> bool {
        let mut guard = match self.conn.lock() {
            Ok(guard) => guard,
            Err(_) => {
                error!("存储锁已中毒，放弃删除");
                return false;
            }
        };

        match self.delete_one_inner(&mut guard, id) {
            Ok(affected) => affected,
            Err(e) => {
                warn!("删除任务 {} 失败，重连后重试一次: {}", id, e);
                *guard = None;
                match self.delete_one_inner(&mut guard, id) {
                    Ok(affected) => affected,
                    Err(e) => {
                        error!("重连后删除任务 {} 仍失败: {}", id, e);
                        *guard = None;
                        false
                    }
                }
            }
        }
    }

    fn delete_one_inner(
        &self,
        guard: &mut Option<Connection>,
        id: i64,
    ) -> Result<bool, StoreError> {
        let conn = self.ensure_connection(guard)?;
        let affected = conn.execute("DELETE FROM downloads WHERE id = ?1", params![id])?;

        if affected > 0 {
            info!("任务 {} 已从数据库删除", id);
            Ok(true)
        } else {
            warn!("任务 {} 不在数据库中，删除未生效", id);
            Ok(false)
        }
    }

    /// 关闭数据库连接
    ///
    /// 可重复调用；关闭后的操作会透明地重新初始化连接。
    pub fn close(&self) {
        let mut guard = match self.conn.lock() {
            Ok(guard) => guard,
            Err(_) => {
                error!("存储锁已中毒，跳过关闭");
                return;
            }
        };

        if let Some(conn) = guard.take() {
            if let Err((_, e)) = conn.close() {
                warn!("关闭数据库连接失败: {}", e);
            } else {
                info!("数据库连接已关闭");
            }
        }
    }
}

/// 状态文本解析失败降级为 failed 并告警，避免把未知文本当成可恢复状态
fn decode_status(id: i64, text: &str) -> TaskStatus {
    TaskStatus::parse(text).unwrap_or_else(|| {
        warn!("任务 {} 的状态 '{}' 无法识别，按 failed 处理", id, text);
        TaskStatus::Failed
    })
}

/// download_settings 宽松解析：解析失败降级为空设置
///
/// 降级会丢弃该行原有的设置内容，必须留下告警以便排查，
/// 不允许无声吞掉。
fn decode_settings(id: i64, raw: &str) -> DownloadSettings {
    match serde_json::from_str::<DownloadSettings>(raw) {
        Ok(settings) => settings,
        Err(e) => {
            warn!("任务 {} 的 download_settings 解析失败，降级为空设置: {}", id, e);
            DownloadSettings::new()
        }
    }
}
