//! WebSocket 连接管理器
//!
//! 管理所有观察者连接；广播走每个连接各自的无界通道，
//! 发送失败视为连接已断开并清理。

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::server::websocket::message::WsServerMessage;

/// WebSocket 连接信息
#[derive(Debug)]
pub struct WsConnection {
    /// 连接 ID
    pub id: String,
    /// 消息发送通道
    pub sender: mpsc::UnboundedSender<WsServerMessage>,
}

/// WebSocket 管理器
#[derive(Debug, Default)]
pub struct WebSocketManager {
    /// 所有连接
    connections: DashMap<String, WsConnection>,
}

impl WebSocketManager {
    /// 创建新的 WebSocket 管理器
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// 注册连接，返回该连接的消息接收端
    pub fn register(&self, connection_id: String) -> mpsc::UnboundedReceiver<WsServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.insert(
            connection_id.clone(),
            WsConnection {
                id: connection_id.clone(),
                sender: tx,
            },
        );
        info!("WebSocket 连接已注册: {} (当前 {} 个)", connection_id, self.connections.len());
        rx
    }

    /// 注销连接
    pub fn unregister(&self, connection_id: &str) {
        if self.connections.remove(connection_id).is_some() {
            info!("WebSocket 连接已注销: {}", connection_id);
        }
    }

    /// 向单个连接发送消息
    pub fn send_to(&self, connection_id: &str, message: WsServerMessage) {
        if let Some(conn) = self.connections.get(connection_id) {
            if conn.sender.send(message).is_err() {
                debug!("连接 {} 的通道已关闭", connection_id);
            }
        }
    }

    /// 向所有连接广播消息，顺带清理已断开的连接
    pub fn broadcast(&self, message: WsServerMessage) {
        let mut dead = Vec::new();
        for conn in self.connections.iter() {
            if conn.sender.send(message.clone()).is_err() {
                dead.push(conn.id.clone());
            }
        }
        for id in dead {
            debug!("清理已断开的连接: {}", id);
            self.connections.remove(&id);
        }
    }

    /// 当前连接数
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
