//! WebSocket 路由处理器

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::server::websocket::message::{WsClientMessage, WsServerMessage};
use crate::server::AppState;

/// WebSocket 路由处理器
///
/// 升级 HTTP 连接为 WebSocket，处理消息收发
pub async fn handle_websocket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// 处理 WebSocket 连接
async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4().to_string();
    info!("新的 WebSocket 连接: {}", connection_id);

    let mut message_receiver = state.ws_manager.register(connection_id.clone());
    let (mut sender, mut receiver) = socket.split();

    // 连接建立即推送文件夹档案与当前下载列表
    let (audio, video) = state.config.folders.location_names();
    state
        .ws_manager
        .send_to(&connection_id, WsServerMessage::folder_locations(audio, video));
    let snapshot = state.registry.snapshot().await;
    state
        .ws_manager
        .send_to(&connection_id, WsServerMessage::download_list(snapshot));

    // 发送任务：把连接通道里的消息写到 socket
    let send_task = tokio::spawn(async move {
        while let Some(message) = message_receiver.recv().await {
            match serde_json::to_string(&message) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("序列化消息失败: {}", e);
                }
            }
        }
    });

    let state_recv = state.clone();
    let conn_id_recv = connection_id.clone();

    // 接收任务：解析客户端动作
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            match message {
                Message::Text(text) => {
                    handle_client_message(&state_recv, &conn_id_recv, &text);
                }
                Message::Binary(data) => {
                    if let Ok(text) = String::from_utf8(data) {
                        handle_client_message(&state_recv, &conn_id_recv, &text);
                    }
                }
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Close(_) => {
                    info!("收到关闭消息: {}", conn_id_recv);
                    break;
                }
            }
        }
    });

    // 等待任一任务结束
    tokio::select! {
        _ = send_task => {
            debug!("发送任务结束: {}", connection_id);
        }
        _ = recv_task => {
            debug!("接收任务结束: {}", connection_id);
        }
    }

    state.ws_manager.unregister(&connection_id);
    info!("WebSocket 连接已关闭: {}", connection_id);
}

/// 处理客户端消息
///
/// 每个动作作为独立的并发执行单元派发，互相不阻塞，
/// 也不阻塞本连接的消息收发。
fn handle_client_message(state: &AppState, connection_id: &str, text: &str) {
    match serde_json::from_str::<WsClientMessage>(text) {
        Ok(message) => match message {
            WsClientMessage::Ping { timestamp } => {
                state
                    .ws_manager
                    .send_to(connection_id, WsServerMessage::pong(Some(timestamp)));
            }
            WsClientMessage::Download { item } => {
                let dispatcher = Arc::clone(&state.dispatcher);
                tokio::spawn(async move {
                    dispatcher.download(item).await;
                });
            }
            WsClientMessage::CancelItems { ids } => {
                let dispatcher = Arc::clone(&state.dispatcher);
                tokio::spawn(async move {
                    dispatcher.cancel_items(ids).await;
                });
            }
            WsClientMessage::RetryItems { ids } => {
                let dispatcher = Arc::clone(&state.dispatcher);
                tokio::spawn(async move {
                    dispatcher.retry_items(ids).await;
                });
            }
            WsClientMessage::RemoveItems { ids } => {
                let dispatcher = Arc::clone(&state.dispatcher);
                tokio::spawn(async move {
                    dispatcher.remove_items(ids).await;
                });
            }
        },
        Err(e) => {
            warn!("解析客户端消息失败: {} - {}", connection_id, e);
            state.ws_manager.send_to(
                connection_id,
                WsServerMessage::error("PARSE_ERROR", format!("消息解析失败: {}", e)),
            );
        }
    }
}
