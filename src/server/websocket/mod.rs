// WebSocket 模块

pub mod handler;
pub mod manager;
pub mod message;

pub use handler::handle_websocket;
pub use manager::WebSocketManager;
pub use message::{WsClientMessage, WsServerMessage};
