// Web服务器模块

pub mod state;
pub mod websocket;

pub use state::AppState;
