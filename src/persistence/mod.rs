// 持久化模块

pub mod record_store;

pub use record_store::{RecordStore, StoreError};
