//! # 数据库模块
//!
//! 负责影像目录的持久化，提供SQLite连接池、表结构、按自然键写入、
//! 分层浅加载和事务化批量保存。

pub mod connection;
pub mod models;
pub mod queries;
pub mod store;

// 重新导出主要类型
pub use connection::DatabasePool;
pub use models::*;
pub use queries::{DatabaseQueries, Table};
pub use store::{CatalogStore, SaveSummary, SqliteCatalogStore};
