//! # 目录导入模块
//!
//! 把元数据记录合并进 Study → Series → Image 聚合并持久化：
//! - 合并器：身份匹配、字段合并与回退命名、多帧展开、计数维护
//! - 目录服务：批量导入、保存、延迟加载、删除、相册
//! - INCOMING 目录导入
//! - 已打开目录的注册表
//! - 变更通知

pub mod database;
pub mod events;
pub mod incoming;
pub mod reconciler;
pub mod registry;

#[cfg(test)]
mod testing;

// 重新导出主要类型
pub use database::{CatalogDatabase, ImportOptions};
pub use events::{CatalogEvent, EventBus};
pub use incoming::import_incoming;
pub use reconciler::{reconcile, ReconcileOptions, ReconcileOutcome};
pub use registry::DatabaseRegistry;
