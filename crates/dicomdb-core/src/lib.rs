//! # dicomdb Core
//!
//! 影像目录的核心模块，提供聚合数据模型、提取记录、错误定义、进度报告和配置。

pub mod config;
pub mod error;
pub mod models;
pub mod progress;
pub mod record;
pub mod utils;

pub use crate::config::CatalogConfig;
pub use error::{CatalogError, Result};
pub use models::*;
pub use progress::{CancellationFlag, LoggingProgress, NoopProgress, ProgressReporter, ProgressThrottle};
pub use record::ExtractedRecord;
