//! 错误定义模块

use thiserror::Error;

/// 影像目录统一错误类型
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("数据库错误: {0}")]
    Database(String),

    #[error("DICOM解析错误: {0}")]
    DicomParse(String),

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("系统内部错误: {0}")]
    Internal(String),
}

impl From<config::ConfigError> for CatalogError {
    fn from(err: config::ConfigError) -> Self {
        CatalogError::Config(err.to_string())
    }
}

/// 影像目录统一结果类型
pub type Result<T> = std::result::Result<T, CatalogError>;
