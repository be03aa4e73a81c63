//! 配置管理
//!
//! 默认值、可选的TOML配置文件、`DICOMDB__` 前缀的环境变量依次叠加。

use crate::error::{CatalogError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// 环境变量前缀
pub const ENV_PREFIX: &str = "DICOMDB";

/// 目录完整配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CatalogConfig {
    /// 数据库配置
    pub database: DatabaseConfig,
    /// 存储配置
    pub storage: StorageConfig,
    /// 导入配置
    pub import: ImportConfig,
    /// 日志配置
    pub logging: LoggingConfig,
}

/// 数据库配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite文件路径，未设置时使用数据目录下的 `Database.sql`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// 最大连接数
    pub max_connections: u32,
}

/// 存储配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// 目录根目录
    pub base_dir: PathBuf,
    /// 导入时是否把文件复制进受管存储
    pub copy_into_storage: bool,
}

/// 导入配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// 只保留DICOM记录
    pub dicom_only: bool,
    /// 进度上报间隔 (毫秒)
    pub progress_interval_ms: u64,
    /// 受管存储中无法读取的文件是否移到 ERRORS
    pub quarantine_unreadable: bool,
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别或 EnvFilter 指令
    pub level: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_connections: 5,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./dicomdb"),
            copy_into_storage: false,
        }
    }
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            dicom_only: true,
            progress_interval_ms: 500,
            quarantine_unreadable: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CatalogConfig {
    /// 加载配置；指定的配置文件必须存在
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let defaults = Config::try_from(&CatalogConfig::default())?;
        let mut builder = Config::builder().add_source(defaults);
        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: CatalogConfig = settings.try_deserialize()?;
        config.validate()?;

        match config_path {
            Some(path) => info!("Configuration loaded from: {}", path.display()),
            None => info!("Configuration loaded from defaults and environment"),
        }
        Ok(config)
    }

    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        if self.database.max_connections == 0 {
            error!("Configuration validation failed for database.max_connections");
            return Err(CatalogError::Config(
                "database.max_connections 不能为 0".to_string(),
            ));
        }
        if self.storage.base_dir.as_os_str().is_empty() {
            error!("Configuration validation failed for storage.base_dir");
            return Err(CatalogError::Config("storage.base_dir 不能为空".to_string()));
        }
        Ok(())
    }
}
