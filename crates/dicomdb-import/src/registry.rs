//! 已打开目录的注册表

use crate::database::CatalogDatabase;
use dicomdb_core::{CatalogConfig, CatalogError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

/// 按根目录持有已打开的目录，并记录当前活动目录
#[derive(Debug, Default)]
pub struct DatabaseRegistry {
    databases: RwLock<HashMap<PathBuf, Arc<CatalogDatabase>>>,
    active: RwLock<Option<PathBuf>>,
}

impl DatabaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 打开目录；同一路径已打开时返回已有实例。没有活动目录时新目录成为活动目录
    pub async fn open(&self, base_dir: impl AsRef<Path>, config: &CatalogConfig) -> Result<Arc<CatalogDatabase>> {
        let key = registry_key(base_dir.as_ref());
        if let Some(existing) = self.get(&key) {
            return Ok(existing);
        }

        let opened = Arc::new(CatalogDatabase::open(key.clone(), config).await?);
        Ok(self.insert(key, opened))
    }

    /// 注册已打开的目录；同一路径已注册时保留先注册的实例
    pub fn insert(&self, base_dir: impl AsRef<Path>, db: Arc<CatalogDatabase>) -> Arc<CatalogDatabase> {
        let key = registry_key(base_dir.as_ref());
        let db = {
            let mut databases = self.databases.write();
            databases.entry(key.clone()).or_insert(db).clone()
        };
        let mut active = self.active.write();
        if active.is_none() {
            info!("活动目录: {}", key.display());
            *active = Some(key);
        }
        db
    }

    pub fn get(&self, base_dir: impl AsRef<Path>) -> Option<Arc<CatalogDatabase>> {
        self.databases
            .read()
            .get(&registry_key(base_dir.as_ref()))
            .cloned()
    }

    /// 切换活动目录，目录必须已经打开
    pub fn set_active(&self, base_dir: impl AsRef<Path>) -> Result<()> {
        let key = registry_key(base_dir.as_ref());
        if !self.databases.read().contains_key(&key) {
            return Err(CatalogError::NotFound(format!("目录未打开: {}", key.display())));
        }
        info!("活动目录: {}", key.display());
        *self.active.write() = Some(key);
        Ok(())
    }

    pub fn active(&self) -> Option<Arc<CatalogDatabase>> {
        let key = self.active.read().clone()?;
        self.get(key)
    }

    pub fn len(&self) -> usize {
        self.databases.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.databases.read().is_empty()
    }

    /// 保存并移除所有目录；全部尝试后返回第一个错误
    pub async fn close_all(&self) -> Result<()> {
        let databases: Vec<(PathBuf, Arc<CatalogDatabase>)> = self.databases.write().drain().collect();
        *self.active.write() = None;

        let mut first_error = None;
        for (path, db) in databases {
            if let Err(e) = db.close().await {
                error!("关闭目录失败 {}: {}", path.display(), e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// 能规范化时使用规范路径
fn registry_key(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
