//! 影像存储管理
//!
//! 目录布局：
//!
//! ```text
//! <base>/DBFOLDER_LOCATION        可选，内容为实际数据目录
//! <data>/DATABASE.noindex/        受管文件与 Database.sql
//! <data>/INCOMING/                待导入文件
//! <data>/ERRORS/                  无法读取的文件
//! <data>/REPORTS/
//! <data>/TEMP/
//! ```

use dicomdb_core::utils::sanitize_path_component;
use dicomdb_core::{CatalogError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DATABASE_DIR: &str = "DATABASE.noindex";
pub const DATABASE_FILE: &str = "Database.sql";
pub const INCOMING_DIR: &str = "INCOMING";
pub const ERRORS_DIR: &str = "ERRORS";
pub const REPORTS_DIR: &str = "REPORTS";
pub const TEMP_DIR: &str = "TEMP";
pub const REDIRECT_FILE: &str = "DBFOLDER_LOCATION";

/// 受管文件扩展名
pub const MANAGED_EXTENSION: &str = "dcm";

/// 目录布局
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    base_dir: PathBuf,
    data_dir: PathBuf,
}

impl StorageLayout {
    /// 解析布局，存在 `DBFOLDER_LOCATION` 时数据目录改为其中记录的路径
    pub async fn resolve(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        let redirect = base_dir.join(REDIRECT_FILE);
        let data_dir = match tokio::fs::read_to_string(&redirect).await {
            Ok(content) => {
                let target = content.trim();
                if target.is_empty() {
                    base_dir.clone()
                } else {
                    info!("数据目录重定向到: {}", target);
                    PathBuf::from(target)
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => base_dir.clone(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { base_dir, data_dir })
    }

    /// 不做重定向检查，数据目录即根目录
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            data_dir: base_dir.clone(),
            base_dir,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn database_dir(&self) -> PathBuf {
        self.data_dir.join(DATABASE_DIR)
    }

    pub fn database_file(&self) -> PathBuf {
        self.database_dir().join(DATABASE_FILE)
    }

    pub fn incoming_dir(&self) -> PathBuf {
        self.data_dir.join(INCOMING_DIR)
    }

    pub fn errors_dir(&self) -> PathBuf {
        self.data_dir.join(ERRORS_DIR)
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.data_dir.join(REPORTS_DIR)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.data_dir.join(TEMP_DIR)
    }

    /// 所有需要存在的目录
    pub fn directories(&self) -> Vec<PathBuf> {
        vec![
            self.database_dir(),
            self.incoming_dir(),
            self.errors_dir(),
            self.reports_dir(),
            self.temp_dir(),
        ]
    }
}

/// 存储管理器
#[derive(Debug, Clone)]
pub struct StorageManager {
    layout: StorageLayout,
}

impl StorageManager {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// 创建布局中的所有目录
    pub async fn prepare(&self) -> Result<()> {
        for dir in self.layout.directories() {
            tokio::fs::create_dir_all(&dir).await?;
        }
        debug!("存储目录已就绪: {}", self.layout.data_dir().display());
        Ok(())
    }

    /// 路径是否位于受管存储目录中
    pub fn contains(&self, path: &Path) -> bool {
        let root = normalize(&self.layout.database_dir());
        normalize(path).starts_with(root)
    }

    /// 是否为目录数据库文件 (含 `-wal` / `-shm`)，这些文件从不参与处置
    pub fn is_database_file(&self, path: &Path) -> bool {
        let is_db_name = path
            .file_name()
            .map(|n| n.to_string_lossy().starts_with(DATABASE_FILE))
            .unwrap_or(false);
        is_db_name
            && path
                .parent()
                .map(|p| normalize(p) == normalize(&self.layout.database_dir()))
                .unwrap_or(false)
    }

    /// 受管文件路径 `<DATABASE.noindex>/<检查UID>/<序列UID>/<SOP实例UID>.dcm`
    pub fn managed_path_for(&self, study_uid: &str, series_uid: &str, sop_uid: &str) -> PathBuf {
        self.layout
            .database_dir()
            .join(sanitize_path_component(study_uid))
            .join(sanitize_path_component(series_uid))
            .join(format!("{}.{}", sanitize_path_component(sop_uid), MANAGED_EXTENSION))
    }

    /// 复制文件到受管存储
    ///
    /// 源文件已在受管存储中时原样返回；目标已存在时不再复制。
    pub async fn copy_into_storage(
        &self,
        source: &Path,
        study_uid: &str,
        series_uid: &str,
        sop_uid: &str,
    ) -> Result<PathBuf> {
        if self.contains(source) {
            return Ok(source.to_path_buf());
        }
        let target = self.managed_path_for(study_uid, series_uid, sop_uid);
        if tokio::fs::try_exists(&target).await? {
            debug!("目标已存在，跳过复制: {}", target.display());
            return Ok(target);
        }
        create_parent(&target).await?;

        // 先写临时文件再改名，目标中不会出现写了一半的文件
        let temp_dir = self.layout.temp_dir();
        tokio::fs::create_dir_all(&temp_dir).await?;
        let temp = temp_dir.join(format!("{}.part", Uuid::new_v4().simple()));
        tokio::fs::copy(source, &temp).await?;
        if let Err(e) = tokio::fs::rename(&temp, &target).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(CatalogError::Storage(format!(
                "无法写入受管文件 {}: {}",
                target.display(),
                e
            )));
        }
        debug!("复制到受管存储: {} -> {}", source.display(), target.display());
        Ok(target)
    }

    /// 移动文件到受管存储，目标已存在时删除源文件
    pub async fn move_into_storage(
        &self,
        source: &Path,
        study_uid: &str,
        series_uid: &str,
        sop_uid: &str,
    ) -> Result<PathBuf> {
        if self.contains(source) {
            return Ok(source.to_path_buf());
        }
        let target = self.managed_path_for(study_uid, series_uid, sop_uid);
        if tokio::fs::try_exists(&target).await? {
            tokio::fs::remove_file(source).await?;
            debug!("目标已存在，删除重复文件: {}", source.display());
            return Ok(target);
        }
        create_parent(&target).await?;
        move_file(source, &target).await?;
        Ok(target)
    }

    /// 把无法读取的文件移到 ERRORS 目录
    pub async fn quarantine(&self, source: &Path) -> Result<PathBuf> {
        let errors_dir = self.layout.errors_dir();
        tokio::fs::create_dir_all(&errors_dir).await?;

        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let mut target = errors_dir.join(&name);
        if tokio::fs::try_exists(&target).await? {
            target = errors_dir.join(format!("{}-{}", Uuid::new_v4().simple(), name));
        }
        move_file(source, &target).await?;
        warn!("无法读取的文件已移到: {}", target.display());
        Ok(target)
    }

    /// 删除受管文件并清理空目录；受管存储之外的文件不处理
    pub async fn remove_managed_file(&self, path: &Path) -> Result<bool> {
        if !self.contains(path) {
            return Ok(false);
        }
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        let root = self.layout.database_dir();
        let mut dir = path.parent();
        while let Some(current) = dir {
            if current == root || !current.starts_with(&root) {
                break;
            }
            // 目录非空时删除失败，停止向上清理
            if tokio::fs::remove_dir(current).await.is_err() {
                break;
            }
            dir = current.parent();
        }
        Ok(true)
    }
}

fn normalize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

async fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// 改名失败 (例如跨文件系统) 时退回到复制后删除
async fn move_file(source: &Path, target: &Path) -> Result<()> {
    if tokio::fs::rename(source, target).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(source, target).await?;
    tokio::fs::remove_file(source).await?;
    Ok(())
}
