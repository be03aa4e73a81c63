//! INCOMING 目录导入
//!
//! 可读文件移入受管存储后再走一遍 [`CatalogDatabase::import_paths`]，
//! 无法读取的文件 (以及 `dicom_only` 下的非DICOM文件) 移到 ERRORS。

use crate::database::{scan, CatalogDatabase, ImportOptions};
use dicomdb_core::progress::ProgressReporter;
use dicomdb_core::{CatalogError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 导入 INCOMING 目录，返回导入的文件数
pub async fn import_incoming(db: &CatalogDatabase, progress: Arc<dyn ProgressReporter>) -> Result<usize> {
    let _guard = db.incoming_lock.lock().await;
    let incoming = db.layout().incoming_dir();

    let extractor = db.extractor();
    let reporter = progress.clone();
    let roots = vec![incoming.clone()];
    let scanned = tokio::task::spawn_blocking(move || scan(&roots, extractor.as_ref(), reporter.as_ref()))
        .await
        .map_err(|e| CatalogError::Internal(e.to_string()))?;

    if scanned.records.is_empty() && scanned.unreadable.is_empty() {
        debug!("INCOMING 目录为空: {}", incoming.display());
        return Ok(0);
    }

    let options = ImportOptions {
        copy_into_storage: false,
        ..ImportOptions::from_config(db.config())
    };

    for path in &scanned.unreadable {
        reject(db, path).await;
    }

    let mut moved: Vec<PathBuf> = Vec::new();
    for record in &scanned.records {
        let Some(sop_uid) = record.sop_key() else {
            reject(db, &record.file_path).await;
            continue;
        };
        if options.dicom_only && !record.is_dicom() {
            reject(db, &record.file_path).await;
            continue;
        }
        match db
            .storage()
            .move_into_storage(&record.file_path, record.study_key(), record.series_key(), sop_uid)
            .await
        {
            Ok(target) => moved.push(target),
            Err(e) => warn!("无法移动文件 {}: {}", record.file_path.display(), e),
        }
    }

    if moved.is_empty() {
        return Ok(0);
    }
    moved.sort();
    moved.dedup();

    db.import_paths(&moved, options, progress).await?;
    info!("Imported {} files from INCOMING", moved.len());
    Ok(moved.len())
}

async fn reject(db: &CatalogDatabase, path: &Path) {
    if let Err(e) = db.storage().quarantine(path).await {
        warn!("Failed to quarantine {}: {}", path.display(), e);
    }
}
