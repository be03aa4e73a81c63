//! 目录服务
//!
//! [`CatalogDatabase`] 把文件枚举、元数据提取、合并和持久化串成完整的导入流程，
//! 并负责内存聚合的延迟加载、删除和相册。
//!
//! 三把具名锁：
//! - 保存锁：整个目录保存期间持有，删除也在此锁下进行；
//! - 批量处理锁：`import_paths` 期间持有，删除先取此锁再取保存锁，
//!   不会与进行中的导入交错；
//! - INCOMING 锁：`import_incoming` 期间持有。

use crate::events::{CatalogEvent, EventBus};
use crate::reconciler::{reconcile, ReconcileOptions, ReconcileOutcome};
use dicomdb_core::models::{default_smart_albums, Album, Image, Series, Study, StudyCollection};
use dicomdb_core::progress::ProgressReporter;
use dicomdb_core::{CatalogConfig, CatalogError, ExtractedRecord, Result};
use dicomdb_database::{CatalogStore, DatabasePool, SaveSummary, SqliteCatalogStore};
use dicomdb_dicom::{DicomParser, MetadataExtractor};
use dicomdb_storage::{enumerate, StorageLayout, StorageManager};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

/// 导入选项
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportOptions {
    /// 导入完成后发布 [`CatalogEvent::ImportCompleted`]
    pub post_notify: bool,
    /// 只保留DICOM记录
    pub dicom_only: bool,
    /// 已有对象也用记录覆盖全部字段
    pub reread_existing: bool,
    /// 返回新建或匹配到的影像
    pub return_added: bool,
    /// 先把文件复制进受管存储
    pub copy_into_storage: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            post_notify: true,
            dicom_only: true,
            reread_existing: false,
            return_added: false,
            copy_into_storage: false,
        }
    }
}

impl ImportOptions {
    /// 按配置填充 `dicom_only` 和 `copy_into_storage`
    pub fn from_config(config: &CatalogConfig) -> Self {
        Self {
            dicom_only: config.import.dicom_only,
            copy_into_storage: config.storage.copy_into_storage,
            ..Self::default()
        }
    }
}

/// 一次扫描的结果
#[derive(Debug, Default)]
pub(crate) struct Scan {
    pub records: Vec<ExtractedRecord>,
    pub unreadable: Vec<PathBuf>,
}

/// 枚举并提取输入路径下的所有文件，在文件之间检查取消
pub(crate) fn scan(
    roots: &[PathBuf],
    extractor: &dyn MetadataExtractor,
    progress: &dyn ProgressReporter,
) -> Scan {
    let files = enumerate(roots);
    progress.set_status(&format!("Reading {} files", files.len()));

    let mut scan = Scan::default();
    for path in files {
        if progress.is_cancelled() {
            info!("扫描已取消，已读取 {} 个文件", scan.records.len());
            break;
        }
        match extractor.extract(&path) {
            Some(record) => scan.records.push(record),
            None => {
                debug!("Unreadable file skipped: {}", path.display());
                scan.unreadable.push(path);
            }
        }
    }
    scan
}

/// 影像目录
pub struct CatalogDatabase {
    storage: StorageManager,
    store: Arc<dyn CatalogStore>,
    extractor: Arc<dyn MetadataExtractor>,
    studies: Arc<StudyCollection>,
    albums: RwLock<Vec<Album>>,
    config: CatalogConfig,
    events: EventBus,
    save_lock: Mutex<()>,
    process_lock: Mutex<()>,
    pub(crate) incoming_lock: Mutex<()>,
}

impl std::fmt::Debug for CatalogDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogDatabase")
            .field("base_dir", &self.storage.layout().base_dir())
            .field("studies", &self.studies.len())
            .finish()
    }
}

impl CatalogDatabase {
    /// 打开 (必要时创建) 位于 `base_dir` 的目录
    pub async fn open(base_dir: impl Into<PathBuf>, config: &CatalogConfig) -> Result<Self> {
        let layout = StorageLayout::resolve(base_dir).await?;
        let storage = StorageManager::new(layout);
        storage.prepare().await?;

        let db_path = config
            .database
            .path
            .clone()
            .unwrap_or_else(|| storage.layout().database_file());
        let pool = DatabasePool::connect(&db_path, config.database.max_connections).await?;
        let store = SqliteCatalogStore::new(pool).await?;

        Self::open_with(
            storage,
            Arc::new(store),
            Arc::new(DicomParser::new()),
            config.clone(),
        )
        .await
    }

    /// 使用给定的存储和提取器打开目录
    pub async fn open_with(
        storage: StorageManager,
        store: Arc<dyn CatalogStore>,
        extractor: Arc<dyn MetadataExtractor>,
        config: CatalogConfig,
    ) -> Result<Self> {
        let db = Self {
            storage,
            store,
            extractor,
            studies: Arc::new(StudyCollection::new()),
            albums: RwLock::new(Vec::new()),
            config,
            events: EventBus::default(),
            save_lock: Mutex::new(()),
            process_lock: Mutex::new(()),
            incoming_lock: Mutex::new(()),
        };
        db.load().await?;
        Ok(db)
    }

    /// 浅加载所有检查和相册，没有相册时创建默认智能相册
    async fn load(&self) -> Result<()> {
        let studies: Vec<Arc<Study>> = self
            .store
            .load_studies()
            .await?
            .into_iter()
            .map(Study::from_store)
            .collect();
        info!(
            "Loaded {} studies from {}",
            studies.len(),
            self.storage.layout().base_dir().display()
        );
        self.studies.replace_all(studies);

        let mut albums = self.store.load_albums().await?;
        if albums.is_empty() {
            for mut album in default_smart_albums() {
                album.id = Some(self.store.upsert_album(&album).await?);
                albums.push(album);
            }
            info!("已创建默认智能相册");
        }
        *self.albums.write() = albums;
        Ok(())
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    pub fn layout(&self) -> &StorageLayout {
        self.storage.layout()
    }

    pub(crate) fn extractor(&self) -> Arc<dyn MetadataExtractor> {
        self.extractor.clone()
    }

    /// 所有检查的快照
    pub fn studies(&self) -> Vec<Arc<Study>> {
        self.studies.snapshot()
    }

    /// 按检查UID查找；未指定患者键时返回第一个匹配的检查
    pub fn find_study(&self, study_instance_uid: &str, patient_uid: Option<&str>) -> Option<Arc<Study>> {
        match patient_uid {
            Some(patient) => self.studies.find(study_instance_uid, Some(patient)),
            None => self.studies.find_by_uid(study_instance_uid).into_iter().next(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CatalogEvent> {
        self.events.subscribe()
    }

    /// 导入文件或目录
    ///
    /// 提取和合并在阻塞线程池中执行，涉及的检查随后保存。
    /// `return_added` 为 false 时返回空列表。
    pub async fn import_paths(
        &self,
        paths: &[PathBuf],
        options: ImportOptions,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<Vec<Arc<Image>>> {
        let _guard = self.process_lock.lock().await;
        info!("Importing {} path(s)", paths.len());

        let roots = paths.to_vec();
        let extractor = self.extractor.clone();
        let reporter = progress.clone();
        let scanned = tokio::task::spawn_blocking(move || scan(&roots, extractor.as_ref(), reporter.as_ref()))
            .await
            .map_err(|e| CatalogError::Internal(e.to_string()))?;

        self.dispose_unreadable(&scanned.unreadable).await;

        let mut records = scanned.records;
        if options.dicom_only {
            let before = records.len();
            records.retain(|r| r.is_dicom());
            if records.len() != before {
                debug!("Dropped {} non-DICOM records", before - records.len());
            }
        }
        if options.copy_into_storage {
            for record in &mut records {
                self.copy_record(record).await;
            }
        }

        self.preload_for(&records).await?;

        let outcome = self.reconcile_records(records, &options, progress).await?;
        self.save_studies(&outcome.touched_studies).await?;

        info!(
            "Import finished: {} files, {} images, {} new studies{}",
            outcome.processed,
            outcome.images,
            outcome.new_studies.len(),
            if outcome.cancelled { " (cancelled)" } else { "" }
        );

        if options.post_notify {
            self.events.publish(CatalogEvent::ImportCompleted {
                new_studies: outcome.new_studies.iter().map(|s| s.study_instance_uid()).collect(),
                touched_studies: outcome
                    .touched_studies
                    .iter()
                    .map(|s| s.study_instance_uid())
                    .collect(),
                images: outcome.images,
            });
        }

        if options.return_added {
            Ok(outcome.added_images)
        } else {
            Ok(Vec::new())
        }
    }

    async fn reconcile_records(
        &self,
        records: Vec<ExtractedRecord>,
        options: &ImportOptions,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<ReconcileOutcome> {
        let reconcile_options = ReconcileOptions {
            reread_existing: options.reread_existing,
            return_added: options.return_added,
            progress_interval: Duration::from_millis(self.config.import.progress_interval_ms),
        };
        let studies = self.studies.clone();
        tokio::task::spawn_blocking(move || {
            reconcile(&records, &studies, &reconcile_options, progress.as_ref())
        })
        .await
        .map_err(|e| CatalogError::Internal(e.to_string()))
    }

    /// 受管存储中无法读取的文件移到 ERRORS
    async fn dispose_unreadable(&self, unreadable: &[PathBuf]) {
        if !self.config.import.quarantine_unreadable {
            return;
        }
        for path in unreadable
            .iter()
            .filter(|p| self.storage.contains(p) && !self.storage.is_database_file(p))
        {
            if let Err(e) = self.storage.quarantine(path).await {
                warn!("Failed to quarantine {}: {}", path.display(), e);
            }
        }
    }

    async fn copy_record(&self, record: &mut ExtractedRecord) {
        let Some(sop_uid) = record.sop_key() else {
            return;
        };
        match self
            .storage
            .copy_into_storage(&record.file_path, record.study_key(), record.series_key(), sop_uid)
            .await
        {
            Ok(target) => record.file_path = target,
            Err(e) => warn!("复制文件失败 {}: {}", record.file_path.display(), e),
        }
    }

    /// 加载记录涉及的检查的序列，以及涉及的序列的影像
    async fn preload_for(&self, records: &[ExtractedRecord]) -> Result<()> {
        let mut wanted: HashMap<&str, HashSet<&str>> = HashMap::new();
        for record in records {
            wanted
                .entry(record.study_key())
                .or_default()
                .insert(record.series_key());
        }

        for (study_uid, series_uids) in wanted {
            for study in self.studies.find_by_uid(study_uid) {
                for series in self.load_series_if_needed(&study).await? {
                    if series_uids.contains(series.series_instance_uid().as_str()) {
                        self.load_images_if_needed(&series).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// 首次访问时从存储加载检查的序列
    pub async fn load_series_if_needed(&self, study: &Arc<Study>) -> Result<Vec<Arc<Series>>> {
        if !study.series_loaded() {
            let loaded = match study.db_id() {
                Some(id) => self.store.load_series_for(id).await?,
                None => Vec::new(),
            };
            debug!(
                "Loaded {} series for study {}",
                loaded.len(),
                study.study_instance_uid()
            );
            study.attach_loaded_series(
                loaded
                    .into_iter()
                    .map(|info| Series::from_store(info, study))
                    .collect(),
            );
        }
        Ok(study.series())
    }

    /// 首次访问时从存储加载序列的影像
    pub async fn load_images_if_needed(&self, series: &Arc<Series>) -> Result<Vec<Arc<Image>>> {
        if !series.images_loaded() {
            let loaded = match series.db_id() {
                Some(id) => self.store.load_images_for(id).await?,
                None => Vec::new(),
            };
            debug!(
                "Loaded {} images for series {}",
                loaded.len(),
                series.series_instance_uid()
            );
            series.attach_loaded_images(
                loaded
                    .into_iter()
                    .map(|info| Image::new(info, series))
                    .collect(),
            );
        }
        Ok(series.images())
    }

    /// 保存整个目录
    pub async fn save(&self) -> Result<SaveSummary> {
        let studies = self.studies.snapshot();
        self.save_studies(&studies).await
    }

    /// 在一个事务中保存给定的检查，失败时内存状态保持不变
    ///
    /// 已从目录中删除的检查不再写入。
    pub async fn save_studies(&self, studies: &[Arc<Study>]) -> Result<SaveSummary> {
        let _guard = self.save_lock.lock().await;
        let live: Vec<Arc<Study>> = studies
            .iter()
            .filter(|s| self.studies.contains(s))
            .cloned()
            .collect();
        if live.len() != studies.len() {
            debug!("Skipped {} deleted studies while saving", studies.len() - live.len());
        }
        match self.store.save_studies(&live).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                error!("Failed to save catalog: {}", e);
                Err(e)
            }
        }
    }

    /// 删除检查及其序列、影像和受管文件
    pub async fn delete_study(&self, study: &Arc<Study>) -> Result<()> {
        let _process = self.process_lock.lock().await;
        let _guard = self.save_lock.lock().await;
        let info = study.info();

        let mut paths = in_memory_paths(&study.series());
        if let Some(id) = info.id {
            paths.extend(self.store.image_paths_for_study(id).await?.into_iter().map(PathBuf::from));
            self.store.delete_study(id).await?;
        }
        self.studies.remove(study);
        let removed = self.remove_files(paths).await;

        info!(
            "已删除检查 {} ({} managed files removed)",
            info.study_instance_uid, removed
        );
        self.events.publish(CatalogEvent::StudyDeleted {
            study_instance_uid: info.study_instance_uid,
            patient_uid: info.patient_uid,
        });
        Ok(())
    }

    /// 删除序列及其影像和受管文件，并更新所属检查的计数
    pub async fn delete_series(&self, series: &Arc<Series>) -> Result<()> {
        let study = series
            .study()
            .ok_or_else(|| CatalogError::NotFound("序列所属的检查已不存在".to_string()))?;
        let _process = self.process_lock.lock().await;
        self.load_series_if_needed(&study).await?;

        let _guard = self.save_lock.lock().await;
        let remaining: i64 = study
            .series()
            .iter()
            .filter(|s| !Arc::ptr_eq(s, series))
            .map(|s| s.number_of_images())
            .sum();

        let mut paths = in_memory_paths(std::slice::from_ref(series));
        if let (Some(series_id), Some(study_id)) = (series.db_id(), study.db_id()) {
            paths.extend(
                self.store
                    .image_paths_for_series(series_id)
                    .await?
                    .into_iter()
                    .map(PathBuf::from),
            );
            self.store.delete_series(series_id, study_id, remaining).await?;
        }

        study.remove_series(series);
        study.recompute_number_of_images();
        let removed = self.remove_files(paths).await;

        let series_uid = series.series_instance_uid();
        info!("已删除序列 {} ({} managed files removed)", series_uid, removed);
        self.events.publish(CatalogEvent::SeriesDeleted {
            study_instance_uid: study.study_instance_uid(),
            series_instance_uid: series_uid,
        });
        Ok(())
    }

    async fn remove_files(&self, paths: HashSet<PathBuf>) -> usize {
        let mut removed = 0;
        for path in paths {
            match self.storage.remove_managed_file(&path).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
        removed
    }

    /// 相册快照
    pub fn albums(&self) -> Vec<Album> {
        self.albums.read().clone()
    }

    /// 创建普通相册，同名相册已存在时返回已有的
    pub async fn create_album(&self, name: &str) -> Result<Album> {
        self.insert_album(Album::new(name)).await
    }

    /// 创建智能相册，只保存谓词
    pub async fn create_smart_album(&self, name: &str, predicate: &str) -> Result<Album> {
        self.insert_album(Album::smart(name, predicate)).await
    }

    async fn insert_album(&self, mut album: Album) -> Result<Album> {
        let existing = self.albums.read().iter().find(|a| a.name == album.name).cloned();
        if let Some(existing) = existing {
            return Ok(existing);
        }
        album.id = Some(self.store.upsert_album(&album).await?);
        self.albums.write().push(album.clone());
        Ok(album)
    }

    /// 把检查加入相册，尚未保存的检查先保存
    pub async fn add_studies_to_album(&self, album_id: i64, studies: &[Arc<Study>]) -> Result<()> {
        let unsaved: Vec<Arc<Study>> = studies.iter().filter(|s| s.db_id().is_none()).cloned().collect();
        if !unsaved.is_empty() {
            self.save_studies(&unsaved).await?;
        }
        let ids: Vec<i64> = studies.iter().filter_map(|s| s.db_id()).collect();
        self.store.add_studies_to_album(album_id, &ids).await?;

        let mut albums = self.albums.write();
        let album = albums
            .iter_mut()
            .find(|a| a.id == Some(album_id))
            .ok_or_else(|| CatalogError::NotFound(format!("相册 {}", album_id)))?;
        for id in ids {
            if !album.study_ids.contains(&id) {
                album.study_ids.push(id);
            }
        }
        Ok(())
    }

    /// 保存目录并关闭存储连接
    pub async fn close(&self) -> Result<()> {
        self.save().await?;
        self.store.close().await;
        info!("Catalog closed: {}", self.storage.layout().base_dir().display());
        Ok(())
    }
}

/// 已加载到内存中的影像的完整路径
fn in_memory_paths(series: &[Arc<Series>]) -> HashSet<PathBuf> {
    series
        .iter()
        .flat_map(|s| s.images())
        .filter_map(|i| i.complete_path())
        .collect()
}
