//! 测试辅助：文本提取器和计数存储

use async_trait::async_trait;
use dicomdb_core::models::{Album, ImageInfo, SeriesInfo, Study, StudyInfo};
use dicomdb_core::{CatalogConfig, ExtractedRecord, Result};
use dicomdb_database::{CatalogStore, SaveSummary, SqliteCatalogStore};
use dicomdb_dicom::MetadataExtractor;
use dicomdb_storage::{StorageLayout, StorageManager};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::database::CatalogDatabase;

/// 从 `key=value` 文本文件读取记录，缺少 `study` 时视为无法读取
pub(crate) struct TextExtractor;

impl MetadataExtractor for TextExtractor {
    fn extract(&self, path: &Path) -> Option<ExtractedRecord> {
        let text = std::fs::read_to_string(path).ok()?;
        let mut fields = HashMap::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let (key, value) = line.split_once('=')?;
            fields.insert(key.trim().to_string(), value.trim().to_string());
        }
        let get = |key: &str| fields.get(key).cloned();

        let mut record = ExtractedRecord::new(path)
            .with_patient(get("name").as_deref(), get("id").as_deref());
        record.study_instance_uid = Some(get("study")?);
        record.series_instance_uid = get("series");
        record.sop_instance_uid = get("sop");
        record.modality = get("modality");
        record.study_description = get("description");
        if let Some(frames) = get("frames").and_then(|f| f.parse().ok()) {
            record.number_of_frames = frames;
        }
        if let Some(file_type) = get("type") {
            record.file_type = file_type;
        }
        Some(record)
    }
}

/// 写一个文本实例文件
pub(crate) fn write_instance(dir: &Path, name: &str, fields: &[(&str, &str)]) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    let body: String = fields.iter().map(|(k, v)| format!("{}={}\n", k, v)).collect();
    std::fs::write(&path, body).unwrap();
    path
}

/// 记录延迟加载和关闭调用次数的存储；关闭时保留内存数据库以便检查
pub(crate) struct CountingStore {
    inner: SqliteCatalogStore,
    series_loads: AtomicUsize,
    image_loads: AtomicUsize,
    closes: AtomicUsize,
}

impl CountingStore {
    pub async fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: SqliteCatalogStore::in_memory().await.unwrap(),
            series_loads: AtomicUsize::new(0),
            image_loads: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        })
    }

    pub fn sqlite(&self) -> &SqliteCatalogStore {
        &self.inner
    }

    pub fn series_loads(&self) -> usize {
        self.series_loads.load(Ordering::SeqCst)
    }

    pub fn image_loads(&self) -> usize {
        self.image_loads.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CatalogStore for CountingStore {
    async fn upsert_study(&self, study: &StudyInfo) -> Result<i64> {
        self.inner.upsert_study(study).await
    }

    async fn upsert_series(&self, series: &SeriesInfo, study_id: i64) -> Result<i64> {
        self.inner.upsert_series(series, study_id).await
    }

    async fn upsert_image(&self, image: &ImageInfo, series_id: i64) -> Result<i64> {
        self.inner.upsert_image(image, series_id).await
    }

    async fn load_studies(&self) -> Result<Vec<StudyInfo>> {
        self.inner.load_studies().await
    }

    async fn load_series_for(&self, study_id: i64) -> Result<Vec<SeriesInfo>> {
        self.series_loads.fetch_add(1, Ordering::SeqCst);
        self.inner.load_series_for(study_id).await
    }

    async fn load_images_for(&self, series_id: i64) -> Result<Vec<ImageInfo>> {
        self.image_loads.fetch_add(1, Ordering::SeqCst);
        self.inner.load_images_for(series_id).await
    }

    async fn delete_study(&self, study_id: i64) -> Result<()> {
        self.inner.delete_study(study_id).await
    }

    async fn delete_series(&self, series_id: i64, study_id: i64, study_images: i64) -> Result<()> {
        self.inner.delete_series(series_id, study_id, study_images).await
    }

    async fn save_studies(&self, studies: &[Arc<Study>]) -> Result<SaveSummary> {
        self.inner.save_studies(studies).await
    }

    async fn image_paths_for_study(&self, study_id: i64) -> Result<Vec<String>> {
        self.inner.image_paths_for_study(study_id).await
    }

    async fn image_paths_for_series(&self, series_id: i64) -> Result<Vec<String>> {
        self.inner.image_paths_for_series(series_id).await
    }

    async fn load_albums(&self) -> Result<Vec<Album>> {
        self.inner.load_albums().await
    }

    async fn upsert_album(&self, album: &Album) -> Result<i64> {
        self.inner.upsert_album(album).await
    }

    async fn add_studies_to_album(&self, album_id: i64, study_ids: &[i64]) -> Result<()> {
        self.inner.add_studies_to_album(album_id, study_ids).await
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// 在 `base` 下打开使用文本提取器的目录
pub(crate) async fn open_catalog(base: &Path, store: Arc<CountingStore>) -> CatalogDatabase {
    let storage = StorageManager::new(StorageLayout::new(base));
    storage.prepare().await.unwrap();
    CatalogDatabase::open_with(storage, store, Arc::new(TextExtractor), CatalogConfig::default())
        .await
        .unwrap()
}
