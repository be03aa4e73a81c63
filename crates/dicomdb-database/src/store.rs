//! 层级存储
//!
//! [`CatalogStore`] 是协调器与关系存储之间的接口；[`SqliteCatalogStore`]
//! 是它的 SQLite 实现。批量保存在一个事务中完成，失败时整体回滚，
//! 行ID只在提交成功后写回内存聚合。

use crate::connection::DatabasePool;
use crate::queries::{self, DatabaseQueries};
use async_trait::async_trait;
use dicomdb_core::models::{Album, Image, ImageInfo, Series, SeriesInfo, Study, StudyInfo};
use dicomdb_core::{CatalogError, Result};
use std::sync::Arc;
use tracing::{debug, error, info};

/// 一次批量保存的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveSummary {
    pub studies: usize,
    pub series: usize,
    pub images: usize,
}

/// 层级存储接口
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn upsert_study(&self, study: &StudyInfo) -> Result<i64>;

    async fn upsert_series(&self, series: &SeriesInfo, study_id: i64) -> Result<i64>;

    async fn upsert_image(&self, image: &ImageInfo, series_id: i64) -> Result<i64>;

    /// 浅加载所有检查
    async fn load_studies(&self) -> Result<Vec<StudyInfo>>;

    /// 浅加载检查的序列
    async fn load_series_for(&self, study_id: i64) -> Result<Vec<SeriesInfo>>;

    async fn load_images_for(&self, series_id: i64) -> Result<Vec<ImageInfo>>;

    /// 删除检查，级联删除序列和影像
    async fn delete_study(&self, study_id: i64) -> Result<()>;

    /// 删除序列及其影像，并更新所属检查的计数
    async fn delete_series(&self, series_id: i64, study_id: i64, study_images: i64) -> Result<()>;

    /// 在一个事务中保存一批检查及其已加载的序列和影像
    async fn save_studies(&self, studies: &[Arc<Study>]) -> Result<SaveSummary>;

    /// 检查下所有受管文件路径
    async fn image_paths_for_study(&self, study_id: i64) -> Result<Vec<String>>;

    async fn image_paths_for_series(&self, series_id: i64) -> Result<Vec<String>>;

    async fn load_albums(&self) -> Result<Vec<Album>>;

    async fn upsert_album(&self, album: &Album) -> Result<i64>;

    async fn add_studies_to_album(&self, album_id: i64, study_ids: &[i64]) -> Result<()>;

    /// 释放底层连接，之后不再使用该存储
    async fn close(&self) {}
}

/// SQLite 层级存储
#[derive(Debug, Clone)]
pub struct SqliteCatalogStore {
    db: DatabasePool,
}

impl SqliteCatalogStore {
    /// 包装连接池并确保表结构存在
    pub async fn new(db: DatabasePool) -> Result<Self> {
        let mut conn = db
            .pool()
            .acquire()
            .await
            .map_err(|e| CatalogError::Database(e.to_string()))?;
        queries::create_tables(&mut *conn).await?;
        drop(conn);
        Ok(Self { db })
    }

    /// 内存数据库存储
    pub async fn in_memory() -> Result<Self> {
        Self::new(DatabasePool::in_memory().await?).await
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.db
    }

    fn queries(&self) -> DatabaseQueries<'_> {
        DatabaseQueries::new(self.db.pool())
    }

    async fn acquire(&self) -> Result<sqlx::pool::PoolConnection<sqlx::Sqlite>> {
        self.db
            .pool()
            .acquire()
            .await
            .map_err(|e| CatalogError::Database(e.to_string()))
    }

    async fn begin(&self) -> Result<sqlx::Transaction<'static, sqlx::Sqlite>> {
        self.db
            .pool()
            .begin()
            .await
            .map_err(|e| CatalogError::Database(e.to_string()))
    }
}

/// 提交成功后写回的行ID
#[derive(Default)]
struct AssignedIds {
    studies: Vec<(Arc<Study>, i64)>,
    series: Vec<(Arc<Series>, i64)>,
    images: Vec<(Arc<Image>, i64)>,
}

impl AssignedIds {
    fn apply(self) {
        for (study, id) in self.studies {
            study.set_db_id(id);
        }
        for (series, id) in self.series {
            series.set_db_id(id);
        }
        for (image, id) in self.images {
            image.set_db_id(id);
        }
    }

    fn summary(&self) -> SaveSummary {
        SaveSummary {
            studies: self.studies.len(),
            series: self.series.len(),
            images: self.images.len(),
        }
    }
}

#[async_trait]
impl CatalogStore for SqliteCatalogStore {
    async fn upsert_study(&self, study: &StudyInfo) -> Result<i64> {
        let mut conn = self.acquire().await?;
        queries::upsert_study(&mut *conn, study).await
    }

    async fn upsert_series(&self, series: &SeriesInfo, study_id: i64) -> Result<i64> {
        let mut conn = self.acquire().await?;
        queries::upsert_series(&mut *conn, series, study_id).await
    }

    async fn upsert_image(&self, image: &ImageInfo, series_id: i64) -> Result<i64> {
        let mut conn = self.acquire().await?;
        queries::upsert_image(&mut *conn, image, series_id).await
    }

    async fn load_studies(&self) -> Result<Vec<StudyInfo>> {
        self.queries().list_studies().await
    }

    async fn load_series_for(&self, study_id: i64) -> Result<Vec<SeriesInfo>> {
        self.queries().list_series(study_id).await
    }

    async fn load_images_for(&self, series_id: i64) -> Result<Vec<ImageInfo>> {
        self.queries().list_images(series_id).await
    }

    async fn delete_study(&self, study_id: i64) -> Result<()> {
        let mut tx = self.begin().await?;
        let images = queries::delete_study(&mut *tx, study_id).await?;
        tx.commit()
            .await
            .map_err(|e| CatalogError::Database(e.to_string()))?;
        info!("Deleted study {} ({} image rows)", study_id, images);
        Ok(())
    }

    async fn delete_series(&self, series_id: i64, study_id: i64, study_images: i64) -> Result<()> {
        let mut tx = self.begin().await?;
        let images = queries::delete_series(&mut *tx, series_id).await?;
        queries::update_study_count(&mut *tx, study_id, study_images).await?;
        tx.commit()
            .await
            .map_err(|e| CatalogError::Database(e.to_string()))?;
        info!("Deleted series {} ({} image rows)", series_id, images);
        Ok(())
    }

    async fn save_studies(&self, studies: &[Arc<Study>]) -> Result<SaveSummary> {
        let mut tx = self.begin().await?;
        let mut assigned = AssignedIds::default();

        for study in studies {
            let study_id = queries::upsert_study(&mut *tx, &study.info()).await?;
            for series in study.series() {
                let series_id = queries::upsert_series(&mut *tx, &series.info(), study_id).await?;
                for image in series.images() {
                    let image_id = queries::upsert_image(&mut *tx, &image.info(), series_id).await?;
                    assigned.images.push((image, image_id));
                }
                assigned.series.push((series, series_id));
            }
            assigned.studies.push((study.clone(), study_id));
        }

        if let Err(e) = tx.commit().await {
            error!("Failed to commit catalog save: {}", e);
            return Err(CatalogError::Database(e.to_string()));
        }

        let summary = assigned.summary();
        assigned.apply();
        debug!(
            "Saved {} studies, {} series, {} images",
            summary.studies, summary.series, summary.images
        );
        Ok(summary)
    }

    async fn image_paths_for_study(&self, study_id: i64) -> Result<Vec<String>> {
        self.queries().image_paths_for_study(study_id).await
    }

    async fn image_paths_for_series(&self, series_id: i64) -> Result<Vec<String>> {
        self.queries().image_paths_for_series(series_id).await
    }

    async fn load_albums(&self) -> Result<Vec<Album>> {
        self.queries().list_albums().await
    }

    async fn upsert_album(&self, album: &Album) -> Result<i64> {
        let mut conn = self.acquire().await?;
        queries::upsert_album(&mut *conn, album).await
    }

    async fn add_studies_to_album(&self, album_id: i64, study_ids: &[i64]) -> Result<()> {
        let mut tx = self.begin().await?;
        for study_id in study_ids {
            queries::add_album_study(&mut *tx, album_id, *study_id).await?;
        }
        tx.commit()
            .await
            .map_err(|e| CatalogError::Database(e.to_string()))
    }

    async fn close(&self) {
        self.db.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries::Table;
    use chrono::NaiveDate;

    fn study_info(uid: &str, patient: &str) -> StudyInfo {
        StudyInfo {
            study_instance_uid: uid.to_string(),
            patient_uid: Some(patient.to_string()),
            name: Some("DOE^JANE".to_string()),
            modality: Some("CT".to_string()),
            date: NaiveDate::from_ymd_opt(2023, 4, 5).and_then(|d| d.and_hms_opt(10, 15, 0)),
            ..Default::default()
        }
    }

    /// 一个检查、一个序列、`frames` 帧
    fn aggregate(uid: &str, patient: &str, frames: i32) -> Arc<Study> {
        let study = Study::new(study_info(uid, patient));
        let (series, _) = study.find_or_insert_series("1.1", || SeriesInfo {
            series_instance_uid: "1.1".to_string(),
            ..Default::default()
        });
        for frame in 0..frames {
            series.find_or_insert_image("1.1.1", frame, || ImageInfo {
                sop_instance_uid: "1.1.1".to_string(),
                frame_id: frame,
                number_of_frames: frames,
                complete_path: Some("/data/IM1".into()),
                ..Default::default()
            });
        }
        series.recompute_number_of_images();
        study.recompute_number_of_images();
        study
    }

    #[tokio::test]
    async fn test_save_assigns_ids_and_is_idempotent() {
        let store = SqliteCatalogStore::in_memory().await.unwrap();
        let study = aggregate("1.2.3", "PATIENT_1", 3);

        let summary = store.save_studies(&[study.clone()]).await.unwrap();
        assert_eq!(summary, SaveSummary { studies: 1, series: 1, images: 3 });
        let study_id = study.db_id().unwrap();
        assert!(study.series()[0].db_id().is_some());

        // 再次保存不产生新行
        store.save_studies(&[study.clone()]).await.unwrap();
        assert_eq!(study.db_id(), Some(study_id));
        let queries = DatabaseQueries::new(store.pool().pool());
        assert_eq!(queries.count_rows(Table::Study).await.unwrap(), 1);
        assert_eq!(queries.count_rows(Table::Series).await.unwrap(), 1);
        assert_eq!(queries.count_rows(Table::Image).await.unwrap(), 3);

        let loaded = store.load_studies().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].number_of_images, 3);
        assert_eq!(loaded[0].patient_uid.as_deref(), Some("PATIENT_1"));
        assert_eq!(loaded[0].date, study.info().date);
    }

    #[tokio::test]
    async fn test_natural_key_upsert_without_ids() {
        let store = SqliteCatalogStore::in_memory().await.unwrap();
        let first = store.upsert_study(&study_info("1.2.3", "PATIENT_1")).await.unwrap();
        let mut changed = study_info("1.2.3", "PATIENT_1");
        changed.study_name = Some("BRAIN".to_string());
        let second = store.upsert_study(&changed).await.unwrap();
        assert_eq!(first, second);

        let other = store.upsert_study(&study_info("1.2.3", "PATIENT_2")).await.unwrap();
        assert_ne!(first, other);

        let studies = store.load_studies().await.unwrap();
        assert_eq!(studies.len(), 2);
        assert_eq!(studies[0].study_name.as_deref(), Some("BRAIN"));
    }

    #[tokio::test]
    async fn test_unset_patient_uid_round_trips_as_none() {
        let store = SqliteCatalogStore::in_memory().await.unwrap();
        let mut info = study_info("1.2.3", "x");
        info.patient_uid = None;
        store.upsert_study(&info).await.unwrap();
        let studies = store.load_studies().await.unwrap();
        assert_eq!(studies[0].patient_uid, None);
    }

    #[tokio::test]
    async fn test_lazy_loading_queries() {
        let store = SqliteCatalogStore::in_memory().await.unwrap();
        let study = aggregate("1.2.3", "PATIENT_1", 2);
        store.save_studies(&[study.clone()]).await.unwrap();

        let series = store.load_series_for(study.db_id().unwrap()).await.unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].number_of_images, 2);
        let images = store.load_images_for(series[0].id.unwrap()).await.unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[1].frame_id, 1);
        assert_eq!(images[0].complete_path, Some("/data/IM1".into()));
    }

    #[tokio::test]
    async fn test_delete_study_cascades() {
        let store = SqliteCatalogStore::in_memory().await.unwrap();
        let keep = aggregate("1.2.3", "PATIENT_1", 1);
        let drop_me = aggregate("4.5.6", "PATIENT_1", 2);
        store.save_studies(&[keep.clone(), drop_me.clone()]).await.unwrap();

        store.delete_study(drop_me.db_id().unwrap()).await.unwrap();

        let queries = DatabaseQueries::new(store.pool().pool());
        assert_eq!(queries.count_rows(Table::Study).await.unwrap(), 1);
        assert_eq!(queries.count_rows(Table::Series).await.unwrap(), 1);
        assert_eq!(queries.count_rows(Table::Image).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_close_releases_pool() {
        let store = SqliteCatalogStore::in_memory().await.unwrap();
        store.save_studies(&[aggregate("1.2.3", "PATIENT_1", 1)]).await.unwrap();
        assert!(!store.pool().pool().is_closed());

        store.close().await;
        assert!(store.pool().pool().is_closed());
        assert!(store.load_studies().await.is_err());
    }

    #[tokio::test]
    async fn test_delete_series_updates_study_count() {
        let store = SqliteCatalogStore::in_memory().await.unwrap();
        let study = aggregate("1.2.3", "PATIENT_1", 2);
        store.save_studies(&[study.clone()]).await.unwrap();
        let series_id = study.series()[0].db_id().unwrap();

        store
            .delete_series(series_id, study.db_id().unwrap(), 0)
            .await
            .unwrap();
        let studies = store.load_studies().await.unwrap();
        assert_eq!(studies[0].number_of_images, 0);
        assert!(store.load_series_for(study.db_id().unwrap()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_save_rolls_back() {
        let store = SqliteCatalogStore::in_memory().await.unwrap();
        let study = aggregate("1.2.3", "PATIENT_1", 1);

        // 影像插入时触发失败，检查和序列的写入也应回滚
        sqlx::query("CREATE TRIGGER fail_images BEFORE INSERT ON image BEGIN SELECT RAISE(ABORT, 'boom'); END")
            .execute(store.pool().pool())
            .await
            .unwrap();

        let result = store.save_studies(&[study.clone()]).await;
        assert!(matches!(result, Err(CatalogError::Database(_))));
        assert!(study.db_id().is_none());

        let queries = DatabaseQueries::new(store.pool().pool());
        assert_eq!(queries.count_rows(Table::Study).await.unwrap(), 0);
        assert_eq!(queries.count_rows(Table::Series).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_albums() {
        let store = SqliteCatalogStore::in_memory().await.unwrap();
        let study_id = store.upsert_study(&study_info("1.2.3", "PATIENT_1")).await.unwrap();
        let album_id = store.upsert_album(&Album::new("Teaching")).await.unwrap();
        store.add_studies_to_album(album_id, &[study_id, study_id]).await.unwrap();

        let albums = store.load_albums().await.unwrap();
        assert_eq!(albums.len(), 1);
        assert_eq!(albums[0].study_ids, vec![study_id]);
        assert!(!albums[0].smart_album);

        store.delete_study(study_id).await.unwrap();
        let albums = store.load_albums().await.unwrap();
        assert!(albums[0].study_ids.is_empty());
    }
}
