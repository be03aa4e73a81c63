//! 核心数据模型定义
//!
//! Study → Series → Image 三级聚合。检查独占其序列，序列独占其影像；
//! 子级只持有指向父级的弱引用。每个聚合的字段和子集合分别加锁，
//! 需要遍历子集合时先取快照再在锁外读取。

use chrono::{NaiveDate, NaiveDateTime};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// 缺少描述时使用的占位名称
pub const UNNAMED: &str = "unnamed";

/// 可以被后续记录覆盖的临时模态 (结构化报告 / 其他)
pub const PROVISIONAL_MODALITIES: &[&str] = &["SR", "OT"];

/// 名称为空或为占位名称
pub fn is_placeholder_name(name: Option<&str>) -> bool {
    match name {
        None => true,
        Some(n) => n.is_empty() || n == UNNAMED,
    }
}

/// 模态为空或属于临时模态
pub fn is_provisional_modality(modality: Option<&str>) -> bool {
    match modality {
        None => true,
        Some(m) => m.is_empty() || PROVISIONAL_MODALITIES.contains(&m),
    }
}

/// 检查字段
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StudyInfo {
    /// 数据库行ID，尚未保存时为空
    pub id: Option<i64>,
    pub study_instance_uid: String,
    /// 派生的患者键，用于区分共用同一检查UID的不同患者
    pub patient_uid: Option<String>,
    /// 患者姓名
    pub name: Option<String>,
    pub patient_id: Option<String>,
    pub patient_birth_date: Option<NaiveDate>,
    pub patient_sex: Option<String>,
    /// 检查名称 (检查描述)
    pub study_name: Option<String>,
    pub modality: Option<String>,
    pub date: Option<NaiveDateTime>,
    pub date_added: Option<NaiveDateTime>,
    pub number_of_images: i64,
    pub comment: Option<String>,
    pub accession_number: Option<String>,
    pub referring_physician: Option<String>,
    pub performing_physician: Option<String>,
    pub institution_name: Option<String>,
    /// 检查号 (0020,0010)
    pub study_id: Option<String>,
}

/// 序列字段
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeriesInfo {
    pub id: Option<i64>,
    pub series_instance_uid: String,
    /// 序列名称 (序列描述)
    pub name: Option<String>,
    /// 协议名称
    pub series_description: Option<String>,
    pub modality: Option<String>,
    pub date: Option<NaiveDateTime>,
    pub date_added: Option<NaiveDateTime>,
    pub number_of_images: i64,
    pub series_number: i32,
    pub series_sop_class_uid: Option<String>,
    pub window_level: Option<f64>,
    pub window_width: Option<f64>,
}

/// 影像字段，多帧文件的每一帧是一条独立的影像
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id: Option<i64>,
    pub sop_instance_uid: String,
    pub frame_id: i32,
    pub instance_number: i32,
    pub number_of_frames: i32,
    /// 文件名
    pub path_string: Option<String>,
    /// 完整路径
    pub complete_path: Option<PathBuf>,
    pub date: Option<NaiveDateTime>,
    pub modality: Option<String>,
    pub file_type: Option<String>,
    pub height: i32,
    pub width: i32,
    pub slice_location: f64,
}

/// 检查聚合
#[derive(Debug)]
pub struct Study {
    info: RwLock<StudyInfo>,
    series: Mutex<Vec<Arc<Series>>>,
    series_loaded: AtomicBool,
}

impl Study {
    /// 新建的检查，存储中没有它的序列
    pub fn new(info: StudyInfo) -> Arc<Self> {
        Self::with_loaded(info, true)
    }

    /// 从存储浅加载的检查，序列在首次访问时加载
    pub fn from_store(info: StudyInfo) -> Arc<Self> {
        Self::with_loaded(info, false)
    }

    fn with_loaded(info: StudyInfo, loaded: bool) -> Arc<Self> {
        Arc::new(Self {
            info: RwLock::new(info),
            series: Mutex::new(Vec::new()),
            series_loaded: AtomicBool::new(loaded),
        })
    }

    /// 字段快照
    pub fn info(&self) -> StudyInfo {
        self.info.read().clone()
    }

    /// 在写锁内修改字段
    pub fn update<R>(&self, f: impl FnOnce(&mut StudyInfo) -> R) -> R {
        f(&mut self.info.write())
    }

    pub fn study_instance_uid(&self) -> String {
        self.info.read().study_instance_uid.clone()
    }

    pub fn patient_uid(&self) -> Option<String> {
        self.info.read().patient_uid.clone()
    }

    pub fn db_id(&self) -> Option<i64> {
        self.info.read().id
    }

    pub fn set_db_id(&self, id: i64) {
        self.info.write().id = Some(id);
    }

    pub fn number_of_images(&self) -> i64 {
        self.info.read().number_of_images
    }

    /// 序列集合快照
    pub fn series(&self) -> Vec<Arc<Series>> {
        self.series.lock().clone()
    }

    pub fn series_count(&self) -> usize {
        self.series.lock().len()
    }

    pub fn find_series(&self, series_instance_uid: &str) -> Option<Arc<Series>> {
        self.series
            .lock()
            .iter()
            .find(|s| s.series_instance_uid() == series_instance_uid)
            .cloned()
    }

    /// 查找序列，不存在时在同一把锁内创建，返回 (序列, 是否新建)
    pub fn find_or_insert_series(
        self: &Arc<Self>,
        series_instance_uid: &str,
        make: impl FnOnce() -> SeriesInfo,
    ) -> (Arc<Series>, bool) {
        let mut series = self.series.lock();
        if let Some(existing) = series
            .iter()
            .find(|s| s.series_instance_uid() == series_instance_uid)
        {
            return (existing.clone(), false);
        }
        let created = Series::new(make(), self);
        series.push(created.clone());
        (created, true)
    }

    pub fn remove_series(&self, series: &Arc<Series>) -> bool {
        let mut guard = self.series.lock();
        let before = guard.len();
        guard.retain(|s| !Arc::ptr_eq(s, series));
        guard.len() != before
    }

    /// 合并从存储加载的序列，内存中已有同UID序列的以内存为准
    pub fn attach_loaded_series(&self, loaded: Vec<Arc<Series>>) {
        let mut guard = self.series.lock();
        for series in loaded {
            let uid = series.series_instance_uid();
            if !guard.iter().any(|s| s.series_instance_uid() == uid) {
                guard.push(series);
            }
        }
        self.series_loaded.store(true, Ordering::Release);
    }

    /// 序列是否已经从存储加载过
    pub fn series_loaded(&self) -> bool {
        self.series_loaded.load(Ordering::Acquire)
    }

    /// 按序列计数之和重新计算影像数；序列尚未加载时保留已有计数
    ///
    /// 写入完成前一直持有序列集合锁，并发的重新计算按顺序落盘，
    /// 后写入的总是更新的结果。
    pub fn recompute_number_of_images(&self) -> i64 {
        if !self.series_loaded() {
            return self.number_of_images();
        }
        let series = self.series.lock();
        let total: i64 = series.iter().map(|s| s.number_of_images()).sum();
        self.info.write().number_of_images = total;
        total
    }
}

/// 序列聚合
#[derive(Debug)]
pub struct Series {
    info: RwLock<SeriesInfo>,
    images: Mutex<Vec<Arc<Image>>>,
    images_loaded: AtomicBool,
    study: Weak<Study>,
}

impl Series {
    /// 新建的序列，存储中没有它的影像
    pub fn new(info: SeriesInfo, study: &Arc<Study>) -> Arc<Self> {
        Self::with_loaded(info, study, true)
    }

    /// 从存储浅加载的序列
    pub fn from_store(info: SeriesInfo, study: &Arc<Study>) -> Arc<Self> {
        Self::with_loaded(info, study, false)
    }

    fn with_loaded(info: SeriesInfo, study: &Arc<Study>, loaded: bool) -> Arc<Self> {
        Arc::new(Self {
            info: RwLock::new(info),
            images: Mutex::new(Vec::new()),
            images_loaded: AtomicBool::new(loaded),
            study: Arc::downgrade(study),
        })
    }

    pub fn info(&self) -> SeriesInfo {
        self.info.read().clone()
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut SeriesInfo) -> R) -> R {
        f(&mut self.info.write())
    }

    pub fn series_instance_uid(&self) -> String {
        self.info.read().series_instance_uid.clone()
    }

    pub fn db_id(&self) -> Option<i64> {
        self.info.read().id
    }

    pub fn set_db_id(&self, id: i64) {
        self.info.write().id = Some(id);
    }

    pub fn number_of_images(&self) -> i64 {
        self.info.read().number_of_images
    }

    /// 所属检查，检查已被释放时为空
    pub fn study(&self) -> Option<Arc<Study>> {
        self.study.upgrade()
    }

    /// 影像集合快照
    pub fn images(&self) -> Vec<Arc<Image>> {
        self.images.lock().clone()
    }

    pub fn image_count(&self) -> usize {
        self.images.lock().len()
    }

    pub fn find_image(&self, sop_instance_uid: &str, frame_id: i32) -> Option<Arc<Image>> {
        self.images
            .lock()
            .iter()
            .find(|i| i.matches(sop_instance_uid, frame_id))
            .cloned()
    }

    /// 查找 (SOP实例UID, 帧号) 对应的影像，不存在时在同一把锁内创建
    pub fn find_or_insert_image(
        self: &Arc<Self>,
        sop_instance_uid: &str,
        frame_id: i32,
        make: impl FnOnce() -> ImageInfo,
    ) -> (Arc<Image>, bool) {
        let mut images = self.images.lock();
        if let Some(existing) = images.iter().find(|i| i.matches(sop_instance_uid, frame_id)) {
            return (existing.clone(), false);
        }
        let created = Image::new(make(), self);
        images.push(created.clone());
        (created, true)
    }

    pub fn attach_loaded_images(&self, loaded: Vec<Arc<Image>>) {
        let mut guard = self.images.lock();
        for image in loaded {
            let (uid, frame) = image.key();
            if !guard.iter().any(|i| i.matches(&uid, frame)) {
                guard.push(image);
            }
        }
        self.images_loaded.store(true, Ordering::Release);
    }

    pub fn images_loaded(&self) -> bool {
        self.images_loaded.load(Ordering::Acquire)
    }

    /// 按影像集合大小重新计算影像数；影像尚未加载时保留已有计数
    pub fn recompute_number_of_images(&self) -> i64 {
        if !self.images_loaded() {
            return self.number_of_images();
        }
        let images = self.images.lock();
        let count = images.len() as i64;
        self.info.write().number_of_images = count;
        count
    }
}

/// 影像聚合
#[derive(Debug)]
pub struct Image {
    info: RwLock<ImageInfo>,
    series: Weak<Series>,
}

impl Image {
    pub fn new(info: ImageInfo, series: &Arc<Series>) -> Arc<Self> {
        Arc::new(Self {
            info: RwLock::new(info),
            series: Arc::downgrade(series),
        })
    }

    pub fn info(&self) -> ImageInfo {
        self.info.read().clone()
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut ImageInfo) -> R) -> R {
        f(&mut self.info.write())
    }

    /// 自然键 (SOP实例UID, 帧号)
    pub fn key(&self) -> (String, i32) {
        let info = self.info.read();
        (info.sop_instance_uid.clone(), info.frame_id)
    }

    pub fn matches(&self, sop_instance_uid: &str, frame_id: i32) -> bool {
        let info = self.info.read();
        info.frame_id == frame_id && info.sop_instance_uid == sop_instance_uid
    }

    pub fn set_db_id(&self, id: i64) {
        self.info.write().id = Some(id);
    }

    pub fn complete_path(&self) -> Option<PathBuf> {
        self.info.read().complete_path.clone()
    }

    pub fn series(&self) -> Option<Arc<Series>> {
        self.series.upgrade()
    }
}

/// 目录中所有检查的共享列表
#[derive(Debug, Default)]
pub struct StudyCollection {
    studies: Mutex<Vec<Arc<Study>>>,
}

impl StudyCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// 列表快照
    pub fn snapshot(&self) -> Vec<Arc<Study>> {
        self.studies.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.studies.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.studies.lock().is_empty()
    }

    /// 用存储加载的结果替换整个列表
    pub fn replace_all(&self, studies: Vec<Arc<Study>>) {
        *self.studies.lock() = studies;
    }

    pub fn push_if_absent(&self, study: Arc<Study>) -> bool {
        let mut guard = self.studies.lock();
        if guard.iter().any(|s| Arc::ptr_eq(s, &study)) {
            return false;
        }
        guard.push(study);
        true
    }

    pub fn contains(&self, study: &Arc<Study>) -> bool {
        self.studies.lock().iter().any(|s| Arc::ptr_eq(s, study))
    }

    pub fn remove(&self, study: &Arc<Study>) -> bool {
        let mut guard = self.studies.lock();
        let before = guard.len();
        guard.retain(|s| !Arc::ptr_eq(s, study));
        guard.len() != before
    }

    /// 按检查UID和患者键查找
    pub fn find(&self, study_instance_uid: &str, patient_uid: Option<&str>) -> Option<Arc<Study>> {
        self.studies
            .lock()
            .iter()
            .find(|s| {
                let info = s.info.read();
                info.study_instance_uid == study_instance_uid
                    && info.patient_uid.as_deref() == patient_uid
            })
            .cloned()
    }

    /// 共用同一检查UID的所有检查，按加入顺序
    pub fn find_by_uid(&self, study_instance_uid: &str) -> Vec<Arc<Study>> {
        self.studies
            .lock()
            .iter()
            .filter(|s| s.info.read().study_instance_uid == study_instance_uid)
            .cloned()
            .collect()
    }

    /// 查找 (检查UID, 患者键) 对应的检查，不存在时在同一把锁内创建
    pub fn find_or_insert(
        &self,
        study_instance_uid: &str,
        patient_uid: &str,
        make: impl FnOnce() -> StudyInfo,
    ) -> (Arc<Study>, bool) {
        let mut guard = self.studies.lock();
        if let Some(existing) = guard.iter().find(|s| {
            let info = s.info.read();
            info.study_instance_uid == study_instance_uid
                && info.patient_uid.as_deref() == Some(patient_uid)
        }) {
            return (existing.clone(), false);
        }
        let created = Study::new(make());
        guard.push(created.clone());
        (created, true)
    }
}

/// 相册，只保存谓词字符串，不做求值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Album {
    pub id: Option<i64>,
    pub name: String,
    pub smart_album: bool,
    pub predicate: Option<String>,
    pub date_added: Option<NaiveDateTime>,
    /// 关联的检查行ID
    pub study_ids: Vec<i64>,
}

impl Album {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            smart_album: false,
            predicate: None,
            date_added: None,
            study_ids: Vec::new(),
        }
    }

    pub fn smart(name: impl Into<String>, predicate: impl Into<String>) -> Self {
        Self {
            smart_album: true,
            predicate: Some(predicate.into()),
            ..Self::new(name)
        }
    }

    pub fn number_of_studies(&self) -> usize {
        self.study_ids.len()
    }
}

/// 新目录默认创建的智能相册
pub fn default_smart_albums() -> Vec<Album> {
    vec![
        Album::smart("Today", "date >= $TODAY"),
        Album::smart("Yesterday", "date >= $YESTERDAY AND date < $TODAY"),
        Album::smart("Last Week", "date >= $LASTWEEK"),
    ]
}
