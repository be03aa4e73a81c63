//! 数据库模型

use chrono::{NaiveDate, NaiveDateTime};
use dicomdb_core::models::{Album, ImageInfo, SeriesInfo, StudyInfo};
use sqlx::FromRow;
use std::path::PathBuf;

// 数据库表模型 - 使用FromRow trait用于SQL查询

/// 数据库检查表
#[derive(Debug, FromRow)]
pub struct DbStudy {
    pub id: i64,
    pub study_instance_uid: String,
    /// 空字符串表示尚未确定
    pub patient_uid: String,
    pub name: Option<String>,
    pub patient_id: Option<String>,
    pub patient_birth_date: Option<NaiveDate>,
    pub patient_sex: Option<String>,
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
    pub study_id: Option<String>,
}

impl From<DbStudy> for StudyInfo {
    fn from(db_study: DbStudy) -> Self {
        StudyInfo {
            id: Some(db_study.id),
            study_instance_uid: db_study.study_instance_uid,
            patient_uid: Some(db_study.patient_uid).filter(|uid| !uid.is_empty()),
            name: db_study.name,
            patient_id: db_study.patient_id,
            patient_birth_date: db_study.patient_birth_date,
            patient_sex: db_study.patient_sex,
            study_name: db_study.study_name,
            modality: db_study.modality,
            date: db_study.date,
            date_added: db_study.date_added,
            number_of_images: db_study.number_of_images,
            comment: db_study.comment,
            accession_number: db_study.accession_number,
            referring_physician: db_study.referring_physician,
            performing_physician: db_study.performing_physician,
            institution_name: db_study.institution_name,
            study_id: db_study.study_id,
        }
    }
}

/// 数据库序列表
#[derive(Debug, FromRow)]
pub struct DbSeries {
    pub id: i64,
    pub study_id: i64,
    pub series_instance_uid: String,
    pub name: Option<String>,
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

impl From<DbSeries> for SeriesInfo {
    fn from(db_series: DbSeries) -> Self {
        SeriesInfo {
            id: Some(db_series.id),
            series_instance_uid: db_series.series_instance_uid,
            name: db_series.name,
            series_description: db_series.series_description,
            modality: db_series.modality,
            date: db_series.date,
            date_added: db_series.date_added,
            number_of_images: db_series.number_of_images,
            series_number: db_series.series_number,
            series_sop_class_uid: db_series.series_sop_class_uid,
            window_level: db_series.window_level,
            window_width: db_series.window_width,
        }
    }
}

/// 数据库影像表
#[derive(Debug, FromRow)]
pub struct DbImage {
    pub id: i64,
    pub series_id: i64,
    pub sop_instance_uid: String,
    pub frame_id: i32,
    pub path_string: Option<String>,
    pub complete_path: Option<String>,
    pub instance_number: i32,
    pub number_of_frames: i32,
    pub date: Option<NaiveDateTime>,
    pub modality: Option<String>,
    pub file_type: Option<String>,
    pub height: i32,
    pub width: i32,
    pub slice_location: f64,
}

impl From<DbImage> for ImageInfo {
    fn from(db_image: DbImage) -> Self {
        ImageInfo {
            id: Some(db_image.id),
            sop_instance_uid: db_image.sop_instance_uid,
            frame_id: db_image.frame_id,
            instance_number: db_image.instance_number,
            number_of_frames: db_image.number_of_frames,
            path_string: db_image.path_string,
            complete_path: db_image.complete_path.map(PathBuf::from),
            date: db_image.date,
            modality: db_image.modality,
            file_type: db_image.file_type,
            height: db_image.height,
            width: db_image.width,
            slice_location: db_image.slice_location,
        }
    }
}

/// 数据库相册表
#[derive(Debug, FromRow)]
pub struct DbAlbum {
    pub id: i64,
    pub name: String,
    pub smart_album: bool,
    pub predicate: Option<String>,
    pub date_added: Option<NaiveDateTime>,
}

impl DbAlbum {
    /// 附加关联检查，转换为领域模型
    pub fn into_album(self, study_ids: Vec<i64>) -> Album {
        Album {
            id: Some(self.id),
            name: self.name,
            smart_album: self.smart_album,
            predicate: self.predicate,
            date_added: self.date_added,
            study_ids,
        }
    }
}
