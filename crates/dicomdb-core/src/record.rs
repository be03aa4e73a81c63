//! 元数据提取记录
//!
//! 提取器为每个可读文件产生一条扁平记录，协调器只依赖这条记录，
//! 不直接接触DICOM对象。

use crate::models::{is_placeholder_name, UNNAMED};
use crate::utils;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 文件类型前缀，`dicom_only` 只保留以此开头的记录
pub const DICOM_FILE_TYPE: &str = "DICOM";

/// 缺少检查UID时使用的占位键
pub const NO_STUDY_ID: &str = "noStudyID";

/// 缺少序列UID时使用的占位键
pub const NO_SERIES_ID: &str = "noSeriesID";

/// 单个文件的元数据
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    pub file_path: PathBuf,
    pub file_type: String,
    pub sop_class_uid: Option<String>,

    // 患者
    pub patient_name: Option<String>,
    pub patient_id: Option<String>,
    pub patient_birth_date: Option<NaiveDate>,
    pub patient_sex: Option<String>,
    /// 由患者ID/姓名派生，见 [`utils::patient_uid`]
    pub patient_uid: String,

    // 检查
    pub study_instance_uid: Option<String>,
    pub study_description: Option<String>,
    pub study_date: Option<NaiveDateTime>,
    pub accession_number: Option<String>,
    pub referring_physician: Option<String>,
    pub performing_physician: Option<String>,
    pub institution_name: Option<String>,
    pub study_number: Option<String>,

    // 序列
    pub series_instance_uid: Option<String>,
    /// 备用序列UID，主UID缺失时使用
    pub series_dicom_uid: Option<String>,
    pub series_description: Option<String>,
    pub series_number: i32,
    pub modality: Option<String>,
    pub protocol_name: Option<String>,
    pub series_date: Option<NaiveDateTime>,
    pub window_center: Option<f64>,
    pub window_width: Option<f64>,

    // 影像
    pub sop_instance_uid: Option<String>,
    pub instance_number: i32,
    pub number_of_frames: i32,
    pub slice_location: f64,
    pub rows: i32,
    pub columns: i32,
}

impl ExtractedRecord {
    /// 以给定路径创建空记录，帧数默认为1
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
            file_type: DICOM_FILE_TYPE.to_string(),
            patient_uid: utils::UNKNOWN_PATIENT_UID.to_string(),
            number_of_frames: 1,
            ..Default::default()
        }
    }

    /// 设置患者信息并重新计算患者键
    pub fn with_patient(mut self, name: Option<&str>, id: Option<&str>) -> Self {
        self.patient_name = name.map(str::to_string);
        self.patient_id = id.map(str::to_string);
        self.patient_uid = utils::patient_uid(name, id);
        self
    }

    pub fn is_dicom(&self) -> bool {
        self.file_type.starts_with(DICOM_FILE_TYPE)
    }

    /// 展开的帧数，缺失或非正数时按1计
    pub fn frame_count(&self) -> i32 {
        self.number_of_frames.max(1)
    }

    /// 检查键
    pub fn study_key(&self) -> &str {
        self.study_instance_uid
            .as_deref()
            .filter(|uid| !uid.is_empty())
            .unwrap_or(NO_STUDY_ID)
    }

    /// 序列键，主UID缺失时使用备用UID
    pub fn series_key(&self) -> &str {
        self.series_instance_uid
            .as_deref()
            .filter(|uid| !uid.is_empty())
            .or_else(|| self.series_dicom_uid.as_deref().filter(|uid| !uid.is_empty()))
            .unwrap_or(NO_SERIES_ID)
    }

    pub fn sop_key(&self) -> Option<&str> {
        self.sop_instance_uid.as_deref().filter(|uid| !uid.is_empty())
    }

    /// 检查显示名称：检查描述，其次序列描述，否则为 `unnamed`
    pub fn display_study_name(&self) -> String {
        [&self.study_description, &self.series_description]
            .into_iter()
            .flatten()
            .find(|name| !is_placeholder_name(Some(name.as_str())))
            .cloned()
            .unwrap_or_else(|| UNNAMED.to_string())
    }

    /// 文件名部分
    pub fn file_name(&self) -> Option<String> {
        file_name_of(&self.file_path)
    }
}

fn file_name_of(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}
