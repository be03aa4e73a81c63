//! DICOM数据解析器
//!
//! 读取DICOM文件头部元数据 (不读取像素数据)，转换为 [`ExtractedRecord`]。

use crate::validator::{combine_date_time, parse_dicom_date, DicomValidator};
use dicom::core::Tag;
use dicom::dictionary_std::tags;
use dicom::object::{InMemDicomObject, OpenFileOptions};
use dicomdb_core::models::{is_placeholder_name, UNNAMED};
use dicomdb_core::record::DICOM_FILE_TYPE;
use dicomdb_core::utils::{clean_value, patient_uid};
use dicomdb_core::{CatalogError, ExtractedRecord, Result};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};

/// 文件前导区长度
const PREAMBLE_LEN: usize = 128;

/// 前导区之后的魔数
const DICM_MAGIC: &[u8; 4] = b"DICM";

/// 元数据提取器
pub trait MetadataExtractor: Send + Sync {
    /// 提取单个文件的元数据，无法读取时返回 None
    fn extract(&self, path: &Path) -> Option<ExtractedRecord>;
}

/// DICOM数据解析器
#[derive(Debug, Default, Clone)]
pub struct DicomParser {
    validator: DicomValidator,
}

impl DicomParser {
    /// 创建新的DICOM解析器
    pub fn new() -> Self {
        Self {
            validator: DicomValidator::new(),
        }
    }

    /// 快速检查文件是否带有DICOM前导区
    pub fn has_dicom_preamble(path: &Path) -> bool {
        let mut header = [0u8; PREAMBLE_LEN + 4];
        match File::open(path).and_then(|mut f| f.read_exact(&mut header)) {
            Ok(()) => &header[PREAMBLE_LEN..] == DICM_MAGIC,
            Err(_) => false,
        }
    }

    /// 解析DICOM文件
    pub fn parse_file(&self, path: &Path) -> Result<ExtractedRecord> {
        if !Self::has_dicom_preamble(path) {
            return Err(CatalogError::DicomParse(format!(
                "缺少DICM前导区: {}",
                path.display()
            )));
        }

        let obj = OpenFileOptions::new()
            .read_until(tags::PIXEL_DATA)
            .open_file(path)
            .map_err(|e| CatalogError::DicomParse(format!("无法解析DICOM文件: {}", e)))?;

        let record = Self::extract_metadata(&obj, path);
        let validation = self.validator.validate_record(&record);
        if !validation.is_valid() || validation.has_warnings() {
            debug!(
                "{}: {} {:?} {:?}",
                path.display(),
                validation.get_summary(),
                validation.errors,
                validation.warnings
            );
        }
        Ok(record)
    }

    /// 从DICOM对象中提取元数据
    pub fn extract_metadata(obj: &InMemDicomObject, path: &Path) -> ExtractedRecord {
        let mut record = ExtractedRecord::new(path);
        record.file_type = DICOM_FILE_TYPE.to_string();
        record.sop_class_uid = string_value(obj, tags::SOP_CLASS_UID);

        // 患者信息
        record.patient_name = string_value(obj, tags::PATIENT_NAME);
        record.patient_id = string_value(obj, tags::PATIENT_ID);
        record.patient_uid = patient_uid(record.patient_name.as_deref(), record.patient_id.as_deref());
        record.patient_birth_date =
            string_value(obj, tags::PATIENT_BIRTH_DATE).and_then(|d| parse_dicom_date(&d));
        record.patient_sex = string_value(obj, tags::PATIENT_SEX);

        // 检查信息
        record.study_instance_uid = string_value(obj, tags::STUDY_INSTANCE_UID);
        record.study_description = Some(study_description(obj));
        record.study_date = combine_date_time(
            string_value(obj, tags::STUDY_DATE).as_deref(),
            string_value(obj, tags::STUDY_TIME).as_deref(),
        );
        record.accession_number = string_value(obj, tags::ACCESSION_NUMBER);
        record.referring_physician = string_value(obj, tags::REFERRING_PHYSICIAN_NAME);
        record.performing_physician = string_value(obj, tags::PERFORMING_PHYSICIAN_NAME);
        record.institution_name = string_value(obj, tags::INSTITUTION_NAME);
        record.study_number = string_value(obj, tags::STUDY_ID);

        // 序列信息
        record.series_instance_uid = string_value(obj, tags::SERIES_INSTANCE_UID);
        record.series_description = Some(series_description(obj));
        record.series_number = int_value(obj, tags::SERIES_NUMBER).unwrap_or(0);
        record.modality = string_value(obj, tags::MODALITY);
        record.protocol_name = string_value(obj, tags::PROTOCOL_NAME);
        record.series_date = combine_date_time(
            string_value(obj, tags::SERIES_DATE).as_deref(),
            string_value(obj, tags::SERIES_TIME).as_deref(),
        )
        .or(record.study_date);
        record.window_center = float_value(obj, tags::WINDOW_CENTER);
        record.window_width = float_value(obj, tags::WINDOW_WIDTH);

        // 实例信息
        record.sop_instance_uid = string_value(obj, tags::SOP_INSTANCE_UID);
        record.instance_number = int_value(obj, tags::INSTANCE_NUMBER).unwrap_or(0);
        record.number_of_frames = int_value(obj, tags::NUMBER_OF_FRAMES)
            .filter(|n| *n > 0)
            .unwrap_or(1);
        record.slice_location = float_value(obj, tags::SLICE_LOCATION).unwrap_or(0.0);
        record.rows = int_value(obj, tags::ROWS).unwrap_or(0);
        record.columns = int_value(obj, tags::COLUMNS).unwrap_or(0);

        debug!(
            "提取DICOM元数据: 患者键={}, 检查UID={:?}, SOP={:?}",
            record.patient_uid, record.study_instance_uid, record.sop_instance_uid
        );
        record
    }
}

impl MetadataExtractor for DicomParser {
    fn extract(&self, path: &Path) -> Option<ExtractedRecord> {
        match self.parse_file(path) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("跳过无法读取的文件 {}: {}", path.display(), e);
                None
            }
        }
    }
}

/// 检查描述，缺失时使用第一个操作代码的含义
fn study_description(obj: &InMemDicomObject) -> String {
    if let Some(description) = string_value(obj, tags::STUDY_DESCRIPTION) {
        return description;
    }
    obj.element(tags::PROCEDURE_CODE_SEQUENCE)
        .ok()
        .and_then(|seq| seq.items())
        .and_then(|items| items.first())
        .and_then(|item| string_value(item, tags::CODE_MEANING))
        .unwrap_or_else(|| UNNAMED.to_string())
}

/// 序列描述，依次回退到执行步骤描述和设备处理描述
fn series_description(obj: &InMemDicomObject) -> String {
    [
        tags::SERIES_DESCRIPTION,
        tags::PERFORMED_PROCEDURE_STEP_DESCRIPTION,
        tags::ACQUISITION_DEVICE_PROCESSING_DESCRIPTION,
    ]
    .into_iter()
    .filter_map(|tag| string_value(obj, tag))
    .find(|value| !is_placeholder_name(Some(value.as_str())))
    .unwrap_or_else(|| UNNAMED.to_string())
}

/// 获取字符串类型元素的值
fn string_value(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    let element = obj.element(tag).ok()?;
    let value = element.to_str().ok()?;
    clean_value(&value)
}

/// 获取多值元素的第一个值
fn first_value(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    let value = string_value(obj, tag)?;
    value.split('\\').next().and_then(clean_value)
}

/// 获取整数类型元素的值 (IS/US/SL 等)
fn int_value(obj: &InMemDicomObject, tag: Tag) -> Option<i32> {
    let value = first_value(obj, tag)?;
    value
        .parse::<i32>()
        .ok()
        .or_else(|| value.parse::<f64>().ok().map(|f| f as i32))
}

/// 获取浮点类型元素的值 (DS/FD 等)
fn float_value(obj: &InMemDicomObject, tag: Tag) -> Option<f64> {
    first_value(obj, tag)?.parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use dicom::core::value::DataSetSequence;
    use dicom::core::{DataElement, PrimitiveValue, VR};
    use dicom::object::FileMetaTableBuilder;
    use std::io::Write;

    fn str_element(tag: Tag, vr: VR, value: &str) -> DataElement<InMemDicomObject> {
        DataElement::new(tag, vr, PrimitiveValue::from(value))
    }

    fn sample_object() -> InMemDicomObject {
        InMemDicomObject::from_element_iter([
            str_element(tags::SOP_CLASS_UID, VR::UI, "1.2.840.10008.5.1.4.1.1.2"),
            str_element(tags::SOP_INSTANCE_UID, VR::UI, "1.2.3.4.5.6"),
            str_element(tags::STUDY_INSTANCE_UID, VR::UI, "1.2.3.4"),
            str_element(tags::SERIES_INSTANCE_UID, VR::UI, "1.2.3.4.5"),
            str_element(tags::PATIENT_NAME, VR::PN, "DOE^JANE"),
            str_element(tags::PATIENT_ID, VR::LO, "P001 "),
            str_element(tags::PATIENT_BIRTH_DATE, VR::DA, "19700102"),
            str_element(tags::STUDY_DATE, VR::DA, "20230405"),
            str_element(tags::STUDY_TIME, VR::TM, "101500"),
            str_element(tags::MODALITY, VR::CS, "CT"),
            str_element(tags::SERIES_NUMBER, VR::IS, "3 "),
            str_element(tags::INSTANCE_NUMBER, VR::IS, "17"),
            str_element(tags::NUMBER_OF_FRAMES, VR::IS, "4"),
            str_element(tags::SLICE_LOCATION, VR::DS, "-12.5"),
            str_element(tags::WINDOW_CENTER, VR::DS, "40\\50"),
            DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(512_u16)),
            DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(256_u16)),
        ])
    }

    #[test]
    fn test_extract_metadata_fields_and_defaults() {
        let record = DicomParser::extract_metadata(&sample_object(), Path::new("/tmp/IM1"));

        assert_eq!(record.patient_uid, "PATIENT_P001");
        assert_eq!(record.patient_birth_date, NaiveDate::from_ymd_opt(1970, 1, 2));
        assert_eq!(record.study_date.unwrap().to_string(), "2023-04-05 10:15:00");
        assert_eq!(record.series_date, record.study_date);
        assert_eq!(record.series_number, 3);
        assert_eq!(record.instance_number, 17);
        assert_eq!(record.number_of_frames, 4);
        assert_eq!(record.slice_location, -12.5);
        assert_eq!(record.window_center, Some(40.0));
        assert_eq!((record.rows, record.columns), (512, 256));
        assert_eq!(record.study_description.as_deref(), Some("unnamed"));
        assert_eq!(record.series_description.as_deref(), Some("unnamed"));
        assert!(record.is_dicom());
    }

    #[test]
    fn test_missing_numeric_values_use_defaults() {
        let obj = InMemDicomObject::from_element_iter([str_element(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            "1.2.3",
        )]);
        let record = DicomParser::extract_metadata(&obj, Path::new("x"));
        assert_eq!(record.number_of_frames, 1);
        assert_eq!(record.series_number, 0);
        assert_eq!(record.instance_number, 0);
        assert_eq!(record.slice_location, 0.0);
        assert_eq!((record.rows, record.columns), (0, 0));
        assert_eq!(record.patient_uid, "PATIENT_UNKNOWN");
    }

    #[test]
    fn test_description_fallbacks() {
        let code = InMemDicomObject::from_element_iter([str_element(
            tags::CODE_MEANING,
            VR::LO,
            "CT HEAD W/O CONTRAST",
        )]);
        let obj = InMemDicomObject::from_element_iter([
            DataElement::new(
                tags::PROCEDURE_CODE_SEQUENCE,
                VR::SQ,
                DataSetSequence::from(vec![code]),
            ),
            str_element(tags::PERFORMED_PROCEDURE_STEP_DESCRIPTION, VR::LO, "unnamed"),
            str_element(tags::ACQUISITION_DEVICE_PROCESSING_DESCRIPTION, VR::LO, "HEAD 5MM"),
        ]);

        assert_eq!(study_description(&obj), "CT HEAD W/O CONTRAST");
        assert_eq!(series_description(&obj), "HEAD 5MM");
    }

    #[test]
    fn test_parse_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("IM0001");
        let file_obj = sample_object()
            .with_meta(
                FileMetaTableBuilder::new()
                    .transfer_syntax("1.2.840.10008.1.2.1")
                    .media_storage_sop_class_uid("1.2.840.10008.5.1.4.1.1.2")
                    .media_storage_sop_instance_uid("1.2.3.4.5.6"),
            )
            .unwrap();
        file_obj.write_to_file(&path).unwrap();

        assert!(DicomParser::has_dicom_preamble(&path));
        let record = DicomParser::new().extract(&path).unwrap();
        assert_eq!(record.sop_instance_uid.as_deref(), Some("1.2.3.4.5.6"));
        assert_eq!(record.file_path, path);
    }

    #[test]
    fn test_non_dicom_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "not a dicom file").unwrap();

        assert!(!DicomParser::has_dicom_preamble(&path));
        assert!(DicomParser::new().extract(&path).is_none());
        assert!(DicomParser::new().extract(&dir.path().join("absent")).is_none());
    }
}
