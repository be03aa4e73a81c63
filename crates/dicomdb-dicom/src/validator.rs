//! DICOM数据验证模块
//!
//! DA/TM 值解析，以及提取记录的完整性检查。记录检查只产生警告，
//! 不会让文件被拒绝。

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use dicomdb_core::utils::is_valid_dicom_uid;
use dicomdb_core::ExtractedRecord;

/// 解析DICOM日期 (YYYYMMDD)，兼容旧式 YYYY.MM.DD
pub fn parse_dicom_date(value: &str) -> Option<NaiveDate> {
    let digits: String = value.trim().chars().filter(|c| *c != '.').collect();
    if digits.len() != 8 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let year = digits[0..4].parse::<i32>().ok()?;
    let month = digits[4..6].parse::<u32>().ok()?;
    let day = digits[6..8].parse::<u32>().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// 解析DICOM时间 (HH[MM[SS[.FFFFFF]]])，兼容旧式 HH:MM:SS
pub fn parse_dicom_time(value: &str) -> Option<NaiveTime> {
    let value = value.trim();
    let (whole, fraction) = match value.find('.') {
        Some(dot) => (&value[..dot], &value[dot + 1..]),
        None => (value, ""),
    };
    let whole: String = whole.chars().filter(|c| *c != ':').collect();
    if whole.len() < 2 || whole.len() > 6 || whole.len() % 2 != 0 {
        return None;
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let hour = whole[0..2].parse::<u32>().ok()?;
    let minute = if whole.len() >= 4 { whole[2..4].parse::<u32>().ok()? } else { 0 };
    // 闰秒按59秒处理
    let second = if whole.len() >= 6 { whole[4..6].parse::<u32>().ok()?.min(59) } else { 0 };

    let micros = if fraction.is_empty() {
        0
    } else {
        if !fraction.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let padded = format!("{:0<6}", &fraction[..fraction.len().min(6)]);
        padded.parse::<u32>().ok()?
    };

    NaiveTime::from_hms_micro_opt(hour, minute, second, micros)
}

/// 合并日期和时间，时间缺失或无效时取当天零点
pub fn combine_date_time(date: Option<&str>, time: Option<&str>) -> Option<NaiveDateTime> {
    let date = parse_dicom_date(date?)?;
    let time = time.and_then(parse_dicom_time).unwrap_or(NaiveTime::MIN);
    Some(date.and_time(time))
}

/// 提取记录验证器
#[derive(Debug, Default, Clone, Copy)]
pub struct DicomValidator;

impl DicomValidator {
    pub fn new() -> Self {
        Self
    }

    /// 检查记录的标识符是否齐全、格式是否正确
    pub fn validate_record(&self, record: &ExtractedRecord) -> ValidationResult {
        let mut result = ValidationResult::new();

        if record.sop_key().is_none() {
            result.add_error("缺少SOP实例UID".to_string());
        }
        if record.study_instance_uid.is_none() {
            result.add_warning("缺少检查实例UID".to_string());
        }
        if record.series_instance_uid.is_none() && record.series_dicom_uid.is_none() {
            result.add_warning("缺少序列实例UID".to_string());
        }

        let uid_fields = [
            ("SOP类UID", &record.sop_class_uid),
            ("SOP实例UID", &record.sop_instance_uid),
            ("检查实例UID", &record.study_instance_uid),
            ("序列实例UID", &record.series_instance_uid),
        ];
        for (name, uid) in uid_fields {
            if let Some(uid) = uid {
                if !is_valid_dicom_uid(uid) {
                    result.add_warning(format!("{}格式无效: {}", name, uid));
                }
            }
        }

        if record.modality.is_none() {
            result.add_warning("缺少模态".to_string());
        }

        result
    }
}

/// 验证结果
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// 验证错误列表
    pub errors: Vec<String>,
    /// 验证警告列表
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    /// 没有错误即视为通过
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// 获取验证报告摘要
    pub fn get_summary(&self) -> String {
        if self.is_valid() {
            if self.has_warnings() {
                format!("验证通过，但有 {} 个警告", self.warnings.len())
            } else {
                "验证完全通过".to_string()
            }
        } else {
            format!(
                "验证失败：{} 个错误，{} 个警告",
                self.errors.len(),
                self.warnings.len()
            )
        }
    }
}
