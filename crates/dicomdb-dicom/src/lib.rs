//! # DICOM元数据提取模块
//!
//! 提供元数据提取器接口及其基于 `dicom` 的实现，以及DICOM日期、时间、UID的解析与验证。

pub mod parser;
pub mod validator;

pub use parser::{DicomParser, MetadataExtractor};
pub use validator::{combine_date_time, parse_dicom_date, parse_dicom_time, DicomValidator, ValidationResult};
