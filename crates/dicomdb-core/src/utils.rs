//! 通用工具函数

/// 患者键前缀
pub const PATIENT_UID_PREFIX: &str = "PATIENT_";

/// 既无患者ID也无姓名时使用的患者键
pub const UNKNOWN_PATIENT_UID: &str = "PATIENT_UNKNOWN";

/// 计算患者键
///
/// 患者ID优先，其次是患者姓名，两者都为空时返回 `PATIENT_UNKNOWN`。
/// 判断是否为空时去掉首尾空白，拼接时使用原值，不做大小写或空白规范化。
pub fn patient_uid(patient_name: Option<&str>, patient_id: Option<&str>) -> String {
    if let Some(id) = patient_id.filter(|id| !id.trim().is_empty()) {
        return format!("{}{}", PATIENT_UID_PREFIX, id);
    }
    if let Some(name) = patient_name.filter(|name| !name.trim().is_empty()) {
        return format!("{}{}", PATIENT_UID_PREFIX, name);
    }
    UNKNOWN_PATIENT_UID.to_string()
}

/// 去掉DICOM值的填充字符，空值返回 None
pub fn clean_value(value: &str) -> Option<String> {
    let trimmed = value.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// 验证DICOM UID格式
pub fn is_valid_dicom_uid(uid: &str) -> bool {
    !uid.is_empty()
        && uid.len() <= 64
        && uid.chars().all(|c| c.is_ascii_digit() || c == '.')
        && !uid.starts_with('.')
        && !uid.ends_with('.')
        && !uid.contains("..")
}

/// 将任意字符串转换为可用作文件名的形式
pub fn sanitize_path_component(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '\0' => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.');
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned.to_string()
    }
}
