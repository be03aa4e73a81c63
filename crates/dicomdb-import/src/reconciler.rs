//! 目录合并器
//!
//! 把提取记录按顺序合并进内存中的 Study → Series → Image 聚合：
//!
//! 1. 检查按 (检查UID, 患者键) 匹配，连续记录属于同一检查时直接复用上一条的结果；
//! 2. 序列在检查内按序列UID匹配；
//! 3. 多帧文件展开为 `max(1, 帧数)` 条影像，每帧按 (SOP实例UID, 帧号) 匹配；
//! 4. 每条记录处理完后刷新序列和检查的影像计数。
//!
//! 新建对象或强制重读时用记录覆盖全部描述字段；已有对象只替换临时模态和占位名称。
//! 合并器不接触存储，调用方需要先加载涉及检查的序列和影像。

use chrono::{Local, NaiveDate, NaiveDateTime};
use dicomdb_core::models::{
    is_placeholder_name, is_provisional_modality, Image, ImageInfo, Series, SeriesInfo, Study,
    StudyCollection, StudyInfo, UNNAMED,
};
use dicomdb_core::progress::{ProgressReporter, ProgressThrottle, DEFAULT_PROGRESS_INTERVAL};
use dicomdb_core::ExtractedRecord;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 合并选项
#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// 已有对象也用记录覆盖全部字段
    pub reread_existing: bool,
    /// 收集新建或匹配到的影像
    pub return_added: bool,
    /// 进度上报间隔
    pub progress_interval: Duration,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            reread_existing: false,
            return_added: false,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

/// 一次合并的结果
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    /// 新建或匹配到的影像，仅在 `return_added` 时收集
    pub added_images: Vec<Arc<Image>>,
    /// 涉及的检查，按首次出现的顺序，不重复
    pub touched_studies: Vec<Arc<Study>>,
    /// 本次新建的检查
    pub new_studies: Vec<Arc<Study>>,
    /// 新建或匹配到的影像 (帧) 数
    pub images: usize,
    /// 已合并的记录数
    pub processed: usize,
    /// 因缺少SOP实例UID而跳过的记录数
    pub skipped: usize,
    /// 是否因取消而提前结束
    pub cancelled: bool,
}

/// 早于此日期的检查日期视为无效
fn min_study_date() -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(1901, 1, 1)
}

fn is_plausible_date(date: &NaiveDateTime) -> bool {
    min_study_date().is_some_and(|min| date.date() > min)
}

/// 保留最晚的有效日期
fn keep_latest_date(current: &mut Option<NaiveDateTime>, candidate: Option<NaiveDateTime>) {
    let Some(candidate) = candidate.filter(is_plausible_date) else {
        return;
    };
    match current {
        Some(existing) if is_plausible_date(existing) && *existing >= candidate => {}
        _ => *current = Some(candidate),
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.clone().filter(|v| !v.is_empty())
}

/// 合并一批记录
///
/// 取消在记录之间检查，已合并的部分保留。
pub fn reconcile(
    records: &[ExtractedRecord],
    studies: &StudyCollection,
    options: &ReconcileOptions,
    progress: &dyn ProgressReporter,
) -> ReconcileOutcome {
    let mut pass = Pass::new(studies, options);
    let mut throttle = ProgressThrottle::new(options.progress_interval);
    let total = records.len();

    progress.set_status(&format!("Adding {} files", total));
    for (index, record) in records.iter().enumerate() {
        if progress.is_cancelled() {
            info!("Import cancelled after {} of {} records", index, total);
            pass.outcome.cancelled = true;
            break;
        }
        pass.merge(record);
        throttle.tick(progress, index, total);
    }

    let outcome = pass.outcome;
    debug!(
        "Reconciled {} records ({} skipped), {} studies touched, {} new",
        outcome.processed,
        outcome.skipped,
        outcome.touched_studies.len(),
        outcome.new_studies.len()
    );
    outcome
}

/// 一次合并过程的状态
struct Pass<'a> {
    studies: &'a StudyCollection,
    options: &'a ReconcileOptions,
    /// 检查UID → 共用该UID的检查
    index: HashMap<String, Vec<Arc<Study>>>,
    last_study: Option<(String, String, Arc<Study>)>,
    last_series: Option<(String, Arc<Series>)>,
    touched: HashSet<*const Study>,
    now: NaiveDateTime,
    outcome: ReconcileOutcome,
}

impl<'a> Pass<'a> {
    fn new(studies: &'a StudyCollection, options: &'a ReconcileOptions) -> Self {
        let mut index: HashMap<String, Vec<Arc<Study>>> = HashMap::new();
        for study in studies.snapshot() {
            index.entry(study.study_instance_uid()).or_default().push(study);
        }
        Self {
            studies,
            options,
            index,
            last_study: None,
            last_series: None,
            touched: HashSet::new(),
            now: Local::now().naive_local(),
            outcome: ReconcileOutcome::default(),
        }
    }

    fn merge(&mut self, record: &ExtractedRecord) {
        let Some(sop_uid) = record.sop_key() else {
            warn!("Skipping record without SOP Instance UID: {}", record.file_path.display());
            self.outcome.skipped += 1;
            return;
        };

        let (study, study_created) = self.resolve_study(record);
        self.populate_study(&study, record, study_created);

        let (series, series_created) = self.resolve_series(&study, record);
        self.populate_series(&series, record, series_created);

        let frames = record.frame_count();
        for frame in 0..frames {
            let (image, image_created) = series.find_or_insert_image(sop_uid, frame, || ImageInfo {
                sop_instance_uid: sop_uid.to_string(),
                frame_id: frame,
                ..Default::default()
            });
            if image_created || self.options.reread_existing {
                image.update(|info| populate_image(info, record, frames));
            }
            if self.options.return_added {
                self.outcome.added_images.push(image);
            }
            self.outcome.images += 1;
        }

        series.recompute_number_of_images();
        study.recompute_number_of_images();
        self.outcome.processed += 1;
    }

    fn resolve_study(&mut self, record: &ExtractedRecord) -> (Arc<Study>, bool) {
        let key = record.study_key();
        let patient = record.patient_uid.as_str();

        if let Some((last_key, last_patient, study)) = &self.last_study {
            if last_key == key && last_patient == patient {
                return (study.clone(), false);
            }
        }

        let (study, created) = match self.find_indexed(key, patient) {
            Some(study) => (study, false),
            None => {
                let now = self.now;
                let (study, created) = self.studies.find_or_insert(key, patient, || StudyInfo {
                    study_instance_uid: key.to_string(),
                    patient_uid: Some(patient.to_string()),
                    date_added: Some(now),
                    ..Default::default()
                });
                let entry = self.index.entry(key.to_string()).or_default();
                if !entry.iter().any(|s| Arc::ptr_eq(s, &study)) {
                    entry.push(study.clone());
                }
                (study, created)
            }
        };

        if self.touched.insert(Arc::as_ptr(&study)) {
            self.outcome.touched_studies.push(study.clone());
            if created {
                self.outcome.new_studies.push(study.clone());
            }
        }
        self.last_study = Some((key.to_string(), patient.to_string(), study.clone()));
        self.last_series = None;
        (study, created)
    }

    /// 在索引中查找检查；第一个候选尚无患者键时用记录的患者键补上
    fn find_indexed(&self, key: &str, patient: &str) -> Option<Arc<Study>> {
        let candidates = self.index.get(key)?;
        let first = candidates.first()?;
        let first_matches = first.update(|info| {
            if info.patient_uid.is_none() {
                info.patient_uid = Some(patient.to_string());
            }
            info.patient_uid.as_deref() == Some(patient)
        });
        if first_matches {
            return Some(first.clone());
        }
        candidates
            .iter()
            .skip(1)
            .find(|s| s.patient_uid().as_deref() == Some(patient))
            .cloned()
    }

    fn populate_study(&self, study: &Study, record: &ExtractedRecord, created: bool) {
        let overwrite = created || self.options.reread_existing;
        study.update(|info| {
            if overwrite {
                info.patient_uid = Some(record.patient_uid.clone());
                info.name = record.patient_name.clone();
                info.patient_id = record.patient_id.clone();
                info.patient_birth_date = record.patient_birth_date;
                info.patient_sex = record.patient_sex.clone();
                info.study_name = Some(record.display_study_name());
                info.modality = record.modality.clone();
                info.accession_number = record.accession_number.clone();
                info.referring_physician = record.referring_physician.clone();
                info.performing_physician = record.performing_physician.clone();
                info.institution_name = record.institution_name.clone();
                info.study_id = record.study_number.clone();
            } else {
                if is_provisional_modality(info.modality.as_deref()) {
                    if let Some(modality) = non_empty(&record.modality) {
                        info.modality = Some(modality);
                    }
                }
                if is_placeholder_name(info.study_name.as_deref()) {
                    info.study_name = Some(record.display_study_name());
                }
            }
            keep_latest_date(&mut info.date, record.study_date);
        });
    }

    fn resolve_series(&mut self, study: &Arc<Study>, record: &ExtractedRecord) -> (Arc<Series>, bool) {
        let key = record.series_key();
        if let Some((last_key, series)) = &self.last_series {
            if last_key == key {
                return (series.clone(), false);
            }
        }

        let now = self.now;
        let (series, created) = study.find_or_insert_series(key, || SeriesInfo {
            series_instance_uid: key.to_string(),
            date_added: Some(now),
            ..Default::default()
        });
        self.last_series = Some((key.to_string(), series.clone()));
        (series, created)
    }

    fn populate_series(&self, series: &Series, record: &ExtractedRecord, created: bool) {
        let overwrite = created || self.options.reread_existing;
        series.update(|info| {
            if overwrite {
                info.name = Some(non_empty(&record.series_description).unwrap_or_else(|| UNNAMED.to_string()));
                info.series_description = record.protocol_name.clone();
                info.modality = record.modality.clone();
                info.series_number = record.series_number;
                info.series_sop_class_uid = record.sop_class_uid.clone();
                info.window_level = record.window_center;
                info.window_width = record.window_width;
            } else {
                if is_provisional_modality(info.modality.as_deref()) {
                    if let Some(modality) = non_empty(&record.modality) {
                        info.modality = Some(modality);
                    }
                }
                if is_placeholder_name(info.name.as_deref()) {
                    if let Some(name) = record
                        .series_description
                        .clone()
                        .filter(|d| !is_placeholder_name(Some(d.as_str())))
                    {
                        info.name = Some(name);
                    }
                }
            }
            keep_latest_date(&mut info.date, record.series_date.or(record.study_date));
        });
    }
}

fn populate_image(info: &mut ImageInfo, record: &ExtractedRecord, frames: i32) {
    info.instance_number = record.instance_number;
    info.number_of_frames = frames;
    info.path_string = record.file_name();
    info.complete_path = Some(record.file_path.clone());
    info.date = record.series_date.or(record.study_date);
    info.modality = record.modality.clone();
    info.file_type = Some(record.file_type.clone());
    info.height = record.rows;
    info.width = record.columns;
    info.slice_location = record.slice_location;
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicomdb_core::progress::{CancellationFlag, LoggingProgress, NoopProgress};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn date(y: i32, m: u32, d: u32) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(y, m, d).and_then(|d| d.and_hms_opt(9, 30, 0))
    }

    fn record(path: &str, study: &str, series: &str, sop: &str) -> ExtractedRecord {
        let mut record = ExtractedRecord::new(path).with_patient(Some("DOE^JOHN"), Some("12345"));
        record.study_instance_uid = Some(study.to_string());
        record.series_instance_uid = Some(series.to_string());
        record.sop_instance_uid = Some(sop.to_string());
        record.study_description = Some("CHEST".to_string());
        record.series_description = Some("AXIAL".to_string());
        record.modality = Some("CT".to_string());
        record.study_date = date(2023, 4, 5);
        record.rows = 512;
        record.columns = 512;
        record
    }

    fn collecting() -> ReconcileOptions {
        ReconcileOptions {
            return_added: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_builds_hierarchy() {
        let studies = StudyCollection::new();
        let records = vec![
            record("/in/a/IM1", "1.2.3", "1.2.3.1", "1.2.3.1.1"),
            record("/in/a/IM2", "1.2.3", "1.2.3.1", "1.2.3.1.2"),
            record("/in/a/IM3", "1.2.3", "1.2.3.2", "1.2.3.2.1"),
        ];

        let outcome = reconcile(&records, &studies, &collecting(), &NoopProgress);

        assert_eq!(outcome.processed, 3);
        assert_eq!(outcome.added_images.len(), 3);
        assert_eq!(outcome.touched_studies.len(), 1);
        assert_eq!(outcome.new_studies.len(), 1);
        assert_eq!(studies.len(), 1);

        let study = &studies.snapshot()[0];
        let info = study.info();
        assert_eq!(info.patient_uid.as_deref(), Some("PATIENT_12345"));
        assert_eq!(info.name.as_deref(), Some("DOE^JOHN"));
        assert_eq!(info.study_name.as_deref(), Some("CHEST"));
        assert_eq!(info.number_of_images, 3);
        assert!(info.date_added.is_some());
        assert_eq!(study.series_count(), 2);

        let series = study.find_series("1.2.3.1").unwrap();
        assert_eq!(series.number_of_images(), 2);
        let image = series.find_image("1.2.3.1.2", 0).unwrap().info();
        assert_eq!(image.path_string.as_deref(), Some("IM2"));
        assert_eq!(image.complete_path, Some("/in/a/IM2".into()));
        assert_eq!(image.height, 512);
        assert!(Arc::ptr_eq(&series.find_image("1.2.3.1.2", 0).unwrap().series().unwrap(), &series));
    }

    #[test]
    fn test_reimport_is_idempotent() {
        let studies = StudyCollection::new();
        let records = vec![
            record("/in/IM1", "1.2.3", "1.2.3.1", "1.2.3.1.1"),
            record("/in/IM2", "1.2.3", "1.2.3.1", "1.2.3.1.2"),
        ];

        reconcile(&records, &studies, &collecting(), &NoopProgress);
        let before = studies.snapshot()[0].info();

        let outcome = reconcile(&records, &studies, &collecting(), &NoopProgress);
        assert!(outcome.new_studies.is_empty());
        // 匹配到的影像同样返回
        assert_eq!(outcome.added_images.len(), 2);
        assert_eq!(studies.len(), 1);

        let study = &studies.snapshot()[0];
        assert_eq!(study.info(), before);
        assert_eq!(study.series_count(), 1);
        assert_eq!(study.series()[0].image_count(), 2);
    }

    #[test]
    fn test_same_study_uid_different_patients() {
        let studies = StudyCollection::new();
        let a = record("/in/A", "1.2.3", "1.2.3.1", "1.2.3.1.1");
        let b = record("/in/B", "1.2.3", "1.2.3.1", "1.2.3.1.2").with_patient(Some("ROE^JANE"), Some("999"));

        let outcome = reconcile(&[a.clone(), b, a], &studies, &collecting(), &NoopProgress);

        assert_eq!(studies.len(), 2);
        assert_eq!(outcome.new_studies.len(), 2);
        assert_eq!(outcome.touched_studies.len(), 2);

        let first = studies.find("1.2.3", Some("PATIENT_12345")).unwrap();
        let second = studies.find("1.2.3", Some("PATIENT_999")).unwrap();
        assert_eq!(first.number_of_images(), 1);
        assert_eq!(second.number_of_images(), 1);
        assert_eq!(second.info().name.as_deref(), Some("ROE^JANE"));
    }

    #[test]
    fn test_unset_patient_uid_is_back_filled() {
        let studies = StudyCollection::new();
        studies.push_if_absent(Study::new(StudyInfo {
            study_instance_uid: "1.2.3".to_string(),
            ..Default::default()
        }));

        reconcile(
            &[record("/in/A", "1.2.3", "1.2.3.1", "1.2.3.1.1")],
            &studies,
            &collecting(),
            &NoopProgress,
        );

        assert_eq!(studies.len(), 1);
        assert_eq!(studies.snapshot()[0].patient_uid().as_deref(), Some("PATIENT_12345"));
    }

    #[test]
    fn test_multiframe_expansion() {
        let studies = StudyCollection::new();
        let mut multi = record("/in/MF", "1.2.3", "1.2.3.1", "1.2.3.1.1");
        multi.number_of_frames = 4;
        let mut zero = record("/in/ZERO", "1.2.3", "1.2.3.1", "1.2.3.1.2");
        zero.number_of_frames = 0;

        let outcome = reconcile(&[multi, zero], &studies, &collecting(), &NoopProgress);

        assert_eq!(outcome.added_images.len(), 5);
        let series = studies.snapshot()[0].find_series("1.2.3.1").unwrap();
        assert_eq!(series.number_of_images(), 5);
        let frames: Vec<i32> = series
            .images()
            .iter()
            .filter(|i| i.key().0 == "1.2.3.1.1")
            .map(|i| i.key().1)
            .collect();
        assert_eq!(frames, vec![0, 1, 2, 3]);
        assert!(series
            .images()
            .iter()
            .all(|i| i.complete_path().is_some()));
        assert_eq!(series.find_image("1.2.3.1.1", 3).unwrap().info().number_of_frames, 4);
        assert_eq!(series.find_image("1.2.3.1.2", 0).unwrap().info().number_of_frames, 1);
    }

    #[test]
    fn test_fallback_naming() {
        let studies = StudyCollection::new();
        let mut report = record("/in/SR", "1.2.3", "1.2.3.9", "1.2.3.9.1");
        report.modality = Some("SR".to_string());
        report.study_description = None;
        report.series_description = None;

        reconcile(&[report], &studies, &collecting(), &NoopProgress);
        let study = studies.snapshot()[0].clone();
        assert_eq!(study.info().study_name.as_deref(), Some(UNNAMED));
        assert_eq!(study.info().modality.as_deref(), Some("SR"));

        let mut image = record("/in/CT", "1.2.3", "1.2.3.1", "1.2.3.1.1");
        image.study_description = None;
        image.series_description = Some("SCOUT".to_string());
        reconcile(&[image], &studies, &collecting(), &NoopProgress);

        let info = study.info();
        assert_eq!(info.modality.as_deref(), Some("CT"));
        assert_eq!(info.study_name.as_deref(), Some("SCOUT"));

        // 已确定的模态和名称不再被覆盖
        let mut later = record("/in/MR", "1.2.3", "1.2.3.1", "1.2.3.1.2");
        later.modality = Some("MR".to_string());
        reconcile(&[later], &studies, &collecting(), &NoopProgress);
        let info = study.info();
        assert_eq!(info.modality.as_deref(), Some("CT"));
        assert_eq!(info.study_name.as_deref(), Some("SCOUT"));
    }

    #[test]
    fn test_reread_overwrites_existing_fields() {
        let studies = StudyCollection::new();
        reconcile(
            &[record("/in/IM1", "1.2.3", "1.2.3.1", "1.2.3.1.1")],
            &studies,
            &collecting(),
            &NoopProgress,
        );

        let mut changed = record("/moved/IM1", "1.2.3", "1.2.3.1", "1.2.3.1.1");
        changed.modality = Some("MR".to_string());
        changed.study_description = Some("BRAIN".to_string());

        reconcile(&[changed.clone()], &studies, &collecting(), &NoopProgress);
        let study = studies.snapshot()[0].clone();
        assert_eq!(study.info().modality.as_deref(), Some("CT"));
        let image = study.series()[0].find_image("1.2.3.1.1", 0).unwrap();
        assert_eq!(image.complete_path(), Some("/in/IM1".into()));

        let options = ReconcileOptions {
            reread_existing: true,
            ..collecting()
        };
        reconcile(&[changed], &studies, &options, &NoopProgress);
        assert_eq!(study.info().modality.as_deref(), Some("MR"));
        assert_eq!(study.info().study_name.as_deref(), Some("BRAIN"));
        assert_eq!(image.complete_path(), Some("/moved/IM1".into()));
        assert_eq!(study.number_of_images(), 1);
    }

    #[test]
    fn test_study_date_keeps_latest_plausible() {
        let studies = StudyCollection::new();
        let mut first = record("/in/IM1", "1.2.3", "1.2.3.1", "1.2.3.1.1");
        first.study_date = date(2023, 4, 5);
        let mut older = record("/in/IM2", "1.2.3", "1.2.3.1", "1.2.3.1.2");
        older.study_date = date(2020, 1, 1);
        let mut bogus = record("/in/IM3", "1.2.3", "1.2.3.1", "1.2.3.1.3");
        bogus.study_date = date(1900, 1, 1);
        let mut newer = record("/in/IM4", "1.2.3", "1.2.3.1", "1.2.3.1.4");
        newer.study_date = date(2024, 2, 2);

        reconcile(&[first, older, bogus], &studies, &collecting(), &NoopProgress);
        let study = studies.snapshot()[0].clone();
        assert_eq!(study.info().date, date(2023, 4, 5));

        reconcile(&[newer], &studies, &collecting(), &NoopProgress);
        assert_eq!(study.info().date, date(2024, 2, 2));
    }

    #[test]
    fn test_missing_uids_use_placeholders() {
        let studies = StudyCollection::new();
        let mut bare = record("/in/IM1", "x", "y", "1.9.9");
        bare.study_instance_uid = None;
        bare.series_instance_uid = None;
        bare.series_dicom_uid = Some("1.9.8".to_string());
        let mut no_sop = record("/in/IM2", "1.2.3", "1.2.3.1", "z");
        no_sop.sop_instance_uid = None;

        let outcome = reconcile(&[bare, no_sop], &studies, &collecting(), &NoopProgress);

        assert_eq!(outcome.processed, 1);
        assert_eq!(outcome.skipped, 1);
        let study = studies.snapshot()[0].clone();
        assert_eq!(study.study_instance_uid(), "noStudyID");
        assert!(study.find_series("1.9.8").is_some());
    }

    #[test]
    fn test_counts_are_consistent() {
        let studies = StudyCollection::new();
        let mut records = Vec::new();
        for series in 1..=3 {
            for image in 1..=series {
                let mut r = record(
                    &format!("/in/{}-{}", series, image),
                    "1.2.3",
                    &format!("1.2.3.{}", series),
                    &format!("1.2.3.{}.{}", series, image),
                );
                r.number_of_frames = 2;
                records.push(r);
            }
        }

        reconcile(&records, &studies, &ReconcileOptions::default(), &NoopProgress);

        for study in studies.snapshot() {
            let sum: i64 = study.series().iter().map(|s| s.number_of_images()).sum();
            assert_eq!(study.number_of_images(), sum);
            for series in study.series() {
                assert_eq!(series.number_of_images(), series.image_count() as i64);
            }
        }
        assert_eq!(studies.snapshot()[0].number_of_images(), 12);
    }

    #[test]
    fn test_concurrent_passes_keep_counts_consistent() {
        let studies = StudyCollection::new();
        let batches: Vec<Vec<ExtractedRecord>> = (0..8)
            .map(|worker| {
                (0..40)
                    .map(|n| {
                        let series = if n % 4 == 0 { "1.2.3.2" } else { "1.2.3.1" };
                        record(
                            &format!("/in/{}/{}", worker, n),
                            "1.2.3",
                            series,
                            &format!("{}.{}.{}", series, worker, n),
                        )
                    })
                    .collect()
            })
            .collect();

        std::thread::scope(|scope| {
            for batch in &batches {
                let studies = &studies;
                scope.spawn(move || {
                    reconcile(batch, studies, &ReconcileOptions::default(), &NoopProgress);
                });
            }
        });

        assert_eq!(studies.len(), 1);
        let study = &studies.snapshot()[0];
        assert_eq!(study.series_count(), 2);
        for series in study.series() {
            assert_eq!(series.number_of_images(), series.image_count() as i64);
        }
        assert_eq!(study.find_series("1.2.3.1").unwrap().number_of_images(), 240);
        assert_eq!(study.find_series("1.2.3.2").unwrap().number_of_images(), 80);
        assert_eq!(study.number_of_images(), 320);
    }

    #[test]
    fn test_not_collecting_returns_no_images() {
        let studies = StudyCollection::new();
        let outcome = reconcile(
            &[record("/in/IM1", "1.2.3", "1.2.3.1", "1.2.3.1.1")],
            &studies,
            &ReconcileOptions::default(),
            &NoopProgress,
        );
        assert!(outcome.added_images.is_empty());
        assert_eq!(outcome.images, 1);
        assert_eq!(outcome.touched_studies.len(), 1);
    }

    /// 处理完指定数量的记录后请求取消
    struct CancelAfter {
        calls: AtomicUsize,
        limit: usize,
    }

    impl ProgressReporter for CancelAfter {
        fn set_status(&self, _status: &str) {}

        fn set_progress(&self, _progress: f64) {}

        fn is_cancelled(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst) >= self.limit
        }
    }

    #[test]
    fn test_cancellation_keeps_merged_work() {
        let studies = StudyCollection::new();
        let records: Vec<_> = (1..=5)
            .map(|i| record(&format!("/in/IM{}", i), "1.2.3", "1.2.3.1", &format!("1.2.3.1.{}", i)))
            .collect();
        let progress = CancelAfter {
            calls: AtomicUsize::new(0),
            limit: 2,
        };

        let outcome = reconcile(&records, &studies, &collecting(), &progress);

        assert!(outcome.cancelled);
        assert_eq!(outcome.processed, 2);
        assert_eq!(studies.snapshot()[0].number_of_images(), 2);
    }

    #[test]
    fn test_cancelled_flag_before_start() {
        let flag = CancellationFlag::new();
        flag.cancel();
        let studies = StudyCollection::new();
        let outcome = reconcile(
            &[record("/in/IM1", "1.2.3", "1.2.3.1", "1.2.3.1.1")],
            &studies,
            &collecting(),
            &LoggingProgress::new(flag),
        );
        assert!(outcome.cancelled);
        assert!(studies.is_empty());
    }
}
