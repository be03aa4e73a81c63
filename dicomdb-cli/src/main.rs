//! dicomdb 命令行程序

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use dicomdb_core::{CancellationFlag, CatalogConfig, LoggingProgress, ProgressReporter};
use dicomdb_import::{import_incoming, CatalogDatabase, DatabaseRegistry, ImportOptions};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// dicomdb 命令行参数
#[derive(Parser, Debug)]
#[command(name = "dicomdb")]
#[command(about = "DICOM 影像目录：导入、浏览和删除检查")]
struct Args {
    /// 配置文件路径
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// 目录根目录，覆盖配置中的 storage.base_dir
    #[arg(short, long, global = true)]
    base_dir: Option<PathBuf>,

    /// 日志级别，覆盖配置中的 logging.level
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 导入文件或目录
    Import {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// 已有对象也用文件重新填充
        #[arg(long)]
        reread: bool,
        /// 只导入DICOM文件
        #[arg(long)]
        dicom_only: bool,
        /// 复制到受管存储
        #[arg(long)]
        copy: bool,
    },
    /// 导入 INCOMING 目录
    Incoming,
    /// 列出所有检查
    List,
    /// 显示检查及其序列 (JSON)
    Show {
        study_uid: String,
        #[arg(long)]
        patient_uid: Option<String>,
    },
    /// 删除检查
    Delete {
        study_uid: String,
        #[arg(long)]
        patient_uid: Option<String>,
    },
    /// 列出相册
    Albums,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = CatalogConfig::load(args.config.as_deref()).context("加载配置失败")?;

    // 初始化日志
    let log_level = args.log_level.clone().unwrap_or_else(|| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_level.as_str()).init();

    let base_dir = args
        .base_dir
        .clone()
        .unwrap_or_else(|| config.storage.base_dir.clone());

    let registry = DatabaseRegistry::new();
    let db = registry
        .open(&base_dir, &config)
        .await
        .with_context(|| format!("无法打开目录 {}", base_dir.display()))?;

    let result = run(args.command, &db, &config).await;
    registry.close_all().await.context("保存目录失败")?;
    result
}

async fn run(command: Command, db: &CatalogDatabase, config: &CatalogConfig) -> anyhow::Result<()> {
    match command {
        Command::Import {
            paths,
            reread,
            dicom_only,
            copy,
        } => {
            let options = ImportOptions {
                reread_existing: reread,
                dicom_only: dicom_only || config.import.dicom_only,
                copy_into_storage: copy || config.storage.copy_into_storage,
                ..ImportOptions::from_config(config)
            };
            db.import_paths(&paths, options, cancellable_progress())
                .await
                .context("导入失败")?;
            println!("{} studies in catalog", db.studies().len());
        }
        Command::Incoming => {
            let imported = import_incoming(db, cancellable_progress())
                .await
                .context("INCOMING 导入失败")?;
            println!("{} files imported from INCOMING", imported);
        }
        Command::List => {
            for study in db.studies() {
                let info = study.info();
                println!(
                    "{}\t{}\t{}\t{}\t{}\t{}",
                    info.study_instance_uid,
                    info.patient_uid.unwrap_or_default(),
                    info.name.unwrap_or_default(),
                    info.study_name.unwrap_or_default(),
                    info.modality.unwrap_or_default(),
                    info.number_of_images
                );
            }
        }
        Command::Show {
            study_uid,
            patient_uid,
        } => {
            let study = db
                .find_study(&study_uid, patient_uid.as_deref())
                .ok_or_else(|| anyhow!("未找到检查 {}", study_uid))?;
            let series = db.load_series_if_needed(&study).await?;
            let value = serde_json::json!({
                "study": study.info(),
                "series": series.iter().map(|s| s.info()).collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Command::Delete {
            study_uid,
            patient_uid,
        } => {
            let study = db
                .find_study(&study_uid, patient_uid.as_deref())
                .ok_or_else(|| anyhow!("未找到检查 {}", study_uid))?;
            db.delete_study(&study).await.context("删除检查失败")?;
            info!("Deleted study {}", study_uid);
        }
        Command::Albums => {
            for album in db.albums() {
                println!(
                    "{}\t{}\t{}",
                    album.name,
                    album.predicate.clone().unwrap_or_default(),
                    album.number_of_studies()
                );
            }
        }
    }
    Ok(())
}

/// Ctrl-C 时设置取消标志的进度报告
fn cancellable_progress() -> Arc<dyn ProgressReporter> {
    let cancel = CancellationFlag::new();
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到中断信号，正在取消...");
            flag.cancel();
        }
    });
    Arc::new(LoggingProgress::new(cancel))
}
