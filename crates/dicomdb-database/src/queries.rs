//! 数据库查询操作
//!
//! 写操作接收 `&mut SqliteConnection`，既可以在连接池连接上执行，
//! 也可以在事务内 (`&mut *tx`) 组合执行。

use crate::models::*;
use dicomdb_core::models::{Album, ImageInfo, SeriesInfo, StudyInfo};
use dicomdb_core::{CatalogError, Result};
use sqlx::{SqliteConnection, SqlitePool};

fn db_err(e: sqlx::Error) -> CatalogError {
    CatalogError::Database(e.to_string())
}

const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS study (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        study_instance_uid TEXT NOT NULL,
        patient_uid TEXT NOT NULL DEFAULT '',
        name TEXT,
        patient_id TEXT,
        patient_birth_date TEXT,
        patient_sex TEXT,
        study_name TEXT,
        modality TEXT,
        date TEXT,
        date_added TEXT,
        number_of_images INTEGER NOT NULL DEFAULT 0,
        comment TEXT,
        accession_number TEXT,
        referring_physician TEXT,
        performing_physician TEXT,
        institution_name TEXT,
        study_id TEXT,
        UNIQUE (study_instance_uid, patient_uid)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS series (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        study_id INTEGER NOT NULL REFERENCES study(id) ON DELETE CASCADE,
        series_instance_uid TEXT NOT NULL,
        name TEXT,
        series_description TEXT,
        modality TEXT,
        date TEXT,
        date_added TEXT,
        number_of_images INTEGER NOT NULL DEFAULT 0,
        series_number INTEGER NOT NULL DEFAULT 0,
        series_sop_class_uid TEXT,
        window_level REAL,
        window_width REAL,
        UNIQUE (study_id, series_instance_uid)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS image (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        series_id INTEGER NOT NULL REFERENCES series(id) ON DELETE CASCADE,
        sop_instance_uid TEXT NOT NULL,
        frame_id INTEGER NOT NULL DEFAULT 0,
        path_string TEXT,
        complete_path TEXT,
        instance_number INTEGER NOT NULL DEFAULT 0,
        number_of_frames INTEGER NOT NULL DEFAULT 1,
        date TEXT,
        modality TEXT,
        file_type TEXT,
        height INTEGER NOT NULL DEFAULT 0,
        width INTEGER NOT NULL DEFAULT 0,
        slice_location REAL NOT NULL DEFAULT 0,
        UNIQUE (series_id, sop_instance_uid, frame_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS album (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        smart_album INTEGER NOT NULL DEFAULT 0,
        predicate TEXT,
        date_added TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS album_study (
        album_id INTEGER NOT NULL REFERENCES album(id) ON DELETE CASCADE,
        study_id INTEGER NOT NULL REFERENCES study(id) ON DELETE CASCADE,
        PRIMARY KEY (album_id, study_id)
    )
    "#,
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_study_study_instance_uid ON study(study_instance_uid)",
    "CREATE INDEX IF NOT EXISTS idx_study_date ON study(date)",
    "CREATE INDEX IF NOT EXISTS idx_series_study_id ON series(study_id)",
    "CREATE INDEX IF NOT EXISTS idx_image_series_id ON image(series_id)",
    "CREATE INDEX IF NOT EXISTS idx_album_study_study_id ON album_study(study_id)",
];

/// 创建数据库表和索引
pub async fn create_tables(conn: &mut SqliteConnection) -> Result<()> {
    for table_sql in TABLES {
        sqlx::query(table_sql)
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;
    }
    for index_sql in INDEXES {
        sqlx::query(index_sql)
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;
    }
    tracing::debug!("Database schema ready");
    Ok(())
}

// ========== 写操作 ==========

/// 写入检查；已有行ID时按ID更新，否则按 (检查UID, 患者键) 插入或更新
pub async fn upsert_study(conn: &mut SqliteConnection, study: &StudyInfo) -> Result<i64> {
    let patient_uid = study.patient_uid.clone().unwrap_or_default();

    if let Some(id) = study.id {
        let result = sqlx::query(
            r#"
            UPDATE study SET
                study_instance_uid = ?, patient_uid = ?, name = ?, patient_id = ?,
                patient_birth_date = ?, patient_sex = ?, study_name = ?, modality = ?,
                date = ?, date_added = ?, number_of_images = ?, comment = ?,
                accession_number = ?, referring_physician = ?, performing_physician = ?,
                institution_name = ?, study_id = ?
            WHERE id = ?
            "#,
        )
        .bind(&study.study_instance_uid)
        .bind(&patient_uid)
        .bind(&study.name)
        .bind(&study.patient_id)
        .bind(study.patient_birth_date)
        .bind(&study.patient_sex)
        .bind(&study.study_name)
        .bind(&study.modality)
        .bind(study.date)
        .bind(study.date_added)
        .bind(study.number_of_images)
        .bind(&study.comment)
        .bind(&study.accession_number)
        .bind(&study.referring_physician)
        .bind(&study.performing_physician)
        .bind(&study.institution_name)
        .bind(&study.study_id)
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
        if result.rows_affected() > 0 {
            return Ok(id);
        }
    }

    sqlx::query_scalar(
        r#"
        INSERT INTO study (
            study_instance_uid, patient_uid, name, patient_id, patient_birth_date,
            patient_sex, study_name, modality, date, date_added, number_of_images,
            comment, accession_number, referring_physician, performing_physician,
            institution_name, study_id
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (study_instance_uid, patient_uid) DO UPDATE SET
            name = excluded.name,
            patient_id = excluded.patient_id,
            patient_birth_date = excluded.patient_birth_date,
            patient_sex = excluded.patient_sex,
            study_name = excluded.study_name,
            modality = excluded.modality,
            date = excluded.date,
            date_added = COALESCE(study.date_added, excluded.date_added),
            number_of_images = excluded.number_of_images,
            comment = excluded.comment,
            accession_number = excluded.accession_number,
            referring_physician = excluded.referring_physician,
            performing_physician = excluded.performing_physician,
            institution_name = excluded.institution_name,
            study_id = excluded.study_id
        RETURNING id
        "#,
    )
    .bind(&study.study_instance_uid)
    .bind(&patient_uid)
    .bind(&study.name)
    .bind(&study.patient_id)
    .bind(study.patient_birth_date)
    .bind(&study.patient_sex)
    .bind(&study.study_name)
    .bind(&study.modality)
    .bind(study.date)
    .bind(study.date_added)
    .bind(study.number_of_images)
    .bind(&study.comment)
    .bind(&study.accession_number)
    .bind(&study.referring_physician)
    .bind(&study.performing_physician)
    .bind(&study.institution_name)
    .bind(&study.study_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(db_err)
}

/// 写入序列；已有行ID时按ID更新，否则按 (检查ID, 序列UID) 插入或更新
pub async fn upsert_series(
    conn: &mut SqliteConnection,
    series: &SeriesInfo,
    study_id: i64,
) -> Result<i64> {
    if let Some(id) = series.id {
        let result = sqlx::query(
            r#"
            UPDATE series SET
                study_id = ?, series_instance_uid = ?, name = ?, series_description = ?,
                modality = ?, date = ?, date_added = ?, number_of_images = ?,
                series_number = ?, series_sop_class_uid = ?, window_level = ?, window_width = ?
            WHERE id = ?
            "#,
        )
        .bind(study_id)
        .bind(&series.series_instance_uid)
        .bind(&series.name)
        .bind(&series.series_description)
        .bind(&series.modality)
        .bind(series.date)
        .bind(series.date_added)
        .bind(series.number_of_images)
        .bind(series.series_number)
        .bind(&series.series_sop_class_uid)
        .bind(series.window_level)
        .bind(series.window_width)
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
        if result.rows_affected() > 0 {
            return Ok(id);
        }
    }

    sqlx::query_scalar(
        r#"
        INSERT INTO series (
            study_id, series_instance_uid, name, series_description, modality, date,
            date_added, number_of_images, series_number, series_sop_class_uid,
            window_level, window_width
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (study_id, series_instance_uid) DO UPDATE SET
            name = excluded.name,
            series_description = excluded.series_description,
            modality = excluded.modality,
            date = excluded.date,
            date_added = COALESCE(series.date_added, excluded.date_added),
            number_of_images = excluded.number_of_images,
            series_number = excluded.series_number,
            series_sop_class_uid = excluded.series_sop_class_uid,
            window_level = excluded.window_level,
            window_width = excluded.window_width
        RETURNING id
        "#,
    )
    .bind(study_id)
    .bind(&series.series_instance_uid)
    .bind(&series.name)
    .bind(&series.series_description)
    .bind(&series.modality)
    .bind(series.date)
    .bind(series.date_added)
    .bind(series.number_of_images)
    .bind(series.series_number)
    .bind(&series.series_sop_class_uid)
    .bind(series.window_level)
    .bind(series.window_width)
    .fetch_one(&mut *conn)
    .await
    .map_err(db_err)
}

/// 写入影像；已有行ID时按ID更新，否则按 (序列ID, SOP实例UID, 帧号) 插入或更新
pub async fn upsert_image(
    conn: &mut SqliteConnection,
    image: &ImageInfo,
    series_id: i64,
) -> Result<i64> {
    let complete_path = image
        .complete_path
        .as_ref()
        .map(|p| p.to_string_lossy().into_owned());

    if let Some(id) = image.id {
        let result = sqlx::query(
            r#"
            UPDATE image SET
                series_id = ?, sop_instance_uid = ?, frame_id = ?, path_string = ?,
                complete_path = ?, instance_number = ?, number_of_frames = ?, date = ?,
                modality = ?, file_type = ?, height = ?, width = ?, slice_location = ?
            WHERE id = ?
            "#,
        )
        .bind(series_id)
        .bind(&image.sop_instance_uid)
        .bind(image.frame_id)
        .bind(&image.path_string)
        .bind(&complete_path)
        .bind(image.instance_number)
        .bind(image.number_of_frames)
        .bind(image.date)
        .bind(&image.modality)
        .bind(&image.file_type)
        .bind(image.height)
        .bind(image.width)
        .bind(image.slice_location)
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
        if result.rows_affected() > 0 {
            return Ok(id);
        }
    }

    sqlx::query_scalar(
        r#"
        INSERT INTO image (
            series_id, sop_instance_uid, frame_id, path_string, complete_path,
            instance_number, number_of_frames, date, modality, file_type,
            height, width, slice_location
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (series_id, sop_instance_uid, frame_id) DO UPDATE SET
            path_string = excluded.path_string,
            complete_path = excluded.complete_path,
            instance_number = excluded.instance_number,
            number_of_frames = excluded.number_of_frames,
            date = excluded.date,
            modality = excluded.modality,
            file_type = excluded.file_type,
            height = excluded.height,
            width = excluded.width,
            slice_location = excluded.slice_location
        RETURNING id
        "#,
    )
    .bind(series_id)
    .bind(&image.sop_instance_uid)
    .bind(image.frame_id)
    .bind(&image.path_string)
    .bind(&complete_path)
    .bind(image.instance_number)
    .bind(image.number_of_frames)
    .bind(image.date)
    .bind(&image.modality)
    .bind(&image.file_type)
    .bind(image.height)
    .bind(image.width)
    .bind(image.slice_location)
    .fetch_one(&mut *conn)
    .await
    .map_err(db_err)
}

/// 删除检查及其序列和影像，返回删除的影像行数
pub async fn delete_study(conn: &mut SqliteConnection, study_id: i64) -> Result<u64> {
    let images = sqlx::query(
        "DELETE FROM image WHERE series_id IN (SELECT id FROM series WHERE study_id = ?)",
    )
    .bind(study_id)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?
    .rows_affected();

    sqlx::query("DELETE FROM series WHERE study_id = ?")
        .bind(study_id)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;

    sqlx::query("DELETE FROM album_study WHERE study_id = ?")
        .bind(study_id)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;

    sqlx::query("DELETE FROM study WHERE id = ?")
        .bind(study_id)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;

    Ok(images)
}

/// 删除序列及其影像，返回删除的影像行数
pub async fn delete_series(conn: &mut SqliteConnection, series_id: i64) -> Result<u64> {
    let images = sqlx::query("DELETE FROM image WHERE series_id = ?")
        .bind(series_id)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?
        .rows_affected();

    sqlx::query("DELETE FROM series WHERE id = ?")
        .bind(series_id)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;

    Ok(images)
}

/// 更新检查的影像计数
pub async fn update_study_count(
    conn: &mut SqliteConnection,
    study_id: i64,
    number_of_images: i64,
) -> Result<()> {
    sqlx::query("UPDATE study SET number_of_images = ? WHERE id = ?")
        .bind(number_of_images)
        .bind(study_id)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    Ok(())
}

/// 写入相册，按名称插入或更新
pub async fn upsert_album(conn: &mut SqliteConnection, album: &Album) -> Result<i64> {
    sqlx::query_scalar(
        r#"
        INSERT INTO album (name, smart_album, predicate, date_added)
        VALUES (?, ?, ?, ?)
        ON CONFLICT (name) DO UPDATE SET
            smart_album = excluded.smart_album,
            predicate = excluded.predicate
        RETURNING id
        "#,
    )
    .bind(&album.name)
    .bind(album.smart_album)
    .bind(&album.predicate)
    .bind(album.date_added)
    .fetch_one(&mut *conn)
    .await
    .map_err(db_err)
}

pub async fn add_album_study(
    conn: &mut SqliteConnection,
    album_id: i64,
    study_id: i64,
) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO album_study (album_id, study_id) VALUES (?, ?)")
        .bind(album_id)
        .bind(study_id)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    Ok(())
}

// ========== 读操作 ==========

/// 数据库读取操作接口
pub struct DatabaseQueries<'a> {
    pool: &'a SqlitePool,
}

impl<'a> DatabaseQueries<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// 所有检查 (不含序列)
    pub async fn list_studies(&self) -> Result<Vec<StudyInfo>> {
        let rows = sqlx::query_as::<_, DbStudy>("SELECT * FROM study ORDER BY id")
            .fetch_all(self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.into_iter().map(StudyInfo::from).collect())
    }

    /// 检查的所有序列 (不含影像)
    pub async fn list_series(&self, study_id: i64) -> Result<Vec<SeriesInfo>> {
        let rows = sqlx::query_as::<_, DbSeries>(
            "SELECT * FROM series WHERE study_id = ? ORDER BY series_number, id",
        )
        .bind(study_id)
        .fetch_all(self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(SeriesInfo::from).collect())
    }

    /// 序列的所有影像
    pub async fn list_images(&self, series_id: i64) -> Result<Vec<ImageInfo>> {
        let rows = sqlx::query_as::<_, DbImage>(
            "SELECT * FROM image WHERE series_id = ? ORDER BY instance_number, frame_id, id",
        )
        .bind(series_id)
        .fetch_all(self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(ImageInfo::from).collect())
    }

    /// 检查下所有影像的文件路径
    pub async fn image_paths_for_study(&self, study_id: i64) -> Result<Vec<String>> {
        sqlx::query_scalar(
            r#"
            SELECT DISTINCT image.complete_path FROM image
            JOIN series ON series.id = image.series_id
            WHERE series.study_id = ? AND image.complete_path IS NOT NULL
            "#,
        )
        .bind(study_id)
        .fetch_all(self.pool)
        .await
        .map_err(db_err)
    }

    /// 序列下所有影像的文件路径
    pub async fn image_paths_for_series(&self, series_id: i64) -> Result<Vec<String>> {
        sqlx::query_scalar(
            "SELECT DISTINCT complete_path FROM image WHERE series_id = ? AND complete_path IS NOT NULL",
        )
        .bind(series_id)
        .fetch_all(self.pool)
        .await
        .map_err(db_err)
    }

    /// 所有相册及其关联检查
    pub async fn list_albums(&self) -> Result<Vec<Album>> {
        let rows = sqlx::query_as::<_, DbAlbum>("SELECT * FROM album ORDER BY id")
            .fetch_all(self.pool)
            .await
            .map_err(db_err)?;

        let mut albums = Vec::with_capacity(rows.len());
        for row in rows {
            let study_ids: Vec<i64> = sqlx::query_scalar(
                "SELECT study_id FROM album_study WHERE album_id = ? ORDER BY study_id",
            )
            .bind(row.id)
            .fetch_all(self.pool)
            .await
            .map_err(db_err)?;
            albums.push(row.into_album(study_ids));
        }
        Ok(albums)
    }

    pub async fn count_rows(&self, table: Table) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", table.name());
        sqlx::query_scalar(&sql)
            .fetch_one(self.pool)
            .await
            .map_err(db_err)
    }
}

/// 实体表
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Study,
    Series,
    Image,
    Album,
    AlbumStudy,
}

impl Table {
    pub fn name(&self) -> &'static str {
        match self {
            Table::Study => "study",
            Table::Series => "series",
            Table::Image => "image",
            Table::Album => "album",
            Table::AlbumStudy => "album_study",
        }
    }
}
