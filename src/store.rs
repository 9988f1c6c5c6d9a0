//! SQLite persistence for app configs, prediction logs and image uploads

use crate::types::{
    AppType, DevicePreference, Feedback, ImageUpload, MlApp, NewImageUpload, NewMlApp,
    NewPredictionLog, PredictionLog,
};
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS ml_apps (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    app_type TEXT NOT NULL,
    device_type TEXT NOT NULL DEFAULT 'auto',
    classes TEXT NOT NULL DEFAULT '[]',
    batch_size INTEGER NOT NULL DEFAULT 1 CHECK (batch_size >= 1),
    use_mixed_precision INTEGER NOT NULL DEFAULT 0,
    model_optimization TEXT NOT NULL DEFAULT '{}',
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS prediction_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ml_app_id INTEGER NOT NULL REFERENCES ml_apps(id) ON DELETE CASCADE,
    input_data TEXT NOT NULL,
    output_data TEXT NOT NULL,
    confidence REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
    processing_time REAL NOT NULL CHECK (processing_time >= 0.0),
    feedback TEXT CHECK (feedback IS NULL OR feedback IN ('correct', 'incorrect')),
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_prediction_logs_app_created
    ON prediction_logs (ml_app_id, created_at);

CREATE TABLE IF NOT EXISTS image_uploads (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    prediction_log_id INTEGER NOT NULL UNIQUE REFERENCES prediction_logs(id) ON DELETE CASCADE,
    file_path TEXT NOT NULL,
    width INTEGER NOT NULL,
    height INTEGER NOT NULL,
    file_size INTEGER NOT NULL,
    created_at TEXT NOT NULL
);
";

const APP_COLUMNS: &str = "id, name, description, app_type, device_type, classes, batch_size, \
     use_mixed_precision, model_optimization, is_active, created_at, updated_at";

const LOG_QUERY: &str = "
SELECT l.id, l.ml_app_id, a.name, l.input_data, l.output_data, l.confidence,
       l.processing_time, l.feedback, l.created_at,
       u.id, u.file_path, u.width, u.height, u.file_size, u.created_at
FROM prediction_logs l
JOIN ml_apps a ON a.id = l.ml_app_id
LEFT JOIN image_uploads u ON u.prediction_log_id = l.id";

/// Result of a feedback submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackUpdate {
    Updated,
    /// Feedback is write-once
    AlreadySet(Feedback),
    NotFound,
}

/// SQLite-backed store shared by the request handlers
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if needed) the database at `path`; `:memory:` opens a
    /// private in-memory database.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path == Path::new(":memory:") {
            return Self::open_in_memory();
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys=ON;",
        )
        .context("Failed to set database pragmas")?;
        info!(path = %path.display(), "Database opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .context("Failed to set database pragmas")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))
    }

    /// Create tables and indexes that do not exist yet
    pub fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(SCHEMA)
            .context("Failed to apply database schema")
    }

    /// Insert a validated app config and return it as stored
    pub fn insert_app(&self, app: &NewMlApp) -> Result<MlApp> {
        app.validate()
            .with_context(|| format!("Invalid app config '{}'", app.name))?;

        let now = Utc::now();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO ml_apps (name, description, app_type, device_type, classes, batch_size,
                                  use_mixed_precision, model_optimization, is_active,
                                  created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
            params![
                app.name,
                app.description,
                app.app_type.as_str(),
                app.device_type.as_str(),
                serde_json::to_string(&app.classes)?,
                app.batch_size as i64,
                app.use_mixed_precision,
                app.model_optimization.to_string(),
                app.is_active,
                timestamp(now),
            ],
        )
        .with_context(|| format!("Failed to insert app config '{}'", app.name))?;

        let id = conn.last_insert_rowid();
        debug!(app_id = id, name = %app.name, "App config inserted");

        Ok(MlApp {
            id,
            name: app.name.clone(),
            description: app.description.clone(),
            app_type: app.app_type,
            device_type: app.device_type,
            classes: app.classes.clone(),
            batch_size: app.batch_size,
            use_mixed_precision: app.use_mixed_precision,
            model_optimization: app.model_optimization.clone(),
            is_active: app.is_active,
            created_at: now,
            updated_at: now,
        })
    }

    /// Delete every app config; their logs and uploads cascade
    pub fn clear_apps(&self) -> Result<usize> {
        let removed = self
            .conn()?
            .execute("DELETE FROM ml_apps", [])
            .context("Failed to clear app configs")?;
        Ok(removed)
    }

    pub fn count_apps(&self) -> Result<u64> {
        count(&*self.conn()?, "SELECT COUNT(*) FROM ml_apps")
    }

    /// Active app configs ordered by id
    pub fn list_active_apps(&self) -> Result<Vec<MlApp>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {APP_COLUMNS} FROM ml_apps WHERE is_active = 1 ORDER BY id"
        ))?;
        let apps = stmt
            .query_map([], app_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list app configs")?;
        Ok(apps)
    }

    /// An active app config by id
    pub fn get_active_app(&self, id: i64) -> Result<Option<MlApp>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {APP_COLUMNS} FROM ml_apps WHERE id = ?1 AND is_active = 1"),
            params![id],
            app_from_row,
        )
        .optional()
        .with_context(|| format!("Failed to load app config {id}"))
    }

    /// Write one prediction log and, when given, its image upload record in
    /// a single transaction. Returns the new log id.
    pub fn record_prediction(
        &self,
        log: &NewPredictionLog,
        upload: Option<&NewImageUpload>,
    ) -> Result<i64> {
        self.record_predictions(&[(log, upload)])?
            .into_iter()
            .next()
            .context("No prediction log written")
    }

    /// Write several logs with their uploads; either all rows land or none do.
    /// Returns the log ids in input order.
    pub fn record_predictions(
        &self,
        entries: &[(&NewPredictionLog, Option<&NewImageUpload>)],
    ) -> Result<Vec<i64>> {
        for (log, _) in entries {
            log.validate().context("Invalid prediction log")?;
        }

        let now = timestamp(Utc::now());
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .context("Failed to start prediction log transaction")?;

        let mut ids = Vec::with_capacity(entries.len());
        for (log, upload) in entries {
            tx.execute(
                "INSERT INTO prediction_logs (ml_app_id, input_data, output_data, confidence,
                                              processing_time, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    log.ml_app_id,
                    serde_json::to_string(&log.input)?,
                    serde_json::to_string(&log.output)?,
                    log.output.confidence as f64,
                    log.processing_time,
                    now,
                ],
            )
            .context("Failed to insert prediction log")?;
            let log_id = tx.last_insert_rowid();

            if let Some(upload) = upload {
                tx.execute(
                    "INSERT INTO image_uploads (prediction_log_id, file_path, width, height,
                                                file_size, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        log_id,
                        upload.file_path,
                        upload.width,
                        upload.height,
                        upload.file_size as i64,
                        now,
                    ],
                )
                .context("Failed to insert image upload")?;
            }
            ids.push(log_id);
        }

        tx.commit()
            .context("Failed to commit prediction log transaction")?;
        Ok(ids)
    }

    /// Prediction logs newest first, optionally for a single app
    pub fn list_logs(&self, ml_app: Option<i64>) -> Result<Vec<PredictionLog>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{LOG_QUERY}
             WHERE (?1 IS NULL OR l.ml_app_id = ?1)
             ORDER BY l.created_at DESC, l.id DESC"
        ))?;
        let logs = stmt
            .query_map(params![ml_app], log_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list prediction logs")?;
        Ok(logs)
    }

    pub fn get_log(&self, id: i64) -> Result<Option<PredictionLog>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("{LOG_QUERY} WHERE l.id = ?1"),
            params![id],
            log_from_row,
        )
        .optional()
        .with_context(|| format!("Failed to load prediction log {id}"))
    }

    /// Record feedback on a log unless feedback was already given
    pub fn set_feedback(&self, log_id: i64, feedback: Feedback) -> Result<FeedbackUpdate> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE prediction_logs SET feedback = ?1 WHERE id = ?2 AND feedback IS NULL",
                params![feedback.as_str(), log_id],
            )
            .context("Failed to record feedback")?;
        if updated == 1 {
            return Ok(FeedbackUpdate::Updated);
        }

        let existing: Option<Option<String>> = conn
            .query_row(
                "SELECT feedback FROM prediction_logs WHERE id = ?1",
                params![log_id],
                |row| row.get(0),
            )
            .optional()?;

        Ok(match existing {
            None => FeedbackUpdate::NotFound,
            Some(value) => {
                let current = value
                    .as_deref()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(feedback);
                FeedbackUpdate::AlreadySet(current)
            }
        })
    }

    pub fn count_logs(&self) -> Result<u64> {
        count(&*self.conn()?, "SELECT COUNT(*) FROM prediction_logs")
    }

    pub fn count_uploads(&self) -> Result<u64> {
        count(&*self.conn()?, "SELECT COUNT(*) FROM image_uploads")
    }
}

fn count(conn: &Connection, sql: &str) -> Result<u64> {
    let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
    Ok(n as u64)
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn parsed_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: String| conversion_error(idx, std::io::Error::other(e)))
}

fn app_from_row(row: &Row<'_>) -> rusqlite::Result<MlApp> {
    let app_type: AppType = parsed_column(row, 3)?;
    let device_type: DevicePreference = parsed_column(row, 4)?;
    let batch_size: i64 = row.get(6)?;
    Ok(MlApp {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        app_type,
        device_type,
        classes: json_column(row, 5)?,
        batch_size: batch_size.max(1) as usize,
        use_mixed_precision: row.get(7)?,
        model_optimization: json_column(row, 8)?,
        is_active: row.get(9)?,
        created_at: time_column(row, 10)?,
        updated_at: time_column(row, 11)?,
    })
}

fn log_from_row(row: &Row<'_>) -> rusqlite::Result<PredictionLog> {
    let feedback: Option<String> = row.get(7)?;
    let feedback = match feedback {
        Some(raw) => Some(
            raw.parse::<Feedback>()
                .map_err(|e| conversion_error(7, std::io::Error::other(e)))?,
        ),
        None => None,
    };

    let upload_id: Option<i64> = row.get(9)?;
    let log_id: i64 = row.get(0)?;
    let image = match upload_id {
        Some(id) => {
            let file_size: i64 = row.get(13)?;
            Some(ImageUpload {
                id,
                prediction_log_id: log_id,
                file_path: row.get(10)?,
                width: row.get(11)?,
                height: row.get(12)?,
                file_size: file_size as u64,
                created_at: time_column(row, 14)?,
            })
        }
        None => None,
    };

    let confidence: f64 = row.get(5)?;
    Ok(PredictionLog {
        id: log_id,
        ml_app: row.get(1)?,
        ml_app_name: row.get(2)?,
        input_data: json_column(row, 3)?,
        output_data: json_column(row, 4)?,
        confidence: confidence as f32,
        processing_time: row.get(6)?,
        feedback,
        image,
        created_at: time_column(row, 8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InputMetadata, PredictionOutput};
    use std::collections::BTreeMap;

    fn store() -> Store {
        let store = Store::open_in_memory().unwrap();
        store.migrate().unwrap();
        store
    }

    fn new_log(ml_app_id: i64, class: &str, confidence: f32) -> NewPredictionLog {
        NewPredictionLog {
            ml_app_id,
            input: InputMetadata {
                filename: format!("{class}.jpg"),
                size: 1024,
                format: "jpeg".to_string(),
            },
            output: PredictionOutput {
                predicted_class: class.to_string(),
                confidence,
                class_probabilities: BTreeMap::from([(class.to_string(), confidence)]),
                device: "cpu".to_string(),
                error: None,
            },
            processing_time: 0.01,
        }
    }

    fn upload() -> NewImageUpload {
        NewImageUpload {
            file_path: "2026/01/02/abc.jpg".to_string(),
            width: 224,
            height: 224,
            file_size: 1024,
        }
    }

    #[test]
    fn test_insert_and_list_active_apps() {
        let store = store();
        let mut inactive = NewMlApp::image_classification("Hidden", &["a"]);
        inactive.is_active = false;

        let visible = store
            .insert_app(&NewMlApp::image_classification("Pets", &["cat", "dog"]))
            .unwrap();
        let hidden = store.insert_app(&inactive).unwrap();

        let apps = store.list_active_apps().unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].name, "Pets");
        assert_eq!(apps[0].classes, vec!["cat", "dog"]);
        assert_eq!(apps[0].model_optimization, serde_json::json!({}));

        assert!(store.get_active_app(visible.id).unwrap().is_some());
        assert!(store.get_active_app(hidden.id).unwrap().is_none());
        assert!(store.get_active_app(999).unwrap().is_none());
        assert_eq!(store.count_apps().unwrap(), 2);
    }

    #[test]
    fn test_insert_rejects_invalid_app() {
        let store = store();
        let app = NewMlApp::image_classification("No classes", &[]);
        assert!(store.insert_app(&app).is_err());
        assert_eq!(store.count_apps().unwrap(), 0);
    }

    #[test]
    fn test_record_prediction_with_upload() {
        let store = store();
        let app = store
            .insert_app(&NewMlApp::image_classification("Pets", &["cat", "dog"]))
            .unwrap();

        let id = store
            .record_prediction(&new_log(app.id, "cat", 0.8), Some(&upload()))
            .unwrap();

        assert_eq!(store.count_logs().unwrap(), 1);
        assert_eq!(store.count_uploads().unwrap(), 1);

        let log = store.get_log(id).unwrap().unwrap();
        assert_eq!(log.ml_app, app.id);
        assert_eq!(log.ml_app_name, "Pets");
        assert_eq!(log.output_data.predicted_class, "cat");
        assert!((log.confidence - 0.8).abs() < 1e-6);
        assert_eq!(log.image.unwrap().width, 224);
        assert!(log.feedback.is_none());
    }

    #[test]
    fn test_record_predictions_is_all_or_nothing() {
        let store = store();
        let app = store
            .insert_app(&NewMlApp::image_classification("Pets", &["cat", "dog"]))
            .unwrap();

        let good = new_log(app.id, "cat", 0.8);
        let orphan = new_log(app.id + 100, "dog", 0.6);
        let upload = upload();
        let result =
            store.record_predictions(&[(&good, Some(&upload)), (&orphan, Some(&upload))]);
        assert!(result.is_err());
        assert_eq!(store.count_logs().unwrap(), 0);
        assert_eq!(store.count_uploads().unwrap(), 0);

        let other = new_log(app.id, "dog", 0.6);
        let ids = store
            .record_predictions(&[(&good, Some(&upload)), (&other, None)])
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids[0] < ids[1]);
        assert_eq!(store.count_logs().unwrap(), 2);
        assert_eq!(store.count_uploads().unwrap(), 1);
    }

    #[test]
    fn test_database_rejects_out_of_range_confidence() {
        let store = store();
        let app = store
            .insert_app(&NewMlApp::image_classification("Pets", &["cat"]))
            .unwrap();
        assert!(store.record_prediction(&new_log(app.id, "cat", 1.5), None).is_err());

        // bypass validation to hit the CHECK constraint
        let conn = store.conn().unwrap();
        let result = conn.execute(
            "INSERT INTO prediction_logs (ml_app_id, input_data, output_data, confidence,
                                          processing_time, created_at)
             VALUES (?1, '{}', '{}', 2.0, 0.1, 'now')",
            params![app.id],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_logs_newest_first_and_filtered() {
        let store = store();
        let a = store
            .insert_app(&NewMlApp::image_classification("A", &["x"]))
            .unwrap();
        let b = store
            .insert_app(&NewMlApp::image_classification("B", &["y"]))
            .unwrap();

        let first = store.record_prediction(&new_log(a.id, "x", 0.5), None).unwrap();
        let second = store.record_prediction(&new_log(b.id, "y", 0.6), None).unwrap();
        let third = store.record_prediction(&new_log(a.id, "x", 0.7), None).unwrap();

        let all: Vec<i64> = store.list_logs(None).unwrap().iter().map(|l| l.id).collect();
        assert_eq!(all, vec![third, second, first]);

        let only_a: Vec<i64> = store
            .list_logs(Some(a.id))
            .unwrap()
            .iter()
            .map(|l| l.id)
            .collect();
        assert_eq!(only_a, vec![third, first]);
    }

    #[test]
    fn test_feedback_is_write_once() {
        let store = store();
        let app = store
            .insert_app(&NewMlApp::image_classification("Pets", &["cat"]))
            .unwrap();
        let id = store.record_prediction(&new_log(app.id, "cat", 0.9), None).unwrap();

        assert_eq!(
            store.set_feedback(id, Feedback::Correct).unwrap(),
            FeedbackUpdate::Updated
        );
        assert_eq!(
            store.set_feedback(id, Feedback::Incorrect).unwrap(),
            FeedbackUpdate::AlreadySet(Feedback::Correct)
        );
        assert_eq!(
            store.set_feedback(404, Feedback::Correct).unwrap(),
            FeedbackUpdate::NotFound
        );
        assert_eq!(
            store.get_log(id).unwrap().unwrap().feedback,
            Some(Feedback::Correct)
        );
    }

    #[test]
    fn test_clear_apps_cascades() {
        let store = store();
        let app = store
            .insert_app(&NewMlApp::image_classification("Pets", &["cat"]))
            .unwrap();
        store
            .record_prediction(&new_log(app.id, "cat", 0.9), Some(&upload()))
            .unwrap();

        assert_eq!(store.clear_apps().unwrap(), 1);
        assert_eq!(store.count_logs().unwrap(), 0);
        assert_eq!(store.count_uploads().unwrap(), 0);
    }

    #[test]
    fn test_open_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("apps.sqlite3");
        let store = Store::open(&path).unwrap();
        store.migrate().unwrap();
        store.migrate().unwrap();
        assert!(path.exists());
    }
}
