//! SQLite persistence for users, courses, form styles, tasks and results.
//!
//! One connection behind an async mutex; structured columns (sub-field
//! lists, slot lists, cached geometry) are stored as JSON text.

mod courses;
mod results;
mod tasks;
mod users;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

pub use results::GeometryEntry;
pub use tasks::TaskSnapshot;

pub struct Store {
    db: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = Connection::open(path)?;
        let store = Self {
            db: Arc::new(Mutex::new(db)),
        };
        store.create_schema()?;
        Ok(store)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()?;
        let store = Self {
            db: Arc::new(Mutex::new(db)),
        };
        store.create_schema()?;
        Ok(store)
    }

    fn create_schema(&self) -> Result<()> {
        let db = self.db.try_lock().expect("no concurrent access during init");
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                token TEXT NOT NULL UNIQUE,
                login TEXT UNIQUE,
                password TEXT,
                active INTEGER NOT NULL DEFAULT 1,
                grade INTEGER,
                first_name TEXT,
                last_name TEXT,
                course_ids TEXT NOT NULL DEFAULT '[]'
            );
            CREATE TABLE IF NOT EXISTS courses (
                id TEXT PRIMARY KEY,
                course_code TEXT NOT NULL UNIQUE,
                teacher_name TEXT NOT NULL DEFAULT '',
                known_slots TEXT NOT NULL DEFAULT '[]',
                has_attendance_form INTEGER NOT NULL DEFAULT 1,
                form_url TEXT,
                form_config_id TEXT,
                configuration_locked INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS form_styles (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                is_default INTEGER NOT NULL DEFAULT 0,
                thumbnail_id TEXT,
                sub_fields TEXT NOT NULL DEFAULT '[]'
            );
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                owner TEXT,
                argument TEXT,
                logical_day TEXT NOT NULL,
                next_run_at TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                is_running INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS fill_results (
                id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                status TEXT NOT NULL,
                course_id TEXT,
                time_logged TEXT NOT NULL,
                form_screenshot_id TEXT,
                confirm_screenshot_id TEXT,
                is_test INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS logged_errors (
                id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                kind TEXT NOT NULL,
                message TEXT NOT NULL DEFAULT '',
                time_logged TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS screenshots (
                id TEXT PRIMARY KEY,
                data BLOB NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS geometry_cache (
                url TEXT PRIMARY KEY,
                requested_by TEXT,
                geometry TEXT,
                auth_required INTEGER,
                screenshot_id TEXT,
                error TEXT,
                requested_at TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    pub(crate) fn db(&self) -> &Arc<Mutex<Connection>> {
        &self.db
    }
}

pub(crate) fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339()
}

pub(crate) fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .map_err(|e| anyhow::anyhow!("bad timestamp '{}': {}", s, e))?
        .with_timezone(&Utc))
}
