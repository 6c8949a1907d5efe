use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};

use super::{Store, format_time, parse_time};
use crate::core::geometry::FormGeometry;
use crate::core::types::{ErrorKind, FillResult, FillStatus, LoggedError};

const RESULT_COLUMNS: &str =
    "id, status, course_id, time_logged, form_screenshot_id, confirm_screenshot_id, is_test";

fn result_from_row(row: &Row<'_>) -> rusqlite::Result<(String, FillResult)> {
    let status: String = row.get(1)?;
    let time_logged: String = row.get(3)?;
    Ok((
        time_logged,
        FillResult {
            id: row.get(0)?,
            status: FillStatus::parse(&status).unwrap_or(FillStatus::Failure),
            course_id: row.get(2)?,
            time_logged: Utc::now(),
            form_screenshot_id: row.get(4)?,
            confirm_screenshot_id: row.get(5)?,
            is_test: row.get::<_, i64>(6)? != 0,
        },
    ))
}

fn finish_result(pair: (String, FillResult)) -> Result<FillResult> {
    let (time_logged, mut result) = pair;
    result.time_logged = parse_time(&time_logged)?;
    Ok(result)
}

/// One cached geometry probe. `geometry` and `error` are both `None` while
/// the probe is still in flight.
#[derive(Debug, Clone)]
pub struct GeometryEntry {
    pub url: String,
    pub requested_by: Option<String>,
    pub geometry: Option<FormGeometry>,
    pub screenshot_id: Option<String>,
    pub error: Option<String>,
    pub requested_at: DateTime<Utc>,
}

impl GeometryEntry {
    pub fn is_pending(&self) -> bool {
        self.geometry.is_none() && self.error.is_none()
    }
}

impl Store {
    /// Record a fill outcome, replacing the previous result of the same
    /// class (live or test) for the owner. Screenshots referenced only by
    /// the replaced result are deleted with it.
    pub async fn set_fill_result(&self, owner: &str, result: &FillResult) -> Result<()> {
        let db = self.db().lock().await;
        let old: Vec<(Option<String>, Option<String>)> = {
            let mut stmt = db.prepare(
                "SELECT form_screenshot_id, confirm_screenshot_id FROM fill_results
                 WHERE owner = ?1 AND is_test = ?2",
            )?;
            let rows = stmt.query_map(params![owner, result.is_test as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        for (form, confirm) in old {
            for shot in [form, confirm].into_iter().flatten() {
                db.execute("DELETE FROM screenshots WHERE id = ?1", [shot])?;
            }
        }
        db.execute(
            "DELETE FROM fill_results WHERE owner = ?1 AND is_test = ?2",
            params![owner, result.is_test as i64],
        )?;
        db.execute(
            "INSERT INTO fill_results
             (id, owner, status, course_id, time_logged, form_screenshot_id,
              confirm_screenshot_id, is_test)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                result.id,
                owner,
                result.status.as_str(),
                result.course_id,
                format_time(result.time_logged),
                result.form_screenshot_id,
                result.confirm_screenshot_id,
                result.is_test as i64
            ],
        )?;
        Ok(())
    }

    pub async fn fill_result(&self, owner: &str, is_test: bool) -> Result<Option<FillResult>> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM fill_results WHERE owner = ?1 AND is_test = ?2",
            RESULT_COLUMNS
        ))?;
        let mut rows = stmt.query_map(params![owner, is_test as i64], result_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(finish_result(row?)?)),
            None => Ok(None),
        }
    }

    /// Drop test results older than the cutoff, together with their
    /// screenshots. Returns the owners whose results were pruned.
    pub async fn prune_test_results(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let db = self.db().lock().await;
        let stale: Vec<(String, String, Option<String>, Option<String>)> = {
            let mut stmt = db.prepare(
                "SELECT id, owner, form_screenshot_id, confirm_screenshot_id
                 FROM fill_results WHERE is_test = 1 AND time_logged < ?1",
            )?;
            let rows = stmt.query_map([format_time(cutoff)], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        let mut owners = Vec::new();
        for (id, owner, form, confirm) in stale {
            for shot in [form, confirm].into_iter().flatten() {
                db.execute("DELETE FROM screenshots WHERE id = ?1", [shot])?;
            }
            db.execute("DELETE FROM fill_results WHERE id = ?1", [id])?;
            owners.push(owner);
        }
        Ok(owners)
    }

    /// Remove one owner's test result and its screenshots, if any.
    pub async fn delete_test_result(&self, owner: &str) -> Result<bool> {
        let db = self.db().lock().await;
        let shots: Option<(Option<String>, Option<String>)> = db
            .query_row(
                "SELECT form_screenshot_id, confirm_screenshot_id FROM fill_results
                 WHERE owner = ?1 AND is_test = 1",
                [owner],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((form, confirm)) = shots else {
            return Ok(false);
        };
        for shot in [form, confirm].into_iter().flatten() {
            db.execute("DELETE FROM screenshots WHERE id = ?1", [shot])?;
        }
        db.execute(
            "DELETE FROM fill_results WHERE owner = ?1 AND is_test = 1",
            [owner],
        )?;
        Ok(true)
    }

    pub async fn insert_screenshot(&self, data: &[u8]) -> Result<String> {
        let db = self.db().lock().await;
        let id = uuid::Uuid::new_v4().to_string();
        db.execute(
            "INSERT INTO screenshots (id, data, created_at) VALUES (?1, ?2, ?3)",
            params![id, data, format_time(Utc::now())],
        )?;
        Ok(id)
    }

    pub async fn screenshot(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let db = self.db().lock().await;
        Ok(db
            .query_row("SELECT data FROM screenshots WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()?)
    }

    pub async fn delete_screenshot(&self, id: &str) -> Result<()> {
        let db = self.db().lock().await;
        db.execute("DELETE FROM screenshots WHERE id = ?1", [id])?;
        Ok(())
    }

    pub async fn log_error(&self, owner: &str, kind: ErrorKind, message: &str) -> Result<String> {
        let db = self.db().lock().await;
        let id = uuid::Uuid::new_v4().to_string();
        db.execute(
            "INSERT INTO logged_errors (id, owner, kind, message, time_logged)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, owner, kind.as_str(), message, format_time(Utc::now())],
        )?;
        Ok(id)
    }

    pub async fn errors_for(&self, owner: &str) -> Result<Vec<LoggedError>> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(
            "SELECT id, owner, kind, message, time_logged FROM logged_errors
             WHERE owner = ?1 ORDER BY time_logged DESC",
        )?;
        let rows = stmt.query_map([owner], |row| {
            let kind: String = row.get(2)?;
            let time_logged: String = row.get(4)?;
            Ok((
                time_logged,
                LoggedError {
                    id: row.get(0)?,
                    owner: row.get(1)?,
                    kind: ErrorKind::parse(&kind).unwrap_or(ErrorKind::Internal),
                    message: row.get(3)?,
                    time_logged: Utc::now(),
                },
            ))
        })?;
        let mut errors = Vec::new();
        for row in rows {
            let (time_logged, mut error) = row?;
            error.time_logged = parse_time(&time_logged)?;
            errors.push(error);
        }
        Ok(errors)
    }

    /// Dismiss one logged error. Owner-scoped so a user cannot clear another
    /// user's log by guessing ids.
    pub async fn delete_error(&self, owner: &str, id: &str) -> Result<bool> {
        let db = self.db().lock().await;
        let deleted = db.execute(
            "DELETE FROM logged_errors WHERE id = ?1 AND owner = ?2",
            params![id, owner],
        )?;
        Ok(deleted == 1)
    }

    /// Reserve a geometry-cache slot for a URL about to be probed. Returns
    /// false when an entry (pending or resolved) already exists.
    pub async fn geometry_begin(&self, url: &str, requested_by: Option<&str>) -> Result<bool> {
        let db = self.db().lock().await;
        let inserted = db.execute(
            "INSERT OR IGNORE INTO geometry_cache (url, requested_by, requested_at)
             VALUES (?1, ?2, ?3)",
            params![url, requested_by, format_time(Utc::now())],
        )?;
        Ok(inserted == 1)
    }

    pub async fn geometry_fulfill(
        &self,
        url: &str,
        geometry: &FormGeometry,
        screenshot_id: Option<&str>,
    ) -> Result<()> {
        let db = self.db().lock().await;
        db.execute(
            "UPDATE geometry_cache
             SET geometry = ?1, auth_required = ?2, screenshot_id = ?3, error = NULL
             WHERE url = ?4",
            params![
                serde_json::to_string(&geometry.fields)?,
                geometry.auth_required as i64,
                screenshot_id,
                url
            ],
        )?;
        Ok(())
    }

    pub async fn geometry_fail(&self, url: &str, error: &str) -> Result<()> {
        let db = self.db().lock().await;
        db.execute(
            "UPDATE geometry_cache SET error = ?1 WHERE url = ?2",
            params![error, url],
        )?;
        Ok(())
    }

    pub async fn geometry_entry(&self, url: &str) -> Result<Option<GeometryEntry>> {
        let db = self.db().lock().await;
        let row = db
            .query_row(
                "SELECT url, requested_by, geometry, auth_required, screenshot_id, error,
                        requested_at
                 FROM geometry_cache WHERE url = ?1",
                [url],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?;
        let Some((url, requested_by, fields, auth_required, screenshot_id, error, requested_at)) =
            row
        else {
            return Ok(None);
        };
        let geometry = match fields {
            Some(json) => Some(FormGeometry {
                auth_required: auth_required.unwrap_or(0) != 0,
                fields: serde_json::from_str(&json)?,
            }),
            None => None,
        };
        Ok(Some(GeometryEntry {
            url,
            requested_by,
            geometry,
            screenshot_id,
            error,
            requested_at: parse_time(&requested_at)?,
        }))
    }

    /// Drop cache entries older than the cutoff, with their screenshots.
    pub async fn geometry_prune(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let db = self.db().lock().await;
        let stale: Vec<(String, Option<String>)> = {
            let mut stmt = db.prepare(
                "SELECT url, screenshot_id FROM geometry_cache WHERE requested_at < ?1",
            )?;
            let rows = stmt.query_map([format_time(cutoff)], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        let count = stale.len();
        for (url, shot) in stale {
            if let Some(shot) = shot {
                db.execute("DELETE FROM screenshots WHERE id = ?1", [shot])?;
            }
            db.execute("DELETE FROM geometry_cache WHERE url = ?1", [url])?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::geometry::GeometryField;
    use crate::core::types::FieldKind;

    fn result(status: FillStatus, is_test: bool) -> FillResult {
        FillResult {
            id: uuid::Uuid::new_v4().to_string(),
            status,
            course_id: None,
            time_logged: Utc::now(),
            form_screenshot_id: None,
            confirm_screenshot_id: None,
            is_test,
        }
    }

    #[tokio::test]
    async fn new_result_replaces_old_and_drops_its_screenshots() {
        let store = Store::open_in_memory().unwrap();
        let shot = store.insert_screenshot(b"png bytes").await.unwrap();
        let mut first = result(FillStatus::Success, false);
        first.form_screenshot_id = Some(shot.clone());
        store.set_fill_result("u1", &first).await.unwrap();

        let second = result(FillStatus::Failure, false);
        store.set_fill_result("u1", &second).await.unwrap();

        let current = store.fill_result("u1", false).await.unwrap().unwrap();
        assert_eq!(current.id, second.id);
        assert_eq!(current.status, FillStatus::Failure);
        assert!(store.screenshot(&shot).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_and_live_results_are_independent() {
        let store = Store::open_in_memory().unwrap();
        store
            .set_fill_result("u1", &result(FillStatus::Success, false))
            .await
            .unwrap();
        store
            .set_fill_result("u1", &result(FillStatus::PossibleFailure, true))
            .await
            .unwrap();
        let live = store.fill_result("u1", false).await.unwrap().unwrap();
        let test = store.fill_result("u1", true).await.unwrap().unwrap();
        assert_eq!(live.status, FillStatus::Success);
        assert_eq!(test.status, FillStatus::PossibleFailure);
    }

    #[tokio::test]
    async fn prune_removes_only_stale_test_results() {
        let store = Store::open_in_memory().unwrap();
        let mut stale = result(FillStatus::Success, true);
        stale.time_logged = Utc::now() - chrono::Duration::hours(7);
        store.set_fill_result("u1", &stale).await.unwrap();
        store
            .set_fill_result("u2", &result(FillStatus::Success, true))
            .await
            .unwrap();
        store
            .set_fill_result("u3", &result(FillStatus::Success, false))
            .await
            .unwrap();

        let owners = store
            .prune_test_results(Utc::now() - chrono::Duration::hours(6))
            .await
            .unwrap();
        assert_eq!(owners, vec!["u1".to_string()]);
        assert!(store.fill_result("u1", true).await.unwrap().is_none());
        assert!(store.fill_result("u2", true).await.unwrap().is_some());
        assert!(store.fill_result("u3", false).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn error_delete_is_owner_scoped() {
        let store = Store::open_in_memory().unwrap();
        let id = store
            .log_error("u1", ErrorKind::Login, "wrong password")
            .await
            .unwrap();
        assert!(!store.delete_error("u2", &id).await.unwrap());
        assert!(store.delete_error("u1", &id).await.unwrap());
        assert!(store.errors_for("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn geometry_cache_lifecycle() {
        let store = Store::open_in_memory().unwrap();
        let url = "https://forms.example/abc";
        assert!(store.geometry_begin(url, Some("u1")).await.unwrap());
        // second probe request for the same url is refused
        assert!(!store.geometry_begin(url, Some("u2")).await.unwrap());

        let entry = store.geometry_entry(url).await.unwrap().unwrap();
        assert!(entry.is_pending());

        let geometry = FormGeometry {
            auth_required: true,
            fields: vec![GeometryField {
                index: 0,
                title: "Your name".into(),
                kind: FieldKind::Text,
            }],
        };
        store.geometry_fulfill(url, &geometry, None).await.unwrap();
        let entry = store.geometry_entry(url).await.unwrap().unwrap();
        assert!(!entry.is_pending());
        let cached = entry.geometry.unwrap();
        assert!(cached.auth_required);
        assert_eq!(cached.fields.len(), 1);
    }

    #[tokio::test]
    async fn geometry_prune_drops_stale_entries() {
        let store = Store::open_in_memory().unwrap();
        store
            .geometry_begin("https://forms.example/old", None)
            .await
            .unwrap();
        // backdate it past the cutoff
        {
            let db = store.db().lock().await;
            db.execute(
                "UPDATE geometry_cache SET requested_at = ?1",
                [format_time(Utc::now() - chrono::Duration::minutes(30))],
            )
            .unwrap();
        }
        let pruned = store
            .geometry_prune(Utc::now() - chrono::Duration::minutes(15))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        assert!(
            store
                .geometry_entry("https://forms.example/old")
                .await
                .unwrap()
                .is_none()
        );
    }
}
