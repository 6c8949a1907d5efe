use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Row, params};
use serde::Serialize;

use super::{Store, format_time, parse_time};
use crate::core::types::{Task, TaskKind};

const TASK_COLUMNS: &str =
    "id, kind, owner, argument, logical_day, next_run_at, retry_count, is_running";

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<(String, Task)> {
    let kind_str: String = row.get(1)?;
    let logical_day: String = row.get(4)?;
    let next_run_at: String = row.get(5)?;
    Ok((
        next_run_at.clone(),
        Task {
            id: row.get(0)?,
            kind: TaskKind::parse(&kind_str).unwrap_or(TaskKind::DailyFill),
            owner: row.get(2)?,
            argument: row.get(3)?,
            logical_day: logical_day.parse().unwrap_or_default(),
            next_run_at: Utc::now(), // replaced below, row access can't fail here
            retry_count: row.get::<_, i64>(6)? as u32,
            is_running: row.get::<_, i64>(7)? != 0,
        },
    ))
}

fn finish_task(pair: (String, Task)) -> Result<Task> {
    let (next_run_at, mut task) = pair;
    task.next_run_at = parse_time(&next_run_at)?;
    Ok(task)
}

/// Read-only row for the admin debug listing.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub kind: String,
    pub owner: Option<String>,
    pub is_running: bool,
    pub retry_count: u32,
    pub next_run_at: String,
}

impl Store {
    /// Create a task unless a non-terminal one already exists for the same
    /// (owner, kind, logical day) — the dedup invariant. Returns the task id
    /// of whichever task ends up standing.
    pub async fn create_task(
        &self,
        kind: TaskKind,
        owner: Option<&str>,
        argument: Option<&str>,
        logical_day: NaiveDate,
        next_run_at: DateTime<Utc>,
    ) -> Result<(String, bool)> {
        let db = self.db().lock().await;
        // Under the one connection lock, the check-then-insert is atomic.
        let existing: Option<String> = {
            let mut stmt = db.prepare(
                "SELECT id FROM tasks WHERE kind = ?1 AND owner IS ?2 AND logical_day = ?3",
            )?;
            let mut rows = stmt.query_map(
                params![kind.as_str(), owner, logical_day.to_string()],
                |row| row.get(0),
            )?;
            match rows.next() {
                Some(row) => Some(row?),
                None => None,
            }
        };
        if let Some(id) = existing {
            return Ok((id, false));
        }
        let id = uuid::Uuid::new_v4().to_string();
        db.execute(
            "INSERT INTO tasks (id, kind, owner, argument, logical_day, next_run_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                kind.as_str(),
                owner,
                argument,
                logical_day.to_string(),
                format_time(next_run_at)
            ],
        )?;
        Ok((id, true))
    }

    /// Earliest not-running task, if any. The scheduler sleeps until its
    /// `next_run_at` before claiming it.
    pub async fn next_pending_task(&self) -> Result<Option<Task>> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM tasks WHERE is_running = 0 ORDER BY next_run_at ASC LIMIT 1",
            TASK_COLUMNS
        ))?;
        let mut rows = stmt.query_map([], task_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(finish_task(row?)?)),
            None => Ok(None),
        }
    }

    /// Atomically mark a task running. Returns false when another worker won
    /// the claim (or the task disappeared); the affected-row count is the
    /// whole mechanism, no external locking.
    pub async fn claim_task(&self, id: &str) -> Result<bool> {
        let db = self.db().lock().await;
        let changed = db.execute(
            "UPDATE tasks SET is_running = 1 WHERE id = ?1 AND is_running = 0",
            [id],
        )?;
        Ok(changed == 1)
    }

    /// Requeue a task for a later run, releasing the running flag.
    pub async fn reschedule_task(
        &self,
        id: &str,
        next_run_at: DateTime<Utc>,
        retry_count: u32,
        logical_day: NaiveDate,
    ) -> Result<()> {
        let db = self.db().lock().await;
        db.execute(
            "UPDATE tasks SET next_run_at = ?1, retry_count = ?2, logical_day = ?3, is_running = 0
             WHERE id = ?4",
            params![
                format_time(next_run_at),
                retry_count as i64,
                logical_day.to_string(),
                id
            ],
        )?;
        Ok(())
    }

    pub async fn delete_task(&self, id: &str) -> Result<()> {
        let db = self.db().lock().await;
        db.execute("DELETE FROM tasks WHERE id = ?1", [id])?;
        Ok(())
    }

    pub async fn delete_tasks_for_owner(&self, owner: &str, kind: TaskKind) -> Result<usize> {
        let db = self.db().lock().await;
        let deleted = db.execute(
            "DELETE FROM tasks WHERE owner = ?1 AND kind = ?2 AND is_running = 0",
            params![owner, kind.as_str()],
        )?;
        Ok(deleted)
    }

    /// Clear running flags left over from a previous process, returning the
    /// interrupted tasks so they can be reported.
    pub async fn reset_interrupted_tasks(&self) -> Result<Vec<Task>> {
        let db = self.db().lock().await;
        let mut interrupted = Vec::new();
        {
            let mut stmt = db.prepare(&format!(
                "SELECT {} FROM tasks WHERE is_running = 1",
                TASK_COLUMNS
            ))?;
            let rows = stmt.query_map([], task_from_row)?;
            for row in rows {
                interrupted.push(finish_task(row?)?);
            }
        }
        db.execute("UPDATE tasks SET is_running = 0 WHERE is_running = 1", [])?;
        Ok(interrupted)
    }

    /// Push back every eligible daily-fill task scheduled inside the window
    /// by one day. Used when the day check discovers there is no school.
    pub async fn postpone_daily_fills(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<usize> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM tasks WHERE kind = ?1 AND is_running = 0
             AND next_run_at >= ?2 AND next_run_at < ?3",
            TASK_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![
                TaskKind::DailyFill.as_str(),
                format_time(window_start),
                format_time(window_end)
            ],
            task_from_row,
        )?;
        let mut to_move = Vec::new();
        for row in rows {
            to_move.push(finish_task(row?)?);
        }
        drop(stmt);
        for task in &to_move {
            db.execute(
                "UPDATE tasks SET next_run_at = ?1, logical_day = ?2 WHERE id = ?3",
                params![
                    format_time(task.next_run_at + chrono::Duration::days(1)),
                    (task.logical_day + chrono::Duration::days(1)).to_string(),
                    task.id
                ],
            )?;
        }
        Ok(to_move.len())
    }

    /// Immutable snapshot of all tasks for the admin debug listing.
    pub async fn task_snapshots(&self) -> Result<Vec<TaskSnapshot>> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(
            "SELECT kind, owner, is_running, retry_count, next_run_at FROM tasks
             ORDER BY is_running DESC, retry_count DESC, next_run_at ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(TaskSnapshot {
                kind: row.get(0)?,
                owner: row.get(1)?,
                is_running: row.get::<_, i64>(2)? != 0,
                retry_count: row.get::<_, i64>(3)? as u32,
                next_run_at: row.get(4)?,
            })
        })?;
        let mut snapshots = Vec::new();
        for row in rows {
            snapshots.push(row?);
        }
        Ok(snapshots)
    }
}
