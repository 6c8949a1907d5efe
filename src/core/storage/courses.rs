use anyhow::Result;
use rusqlite::{Row, params};

use super::Store;
use crate::core::types::{Course, FormStyle, SubField, User};

const COURSE_COLUMNS: &str = "id, course_code, teacher_name, known_slots, has_attendance_form, \
                              form_url, form_config_id, configuration_locked";

fn course_from_row(row: &Row<'_>) -> rusqlite::Result<(Course, String)> {
    let slots_json: String = row.get(3)?;
    Ok((
        Course {
            id: row.get(0)?,
            course_code: row.get(1)?,
            teacher_name: row.get(2)?,
            known_slots: Vec::new(),
            has_attendance_form: row.get::<_, i64>(4)? != 0,
            form_url: row.get(5)?,
            form_config_id: row.get(6)?,
            configuration_locked: row.get::<_, i64>(7)? != 0,
        },
        slots_json,
    ))
}

fn finish_course(pair: (Course, String)) -> Course {
    let (mut course, json) = pair;
    course.known_slots = serde_json::from_str(&json).unwrap_or_default();
    course
}

impl Store {
    pub async fn course_by_code(&self, code: &str) -> Result<Option<Course>> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM courses WHERE course_code = ?1",
            COURSE_COLUMNS
        ))?;
        let mut rows = stmt.query_map([code], course_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(finish_course(row?))),
            None => Ok(None),
        }
    }

    pub async fn course_by_id(&self, id: &str) -> Result<Option<Course>> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM courses WHERE id = ?1",
            COURSE_COLUMNS
        ))?;
        let mut rows = stmt.query_map([id], course_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(finish_course(row?))),
            None => Ok(None),
        }
    }

    /// Insert the course if it is new, otherwise backfill the teacher name
    /// and merge the observed slot. Returns the stored course.
    pub async fn upsert_course(
        &self,
        course_code: &str,
        teacher_name: &str,
        slot: Option<&str>,
    ) -> Result<Course> {
        let existing = self.course_by_code(course_code).await?;
        let mut course = match existing {
            Some(course) => course,
            None => {
                let course = Course {
                    id: uuid::Uuid::new_v4().to_string(),
                    course_code: course_code.to_string(),
                    teacher_name: teacher_name.to_string(),
                    known_slots: Vec::new(),
                    has_attendance_form: true,
                    form_url: None,
                    form_config_id: None,
                    configuration_locked: false,
                };
                let db = self.db().lock().await;
                db.execute(
                    "INSERT INTO courses (id, course_code, teacher_name) VALUES (?1, ?2, ?3)",
                    params![course.id, course.course_code, course.teacher_name],
                )?;
                course
            }
        };

        let mut dirty = false;
        if course.teacher_name.is_empty() && !teacher_name.is_empty() {
            course.teacher_name = teacher_name.to_string();
            dirty = true;
        }
        if let Some(slot) = slot {
            if !course.known_slots.iter().any(|s| s == slot) {
                course.known_slots.push(slot.to_string());
                dirty = true;
            }
        }
        if dirty {
            let slots = serde_json::to_string(&course.known_slots)?;
            let db = self.db().lock().await;
            db.execute(
                "UPDATE courses SET teacher_name = ?1, known_slots = ?2 WHERE id = ?3",
                params![course.teacher_name, slots, course.id],
            )?;
        }
        Ok(course)
    }

    /// Link (or unlink) a course's attendance form. Locked courses are only
    /// mutable by admins; the caller enforces that.
    pub async fn set_course_form(
        &self,
        id: &str,
        has_attendance_form: bool,
        form_url: Option<&str>,
        form_config_id: Option<&str>,
    ) -> Result<()> {
        let db = self.db().lock().await;
        db.execute(
            "UPDATE courses SET has_attendance_form = ?1, form_url = ?2, form_config_id = ?3
             WHERE id = ?4",
            params![has_attendance_form as i64, form_url, form_config_id, id],
        )?;
        Ok(())
    }

    pub async fn set_course_locked(&self, id: &str, locked: bool) -> Result<()> {
        let db = self.db().lock().await;
        db.execute(
            "UPDATE courses SET configuration_locked = ?1 WHERE id = ?2",
            params![locked as i64, id],
        )?;
        Ok(())
    }

    pub async fn courses_for_user(&self, user: &User) -> Result<Vec<Course>> {
        let mut courses = Vec::new();
        for id in &user.course_ids {
            if let Some(course) = self.course_by_id(id).await? {
                courses.push(course);
            }
        }
        Ok(courses)
    }

    // --- form styles ---

    pub async fn insert_form_style(&self, style: &FormStyle) -> Result<()> {
        let sub_fields = serde_json::to_string(&style.sub_fields)?;
        let db = self.db().lock().await;
        db.execute(
            "INSERT OR REPLACE INTO form_styles (id, name, is_default, thumbnail_id, sub_fields)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                style.id,
                style.name,
                style.is_default as i64,
                style.thumbnail_id,
                sub_fields
            ],
        )?;
        Ok(())
    }

    pub async fn form_style(&self, id: &str) -> Result<Option<FormStyle>> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(
            "SELECT id, name, is_default, thumbnail_id, sub_fields FROM form_styles WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map([id], style_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub async fn all_form_styles(&self) -> Result<Vec<FormStyle>> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(
            "SELECT id, name, is_default, thumbnail_id, sub_fields FROM form_styles ORDER BY name",
        )?;
        let rows = stmt.query_map([], style_from_row)?;
        let mut styles = Vec::new();
        for row in rows {
            styles.push(row?);
        }
        Ok(styles)
    }
}

fn style_from_row(row: &Row<'_>) -> rusqlite::Result<FormStyle> {
    let sub_fields_json: String = row.get(4)?;
    let sub_fields: Vec<SubField> = serde_json::from_str(&sub_fields_json).unwrap_or_default();
    Ok(FormStyle {
        id: row.get(0)?,
        name: row.get(1)?,
        is_default: row.get::<_, i64>(2)? != 0,
        thumbnail_id: row.get(3)?,
        sub_fields,
    })
}
