use anyhow::Result;
use rusqlite::{Row, params};

use super::Store;
use crate::core::types::User;

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<(User, String)> {
    let course_ids_json: String = row.get(8)?;
    Ok((
        User {
            id: row.get(0)?,
            token: row.get(1)?,
            login: row.get(2)?,
            password_ciphertext: row.get(3)?,
            active: row.get::<_, i64>(4)? != 0,
            grade: row.get(5)?,
            first_name: row.get(6)?,
            last_name: row.get(7)?,
            course_ids: Vec::new(),
        },
        course_ids_json,
    ))
}

fn finish_user(pair: (User, String)) -> User {
    let (mut user, json) = pair;
    user.course_ids = serde_json::from_str(&json).unwrap_or_default();
    user
}

const USER_COLUMNS: &str =
    "id, token, login, password, active, grade, first_name, last_name, course_ids";

impl Store {
    /// Create a new user, returning its access token.
    pub async fn create_user(&self) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let token = {
            // 64 hex chars, matching the token length the API has always used
            let bytes: [u8; 32] = rand::random();
            bytes.iter().map(|b| format!("{:02x}", b)).collect::<String>()
        };
        let db = self.db().lock().await;
        db.execute(
            "INSERT INTO users (id, token) VALUES (?1, ?2)",
            params![id, token],
        )?;
        Ok(token)
    }

    pub async fn user_by_token(&self, token: &str) -> Result<Option<User>> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM users WHERE token = ?1",
            USER_COLUMNS
        ))?;
        let mut rows = stmt.query_map([token], user_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(finish_user(row?))),
            None => Ok(None),
        }
    }

    pub async fn user_by_id(&self, id: &str) -> Result<Option<User>> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(&format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS))?;
        let mut rows = stmt.query_map([id], user_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(finish_user(row?))),
            None => Ok(None),
        }
    }

    /// All users with complete credentials, for bulk operations and the
    /// daily trigger sweep.
    pub async fn users_with_credentials(&self) -> Result<Vec<User>> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM users WHERE login IS NOT NULL AND password IS NOT NULL",
            USER_COLUMNS
        ))?;
        let rows = stmt.query_map([], user_from_row)?;
        let mut users = Vec::new();
        for row in rows {
            users.push(finish_user(row?));
        }
        Ok(users)
    }

    pub async fn set_credentials(
        &self,
        id: &str,
        login: &str,
        password_ciphertext: &str,
    ) -> Result<()> {
        let db = self.db().lock().await;
        db.execute(
            "UPDATE users SET login = ?1, password = ?2 WHERE id = ?3",
            params![login, password_ciphertext, id],
        )?;
        Ok(())
    }

    pub async fn set_user_active(&self, id: &str, active: bool) -> Result<()> {
        let db = self.db().lock().await;
        db.execute(
            "UPDATE users SET active = ?1 WHERE id = ?2",
            params![active as i64, id],
        )?;
        Ok(())
    }

    pub async fn set_user_profile(
        &self,
        id: &str,
        grade: Option<i64>,
        first_name: Option<&str>,
        last_name: Option<&str>,
    ) -> Result<()> {
        let db = self.db().lock().await;
        if let Some(grade) = grade {
            db.execute("UPDATE users SET grade = ?1 WHERE id = ?2", params![grade, id])?;
        }
        if let Some(first) = first_name {
            db.execute(
                "UPDATE users SET first_name = ?1 WHERE id = ?2",
                params![first, id],
            )?;
        }
        if let Some(last) = last_name {
            db.execute(
                "UPDATE users SET last_name = ?1 WHERE id = ?2",
                params![last, id],
            )?;
        }
        Ok(())
    }

    pub async fn set_user_courses(&self, id: &str, course_ids: &[String]) -> Result<()> {
        let json = serde_json::to_string(course_ids)?;
        let db = self.db().lock().await;
        db.execute(
            "UPDATE users SET course_ids = ?1 WHERE id = ?2",
            params![json, id],
        )?;
        Ok(())
    }

    pub async fn delete_user(&self, id: &str) -> Result<()> {
        let db = self.db().lock().await;
        db.execute("DELETE FROM logged_errors WHERE owner = ?1", [id])?;
        db.execute("DELETE FROM fill_results WHERE owner = ?1", [id])?;
        db.execute("DELETE FROM tasks WHERE owner = ?1", [id])?;
        db.execute("DELETE FROM users WHERE id = ?1", [id])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_fetch_user() {
        let store = Store::open_in_memory().unwrap();
        let token = store.create_user().await.unwrap();
        assert_eq!(token.len(), 64);
        let user = store.user_by_token(&token).await.unwrap().unwrap();
        assert!(user.active);
        assert!(!user.has_credentials());
        assert!(store.user_by_token("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn credentials_and_profile_updates() {
        let store = Store::open_in_memory().unwrap();
        let token = store.create_user().await.unwrap();
        let user = store.user_by_token(&token).await.unwrap().unwrap();

        store
            .set_credentials(&user.id, "12345", "ciphertext")
            .await
            .unwrap();
        store
            .set_user_profile(&user.id, Some(10), Some("Ada"), Some("Lovelace"))
            .await
            .unwrap();
        store.set_user_active(&user.id, false).await.unwrap();

        let user = store.user_by_id(&user.id).await.unwrap().unwrap();
        assert!(user.has_credentials());
        assert_eq!(user.grade, Some(10));
        assert_eq!(user.first_name.as_deref(), Some("Ada"));
        assert!(!user.active);
    }

    #[tokio::test]
    async fn users_with_credentials_filters() {
        let store = Store::open_in_memory().unwrap();
        let with = store.create_user().await.unwrap();
        let _without = store.create_user().await.unwrap();
        let user = store.user_by_token(&with).await.unwrap().unwrap();
        store.set_credentials(&user.id, "12345", "ct").await.unwrap();

        let users = store.users_with_credentials().await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].id, user.id);
    }

    #[tokio::test]
    async fn delete_user_removes_row() {
        let store = Store::open_in_memory().unwrap();
        let token = store.create_user().await.unwrap();
        let user = store.user_by_token(&token).await.unwrap().unwrap();
        store.delete_user(&user.id).await.unwrap();
        assert!(store.user_by_token(&token).await.unwrap().is_none());
    }
}
