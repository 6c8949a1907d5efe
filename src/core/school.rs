//! HTTP client for the school timetable service.
//!
//! Wraps login, account info, day-cycle and timetable lookups. A bad
//! password is terminal for the owning user; timeouts and 5xx responses
//! are retryable.

use std::fmt;
use std::time::Duration;

use chrono::{Days, NaiveDate};
use serde::Deserialize;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Days scanned per day-cycle request.
const CHECK_RANGE: u64 = 14;
/// Days in one timetable cycle.
const CYCLE_LENGTH: usize = 4;
/// How far ahead to look for a full cycle before giving up.
const SCAN_HORIZON: u64 = 100;

#[derive(Debug)]
pub enum SchoolError {
    /// Credentials rejected by the school service.
    LoginFailed,
    /// Account is in no school the deployment accepts.
    NoEligibleSchool,
    /// No allow-filter configured and the account is in several schools.
    AmbiguousSchool,
    /// Timeout or connection failure.
    Network(String),
    /// Unexpected status or payload shape.
    Protocol(String),
}

impl fmt::Display for SchoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchoolError::LoginFailed => write!(f, "school login rejected"),
            SchoolError::NoEligibleSchool => write!(f, "account is not in an eligible school"),
            SchoolError::AmbiguousSchool => {
                write!(f, "account is in multiple schools and no school filter is set")
            }
            SchoolError::Network(msg) => write!(f, "school service unreachable: {}", msg),
            SchoolError::Protocol(msg) => write!(f, "unexpected school service response: {}", msg),
        }
    }
}

impl std::error::Error for SchoolError {}

impl SchoolError {
    /// Whether the caller should retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SchoolError::Network(_))
    }
}

fn wrap(err: reqwest::Error) -> SchoolError {
    if err.is_timeout() || err.is_connect() {
        SchoolError::Network(err.to_string())
    } else {
        SchoolError::Protocol(err.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchoolInfo {
    pub code: u32,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountInfo {
    pub name: String,
    pub first_name: String,
    pub last_name: String,
    pub student_number: String,
    pub grade: i64,
    pub schools: Vec<SchoolInfo>,
}

impl AccountInfo {
    /// Pick the school this deployment serves. With an allow-filter the
    /// account must contain it; without one the account must be in exactly
    /// one school.
    pub fn select_school(&self, allow: Option<u32>) -> Result<&SchoolInfo, SchoolError> {
        match allow {
            Some(code) => self
                .schools
                .iter()
                .find(|s| s.code == code)
                .ok_or(SchoolError::NoEligibleSchool),
            None => match self.schools.as_slice() {
                [] => Err(SchoolError::NoEligibleSchool),
                [only] => Ok(only),
                _ => Err(SchoolError::AmbiguousSchool),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimetableItem {
    pub course_code: String,
    #[serde(default)]
    pub teacher_name: String,
    /// Period string; a trailing `a` marks an asynchronous period.
    pub period: String,
    /// Cycle day name, e.g. `"D2"`.
    pub day: String,
}

impl TimetableItem {
    pub fn is_async(&self) -> bool {
        self.period.ends_with('a')
    }

    /// Slot key stored on courses, `"{day}-{period}"`.
    pub fn slot(&self) -> String {
        format!("{}-{}", self.day.trim_start_matches('D'), self.period)
    }
}

/// An authenticated session against the school service. Lives for one
/// task run; the plaintext password is dropped after login.
pub struct SchoolSession {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

pub struct SchoolClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

impl SchoolClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn login(&self, login: &str, password: &str) -> Result<SchoolSession, SchoolError> {
        let response = self
            .client
            .post(format!("{}/api/login", self.base_url))
            .json(&serde_json::json!({ "username": login, "password": password }))
            .send()
            .await
            .map_err(wrap)?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(SchoolError::LoginFailed);
        }
        if !response.status().is_success() {
            return Err(SchoolError::Protocol(format!(
                "login returned {}",
                response.status()
            )));
        }
        let body: LoginResponse = response.json().await.map_err(wrap)?;
        Ok(SchoolSession {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            token: body.token,
        })
    }
}

impl SchoolSession {
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, SchoolError> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await
            .map_err(wrap)?;
        if !response.status().is_success() {
            return Err(SchoolError::Protocol(format!(
                "{} returned {}",
                path,
                response.status()
            )));
        }
        response.json().await.map_err(wrap)
    }

    pub async fn account_info(&self) -> Result<AccountInfo, SchoolError> {
        self.get_json("/api/user", &[]).await
    }

    /// Day-cycle names for each date in `[start, end)`. School days come
    /// back as `"D<n>"`, non-school days as `"D"`.
    pub async fn day_cycle_names(
        &self,
        school: u32,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<String>, SchoolError> {
        self.get_json(
            &format!("/api/schools/{}/days", school),
            &[("start", start.to_string()), ("end", end.to_string())],
        )
        .await
    }

    /// The cycle-day number for one date, or `None` when there is no school.
    pub async fn day_cycle(
        &self,
        school: u32,
        date: NaiveDate,
    ) -> Result<Option<i64>, SchoolError> {
        let names = self
            .day_cycle_names(school, date, date + Days::new(1))
            .await?;
        Ok(names.first().and_then(|name| parse_day_cycle(name)))
    }

    pub async fn timetable(
        &self,
        school: u32,
        date: NaiveDate,
    ) -> Result<Vec<TimetableItem>, SchoolError> {
        self.get_json(
            &format!("/api/schools/{}/timetable", school),
            &[("date", date.to_string())],
        )
        .await
    }

    /// All asynchronous-period timetable items across one full day cycle.
    ///
    /// The service only exposes timetables per calendar date, so first scan
    /// forward for a date carrying each cycle day, then fetch those dates'
    /// timetables and keep the async periods.
    pub async fn async_courses(
        &self,
        school: u32,
        today: NaiveDate,
    ) -> Result<Vec<TimetableItem>, SchoolError> {
        let mut day_offsets: Vec<(String, u64)> = Vec::new();
        'scan: for base in (0..SCAN_HORIZON).step_by(CHECK_RANGE as usize) {
            let start = today + Days::new(base);
            let names = self
                .day_cycle_names(school, start, start + Days::new(CHECK_RANGE))
                .await?;
            for (offset, name) in names.iter().enumerate() {
                let seen = day_offsets.iter().any(|(n, _)| n == name);
                if parse_day_cycle(name).is_some() && !seen {
                    day_offsets.push((name.clone(), base + offset as u64));
                    if day_offsets.len() == CYCLE_LENGTH {
                        break 'scan;
                    }
                }
            }
        }
        debug!(days = day_offsets.len(), "resolved timetable cycle days");
        let mut found = Vec::new();
        for (_, offset) in &day_offsets {
            let timetable = self.timetable(school, today + Days::new(*offset)).await?;
            found.extend(timetable.into_iter().filter(TimetableItem::is_async));
        }
        Ok(found)
    }
}

/// `"D2"` → `Some(2)`; `"D"` (no school) → `None`.
pub fn parse_day_cycle(name: &str) -> Option<i64> {
    name.strip_prefix('D')
        .filter(|rest| !rest.is_empty())
        .and_then(|rest| rest.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(codes: &[u32]) -> AccountInfo {
        AccountInfo {
            name: "Ada Lovelace".into(),
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            student_number: "123456".into(),
            grade: 10,
            schools: codes
                .iter()
                .map(|&code| SchoolInfo {
                    code,
                    name: format!("School {}", code),
                })
                .collect(),
        }
    }

    #[test]
    fn day_cycle_names_parse() {
        assert_eq!(parse_day_cycle("D2"), Some(2));
        assert_eq!(parse_day_cycle("D11"), Some(11));
        assert_eq!(parse_day_cycle("D"), None);
        assert_eq!(parse_day_cycle("PA"), None);
    }

    #[test]
    fn school_filter_selects_matching_school() {
        let info = account(&[100, 200]);
        assert_eq!(info.select_school(Some(200)).unwrap().code, 200);
        assert!(matches!(
            info.select_school(Some(300)),
            Err(SchoolError::NoEligibleSchool)
        ));
    }

    #[test]
    fn without_filter_exactly_one_school_is_required() {
        assert_eq!(account(&[100]).select_school(None).unwrap().code, 100);
        assert!(matches!(
            account(&[]).select_school(None),
            Err(SchoolError::NoEligibleSchool)
        ));
        assert!(matches!(
            account(&[100, 200]).select_school(None),
            Err(SchoolError::AmbiguousSchool)
        ));
    }

    #[test]
    fn async_periods_end_in_a() {
        let item = TimetableItem {
            course_code: "MCR3U1-2".into(),
            teacher_name: "J. Doe".into(),
            period: "1a".into(),
            day: "D2".into(),
        };
        assert!(item.is_async());
        assert_eq!(item.slot(), "2-1a");
        let sync = TimetableItem {
            period: "1".into(),
            ..item
        };
        assert!(!sync.is_async());
    }

    #[test]
    fn network_errors_are_retryable_login_is_not() {
        assert!(SchoolError::Network("timeout".into()).is_retryable());
        assert!(!SchoolError::LoginFailed.is_retryable());
        assert!(!SchoolError::Protocol("bad json".into()).is_retryable());
    }
}
