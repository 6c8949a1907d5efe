//! Task handlers: the glue between scheduler, school service, vault,
//! browser executor and storage.
//!
//! Every handler runs inside a scheduler worker and reports a
//! [`TaskOutcome`]. Decrypted credentials live on the stack for the length
//! of one handler call and are never persisted or logged.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Days, Duration, Local, NaiveDate, NaiveTime, Utc};
use rand::Rng;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::core::executor::{
    FillError, FillReport, GoogleFormPage, LoginDetails, fill_form, probe_geometry,
};
use crate::core::executor::webdriver::WebDriver;
use crate::core::fieldexpr::EvalContext;
use crate::core::scheduler::{TaskOutcome, TaskRunner};
use crate::core::school::{SchoolClient, SchoolError, SchoolSession};
use crate::core::storage::Store;
use crate::core::types::{
    Course, ErrorKind, FillResult, FillStatus, FormStyle, StudentContext, Task, TaskKind, User,
};
use crate::core::vault::CredentialVault;

/// Daily day-cycle check, before any fills.
const CHECK_DAY_TIME: NaiveTime = NaiveTime::from_hms_opt(4, 0, 0).unwrap();
/// Fill window start; each user gets a random offset inside the window.
const FILL_WINDOW_START: NaiveTime = NaiveTime::from_hms_opt(7, 0, 0).unwrap();
const FILL_WINDOW_SECONDS: i64 = 2 * 3600;

/// Spacing between bulk course-refresh tasks, so the worker pool is not
/// saturated with timetable requests.
const BULK_REFRESH_SPACING: Duration = Duration::seconds(60);

/// How long test results stick around before their cleanup task fires.
pub const TEST_RESULT_TTL: Duration = Duration::hours(6);

/// Rejected credentials get a few attempts before the task is dropped,
/// in case the school service is flapping on auth.
const LOGIN_ATTEMPTS: u32 = 3;

/// What the last day-cycle check found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DayState {
    Unknown,
    NoSchool,
    Day(i64),
}

/// What a daily fill resolved today to.
enum FillPlan {
    /// An async course meets today; fill its form with this context.
    Fill(Course, EvalContext),
    /// No school, or no async course of the user's meets today.
    Nothing,
    /// The day cycle could not be determined from stored data.
    Unknown,
}

pub struct Pipeline {
    config: Config,
    store: Arc<Store>,
    vault: CredentialVault,
    school: SchoolClient,
    driver: WebDriver,
    current_day: RwLock<DayState>,
}

/// Interpret a local wall-clock time on a date as a UTC instant.
fn local_instant(day: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    day.and_time(time)
        .and_local_timezone(Local)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

/// When tomorrow's day-cycle check should run.
fn next_check_day_run(today: NaiveDate) -> (DateTime<Utc>, NaiveDate) {
    let tomorrow = today + Days::new(1);
    (local_instant(tomorrow, CHECK_DAY_TIME), tomorrow)
}

/// A random instant inside the fill window on `day`. Spreading users out
/// keeps the submissions from looking scripted.
fn fill_run_instant(day: NaiveDate) -> DateTime<Utc> {
    let offset = rand::thread_rng().gen_range(0..=FILL_WINDOW_SECONDS);
    local_instant(day, FILL_WINDOW_START) + Duration::seconds(offset)
}

/// Whether one of the user's courses meets (asynchronously, first period)
/// on the given cycle day.
fn course_for_day(courses: &[Course], day_cycle: i64) -> Option<&Course> {
    let slot = format!("{}-1a", day_cycle);
    courses
        .iter()
        .find(|course| course.known_slots.iter().any(|s| s == &slot))
}

/// First/last name resolution: the user's stored override wins, then the
/// school account, then a `"Last, First"` split of the full name.
fn resolve_names(user: &User, account_first: &str, account_last: &str, full: &str) -> (String, String) {
    if user.first_name.is_some() || user.last_name.is_some() {
        return (
            user.first_name.clone().unwrap_or_default(),
            user.last_name.clone().unwrap_or_default(),
        );
    }
    if !account_first.is_empty() && !account_last.is_empty() {
        return (account_first.to_string(), account_last.to_string());
    }
    match full.split_once(", ") {
        Some((last, first)) => (first.to_string(), last.to_string()),
        None => (full.to_string(), full.to_string()),
    }
}

impl Pipeline {
    pub fn new(config: Config, store: Arc<Store>) -> Self {
        let vault = CredentialVault::new(&config.credential_key);
        let school = SchoolClient::new(&config.school_base_url);
        let driver = WebDriver::new(&config.webdriver_url);
        Self {
            config,
            store,
            vault,
            school,
            driver,
            current_day: RwLock::new(DayState::Unknown),
        }
    }

    pub fn vault(&self) -> &CredentialVault {
        &self.vault
    }

    pub fn school(&self) -> &SchoolClient {
        &self.school
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Schedule a course refresh for every user with credentials, spaced
    /// apart so the timetable service is not hammered. Returns how many
    /// tasks were created.
    pub async fn schedule_bulk_refresh(&self) -> Result<usize> {
        let users = self.store.users_with_credentials().await?;
        let today = Local::now().date_naive();
        let mut at = Utc::now();
        let mut created = 0;
        for user in users {
            if !user.active {
                continue;
            }
            let (_, fresh) = self
                .store
                .create_task(TaskKind::CourseRefresh, Some(&user.id), None, today, at)
                .await?;
            if fresh {
                created += 1;
                at += BULK_REFRESH_SPACING;
            }
        }
        info!(count = created, "bulk course refresh scheduled");
        Ok(created)
    }

    /// Schedule the never-ending day-check task. Called once at startup;
    /// dedup makes it a no-op when one already exists.
    pub async fn schedule_check_day(&self) -> Result<()> {
        let today = Local::now().date_naive();
        let first_run = Utc::now().max(local_instant(today, CHECK_DAY_TIME));
        self.store
            .create_task(TaskKind::CheckDay, None, None, today, first_run)
            .await?;
        Ok(())
    }

    /// Schedule a fill and a course refresh for a user whose credentials
    /// were just set or re-enabled.
    pub async fn schedule_user_onboarding(&self, user_id: &str) -> Result<()> {
        let today = Local::now().date_naive();
        self.store
            .create_task(TaskKind::CourseRefresh, Some(user_id), None, today, Utc::now())
            .await?;
        self.store
            .create_task(
                TaskKind::DailyFill,
                Some(user_id),
                None,
                today,
                Utc::now().max(fill_run_instant(today)),
            )
            .await?;
        Ok(())
    }

    /// Schedule a dry-run fill of `course_id` for the user, plus the
    /// cleanup task that prunes its result later.
    pub async fn schedule_test_run(&self, user_id: &str, course_id: &str) -> Result<()> {
        let today = Local::now().date_naive();
        self.store
            .create_task(
                TaskKind::TestRun,
                Some(user_id),
                Some(course_id),
                today,
                Utc::now(),
            )
            .await?;
        self.store
            .create_task(
                TaskKind::TestCleanup,
                Some(user_id),
                None,
                today,
                Utc::now() + TEST_RESULT_TTL,
            )
            .await?;
        Ok(())
    }

    /// Probe a form URL's geometry with the given user's credentials and
    /// cache the outcome. Intended to run detached from the request.
    pub async fn probe_form(&self, url: &str, user: &User) -> Result<()> {
        let outcome = self.probe_form_inner(url, user).await;
        if let Err(err) = outcome {
            warn!(url, error = %err, "form geometry probe failed");
            self.store.geometry_fail(url, &err.to_string()).await?;
        }
        Ok(())
    }

    async fn probe_form_inner(&self, url: &str, user: &User) -> Result<(), FillError> {
        let login = self
            .login_details(user)
            .map_err(|e| FillError::AuthFailed(e.to_string()))?;
        let mut page = GoogleFormPage::open(&self.driver, url, &login).await?;
        let probed = probe_geometry(&mut page).await;
        page.close().await;
        let (geometry, screenshot) = probed?;
        let screenshot_id = self
            .store
            .insert_screenshot(&screenshot)
            .await
            .map_err(|e| FillError::Transient(e.to_string()))?;
        self.store
            .geometry_fulfill(url, &geometry, Some(&screenshot_id))
            .await
            .map_err(|e| FillError::Transient(e.to_string()))?;
        info!(url, fields = geometry.fields.len(), "form geometry cached");
        Ok(())
    }

    fn login_details(&self, user: &User) -> Result<LoginDetails> {
        let login = user
            .login
            .clone()
            .ok_or_else(|| anyhow::anyhow!("user has no stored login"))?;
        let ciphertext = user
            .password_ciphertext
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("user has no stored password"))?;
        let password = self.vault.decrypt(ciphertext)?;
        Ok(LoginDetails {
            email: login.clone(),
            username: login,
            password,
        })
    }

    async fn record_result(
        &self,
        owner: &str,
        status: FillStatus,
        course_id: Option<&str>,
        report: Option<&FillReport>,
        is_test: bool,
    ) -> Result<()> {
        let mut form_screenshot_id = None;
        let mut confirm_screenshot_id = None;
        if let Some(report) = report {
            if let Some(shot) = &report.form_screenshot {
                form_screenshot_id = Some(self.store.insert_screenshot(shot).await?);
            }
            if let Some(shot) = &report.confirm_screenshot {
                confirm_screenshot_id = Some(self.store.insert_screenshot(shot).await?);
            }
        }
        let result = FillResult {
            id: uuid::Uuid::new_v4().to_string(),
            status,
            course_id: course_id.map(str::to_string),
            time_logged: Utc::now(),
            form_screenshot_id,
            confirm_screenshot_id,
            is_test,
        };
        self.store.set_fill_result(owner, &result).await
    }

    /// Run the browser fill and persist the outcome. `submit` already has
    /// the global submit switch folded in.
    async fn run_fill(
        &self,
        user: &User,
        course: &Course,
        style: &FormStyle,
        ctx: &EvalContext,
        submit: bool,
        is_test: bool,
    ) -> Result<TaskOutcome> {
        let login = match self.login_details(user) {
            Ok(login) => login,
            Err(err) => {
                error!(user = %user.id, "cannot decrypt stored credentials");
                self.record_result(&user.id, FillStatus::Failure, Some(&course.id), None, is_test)
                    .await?;
                return Ok(TaskOutcome::Failed {
                    kind: ErrorKind::Internal,
                    message: format!("failed to decrypt stored credentials: {}", err),
                });
            }
        };
        let Some(form_url) = course.form_url.as_deref() else {
            self.record_result(&user.id, FillStatus::Failure, Some(&course.id), None, is_test)
                .await?;
            return Ok(TaskOutcome::Failed {
                kind: ErrorKind::Config,
                message: format!("course {} is missing its form URL", course.course_code),
            });
        };

        let mut page = match GoogleFormPage::open(&self.driver, form_url, &login).await {
            Ok(page) => page,
            Err(err) => return self.fill_error(user, course, err, is_test).await,
        };
        let filled = fill_form(&mut page, &style.sub_fields, ctx, submit).await;
        page.close().await;
        let report = match filled {
            Ok(report) => report,
            Err(err) => return self.fill_error(user, course, err, is_test).await,
        };

        for warning in &report.warnings {
            self.store
                .log_error(&user.id, ErrorKind::Geometry, warning)
                .await?;
        }
        self.record_result(
            &user.id,
            report.status,
            Some(&course.id),
            Some(&report),
            is_test,
        )
        .await?;
        match report.status {
            FillStatus::Failure => Ok(TaskOutcome::Failed {
                kind: ErrorKind::Geometry,
                message: report
                    .failure
                    .unwrap_or_else(|| "form could not be filled".into()),
            }),
            FillStatus::PossibleFailure => {
                if let Some(message) = &report.failure {
                    // Submit-confirmation timeout. Never retried.
                    self.store
                        .log_error(
                            &user.id,
                            ErrorKind::Geometry,
                            &format!("possible form filling failure (not retrying): {}", message),
                        )
                        .await?;
                }
                Ok(TaskOutcome::Done)
            }
            _ => Ok(TaskOutcome::Done),
        }
    }

    async fn fill_error(
        &self,
        user: &User,
        course: &Course,
        err: FillError,
        is_test: bool,
    ) -> Result<TaskOutcome> {
        if err.is_retryable() {
            return Ok(TaskOutcome::Retry {
                kind: ErrorKind::Network,
                message: err.to_string(),
            });
        }
        self.record_result(&user.id, FillStatus::Failure, Some(&course.id), None, is_test)
            .await?;
        let kind = match err {
            FillError::AuthFailed(_) => ErrorKind::Login,
            _ => ErrorKind::Geometry,
        };
        Ok(TaskOutcome::Failed {
            kind,
            message: err.to_string(),
        })
    }

    /// Load the user for an owned task, skipping (Done) tasks whose user
    /// is gone, inactive or credential-less.
    async fn task_user(&self, task: &Task) -> Result<Result<User, TaskOutcome>> {
        let Some(owner) = &task.owner else {
            return Ok(Err(TaskOutcome::Failed {
                kind: ErrorKind::Internal,
                message: format!("{} task has no owner", task.kind.as_str()),
            }));
        };
        let Some(user) = self.store.user_by_id(owner).await? else {
            info!(owner = %owner, "task owner no longer exists, dropping task");
            return Ok(Err(TaskOutcome::Done));
        };
        if !user.active || !user.has_credentials() {
            info!(owner = %owner, "user inactive or credential-less, skipping");
            return Ok(Err(TaskOutcome::Done));
        }
        Ok(Ok(user))
    }

    async fn login_session(
        &self,
        user: &User,
        retry_count: u32,
    ) -> Result<Result<SchoolSession, TaskOutcome>> {
        let login = match self.login_details(user) {
            Ok(details) => details,
            Err(err) => {
                error!(user = %user.id, "cannot decrypt stored credentials");
                return Ok(Err(TaskOutcome::Failed {
                    kind: ErrorKind::Internal,
                    message: format!("failed to decrypt stored credentials: {}", err),
                }));
            }
        };
        match self.school.login(&login.username, &login.password).await {
            Ok(session) => Ok(Ok(session)),
            Err(SchoolError::LoginFailed) if retry_count + 1 < LOGIN_ATTEMPTS => {
                Ok(Err(TaskOutcome::Retry {
                    kind: ErrorKind::Login,
                    message: "the school service rejected your credentials".into(),
                }))
            }
            Err(SchoolError::LoginFailed) => Ok(Err(TaskOutcome::Failed {
                kind: ErrorKind::Login,
                message: "the school service rejected your credentials".into(),
            })),
            Err(err) => Ok(Err(TaskOutcome::Retry {
                kind: ErrorKind::Network,
                message: err.to_string(),
            })),
        }
    }

    async fn handle_daily_fill(&self, task: &Task) -> Result<TaskOutcome> {
        let user = match self.task_user(task).await? {
            Ok(user) => user,
            Err(outcome) => return Ok(outcome),
        };
        let today = Local::now().date_naive();

        // Fresh data when the school service cooperates, stored data
        // otherwise.
        let plan = match self.login_session(&user, task.retry_count).await? {
            Ok(session) => self.fresh_context(&user, &session, today).await?,
            Err(TaskOutcome::Retry {
                kind: ErrorKind::Network,
                message,
            }) => {
                warn!(user = %user.id, "school service unavailable, falling back to stored data: {}", message);
                match self.stored_context(&user, today).await? {
                    FillPlan::Unknown => {
                        return Ok(TaskOutcome::Retry {
                            kind: ErrorKind::Network,
                            message,
                        });
                    }
                    plan => plan,
                }
            }
            Err(outcome) => return Ok(outcome),
        };
        let (course, ctx) = match plan {
            FillPlan::Fill(course, ctx) => (course, ctx),
            FillPlan::Nothing => {
                self.record_result(&user.id, FillStatus::NoForm, None, None, false)
                    .await?;
                return Ok(TaskOutcome::Done);
            }
            FillPlan::Unknown => {
                return Ok(TaskOutcome::Retry {
                    kind: ErrorKind::Network,
                    message: "today's day cycle is not known yet".into(),
                });
            }
        };

        if !course.has_attendance_form {
            info!(course = %course.course_code, "course has no attendance form");
            self.record_result(&user.id, FillStatus::NoForm, Some(&course.id), None, false)
                .await?;
            return Ok(TaskOutcome::Done);
        }
        let Some(style_id) = &course.form_config_id else {
            self.record_result(&user.id, FillStatus::Failure, Some(&course.id), None, false)
                .await?;
            return Ok(TaskOutcome::Failed {
                kind: ErrorKind::Config,
                message: format!("course {} is missing its form configuration", course.course_code),
            });
        };
        if course.form_url.is_none() {
            self.record_result(&user.id, FillStatus::Failure, Some(&course.id), None, false)
                .await?;
            return Ok(TaskOutcome::Failed {
                kind: ErrorKind::Config,
                message: format!("course {} is missing its form URL", course.course_code),
            });
        }
        let Some(style) = self.store.form_style(style_id).await? else {
            self.record_result(&user.id, FillStatus::Failure, Some(&course.id), None, false)
                .await?;
            return Ok(TaskOutcome::Failed {
                kind: ErrorKind::Config,
                message: format!("form style for course {} does not exist", course.course_code),
            });
        };

        self.run_fill(&user, &course, &style, &ctx, self.config.submit_enabled, false)
            .await
    }

    /// Today's async course and evaluation context from live school data.
    async fn fresh_context(
        &self,
        user: &User,
        session: &SchoolSession,
        today: NaiveDate,
    ) -> Result<FillPlan> {
        let info = match session.account_info().await {
            Ok(info) => info,
            Err(err) => {
                warn!(user = %user.id, "account info fetch failed: {}", err);
                return self.stored_context(user, today).await;
            }
        };
        let school = match info.select_school(self.config.school_code) {
            Ok(school) => school.code,
            Err(err) => {
                self.store
                    .log_error(&user.id, ErrorKind::Config, &err.to_string())
                    .await?;
                return Ok(FillPlan::Nothing);
            }
        };
        let timetable = match session.timetable(school, today).await {
            Ok(items) => items,
            Err(_) => return self.stored_context(user, today).await,
        };
        let mut items = timetable.into_iter().filter(|i| i.is_async());
        let Some(item) = items.next() else {
            info!(user = %user.id, "no async courses today");
            return Ok(FillPlan::Nothing);
        };
        let missed: Vec<String> = items.map(|i| i.course_code).collect();
        if !missed.is_empty() {
            self.store
                .log_error(
                    &user.id,
                    ErrorKind::Config,
                    &format!(
                        "multiple async courses detected for today, but only one form will be filled; missed: {}",
                        missed.join(", ")
                    ),
                )
                .await?;
        }
        let course = self
            .store
            .upsert_course(&item.course_code, &item.teacher_name, Some(&item.slot()))
            .await?;
        let day_cycle = crate::core::school::parse_day_cycle(&item.day).unwrap_or(1);
        {
            let mut state = self.current_day.write().await;
            *state = DayState::Day(day_cycle);
        }
        let (first_name, last_name) =
            resolve_names(user, &info.first_name, &info.last_name, &info.name);
        let context = StudentContext {
            name: format!("{} {}", first_name, last_name),
            first_name,
            last_name,
            student_number: user.login.clone().unwrap_or_default(),
            grade: user.grade.unwrap_or(0),
            day_cycle,
            today,
        };
        let ctx = context.eval_context(&course.course_code, &course.teacher_name);
        Ok(FillPlan::Fill(course, ctx))
    }

    /// Fallback plan from stored data when the school service is down.
    async fn stored_context(&self, user: &User, today: NaiveDate) -> Result<FillPlan> {
        let day_cycle = match *self.current_day.read().await {
            DayState::Day(day) => day,
            DayState::NoSchool => {
                info!(user = %user.id, "stored data says no school today");
                return Ok(FillPlan::Nothing);
            }
            DayState::Unknown => return Ok(FillPlan::Unknown),
        };
        let courses = self.store.courses_for_user(user).await?;
        let Some(course) = course_for_day(&courses, day_cycle) else {
            info!(user = %user.id, "no async course on day {}", day_cycle);
            return Ok(FillPlan::Nothing);
        };
        let (first_name, last_name) = resolve_names(user, "", "", "");
        let context = StudentContext {
            name: format!("{} {}", first_name, last_name),
            first_name,
            last_name,
            student_number: user.login.clone().unwrap_or_default(),
            grade: user.grade.unwrap_or(0),
            day_cycle,
            today,
        };
        let ctx = context.eval_context(&course.course_code, &course.teacher_name);
        Ok(FillPlan::Fill(course.clone(), ctx))
    }

    async fn handle_course_refresh(&self, task: &Task) -> Result<TaskOutcome> {
        let user = match self.task_user(task).await? {
            Ok(user) => user,
            Err(outcome) => return Ok(outcome),
        };
        let session = match self.login_session(&user, task.retry_count).await? {
            Ok(session) => session,
            Err(outcome) => return Ok(outcome),
        };
        let info = match session.account_info().await {
            Ok(info) => info,
            Err(err) if err.is_retryable() => {
                return Ok(TaskOutcome::Retry {
                    kind: ErrorKind::Network,
                    message: err.to_string(),
                });
            }
            Err(err) => {
                return Ok(TaskOutcome::Failed {
                    kind: ErrorKind::Network,
                    message: err.to_string(),
                });
            }
        };
        let school = match info.select_school(self.config.school_code) {
            Ok(school) => school.code,
            Err(err) => {
                return Ok(TaskOutcome::Failed {
                    kind: ErrorKind::Config,
                    message: err.to_string(),
                });
            }
        };
        let today = Local::now().date_naive();
        let items = match session.async_courses(school, today).await {
            Ok(items) => items,
            Err(err) => {
                return Ok(TaskOutcome::Retry {
                    kind: ErrorKind::Network,
                    message: err.to_string(),
                });
            }
        };
        let mut course_ids = Vec::new();
        for item in &items {
            let course = self
                .store
                .upsert_course(&item.course_code, &item.teacher_name, Some(&item.slot()))
                .await?;
            if !course_ids.contains(&course.id) {
                course_ids.push(course.id);
            }
        }
        self.store.set_user_courses(&user.id, &course_ids).await?;
        info!(user = %user.id, courses = course_ids.len(), "courses refreshed");
        Ok(TaskOutcome::Done)
    }

    async fn handle_test_run(&self, task: &Task) -> Result<TaskOutcome> {
        let user = match self.task_user(task).await? {
            Ok(user) => user,
            Err(outcome) => return Ok(outcome),
        };
        let Some(course_id) = &task.argument else {
            return Ok(TaskOutcome::Failed {
                kind: ErrorKind::Internal,
                message: "test run has no course to test".into(),
            });
        };
        let Some(course) = self.store.course_by_id(course_id).await? else {
            self.record_result(&user.id, FillStatus::Failure, None, None, true)
                .await?;
            return Ok(TaskOutcome::Failed {
                kind: ErrorKind::Internal,
                message: "test run course no longer exists".into(),
            });
        };
        if !course.has_attendance_form
            || course.form_url.is_none()
            || course.form_config_id.is_none()
        {
            self.record_result(&user.id, FillStatus::Failure, Some(&course.id), None, true)
                .await?;
            return Ok(TaskOutcome::Failed {
                kind: ErrorKind::Config,
                message: format!("course {} has no usable form configuration", course.course_code),
            });
        }
        let style_id = course.form_config_id.clone().unwrap_or_default();
        let Some(style) = self.store.form_style(&style_id).await? else {
            self.record_result(&user.id, FillStatus::Failure, Some(&course.id), None, true)
                .await?;
            return Ok(TaskOutcome::Failed {
                kind: ErrorKind::Config,
                message: format!("form style for course {} does not exist", course.course_code),
            });
        };

        let today = Local::now().date_naive();
        let day_cycle = match *self.current_day.read().await {
            DayState::Day(day) => day,
            _ => 1,
        };
        let (first_name, last_name) = resolve_names(&user, "", "", "");
        let context = StudentContext {
            name: format!("{} {}", first_name, last_name),
            first_name,
            last_name,
            student_number: user.login.clone().unwrap_or_default(),
            grade: user.grade.unwrap_or(0),
            day_cycle,
            today,
        };
        let ctx = context.eval_context(&course.course_code, &course.teacher_name);
        // Test runs never submit.
        self.run_fill(&user, &course, &style, &ctx, false, true).await
    }

    async fn handle_test_cleanup(&self, task: &Task) -> Result<TaskOutcome> {
        let Some(owner) = &task.owner else {
            return Ok(TaskOutcome::Done);
        };
        if self.store.delete_test_result(owner).await? {
            info!(owner = %owner, "test result pruned");
        }
        Ok(TaskOutcome::Done)
    }

    async fn handle_check_day(&self, task: &Task) -> Result<TaskOutcome> {
        let today = Local::now().date_naive();
        let (next_at, next_day) = next_check_day_run(today);

        let mut found: Option<Option<i64>> = None;
        for user in self.store.users_with_credentials().await? {
            if !user.active {
                continue;
            }
            let Ok(details) = self.login_details(&user) else {
                error!(user = %user.id, "cannot decrypt stored credentials");
                continue;
            };
            let session = match self.school.login(&details.username, &details.password).await {
                Ok(session) => session,
                Err(SchoolError::LoginFailed) => continue,
                Err(err) => {
                    warn!(user = %user.id, "day check login failed: {}", err);
                    continue;
                }
            };
            let info = match session.account_info().await {
                Ok(info) => info,
                Err(_) => continue,
            };
            let Ok(school) = info.select_school(self.config.school_code) else {
                continue;
            };
            match session.day_cycle(school.code, today).await {
                Ok(day) => {
                    found = Some(day);
                    break;
                }
                Err(err) => {
                    warn!("day check lookup failed: {}", err);
                    continue;
                }
            }
        }

        let Some(day) = found else {
            warn!("day check found no working credentials or the school service is down");
            {
                let mut state = self.current_day.write().await;
                *state = DayState::Unknown;
            }
            // One backoff pass, then give up until tomorrow.
            if task.retry_count < 1 {
                return Ok(TaskOutcome::Retry {
                    kind: ErrorKind::Network,
                    message: "no working credentials or school service down".into(),
                });
            }
            return Ok(TaskOutcome::Requeue {
                at: next_at,
                logical_day: next_day,
            });
        };

        match day {
            Some(day_cycle) => {
                info!(day = day_cycle, "today is a school day");
                {
                    let mut state = self.current_day.write().await;
                    *state = DayState::Day(day_cycle);
                }
                // Trigger today's fills for every user with a course
                // meeting today.
                for user in self.store.users_with_credentials().await? {
                    if !user.active {
                        continue;
                    }
                    let courses = self.store.courses_for_user(&user).await?;
                    if course_for_day(&courses, day_cycle).is_none() {
                        continue;
                    }
                    self.store
                        .create_task(
                            TaskKind::DailyFill,
                            Some(&user.id),
                            None,
                            today,
                            Utc::now().max(fill_run_instant(today)),
                        )
                        .await?;
                }
            }
            None => {
                info!("no school today");
                {
                    let mut state = self.current_day.write().await;
                    *state = DayState::NoSchool;
                }
                let window_end = local_instant(today + Days::new(1), NaiveTime::MIN);
                let moved = self.store.postpone_daily_fills(Utc::now(), window_end).await?;
                if moved > 0 {
                    info!(count = moved, "postponed fill tasks to tomorrow");
                }
            }
        }
        Ok(TaskOutcome::Requeue {
            at: next_at,
            logical_day: next_day,
        })
    }
}

#[async_trait::async_trait]
impl TaskRunner for Pipeline {
    async fn run(&self, task: &Task) -> TaskOutcome {
        let handled = match task.kind {
            TaskKind::DailyFill => self.handle_daily_fill(task).await,
            TaskKind::CourseRefresh => self.handle_course_refresh(task).await,
            TaskKind::TestRun => self.handle_test_run(task).await,
            TaskKind::TestCleanup => self.handle_test_cleanup(task).await,
            TaskKind::CheckDay => self.handle_check_day(task).await,
        };
        match handled {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(kind = task.kind.as_str(), "task handler error: {:#}", err);
                TaskOutcome::Retry {
                    kind: ErrorKind::Internal,
                    message: format!("internal error: {}", err),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn course(code: &str, slots: &[&str]) -> Course {
        Course {
            id: code.to_string(),
            course_code: code.to_string(),
            teacher_name: String::new(),
            known_slots: slots.iter().map(|s| s.to_string()).collect(),
            has_attendance_form: true,
            form_url: None,
            form_config_id: None,
            configuration_locked: false,
        }
    }

    #[test]
    fn course_lookup_matches_first_period_async_slot() {
        let courses = vec![
            course("MCR3U1-2", &["1-1a", "3-1a"]),
            course("ENG2D1-1", &["2-1a", "4-1a"]),
        ];
        assert_eq!(course_for_day(&courses, 2).unwrap().course_code, "ENG2D1-1");
        assert_eq!(course_for_day(&courses, 3).unwrap().course_code, "MCR3U1-2");
        assert!(course_for_day(&courses, 5).is_none());
    }

    #[test]
    fn fill_instant_lands_inside_the_window() {
        let day = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let start = local_instant(day, FILL_WINDOW_START);
        let end = start + Duration::seconds(FILL_WINDOW_SECONDS);
        for _ in 0..50 {
            let at = fill_run_instant(day);
            assert!(at >= start && at <= end);
        }
    }

    #[test]
    fn check_day_runs_the_next_morning() {
        let day = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let (at, logical) = next_check_day_run(day);
        assert_eq!(logical, day + Days::new(1));
        assert_eq!(at, local_instant(logical, CHECK_DAY_TIME));
    }

    #[test]
    fn name_resolution_prefers_overrides_then_account_then_split() {
        let mut user = User {
            id: "u1".into(),
            token: "t".into(),
            login: Some("123456".into()),
            password_ciphertext: None,
            active: true,
            grade: Some(10),
            first_name: None,
            last_name: None,
            course_ids: vec![],
        };
        assert_eq!(
            resolve_names(&user, "Ada", "Lovelace", "Lovelace, Ada"),
            ("Ada".to_string(), "Lovelace".to_string())
        );
        assert_eq!(
            resolve_names(&user, "", "", "Lovelace, Ada"),
            ("Ada".to_string(), "Lovelace".to_string())
        );
        assert_eq!(
            resolve_names(&user, "", "", "Ada Lovelace"),
            ("Ada Lovelace".to_string(), "Ada Lovelace".to_string())
        );
        user.first_name = Some("Augusta".into());
        assert_eq!(
            resolve_names(&user, "Ada", "Lovelace", "Lovelace, Ada"),
            ("Augusta".to_string(), String::new())
        );
    }
}
