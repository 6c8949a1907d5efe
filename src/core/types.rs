//! Shared domain records, persisted by [`crate::core::storage`] and served
//! through the JSON API.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::core::fieldexpr::{EvalContext, Value};

/// Kind of input a form question accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldKind {
    Text,
    LongText,
    Date,
    MultipleChoice,
    Checkbox,
    Dropdown,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::Text => "text",
            FieldKind::LongText => "long-text",
            FieldKind::Date => "date",
            FieldKind::MultipleChoice => "multiple-choice",
            FieldKind::Checkbox => "checkbox",
            FieldKind::Dropdown => "dropdown",
        }
    }

    /// Whether an evaluated expression result has the type this field needs:
    /// text fields take strings, date fields take dates, and every
    /// option-based field takes a 0-based int index. A bare comparison also
    /// fits an option field, with its bool selecting index 0 or 1.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldKind::Text | FieldKind::LongText => matches!(value, Value::Str(_)),
            FieldKind::Date => matches!(value, Value::Date(_)),
            FieldKind::MultipleChoice | FieldKind::Checkbox | FieldKind::Dropdown => {
                value.as_int().is_some()
            }
        }
    }
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One field mapping inside a [`FormStyle`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubField {
    pub index_on_page: usize,
    /// Substring the visible label must contain; matching is containment,
    /// not equality, so minor wording changes on the form don't break fills.
    #[serde(default)]
    pub expected_label_segment: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub critical: bool,
    /// Field-expression source text; grammar in `core::fieldexpr`.
    pub target_value: String,
}

/// An administrator-curated, reusable field-mapping template matched against
/// one or more real attendance forms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormStyle {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub thumbnail_id: Option<String>,
    pub sub_fields: Vec<SubField>,
}

/// A course, shared between students.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Course {
    pub id: String,
    pub course_code: String,
    #[serde(default)]
    pub teacher_name: String,
    /// Slots this course is known to occur on, as `"{day}-{period}"` strings
    /// ("2-1a" is day 2, first period, asynchronous).
    #[serde(default)]
    pub known_slots: Vec<String>,
    pub has_attendance_form: bool,
    #[serde(default)]
    pub form_url: Option<String>,
    #[serde(default)]
    pub form_config_id: Option<String>,
    /// Once an admin verifies the form linkage, only admins may change it.
    #[serde(default)]
    pub configuration_locked: bool,
}

/// A student account as stored. Credentials are vault-encrypted; `active`
/// gates future task triggers only, never an in-flight run.
#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub token: String,
    pub login: Option<String>,
    pub password_ciphertext: Option<String>,
    pub active: bool,
    pub grade: Option<i64>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub course_ids: Vec<String>,
}

impl User {
    pub fn has_credentials(&self) -> bool {
        self.login.is_some() && self.password_ciphertext.is_some()
    }
}

/// Immutable per-run snapshot of everything expressions can reference.
#[derive(Debug, Clone)]
pub struct StudentContext {
    pub name: String,
    pub first_name: String,
    pub last_name: String,
    pub student_number: String,
    pub grade: i64,
    pub day_cycle: i64,
    pub today: NaiveDate,
}

impl StudentContext {
    /// Bind the snapshot plus course attributes into an evaluation context.
    pub fn eval_context(&self, course_code: &str, teacher_name: &str) -> EvalContext {
        let mut ctx = EvalContext::new();
        ctx.set("name", Value::Str(self.name.clone()));
        ctx.set("first_name", Value::Str(self.first_name.clone()));
        ctx.set("last_name", Value::Str(self.last_name.clone()));
        ctx.set("student_number", Value::Str(self.student_number.clone()));
        ctx.set("grade", Value::Int(self.grade));
        ctx.set("day_cycle", Value::Int(self.day_cycle));
        ctx.set("today", Value::Date(self.today));
        ctx.set("course_code", Value::Str(course_code.to_string()));
        ctx.set("teacher_name", Value::Str(teacher_name.to_string()));
        ctx
    }
}

/// What kind of work a scheduled task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    DailyFill,
    CourseRefresh,
    TestRun,
    TestCleanup,
    CheckDay,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::DailyFill => "daily-fill",
            TaskKind::CourseRefresh => "course-refresh",
            TaskKind::TestRun => "test-run",
            TaskKind::TestCleanup => "test-cleanup",
            TaskKind::CheckDay => "check-day",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "daily-fill" => Some(TaskKind::DailyFill),
            "course-refresh" => Some(TaskKind::CourseRefresh),
            "test-run" => Some(TaskKind::TestRun),
            "test-cleanup" => Some(TaskKind::TestCleanup),
            "check-day" => Some(TaskKind::CheckDay),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A scheduled unit of work. At most one non-terminal task exists per
/// (owner, kind, logical day).
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub kind: TaskKind,
    /// User the task runs on behalf of; system tasks (check-day) have none.
    pub owner: Option<String>,
    /// Kind-specific payload, e.g. the test-context id for test runs.
    pub argument: Option<String>,
    /// Local calendar date the trigger was computed for; dedup key component.
    pub logical_day: NaiveDate,
    pub next_run_at: DateTime<Utc>,
    pub retry_count: u32,
    pub is_running: bool,
}

/// Terminal classification of one fill attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FillStatus {
    NoForm,
    Success,
    Failure,
    PossibleFailure,
    SubmitDisabled,
}

impl FillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FillStatus::NoForm => "no-form",
            FillStatus::Success => "success",
            FillStatus::Failure => "failure",
            FillStatus::PossibleFailure => "possible-failure",
            FillStatus::SubmitDisabled => "submit-disabled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "no-form" => Some(FillStatus::NoForm),
            "success" => Some(FillStatus::Success),
            "failure" => Some(FillStatus::Failure),
            "possible-failure" => Some(FillStatus::PossibleFailure),
            "submit-disabled" => Some(FillStatus::SubmitDisabled),
            _ => None,
        }
    }
}

/// Result record for a fill attempt, with screenshot evidence references.
#[derive(Debug, Clone)]
pub struct FillResult {
    pub id: String,
    pub status: FillStatus,
    pub course_id: Option<String>,
    pub time_logged: DateTime<Utc>,
    pub form_screenshot_id: Option<String>,
    pub confirm_screenshot_id: Option<String>,
    /// True for test runs, which are retained separately and pruned early.
    pub is_test: bool,
}

/// Category for a logged, user-visible error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Eval,
    Geometry,
    Login,
    Network,
    Config,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Eval => "eval",
            ErrorKind::Geometry => "geometry",
            ErrorKind::Login => "login",
            ErrorKind::Network => "network",
            ErrorKind::Config => "config",
            ErrorKind::Internal => "internal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "eval" => Some(ErrorKind::Eval),
            "geometry" => Some(ErrorKind::Geometry),
            "login" => Some(ErrorKind::Login),
            "network" => Some(ErrorKind::Network),
            "config" => Some(ErrorKind::Config),
            "internal" => Some(ErrorKind::Internal),
            _ => None,
        }
    }
}

/// A user-clearable error entry, aggregated for administrators.
#[derive(Debug, Clone)]
pub struct LoggedError {
    pub id: String,
    pub owner: String,
    pub kind: ErrorKind,
    pub message: String,
    pub time_logged: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn field_kind_accepts_matching_value_types() {
        assert!(FieldKind::Text.accepts(&Value::Str("x".into())));
        assert!(!FieldKind::Text.accepts(&Value::Int(1)));
        assert!(FieldKind::Date.accepts(&Value::Date(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
        )));
        assert!(FieldKind::Dropdown.accepts(&Value::Int(0)));
        assert!(FieldKind::Checkbox.accepts(&Value::Bool(true)));
        assert!(!FieldKind::Checkbox.accepts(&Value::Str("0".into())));
    }

    #[test]
    fn task_kind_round_trips() {
        for kind in [
            TaskKind::DailyFill,
            TaskKind::CourseRefresh,
            TaskKind::TestRun,
            TaskKind::TestCleanup,
            TaskKind::CheckDay,
        ] {
            assert_eq!(TaskKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(TaskKind::parse("bogus"), None);
    }

    #[test]
    fn student_context_binds_all_variables() {
        let snapshot = StudentContext {
            name: "Ada Lovelace".into(),
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            student_number: "12345".into(),
            grade: 10,
            day_cycle: 2,
            today: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        };
        let ctx = snapshot.eval_context("MHF4U1-A", "G. Boole");
        for var in [
            "name",
            "first_name",
            "last_name",
            "student_number",
            "grade",
            "day_cycle",
            "today",
            "course_code",
            "teacher_name",
        ] {
            assert!(ctx.get(var).is_some(), "missing ${}", var);
        }
    }
}
