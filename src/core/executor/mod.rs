//! Browser automation: load an attendance form, fill it per the configured
//! sub-fields, submit, and capture evidence screenshots.
//!
//! The fill pipeline runs against the [`FormPage`] trait so its failure
//! semantics (critical vs non-critical fields, possible-failure on submit
//! timeout) are testable without a browser.

pub mod webdriver;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::core::fieldexpr::{EvalContext, Value, evaluate};
use crate::core::geometry::{FormGeometry, GeometryField};
use crate::core::types::{FieldKind, FillStatus, SubField};
use webdriver::{ElementRef, WdError, WdSession, WebDriver};

/// Host the school's sign-in portal lives on; the Google auth flow hands
/// off to it after the email step.
const PORTAL_HOST: &str = "aw.tdsb.on.ca";

const ESCAPE_KEY: &str = "\u{e00c}";

const PAGE_LOAD_TIMEOUT: Duration = Duration::from_secs(10);
const AUTH_REDIRECT_TIMEOUT: Duration = Duration::from_secs(15);
const SUBMIT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum FillError {
    /// Sign-in was required and failed; terminal for the owning user.
    AuthFailed(String),
    /// The page does not look like the configured form.
    InvalidForm(String),
    /// Submit was clicked but confirmation never arrived. Never retried;
    /// the screenshot is kept for manual review.
    PossibleFail { message: String, screenshot: Vec<u8> },
    /// Browser or network trouble; retryable.
    Transient(String),
}

impl fmt::Display for FillError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FillError::AuthFailed(msg) => write!(f, "form sign-in failed: {}", msg),
            FillError::InvalidForm(msg) => write!(f, "unexpected form layout: {}", msg),
            FillError::PossibleFail { message, .. } => {
                write!(f, "form may not have been submitted: {}", message)
            }
            FillError::Transient(msg) => write!(f, "browser failure: {}", msg),
        }
    }
}

impl std::error::Error for FillError {}

impl FillError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FillError::Transient(_))
    }
}

/// Credentials for the Google -> school-portal auth flow. Held only for
/// the duration of one browser run.
pub struct LoginDetails {
    pub email: String,
    pub username: String,
    pub password: String,
}

/// One loaded, authenticated form page.
#[async_trait]
pub trait FormPage: Send {
    fn auth_required(&self) -> bool;
    fn field_count(&self) -> usize;
    async fn field_label(&mut self, index: usize) -> Result<String, FillError>;
    /// `None` when the page item is not a fillable question.
    async fn field_kind(&mut self, index: usize) -> Result<Option<FieldKind>, FillError>;
    async fn fill_field(
        &mut self,
        index: usize,
        kind: FieldKind,
        value: &Value,
    ) -> Result<(), FillError>;
    async fn screenshot(&mut self) -> Result<Vec<u8>, FillError>;
    /// Click submit and wait for the confirmation page.
    async fn submit(&mut self) -> Result<(), FillError>;
    /// Blank out the signed-in email before evidence screenshots.
    async fn redact_email(&mut self);
}

/// Outcome of one fill run. `failure` carries the reason when `status` is
/// `Failure`; `warnings` lists skipped non-critical fields.
pub struct FillReport {
    pub status: FillStatus,
    pub form_screenshot: Option<Vec<u8>>,
    pub confirm_screenshot: Option<Vec<u8>>,
    pub warnings: Vec<String>,
    pub failure: Option<String>,
}

enum FieldFailure {
    /// This one field could not be filled as configured.
    Skip(String),
    /// The whole run is broken.
    Fatal(FillError),
}

async fn fill_one(
    page: &mut dyn FormPage,
    field: &SubField,
    ctx: &EvalContext,
) -> Result<(), FieldFailure> {
    let title = &field.expected_label_segment;
    if field.index_on_page >= page.field_count() {
        return Err(FieldFailure::Skip(format!(
            "field '{}' is out of range at index {}",
            title, field.index_on_page
        )));
    }
    let label = match page.field_label(field.index_on_page).await {
        Ok(label) => label,
        Err(FillError::InvalidForm(msg)) => return Err(FieldFailure::Skip(msg)),
        Err(other) => return Err(FieldFailure::Fatal(other)),
    };
    if !label.contains(title) {
        return Err(FieldFailure::Skip(format!(
            "field '{}' is not present at index {} (found '{}')",
            title, field.index_on_page, label
        )));
    }
    let value = evaluate(&field.target_value, ctx).map_err(|e| {
        FieldFailure::Skip(format!("field '{}' expression failed: {}", title, e))
    })?;
    if !field.kind.accepts(&value) {
        return Err(FieldFailure::Skip(format!(
            "field '{}' expression produced {}, not valid for a {} field",
            title,
            value.type_name(),
            field.kind.as_str()
        )));
    }
    match page.fill_field(field.index_on_page, field.kind, &value).await {
        Ok(()) => Ok(()),
        Err(FillError::InvalidForm(msg)) => Err(FieldFailure::Skip(format!(
            "field '{}' failed to fill: {}",
            title, msg
        ))),
        Err(other) => Err(FieldFailure::Fatal(other)),
    }
}

/// Fill every configured sub-field in page order, then submit (unless
/// `submit` is off, for test runs and submit-disabled deployments).
///
/// A failed non-critical field is skipped with a warning; a failed critical
/// field aborts the run with `Failure` and nothing is submitted. A run that
/// submitted but skipped fields reports `PossibleFailure`.
pub async fn fill_form(
    page: &mut dyn FormPage,
    sub_fields: &[SubField],
    ctx: &EvalContext,
    submit: bool,
) -> Result<FillReport, FillError> {
    let mut fields: Vec<&SubField> = sub_fields.iter().collect();
    fields.sort_by_key(|f| f.index_on_page);

    let mut warnings = Vec::new();
    for field in fields {
        match fill_one(page, field, ctx).await {
            Ok(()) => {}
            Err(FieldFailure::Skip(msg)) if !field.critical => {
                warn!(field = %field.expected_label_segment, "skipping non-critical field: {}", msg);
                warnings.push(msg);
            }
            Err(FieldFailure::Skip(msg)) => {
                return Ok(FillReport {
                    status: FillStatus::Failure,
                    form_screenshot: None,
                    confirm_screenshot: None,
                    warnings,
                    failure: Some(msg),
                });
            }
            Err(FieldFailure::Fatal(err)) => return Err(err),
        }
    }

    let form_screenshot = page.screenshot().await?;

    if !submit {
        return Ok(FillReport {
            status: if warnings.is_empty() {
                FillStatus::SubmitDisabled
            } else {
                FillStatus::PossibleFailure
            },
            form_screenshot: Some(form_screenshot),
            confirm_screenshot: None,
            warnings,
            failure: None,
        });
    }

    match page.submit().await {
        Ok(()) => {
            let confirm_screenshot = page.screenshot().await?;
            info!("form submitted");
            Ok(FillReport {
                status: if warnings.is_empty() {
                    FillStatus::Success
                } else {
                    FillStatus::PossibleFailure
                },
                form_screenshot: Some(form_screenshot),
                confirm_screenshot: Some(confirm_screenshot),
                warnings,
                failure: None,
            })
        }
        Err(FillError::PossibleFail { message, screenshot }) => Ok(FillReport {
            status: FillStatus::PossibleFailure,
            form_screenshot: Some(form_screenshot),
            confirm_screenshot: Some(screenshot),
            warnings,
            failure: Some(message),
        }),
        Err(other) => Err(other),
    }
}

/// Probe a form's geometry: auth requirement plus (index, title, kind) of
/// every fillable question, and a screenshot with the email redacted.
pub async fn probe_geometry(
    page: &mut dyn FormPage,
) -> Result<(FormGeometry, Vec<u8>), FillError> {
    let mut fields = Vec::new();
    for index in 0..page.field_count() {
        if let Some(kind) = page.field_kind(index).await? {
            fields.push(GeometryField {
                index,
                title: page.field_label(index).await?,
                kind,
            });
        }
    }
    page.redact_email().await;
    let screenshot = page.screenshot().await?;
    Ok((
        FormGeometry {
            auth_required: page.auth_required(),
            fields,
        },
        screenshot,
    ))
}

// CSS hooks into the Google Forms viewer DOM, lifted from its class names.
const SUBMIT_BUTTON: &str = ".freebirdFormviewerViewNavigationSubmitButton";
const ITEM_LIST: &str = ".freebirdFormviewerViewItemList .freebirdFormviewerViewNumberedItemContainer";
const QUESTION_ROOT: &str = ".freebirdFormviewerComponentsQuestionBaseRoot";
const QUESTION_TITLE: &str = ".freebirdFormviewerComponentsQuestionBaseTitle";
const TEXT_ROOT: &str = ".freebirdFormviewerComponentsQuestionTextRoot";
const TEXT_INPUT: &str = "input.quantumWizTextinputPaperinputInput";
const TEXTAREA_INPUT: &str = "textarea.quantumWizTextinputPapertextareaInput";
const RADIO_ROOT: &str = ".freebirdFormviewerComponentsQuestionRadioRoot";
const RADIO_GROUP: &str = ".freebirdFormviewerViewItemsRadiogroupRadioGroup";
const RADIO_OPTION: &str = ".docssharedWizToggleLabeledLabelWrapper";
const DATE_CONTAINER: &str = ".freebirdFormviewerComponentsQuestionDateInputsContainer";
const CHECKBOX_ROOT: &str = ".freebirdFormviewerComponentsQuestionCheckboxRoot";
const CHECKBOX_OPTION: &str = ".quantumWizTogglePapercheckboxInnerBox";
const DROPDOWN_ROOT: &str = ".freebirdFormviewerComponentsQuestionSelectRoot";
const DROPDOWN_OPENER: &str = ".quantumWizMenuPaperselectDropDown";
const DROPDOWN_POPUP_OPTION: &str = "div.exportSelectPopup .quantumWizMenuPaperselectOption";
const DROPDOWN_OPTION: &str = "div.exportSelectPopup .exportOption";
const HEADER_EMAIL: &str = ".freebirdFormviewerViewHeaderEmailAddress";

fn transient(err: WdError) -> FillError {
    match err {
        WdError::NoSuchElement => FillError::InvalidForm("missing element".into()),
        other => FillError::Transient(other.to_string()),
    }
}

/// A Google Forms page driven over WebDriver. Owns the browser session;
/// callers must `close()` it on every path.
pub struct GoogleFormPage {
    session: WdSession,
    items: Vec<ElementRef>,
    auth_required: bool,
}

impl GoogleFormPage {
    /// Navigate to the form, completing the Google -> portal sign-in flow
    /// if the form redirects to it. The session is torn down before any
    /// error is returned.
    pub async fn open(
        driver: &WebDriver,
        url: &str,
        login: &LoginDetails,
    ) -> Result<Self, FillError> {
        let session = driver.new_session().await.map_err(transient)?;
        match Self::open_inner(session, url, login).await {
            Ok(page) => Ok(page),
            Err((session, err)) => {
                session.close().await;
                Err(err)
            }
        }
    }

    async fn open_inner(
        session: WdSession,
        url: &str,
        login: &LoginDetails,
    ) -> Result<Self, (WdSession, FillError)> {
        match Self::load(&session, url, login).await {
            Ok((items, auth_required)) => Ok(Self {
                session,
                items,
                auth_required,
            }),
            Err(err) => Err((session, err)),
        }
    }

    async fn load(
        session: &WdSession,
        url: &str,
        login: &LoginDetails,
    ) -> Result<(Vec<ElementRef>, bool), FillError> {
        session.navigate(url).await.map_err(transient)?;

        let mut auth_required = false;
        let current = session.current_url().await.map_err(transient)?;
        if current.contains("accounts.google.com") {
            auth_required = true;
            Self::auth_flow(session, login).await?;
        }

        // The submit button is the readiness signal; multi-page forms
        // never show one and are rejected.
        let waited = session
            .wait_for("form load", PAGE_LOAD_TIMEOUT, || async {
                match session.find_elements(SUBMIT_BUTTON).await {
                    Ok(found) if !found.is_empty() => Ok(Some(())),
                    Ok(_) => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await;
        if let Err(err) = waited {
            let current = session.current_url().await.unwrap_or_default();
            return Err(if current.contains("alreadyresponded") {
                FillError::InvalidForm("form already responded to".into())
            } else if current.contains("formrestricted") {
                FillError::AuthFailed("form not accessible by account".into())
            } else if matches!(err, WdError::Timeout(_)) {
                FillError::InvalidForm("form has no submit button; may be multi-page".into())
            } else {
                transient(err)
            });
        }

        let items = session.find_elements(ITEM_LIST).await.map_err(transient)?;
        Ok((items, auth_required))
    }

    async fn auth_flow(session: &WdSession, login: &LoginDetails) -> Result<(), FillError> {
        let auth = |err: WdError| match err {
            WdError::NoSuchElement => {
                FillError::AuthFailed("invalid authentication challenge page".into())
            }
            WdError::Timeout(_) => FillError::AuthFailed("invalid authentication".into()),
            other => transient(other),
        };

        session
            .wait_for("google sign-in page", PAGE_LOAD_TIMEOUT, || async {
                match session.find_elements("#identifierNext").await {
                    Ok(found) if !found.is_empty() => Ok(Some(())),
                    Ok(_) => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await
            .map_err(auth)?;

        let email_field = session.find_element("#identifierId").await.map_err(auth)?;
        session
            .send_keys(&email_field, &login.email)
            .await
            .map_err(auth)?;
        let next = session.find_element("#identifierNext").await.map_err(auth)?;
        session.click(&next).await.map_err(auth)?;

        // Google hands off to the school portal for the password step.
        session
            .wait_for("portal redirect", AUTH_REDIRECT_TIMEOUT, || async {
                let url = session.current_url().await?;
                Ok(url.contains(PORTAL_HOST).then_some(()))
            })
            .await
            .map_err(auth)?;
        session
            .wait_for("portal sign-in form", PAGE_LOAD_TIMEOUT, || async {
                match session.find_elements("#TdsbLoginControl_Login").await {
                    Ok(found) if !found.is_empty() => Ok(Some(())),
                    Ok(_) => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await
            .map_err(auth)?;

        let username = session.find_element("#UserName").await.map_err(auth)?;
        session
            .send_keys(&username, &login.username)
            .await
            .map_err(auth)?;
        let password = session.find_element("#Password").await.map_err(auth)?;
        session
            .send_keys(&password, &login.password)
            .await
            .map_err(auth)?;
        let submit = session
            .find_element("#TdsbLoginControl_Login")
            .await
            .map_err(auth)?;
        session.click(&submit).await.map_err(auth)?;
        Ok(())
    }

    fn item(&self, index: usize) -> Result<&ElementRef, FillError> {
        self.items
            .get(index)
            .ok_or_else(|| FillError::InvalidForm(format!("no page item at index {}", index)))
    }

    async fn has_within(&self, parent: &ElementRef, css: &str) -> Result<bool, FillError> {
        let found = self
            .session
            .find_elements_within(parent, css)
            .await
            .map_err(transient)?;
        Ok(!found.is_empty())
    }

    async fn fill_date(
        &self,
        element: &ElementRef,
        date: chrono::NaiveDate,
    ) -> Result<(), FillError> {
        use chrono::Datelike;
        let components = self
            .session
            .find_elements_within(element, TEXT_INPUT)
            .await
            .map_err(transient)?;
        let mut month = None;
        let mut day = None;
        let mut year = None;
        // The three spinners are distinguishable only by their range
        // attributes.
        for input in &components {
            let max = self
                .session
                .attribute(input, "max")
                .await
                .map_err(transient)?;
            let min = self
                .session
                .attribute(input, "min")
                .await
                .map_err(transient)?;
            match max.as_deref() {
                Some("12") => month = Some(input),
                Some("31") => day = Some(input),
                _ => {
                    if min.and_then(|m| m.parse::<i64>().ok()).is_some_and(|m| m >= 1000) {
                        year = Some(input);
                    }
                }
            }
        }
        let (month, day, year) = match (month, day, year) {
            (Some(m), Some(d), Some(y)) => (m, d, y),
            _ => return Err(FillError::InvalidForm("date inputs not recognized".into())),
        };
        self.session
            .send_keys(month, &date.month().to_string())
            .await
            .map_err(transient)?;
        self.session
            .send_keys(day, &date.day().to_string())
            .await
            .map_err(transient)?;
        self.session
            .send_keys(year, &date.year().to_string())
            .await
            .map_err(transient)?;
        Ok(())
    }

    async fn click_option(
        &self,
        element: &ElementRef,
        css: &str,
        index: usize,
    ) -> Result<(), FillError> {
        let options = self
            .session
            .find_elements_within(element, css)
            .await
            .map_err(transient)?;
        let option = options
            .get(index)
            .ok_or_else(|| FillError::InvalidForm("option out of range".into()))?;
        self.session.click(option).await.map_err(transient)
    }

    async fn fill_dropdown(&self, element: &ElementRef, index: usize) -> Result<(), FillError> {
        let opener = self
            .session
            .find_element_within(element, DROPDOWN_OPENER)
            .await
            .map_err(transient)?;
        self.session.click(&opener).await.map_err(transient)?;
        self.session
            .wait_for("dropdown options", PAGE_LOAD_TIMEOUT, || async {
                match self.session.find_elements(DROPDOWN_POPUP_OPTION).await {
                    Ok(found) if !found.is_empty() => Ok(Some(())),
                    Ok(_) => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await
            .map_err(transient)?;
        // First entry is the "Choose" placeholder.
        self.click_option(element, DROPDOWN_OPTION, index + 1).await?;
        // Escape closes the popup so it doesn't cover later fields.
        self.session
            .send_page_keys(ESCAPE_KEY)
            .await
            .map_err(transient)?;
        Ok(())
    }

    pub async fn close(self) {
        self.session.close().await;
    }
}

#[async_trait]
impl FormPage for GoogleFormPage {
    fn auth_required(&self) -> bool {
        self.auth_required
    }

    fn field_count(&self) -> usize {
        self.items.len()
    }

    async fn field_label(&mut self, index: usize) -> Result<String, FillError> {
        let item = self.item(index)?.clone();
        let title = self
            .session
            .find_element_within(&item, QUESTION_TITLE)
            .await
            .map_err(|e| match e {
                WdError::NoSuchElement => {
                    FillError::InvalidForm(format!("form field {} missing header", index))
                }
                other => transient(other),
            })?;
        self.session.text(&title).await.map_err(transient)
    }

    async fn field_kind(&mut self, index: usize) -> Result<Option<FieldKind>, FillError> {
        let item = self.item(index)?.clone();
        if !self.has_within(&item, QUESTION_ROOT).await? {
            return Ok(None);
        }
        if self.has_within(&item, TEXT_ROOT).await? {
            if self.has_within(&item, TEXT_INPUT).await? {
                return Ok(Some(FieldKind::Text));
            }
            if self.has_within(&item, TEXTAREA_INPUT).await? {
                return Ok(Some(FieldKind::LongText));
            }
            return Ok(None);
        }
        if self.has_within(&item, RADIO_ROOT).await? {
            return Ok(if self.has_within(&item, RADIO_GROUP).await? {
                Some(FieldKind::MultipleChoice)
            } else {
                None
            });
        }
        if self.has_within(&item, DATE_CONTAINER).await? {
            return Ok(Some(FieldKind::Date));
        }
        if self.has_within(&item, CHECKBOX_ROOT).await? {
            return Ok(Some(FieldKind::Checkbox));
        }
        if self.has_within(&item, DROPDOWN_ROOT).await? {
            return Ok(Some(FieldKind::Dropdown));
        }
        Ok(None)
    }

    async fn fill_field(
        &mut self,
        index: usize,
        kind: FieldKind,
        value: &Value,
    ) -> Result<(), FillError> {
        let item = self.item(index)?.clone();
        match (kind, value) {
            (FieldKind::Text, Value::Str(text)) => {
                let input = self
                    .session
                    .find_element_within(&item, TEXT_INPUT)
                    .await
                    .map_err(transient)?;
                self.session.send_keys(&input, text).await.map_err(transient)
            }
            (FieldKind::LongText, Value::Str(text)) => {
                let input = self
                    .session
                    .find_element_within(&item, TEXTAREA_INPUT)
                    .await
                    .map_err(transient)?;
                self.session.send_keys(&input, text).await.map_err(transient)
            }
            (FieldKind::Date, Value::Date(date)) => self.fill_date(&item, *date).await,
            (FieldKind::MultipleChoice, value) if value.as_int().is_some() => {
                self.click_option(&item, RADIO_OPTION, option_index(value)?)
                    .await
            }
            (FieldKind::Checkbox, value) if value.as_int().is_some() => {
                self.click_option(&item, CHECKBOX_OPTION, option_index(value)?)
                    .await
            }
            (FieldKind::Dropdown, value) if value.as_int().is_some() => {
                self.fill_dropdown(&item, option_index(value)?).await
            }
            _ => Err(FillError::InvalidForm(format!(
                "{} value does not fit a {} field",
                value.type_name(),
                kind.as_str()
            ))),
        }
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>, FillError> {
        self.session.screenshot().await.map_err(transient)
    }

    async fn submit(&mut self) -> Result<(), FillError> {
        let button = self
            .session
            .find_element(SUBMIT_BUTTON)
            .await
            .map_err(transient)?;
        self.session.click(&button).await.map_err(transient)?;
        let confirmed = self
            .session
            .wait_for("submit confirmation", SUBMIT_CONFIRM_TIMEOUT, || async {
                let url = self.session.current_url().await?;
                Ok(url.contains("formResponse").then_some(()))
            })
            .await;
        match confirmed {
            Ok(()) => Ok(()),
            Err(WdError::Timeout(_)) => {
                let screenshot = self.session.screenshot().await.unwrap_or_default();
                Err(FillError::PossibleFail {
                    message: "timed out waiting for response page".into(),
                    screenshot,
                })
            }
            Err(other) => Err(transient(other)),
        }
    }

    async fn redact_email(&mut self) {
        let tag = match self.session.find_element(HEADER_EMAIL).await {
            Ok(tag) => tag,
            Err(_) => {
                warn!("possible privacy breach: couldn't find an email to redact");
                return;
            }
        };
        let script = "arguments[0].innerText = '<redacted>'";
        if let Err(err) = self.session.execute_script(script, vec![tag.to_json()]).await {
            warn!(error = %err, "email redaction script failed");
        }
    }
}

/// 0-based option index for choice fields; bool values count as index 0 or 1.
fn option_index(value: &Value) -> Result<usize, FillError> {
    let index = value
        .as_int()
        .ok_or_else(|| FillError::InvalidForm(format!("{} is not an option index", value.type_name())))?;
    usize::try_from(index)
        .map_err(|_| FillError::InvalidForm("option index is negative".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MockField {
        label: String,
        kind: FieldKind,
        /// Filling this field fails with an invalid-form error.
        broken: bool,
    }

    struct MockPage {
        fields: Vec<MockField>,
        filled: HashMap<usize, Value>,
        submitted: bool,
        submit_times_out: bool,
    }

    impl MockPage {
        fn new(fields: Vec<MockField>) -> Self {
            Self {
                fields,
                filled: HashMap::new(),
                submitted: false,
                submit_times_out: false,
            }
        }
    }

    #[async_trait]
    impl FormPage for MockPage {
        fn auth_required(&self) -> bool {
            true
        }

        fn field_count(&self) -> usize {
            self.fields.len()
        }

        async fn field_label(&mut self, index: usize) -> Result<String, FillError> {
            Ok(self.fields[index].label.clone())
        }

        async fn field_kind(&mut self, index: usize) -> Result<Option<FieldKind>, FillError> {
            Ok(Some(self.fields[index].kind))
        }

        async fn fill_field(
            &mut self,
            index: usize,
            _kind: FieldKind,
            value: &Value,
        ) -> Result<(), FillError> {
            if self.fields[index].broken {
                return Err(FillError::InvalidForm("element is stuck".into()));
            }
            self.filled.insert(index, value.clone());
            Ok(())
        }

        async fn screenshot(&mut self) -> Result<Vec<u8>, FillError> {
            Ok(vec![0x89, 0x50, 0x4e, 0x47])
        }

        async fn submit(&mut self) -> Result<(), FillError> {
            if self.submit_times_out {
                return Err(FillError::PossibleFail {
                    message: "timed out waiting for response page".into(),
                    screenshot: vec![1, 2, 3],
                });
            }
            self.submitted = true;
            Ok(())
        }

        async fn redact_email(&mut self) {}
    }

    fn text_field(index: usize, label: &str, expr: &str, critical: bool) -> SubField {
        SubField {
            index_on_page: index,
            expected_label_segment: label.to_string(),
            kind: FieldKind::Text,
            critical,
            target_value: expr.to_string(),
        }
    }

    fn page(labels: &[&str]) -> MockPage {
        MockPage::new(
            labels
                .iter()
                .map(|label| MockField {
                    label: label.to_string(),
                    kind: FieldKind::Text,
                    broken: false,
                })
                .collect(),
        )
    }

    fn ctx() -> EvalContext {
        let mut ctx = EvalContext::new();
        ctx.set("name", Value::Str("Ada Lovelace".into()));
        ctx
    }

    #[tokio::test]
    async fn clean_run_submits_and_succeeds() {
        let mut page = page(&["Your full name *", "Anything else?"]);
        let fields = vec![text_field(0, "full name", "$name", true)];
        let report = fill_form(&mut page, &fields, &ctx(), true).await.unwrap();
        assert_eq!(report.status, FillStatus::Success);
        assert!(page.submitted);
        assert_eq!(page.filled[&0], Value::Str("Ada Lovelace".into()));
        assert!(report.form_screenshot.is_some());
        assert!(report.confirm_screenshot.is_some());
        assert!(report.warnings.is_empty());
    }

    #[tokio::test]
    async fn comparison_result_drives_a_checkbox_index() {
        let mut page = MockPage::new(vec![MockField {
            label: "In attendance? *".to_string(),
            kind: FieldKind::Checkbox,
            broken: false,
        }]);
        let mut ctx = EvalContext::new();
        ctx.set("grade", Value::Int(10));
        let fields = vec![SubField {
            index_on_page: 0,
            expected_label_segment: "attendance".to_string(),
            kind: FieldKind::Checkbox,
            critical: true,
            target_value: "$grade >= 10".to_string(),
        }];
        let report = fill_form(&mut page, &fields, &ctx, true).await.unwrap();
        assert_eq!(report.status, FillStatus::Success);
        assert_eq!(page.filled[&0], Value::Bool(true));
        assert!(report.warnings.is_empty());
    }

    #[tokio::test]
    async fn non_critical_miss_is_skipped_and_flagged() {
        let mut page = page(&["Your full name *"]);
        let fields = vec![
            text_field(0, "full name", "$name", true),
            // index 3 does not exist on the page
            text_field(3, "period", "'1'", false),
        ];
        let report = fill_form(&mut page, &fields, &ctx(), true).await.unwrap();
        assert_eq!(report.status, FillStatus::PossibleFailure);
        assert!(page.submitted);
        assert_eq!(report.warnings.len(), 1);
    }

    #[tokio::test]
    async fn critical_miss_aborts_without_submitting() {
        let mut page = page(&["Something unrelated"]);
        let fields = vec![text_field(0, "full name", "$name", true)];
        let report = fill_form(&mut page, &fields, &ctx(), true).await.unwrap();
        assert_eq!(report.status, FillStatus::Failure);
        assert!(!page.submitted);
        assert!(report.failure.unwrap().contains("full name"));
        assert!(report.form_screenshot.is_none());
    }

    #[tokio::test]
    async fn critical_eval_error_aborts() {
        let mut page = page(&["Your full name *"]);
        let fields = vec![text_field(0, "full name", "$missing", true)];
        let report = fill_form(&mut page, &fields, &ctx(), true).await.unwrap();
        assert_eq!(report.status, FillStatus::Failure);
        assert!(!page.submitted);
    }

    #[tokio::test]
    async fn wrong_value_type_is_a_field_failure() {
        let mut page = page(&["Your full name *"]);
        // Int result for a text field
        let fields = vec![text_field(0, "full name", "1 + 1", true)];
        let report = fill_form(&mut page, &fields, &ctx(), true).await.unwrap();
        assert_eq!(report.status, FillStatus::Failure);
    }

    #[tokio::test]
    async fn broken_field_fill_respects_criticality() {
        let mut page = MockPage::new(vec![
            MockField {
                label: "Your full name *".into(),
                kind: FieldKind::Text,
                broken: true,
            },
            MockField {
                label: "Notes".into(),
                kind: FieldKind::Text,
                broken: false,
            },
        ]);
        let fields = vec![
            text_field(0, "full name", "$name", false),
            text_field(1, "Notes", "'hi'", true),
        ];
        let report = fill_form(&mut page, &fields, &ctx(), true).await.unwrap();
        assert_eq!(report.status, FillStatus::PossibleFailure);
        assert!(page.filled.contains_key(&1));
    }

    #[tokio::test]
    async fn dry_run_never_submits() {
        let mut page = page(&["Your full name *"]);
        let fields = vec![text_field(0, "full name", "$name", true)];
        let report = fill_form(&mut page, &fields, &ctx(), false).await.unwrap();
        assert_eq!(report.status, FillStatus::SubmitDisabled);
        assert!(!page.submitted);
        assert!(report.confirm_screenshot.is_none());
    }

    #[tokio::test]
    async fn submit_timeout_is_possible_failure_with_evidence() {
        let mut page = page(&["Your full name *"]);
        page.submit_times_out = true;
        let fields = vec![text_field(0, "full name", "$name", true)];
        let report = fill_form(&mut page, &fields, &ctx(), true).await.unwrap();
        assert_eq!(report.status, FillStatus::PossibleFailure);
        assert_eq!(report.confirm_screenshot, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn probe_reports_every_question() {
        let mut page = MockPage::new(vec![
            MockField {
                label: "Your full name *".into(),
                kind: FieldKind::Text,
                broken: false,
            },
            MockField {
                label: "Today's date *".into(),
                kind: FieldKind::Date,
                broken: false,
            },
        ]);
        let (geometry, screenshot) = probe_geometry(&mut page).await.unwrap();
        assert!(geometry.auth_required);
        assert_eq!(geometry.fields.len(), 2);
        assert_eq!(geometry.fields[1].kind, FieldKind::Date);
        assert!(!screenshot.is_empty());
    }
}
