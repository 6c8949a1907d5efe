//! Minimal W3C WebDriver wire client.
//!
//! Speaks just enough of the protocol for form automation: one session at a
//! time, CSS element lookup, keys/click/text, screenshots. Sessions hold a
//! real browser on the remote end, so every exit path must call `close()`.

use std::fmt;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value as Json, json};
use tokio::time::{Instant, sleep};
use tracing::warn;

/// W3C spec key identifying an element reference in a response payload.
const ELEMENT_KEY: &str = "element-6066-11e4-a26e-4f735466cecf";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug)]
pub enum WdError {
    /// The remote end reported `no such element`.
    NoSuchElement,
    /// A wait helper ran out its deadline.
    Timeout(String),
    /// Transport failure talking to the WebDriver endpoint.
    Http(String),
    /// Any other protocol-level error from the remote end.
    Protocol(String),
}

impl fmt::Display for WdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WdError::NoSuchElement => write!(f, "no such element"),
            WdError::Timeout(what) => write!(f, "timed out waiting for {}", what),
            WdError::Http(msg) => write!(f, "webdriver endpoint unreachable: {}", msg),
            WdError::Protocol(msg) => write!(f, "webdriver error: {}", msg),
        }
    }
}

impl std::error::Error for WdError {}

fn wrap(err: reqwest::Error) -> WdError {
    WdError::Http(err.to_string())
}

/// Opaque element reference, valid only within its session.
#[derive(Debug, Clone)]
pub struct ElementRef(String);

impl ElementRef {
    /// Wire representation, for passing an element as a script argument.
    pub fn to_json(&self) -> Json {
        json!({ ELEMENT_KEY: self.0 })
    }
}

pub struct WebDriver {
    client: reqwest::Client,
    base_url: String,
}

impl WebDriver {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Start a headless firefox session.
    pub async fn new_session(&self) -> Result<WdSession, WdError> {
        let body = json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "firefox",
                    "moz:firefoxOptions": { "args": ["-headless"] }
                }
            }
        });
        let value = self.post("/session", &body).await?;
        let session_id = value
            .get("sessionId")
            .and_then(Json::as_str)
            .ok_or_else(|| WdError::Protocol("missing sessionId".into()))?
            .to_string();
        Ok(WdSession {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            session_id,
        })
    }

    async fn post(&self, path: &str, body: &Json) -> Result<Json, WdError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await
            .map_err(wrap)?;
        unwrap_value(response).await
    }
}

/// Decode the `{"value": …}` envelope, translating remote errors.
async fn unwrap_value(response: reqwest::Response) -> Result<Json, WdError> {
    let status = response.status();
    let body: Json = response.json().await.map_err(wrap)?;
    let value = body.get("value").cloned().unwrap_or(Json::Null);
    if status.is_success() {
        return Ok(value);
    }
    let error = value.get("error").and_then(Json::as_str).unwrap_or("");
    if error == "no such element" {
        return Err(WdError::NoSuchElement);
    }
    let message = value
        .get("message")
        .and_then(Json::as_str)
        .unwrap_or("unknown error");
    Err(WdError::Protocol(format!("{}: {}", error, message)))
}

pub struct WdSession {
    client: reqwest::Client,
    base_url: String,
    session_id: String,
}

impl WdSession {
    fn url(&self, rest: &str) -> String {
        format!("{}/session/{}{}", self.base_url, self.session_id, rest)
    }

    async fn post(&self, rest: &str, body: Json) -> Result<Json, WdError> {
        let response = self
            .client
            .post(self.url(rest))
            .json(&body)
            .send()
            .await
            .map_err(wrap)?;
        unwrap_value(response).await
    }

    async fn get(&self, rest: &str) -> Result<Json, WdError> {
        let response = self.client.get(self.url(rest)).send().await.map_err(wrap)?;
        unwrap_value(response).await
    }

    pub async fn navigate(&self, url: &str) -> Result<(), WdError> {
        self.post("/url", json!({ "url": url })).await?;
        Ok(())
    }

    pub async fn current_url(&self) -> Result<String, WdError> {
        let value = self.get("/url").await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| WdError::Protocol("non-string url".into()))
    }

    pub async fn find_element(&self, css: &str) -> Result<ElementRef, WdError> {
        let value = self
            .post("/element", json!({ "using": "css selector", "value": css }))
            .await?;
        element_from(&value)
    }

    pub async fn find_elements(&self, css: &str) -> Result<Vec<ElementRef>, WdError> {
        let value = self
            .post("/elements", json!({ "using": "css selector", "value": css }))
            .await?;
        elements_from(&value)
    }

    pub async fn find_element_within(
        &self,
        parent: &ElementRef,
        css: &str,
    ) -> Result<ElementRef, WdError> {
        let value = self
            .post(
                &format!("/element/{}/element", parent.0),
                json!({ "using": "css selector", "value": css }),
            )
            .await?;
        element_from(&value)
    }

    pub async fn find_elements_within(
        &self,
        parent: &ElementRef,
        css: &str,
    ) -> Result<Vec<ElementRef>, WdError> {
        let value = self
            .post(
                &format!("/element/{}/elements", parent.0),
                json!({ "using": "css selector", "value": css }),
            )
            .await?;
        elements_from(&value)
    }

    pub async fn text(&self, element: &ElementRef) -> Result<String, WdError> {
        let value = self.get(&format!("/element/{}/text", element.0)).await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| WdError::Protocol("non-string element text".into()))
    }

    pub async fn attribute(
        &self,
        element: &ElementRef,
        name: &str,
    ) -> Result<Option<String>, WdError> {
        let value = self
            .get(&format!("/element/{}/attribute/{}", element.0, name))
            .await?;
        Ok(value.as_str().map(str::to_string))
    }

    pub async fn send_keys(&self, element: &ElementRef, text: &str) -> Result<(), WdError> {
        self.post(
            &format!("/element/{}/value", element.0),
            json!({ "text": text }),
        )
        .await?;
        Ok(())
    }

    pub async fn click(&self, element: &ElementRef) -> Result<(), WdError> {
        self.post(&format!("/element/{}/click", element.0), json!({}))
            .await?;
        Ok(())
    }

    /// Send a key chord to the page (not a specific element), e.g. Escape
    /// (`"\u{e00c}"`) to close an open dropdown.
    pub async fn send_page_keys(&self, keys: &str) -> Result<(), WdError> {
        self.post(
            "/actions",
            json!({
                "actions": [{
                    "type": "key",
                    "id": "kb",
                    "actions": keys
                        .chars()
                        .flat_map(|c| {
                            let s = c.to_string();
                            [
                                json!({ "type": "keyDown", "value": s }),
                                json!({ "type": "keyUp", "value": s }),
                            ]
                        })
                        .collect::<Vec<_>>()
                }]
            }),
        )
        .await?;
        Ok(())
    }

    pub async fn execute_script(&self, script: &str, args: Vec<Json>) -> Result<Json, WdError> {
        self.post("/execute/sync", json!({ "script": script, "args": args }))
            .await
    }

    /// Full-page PNG screenshot.
    pub async fn screenshot(&self) -> Result<Vec<u8>, WdError> {
        let value = self.get("/screenshot").await?;
        let encoded = value
            .as_str()
            .ok_or_else(|| WdError::Protocol("non-string screenshot".into()))?;
        BASE64
            .decode(encoded)
            .map_err(|e| WdError::Protocol(format!("bad screenshot encoding: {}", e)))
    }

    /// Poll until `probe` yields a value or the deadline passes.
    pub async fn wait_for<T, F, Fut>(
        &self,
        what: &str,
        timeout: Duration,
        mut probe: F,
    ) -> Result<T, WdError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>, WdError>>,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(found) = probe().await? {
                return Ok(found);
            }
            if Instant::now() >= deadline {
                return Err(WdError::Timeout(what.to_string()));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Tear down the remote browser. Failures are logged, not propagated;
    /// there is nothing useful a caller can do about them.
    pub async fn close(self) {
        let result = self
            .client
            .delete(format!("{}/session/{}", self.base_url, self.session_id))
            .send()
            .await;
        if let Err(err) = result {
            warn!(error = %err, "failed to close webdriver session");
        }
    }
}

fn element_from(value: &Json) -> Result<ElementRef, WdError> {
    value
        .get(ELEMENT_KEY)
        .and_then(Json::as_str)
        .map(|id| ElementRef(id.to_string()))
        .ok_or_else(|| WdError::Protocol("missing element reference".into()))
}

fn elements_from(value: &Json) -> Result<Vec<ElementRef>, WdError> {
    value
        .as_array()
        .ok_or_else(|| WdError::Protocol("non-array element list".into()))?
        .iter()
        .map(element_from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_refs_decode_from_w3c_payloads() {
        let single = json!({ ELEMENT_KEY: "abc-123" });
        assert_eq!(element_from(&single).unwrap().0, "abc-123");

        let many = json!([{ ELEMENT_KEY: "a" }, { ELEMENT_KEY: "b" }]);
        let refs = elements_from(&many).unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[1].0, "b");

        assert!(matches!(
            element_from(&json!({ "wrong": "key" })),
            Err(WdError::Protocol(_))
        ));
    }
}
