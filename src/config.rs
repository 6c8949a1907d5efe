//! Startup configuration, read once from the environment.
//!
//! Required:
//!   - `LOCKBOX_CREDENTIAL_KEY` — base64-encoded 32-byte vault key, or
//!   - `LOCKBOX_CREDENTIAL_KEY_FILE` — path to a raw 32-byte key file
//!     (the inline variable wins when both are set).
//!
//! Optional:
//!   - `LOCKBOX_SCHOOL` — numeric school-code allow-filter; unset means the
//!     account must belong to exactly one school.
//!   - `LOCKBOX_SUBMIT_ENABLED` — "0" disables real submission globally;
//!     fills still run and capture evidence but results are submit-disabled.
//!   - `LOCKBOX_DB_PATH`, `LOCKBOX_API_HOST`, `LOCKBOX_API_PORT`
//!   - `LOCKBOX_SCHOOL_BASE_URL`, `LOCKBOX_WEBDRIVER_URL`
//!   - `LOCKBOX_WORKERS` — worker-pool size, which bounds concurrent
//!     browser sessions.
//!   - `LOCKBOX_ADMIN_TOKEN` — token granting access to admin endpoints.

use anyhow::{Context, Result, bail};
use base64::Engine;

#[derive(Debug, Clone)]
pub struct Config {
    pub credential_key: [u8; 32],
    pub school_code: Option<u32>,
    pub submit_enabled: bool,
    pub db_path: String,
    pub api_host: String,
    pub api_port: u16,
    pub school_base_url: String,
    pub webdriver_url: String,
    pub workers: usize,
    pub admin_token: Option<String>,
}

fn load_key() -> Result<[u8; 32]> {
    let raw = if let Ok(encoded) = std::env::var("LOCKBOX_CREDENTIAL_KEY") {
        base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .context("LOCKBOX_CREDENTIAL_KEY is not valid base64")?
    } else if let Ok(path) = std::env::var("LOCKBOX_CREDENTIAL_KEY_FILE") {
        std::fs::read(&path)
            .with_context(|| format!("cannot read credential key file {}", path))?
    } else {
        bail!(
            "credential encryption key must be provided: set LOCKBOX_CREDENTIAL_KEY or LOCKBOX_CREDENTIAL_KEY_FILE"
        );
    };
    let key: [u8; 32] = raw
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("credential key must be exactly 32 bytes, got {}", raw.len()))?;
    Ok(key)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let credential_key = load_key()?;

        let school_code = match std::env::var("LOCKBOX_SCHOOL") {
            Ok(code) => Some(
                code.trim()
                    .parse::<u32>()
                    .context("LOCKBOX_SCHOOL is not a valid school code")?,
            ),
            Err(_) => None,
        };

        let submit_enabled = std::env::var("LOCKBOX_SUBMIT_ENABLED")
            .map(|v| v.trim() != "0")
            .unwrap_or(true);

        let api_port = match std::env::var("LOCKBOX_API_PORT") {
            Ok(port) => port
                .trim()
                .parse::<u16>()
                .context("LOCKBOX_API_PORT is not a valid port")?,
            Err(_) => 8080,
        };

        let workers = match std::env::var("LOCKBOX_WORKERS") {
            Ok(n) => {
                let n = n
                    .trim()
                    .parse::<usize>()
                    .context("LOCKBOX_WORKERS is not a number")?;
                if n == 0 {
                    bail!("LOCKBOX_WORKERS must be at least 1");
                }
                n
            }
            Err(_) => 3,
        };

        Ok(Self {
            credential_key,
            school_code,
            submit_enabled,
            db_path: std::env::var("LOCKBOX_DB_PATH").unwrap_or_else(|_| "lockbox.db".to_string()),
            api_host: std::env::var("LOCKBOX_API_HOST")
                .unwrap_or_else(|_| "127.0.0.1".to_string()),
            api_port,
            school_base_url: std::env::var("LOCKBOX_SCHOOL_BASE_URL")
                .unwrap_or_else(|_| "https://connects.school.example".to_string()),
            webdriver_url: std::env::var("LOCKBOX_WEBDRIVER_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:4444".to_string()),
            workers,
            admin_token: std::env::var("LOCKBOX_ADMIN_TOKEN").ok(),
        })
    }
}
