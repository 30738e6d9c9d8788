//! API connection settings from the environment or a JSON secrets file

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const ENV_API_URL: &str = "COCOON_API_URL";
pub const ENV_ACCESS_TOKEN: &str = "COCOON_ACCESS_TOKEN";
pub const ENV_REQUEST_TIMEOUT_SECS: &str = "COCOON_REQUEST_TIMEOUT_SECS";

const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Where and how to reach the platform.
///
/// The access token is redacted in `Debug` output.
#[derive(Clone)]
pub struct ApiConfig {
    pub api_url: String,
    pub access_token: Option<String>,
    pub timeout: Duration,
}

impl std::fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiConfig")
            .field("api_url", &self.api_url)
            .field("access_token", &self.access_token.as_ref().map(|_| "<REDACTED>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct SecretsFile {
    api: SecretsApi,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecretsApi {
    api_url: String,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

impl ApiConfig {
    /// Read settings from the process environment, after loading a local `.env`
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let api_url = non_empty(lookup(ENV_API_URL))
            .with_context(|| format!("{} is not set", ENV_API_URL))?;

        let timeout_secs = match non_empty(lookup(ENV_REQUEST_TIMEOUT_SECS)) {
            Some(raw) => raw.trim().parse::<u64>().with_context(|| {
                format!("{} must be a whole number of seconds", ENV_REQUEST_TIMEOUT_SECS)
            })?,
            None => DEFAULT_TIMEOUT_SECS,
        };

        Self::validated(api_url, non_empty(lookup(ENV_ACCESS_TOKEN)), timeout_secs)
    }

    /// Read `{"api": {"apiUrl", "accessToken", "timeoutSecs"}}` from a JSON file
    pub fn from_secrets_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading secrets file {:?}", path))?;
        let secrets: SecretsFile = serde_json::from_str(&text)
            .with_context(|| format!("parsing secrets file {:?}", path))?;

        Self::validated(
            secrets.api.api_url,
            non_empty(secrets.api.access_token),
            secrets.api.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
        )
    }

    fn validated(api_url: String, access_token: Option<String>, timeout_secs: u64) -> Result<Self> {
        let api_url = api_url.trim().trim_end_matches('/').to_string();
        if !(api_url.starts_with("http://") || api_url.starts_with("https://")) {
            bail!("API url must start with http:// or https://, got {:?}", api_url);
        }
        if timeout_secs == 0 {
            bail!("request timeout must be at least one second");
        }

        Ok(Self {
            api_url,
            access_token,
            timeout: Duration::from_secs(timeout_secs),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
