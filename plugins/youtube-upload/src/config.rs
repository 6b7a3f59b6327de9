//! Uploader configuration.
//!
//! [`Settings`] is read from a JSON file where every field is optional. The OAuth client
//! credentials can also come from the environment (`YTU_CLIENT_ID`, `YTU_CLIENT_SECRET`,
//! `YTU_REDIRECT_URI`), which take precedence over the file.

use crate::error::UploadError;
use crate::poller::PollPolicy;
use crate::youtube_api::Privacy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// All chunks but the last must be a multiple of this many bytes.
pub const CHUNK_GRANULARITY: u64 = 256 * 1024;

pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// People & Blogs.
pub const DEFAULT_CATEGORY: &str = "22";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub client_id: String,
    pub client_secret: String,
    /// Where the identity provider sends the user back to. Must be a loopback `http` URL for
    /// the interactive CLI flow; a random loopback port is used when unset.
    pub redirect_uri: Option<String>,
    pub chunk_size: u64,
    pub default_category: String,
    pub default_privacy: Privacy,
    pub chunk_timeout_secs: u64,
    pub max_chunk_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub poll: PollPolicy,
    pub endpoints: Endpoints,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            default_category: DEFAULT_CATEGORY.to_string(),
            default_privacy: Privacy::Private,
            chunk_timeout_secs: 60,
            max_chunk_retries: 5,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 64_000,
            poll: PollPolicy::default(),
            endpoints: Endpoints::default(),
        }
    }
}

impl Settings {
    /// Loads settings from `path` (defaults if the file does not exist), applies environment
    /// overrides and validates the result.
    pub async fn load(path: &Path) -> Result<Self, UploadError> {
        let mut settings = match tokio::fs::read_to_string(path).await {
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
                UploadError::Config(format!("parse {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Settings::default()
            }
            Err(e) => return Err(UploadError::Local(e)),
        };
        settings.apply_env(|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    /// Overrides the OAuth client fields from environment-style lookups.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("YTU_CLIENT_ID") {
            self.client_id = v;
        }
        if let Some(v) = lookup("YTU_CLIENT_SECRET") {
            self.client_secret = v;
        }
        if let Some(v) = lookup("YTU_REDIRECT_URI") {
            self.redirect_uri = Some(v);
        }
    }

    pub fn validate(&self) -> Result<(), UploadError> {
        if self.chunk_size == 0 || self.chunk_size % CHUNK_GRANULARITY != 0 {
            return Err(UploadError::Config(format!(
                "chunk_size {} must be a non-zero multiple of {CHUNK_GRANULARITY} bytes",
                self.chunk_size
            )));
        }
        if self.default_category.trim().is_empty() {
            return Err(UploadError::Config("default_category is empty".into()));
        }
        if self.chunk_timeout_secs == 0 {
            return Err(UploadError::Config("chunk_timeout_secs must be positive".into()));
        }
        if self.poll.max_checks == 0 {
            return Err(UploadError::Config("poll.max_checks must be positive".into()));
        }
        Ok(())
    }

    /// Checks that OAuth client credentials are configured.
    pub fn require_client(&self) -> Result<(), UploadError> {
        if self.client_id.is_empty() || self.client_secret.is_empty() {
            return Err(UploadError::Config(
                "client_id and client_secret must be set (config file or YTU_CLIENT_ID/YTU_CLIENT_SECRET)".into(),
            ));
        }
        Ok(())
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }

    /// Delay before retry number `attempt` (starting at 1): exponential, capped.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        let ms = self
            .retry_base_delay_ms
            .saturating_mul(factor)
            .min(self.retry_max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Base URLs of the Google services, configurable so tests can point at a local server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub auth_url: String,
    pub token_url: String,
    pub revocation_url: String,
    /// Base of the Data API, e.g. `https://www.googleapis.com/youtube/v3`.
    pub api_base: String,
    /// Base of the media upload API, e.g. `https://www.googleapis.com/upload/youtube/v3`.
    pub upload_base: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            revocation_url: "https://oauth2.googleapis.com/revoke".to_string(),
            api_base: "https://www.googleapis.com/youtube/v3".to_string(),
            upload_base: "https://www.googleapis.com/upload/youtube/v3".to_string(),
        }
    }
}

impl Endpoints {
    /// Points both API bases at `base`, which is handy for tests.
    pub fn local(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            api_base: format!("{base}/youtube/v3"),
            upload_base: format!("{base}/upload/youtube/v3"),
            token_url: format!("{base}/token"),
            ..Self::default()
        }
    }
}
