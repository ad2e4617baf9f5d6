//! Configuration types and loading
//!
//! Deserialized from a TOML file with serde defaults for the timeouts and
//! credential path. `base_url` is validated at load time so a bad scheme
//! fails fast instead of surfacing as a transient failure per call.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Client configuration
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    /// API base URL, e.g. `https://tracker.example.com`
    pub base_url: String,
    /// Where the credential pair is persisted
    #[serde(default = "default_credential_path")]
    pub credential_path: PathBuf,
    /// Per-request dispatch timeout
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Timeout for the refresh exchange; a hung exchange settles followers
    /// as unavailable after this long
    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_secs: u64,
}

fn default_credential_path() -> PathBuf {
    PathBuf::from("credential.json")
}

fn default_request_timeout() -> u64 {
    30
}

fn default_refresh_timeout() -> u64 {
    10
}

impl ClientConfig {
    /// Load configuration from a TOML file and validate it.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate field constraints.
    pub fn validate(&self) -> common::Result<()> {
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                self.base_url
            )));
        }

        if self.request_timeout_secs == 0 {
            return Err(common::Error::Config(
                "request_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.refresh_timeout_secs == 0 {
            return Err(common::Error::Config(
                "refresh_timeout_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }
}
