//! Queue configuration.
//!
//! Settings are read from an optional file (YAML, TOML or JSON, chosen by
//! extension) and then from environment variables prefixed `BGQ` with a
//! double-underscore separator, later sources overriding earlier ones:
//!
//! ```text
//! BGQ__LOCAL=true
//! BGQ__PREFIX=prod
//! BGQ__AWS__REGION=eu-north-1
//! BGQ__POLL__WAIT_TIME_SECONDS=10
//! ```
//!
//! Every field carries a default, so an unconfigured environment produces a
//! usable local setup once `local` is switched on.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::warn;

pub const ENV_PREFIX: &str = "BGQ";

const REDACTED: &str = "<redacted>";

// ============================================================================
// Queue Settings
// ============================================================================

/// Top-level settings selecting and configuring a broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Use the in-process broker instead of the durable one
    pub local: bool,
    /// Host component of physical queue names, defaults to the machine hostname
    pub hostname: Option<String>,
    /// Environment namespace for every remote resource
    pub prefix: String,
    pub aws: AwsSettings,
    pub poll: PollSettings,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            local: false,
            hostname: None,
            prefix: "dev".to_string(),
            aws: AwsSettings::default(),
            poll: PollSettings::default(),
        }
    }
}

impl QueueSettings {
    /// Load settings from an optional file followed by `BGQ__*` variables
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings: Self = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.poll.validate()?;

        if let Some(hostname) = &self.hostname {
            if hostname.trim().is_empty() {
                return Err(ConfigurationError::Invalid {
                    message: "hostname must not be empty when set".to_string(),
                });
            }
        }

        if self.local {
            return Ok(());
        }

        if self.prefix.trim().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "prefix".to_string(),
            });
        }

        if self.aws.region.trim().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "aws.region".to_string(),
            });
        }

        if let Some(endpoint) = &self.aws.endpoint {
            url::Url::parse(endpoint).map_err(|e| ConfigurationError::Invalid {
                message: format!("aws.endpoint '{}' is not a valid URL: {}", endpoint, e),
            })?;
        }

        Ok(())
    }

    /// Hostname used in physical queue names
    pub fn resolved_hostname(&self) -> String {
        match &self.hostname {
            Some(hostname) => hostname.clone(),
            None => default_hostname(),
        }
    }

    /// Copy of the settings that is safe to print
    pub fn redacted(&self) -> Self {
        let mut settings = self.clone();
        if settings.aws.secret_access_key.is_some() {
            settings.aws.secret_access_key = Some(REDACTED.to_string());
        }
        if settings.aws.session_token.is_some() {
            settings.aws.session_token = Some(REDACTED.to_string());
        }
        settings
    }
}

/// Short machine hostname: `HOSTNAME`, then the operating system's hostname
///
/// Only the first DNS label is kept since physical queue names cannot
/// contain dots. Falls back to `localhost` with a warning when neither is
/// available, in which case hosts share physical queues.
pub fn default_hostname() -> String {
    let from_env = std::env::var("HOSTNAME").ok();
    let from_system = || gethostname::gethostname().into_string().ok();

    match short_hostname(from_env).or_else(|| short_hostname(from_system())) {
        Some(hostname) => hostname,
        None => {
            warn!("Machine hostname unavailable, using 'localhost'; set `hostname` to keep hosts apart");
            "localhost".to_string()
        }
    }
}

fn short_hostname(full: Option<String>) -> Option<String> {
    full?
        .trim()
        .split('.')
        .next()
        .filter(|label| !label.is_empty())
        .map(str::to_string)
}

// ============================================================================
// AWS Settings
// ============================================================================

/// Connection settings for the durable broker's cloud account
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsSettings {
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    /// Override for every service endpoint, e.g. a local emulator
    pub endpoint: Option<String>,
}

impl Default for AwsSettings {
    fn default() -> Self {
        Self {
            region: "eu-north-1".to_string(),
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            endpoint: None,
        }
    }
}

impl AwsSettings {
    /// Credentials from settings, falling back to the standard `AWS_*` variables
    pub fn resolve_credentials(&self) -> Option<AwsCredentials> {
        let from_env = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());

        let access_key_id = self
            .access_key_id
            .clone()
            .or_else(|| from_env("AWS_ACCESS_KEY_ID"))?;
        let secret_access_key = self
            .secret_access_key
            .clone()
            .or_else(|| from_env("AWS_SECRET_ACCESS_KEY"))?;
        let session_token = self
            .session_token
            .clone()
            .or_else(|| from_env("AWS_SESSION_TOKEN"));

        Some(AwsCredentials {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

impl fmt::Debug for AwsSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsSettings")
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| REDACTED),
            )
            .field("session_token", &self.session_token.as_ref().map(|_| REDACTED))
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// Resolved request-signing credentials
#[derive(Clone, PartialEq, Eq)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &REDACTED)
            .field("session_token", &self.session_token.as_ref().map(|_| REDACTED))
            .finish()
    }
}

// ============================================================================
// Poll Settings
// ============================================================================

/// Receive loop tuning for durable subscriptions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    /// Long poll duration, at most 20 seconds
    pub wait_time_seconds: u32,
    /// Messages per receive call, 1 to 10
    pub max_messages: u32,
    /// Pause after a failed receive call
    pub error_backoff_ms: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            wait_time_seconds: 20,
            max_messages: 10,
            error_backoff_ms: 1000,
        }
    }
}

impl PollSettings {
    pub const MAX_WAIT_TIME_SECONDS: u32 = 20;
    pub const MAX_MESSAGES: u32 = 10;

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.wait_time_seconds > Self::MAX_WAIT_TIME_SECONDS {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "poll.wait_time_seconds must be at most {}",
                    Self::MAX_WAIT_TIME_SECONDS
                ),
            });
        }

        if self.max_messages == 0 || self.max_messages > Self::MAX_MESSAGES {
            return Err(ConfigurationError::Invalid {
                message: format!("poll.max_messages must be 1-{}", Self::MAX_MESSAGES),
            });
        }

        Ok(())
    }

    pub fn error_backoff(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.error_backoff_ms)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
