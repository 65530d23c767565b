//! Logical and physical queue names.
//!
//! Application code addresses queues by [`LogicalName`]. Remote brokers map a
//! logical name onto a [`PhysicalName`] scoped by environment prefix and host,
//! which keeps environments and machines from consuming each other's work.

use crate::error::{ConfigurationError, ValidationError};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Well-known logical queue names used by the background workers.
pub mod well_known {
    pub const CI_TRIGGER: &str = "ci-trigger";
    pub const CODEBASE_GC: &str = "codebase-gc";
    pub const CODEBASE_GITHUB_CLONER: &str = "codebase-github-cloner";
    pub const CODEBASE_GITHUB_PR_IMPORTER: &str = "codebase-github-pr-importer";
    pub const GITHUB_WEBHOOKS: &str = "github-webhooks";
    pub const VIEW_SNAPSHOT: &str = "view-snapshot";

    /// Every well-known name, in declaration order.
    pub const ALL: [&str; 6] = [
        CI_TRIGGER,
        CODEBASE_GC,
        CODEBASE_GITHUB_CLONER,
        CODEBASE_GITHUB_PR_IMPORTER,
        GITHUB_WEBHOOKS,
        VIEW_SNAPSHOT,
    ];
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

// ============================================================================
// Logical Names
// ============================================================================

/// Validated application-level queue identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LogicalName(String);

impl LogicalName {
    pub const MAX_LEN: usize = 64;

    /// Create new logical name with validation
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();

        if name.is_empty() || name.len() > Self::MAX_LEN {
            return Err(ValidationError::OutOfRange {
                field: "queue_name".to_string(),
                message: format!("must be 1-{} characters", Self::MAX_LEN),
            });
        }

        if !name.chars().all(is_name_char) {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: "only ASCII alphanumeric, hyphens, and underscores allowed".to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Get logical name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LogicalName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LogicalName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for LogicalName {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<LogicalName> for String {
    fn from(name: LogicalName) -> Self {
        name.0
    }
}

// ============================================================================
// Physical Names
// ============================================================================

/// Remote queue name: `{prefix}_{hostname}_{logical}`
///
/// The dead letter companion appends [`PhysicalName::DEAD_LETTER_SUFFIX`], so
/// the primary name is validated against the remote limit with the suffix
/// already accounted for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PhysicalName(String);

impl PhysicalName {
    pub const DEAD_LETTER_SUFFIX: &'static str = "_dead";
    pub const MAX_LEN: usize = 80;

    /// Build the physical name of a logical queue for one environment and host
    pub fn build(
        prefix: &str,
        hostname: &str,
        logical: &LogicalName,
    ) -> Result<Self, ConfigurationError> {
        Self::from_raw(format!("{}_{}_{}", prefix, hostname, logical))
    }

    /// Build the name of the queue one host uses to receive a broadcast topic
    ///
    /// Kept apart from [`PhysicalName::build`] so a host can consume a
    /// logical name as a work queue and as a broadcast at the same time.
    pub fn broadcast_subscriber(
        prefix: &str,
        hostname: &str,
        logical: &LogicalName,
    ) -> Result<Self, ConfigurationError> {
        Self::from_raw(format!("{}_{}_broadcast_{}", prefix, hostname, logical))
    }

    /// Validate an already assembled physical name
    pub fn from_raw(name: impl Into<String>) -> Result<Self, ConfigurationError> {
        let name = name.into();
        let longest = name.len() + Self::DEAD_LETTER_SUFFIX.len();

        if name.is_empty() || longest > Self::MAX_LEN {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "queue name '{}' must leave room for the '{}' suffix within {} characters",
                    name,
                    Self::DEAD_LETTER_SUFFIX,
                    Self::MAX_LEN
                ),
            });
        }

        if let Some(bad) = name.chars().find(|c| !is_name_char(*c)) {
            return Err(ConfigurationError::Invalid {
                message: format!("queue name '{}' contains invalid character '{}'", name, bad),
            });
        }

        Ok(Self(name))
    }

    /// Name of the dead letter queue paired with this queue
    pub fn dead_letter(&self) -> PhysicalName {
        PhysicalName(format!("{}{}", self.0, Self::DEAD_LETTER_SUFFIX))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PhysicalName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Topic Names
// ============================================================================

/// Remote broadcast topic name: `{prefix}_{logical}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicName(String);

impl TopicName {
    pub const MAX_LEN: usize = 256;

    pub fn build(prefix: &str, logical: &LogicalName) -> Result<Self, ConfigurationError> {
        let name = format!("{}_{}", prefix, logical);

        if name.len() > Self::MAX_LEN || !name.chars().all(is_name_char) {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "topic name '{}' must be at most {} ASCII alphanumeric, '-' or '_' characters",
                    name,
                    Self::MAX_LEN
                ),
            });
        }

        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether a topic ARN refers to this topic
    pub fn matches_arn(&self, arn: &str) -> bool {
        arn.strip_suffix(self.0.as_str())
            .is_some_and(|rest| rest.ends_with(':'))
    }
}

impl std::fmt::Display for TopicName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
#[path = "names_tests.rs"]
mod tests;
