//! Lazy, idempotent provisioning of durable queue resources.
//!
//! A durable queue is a primary queue plus a dead letter companion, both
//! encrypted with the account's shared key and guarded by an access policy.
//! Resources are looked up first and only created when absent, so any number
//! of brokers may provision the same name against one account.

use crate::error::QueueError;
use crate::names::PhysicalName;
use crate::providers::{CloudBackend, CloudError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Alias of the key shared by every queue and topic
pub const ENCRYPTION_KEY_ALIAS: &str = "alias/sns_and_sqs";

/// Receives after which a message moves to the dead letter queue
pub const MAX_RECEIVE_COUNT: u32 = 5;

pub const QUEUE_POLICY_VERSION: &str = "2008-10-17";
pub const KEY_POLICY_VERSION: &str = "2012-10-17";

const TOPIC_SERVICE_PRINCIPAL: &str = "sns.amazonaws.com";
const QUEUE_SERVICE_PRINCIPAL: &str = "sqs.amazonaws.com";

const KEY_ADMIN_ACTIONS: [&str; 14] = [
    "kms:Create*",
    "kms:Describe*",
    "kms:Enable*",
    "kms:List*",
    "kms:Put*",
    "kms:Update*",
    "kms:Revoke*",
    "kms:Disable*",
    "kms:Get*",
    "kms:Delete*",
    "kms:TagResource",
    "kms:UntagResource",
    "kms:ScheduleKeyDeletion",
    "kms:CancelKeyDeletion",
];

// ============================================================================
// Policy Documents
// ============================================================================

/// IAM-style policy document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyDocument {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub statement: Vec<StatementEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatementEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    pub effect: String,
    pub principal: Principal,
    pub action: Vec<String>,
    pub resource: String,
    /// Operator, then condition key, then value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<BTreeMap<String, BTreeMap<String, String>>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Principal {
    #[serde(rename = "AWS")]
    Aws(String),
    Service(String),
}

impl StatementEntry {
    fn allow(principal: Principal, actions: &[&str], resource: impl Into<String>) -> Self {
        Self {
            sid: None,
            effect: "Allow".to_string(),
            principal,
            action: actions.iter().map(|a| a.to_string()).collect(),
            resource: resource.into(),
            condition: None,
        }
    }
}

impl PolicyDocument {
    pub fn to_json(&self) -> Result<String, QueueError> {
        Ok(serde_json::to_string(self).map_err(crate::error::SerializationError::from)?)
    }
}

/// Access policy for a queue owned by `account`
///
/// The owner gets full access. With a `topic_arn`, the broadcast service may
/// also send messages, but only on behalf of that topic.
pub fn queue_policy(queue_arn: &str, account: &str, topic_arn: Option<&str>) -> PolicyDocument {
    let mut statement = vec![StatementEntry::allow(
        Principal::Aws(format!("arn:aws:iam::{}:root", account)),
        &["SQS:*"],
        queue_arn,
    )];

    if let Some(topic_arn) = topic_arn {
        let mut grant = StatementEntry::allow(
            Principal::Service(TOPIC_SERVICE_PRINCIPAL.to_string()),
            &["SQS:SendMessage"],
            queue_arn,
        );
        grant.condition = Some(BTreeMap::from([(
            "ArnEquals".to_string(),
            BTreeMap::from([("aws:SourceArn".to_string(), topic_arn.to_string())]),
        )]));
        statement.push(grant);
    }

    PolicyDocument {
        version: QUEUE_POLICY_VERSION.to_string(),
        id: None,
        statement,
    }
}

/// Policy for the shared encryption key
pub fn key_policy(account: &str, caller_arn: &str) -> PolicyDocument {
    let mut root = StatementEntry::allow(
        Principal::Aws(format!("arn:aws:iam::{}:root", account)),
        &["kms:*"],
        "*",
    );
    root.sid = Some("Enable IAM User Permissions".to_string());

    let mut admin = StatementEntry::allow(
        Principal::Aws(caller_arn.to_string()),
        &KEY_ADMIN_ACTIONS,
        "*",
    );
    admin.sid = Some("Allow access for Key Administrators".to_string());

    PolicyDocument {
        version: KEY_POLICY_VERSION.to_string(),
        id: Some("key-consolepolicy-3".to_string()),
        statement: vec![
            root,
            admin,
            StatementEntry::allow(
                Principal::Service(TOPIC_SERVICE_PRINCIPAL.to_string()),
                &["kms:GenerateDataKey", "kms:Decrypt", "kms:Get*"],
                "*",
            ),
            StatementEntry::allow(
                Principal::Service(QUEUE_SERVICE_PRINCIPAL.to_string()),
                &["kms:GenerateDataKey", "kms:Decrypt"],
                "*",
            ),
        ],
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RedrivePolicy<'a> {
    dead_letter_target_arn: &'a str,
    max_receive_count: u32,
}

/// Redrive policy sending messages to `dead_letter_arn` after too many receives
pub fn redrive_policy(dead_letter_arn: &str) -> Result<String, QueueError> {
    let policy = RedrivePolicy {
        dead_letter_target_arn: dead_letter_arn,
        max_receive_count: MAX_RECEIVE_COUNT,
    };
    Ok(serde_json::to_string(&policy).map_err(crate::error::SerializationError::from)?)
}

// ============================================================================
// Provisioner
// ============================================================================

/// A queue that exists remotely
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedQueue {
    pub name: PhysicalName,
    pub url: String,
    pub arn: String,
}

/// Creates queues and the shared key on demand
pub struct Provisioner {
    cloud: Arc<dyn CloudBackend>,
    region: String,
    key_ensured: OnceCell<()>,
}

fn provisioning_error(resource: &str, error: CloudError) -> QueueError {
    QueueError::Provisioning {
        resource: resource.to_string(),
        message: error.to_string(),
    }
}

impl Provisioner {
    pub fn new(cloud: Arc<dyn CloudBackend>, region: impl Into<String>) -> Self {
        Self {
            cloud,
            region: region.into(),
            key_ensured: OnceCell::new(),
        }
    }

    /// Make sure the shared encryption key exists
    ///
    /// Succeeds without remote calls once it has succeeded for this provisioner.
    pub async fn ensure_encryption_key(&self) -> Result<(), QueueError> {
        self.key_ensured
            .get_or_try_init(|| self.create_key_if_missing())
            .await?;
        Ok(())
    }

    async fn create_key_if_missing(&self) -> Result<(), QueueError> {
        let aliases = self
            .cloud
            .list_aliases()
            .await
            .map_err(|e| provisioning_error(ENCRYPTION_KEY_ALIAS, e))?;
        if aliases.iter().any(|a| a == ENCRYPTION_KEY_ALIAS) {
            debug!(alias = ENCRYPTION_KEY_ALIAS, "Encryption key exists");
            return Ok(());
        }

        let identity = self
            .cloud
            .caller_identity()
            .await
            .map_err(|e| provisioning_error(ENCRYPTION_KEY_ALIAS, e))?;
        let policy = key_policy(&identity.account, &identity.arn).to_json()?;

        let key_id = self
            .cloud
            .create_key(&policy)
            .await
            .map_err(|e| provisioning_error(ENCRYPTION_KEY_ALIAS, e))?;

        match self.cloud.create_alias(ENCRYPTION_KEY_ALIAS, &key_id).await {
            Ok(()) => {
                info!(alias = ENCRYPTION_KEY_ALIAS, key_id = %key_id, "Created encryption key");
                Ok(())
            }
            // Another broker bound the alias first; its key is used
            Err(CloudError::AlreadyExists(_)) => {
                debug!(alias = ENCRYPTION_KEY_ALIAS, key_id = %key_id, "Encryption key alias taken concurrently");
                Ok(())
            }
            Err(e) => Err(provisioning_error(ENCRYPTION_KEY_ALIAS, e)),
        }
    }

    /// Find the queue called `name` or create it with its dead letter queue
    ///
    /// `topic_arn` adds the broadcast send grant for that topic to the access
    /// policy of newly created queues. Existing queues are returned as they are.
    pub async fn get_or_create_queue(
        &self,
        name: &PhysicalName,
        topic_arn: Option<&str>,
    ) -> Result<ProvisionedQueue, QueueError> {
        match self.cloud.get_queue_url(name.as_str()).await {
            Ok(url) => {
                let arn = self
                    .cloud
                    .get_queue_arn(&url)
                    .await
                    .map_err(|e| provisioning_error(name.as_str(), e))?;
                info!(queue = %name, url = %url, "Using existing queue");
                return Ok(ProvisionedQueue {
                    name: name.clone(),
                    url,
                    arn,
                });
            }
            Err(CloudError::QueueNotFound(_)) => {}
            Err(e) => return Err(provisioning_error(name.as_str(), e)),
        }

        self.ensure_encryption_key().await?;

        let identity = self
            .cloud
            .caller_identity()
            .await
            .map_err(|e| provisioning_error(name.as_str(), e))?;
        let queue_arn = format!("arn:aws:sqs:{}:{}:{}", self.region, identity.account, name);
        let policy = queue_policy(&queue_arn, &identity.account, topic_arn).to_json()?;

        let dead_letter = name.dead_letter();
        let mut attributes = HashMap::from([
            ("KmsMasterKeyId".to_string(), ENCRYPTION_KEY_ALIAS.to_string()),
            ("Policy".to_string(), policy),
        ]);

        let dead_letter_url = self
            .cloud
            .create_queue(dead_letter.as_str(), &attributes)
            .await
            .map_err(|e| provisioning_error(dead_letter.as_str(), e))?;
        let dead_letter_arn = self
            .cloud
            .get_queue_arn(&dead_letter_url)
            .await
            .map_err(|e| provisioning_error(dead_letter.as_str(), e))?;

        attributes.insert(
            "RedrivePolicy".to_string(),
            redrive_policy(&dead_letter_arn)?,
        );
        let url = self
            .cloud
            .create_queue(name.as_str(), &attributes)
            .await
            .map_err(|e| provisioning_error(name.as_str(), e))?;
        let arn = self
            .cloud
            .get_queue_arn(&url)
            .await
            .map_err(|e| provisioning_error(name.as_str(), e))?;

        info!(queue = %name, url = %url, dead_letter_url = %dead_letter_url, "Created queues");

        Ok(ProvisionedQueue {
            name: name.clone(),
            url,
            arn,
        })
    }
}

#[cfg(test)]
#[path = "provisioning_tests.rs"]
mod tests;
