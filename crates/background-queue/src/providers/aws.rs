//! AWS cloud backend using the HTTP APIs directly.
//!
//! This module implements the cloud service traits with signed HTTP calls
//! instead of the AWS SDK, which keeps the backend testable against mocked
//! HTTP responses.
//!
//! ## Protocols
//!
//! - **SQS, SNS, STS**: query protocol. Parameters are form-encoded into a
//!   POST body and responses are XML.
//! - **KMS**: JSON protocol. The operation travels in `X-Amz-Target` and the
//!   request and response bodies are JSON.
//!
//! ## Authentication
//!
//! Every request is signed with AWS Signature Version 4. Credentials come
//! from [`AwsSettings`] or the standard `AWS_*` environment variables; a
//! session token is sent as `x-amz-security-token` when present.
//!
//! ## Local emulators
//!
//! Setting `endpoint` routes every service to one base URL, which is how
//! LocalStack-style emulators are addressed.

use super::{
    CallerIdentity, CloudError, Delivery, IdentityService, KeyService, QueueService,
    TopicService,
};
use crate::config::{AwsCredentials, AwsSettings};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{debug, instrument};

#[cfg(test)]
#[path = "aws_tests.rs"]
mod tests;

const SQS_VERSION: &str = "2012-11-05";
const SNS_VERSION: &str = "2010-03-31";
const STS_VERSION: &str = "2011-06-15";
const KMS_TARGET_PREFIX: &str = "TrentService";

// ============================================================================
// AWS Signature V4 Signing
// ============================================================================

type HmacSha256 = Hmac<Sha256>;

/// AWS Signature Version 4 signer for request authentication
///
/// Implements the AWS Signature V4 signing process:
/// 1. Create canonical request (method, URI, query, headers, payload)
/// 2. Create string to sign (algorithm, timestamp, scope, request hash)
/// 3. Derive signing key (4-level HMAC chain)
/// 4. Calculate signature and build Authorization header
///
/// ## References
///
/// - [AWS Signature V4](https://docs.aws.amazon.com/general/latest/gr/signature-version-4.html)
#[derive(Clone)]
struct AwsV4Signer {
    access_key: String,
    secret_key: String,
    session_token: Option<String>,
    region: String,
}

impl AwsV4Signer {
    fn new(credentials: AwsCredentials, region: String) -> Self {
        Self {
            access_key: credentials.access_key_id,
            secret_key: credentials.secret_access_key,
            session_token: credentials.session_token,
            region,
        }
    }

    /// Sign an HTTP request with AWS Signature V4
    ///
    /// Returns the headers to add to the request: `Authorization`,
    /// `x-amz-date`, `host` and, with temporary credentials,
    /// `x-amz-security-token`.
    #[allow(clippy::too_many_arguments)]
    fn sign_request(
        &self,
        service: &str,
        method: &str,
        host: &str,
        path: &str,
        query_params: &[(String, String)],
        body: &str,
        timestamp: &DateTime<Utc>,
    ) -> HashMap<String, String> {
        let date_stamp = timestamp.format("%Y%m%d").to_string();
        let amz_date = timestamp.format("%Y%m%dT%H%M%SZ").to_string();

        // Sort query parameters for canonical request
        let mut canonical_query_string = query_params
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>();
        canonical_query_string.sort();
        let canonical_query_string = canonical_query_string.join("&");

        // Canonical headers (must be sorted)
        let mut canonical_headers = format!("host:{}\nx-amz-date:{}\n", host, amz_date);
        let mut signed_headers = "host;x-amz-date".to_string();
        if let Some(token) = &self.session_token {
            canonical_headers.push_str(&format!("x-amz-security-token:{}\n", token));
            signed_headers.push_str(";x-amz-security-token");
        }

        let payload_hash = format!("{:x}", Sha256::digest(body.as_bytes()));

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, path, canonical_query_string, canonical_headers, signed_headers, payload_hash
        );

        let algorithm = "AWS4-HMAC-SHA256";
        let credential_scope = format!(
            "{}/{}/{}/aws4_request",
            date_stamp, self.region, service
        );
        let canonical_request_hash = format!("{:x}", Sha256::digest(canonical_request.as_bytes()));

        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            algorithm, amz_date, credential_scope, canonical_request_hash
        );

        let signature = self.calculate_signature(service, &string_to_sign, &date_stamp);

        let authorization_header = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            algorithm, self.access_key, credential_scope, signed_headers, signature
        );

        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), authorization_header);
        headers.insert("x-amz-date".to_string(), amz_date);
        headers.insert("host".to_string(), host.to_string());
        if let Some(token) = &self.session_token {
            headers.insert("x-amz-security-token".to_string(), token.clone());
        }

        headers
    }

    /// Calculate AWS Signature V4 signature
    ///
    /// Uses 4-level HMAC-SHA256 chain to derive signing key:
    /// 1. kDate = HMAC("AWS4" + secret_key, date)
    /// 2. kRegion = HMAC(kDate, region)
    /// 3. kService = HMAC(kRegion, service)
    /// 4. kSigning = HMAC(kService, "aws4_request")
    fn calculate_signature(&self, service: &str, string_to_sign: &str, date_stamp: &str) -> String {
        let k_secret = format!("AWS4{}", self.secret_key);
        let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes());
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, service.as_bytes());
        let k_signing = hmac_sha256(&k_service, b"aws4_request");
        let signature = hmac_sha256(&k_signing, string_to_sign.as_bytes());

        hex::encode(signature)
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

// ============================================================================
// AWS Cloud
// ============================================================================

/// Cloud backend speaking to SQS, SNS, KMS and STS over HTTP
///
/// The backend is thread-safe and shared across tasks behind an `Arc`.
pub struct AwsCloud {
    http_client: HttpClient,
    signer: Option<AwsV4Signer>,
    region: String,
    endpoint_override: Option<String>,
}

impl AwsCloud {
    /// Create new AWS cloud backend
    ///
    /// # Errors
    ///
    /// Returns error if the region is empty, the endpoint override is not a
    /// URL or the HTTP client cannot be built.
    pub fn new(settings: &AwsSettings) -> Result<Self, CloudError> {
        if settings.region.is_empty() {
            return Err(CloudError::ConfigurationError(
                "Region cannot be empty".to_string(),
            ));
        }

        if let Some(endpoint) = &settings.endpoint {
            url::Url::parse(endpoint).map_err(|e| {
                CloudError::ConfigurationError(format!("Invalid endpoint '{}': {}", endpoint, e))
            })?;
        }

        let signer = settings
            .resolve_credentials()
            .map(|credentials| AwsV4Signer::new(credentials, settings.region.clone()));

        // Must outlast the longest long poll
        let http_client = HttpClient::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| {
                CloudError::NetworkError(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            http_client,
            signer,
            region: settings.region.clone(),
            endpoint_override: settings.endpoint.clone(),
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    fn endpoint(&self, service: &str) -> String {
        match &self.endpoint_override {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://{}.{}.amazonaws.com", service, self.region),
        }
    }

    /// Sign and send a POST request, returning the status code and body
    async fn send_signed(
        &self,
        service: &str,
        content_type: &str,
        extra_headers: &[(&str, String)],
        body: String,
    ) -> Result<(u16, String), CloudError> {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| CloudError::Authentication("No credentials configured".to_string()))?;

        let endpoint = self.endpoint(service);
        let url = url::Url::parse(&endpoint)
            .map_err(|e| CloudError::ConfigurationError(format!("Invalid endpoint: {}", e)))?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(CloudError::ConfigurationError(format!(
                    "Endpoint '{}' has no host",
                    endpoint
                )))
            }
        };

        let auth_headers =
            signer.sign_request(service, "POST", &host, url.path(), &[], &body, &Utc::now());

        let mut request = self
            .http_client
            .post(url)
            .header("Content-Type", content_type)
            .body(body);
        for (key, value) in auth_headers {
            request = request.header(key, value);
        }
        for (key, value) in extra_headers {
            request = request.header(*key, value);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                CloudError::NetworkError(format!("Request timeout: {}", e))
            } else if e.is_connect() {
                CloudError::NetworkError(format!("Connection failed: {}", e))
            } else {
                CloudError::NetworkError(format!("HTTP request failed: {}", e))
            }
        })?;

        let status = response.status().as_u16();
        let response_body = response.text().await.map_err(|e| {
            CloudError::NetworkError(format!("Failed to read response body: {}", e))
        })?;

        Ok((status, response_body))
    }

    /// Call a query-protocol action, returning the XML response
    async fn query(
        &self,
        service: &str,
        version: &str,
        action: &str,
        params: Vec<(String, String)>,
    ) -> Result<String, CloudError> {
        let mut form = vec![
            ("Action".to_string(), action.to_string()),
            ("Version".to_string(), version.to_string()),
        ];
        form.extend(params);

        let body = form
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        debug!(service, action, "Calling AWS query API");
        let (status, response) = self
            .send_signed(
                service,
                "application/x-www-form-urlencoded; charset=utf-8",
                &[],
                body,
            )
            .await?;

        if !(200..300).contains(&status) {
            return Err(parse_error_response(&response, status));
        }

        Ok(response)
    }

    /// Call a KMS JSON-protocol operation, returning the JSON response
    async fn kms(&self, operation: &str, request: serde_json::Value) -> Result<String, CloudError> {
        let target = format!("{}.{}", KMS_TARGET_PREFIX, operation);

        debug!(service = "kms", operation, "Calling AWS JSON API");
        let (status, response) = self
            .send_signed(
                "kms",
                "application/x-amz-json-1.1",
                &[("X-Amz-Target", target)],
                request.to_string(),
            )
            .await?;

        if !(200..300).contains(&status) {
            return Err(parse_json_error_response(&response, status));
        }

        Ok(response)
    }
}

/// Numbered query parameters for a map, e.g. `Attribute.1.Name` / `Attribute.1.Value`
fn numbered_entries(
    prefix: &str,
    key_field: &str,
    value_field: &str,
    entries: &HashMap<String, String>,
) -> Vec<(String, String)> {
    let mut sorted: Vec<(&String, &String)> = entries.iter().collect();
    sorted.sort();

    sorted
        .into_iter()
        .enumerate()
        .flat_map(|(i, (key, value))| {
            let n = i + 1;
            [
                (format!("{}.{}.{}", prefix, n, key_field), key.clone()),
                (format!("{}.{}.{}", prefix, n, value_field), value.clone()),
            ]
        })
        .collect()
}

// ============================================================================
// Response Parsing
// ============================================================================

fn xml_error(e: impl std::fmt::Display) -> CloudError {
    CloudError::SerializationError(format!("XML parsing error: {}", e))
}

/// Text of every element named `tag`, in document order
fn xml_values(xml: &str, tag: &str) -> Result<Vec<String>, CloudError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut values = Vec::new();
    let mut in_tag = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) if e.name().as_ref() == tag.as_bytes() => in_tag = true,
            Ok(Event::Text(e)) if in_tag => {
                values.push(e.unescape().map_err(xml_error)?.into_owned());
                in_tag = false;
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == tag.as_bytes() => in_tag = false,
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_error(e)),
            _ => {}
        }
        buf.clear();
    }

    Ok(values)
}

/// Text of the first element named `tag`
fn xml_value(xml: &str, tag: &str) -> Result<String, CloudError> {
    xml_values(xml, tag)?
        .into_iter()
        .next()
        .ok_or_else(|| CloudError::SerializationError(format!("{} not found in response", tag)))
}

/// Parse `<Attribute><Name/><Value/></Attribute>` pairs
fn parse_attributes(xml: &str) -> Result<HashMap<String, String>, CloudError> {
    let names = xml_values(xml, "Name")?;
    let values = xml_values(xml, "Value")?;

    Ok(names.into_iter().zip(values).collect())
}

/// Parse ReceiveMessage XML response
fn parse_receive_message_response(xml: &str) -> Result<Vec<Delivery>, CloudError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut deliveries = Vec::new();
    let mut in_message = false;
    let mut current_message_id: Option<String> = None;
    let mut current_receipt_handle: Option<String> = None;
    let mut current_body: Option<String> = None;
    let mut current_receive_count: u32 = 1;

    let mut in_message_id = false;
    let mut in_receipt_handle = false;
    let mut in_body = false;
    let mut in_attribute_name = false;
    let mut in_attribute_value = false;
    let mut current_attribute_name: Option<String> = None;

    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"Message" => {
                    in_message = true;
                    current_message_id = None;
                    current_receipt_handle = None;
                    current_body = None;
                    current_receive_count = 1;
                }
                b"MessageId" if in_message => in_message_id = true,
                b"ReceiptHandle" if in_message => in_receipt_handle = true,
                b"Body" if in_message => in_body = true,
                b"Name" if in_message => in_attribute_name = true,
                b"Value" if in_message => in_attribute_value = true,
                _ => {}
            },
            Ok(Event::Text(e)) => {
                let text = Some(e.unescape().map_err(xml_error)?.into_owned());
                if in_message_id {
                    current_message_id = text;
                    in_message_id = false;
                } else if in_receipt_handle {
                    current_receipt_handle = text;
                    in_receipt_handle = false;
                } else if in_body {
                    current_body = text;
                    in_body = false;
                } else if in_attribute_name {
                    current_attribute_name = text;
                    in_attribute_name = false;
                } else if in_attribute_value {
                    if current_attribute_name.as_deref() == Some("ApproximateReceiveCount") {
                        if let Some(count) = text.and_then(|t| t.parse().ok()) {
                            current_receive_count = count;
                        }
                    }
                    in_attribute_value = false;
                    current_attribute_name = None;
                }
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == b"Message" => {
                in_message = false;

                if let Some(receipt_handle) = current_receipt_handle.take() {
                    deliveries.push(Delivery {
                        message_id: current_message_id.take().unwrap_or_default(),
                        receipt_handle,
                        body: current_body.take().unwrap_or_default(),
                        receive_count: current_receive_count,
                    });
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_error(e)),
            _ => {}
        }
        buf.clear();
    }

    Ok(deliveries)
}

/// Parse error response from XML
fn parse_error_response(xml: &str, status_code: u16) -> CloudError {
    let code = xml_value(xml, "Code").unwrap_or_else(|_| "Unknown".to_string());
    let message = xml_value(xml, "Message").unwrap_or_else(|_| "Unknown error".to_string());

    map_error_code(&code, message, status_code)
}

/// Parse error response from a JSON-protocol body
fn parse_json_error_response(body: &str, status_code: u16) -> CloudError {
    #[derive(Deserialize)]
    struct JsonError {
        #[serde(rename = "__type", default)]
        kind: Option<String>,
        #[serde(alias = "Message", default)]
        message: Option<String>,
    }

    let parsed: Option<JsonError> = serde_json::from_str(body).ok();
    let code = parsed
        .as_ref()
        .and_then(|e| e.kind.as_deref())
        .map(|kind| kind.rsplit('#').next().unwrap_or(kind).to_string())
        .unwrap_or_else(|| "Unknown".to_string());
    let message = parsed
        .and_then(|e| e.message)
        .unwrap_or_else(|| "Unknown error".to_string());

    map_error_code(&code, message, status_code)
}

/// Map AWS error codes to our error types
fn map_error_code(code: &str, message: String, status_code: u16) -> CloudError {
    match code {
        "AWS.SimpleQueueService.NonExistentQueue" | "QueueDoesNotExist" => {
            CloudError::QueueNotFound(message)
        }
        "InvalidClientTokenId"
        | "UnrecognizedClientException"
        | "SignatureDoesNotMatch"
        | "AccessDeniedException"
        | "ExpiredToken" => CloudError::Authentication(format!("{}: {}", code, message)),
        "InvalidReceiptHandle" | "ReceiptHandleIsInvalid" => CloudError::InvalidReceipt(message),
        "AlreadyExistsException" | "QueueAlreadyExists" => {
            CloudError::AlreadyExists(format!("{}: {}", code, message))
        }
        _ if status_code == 401 || status_code == 403 => {
            CloudError::Authentication(format!("{}: {}", code, message))
        }
        _ => CloudError::ServiceError(format!("{}: {}", code, message)),
    }
}

// ============================================================================
// Queue Service (SQS)
// ============================================================================

#[async_trait]
impl QueueService for AwsCloud {
    #[instrument(skip(self))]
    async fn get_queue_url(&self, name: &str) -> Result<String, CloudError> {
        let response = self
            .query(
                "sqs",
                SQS_VERSION,
                "GetQueueUrl",
                vec![("QueueName".to_string(), name.to_string())],
            )
            .await?;

        xml_value(&response, "QueueUrl")
    }

    async fn get_queue_arn(&self, queue_url: &str) -> Result<String, CloudError> {
        let response = self
            .query(
                "sqs",
                SQS_VERSION,
                "GetQueueAttributes",
                vec![
                    ("QueueUrl".to_string(), queue_url.to_string()),
                    ("AttributeName.1".to_string(), "QueueArn".to_string()),
                ],
            )
            .await?;

        parse_attributes(&response)?
            .remove("QueueArn")
            .ok_or_else(|| CloudError::SerializationError("QueueArn not found in response".to_string()))
    }

    #[instrument(skip(self, attributes))]
    async fn create_queue(
        &self,
        name: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<String, CloudError> {
        let mut params = vec![("QueueName".to_string(), name.to_string())];
        params.extend(numbered_entries("Attribute", "Name", "Value", attributes));

        let response = self.query("sqs", SQS_VERSION, "CreateQueue", params).await?;
        xml_value(&response, "QueueUrl")
    }

    async fn send_message(&self, queue_url: &str, body: &str) -> Result<String, CloudError> {
        let response = self
            .query(
                "sqs",
                SQS_VERSION,
                "SendMessage",
                vec![
                    ("QueueUrl".to_string(), queue_url.to_string()),
                    ("MessageBody".to_string(), body.to_string()),
                ],
            )
            .await?;

        xml_value(&response, "MessageId")
    }

    async fn receive_messages(
        &self,
        queue_url: &str,
        max_messages: u32,
        wait_time_seconds: u32,
    ) -> Result<Vec<Delivery>, CloudError> {
        let response = self
            .query(
                "sqs",
                SQS_VERSION,
                "ReceiveMessage",
                vec![
                    ("QueueUrl".to_string(), queue_url.to_string()),
                    ("MaxNumberOfMessages".to_string(), max_messages.to_string()),
                    ("WaitTimeSeconds".to_string(), wait_time_seconds.to_string()),
                    (
                        "AttributeName.1".to_string(),
                        "ApproximateReceiveCount".to_string(),
                    ),
                ],
            )
            .await?;

        parse_receive_message_response(&response)
    }

    async fn delete_message(
        &self,
        queue_url: &str,
        receipt_handle: &str,
    ) -> Result<(), CloudError> {
        self.query(
            "sqs",
            SQS_VERSION,
            "DeleteMessage",
            vec![
                ("QueueUrl".to_string(), queue_url.to_string()),
                ("ReceiptHandle".to_string(), receipt_handle.to_string()),
            ],
        )
        .await?;

        Ok(())
    }
}

// ============================================================================
// Topic Service (SNS)
// ============================================================================

#[async_trait]
impl TopicService for AwsCloud {
    async fn list_topics(&self) -> Result<Vec<String>, CloudError> {
        let mut arns = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let params = next_token
                .take()
                .map(|token| vec![("NextToken".to_string(), token)])
                .unwrap_or_default();

            let response = self.query("sns", SNS_VERSION, "ListTopics", params).await?;
            arns.extend(xml_values(&response, "TopicArn")?);

            match xml_values(&response, "NextToken")?.into_iter().next() {
                Some(token) if !token.is_empty() => next_token = Some(token),
                _ => break,
            }
        }

        Ok(arns)
    }

    #[instrument(skip(self, attributes, tags))]
    async fn create_topic(
        &self,
        name: &str,
        attributes: &HashMap<String, String>,
        tags: &HashMap<String, String>,
    ) -> Result<String, CloudError> {
        let mut params = vec![("Name".to_string(), name.to_string())];
        params.extend(numbered_entries("Attributes.entry", "key", "value", attributes));
        params.extend(numbered_entries("Tags.member", "Key", "Value", tags));

        let response = self.query("sns", SNS_VERSION, "CreateTopic", params).await?;
        xml_value(&response, "TopicArn")
    }

    #[instrument(skip(self, attributes))]
    async fn subscribe(
        &self,
        topic_arn: &str,
        protocol: &str,
        endpoint: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<String, CloudError> {
        let mut params = vec![
            ("TopicArn".to_string(), topic_arn.to_string()),
            ("Protocol".to_string(), protocol.to_string()),
            ("Endpoint".to_string(), endpoint.to_string()),
            ("ReturnSubscriptionArn".to_string(), "true".to_string()),
        ];
        params.extend(numbered_entries("Attributes.entry", "key", "value", attributes));

        let response = self.query("sns", SNS_VERSION, "Subscribe", params).await?;
        xml_value(&response, "SubscriptionArn")
    }

    async fn publish(&self, topic_arn: &str, message: &str) -> Result<String, CloudError> {
        let response = self
            .query(
                "sns",
                SNS_VERSION,
                "Publish",
                vec![
                    ("TopicArn".to_string(), topic_arn.to_string()),
                    ("Message".to_string(), message.to_string()),
                ],
            )
            .await?;

        xml_value(&response, "MessageId")
    }
}

// ============================================================================
// Key Service (KMS)
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListAliasesResponse {
    #[serde(default)]
    aliases: Vec<AliasEntry>,
    #[serde(default)]
    truncated: bool,
    next_marker: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AliasEntry {
    alias_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateKeyResponse {
    key_metadata: KeyMetadata,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KeyMetadata {
    key_id: String,
}

fn decode_json<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, CloudError> {
    serde_json::from_str(body)
        .map_err(|e| CloudError::SerializationError(format!("JSON parsing error: {}", e)))
}

#[async_trait]
impl KeyService for AwsCloud {
    async fn list_aliases(&self) -> Result<Vec<String>, CloudError> {
        let mut aliases = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let request = match marker.take() {
                Some(marker) => serde_json::json!({ "Marker": marker }),
                None => serde_json::json!({}),
            };

            let page: ListAliasesResponse = decode_json(&self.kms("ListAliases", request).await?)?;
            aliases.extend(page.aliases.into_iter().map(|a| a.alias_name));

            match page.next_marker {
                Some(next) if page.truncated => marker = Some(next),
                _ => break,
            }
        }

        Ok(aliases)
    }

    #[instrument(skip(self, policy))]
    async fn create_key(&self, policy: &str) -> Result<String, CloudError> {
        let response = self
            .kms(
                "CreateKey",
                serde_json::json!({
                    "Policy": policy,
                    "Description": "Encryption key for background queues and broadcast topics",
                }),
            )
            .await?;

        let created: CreateKeyResponse = decode_json(&response)?;
        Ok(created.key_metadata.key_id)
    }

    #[instrument(skip(self))]
    async fn create_alias(&self, alias: &str, key_id: &str) -> Result<(), CloudError> {
        self.kms(
            "CreateAlias",
            serde_json::json!({ "AliasName": alias, "TargetKeyId": key_id }),
        )
        .await?;

        Ok(())
    }
}

// ============================================================================
// Identity Service (STS)
// ============================================================================

#[async_trait]
impl IdentityService for AwsCloud {
    async fn caller_identity(&self) -> Result<CallerIdentity, CloudError> {
        let response = self
            .query("sts", STS_VERSION, "GetCallerIdentity", Vec::new())
            .await?;

        Ok(CallerIdentity {
            account: xml_value(&response, "Account")?,
            arn: xml_value(&response, "Arn")?,
        })
    }
}
