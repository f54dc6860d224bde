//! Wire messages of the Celery task protocol
//!
//! Three entities cross the wire:
//!
//! - [`TaskMessage`]: the requested unit of work, `{id, task, args, kwargs, ...}`
//! - [`CeleryMessage`]: the envelope a broker moves around, carrying the task
//!   message as a base64 encoded JSON body plus delivery metadata
//! - [`ResultMessage`]: the outcome a worker stores in the result backend
//!
//! Field names and status codes are fixed by the Celery ecosystem so that
//! Python workers and clients can interoperate with this crate.

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use tracing::warn;
use uuid::Uuid;

use crate::error::{TaskError, TaskResult};

/// Queue, exchange and routing key used when nothing else is configured
pub const DEFAULT_QUEUE: &str = "celery";
/// Content type of an encoded task body
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content encoding of an encoded task body
pub const UTF8_CONTENT_ENCODING: &str = "utf-8";
/// The only body transform this crate understands
pub const BASE64_BODY_ENCODING: &str = "base64";
/// Persistent delivery
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Named task arguments
pub type Kwargs = Map<String, Value>;

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// A unit of requested work
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    /// Globally unique task identifier
    pub id: String,
    /// Registered task name
    pub task: String,
    /// Positional arguments
    #[serde(default, deserialize_with = "null_as_default")]
    pub args: Vec<Value>,
    /// Named arguments
    #[serde(default, deserialize_with = "null_as_default")]
    pub kwargs: Kwargs,
    /// Number of times this task has been retried
    #[serde(default, deserialize_with = "null_as_default")]
    pub retries: u32,
    /// Earliest execution time hint (ISO 8601)
    #[serde(default)]
    pub eta: Option<String>,
    /// Expiry time hint (ISO 8601)
    #[serde(default)]
    pub expires: Option<String>,
}

impl TaskMessage {
    /// Create a task message for `task` with a fresh identifier
    pub fn new<S: Into<String>>(task: S) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task: task.into(),
            ..Default::default()
        }
    }

    /// Set the scheduling hint
    pub fn set_eta(&mut self, eta: DateTime<Utc>) {
        self.eta = Some(eta.to_rfc3339());
    }

    /// Parse the scheduling hint, if present and well formed
    pub fn eta_time(&self) -> Option<DateTime<Utc>> {
        self.eta
            .as_deref()
            .and_then(|eta| DateTime::parse_from_rfc3339(eta).ok())
            .map(|eta| eta.with_timezone(&Utc))
    }

    /// Serialize to canonical JSON
    pub fn encode(&self) -> TaskResult<Vec<u8>> {
        if self.id.is_empty() {
            return Err(TaskError::invalid_payload("task message has no id"));
        }
        if self.task.is_empty() {
            return Err(TaskError::invalid_payload("task message has no task name"));
        }
        serde_json::to_vec(self).map_err(|e| TaskError::invalid_payload(e.to_string()))
    }

    /// Parse canonical JSON
    pub fn decode(bytes: &[u8]) -> TaskResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| TaskError::malformed(e.to_string()))
    }

    /// Forget every field while keeping allocated capacity
    pub(crate) fn clear(&mut self) {
        self.id.clear();
        self.task.clear();
        self.args.clear();
        self.kwargs.clear();
        self.retries = 0;
        self.eta = None;
        self.expires = None;
    }
}

/// Routing information of an envelope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryInfo {
    pub priority: u8,
    pub routing_key: String,
    pub exchange: String,
}

/// Delivery properties of an envelope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CeleryProperties {
    pub body_encoding: String,
    pub correlation_id: String,
    pub reply_to: String,
    pub delivery_info: DeliveryInfo,
    pub delivery_mode: u8,
    pub delivery_tag: String,
}

/// Transport level envelope around an encoded [`TaskMessage`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CeleryMessage {
    pub body: String,
    #[serde(deserialize_with = "null_as_default")]
    pub headers: Map<String, Value>,
    #[serde(rename = "content-type")]
    pub content_type: String,
    #[serde(rename = "content-encoding")]
    pub content_encoding: String,
    pub properties: CeleryProperties,
}

impl CeleryMessage {
    /// Build an envelope around an encoded task body routed to `queue`
    pub fn wrap(task_id: &str, encoded_body: &[u8], content_type: &str, queue: &str) -> Self {
        let mut message = Self::default();
        message.wrap_in_place(task_id, encoded_body, content_type, queue);
        message
    }

    /// Same as [`CeleryMessage::wrap`], reusing this envelope's allocations
    pub fn wrap_in_place(
        &mut self,
        task_id: &str,
        encoded_body: &[u8],
        content_type: &str,
        queue: &str,
    ) {
        self.body.clear();
        BASE64_STANDARD.encode_string(encoded_body, &mut self.body);
        self.headers.clear();
        self.content_type.clear();
        self.content_type.push_str(content_type);
        self.content_encoding.clear();
        self.content_encoding.push_str(UTF8_CONTENT_ENCODING);

        let properties = &mut self.properties;
        properties.body_encoding.clear();
        properties.body_encoding.push_str(BASE64_BODY_ENCODING);
        properties.correlation_id.clear();
        properties.correlation_id.push_str(task_id);
        properties.reply_to = Uuid::new_v4().to_string();
        properties.delivery_mode = DELIVERY_MODE_PERSISTENT;
        properties.delivery_tag = Uuid::new_v4().to_string();
        properties.delivery_info.priority = 0;
        properties.delivery_info.exchange.clear();
        properties.delivery_info.exchange.push_str(queue);
        properties.delivery_info.routing_key.clear();
        properties.delivery_info.routing_key.push_str(queue);
    }

    /// Route directly to `queue`, bypassing the default exchange
    pub fn route_to(&mut self, queue: &str) {
        let info = &mut self.properties.delivery_info;
        info.exchange.clear();
        info.routing_key.clear();
        info.routing_key.push_str(queue);
    }

    /// Routing key the envelope should be delivered under
    pub fn routing_key(&self) -> &str {
        &self.properties.delivery_info.routing_key
    }

    /// Reverse the body transform and decode the task message
    pub fn unwrap(&self) -> TaskResult<TaskMessage> {
        if self.properties.body_encoding != BASE64_BODY_ENCODING {
            return Err(TaskError::malformed(format!(
                "unsupported body encoding '{}'",
                self.properties.body_encoding
            )));
        }
        if self.content_type != JSON_CONTENT_TYPE {
            warn!(
                "Envelope {} has content type '{}', decoding as JSON",
                self.properties.correlation_id, self.content_type
            );
        }

        let body = BASE64_STANDARD
            .decode(self.body.as_bytes())
            .map_err(|e| TaskError::malformed(format!("body is not base64: {}", e)))?;
        TaskMessage::decode(&body)
    }

    /// Serialize the whole envelope for a transport
    pub fn to_json(&self) -> TaskResult<String> {
        serde_json::to_string(self).map_err(|e| TaskError::invalid_payload(e.to_string()))
    }

    /// Parse an envelope received from a transport
    pub fn from_json(raw: &str) -> TaskResult<Self> {
        serde_json::from_str(raw).map_err(|e| TaskError::malformed(e.to_string()))
    }

    pub(crate) fn clear(&mut self) {
        self.body.clear();
        self.headers.clear();
        self.content_type.clear();
        self.content_encoding.clear();
        self.properties.body_encoding.clear();
        self.properties.correlation_id.clear();
        self.properties.reply_to.clear();
        self.properties.delivery_info.priority = 0;
        self.properties.delivery_info.routing_key.clear();
        self.properties.delivery_info.exchange.clear();
        self.properties.delivery_mode = 0;
        self.properties.delivery_tag.clear();
    }
}

/// Task state codes understood by the Celery ecosystem
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultStatus {
    /// Unknown or waiting for execution
    #[default]
    Pending,
    /// Picked up by a worker
    Started,
    /// Being retried
    Retry,
    /// Finished successfully
    Success,
    /// Finished with an error
    Failure,
    /// Cancelled before completion
    Revoked,
}

impl ResultStatus {
    /// Wire code of this status
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Pending => "PENDING",
            ResultStatus::Started => "STARTED",
            ResultStatus::Retry => "RETRY",
            ResultStatus::Success => "SUCCESS",
            ResultStatus::Failure => "FAILURE",
            ResultStatus::Revoked => "REVOKED",
        }
    }

    /// Whether the task will not change state anymore
    pub fn is_ready(&self) -> bool {
        matches!(
            self,
            ResultStatus::Success | ResultStatus::Failure | ResultStatus::Revoked
        )
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of executing a [`TaskMessage`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub task_id: String,
    pub status: ResultStatus,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub traceback: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub children: Vec<Value>,
    #[serde(default)]
    pub date_done: Option<String>,
}

impl ResultMessage {
    /// Successful result carrying `value`
    pub fn success<S: Into<String>>(task_id: S, value: Value) -> Self {
        let mut message = Self::default();
        message.set_success(task_id, value);
        message
    }

    /// Failed result describing `error`
    pub fn failure<S: Into<String>>(task_id: S, error: &TaskError) -> Self {
        let mut message = Self::default();
        message.set_failure(task_id, error);
        message
    }

    /// Overwrite this message with a successful outcome
    pub fn set_success<S: Into<String>>(&mut self, task_id: S, value: Value) {
        self.task_id = task_id.into();
        self.status = ResultStatus::Success;
        self.result = value;
        self.traceback = None;
        self.children.clear();
        self.date_done = Some(Utc::now().to_rfc3339());
    }

    /// Overwrite this message with a failed outcome
    pub fn set_failure<S: Into<String>>(&mut self, task_id: S, error: &TaskError) {
        let description = error.to_string();
        self.task_id = task_id.into();
        self.status = ResultStatus::Failure;
        self.result = json!({
            "exc_type": error.exc_type(),
            "exc_message": description,
        });
        self.traceback = Some(description);
        self.children.clear();
        self.date_done = Some(Utc::now().to_rfc3339());
    }

    /// Human readable account of a non-success outcome
    pub fn description(&self) -> String {
        if let Some(traceback) = &self.traceback {
            return traceback.clone();
        }
        match self.result.get("exc_message").and_then(Value::as_str) {
            Some(message) => message.to_string(),
            None if self.result.is_null() => self.status.to_string(),
            None => self.result.to_string(),
        }
    }

    /// Serialize for storage in a backend
    pub fn encode(&self) -> TaskResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| TaskError::invalid_payload(e.to_string()))
    }

    /// Parse a stored result
    pub fn decode(bytes: &[u8]) -> TaskResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| TaskError::malformed(e.to_string()))
    }

    pub(crate) fn clear(&mut self) {
        self.task_id.clear();
        self.status = ResultStatus::Pending;
        self.result = Value::Null;
        self.traceback = None;
        self.children.clear();
        self.date_done = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> TaskMessage {
        let mut task = TaskMessage::new("worker.add");
        task.args = vec![json!(2), json!(5.5), json!("x"), json!([1, null, true])];
        task.kwargs.insert("nested".to_string(), json!({"k": [1, 2]}));
        task
    }

    #[test]
    fn task_message_survives_encode_decode() {
        let task = sample_task();
        let decoded = TaskMessage::decode(&task.encode().unwrap()).unwrap();
        assert_eq!(decoded, task);
    }

    #[test]
    fn task_message_uses_protocol_field_names() {
        let task = sample_task();
        let value: Value = serde_json::from_slice(&task.encode().unwrap()).unwrap();
        for field in ["id", "task", "args", "kwargs", "retries", "eta", "expires"] {
            assert!(value.get(field).is_some(), "missing field {}", field);
        }
    }

    #[test]
    fn decode_accepts_null_arguments() {
        let raw = br#"{"id":"1","task":"t","args":null,"kwargs":null}"#;
        let task = TaskMessage::decode(raw).unwrap();
        assert!(task.args.is_empty());
        assert!(task.kwargs.is_empty());
        assert_eq!(task.retries, 0);
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = TaskMessage::decode(b"{not json").unwrap_err();
        assert!(matches!(err, TaskError::MalformedMessage { .. }));
    }

    #[test]
    fn encode_rejects_a_nameless_task() {
        let task = TaskMessage::new("");
        assert!(matches!(
            task.encode().unwrap_err(),
            TaskError::InvalidPayload { .. }
        ));
    }

    #[test]
    fn eta_is_parsed_back() {
        let mut task = TaskMessage::new("t");
        let eta = Utc::now();
        task.set_eta(eta);
        assert_eq!(task.eta_time(), Some(eta));
    }

    #[test]
    fn wrap_sets_protocol_defaults() {
        let task = sample_task();
        let envelope = CeleryMessage::wrap(&task.id, &task.encode().unwrap(), JSON_CONTENT_TYPE, "jobs");

        assert_eq!(envelope.content_type, JSON_CONTENT_TYPE);
        assert_eq!(envelope.content_encoding, UTF8_CONTENT_ENCODING);
        assert_eq!(envelope.properties.body_encoding, BASE64_BODY_ENCODING);
        assert_eq!(envelope.properties.correlation_id, task.id);
        assert_eq!(envelope.properties.delivery_info.exchange, "jobs");
        assert_eq!(envelope.routing_key(), "jobs");
        assert_eq!(envelope.unwrap().unwrap(), task);
    }

    #[test]
    fn route_to_clears_the_exchange() {
        let task = sample_task();
        let mut envelope =
            CeleryMessage::wrap(&task.id, &task.encode().unwrap(), JSON_CONTENT_TYPE, DEFAULT_QUEUE);
        envelope.route_to("priority");
        assert_eq!(envelope.properties.delivery_info.exchange, "");
        assert_eq!(envelope.routing_key(), "priority");
    }

    #[test]
    fn envelope_json_shape_matches_the_wire() {
        let task = sample_task();
        let envelope =
            CeleryMessage::wrap(&task.id, &task.encode().unwrap(), JSON_CONTENT_TYPE, DEFAULT_QUEUE);
        let value: Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        assert!(value.get("content-type").is_some());
        assert!(value.get("content-encoding").is_some());
        assert_eq!(value["headers"], json!({}));
        assert_eq!(value["properties"]["delivery_info"]["routing_key"], "celery");

        let parsed = CeleryMessage::from_json(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn unwrap_tolerates_foreign_headers_and_content_type() {
        let task = sample_task();
        let mut envelope =
            CeleryMessage::wrap(&task.id, &task.encode().unwrap(), JSON_CONTENT_TYPE, DEFAULT_QUEUE);
        envelope.content_type = "application/x-custom".to_string();
        envelope.headers.insert("lang".to_string(), json!("py"));
        assert_eq!(envelope.unwrap().unwrap(), task);
    }

    #[test]
    fn unwrap_rejects_unknown_body_encoding() {
        let task = sample_task();
        let mut envelope =
            CeleryMessage::wrap(&task.id, &task.encode().unwrap(), JSON_CONTENT_TYPE, DEFAULT_QUEUE);
        envelope.properties.body_encoding = "gzip".to_string();
        assert!(matches!(
            envelope.unwrap().unwrap_err(),
            TaskError::MalformedMessage { .. }
        ));

        envelope.properties.body_encoding = BASE64_BODY_ENCODING.to_string();
        envelope.body = "***".to_string();
        assert!(matches!(
            envelope.unwrap().unwrap_err(),
            TaskError::MalformedMessage { .. }
        ));
    }

    #[test]
    fn minimal_python_envelope_is_accepted() {
        let body = BASE64_STANDARD.encode(br#"{"id":"42","task":"tasks.add","args":[1,2],"kwargs":{}}"#);
        let raw = format!(
            r#"{{"body":"{}","content-type":"application/json","properties":{{"body_encoding":"base64","delivery_info":{{"exchange":"celery","routing_key":"celery"}}}}}}"#,
            body
        );
        let envelope = CeleryMessage::from_json(&raw).unwrap();
        let task = envelope.unwrap().unwrap();
        assert_eq!(task.id, "42");
        assert_eq!(task.args, vec![json!(1), json!(2)]);
    }

    #[test]
    fn failure_result_carries_the_description() {
        let err = TaskError::task_not_found("missing");
        let result = ResultMessage::failure("id-1", &err);
        assert_eq!(result.status, ResultStatus::Failure);
        assert_eq!(result.result["exc_type"], "NotRegistered");
        assert_eq!(result.description(), err.to_string());

        let value: Value = serde_json::from_slice(&result.encode().unwrap()).unwrap();
        assert_eq!(value["status"], "FAILURE");
        assert_eq!(value["task_id"], "id-1");
    }

    #[test]
    fn result_status_codes() {
        assert!(ResultStatus::Success.is_ready());
        assert!(ResultStatus::Revoked.is_ready());
        assert!(!ResultStatus::Started.is_ready());
        let parsed: ResultStatus = serde_json::from_str("\"RETRY\"").unwrap();
        assert_eq!(parsed, ResultStatus::Retry);
    }
}
