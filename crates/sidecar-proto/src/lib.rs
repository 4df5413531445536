//! Wire types exchanged between the component sidecar, the orchestrator
//! (component selector) and the local media component.
//!
//! Everything here serializes as camelCase JSON. Component-specific status
//! payloads are carried as opaque [`serde_json::Value`]s; the sidecar only
//! relays them.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const EVENT_COMMAND: &str = "command";
pub const EVENT_STATUS_UPDATES: &str = "status-updates";
pub const EVENT_SESSION_UPDATES: &str = "session-updates";

/// `errorKey` values understood by the orchestrator.
pub mod error_keys {
    pub const COMPONENT_NOT_STARTED: &str = "component.not.started";
    pub const COMPONENT_NOT_STOPPED: &str = "component.not.stopped";
    pub const COMMAND_UNSUPPORTED: &str = "command.unsupported";
    pub const COMMAND_INVALID: &str = "command.invalid";
    pub const COMMAND_FAILED: &str = "command.failed";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentType {
    #[serde(rename = "JIBRI")]
    Jibri,
    #[serde(rename = "SIP-JIBRI")]
    SipJibri,
    #[serde(rename = "JIGASI")]
    Jigasi,
}

impl ComponentType {
    pub fn as_str(self) -> &'static str {
        match self {
            ComponentType::Jibri => "JIBRI",
            ComponentType::SipJibri => "SIP-JIBRI",
            ComponentType::Jigasi => "JIGASI",
        }
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ComponentType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "JIBRI" => Ok(ComponentType::Jibri),
            "SIP-JIBRI" => Ok(ComponentType::SipJibri),
            "JIGASI" => Ok(ComponentType::Jigasi),
            other => Err(format!("unknown component type {other}")),
        }
    }
}

/// The logical component a sidecar instance speaks for. Built once at
/// startup and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentIdentity {
    #[serde(default)]
    pub component_id: String,
    pub component_key: String,
    pub component_type: ComponentType,
    pub environment: String,
    pub region: String,
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Deployment metadata (cloud, private/public ip, ...) relayed as-is.
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

/// Command kind. Unknown kinds are preserved so responses can echo them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CommandType {
    Start,
    Stop,
    Other(String),
}

impl CommandType {
    pub fn as_str(&self) -> &str {
        match self {
            CommandType::Start => "START",
            CommandType::Stop => "STOP",
            CommandType::Other(value) => value.as_str(),
        }
    }
}

impl From<String> for CommandType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "START" => CommandType::Start,
            "STOP" => CommandType::Stop,
            _ => CommandType::Other(value),
        }
    }
}

impl From<CommandType> for String {
    fn from(value: CommandType) -> Self {
        match value {
            CommandType::Other(value) => value,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOptions {
    #[serde(default)]
    pub command_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_request_timeout_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    /// Opaque correlation id, echoed back untouched.
    pub cmd_id: Value,
    #[serde(rename = "type")]
    pub kind: CommandType,
    #[serde(default)]
    pub options: CommandOptions,
    pub payload: CommandPayload,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandPayload {
    #[serde(default)]
    pub component_key: String,
    /// Only START reads this, see [`CommandPayload::start_request`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_request: Option<Value>,
}

impl CommandPayload {
    /// Decodes `componentRequest` as a start request. `None` when absent.
    pub fn start_request(&self) -> Option<Result<StartComponentRequest, serde_json::Error>> {
        self.component_request
            .as_ref()
            .filter(|raw| !raw.is_null())
            .map(|raw| StartComponentRequest::deserialize(raw))
    }
}

/// Unknown sink types are kept so they can be relayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SinkType {
    File,
    Stream,
    Gateway,
    Other(String),
}

impl From<String> for SinkType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "FILE" => SinkType::File,
            "STREAM" => SinkType::Stream,
            "GATEWAY" => SinkType::Gateway,
            _ => SinkType::Other(value),
        }
    }
}

impl From<SinkType> for String {
    fn from(value: SinkType) -> Self {
        match value {
            SinkType::File => "FILE".into(),
            SinkType::Stream => "STREAM".into(),
            SinkType::Gateway => "GATEWAY".into(),
            SinkType::Other(value) => value,
        }
    }
}

/// Start request as received from the orchestrator and, after rewriting,
/// as posted to the local component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartComponentRequest {
    pub session_id: String,
    pub sink_type: SinkType,
    pub call_params: CallParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sip_client_params: Option<SipClientParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_login_params: Option<XmppCredentials>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The call url is `<baseUrl>/<callName>`, followed by `#<urlParams>`
/// joined with `&` when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallUrlInfo {
    pub base_url: String,
    pub call_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_params: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallParams {
    pub call_url_info: CallUrlInfo,
    #[serde(default)]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passcode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_stats_username_override: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SipClientParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub auto_answer: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct XmppCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseType {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub cmd_id: Value,
    #[serde(rename = "type")]
    pub kind: CommandType,
    pub response_type: ResponseType,
    pub payload: ResponsePayload,
}

impl CommandResponse {
    pub fn success(cmd_id: impl Into<Value>, kind: CommandType, payload: ResponsePayload) -> Self {
        Self {
            cmd_id: cmd_id.into(),
            kind,
            response_type: ResponseType::Success,
            payload,
        }
    }

    pub fn error(cmd_id: impl Into<Value>, kind: CommandType, payload: ErrorPayload) -> Self {
        Self {
            cmd_id: cmd_id.into(),
            kind,
            response_type: ResponseType::Error,
            payload: ResponsePayload::Error(payload),
        }
    }

    pub fn is_success(&self) -> bool {
        self.response_type == ResponseType::Success
    }

    /// `errorKey` of an error response.
    pub fn error_key(&self) -> Option<&str> {
        match &self.payload {
            ResponsePayload::Error(payload) => Some(payload.error_key.as_str()),
            _ => None,
        }
    }
}

// Variant order matters for deserialization: error payloads carry the
// most required fields, stop payloads the fewest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponsePayload {
    Error(ErrorPayload),
    Started(StartedPayload),
    Stopped(StoppedPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedPayload {
    pub component_key: String,
    pub session_id: String,
    #[serde(default)]
    pub sip_username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoppedPayload {
    pub component_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub component_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub error_key: String,
    pub error_message: String,
}

/// Latest known health snapshot of the component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsReport {
    pub component: ComponentIdentity,
    /// Raw body of the polled status endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<Value>,
    /// Status pushed by the component through the webhook.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl StatsReport {
    /// Liveness-only report used when no health data is known.
    pub fn identity_only(component: ComponentIdentity) -> Self {
        Self {
            component,
            stats: None,
            status: None,
            session_id: None,
            timestamp: None,
        }
    }

    pub fn polled(component: ComponentIdentity, stats: Value, timestamp: i64) -> Self {
        Self {
            stats: Some(stats),
            timestamp: Some(timestamp),
            ..Self::identity_only(component)
        }
    }

    pub fn pushed(component: ComponentIdentity, status: Value, timestamp: i64) -> Self {
        Self {
            status: Some(status),
            timestamp: Some(timestamp),
            ..Self::identity_only(component)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    On,
    Off,
    Pending,
    Undefined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    Busy,
    Error,
    Undefined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorScope {
    Session,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentError {
    pub scope: ErrorScope,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentFailure {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ComponentError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    pub session_id: String,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ComponentFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub should_retry: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}
