use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use sidecar_proto::{
    error_keys, Command, CommandResponse, CommandType, ErrorPayload, ResponsePayload,
    StartComponentRequest, StartedPayload, StoppedPayload,
};
use tracing::{error, info, warn, Instrument};

use crate::metrics;
use crate::request::{AuthenticatedClient, RequestError, RequestOptions};

/// Turns one inbound command into exactly one response. Implementations
/// must not fail; every error becomes an ERROR response.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: Command) -> CommandResponse;
}

#[derive(Debug, Clone)]
pub struct CommanderConfig {
    pub component_key: String,
    pub component_nick: String,
    pub start_url: String,
    pub stop_url: String,
    /// Fire a STOP when a START could not be confirmed.
    pub stop_on_start_failure: bool,
    pub sip_client_username: String,
    pub sip_client_password: String,
}

/// Forwards START/STOP commands to the local component's HTTP API.
///
/// Commands are not serialized: two concurrent START/STOP pairs for this
/// component race at the local API, which is expected to reject or absorb
/// the duplicate on its own.
#[derive(Clone)]
pub struct CommanderService {
    config: Arc<CommanderConfig>,
    client: AuthenticatedClient,
}

impl CommanderService {
    pub fn new(mut config: CommanderConfig, client: AuthenticatedClient) -> Self {
        if config.component_nick.trim().is_empty() {
            config.component_nick = "componentNick".into();
        }
        Self {
            config: Arc::new(config),
            client,
        }
    }

    pub fn component_key(&self) -> &str {
        &self.config.component_key
    }

    pub async fn start_component(&self, command: &Command) -> CommandResponse {
        let requested = command.payload.component_key.as_str();
        let session_id = command
            .payload
            .component_request
            .as_ref()
            .and_then(|raw| raw.get("sessionId"))
            .and_then(Value::as_str)
            .map(str::to_string);
        info!(component_key = %requested, session_id = ?session_id, "processing start command");

        if requested != self.config.component_key {
            error!(component_key = %requested, "start command for unknown component");
            return not_started(command, session_id, "Component does not exist here".into());
        }
        let payload = match command.payload.start_request() {
            Some(Ok(payload)) => payload,
            Some(Err(err)) => {
                error!(component_key = %requested, error = %err, "start command with invalid component request");
                return not_started(
                    command,
                    session_id,
                    format!("Component could not start. Start request is invalid: {err}"),
                );
            }
            None => {
                error!(component_key = %requested, "start command without component request");
                return not_started(
                    command,
                    session_id,
                    "Component could not start. Start request is missing".into(),
                );
            }
        };

        let start_request = self.build_start_request(&payload);
        let body = match serde_json::to_value(&start_request) {
            Ok(body) => body,
            Err(err) => {
                error!(error = %err, "failed to encode start request");
                return not_started(
                    command,
                    session_id,
                    "Component could not start. Start request is invalid".into(),
                );
            }
        };

        let options = RequestOptions::with_timeout(request_timeout(command));
        match self
            .client
            .post_json(&self.config.start_url, &body, options)
            .await
        {
            Ok(StatusCode::OK) => {
                info!(component_key = %requested, session_id = %payload.session_id, "started component");
                let sip_username = start_request
                    .sip_client_params
                    .as_ref()
                    .and_then(|params| params.user_name.as_deref())
                    .filter(|user| !user.is_empty())
                    .map(|user| user.split('@').next().unwrap_or(user).to_string());
                CommandResponse::success(
                    command.cmd_id.clone(),
                    command.kind.clone(),
                    ResponsePayload::Started(StartedPayload {
                        component_key: self.config.component_key.clone(),
                        session_id: payload.session_id.clone(),
                        sip_username,
                    }),
                )
            }
            Ok(status) => {
                error!(component_key = %requested, status = %status.as_u16(), "error starting component");
                not_started(
                    command,
                    session_id,
                    format!(
                        "Component could not start. Status code is {}",
                        status.as_u16()
                    ),
                )
            }
            Err(err) => {
                error!(
                    component_key = %requested,
                    url = %self.config.start_url,
                    error = %err,
                    "error starting component"
                );
                // The start may have gone through without us seeing the answer.
                self.spawn_compensating_stop();
                not_started(
                    command,
                    session_id,
                    format!(
                        "Component could not start. Error is {}",
                        err.display_message()
                    ),
                )
            }
        }
    }

    pub async fn stop_component(&self, command: &Command) -> CommandResponse {
        let requested = command.payload.component_key.as_str();
        info!(component_key = %requested, "processing stop command");

        if requested != self.config.component_key {
            error!(component_key = %requested, "stop command for unknown component");
            return not_stopped(command, "Component does not exist here".into());
        }

        let options = RequestOptions::with_timeout(request_timeout(command));
        match self.post_stop(options).await {
            Ok(StatusCode::OK) => {
                info!(component_key = %requested, "stopped component");
                CommandResponse::success(
                    command.cmd_id.clone(),
                    command.kind.clone(),
                    ResponsePayload::Stopped(StoppedPayload {
                        component_key: self.config.component_key.clone(),
                    }),
                )
            }
            Ok(status) => {
                error!(component_key = %requested, status = %status.as_u16(), "error stopping component");
                not_stopped(
                    command,
                    format!(
                        "Component could not stop. Status code is {}",
                        status.as_u16()
                    ),
                )
            }
            Err(err) => {
                error!(
                    component_key = %requested,
                    url = %self.config.stop_url,
                    error = %err,
                    "error stopping component"
                );
                not_stopped(
                    command,
                    format!(
                        "Component could not stop. Error is {}",
                        err.display_message()
                    ),
                )
            }
        }
    }

    fn build_start_request(&self, payload: &StartComponentRequest) -> StartComponentRequest {
        let mut request = payload.clone();
        if let Some(name) = request.call_params.call_stats_username_override.as_mut() {
            *name = format!("{} {}", self.config.component_nick, name);
        }
        if let Some(sip) = request.sip_client_params.as_mut() {
            sip.user_name = Some(self.config.sip_client_username.clone());
            sip.password = Some(self.config.sip_client_password.clone());
        }
        request
    }

    async fn post_stop(&self, options: RequestOptions) -> Result<StatusCode, RequestError> {
        self.client
            .post_json(&self.config.stop_url, &json!({}), options)
            .await
    }

    /// Detached STOP; the outcome is only logged.
    fn spawn_compensating_stop(&self) {
        if !self.config.stop_on_start_failure {
            return;
        }
        let service = self.clone();
        tokio::spawn(
            async move {
                match service.post_stop(RequestOptions::default()).await {
                    Ok(status) => info!(
                        status = %status.as_u16(),
                        "component was stopped after start request failed"
                    ),
                    Err(err) => warn!(error = %err, "component stop action failed"),
                }
            }
            .in_current_span(),
        );
    }
}

#[async_trait]
impl CommandHandler for CommanderService {
    async fn handle(&self, command: Command) -> CommandResponse {
        let response = match &command.kind {
            CommandType::Start => self.start_component(&command).await,
            CommandType::Stop => self.stop_component(&command).await,
            CommandType::Other(kind) => {
                warn!(kind = %kind, "unsupported command type");
                CommandResponse::error(
                    command.cmd_id.clone(),
                    command.kind.clone(),
                    ErrorPayload {
                        component_key: command.payload.component_key.clone(),
                        session_id: None,
                        error_key: error_keys::COMMAND_UNSUPPORTED.into(),
                        error_message: "Command type is not supported".into(),
                    },
                )
            }
        };
        metrics::COMMANDS
            .with_label_values(&[
                metrics::command_label(&command.kind),
                if response.is_success() { "success" } else { "error" },
            ])
            .inc();
        response
    }
}

fn request_timeout(command: &Command) -> Option<Duration> {
    command
        .options
        .component_request_timeout_ms
        .filter(|ms| *ms > 0)
        .map(|ms| Duration::from_millis(ms as u64))
}

fn not_started(command: &Command, session_id: Option<String>, message: String) -> CommandResponse {
    CommandResponse::error(
        command.cmd_id.clone(),
        command.kind.clone(),
        ErrorPayload {
            component_key: command.payload.component_key.clone(),
            session_id,
            error_key: error_keys::COMPONENT_NOT_STARTED.into(),
            error_message: message,
        },
    )
}

fn not_stopped(command: &Command, message: String) -> CommandResponse {
    CommandResponse::error(
        command.cmd_id.clone(),
        command.kind.clone(),
        ErrorPayload {
            component_key: command.payload.component_key.clone(),
            session_id: None,
            error_key: error_keys::COMPONENT_NOT_STOPPED.into(),
            error_message: message,
        },
    )
}

/// Error response for a `command` event whose payload could not be decoded.
pub fn invalid_command_response(raw: &Value, reason: &str) -> CommandResponse {
    let kind = raw.get("type").and_then(Value::as_str).unwrap_or_default();
    CommandResponse::error(
        raw.get("cmdId").cloned().unwrap_or(Value::Null),
        CommandType::from(kind.to_string()),
        ErrorPayload {
            component_key: raw
                .pointer("/payload/componentKey")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            session_id: None,
            error_key: error_keys::COMMAND_INVALID.into(),
            error_message: format!("Command could not be parsed: {reason}"),
        },
    )
}
