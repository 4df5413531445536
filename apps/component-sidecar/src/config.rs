use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use sidecar_proto::{ComponentIdentity, ComponentType};
use thiserror::Error;

use crate::auth::AsapConfig;
use crate::channel::ChannelConfig;
use crate::commander::CommanderConfig;
use crate::request::RequestPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Process configuration, read from the environment (plus an optional
/// `.env` file). Field names are the lowercased variable names.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_ws_server_url")]
    pub ws_server_url: String,
    #[serde(default = "default_ws_server_path")]
    pub ws_server_path: String,
    #[serde(default = "default_reconnect_delay_ms")]
    pub ws_reconnect_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub ws_reconnect_max_delay_ms: u64,
    #[serde(default = "default_outbound_capacity")]
    pub ws_outbound_capacity: usize,
    #[serde(default = "default_true")]
    pub volatile_events: bool,

    pub asap_signing_key_file: String,
    #[serde(default = "default_asap_kid")]
    pub asap_jwt_kid: String,
    #[serde(default = "default_asap_iss")]
    pub asap_jwt_iss: String,
    #[serde(default = "default_asap_aud")]
    pub asap_jwt_aud: String,
    #[serde(default = "default_asap_ttl_secs")]
    pub asap_jwt_ttl_secs: i64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_request_retry_count")]
    pub request_retry_count: u32,

    /// Seconds between status polls.
    #[serde(default = "default_stats_interval")]
    pub stats_polling_interval: u64,
    /// Seconds between reports to the orchestrator.
    #[serde(default = "default_stats_interval")]
    pub stats_reporting_interval: u64,
    #[serde(default)]
    pub stats_retrieve_url: Option<String>,
    #[serde(default)]
    pub start_instance_url: Option<String>,
    #[serde(default)]
    pub stop_instance_url: Option<String>,
    #[serde(default = "default_true")]
    pub enable_stop_instance: bool,

    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(deserialize_with = "deserialize_component_type")]
    pub component_type: ComponentType,
    pub instance_key: String,
    #[serde(default = "default_instance_nick")]
    pub instance_nick: String,
    /// JSON object merged into the reported identity.
    #[serde(default)]
    pub instance_metadata: Option<String>,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub instance_group: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,

    #[serde(default)]
    pub sip_client_username: Option<String>,
    #[serde(default)]
    pub sip_client_password: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let source = config::Config::builder()
            .add_source(config::Environment::default().separator("__"))
            .build()?;
        Self::from_config(source)
    }

    pub fn from_config(source: config::Config) -> Result<Self, ConfigError> {
        let cfg: AppConfig = source.try_deserialize()?;
        cfg.normalize().validate()
    }

    fn normalize(mut self) -> Self {
        self.stats_retrieve_url = Self::normalize_opt(self.stats_retrieve_url.take());
        self.start_instance_url = Self::normalize_opt(self.start_instance_url.take());
        self.stop_instance_url = Self::normalize_opt(self.stop_instance_url.take());
        self.instance_metadata = Self::normalize_opt(self.instance_metadata.take());
        self.instance_id = Self::normalize_opt(self.instance_id.take());
        self.instance_group = Self::normalize_opt(self.instance_group.take());
        self.hostname = Self::normalize_opt(self.hostname.take());
        self.sip_client_username = Self::normalize_opt(self.sip_client_username.take());
        self.sip_client_password = Self::normalize_opt(self.sip_client_password.take());
        self.instance_key = self.instance_key.trim().to_string();
        self.asap_signing_key_file = self.asap_signing_key_file.trim().to_string();
        self
    }

    fn normalize_opt(value: Option<String>) -> Option<String> {
        value.and_then(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.instance_key.is_empty() {
            return Err(ConfigError::Invalid("INSTANCE_KEY must not be empty".into()));
        }
        if self.asap_signing_key_file.is_empty() {
            return Err(ConfigError::Invalid(
                "ASAP_SIGNING_KEY_FILE must not be empty".into(),
            ));
        }
        if self.stats_polling_interval == 0 || self.stats_reporting_interval == 0 {
            return Err(ConfigError::Invalid(
                "stats intervals must be at least one second".into(),
            ));
        }
        self.metadata()?;
        Ok(self)
    }

    fn metadata(&self) -> Result<Map<String, Value>, ConfigError> {
        match self.instance_metadata.as_deref() {
            None => Ok(Map::new()),
            Some(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => Ok(map),
                Ok(_) => Err(ConfigError::Invalid(
                    "INSTANCE_METADATA must be a JSON object".into(),
                )),
                Err(err) => Err(ConfigError::Invalid(format!(
                    "INSTANCE_METADATA is not valid JSON: {err}"
                ))),
            },
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }

    /// The identity reported with every stats update. Explicit settings
    /// win over keys of the same name in `INSTANCE_METADATA`.
    pub fn identity(&self) -> ComponentIdentity {
        let mut metadata = self.metadata().unwrap_or_default();
        for key in [
            "componentId",
            "componentKey",
            "componentType",
            "environment",
            "region",
            "hostname",
            "group",
        ] {
            metadata.remove(key);
        }
        ComponentIdentity {
            component_id: self.instance_id.clone().unwrap_or_default(),
            component_key: self.instance_key.clone(),
            component_type: self.component_type,
            environment: self.environment.clone(),
            region: self.region.clone(),
            hostname: self.hostname.clone().unwrap_or_default(),
            group: self.instance_group.clone(),
            metadata,
        }
    }

    pub fn stats_retrieve_url(&self) -> String {
        self.stats_retrieve_url
            .clone()
            .unwrap_or_else(|| self.default_url("about/health", "health"))
    }

    pub fn start_url(&self) -> String {
        self.start_instance_url
            .clone()
            .unwrap_or_else(|| self.default_url("api/v1.0/startService", "startService"))
    }

    pub fn stop_url(&self) -> String {
        self.stop_instance_url
            .clone()
            .unwrap_or_else(|| self.default_url("api/v1.0/stopService", "stopService"))
    }

    fn default_url(&self, jigasi_path: &str, jibri_path: &str) -> String {
        match self.component_type {
            ComponentType::Jigasi => format!("http://localhost:8788/{jigasi_path}"),
            ComponentType::Jibri | ComponentType::SipJibri => {
                format!("http://localhost:2222/jibri/api/v1.0/{jibri_path}")
            }
        }
    }

    pub fn stats_polling_interval(&self) -> Duration {
        Duration::from_secs(self.stats_polling_interval)
    }

    pub fn stats_reporting_interval(&self) -> Duration {
        Duration::from_secs(self.stats_reporting_interval)
    }

    pub fn request_policy(&self) -> RequestPolicy {
        RequestPolicy {
            timeout: Duration::from_millis(self.request_timeout_ms),
            retry_count: self.request_retry_count,
            ..RequestPolicy::default()
        }
    }

    pub fn asap_config(&self) -> AsapConfig {
        AsapConfig {
            issuer: self.asap_jwt_iss.clone(),
            audience: self.asap_jwt_aud.clone(),
            key_id: self.asap_jwt_kid.clone(),
            ttl: chrono::Duration::seconds(self.asap_jwt_ttl_secs),
        }
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            url: self.ws_server_url.clone(),
            path: self.ws_server_path.clone(),
            component_key: self.instance_key.clone(),
            volatile_events: self.volatile_events,
            reconnect_delay: Duration::from_millis(self.ws_reconnect_delay_ms),
            reconnect_max_delay: Duration::from_millis(self.ws_reconnect_max_delay_ms),
            outbound_capacity: self.ws_outbound_capacity,
        }
    }

    pub fn commander_config(&self) -> CommanderConfig {
        CommanderConfig {
            component_key: self.instance_key.clone(),
            component_nick: self.instance_nick.clone(),
            start_url: self.start_url(),
            stop_url: self.stop_url(),
            stop_on_start_failure: self.enable_stop_instance,
            sip_client_username: self.sip_client_username.clone().unwrap_or_default(),
            sip_client_password: self.sip_client_password.clone().unwrap_or_default(),
        }
    }
}

fn deserialize_component_type<'de, D>(deserializer: D) -> Result<ComponentType, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    ComponentType::from_str(&raw).map_err(serde::de::Error::custom)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_port() -> u16 {
    8017
}

fn default_ws_server_url() -> String {
    "ws://localhost:8015".to_string()
}

fn default_ws_server_path() -> String {
    "/jitsi-component-selector/ws".to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    1_000
}

fn default_reconnect_max_delay_ms() -> u64 {
    5_000
}

fn default_outbound_capacity() -> usize {
    64
}

fn default_true() -> bool {
    true
}

fn default_asap_kid() -> String {
    "jitsi/default".to_string()
}

fn default_asap_iss() -> String {
    "jitsi-component-sidecar".to_string()
}

fn default_asap_aud() -> String {
    "jitsi-component-selector".to_string()
}

fn default_asap_ttl_secs() -> i64 {
    3_600
}

fn default_request_timeout_ms() -> u64 {
    8_000
}

fn default_request_retry_count() -> u32 {
    2
}

fn default_stats_interval() -> u64 {
    30
}

fn default_environment() -> String {
    "default-env".to_string()
}

fn default_region() -> String {
    "default-region".to_string()
}

fn default_instance_nick() -> String {
    "jibri".to_string()
}
