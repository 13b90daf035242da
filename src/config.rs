use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::LazyLock;

use crate::relay::date::resolve_date;

/// Error type for configuration loading
#[derive(Debug)]
pub enum ConfigError {
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },
    InvalidValue {
        path: PathBuf,
        field: String,
        value: String,
        valid_values: Vec<String>,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError { path, source } => {
                write!(f, "Failed to read {}: {}", path.display(), source)
            }
            ConfigError::ParseError { path, source } => {
                write!(f, "Invalid TOML syntax in {}: {}", path.display(), source)
            }
            ConfigError::InvalidValue {
                path,
                field,
                value,
                valid_values,
            } => {
                write!(
                    f,
                    "Invalid value '{}' for '{}' in {}\n  Valid values: {}",
                    value,
                    field,
                    path.display(),
                    valid_values.join(", ")
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::ReadError { source, .. } => Some(source),
            ConfigError::ParseError { source, .. } => Some(source),
            ConfigError::InvalidValue { .. } => None,
        }
    }
}

/// Global config instance (uses default if load fails at static init)
static GLOBAL_CONFIG: LazyLock<RwLock<Config>> =
    LazyLock::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get a snapshot of the global config
pub fn get_config() -> Config {
    GLOBAL_CONFIG.read().clone()
}

/// Initialize global config with overrides
pub fn init_config(config: Config) {
    *GLOBAL_CONFIG.write() = config;
}

/// Relay configuration loaded from `~/.config/chatrelay/config.toml`.
///
/// Every field has a default, so an absent file is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub content: ContentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Seconds allowed for intake plus upstream response headers. Streaming is unbounded.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub debug: bool,
    /// Log upstream-bound request bodies
    #[serde(default)]
    pub log_requests: bool,
}

/// Configuration for the completion API the relay forwards to.
///
/// Example in `config.toml`:
/// ```toml
/// [upstream]
/// base_url = "https://api.openai.com/v1"
/// api_key_env = "OPENAI_API_KEY"
/// default_model = "gpt-4o-mini"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL; `/chat/completions` is appended
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Environment variable holding the bearer credential, read per request
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Model used when the caller does not name one
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            default_model: default_model(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl UpstreamConfig {
    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

/// Stream transform settings.
///
/// Example in `config.toml`:
/// ```toml
/// [relay]
/// placeholder = "[DATE_PLUS_7]"
/// date_offset_days = 7
/// utc_offset_minutes = -300
/// date_format = "%A, %B %-d, %Y"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Literal token replaced with the resolved date in every delta
    #[serde(default = "default_placeholder")]
    pub placeholder: String,
    #[serde(default = "default_date_offset_days")]
    pub date_offset_days: i64,
    /// Fixed civil timezone the date is rendered in, as minutes east of UTC
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,
    /// chrono strftime pattern
    #[serde(default = "default_date_format")]
    pub date_format: String,
    /// Forward valid JSON lines that carry no delta instead of skipping them
    #[serde(default)]
    pub forward_unrecognized: bool,
    /// Frames buffered between the upstream reader and the client
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_placeholder() -> String {
    "[DATE_PLUS_7]".to_string()
}

fn default_date_offset_days() -> i64 {
    7
}

fn default_utc_offset_minutes() -> i32 {
    -300
}

fn default_date_format() -> String {
    "%A, %B %-d, %Y".to_string()
}

/// Upper bound for `relay.channel_capacity`; the channel is allocated per request.
const MAX_CHANNEL_CAPACITY: usize = 4096;

fn default_channel_capacity() -> usize {
    32
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            placeholder: default_placeholder(),
            date_offset_days: default_date_offset_days(),
            utc_offset_minutes: default_utc_offset_minutes(),
            date_format: default_date_format(),
            forward_unrecognized: false,
            channel_capacity: default_channel_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContentConfig {
    /// Prompt and FAQ table; the built-in table is used when unset
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_port() -> u16 {
    8787
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Config {
    pub fn dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chatrelay")
    }

    pub fn path() -> PathBuf {
        Self::dir().join("config.toml")
    }

    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::path();
        if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::ReadError {
                path: path.clone(),
                source: e,
            })?;
            Self::parse(&content, path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse and validate config text; `path` is only used for error messages.
    pub fn parse(content: &str, path: PathBuf) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: path.clone(),
            source: e,
        })?;
        config.validate(path)?;
        Ok(config)
    }

    fn validate(&self, path: PathBuf) -> Result<(), ConfigError> {
        let relay = &self.relay;

        if relay.placeholder.is_empty() {
            return Err(ConfigError::InvalidValue {
                path,
                field: "relay.placeholder".to_string(),
                value: String::new(),
                valid_values: vec!["any non-empty token".to_string()],
            });
        }

        if !(1..=MAX_CHANNEL_CAPACITY).contains(&relay.channel_capacity) {
            return Err(ConfigError::InvalidValue {
                path,
                field: "relay.channel_capacity".to_string(),
                value: relay.channel_capacity.to_string(),
                valid_values: vec![format!("1 to {}", MAX_CHANNEL_CAPACITY)],
            });
        }

        if !(-1439..=1439).contains(&relay.utc_offset_minutes) {
            return Err(ConfigError::InvalidValue {
                path,
                field: "relay.utc_offset_minutes".to_string(),
                value: relay.utc_offset_minutes.to_string(),
                valid_values: vec!["-1439 to 1439".to_string()],
            });
        }

        if resolve_date(relay).is_none() {
            return Err(ConfigError::InvalidValue {
                path,
                field: "relay.date_format".to_string(),
                value: relay.date_format.clone(),
                valid_values: vec!["a chrono strftime pattern".to_string()],
            });
        }

        if !self.upstream.base_url.starts_with("http://")
            && !self.upstream.base_url.starts_with("https://")
        {
            return Err(ConfigError::InvalidValue {
                path,
                field: "upstream.base_url".to_string(),
                value: self.upstream.base_url.clone(),
                valid_values: vec!["an http:// or https:// URL".to_string()],
            });
        }

        Ok(())
    }

    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    pub fn with_overrides(
        mut self,
        port: Option<u16>,
        host: Option<String>,
        debug: bool,
        content: Option<PathBuf>,
    ) -> Self {
        if let Some(p) = port {
            self.server.port = p;
        }
        if let Some(h) = host {
            self.server.host = h;
        }
        if debug {
            self.logging.debug = true;
        }
        if content.is_some() {
            self.content.path = content;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<Config, ConfigError> {
        Config::parse(text, PathBuf::from("/test/config.toml"))
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, 8787);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.upstream.api_key_env, "OPENAI_API_KEY");
        assert_eq!(config.relay.placeholder, "[DATE_PLUS_7]");
        assert_eq!(config.relay.date_offset_days, 7);
        assert!(!config.relay.forward_unrecognized);
        assert!(config.content.path.is_none());
    }

    #[test]
    fn test_config_with_overrides() {
        let config = Config::default().with_overrides(
            Some(3000),
            Some("0.0.0.0".to_string()),
            true,
            Some(PathBuf::from("/etc/chatrelay/content.toml")),
        );

        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert!(config.logging.debug);
        assert_eq!(
            config.content.path.as_deref(),
            Some(std::path::Path::new("/etc/chatrelay/content.toml"))
        );
    }

    #[test]
    fn test_config_partial_overrides() {
        let config = Config::default().with_overrides(None, None, false, None);
        assert_eq!(config.server.port, 8787);
        assert!(!config.logging.debug);
        assert!(config.content.path.is_none());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = parse("[relay]\nforward_unrecognized = true\n").unwrap();
        assert!(config.relay.forward_unrecognized);
        assert_eq!(config.relay.placeholder, "[DATE_PLUS_7]");
        assert_eq!(config.upstream.default_model, "gpt-4o-mini");
    }

    #[test]
    fn test_completions_url_trims_slash() {
        let upstream = UpstreamConfig {
            base_url: "http://127.0.0.1:9000/v1/".to_string(),
            ..Default::default()
        };
        assert_eq!(
            upstream.completions_url(),
            "http://127.0.0.1:9000/v1/chat/completions"
        );
    }

    #[test]
    fn test_empty_placeholder_rejected() {
        let err = parse("[relay]\nplaceholder = \"\"\n").unwrap_err();
        assert!(err.to_string().contains("relay.placeholder"));
    }

    #[test]
    fn test_zero_channel_capacity_rejected() {
        let err = parse("[relay]\nchannel_capacity = 0\n").unwrap_err();
        assert!(err.to_string().contains("relay.channel_capacity"));
    }

    #[test]
    fn test_oversized_channel_capacity_rejected() {
        let err = parse("[relay]\nchannel_capacity = 1000000000\n").unwrap_err();
        assert!(err.to_string().contains("relay.channel_capacity"));
        assert!(err.to_string().contains("1 to 4096"));

        let config = parse("[relay]\nchannel_capacity = 4096\n").unwrap();
        assert_eq!(config.relay.channel_capacity, 4096);
    }

    #[test]
    fn test_offset_out_of_range_rejected() {
        let err = parse("[relay]\nutc_offset_minutes = 1440\n").unwrap_err();
        assert!(err.to_string().contains("relay.utc_offset_minutes"));
    }

    #[test]
    fn test_bad_base_url_rejected() {
        let err = parse("[upstream]\nbase_url = \"api.openai.com\"\n").unwrap_err();
        assert!(err.to_string().contains("upstream.base_url"));
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        let text = Config::default().to_toml();
        let config = parse(&text).unwrap();
        assert_eq!(config.server.port, 8787);
    }

    #[test]
    fn test_config_path() {
        let path = Config::path();
        assert!(path.to_string_lossy().contains("chatrelay"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn test_config_error_display() {
        let parse_error = toml::from_str::<Config>("invalid toml [").unwrap_err();
        let error = ConfigError::ParseError {
            path: PathBuf::from("/test/config.toml"),
            source: parse_error,
        };
        let msg = error.to_string();
        assert!(msg.contains("Invalid TOML syntax"));
        assert!(msg.contains("/test/config.toml"));
    }
}
