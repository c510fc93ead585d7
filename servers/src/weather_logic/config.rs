use clap::Parser;
use lib_common::core::UpstreamConfig;
use lib_common::weather::model::DeviceId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Error published when no upstream token is configured.
pub const MISSING_TOKENS_MESSAGE: &str = "WEATHER_TOKENS environment variable not configured";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Weather station telemetry relay", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "WEATHER_PORT", help = "Port to listen on for subscriber connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "WEATHER_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "WEATHER_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "WEATHER_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "WEATHER_TOKENS", help = "Comma-separated upstream API tokens.")]
    pub tokens: Option<String>,

    #[clap(long, env = "WEATHER_DEVICE_ID", help = "Device to subscribe without discovery.")]
    pub device_id: Option<DeviceId>,

    #[clap(long, env = "WEATHER_WS_URL", help = "Upstream WebSocket URL.")]
    pub ws_url: Option<String>,

    #[clap(long, env = "WEATHER_REST_URL", help = "Upstream REST base URL used for device discovery.")]
    pub rest_url: Option<String>,

    #[clap(long, env = "WEATHER_RECONNECT_DELAY_SECS", help = "Seconds to wait before reconnecting the upstream socket.")]
    pub reconnect_delay_secs: Option<u64>,

    #[clap(long, env = "WEATHER_DISCOVERY_RETRY_SECS", help = "Seconds to wait before retrying failed device discovery.")]
    pub discovery_retry_secs: Option<u64>,

    #[clap(long, env = "TLS_CERT_PATH", help = "Path to the TLS certificate file.")]
    pub tls_cert_path: Option<PathBuf>,

    #[clap(long, env = "TLS_KEY_PATH", help = "Path to the TLS private key file.")]
    pub tls_key_path: Option<PathBuf>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            tokens: other.tokens.or(self.tokens),
            device_id: other.device_id.or(self.device_id),
            ws_url: other.ws_url.or(self.ws_url),
            rest_url: other.rest_url.or(self.rest_url),
            reconnect_delay_secs: other.reconnect_delay_secs.or(self.reconnect_delay_secs),
            discovery_retry_secs: other.discovery_retry_secs.or(self.discovery_retry_secs),
            tls_cert_path: other.tls_cert_path.or(self.tls_cert_path),
            tls_key_path: other.tls_key_path.or(self.tls_key_path),
        }
    }

    fn defaults() -> Config {
        let upstream = UpstreamConfig::default();
        Config {
            port: Some(9003),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            ws_url: Some(upstream.ws_url),
            rest_url: Some(upstream.rest_url),
            reconnect_delay_secs: Some(upstream.reconnect_delay.as_secs()),
            discovery_retry_secs: Some(upstream.discovery_retry.as_secs()),
            ..Default::default()
        }
    }
}

/// Fully resolved settings for `server_weather`.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub tokens: Vec<String>,
    pub upstream: UpstreamConfig,
    pub tls: Option<(PathBuf, PathBuf)>,
}

fn split_tokens(raw: Option<&str>) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    for token in raw.unwrap_or_default().split(',').map(str::trim) {
        if !token.is_empty() && !tokens.iter().any(|t| t == token) {
            tokens.push(token.to_string());
        }
    }
    tokens
}

impl From<Config> for Settings {
    fn from(config: Config) -> Self {
        let defaults = UpstreamConfig::default();
        let tls = match (config.tls_cert_path, config.tls_key_path) {
            (Some(cert), Some(key)) => Some((cert, key)),
            _ => None,
        };
        Settings {
            port: config.port.unwrap_or(9003),
            log_dir: config.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: config.log_level.unwrap_or_else(|| "info".to_string()),
            tokens: split_tokens(config.tokens.as_deref()),
            upstream: UpstreamConfig {
                ws_url: config.ws_url.unwrap_or(defaults.ws_url),
                rest_url: config.rest_url.unwrap_or(defaults.rest_url),
                reconnect_delay: config
                    .reconnect_delay_secs
                    .map_or(defaults.reconnect_delay, Duration::from_secs),
                discovery_retry: config
                    .discovery_retry_secs
                    .map_or(defaults.discovery_retry, Duration::from_secs),
                static_device_id: config.device_id,
            },
            tls,
        }
    }
}

fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        log::info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return None;
    }
    match fs::read_to_string(path) {
        Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
            Ok(file_config) => Some(file_config),
            Err(e) => {
                log::warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
                None
            }
        },
        Err(e) => {
            log::warn!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}

/// Resolves settings from defaults, then the config file, then `cli` (which
/// already carries environment variables).
pub fn resolve(cli: Config) -> Settings {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("server_weather.conf"));

    let mut current_config = Config::defaults();
    if let Some(file_config) = read_config_file(&config_file_path) {
        current_config = current_config.merge(file_config);
    }
    current_config.merge(cli).into()
}

pub fn load_config() -> Settings {
    resolve(Config::parse())
}
