//! Configuration management for the proxy.
//!
//! Configuration can be set via environment variables:
//! - `PORT` - Optional. Server port. Defaults to `8080`.
//! - `ACCOUNTS_FILE` - Optional. Path to the persisted account pool file. Defaults to `./accounts.json`.
//! - `PROXY_SECRET` - Optional. Bearer token required on `/v1/messages`. Unset disables auth.
//! - `DEFAULT_STRATEGY` - Optional. One of `round-robin`, `sticky`, `aggressive`, `on-demand`, `hybrid` (alias of `sticky`). Defaults to `round-robin`.
//! - `FALLBACK_ENABLED` - Optional. Whether the model fallback map is consulted on exhaustion. Defaults to `true`.
//! - `ANTIGRAVITY_ENDPOINT_FALLBACKS` - Optional. Comma-separated ordered list of upstream base URLs.
//! - `REQUEST_TIMEOUT_SECS` - Optional. Per-attempt non-streaming upstream timeout. Defaults to `30`.
//! - `MAX_WAIT_BEFORE_ERROR_MS` - Optional. Cap on a cooperative scheduler sleep before erroring out. Defaults to `5000`.
//! - `CONSECUTIVE_FAILURE_THRESHOLD` - Optional. Failures before an account is auto-disabled. Defaults to `3`.
//! - `AUTO_RECOVERY_MS` - Optional. Time after which an auto-disabled account is re-enabled. Defaults to `60000`.
//! - `GLOBAL_QUOTA_THRESHOLD` - Optional. Fraction below which accounts are skipped unless all are starved. Defaults to `0` (disabled).
//! - `THINKING_TAG_MODE` - Optional. One of `passthrough`, `strip`, `native`. Defaults to `passthrough`.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::scheduler::StrategyKind;
use crate::translator::streaming::ThinkingTagMode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

const DEFAULT_ENDPOINT_FALLBACKS: &[&str] = &[
    "https://cloudcode-pa.googleapis.com",
    "https://autopush-cloudcode-pa.sandbox.googleapis.com",
];

/// Proxy configuration, loaded from the environment and overridable by CLI flags.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub accounts_file: PathBuf,
    pub proxy_secret: Option<String>,
    pub default_strategy: StrategyKind,
    pub fallback_enabled: bool,
    pub endpoint_fallbacks: Vec<String>,
    pub request_timeout: Duration,
    pub max_wait_before_error: Duration,
    pub consecutive_failure_threshold: u32,
    pub auto_recovery: Duration,
    pub global_quota_threshold: f64,
    pub thinking_tag_mode: ThinkingTagMode,
    /// Clear every account's rate-limit records on startup (`--trigger-reset`).
    pub trigger_reset: bool,
    pub debug: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = env_parsed("PORT", 8080)?;
        let accounts_file = std::env::var("ACCOUNTS_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./accounts.json"));
        let proxy_secret = std::env::var("PROXY_SECRET").ok();

        let default_strategy = match std::env::var("DEFAULT_STRATEGY") {
            Ok(raw) => StrategyKind::parse(&raw)
                .ok_or_else(|| ConfigError::InvalidValue("DEFAULT_STRATEGY".into(), raw))?,
            Err(_) => StrategyKind::RoundRobin,
        };

        let fallback_enabled = env_bool("FALLBACK_ENABLED", true)?;

        let endpoint_fallbacks = match std::env::var("ANTIGRAVITY_ENDPOINT_FALLBACKS") {
            Ok(raw) => raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect(),
            Err(_) => DEFAULT_ENDPOINT_FALLBACKS.iter().map(|s| s.to_string()).collect(),
        };

        let request_timeout = Duration::from_secs(env_parsed("REQUEST_TIMEOUT_SECS", 30)?);
        let max_wait_before_error = Duration::from_millis(env_parsed("MAX_WAIT_BEFORE_ERROR_MS", 5000)?);
        let consecutive_failure_threshold = env_parsed("CONSECUTIVE_FAILURE_THRESHOLD", 3)?;
        let auto_recovery = Duration::from_millis(env_parsed("AUTO_RECOVERY_MS", 60_000)?);
        let global_quota_threshold = env_parsed_f64("GLOBAL_QUOTA_THRESHOLD", 0.0)?;

        let thinking_tag_mode = match std::env::var("THINKING_TAG_MODE") {
            Ok(raw) => ThinkingTagMode::parse(&raw)
                .ok_or_else(|| ConfigError::InvalidValue("THINKING_TAG_MODE".into(), raw))?,
            Err(_) => ThinkingTagMode::Passthrough,
        };

        Ok(Self {
            port,
            accounts_file,
            proxy_secret,
            default_strategy,
            fallback_enabled,
            endpoint_fallbacks,
            request_timeout,
            max_wait_before_error,
            consecutive_failure_threshold,
            auto_recovery,
            global_quota_threshold,
            thinking_tag_mode,
            trigger_reset: false,
            debug: false,
        })
    }

    /// Apply CLI flag overrides on top of environment-derived defaults.
    ///
    /// Mirrors the env-first configuration style: flags win over `from_env`
    /// where both are present.
    pub fn apply_cli(&mut self, cli: &CliOverrides) {
        if let Some(port) = cli.port {
            self.port = port;
        }
        if let Some(strategy) = cli.strategy {
            self.default_strategy = strategy;
        }
        if let Some(fallback) = cli.fallback {
            self.fallback_enabled = fallback;
        }
        self.debug |= cli.debug;
        self.trigger_reset |= cli.trigger_reset;
    }
}

/// Flags parsed from `std::env::args()`. Kept separate from `Config` so CLI
/// parsing has no dependency on the environment having already been read.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub debug: bool,
    pub fallback: Option<bool>,
    pub strategy: Option<StrategyKind>,
    pub trigger_reset: bool,
}

impl CliOverrides {
    pub fn parse<I: IntoIterator<Item = String>>(args: I) -> Result<Self, ConfigError> {
        let mut overrides = CliOverrides::default();
        for arg in args.into_iter().skip(1) {
            if let Some(value) = arg.strip_prefix("--port=") {
                overrides.port = Some(
                    value
                        .parse()
                        .map_err(|_| ConfigError::InvalidValue("--port".into(), value.into()))?,
                );
            } else if arg == "--debug" {
                overrides.debug = true;
            } else if let Some(value) = arg.strip_prefix("--fallback=") {
                overrides.fallback = Some(
                    value
                        .parse()
                        .map_err(|_| ConfigError::InvalidValue("--fallback".into(), value.into()))?,
                );
            } else if let Some(value) = arg.strip_prefix("--strategy=") {
                overrides.strategy = Some(
                    StrategyKind::parse(value)
                        .ok_or_else(|| ConfigError::InvalidValue("--strategy".into(), value.into()))?,
                );
            } else if arg == "--trigger-reset" {
                overrides.trigger_reset = true;
            }
        }
        Ok(overrides)
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string(), raw)),
        Err(_) => Ok(default),
    }
}

fn env_parsed_f64(key: &str, default: f64) -> Result<f64, ConfigError> {
    env_parsed(key, default)
}

fn env_bool(key: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => match raw.as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidValue(key.to_string(), raw)),
        },
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_parse_expected_flags() {
        let args = vec![
            "cloudcode-proxy".to_string(),
            "--port=9090".to_string(),
            "--debug".to_string(),
            "--strategy=sticky".to_string(),
            "--fallback=false".to_string(),
            "--trigger-reset".to_string(),
        ];
        let overrides = CliOverrides::parse(args).unwrap();
        assert_eq!(overrides.port, Some(9090));
        assert!(overrides.debug);
        assert_eq!(overrides.strategy, Some(StrategyKind::Sticky));
        assert_eq!(overrides.fallback, Some(false));
        assert!(overrides.trigger_reset);
    }

    #[test]
    fn cli_overrides_rejects_bad_port() {
        let args = vec!["cloudcode-proxy".to_string(), "--port=not-a-number".to_string()];
        assert!(CliOverrides::parse(args).is_err());
    }
}
