use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::authz::{Permission, RoleRegistry};
use crate::booking::BookingConfig;
use crate::lifecycle::LifecycleConfig;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub lifecycle: LifecycleSettings,
    pub booking: BookingSettings,
    pub logging: LoggingConfig,
    /// Role name -> permission names. Replaces the built-in set for that role.
    pub roles: BTreeMap<String, Vec<String>>,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LifecycleSettings {
    pub store_timeout_ms: u64,
    pub default_rejection_reason: String,
}

#[derive(Clone, Debug)]
pub struct BookingSettings {
    pub provider: ProviderKind,
    pub base_url: Option<String>,
    pub api_key: Option<SecretString>,
    pub timeout_ms: u64,
    pub stale_claim_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Sandbox,
    Http,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sandbox => "sandbox",
            Self::Http => "http",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub server_port: Option<u16>,
    pub booking_provider: Option<ProviderKind>,
    pub booking_base_url: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://waypoint.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            lifecycle: LifecycleSettings {
                store_timeout_ms: 5_000,
                default_rejection_reason: crate::lifecycle::engine::DEFAULT_REJECTION_REASON
                    .to_string(),
            },
            booking: BookingSettings {
                provider: ProviderKind::Sandbox,
                base_url: None,
                api_key: None,
                timeout_ms: 15_000,
                stale_claim_secs: 300,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
            roles: BTreeMap::new(),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sandbox" => Ok(Self::Sandbox),
            "http" => Ok(Self::Http),
            other => Err(ConfigError::Validation(format!(
                "unsupported booking provider `{other}` (expected sandbox|http)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("waypoint.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    /// Built-in roles with the configured overrides applied.
    pub fn role_registry(&self) -> Result<RoleRegistry, ConfigError> {
        let mut overrides = Vec::with_capacity(self.roles.len());
        for (role, names) in &self.roles {
            let permissions = names
                .iter()
                .map(|name| {
                    Permission::parse(name).ok_or_else(|| {
                        ConfigError::Validation(format!(
                            "roles.{role} lists unknown permission `{name}`"
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            overrides.push((role.clone(), permissions));
        }
        Ok(RoleRegistry::default().with_overrides(overrides))
    }

    pub fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            store_timeout: Duration::from_millis(self.lifecycle.store_timeout_ms),
            default_rejection_reason: self.lifecycle.default_rejection_reason.trim().to_string(),
        }
    }

    pub fn booking_config(&self) -> BookingConfig {
        BookingConfig {
            default_provider: self.booking.provider.as_str().to_string(),
            provider_timeout: Duration::from_millis(self.booking.timeout_ms),
            store_timeout: Duration::from_millis(self.lifecycle.store_timeout_ms),
            stale_claim_after: Duration::from_secs(self.booking.stale_claim_secs),
        }
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(lifecycle) = patch.lifecycle {
            if let Some(store_timeout_ms) = lifecycle.store_timeout_ms {
                self.lifecycle.store_timeout_ms = store_timeout_ms;
            }
            if let Some(reason) = lifecycle.default_rejection_reason {
                self.lifecycle.default_rejection_reason = reason;
            }
        }

        if let Some(booking) = patch.booking {
            if let Some(provider) = booking.provider {
                self.booking.provider = provider;
            }
            if let Some(base_url) = booking.base_url {
                self.booking.base_url = Some(base_url);
            }
            if let Some(api_key) = booking.api_key {
                self.booking.api_key = Some(SecretString::from(api_key));
            }
            if let Some(timeout_ms) = booking.timeout_ms {
                self.booking.timeout_ms = timeout_ms;
            }
            if let Some(stale_claim_secs) = booking.stale_claim_secs {
                self.booking.stale_claim_secs = stale_claim_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }

        if let Some(roles) = patch.roles {
            self.roles.extend(roles);
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("WAYPOINT_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("WAYPOINT_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_env("WAYPOINT_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("WAYPOINT_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_env("WAYPOINT_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("WAYPOINT_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("WAYPOINT_SERVER_PORT") {
            self.server.port = parse_env("WAYPOINT_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("WAYPOINT_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_env("WAYPOINT_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("WAYPOINT_LIFECYCLE_STORE_TIMEOUT_MS") {
            self.lifecycle.store_timeout_ms =
                parse_env("WAYPOINT_LIFECYCLE_STORE_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = read_env("WAYPOINT_LIFECYCLE_DEFAULT_REJECTION_REASON") {
            self.lifecycle.default_rejection_reason = value;
        }

        if let Some(value) = read_env("WAYPOINT_BOOKING_PROVIDER") {
            self.booking.provider = value.parse()?;
        }
        if let Some(value) = read_env("WAYPOINT_BOOKING_BASE_URL") {
            self.booking.base_url = Some(value);
        }
        if let Some(value) = read_env("WAYPOINT_BOOKING_API_KEY") {
            self.booking.api_key = Some(SecretString::from(value));
        }
        if let Some(value) = read_env("WAYPOINT_BOOKING_TIMEOUT_MS") {
            self.booking.timeout_ms = parse_env("WAYPOINT_BOOKING_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = read_env("WAYPOINT_BOOKING_STALE_CLAIM_SECS") {
            self.booking.stale_claim_secs = parse_env("WAYPOINT_BOOKING_STALE_CLAIM_SECS", &value)?;
        }

        let log_level =
            read_env("WAYPOINT_LOGGING_LEVEL").or_else(|| read_env("WAYPOINT_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("WAYPOINT_LOGGING_FORMAT").or_else(|| read_env("WAYPOINT_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
        if let Some(provider) = overrides.booking_provider {
            self.booking.provider = provider;
        }
        if let Some(base_url) = overrides.booking_base_url {
            self.booking.base_url = Some(base_url);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_server(&self.server)?;
        validate_lifecycle(&self.lifecycle)?;
        validate_booking(&self.booking)?;
        validate_claim_window(&self.lifecycle, &self.booking)?;
        validate_logging(&self.logging)?;
        self.role_registry()?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("waypoint.toml"), PathBuf::from("config/waypoint.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_lifecycle(lifecycle: &LifecycleSettings) -> Result<(), ConfigError> {
    if lifecycle.store_timeout_ms == 0 || lifecycle.store_timeout_ms > 60_000 {
        return Err(ConfigError::Validation(
            "lifecycle.store_timeout_ms must be in range 1..=60000".to_string(),
        ));
    }
    if lifecycle.default_rejection_reason.trim().is_empty() {
        return Err(ConfigError::Validation(
            "lifecycle.default_rejection_reason must not be blank; rejections always carry a reason"
                .to_string(),
        ));
    }
    Ok(())
}

fn validate_booking(booking: &BookingSettings) -> Result<(), ConfigError> {
    if booking.timeout_ms == 0 || booking.timeout_ms > 120_000 {
        return Err(ConfigError::Validation(
            "booking.timeout_ms must be in range 1..=120000".to_string(),
        ));
    }
    if booking.stale_claim_secs == 0 {
        return Err(ConfigError::Validation(
            "booking.stale_claim_secs must be greater than zero".to_string(),
        ));
    }

    if booking.provider == ProviderKind::Http {
        let base_url = booking.base_url.as_deref().map(str::trim).unwrap_or("");
        if base_url.is_empty() {
            return Err(ConfigError::Validation(
                "booking.base_url is required when booking.provider = \"http\"".to_string(),
            ));
        }
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "booking.base_url must start with http:// or https://".to_string(),
            ));
        }
        let key_missing = booking
            .api_key
            .as_ref()
            .map(|value| value.expose_secret().trim().is_empty())
            .unwrap_or(true);
        if key_missing {
            return Err(ConfigError::Validation(
                "booking.api_key is required for the http provider (set WAYPOINT_BOOKING_API_KEY)"
                    .to_string(),
            ));
        }
    }

    Ok(())
}

/// A pending claim may only be stolen once its owner can no longer be calling
/// the provider: claim write, provider call and settle write all have to fit.
fn validate_claim_window(
    lifecycle: &LifecycleSettings,
    booking: &BookingSettings,
) -> Result<(), ConfigError> {
    let in_flight_ms =
        booking.timeout_ms.saturating_add(lifecycle.store_timeout_ms.saturating_mul(2));
    if booking.stale_claim_secs.saturating_mul(1_000) <= in_flight_ms {
        return Err(ConfigError::Validation(format!(
            "booking.stale_claim_secs must exceed booking.timeout_ms + 2 * lifecycle.store_timeout_ms \
             ({in_flight_ms}ms); a shorter window lets a live booking be claimed twice"
        )));
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    lifecycle: Option<LifecyclePatch>,
    booking: Option<BookingPatch>,
    logging: Option<LoggingPatch>,
    roles: Option<BTreeMap<String, Vec<String>>>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LifecyclePatch {
    store_timeout_ms: Option<u64>,
    default_rejection_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BookingPatch {
    provider: Option<ProviderKind>,
    base_url: Option<String>,
    api_key: Option<String>,
    timeout_ms: Option<u64>,
    stale_claim_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
