use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use toml::Value;
use waypoint_core::config::{AppConfig, LoadOptions};

const ENV_ALIASES: [(&str, &str); 2] = [
    ("WAYPOINT_LOGGING_LEVEL", "WAYPOINT_LOG_LEVEL"),
    ("WAYPOINT_LOGGING_FORMAT", "WAYPOINT_LOG_FORMAT"),
];

/// Effective configuration, one line per key, with where each value came from.
pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key, value, env_key) in effective_fields(&config) {
        let source =
            field_source(key, env_key, config_file_doc.as_ref(), config_file_path.as_deref());
        lines.push(render_line(key, &value, source));
    }

    if config.roles.is_empty() {
        lines.push("- roles = <built-in registry> (source: default)".to_string());
    } else {
        for (role, permissions) in &config.roles {
            lines.push(render_line(
                &format!("roles.{role}"),
                &format!("[{}]", permissions.join(", ")),
                "file".to_string(),
            ));
        }
    }

    lines.join("\n")
}

fn effective_fields(config: &AppConfig) -> Vec<(&'static str, String, &'static str)> {
    let api_key = if config.booking.api_key.is_some() { "<redacted>" } else { "<unset>" };

    vec![
        ("database.url", config.database.url.clone(), "WAYPOINT_DATABASE_URL"),
        (
            "database.max_connections",
            config.database.max_connections.to_string(),
            "WAYPOINT_DATABASE_MAX_CONNECTIONS",
        ),
        (
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            "WAYPOINT_DATABASE_TIMEOUT_SECS",
        ),
        (
            "server.bind_address",
            config.server.bind_address.clone(),
            "WAYPOINT_SERVER_BIND_ADDRESS",
        ),
        ("server.port", config.server.port.to_string(), "WAYPOINT_SERVER_PORT"),
        (
            "server.graceful_shutdown_secs",
            config.server.graceful_shutdown_secs.to_string(),
            "WAYPOINT_SERVER_GRACEFUL_SHUTDOWN_SECS",
        ),
        (
            "lifecycle.store_timeout_ms",
            config.lifecycle.store_timeout_ms.to_string(),
            "WAYPOINT_LIFECYCLE_STORE_TIMEOUT_MS",
        ),
        (
            "lifecycle.default_rejection_reason",
            config.lifecycle.default_rejection_reason.clone(),
            "WAYPOINT_LIFECYCLE_DEFAULT_REJECTION_REASON",
        ),
        (
            "booking.provider",
            config.booking.provider.as_str().to_string(),
            "WAYPOINT_BOOKING_PROVIDER",
        ),
        (
            "booking.base_url",
            config.booking.base_url.clone().unwrap_or_else(|| "<unset>".to_string()),
            "WAYPOINT_BOOKING_BASE_URL",
        ),
        ("booking.api_key", api_key.to_string(), "WAYPOINT_BOOKING_API_KEY"),
        (
            "booking.timeout_ms",
            config.booking.timeout_ms.to_string(),
            "WAYPOINT_BOOKING_TIMEOUT_MS",
        ),
        (
            "booking.stale_claim_secs",
            config.booking.stale_claim_secs.to_string(),
            "WAYPOINT_BOOKING_STALE_CLAIM_SECS",
        ),
        ("logging.level", config.logging.level.clone(), "WAYPOINT_LOGGING_LEVEL"),
        (
            "logging.format",
            format!("{:?}", config.logging.format).to_ascii_lowercase(),
            "WAYPOINT_LOGGING_FORMAT",
        ),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    ["waypoint.toml", "config/waypoint.toml"]
        .into_iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: &str,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    let alias =
        ENV_ALIASES.iter().find(|(primary, _)| *primary == env_key).map(|(_, alias)| *alias);
    let from_env =
        [Some(env_key), alias].into_iter().flatten().find(|key| env::var_os(key).is_some());
    if let Some(key) = from_env {
        return format!("env ({key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}
