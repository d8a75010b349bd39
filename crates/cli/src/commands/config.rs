use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use signoff_core::config::{resolve_config_path, AppConfig, LoadOptions};
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = resolve_config_path(None);
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    let source = |key_path: &str, env_keys: &[&str]| {
        field_source(key_path, env_keys, config_file_doc.as_ref(), config_file_path.as_deref())
    };

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];

    lines.push(render_line(
        "database.url",
        &config.database.url,
        source("database.url", &["SIGNOFF_DATABASE_URL"]),
    ));
    lines.push(render_line(
        "database.max_connections",
        &config.database.max_connections.to_string(),
        source("database.max_connections", &["SIGNOFF_DATABASE_MAX_CONNECTIONS"]),
    ));
    lines.push(render_line(
        "database.timeout_secs",
        &config.database.timeout_secs.to_string(),
        source("database.timeout_secs", &["SIGNOFF_DATABASE_TIMEOUT_SECS"]),
    ));
    lines.push(render_line(
        "engine.max_conflict_retries",
        &config.engine.max_conflict_retries.to_string(),
        source("engine.max_conflict_retries", &["SIGNOFF_ENGINE_MAX_CONFLICT_RETRIES"]),
    ));
    lines.push(render_line(
        "engine.retry_backoff_ms",
        &config.engine.retry_backoff_ms.to_string(),
        source("engine.retry_backoff_ms", &["SIGNOFF_ENGINE_RETRY_BACKOFF_MS"]),
    ));

    if config.roles.members.is_empty() {
        lines.push(render_line("roles", "<none>", source("roles", &["SIGNOFF_ROLES"])));
    }
    for (role_id, members) in &config.roles.members {
        lines.push(render_line(
            &format!("roles.{role_id}"),
            &members.join(","),
            source(&format!("roles.{role_id}"), &["SIGNOFF_ROLES"]),
        ));
    }

    lines.push(render_line(
        "logging.level",
        &config.logging.level,
        source("logging.level", &["SIGNOFF_LOGGING_LEVEL", "SIGNOFF_LOG_LEVEL"]),
    ));
    lines.push(render_line(
        "logging.format",
        &format!("{:?}", config.logging.format),
        source("logging.format", &["SIGNOFF_LOGGING_FORMAT", "SIGNOFF_LOG_FORMAT"]),
    ));

    lines.join("\n")
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let raw = fs::read_to_string(path?).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("config file"));
            return format!("file ({})", file_path.display());
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
