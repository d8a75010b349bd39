use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CONFIG_FILES: [&str; 2] = ["signoff.toml", "config/signoff.toml"];

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
    pub roles: RolesConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

/// Optimistic-concurrency tuning for the action processor.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub max_conflict_retries: u32,
    pub retry_backoff_ms: u64,
}

impl EngineConfig {
    /// Linear backoff before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(u64::from(attempt)))
    }
}

/// Role id to member actor ids, fed into the in-memory role directory.
#[derive(Clone, Debug, Default)]
pub struct RolesConfig {
    pub members: BTreeMap<String, Vec<String>>,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
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
    pub max_conflict_retries: Option<u32>,
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
                url: "sqlite://signoff.db?mode=rwc".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            engine: EngineConfig { max_conflict_retries: 5, retry_backoff_ms: 10 },
            roles: RolesConfig::default(),
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
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
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILES[0]));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
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

        if let Some(engine) = patch.engine {
            if let Some(max_conflict_retries) = engine.max_conflict_retries {
                self.engine.max_conflict_retries = max_conflict_retries;
            }
            if let Some(retry_backoff_ms) = engine.retry_backoff_ms {
                self.engine.retry_backoff_ms = retry_backoff_ms;
            }
        }

        if let Some(roles) = patch.roles {
            self.roles.members.extend(roles);
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("SIGNOFF_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("SIGNOFF_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("SIGNOFF_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("SIGNOFF_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("SIGNOFF_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("SIGNOFF_ENGINE_MAX_CONFLICT_RETRIES") {
            self.engine.max_conflict_retries =
                parse_u32("SIGNOFF_ENGINE_MAX_CONFLICT_RETRIES", &value)?;
        }
        if let Some(value) = read_env("SIGNOFF_ENGINE_RETRY_BACKOFF_MS") {
            self.engine.retry_backoff_ms = parse_u64("SIGNOFF_ENGINE_RETRY_BACKOFF_MS", &value)?;
        }

        if let Some(value) = read_env("SIGNOFF_ROLES") {
            self.roles.members = parse_role_members("SIGNOFF_ROLES", &value)?;
        }

        let log_level =
            read_env("SIGNOFF_LOGGING_LEVEL").or_else(|| read_env("SIGNOFF_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("SIGNOFF_LOGGING_FORMAT").or_else(|| read_env("SIGNOFF_LOG_FORMAT"));
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
        if let Some(max_conflict_retries) = overrides.max_conflict_retries {
            self.engine.max_conflict_retries = max_conflict_retries;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_engine(&self.engine)?;
        validate_roles(&self.roles)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

/// Finds the config file to load, preferring an explicit path.
pub fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    DEFAULT_CONFIG_FILES.into_iter().map(PathBuf::from).find(|path| path.exists())
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

fn validate_engine(engine: &EngineConfig) -> Result<(), ConfigError> {
    if engine.max_conflict_retries > 50 {
        return Err(ConfigError::Validation(
            "engine.max_conflict_retries must be in range 0..=50".to_string(),
        ));
    }

    if engine.retry_backoff_ms > 5_000 {
        return Err(ConfigError::Validation(
            "engine.retry_backoff_ms must be in range 0..=5000".to_string(),
        ));
    }

    Ok(())
}

fn validate_roles(roles: &RolesConfig) -> Result<(), ConfigError> {
    for (role_id, members) in &roles.members {
        if role_id.trim().is_empty() {
            return Err(ConfigError::Validation("roles keys must not be blank".to_string()));
        }
        if members.iter().any(|actor_id| actor_id.trim().is_empty()) {
            return Err(ConfigError::Validation(format!(
                "roles.{role_id} must not contain blank actor ids"
            )));
        }
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

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.trim().parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Parses `role=actor,actor;role=actor`.
fn parse_role_members(key: &str, value: &str) -> Result<BTreeMap<String, Vec<String>>, ConfigError> {
    let invalid =
        || ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() };

    let mut members = BTreeMap::new();
    for group in value.split(';').map(str::trim).filter(|group| !group.is_empty()) {
        let (role_id, actors) = group.split_once('=').ok_or_else(invalid)?;
        let role_id = role_id.trim();
        if role_id.is_empty() {
            return Err(invalid());
        }

        let actors = actors
            .split(',')
            .map(str::trim)
            .filter(|actor| !actor.is_empty())
            .map(str::to_owned)
            .collect::<Vec<_>>();
        members.insert(role_id.to_owned(), actors);
    }

    Ok(members)
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    engine: Option<EnginePatch>,
    roles: Option<BTreeMap<String, Vec<String>>>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct EnginePatch {
    max_conflict_retries: Option<u32>,
    retry_backoff_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
