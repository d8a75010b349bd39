pub mod action;
pub mod config;
pub mod doctor;
pub mod flow;
pub mod migrate;
pub mod seed;

use std::future::Future;

use serde::Serialize;
use serde_json::Value;
use signoff_core::config::{AppConfig, LoadOptions};
use signoff_core::errors::{ApplicationError, ErrorKind};
use signoff_db::{connect_with_config, migrations, DbPool};

/// `(error_class, message, exit_code)` for a command that did not complete.
pub type Failure = (&'static str, String, u8);

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        Self::completed(command, message, None)
    }

    pub fn success_with_data(
        command: &str,
        message: impl Into<String>,
        data: &impl Serialize,
    ) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => Self::completed(command, message, Some(value)),
            Err(error) => Self::failure(command, "serialization", error.to_string(), 1),
        }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
            data: None,
        };
        Self { exit_code, output: serialize_payload(payload) }
    }

    pub fn from_failure(command: &str, (error_class, message, exit_code): Failure) -> Self {
        Self::failure(command, error_class, message, exit_code)
    }

    fn completed(command: &str, message: impl Into<String>, data: Option<Value>) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
            data,
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }
}

/// Exit codes: 2 config, 3 runtime, 4 connectivity, 5 migration, 10.. domain errors.
pub fn application_failure(error: ApplicationError) -> Failure {
    let exit_code = match error.kind() {
        Some(ErrorKind::Validation) => 10,
        Some(ErrorKind::NotFound) => 11,
        Some(ErrorKind::InvalidState) => 12,
        Some(ErrorKind::StaleStep) => 13,
        Some(ErrorKind::AlreadyActed) => 14,
        Some(ErrorKind::Unauthorized) => 15,
        Some(ErrorKind::Conflict) => 16,
        None => match error {
            ApplicationError::Configuration(_) => 2,
            _ => 17,
        },
    };
    (error.error_class(), error.to_string(), exit_code)
}

/// Loads config, connects, applies pending migrations and hands the pool to `task`.
pub(crate) fn with_database<T, F, Fut>(task: F) -> Result<T, Failure>
where
    F: FnOnce(AppConfig, DbPool) -> Fut,
    Fut: Future<Output = Result<T, Failure>>,
{
    let config = AppConfig::load(LoadOptions::default())
        .map_err(|error| ("config_validation", format!("configuration issue: {error}"), 2u8))?;
    crate::init_logging(&config.logging);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|error| {
            ("runtime_init", format!("failed to initialize async runtime: {error}"), 3u8)
        })?;

    runtime.block_on(async move {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;

        let result = task(config, pool.clone()).await;
        pool.close().await;
        result
    })
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}

#[cfg(test)]
mod tests {
    use super::{application_failure, CommandResult};
    use signoff_core::domain::flow::FlowId;
    use signoff_core::errors::{ApplicationError, ApprovalError};

    #[test]
    fn domain_errors_map_to_distinct_exit_codes() {
        let not_found = application_failure(ApprovalError::FlowNotFound(FlowId("f".into())).into());
        let stale =
            application_failure(ApprovalError::StaleStep { submitted: 1, current: 2 }.into());
        let persistence = application_failure(ApplicationError::Persistence("disk".into()));

        assert_eq!((not_found.0, not_found.2), ("not_found", 11));
        assert_eq!((stale.0, stale.2), ("stale_step", 13));
        assert_eq!((persistence.0, persistence.2), ("persistence", 17));
    }

    #[test]
    fn success_payload_omits_absent_data() {
        let result = CommandResult::success("migrate", "applied pending migrations");
        let payload: serde_json::Value = serde_json::from_str(&result.output).expect("json");

        assert_eq!(payload["status"], "ok");
        assert!(payload.get("data").is_none());
        assert!(payload["error_class"].is_null());
    }
}
