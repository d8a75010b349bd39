use signoff_core::config::{AppConfig, LoadOptions};
use signoff_db::{connect_with_config, migrations};
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> String {
    let report = build_report();

    if json_output {
        return serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
    }

    render_human(&report)
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_role_directory(&config));
            checks.push(check_database(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            for name in ["role_directory", "database_schema"] {
                checks.push(DoctorCheck {
                    name,
                    status: CheckStatus::Skipped,
                    details: "skipped because configuration did not load".to_string(),
                });
            }
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_role_directory(config: &AppConfig) -> DoctorCheck {
    let role_count = config.roles.members.len();
    if role_count == 0 {
        return DoctorCheck {
            name: "role_directory",
            status: CheckStatus::Fail,
            details: "no approver roles configured; every approval would be refused".to_string(),
        };
    }

    let member_count: usize = config.roles.members.values().map(Vec::len).sum();
    DoctorCheck {
        name: "role_directory",
        status: CheckStatus::Pass,
        details: format!("{role_count} role(s) with {member_count} membership(s)"),
    }
}

fn check_database(config: &AppConfig) -> DoctorCheck {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return DoctorCheck {
                name: "database_schema",
                status: CheckStatus::Fail,
                details: format!("failed to initialize async runtime: {error}"),
            };
        }
    };

    let result = runtime.block_on(async {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| format!("failed to connect to database: {error}"))?;
        let status = migrations::status(&pool)
            .await
            .map_err(|error| format!("failed to read migration status: {error}"));
        pool.close().await;
        status
    });

    match result {
        Ok(status) if status.is_current() => DoctorCheck {
            name: "database_schema",
            status: CheckStatus::Pass,
            details: format!(
                "connected using `{}`; {} migration(s) applied, schema current",
                config.database.url,
                status.applied.len()
            ),
        },
        Ok(status) => DoctorCheck {
            name: "database_schema",
            status: CheckStatus::Fail,
            details: format!(
                "connected using `{}`; {} of {} migration(s) pending, run `signoff migrate`",
                config.database.url,
                status.pending.len(),
                status.applied.len() + status.pending.len()
            ),
        },
        Err(error) => DoctorCheck { name: "database_schema", status: CheckStatus::Fail, details: error },
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
