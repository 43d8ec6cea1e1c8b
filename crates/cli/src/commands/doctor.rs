use countersign_core::config::{AppConfig, LoadOptions};
use countersign_db::connect_with_config;
use serde::Serialize;
use sqlx::Row;

use crate::commands::block_on;

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

pub fn run(options: LoadOptions, json_output: bool) -> String {
    let report = build_report(options);

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

fn skipped(name: &'static str) -> DoctorCheck {
    DoctorCheck {
        name,
        status: CheckStatus::Skipped,
        details: "skipped because an earlier check failed".to_string(),
    }
}

fn build_report(options: LoadOptions) -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(options) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: format!(
                    "configuration loaded (page size {} of max {})",
                    config.workflow.default_page_size, config.workflow.max_page_size
                ),
            });
            checks.extend(check_database(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            checks.push(skipped("database_connectivity"));
            checks.push(skipped("approval_schema"));
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

/// Connectivity first, then whether the approval tables exist.
fn check_database(config: &AppConfig) -> Vec<DoctorCheck> {
    let result = block_on(async {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| format!("failed to connect to database: {error}"))?;

        let tables = sqlx::query(
            "SELECT COUNT(*) AS count FROM sqlite_master
             WHERE type = 'table' AND name IN ('approval', 'approval_step')",
        )
        .fetch_one(&pool)
        .await
        .and_then(|row| row.try_get::<i64, _>("count"));

        pool.close().await;
        Ok::<Result<i64, String>, String>(tables.map_err(|error| error.to_string()))
    });

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(error) => Err(format!("{error:#}")),
    };

    match outcome {
        Ok(Ok(2)) => vec![
            DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Pass,
                details: format!("connected using `{}`", config.database.url),
            },
            DoctorCheck {
                name: "approval_schema",
                status: CheckStatus::Pass,
                details: "approval tables are present".to_string(),
            },
        ],
        Ok(Ok(_)) => vec![
            DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Pass,
                details: format!("connected using `{}`", config.database.url),
            },
            DoctorCheck {
                name: "approval_schema",
                status: CheckStatus::Fail,
                details: "approval tables are missing; run `countersign migrate`".to_string(),
            },
        ],
        Ok(Err(error)) => vec![
            DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Pass,
                details: format!("connected using `{}`", config.database.url),
            },
            DoctorCheck { name: "approval_schema", status: CheckStatus::Fail, details: error },
        ],
        Err(error) => vec![
            DoctorCheck { name: "database_connectivity", status: CheckStatus::Fail, details: error },
            skipped("approval_schema"),
        ],
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
