pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use countersign_core::config::{AppConfig, LoadOptions, LogFormat};
use tracing_subscriber::EnvFilter;

use commands::approval::ApprovalCommand;

#[derive(Debug, Parser)]
#[command(
    name = "countersign",
    about = "Countersign contract approval CLI",
    long_about = "Drive contract approval chains and operate the countersign database: migrations, config inspection, and readiness checks.",
    after_help = "Examples:\n  countersign migrate\n  countersign approval create --contract C-100 --step role:DeptHead --step user:U42\n  countersign approval inbox --user U42 --role CEO"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Path to a countersign.toml file")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Inspect effective configuration values with source attribution")]
    Config,
    #[command(about = "Validate config, DB connectivity, and approval schema readiness")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Create, decide, and query contract approvals")]
    Approval {
        #[command(subcommand)]
        command: ApprovalCommand,
    },
}

/// Installs the global subscriber. Logs go to stderr so stdout carries only command output.
pub fn init_logging(config: &AppConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.logging.level)
            .with_context(|| format!("invalid log level `{}`", config.logging.level))?,
    };
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let installed = match config.logging.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(anyhow::Error::msg).context("failed to install tracing subscriber")
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let options = LoadOptions { config_path: cli.config, ..LoadOptions::default() };

    // A config error is reported by the command itself.
    if let Ok(config) = AppConfig::load(options.clone()) {
        if let Err(error) = init_logging(&config) {
            eprintln!("logging disabled: {error:#}");
        }
    }

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(options),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run(options) }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(options, json) }
        }
        Command::Approval { command } => commands::approval::run(options, command),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, Command};
    use crate::commands::approval::ApprovalCommand;

    #[test]
    fn parses_create_with_ordered_steps() {
        let cli = Cli::try_parse_from([
            "countersign",
            "approval",
            "create",
            "--contract",
            "C-100",
            "--step",
            "role:DeptHead",
            "--step",
            "user:U42",
        ])
        .expect("valid arguments");

        match cli.command {
            Command::Approval { command: ApprovalCommand::Create { contract, steps } } => {
                assert_eq!(contract, "C-100");
                assert_eq!(steps.len(), 2);
                assert_eq!(steps[0].approver_role.as_deref(), Some("DeptHead"));
                assert_eq!(steps[1].approver_user_id.as_deref(), Some("U42"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_decision_and_malformed_step() {
        let bad_decision = Cli::try_parse_from([
            "countersign",
            "approval",
            "decide",
            "--approval",
            "A-1",
            "--step",
            "S-1",
            "--decision",
            "maybe",
            "--user",
            "U1",
        ]);
        assert!(bad_decision.is_err());

        let bad_step = Cli::try_parse_from([
            "countersign",
            "approval",
            "create",
            "--contract",
            "C-1",
            "--step",
            "group:Legal",
        ]);
        assert!(bad_step.is_err());
    }
}
