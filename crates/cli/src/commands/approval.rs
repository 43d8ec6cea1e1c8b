use clap::{Args, Subcommand};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use countersign_core::config::{AppConfig, LoadOptions};
use countersign_core::domain::approval::{
    ApplyDecision, Approval, ApprovalId, ContractId, Decision, Principal, StepDefinition, StepId,
};
use countersign_core::events::TracingEventSink;
use countersign_db::repositories::ApprovalRepository;
use countersign_db::{
    connect_with_config, migrations, ApprovalWorkflowService, SqlApprovalRepository,
    WorkflowServiceError,
};

use crate::commands::{block_on, CommandResult};

#[derive(Debug, Subcommand)]
pub enum ApprovalCommand {
    #[command(about = "Open an approval chain for a contract")]
    Create {
        #[arg(long)]
        contract: String,
        #[arg(
            long = "step",
            required = true,
            value_name = "user:<id>|role:<name>",
            help = "Approver binding for the next step, in order"
        )]
        steps: Vec<StepDefinition>,
    },
    #[command(about = "Approve or reject the active step")]
    Decide {
        #[arg(long)]
        approval: String,
        #[arg(long)]
        step: String,
        #[arg(long, value_parser = parse_decision, help = "approve|reject")]
        decision: Decision,
        #[command(flatten)]
        principal: PrincipalArgs,
        #[arg(long)]
        comments: Option<String>,
        #[arg(long, help = "Version the decision was made against")]
        expected_version: Option<u32>,
    },
    #[command(about = "Cancel a pending approval")]
    Cancel {
        #[arg(long)]
        approval: String,
        #[arg(long)]
        reason: String,
    },
    #[command(about = "Archive a finished approval")]
    Archive {
        #[arg(long)]
        approval: String,
    },
    #[command(about = "Show one approval with its steps")]
    Show {
        #[arg(long)]
        approval: String,
    },
    #[command(about = "Show the pending approval of a contract, if any")]
    Pending {
        #[arg(long)]
        contract: String,
    },
    #[command(about = "List a contract's approvals, newest first")]
    History {
        #[arg(long)]
        contract: String,
    },
    #[command(about = "List approvals waiting on a user or one of their roles")]
    Inbox {
        #[command(flatten)]
        principal: PrincipalArgs,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long)]
        page_size: Option<u32>,
    },
}

#[derive(Debug, Clone, Args)]
pub struct PrincipalArgs {
    #[arg(long = "user", help = "Acting user id")]
    pub user_id: String,
    #[arg(long = "role", help = "Role held by the acting user; repeatable")]
    pub roles: Vec<String>,
}

impl From<PrincipalArgs> for Principal {
    fn from(args: PrincipalArgs) -> Self {
        Principal::new(args.user_id, args.roles)
    }
}

impl ApprovalCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "approval.create",
            Self::Decide { .. } => "approval.decide",
            Self::Cancel { .. } => "approval.cancel",
            Self::Archive { .. } => "approval.archive",
            Self::Show { .. } => "approval.show",
            Self::Pending { .. } => "approval.pending",
            Self::History { .. } => "approval.history",
            Self::Inbox { .. } => "approval.inbox",
        }
    }
}

fn parse_decision(value: &str) -> Result<Decision, String> {
    Decision::parse(value)
        .ok_or_else(|| format!("unknown decision `{value}` (expected approve|reject)"))
}

/// Approval plus its derived active step, as printed by every approval command.
#[derive(Debug, Serialize)]
struct ApprovalView {
    #[serde(flatten)]
    approval: Approval,
    active_step_id: Option<StepId>,
}

impl From<Approval> for ApprovalView {
    fn from(approval: Approval) -> Self {
        let active_step_id = approval.active_step().map(|step| step.id.clone());
        Self { approval, active_step_id }
    }
}

pub fn run(options: LoadOptions, command: ApprovalCommand) -> CommandResult {
    let name = command.name();
    let config = match AppConfig::load(options) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                name,
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let correlation_id = format!("cli-{}", Uuid::now_v7());
    let span =
        tracing::info_span!("approval_command", command = name, correlation_id = %correlation_id);
    let _entered = span.enter();

    let result = block_on(async {
        let pool = match connect_with_config(&config.database).await {
            Ok(pool) => pool,
            Err(error) => {
                return CommandResult::failure(name, "db_connectivity", error.to_string(), 4);
            }
        };
        if let Err(error) = migrations::run_pending(&pool).await {
            pool.close().await;
            return CommandResult::failure(name, "migration", error.to_string(), 5);
        }

        let service = ApprovalWorkflowService::with_config(
            SqlApprovalRepository::new(pool.clone()),
            TracingEventSink,
            &config.workflow,
        );
        let outcome = match execute(&service, command, config.workflow.default_page_size).await {
            Ok(outcome) => outcome,
            Err(error) => {
                let interface = error.into_interface(correlation_id.clone());
                warn!(
                    event_name = "cli.approval.failed",
                    correlation_id = %correlation_id,
                    command = name,
                    error_class = interface.error_class(),
                    error = %interface,
                    "approval command failed"
                );
                CommandResult::from_interface(name, &interface)
            }
        };

        pool.close().await;
        outcome
    });

    match result {
        Ok(result) => result,
        Err(error) => CommandResult::failure(name, "runtime_init", format!("{error:#}"), 3),
    }
}

async fn execute<R>(
    service: &ApprovalWorkflowService<R, TracingEventSink>,
    command: ApprovalCommand,
    default_page_size: u32,
) -> Result<CommandResult, WorkflowServiceError>
where
    R: ApprovalRepository,
{
    let name = command.name();

    let result = match command {
        ApprovalCommand::Create { contract, steps } => {
            let approval_id = service.create(ContractId(contract), &steps).await?;
            let approval = service.get(&approval_id).await?;
            CommandResult::success_with_data(
                name,
                format!("approval {approval_id} created"),
                ApprovalView::from(approval),
            )
        }
        ApprovalCommand::Decide {
            approval,
            step,
            decision,
            principal,
            comments,
            expected_version,
        } => {
            let updated = service
                .apply(ApplyDecision {
                    approval_id: ApprovalId(approval),
                    step_id: StepId(step),
                    decision,
                    principal: principal.into(),
                    comments,
                    expected_version,
                })
                .await?;
            CommandResult::success_with_data(
                name,
                format!(
                    "decision `{}` recorded; approval is {}",
                    decision.as_str(),
                    updated.status()
                ),
                ApprovalView::from(updated),
            )
        }
        ApprovalCommand::Cancel { approval, reason } => {
            let cancelled = service.cancel(&ApprovalId(approval), &reason).await?;
            CommandResult::success_with_data(
                name,
                format!("approval {} cancelled", cancelled.id()),
                ApprovalView::from(cancelled),
            )
        }
        ApprovalCommand::Archive { approval } => {
            let archived = service.archive(&ApprovalId(approval)).await?;
            CommandResult::success_with_data(
                name,
                format!("approval {} archived", archived.id()),
                ApprovalView::from(archived),
            )
        }
        ApprovalCommand::Show { approval } => {
            let found = service.get(&ApprovalId(approval)).await?;
            CommandResult::success_with_data(
                name,
                format!("approval {} is {}", found.id(), found.status()),
                ApprovalView::from(found),
            )
        }
        ApprovalCommand::Pending { contract } => {
            let contract_id = ContractId(contract);
            match service.pending_for_contract(&contract_id).await? {
                Some(pending) => CommandResult::success_with_data(
                    name,
                    format!("contract {contract_id} has pending approval {}", pending.id()),
                    ApprovalView::from(pending),
                ),
                None => CommandResult::success(
                    name,
                    format!("contract {contract_id} has no pending approval"),
                ),
            }
        }
        ApprovalCommand::History { contract } => {
            let contract_id = ContractId(contract);
            let history: Vec<ApprovalView> = service
                .history_for_contract(&contract_id)
                .await?
                .into_iter()
                .map(ApprovalView::from)
                .collect();
            CommandResult::success_with_data(
                name,
                format!("{} approvals for contract {contract_id}", history.len()),
                history,
            )
        }
        ApprovalCommand::Inbox { principal, page, page_size } => {
            let principal = Principal::from(principal);
            let results = service
                .pending_for_approver(&principal, page, page_size.unwrap_or(default_page_size))
                .await?
                .map(ApprovalView::from);
            CommandResult::success_with_data(
                name,
                format!(
                    "{} approvals awaiting {} (page {} of {})",
                    results.total_items, principal.user_id, results.page, results.total_pages
                ),
                results,
            )
        }
    };

    Ok(result)
}
