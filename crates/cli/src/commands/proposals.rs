use std::sync::Arc;

use shutterdesk_agent::{crm_registry, ProposalError, ProposalWorkflow};
use shutterdesk_core::config::{AppConfig, LoadOptions};
use shutterdesk_core::domain::proposal::{ProposalId, ProposalStatus};
use shutterdesk_core::domain::tenant::{StudioId, UserId};
use shutterdesk_db::AgentStores;

use crate::commands::{block_on, load_config, load_policies, open_database, CommandResult};

pub fn list(options: LoadOptions, studio: &str, status: Option<&str>, limit: u32) -> CommandResult {
    const COMMAND: &str = "proposals list";
    let status = match status.map(|raw| (raw, ProposalStatus::parse(raw))) {
        None => None,
        Some((_, Some(status))) => Some(status),
        Some((raw, None)) => {
            return CommandResult::failure(
                COMMAND,
                "invalid_arguments",
                format!("unknown status `{raw}` (expected pending|approved|rejected)"),
                2,
            );
        }
    };

    with_workflow(COMMAND, options, |workflow| async move {
        let studio_id = StudioId(studio.to_string());
        let proposals = workflow
            .list(&studio_id, status, limit)
            .await
            .map_err(|error| rejected(COMMAND, &error))?;
        Ok(CommandResult::data(COMMAND, format!("{} proposals", proposals.len()), proposals))
    })
}

pub fn approve(options: LoadOptions, studio: &str, id: &str, reviewer: &str) -> CommandResult {
    const COMMAND: &str = "proposals approve";
    with_workflow(COMMAND, options, |workflow| async move {
        let approval = workflow
            .approve(
                &StudioId(studio.to_string()),
                &ProposalId(id.to_string()),
                &UserId(reviewer.to_string()),
            )
            .await
            .map_err(|error| rejected(COMMAND, &error))?;
        let message = match approval.execution.error() {
            None => format!("approved and executed {id}"),
            Some(error) => format!("approved {id}; execution failed: {error}"),
        };
        Ok(CommandResult::data(COMMAND, message, approval))
    })
}

pub fn reject(options: LoadOptions, studio: &str, id: &str, reviewer: &str) -> CommandResult {
    const COMMAND: &str = "proposals reject";
    with_workflow(COMMAND, options, |workflow| async move {
        let proposal = workflow
            .reject(
                &StudioId(studio.to_string()),
                &ProposalId(id.to_string()),
                &UserId(reviewer.to_string()),
            )
            .await
            .map_err(|error| rejected(COMMAND, &error))?;
        Ok(CommandResult::data(COMMAND, format!("rejected {id}"), proposal))
    })
}

fn with_workflow<F, Fut>(command: &str, options: LoadOptions, action: F) -> CommandResult
where
    F: FnOnce(ProposalWorkflow) -> Fut,
    Fut: std::future::Future<Output = Result<CommandResult, CommandResult>>,
{
    let config = match load_config(command, options) {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    let result = block_on(command, async {
        let workflow = build_workflow(command, &config).await?;
        action(workflow).await
    });
    result.unwrap_or_else(|failure| failure)
}

async fn build_workflow(command: &str, config: &AppConfig) -> Result<ProposalWorkflow, CommandResult> {
    let provider = load_policies(command, config)?;
    let registry = crm_registry()
        .map_err(|error| CommandResult::failure(command, error.reason_code(), error.to_string(), 1))?;
    let pool = open_database(command, config).await?;
    Ok(ProposalWorkflow::new(Arc::new(registry), Arc::new(provider), AgentStores::sql(pool)))
}

fn rejected(command: &str, error: &ProposalError) -> CommandResult {
    CommandResult::failure(command, error.reason_code(), error.to_string(), 6)
}
