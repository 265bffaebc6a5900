use serde::Serialize;
use serde_json::Value;

use shutterdesk_agent::{crm_registry, guardrails, PolicyProvider};
use shutterdesk_core::config::LoadOptions;
use shutterdesk_core::domain::decision::Decision;
use shutterdesk_core::domain::policy::{ActionKind, PolicyMode};
use shutterdesk_core::domain::tenant::{StudioId, UserId};

use crate::commands::{load_config, load_policies, CommandResult};

#[derive(Debug, Serialize)]
struct PolicyCheck {
    studio_id: StudioId,
    user_id: UserId,
    tool: String,
    action_kind: ActionKind,
    mode: PolicyMode,
    decision: Decision,
    explanation: String,
}

/// Dry-run of the guardrail decision for one tool call. Nothing is executed
/// or audited.
pub fn check(
    options: LoadOptions,
    studio: &str,
    user: &str,
    tool_name: &str,
    arguments: &str,
) -> CommandResult {
    let config = match load_config("policy check", options) {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let provider = match load_policies("policy check", &config) {
        Ok(provider) => provider,
        Err(failure) => return failure,
    };

    let arguments: Value = match serde_json::from_str(arguments) {
        Ok(arguments) => arguments,
        Err(error) => {
            return CommandResult::failure(
                "policy check",
                "invalid_arguments",
                format!("--args must be a JSON object: {error}"),
                2,
            );
        }
    };
    let registry = match crm_registry() {
        Ok(registry) => registry,
        Err(error) => {
            return CommandResult::failure("policy check", error.reason_code(), error.to_string(), 1)
        }
    };
    let tool = match registry.resolve(tool_name) {
        Ok(tool) => tool,
        Err(error) => {
            return CommandResult::failure("policy check", error.reason_code(), error.to_string(), 6)
        }
    };
    let payload = match tool.validate(&arguments) {
        Ok(payload) => payload,
        Err(error) => {
            return CommandResult::failure("policy check", "validation_error", error.to_string(), 6)
        }
    };

    let studio_id = StudioId(studio.to_string());
    let user_id = UserId(user.to_string());
    let policy = provider.policy_for(&studio_id, &user_id);
    let decision = guardrails::decide(&policy, tool.action_kind(), &payload);

    CommandResult::data(
        "policy check",
        format!("{} -> {}", tool_name, decision.verdict.as_str()),
        PolicyCheck {
            studio_id,
            user_id,
            tool: tool_name.to_string(),
            action_kind: tool.action_kind(),
            mode: policy.mode,
            explanation: decision.explanation(),
            decision,
        },
    )
}
