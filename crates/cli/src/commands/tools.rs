use shutterdesk_agent::crm_registry;

use crate::commands::CommandResult;

pub fn run() -> CommandResult {
    match crm_registry() {
        Ok(registry) => CommandResult::data(
            "tools",
            format!("{} registered tools", registry.len()),
            registry.specs(),
        ),
        Err(error) => CommandResult::failure("tools", error.reason_code(), error.to_string(), 1),
    }
}
