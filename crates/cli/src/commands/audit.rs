use chrono::{DateTime, Utc};

use shutterdesk_core::audit::AuditQuery;
use shutterdesk_core::config::LoadOptions;
use shutterdesk_core::domain::tenant::StudioId;
use shutterdesk_db::AgentStores;

use crate::commands::{block_on, load_config, open_database, CommandResult};

const COMMAND: &str = "audit list";

/// Entries for one studio, newest first. `since` is inclusive, `until`
/// exclusive; both are RFC 3339 timestamps.
pub fn list(
    options: LoadOptions,
    studio: &str,
    since: Option<&str>,
    until: Option<&str>,
    limit: u32,
) -> CommandResult {
    let query = match build_query(since, until, limit) {
        Ok(query) => query,
        Err(failure) => return failure,
    };
    let config = match load_config(COMMAND, options) {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    let result = block_on(COMMAND, async {
        let pool = open_database(COMMAND, &config).await?;
        let stores = AgentStores::sql(pool);
        let entries = stores
            .audit
            .list(&StudioId(studio.to_string()), &query)
            .await
            .map_err(|error| CommandResult::failure(COMMAND, "audit_read", error.to_string(), 4))?;
        Ok(CommandResult::data(COMMAND, format!("{} entries", entries.len()), entries))
    });
    result.unwrap_or_else(|failure| failure)
}

fn build_query(since: Option<&str>, until: Option<&str>, limit: u32) -> Result<AuditQuery, CommandResult> {
    Ok(AuditQuery {
        since: since.map(|raw| parse_time("--since", raw)).transpose()?,
        until: until.map(|raw| parse_time("--until", raw)).transpose()?,
        limit,
    })
}

fn parse_time(flag: &str, raw: &str) -> Result<DateTime<Utc>, CommandResult> {
    DateTime::parse_from_rfc3339(raw).map(|at| at.with_timezone(&Utc)).map_err(|error| {
        CommandResult::failure(
            COMMAND,
            "invalid_arguments",
            format!("{flag} must be an RFC 3339 timestamp: {error}"),
            2,
        )
    })
}
