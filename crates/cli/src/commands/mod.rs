pub mod audit;
pub mod config;
pub mod migrate;
pub mod policy;
pub mod proposals;
pub mod tools;

use std::future::Future;
use std::path::PathBuf;

use serde::Serialize;
use serde_json::Value;

use shutterdesk_agent::CatalogPolicyProvider;
use shutterdesk_core::config::{AppConfig, LoadOptions};
use shutterdesk_core::policy::PolicyCatalog;
use shutterdesk_db::{connect_and_migrate, DbPool};

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
        Self::with_data(command, message, None)
    }

    pub fn data(command: &str, message: impl Into<String>, data: impl Serialize) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => Self::with_data(command, message, Some(value)),
            Err(error) => Self::failure(command, "serialization", error.to_string(), 1),
        }
    }

    fn with_data(command: &str, message: impl Into<String>, data: Option<Value>) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
            data,
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
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
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}

pub fn load_options(config_path: Option<PathBuf>) -> LoadOptions {
    LoadOptions { config_path, ..LoadOptions::default() }
}

pub(crate) fn load_config(command: &str, options: LoadOptions) -> Result<AppConfig, CommandResult> {
    AppConfig::load(options).map_err(|error| {
        CommandResult::failure(command, "config_validation", format!("configuration issue: {error}"), 2)
    })
}

/// The configured policy file, or the deny-by-default catalog when none is set.
pub(crate) fn load_policies(
    command: &str,
    config: &AppConfig,
) -> Result<CatalogPolicyProvider, CommandResult> {
    let catalog = match &config.agent.policy_path {
        Some(path) => PolicyCatalog::load(path).map_err(|error| {
            CommandResult::failure(command, "policy_catalog", error.to_string(), 2)
        })?,
        None => PolicyCatalog::default(),
    };
    Ok(CatalogPolicyProvider::new(catalog))
}

pub(crate) fn block_on<F, T>(command: &str, future: F) -> Result<T, CommandResult>
where
    F: Future<Output = Result<T, CommandResult>>,
{
    let runtime =
        tokio::runtime::Builder::new_current_thread().enable_all().build().map_err(|error| {
            CommandResult::failure(
                command,
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            )
        })?;
    runtime.block_on(future)
}

pub(crate) async fn open_database(command: &str, config: &AppConfig) -> Result<DbPool, CommandResult> {
    connect_and_migrate(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(|error| CommandResult::failure(command, "db_connectivity", error.to_string(), 4))
}
