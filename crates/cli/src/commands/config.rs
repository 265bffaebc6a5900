use std::env;
use std::fs;
use std::path::Path;

use secrecy::ExposeSecret;
use serde::Serialize;
use toml::Value;

use shutterdesk_core::config::{env_var_for, resolve_config_path, LoadOptions};

use crate::commands::{load_config, CommandResult};

#[derive(Debug, Serialize)]
struct ConfigEntry {
    key: &'static str,
    value: String,
    source: String,
}

struct Sources {
    file_path: Option<String>,
    file_doc: Option<Value>,
}

impl Sources {
    fn entry(&self, key: &'static str, value: String) -> ConfigEntry {
        ConfigEntry { key, value, source: self.source_of(key) }
    }

    fn source_of(&self, key_path: &str) -> String {
        let env_key = env_var_for(key_path)
            .filter(|env_key| env::var(env_key).is_ok_and(|value| !value.trim().is_empty()));
        if let Some(env_key) = env_key {
            return format!("env ({env_key})");
        }

        if let Some(doc) = &self.file_doc {
            if contains_path(doc, key_path) {
                let file_path = self.file_path.clone().unwrap_or_else(|| "config file".to_string());
                return format!("file ({file_path})");
            }
        }

        "default".to_string()
    }
}

/// Effective configuration with the source of every value. Secrets are
/// reported only as set or unset.
pub fn run(options: LoadOptions) -> CommandResult {
    let file_path = resolve_config_path(options.config_path.as_deref());
    let config = match load_config("config", options) {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    let sources = Sources {
        file_doc: file_path.as_deref().and_then(load_config_file_doc),
        file_path: file_path.map(|path| path.display().to_string()),
    };

    let unset = || "<unset>".to_string();
    let entries = vec![
        sources.entry("database.url", config.database.url.clone()),
        sources.entry("database.max_connections", config.database.max_connections.to_string()),
        sources.entry("database.timeout_secs", config.database.timeout_secs.to_string()),
        sources.entry("llm.provider", format!("{:?}", config.llm.provider).to_ascii_lowercase()),
        sources.entry("llm.model", config.llm.model.clone()),
        sources.entry("llm.base_url", config.llm.base_url.clone().unwrap_or_else(unset)),
        sources.entry(
            "llm.api_key",
            redact_secret(config.llm.api_key.as_ref().map(|key| key.expose_secret())),
        ),
        sources.entry("llm.timeout_secs", config.llm.timeout_secs.to_string()),
        sources.entry("agent.max_tool_rounds", config.agent.max_tool_rounds.to_string()),
        sources.entry("agent.max_calls_per_turn", config.agent.max_calls_per_turn.to_string()),
        sources.entry(
            "agent.policy_path",
            config
                .agent
                .policy_path
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(unset),
        ),
        sources.entry("logging.level", config.logging.level.clone()),
        sources.entry("logging.format", format!("{:?}", config.logging.format).to_ascii_lowercase()),
    ];

    CommandResult::data(
        "config",
        "effective config (source precedence: env > file > default)",
        entries,
    )
}

fn load_config_file_doc(path: &Path) -> Option<Value> {
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn redact_secret(secret: Option<&str>) -> String {
    match secret.map(str::trim) {
        None => "<unset>".to_string(),
        Some("") => "<empty>".to_string(),
        Some(_) => "<redacted>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::{contains_path, redact_secret};

    #[test]
    fn secrets_are_never_echoed() {
        assert_eq!(redact_secret(Some("sk-live-123")), "<redacted>");
        assert_eq!(redact_secret(Some("  ")), "<empty>");
        assert_eq!(redact_secret(None), "<unset>");
    }

    #[test]
    fn nested_keys_are_found_in_the_file_document() {
        let doc: toml::Value = "[agent]\nmax_tool_rounds = 3\n".parse().expect("toml");
        assert!(contains_path(&doc, "agent.max_tool_rounds"));
        assert!(!contains_path(&doc, "agent.policy_path"));
    }
}
