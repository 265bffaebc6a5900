use std::env;
use std::fmt::Display;
use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub agent: AgentConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
}

/// Limits for one agent turn and the studio policy catalog to load.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub max_tool_rounds: u32,
    pub max_calls_per_turn: usize,
    pub policy_path: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
    Ollama,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

/// Values set by command-line flags. They win over every other layer.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub policy_path: Option<PathBuf>,
    pub max_tool_rounds: Option<u32>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("unknown config key `{key}` in {origin}")]
    UnknownKey { key: String, origin: String },
    #[error("invalid value for `{key}` from {origin}: `{value}`")]
    InvalidValue { key: String, origin: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

pub const CONFIG_FILE_CANDIDATES: [&str; 2] = ["shutterdesk.toml", "config/shutterdesk.toml"];

/// Every settable key with the environment variable that overrides it.
pub const ENV_VARS: [(&str, &str); 13] = [
    ("database.url", "SHUTTERDESK_DATABASE_URL"),
    ("database.max_connections", "SHUTTERDESK_DATABASE_MAX_CONNECTIONS"),
    ("database.timeout_secs", "SHUTTERDESK_DATABASE_TIMEOUT_SECS"),
    ("llm.provider", "SHUTTERDESK_LLM_PROVIDER"),
    ("llm.api_key", "SHUTTERDESK_LLM_API_KEY"),
    ("llm.base_url", "SHUTTERDESK_LLM_BASE_URL"),
    ("llm.model", "SHUTTERDESK_LLM_MODEL"),
    ("llm.timeout_secs", "SHUTTERDESK_LLM_TIMEOUT_SECS"),
    ("agent.max_tool_rounds", "SHUTTERDESK_AGENT_MAX_TOOL_ROUNDS"),
    ("agent.max_calls_per_turn", "SHUTTERDESK_AGENT_MAX_CALLS_PER_TURN"),
    ("agent.policy_path", "SHUTTERDESK_AGENT_POLICY_PATH"),
    ("logging.level", "SHUTTERDESK_LOGGING_LEVEL"),
    ("logging.format", "SHUTTERDESK_LOGGING_FORMAT"),
];

// Applied before ENV_VARS so the long names win when both are set.
const SHORT_ENV_VARS: [(&str, &str); 2] =
    [("logging.level", "SHUTTERDESK_LOG_LEVEL"), ("logging.format", "SHUTTERDESK_LOG_FORMAT")];

pub fn env_var_for(key: &str) -> Option<&'static str> {
    ENV_VARS.iter().find(|(candidate, _)| *candidate == key).map(|(_, var)| *var)
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://shutterdesk.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434".to_string()),
                model: "llama3.1".to_string(),
                timeout_secs: 30,
            },
            agent: AgentConfig { max_tool_rounds: 6, max_calls_per_turn: 8, policy_path: None },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" | "open_ai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|anthropic|ollama)"
            ))),
        }
    }
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    /// Layers defaults, the config file, `SHUTTERDESK_*` variables and
    /// `options.overrides`, then validates the result.
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        match resolve_config_path(options.config_path.as_deref()) {
            Some(path) => {
                let origin = format!("file ({})", path.display());
                for (key, value) in read_file_values(&path)? {
                    config.set(&key, value, &origin)?;
                }
            }
            None if options.require_file => {
                let expected = options
                    .config_path
                    .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_CANDIDATES[0]));
                return Err(ConfigError::MissingConfigFile(expected));
            }
            None => {}
        }

        for (key, var) in SHORT_ENV_VARS.iter().chain(ENV_VARS.iter()) {
            if let Some(value) = read_env(var) {
                config.set(key, value, &format!("env ({var})"))?;
            }
        }

        config.apply_overrides(options.overrides);
        config.validate()?;
        Ok(config)
    }

    fn set(&mut self, key: &str, value: String, origin: &str) -> Result<(), ConfigError> {
        match key {
            "database.url" => self.database.url = value,
            "database.max_connections" => {
                self.database.max_connections = parse_number(key, &value, origin)?
            }
            "database.timeout_secs" => {
                self.database.timeout_secs = parse_number(key, &value, origin)?
            }
            "llm.provider" => self.llm.provider = value.parse()?,
            "llm.api_key" => self.llm.api_key = Some(SecretString::from(value)),
            "llm.base_url" => self.llm.base_url = Some(value),
            "llm.model" => self.llm.model = value,
            "llm.timeout_secs" => self.llm.timeout_secs = parse_number(key, &value, origin)?,
            "agent.max_tool_rounds" => {
                self.agent.max_tool_rounds = parse_number(key, &value, origin)?
            }
            "agent.max_calls_per_turn" => {
                self.agent.max_calls_per_turn = parse_number(key, &value, origin)?
            }
            "agent.policy_path" => self.agent.policy_path = Some(PathBuf::from(value)),
            "logging.level" => self.logging.level = value,
            "logging.format" => self.logging.format = value.parse()?,
            _ => {
                return Err(ConfigError::UnknownKey {
                    key: key.to_string(),
                    origin: origin.to_string(),
                })
            }
        }
        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        let ConfigOverrides {
            database_url,
            log_level,
            llm_provider,
            llm_model,
            policy_path,
            max_tool_rounds,
        } = overrides;

        if let Some(url) = database_url {
            self.database.url = url;
        }
        if let Some(level) = log_level {
            self.logging.level = level;
        }
        if let Some(provider) = llm_provider {
            self.llm.provider = provider;
        }
        if let Some(model) = llm_model {
            self.llm.model = model;
        }
        if policy_path.is_some() {
            self.agent.policy_path = policy_path;
        }
        if let Some(rounds) = max_tool_rounds {
            self.agent.max_tool_rounds = rounds;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.database.url.trim();
        if !(url.starts_with("sqlite:") || url == ":memory:") {
            return Err(ConfigError::Validation(
                "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                    .to_string(),
            ));
        }
        within("database.max_connections", self.database.max_connections, 1..=64)?;
        within("database.timeout_secs", self.database.timeout_secs, 1..=300)?;
        within("llm.timeout_secs", self.llm.timeout_secs, 1..=300)?;
        within("agent.max_tool_rounds", self.agent.max_tool_rounds, 1..=32)?;
        within("agent.max_calls_per_turn", self.agent.max_calls_per_turn, 1..=64)?;

        let present = |value: Option<&str>| value.is_some_and(|value| !value.trim().is_empty());
        match self.llm.provider {
            LlmProvider::OpenAi | LlmProvider::Anthropic
                if !present(self.llm.api_key.as_ref().map(|key| key.expose_secret())) =>
            {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for openai/anthropic providers".to_string(),
                ));
            }
            LlmProvider::Ollama if !present(self.llm.base_url.as_deref()) => {
                return Err(ConfigError::Validation(
                    "llm.base_url is required for ollama provider".to_string(),
                ));
            }
            _ => {}
        }

        if let Some(path) = self.agent.policy_path.as_ref().filter(|path| !path.exists()) {
            return Err(ConfigError::Validation(format!(
                "agent.policy_path `{}` does not exist",
                path.display()
            )));
        }

        if !matches!(
            self.logging.level.trim().to_ascii_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(ConfigError::Validation(
                "logging.level must be one of trace|debug|info|warn|error".to_string(),
            ));
        }

        Ok(())
    }
}

pub fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    CONFIG_FILE_CANDIDATES.into_iter().map(PathBuf::from).find(|path| path.exists())
}

/// Flattens `[section] field = value` pairs into dotted keys.
fn read_file_values(path: &Path) -> Result<Vec<(String, String)>, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;
    let document = toml::from_str::<toml::Table>(&interpolate_env_vars(&raw)?)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })?;

    let origin = || format!("file ({})", path.display());
    let mut values = Vec::new();
    for (section, fields) in document {
        let toml::Value::Table(fields) = fields else {
            return Err(ConfigError::UnknownKey { key: section, origin: origin() });
        };
        for (field, value) in fields {
            let value = match value {
                toml::Value::String(text) => text,
                other => other.to_string(),
            };
            values.push((format!("{section}.{field}"), value));
        }
    }
    Ok(values)
}

/// Replaces each `${VAR}` with the variable's value.
fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        let end = tail.find('}').ok_or(ConfigError::UnterminatedInterpolation)?;
        let var = &tail[..end];
        let value = env::var(var)
            .map_err(|_| ConfigError::MissingEnvInterpolation { var: var.to_string() })?;
        output.push_str(&value);
        rest = &tail[end + 1..];
    }

    output.push_str(rest);
    Ok(output)
}

fn read_env(var: &str) -> Option<String> {
    env::var(var).ok().filter(|value| !value.trim().is_empty())
}

fn parse_number<T: FromStr>(key: &str, value: &str, origin: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        origin: origin.to_string(),
        value: value.to_string(),
    })
}

fn within<T>(key: &str, value: T, range: RangeInclusive<T>) -> Result<(), ConfigError>
where
    T: PartialOrd + Display,
{
    if range.contains(&value) {
        return Ok(());
    }
    Err(ConfigError::Validation(format!(
        "{key} must be in range {}..={} (got {value})",
        range.start(),
        range.end()
    )))
}
