use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use shutterdesk_core::domain::memory::MemoryPatch;
use shutterdesk_core::domain::policy::ActionKind;
use shutterdesk_core::domain::record::{Mutation, RecordId};
use shutterdesk_core::domain::tenant::StudioId;
use shutterdesk_db::{RecordRepository, RepositoryError};

/// Description of a tool as offered to the model.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub action_kind: ActionKind,
    pub parameters: Value,
}

/// Validated tool arguments in the shape the guardrails inspect.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ActionPayload {
    /// Canonical arguments; this is what a proposal stores and replays.
    pub arguments: Value,
    /// Record fields the action would write, keyed by field name.
    pub fields: Map<String, Value>,
    pub target: Option<RecordId>,
    pub amount: Option<Decimal>,
}

impl ActionPayload {
    pub fn read(arguments: Value) -> Self {
        Self { arguments, fields: Map::new(), target: None, amount: None }
    }

    pub fn write(arguments: Value, fields: Map<String, Value>) -> Self {
        Self { arguments, fields, target: None, amount: None }
    }

    pub fn with_target(mut self, target: RecordId) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_amount(mut self, amount: Decimal) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn field_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid arguments for `{tool}`: {message}")]
pub struct ValidationError {
    pub tool: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(tool: &str, message: impl Into<String>) -> Self {
        Self { tool: tool.to_string(), message: message.into() }
    }
}

/// Deserializes `arguments` into a tool's typed input.
pub fn parse_arguments<T>(tool: &str, arguments: &Value) -> Result<T, ValidationError>
where
    T: DeserializeOwned,
{
    let arguments = if arguments.is_null() { Value::Object(Map::new()) } else { arguments.clone() };
    serde_json::from_value(arguments).map_err(|e| ValidationError::new(tool, e.to_string()))
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid payload: {0}")]
    Invalid(String),
    #[error("{table} record `{id}` was not found")]
    RecordNotFound { table: &'static str, id: String },
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// What a handler may touch. Scoped to one studio for one call.
#[derive(Clone)]
pub struct ToolEnv {
    pub studio_id: StudioId,
    pub records: Arc<dyn RecordRepository>,
}

/// Handlers describe their effect; the runtime commits writes together with
/// the audit entry.
#[derive(Clone, Debug, PartialEq)]
pub enum ToolEffect {
    Read { output: Value, memory: Option<MemoryPatch> },
    Write { mutation: Mutation },
    Remember { patch: MemoryPatch },
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn action_kind(&self) -> ActionKind;

    /// JSON schema handed to the model.
    fn parameter_schema(&self) -> Value;

    fn validate(&self, arguments: &Value) -> Result<ActionPayload, ValidationError>;

    async fn execute(
        &self,
        payload: &ActionPayload,
        env: &ToolEnv,
    ) -> Result<ToolEffect, ToolError>;

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: self.description().to_string(),
            action_kind: self.action_kind(),
            parameters: self.parameter_schema(),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("tool `{0}` is already registered")]
    DuplicateTool(String),
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
}

impl RegistryError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::DuplicateTool(_) => "duplicate_tool",
            Self::UnknownTool(_) => "unknown_tool",
        }
    }
}

#[derive(Default)]
pub struct ToolRegistryBuilder {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistryBuilder {
    pub fn register<T>(&mut self, tool: T) -> Result<&mut Self, RegistryError>
    where
        T: Tool + 'static,
    {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<&mut Self, RegistryError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(RegistryError::DuplicateTool(name));
        }
        self.tools.insert(name, tool);
        Ok(self)
    }

    pub fn build(self) -> ToolRegistry {
        ToolRegistry { tools: self.tools }
    }
}

/// Immutable once built; share it behind an `Arc`.
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::default()
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Tool>, RegistryError> {
        self.tools.get(name).cloned().ok_or_else(|| RegistryError::UnknownTool(name.to_string()))
    }

    /// Registered tools ordered by name.
    pub fn list(&self) -> Vec<Arc<dyn Tool>> {
        self.tools.values().cloned().collect()
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.values().map(|tool| tool.spec()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use shutterdesk_core::domain::policy::ActionKind;

    use super::{
        ActionPayload, RegistryError, Tool, ToolEffect, ToolEnv, ToolError, ToolRegistry,
        ValidationError,
    };

    struct EchoTool(&'static str);

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &'static str {
            self.0
        }

        fn description(&self) -> &'static str {
            "Echoes its arguments."
        }

        fn action_kind(&self) -> ActionKind {
            ActionKind::ReadLeads
        }

        fn parameter_schema(&self) -> Value {
            json!({"type": "object"})
        }

        fn validate(&self, arguments: &Value) -> Result<ActionPayload, ValidationError> {
            Ok(ActionPayload::read(arguments.clone()))
        }

        async fn execute(
            &self,
            payload: &ActionPayload,
            _env: &ToolEnv,
        ) -> Result<ToolEffect, ToolError> {
            Ok(ToolEffect::Read { output: payload.arguments.clone(), memory: None })
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut builder = ToolRegistry::builder();
        builder.register(EchoTool("echo")).expect("first registration");
        let error = builder.register(EchoTool("echo")).err().expect("duplicate should fail");
        assert_eq!(error, RegistryError::DuplicateTool("echo".to_string()));
        assert_eq!(error.reason_code(), "duplicate_tool");
    }

    #[test]
    fn resolve_reports_unknown_names() {
        let mut builder = ToolRegistry::builder();
        builder.register(EchoTool("echo")).expect("register");
        let registry = builder.build();

        assert_eq!(registry.resolve("echo").expect("resolve").name(), "echo");
        let error = registry.resolve("delete_everything").err().expect("unknown tool");
        assert_eq!(error, RegistryError::UnknownTool("delete_everything".to_string()));
    }

    #[test]
    fn list_and_specs_are_ordered_by_name() {
        let mut builder = ToolRegistry::builder();
        builder
            .register(EchoTool("zeta"))
            .and_then(|b| b.register(EchoTool("alpha")))
            .expect("register");
        let registry = builder.build();

        let names: Vec<&str> = registry.list().iter().map(|tool| tool.name()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert_eq!(registry.specs()[0].action_kind, ActionKind::ReadLeads);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn parse_arguments_treats_null_as_empty_object() {
        #[derive(serde::Deserialize)]
        struct Input {
            #[serde(default)]
            limit: Option<u32>,
        }

        let parsed: Input = super::parse_arguments("list", &Value::Null).expect("null ok");
        assert!(parsed.limit.is_none());
    }
}
