//! The CRM tools offered to the model.

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use shutterdesk_core::domain::memory::MemoryPatch;
use shutterdesk_core::domain::policy::ActionKind;
use shutterdesk_core::domain::record::{Mutation, Record, RecordFilter, RecordId, Table};

use crate::tools::{
    parse_arguments, ActionPayload, RegistryError, Tool, ToolEffect, ToolEnv, ToolError,
    ToolRegistry, ValidationError,
};

const DEFAULT_LIST_LIMIT: u32 = 20;
const MAX_LIST_LIMIT: u32 = 100;

/// Fields the store owns; no tool may set them.
const MANAGED_FIELDS: [&str; 3] = ["id", "version", "created_at"];

/// Registry with every CRM tool.
pub fn crm_registry() -> Result<ToolRegistry, RegistryError> {
    let mut builder = ToolRegistry::builder();
    builder
        .register(ListLeadsTool)?
        .register(CreateLeadTool)?
        .register(UpdateLeadTool)?
        .register(ListClientsTool)?
        .register(GetClientTool)?
        .register(CreateClientTool)?
        .register(UpdateClientTool)?
        .register(CreateInvoiceTool)?
        .register(RememberTool)?;
    Ok(builder.build())
}

fn list_limit(limit: Option<u32>) -> u32 {
    limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
}

fn required_text(tool: &str, field: &str, value: &str) -> Result<String, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::new(tool, format!("`{field}` must not be empty")));
    }
    Ok(trimmed.to_string())
}

fn check_email(tool: &str, email: &str) -> Result<(), ValidationError> {
    match email.trim().split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(()),
        _ => Err(ValidationError::new(tool, format!("`{email}` is not a valid email address"))),
    }
}

fn to_object<T: Serialize>(tool: &str, value: &T) -> Result<Map<String, Value>, ValidationError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ValidationError::new(tool, "arguments must be an object")),
        Err(e) => Err(ValidationError::new(tool, e.to_string())),
    }
}

/// Checks a change set for an existing record.
fn check_changes(tool: &str, changes: &Map<String, Value>) -> Result<(), ValidationError> {
    if changes.is_empty() {
        return Err(ValidationError::new(tool, "`changes` must contain at least one field"));
    }
    if let Some(field) = changes.keys().find(|key| MANAGED_FIELDS.contains(&key.as_str())) {
        return Err(ValidationError::new(tool, format!("`{field}` is managed by the store")));
    }
    if let Some(email) = changes.get("email") {
        let email = email
            .as_str()
            .ok_or_else(|| ValidationError::new(tool, "`email` must be a string"))?;
        check_email(tool, email)?;
    }
    Ok(())
}

fn snapshots(records: &[Record]) -> Vec<Value> {
    records.iter().map(|record| record.snapshot()).collect()
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct ListLeadsInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    limit: Option<u32>,
}

pub struct ListLeadsTool;

#[async_trait]
impl Tool for ListLeadsTool {
    fn name(&self) -> &'static str {
        "list_leads"
    }

    fn description(&self) -> &'static str {
        "List the studio's leads, newest first, optionally filtered by status or source."
    }

    fn action_kind(&self) -> ActionKind {
        ActionKind::ReadLeads
    }

    fn parameter_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "status": {"type": "string", "description": "e.g. new, contacted, booked, lost"},
                "source": {"type": "string"},
                "limit": {"type": "integer", "minimum": 1, "maximum": MAX_LIST_LIMIT}
            },
            "additionalProperties": false
        })
    }

    fn validate(&self, arguments: &Value) -> Result<ActionPayload, ValidationError> {
        let input: ListLeadsInput = parse_arguments(self.name(), arguments)?;
        Ok(ActionPayload::read(json!(input)))
    }

    async fn execute(
        &self,
        payload: &ActionPayload,
        env: &ToolEnv,
    ) -> Result<ToolEffect, ToolError> {
        let input: ListLeadsInput = serde_json::from_value(payload.arguments.clone())
            .map_err(|e| ToolError::Invalid(e.to_string()))?;
        let mut filter = RecordFilter::all();
        if let Some(status) = input.status {
            filter = filter.field_equals("status", status);
        }
        if let Some(source) = input.source {
            filter = filter.field_equals("source", source);
        }

        let leads =
            env.records.select(&env.studio_id, Table::Leads, &filter, list_limit(input.limit)).await?;
        Ok(ToolEffect::Read {
            output: json!({"count": leads.len(), "leads": snapshots(&leads)}),
            memory: None,
        })
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct CreateLeadInput {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    shoot_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    event_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    notes: Option<String>,
    /// Studio-specific custom fields.
    #[serde(flatten)]
    extra: Map<String, Value>,
}

pub struct CreateLeadTool;

#[async_trait]
impl Tool for CreateLeadTool {
    fn name(&self) -> &'static str {
        "create_lead"
    }

    fn description(&self) -> &'static str {
        "Create a new lead (a prospective client enquiry)."
    }

    fn action_kind(&self) -> ActionKind {
        ActionKind::CreateLead
    }

    fn parameter_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "email": {"type": "string", "format": "email"},
                "phone": {"type": "string"},
                "source": {"type": "string"},
                "shoot_type": {"type": "string", "description": "wedding, portrait, newborn, ..."},
                "event_date": {"type": "string", "format": "date"},
                "notes": {"type": "string"}
            },
            "required": ["name"],
            "additionalProperties": true
        })
    }

    fn validate(&self, arguments: &Value) -> Result<ActionPayload, ValidationError> {
        let mut input: CreateLeadInput = parse_arguments(self.name(), arguments)?;
        input.name = required_text(self.name(), "name", &input.name)?;
        if let Some(email) = &input.email {
            check_email(self.name(), email)?;
        }
        if let Some(field) = input.extra.keys().find(|key| MANAGED_FIELDS.contains(&key.as_str()))
        {
            return Err(ValidationError::new(self.name(), format!("`{field}` is managed by the store")));
        }

        let arguments = to_object(self.name(), &input)?;
        let mut fields = arguments.clone();
        fields.entry("status").or_insert_with(|| json!("new"));
        Ok(ActionPayload::write(Value::Object(arguments), fields))
    }

    async fn execute(
        &self,
        payload: &ActionPayload,
        _env: &ToolEnv,
    ) -> Result<ToolEffect, ToolError> {
        Ok(ToolEffect::Write {
            mutation: Mutation::Insert { table: Table::Leads, fields: payload.fields.clone() },
        })
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct UpdateRecordInput {
    #[serde(alias = "lead_id", alias = "client_id")]
    id: String,
    changes: Map<String, Value>,
}

fn validate_update(
    tool: &str,
    id_field: &str,
    arguments: &Value,
) -> Result<ActionPayload, ValidationError> {
    let input: UpdateRecordInput = parse_arguments(tool, arguments)?;
    let id = required_text(tool, id_field, &input.id)?;
    check_changes(tool, &input.changes)?;

    let canonical = json!({ id_field: id, "changes": input.changes });
    Ok(ActionPayload::write(canonical, input.changes).with_target(RecordId(id)))
}

fn update_effect(table: Table, payload: &ActionPayload) -> Result<ToolEffect, ToolError> {
    let id = payload
        .target
        .clone()
        .ok_or_else(|| ToolError::Invalid("update payload carries no target".to_string()))?;
    Ok(ToolEffect::Write { mutation: Mutation::Update { table, id, patch: payload.fields.clone() } })
}

fn update_schema(id_field: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            id_field: {"type": "string"},
            "changes": {"type": "object", "description": "Fields to replace", "minProperties": 1}
        },
        "required": [id_field, "changes"],
        "additionalProperties": false
    })
}

pub struct UpdateLeadTool;

#[async_trait]
impl Tool for UpdateLeadTool {
    fn name(&self) -> &'static str {
        "update_lead"
    }

    fn description(&self) -> &'static str {
        "Change fields on an existing lead, such as its status or notes."
    }

    fn action_kind(&self) -> ActionKind {
        ActionKind::UpdateLead
    }

    fn parameter_schema(&self) -> Value {
        update_schema("lead_id")
    }

    fn validate(&self, arguments: &Value) -> Result<ActionPayload, ValidationError> {
        validate_update(self.name(), "lead_id", arguments)
    }

    async fn execute(
        &self,
        payload: &ActionPayload,
        _env: &ToolEnv,
    ) -> Result<ToolEffect, ToolError> {
        update_effect(Table::Leads, payload)
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct ListClientsInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    limit: Option<u32>,
}

pub struct ListClientsTool;

#[async_trait]
impl Tool for ListClientsTool {
    fn name(&self) -> &'static str {
        "list_clients"
    }

    fn description(&self) -> &'static str {
        "List the studio's clients, newest first, optionally matching an email address."
    }

    fn action_kind(&self) -> ActionKind {
        ActionKind::ReadClients
    }

    fn parameter_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "email": {"type": "string"},
                "limit": {"type": "integer", "minimum": 1, "maximum": MAX_LIST_LIMIT}
            },
            "additionalProperties": false
        })
    }

    fn validate(&self, arguments: &Value) -> Result<ActionPayload, ValidationError> {
        let input: ListClientsInput = parse_arguments(self.name(), arguments)?;
        Ok(ActionPayload::read(json!(input)))
    }

    async fn execute(
        &self,
        payload: &ActionPayload,
        env: &ToolEnv,
    ) -> Result<ToolEffect, ToolError> {
        let input: ListClientsInput = serde_json::from_value(payload.arguments.clone())
            .map_err(|e| ToolError::Invalid(e.to_string()))?;
        let filter = match input.email {
            Some(email) => RecordFilter::all().field_equals("email", email),
            None => RecordFilter::all(),
        };

        let clients = env
            .records
            .select(&env.studio_id, Table::Clients, &filter, list_limit(input.limit))
            .await?;
        Ok(ToolEffect::Read {
            output: json!({"count": clients.len(), "clients": snapshots(&clients)}),
            memory: None,
        })
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct GetClientInput {
    client_id: String,
}

pub struct GetClientTool;

#[async_trait]
impl Tool for GetClientTool {
    fn name(&self) -> &'static str {
        "get_client"
    }

    fn description(&self) -> &'static str {
        "Fetch one client by id and make it the selected client for this conversation."
    }

    fn action_kind(&self) -> ActionKind {
        ActionKind::ReadClients
    }

    fn parameter_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"client_id": {"type": "string"}},
            "required": ["client_id"],
            "additionalProperties": false
        })
    }

    fn validate(&self, arguments: &Value) -> Result<ActionPayload, ValidationError> {
        let input: GetClientInput = parse_arguments(self.name(), arguments)?;
        let client_id = required_text(self.name(), "client_id", &input.client_id)?;
        Ok(ActionPayload::read(json!({"client_id": client_id.clone()}))
            .with_target(RecordId(client_id)))
    }

    async fn execute(
        &self,
        payload: &ActionPayload,
        env: &ToolEnv,
    ) -> Result<ToolEffect, ToolError> {
        let id = payload
            .target
            .clone()
            .ok_or_else(|| ToolError::Invalid("get_client payload carries no target".to_string()))?;
        let client = env
            .records
            .find(&env.studio_id, Table::Clients, &id)
            .await?
            .ok_or_else(|| ToolError::RecordNotFound { table: "clients", id: id.0.clone() })?;

        Ok(ToolEffect::Read {
            output: json!({"client": client.snapshot()}),
            memory: Some(MemoryPatch::selected_client(id.0)),
        })
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct CreateClientInput {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lead_id: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

pub struct CreateClientTool;

#[async_trait]
impl Tool for CreateClientTool {
    fn name(&self) -> &'static str {
        "create_client"
    }

    fn description(&self) -> &'static str {
        "Create a client record, optionally converted from an existing lead."
    }

    fn action_kind(&self) -> ActionKind {
        ActionKind::CreateClient
    }

    fn parameter_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "email": {"type": "string", "format": "email"},
                "phone": {"type": "string"},
                "notes": {"type": "string"},
                "lead_id": {"type": "string", "description": "Lead this client came from"}
            },
            "required": ["name"],
            "additionalProperties": true
        })
    }

    fn validate(&self, arguments: &Value) -> Result<ActionPayload, ValidationError> {
        let mut input: CreateClientInput = parse_arguments(self.name(), arguments)?;
        input.name = required_text(self.name(), "name", &input.name)?;
        if let Some(email) = &input.email {
            check_email(self.name(), email)?;
        }
        if let Some(field) = input.extra.keys().find(|key| MANAGED_FIELDS.contains(&key.as_str()))
        {
            return Err(ValidationError::new(self.name(), format!("`{field}` is managed by the store")));
        }

        let arguments = to_object(self.name(), &input)?;
        Ok(ActionPayload::write(Value::Object(arguments.clone()), arguments))
    }

    async fn execute(
        &self,
        payload: &ActionPayload,
        _env: &ToolEnv,
    ) -> Result<ToolEffect, ToolError> {
        Ok(ToolEffect::Write {
            mutation: Mutation::Insert { table: Table::Clients, fields: payload.fields.clone() },
        })
    }
}

pub struct UpdateClientTool;

#[async_trait]
impl Tool for UpdateClientTool {
    fn name(&self) -> &'static str {
        "update_client"
    }

    fn description(&self) -> &'static str {
        "Change fields on an existing client, such as contact details."
    }

    fn action_kind(&self) -> ActionKind {
        ActionKind::UpdateClient
    }

    fn parameter_schema(&self) -> Value {
        update_schema("client_id")
    }

    fn validate(&self, arguments: &Value) -> Result<ActionPayload, ValidationError> {
        validate_update(self.name(), "client_id", arguments)
    }

    async fn execute(
        &self,
        payload: &ActionPayload,
        _env: &ToolEnv,
    ) -> Result<ToolEffect, ToolError> {
        update_effect(Table::Clients, payload)
    }
}

fn default_currency() -> String {
    "USD".to_string()
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct CreateInvoiceInput {
    client_id: String,
    amount: Decimal,
    #[serde(default = "default_currency")]
    currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    due_date: Option<NaiveDate>,
}

pub struct CreateInvoiceTool;

#[async_trait]
impl Tool for CreateInvoiceTool {
    fn name(&self) -> &'static str {
        "create_invoice"
    }

    fn description(&self) -> &'static str {
        "Draft an invoice for an existing client."
    }

    fn action_kind(&self) -> ActionKind {
        ActionKind::CreateInvoice
    }

    fn parameter_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "client_id": {"type": "string"},
                "amount": {"type": "string", "description": "Decimal amount, e.g. \"450.00\""},
                "currency": {"type": "string", "minLength": 3, "maxLength": 3},
                "description": {"type": "string"},
                "due_date": {"type": "string", "format": "date"}
            },
            "required": ["client_id", "amount"],
            "additionalProperties": false
        })
    }

    fn validate(&self, arguments: &Value) -> Result<ActionPayload, ValidationError> {
        let mut input: CreateInvoiceInput = parse_arguments(self.name(), arguments)?;
        input.client_id = required_text(self.name(), "client_id", &input.client_id)?;
        if input.amount <= Decimal::ZERO {
            return Err(ValidationError::new(self.name(), "`amount` must be positive"));
        }
        input.currency = input.currency.trim().to_ascii_uppercase();
        if input.currency.len() != 3 || !input.currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(ValidationError::new(self.name(), "`currency` must be a 3-letter code"));
        }

        let arguments = to_object(self.name(), &input)?;
        let mut fields = arguments.clone();
        fields.insert("status".to_string(), json!("draft"));
        Ok(ActionPayload::write(Value::Object(arguments), fields).with_amount(input.amount))
    }

    async fn execute(
        &self,
        payload: &ActionPayload,
        env: &ToolEnv,
    ) -> Result<ToolEffect, ToolError> {
        let client_id = payload
            .field_str("client_id")
            .map(|id| RecordId(id.to_string()))
            .ok_or_else(|| ToolError::Invalid("invoice payload carries no client".to_string()))?;
        if env.records.find(&env.studio_id, Table::Clients, &client_id).await?.is_none() {
            return Err(ToolError::RecordNotFound { table: "clients", id: client_id.0 });
        }

        Ok(ToolEffect::Write {
            mutation: Mutation::Insert { table: Table::Invoices, fields: payload.fields.clone() },
        })
    }
}

pub struct RememberTool;

#[async_trait]
impl Tool for RememberTool {
    fn name(&self) -> &'static str {
        "remember"
    }

    fn description(&self) -> &'static str {
        "Save conversation state: the selected client, the current goal, preferences or context."
    }

    fn action_kind(&self) -> ActionKind {
        ActionKind::UpdateMemory
    }

    fn parameter_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "selectedClientId": {"type": "string"},
                "currentGoal": {"type": "string"},
                "preferences": {"type": "object"},
                "context": {"type": "object"}
            },
            "additionalProperties": false
        })
    }

    fn validate(&self, arguments: &Value) -> Result<ActionPayload, ValidationError> {
        let patch: MemoryPatch = parse_arguments(self.name(), arguments)?;
        let fields: Map<String, Value> = patch
            .fields()
            .into_iter()
            .map(|(field, value)| (field.key().to_string(), value))
            .collect();
        Ok(ActionPayload::write(Value::Object(fields.clone()), fields))
    }

    async fn execute(
        &self,
        payload: &ActionPayload,
        _env: &ToolEnv,
    ) -> Result<ToolEffect, ToolError> {
        let patch: MemoryPatch = serde_json::from_value(payload.arguments.clone())
            .map_err(|e| ToolError::Invalid(e.to_string()))?;
        Ok(ToolEffect::Remember { patch })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rust_decimal::Decimal;
    use serde_json::{json, Map, Value};

    use shutterdesk_core::domain::record::{Mutation, RecordId, Table};
    use shutterdesk_core::domain::tenant::StudioId;
    use shutterdesk_db::repositories::{InMemoryAuditLogRepository, InMemoryRecordRepository};
    use shutterdesk_db::RecordRepository;

    use super::crm_registry;
    use crate::tools::{ToolEffect, ToolEnv, ToolError};

    fn env() -> (ToolEnv, Arc<InMemoryRecordRepository>) {
        let records = Arc::new(InMemoryRecordRepository::new(Arc::new(
            InMemoryAuditLogRepository::default(),
        )));
        let env = ToolEnv { studio_id: StudioId("studio-a".to_string()), records: records.clone() };
        (env, records)
    }

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("object literal")
    }

    #[test]
    fn registry_holds_every_crm_tool() {
        let registry = crm_registry().expect("registry");
        let names: Vec<String> = registry.specs().into_iter().map(|spec| spec.name).collect();
        assert_eq!(
            names,
            vec![
                "create_client",
                "create_invoice",
                "create_lead",
                "get_client",
                "list_clients",
                "list_leads",
                "remember",
                "update_client",
                "update_lead",
            ]
        );
    }

    #[test]
    fn create_lead_keeps_custom_fields_visible_to_guardrails() {
        let registry = crm_registry().expect("registry");
        let tool = registry.resolve("create_lead").expect("tool");

        let payload = tool
            .validate(&json!({"name": "  Ana Ruiz ", "studio_id": "studio-b", "budget": 3000}))
            .expect("valid lead");
        assert_eq!(payload.fields["name"], "Ana Ruiz");
        assert_eq!(payload.fields["studio_id"], "studio-b");
        assert_eq!(payload.fields["status"], "new");
        assert!(payload.arguments.get("status").is_none());
    }

    #[test]
    fn create_lead_rejects_missing_name_and_bad_email() {
        let registry = crm_registry().expect("registry");
        let tool = registry.resolve("create_lead").expect("tool");

        assert!(tool.validate(&json!({"email": "a@b.com"})).is_err());
        assert!(tool.validate(&json!({"name": " "})).is_err());
        let error = tool.validate(&json!({"name": "Ana", "email": "nope"})).expect_err("bad email");
        assert_eq!(error.tool, "create_lead");
    }

    #[test]
    fn update_requires_a_non_empty_change_set() {
        let registry = crm_registry().expect("registry");
        let tool = registry.resolve("update_lead").expect("tool");

        assert!(tool.validate(&json!({"lead_id": "lead_1", "changes": {}})).is_err());
        assert!(tool.validate(&json!({"lead_id": "lead_1", "changes": {"id": "x"}})).is_err());

        let payload = tool
            .validate(&json!({"lead_id": "lead_1", "changes": {"status": "contacted"}}))
            .expect("valid update");
        assert_eq!(payload.target, Some(RecordId("lead_1".to_string())));
        assert_eq!(payload.arguments["lead_id"], "lead_1");
    }

    #[test]
    fn invoice_amount_is_carried_for_thresholds() {
        let registry = crm_registry().expect("registry");
        let tool = registry.resolve("create_invoice").expect("tool");

        let payload = tool
            .validate(&json!({"client_id": "client_1", "amount": "49.50", "currency": "eur"}))
            .expect("valid invoice");
        assert_eq!(payload.amount, Some(Decimal::new(4950, 2)));
        assert_eq!(payload.fields["currency"], "EUR");
        assert_eq!(payload.fields["status"], "draft");

        assert!(tool.validate(&json!({"client_id": "client_1", "amount": "-5"})).is_err());
        assert!(tool
            .validate(&json!({"client_id": "client_1", "amount": 5, "discount": 2}))
            .is_err());
    }

    #[tokio::test]
    async fn create_invoice_requires_an_existing_client_in_the_studio() {
        let (env, records) = env();
        let registry = crm_registry().expect("registry");
        let tool = registry.resolve("create_invoice").expect("tool");
        let payload =
            tool.validate(&json!({"client_id": "client_x", "amount": 10})).expect("valid invoice");

        let error = tool.execute(&payload, &env).await.expect_err("unknown client");
        assert!(matches!(error, ToolError::RecordNotFound { .. }));

        let client = records
            .insert(&StudioId("studio-b".to_string()), Table::Clients, fields(json!({"name": "B"})))
            .await
            .expect("insert foreign client");
        let payload = tool
            .validate(&json!({"client_id": client.id.0, "amount": 10}))
            .expect("valid invoice");
        let error = tool.execute(&payload, &env).await.expect_err("foreign client");
        assert!(matches!(error, ToolError::RecordNotFound { .. }));
    }

    #[tokio::test]
    async fn get_client_selects_the_client_in_memory() {
        let (env, records) = env();
        let client = records
            .insert(&env.studio_id, Table::Clients, fields(json!({"name": "Ana"})))
            .await
            .expect("insert client");

        let registry = crm_registry().expect("registry");
        let tool = registry.resolve("get_client").expect("tool");
        let payload = tool.validate(&json!({"client_id": client.id.0.clone()})).expect("valid");

        match tool.execute(&payload, &env).await.expect("execute") {
            ToolEffect::Read { output, memory } => {
                assert_eq!(output["client"]["name"], "Ana");
                assert_eq!(
                    memory.and_then(|patch| patch.selected_client_id),
                    Some(client.id.0.clone())
                );
            }
            other => panic!("unexpected effect {other:?}"),
        }
    }

    #[tokio::test]
    async fn list_leads_filters_by_status() {
        let (env, records) = env();
        for status in ["new", "new", "booked"] {
            records
                .insert(&env.studio_id, Table::Leads, fields(json!({"name": "L", "status": status})))
                .await
                .expect("insert lead");
        }

        let registry = crm_registry().expect("registry");
        let tool = registry.resolve("list_leads").expect("tool");
        let payload = tool.validate(&json!({"status": "new"})).expect("valid");

        match tool.execute(&payload, &env).await.expect("execute") {
            ToolEffect::Read { output, .. } => assert_eq!(output["count"], 2),
            other => panic!("unexpected effect {other:?}"),
        }
    }

    #[tokio::test]
    async fn update_client_describes_an_update_mutation() {
        let (env, _records) = env();
        let registry = crm_registry().expect("registry");
        let tool = registry.resolve("update_client").expect("tool");
        let payload = tool
            .validate(&json!({"client_id": "client_1", "changes": {"phone": "555-0100"}}))
            .expect("valid");

        let effect = tool.execute(&payload, &env).await.expect("execute");
        assert_eq!(
            effect,
            ToolEffect::Write {
                mutation: Mutation::Update {
                    table: Table::Clients,
                    id: RecordId("client_1".to_string()),
                    patch: fields(json!({"phone": "555-0100"})),
                }
            }
        );
    }

    #[test]
    fn remember_accepts_only_memory_fields() {
        let registry = crm_registry().expect("registry");
        let tool = registry.resolve("remember").expect("tool");

        let payload = tool.validate(&json!({"goal": "book a shoot"})).expect("alias accepted");
        assert_eq!(payload.fields["currentGoal"], "book a shoot");
        assert!(tool.validate(&json!({"password": "x"})).is_err());
    }
}
