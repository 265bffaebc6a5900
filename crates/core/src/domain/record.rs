use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::domain::tenant::StudioId;

/// CRM tables reachable through agent tools.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Leads,
    Clients,
    Invoices,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Leads => "leads",
            Self::Clients => "clients",
            Self::Invoices => "invoices",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "leads" => Some(Self::Leads),
            "clients" => Some(Self::Clients),
            "invoices" => Some(Self::Invoices),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub String);

impl RecordId {
    pub fn generate(table: Table) -> Self {
        let prefix = match table {
            Table::Leads => "lead",
            Table::Clients => "client",
            Table::Invoices => "inv",
        };
        Self(format!("{prefix}_{}", Uuid::new_v4().simple()))
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A tenant-scoped CRM row. `fields` holds the column values; identity and
/// tenancy live outside it so a payload can never rewrite them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub studio_id: StudioId,
    pub table: Table,
    pub fields: Map<String, Value>,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record {
    pub fn snapshot(&self) -> Value {
        let mut snapshot = self.fields.clone();
        snapshot.insert("id".to_string(), Value::String(self.id.0.clone()));
        snapshot.insert("version".to_string(), Value::from(self.version));
        Value::Object(snapshot)
    }

    pub fn field_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }
}

/// Equality filter applied to record fields.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordFilter {
    pub equals: BTreeMap<String, Value>,
}

impl RecordFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn field_equals(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.equals.insert(field.into(), value.into());
        self
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.equals.iter().all(|(field, expected)| record.fields.get(field) == Some(expected))
    }
}

/// A write a tool wants committed. The runtime applies it together with its
/// audit entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    Insert { table: Table, fields: Map<String, Value> },
    Update { table: Table, id: RecordId, patch: Map<String, Value> },
}

impl Mutation {
    pub fn table(&self) -> Table {
        match self {
            Self::Insert { table, .. } | Self::Update { table, .. } => *table,
        }
    }

    pub fn target_id(&self) -> Option<&RecordId> {
        match self {
            Self::Insert { .. } => None,
            Self::Update { id, .. } => Some(id),
        }
    }
}

/// Result of a committed mutation with both snapshots.
#[derive(Clone, Debug, PartialEq)]
pub struct AppliedMutation {
    pub before: Option<Record>,
    pub after: Record,
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::{json, Map};

    use super::{Record, RecordFilter, RecordId, Table};
    use crate::domain::tenant::StudioId;

    fn record(fields: serde_json::Value) -> Record {
        let fields: Map<String, serde_json::Value> =
            fields.as_object().cloned().unwrap_or_default();
        Record {
            id: RecordId("lead_1".to_string()),
            studio_id: StudioId("studio-a".to_string()),
            table: Table::Leads,
            fields,
            version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn filter_requires_every_field_to_match() {
        let lead = record(json!({"status": "new", "source": "instagram"}));
        assert!(RecordFilter::all().matches(&lead));
        assert!(RecordFilter::all().field_equals("status", "new").matches(&lead));
        assert!(!RecordFilter::all()
            .field_equals("status", "new")
            .field_equals("source", "referral")
            .matches(&lead));
    }

    #[test]
    fn snapshot_includes_identity() {
        let lead = record(json!({"name": "Ana"}));
        let snapshot = lead.snapshot();
        assert_eq!(snapshot["id"], "lead_1");
        assert_eq!(snapshot["name"], "Ana");
        assert_eq!(snapshot["version"], 1);
    }

    #[test]
    fn generated_ids_carry_table_prefix() {
        assert!(RecordId::generate(Table::Invoices).0.starts_with("inv_"));
    }
}
