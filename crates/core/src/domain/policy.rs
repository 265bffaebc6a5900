use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Action kinds an agent may request. Authorities are granted per kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    ReadLeads,
    CreateLead,
    UpdateLead,
    ReadClients,
    CreateClient,
    UpdateClient,
    CreateInvoice,
    UpdateMemory,
}

impl ActionKind {
    pub const ALL: [ActionKind; 8] = [
        Self::ReadLeads,
        Self::CreateLead,
        Self::UpdateLead,
        Self::ReadClients,
        Self::CreateClient,
        Self::UpdateClient,
        Self::CreateInvoice,
        Self::UpdateMemory,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadLeads => "READ_LEADS",
            Self::CreateLead => "CREATE_LEAD",
            Self::UpdateLead => "UPDATE_LEAD",
            Self::ReadClients => "READ_CLIENTS",
            Self::CreateClient => "CREATE_CLIENT",
            Self::UpdateClient => "UPDATE_CLIENT",
            Self::CreateInvoice => "CREATE_INVOICE",
            Self::UpdateMemory => "UPDATE_MEMORY",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_uppercase().replace('-', "_");
        Self::ALL.into_iter().find(|kind| kind.as_str() == normalized)
    }

    /// Reads and conversation-state updates never touch tenant CRM rows.
    /// Authorized non-mutations are allowed in every mode, ahead of the
    /// threshold and mode rules.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Self::ReadLeads | Self::ReadClients | Self::UpdateMemory)
    }

    pub fn creates_contact(&self) -> bool {
        matches!(self, Self::CreateLead | Self::CreateClient)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    #[default]
    ReadOnly,
    GuardedWrite,
    FullWrite,
}

impl PolicyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadOnly => "read_only",
            Self::GuardedWrite => "guarded_write",
            Self::FullWrite => "full_write",
        }
    }
}

/// Declarative checks on payload values, evaluated ahead of thresholds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum DomainRule {
    AllowedEmailDomains {
        /// Empty means every contact-creating action.
        #[serde(default)]
        action_kinds: Vec<ActionKind>,
        #[serde(default = "default_email_field")]
        field: String,
        domains: Vec<String>,
    },
}

fn default_email_field() -> String {
    "email".to_string()
}

impl DomainRule {
    pub fn applies_to(&self, kind: ActionKind) -> bool {
        match self {
            Self::AllowedEmailDomains { action_kinds, .. } => {
                if action_kinds.is_empty() {
                    kind.creates_contact()
                } else {
                    action_kinds.contains(&kind)
                }
            }
        }
    }
}

/// Per-studio (optionally per-user) guardrail configuration.
///
/// The default is deny-by-default: read-only with no authorities.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub mode: PolicyMode,
    #[serde(default)]
    pub authorities: Vec<ActionKind>,
    #[serde(default)]
    pub restricted_fields: BTreeSet<String>,
    #[serde(default)]
    pub auto_approve_thresholds: BTreeMap<ActionKind, Decimal>,
    #[serde(default)]
    pub domain_rules: Vec<DomainRule>,
}

impl Policy {
    pub fn grants(&self, kind: ActionKind) -> bool {
        self.authorities.contains(&kind)
    }

    pub fn threshold_for(&self, kind: ActionKind) -> Option<Decimal> {
        self.auto_approve_thresholds.get(&kind).copied()
    }

    /// First touched field that the policy restricts, compared case-insensitively.
    pub fn restricted_field_in<'a, I>(&self, fields: I) -> Option<&'a str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        fields.into_iter().find(|field| {
            let key = normalize_field(field);
            self.restricted_fields.iter().any(|restricted| normalize_field(restricted) == key)
        })
    }
}

pub fn normalize_field(field: &str) -> String {
    field.trim().to_ascii_lowercase().replace('-', "_")
}
