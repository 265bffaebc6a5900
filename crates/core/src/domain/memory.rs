use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::tenant::{SessionId, StudioId};

/// Named working-memory fields. Each is merged and stored independently.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MemoryField {
    SelectedClientId,
    CurrentGoal,
    Preferences,
    Context,
}

impl MemoryField {
    pub const ALL: [MemoryField; 4] =
        [Self::SelectedClientId, Self::CurrentGoal, Self::Preferences, Self::Context];

    pub fn key(&self) -> &'static str {
        match self {
            Self::SelectedClientId => "selectedClientId",
            Self::CurrentGoal => "currentGoal",
            Self::Preferences => "preferences",
            Self::Context => "context",
        }
    }

    pub fn parse(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|field| field.key() == key)
    }
}

/// Sparse per-conversation state carried across agent turns.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkingMemory {
    pub studio_id: StudioId,
    pub session_id: SessionId,
    pub selected_client_id: Option<String>,
    pub current_goal: Option<String>,
    pub preferences: Option<Map<String, Value>>,
    pub context: Option<Map<String, Value>>,
    pub updated_at: DateTime<Utc>,
}

impl WorkingMemory {
    pub fn empty(studio_id: StudioId, session_id: SessionId, now: DateTime<Utc>) -> Self {
        Self {
            studio_id,
            session_id,
            selected_client_id: None,
            current_goal: None,
            preferences: None,
            context: None,
            updated_at: now,
        }
    }

    /// Replaces only the fields present in `patch`.
    pub fn merge(&mut self, patch: &MemoryPatch, now: DateTime<Utc>) {
        if let Some(selected_client_id) = &patch.selected_client_id {
            self.selected_client_id = Some(selected_client_id.clone());
        }
        if let Some(current_goal) = &patch.current_goal {
            self.current_goal = Some(current_goal.clone());
        }
        if let Some(preferences) = &patch.preferences {
            self.preferences = Some(preferences.clone());
        }
        if let Some(context) = &patch.context {
            self.context = Some(context.clone());
        }
        self.updated_at = now;
    }

    /// Applies one stored field value. Values of the wrong shape are ignored.
    pub fn apply_field(&mut self, field: MemoryField, value: Value) {
        match (field, value) {
            (MemoryField::SelectedClientId, Value::String(value)) => {
                self.selected_client_id = Some(value);
            }
            (MemoryField::CurrentGoal, Value::String(value)) => self.current_goal = Some(value),
            (MemoryField::Preferences, Value::Object(value)) => self.preferences = Some(value),
            (MemoryField::Context, Value::Object(value)) => self.context = Some(value),
            _ => {}
        }
    }

    pub fn is_empty(&self) -> bool {
        self.selected_client_id.is_none()
            && self.current_goal.is_none()
            && self.preferences.is_none()
            && self.context.is_none()
    }
}

/// Partial update; absent fields are left untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MemoryPatch {
    #[serde(default, alias = "selected_client_id")]
    pub selected_client_id: Option<String>,
    #[serde(default, alias = "goal", alias = "current_goal")]
    pub current_goal: Option<String>,
    #[serde(default)]
    pub preferences: Option<Map<String, Value>>,
    #[serde(default)]
    pub context: Option<Map<String, Value>>,
}

impl MemoryPatch {
    pub fn selected_client(client_id: impl Into<String>) -> Self {
        Self { selected_client_id: Some(client_id.into()), ..Self::default() }
    }

    pub fn goal(goal: impl Into<String>) -> Self {
        Self { current_goal: Some(goal.into()), ..Self::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.fields().is_empty()
    }

    /// Present fields as storable values, in a stable order.
    pub fn fields(&self) -> Vec<(MemoryField, Value)> {
        let mut fields = Vec::new();
        if let Some(value) = &self.selected_client_id {
            fields.push((MemoryField::SelectedClientId, Value::String(value.clone())));
        }
        if let Some(value) = &self.current_goal {
            fields.push((MemoryField::CurrentGoal, Value::String(value.clone())));
        }
        if let Some(value) = &self.preferences {
            fields.push((MemoryField::Preferences, Value::Object(value.clone())));
        }
        if let Some(value) = &self.context {
            fields.push((MemoryField::Context, Value::Object(value.clone())));
        }
        fields
    }

    /// Later patch wins per field.
    pub fn combine(mut self, later: MemoryPatch) -> Self {
        if later.selected_client_id.is_some() {
            self.selected_client_id = later.selected_client_id;
        }
        if later.current_goal.is_some() {
            self.current_goal = later.current_goal;
        }
        if later.preferences.is_some() {
            self.preferences = later.preferences;
        }
        if later.context.is_some() {
            self.context = later.context;
        }
        self
    }
}
