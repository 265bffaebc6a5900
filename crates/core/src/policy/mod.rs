//! Tenant policy catalog.
//!
//! Policies are data: a TOML document with an optional `[default]` policy and
//! one table per studio, each of which may carry per-user overrides:
//!
//! ```toml
//! [default]
//! mode = "read_only"
//! authorities = ["READ_LEADS", "READ_CLIENTS"]
//!
//! [studios.studio-a]
//! mode = "guarded_write"
//! authorities = ["READ_LEADS", "CREATE_LEAD", "CREATE_INVOICE"]
//! restricted_fields = ["studio_id"]
//!
//! [studios.studio-a.auto_approve_thresholds]
//! CREATE_INVOICE = "100"
//!
//! [studios.studio-a.users.owner]
//! mode = "full_write"
//! authorities = ["CREATE_LEAD", "UPDATE_CLIENT"]
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::policy::{DomainRule, Policy};
use crate::domain::tenant::{StudioId, UserId};

#[derive(Debug, Error)]
pub enum PolicyCatalogError {
    #[error("could not read policy file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse policy file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("policy validation failed for `{scope}`: {message}")]
    Validation { scope: String, message: String },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudioPolicies {
    #[serde(flatten)]
    pub studio: Policy,
    #[serde(default)]
    pub users: BTreeMap<String, Policy>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyCatalog {
    #[serde(default)]
    pub default: Option<Policy>,
    #[serde(default)]
    pub studios: BTreeMap<String, StudioPolicies>,
}

impl PolicyCatalog {
    pub fn load(path: &Path) -> Result<Self, PolicyCatalogError> {
        let raw = fs::read_to_string(path)
            .map_err(|source| PolicyCatalogError::ReadFile { path: path.to_path_buf(), source })?;
        let catalog = toml::from_str::<Self>(&raw)
            .map_err(|source| PolicyCatalogError::ParseFile { path: path.to_path_buf(), source })?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn parse(raw: &str) -> Result<Self, PolicyCatalogError> {
        let catalog = toml::from_str::<Self>(raw).map_err(|source| {
            PolicyCatalogError::ParseFile { path: PathBuf::from("<inline>"), source }
        })?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// User override, then the studio policy, then the catalog default, then
    /// the deny-by-default policy. A studio never inherits another studio's rules.
    pub fn policy_for(&self, studio_id: &StudioId, user_id: &UserId) -> Policy {
        if let Some(studio) = self.studios.get(studio_id.as_str()) {
            if let Some(user_policy) = studio.users.get(user_id.as_str()) {
                return user_policy.clone();
            }
            return studio.studio.clone();
        }
        self.default.clone().unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), PolicyCatalogError> {
        if let Some(default) = &self.default {
            validate_policy("default", default)?;
        }
        for (studio_id, studio) in &self.studios {
            if studio_id.trim().is_empty() {
                return Err(PolicyCatalogError::Validation {
                    scope: "studios".to_string(),
                    message: "studio ids must not be empty".to_string(),
                });
            }
            validate_policy(&format!("studios.{studio_id}"), &studio.studio)?;
            for (user_id, policy) in &studio.users {
                validate_policy(&format!("studios.{studio_id}.users.{user_id}"), policy)?;
            }
        }
        Ok(())
    }
}

fn validate_policy(scope: &str, policy: &Policy) -> Result<(), PolicyCatalogError> {
    let invalid = |message: String| PolicyCatalogError::Validation {
        scope: scope.to_string(),
        message,
    };

    for (kind, threshold) in &policy.auto_approve_thresholds {
        if *threshold <= Decimal::ZERO {
            return Err(invalid(format!("auto_approve_thresholds.{kind} must be positive")));
        }
    }

    for rule in &policy.domain_rules {
        match rule {
            DomainRule::AllowedEmailDomains { field, domains, .. } => {
                if field.trim().is_empty() {
                    return Err(invalid("allowed_email_domains.field must be set".to_string()));
                }
                if domains.iter().all(|domain| domain.trim().is_empty()) {
                    return Err(invalid(
                        "allowed_email_domains.domains must list at least one domain".to_string(),
                    ));
                }
            }
        }
    }

    if policy.restricted_fields.iter().any(|field| field.trim().is_empty()) {
        return Err(invalid("restricted_fields must not contain empty names".to_string()));
    }

    Ok(())
}
