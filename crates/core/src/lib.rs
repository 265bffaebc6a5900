pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod policy;

pub use audit::{AuditContext, AuditEntry, AuditEntryId, AuditOutcome, AuditQuery};
pub use domain::decision::{Decision, ReasonCode, Verdict};
pub use domain::memory::{MemoryField, MemoryPatch, WorkingMemory};
pub use domain::policy::{ActionKind, DomainRule, Policy, PolicyMode};
pub use domain::proposal::{Proposal, ProposalId, ProposalStatus, RiskLevel};
pub use domain::record::{AppliedMutation, Mutation, Record, RecordFilter, RecordId, Table};
pub use domain::tenant::{SessionId, StudioId, UserId};
pub use errors::DomainError;
pub use policy::{PolicyCatalog, PolicyCatalogError};
