//! Agent mediation layer for the studio CRM.
//!
//! The model never touches the database directly. Every tool call it requests
//! goes through one path:
//!
//! 1. **Resolve** the tool by name (`tools`)
//! 2. **Validate** the arguments into an `ActionPayload`
//! 3. **Decide** allow / deny / propose against the studio policy (`guardrails`)
//! 4. **Commit** the effect and its audit entry together (`runtime`)
//!
//! Proposed writes wait in the proposal queue until a human approves or
//! rejects them (`proposals`). Per-conversation state lives in working memory
//! (`memory`).
//!
//! # Key Types
//!
//! - `AgentRuntime` - runs turns and drives the model loop
//! - `ToolRegistry` - immutable name to tool lookup
//! - `ProposalWorkflow` - human review of deferred writes
//! - `LlmClient` - pluggable model boundary

pub mod catalog;
pub mod context;
mod executor;
pub mod guardrails;
pub mod llm;
pub mod memory;
pub mod proposals;
pub mod runtime;
pub mod tools;

pub use catalog::crm_registry;
pub use context::{AgentContext, CatalogPolicyProvider, PolicyProvider};
pub use executor::{ToolCallError, ToolCallOutcome, ToolCallRequest, ToolCallResult};
pub use llm::{LlmClient, LlmTurn, ScriptedLlmClient, TurnMessage};
pub use memory::{MemoryError, WorkingMemoryStore};
pub use proposals::{Approval, ProposalError, ProposalWorkflow};
pub use runtime::{AgentRuntime, Conversation, RuntimeLimits};
pub use tools::{
    ActionPayload, RegistryError, Tool, ToolEffect, ToolEnv, ToolError, ToolRegistry, ToolSpec,
    ValidationError,
};
