use std::sync::Arc;

use shutterdesk_core::audit::AuditContext;
use shutterdesk_core::domain::decision::Decision;
use shutterdesk_core::domain::policy::{ActionKind, Policy};
use shutterdesk_core::domain::tenant::{SessionId, StudioId, UserId};
use shutterdesk_core::policy::PolicyCatalog;

use crate::guardrails;
use crate::tools::ActionPayload;

/// Resolves the policy that governs one user acting inside one studio.
pub trait PolicyProvider: Send + Sync {
    fn policy_for(&self, studio_id: &StudioId, user_id: &UserId) -> Policy;
}

pub struct CatalogPolicyProvider {
    catalog: PolicyCatalog,
}

impl CatalogPolicyProvider {
    pub fn new(catalog: PolicyCatalog) -> Self {
        Self { catalog }
    }
}

impl PolicyProvider for CatalogPolicyProvider {
    fn policy_for(&self, studio_id: &StudioId, user_id: &UserId) -> Policy {
        self.catalog.policy_for(studio_id, user_id)
    }
}

/// Identity and policy for a single turn. Built per request and never shared
/// between studios.
#[derive(Clone, Debug)]
pub struct AgentContext {
    pub studio_id: StudioId,
    pub user_id: UserId,
    pub session_id: SessionId,
    pub policy: Arc<Policy>,
}

impl AgentContext {
    pub fn new(studio_id: StudioId, user_id: UserId, session_id: SessionId, policy: Policy) -> Self {
        Self { studio_id, user_id, session_id, policy: Arc::new(policy) }
    }

    pub fn resolve(
        provider: &dyn PolicyProvider,
        studio_id: StudioId,
        user_id: UserId,
        session_id: SessionId,
    ) -> Self {
        let policy = provider.policy_for(&studio_id, &user_id);
        Self::new(studio_id, user_id, session_id, policy)
    }

    pub fn decide(&self, kind: ActionKind, payload: &ActionPayload) -> Decision {
        guardrails::decide(&self.policy, kind, payload)
    }

    pub fn audit_context(&self) -> AuditContext {
        AuditContext::new(
            self.studio_id.clone(),
            self.user_id.clone(),
            Some(self.session_id.clone()),
        )
    }
}

#[cfg(test)]
mod tests {
    use shutterdesk_core::domain::policy::PolicyMode;
    use shutterdesk_core::domain::tenant::{SessionId, StudioId, UserId};
    use shutterdesk_core::policy::PolicyCatalog;

    use super::{AgentContext, CatalogPolicyProvider};

    #[test]
    fn resolve_pulls_the_studio_policy_from_the_catalog() {
        let catalog = PolicyCatalog::parse(
            r#"
[studios.studio-a]
mode = "full_write"
authorities = ["CREATE_LEAD"]
"#,
        )
        .expect("catalog");
        let provider = CatalogPolicyProvider::new(catalog);

        let context = AgentContext::resolve(
            &provider,
            StudioId("studio-a".to_string()),
            UserId("user-1".to_string()),
            SessionId("s-1".to_string()),
        );
        assert_eq!(context.policy.mode, PolicyMode::FullWrite);

        let other = AgentContext::resolve(
            &provider,
            StudioId("studio-b".to_string()),
            UserId("user-1".to_string()),
            SessionId("s-1".to_string()),
        );
        assert!(other.policy.authorities.is_empty());
        assert_eq!(other.audit_context().studio_id, StudioId("studio-b".to_string()));
    }
}
