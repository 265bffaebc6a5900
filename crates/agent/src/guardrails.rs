//! Write-authorization rules for agent actions.
//!
//! [`decide`] is a pure function of the policy, the action kind and the
//! validated payload. The first matching rule wins:
//!
//! 1. kind not granted: deny `not_authorized`
//! 2. payload touches a restricted field: deny `restricted_field`
//! 3. a domain rule rejects a payload value: deny `domain_not_allowed`
//! 4. kind does not modify records: allow `non_mutating`
//! 5. amount strictly under the kind's threshold outside read-only: allow
//!    `under_auto_approve_threshold`
//! 6. `full_write`: allow; `guarded_write`: propose; otherwise deny
//!    `policy_default_deny`

use shutterdesk_core::domain::decision::{Decision, ReasonCode};
use shutterdesk_core::domain::policy::{ActionKind, DomainRule, Policy, PolicyMode};

use crate::tools::ActionPayload;

pub fn decide(policy: &Policy, kind: ActionKind, payload: &ActionPayload) -> Decision {
    if !policy.grants(kind) {
        return Decision::deny(ReasonCode::NotAuthorized).with_detail(kind.as_str());
    }

    if let Some(field) = policy.restricted_field_in(payload.field_names()) {
        return Decision::deny(ReasonCode::RestrictedField).with_detail(field);
    }

    if let Some(denial) = domain_rule_denial(policy, kind, payload) {
        return denial;
    }

    if !kind.is_mutation() {
        return Decision::allow(ReasonCode::NonMutating);
    }

    if policy.mode != PolicyMode::ReadOnly {
        if let (Some(amount), Some(threshold)) = (payload.amount, policy.threshold_for(kind)) {
            if amount < threshold {
                return Decision::allow(ReasonCode::UnderAutoApproveThreshold)
                    .with_detail(format!("{amount} < {threshold}"));
            }
        }
    }

    match policy.mode {
        PolicyMode::FullWrite => Decision::allow(ReasonCode::FullWrite),
        PolicyMode::GuardedWrite => Decision::propose(ReasonCode::RequiresApproval),
        PolicyMode::ReadOnly => Decision::deny(ReasonCode::PolicyDefaultDeny),
    }
}

fn domain_rule_denial(policy: &Policy, kind: ActionKind, payload: &ActionPayload) -> Option<Decision> {
    policy.domain_rules.iter().filter(|rule| rule.applies_to(kind)).find_map(|rule| match rule {
        DomainRule::AllowedEmailDomains { field, domains, .. } => {
            let email = payload.field_str(field)?;
            match email_domain(email) {
                Some(domain)
                    if domains.iter().any(|allowed| allowed.trim().eq_ignore_ascii_case(domain)) =>
                {
                    None
                }
                Some(domain) => {
                    Some(Decision::deny(ReasonCode::DomainNotAllowed).with_detail(domain))
                }
                None => Some(
                    Decision::deny(ReasonCode::DomainNotAllowed)
                        .with_detail(format!("`{field}` is not an email address")),
                ),
            }
        }
    })
}

fn email_domain(email: &str) -> Option<&str> {
    let (local, domain) = email.trim().rsplit_once('@')?;
    if local.is_empty() || domain.is_empty() {
        return None;
    }
    Some(domain)
}
