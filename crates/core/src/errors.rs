use thiserror::Error;

use crate::domain::proposal::ProposalStatus;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid proposal transition from {from:?} to {to:?}")]
    InvalidProposalTransition { from: ProposalStatus, to: ProposalStatus },
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

impl DomainError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::InvalidProposalTransition { .. } => "invalid_transition",
            Self::InvariantViolation(_) => "invariant_violation",
        }
    }
}
