pub mod connection;
pub mod migrations;
pub mod repositories;

pub use connection::{connect, connect_and_migrate, connect_with_settings, DbPool};
pub use repositories::{
    AgentStores, AuditLogRepository, ProposalRepository, RecordRepository, RepositoryError,
    WorkingMemoryRepository,
};
