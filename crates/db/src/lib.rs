pub mod connection;
pub mod migrations;
pub mod repositories;
pub mod workflow;

pub use connection::{connect, connect_with_config, connect_with_settings, DbPool};
pub use repositories::{
    ApprovalRepository, InMemoryApprovalRepository, RepositoryError, SqlApprovalRepository,
};
pub use workflow::{ApprovalWorkflowService, WorkflowServiceError};
