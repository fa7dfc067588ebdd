//! Repository layer
//!
//! Store traits for everything the coordinator reads or writes, each with a
//! Postgres implementation over `sqlx` and a shared in-memory implementation.
//! Repositories contain no business logic.

mod approval;
mod artifact;
mod memory;
mod policy;
mod request;
mod workflow;

use std::sync::Arc;

use sqlx::PgPool;

// Re-export traits
pub use approval::ApprovalLedger;
pub use artifact::ArtifactRepository;
pub use policy::PolicyOracle;
pub use request::RequestRepository;
pub use workflow::WorkflowRepository;

// Re-export implementations
pub use approval::PgApprovalLedger;
pub use artifact::PgArtifactRepository;
pub use memory::InMemoryStore;
pub use policy::PgPolicyOracle;
pub use request::PgRequestRepository;
pub use workflow::PgWorkflowRepository;

/// Bundle of store handles the services depend on
#[derive(Clone)]
pub struct Repositories {
    pub workflows: Arc<dyn WorkflowRepository>,
    pub artifacts: Arc<dyn ArtifactRepository>,
    pub requests: Arc<dyn RequestRepository>,
    pub policies: Arc<dyn PolicyOracle>,
    pub approvals: Arc<dyn ApprovalLedger>,
}

impl Repositories {
    /// Postgres-backed repositories sharing one pool
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            workflows: Arc::new(PgWorkflowRepository::new(pool.clone())),
            artifacts: Arc::new(PgArtifactRepository::new(pool.clone())),
            requests: Arc::new(PgRequestRepository::new(pool.clone())),
            policies: Arc::new(PgPolicyOracle::new(pool.clone())),
            approvals: Arc::new(PgApprovalLedger::new(pool)),
        }
    }

    /// Repositories backed by one in-memory store
    pub fn in_memory(store: InMemoryStore) -> Self {
        Self {
            workflows: Arc::new(store.clone()),
            artifacts: Arc::new(store.clone()),
            requests: Arc::new(store.clone()),
            policies: Arc::new(store.clone()),
            approvals: Arc::new(store),
        }
    }
}
