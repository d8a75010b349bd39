pub mod connection;
pub mod engine;
pub mod fixtures;
pub mod migrations;
pub mod repositories;
pub mod store;

pub use connection::{connect, connect_with_config, connect_with_settings, DbPool};
pub use engine::{ApprovalEngine, ReconcileReport};
pub use fixtures::{DemoSeedDataset, SeedResult, VerificationResult};
pub use repositories::target::register_draft;
pub use repositories::RepositoryError;
pub use store::FlowStore;
