pub mod orders_repo;
pub mod tenants_repo;

pub use orders_repo::{OrdersRepository, RecordOutcome};
pub use tenants_repo::TenantsRepository;
