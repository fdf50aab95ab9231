//! Postgres persistence for the scout core.

mod requests;
mod scout;
mod tasks;

pub use requests::{NoopRequestsLog, PgRequestsStorage, RequestsLog, ServiceRequestsLog};
pub use scout::PgScoutStorage;
pub use tasks::PgTaskStorage;
