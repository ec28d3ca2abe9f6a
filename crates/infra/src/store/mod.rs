//! Job store boundary.
//!
//! The dispatcher and service only depend on the [`JobStore`] trait; the
//! in-memory backend serves tests and development, the Postgres backend
//! production.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;
pub use r#trait::{JobStats, JobStore, JobStoreError};
