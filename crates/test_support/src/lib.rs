//! Disposable Postgres for integration tests.
//!
//! Tests call [`postgres::TestDatabase::start`] and skip themselves when no
//! container runtime is reachable.

pub mod postgres;
pub mod runtime;

use uuid::Uuid;

pub(crate) fn unique_name(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}
