//! Opaque string identifiers with a short type prefix, e.g.
//! `worldline_9f2c…`, `event_04ab…`.

use uuid::Uuid;

/// Generate a new id for the given prefix.
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}
