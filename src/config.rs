//! Compile-time table capacities.
//!
//! Runtime tunables live in [`crate::tcp::TcpConfig`]; the constants here
//! size the fixed-capacity tables that back them.

/// Number of slots in the path-MTU cache.
pub const PMTU_CACHE_COUNT: usize = 16;

/// Readiness events fetched from the platform per wait.
pub const EVENT_BATCH_COUNT: usize = 64;
