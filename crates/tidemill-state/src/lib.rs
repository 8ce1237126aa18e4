//! Versioned key/value state for stateful streaming operators
//!
//! Two layers serve two access patterns:
//! - [`SessionMap`] / [`DeltaMap`]: an in-memory persistent-copy map for
//!   driver-side keyed aggregation, where `do_copy` hands out cheap logical
//!   children sharing structure by reference.
//! - [`StateStore`] / [`StateStoreManager`]: the long-lived per-operator,
//!   per-partition store, persisted as `<version>.snapshot` and
//!   `<version>.delta` files and recovered by snapshot-plus-replay.

pub mod error;
pub mod session;
pub mod store;

pub use error::{Error, Result};
pub use session::{DeltaMap, SessionMap, SyncSessionMap};
pub use store::{StateStore, StateStoreManager};
