//! # WARDEN - High-Performance Access Vector Cache
//!
//! An in-process, read-mostly cache of authorisation decisions computed
//! by an external security server. Each cached decision answers which
//! permissions a subject holds on an object of a given class, which of
//! them are audited, and which fine-grained per-operation constraints
//! apply.
//!
//! ## Architecture
//!
//! - `types`: security identifiers, object classes, access vectors
//! - `error`: crate-wide error type and result alias
//! - `decision`: coarse and fine-grained decision value types
//! - `cache`: the concurrent bucket table with lock-free lookup,
//!   per-bucket writer locks, epoch-based deferred reclamation, and
//!   approximate-LRU eviction
//! - `server`: the security server interface and class map
//! - `audit`: structured audit records and sinks
//! - `policy`: policy-change callbacks and sequence numbers
//! - `avc`: the decision protocol engine tying it all together

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core identifier types
pub mod types;

// Error handling
pub mod error;

// Decision value types
pub mod decision;

// The concurrent cache
pub mod cache;

// Security server interface
pub mod server;

// Audit records and sinks
pub mod audit;

// Policy change callbacks
pub mod policy;

// Decision protocol engine
pub mod avc;

// Re-export commonly used types
pub use avc::{
    global, install_global, AccessVectorCache, AVC_NONBLOCKING, AVC_OPERATION_CMD, AVC_STRICT,
};
pub use cache::{CacheConfig, CacheStatsSnapshot};
pub use decision::{AvDecision, OperationCommand, OperationDecision, OperationNode};
pub use error::{AvcError, AvcResult};
pub use types::{AccessVector, ObjectClass, PolicySeqno, SecurityId, SID_WILDCARD};

/// Re-export version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
