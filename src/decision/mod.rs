//! # Decision Value Types
//!
//! Plain-data results produced by the security server and memoised by the
//! cache:
//! - `av`: the coarse per-(subject, object, class) decision with its four
//!   permission bitmaps and policy sequence number
//! - `operation`: fine-grained per-command decisions (256 operation types,
//!   256 operation numbers each) and the per-entry aggregate that owns them
//!
//! All types here are owned values with no shared heap: cloning an
//! [`OperationNode`] yields a fully independent copy, which is what the
//! cache's copy-on-write update discipline relies on.

pub mod av;
pub mod operation;

pub use av::{AvDecision, AVD_FLAGS_PERMISSIVE};
pub use operation::{
    OperationBitmap, OperationCommand, OperationDecision, OperationLookup, OperationNode,
    OperationSlice, OP_SPECIFIED_ALLOWED, OP_SPECIFIED_AUDITALLOW, OP_SPECIFIED_DONTAUDIT,
};
