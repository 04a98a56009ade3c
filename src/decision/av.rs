//! Coarse access vector decisions.

use serde::{Deserialize, Serialize};

use crate::types::{AccessVector, PolicySeqno};

/// Decision flag: the source domain is permissive. Denials are logged
/// but not enforced, and the cached entry is patched to grant the
/// denied permissions.
pub const AVD_FLAGS_PERMISSIVE: u32 = 0x0001;

/// Coarse decision for one (subject, object, class) triple.
///
/// Produced by the security server and cached verbatim. The `seqno`
/// tags the policy version the decision was computed against; entries
/// carrying an older seqno than the latest observed policy version are
/// stale-but-usable until overwritten or flushed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvDecision {
    /// Permissions granted by policy.
    pub allowed: AccessVector,

    /// Permissions audited when granted.
    pub auditallow: AccessVector,

    /// Permissions audited when denied.
    pub auditdeny: AccessVector,

    /// Decision flags (`AVD_FLAGS_*`).
    pub flags: u32,

    /// Policy version this decision was computed against.
    pub seqno: PolicySeqno,
}

impl AvDecision {
    /// Creates a decision granting `allowed` at policy version `seqno`,
    /// with all denials audited.
    pub fn new(allowed: AccessVector, seqno: PolicySeqno) -> Self {
        Self {
            allowed,
            auditallow: 0,
            auditdeny: !0,
            flags: 0,
            seqno,
        }
    }

    /// Returns true if the permissive flag is set.
    pub fn is_permissive(&self) -> bool {
        self.flags & AVD_FLAGS_PERMISSIVE != 0
    }

    /// Marks the decision permissive.
    pub fn with_permissive(mut self) -> Self {
        self.flags |= AVD_FLAGS_PERMISSIVE;
        self
    }

    /// Returns the requested permissions not granted by this decision.
    pub fn denied(&self, requested: AccessVector) -> AccessVector {
        requested & !self.allowed
    }
}
