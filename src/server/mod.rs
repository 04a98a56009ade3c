//! # Security Server Interface
//!
//! The cache memoises decisions computed by an external security server.
//! This module defines that boundary:
//! - [`SecurityServer`]: the compute interface consumed by the decision
//!   protocol
//! - [`ClassMap`]: object class and permission names used by audit
//!   rendering
//! - [`FixedSecurityServer`]: a table-backed in-memory implementation for
//!   tests and benchmarks

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::decision::{AvDecision, OperationDecision, OperationNode};
use crate::error::AvcResult;
use crate::types::{AccessVector, ObjectClass, PolicySeqno, SecurityId};

/// Names for one object class and its permission bits.
#[derive(Debug, Clone)]
pub struct ObjectClassInfo {
    /// Class name (file, dir, ...).
    pub name: String,

    /// Permission names, one per bit, lowest bit first. At most 32.
    pub permissions: Vec<String>,
}

impl ObjectClassInfo {
    /// Creates class info from static name tables.
    pub fn new(name: &str, permissions: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            permissions: permissions.iter().map(|p| (*p).to_string()).collect(),
        }
    }
}

/// Mapping from object class tags to class and permission names.
///
/// Used only for audit rendering; unknown classes and permission bits
/// render numerically.
#[derive(Debug, Clone, Default)]
pub struct ClassMap {
    classes: HashMap<ObjectClass, ObjectClassInfo>,
}

static BUILTIN_CLASS_MAP: Lazy<ClassMap> = Lazy::new(|| {
    let mut map = ClassMap::new();
    map.insert(
        1,
        ObjectClassInfo::new(
            "file",
            &[
                "read", "write", "create", "getattr", "setattr", "lock", "unlink", "rename",
                "append", "execute", "open", "ioctl", "map",
            ],
        ),
    );
    map.insert(
        2,
        ObjectClassInfo::new(
            "dir",
            &[
                "read", "write", "create", "getattr", "setattr", "search", "add_name",
                "remove_name", "rmdir", "open",
            ],
        ),
    );
    map.insert(
        3,
        ObjectClassInfo::new(
            "socket",
            &[
                "read", "write", "create", "bind", "connect", "listen", "accept", "sendto",
                "recvfrom", "shutdown", "ioctl",
            ],
        ),
    );
    map.insert(
        4,
        ObjectClassInfo::new(
            "process",
            &[
                "fork", "transition", "signal", "ptrace", "getsched", "setsched", "getpgid",
                "setpgid", "getcap", "setcap",
            ],
        ),
    );
    map
});

impl ClassMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in default map covering the common classes.
    pub fn builtin() -> &'static ClassMap {
        &BUILTIN_CLASS_MAP
    }

    /// Registers class info under `tclass`.
    pub fn insert(&mut self, tclass: ObjectClass, info: ObjectClassInfo) {
        self.classes.insert(tclass, info);
    }

    /// Returns the info registered for `tclass`.
    pub fn get(&self, tclass: ObjectClass) -> Option<&ObjectClassInfo> {
        self.classes.get(&tclass)
    }

    /// Renders a class name, falling back to the numeric tag.
    pub fn class_name(&self, tclass: ObjectClass) -> String {
        match self.classes.get(&tclass) {
            Some(info) => info.name.clone(),
            None => format!("class{tclass}"),
        }
    }

    /// Renders the permission names for the set bits of `av`, in bit
    /// order, space separated. Unknown bits render as hex.
    pub fn permission_names(&self, tclass: ObjectClass, av: AccessVector) -> String {
        let info = self.classes.get(&tclass);
        let mut names = Vec::new();
        for bit in 0..32 {
            if av & (1 << bit) == 0 {
                continue;
            }
            let name = info
                .and_then(|i| i.permissions.get(bit as usize))
                .cloned()
                .unwrap_or_else(|| format!("{:#x}", 1u32 << bit));
            names.push(name);
        }
        names.join(" ")
    }
}

/// External security server consumed by the decision protocol.
///
/// Compute calls are the only potentially blocking steps of a permission
/// check and are always made outside the cache's reader critical
/// sections.
pub trait SecurityServer: Send + Sync {
    /// Computes a fresh coarse decision for the triple, together with
    /// the fine-grained decisions the policy defines for it (the
    /// returned node's type mask flags the computable types).
    fn compute_av(
        &self,
        ssid: SecurityId,
        tsid: SecurityId,
        tclass: ObjectClass,
    ) -> AvcResult<(AvDecision, OperationNode)>;

    /// Computes fine-grained decisions for one operation type.
    fn compute_operation(
        &self,
        ssid: SecurityId,
        tsid: SecurityId,
        tclass: ObjectClass,
        op_type: u8,
    ) -> AvcResult<OperationDecision>;

    /// Renders a SID as a security context string, for audit output.
    fn sid_to_context(&self, sid: SecurityId) -> AvcResult<String>;

    /// Returns true when denials are enforced.
    fn enforcing(&self) -> bool;

    /// Object class and permission names for audit rendering.
    fn class_map(&self) -> &ClassMap {
        ClassMap::builtin()
    }
}

type DecisionKey = (SecurityId, SecurityId, ObjectClass);
type OperationKey = (SecurityId, SecurityId, ObjectClass, u8);

/// Table-backed in-memory [`SecurityServer`].
///
/// Decisions are registered up front; unknown triples compute a
/// deny-all decision at the server's current policy version. Compute
/// calls are counted, which lets tests assert how often the cache fell
/// through to the server.
#[derive(Default)]
pub struct FixedSecurityServer {
    decisions: RwLock<HashMap<DecisionKey, (AvDecision, OperationNode)>>,
    operations: RwLock<HashMap<OperationKey, OperationDecision>>,
    contexts: RwLock<HashMap<SecurityId, String>>,
    seqno: AtomicU32,
    enforcing: AtomicBool,
    compute_av_calls: AtomicU64,
    compute_operation_calls: AtomicU64,
}

impl FixedSecurityServer {
    /// Creates an empty, enforcing server at policy version 1.
    pub fn new() -> Self {
        let server = Self::default();
        server.seqno.store(1, Ordering::Relaxed);
        server.enforcing.store(true, Ordering::Relaxed);
        server
    }

    /// Registers the decision computed for a triple.
    pub fn set_decision(
        &self,
        ssid: SecurityId,
        tsid: SecurityId,
        tclass: ObjectClass,
        avd: AvDecision,
    ) {
        self.decisions
            .write()
            .insert((ssid, tsid, tclass), (avd, OperationNode::new()));
    }

    /// Registers a decision together with its fine-grained node.
    pub fn set_decision_with_ops(
        &self,
        ssid: SecurityId,
        tsid: SecurityId,
        tclass: ObjectClass,
        avd: AvDecision,
        ops: OperationNode,
    ) {
        self.decisions
            .write()
            .insert((ssid, tsid, tclass), (avd, ops));
    }

    /// Registers the decision computed for one operation type of a
    /// triple.
    pub fn set_operation(
        &self,
        ssid: SecurityId,
        tsid: SecurityId,
        tclass: ObjectClass,
        decision: OperationDecision,
    ) {
        self.operations
            .write()
            .insert((ssid, tsid, tclass, decision.op_type), decision);
    }

    /// Registers a context string for a SID.
    pub fn set_context(&self, sid: SecurityId, context: &str) {
        self.contexts.write().insert(sid, context.to_string());
    }

    /// Sets the enforcing mode.
    pub fn set_enforcing(&self, enforcing: bool) {
        self.enforcing.store(enforcing, Ordering::Relaxed);
    }

    /// Sets the policy version stamped on default decisions.
    pub fn set_seqno(&self, seqno: PolicySeqno) {
        self.seqno.store(seqno, Ordering::Relaxed);
    }

    /// Number of `compute_av` calls served.
    pub fn compute_av_calls(&self) -> u64 {
        self.compute_av_calls.load(Ordering::Relaxed)
    }

    /// Number of `compute_operation` calls served.
    pub fn compute_operation_calls(&self) -> u64 {
        self.compute_operation_calls.load(Ordering::Relaxed)
    }
}

impl SecurityServer for FixedSecurityServer {
    fn compute_av(
        &self,
        ssid: SecurityId,
        tsid: SecurityId,
        tclass: ObjectClass,
    ) -> AvcResult<(AvDecision, OperationNode)> {
        self.compute_av_calls.fetch_add(1, Ordering::Relaxed);
        let decisions = self.decisions.read();
        Ok(match decisions.get(&(ssid, tsid, tclass)) {
            Some((avd, ops)) => (*avd, ops.clone()),
            None => (
                AvDecision::new(0, self.seqno.load(Ordering::Relaxed)),
                OperationNode::new(),
            ),
        })
    }

    fn compute_operation(
        &self,
        ssid: SecurityId,
        tsid: SecurityId,
        tclass: ObjectClass,
        op_type: u8,
    ) -> AvcResult<OperationDecision> {
        self.compute_operation_calls.fetch_add(1, Ordering::Relaxed);
        let operations = self.operations.read();
        Ok(operations
            .get(&(ssid, tsid, tclass, op_type))
            .cloned()
            .unwrap_or_else(|| OperationDecision::new(op_type, 0)))
    }

    fn sid_to_context(&self, sid: SecurityId) -> AvcResult<String> {
        let contexts = self.contexts.read();
        Ok(contexts
            .get(&sid)
            .cloned()
            .unwrap_or_else(|| format!("u:object_r:sid_{sid}:s0")))
    }

    fn enforcing(&self) -> bool {
        self.enforcing.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_map_names() {
        let map = ClassMap::builtin();
        assert_eq!(map.class_name(1), "file");
        assert_eq!(map.class_name(999), "class999");
        assert_eq!(map.permission_names(1, 0b0011), "read write");
        assert_eq!(map.permission_names(1, 0), "");
    }

    #[test]
    fn test_class_map_unknown_bits() {
        let map = ClassMap::builtin();
        // Bit 31 has no name in any builtin class.
        assert_eq!(map.permission_names(1, 1 << 31), "0x80000000");
        assert_eq!(map.permission_names(999, 0b1), "0x1");
    }

    #[test]
    fn test_fixed_server_decisions() {
        let server = FixedSecurityServer::new();
        server.set_decision(1, 2, 3, AvDecision::new(0b1010, 7));

        let (avd, ops) = server.compute_av(1, 2, 3).unwrap();
        assert_eq!(avd.allowed, 0b1010);
        assert_eq!(avd.seqno, 7);
        assert!(ops.is_empty());
        assert_eq!(server.compute_av_calls(), 1);

        // Unknown triples deny everything at the server's seqno.
        let (avd, _) = server.compute_av(9, 9, 9).unwrap();
        assert_eq!(avd.allowed, 0);
        assert_eq!(avd.seqno, 1);
        assert_eq!(server.compute_av_calls(), 2);
    }

    #[test]
    fn test_fixed_server_contexts() {
        let server = FixedSecurityServer::new();
        server.set_context(1, "u:r:init:s0");
        assert_eq!(server.sid_to_context(1).unwrap(), "u:r:init:s0");
        assert_eq!(server.sid_to_context(7).unwrap(), "u:object_r:sid_7:s0");
    }

    #[test]
    fn test_fixed_server_enforcing_toggle() {
        let server = FixedSecurityServer::new();
        assert!(server.enforcing());
        server.set_enforcing(false);
        assert!(!server.enforcing());
    }
}
