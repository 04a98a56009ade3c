//! Cache entries.

use crossbeam::epoch::Atomic;

use crate::decision::{AvDecision, OperationCommand, OperationLookup, OperationNode};
use crate::types::{ObjectClass, SecurityId};

/// One cache entry: a (subject, object, class) key, its coarse
/// decision, and optionally the fine-grained decisions attached so far.
///
/// A node lives in exactly one bucket chain at a time and is immutable
/// once linked; updates replace the whole node. The `next` pointer is
/// owned by the chain, not by the node: dropping a node never touches
/// its successors.
#[derive(Debug)]
pub struct AvcNode {
    ssid: SecurityId,
    tsid: SecurityId,
    tclass: ObjectClass,
    avd: AvDecision,
    ops: Option<OperationNode>,
    pub(crate) next: Atomic<AvcNode>,
}

impl AvcNode {
    pub(crate) fn new(
        ssid: SecurityId,
        tsid: SecurityId,
        tclass: ObjectClass,
        avd: AvDecision,
        ops: Option<OperationNode>,
    ) -> Self {
        Self {
            ssid,
            tsid,
            tclass,
            avd,
            ops,
            next: Atomic::null(),
        }
    }

    /// Source SID of the key.
    pub fn ssid(&self) -> SecurityId {
        self.ssid
    }

    /// Target SID of the key.
    pub fn tsid(&self) -> SecurityId {
        self.tsid
    }

    /// Object class of the key.
    pub fn tclass(&self) -> ObjectClass {
        self.tclass
    }

    /// Copies the coarse decision out of the entry.
    pub fn decision(&self) -> AvDecision {
        self.avd
    }

    /// Fine-grained decisions attached to the entry, if any.
    pub fn operations(&self) -> Option<&OperationNode> {
        self.ops.as_ref()
    }

    /// Probes the entry's operation table for `cmd`. Entries without an
    /// operation table are unconstrained.
    pub fn probe_operation(&self, cmd: OperationCommand) -> OperationLookup {
        match &self.ops {
            Some(ops) => ops.probe(cmd),
            None => OperationLookup::Unconstrained,
        }
    }

    pub(crate) fn matches(&self, ssid: SecurityId, tsid: SecurityId, tclass: ObjectClass) -> bool {
        self.ssid == ssid && self.tsid == tsid && self.tclass == tclass
    }

    pub(crate) fn set_decision(&mut self, avd: AvDecision) {
        self.avd = avd;
    }

    pub(crate) fn decision_mut(&mut self) -> &mut AvDecision {
        &mut self.avd
    }

    pub(crate) fn set_operations(&mut self, ops: Option<OperationNode>) {
        self.ops = ops;
    }

    pub(crate) fn operations_mut(&mut self) -> &mut Option<OperationNode> {
        &mut self.ops
    }
}
