//! Fine-grained per-operation decisions.
//!
//! An operation is a sub-class action (an ioctl-style command) identified
//! by an 8-bit type and an 8-bit number. Decisions are computed one type
//! at a time and attached lazily to cache entries; the hot path copies a
//! single 32-bit slice of the relevant bitmap onto the stack.

use serde::{Deserialize, Serialize};

/// `specified` bit: the `allowed` bitmap is meaningful.
pub const OP_SPECIFIED_ALLOWED: u8 = 0x01;

/// `specified` bit: the `auditallow` bitmap is meaningful.
pub const OP_SPECIFIED_AUDITALLOW: u8 = 0x02;

/// `specified` bit: the `dontaudit` bitmap is meaningful.
pub const OP_SPECIFIED_DONTAUDIT: u8 = 0x04;

const BITMAP_WORDS: usize = 8;

/// 256-bit set stored as eight 32-bit words, one bit per operation
/// number (or per operation type when used as a type mask).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationBitmap([u32; BITMAP_WORDS]);

impl OperationBitmap {
    /// Creates an empty bitmap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the bit for `n`.
    pub fn set(&mut self, n: u8) {
        self.0[usize::from(n) >> 5] |= 1 << (n & 31);
    }

    /// Clears the bit for `n`.
    pub fn clear(&mut self, n: u8) {
        self.0[usize::from(n) >> 5] &= !(1 << (n & 31));
    }

    /// Returns true if the bit for `n` is set.
    pub fn contains(&self, n: u8) -> bool {
        self.0[usize::from(n) >> 5] & (1 << (n & 31)) != 0
    }

    /// Returns the 32-bit word containing the bit for `n`.
    pub fn word(&self, n: u8) -> u32 {
        self.0[usize::from(n) >> 5]
    }

    /// Returns true if no bit is set.
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    /// Number of set bits.
    pub fn len(&self) -> u32 {
        self.0.iter().map(|w| w.count_ones()).sum()
    }
}

/// One fine-grained operation: an 8-bit type and an 8-bit number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationCommand {
    /// Operation type (selects the decision table).
    pub op_type: u8,

    /// Operation number within the type.
    pub op_num: u8,
}

impl OperationCommand {
    /// Creates a command from its type and number.
    pub fn new(op_type: u8, op_num: u8) -> Self {
        Self { op_type, op_num }
    }

    /// Splits a packed 16-bit command (type in the high byte).
    pub fn from_raw(raw: u16) -> Self {
        Self {
            op_type: (raw >> 8) as u8,
            op_num: (raw & 0xff) as u8,
        }
    }

    /// Packs the command back into its 16-bit wire form.
    pub fn as_raw(&self) -> u16 {
        (u16::from(self.op_type) << 8) | u16::from(self.op_num)
    }
}

/// Fine-grained decisions for a single operation type.
///
/// Each bitmap carries one bit per operation number; a bitmap is only
/// meaningful when the matching `OP_SPECIFIED_*` bit is set in
/// `specified`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationDecision {
    /// Operation type this decision covers.
    pub op_type: u8,

    /// Bitset over `OP_SPECIFIED_*` indicating which bitmaps below are
    /// meaningful.
    pub specified: u8,

    /// Operation numbers granted by policy.
    pub allowed: OperationBitmap,

    /// Operation numbers audited when granted.
    pub auditallow: OperationBitmap,

    /// Operation numbers whose denials are not audited.
    pub dontaudit: OperationBitmap,
}

impl OperationDecision {
    /// Creates an empty decision for `op_type` with the given
    /// `specified` bits.
    pub fn new(op_type: u8, specified: u8) -> Self {
        Self {
            op_type,
            specified,
            ..Self::default()
        }
    }

    /// Copies the 32-bit slice containing `op_num` out of each
    /// meaningful bitmap.
    pub fn slice_for(&self, op_num: u8) -> OperationSlice {
        OperationSlice {
            specified: self.specified,
            allowed: self.allowed.word(op_num),
            auditallow: self.auditallow.word(op_num),
            dontaudit: self.dontaudit.word(op_num),
        }
    }
}

/// Stack-local copy of one 32-bit slice of an [`OperationDecision`].
///
/// Only valid for operation numbers that share the slice it was copied
/// for; the decision protocol queries it with the same number it was
/// built from.
#[derive(Debug, Clone, Copy, Default)]
pub struct OperationSlice {
    /// `specified` bits copied from the source decision.
    pub specified: u8,

    /// Slice of the `allowed` bitmap.
    pub allowed: u32,

    /// Slice of the `auditallow` bitmap.
    pub auditallow: u32,

    /// Slice of the `dontaudit` bitmap.
    pub dontaudit: u32,
}

impl OperationSlice {
    fn bit(op_num: u8) -> u32 {
        1 << (op_num & 31)
    }

    /// Returns true if the slice grants `op_num`. An unspecified
    /// `allowed` bitmap places no constraint.
    pub fn allows(&self, op_num: u8) -> bool {
        self.specified & OP_SPECIFIED_ALLOWED == 0 || self.allowed & Self::bit(op_num) != 0
    }

    /// Returns true if a grant of `op_num` must be audited.
    pub fn audit_on_allow(&self, op_num: u8) -> bool {
        self.specified & OP_SPECIFIED_AUDITALLOW != 0 && self.auditallow & Self::bit(op_num) != 0
    }

    /// Returns true if a denial of `op_num` must not be audited.
    pub fn suppress_deny_audit(&self, op_num: u8) -> bool {
        self.specified & OP_SPECIFIED_DONTAUDIT != 0 && self.dontaudit & Self::bit(op_num) != 0
    }
}

/// Outcome of probing an entry's operation table for one command.
#[derive(Debug, Clone, Copy)]
pub enum OperationLookup {
    /// The entry carries no fine-grained constraints.
    Unconstrained,

    /// A decision for the command's type is attached; its relevant
    /// slice has been copied out.
    Decided(OperationSlice),

    /// The command's type has never been computed; the command is
    /// denied without consulting the security server.
    NotComputed,

    /// The command's type is flagged as computable but no decision is
    /// attached; the caller must compute one and attach it.
    Pending,
}

/// Per-entry aggregate of fine-grained decisions.
///
/// Owns its decisions outright; cloning produces a fully independent
/// deep copy. The list is unordered and keyed by operation type, at
/// most one decision per type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationNode {
    /// Types for which decisions have been computed.
    type_mask: OperationBitmap,

    /// Attached decisions, at most one per type.
    decisions: Vec<OperationDecision>,
}

impl OperationNode {
    /// Creates an empty node.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of attached decisions.
    pub fn len(&self) -> usize {
        self.decisions.len()
    }

    /// Returns true if no decision is attached.
    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }

    /// Types for which decisions have been computed.
    pub fn type_mask(&self) -> &OperationBitmap {
        &self.type_mask
    }

    /// Returns the attached decision for `op_type`, if any.
    pub fn decision_for(&self, op_type: u8) -> Option<&OperationDecision> {
        self.decisions.iter().find(|d| d.op_type == op_type)
    }

    /// Attaches a copy of `decision`, replacing any existing decision
    /// for the same type, and marks the type as computed.
    pub fn add_decision(&mut self, decision: &OperationDecision) {
        self.type_mask.set(decision.op_type);
        match self.decisions.iter_mut().find(|d| d.op_type == decision.op_type) {
            Some(existing) => *existing = decision.clone(),
            None => self.decisions.push(decision.clone()),
        }
    }

    /// Records a granted command: the type is marked computed and, if a
    /// decision for it is attached, its allow bit is set.
    ///
    /// No decision is fabricated when none is attached; a single-bit
    /// allowed bitmap would implicitly deny every other number of the
    /// type.
    pub fn allow_command(&mut self, cmd: OperationCommand) {
        self.type_mask.set(cmd.op_type);
        if let Some(decision) = self.decisions.iter_mut().find(|d| d.op_type == cmd.op_type) {
            decision.specified |= OP_SPECIFIED_ALLOWED;
            decision.allowed.set(cmd.op_num);
        }
    }

    /// True when the node constrains anything: a decision is attached
    /// or some type is flagged as computable.
    pub fn has_constraints(&self) -> bool {
        !self.decisions.is_empty() || !self.type_mask.is_empty()
    }

    /// Flags `op_type` as computable: the policy defines fine-grained
    /// decisions for it, to be computed and attached on first use.
    pub fn flag_type(&mut self, op_type: u8) {
        self.type_mask.set(op_type);
    }

    /// Probes the node for `cmd`, copying the relevant decision slice
    /// when one is attached.
    pub fn probe(&self, cmd: OperationCommand) -> OperationLookup {
        if !self.has_constraints() {
            return OperationLookup::Unconstrained;
        }
        if let Some(decision) = self.decision_for(cmd.op_type) {
            return OperationLookup::Decided(decision.slice_for(cmd.op_num));
        }
        if !self.type_mask.contains(cmd.op_type) {
            return OperationLookup::NotComputed;
        }
        OperationLookup::Pending
    }
}
