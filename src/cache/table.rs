//! Concurrent bucket table: lookup, insertion, replacement, in-place
//! update, eviction, and flushing.
//!
//! Readers traverse chains lock-free inside an epoch-pinned critical
//! section; all chain surgery happens under the owning bucket's mutex
//! and replaces nodes atomically, so a concurrent reader observes either
//! the old or the new version of an entry, never neither. Unlinked nodes
//! are handed to the epoch reclaimer and freed only after every reader
//! critical section that predates the unlink has ended.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::epoch::{self, Atomic, Guard, Owned, Shared};
use parking_lot::Mutex;

use super::node::AvcNode;
use super::{bucket_index, CacheConfig, CacheStats, CacheStatsSnapshot, N_SLOTS};
use crate::decision::{AvDecision, OperationCommand, OperationDecision, OperationNode};
use crate::error::{AvcError, AvcResult};
use crate::types::{AccessVector, ObjectClass, PolicySeqno, SecurityId};

/// Mutation applied to a cached entry by [`CacheTable::update_node`].
///
/// Updates are advisory accelerators: the store of truth is the security
/// server, so a lost update (stale seqno, concurrent replacement) is
/// benign.
#[derive(Debug, Clone, Copy)]
pub enum UpdateEvent<'a> {
    /// Grant permissions; optionally record a granted fine-grained
    /// command as well.
    Grant {
        /// Permissions to add to the allowed set.
        perms: AccessVector,
        /// Granted command to record in the operation table.
        cmd: Option<OperationCommand>,
    },

    /// Revoke permissions unconditionally.
    Revoke {
        /// Permissions to remove from the allowed set.
        perms: AccessVector,
    },

    /// Revoke permissions unless in active use. The cache cannot tell
    /// usage apart, so this behaves like [`UpdateEvent::Revoke`].
    TryRevoke {
        /// Permissions to remove from the allowed set.
        perms: AccessVector,
    },

    /// Enable audit-on-grant for permissions.
    AuditAllowEnable {
        /// Permissions to start auditing on grant.
        perms: AccessVector,
    },

    /// Disable audit-on-grant for permissions.
    AuditAllowDisable {
        /// Permissions to stop auditing on grant.
        perms: AccessVector,
    },

    /// Enable audit-on-deny for permissions.
    AuditDenyEnable {
        /// Permissions to start auditing on deny.
        perms: AccessVector,
    },

    /// Disable audit-on-deny for permissions.
    AuditDenyDisable {
        /// Permissions to stop auditing on deny.
        perms: AccessVector,
    },

    /// Attach a deep copy of a freshly computed operation decision.
    AddOperation(&'a OperationDecision),
}

struct Bucket {
    head: Atomic<AvcNode>,
    lock: Mutex<()>,
}

impl Bucket {
    fn new() -> Self {
        Self {
            head: Atomic::null(),
            lock: Mutex::new(()),
        }
    }
}

/// The concurrent decision cache.
///
/// A fixed array of [`N_SLOTS`] buckets, each a singly-linked chain of
/// [`AvcNode`]s with its own writer lock. See the module docs for the
/// concurrency discipline.
pub struct CacheTable {
    buckets: Box<[Bucket]>,
    config: CacheConfig,
    stats: CacheStats,
    active_count: AtomicUsize,
    lru_hint: AtomicUsize,
    latest_seqno: Mutex<PolicySeqno>,
}

impl CacheTable {
    /// Creates an empty cache with the given configuration.
    pub fn new(config: CacheConfig) -> Self {
        let buckets = (0..N_SLOTS).map(|_| Bucket::new()).collect();
        let stats = CacheStats::new(config.stats_enabled);
        Self {
            buckets,
            config,
            stats,
            active_count: AtomicUsize::new(0),
            lru_hint: AtomicUsize::new(0),
            latest_seqno: Mutex::new(0),
        }
    }

    /// Enters a reader critical section.
    ///
    /// Every node reference obtained from [`CacheTable::lookup`] stays
    /// readable until the returned guard is dropped; no node unlinked
    /// while the guard is held is freed before then.
    pub fn reader() -> Guard {
        epoch::pin()
    }

    /// Looks up the entry for a key, lock-free.
    ///
    /// The returned reference is valid for the guard's lifetime; the
    /// node may be unlinked (and later freed) concurrently.
    pub fn lookup<'g>(
        &self,
        guard: &'g Guard,
        ssid: SecurityId,
        tsid: SecurityId,
        tclass: ObjectClass,
    ) -> Option<&'g AvcNode> {
        let bucket = &self.buckets[bucket_index(ssid, tsid, tclass)];
        let mut cur = bucket.head.load(Ordering::Acquire, guard);
        // SAFETY: the guard pins the current epoch; any node reachable
        // from the chain cannot be freed before the guard is dropped.
        while let Some(node) = unsafe { cur.as_ref() } {
            if node.matches(ssid, tsid, tclass) {
                self.stats.record_lookup(true);
                return Some(node);
            }
            cur = node.next.load(Ordering::Acquire, guard);
        }
        self.stats.record_lookup(false);
        None
    }

    /// Inserts a decision for a key, replacing any existing entry.
    ///
    /// Returns `None` without inserting when the decision's seqno is
    /// older than the latest observed policy version: such a decision is
    /// known-stale and must not repopulate the cache. The supplied
    /// operation node is deep-copied into the entry.
    pub fn insert<'g>(
        &self,
        guard: &'g Guard,
        ssid: SecurityId,
        tsid: SecurityId,
        tclass: ObjectClass,
        avd: AvDecision,
        ops: Option<&OperationNode>,
    ) -> AvcResult<Option<&'g AvcNode>> {
        if avd.seqno < self.latest_seqno() {
            log::debug!(
                "refusing stale insert for ({ssid}, {tsid}, {tclass}): seqno {} < latest",
                avd.seqno
            );
            return Ok(None);
        }

        let node = self.alloc_node(guard, AvcNode::new(ssid, tsid, tclass, avd, ops.cloned()));
        let bucket = &self.buckets[bucket_index(ssid, tsid, tclass)];
        let _chain = bucket.lock.lock();

        let mut prev = &bucket.head;
        loop {
            let cur = prev.load(Ordering::Acquire, guard);
            // SAFETY: guard-pinned; see lookup.
            match unsafe { cur.as_ref() } {
                Some(existing) if existing.matches(ssid, tsid, tclass) => {
                    // Replace in place: a concurrent reader sees either
                    // the old node or the new one.
                    node.next
                        .store(existing.next.load(Ordering::Acquire, guard), Ordering::Relaxed);
                    let linked = node.into_shared(guard);
                    prev.store(linked, Ordering::Release);
                    self.unlink(guard, cur);
                    // SAFETY: just linked under the bucket lock; valid
                    // for the guard's lifetime.
                    return Ok(Some(unsafe { linked.deref() }));
                }
                Some(existing) => prev = &existing.next,
                None => {
                    node.next
                        .store(bucket.head.load(Ordering::Acquire, guard), Ordering::Relaxed);
                    let linked = node.into_shared(guard);
                    bucket.head.store(linked, Ordering::Release);
                    // SAFETY: as above.
                    return Ok(Some(unsafe { linked.deref() }));
                }
            }
        }
    }

    /// Patches the entry matching the key **and** `seqno` by cloning it,
    /// applying `event`, and atomically replacing it in its chain.
    ///
    /// The seqno match keeps a late update from clobbering a newer
    /// concurrent insert; when no entry matches, the update is discarded
    /// with [`AvcError::NotFound`]. Concurrent updates to the same key
    /// serialise on the bucket lock; the last writer wins.
    pub fn update_node(
        &self,
        ssid: SecurityId,
        tsid: SecurityId,
        tclass: ObjectClass,
        seqno: PolicySeqno,
        event: UpdateEvent<'_>,
    ) -> AvcResult<()> {
        let guard = epoch::pin();
        let mut candidate = self.alloc_node(
            &guard,
            AvcNode::new(ssid, tsid, tclass, AvDecision::default(), None),
        );
        let bucket = &self.buckets[bucket_index(ssid, tsid, tclass)];
        let _chain = bucket.lock.lock();

        let mut prev = &bucket.head;
        let (prev_link, orig) = loop {
            let cur = prev.load(Ordering::Acquire, &guard);
            // SAFETY: guard-pinned; see lookup.
            match unsafe { cur.as_ref() } {
                Some(existing)
                    if existing.matches(ssid, tsid, tclass)
                        && existing.decision().seqno == seqno =>
                {
                    break (prev, cur);
                }
                Some(existing) => prev = &existing.next,
                None => {
                    // Never linked: free immediately, no deferral.
                    self.discard(candidate);
                    return Err(AvcError::NotFound);
                }
            }
        };

        // SAFETY: orig is non-null (matched above) and guard-pinned.
        let original = unsafe { orig.deref() };
        candidate.set_decision(original.decision());
        candidate.set_operations(original.operations().cloned());
        apply_event(&mut candidate, event);

        candidate
            .next
            .store(original.next.load(Ordering::Acquire, &guard), Ordering::Relaxed);
        let linked = candidate.into_shared(&guard);
        prev_link.store(linked, Ordering::Release);
        self.unlink(&guard, orig);
        Ok(())
    }

    /// Unlinks every node in every bucket. Idempotent.
    pub fn flush(&self) {
        let guard = epoch::pin();
        for bucket in self.buckets.iter() {
            let _chain = bucket.lock.lock();
            let mut cur = bucket.head.load(Ordering::Acquire, &guard);
            bucket.head.store(Shared::null(), Ordering::Release);
            // SAFETY: guard-pinned; see lookup.
            while let Some(node) = unsafe { cur.as_ref() } {
                let next = node.next.load(Ordering::Acquire, &guard);
                self.unlink(&guard, cur);
                cur = next;
            }
        }
    }

    /// Number of linked nodes (plus any in-flight candidates).
    pub fn len(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }

    /// True when no node is linked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The newest policy version whose invalidation has been observed.
    pub fn latest_seqno(&self) -> PolicySeqno {
        *self.latest_seqno.lock()
    }

    /// Raises the latest observed policy version. Monotonic; an older
    /// value is ignored.
    pub fn raise_seqno(&self, seqno: PolicySeqno) {
        let mut latest = self.latest_seqno.lock();
        if seqno > *latest {
            *latest = seqno;
        }
    }

    /// Statistics counters.
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Renders the bucket occupancy summary.
    pub fn hash_stats_text(&self) -> String {
        let guard = epoch::pin();
        let mut used = 0usize;
        let mut longest = 0usize;
        for bucket in self.buckets.iter() {
            let mut chain = 0usize;
            let mut cur = bucket.head.load(Ordering::Acquire, &guard);
            // SAFETY: guard-pinned; see lookup.
            while let Some(node) = unsafe { cur.as_ref() } {
                chain += 1;
                cur = node.next.load(Ordering::Acquire, &guard);
            }
            if chain > 0 {
                used += 1;
            }
            longest = longest.max(chain);
        }
        format!(
            "entries: {}\nbuckets used: {}/{}\nlongest chain: {}\n",
            self.len(),
            used,
            N_SLOTS,
            longest
        )
    }

    /// Allocates a node, counting it and running one evictor pass if the
    /// count crossed the threshold.
    fn alloc_node(&self, guard: &Guard, node: AvcNode) -> Owned<AvcNode> {
        self.stats.record_allocation();
        if self.active_count.fetch_add(1, Ordering::Relaxed) + 1 > self.config.cache_threshold {
            self.evict(guard);
        }
        Owned::new(node)
    }

    /// Frees a candidate that was never linked. No deferral needed:
    /// no reader can have seen it.
    fn discard(&self, candidate: Owned<AvcNode>) {
        self.active_count.fetch_sub(1, Ordering::Relaxed);
        drop(candidate);
    }

    /// Hands an unlinked node to the reclaimer.
    fn unlink(&self, guard: &Guard, node: Shared<'_, AvcNode>) {
        self.active_count.fetch_sub(1, Ordering::Relaxed);
        self.stats.record_free();
        // SAFETY: the node was unlinked under its bucket lock and can no
        // longer be reached by new readers; the epoch reclaimer frees it
        // after every reader critical section predating the unlink ends.
        unsafe { guard.defer_destroy(node) };
    }

    /// Reclaims up to `reclaim_batch` nodes, sweeping buckets from the
    /// rotating hint and skipping contended ones. Bounded work, no
    /// allocation, no external calls.
    fn evict(&self, guard: &Guard) {
        let mut reclaimed = 0usize;
        for _ in 0..N_SLOTS {
            let index = self.lru_hint.fetch_add(1, Ordering::Relaxed) & (N_SLOTS - 1);
            let bucket = &self.buckets[index];
            let Some(_chain) = bucket.lock.try_lock() else {
                continue;
            };
            let mut cur = bucket.head.load(Ordering::Acquire, guard);
            // SAFETY: guard-pinned; see lookup.
            while let Some(node) = unsafe { cur.as_ref() } {
                let next = node.next.load(Ordering::Acquire, guard);
                bucket.head.store(next, Ordering::Release);
                self.stats.record_reclaim();
                self.unlink(guard, cur);
                reclaimed += 1;
                cur = next;
                if reclaimed >= self.config.reclaim_batch {
                    log::debug!("evictor reclaimed {reclaimed} nodes");
                    return;
                }
            }
        }
        if reclaimed > 0 {
            log::debug!("evictor reclaimed {reclaimed} nodes");
        }
    }

    #[cfg(test)]
    fn chain_count(&self, ssid: SecurityId, tsid: SecurityId, tclass: ObjectClass) -> usize {
        let guard = epoch::pin();
        let bucket = &self.buckets[bucket_index(ssid, tsid, tclass)];
        let mut count = 0usize;
        let mut cur = bucket.head.load(Ordering::Acquire, &guard);
        while let Some(node) = unsafe { cur.as_ref() } {
            if node.matches(ssid, tsid, tclass) {
                count += 1;
            }
            cur = node.next.load(Ordering::Acquire, &guard);
        }
        count
    }

    #[cfg(test)]
    fn linked_count(&self) -> usize {
        let guard = epoch::pin();
        let mut count = 0usize;
        for bucket in self.buckets.iter() {
            let mut cur = bucket.head.load(Ordering::Acquire, &guard);
            while let Some(node) = unsafe { cur.as_ref() } {
                count += 1;
                cur = node.next.load(Ordering::Acquire, &guard);
            }
        }
        count
    }
}

impl Drop for CacheTable {
    fn drop(&mut self) {
        // SAFETY: &mut self guarantees no concurrent readers or writers;
        // the chains can be torn down without deferral.
        unsafe {
            let guard = epoch::unprotected();
            for bucket in self.buckets.iter() {
                let mut cur = bucket.head.load(Ordering::Relaxed, guard);
                while !cur.is_null() {
                    let next = cur.deref().next.load(Ordering::Relaxed, guard);
                    drop(cur.into_owned());
                    cur = next;
                }
            }
        }
    }
}

fn apply_event(node: &mut AvcNode, event: UpdateEvent<'_>) {
    match event {
        UpdateEvent::Grant { perms, cmd } => {
            node.decision_mut().allowed |= perms;
            if let Some(cmd) = cmd {
                if let Some(ops) = node.operations_mut() {
                    ops.allow_command(cmd);
                }
            }
        }
        UpdateEvent::Revoke { perms } | UpdateEvent::TryRevoke { perms } => {
            node.decision_mut().allowed &= !perms;
        }
        UpdateEvent::AuditAllowEnable { perms } => {
            node.decision_mut().auditallow |= perms;
        }
        UpdateEvent::AuditAllowDisable { perms } => {
            node.decision_mut().auditallow &= !perms;
        }
        UpdateEvent::AuditDenyEnable { perms } => {
            node.decision_mut().auditdeny |= perms;
        }
        UpdateEvent::AuditDenyDisable { perms } => {
            node.decision_mut().auditdeny &= !perms;
        }
        UpdateEvent::AddOperation(decision) => {
            node.operations_mut()
                .get_or_insert_with(OperationNode::new)
                .add_decision(decision);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{OperationNode, OP_SPECIFIED_ALLOWED};
    use proptest::prelude::*;

    fn table() -> CacheTable {
        CacheTable::new(CacheConfig::default())
    }

    fn insert_simple(table: &CacheTable, ssid: u32, tsid: u32, tclass: u16, avd: AvDecision) {
        let guard = CacheTable::reader();
        table
            .insert(&guard, ssid, tsid, tclass, avd, None)
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_insert_lookup_round_trip() {
        let table = table();
        let avd = AvDecision {
            allowed: 0b1010,
            auditallow: 0b0001,
            auditdeny: 0b1111,
            flags: 0,
            seqno: 7,
        };
        insert_simple(&table, 1, 2, 3, avd);

        let guard = CacheTable::reader();
        let node = table.lookup(&guard, 1, 2, 3).unwrap();
        assert_eq!(node.decision(), avd);
        assert!(node.operations().is_none());
        assert_eq!(table.len(), 1);

        assert!(table.lookup(&guard, 1, 2, 4).is_none());
        let stats = table.stats();
        assert_eq!(stats.lookups, 2);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_replacement_keeps_one_node_per_key() {
        let table = table();
        insert_simple(&table, 1, 2, 3, AvDecision::new(0b01, 1));
        insert_simple(&table, 1, 2, 3, AvDecision::new(0b10, 1));

        assert_eq!(table.chain_count(1, 2, 3), 1);
        assert_eq!(table.len(), 1);

        let guard = CacheTable::reader();
        let node = table.lookup(&guard, 1, 2, 3).unwrap();
        assert_eq!(node.decision().allowed, 0b10);
    }

    #[test]
    fn test_colliding_keys_share_bucket() {
        let table = table();
        // ssid 0 and 512 hash to the same bucket.
        assert_eq!(bucket_index(0, 0, 1), bucket_index(512, 0, 1));
        insert_simple(&table, 0, 0, 1, AvDecision::new(0b01, 1));
        insert_simple(&table, 512, 0, 1, AvDecision::new(0b10, 1));

        let guard = CacheTable::reader();
        assert_eq!(table.lookup(&guard, 0, 0, 1).unwrap().decision().allowed, 0b01);
        assert_eq!(
            table.lookup(&guard, 512, 0, 1).unwrap().decision().allowed,
            0b10
        );
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_seqno_gate_refuses_stale_insert() {
        let table = table();
        table.raise_seqno(5);

        let guard = CacheTable::reader();
        let refused = table
            .insert(&guard, 1, 2, 3, AvDecision::new(0b1, 4), None)
            .unwrap();
        assert!(refused.is_none());
        assert_eq!(table.len(), 0);

        let installed = table
            .insert(&guard, 1, 2, 3, AvDecision::new(0b1, 5), None)
            .unwrap();
        assert!(installed.is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_raise_seqno_is_monotonic() {
        let table = table();
        table.raise_seqno(8);
        table.raise_seqno(3);
        assert_eq!(table.latest_seqno(), 8);
    }

    #[test]
    fn test_update_grant_and_revoke() {
        let table = table();
        insert_simple(&table, 1, 2, 3, AvDecision::new(0b1010, 7));

        table
            .update_node(1, 2, 3, 7, UpdateEvent::Grant { perms: 0b0100, cmd: None })
            .unwrap();
        {
            let guard = CacheTable::reader();
            let node = table.lookup(&guard, 1, 2, 3).unwrap();
            assert_eq!(node.decision().allowed, 0b1110);
            // Untouched fields carry over.
            assert_eq!(node.decision().seqno, 7);
            assert_eq!(node.decision().auditdeny, !0);
        }

        table
            .update_node(1, 2, 3, 7, UpdateEvent::Revoke { perms: 0b0110 })
            .unwrap();
        let guard = CacheTable::reader();
        let node = table.lookup(&guard, 1, 2, 3).unwrap();
        assert_eq!(node.decision().allowed, 0b1000);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_grant_then_revoke_is_not_identity() {
        let table = table();
        let initial = 0b1010;
        insert_simple(&table, 1, 2, 3, AvDecision::new(initial, 1));

        table
            .update_node(1, 2, 3, 1, UpdateEvent::Grant { perms: 0b0010, cmd: None })
            .unwrap();
        table
            .update_node(1, 2, 3, 1, UpdateEvent::Revoke { perms: 0b0010 })
            .unwrap();

        let guard = CacheTable::reader();
        let node = table.lookup(&guard, 1, 2, 3).unwrap();
        // Revoke is not a left inverse of grant: the bit is gone even
        // though it was allowed before the grant.
        assert_eq!(node.decision().allowed, initial & !0b0010);
    }

    #[test]
    fn test_update_audit_toggles() {
        let table = table();
        let avd = AvDecision {
            allowed: 0b1,
            auditallow: 0b0001,
            auditdeny: 0b1000,
            flags: 0,
            seqno: 2,
        };
        insert_simple(&table, 4, 5, 6, avd);

        table
            .update_node(4, 5, 6, 2, UpdateEvent::AuditAllowEnable { perms: 0b0010 })
            .unwrap();
        table
            .update_node(4, 5, 6, 2, UpdateEvent::AuditDenyDisable { perms: 0b1000 })
            .unwrap();

        let guard = CacheTable::reader();
        let node = table.lookup(&guard, 4, 5, 6).unwrap();
        assert_eq!(node.decision().auditallow, 0b0011);
        assert_eq!(node.decision().auditdeny, 0);
    }

    #[test]
    fn test_update_missing_key_is_not_found() {
        let table = table();
        let err = table
            .update_node(9, 9, 9, 1, UpdateEvent::Grant { perms: 1, cmd: None })
            .unwrap_err();
        assert_eq!(err, AvcError::NotFound);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_update_seqno_mismatch_is_not_found() {
        let table = table();
        insert_simple(&table, 1, 2, 3, AvDecision::new(0b1, 7));
        let err = table
            .update_node(1, 2, 3, 6, UpdateEvent::Grant { perms: 1, cmd: None })
            .unwrap_err();
        assert_eq!(err, AvcError::NotFound);

        let guard = CacheTable::reader();
        assert_eq!(table.lookup(&guard, 1, 2, 3).unwrap().decision().allowed, 0b1);
    }

    #[test]
    fn test_update_add_operation() {
        let table = table();
        insert_simple(&table, 1, 2, 3, AvDecision::new(0b1, 1));

        let mut decision = OperationDecision::new(5, OP_SPECIFIED_ALLOWED);
        decision.allowed.set(42);
        table
            .update_node(1, 2, 3, 1, UpdateEvent::AddOperation(&decision))
            .unwrap();

        let guard = CacheTable::reader();
        let node = table.lookup(&guard, 1, 2, 3).unwrap();
        let ops = node.operations().unwrap();
        assert_eq!(ops.len(), 1);
        assert!(ops.type_mask().contains(5));
        assert!(ops.decision_for(5).unwrap().allowed.contains(42));
    }

    #[test]
    fn test_grant_patches_operation_bit() {
        let table = table();
        let mut ops = OperationNode::new();
        ops.add_decision(&OperationDecision::new(5, OP_SPECIFIED_ALLOWED));
        {
            let guard = CacheTable::reader();
            table
                .insert(&guard, 1, 2, 3, AvDecision::new(0, 1), Some(&ops))
                .unwrap()
                .unwrap();
        }

        table
            .update_node(
                1,
                2,
                3,
                1,
                UpdateEvent::Grant {
                    perms: 0b1,
                    cmd: Some(OperationCommand::new(5, 42)),
                },
            )
            .unwrap();

        let guard = CacheTable::reader();
        let node = table.lookup(&guard, 1, 2, 3).unwrap();
        assert_eq!(node.decision().allowed, 0b1);
        assert!(node
            .operations()
            .unwrap()
            .decision_for(5)
            .unwrap()
            .allowed
            .contains(42));
    }

    #[test]
    fn test_insert_deep_copies_operations() {
        let table = table();
        let mut ops = OperationNode::new();
        let mut decision = OperationDecision::new(5, OP_SPECIFIED_ALLOWED);
        decision.allowed.set(1);
        ops.add_decision(&decision);

        {
            let guard = CacheTable::reader();
            table
                .insert(&guard, 1, 2, 3, AvDecision::new(0b1, 1), Some(&ops))
                .unwrap()
                .unwrap();
        }

        // Mutating the caller's scratch node leaves the entry alone.
        ops.allow_command(OperationCommand::new(5, 2));

        let guard = CacheTable::reader();
        let node = table.lookup(&guard, 1, 2, 3).unwrap();
        assert!(!node.operations().unwrap().decision_for(5).unwrap().allowed.contains(2));
    }

    #[test]
    fn test_flush_empties_and_is_idempotent() {
        let table = table();
        for i in 0..20 {
            insert_simple(&table, i, i + 1, 1, AvDecision::new(1, 1));
        }
        assert_eq!(table.len(), 20);

        table.flush();
        assert_eq!(table.len(), 0);
        assert_eq!(table.linked_count(), 0);

        table.flush();
        assert_eq!(table.len(), 0);

        let guard = CacheTable::reader();
        assert!(table.lookup(&guard, 0, 1, 1).is_none());
    }

    #[test]
    fn test_eviction_bounds_growth() {
        let config = CacheConfig {
            cache_threshold: 8,
            reclaim_batch: 4,
            stats_enabled: true,
        };
        let table = CacheTable::new(config);

        for i in 0..9u32 {
            insert_simple(&table, i, 0, 1, AvDecision::new(1, 1));
        }

        // The ninth allocation crossed the threshold and ran one evictor
        // pass reclaiming a full batch.
        assert!(table.len() <= 9);
        assert_eq!(table.len(), 9 - 4);
        assert_eq!(table.stats().reclaims, 4);
        assert_eq!(table.linked_count(), table.len());
    }

    #[test]
    fn test_hash_stats_text() {
        let table = table();
        insert_simple(&table, 0, 0, 1, AvDecision::new(1, 1));
        insert_simple(&table, 512, 0, 1, AvDecision::new(1, 1));

        let text = table.hash_stats_text();
        assert_eq!(text, "entries: 2\nbuckets used: 1/512\nlongest chain: 2\n");
    }

    #[test]
    fn test_lookup_during_churn() {
        use std::sync::Arc;

        let table = Arc::new(table());
        let mut handles = Vec::new();

        for t in 0..4u32 {
            let table = Arc::clone(&table);
            handles.push(std::thread::spawn(move || {
                for i in 0..1000u32 {
                    let ssid = (t * 31 + i) % 16;
                    let guard = CacheTable::reader();
                    table
                        .insert(&guard, ssid, 1, 1, AvDecision::new(i, 1), None)
                        .unwrap();
                    if let Some(node) = table.lookup(&guard, ssid, 1, 1) {
                        // A reader only ever observes a well-formed node
                        // with the key it asked for.
                        assert_eq!(node.ssid(), ssid);
                        assert_eq!(node.tsid(), 1);
                        assert_eq!(node.tclass(), 1);
                    }
                    if i % 200 == 0 {
                        table.flush();
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(table.linked_count(), table.len());
    }

    proptest! {
        #[test]
        fn prop_grant_then_revoke(initial in any::<u32>(), perms in any::<u32>()) {
            let table = table();
            insert_simple(&table, 1, 2, 3, AvDecision::new(initial, 1));
            table
                .update_node(1, 2, 3, 1, UpdateEvent::Grant { perms, cmd: None })
                .unwrap();
            table
                .update_node(1, 2, 3, 1, UpdateEvent::Revoke { perms })
                .unwrap();

            let guard = CacheTable::reader();
            let node = table.lookup(&guard, 1, 2, 3).unwrap();
            prop_assert_eq!(node.decision().allowed, initial & !perms);
        }

        #[test]
        fn prop_at_most_one_node_per_key(
            ops in proptest::collection::vec((0u8..3, 0u32..4, 0u32..4), 0..40)
        ) {
            let table = table();
            for (op, ssid, tsid) in ops {
                match op {
                    0 => insert_simple(&table, ssid, tsid, 1, AvDecision::new(ssid ^ tsid, 1)),
                    1 => {
                        let _ = table.update_node(
                            ssid,
                            tsid,
                            1,
                            1,
                            UpdateEvent::Grant { perms: 0b1, cmd: None },
                        );
                    }
                    _ => table.flush(),
                }
            }

            let mut linked = 0usize;
            for ssid in 0..4u32 {
                for tsid in 0..4u32 {
                    let count = table.chain_count(ssid, tsid, 1);
                    prop_assert!(count <= 1);
                    linked += count;
                }
            }
            prop_assert_eq!(linked, table.len());
            prop_assert_eq!(linked, table.linked_count());
        }
    }
}
