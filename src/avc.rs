//! # Decision Protocol Engine
//!
//! [`AccessVectorCache`] ties the concurrent cache, the security server,
//! the audit sink, and the policy callback table into the permission
//! check protocol:
//!
//! 1. Probe the cache inside a reader critical section.
//! 2. On miss, compute the decision through the security server
//!    (outside the reader section) and insert it.
//! 3. Mask the request against the decision; on denial, consult
//!    enforcement state and, for permissive decisions, patch the cached
//!    entry to record the grant.
//! 4. Emit an audit record when the decision's audit bitmaps call for
//!    one.
//!
//! Cache-management failures never fail a permission check: the compute
//! path always yields an answer, so a refused insert or a lost update
//! only costs a future cache hit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use once_cell::sync::OnceCell;

use crate::audit::{AuditData, AuditOutcome, AuditRecord, AuditSink};
use crate::cache::{CacheConfig, CacheStatsSnapshot, CacheTable, UpdateEvent};
use crate::decision::{AvDecision, OperationCommand, OperationLookup, OperationSlice};
use crate::error::{AvcError, AvcResult};
use crate::policy::{
    CallbackTable, PolicyCallback, PolicyChange, EVENT_AUDITALLOW_DISABLE,
    EVENT_AUDITALLOW_ENABLE, EVENT_AUDITDENY_DISABLE, EVENT_AUDITDENY_ENABLE, EVENT_GRANT,
    EVENT_REVOKE, EVENT_TRY_REVOKE,
};
use crate::server::SecurityServer;
use crate::types::{AccessVector, ObjectClass, PolicySeqno, SecurityId};

/// Check flag: on denial, fail immediately; never self-patch the cache,
/// even for a permissive decision.
pub const AVC_STRICT: u32 = 0x0001;

/// Check flag: a grant patch may also record the checked fine-grained
/// command in the entry's operation table.
pub const AVC_OPERATION_CMD: u32 = 0x0002;

/// Check flag: audit must not block; a sink that would have to block
/// refuses with [`AvcError::TryAgainNonblocking`].
pub const AVC_NONBLOCKING: u32 = 0x0004;

static GLOBAL_CACHE: OnceCell<AccessVectorCache> = OnceCell::new();

/// The access vector cache: cached authorisation decisions plus the
/// protocol that serves, patches, audits, and invalidates them.
///
/// Lifecycle is create, serve, disable. The collaborators are injected,
/// so tests run against in-memory implementations; a process-wide
/// instance can be installed with [`install_global`].
pub struct AccessVectorCache {
    cache: CacheTable,
    callbacks: CallbackTable,
    server: Arc<dyn SecurityServer>,
    sink: Arc<dyn AuditSink>,
    disabled: AtomicBool,
}

impl AccessVectorCache {
    /// Creates a cache with the default configuration.
    pub fn new(server: Arc<dyn SecurityServer>, sink: Arc<dyn AuditSink>) -> Self {
        Self::with_config(CacheConfig::default(), server, sink)
    }

    /// Creates a cache with an explicit configuration.
    pub fn with_config(
        config: CacheConfig,
        server: Arc<dyn SecurityServer>,
        sink: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            cache: CacheTable::new(config),
            callbacks: CallbackTable::new(),
            server,
            sink,
            disabled: AtomicBool::new(false),
        }
    }

    /// Checks `requested` permissions for the triple without auditing.
    ///
    /// Returns the result code together with a copy of the decision the
    /// check was made against, so the caller can audit later.
    pub fn has_perm_noaudit(
        &self,
        ssid: SecurityId,
        tsid: SecurityId,
        tclass: ObjectClass,
        requested: AccessVector,
        flags: u32,
    ) -> (AvcResult<()>, AvDecision) {
        debug_assert!(requested != 0);
        let avd = {
            let guard = CacheTable::reader();
            match self.cache.lookup(&guard, ssid, tsid, tclass) {
                Some(node) => node.decision(),
                None => {
                    drop(guard);
                    match self.compute_and_insert(ssid, tsid, tclass) {
                        Ok(avd) => avd,
                        Err(err) => return (Err(err), AvDecision::default()),
                    }
                }
            }
        };

        let denied = avd.denied(requested);
        let rc = if denied != 0 {
            self.denied(ssid, tsid, tclass, requested, None, flags, &avd)
        } else {
            Ok(())
        };
        (rc, avd)
    }

    /// Checks `requested` permissions and audits the outcome.
    pub fn has_perm(
        &self,
        ssid: SecurityId,
        tsid: SecurityId,
        tclass: ObjectClass,
        requested: AccessVector,
        auditdata: &AuditData,
    ) -> AvcResult<()> {
        self.has_perm_flags(ssid, tsid, tclass, requested, auditdata, 0)
    }

    /// Checks `requested` permissions and audits the outcome, honouring
    /// `AVC_*` check flags.
    pub fn has_perm_flags(
        &self,
        ssid: SecurityId,
        tsid: SecurityId,
        tclass: ObjectClass,
        requested: AccessVector,
        auditdata: &AuditData,
        flags: u32,
    ) -> AvcResult<()> {
        let (rc, avd) = self.has_perm_noaudit(ssid, tsid, tclass, requested, flags);
        self.audit(
            ssid, tsid, tclass, requested, &avd, &rc, None, None, auditdata, flags,
        )?;
        rc
    }

    /// Checks `requested` permissions for a fine-grained command and
    /// audits the outcome.
    ///
    /// The coarse decision is consulted first; the entry's operation
    /// table then constrains the specific command. Decisions for a
    /// command's type are computed at most once per entry and attached
    /// so later checks take the fast path.
    pub fn has_operation(
        &self,
        ssid: SecurityId,
        tsid: SecurityId,
        tclass: ObjectClass,
        requested: AccessVector,
        cmd: OperationCommand,
        auditdata: &AuditData,
    ) -> AvcResult<()> {
        debug_assert!(requested != 0);
        let mut auditdata = auditdata.clone();
        auditdata.command = Some(cmd);

        let looked_up = {
            let guard = CacheTable::reader();
            self.cache
                .lookup(&guard, ssid, tsid, tclass)
                .map(|node| (node.decision(), node.probe_operation(cmd)))
        };
        let (mut avd, probe) = match looked_up {
            Some(pair) => pair,
            None => {
                let (avd, ops) = self.server.compute_av(ssid, tsid, tclass)?;
                let guard = CacheTable::reader();
                let installed = if self.is_disabled() {
                    None
                } else {
                    self.cache
                        .insert(
                            &guard,
                            ssid,
                            tsid,
                            tclass,
                            avd,
                            ops.has_constraints().then_some(&ops),
                        )
                        .ok()
                        .flatten()
                };
                let probe = match installed {
                    Some(node) => node.probe_operation(cmd),
                    None => ops.probe(cmd),
                };
                (avd, probe)
            }
        };

        let mut slice: Option<OperationSlice> = None;
        match probe {
            OperationLookup::Unconstrained => {}
            OperationLookup::Decided(copied) => slice = Some(copied),
            OperationLookup::NotComputed => {
                // Never computed for this type: deny without consulting
                // the security server.
                avd.allowed &= !requested;
            }
            OperationLookup::Pending => {
                let decision =
                    self.server
                        .compute_operation(ssid, tsid, tclass, cmd.op_type)?;
                if !self.is_disabled() {
                    match self.cache.update_node(
                        ssid,
                        tsid,
                        tclass,
                        avd.seqno,
                        UpdateEvent::AddOperation(&decision),
                    ) {
                        Ok(()) | Err(AvcError::NotFound) => {}
                        Err(err) => log::debug!("attaching operation decision failed: {err}"),
                    }
                }
                slice = Some(decision.slice_for(cmd.op_num));
            }
        }

        if let Some(copied) = &slice {
            if !copied.allows(cmd.op_num) {
                avd.allowed &= !requested;
            }
        }

        let denied = avd.denied(requested);
        let rc = if denied != 0 {
            self.denied(
                ssid,
                tsid,
                tclass,
                requested,
                Some(cmd),
                AVC_OPERATION_CMD,
                &avd,
            )
        } else {
            Ok(())
        };

        self.audit(
            ssid,
            tsid,
            tclass,
            requested,
            &avd,
            &rc,
            slice.as_ref(),
            Some(cmd),
            &auditdata,
            0,
        )?;
        rc
    }

    /// Flushes the cache for a policy reload, notifies reset
    /// subscribers, and raises the latest observed policy version.
    ///
    /// Callback failures are collected (first error wins) and returned,
    /// but the reset itself always completes.
    pub fn ss_reset(&self, seqno: PolicySeqno) -> AvcResult<()> {
        if self.is_disabled() {
            return Err(AvcError::Disabled);
        }
        log::info!("access vector cache reset for policy {seqno}");
        self.cache.flush();
        let rc = self.callbacks.notify(&PolicyChange::reset(seqno));
        self.cache.raise_seqno(seqno);
        rc
    }

    /// Grants permissions on the cached entry at `seqno` and notifies
    /// matching subscribers.
    pub fn ss_grant(
        &self,
        ssid: SecurityId,
        tsid: SecurityId,
        tclass: ObjectClass,
        perms: AccessVector,
        seqno: PolicySeqno,
    ) -> AvcResult<()> {
        self.ss_apply(
            EVENT_GRANT,
            ssid,
            tsid,
            tclass,
            perms,
            seqno,
            UpdateEvent::Grant { perms, cmd: None },
        )
    }

    /// Revokes permissions on the cached entry at `seqno` and notifies
    /// matching subscribers.
    pub fn ss_revoke(
        &self,
        ssid: SecurityId,
        tsid: SecurityId,
        tclass: ObjectClass,
        perms: AccessVector,
        seqno: PolicySeqno,
    ) -> AvcResult<()> {
        self.ss_apply(
            EVENT_REVOKE,
            ssid,
            tsid,
            tclass,
            perms,
            seqno,
            UpdateEvent::Revoke { perms },
        )
    }

    /// Revokes permissions unless in active use. The cache cannot tell
    /// usage apart, so the entry is patched like a revoke; subscribers
    /// may retain what they cannot release.
    pub fn ss_try_revoke(
        &self,
        ssid: SecurityId,
        tsid: SecurityId,
        tclass: ObjectClass,
        perms: AccessVector,
        seqno: PolicySeqno,
    ) -> AvcResult<()> {
        self.ss_apply(
            EVENT_TRY_REVOKE,
            ssid,
            tsid,
            tclass,
            perms,
            seqno,
            UpdateEvent::TryRevoke { perms },
        )
    }

    /// Enables audit-on-grant for permissions on the cached entry.
    pub fn ss_auditallow_enable(
        &self,
        ssid: SecurityId,
        tsid: SecurityId,
        tclass: ObjectClass,
        perms: AccessVector,
        seqno: PolicySeqno,
    ) -> AvcResult<()> {
        self.ss_apply(
            EVENT_AUDITALLOW_ENABLE,
            ssid,
            tsid,
            tclass,
            perms,
            seqno,
            UpdateEvent::AuditAllowEnable { perms },
        )
    }

    /// Disables audit-on-grant for permissions on the cached entry.
    pub fn ss_auditallow_disable(
        &self,
        ssid: SecurityId,
        tsid: SecurityId,
        tclass: ObjectClass,
        perms: AccessVector,
        seqno: PolicySeqno,
    ) -> AvcResult<()> {
        self.ss_apply(
            EVENT_AUDITALLOW_DISABLE,
            ssid,
            tsid,
            tclass,
            perms,
            seqno,
            UpdateEvent::AuditAllowDisable { perms },
        )
    }

    /// Enables audit-on-deny for permissions on the cached entry.
    pub fn ss_auditdeny_enable(
        &self,
        ssid: SecurityId,
        tsid: SecurityId,
        tclass: ObjectClass,
        perms: AccessVector,
        seqno: PolicySeqno,
    ) -> AvcResult<()> {
        self.ss_apply(
            EVENT_AUDITDENY_ENABLE,
            ssid,
            tsid,
            tclass,
            perms,
            seqno,
            UpdateEvent::AuditDenyEnable { perms },
        )
    }

    /// Disables audit-on-deny for permissions on the cached entry.
    pub fn ss_auditdeny_disable(
        &self,
        ssid: SecurityId,
        tsid: SecurityId,
        tclass: ObjectClass,
        perms: AccessVector,
        seqno: PolicySeqno,
    ) -> AvcResult<()> {
        self.ss_apply(
            EVENT_AUDITDENY_DISABLE,
            ssid,
            tsid,
            tclass,
            perms,
            seqno,
            UpdateEvent::AuditDenyDisable { perms },
        )
    }

    /// Registers a policy-change callback. Registration is append-only
    /// and happens at init time; callbacks are never unregistered.
    pub fn add_callback(
        &self,
        callback: PolicyCallback,
        events: u32,
        ssid: SecurityId,
        tsid: SecurityId,
        tclass: ObjectClass,
        perms: AccessVector,
    ) {
        self.callbacks.add(callback, events, ssid, tsid, tclass, perms);
    }

    /// The newest policy version whose invalidation has been observed.
    pub fn policy_seqno(&self) -> PolicySeqno {
        self.cache.latest_seqno()
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// True when the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Renders the bucket occupancy summary.
    pub fn hash_stats_text(&self) -> String {
        self.cache.hash_stats_text()
    }

    /// Copies the statistics counters.
    pub fn stats_snapshot(&self) -> CacheStatsSnapshot {
        self.cache.stats()
    }

    /// Disables the cache: flushes it and stops caching and patching.
    ///
    /// Permission checks keep working, computing through the security
    /// server on every call, but management operations return
    /// [`AvcError::Disabled`]. There is no re-enable.
    pub fn disable(&self) {
        log::warn!("access vector cache disabled");
        self.disabled.store(true, Ordering::Relaxed);
        self.cache.flush();
    }

    fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    /// Computes a decision through the security server and installs it.
    /// A refused or failed insert is not an error; the computed decision
    /// is used either way.
    fn compute_and_insert(
        &self,
        ssid: SecurityId,
        tsid: SecurityId,
        tclass: ObjectClass,
    ) -> AvcResult<AvDecision> {
        let (avd, ops) = self.server.compute_av(ssid, tsid, tclass)?;
        if !self.is_disabled() {
            let guard = CacheTable::reader();
            if let Err(err) = self.cache.insert(
                &guard,
                ssid,
                tsid,
                tclass,
                avd,
                ops.has_constraints().then_some(&ops),
            ) {
                log::debug!("cache insert failed for ({ssid}, {tsid}, {tclass}): {err}");
            }
        }
        Ok(avd)
    }

    /// Decides what a denial means: strict and enforcing denials fail;
    /// permissive ones succeed and patch the cached entry to record the
    /// grant.
    #[allow(clippy::too_many_arguments)]
    fn denied(
        &self,
        ssid: SecurityId,
        tsid: SecurityId,
        tclass: ObjectClass,
        requested: AccessVector,
        cmd: Option<OperationCommand>,
        flags: u32,
        avd: &AvDecision,
    ) -> AvcResult<()> {
        if flags & AVC_STRICT != 0 {
            return Err(AvcError::PermissionDenied);
        }
        if self.server.enforcing() && !avd.is_permissive() {
            return Err(AvcError::PermissionDenied);
        }
        if !self.is_disabled() {
            let cmd = (flags & AVC_OPERATION_CMD != 0).then_some(cmd).flatten();
            match self.cache.update_node(
                ssid,
                tsid,
                tclass,
                avd.seqno,
                UpdateEvent::Grant {
                    perms: requested,
                    cmd,
                },
            ) {
                Ok(()) | Err(AvcError::NotFound) => {}
                Err(err) => log::debug!("grant patch failed: {err}"),
            }
        }
        Ok(())
    }

    /// Emits an audit record when the decision's audit bitmaps call for
    /// one. A fine-grained decision slice further gates the record for
    /// the checked command.
    #[allow(clippy::too_many_arguments)]
    fn audit(
        &self,
        ssid: SecurityId,
        tsid: SecurityId,
        tclass: ObjectClass,
        requested: AccessVector,
        avd: &AvDecision,
        rc: &AvcResult<()>,
        slice: Option<&OperationSlice>,
        cmd: Option<OperationCommand>,
        auditdata: &AuditData,
        flags: u32,
    ) -> AvcResult<()> {
        let denied = avd.denied(requested);
        let (outcome, audited) = if denied != 0 || rc.is_err() {
            let denied_bits = if denied != 0 { denied } else { requested };
            let mut audited = denied_bits & avd.auditdeny;
            if let (Some(slice), Some(cmd)) = (slice, cmd) {
                if slice.suppress_deny_audit(cmd.op_num) {
                    audited = 0;
                }
            }
            (AuditOutcome::Denied, audited)
        } else {
            let mut audited = requested & avd.auditallow;
            if let (Some(slice), Some(cmd)) = (slice, cmd) {
                if !slice.audit_on_allow(cmd.op_num) {
                    audited = 0;
                }
            }
            (AuditOutcome::Granted, audited)
        };
        if audited == 0 {
            return Ok(());
        }

        let class_map = self.server.class_map();
        let record = AuditRecord {
            timestamp: Utc::now(),
            outcome,
            audited,
            ssid,
            tsid,
            tclass,
            scontext: self
                .server
                .sid_to_context(ssid)
                .unwrap_or_else(|_| "<unknown>".to_string()),
            tcontext: self
                .server
                .sid_to_context(tsid)
                .unwrap_or_else(|_| "<unknown>".to_string()),
            class_name: class_map.class_name(tclass),
            permissions: class_map.permission_names(tclass, audited),
            permissive: outcome == AuditOutcome::Denied && rc.is_ok(),
            data: auditdata.clone(),
        };

        if flags & AVC_NONBLOCKING != 0 {
            self.sink.emit_nonblocking(&record)
        } else {
            self.sink.emit(&record)
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn ss_apply(
        &self,
        event: u32,
        ssid: SecurityId,
        tsid: SecurityId,
        tclass: ObjectClass,
        perms: AccessVector,
        seqno: PolicySeqno,
        update: UpdateEvent<'_>,
    ) -> AvcResult<()> {
        if self.is_disabled() {
            return Err(AvcError::Disabled);
        }
        match self.cache.update_node(ssid, tsid, tclass, seqno, update) {
            // A missing entry is benign: there is nothing to patch.
            Ok(()) | Err(AvcError::NotFound) => {}
            Err(err) => return Err(err),
        }
        self.callbacks.notify(&PolicyChange {
            event,
            seqno,
            ssid,
            tsid,
            tclass,
            perms,
        })
    }
}

/// Installs the process-wide cache instance. Fails if one is already
/// installed, returning the rejected instance.
pub fn install_global(avc: AccessVectorCache) -> Result<(), AccessVectorCache> {
    GLOBAL_CACHE.set(avc)
}

/// The process-wide cache instance, if one has been installed.
pub fn global() -> Option<&'static AccessVectorCache> {
    GLOBAL_CACHE.get()
}
