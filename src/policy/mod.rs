//! # Policy Change Callbacks
//!
//! External subsystems register callbacks to be notified of policy
//! changes: a full reset (policy reload) or an incremental mutation
//! (grant, revoke, audit toggles). Registration happens at init time and
//! is append-only; callbacks are never unregistered.
//!
//! Reset notifications are global and consult only the event mask.
//! Incremental notifications are filtered by the registered SID, class,
//! and permission filters, with [`SID_WILDCARD`] matching any SID.

use parking_lot::RwLock;

use crate::error::AvcResult;
use crate::types::{AccessVector, ObjectClass, PolicySeqno, SecurityId, SID_WILDCARD};

/// Event: permissions granted to an entry.
pub const EVENT_GRANT: u32 = 1;

/// Event: permissions revoked unless in active use.
pub const EVENT_TRY_REVOKE: u32 = 2;

/// Event: permissions revoked unconditionally.
pub const EVENT_REVOKE: u32 = 4;

/// Event: policy reload; the cache has been flushed.
pub const EVENT_RESET: u32 = 8;

/// Event: audit-on-grant enabled for permissions.
pub const EVENT_AUDITALLOW_ENABLE: u32 = 16;

/// Event: audit-on-grant disabled for permissions.
pub const EVENT_AUDITALLOW_DISABLE: u32 = 32;

/// Event: audit-on-deny enabled for permissions.
pub const EVENT_AUDITDENY_ENABLE: u32 = 64;

/// Event: audit-on-deny disabled for permissions.
pub const EVENT_AUDITDENY_DISABLE: u32 = 128;

/// Mask covering every event.
pub const EVENT_ALL: u32 = 0xff;

/// Wildcard object class filter. Class tags issued by the security
/// server start at 1.
pub const CLASS_WILDCARD: ObjectClass = 0;

/// Description of one policy change, passed to callbacks.
#[derive(Debug, Clone, Copy)]
pub struct PolicyChange {
    /// The event that occurred (`EVENT_*`).
    pub event: u32,

    /// Policy version after the change.
    pub seqno: PolicySeqno,

    /// Source SID the change targets; [`SID_WILDCARD`] for global
    /// events.
    pub ssid: SecurityId,

    /// Target SID the change targets.
    pub tsid: SecurityId,

    /// Object class the change targets; [`CLASS_WILDCARD`] for global
    /// events.
    pub tclass: ObjectClass,

    /// Permissions the change targets; 0 for global events.
    pub perms: AccessVector,
}

impl PolicyChange {
    /// Builds the global change descriptor for a policy reset.
    pub fn reset(seqno: PolicySeqno) -> Self {
        Self {
            event: EVENT_RESET,
            seqno,
            ssid: SID_WILDCARD,
            tsid: SID_WILDCARD,
            tclass: CLASS_WILDCARD,
            perms: 0,
        }
    }
}

/// Callback invoked on matching policy changes.
pub type PolicyCallback = Box<dyn Fn(&PolicyChange) -> AvcResult<()> + Send + Sync>;

struct CallbackEntry {
    callback: PolicyCallback,
    events: u32,
    ssid: SecurityId,
    tsid: SecurityId,
    tclass: ObjectClass,
    perms: AccessVector,
}

fn sid_matches(filter: SecurityId, actual: SecurityId) -> bool {
    filter == SID_WILDCARD || actual == SID_WILDCARD || filter == actual
}

impl CallbackEntry {
    fn matches(&self, change: &PolicyChange) -> bool {
        if self.events & change.event == 0 {
            return false;
        }
        if !sid_matches(self.ssid, change.ssid) || !sid_matches(self.tsid, change.tsid) {
            return false;
        }
        if self.tclass != CLASS_WILDCARD
            && change.tclass != CLASS_WILDCARD
            && self.tclass != change.tclass
        {
            return false;
        }
        // A zero permission filter matches any permissions; otherwise
        // the filters must intersect.
        if self.perms != 0 && change.perms != 0 && self.perms & change.perms == 0 {
            return false;
        }
        true
    }
}

/// Append-only table of registered policy callbacks.
#[derive(Default)]
pub struct CallbackTable {
    entries: RwLock<Vec<CallbackEntry>>,
}

impl CallbackTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback for the events in `events`, filtered by
    /// SID, class, and permissions. Registration is one-shot; there is
    /// no unregistration.
    pub fn add(
        &self,
        callback: PolicyCallback,
        events: u32,
        ssid: SecurityId,
        tsid: SecurityId,
        tclass: ObjectClass,
        perms: AccessVector,
    ) {
        self.entries.write().push(CallbackEntry {
            callback,
            events,
            ssid,
            tsid,
            tclass,
            perms,
        });
    }

    /// Number of registered callbacks.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when no callback is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Invokes every callback matching `change`. All matching callbacks
    /// run; the first error is returned.
    pub fn notify(&self, change: &PolicyChange) -> AvcResult<()> {
        let entries = self.entries.read();
        let mut result = Ok(());
        for entry in entries.iter().filter(|e| e.matches(change)) {
            if let Err(err) = (entry.callback)(change) {
                log::warn!(
                    "policy callback failed for event {:#x}: {}",
                    change.event,
                    err
                );
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }
}
