//! # Audit Records
//!
//! Structured audit output for the decision protocol. A permission check
//! that grants audited permissions or denies auditable ones produces an
//! [`AuditRecord`], rendered in the classic single-line form:
//!
//! ```text
//! avc: denied { read write } scontext=u:r:app:s0 tcontext=u:object_r:data:s0 tclass=file permissive=0
//! ```
//!
//! Records are delivered through an [`AuditSink`]. The sink has a
//! blocking and a non-blocking emission path; a sink that cannot emit
//! without blocking refuses the non-blocking path with
//! [`AvcError::TryAgainNonblocking`].

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::decision::OperationCommand;
use crate::error::{AvcError, AvcResult};
use crate::types::{AccessVector, ObjectClass, SecurityId};

/// Whether the audited permissions were granted or denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// The requested permissions were granted.
    Granted,
    /// Some requested permissions were denied.
    Denied,
}

impl AuditOutcome {
    /// Lowercase label used in the rendered line.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Granted => "granted",
            AuditOutcome::Denied => "denied",
        }
    }
}

/// Caller-supplied context attached to an audit record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditData {
    /// Object path, when the target has one.
    pub path: Option<String>,

    /// Fine-grained operation being checked, when applicable.
    pub command: Option<OperationCommand>,

    /// Free-form comment from the caller.
    pub comment: Option<String>,
}

impl AuditData {
    /// Creates empty audit data.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches an object path.
    pub fn with_path(mut self, path: &str) -> Self {
        self.path = Some(path.to_string());
        self
    }
}

/// One audit event, ready to render.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// When the check completed.
    pub timestamp: DateTime<Utc>,

    /// Granted or denied.
    pub outcome: AuditOutcome,

    /// The permission bits being logged.
    pub audited: AccessVector,

    /// Source SID of the check.
    pub ssid: SecurityId,

    /// Target SID of the check.
    pub tsid: SecurityId,

    /// Target object class.
    pub tclass: ObjectClass,

    /// Rendered source context.
    pub scontext: String,

    /// Rendered target context.
    pub tcontext: String,

    /// Rendered class name.
    pub class_name: String,

    /// Rendered permission names for `audited`.
    pub permissions: String,

    /// True when the denial was not enforced.
    pub permissive: bool,

    /// Caller-supplied context.
    pub data: AuditData,
}

impl AuditRecord {
    /// Renders the single-line audit message.
    pub fn render(&self) -> String {
        let mut line = format!("avc: {} {{ {} }}", self.outcome.as_str(), self.permissions);
        if let Some(path) = &self.data.path {
            line.push_str(&format!(" path=\"{path}\""));
        }
        if let Some(cmd) = &self.data.command {
            line.push_str(&format!(" op={:#06x}", cmd.as_raw()));
        }
        if let Some(comment) = &self.data.comment {
            line.push_str(&format!(" comment=\"{comment}\""));
        }
        line.push_str(&format!(
            " scontext={} tcontext={} tclass={} permissive={}",
            self.scontext,
            self.tcontext,
            self.class_name,
            u8::from(self.permissive)
        ));
        line
    }
}

/// Destination for audit records.
pub trait AuditSink: Send + Sync {
    /// Emits a record, blocking as needed.
    fn emit(&self, record: &AuditRecord) -> AvcResult<()>;

    /// Emits a record without blocking. Sinks that would have to block
    /// refuse with [`AvcError::TryAgainNonblocking`].
    fn emit_nonblocking(&self, record: &AuditRecord) -> AvcResult<()> {
        let _ = record;
        Err(AvcError::TryAgainNonblocking)
    }
}

/// Default sink forwarding rendered records to the `log` facade.
///
/// Denials log at warn, grants at info. Both paths are non-blocking.
#[derive(Debug, Default)]
pub struct LogAuditSink;

impl LogAuditSink {
    /// Creates the sink.
    pub fn new() -> Self {
        Self
    }
}

impl AuditSink for LogAuditSink {
    fn emit(&self, record: &AuditRecord) -> AvcResult<()> {
        match record.outcome {
            AuditOutcome::Denied => log::warn!("{}", record.render()),
            AuditOutcome::Granted => log::info!("{}", record.render()),
        }
        Ok(())
    }

    fn emit_nonblocking(&self, record: &AuditRecord) -> AvcResult<()> {
        self.emit(record)
    }
}

/// Sink collecting records in memory, for tests and inspection.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
    nonblocking: bool,
}

impl MemoryAuditSink {
    /// Creates a sink whose non-blocking path succeeds.
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            nonblocking: true,
        }
    }

    /// Creates a sink that refuses non-blocking emission.
    pub fn blocking_only() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            nonblocking: false,
        }
    }

    /// Snapshot of the collected records.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    /// Number of collected records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// True when nothing has been collected.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl AuditSink for MemoryAuditSink {
    fn emit(&self, record: &AuditRecord) -> AvcResult<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }

    fn emit_nonblocking(&self, record: &AuditRecord) -> AvcResult<()> {
        if !self.nonblocking {
            return Err(AvcError::TryAgainNonblocking);
        }
        self.emit(record)
    }
}
