use std::fmt;

use crate::{GeneratorKind, ObjectKey};

/// Failures from the resource store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not_found: {0}")]
    NotFound(String),
    /// Version token mismatch on update.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("store: {0}")]
    Other(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DestinationError {
    #[error("there are no clusters with this name: {0}")]
    NotFound(String),
    #[error("there are multiple clusters with the same name: {name} (servers: {})", .servers.join(", "))]
    Ambiguous { name: String, servers: Vec<String> },
    #[error("cluster source: {0}")]
    Source(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GeneratorError {
    #[error("generator {0} is not available")]
    Unavailable(GeneratorKind),
    #[error("invalid {kind} generator: {reason}")]
    Invalid { kind: GeneratorKind, reason: String },
    /// The same key carries different values in combined rows.
    #[error("conflicting value for key {key:?}: {left:?} vs {right:?}")]
    Conflict { key: String, left: String, right: String },
    #[error("duplicate merge key {0}")]
    DuplicateMergeKey(String),
    #[error("{kind} generator: {message}")]
    External { kind: GeneratorKind, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("unresolved placeholder {{{{{key}}}}}")]
    Unresolved { key: String },
    #[error("render: {0}")]
    Malformed(String),
}

/// Which mutation a per-resource failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceOp {
    Create,
    Update,
    Delete,
    ReleaseFinalizer,
}

impl fmt::Display for ResourceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::ReleaseFinalizer => "release-finalizer",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceFailure {
    pub key: ObjectKey,
    pub op: ResourceOp,
    pub error: StoreError,
}

impl fmt::Display for ResourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.op, self.key, self.error)
    }
}

/// Everything a reconciliation cycle can fail with.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Generator(#[from] GeneratorError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("ApplicationSet contains applications with duplicate name: {0}")]
    DuplicateName(String),
    #[error("application {app}: unknown destination: {reason}")]
    UnknownDestination { app: String, reason: String },
    #[error("application {app}: destination name {name} resolves to {resolved}, not {server}")]
    ConflictingDestination { app: String, name: String, server: String, resolved: String },
    #[error("application {app}: {rule}")]
    PolicyViolation { app: String, rule: String },
    #[error("conflict persisted after retry: {0}")]
    StoreConflict(ObjectKey),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{} resource operation(s) failed: {}", .0.len(), join_failures(.0))]
    Resources(Vec<ResourceFailure>),
    #[error("reconciliation cancelled")]
    Cancelled,
    #[error(transparent)]
    Registry(#[from] DestinationError),
}

impl ReconcileError {
    /// Validation failures abort create/update but let the delete phase run.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::UnknownDestination { .. } | Self::ConflictingDestination { .. } | Self::PolicyViolation { .. }
        )
    }
}

fn join_failures(failures: &[ResourceFailure]) -> String {
    failures.iter().map(|f| f.to_string()).collect::<Vec<_>>().join("; ")
}
