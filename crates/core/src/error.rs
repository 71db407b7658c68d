use crate::{ReconcileReport, ReleaseRef, ResourceIdentifier};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("render failed: {0}")]
    RenderFailure(String),
    #[error("render timed out after {0:?}")]
    RenderTimeout(std::time::Duration),
    #[error("render cancelled")]
    RenderCancelled,
    #[error("failed to decode render output: {0}")]
    DecodeFailure(String),
    #[error("invalid resource at index {index}: {reason}")]
    InvalidResource { index: usize, reason: String },
    #[error("ambiguous desired state: {0} emitted more than once")]
    AmbiguousResource(ResourceIdentifier),

    #[error("lookup forbidden: {0}")]
    LookupForbidden(String),
    #[error("lookup not found: {0}")]
    LookupNotFound(String),
    #[error("lookup unauthenticated: {0}")]
    LookupUnauthenticated(String),
    #[error("lookup error: {0}")]
    LookupError(String),
    #[error("host/guest protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("{}", reconcile_message(.0))]
    ReconcileFailure(Box<ReconcileReport>),
    #[error("release not found: {0}")]
    NotFoundRelease(ReleaseRef),
    #[error("revision {sequence} not found for release {release}")]
    NotFoundRevision { release: ReleaseRef, sequence: u64 },
    #[error("concurrent modification of release {release}: {reason}")]
    ConcurrentModification { release: ReleaseRef, reason: String },

    #[error("store error: {0}")]
    Store(String),
    #[error("cluster error: {0}")]
    Cluster(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Printed, but the command still succeeds.
    #[error("{0}")]
    Warning(String),
}

impl Error {
    pub fn is_warning(&self) -> bool {
        matches!(self, Error::Warning(_))
    }

    /// Failures that happen before the cluster is touched.
    pub fn is_render_error(&self) -> bool {
        matches!(
            self,
            Error::RenderFailure(_)
                | Error::RenderTimeout(_)
                | Error::RenderCancelled
                | Error::DecodeFailure(_)
                | Error::InvalidResource { .. }
                | Error::AmbiguousResource(_)
                | Error::ProtocolViolation(_)
        )
    }
}

fn reconcile_message(report: &ReconcileReport) -> String {
    let failed = report.failed().count();
    let mut msg = format!("reconcile of {} failed: {} operation(s) failed", report.release, failed);
    for r in report.failed() {
        msg.push_str(&format!("\n  {}: {}", r.id, r.outcome));
    }
    msg
}
