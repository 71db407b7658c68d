//! Yoke apply: the reconciler behind takeoff, descent and mayday, plus the
//! read-only turbulence (drift) and blackbox (inspect) views.
//!
//! The cluster is not transactional. A pass reports a per-resource outcome
//! and only a fully successful pass moves the active revision.

#![forbid(unsafe_code)]

pub mod diff;
mod drift;
mod exec;
mod inspect;
mod locks;
pub mod plan;
mod pilot;

pub use diff::{diff_documents, field_diff, FieldChange};
pub use drift::{DriftEntry, DriftReport, DriftState};
pub use exec::{execute, ExecOptions};
pub use inspect::{Inspection, RevisionChange, RevisionDiff, RevisionDiffEntry};
pub use locks::ReleaseLocks;
pub use pilot::Pilot;
pub use plan::{Action, Plan, Step};
