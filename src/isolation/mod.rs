//! Per-task isolated branch/worktree lifecycle and reconciliation back
//! into a shared target branch.

mod manager;
mod reconcile;

pub use manager::{Isolation, IsolationManager, IsolationReport, IsolationStatus};
pub use reconcile::{CrossConflict, ReconcileReport, Reconciler, SkippedIsolation};
