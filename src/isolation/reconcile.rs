use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::manager::IsolationManager;
use crate::error::Result;

/// A file touched by two or more isolations in the same batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossConflict {
    pub file: String,
    pub isolation_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedIsolation {
    pub isolation_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub merged: Vec<String>,
    pub skipped: Vec<SkippedIsolation>,
    pub cross_conflicts: Vec<CrossConflict>,
}

/// Merges a batch of isolations back into a shared target branch,
/// refusing to merge anything involved in a cross-isolation conflict or
/// failing its individual integrity/cleanliness checks.
pub struct Reconciler<'a> {
    manager: &'a IsolationManager,
}

impl<'a> Reconciler<'a> {
    pub fn new(manager: &'a IsolationManager) -> Self {
        Self { manager }
    }

    /// Any file touched by two or more isolations is a conflict entry
    /// naming all affected isolation ids. An isolation whose files cannot
    /// be read contributes no conflicts; `merge_batch` reports it as
    /// skipped when its integrity check fails the same way.
    pub async fn detect_cross_conflicts(&self, isolation_ids: &[String]) -> Result<Vec<CrossConflict>> {
        // BTreeMap keeps conflict ordering stable for reporting.
        let mut touched: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for id in isolation_ids {
            match self.manager.changed_files(id).await {
                Ok(files) => {
                    for file in files {
                        touched.entry(file).or_default().push(id.clone());
                    }
                }
                Err(e) => {
                    warn!(isolation_id = %id, error = %e, "Cannot read changed files, isolation excluded from conflict detection");
                }
            }
        }

        Ok(touched
            .into_iter()
            .filter(|(_, ids)| ids.len() >= 2)
            .map(|(file, isolation_ids)| CrossConflict {
                file,
                isolation_ids,
            })
            .collect())
    }

    /// Sequentially merges eligible isolations into `target_ref`. An
    /// isolation is eligible when it has no cross-conflicts, passes
    /// integrity validation, and reports a clean individual status.
    /// Ineligible or failed isolations are reported, never force-merged.
    pub async fn merge_batch(
        &self,
        isolation_ids: &[String],
        target_ref: &str,
    ) -> Result<ReconcileReport> {
        let cross_conflicts = self.detect_cross_conflicts(isolation_ids).await?;
        let mut report = ReconcileReport {
            cross_conflicts: cross_conflicts.clone(),
            ..Default::default()
        };

        for id in isolation_ids {
            if let Some(conflict) = cross_conflicts
                .iter()
                .find(|c| c.isolation_ids.contains(id))
            {
                report.skipped.push(SkippedIsolation {
                    isolation_id: id.clone(),
                    reason: format!(
                        "cross-isolation conflict on {} with {:?}",
                        conflict.file,
                        conflict
                            .isolation_ids
                            .iter()
                            .filter(|other| *other != id)
                            .collect::<Vec<_>>()
                    ),
                });
                continue;
            }

            if let Err(e) = self.manager.validate_integrity(id).await {
                warn!(isolation_id = %id, error = %e, "Integrity check failed, skipping merge");
                report.skipped.push(SkippedIsolation {
                    isolation_id: id.clone(),
                    reason: e.to_string(),
                });
                continue;
            }

            // A status failure skips this isolation only; the rest of the
            // batch still merges.
            match self.manager.status(id).await {
                Ok(status) if status.clean => {}
                Ok(_) => {
                    report.skipped.push(SkippedIsolation {
                        isolation_id: id.clone(),
                        reason: "uncommitted changes or unresolved conflicts".into(),
                    });
                    continue;
                }
                Err(e) => {
                    warn!(isolation_id = %id, error = %e, "Status check failed, skipping merge");
                    report.skipped.push(SkippedIsolation {
                        isolation_id: id.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            }

            match self.manager.merge_into(id, target_ref).await {
                Ok(()) => report.merged.push(id.clone()),
                Err(e) => {
                    report.skipped.push(SkippedIsolation {
                        isolation_id: id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            merged = report.merged.len(),
            skipped = report.skipped.len(),
            conflicts = report.cross_conflicts.len(),
            target = %target_ref,
            "Reconciliation complete"
        );

        Ok(report)
    }
}
