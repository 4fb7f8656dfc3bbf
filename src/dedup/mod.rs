mod grouper;
mod migrator;
mod selector;

pub use grouper::IdentityGrouper;
pub use migrator::{GroupOutcome, ReferenceAction, ReferenceMigrator};
pub use selector::{Selection, SurvivorScore, SurvivorSelector};

use log::{info, warn};
use rusqlite::Connection;
use serde::Serialize;

use crate::audit::{DedupLog, DedupLogSummary, DedupStatus};
use crate::batch::{BatchRunner, ScaleGuard};
use crate::config::EngineConfig;
use crate::engine::{ApplyOutcome, OperationName, RunContext, Scope};
use crate::error::CatMergeError;
use crate::items::{IdentityKey, Item};
use crate::references::References;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberScore {
    pub item_id: i64,
    pub score: SurvivorScore,
}

/// A set of items sharing one identity key, with the survivor already chosen
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateGroup {
    pub identity_key: IdentityKey,
    pub member_ids: Vec<i64>,
    pub survivor_id: i64,
    pub loser_ids: Vec<i64>,
    pub members: Vec<MemberScore>,
}

impl DuplicateGroup {
    fn label(&self) -> String {
        format!("group {} [{}]", self.survivor_id, self.identity_key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DedupPlan {
    pub scope: Scope,
    pub groups: Vec<DuplicateGroup>,
    pub loser_count: usize,
    pub referenced_loser_count: usize,
}

impl DedupPlan {
    /// Read-only. Groups the scope's duplicates and picks a survivor for each.
    pub fn build(conn: &Connection, scope: Scope) -> Result<Self, CatMergeError> {
        scope.validate(conn)?;

        let candidates = Item::duplicate_candidates(conn, scope.container_id())?;
        let candidate_ids: Vec<i64> = candidates.iter().map(Item::item_id).collect();
        let referenced = References::referenced_item_ids(conn, &candidate_ids)?;

        let mut groups = Vec::new();
        let mut loser_count = 0;
        let mut referenced_loser_count = 0;

        for (identity_key, members) in IdentityGrouper::group(candidates) {
            let Some(selection) = SurvivorSelector::select(&members, &referenced) else {
                continue;
            };

            loser_count += selection.loser_ids.len();
            referenced_loser_count += selection
                .loser_ids
                .iter()
                .filter(|id| referenced.contains(id))
                .count();

            groups.push(DuplicateGroup {
                identity_key,
                member_ids: members.iter().map(Item::item_id).collect(),
                survivor_id: selection.survivor_id,
                loser_ids: selection.loser_ids,
                members: members
                    .iter()
                    .map(|item| MemberScore {
                        item_id: item.item_id(),
                        score: SurvivorSelector::score(item, referenced.contains(&item.item_id())),
                    })
                    .collect(),
            });
        }

        Ok(DedupPlan {
            scope,
            groups,
            loser_count,
            referenced_loser_count,
        })
    }
}

pub struct Deduplicator;

impl Deduplicator {
    /// Recompute the plan and apply it in bounded batches.
    ///
    /// A whole-catalog run must stay under the scale threshold and carry the
    /// confirmation phrase. A failing batch is rolled back and halts the run;
    /// earlier batches stay committed and the outcome reports how far it got.
    pub fn apply(
        conn: &Connection,
        ctx: &RunContext,
        config: &EngineConfig,
        confirmation: Option<&str>,
    ) -> Result<ApplyOutcome, CatMergeError> {
        ctx.ensure_apply()?;

        let plan = DedupPlan::build(conn, ctx.scope())?;

        if ctx.scope().is_unbounded() {
            ScaleGuard::check(ctx.scope(), plan.groups.len(), config.max_unscoped_groups())?;
            if confirmation != Some(config.confirmation_phrase()) {
                warn!(
                    "Whole-catalog dedup of {} groups rejected: confirmation phrase absent or mismatched",
                    plan.groups.len()
                );
                return Err(CatMergeError::Conflict {
                    conflict_count: plan.groups.len(),
                    message: format!(
                        "a whole-catalog dedup touches {} group(s); pass the confirmation phrase or narrow the scope",
                        plan.groups.len()
                    ),
                });
            }
        }

        info!(
            "Dedup apply by '{}' over {}: {} group(s), {} item(s) to delete",
            ctx.initiator(),
            ctx.scope(),
            plan.groups.len(),
            plan.loser_count
        );

        let log_id = DedupLog::begin(conn, ctx.initiator(), ctx.scope().container_id(), plan.groups.len())?;

        let report = BatchRunner::new(conn, ctx.batch_size()).run(&plan.groups, DuplicateGroup::label, |c, group| {
            let outcome = ReferenceMigrator::migrate_group(c, group)?;
            DedupLog::record_group(c, log_id, &outcome)?;
            Ok(outcome)
        });

        let summary = DedupLogSummary {
            processed_groups: report.committed.len(),
            deleted_count: report.committed.iter().map(|o| o.deleted_ids.len()).sum(),
            moved_count: report.committed.iter().map(GroupOutcome::moved_count).sum(),
            merged_count: report.committed.iter().map(GroupOutcome::merged_count).sum(),
            batches_committed: report.batches_committed,
            status: if report.failure.is_some() {
                DedupStatus::Halted
            } else {
                DedupStatus::Completed
            },
            failure_detail: report.failure.as_ref().map(|f| f.to_string()),
        };
        DedupLog::finish(conn, log_id, &summary)?;

        info!(
            "Dedup log {} {}: {} group(s), {} deleted, {} moved, {} merged",
            log_id,
            summary.status,
            summary.processed_groups,
            summary.deleted_count,
            summary.moved_count,
            summary.merged_count
        );

        Ok(ApplyOutcome {
            operation: OperationName::Dedup,
            log_id,
            status: summary.status.to_string(),
            processed_count: summary.processed_groups,
            deleted_count: summary.deleted_count,
            merged_count: summary.merged_count,
            moved_count: summary.moved_count,
            conflict_count: 0,
            source_archived: false,
            failure: report.failure,
        })
    }
}
