use std::collections::BTreeSet;

use log::{error, info, warn, Level};
use logging_timer::timer;
use rusqlite::{params, Connection};
use serde::Serialize;
use strum::{AsRefStr, Display, EnumIter};

use crate::audit::{MigrationLog, MigrationLogItem, MoveStatus};
use crate::config::EngineConfig;
use crate::containers::Container;
use crate::database::Database;
use crate::engine::{ApplyOutcome, OperationName, RunContext};
use crate::error::{BatchFailure, CatMergeError};
use crate::items::Item;

/// Lifecycle of one container move
#[derive(AsRefStr, EnumIter, Display, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MoveState {
    Previewed,
    Confirmed,
    Applying,
    Completed,
    CompletedWithConflicts,
    Failed,
    RolledBack,
}

impl MoveState {
    pub fn can_transition_to(self, next: MoveState) -> bool {
        use MoveState::*;
        matches!(
            (self, next),
            (Previewed, Confirmed)
                | (Confirmed, Applying)
                | (Applying, Completed)
                | (Applying, CompletedWithConflicts)
                | (Applying, Failed)
                | (Completed, RolledBack)
                | (CompletedWithConflicts, RolledBack)
        )
    }

    pub fn transition(self, next: MoveState) -> Result<MoveState, CatMergeError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(CatMergeError::Error(format!(
                "invalid move state transition {} -> {}",
                self, next
            )))
        }
    }
}

impl From<MoveStatus> for MoveState {
    fn from(status: MoveStatus) -> Self {
        match status {
            MoveStatus::Completed => MoveState::Completed,
            MoveStatus::CompletedWithConflicts => MoveState::CompletedWithConflicts,
            MoveStatus::RolledBack => MoveState::RolledBack,
        }
    }
}

/// A source item whose position key is already taken in the destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictPair {
    pub position_key: String,
    pub source_item_id: i64,
    pub source_name: String,
    pub destination_item_id: i64,
    pub destination_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MovePreview {
    pub source: Container,
    pub destination: Container,
    pub source_item_count: usize,
    pub destination_item_count: usize,
    /// Distinct position keys present in both containers
    pub conflict_count: usize,
    pub conflicts: Vec<ConflictPair>,
    pub destination_forces_parallel: bool,
    pub destination_is_canonical: bool,
    pub source_would_archive: bool,
}

impl MovePreview {
    fn conflicting_keys(&self) -> BTreeSet<&str> {
        self.conflicts.iter().map(|c| c.position_key.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackOutcome {
    pub migration_log_id: i64,
    pub restored_count: usize,
    pub source_reactivated: bool,
}

pub struct ContainerMigrator;

impl ContainerMigrator {
    /// Read-only look at what moving `source_id` into `destination_id` would do
    pub fn preview(conn: &Connection, source_id: i64, destination_id: i64) -> Result<MovePreview, CatMergeError> {
        if source_id == destination_id {
            return Err(CatMergeError::Validation(
                "source and destination containers must differ".into(),
            ));
        }

        let source = Container::require(conn, source_id)?;
        let destination = Container::require(conn, destination_id)?;

        let source_item_count = Self::count_items(conn, source_id)?;
        let destination_item_count = Self::count_items(conn, destination_id)?;
        let conflicts = Self::find_conflicts(conn, source_id, destination_id)?;
        let conflict_count = conflicts
            .iter()
            .map(|c| c.position_key.as_str())
            .collect::<BTreeSet<_>>()
            .len();

        Ok(MovePreview {
            source_item_count,
            destination_item_count,
            conflict_count,
            conflicts,
            destination_forces_parallel: destination.forces_parallel(),
            destination_is_canonical: destination.is_canonical(),
            source_would_archive: source.can_auto_archive(),
            source,
            destination,
        })
    }

    /// Move every item of the context's container into `destination_id` in one transaction.
    ///
    /// Conflicting items follow the parallel policy: they still move, are
    /// flagged parallel, and their pairs are counted on the log.
    pub fn apply(
        conn: &Connection,
        ctx: &RunContext,
        destination_id: i64,
        config: &EngineConfig,
        confirmation: Option<&str>,
    ) -> Result<ApplyOutcome, CatMergeError> {
        ctx.ensure_apply()?;
        let source_id = ctx.scope().container_id().ok_or_else(|| {
            CatMergeError::Validation("a container move needs a source container".into())
        })?;

        let mut state = MoveState::Previewed;
        let preview = Self::preview(conn, source_id, destination_id)?;

        if !preview.destination.is_active() {
            return Err(CatMergeError::Validation(format!(
                "Destination container {} is archived",
                destination_id
            )));
        }
        if preview.source_item_count == 0 {
            return Err(CatMergeError::Validation(format!(
                "Source container {} has no items to move",
                source_id
            )));
        }
        if preview.conflict_count > 0 && confirmation != Some(config.confirmation_phrase()) {
            warn!(
                "Move {} -> {} rejected: {} conflict(s) without the confirmation phrase",
                source_id, destination_id, preview.conflict_count
            );
            return Err(CatMergeError::Conflict {
                conflict_count: preview.conflict_count,
                message: format!(
                    "{} position(s) of container {} already exist in container {}",
                    preview.conflict_count, source_id, destination_id
                ),
            });
        }
        state = state.transition(MoveState::Confirmed)?;

        let final_status = if preview.conflict_count > 0 {
            MoveStatus::CompletedWithConflicts
        } else {
            MoveStatus::Completed
        };
        let conflicting_keys = preview.conflicting_keys();
        let forces_parallel = preview.destination.forces_parallel();

        state = state.transition(MoveState::Applying)?;
        let _tmr = timer!(Level::Info; "ContainerMigrator.apply", "{} -> {}", source_id, destination_id);
        let mut offending_item: Option<i64> = None;

        let result = Database::immediate_transaction(conn, |c| {
            let items = Item::for_container(c, source_id)?;
            let log_id = MigrationLog::insert(
                c,
                ctx.initiator(),
                source_id,
                destination_id,
                items.len(),
                preview.conflict_count,
                final_status,
            )?;

            for item in &items {
                offending_item = Some(item.item_id());
                let new_is_parallel =
                    item.is_parallel() || forces_parallel || conflicting_keys.contains(item.position_key());

                if !Item::set_container(c, item.item_id(), source_id, destination_id, new_is_parallel)? {
                    return Err(CatMergeError::Error(format!(
                        "Item {} left container {} during the move",
                        item.item_id(),
                        source_id
                    )));
                }
                MigrationLog::insert_item(
                    c,
                    &MigrationLogItem {
                        migration_log_id: log_id,
                        item_id: item.item_id(),
                        old_container_id: source_id,
                        new_container_id: destination_id,
                        old_is_parallel: item.is_parallel(),
                        new_is_parallel,
                    },
                )?;
            }
            offending_item = None;

            let remaining = Container::recompute_item_count(c, source_id)?;
            Container::recompute_item_count(c, destination_id)?;

            let source_archived = remaining == 0 && preview.source.can_auto_archive();
            if source_archived {
                Container::set_active(c, source_id, false)?;
                MigrationLog::set_source_archived(c, log_id)?;
            }

            Ok((log_id, items.len(), source_archived))
        });

        let (log_id, moved_count, source_archived) = match result {
            Ok(done) => done,
            Err(e) => {
                state.transition(MoveState::Failed)?;
                error!("Move {} -> {} rolled back: {}", source_id, destination_id, e);
                return Err(CatMergeError::TransactionFailure(BatchFailure {
                    batch_index: 0,
                    committed_batches: 0,
                    committed_units: 0,
                    committed_through: None,
                    offending_unit: offending_item.map(|id| format!("item {}", id)),
                    detail: e.to_string(),
                }));
            }
        };

        let state = state.transition(MoveState::from(final_status))?;
        info!(
            "Migration log {}: moved {} item(s) from {} to {} ({}, {} conflict(s){})",
            log_id,
            moved_count,
            source_id,
            destination_id,
            state,
            preview.conflict_count,
            if source_archived { ", source archived" } else { "" }
        );

        Ok(ApplyOutcome {
            operation: OperationName::Move,
            log_id,
            status: final_status.to_string(),
            processed_count: moved_count,
            deleted_count: 0,
            merged_count: 0,
            moved_count,
            conflict_count: preview.conflict_count,
            source_archived,
            failure: None,
        })
    }

    /// Replay a move's item log in reverse. Allowed once per log.
    pub fn rollback(
        conn: &Connection,
        migration_log_id: i64,
        initiator: &str,
    ) -> Result<RollbackOutcome, CatMergeError> {
        if initiator.trim().is_empty() {
            return Err(CatMergeError::Validation("an initiator is required".into()));
        }

        let log = MigrationLog::get_by_id(conn, migration_log_id)?.ok_or_else(|| {
            CatMergeError::RollbackState(format!("migration log {} does not exist", migration_log_id))
        })?;
        MoveState::from(log.status)
            .transition(MoveState::RolledBack)
            .map_err(|_| {
                CatMergeError::RollbackState(format!(
                    "migration log {} is already {}",
                    migration_log_id, log.status
                ))
            })?;

        let _tmr = timer!(Level::Info; "ContainerMigrator.rollback", "log {}", migration_log_id);

        let outcome = Database::immediate_transaction(conn, |c| {
            let items = MigrationLog::items(c, migration_log_id)?;

            for item in items.iter().rev() {
                let restored = Item::set_container(
                    c,
                    item.item_id,
                    item.new_container_id,
                    item.old_container_id,
                    item.old_is_parallel,
                )?;
                if !restored {
                    return Err(CatMergeError::RollbackState(format!(
                        "item {} is no longer in container {}",
                        item.item_id, item.new_container_id
                    )));
                }
            }

            Container::recompute_item_count(c, log.source_container_id)?;
            Container::recompute_item_count(c, log.destination_container_id)?;

            if log.source_archived {
                Container::set_active(c, log.source_container_id, true)?;
            }

            if !MigrationLog::mark_rolled_back(c, migration_log_id, initiator)? {
                return Err(CatMergeError::RollbackState(format!(
                    "migration log {} was rolled back concurrently",
                    migration_log_id
                )));
            }

            Ok(RollbackOutcome {
                migration_log_id,
                restored_count: items.len(),
                source_reactivated: log.source_archived,
            })
        })?;

        info!(
            "Rolled back migration log {} by '{}': {} item(s) restored",
            migration_log_id, initiator, outcome.restored_count
        );
        Ok(outcome)
    }

    fn count_items(conn: &Connection, container_id: i64) -> Result<usize, CatMergeError> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM items WHERE container_id = ?",
            [container_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn find_conflicts(
        conn: &Connection,
        source_id: i64,
        destination_id: i64,
    ) -> Result<Vec<ConflictPair>, CatMergeError> {
        let mut stmt = conn.prepare(
            "SELECT s.position_key, s.item_id, s.display_name, d.item_id, d.display_name
             FROM items s
             JOIN items d ON d.position_key = s.position_key AND d.container_id = ?2
             WHERE s.container_id = ?1
             ORDER BY s.item_id ASC, d.item_id ASC",
        )?;
        let pairs = stmt
            .query_map(params![source_id, destination_id], |row| {
                Ok(ConflictPair {
                    position_key: row.get(0)?,
                    source_item_id: row.get(1)?,
                    source_name: row.get(2)?,
                    destination_item_id: row.get(3)?,
                    destination_name: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Scope;
    use crate::test_support::Fixture;
    use pretty_assertions::assert_eq;
    use strum::IntoEnumIterator;

    const PHRASE: &str = EngineConfig::DEFAULT_CONFIRMATION_PHRASE;

    /// S holds #1-50, D holds #1-10 and #51-60
    fn overlapping_sets(fx: &Fixture, conn: &Connection) -> (i64, i64) {
        let source = fx.container(conn, "Base Set (reprint)");
        let dest = fx.container(conn, "Base Set");
        for n in 1..=50 {
            fx.item(conn, source, &n.to_string(), &format!("Card {n}"));
        }
        for n in (1..=10).chain(51..=60) {
            fx.item(conn, dest, &n.to_string(), &format!("Card {n}"));
        }
        Container::recompute_item_count(conn, source).unwrap();
        Container::recompute_item_count(conn, dest).unwrap();
        (source, dest)
    }

    fn placements(conn: &Connection) -> Vec<(i64, i64, bool)> {
        let mut stmt = conn
            .prepare("SELECT item_id, container_id, is_parallel FROM items ORDER BY item_id")
            .unwrap();
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
    }

    fn apply_ctx(source: i64) -> RunContext {
        RunContext::apply(Scope::Container(source), 1000, "tester")
    }

    #[test]
    fn test_preview_reports_conflicts() {
        let fx = Fixture::new();
        let conn = fx.conn();
        let (source, dest) = overlapping_sets(&fx, &conn);
        let before = Database::checksum(&conn).unwrap();

        let preview = ContainerMigrator::preview(&conn, source, dest).unwrap();

        assert_eq!(preview.source_item_count, 50);
        assert_eq!(preview.destination_item_count, 20);
        assert_eq!(preview.conflict_count, 10);
        assert_eq!(preview.conflicts[0].position_key, "1");
        assert!(!preview.destination_forces_parallel);
        assert!(preview.source_would_archive);
        assert_eq!(before, Database::checksum(&conn).unwrap());
    }

    #[test]
    fn test_conflicts_require_exact_phrase() {
        let fx = Fixture::new();
        let conn = fx.conn();
        let (source, dest) = overlapping_sets(&fx, &conn);
        let config = EngineConfig::default();
        let before = Database::checksum(&conn).unwrap();

        for attempt in [None, Some("merge with conflicts"), Some("MERGE WITH CONFLICTS ")] {
            let err = ContainerMigrator::apply(&conn, &apply_ctx(source), dest, &config, attempt).unwrap_err();
            assert!(matches!(err, CatMergeError::Conflict { conflict_count: 10, .. }));
        }
        assert_eq!(before, Database::checksum(&conn).unwrap());
    }

    #[test]
    fn test_apply_with_phrase_moves_everything_and_archives_source() {
        let fx = Fixture::new();
        let conn = fx.conn();
        let (source, dest) = overlapping_sets(&fx, &conn);
        let config = EngineConfig::default();

        let outcome = ContainerMigrator::apply(&conn, &apply_ctx(source), dest, &config, Some(PHRASE)).unwrap();

        assert_eq!(outcome.status, "completed_with_conflicts");
        assert_eq!(outcome.moved_count, 50);
        assert_eq!(outcome.conflict_count, 10);
        assert!(outcome.source_archived);

        let source_after = Container::require(&conn, source).unwrap();
        assert!(!source_after.is_active());
        assert_eq!(source_after.item_count(), 0);
        assert_eq!(Container::require(&conn, dest).unwrap().item_count(), 70);

        let log = MigrationLog::get_by_id(&conn, outcome.log_id).unwrap().unwrap();
        assert_eq!(log.status, MoveStatus::CompletedWithConflicts);
        assert!(log.source_archived);

        let items = MigrationLog::items(&conn, outcome.log_id).unwrap();
        assert_eq!(items.len(), 50);
        assert_eq!(items.iter().filter(|i| i.new_is_parallel).count(), 10);
    }

    #[test]
    fn test_rollback_round_trip_and_repeat_rejected() {
        let fx = Fixture::new();
        let conn = fx.conn();
        let (source, dest) = overlapping_sets(&fx, &conn);
        let some_item = Item::for_container(&conn, source).unwrap()[20].item_id();
        fx.set_parallel(&conn, some_item, true);
        let before = placements(&conn);
        let config = EngineConfig::default();

        let outcome = ContainerMigrator::apply(&conn, &apply_ctx(source), dest, &config, Some(PHRASE)).unwrap();
        assert_ne!(before, placements(&conn));

        let rollback = ContainerMigrator::rollback(&conn, outcome.log_id, "tester").unwrap();
        assert_eq!(rollback.restored_count, 50);
        assert!(rollback.source_reactivated);
        assert_eq!(before, placements(&conn));

        let source_after = Container::require(&conn, source).unwrap();
        assert!(source_after.is_active());
        assert_eq!(source_after.item_count(), 50);
        assert_eq!(Container::require(&conn, dest).unwrap().item_count(), 20);

        let log = MigrationLog::get_by_id(&conn, outcome.log_id).unwrap().unwrap();
        assert_eq!(log.status, MoveStatus::RolledBack);

        let again = ContainerMigrator::rollback(&conn, outcome.log_id, "tester");
        assert!(matches!(again, Err(CatMergeError::RollbackState(_))));
        let missing = ContainerMigrator::rollback(&conn, outcome.log_id + 1, "tester");
        assert!(matches!(missing, Err(CatMergeError::RollbackState(_))));
    }

    #[test]
    fn test_rollback_refuses_when_item_moved_since() {
        let fx = Fixture::new();
        let conn = fx.conn();
        let source = fx.container(&conn, "Gym Heroes (dupe)");
        let dest = fx.container(&conn, "Gym Heroes");
        let elsewhere = fx.container(&conn, "Gym Challenge");
        let moved = fx.item(&conn, source, "1", "Blaine's Moltres");
        fx.item(&conn, source, "2", "Brock's Rhydon");
        let config = EngineConfig::default();

        let outcome = ContainerMigrator::apply(&conn, &apply_ctx(source), dest, &config, None).unwrap();
        assert_eq!(outcome.status, "completed");
        conn.execute("UPDATE items SET container_id = ? WHERE item_id = ?", [elsewhere, moved])
            .unwrap();
        let before = Database::checksum(&conn).unwrap();

        let err = ContainerMigrator::rollback(&conn, outcome.log_id, "tester").unwrap_err();
        assert!(matches!(err, CatMergeError::RollbackState(_)));
        assert_eq!(before, Database::checksum(&conn).unwrap());
    }

    #[test]
    fn test_protected_source_stays_active_and_destination_forces_parallel() {
        let fx = Fixture::new();
        let conn = fx.conn();
        let source = fx.container_with(&conn, "Promos", false, true, false);
        let dest = fx.container_with(&conn, "Promos (alt art)", false, false, true);
        fx.item(&conn, source, "SWSH001", "Grookey");
        let config = EngineConfig::default();

        let outcome = ContainerMigrator::apply(&conn, &apply_ctx(source), dest, &config, None).unwrap();

        assert!(!outcome.source_archived);
        assert!(Container::require(&conn, source).unwrap().is_active());
        let items = MigrationLog::items(&conn, outcome.log_id).unwrap();
        assert!(!items[0].old_is_parallel);
        assert!(items[0].new_is_parallel);
    }

    #[test]
    fn test_invalid_requests() {
        let fx = Fixture::new();
        let conn = fx.conn();
        let source = fx.container(&conn, "Neo Genesis");
        let empty = fx.container(&conn, "Neo Discovery");
        fx.item(&conn, source, "9", "Lugia");
        let config = EngineConfig::default();

        let same = ContainerMigrator::apply(&conn, &apply_ctx(source), source, &config, None);
        assert!(matches!(same, Err(CatMergeError::Validation(_))));
        let missing = ContainerMigrator::apply(&conn, &apply_ctx(source), empty + 50, &config, None);
        assert!(matches!(missing, Err(CatMergeError::Validation(_))));
        let nothing = ContainerMigrator::apply(&conn, &apply_ctx(empty), source, &config, None);
        assert!(matches!(nothing, Err(CatMergeError::Validation(_))));
    }

    #[test]
    fn test_state_machine() {
        assert!(MoveState::Previewed.can_transition_to(MoveState::Confirmed));
        assert!(MoveState::Applying.can_transition_to(MoveState::Failed));
        assert!(MoveState::CompletedWithConflicts.can_transition_to(MoveState::RolledBack));
        assert!(!MoveState::Previewed.can_transition_to(MoveState::Applying));
        assert!(!MoveState::Failed.can_transition_to(MoveState::RolledBack));

        // Nothing leaves rolled_back
        for next in MoveState::iter() {
            assert!(!MoveState::RolledBack.can_transition_to(next));
        }
    }
}
