use rusqlite::{named_params, params, Connection, OptionalExtension, Row};
use serde::Serialize;
use strum::{AsRefStr, Display, EnumIter, EnumString};

use crate::dedup::GroupOutcome;
use crate::error::CatMergeError;
use crate::utils::Utils;

/// Status of a container move. Only ever moves forward to `RolledBack`.
#[derive(AsRefStr, EnumIter, EnumString, Debug, Display, PartialEq, Eq, Copy, Clone, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MoveStatus {
    Completed,
    CompletedWithConflicts,
    RolledBack,
}

#[derive(AsRefStr, EnumIter, EnumString, Debug, Display, PartialEq, Eq, Copy, Clone, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DedupStatus {
    InProgress,
    Completed,
    Halted,
}

#[derive(AsRefStr, EnumString, Debug, Display, PartialEq, Eq, Copy, Clone, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DedupAction {
    Survivor,
    Deleted,
    Quality,
    Moved,
    Merged,
}

#[derive(AsRefStr, EnumIter, EnumString, Debug, Display, PartialEq, Eq, Copy, Clone, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Move,
    Dedup,
}

fn parse_enum<E: std::str::FromStr>(idx: usize, value: String) -> Result<E, rusqlite::Error> {
    value.parse().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unknown status '{}'", value).into(),
        )
    })
}

// ============================================================================
// Container moves
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationLog {
    pub migration_log_id: i64,
    pub initiator: String,
    pub source_container_id: i64,
    pub destination_container_id: i64,
    pub moved_item_count: i64,
    pub conflict_count: i64,
    pub source_archived: bool,
    pub status: MoveStatus,
    pub created_at: i64,
    pub rolled_back_at: Option<i64>,
    pub rolled_back_by: Option<String>,
}

/// Pre- and post-move placement of one item; exactly what rollback replays
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationLogItem {
    pub migration_log_id: i64,
    pub item_id: i64,
    pub old_container_id: i64,
    pub new_container_id: i64,
    pub old_is_parallel: bool,
    pub new_is_parallel: bool,
}

impl MigrationLog {
    const SELECT_COLUMNS: &str = "migration_log_id, initiator, source_container_id, destination_container_id, \
        moved_item_count, conflict_count, source_archived, status, created_at, rolled_back_at, rolled_back_by";

    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(MigrationLog {
            migration_log_id: row.get(0)?,
            initiator: row.get(1)?,
            source_container_id: row.get(2)?,
            destination_container_id: row.get(3)?,
            moved_item_count: row.get(4)?,
            conflict_count: row.get(5)?,
            source_archived: row.get(6)?,
            status: parse_enum(7, row.get(7)?)?,
            created_at: row.get(8)?,
            rolled_back_at: row.get(9)?,
            rolled_back_by: row.get(10)?,
        })
    }

    /// Insert the log row. Must be called inside the move's transaction.
    pub fn insert(
        conn: &Connection,
        initiator: &str,
        source_container_id: i64,
        destination_container_id: i64,
        moved_item_count: usize,
        conflict_count: usize,
        status: MoveStatus,
    ) -> Result<i64, CatMergeError> {
        let log_id = conn.query_row(
            "INSERT INTO migration_logs (
                initiator, source_container_id, destination_container_id,
                moved_item_count, conflict_count, source_archived, status, created_at
            )
            VALUES (
                :initiator, :source_container_id, :destination_container_id,
                :moved_item_count, :conflict_count, 0, :status, :created_at
            )
            RETURNING migration_log_id",
            named_params! {
                ":initiator":                   initiator,
                ":source_container_id":         source_container_id,
                ":destination_container_id":    destination_container_id,
                ":moved_item_count":            moved_item_count as i64,
                ":conflict_count":              conflict_count as i64,
                ":status":                      status.as_ref(),
                ":created_at":                  Utils::now_timestamp(),
            },
            |row| row.get(0),
        )?;
        Ok(log_id)
    }

    pub fn insert_item(conn: &Connection, item: &MigrationLogItem) -> Result<(), CatMergeError> {
        conn.execute(
            "INSERT INTO migration_log_items (
                migration_log_id, item_id, old_container_id, new_container_id, old_is_parallel, new_is_parallel
            )
            VALUES (?, ?, ?, ?, ?, ?)",
            params![
                item.migration_log_id,
                item.item_id,
                item.old_container_id,
                item.new_container_id,
                item.old_is_parallel,
                item.new_is_parallel,
            ],
        )?;
        Ok(())
    }

    pub fn set_source_archived(conn: &Connection, migration_log_id: i64) -> Result<(), CatMergeError> {
        conn.execute(
            "UPDATE migration_logs SET source_archived = 1 WHERE migration_log_id = ?",
            [migration_log_id],
        )?;
        Ok(())
    }

    /// Flip to rolled_back. Returns false if the log was already rolled back.
    pub fn mark_rolled_back(
        conn: &Connection,
        migration_log_id: i64,
        initiator: &str,
    ) -> Result<bool, CatMergeError> {
        let rows = conn.execute(
            "UPDATE migration_logs
             SET status = :rolled_back, rolled_back_at = :now, rolled_back_by = :initiator
             WHERE migration_log_id = :migration_log_id AND status != :rolled_back",
            named_params! {
                ":rolled_back":         MoveStatus::RolledBack.as_ref(),
                ":now":                 Utils::now_timestamp(),
                ":initiator":           initiator,
                ":migration_log_id":    migration_log_id,
            },
        )?;
        Ok(rows == 1)
    }

    pub fn get_by_id(conn: &Connection, migration_log_id: i64) -> Result<Option<Self>, CatMergeError> {
        let sql = format!(
            "SELECT {} FROM migration_logs WHERE migration_log_id = ?",
            Self::SELECT_COLUMNS
        );
        conn.query_row(&sql, [migration_log_id], Self::from_row)
            .optional()
            .map_err(CatMergeError::DatabaseError)
    }

    pub fn items(conn: &Connection, migration_log_id: i64) -> Result<Vec<MigrationLogItem>, CatMergeError> {
        let mut stmt = conn.prepare(
            "SELECT migration_log_id, item_id, old_container_id, new_container_id, old_is_parallel, new_is_parallel
             FROM migration_log_items
             WHERE migration_log_id = ?
             ORDER BY migration_log_item_id ASC",
        )?;
        let items = stmt
            .query_map([migration_log_id], |row| {
                Ok(MigrationLogItem {
                    migration_log_id: row.get(0)?,
                    item_id: row.get(1)?,
                    old_container_id: row.get(2)?,
                    new_container_id: row.get(3)?,
                    old_is_parallel: row.get(4)?,
                    new_is_parallel: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }
}

// ============================================================================
// Dedup runs
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DedupLog {
    pub dedup_log_id: i64,
    pub initiator: String,
    pub scope_container_id: Option<i64>,
    pub planned_groups: i64,
    pub processed_groups: i64,
    pub deleted_count: i64,
    pub moved_count: i64,
    pub merged_count: i64,
    pub batches_committed: i64,
    pub status: DedupStatus,
    pub failure_detail: Option<String>,
    pub created_at: i64,
    pub finished_at: Option<i64>,
}

/// Final tallies written when a dedup run ends
#[derive(Debug, Clone, PartialEq)]
pub struct DedupLogSummary {
    pub processed_groups: usize,
    pub deleted_count: usize,
    pub moved_count: usize,
    pub merged_count: usize,
    pub batches_committed: usize,
    pub status: DedupStatus,
    pub failure_detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DedupLogEntry {
    pub survivor_id: i64,
    pub item_id: i64,
    pub action: DedupAction,
    pub reference_kind: Option<String>,
    pub reference_id: Option<i64>,
    pub owner_key: Option<String>,
    pub detail: Option<String>,
}

impl DedupLog {
    const SELECT_COLUMNS: &str = "dedup_log_id, initiator, scope_container_id, planned_groups, processed_groups, \
        deleted_count, moved_count, merged_count, batches_committed, status, failure_detail, created_at, finished_at";

    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(DedupLog {
            dedup_log_id: row.get(0)?,
            initiator: row.get(1)?,
            scope_container_id: row.get(2)?,
            planned_groups: row.get(3)?,
            processed_groups: row.get(4)?,
            deleted_count: row.get(5)?,
            moved_count: row.get(6)?,
            merged_count: row.get(7)?,
            batches_committed: row.get(8)?,
            status: parse_enum(9, row.get(9)?)?,
            failure_detail: row.get(10)?,
            created_at: row.get(11)?,
            finished_at: row.get(12)?,
        })
    }

    /// Open a run record before the first batch. Committed on its own so the
    /// run is visible even if every batch fails.
    pub fn begin(
        conn: &Connection,
        initiator: &str,
        scope_container_id: Option<i64>,
        planned_groups: usize,
    ) -> Result<i64, CatMergeError> {
        let log_id = conn.query_row(
            "INSERT INTO dedup_logs (initiator, scope_container_id, planned_groups, status, created_at)
             VALUES (?, ?, ?, ?, ?)
             RETURNING dedup_log_id",
            params![
                initiator,
                scope_container_id,
                planned_groups as i64,
                DedupStatus::InProgress.as_ref(),
                Utils::now_timestamp(),
            ],
            |row| row.get(0),
        )?;
        Ok(log_id)
    }

    fn record_entry(conn: &Connection, dedup_log_id: i64, entry: &DedupLogEntry) -> Result<(), CatMergeError> {
        conn.execute(
            "INSERT INTO dedup_log_entries (
                dedup_log_id, survivor_id, item_id, action, reference_kind, reference_id, owner_key, detail
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                dedup_log_id,
                entry.survivor_id,
                entry.item_id,
                entry.action.as_ref(),
                entry.reference_kind,
                entry.reference_id,
                entry.owner_key,
                entry.detail,
            ],
        )?;
        Ok(())
    }

    /// Write one entry per fact of a processed group. Called inside the group's batch transaction.
    pub fn record_group(conn: &Connection, dedup_log_id: i64, outcome: &GroupOutcome) -> Result<(), CatMergeError> {
        let survivor_id = outcome.survivor_id;

        Self::record_entry(
            conn,
            dedup_log_id,
            &DedupLogEntry {
                survivor_id,
                item_id: survivor_id,
                action: DedupAction::Survivor,
                reference_kind: None,
                reference_id: None,
                owner_key: None,
                detail: Some(format!("{} duplicate(s) removed", outcome.deleted_ids.len())),
            },
        )?;

        for change in &outcome.references {
            let action = match change.action {
                crate::dedup::ReferenceAction::Moved => DedupAction::Moved,
                crate::dedup::ReferenceAction::Merged => DedupAction::Merged,
            };
            Self::record_entry(
                conn,
                dedup_log_id,
                &DedupLogEntry {
                    survivor_id,
                    item_id: change.from_item_id,
                    action,
                    reference_kind: Some(change.kind.to_string()),
                    reference_id: Some(change.reference_id),
                    owner_key: Some(change.owner_key.clone()),
                    detail: change.merged_into.map(|id| match &change.snapshot {
                        Some(snapshot) => format!("merged into {} {}: {}", change.kind, id, snapshot),
                        None => format!("merged into {} {}", change.kind, id),
                    }),
                },
            )?;
        }

        for quality in &outcome.quality {
            Self::record_entry(
                conn,
                dedup_log_id,
                &DedupLogEntry {
                    survivor_id,
                    item_id: quality.from_item_id,
                    action: DedupAction::Quality,
                    reference_kind: None,
                    reference_id: None,
                    owner_key: None,
                    detail: Some(quality.fields.join(",")),
                },
            )?;
        }

        for deleted in &outcome.deleted {
            Self::record_entry(
                conn,
                dedup_log_id,
                &DedupLogEntry {
                    survivor_id,
                    item_id: deleted.item_id,
                    action: DedupAction::Deleted,
                    reference_kind: None,
                    reference_id: None,
                    owner_key: None,
                    detail: Some(deleted.description.clone()),
                },
            )?;
        }

        Ok(())
    }

    pub fn finish(conn: &Connection, dedup_log_id: i64, summary: &DedupLogSummary) -> Result<(), CatMergeError> {
        conn.execute(
            "UPDATE dedup_logs SET
                processed_groups = :processed_groups,
                deleted_count = :deleted_count,
                moved_count = :moved_count,
                merged_count = :merged_count,
                batches_committed = :batches_committed,
                status = :status,
                failure_detail = :failure_detail,
                finished_at = :finished_at
             WHERE dedup_log_id = :dedup_log_id AND status = :in_progress",
            named_params! {
                ":processed_groups":    summary.processed_groups as i64,
                ":deleted_count":       summary.deleted_count as i64,
                ":moved_count":         summary.moved_count as i64,
                ":merged_count":        summary.merged_count as i64,
                ":batches_committed":   summary.batches_committed as i64,
                ":status":              summary.status.as_ref(),
                ":failure_detail":      summary.failure_detail,
                ":finished_at":         Utils::now_timestamp(),
                ":dedup_log_id":        dedup_log_id,
                ":in_progress":         DedupStatus::InProgress.as_ref(),
            },
        )?;
        Ok(())
    }

    pub fn get_by_id(conn: &Connection, dedup_log_id: i64) -> Result<Option<Self>, CatMergeError> {
        let sql = format!("SELECT {} FROM dedup_logs WHERE dedup_log_id = ?", Self::SELECT_COLUMNS);
        conn.query_row(&sql, [dedup_log_id], Self::from_row)
            .optional()
            .map_err(CatMergeError::DatabaseError)
    }

    pub fn entries(conn: &Connection, dedup_log_id: i64) -> Result<Vec<DedupLogEntry>, CatMergeError> {
        let mut stmt = conn.prepare(
            "SELECT survivor_id, item_id, action, reference_kind, reference_id, owner_key, detail
             FROM dedup_log_entries
             WHERE dedup_log_id = ?
             ORDER BY entry_id ASC",
        )?;
        let entries = stmt
            .query_map([dedup_log_id], |row| {
                Ok(DedupLogEntry {
                    survivor_id: row.get(0)?,
                    item_id: row.get(1)?,
                    action: parse_enum(2, row.get(2)?)?,
                    reference_kind: row.get(3)?,
                    reference_id: row.get(4)?,
                    owner_key: row.get(5)?,
                    detail: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

// ============================================================================
// Review
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub kind: Option<LogKind>,
    pub status: Option<String>,
    pub container_id: Option<i64>,
    pub limit: usize,
}

impl Default for LogFilter {
    fn default() -> Self {
        LogFilter {
            kind: None,
            status: None,
            container_id: None,
            limit: 50,
        }
    }
}

/// One row of the combined move/dedup audit listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogSummary {
    pub kind: LogKind,
    pub log_id: i64,
    pub initiator: String,
    pub status: String,
    pub source_container_id: Option<i64>,
    pub destination_container_id: Option<i64>,
    pub item_count: i64,
    pub conflict_count: i64,
    pub created_at: i64,
    pub closed_at: Option<i64>,
}

pub struct AuditLog;

impl AuditLog {
    /// Newest first across both log kinds
    pub fn list(conn: &Connection, filter: &LogFilter) -> Result<Vec<LogSummary>, CatMergeError> {
        let mut summaries = Vec::new();
        let limit = filter.limit as i64;

        if filter.kind != Some(LogKind::Dedup) {
            let mut stmt = conn.prepare(
                "SELECT migration_log_id, initiator, status, source_container_id, destination_container_id,
                        moved_item_count, conflict_count, created_at, rolled_back_at
                 FROM migration_logs
                 WHERE (:status IS NULL OR status = :status)
                   AND (:container_id IS NULL
                        OR source_container_id = :container_id
                        OR destination_container_id = :container_id)
                 ORDER BY created_at DESC, migration_log_id DESC
                 LIMIT :limit",
            )?;
            let rows = stmt.query_map(
                named_params! {
                    ":status":          filter.status,
                    ":container_id":    filter.container_id,
                    ":limit":           limit,
                },
                |row| {
                    Ok(LogSummary {
                        kind: LogKind::Move,
                        log_id: row.get(0)?,
                        initiator: row.get(1)?,
                        status: row.get(2)?,
                        source_container_id: Some(row.get(3)?),
                        destination_container_id: Some(row.get(4)?),
                        item_count: row.get(5)?,
                        conflict_count: row.get(6)?,
                        created_at: row.get(7)?,
                        closed_at: row.get(8)?,
                    })
                },
            )?;
            for row in rows {
                summaries.push(row?);
            }
        }

        if filter.kind != Some(LogKind::Move) {
            let mut stmt = conn.prepare(
                "SELECT dedup_log_id, initiator, status, scope_container_id, deleted_count, created_at, finished_at
                 FROM dedup_logs
                 WHERE (:status IS NULL OR status = :status)
                   AND (:container_id IS NULL OR scope_container_id = :container_id)
                 ORDER BY created_at DESC, dedup_log_id DESC
                 LIMIT :limit",
            )?;
            let rows = stmt.query_map(
                named_params! {
                    ":status":          filter.status,
                    ":container_id":    filter.container_id,
                    ":limit":           limit,
                },
                |row| {
                    Ok(LogSummary {
                        kind: LogKind::Dedup,
                        log_id: row.get(0)?,
                        initiator: row.get(1)?,
                        status: row.get(2)?,
                        source_container_id: row.get(3)?,
                        destination_container_id: None,
                        item_count: row.get(4)?,
                        conflict_count: 0,
                        created_at: row.get(5)?,
                        closed_at: row.get(6)?,
                    })
                },
            )?;
            for row in rows {
                summaries.push(row?);
            }
        }

        summaries.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.log_id.cmp(&a.log_id))
        });
        summaries.truncate(filter.limit);
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Fixture;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_status_strings() {
        assert_eq!(MoveStatus::CompletedWithConflicts.as_ref(), "completed_with_conflicts");
        assert_eq!("rolled_back".parse::<MoveStatus>().unwrap(), MoveStatus::RolledBack);
        assert_eq!(DedupStatus::InProgress.to_string(), "in_progress");
        assert!("failed".parse::<MoveStatus>().is_err());
    }

    #[test]
    fn test_mark_rolled_back_only_once() {
        let fx = Fixture::new();
        let conn = fx.conn();
        let log_id = MigrationLog::insert(&conn, "tester", 1, 2, 5, 0, MoveStatus::Completed).unwrap();

        assert!(MigrationLog::mark_rolled_back(&conn, log_id, "tester").unwrap());
        assert!(!MigrationLog::mark_rolled_back(&conn, log_id, "tester").unwrap());

        let log = MigrationLog::get_by_id(&conn, log_id).unwrap().unwrap();
        assert_eq!(log.status, MoveStatus::RolledBack);
        assert!(log.rolled_back_at.is_some());
        assert_eq!(log.rolled_back_by.as_deref(), Some("tester"));
    }

    #[test]
    fn test_dedup_log_finish_is_forward_only() {
        let fx = Fixture::new();
        let conn = fx.conn();
        let log_id = DedupLog::begin(&conn, "tester", Some(4), 3).unwrap();

        let summary = DedupLogSummary {
            processed_groups: 3,
            deleted_count: 4,
            moved_count: 2,
            merged_count: 1,
            batches_committed: 1,
            status: DedupStatus::Completed,
            failure_detail: None,
        };
        DedupLog::finish(&conn, log_id, &summary).unwrap();
        DedupLog::finish(
            &conn,
            log_id,
            &DedupLogSummary {
                status: DedupStatus::Halted,
                ..summary.clone()
            },
        )
        .unwrap();

        let log = DedupLog::get_by_id(&conn, log_id).unwrap().unwrap();
        assert_eq!(log.status, DedupStatus::Completed);
        assert_eq!(log.deleted_count, 4);
        assert_eq!(log.scope_container_id, Some(4));
    }

    #[test]
    fn test_list_filters_and_orders() {
        let fx = Fixture::new();
        let conn = fx.conn();
        let move_a = MigrationLog::insert(&conn, "alice", 1, 2, 5, 0, MoveStatus::Completed).unwrap();
        let move_b = MigrationLog::insert(&conn, "bob", 3, 4, 2, 1, MoveStatus::CompletedWithConflicts).unwrap();
        let dedup = DedupLog::begin(&conn, "carol", Some(2), 7).unwrap();
        conn.execute("UPDATE migration_logs SET created_at = 100 WHERE migration_log_id = ?", [move_a]).unwrap();
        conn.execute("UPDATE migration_logs SET created_at = 200 WHERE migration_log_id = ?", [move_b]).unwrap();
        conn.execute("UPDATE dedup_logs SET created_at = 300 WHERE dedup_log_id = ?", [dedup]).unwrap();

        let all = AuditLog::list(&conn, &LogFilter::default()).unwrap();
        let order: Vec<(LogKind, i64)> = all.iter().map(|s| (s.kind, s.log_id)).collect();
        assert_eq!(order, vec![(LogKind::Dedup, dedup), (LogKind::Move, move_b), (LogKind::Move, move_a)]);

        let container_two = AuditLog::list(
            &conn,
            &LogFilter {
                container_id: Some(2),
                ..LogFilter::default()
            },
        )
        .unwrap();
        assert_eq!(container_two.len(), 2);

        let conflicted = AuditLog::list(
            &conn,
            &LogFilter {
                kind: Some(LogKind::Move),
                status: Some("completed_with_conflicts".into()),
                ..LogFilter::default()
            },
        )
        .unwrap();
        assert_eq!(conflicted.len(), 1);
        assert_eq!(conflicted[0].initiator, "bob");

        let limited = AuditLog::list(&conn, &LogFilter { limit: 1, ..LogFilter::default() }).unwrap();
        assert_eq!(limited.len(), 1);
    }
}
