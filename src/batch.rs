use log::{error, info, warn, Level};
use logging_timer::timer;
use rusqlite::Connection;

use crate::database::Database;
use crate::engine::Scope;
use crate::error::{BatchFailure, CatMergeError};

/// What a batched run committed before it finished or halted
#[derive(Debug)]
pub struct BatchReport<A> {
    /// Per-unit results, only for units whose batch committed
    pub committed: Vec<A>,
    pub batches_committed: usize,
    pub failure: Option<BatchFailure>,
}

/// Splits work into fixed-size batches, each committed in its own transaction.
///
/// Units within a batch run sequentially on one connection. The first failing
/// batch is rolled back and nothing after it runs; committed batches are left
/// in place so the operator can resume with a narrower scope.
pub struct BatchRunner<'a> {
    conn: &'a Connection,
    batch_size: usize,
}

impl<'a> BatchRunner<'a> {
    pub fn new(conn: &'a Connection, batch_size: usize) -> Self {
        Self {
            conn,
            batch_size: batch_size.max(1),
        }
    }

    pub fn run<T, A, L, F>(&self, units: &[T], label: L, mut apply: F) -> BatchReport<A>
    where
        L: Fn(&T) -> String,
        F: FnMut(&Connection, &T) -> Result<A, CatMergeError>,
    {
        let mut report = BatchReport {
            committed: Vec::with_capacity(units.len()),
            batches_committed: 0,
            failure: None,
        };
        let mut committed_through: Option<String> = None;
        let batch_count = units.len().div_ceil(self.batch_size);

        for (batch_index, chunk) in units.chunks(self.batch_size).enumerate() {
            let _tmr = timer!(Level::Debug; "BatchRunner.batch", "{} of {} ({} units)", batch_index + 1, batch_count, chunk.len());
            let mut offending_unit: Option<String> = None;

            let result = Database::immediate_transaction(self.conn, |c| {
                let mut results = Vec::with_capacity(chunk.len());
                for unit in chunk {
                    match apply(c, unit) {
                        Ok(value) => results.push(value),
                        Err(e) => {
                            offending_unit = Some(label(unit));
                            return Err(e);
                        }
                    }
                }
                Ok(results)
            });

            match result {
                Ok(results) => {
                    report.committed.extend(results);
                    report.batches_committed += 1;
                    committed_through = chunk.last().map(&label);
                    info!(
                        "Committed batch {} of {} ({} units, {} total)",
                        batch_index + 1,
                        batch_count,
                        chunk.len(),
                        report.committed.len()
                    );
                }
                Err(e) => {
                    error!(
                        "Batch {} of {} rolled back: {} (offending unit: {})",
                        batch_index + 1,
                        batch_count,
                        e,
                        offending_unit.as_deref().unwrap_or("none")
                    );
                    report.failure = Some(BatchFailure {
                        batch_index,
                        committed_batches: report.batches_committed,
                        committed_units: report.committed.len(),
                        committed_through,
                        offending_unit,
                        detail: e.to_string(),
                    });
                    break;
                }
            }
        }

        report
    }
}

pub struct ScaleGuard;

impl ScaleGuard {
    /// Whole-catalog runs above `threshold` groups are refused; container scopes always pass
    pub fn check(scope: Scope, group_count: usize, threshold: usize) -> Result<(), CatMergeError> {
        if scope.is_unbounded() && group_count > threshold {
            warn!(
                "Scale guard tripped: {} groups in an unscoped run (threshold {})",
                group_count, threshold
            );
            return Err(CatMergeError::ScaleGuard {
                group_count,
                threshold,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Fixture;
    use pretty_assertions::assert_eq;

    fn insert_container(c: &Connection, name: &str) -> Result<i64, CatMergeError> {
        if name == "poison" {
            return Err(CatMergeError::Error("poisoned unit".into()));
        }
        c.execute("INSERT INTO containers (container_name) VALUES (?)", [name])?;
        Ok(c.last_insert_rowid())
    }

    fn container_names(c: &Connection) -> Vec<String> {
        let mut stmt = c.prepare("SELECT container_name FROM containers ORDER BY container_id").unwrap();
        stmt.query_map([], |row| row.get(0)).unwrap().map(|r| r.unwrap()).collect()
    }

    #[test]
    fn test_all_batches_commit() {
        let fx = Fixture::new();
        let conn = fx.conn();
        let units = ["a", "b", "c", "d", "e"];

        let report = BatchRunner::new(&conn, 2).run(&units, |u| u.to_string(), |c, u| insert_container(c, u));

        assert!(report.failure.is_none());
        assert_eq!(report.batches_committed, 3);
        assert_eq!(report.committed.len(), 5);
        assert_eq!(container_names(&conn), vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn test_failure_rolls_back_only_current_batch_and_halts() {
        let fx = Fixture::new();
        let conn = fx.conn();
        let units = ["a", "b", "c", "poison", "e", "f"];

        let report = BatchRunner::new(&conn, 2).run(&units, |u| u.to_string(), |c, u| insert_container(c, u));

        let failure = report.failure.unwrap();
        assert_eq!(failure.batch_index, 1);
        assert_eq!(failure.committed_batches, 1);
        assert_eq!(failure.committed_units, 2);
        assert_eq!(failure.committed_through.as_deref(), Some("b"));
        assert_eq!(failure.offending_unit.as_deref(), Some("poison"));
        assert_eq!(report.committed.len(), 2);
        assert_eq!(container_names(&conn), vec!["a", "b"]);
        assert!(conn.is_autocommit());
    }

    #[test]
    fn test_zero_batch_size_is_clamped() {
        let fx = Fixture::new();
        let conn = fx.conn();
        let report = BatchRunner::new(&conn, 0).run(&["a", "b"], |u| u.to_string(), |c, u| insert_container(c, u));
        assert_eq!(report.batches_committed, 2);
    }

    #[test]
    fn test_scale_guard() {
        assert!(ScaleGuard::check(Scope::Catalog, 10, 10).is_ok());
        assert!(matches!(
            ScaleGuard::check(Scope::Catalog, 11, 10),
            Err(CatMergeError::ScaleGuard { group_count: 11, threshold: 10 })
        ));
        assert!(ScaleGuard::check(Scope::Container(3), 10_000, 10).is_ok());
    }
}
