use std::fmt;

use log::info;
use rusqlite::Connection;
use serde::Serialize;
use strum::{AsRefStr, Display};

use crate::audit::{AuditLog, LogFilter, LogSummary, MigrationLog, MigrationLogItem};
use crate::config::EngineConfig;
use crate::container_move::{ContainerMigrator, MovePreview, RollbackOutcome};
use crate::containers::Container;
use crate::dedup::{DedupPlan, Deduplicator};
use crate::error::{BatchFailure, CatMergeError};

/// What an operation is allowed to touch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Catalog,
    Container(i64),
}

impl Scope {
    pub fn container_id(&self) -> Option<i64> {
        match self {
            Scope::Catalog => None,
            Scope::Container(id) => Some(*id),
        }
    }

    pub fn is_unbounded(&self) -> bool {
        matches!(self, Scope::Catalog)
    }

    pub fn validate(&self, conn: &Connection) -> Result<(), CatMergeError> {
        if let Scope::Container(id) = self {
            Container::require(conn, *id)?;
        }
        Ok(())
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Catalog => write!(f, "whole catalog"),
            Scope::Container(id) => write!(f, "container {}", id),
        }
    }
}

/// Per-invocation settings, built once and passed to every engine call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    scope: Scope,
    batch_size: usize,
    dry_run: bool,
    initiator: String,
}

impl RunContext {
    pub fn apply(scope: Scope, batch_size: usize, initiator: &str) -> Self {
        RunContext {
            scope,
            batch_size,
            dry_run: false,
            initiator: initiator.to_owned(),
        }
    }

    pub fn preview(scope: Scope, initiator: &str) -> Self {
        RunContext {
            scope,
            batch_size: EngineConfig::DEFAULT_BATCH_SIZE,
            dry_run: true,
            initiator: initiator.to_owned(),
        }
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn initiator(&self) -> &str {
        &self.initiator
    }

    /// A context may only mutate if it was built for apply with usable options
    pub fn ensure_apply(&self) -> Result<(), CatMergeError> {
        if self.dry_run {
            return Err(CatMergeError::Validation(
                "a dry-run context cannot apply changes".into(),
            ));
        }
        if self.initiator.trim().is_empty() {
            return Err(CatMergeError::Validation("an initiator is required".into()));
        }
        if self.batch_size == 0 {
            return Err(CatMergeError::Validation("batch size must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Dedup,
    /// Move every item of the scoped container into `destination_container_id`
    MoveContainer { destination_container_id: i64 },
}

#[derive(AsRefStr, Display, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OperationName {
    Dedup,
    Move,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum Plan {
    Dedup(DedupPlan),
    Move(MovePreview),
}

/// Result of an apply. `failure` is set when a dedup run halted part way.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplyOutcome {
    pub operation: OperationName,
    pub log_id: i64,
    pub status: String,
    pub processed_count: usize,
    pub deleted_count: usize,
    pub merged_count: usize,
    pub moved_count: usize,
    pub conflict_count: usize,
    pub source_archived: bool,
    pub failure: Option<BatchFailure>,
}

pub struct Engine<'a> {
    config: &'a EngineConfig,
}

impl<'a> Engine<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Engine { config }
    }

    pub fn preview(&self, conn: &Connection, ctx: &RunContext, kind: OperationKind) -> Result<Plan, CatMergeError> {
        match kind {
            OperationKind::Dedup => Ok(Plan::Dedup(DedupPlan::build(conn, ctx.scope())?)),
            OperationKind::MoveContainer {
                destination_container_id,
            } => {
                let source_id = Self::move_source(ctx)?;
                Ok(Plan::Move(ContainerMigrator::preview(
                    conn,
                    source_id,
                    destination_container_id,
                )?))
            }
        }
    }

    pub fn apply(
        &self,
        conn: &Connection,
        ctx: &RunContext,
        kind: OperationKind,
        confirmation: Option<&str>,
    ) -> Result<ApplyOutcome, CatMergeError> {
        let outcome = match kind {
            OperationKind::Dedup => Deduplicator::apply(conn, ctx, self.config, confirmation)?,
            OperationKind::MoveContainer {
                destination_container_id,
            } => {
                Self::move_source(ctx)?;
                ContainerMigrator::apply(conn, ctx, destination_container_id, self.config, confirmation)?
            }
        };

        info!(
            "{} apply finished with status {} (log {})",
            outcome.operation, outcome.status, outcome.log_id
        );
        Ok(outcome)
    }

    /// Reverse a container move. Dedup runs cannot be rolled back.
    pub fn rollback(
        &self,
        conn: &Connection,
        migration_log_id: i64,
        initiator: &str,
    ) -> Result<RollbackOutcome, CatMergeError> {
        ContainerMigrator::rollback(conn, migration_log_id, initiator)
    }

    pub fn get_logs(&self, conn: &Connection, filter: &LogFilter) -> Result<Vec<LogSummary>, CatMergeError> {
        AuditLog::list(conn, filter)
    }

    pub fn get_log_items(
        &self,
        conn: &Connection,
        migration_log_id: i64,
    ) -> Result<Vec<MigrationLogItem>, CatMergeError> {
        if MigrationLog::get_by_id(conn, migration_log_id)?.is_none() {
            return Err(CatMergeError::Validation(format!(
                "Migration log {} does not exist",
                migration_log_id
            )));
        }
        MigrationLog::items(conn, migration_log_id)
    }

    fn move_source(ctx: &RunContext) -> Result<i64, CatMergeError> {
        ctx.scope().container_id().ok_or_else(|| {
            CatMergeError::Validation("a container move needs a source container, not the whole catalog".into())
        })
    }
}
