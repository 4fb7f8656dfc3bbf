use std::io::Write;

use clap::ValueEnum;
use serde::Serialize;
use tablestream::*;

use crate::audit::{LogSummary, MigrationLogItem};
use crate::container_move::{ConflictPair, MovePreview, RollbackOutcome};
use crate::dedup::{DedupPlan, DuplicateGroup};
use crate::engine::{ApplyOutcome, Plan};
use crate::error::CatMergeError;
use crate::utils::Utils;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    Table,
    Json,
}

pub struct Reports {}

impl Reports {
    pub fn report_plan<W: Write>(out: &mut W, plan: &Plan, format: ReportFormat) -> Result<(), CatMergeError> {
        match format {
            ReportFormat::Json => Self::write_json(out, plan),
            ReportFormat::Table => match plan {
                Plan::Dedup(dedup) => Self::print_dedup_plan(out, dedup),
                Plan::Move(preview) => Self::print_move_preview(out, preview),
            },
        }
    }

    pub fn report_apply<W: Write>(
        out: &mut W,
        outcome: &ApplyOutcome,
        format: ReportFormat,
    ) -> Result<(), CatMergeError> {
        if format == ReportFormat::Json {
            return Self::write_json(out, outcome);
        }

        let mut stream = Stream::new(&mut *out, vec![
            Column::new(|f, o: &ApplyOutcome| write!(f, "{}", o.operation)).header("Operation"),
            Column::new(|f, o: &ApplyOutcome| write!(f, "{}", o.log_id)).header("Log ID").right().min_width(6),
            Column::new(|f, o: &ApplyOutcome| write!(f, "{}", o.status)).header("Status"),
            Column::new(|f, o: &ApplyOutcome| write!(f, "{}", o.processed_count)).header("Processed").right(),
            Column::new(|f, o: &ApplyOutcome| write!(f, "{}", o.deleted_count)).header("Deleted").right(),
            Column::new(|f, o: &ApplyOutcome| write!(f, "{}", o.moved_count)).header("Moved").right(),
            Column::new(|f, o: &ApplyOutcome| write!(f, "{}", o.merged_count)).header("Merged").right(),
            Column::new(|f, o: &ApplyOutcome| write!(f, "{}", o.conflict_count)).header("Conflicts").right(),
            Column::new(|f, o: &ApplyOutcome| write!(f, "{}", o.source_archived)).header("Src Archived").center(),
        ]).title("Apply");
        stream.row(outcome.clone())?;
        stream.finish()?;

        if let Some(failure) = &outcome.failure {
            writeln!(out, "Halted: {}", failure)?;
        }
        Ok(())
    }

    pub fn report_rollback<W: Write>(
        out: &mut W,
        outcome: &RollbackOutcome,
        format: ReportFormat,
    ) -> Result<(), CatMergeError> {
        match format {
            ReportFormat::Json => Self::write_json(out, outcome),
            ReportFormat::Table => {
                writeln!(
                    out,
                    "Migration log {} rolled back: {} item(s) restored{}",
                    outcome.migration_log_id,
                    outcome.restored_count,
                    if outcome.source_reactivated { ", source container reactivated" } else { "" }
                )?;
                Ok(())
            }
        }
    }

    pub fn report_logs<W: Write>(out: &mut W, logs: &[LogSummary], format: ReportFormat) -> Result<(), CatMergeError> {
        if format == ReportFormat::Json {
            return Self::write_json(out, &logs);
        }

        if logs.is_empty() {
            writeln!(out, "No Logs")?;
            return Ok(());
        }

        let mut stream = Stream::new(&mut *out, vec![
            Column::new(|f, l: &LogSummary| write!(f, "{}", l.kind)).header("Kind"),
            Column::new(|f, l: &LogSummary| write!(f, "{}", l.log_id)).header("ID").right().min_width(6),
            Column::new(|f, l: &LogSummary| write!(f, "{}", l.status)).header("Status"),
            Column::new(|f, l: &LogSummary| write!(f, "{}", l.initiator)).header("Initiator"),
            Column::new(|f, l: &LogSummary| write!(f, "{}", Utils::opt_i64_or_none_as_str(l.source_container_id))).header("Container").right(),
            Column::new(|f, l: &LogSummary| write!(f, "{}", Utils::opt_i64_or_none_as_str(l.destination_container_id))).header("Dest").right(),
            Column::new(|f, l: &LogSummary| write!(f, "{}", l.item_count)).header("Items").right().min_width(6),
            Column::new(|f, l: &LogSummary| write!(f, "{}", l.conflict_count)).header("Conflicts").right(),
            Column::new(|f, l: &LogSummary| write!(f, "{}", Utils::format_db_time_short(l.created_at))).header("Created"),
            Column::new(|f, l: &LogSummary| write!(f, "{}", Utils::format_db_time_short_or_none(l.closed_at))).header("Closed"),
        ]).title("Audit Logs");

        for log in logs {
            stream.row(log.clone())?;
        }
        stream.finish()?;
        Ok(())
    }

    pub fn report_log_items<W: Write>(
        out: &mut W,
        items: &[MigrationLogItem],
        format: ReportFormat,
    ) -> Result<(), CatMergeError> {
        if format == ReportFormat::Json {
            return Self::write_json(out, &items);
        }

        if items.is_empty() {
            writeln!(out, "No Items")?;
            return Ok(());
        }

        let mut stream = Stream::new(&mut *out, vec![
            Column::new(|f, i: &MigrationLogItem| write!(f, "{}", i.item_id)).header("Item ID").right().min_width(6),
            Column::new(|f, i: &MigrationLogItem| write!(f, "{}", i.old_container_id)).header("Old Container").right(),
            Column::new(|f, i: &MigrationLogItem| write!(f, "{}", i.new_container_id)).header("New Container").right(),
            Column::new(|f, i: &MigrationLogItem| write!(f, "{}", i.old_is_parallel)).header("Old Parallel").center(),
            Column::new(|f, i: &MigrationLogItem| write!(f, "{}", i.new_is_parallel)).header("New Parallel").center(),
        ]).title("Moved Items");

        for item in items {
            stream.row(item.clone())?;
        }
        stream.finish()?;
        Ok(())
    }

    fn print_dedup_plan<W: Write>(out: &mut W, plan: &DedupPlan) -> Result<(), CatMergeError> {
        let title = format!(
            "Dedup Plan ({}): {} group(s), {} item(s) to delete, {} referenced",
            plan.scope,
            plan.groups.len(),
            plan.loser_count,
            plan.referenced_loser_count
        );

        if plan.groups.is_empty() {
            writeln!(out, "No Duplicates")?;
            return Ok(());
        }

        let mut stream = Stream::new(&mut *out, vec![
            Column::new(|f, g: &DuplicateGroup| write!(f, "{}", g.survivor_id)).header("Survivor").right().min_width(6),
            Column::new(|f, g: &DuplicateGroup| write!(f, "{}", g.identity_key.container_id)).header("Container").right(),
            Column::new(|f, g: &DuplicateGroup| write!(f, "{}", g.identity_key.position_key)).header("Position"),
            Column::new(|f, g: &DuplicateGroup| write!(f, "{}", g.identity_key.display_name)).header("Name"),
            Column::new(|f, g: &DuplicateGroup| write!(f, "{}", g.identity_key.variant)).header("Variant"),
            Column::new(|f, g: &DuplicateGroup| write!(f, "{}", Self::join_ids(&g.loser_ids))).header("Deleted"),
            Column::new(|f, g: &DuplicateGroup| {
                let referenced = g.members.iter().filter(|m| m.score.referenced).count();
                write!(f, "{}", referenced)
            }).header("Referenced").right(),
        ]).title(&title);

        for group in &plan.groups {
            stream.row(group.clone())?;
        }
        stream.finish()?;
        Ok(())
    }

    fn print_move_preview<W: Write>(out: &mut W, preview: &MovePreview) -> Result<(), CatMergeError> {
        writeln!(
            out,
            "Move '{}' ({}) -> '{}' ({})",
            preview.source.container_name(),
            preview.source.container_id(),
            preview.destination.container_name(),
            preview.destination.container_id()
        )?;
        writeln!(
            out,
            "  source items: {}, destination items: {}, conflicts: {}",
            preview.source_item_count, preview.destination_item_count, preview.conflict_count
        )?;
        writeln!(
            out,
            "  destination forces parallel: {}, destination canonical: {}, source protected: {}, source would archive: {}",
            preview.destination_forces_parallel,
            preview.destination_is_canonical,
            preview.source.is_protected(),
            preview.source_would_archive
        )?;

        if preview.conflicts.is_empty() {
            writeln!(out, "No Conflicts")?;
            return Ok(());
        }

        let mut stream = Stream::new(&mut *out, vec![
            Column::new(|f, c: &ConflictPair| write!(f, "{}", c.position_key)).header("Position"),
            Column::new(|f, c: &ConflictPair| write!(f, "{}", c.source_item_id)).header("Source ID").right(),
            Column::new(|f, c: &ConflictPair| write!(f, "{}", c.source_name)).header("Source Name"),
            Column::new(|f, c: &ConflictPair| write!(f, "{}", c.destination_item_id)).header("Dest ID").right(),
            Column::new(|f, c: &ConflictPair| write!(f, "{}", c.destination_name)).header("Dest Name"),
        ]).title("Conflicts");

        for pair in &preview.conflicts {
            stream.row(pair.clone())?;
        }
        stream.finish()?;
        Ok(())
    }

    fn write_json<W: Write, T: Serialize + ?Sized>(out: &mut W, value: &T) -> Result<(), CatMergeError> {
        serde_json::to_writer_pretty(&mut *out, value)?;
        writeln!(out)?;
        Ok(())
    }

    fn join_ids(ids: &[i64]) -> String {
        ids.iter().map(i64::to_string).collect::<Vec<_>>().join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::LogKind;
    use crate::container_move::ContainerMigrator;
    use crate::engine::Scope;
    use crate::test_support::Fixture;

    #[test]
    fn test_dedup_plan_json_is_tagged() {
        let fx = Fixture::new();
        let conn = fx.conn();
        let set_id = fx.container(&conn, "Fossil");
        let a = fx.item(&conn, set_id, "5", "Dragonite");
        fx.item(&conn, set_id, "5", "Dragonite");

        let plan = Plan::Dedup(DedupPlan::build(&conn, Scope::Container(set_id)).unwrap());
        let mut out = Vec::new();
        Reports::report_plan(&mut out, &plan, ReportFormat::Json).unwrap();

        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["operation"], "dedup");
        assert_eq!(value["scope"]["container"], set_id);
        assert_eq!(value["groups"][0]["survivor_id"], a);
        assert_eq!(value["groups"][0]["identity_key"]["display_name"], "Dragonite");
    }

    #[test]
    fn test_logs_json_uses_snake_case_kinds() {
        let logs = vec![LogSummary {
            kind: LogKind::Move,
            log_id: 3,
            initiator: "ops".into(),
            status: "completed".into(),
            source_container_id: Some(1),
            destination_container_id: Some(2),
            item_count: 12,
            conflict_count: 0,
            created_at: 1_700_000_000,
            closed_at: None,
        }];

        let mut out = Vec::new();
        Reports::report_logs(&mut out, &logs, ReportFormat::Json).unwrap();

        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value[0]["kind"], "move");
        assert_eq!(value[0]["closed_at"], serde_json::Value::Null);
    }

    #[test]
    fn test_empty_tables_print_placeholder() {
        let mut out = Vec::new();
        Reports::report_logs(&mut out, &[], ReportFormat::Table).unwrap();
        Reports::report_log_items(&mut out, &[], ReportFormat::Table).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "No Logs\nNo Items\n");
    }

    #[test]
    fn test_move_preview_table_without_conflicts() {
        let fx = Fixture::new();
        let conn = fx.conn();
        let source = fx.container_with(&conn, "Promo", false, true, false);
        let dest = fx.container(&conn, "Base Set");
        fx.item(&conn, source, "1", "Mew");

        let preview = ContainerMigrator::preview(&conn, source, dest).unwrap();
        let mut out = Vec::new();
        Reports::report_plan(&mut out, &Plan::Move(preview), ReportFormat::Table).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("source protected: true"));
        assert!(text.contains("source would archive: false"));
        assert!(text.ends_with("No Conflicts\n"));
    }

    #[test]
    fn test_rollback_table_line() {
        let outcome = RollbackOutcome {
            migration_log_id: 9,
            restored_count: 4,
            source_reactivated: true,
        };
        let mut out = Vec::new();
        Reports::report_rollback(&mut out, &outcome, ReportFormat::Table).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("Migration log 9 rolled back: 4 item(s) restored"));
        assert!(text.contains("reactivated"));
    }
}
