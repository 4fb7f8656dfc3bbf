use std::io;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use log::{debug, info};

use crate::audit::{LogFilter, LogKind};
use crate::config::Config;
use crate::database::Database;
use crate::engine::{Engine, OperationKind, RunContext, Scope};
use crate::error::CatMergeError;
use crate::reports::{ReportFormat, Reports};
use crate::utils::Utils;

#[derive(Parser)]
#[command(
    name = "catmerge",
    version,
    about = "CatMerge: catalog deduplication and container migration"
)]
pub struct Cli {
    /// Database file (default: catmerge.db in the data directory, or `database.path` from config)
    #[arg(long = "db", global = true)]
    pub db: Option<String>,

    /// Output format
    #[arg(long = "format", value_enum, default_value_t = ReportFormat::Table, global = true)]
    pub format: ReportFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show what an operation would do without changing anything
    Preview {
        #[command(subcommand)]
        operation: PreviewCommand,
    },

    /// Apply an operation
    Apply {
        #[command(subcommand)]
        operation: ApplyCommand,
    },

    /// Reverse a container move
    Rollback {
        /// Migration log ID
        #[arg(long = "log")]
        log: u64,

        /// Name recorded on the log (default: $USER)
        #[arg(long = "initiator")]
        initiator: Option<String>,
    },

    /// List move and dedup logs, newest first
    Logs {
        #[arg(
            long = "kind",
            value_parser = clap::builder::PossibleValuesParser::new(["move", "dedup"])
        )]
        kind: Option<String>,

        /// Only logs with this status (e.g. completed_with_conflicts, halted)
        #[arg(long = "status")]
        status: Option<String>,

        /// Only logs touching this container
        #[arg(long = "container")]
        container: Option<u64>,

        #[arg(long = "limit", default_value_t = 50)]
        limit: usize,
    },

    /// List the per-item rows of one container move
    #[command(name = "log-items")]
    LogItems {
        /// Migration log ID
        #[arg(long = "log")]
        log: u64,
    },
}

#[derive(Subcommand)]
pub enum PreviewCommand {
    /// Duplicate groups and their survivors
    Dedup {
        /// Limit to one container (default: whole catalog)
        #[arg(long = "container")]
        container: Option<u64>,
    },

    /// Counts and conflicts for moving one container into another
    Move {
        #[arg(long = "source")]
        source: u64,

        #[arg(long = "dest")]
        dest: u64,
    },
}

#[derive(Subcommand)]
pub enum ApplyCommand {
    /// Merge duplicates onto their survivors and delete the rest
    Dedup {
        /// Limit to one container (default: whole catalog, requires --confirm)
        #[arg(long = "container")]
        container: Option<u64>,

        /// Groups per transaction (default: engine.batch_size)
        #[arg(long = "batch-size")]
        batch_size: Option<usize>,

        #[arg(long = "initiator")]
        initiator: Option<String>,

        /// Confirmation phrase
        #[arg(long = "confirm")]
        confirm: Option<String>,
    },

    /// Move every item of a container into another
    Move {
        #[arg(long = "source")]
        source: u64,

        #[arg(long = "dest")]
        dest: u64,

        #[arg(long = "initiator")]
        initiator: Option<String>,

        /// Confirmation phrase, required when the preview reports conflicts
        #[arg(long = "confirm")]
        confirm: Option<String>,
    },
}

fn to_id(value: u64) -> Result<i64, CatMergeError> {
    Utils::opt_u64_to_opt_i64(Some(value))
        .ok_or_else(|| CatMergeError::Validation(format!("ID {} is out of range", value)))
}

fn to_scope(container: Option<u64>) -> Result<Scope, CatMergeError> {
    Ok(match container {
        Some(id) => Scope::Container(to_id(id)?),
        None => Scope::Catalog,
    })
}

impl Cli {
    pub fn handle_command_line(config: &Config, data_dir: &Path) -> Result<(), CatMergeError> {
        let args = Cli::parse();
        args.run(config, data_dir)
    }

    fn run(self, config: &Config, data_dir: &Path) -> Result<(), CatMergeError> {
        let db_path = match &self.db {
            Some(path) => PathBuf::from(path),
            None => config.database.resolve_path(data_dir),
        };
        let db = Database::open(&db_path, config.database.busy_timeout_ms())?;
        let conn = db.get_connection()?;

        let engine = Engine::new(&config.engine);
        let mut out = io::stdout().lock();
        let format = self.format;

        match self.command {
            Command::Preview { operation } => {
                let (ctx, kind) = match operation {
                    PreviewCommand::Dedup { container } => (
                        RunContext::preview(to_scope(container)?, &Utils::default_initiator()),
                        OperationKind::Dedup,
                    ),
                    PreviewCommand::Move { source, dest } => (
                        RunContext::preview(Scope::Container(to_id(source)?), &Utils::default_initiator()),
                        OperationKind::MoveContainer {
                            destination_container_id: to_id(dest)?,
                        },
                    ),
                };
                debug!("Preview {:?} over {} (dry run: {})", kind, ctx.scope(), ctx.is_dry_run());
                let plan = engine.preview(&conn, &ctx, kind)?;
                Reports::report_plan(&mut out, &plan, format)
            }
            Command::Apply { operation } => {
                let (ctx, kind, confirm) = match operation {
                    ApplyCommand::Dedup {
                        container,
                        batch_size,
                        initiator,
                        confirm,
                    } => (
                        RunContext::apply(
                            to_scope(container)?,
                            batch_size.unwrap_or(config.engine.batch_size()),
                            &initiator.unwrap_or_else(Utils::default_initiator),
                        ),
                        OperationKind::Dedup,
                        confirm,
                    ),
                    ApplyCommand::Move {
                        source,
                        dest,
                        initiator,
                        confirm,
                    } => (
                        RunContext::apply(
                            Scope::Container(to_id(source)?),
                            config.engine.batch_size(),
                            &initiator.unwrap_or_else(Utils::default_initiator),
                        ),
                        OperationKind::MoveContainer {
                            destination_container_id: to_id(dest)?,
                        },
                        confirm,
                    ),
                };
                info!("Apply {:?} over {} by '{}'", kind, ctx.scope(), ctx.initiator());
                let outcome = engine.apply(&conn, &ctx, kind, confirm.as_deref())?;
                Reports::report_apply(&mut out, &outcome, format)?;

                // Committed batches stand; the exit status still reports the halt
                match outcome.failure {
                    Some(failure) => Err(CatMergeError::TransactionFailure(failure)),
                    None => Ok(()),
                }
            }
            Command::Rollback { log, initiator } => {
                let initiator = initiator.unwrap_or_else(Utils::default_initiator);
                let outcome = engine.rollback(&conn, to_id(log)?, &initiator)?;
                Reports::report_rollback(&mut out, &outcome, format)
            }
            Command::Logs {
                kind,
                status,
                container,
                limit,
            } => {
                let kind = kind
                    .map(|k| k.parse::<LogKind>())
                    .transpose()
                    .map_err(|e| CatMergeError::Validation(format!("Invalid log kind: {}", e)))?;
                let filter = LogFilter {
                    kind,
                    status,
                    container_id: container.map(to_id).transpose()?,
                    limit,
                };
                let logs = engine.get_logs(&conn, &filter)?;
                Reports::report_logs(&mut out, &logs, format)
            }
            Command::LogItems { log } => {
                let items = engine.get_log_items(&conn, to_id(log)?)?;
                Reports::report_log_items(&mut out, &items, format)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_cli_parsing_preview_dedup_defaults() {
        let cli = Cli::try_parse_from(["catmerge", "preview", "dedup"]).unwrap();
        assert_eq!(cli.format, ReportFormat::Table);
        assert!(cli.db.is_none());
        assert!(matches!(
            cli.command,
            Command::Preview {
                operation: PreviewCommand::Dedup { container: None }
            }
        ));
    }

    #[test]
    fn test_cli_parsing_apply_move_with_global_flags() {
        let cli = Cli::try_parse_from([
            "catmerge",
            "apply",
            "move",
            "--source",
            "3",
            "--dest",
            "4",
            "--confirm",
            "MERGE WITH CONFLICTS",
            "--format",
            "json",
            "--db",
            "/tmp/cat.db",
        ])
        .unwrap();

        assert_eq!(cli.format, ReportFormat::Json);
        assert_eq!(cli.db.as_deref(), Some("/tmp/cat.db"));
        match cli.command {
            Command::Apply {
                operation:
                    ApplyCommand::Move {
                        source,
                        dest,
                        confirm,
                        initiator,
                    },
            } => {
                assert_eq!((source, dest), (3, 4));
                assert_eq!(confirm.as_deref(), Some("MERGE WITH CONFLICTS"));
                assert!(initiator.is_none());
            }
            _ => panic!("expected apply move"),
        }
    }

    #[test]
    fn test_cli_parsing_logs() {
        let cli = Cli::try_parse_from(["catmerge", "logs", "--kind", "dedup", "--limit", "5"]).unwrap();
        match cli.command {
            Command::Logs { kind, limit, .. } => {
                assert_eq!(kind.as_deref(), Some("dedup"));
                assert_eq!(limit, 5);
            }
            _ => panic!("expected logs"),
        }
    }

    #[test]
    fn test_cli_parsing_invalid_arguments() {
        assert!(Cli::try_parse_from(["catmerge"]).is_err(), "A command is required");
        assert!(Cli::try_parse_from(["catmerge", "logs", "--kind", "scan"]).is_err());
        assert!(Cli::try_parse_from(["catmerge", "preview", "move", "--source", "1"]).is_err());
        assert!(Cli::try_parse_from(["catmerge", "rollback"]).is_err());
        assert!(Cli::try_parse_from(["catmerge", "--format", "csv", "logs"]).is_err());
    }
}
