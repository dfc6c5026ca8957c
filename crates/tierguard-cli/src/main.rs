use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use tierguard_core::{
    policy_table, AuditSink, DirectoryScanner, EngineError, EngineSettings, JsonlAuditLog,
    OperationKind, PermissionContext, SafeOperations, TracingAuditSink,
};

#[derive(Parser, Debug)]
#[command(name = "tierguard", version)]
#[command(about = "Importance-tiered file protection and backup", long_about = None)]
struct Cli {
    /// Settings file (defaults to settings.json in the data directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log decisions to stderr instead of the audit log file
    #[arg(long, global = true)]
    no_audit: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Evaluate an operation without performing it (exit 1 when denied)
    Check {
        path: PathBuf,
        /// read, append, modify, overwrite or delete
        #[arg(default_value = "delete")]
        operation: String,
        #[arg(long)]
        confirmed: bool,
        #[arg(long)]
        backup_created: bool,
        #[arg(long)]
        reason: Option<String>,
    },

    /// Classify every file under a directory
    Scan {
        #[arg(default_value = ".")]
        directory: PathBuf,
    },

    /// Take a backup and print its path
    Backup {
        path: PathBuf,
        #[arg(default_value = "manual")]
        reason: String,
    },

    /// Guarded delete, confirmed and backed up
    SafeDelete {
        path: PathBuf,
        #[arg(long)]
        reason: Option<String>,
    },

    /// Guarded content replacement
    SafeModify {
        path: PathBuf,
        /// New content as a literal string
        #[arg(long, conflicts_with = "content_file", required_unless_present = "content_file")]
        content: Option<String>,
        /// Read new content from a file
        #[arg(long)]
        content_file: Option<PathBuf>,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long)]
        confirmed: bool,
        #[arg(long)]
        backup_created: bool,
    },

    /// Print the policy table
    Levels {
        #[arg(long)]
        json: bool,
    },

    /// List backups of a file, newest first
    Backups { path: PathBuf },

    /// Re-hash a backup and compare it with its sidecar
    VerifyBackup { sidecar: PathBuf },

    /// Show recent audit entries
    Audit {
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
}

#[derive(Serialize)]
struct ErrorPayload<'a> {
    error: &'a str,
    message: String,
}

fn main() -> Result<ExitCode> {
    // the tracing audit sink always reaches stderr
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"))
        .add_directive("audit=info".parse()?);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => Ok(code),
        Err(err) => match err.downcast_ref::<EngineError>() {
            Some(engine_err) if engine_err.is_expected() => {
                print_json(&ErrorPayload {
                    error: engine_err.kind(),
                    message: engine_err.to_string(),
                })?;
                Ok(ExitCode::FAILURE)
            }
            _ => Err(err),
        },
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let settings = EngineSettings::load_or_default(cli.config.as_deref())?;
    debug!(?settings, "settings resolved");

    match cli.command {
        Commands::Check {
            path,
            operation,
            confirmed,
            backup_created,
            reason,
        } => {
            let ops = engine(&settings, cli.no_audit);
            let ctx = context(confirmed, backup_created, reason);
            let decision = ops.check(&path, &OperationKind::from(operation.as_str()), &ctx);
            print_json(&decision)?;
            Ok(exit_for(decision.allowed))
        }
        Commands::Scan { directory } => {
            let report = DirectoryScanner::new(&settings).scan(&directory)?;
            print_json(&report)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Backup { path, reason } => {
            let ops = engine(&settings, cli.no_audit);
            let record = ops.safe_backup(&path, &reason)?;
            println!("{}", record.backup_path);
            Ok(ExitCode::SUCCESS)
        }
        Commands::SafeDelete { path, reason } => {
            let ops = engine(&settings, cli.no_audit);
            let ctx = context(true, true, reason);
            let outcome = ops.safe_delete(&path, &ctx)?;
            print_json(&outcome)?;
            Ok(exit_for(outcome.performed))
        }
        Commands::SafeModify {
            path,
            content,
            content_file,
            reason,
            confirmed,
            backup_created,
        } => {
            let bytes = match (content, content_file) {
                (Some(text), _) => text.into_bytes(),
                (None, Some(file)) => std::fs::read(&file)
                    .with_context(|| format!("reading {}", file.display()))?,
                (None, None) => unreachable!("clap requires --content or --content-file"),
            };
            let ops = engine(&settings, cli.no_audit);
            let ctx = context(confirmed, backup_created, reason);
            let outcome = ops.safe_modify(&path, &bytes, &ctx)?;
            print_json(&outcome)?;
            Ok(exit_for(outcome.performed))
        }
        Commands::Levels { json } => {
            if json {
                print_json(&policy_table())?;
            } else {
                print_levels();
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Backups { path } => {
            let ops = engine(&settings, cli.no_audit);
            let records = ops.backups().list_backups(&path)?;
            print_json(&records)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::VerifyBackup { sidecar } => {
            let ops = engine(&settings, true);
            let record = ops.backups().load_record(&sidecar)?;
            let valid = ops.backups().verify_backup(&record)?;
            print_json(&serde_json::json!({
                "backupPath": record.backup_path,
                "valid": valid,
            }))?;
            Ok(exit_for(valid))
        }
        Commands::Audit { limit } => {
            let log = JsonlAuditLog::open(settings.audit_log_path()?, settings.audit_log_max_bytes)?;
            let entries = log.read_recent(None, Some(limit))?;
            print_json(&entries)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn engine(settings: &EngineSettings, no_audit: bool) -> SafeOperations {
    SafeOperations::on_disk(audit_sink(settings, no_audit), settings.clone())
}

fn audit_sink(settings: &EngineSettings, no_audit: bool) -> Arc<dyn AuditSink> {
    if no_audit {
        return Arc::new(TracingAuditSink);
    }
    let opened = settings
        .audit_log_path()
        .and_then(|path| JsonlAuditLog::open(path, settings.audit_log_max_bytes));
    match opened {
        Ok(log) => Arc::new(log),
        Err(e) => {
            warn!(error = %e, "audit log unavailable; decisions go to stderr only");
            Arc::new(TracingAuditSink)
        }
    }
}

fn context(confirmed: bool, backup_created: bool, reason: Option<String>) -> PermissionContext {
    PermissionContext {
        user_confirmed: confirmed,
        backup_created,
        reason,
    }
}

fn exit_for(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_levels() {
    println!("{:<10} {:<8} {:<40} {}", "CLASS", "LEVELS", "REQUIRED", "DESCRIPTION");
    for row in policy_table() {
        let actions: Vec<&str> = row.required_actions.iter().map(|a| a.as_str()).collect();
        let actions = if actions.is_empty() {
            "-".to_string()
        } else {
            actions.join(", ")
        };
        println!(
            "{:<10} {:<8} {:<40} {}",
            row.class.as_str(),
            format!("{}-{}", row.min_level, row.max_level),
            actions,
            row.description
        );
    }
}
