//! Command-line surface for `trigger` (SPEC_FULL.md §C.7).
//!
//! Kept in its own module so the option table is defined exactly once: the
//! two historical bugs this surface must not repeat (SPEC_FULL.md §C.7 /
//! spec.md §9) are a duplicated option-table function and a `-q` arm that
//! falls through into `-r` — both are symptoms of hand-rolled getopt
//! parsing, and both are structurally impossible once clap derives the
//! table from one struct.

use clap::{ArgGroup, Parser};
use std::fmt;
use std::path::PathBuf;

/// The max magnitude of `--offset`, in seconds (SPEC_FULL.md §C.7).
pub const OFFSET_LIMIT: i32 = 32_000;

#[derive(Parser, Debug)]
#[command(
    name = "trigger",
    about = "Define, list, or clear block-manager event triggers",
    group(ArgGroup::new("mode").args(["set", "get", "clear"]).required(true))
)]
pub struct Cli {
    /// Define a new trigger.
    #[arg(long)]
    pub set: bool,
    /// List triggers matching the given filters.
    #[arg(long)]
    pub get: bool,
    /// Remove triggers matching the given filters.
    #[arg(long)]
    pub clear: bool,

    #[arg(long)]
    pub down: bool,
    #[arg(long)]
    pub drained: bool,
    #[arg(long)]
    pub fail: bool,
    #[arg(long)]
    pub idle: bool,
    #[arg(long)]
    pub up: bool,
    #[arg(long)]
    pub fini: bool,
    #[arg(long)]
    pub time: bool,
    #[arg(long)]
    pub reconfig: bool,
    #[arg(long = "block_err")]
    pub block_err: bool,
    #[arg(long = "front_end")]
    pub front_end: bool,
    #[arg(long = "primary_slurmctld_failure")]
    pub primary_slurmctld_failure: bool,
    #[arg(long = "primary_slurmctld_resumed_operation")]
    pub primary_slurmctld_resumed_operation: bool,
    #[arg(long = "primary_slurmctld_resumed_control")]
    pub primary_slurmctld_resumed_control: bool,
    #[arg(long = "primary_slurmctld_acct_buffer_full")]
    pub primary_slurmctld_acct_buffer_full: bool,
    #[arg(long = "backup_slurmctld_failure")]
    pub backup_slurmctld_failure: bool,
    #[arg(long = "backup_slurmctld_resumed_operation")]
    pub backup_slurmctld_resumed_operation: bool,
    #[arg(long = "backup_slurmctld_assumed_control")]
    pub backup_slurmctld_assumed_control: bool,
    #[arg(long = "primary_slurmdbd_failure")]
    pub primary_slurmdbd_failure: bool,
    #[arg(long = "primary_slurmdbd_resumed_operation")]
    pub primary_slurmdbd_resumed_operation: bool,
    #[arg(long = "primary_database_failure")]
    pub primary_database_failure: bool,
    #[arg(long = "primary_database_resumed_operation")]
    pub primary_database_resumed_operation: bool,

    /// Match/clear by trigger id.
    #[arg(long)]
    pub id: Option<u32>,
    /// Match/clear by job id; required with `--time` or `--fini`.
    #[arg(long)]
    pub jobid: Option<i64>,
    /// Match a specific node, or any node when given with no value.
    #[arg(long, num_args = 0..=1, default_missing_value = "")]
    pub node: Option<String>,
    /// Match/clear by the triggering user, as a name or a numeric uid.
    #[arg(long)]
    pub user: Option<String>,
    /// Seconds before (negative) or after (positive) `--time` to fire,
    /// within ±32000.
    #[arg(long, allow_hyphen_values = true)]
    pub offset: Option<i32>,
    /// Absolute path of the program to run when the trigger fires.
    #[arg(long)]
    pub program: Option<PathBuf>,
    /// Permission string controlling who may clear the trigger.
    #[arg(long)]
    pub flags: Option<String>,
    /// Suppress the column header on `--get` output.
    #[arg(long)]
    pub noheader: bool,
    /// Suppress all non-error output.
    #[arg(short = 'q', long)]
    pub quiet: bool,
    /// Print the full trigger descriptor instead of the one-line summary.
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Set,
    Get,
    Clear,
}

impl Cli {
    pub fn mode(&self) -> Mode {
        if self.set {
            Mode::Set
        } else if self.clear {
            Mode::Clear
        } else {
            Mode::Get
        }
    }

    pub fn selected_events(&self) -> Vec<EventKind> {
        EventKind::ALL
            .iter()
            .copied()
            .filter(|k| k.is_set(self))
            .collect()
    }
}

/// One event a trigger may fire on (SPEC_FULL.md §C.7). Kept as a fixed
/// table of `(variant, field-accessor, wire name)` so the printable name
/// and the flag that sets it can never drift apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Down,
    Drained,
    Fail,
    Idle,
    Up,
    Fini,
    Time,
    Reconfig,
    BlockErr,
    FrontEnd,
    PrimarySlurmctldFailure,
    PrimarySlurmctldResumedOperation,
    PrimarySlurmctldResumedControl,
    PrimarySlurmctldAcctBufferFull,
    BackupSlurmctldFailure,
    BackupSlurmctldResumedOperation,
    BackupSlurmctldAssumedControl,
    PrimarySlurmdbdFailure,
    PrimarySlurmdbdResumedOperation,
    PrimaryDatabaseFailure,
    PrimaryDatabaseResumedOperation,
}

impl EventKind {
    pub const ALL: [EventKind; 21] = [
        EventKind::Down,
        EventKind::Drained,
        EventKind::Fail,
        EventKind::Idle,
        EventKind::Up,
        EventKind::Fini,
        EventKind::Time,
        EventKind::Reconfig,
        EventKind::BlockErr,
        EventKind::FrontEnd,
        EventKind::PrimarySlurmctldFailure,
        EventKind::PrimarySlurmctldResumedOperation,
        EventKind::PrimarySlurmctldResumedControl,
        EventKind::PrimarySlurmctldAcctBufferFull,
        EventKind::BackupSlurmctldFailure,
        EventKind::BackupSlurmctldResumedOperation,
        EventKind::BackupSlurmctldAssumedControl,
        EventKind::PrimarySlurmdbdFailure,
        EventKind::PrimarySlurmdbdResumedOperation,
        EventKind::PrimaryDatabaseFailure,
        EventKind::PrimaryDatabaseResumedOperation,
    ];

    fn is_set(self, cli: &Cli) -> bool {
        match self {
            EventKind::Down => cli.down,
            EventKind::Drained => cli.drained,
            EventKind::Fail => cli.fail,
            EventKind::Idle => cli.idle,
            EventKind::Up => cli.up,
            EventKind::Fini => cli.fini,
            EventKind::Time => cli.time,
            EventKind::Reconfig => cli.reconfig,
            EventKind::BlockErr => cli.block_err,
            EventKind::FrontEnd => cli.front_end,
            EventKind::PrimarySlurmctldFailure => cli.primary_slurmctld_failure,
            EventKind::PrimarySlurmctldResumedOperation => cli.primary_slurmctld_resumed_operation,
            EventKind::PrimarySlurmctldResumedControl => cli.primary_slurmctld_resumed_control,
            EventKind::PrimarySlurmctldAcctBufferFull => cli.primary_slurmctld_acct_buffer_full,
            EventKind::BackupSlurmctldFailure => cli.backup_slurmctld_failure,
            EventKind::BackupSlurmctldResumedOperation => cli.backup_slurmctld_resumed_operation,
            EventKind::BackupSlurmctldAssumedControl => cli.backup_slurmctld_assumed_control,
            EventKind::PrimarySlurmdbdFailure => cli.primary_slurmdbd_failure,
            EventKind::PrimarySlurmdbdResumedOperation => cli.primary_slurmdbd_resumed_operation,
            EventKind::PrimaryDatabaseFailure => cli.primary_database_failure,
            EventKind::PrimaryDatabaseResumedOperation => cli.primary_database_resumed_operation,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::Down => "down",
            EventKind::Drained => "drained",
            EventKind::Fail => "fail",
            EventKind::Idle => "idle",
            EventKind::Up => "up",
            EventKind::Fini => "fini",
            EventKind::Time => "time",
            EventKind::Reconfig => "reconfig",
            EventKind::BlockErr => "block_err",
            EventKind::FrontEnd => "front_end",
            EventKind::PrimarySlurmctldFailure => "primary_slurmctld_failure",
            EventKind::PrimarySlurmctldResumedOperation => "primary_slurmctld_resumed_operation",
            EventKind::PrimarySlurmctldResumedControl => "primary_slurmctld_resumed_control",
            EventKind::PrimarySlurmctldAcctBufferFull => "primary_slurmctld_acct_buffer_full",
            EventKind::BackupSlurmctldFailure => "backup_slurmctld_failure",
            EventKind::BackupSlurmctldResumedOperation => "backup_slurmctld_resumed_operation",
            EventKind::BackupSlurmctldAssumedControl => "backup_slurmctld_assumed_control",
            EventKind::PrimarySlurmdbdFailure => "primary_slurmdbd_failure",
            EventKind::PrimarySlurmdbdResumedOperation => "primary_slurmdbd_resumed_operation",
            EventKind::PrimaryDatabaseFailure => "primary_database_failure",
            EventKind::PrimaryDatabaseResumedOperation => "primary_database_resumed_operation",
        };
        f.write_str(s)
    }
}

/// A validation failure (exit code 1, spec.md §7 "user-visible behavior").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError(pub String);

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ValidationError {}

fn err(msg: impl Into<String>) -> ValidationError {
    ValidationError(msg.into())
}

/// Checks the option combination against the rules in SPEC_FULL.md §C.7
/// before anything is sent anywhere.
pub fn validate(cli: &Cli) -> Result<(), ValidationError> {
    let events = cli.selected_events();

    match cli.mode() {
        Mode::Set => {
            if events.is_empty() {
                return Err(err("--set requires at least one event selector"));
            }
            if cli.program.is_none() {
                return Err(err("--set requires --program"));
            }
            if let Some(program) = &cli.program {
                if !program.is_absolute() {
                    return Err(err(format!(
                        "--program must be an absolute path, got {}",
                        program.display()
                    )));
                }
                if !program.is_file() {
                    return Err(err(format!(
                        "--program must refer to a regular file, got {}",
                        program.display()
                    )));
                }
            }
            if (cli.time || cli.fini) && cli.jobid.is_none() {
                return Err(err("--time and --fini require --jobid"));
            }
        }
        Mode::Get => {}
        Mode::Clear => {
            if cli.id.is_none() && cli.jobid.is_none() && cli.user.is_none() {
                return Err(err("--clear requires at least one of --id, --jobid, --user"));
            }
        }
    }

    if let Some(offset) = cli.offset {
        if offset.unsigned_abs() > OFFSET_LIMIT as u32 {
            return Err(err(format!(
                "--offset={offset} is outside the allowed range of +/-{OFFSET_LIMIT}"
            )));
        }
    }

    if let Some(flags) = &cli.flags {
        if flags.is_empty() || !flags.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(err(format!(
                "--flags={flags:?} must be a non-empty string of permission letters"
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut full = vec!["trigger"];
        full.extend_from_slice(args);
        Cli::parse_from(full)
    }

    #[test]
    fn set_without_program_is_rejected() {
        let cli = parse(&["--set", "--down"]);
        assert!(validate(&cli).is_err());
    }

    #[test]
    fn set_with_program_and_event_is_accepted() {
        let cli = parse(&["--set", "--down", "--program=/bin/sh"]);
        assert!(validate(&cli).is_ok());
    }

    #[test]
    fn time_without_jobid_is_rejected() {
        let cli = parse(&["--set", "--time", "--program=/bin/sh"]);
        assert!(validate(&cli).is_err());
    }

    #[test]
    fn clear_without_any_filter_is_rejected() {
        let cli = parse(&["--clear"]);
        assert!(validate(&cli).is_err());
    }

    #[test]
    fn clear_by_jobid_is_accepted() {
        let cli = parse(&["--clear", "--jobid=42"]);
        assert!(validate(&cli).is_ok());
    }

    #[test]
    fn offset_out_of_range_is_rejected() {
        let cli = parse(&[
            "--set",
            "--time",
            "--jobid=1",
            "--program=/bin/sh",
            "--offset=40000",
        ]);
        assert!(validate(&cli).is_err());
    }

    #[test]
    fn quiet_and_verbose_are_independent_flags() {
        // Regression guard for the historical `-q` falling through to `-r`
        // (spec.md §9): both flags must be settable independently, and
        // neither may silently enable the other.
        let cli = parse(&["--get", "-q"]);
        assert!(cli.quiet);
        assert!(!cli.verbose);
        let cli = parse(&["--get", "-v"]);
        assert!(!cli.quiet);
        assert!(cli.verbose);
    }

    #[test]
    fn get_mode_requires_no_event_selector() {
        let cli = parse(&["--get"]);
        assert!(validate(&cli).is_ok());
    }
}
