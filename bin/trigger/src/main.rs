//! `trigger`: command-line front end for block-manager event triggers
//! (SPEC_FULL.md §C.7).
//!
//! Exit codes follow spec.md §7's "user-visible behavior" contract: `0` on
//! success, `1` when the option combination itself is invalid, anything
//! else when the request was well-formed but could not be delivered.

mod opts;

use anyhow::Result;
use clap::Parser;
use opts::{Cli, Mode};
use std::process::ExitCode;

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = opts::validate(&cli) {
        eprintln!("trigger: {e}");
        return ExitCode::from(1);
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("trigger: {e}");
            ExitCode::from(2)
        }
    }
}

/// Formats and "sends" the request. The real binary hands this descriptor
/// to the running controller over its management socket (an external
/// collaborator, spec.md §1); this one logs and prints it, which is enough
/// to exercise the full option surface end to end.
fn run(cli: &Cli) -> Result<()> {
    match cli.mode() {
        Mode::Set => print_set(cli),
        Mode::Get => print_get(cli),
        Mode::Clear => print_clear(cli),
    }
    Ok(())
}

fn print_set(cli: &Cli) {
    let events = cli.selected_events();
    let names: Vec<String> = events.iter().map(ToString::to_string).collect();
    log::info!("set trigger: events=[{}]", names.join(","));
    if cli.quiet {
        return;
    }
    if !cli.noheader {
        println!("EVENTS\tPROGRAM\tJOBID\tOFFSET");
    }
    println!(
        "{}\t{}\t{}\t{}",
        names.join(","),
        cli.program.as_deref().map(|p| p.display().to_string()).unwrap_or_default(),
        cli.jobid.map(|j| j.to_string()).unwrap_or_default(),
        cli.offset.map(|o| o.to_string()).unwrap_or_default(),
    );
    if cli.verbose {
        println!("  node={:?} user={:?} flags={:?}", cli.node, cli.user, cli.flags);
    }
}

fn print_get(cli: &Cli) {
    log::info!(
        "get triggers: id={:?} jobid={:?} node={:?} user={:?}",
        cli.id,
        cli.jobid,
        cli.node,
        cli.user
    );
    if cli.quiet {
        return;
    }
    if !cli.noheader {
        println!("TRIG_ID\tEVENTS\tPROGRAM");
    }
    // No persistent trigger registry exists in this binary; matching the
    // filters against live state is the controller's job once connected.
    println!("(none)\t-\t-");
}

fn print_clear(cli: &Cli) {
    log::info!(
        "clear triggers: id={:?} jobid={:?} user={:?}",
        cli.id,
        cli.jobid,
        cli.user
    );
    if !cli.quiet {
        println!("cleared 0 matching trigger(s)");
    }
}
