mod render;

use std::io::{self, Write};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fieldcast_core::{failure, failure_code, note_termination_signal, FailureCode, UpdateConfig};
use fieldcast_engine::{
    CarryState, DirtyPolicy, Handoff, ResumeOutcome, SwitchOutcome, UpdateEngine,
};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

const DEFAULT_CONFIG_PATH: &str = "/etc/fieldcast/update.toml";

#[derive(Parser, Debug)]
#[command(name = "fieldcast-update")]
#[command(about = "Version manager for the fieldcast audio suite", long_about = None)]
struct Cli {
    /// Path to update.toml; defaults to /etc/fieldcast/update.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Switch the managed checkout to a tag, branch, commit, or alias
    /// (latest-stable, latest-dev).
    Switch {
        target: String,
        /// Stash local edits and restore them after the switch (default).
        #[arg(long, conflicts_with = "discard_local")]
        stash: bool,
        /// Discard local edits instead of stashing them.
        #[arg(long)]
        discard_local: bool,
        /// Skip the confirmation prompt.
        #[arg(long, short = 'y')]
        yes: bool,
    },
    /// Show the current version, repository state, and service state.
    Status,
    /// List switchable tags and branches.
    List,
    /// Discard all local changes and force the checkout to a target.
    Reset {
        target: String,
        /// Must be exactly `discard-local-changes`.
        #[arg(long)]
        confirm: String,
    },
    /// Finish or roll back an update that was interrupted mid-switch.
    Resume {
        #[arg(long, hide = true, value_name = "COMMIT", conflicts_with = "carry_none")]
        carry_stash: Option<String>,
        #[arg(long, hide = true)]
        carry_none: bool,
    },
}

fn main() {
    if let Err(err) = install_signal_handlers() {
        render::print_error(&format!("{err:#}"));
        std::process::exit(1);
    }
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        render::print_error(&format!("{err:#}"));
        std::process::exit(exit_code_for(&err));
    }
}

fn run(cli: Cli) -> Result<()> {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = UpdateConfig::load_or_default(&config_path)?;
    let mut engine = UpdateEngine::open(config);

    match cli.command {
        Commands::Switch {
            target,
            stash: _,
            discard_local,
            yes,
        } => {
            let policy = if discard_local {
                DirtyPolicy::Discard
            } else {
                DirtyPolicy::Stash
            };
            if !yes
                && !confirm(&format!(
                    "Switch the fieldcast checkout to '{target}'? The stream service will be restarted."
                ))?
            {
                println!("aborted");
                return Ok(());
            }

            let spinner = render::spinner(&format!("switching to {target}"));
            let outcome = engine.switch(&target, policy);
            spinner.finish_and_clear();
            match outcome? {
                SwitchOutcome::Completed(report) => {
                    render::print_warnings(&report.warnings);
                    if report.stashed {
                        println!("local edits were stashed and restored");
                    }
                    render::print_success(&format!(
                        "switched from {} to {} ({})",
                        report.from_ref,
                        report.target.refname,
                        short_commit(&report.target.resolved_commit)
                    ));
                }
                SwitchOutcome::AlreadyAtTarget { target, warnings } => {
                    render::print_warnings(&warnings);
                    render::print_success(&format!(
                        "already at {} ({})",
                        target.refname,
                        short_commit(&target.resolved_commit)
                    ));
                }
                SwitchOutcome::HandoffTo(handoff) => {
                    println!("this tool was updated; restarting with the new artifact");
                    return Err(exec_handoff(&handoff));
                }
            }
        }
        Commands::Status => {
            let status = engine.status()?;
            render::print_section("fieldcast");
            println!("version:  {}", status.describe);
            println!(
                "ref:      {} ({})",
                status.current_ref,
                short_commit(&status.head_commit)
            );
            println!("repo:     {}", status.repo_state.as_str());
            println!(
                "service:  {}{}",
                if status.service_active {
                    "running"
                } else {
                    "stopped"
                },
                if status.service_enabled {
                    ", enabled"
                } else {
                    ""
                }
            );
            if status.marker_present {
                render::print_warning(
                    "an interrupted update is pending; run `fieldcast-update resume`",
                );
            }
        }
        Commands::List => {
            let (candidates, warning) = engine.list()?;
            if let Some(warning) = warning {
                render::print_warning(&warning);
            }
            render::print_section("tags");
            for tag in &candidates.tags {
                println!("{tag}");
            }
            render::print_section("branches");
            for branch in &candidates.branches {
                println!("{branch}");
            }
        }
        Commands::Reset { target, confirm } => {
            let spinner = render::spinner(&format!("resetting to {target}"));
            let report = engine.hard_reset(&target, &confirm);
            spinner.finish_and_clear();
            let report = report?;
            render::print_warnings(&report.warnings);
            render::print_success(&format!(
                "reset to {} ({})",
                report.target.refname,
                short_commit(&report.target.resolved_commit)
            ));
        }
        Commands::Resume {
            carry_stash,
            carry_none,
        } => {
            let carry = carry_from_flags(carry_stash, carry_none);
            match engine.resume(carry)? {
                None => println!("no interrupted update to resume"),
                Some(ResumeOutcome::Completed {
                    target_refname,
                    warnings,
                }) => {
                    render::print_warnings(&warnings);
                    render::print_success(&format!("finished the update to {target_refname}"));
                }
                Some(ResumeOutcome::RolledBack {
                    restored_ref,
                    warnings,
                }) => {
                    render::print_warnings(&warnings);
                    render::print_success(&format!(
                        "rolled back the interrupted update; back on {restored_ref}"
                    ));
                }
            }
        }
    }
    Ok(())
}

fn carry_from_flags(carry_stash: Option<String>, carry_none: bool) -> Option<CarryState> {
    match (carry_stash, carry_none) {
        (Some(commit), _) => Some(CarryState::Stash { commit }),
        (None, true) => Some(CarryState::None),
        (None, false) => None,
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    failure_code(err).map(|code| code.exit_code()).unwrap_or(1)
}

fn short_commit(commit: &str) -> &str {
    &commit[..commit.len().min(12)]
}

fn confirm(question: &str) -> Result<bool> {
    print!("{question} [y/N] ");
    io::stdout().flush().context("failed flushing stdout")?;
    let mut line = String::new();
    io::stdin()
        .read_line(&mut line)
        .context("failed reading confirmation")?;
    let answer = line.trim().to_ascii_lowercase();
    Ok(answer == "y" || answer == "yes")
}

/// The only place the process is replaced. Returning from `exec` at all is
/// the failure; by then the new revision is checked out and the service is
/// down, so the operator must finish by hand.
fn exec_handoff(handoff: &Handoff) -> anyhow::Error {
    let err = Command::new(&handoff.artifact).args(&handoff.args).exec();
    failure(
        FailureCode::ProcessReplacementFailed,
        format!(
            "could not replace this process with {}: {err}; run `{} {}` manually",
            handoff.artifact.display(),
            handoff.artifact.display(),
            handoff.args.join(" ")
        ),
    )
}

extern "C" fn on_termination(_signal: nix::libc::c_int) {
    // Async-signal-safe: a single atomic store.
    note_termination_signal();
}

fn install_signal_handlers() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_termination),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGINT, &action).context("failed installing SIGINT handler")?;
        sigaction(Signal::SIGTERM, &action).context("failed installing SIGTERM handler")?;
    }
    Ok(())
}
