//! rostersync: keeps a community guild roster consistent.
//!
//! Three sources of truth drift independently:
//!
//! - the **game API**, authoritative for "is this character in the guild";
//! - the **registry** (`roster.db`), authoritative for "who claims this character";
//! - the **chat platform**, authoritative for "what privileges a member holds".
//!
//! # Architecture
//!
//! ## Registration and the retry queue
//!
//! A registration request is validated by [`plugins::registration`]. When the
//! character is not yet visible in the guild, the request is parked as a
//! pending attempt that [`plugins::queue`] re-checks every cycle until it
//! succeeds, fails, or expires (72h by default).
//!
//! ## Reconciliation
//!
//! [`plugins::scan`] compares the game roster, the registry and platform
//! privileges in four phases (gather, leavers, reverse role scan, role
//! consistency) and corrects drift, or only reports it in dry-run mode.
//!
//! ## The Thin Waist
//!
//! All registry access routes through `core::broker::DbBroker` for in-process
//! serialization and an audit trail (`broker.events.jsonl`).
//!
//! # Examples
//!
//! ```bash
//! rostersync init
//! rostersync register --character VanuKnight --server miller --identity 4242 --channel 77
//! rostersync queue run        # hourly, from cron
//! rostersync scan --dry-run   # review drift without changing anything
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: configuration, persistence, collaborator ports, the snapshot world
//! - [`plugins`]: registration, queue, scan and role hierarchy rules

pub mod core;
pub mod plugins;

use core::{
    broker, config, db, error,
    registry::{self, AttemptStatus, RegistrationFilter},
    roster::Roster,
    time,
    world::{self, World},
};
use plugins::{queue, registration, scan};

use chrono::Utc;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[clap(
    name = "rostersync",
    version = env!("CARGO_PKG_VERSION"),
    about = "Keep the guild roster, the registration registry and platform roles in sync"
)]
struct Cli {
    /// Roster directory holding roster.toml, roster.db and world.json.
    #[clap(long, global = true, env = "ROSTERSYNC_DIR")]
    dir: Option<PathBuf>,
    /// Output format: 'text' or 'json'.
    #[clap(long, global = true, default_value = "text")]
    format: String,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a starter roster.toml and create the database
    Init,

    /// Register a character to a platform identity
    #[clap(visible_alias = "r")]
    Register {
        #[clap(long)]
        character: String,
        #[clap(long)]
        server: String,
        #[clap(long)]
        identity: String,
        /// Channel that receives the outcome.
        #[clap(long)]
        channel: String,
        /// Defaults to the configured platform guild.
        #[clap(long)]
        platform_guild: Option<String>,
        /// Bind without the membership check, recording who did it.
        #[clap(long)]
        manual_by: Option<String>,
    },

    /// Remove an identity's registration and strip its ranked roles
    Deregister {
        #[clap(long)]
        identity: String,
    },

    /// Confirmed registrations
    Registrations(RegistrationsCli),

    /// Retry queue for registrations awaiting guild membership
    #[clap(visible_alias = "q")]
    Queue(QueueCli),

    /// Reconcile the guild roster, the registry and platform roles
    Scan {
        /// Compute and report findings without changing anything.
        #[clap(long)]
        dry_run: bool,
    },

    /// Show the registry audit log
    Audit,

    /// Subsystem schemas
    Schema,
}

#[derive(clap::Args, Debug)]
struct RegistrationsCli {
    #[clap(subcommand)]
    command: RegistrationsCommand,
}

#[derive(Subcommand, Debug)]
enum RegistrationsCommand {
    /// List confirmed registrations.
    List {
        #[clap(long)]
        identity: Option<String>,
    },
}

#[derive(clap::Args, Debug)]
struct QueueCli {
    #[clap(subcommand)]
    command: QueueCommand,
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
    /// Process one cycle of pending attempts.
    Run,
    /// List queue rows.
    List {
        /// pending, succeeded, failed or expired
        #[clap(long)]
        status: Option<String>,
    },
}

struct Output {
    json: bool,
}

impl Output {
    fn emit(&self, cmd: &str, status: &str, payload: serde_json::Value, text: &str) {
        if self.json {
            println!("{}", time::command_envelope(cmd, status, payload));
        } else {
            println!("{}", text);
        }
    }
}

fn resolve_dir(dir: Option<PathBuf>) -> Result<PathBuf, error::RosterError> {
    match dir {
        Some(d) => Ok(d),
        None => Ok(std::env::current_dir()?),
    }
}

fn init_roster(dir: &Path, out: &Output) -> Result<(), error::RosterError> {
    let wrote_config = config::write_starter_config(dir)?;
    db::initialize_roster_db(dir)?;
    let world_path = dir.join(world::WORLD_FILE_NAME);
    let wrote_world = !world_path.exists();
    if wrote_world {
        World::open(dir)?.save()?;
    }
    out.emit(
        "init",
        "ok",
        serde_json::json!({ "dir": dir.display().to_string(), "config_written": wrote_config, "world_written": wrote_world }),
        &format!(
            "{} roster initialized at {}{}",
            "▸".bright_cyan(),
            dir.display(),
            if wrote_config { "" } else { " (existing roster.toml kept)" }
        ),
    );
    Ok(())
}

pub fn run() -> Result<(), error::RosterError> {
    let cli = Cli::parse();
    let dir = resolve_dir(cli.dir)?;
    let out = Output {
        json: cli.format == "json",
    };

    match cli.command {
        Command::Init => return init_roster(&dir, &out),
        Command::Schema => {
            let schema = serde_json::json!({
                "subsystems": [registration::schema(), queue::schema(), scan::schema()]
            });
            println!("{}", serde_json::to_string_pretty(&schema)?);
            return Ok(());
        }
        Command::Audit => {
            let events = broker::read_audit_log(&dir)?;
            if out.json {
                println!("{}", serde_json::to_string_pretty(&events)?);
            } else {
                for ev in events {
                    println!("{} {:<24} {:<8} {}", ev.ts, ev.op, ev.status, ev.actor);
                }
            }
            return Ok(());
        }
        _ => {}
    }

    let config = config::load_config(&dir)?;
    db::initialize_roster_db(&dir)?;
    let world = World::open(&dir)?;
    let roster = Roster {
        root: &dir,
        config: &config,
        source: &world,
        roles: &world,
        notifier: &world,
    };
    let now = Utc::now();

    match cli.command {
        Command::Register {
            character,
            server,
            identity,
            channel,
            platform_guild,
            manual_by,
        } => {
            let result = match manual_by {
                Some(by) => {
                    registration::register_manual(&roster, &character, &server, &identity, &by, now)
                }
                None => registration::register(
                    &roster,
                    &registration::RegistrationRequest {
                        character_name: character.clone(),
                        server,
                        identity_id: identity,
                        platform_guild_id: platform_guild
                            .unwrap_or_else(|| config.guild.platform_guild_id.clone()),
                        channel_id: channel,
                    },
                    now,
                ),
            };
            match result {
                Ok(outcome) => {
                    let text = match &outcome {
                        registration::RegistrationOutcome::Registered { registration, granted } => format!(
                            "{} registered `{}` to {} (granted: {})",
                            "✓".bright_green(),
                            registration.character_name,
                            registration.identity_id,
                            if granted.is_empty() { "none".to_string() } else { granted.join(", ") }
                        ),
                        registration::RegistrationOutcome::QueueUpdated { attempt } => format!(
                            "{} queued attempt {} now targets `{}`",
                            "↻".bright_yellow(),
                            attempt.id,
                            attempt.character_name
                        ),
                    };
                    out.emit("register", "ok", serde_json::to_value(&outcome)?, &text);
                }
                // User-facing errors are results, not crashes.
                Err(e) if !matches!(e, error::RosterError::RusqliteError(_) | error::RosterError::IoError(_)) => {
                    out.emit(
                        "register",
                        if e.is_retryable() { "queued" } else { "rejected" },
                        serde_json::json!({ "character": character, "message": e.to_string() }),
                        &format!("{} {}", "✗".bright_red(), e),
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Command::Deregister { identity } => {
            let removed = registration::deregister(&roster, &identity)?;
            out.emit(
                "deregister",
                "ok",
                serde_json::to_value(&removed)?,
                &format!("{} removed `{}` from {}", "✓".bright_green(), removed.character_name, identity),
            );
        }
        Command::Registrations(RegistrationsCli {
            command: RegistrationsCommand::List { identity },
        }) => {
            let rows = registry::find_registrations(
                &dir,
                &RegistrationFilter {
                    guild_id: Some(config.guild.id.clone()),
                    identity_id: identity,
                    ..Default::default()
                },
            )?;
            if out.json {
                out.emit("registrations.list", "ok", serde_json::json!({ "registrations": rows }), "");
            } else if rows.is_empty() {
                println!("No registrations found.");
            } else {
                for r in rows {
                    println!(
                        "{:<20} {:<24} {:<10} {}{}",
                        r.identity_id,
                        r.character_name,
                        r.server,
                        time::to_db(&r.created_at),
                        r.manual_created_by
                            .map(|by| format!(" (manual, by {})", by))
                            .unwrap_or_default()
                    );
                }
            }
        }
        Command::Queue(QueueCli { command }) => match command {
            QueueCommand::Run => {
                let report = queue::process_queue(&roster, now)?;
                let text = format!(
                    "{} processed {} attempt(s): {} succeeded, {} pending, {} failed, {} expired",
                    "▸".bright_cyan(),
                    report.results.len(),
                    report.count(|t| matches!(t, queue::AttemptTransition::Succeeded)),
                    report.count(|t| matches!(t, queue::AttemptTransition::StillPending { .. })),
                    report.count(|t| matches!(t, queue::AttemptTransition::Failed { .. })),
                    report.count(|t| matches!(t, queue::AttemptTransition::Expired)),
                );
                out.emit("queue.run", "ok", serde_json::to_value(&report)?, &text);
            }
            QueueCommand::List { status } => {
                let status = status.map(|s| s.parse::<AttemptStatus>()).transpose()?;
                let rows = queue::list_attempts(&dir, &config.guild.id, status)?;
                if out.json {
                    out.emit("queue.list", "ok", serde_json::json!({ "attempts": rows }), "");
                } else if rows.is_empty() {
                    println!("Queue is empty.");
                } else {
                    for a in rows {
                        println!(
                            "{} {:<10} {:<24} {:<20} tries={} expires={}{}",
                            a.id,
                            a.status,
                            a.character_name,
                            a.identity_id,
                            a.attempts,
                            time::to_db(&a.expires_at),
                            a.last_error
                                .map(|e| format!(" last_error={}", e))
                                .unwrap_or_default()
                        );
                    }
                }
            }
        },
        Command::Scan { dry_run } => {
            let report = scan::run_scan(&roster, dry_run);
            let status = match report.outcome() {
                scan::ScanOutcome::Clean => "clean",
                scan::ScanOutcome::Corrected => "corrected",
                scan::ScanOutcome::Halted => "halted",
            };
            let text = match &report.halted {
                Some(halt) => format!("{} scan halted at {}: {}", "✗".bright_red(), halt.phase, halt.error),
                None => format!(
                    "{} scan {}{}: {} leaver(s), {} unregistered holder(s), {} role fix(es)",
                    "▸".bright_cyan(),
                    status,
                    if dry_run { " (dry run)" } else { "" },
                    report.leavers.len(),
                    report.unregistered_holders.len(),
                    report.role_findings.len()
                ),
            };
            out.emit("scan", status, serde_json::to_value(&report)?, &text);
        }
        Command::Init | Command::Schema | Command::Audit => unreachable!("handled above"),
    }
    Ok(())
}
