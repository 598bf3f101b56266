//! Membership reconciliation.
//!
//! A scan walks four phases in order, reporting progress to the operator
//! log channel between each:
//!
//! 1. **Gather**: fetch the current game record for every registered
//!    character. Lookups fan out across threads; failed ids are retried in
//!    whole passes with a fixed backoff, and the run aborts once the pass
//!    budget is spent.
//! 2. **Leavers**: registrations whose identity left the platform, whose
//!    character left the guild, or both, are removed (and stripped where
//!    the identity still resolves).
//! 3. **Reverse role scan**: every holder of a hierarchy privilege must have
//!    a registration on that privilege's server; others are stripped.
//! 4. **Role consistency**: each registered identity is checked against the
//!    rank hierarchy and corrected.
//!
//! An error halts the run at the failing phase. Nothing is rolled back;
//! the next scan converges from wherever this one stopped. In dry-run mode
//! every finding is computed and reported identically, with no grants,
//! revokes or deletions.

use crate::core::error::RosterError;
use crate::core::output::{self, MESSAGE_LIMIT};
use crate::core::ports::{self, CharacterRecord, notify_quietly};
use crate::core::registry::{self, Registration, RegistrationFilter};
use crate::core::roster::Roster;
use crate::plugins::roles::{RoleAction, RoleFinding, RoleHierarchy};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPhase {
    Gather,
    Leavers,
    ReverseRoles,
    RoleConsistency,
}

impl ScanPhase {
    fn number(&self) -> u8 {
        match self {
            ScanPhase::Gather => 1,
            ScanPhase::Leavers => 2,
            ScanPhase::ReverseRoles => 3,
            ScanPhase::RoleConsistency => 4,
        }
    }
}

impl fmt::Display for ScanPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScanPhase::Gather => "gather",
            ScanPhase::Leavers => "leaver detection",
            ScanPhase::ReverseRoles => "reverse role scan",
            ScanPhase::RoleConsistency => "role consistency",
        };
        write!(f, "phase {}/4 ({})", self.number(), name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaverKind {
    /// Identity gone, character still in the guild: needs a manual in-game kick.
    LeftPlatform,
    /// Identity present, character no longer in the guild: privileges stripped.
    LeftGuild,
    LeftBoth,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaverFinding {
    pub identity_id: String,
    pub character_id: String,
    pub character_name: String,
    pub kind: LeaverKind,
    /// Privilege names removed (or that would be removed in a dry run).
    pub stripped: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnregisteredHolder {
    pub identity_id: String,
    pub privilege_name: String,
    pub privilege_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityRoleFinding {
    pub identity_id: String,
    pub character_name: String,
    pub finding: RoleFinding,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanHalt {
    pub phase: ScanPhase,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanOutcome {
    /// Every phase ran and nothing needed correcting.
    Clean,
    /// Every phase ran and at least one finding was reported.
    Corrected,
    Halted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub dry_run: bool,
    pub registrations_checked: usize,
    /// Characters the game API lists in the tracked guilds.
    pub guild_roster_size: usize,
    pub leavers: Vec<LeaverFinding>,
    pub unregistered_holders: Vec<UnregisteredHolder>,
    pub role_findings: Vec<IdentityRoleFinding>,
    pub halted: Option<ScanHalt>,
    pub leaders_pinged: bool,
}

impl ScanReport {
    fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            registrations_checked: 0,
            guild_roster_size: 0,
            leavers: Vec::new(),
            unregistered_holders: Vec::new(),
            role_findings: Vec::new(),
            halted: None,
            leaders_pinged: false,
        }
    }

    pub fn has_findings(&self) -> bool {
        !self.leavers.is_empty()
            || !self.unregistered_holders.is_empty()
            || !self.role_findings.is_empty()
    }

    pub fn outcome(&self) -> ScanOutcome {
        if self.halted.is_some() {
            ScanOutcome::Halted
        } else if self.has_findings() {
            ScanOutcome::Corrected
        } else {
            ScanOutcome::Clean
        }
    }
}

/// Per-run working set, dropped when the run ends.
#[derive(Default)]
struct ScanContext {
    registrations: Vec<Registration>,
    /// character id -> latest record; `None` when the API no longer knows it.
    characters: HashMap<String, Option<CharacterRecord>>,
    /// Identities handled as leavers in phase 2.
    departed: HashSet<String>,
    /// identity id -> hierarchy privilege ids observed in phase 3.
    held: HashMap<String, HashSet<String>>,
}

impl ScanContext {
    fn active_registrations(&self) -> impl Iterator<Item = &Registration> {
        self.registrations
            .iter()
            .filter(|r| !self.departed.contains(&r.identity_id))
    }
}

struct Scanner<'r, 'a> {
    roster: &'r Roster<'a>,
    dry_run: bool,
}

impl Scanner<'_, '_> {
    fn log(&self, content: &str) {
        notify_quietly(self.roster.notifier, self.roster.log_channel(), content);
    }

    fn log_batch(&self, header: &str, lines: &[String]) {
        for message in output::chunk_message(header, lines, MESSAGE_LIMIT) {
            self.log(&message);
        }
    }

    fn verb<'s>(&self, live: &'s str, dry: &'s str) -> &'s str {
        if self.dry_run { dry } else { live }
    }

    fn gather(&self, ctx: &mut ScanContext, report: &mut ScanReport) -> Result<(), RosterError> {
        let roster = self.roster;
        let scan = &roster.config.scan;
        let backoff = Duration::from_secs(scan.gather_backoff_secs);

        ctx.registrations = registry::find_registrations(
            roster.root,
            &RegistrationFilter {
                guild_id: Some(roster.guild_id().to_string()),
                ..Default::default()
            },
        )?;
        report.registrations_checked = ctx.registrations.len();

        let mut outstanding: Vec<(String, String)> = ctx
            .registrations
            .iter()
            .map(|r| (r.character_id.clone(), r.server.clone()))
            .collect();
        let mut last_errors: Vec<String> = Vec::new();

        for pass in 1..=scan.gather_attempts {
            let results: Vec<((String, String), Result<Option<CharacterRecord>, RosterError>)> =
                outstanding
                    .par_iter()
                    .map(|(id, server)| {
                        (
                            (id.clone(), server.clone()),
                            roster.source.lookup_character_by_id(id, server),
                        )
                    })
                    .collect();

            let mut failed = Vec::new();
            last_errors.clear();
            for ((id, server), result) in results {
                match result {
                    Ok(record) => {
                        ctx.characters.insert(id, record);
                    }
                    Err(e) => {
                        last_errors.push(format!("{}: {}", id, e));
                        failed.push((id, server));
                    }
                }
            }

            if failed.is_empty() {
                break;
            }
            tracing::warn!(pass, failed = failed.len(), "character lookups failed");
            outstanding = failed;
            if pass < scan.gather_attempts {
                std::thread::sleep(backoff);
            } else {
                return Err(RosterError::TransientSource(format!(
                    "could not fetch {} character(s) after {} attempt(s): {}",
                    outstanding.len(),
                    scan.gather_attempts,
                    output::compact_line(&last_errors.join("; "), 500)
                )));
            }
        }

        for outfit in &roster.config.guild.outfits {
            let mut members = None;
            for pass in 1..=scan.gather_attempts {
                match roster
                    .source
                    .list_guild_members(&outfit.external_guild_id, &outfit.server)
                {
                    Ok(list) => {
                        members = Some(list);
                        break;
                    }
                    Err(e) if pass < scan.gather_attempts => {
                        tracing::warn!(pass, server = %outfit.server, error = %e, "guild listing failed");
                        std::thread::sleep(backoff);
                    }
                    Err(e) => return Err(e),
                }
            }
            report.guild_roster_size += members.map(|m| m.len()).unwrap_or_default();
        }

        self.log(&format!(
            "Scan {}: fetched {} registered character(s); the guild lists {} member(s).",
            ScanPhase::Gather,
            ctx.characters.len(),
            report.guild_roster_size
        ));
        Ok(())
    }

    fn leavers(&self, ctx: &mut ScanContext, report: &mut ScanReport) -> Result<(), RosterError> {
        let roster = self.roster;
        let platform_guild_id = roster.platform_guild_id();
        let total = ctx.registrations.len();
        let every = roster.config.scan.progress_every.max(1);
        let mut departed = Vec::new();

        for (index, registration) in ctx.registrations.iter().enumerate() {
            let Some(outfit) = roster.config.outfit(&registration.server) else {
                tracing::warn!(server = %registration.server, "registration on unconfigured server skipped");
                continue;
            };
            let in_guild = ctx
                .characters
                .get(&registration.character_id)
                .and_then(|r| r.as_ref())
                .is_some_and(|r| r.is_in_guild(&outfit.external_guild_id));
            let on_platform = roster
                .roles
                .resolve_identity(platform_guild_id, &registration.identity_id, true)?
                .is_some();

            let kind = match (on_platform, in_guild) {
                (true, true) => None,
                (false, true) => Some(LeaverKind::LeftPlatform),
                (true, false) => Some(LeaverKind::LeftGuild),
                (false, false) => Some(LeaverKind::LeftBoth),
            };

            if let Some(kind) = kind {
                let mut stripped = Vec::new();
                if kind == LeaverKind::LeftGuild {
                    let hierarchy = RoleHierarchy::for_server(roster.config, &registration.server);
                    for entry in hierarchy.entries() {
                        if roster.roles.identity_has_privilege(
                            platform_guild_id,
                            &registration.identity_id,
                            &entry.id,
                        )? {
                            if !self.dry_run {
                                roster.roles.revoke_privilege(
                                    platform_guild_id,
                                    &registration.identity_id,
                                    &entry.id,
                                )?;
                            }
                            stripped.push(entry.name.clone());
                        }
                    }
                }
                if !self.dry_run {
                    registry::delete_registration(roster.root, registration)?;
                }

                let who = ports::mention(&registration.identity_id);
                let name = &registration.character_name;
                let message = match kind {
                    LeaverKind::LeftPlatform => format!(
                        "`{}` ({}) left the server but is still in the guild. Registration {}. They require a manual boot from the guild in-game.",
                        name,
                        who,
                        self.verb("removed", "would be removed")
                    ),
                    LeaverKind::LeftGuild => format!(
                        "`{}` ({}) left the guild. {} [{}] and registration {}.",
                        name,
                        who,
                        self.verb("Stripped", "Would strip"),
                        stripped.join(", "),
                        self.verb("removed", "would be removed")
                    ),
                    LeaverKind::LeftBoth => format!(
                        "`{}` ({}) left both the server and the guild. Registration {}; they are gone.",
                        name,
                        who,
                        self.verb("removed", "would be removed")
                    ),
                };
                self.log(&message);
                tracing::info!(identity = %registration.identity_id, ?kind, dry_run = self.dry_run, "leaver");

                departed.push(registration.identity_id.clone());
                report.leavers.push(LeaverFinding {
                    identity_id: registration.identity_id.clone(),
                    character_id: registration.character_id.clone(),
                    character_name: registration.character_name.clone(),
                    kind,
                    stripped,
                });
            }

            let done = index + 1;
            if done % every == 0 && done < total {
                self.log(&format!("Leaver check: {}/{} members processed.", done, total));
            }
        }

        ctx.departed.extend(departed);

        self.log(&if report.leavers.is_empty() {
            format!("Scan {}: no leavers detected.", ScanPhase::Leavers)
        } else {
            format!(
                "Scan {}: {} leaver(s) detected.",
                ScanPhase::Leavers,
                report.leavers.len()
            )
        });
        Ok(())
    }

    fn reverse_roles(
        &self,
        ctx: &mut ScanContext,
        report: &mut ScanReport,
    ) -> Result<(), RosterError> {
        let roster = self.roster;
        let platform_guild_id = roster.platform_guild_id();
        let registered: HashMap<String, String> = ctx
            .active_registrations()
            .map(|r| (r.identity_id.clone(), r.server.clone()))
            .collect();

        let mut entries = roster.config.roles.clone();
        entries.sort_by_key(|e| e.priority);

        for entry in &entries {
            let holders = roster
                .roles
                .privilege_holders(platform_guild_id, &entry.id)?;
            for holder in holders {
                ctx.held
                    .entry(holder.clone())
                    .or_default()
                    .insert(entry.id.clone());
                if registered.get(&holder) == Some(&entry.server) {
                    continue;
                }
                // Leavers were already handled in phase 2.
                if ctx.departed.contains(&holder) {
                    continue;
                }
                if !self.dry_run {
                    roster
                        .roles
                        .revoke_privilege(platform_guild_id, &holder, &entry.id)?;
                }
                report.unregistered_holders.push(UnregisteredHolder {
                    identity_id: holder,
                    privilege_name: entry.name.clone(),
                    privilege_id: entry.id.clone(),
                });
            }
        }

        if report.unregistered_holders.is_empty() {
            self.log(&format!(
                "Scan {}: every privilege holder is registered.",
                ScanPhase::ReverseRoles
            ));
        } else {
            let lines: Vec<String> = report
                .unregistered_holders
                .iter()
                .map(|h| format!("- {} held `{}` without a registration", ports::mention(&h.identity_id), h.privilege_name))
                .collect();
            self.log_batch(
                &format!(
                    "Scan {}: {} privilege(s) from {} unregistered holder(s):",
                    ScanPhase::ReverseRoles,
                    self.verb("removed", "would remove"),
                    report
                        .unregistered_holders
                        .iter()
                        .map(|h| h.identity_id.as_str())
                        .collect::<HashSet<_>>()
                        .len()
                ),
                &lines,
            );
        }
        Ok(())
    }

    fn role_consistency(
        &self,
        ctx: &mut ScanContext,
        report: &mut ScanReport,
    ) -> Result<(), RosterError> {
        let roster = self.roster;
        let platform_guild_id = roster.platform_guild_id();
        let mut hierarchies: HashMap<String, RoleHierarchy> = HashMap::new();
        let empty = HashSet::new();

        for registration in ctx.active_registrations() {
            let hierarchy = hierarchies
                .entry(registration.server.clone())
                .or_insert_with(|| RoleHierarchy::for_server(roster.config, &registration.server));
            let held = ctx.held.get(&registration.identity_id).unwrap_or(&empty);

            for finding in hierarchy.evaluate(held, true) {
                if !self.dry_run {
                    match finding.action {
                        RoleAction::Add => roster.roles.grant_privilege(
                            platform_guild_id,
                            &registration.identity_id,
                            &finding.privilege.id,
                        )?,
                        RoleAction::Remove => roster.roles.revoke_privilege(
                            platform_guild_id,
                            &registration.identity_id,
                            &finding.privilege.id,
                        )?,
                    }
                }
                report.role_findings.push(IdentityRoleFinding {
                    identity_id: registration.identity_id.clone(),
                    character_name: registration.character_name.clone(),
                    finding,
                });
            }
        }

        if report.role_findings.is_empty() {
            self.log(&format!(
                "Scan {}: no action needed.",
                ScanPhase::RoleConsistency
            ));
        } else {
            let lines: Vec<String> = report
                .role_findings
                .iter()
                .map(|f| {
                    let verb = match f.finding.action {
                        RoleAction::Add => self.verb("added to", "would be added to"),
                        RoleAction::Remove => self.verb("removed from", "would be removed from"),
                    };
                    format!(
                        "- `{}` {} {}: {}",
                        f.finding.privilege.name,
                        verb,
                        ports::mention(&f.identity_id),
                        f.finding.reason
                    )
                })
                .collect();
            self.log_batch(
                &format!(
                    "Scan {}: {} role inconsistenc{}:",
                    ScanPhase::RoleConsistency,
                    report.role_findings.len(),
                    if report.role_findings.len() == 1 { "y" } else { "ies" }
                ),
                &lines,
            );
        }
        Ok(())
    }

    fn ping_leaders(&self, report: &mut ScanReport) {
        let mentions: Vec<String> = self
            .roster
            .config
            .leader_roles()
            .iter()
            .map(|r| ports::role_mention(&r.id))
            .collect();
        self.log(&format!(
            "{} the membership scan made {} change(s); manual review may be warranted. Run `rostersync scan --dry-run` to re-check without pinging again.",
            mentions.join(" "),
            report.leavers.len() + report.unregistered_holders.len() + report.role_findings.len()
        ));
        report.leaders_pinged = true;
    }
}

fn run_phases(
    scanner: &Scanner<'_, '_>,
    ctx: &mut ScanContext,
    report: &mut ScanReport,
) -> Result<(), (ScanPhase, RosterError)> {
    scanner
        .gather(ctx, report)
        .map_err(|e| (ScanPhase::Gather, e))?;
    scanner
        .leavers(ctx, report)
        .map_err(|e| (ScanPhase::Leavers, e))?;
    scanner
        .reverse_roles(ctx, report)
        .map_err(|e| (ScanPhase::ReverseRoles, e))?;
    scanner
        .role_consistency(ctx, report)
        .map_err(|e| (ScanPhase::RoleConsistency, e))
}

/// Run a full reconciliation pass. Never fails: errors halt the run and are
/// recorded in [`ScanReport::halted`].
pub fn run_scan(roster: &Roster<'_>, dry_run: bool) -> ScanReport {
    let scanner = Scanner { roster, dry_run };
    let mut ctx = ScanContext::default();
    let mut report = ScanReport::new(dry_run);

    scanner.log(&format!(
        "Starting membership scan{}.",
        if dry_run { " (dry run, no changes will be made)" } else { "" }
    ));
    tracing::info!(dry_run, "scan started");

    if let Err((phase, e)) = run_phases(&scanner, &mut ctx, &mut report) {
        tracing::error!(%phase, error = %e, "scan halted");
        scanner.log(&format!(
            "Scan halted during {}: {}. Later phases did not run; re-run the scan once the cause is fixed.",
            phase, e
        ));
        report.halted = Some(ScanHalt {
            phase,
            error: e.to_string(),
        });
        return report;
    }

    match report.outcome() {
        ScanOutcome::Clean => scanner.log("Scan complete: no members require action."),
        _ if dry_run => scanner.log("Dry run complete: the findings above were not applied."),
        _ => scanner.ping_leaders(&mut report),
    }
    tracing::info!(
        leavers = report.leavers.len(),
        unregistered = report.unregistered_holders.len(),
        inconsistencies = report.role_findings.len(),
        "scan finished"
    );
    report
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "scan",
        "version": "0.4.0",
        "description": "Reconcile the guild roster, the registry and platform roles",
        "commands": [
            { "name": "scan", "parameters": ["dry_run"] }
        ],
        "storage": ["roster.db"]
    })
}
