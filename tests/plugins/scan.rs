mod common;

use common::*;
use rostersync::core::ports::RoleAuthority;
use rostersync::core::registry::{self, RegistrationFilter};
use rostersync::plugins::registration::{RegistrationRequest, register};
use rostersync::plugins::roles::RoleAction;
use rostersync::plugins::scan::{LeaverKind, ScanOutcome, ScanPhase, run_scan};
use std::collections::HashSet;

fn enroll(fx: &Fixture, character_id: &str, name: &str, identity: &str) {
    fx.character(character_id, name, true);
    fx.world.add_member(identity, name, &[]);
    let req = RegistrationRequest {
        character_name: name.to_string(),
        server: SERVER.to_string(),
        identity_id: identity.to_string(),
        platform_guild_id: PLATFORM_GUILD.to_string(),
        channel_id: "chan".to_string(),
    };
    register(&fx.roster(), &req, t0()).unwrap();
}

fn registered_identities(fx: &Fixture) -> HashSet<String> {
    registry::find_registrations(
        fx.dir.path(),
        &RegistrationFilter {
            guild_id: Some(GUILD.to_string()),
            ..Default::default()
        },
    )
    .unwrap()
    .into_iter()
    .map(|r| r.identity_id)
    .collect()
}

fn held(fx: &Fixture, identity: &str) -> HashSet<String> {
    fx.world.privileges_of(identity).into_iter().collect()
}

fn set(ids: &[&str]) -> HashSet<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_consistent_roster_scans_clean() {
    let fx = Fixture::new();
    enroll(&fx, "c1", "VanuKnight", "1001");
    enroll(&fx, "c2", "VanuMedic", "1002");
    fx.world.clear_calls();

    let report = run_scan(&fx.roster(), false);
    assert_eq!(report.outcome(), ScanOutcome::Clean);
    assert_eq!(report.registrations_checked, 2);
    assert_eq!(report.guild_roster_size, 2);
    assert!(!report.leaders_pinged);
    assert!(fx.world.grants().is_empty());
    assert!(fx.world.revokes().is_empty());
    assert!(
        fx.notifications_to(LOG_CHANNEL)
            .iter()
            .any(|n| n.contains("no members require action"))
    );
}

#[test]
fn test_member_who_left_guild_is_stripped_and_removed() {
    let fx = Fixture::new();
    enroll(&fx, "c1", "VanuKnight", "1001");
    fx.world.clear_calls();
    fx.world.set_character_guild("c1", None);

    let report = run_scan(&fx.roster(), false);
    assert_eq!(report.outcome(), ScanOutcome::Corrected);
    assert_eq!(report.leavers.len(), 1);
    assert_eq!(report.leavers[0].kind, LeaverKind::LeftGuild);
    assert_eq!(report.leavers[0].stripped.len(), 2);

    assert!(held(&fx, "1001").is_empty());
    assert_eq!(fx.world.revokes().len(), 2);
    assert!(fx.world.grants().is_empty());
    assert!(registered_identities(&fx).is_empty());

    let left: Vec<String> = fx
        .notifications_to(LOG_CHANNEL)
        .into_iter()
        .filter(|n| n.contains("left the guild"))
        .collect();
    assert_eq!(left.len(), 1);
    assert!(left[0].contains("Stripped"));
    assert!(report.leaders_pinged);
}

#[test]
fn test_member_who_left_platform_needs_manual_boot() {
    let fx = Fixture::new();
    enroll(&fx, "c1", "VanuKnight", "1001");
    fx.world.clear_calls();
    fx.world.remove_member("1001");

    let report = run_scan(&fx.roster(), false);
    assert_eq!(report.leavers.len(), 1);
    assert_eq!(report.leavers[0].kind, LeaverKind::LeftPlatform);
    assert!(report.leavers[0].stripped.is_empty());
    assert!(fx.world.revokes().is_empty());
    assert!(registered_identities(&fx).is_empty());
    assert!(
        fx.notifications_to(LOG_CHANNEL)
            .iter()
            .any(|n| n.contains("manual boot"))
    );
}

#[test]
fn test_member_who_left_both_is_removed() {
    let fx = Fixture::new();
    enroll(&fx, "c1", "VanuKnight", "1001");
    fx.world.clear_calls();
    fx.world.remove_member("1001");
    fx.world.set_character_guild("c1", None);

    let report = run_scan(&fx.roster(), false);
    assert_eq!(report.leavers[0].kind, LeaverKind::LeftBoth);
    assert!(fx.world.revokes().is_empty());
    assert!(registered_identities(&fx).is_empty());
}

#[test]
fn test_unregistered_privilege_holder_is_stripped() {
    let fx = Fixture::new();
    enroll(&fx, "c1", "VanuKnight", "1001");
    fx.world.add_member("2001", "squatter", &[MEMBER, "unrelated"]);
    fx.world.clear_calls();

    let report = run_scan(&fx.roster(), false);
    assert_eq!(report.unregistered_holders.len(), 1);
    assert_eq!(report.unregistered_holders[0].identity_id, "2001");
    assert_eq!(report.unregistered_holders[0].privilege_id, MEMBER);
    assert_eq!(held(&fx, "2001"), set(&["unrelated"]));
    assert!(report.role_findings.is_empty());
}

#[test]
fn test_keep_privilege_survives_promotion() {
    let fx = Fixture::new();
    enroll(&fx, "c1", "VanuKnight", "1001");
    enroll(&fx, "c2", "VanuMedic", "1002");
    let roles = &fx.world;
    roles.grant_privilege(PLATFORM_GUILD, "1001", OFFICER).unwrap();
    roles.grant_privilege(PLATFORM_GUILD, "1001", MEMBER).unwrap();
    roles.grant_privilege(PLATFORM_GUILD, "1002", OFFICER).unwrap();
    roles.revoke_privilege(PLATFORM_GUILD, "1002", REGISTERED).unwrap();
    fx.world.clear_calls();

    let report = run_scan(&fx.roster(), false);

    // Superseded ranks go; the keep-flagged level stays.
    assert_eq!(held(&fx, "1001"), set(&[OFFICER, REGISTERED]));
    // A missing keep-flagged level is added back.
    assert_eq!(held(&fx, "1002"), set(&[OFFICER, REGISTERED]));

    let for_1002: Vec<_> = report
        .role_findings
        .iter()
        .filter(|f| f.identity_id == "1002")
        .collect();
    assert!(
        for_1002
            .iter()
            .any(|f| f.finding.action == RoleAction::Add && f.finding.privilege.id == REGISTERED)
    );
    assert!(
        report
            .role_findings
            .iter()
            .all(|f| f.finding.privilege.id != REGISTERED || f.finding.action == RoleAction::Add)
    );
}

#[test]
fn test_registered_identity_without_ranked_roles_gets_entry_level() {
    let fx = Fixture::new();
    enroll(&fx, "c1", "VanuKnight", "1001");
    fx.world.revoke_privilege(PLATFORM_GUILD, "1001", RECRUIT).unwrap();
    fx.world.revoke_privilege(PLATFORM_GUILD, "1001", REGISTERED).unwrap();
    fx.world.clear_calls();

    let report = run_scan(&fx.roster(), false);
    assert_eq!(report.role_findings.len(), 1);
    let finding = &report.role_findings[0].finding;
    assert_eq!(finding.action, RoleAction::Add);
    assert_eq!(finding.privilege.id, REGISTERED);
    assert!(finding.reason.contains("holds no ranked role"));

    // The next pass fills in the level above.
    let report = run_scan(&fx.roster(), false);
    assert_eq!(report.role_findings.len(), 1);
    assert_eq!(report.role_findings[0].finding.privilege.id, RECRUIT);
    assert!(report.role_findings[0].finding.reason.contains("missing entry role"));
    assert_eq!(run_scan(&fx.roster(), false).outcome(), ScanOutcome::Clean);
}

#[test]
fn test_dry_run_reports_live_findings_without_changes() {
    let fx = Fixture::new();
    enroll(&fx, "c1", "VanuKnight", "1001");
    enroll(&fx, "c2", "VanuMedic", "1002");
    enroll(&fx, "c3", "VanuMax", "1003");
    fx.world.set_character_guild("c1", None);
    fx.world.add_member("2001", "squatter", &[OFFICER]);
    fx.world.grant_privilege(PLATFORM_GUILD, "1002", LEADER).unwrap();
    fx.world.clear_calls();

    let dry = run_scan(&fx.roster(), true);
    assert!(dry.dry_run);
    assert_eq!(dry.outcome(), ScanOutcome::Corrected);
    assert!(!dry.leaders_pinged);
    assert!(fx.world.grants().is_empty());
    assert!(fx.world.revokes().is_empty());
    assert_eq!(registered_identities(&fx), set(&["1001", "1002", "1003"]));
    assert!(
        fx.notifications_to(LOG_CHANNEL)
            .iter()
            .any(|n| n.contains("would be removed"))
    );

    let live = run_scan(&fx.roster(), false);
    assert_eq!(dry.leavers, live.leavers);
    assert_eq!(dry.unregistered_holders, live.unregistered_holders);
    assert_eq!(dry.role_findings, live.role_findings);
    assert!(!fx.world.revokes().is_empty());
    assert_eq!(registered_identities(&fx), set(&["1002", "1003"]));
}

#[test]
fn test_gather_retries_failed_lookups() {
    let fx = Fixture::new();
    enroll(&fx, "c1", "VanuKnight", "1001");
    enroll(&fx, "c2", "VanuMedic", "1002");
    fx.world.clear_calls();

    let flaky = FlakySource::new(&fx.world, 2);
    let report = run_scan(&fx.roster_with(&flaky), false);
    assert!(report.halted.is_none());
    assert_eq!(report.outcome(), ScanOutcome::Clean);
    assert_eq!(flaky.calls_for("c1"), 3);
    assert_eq!(flaky.calls_for("c2"), 3);
    assert!(registered_identities(&fx).len() == 2);
}

#[test]
fn test_gather_gives_up_and_halts_before_any_change() {
    let fx = Fixture::new();
    enroll(&fx, "c1", "VanuKnight", "1001");
    fx.world.set_character_guild("c1", None);
    fx.world.clear_calls();

    let flaky = FlakySource::new(&fx.world, 3);
    let report = run_scan(&fx.roster_with(&flaky), false);
    let halt = report.halted.as_ref().unwrap();
    assert_eq!(halt.phase, ScanPhase::Gather);
    assert!(halt.error.contains("after 3 attempt(s)"));
    assert_eq!(report.outcome(), ScanOutcome::Halted);
    assert!(report.leavers.is_empty());
    assert!(fx.world.revokes().is_empty());
    assert_eq!(registered_identities(&fx), set(&["1001"]));
    assert!(
        fx.notifications_to(LOG_CHANNEL)
            .iter()
            .any(|n| n.contains("Scan halted during phase 1/4 (gather)"))
    );
}

#[test]
fn test_leaver_check_reports_progress_every_configured_step() {
    let mut fx = Fixture::new();
    fx.config.scan.progress_every = 5;
    for i in 0..12 {
        enroll(&fx, &format!("c{}", i), &format!("Trooper{}", i), &format!("{}", 3000 + i));
    }

    run_scan(&fx.roster(), true);
    let progress: Vec<String> = fx
        .notifications_to(LOG_CHANNEL)
        .into_iter()
        .filter(|n| n.starts_with("Leaver check:"))
        .collect();
    assert_eq!(
        progress,
        vec![
            "Leaver check: 5/12 members processed.".to_string(),
            "Leaver check: 10/12 members processed.".to_string(),
        ]
    );
}
