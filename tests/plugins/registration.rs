mod common;

use chrono::Duration;
use common::*;
use rostersync::core::error::RosterError;
use rostersync::core::registry::{
    self, AttemptFilter, AttemptOrder, AttemptStatus, RegistrationFilter,
};
use rostersync::plugins::queue::process_queue;
use rostersync::plugins::registration::{
    RegistrationOutcome, RegistrationRequest, deregister, register, register_manual,
};

fn request(name: &str, identity: &str) -> RegistrationRequest {
    RegistrationRequest {
        character_name: name.to_string(),
        server: SERVER.to_string(),
        identity_id: identity.to_string(),
        platform_guild_id: PLATFORM_GUILD.to_string(),
        channel_id: "chan".to_string(),
    }
}

fn pending(fx: &Fixture) -> Vec<registry::RegistrationAttempt> {
    registry::find_attempts(
        fx.dir.path(),
        &AttemptFilter {
            guild_id: Some(GUILD.to_string()),
            status: Some(AttemptStatus::Pending),
            ..Default::default()
        },
        None,
        AttemptOrder::UpdatedAsc,
    )
    .unwrap()
}

fn registration_of(fx: &Fixture, identity: &str) -> Option<registry::Registration> {
    registry::find_registration(
        fx.dir.path(),
        &RegistrationFilter {
            guild_id: Some(GUILD.to_string()),
            identity_id: Some(identity.to_string()),
            ..Default::default()
        },
    )
    .unwrap()
}

#[test]
fn test_guild_member_is_registered_with_entry_roles() {
    let fx = Fixture::new();
    fx.character("c1", "VanuKnight", true);
    fx.world.add_member("1001", "knight", &[]);

    let outcome = register(&fx.roster(), &request("VanuKnight", "1001"), t0()).unwrap();
    let RegistrationOutcome::Registered { registration, granted } = outcome else {
        panic!("expected a registration");
    };
    assert_eq!(registration.character_id, "c1");
    assert!(!registration.manual);
    assert_eq!(granted, vec!["Registered".to_string(), "Recruit".to_string()]);

    let mut held = fx.world.privileges_of("1001");
    held.sort();
    assert_eq!(held, vec![RECRUIT.to_string(), REGISTERED.to_string()]);
    assert!(registration_of(&fx, "1001").is_some());
    assert!(
        fx.notifications_to("chan")
            .iter()
            .any(|n| n.contains("is now registered as `VanuKnight`"))
    );
}

#[test]
fn test_invalid_name_and_unknown_server_are_rejected() {
    let fx = Fixture::new();
    fx.world.add_member("1001", "knight", &[]);

    let err = register(&fx.roster(), &request("Vanu Knight!", "1001"), t0()).unwrap_err();
    assert!(matches!(err, RosterError::UserInput(_)));

    let mut req = request("VanuKnight", "1001");
    req.server = "cobalt".to_string();
    let err = register(&fx.roster(), &req, t0()).unwrap_err();
    assert!(matches!(err, RosterError::UserInput(_)));
    assert!(pending(&fx).is_empty());
}

#[test]
fn test_missing_platform_privilege_blocks_and_alerts_operators() {
    let mut fx = Fixture::new();
    fx.world = rostersync::core::world::World::new(Default::default());
    fx.character("c1", "VanuKnight", true);
    fx.world.add_member("1001", "knight", &[]);

    let err = register(&fx.roster(), &request("VanuKnight", "1001"), t0()).unwrap_err();
    assert!(matches!(err, RosterError::Configuration(_)));
    assert!(!err.is_retryable());
    assert!(
        fx.notifications_to(LOG_CHANNEL)
            .iter()
            .any(|n| n.contains("does not exist on the platform"))
    );
    assert!(registration_of(&fx, "1001").is_none());
}

#[test]
fn test_not_yet_in_guild_is_queued_once() {
    let fx = Fixture::new();
    fx.character("c1", "VanuKnight", false);
    fx.world.add_member("1001", "knight", &[]);

    let err = register(&fx.roster(), &request("VanuKnight", "1001"), t0()).unwrap_err();
    assert!(matches!(err, RosterError::NotYetDetected(_)));
    assert!(err.is_retryable());

    let queued = pending(&fx);
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].character_name, "VanuKnight");
    assert_eq!(queued[0].attempts, 0);
    assert_eq!(queued[0].expires_at, t0() + Duration::hours(72));

    // Same name again: told it is already queued, no second row.
    let err = register(&fx.roster(), &request("vanuknight", "1001"), t0()).unwrap_err();
    assert!(matches!(err, RosterError::UserInput(ref m) if m.contains("already queued")));
    assert_eq!(pending(&fx).len(), 1);
}

#[test]
fn test_unknown_character_is_queued() {
    let fx = Fixture::new();
    fx.world.add_member("1001", "knight", &[]);

    let err = register(&fx.roster(), &request("FreshAlt", "1001"), t0()).unwrap_err();
    assert!(matches!(err, RosterError::NotYetDetected(_)));
    assert_eq!(pending(&fx).len(), 1);
}

#[test]
fn test_rename_updates_pending_row_in_place() {
    let fx = Fixture::new();
    fx.character("c1", "VanuKnight", false);
    fx.world.add_member("1001", "knight", &[]);

    register(&fx.roster(), &request("VanuKnight", "1001"), t0()).unwrap_err();
    process_queue(&fx.roster(), t0() + Duration::hours(1)).unwrap();
    let before = pending(&fx);
    assert_eq!(before[0].attempts, 1);

    let later = t0() + Duration::hours(2);
    let outcome = register(&fx.roster(), &request("VanuKnightTwo", "1001"), later).unwrap();
    let RegistrationOutcome::QueueUpdated { attempt } = outcome else {
        panic!("expected an in-place queue update");
    };
    assert_eq!(attempt.id, before[0].id);
    assert_eq!(attempt.character_name, "VanuKnightTwo");
    assert_eq!(attempt.attempts, 0);
    assert_eq!(attempt.expires_at, later + Duration::hours(72));

    let after = pending(&fx);
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].id, before[0].id);
}

#[test]
fn test_character_queued_by_someone_else_is_rejected() {
    let fx = Fixture::new();
    fx.character("c1", "VanuKnight", false);
    fx.world.add_member("1001", "knight", &[]);
    fx.world.add_member("1002", "impostor", &[]);

    register(&fx.roster(), &request("VanuKnight", "1001"), t0()).unwrap_err();
    let err = register(&fx.roster(), &request("VanuKnight", "1002"), t0()).unwrap_err();
    assert!(matches!(err, RosterError::ConsistencyViolation(ref m) if m.contains("<@1001>")));
    assert_eq!(pending(&fx).len(), 1);
}

#[test]
fn test_character_owned_by_another_identity_is_rejected() {
    let fx = Fixture::new();
    fx.character("c1", "VanuKnight", true);
    fx.world.add_member("1001", "knight", &[]);
    fx.world.add_member("1002", "impostor", &[]);
    register(&fx.roster(), &request("VanuKnight", "1001"), t0()).unwrap();

    let err = register(&fx.roster(), &request("VanuKnight", "1002"), t0()).unwrap_err();
    assert!(matches!(err, RosterError::ConsistencyViolation(ref m) if m.contains("<@1001>")));

    // Owner left the platform: the message says so instead of mentioning them.
    fx.world.remove_member("1001");
    let err = register(&fx.roster(), &request("VanuKnight", "1002"), t0()).unwrap_err();
    assert!(matches!(err, RosterError::ConsistencyViolation(ref m) if m.contains("left the server")));
}

#[test]
fn test_identity_with_other_character_must_deregister_first() {
    let fx = Fixture::new();
    fx.character("c1", "VanuKnight", true);
    fx.character("c2", "VanuMedic", true);
    fx.world.add_member("1001", "knight", &[]);
    register(&fx.roster(), &request("VanuKnight", "1001"), t0()).unwrap();

    let err = register(&fx.roster(), &request("VanuMedic", "1001"), t0()).unwrap_err();
    assert!(matches!(err, RosterError::ConsistencyViolation(ref m) if m.contains("Deregister")));
}

#[test]
fn test_reregistering_same_character_is_idempotent() {
    let fx = Fixture::new();
    fx.character("c1", "VanuKnight", true);
    fx.world.add_member("1001", "knight", &[]);
    register(&fx.roster(), &request("VanuKnight", "1001"), t0()).unwrap();
    fx.world.clear_calls();

    let later = t0() + Duration::days(1);
    let outcome = register(&fx.roster(), &request("VanuKnight", "1001"), later).unwrap();
    let RegistrationOutcome::Registered { registration, granted } = outcome else {
        panic!("expected a registration");
    };
    assert!(granted.is_empty());
    assert!(fx.world.grants().is_empty());
    assert_eq!(registration.created_at, t0());
    assert_eq!(registration.updated_at, later);
}

#[test]
fn test_identity_off_platform_cannot_register() {
    let fx = Fixture::new();
    fx.character("c1", "VanuKnight", true);

    let err = register(&fx.roster(), &request("VanuKnight", "1001"), t0()).unwrap_err();
    assert!(matches!(err, RosterError::UserInput(ref m) if m.contains("not a member")));
    assert!(registration_of(&fx, "1001").is_none());
}

#[test]
fn test_manual_registration_skips_membership_check() {
    let fx = Fixture::new();
    fx.character("c1", "VanuKnight", false);
    fx.world.add_member("1001", "knight", &[]);

    let outcome =
        register_manual(&fx.roster(), "VanuKnight", SERVER, "1001", "9000", t0()).unwrap();
    let RegistrationOutcome::Registered { registration, .. } = outcome else {
        panic!("expected a registration");
    };
    assert!(registration.manual);
    assert_eq!(registration.manual_created_by.as_deref(), Some("9000"));
    assert!(pending(&fx).is_empty());
    assert!(
        fx.notifications_to(LOG_CHANNEL)
            .iter()
            .any(|n| n.contains("manually registered `VanuKnight`"))
    );

    let err = register_manual(&fx.roster(), "Nobody", SERVER, "1001", "9000", t0()).unwrap_err();
    assert!(matches!(err, RosterError::UserInput(_)));
}

#[test]
fn test_deregister_strips_ranked_roles() {
    let fx = Fixture::new();
    fx.character("c1", "VanuKnight", true);
    fx.world.add_member("1001", "knight", &["unrelated"]);
    register(&fx.roster(), &request("VanuKnight", "1001"), t0()).unwrap();

    let removed = deregister(&fx.roster(), "1001").unwrap();
    assert_eq!(removed.character_name, "VanuKnight");
    assert!(registration_of(&fx, "1001").is_none());
    assert_eq!(fx.world.privileges_of("1001"), vec!["unrelated".to_string()]);

    let err = deregister(&fx.roster(), "1001").unwrap_err();
    assert!(matches!(err, RosterError::NotFound(_)));
}

#[test]
fn test_game_api_outage_surfaces_as_retryable() {
    let fx = Fixture::new();
    fx.world.add_member("1001", "knight", &[]);
    let down = DownSource;

    let err = register(&fx.roster_with(&down), &request("VanuKnight", "1001"), t0()).unwrap_err();
    assert!(matches!(err, RosterError::TransientSource(_)));
    assert!(err.is_retryable());
    assert!(pending(&fx).is_empty());
}
