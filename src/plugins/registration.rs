//! Registration: binding a platform identity to a game character.
//!
//! `validate` runs the ordered checks and either hands back the confirmed
//! character record, reports that a queued attempt was renamed in place,
//! or fails with a user-facing [`RosterError`]. When the character is not
//! yet visible as a guild member the request is parked in the retry queue
//! (see `plugins::queue`).

use crate::core::error::RosterError;
use crate::core::ports::{self, CharacterRecord, notify_quietly};
use crate::core::registry::{
    self, AttemptFilter, AttemptStatus, Registration, RegistrationAttempt, RegistrationFilter,
};
use crate::core::roster::Roster;
use crate::core::time;
use crate::plugins::roles::{RoleAction, RoleHierarchy};
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::OnceLock;
use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrationRequest {
    pub character_name: String,
    pub server: String,
    pub identity_id: String,
    pub platform_guild_id: String,
    pub channel_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    /// Every check passed; the character is a confirmed guild member.
    Ready(CharacterRecord),
    /// The identity's pending attempt was pointed at a new character.
    QueueUpdated(RegistrationAttempt),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RegistrationOutcome {
    Registered {
        registration: Registration,
        granted: Vec<String>,
    },
    QueueUpdated {
        attempt: RegistrationAttempt,
    },
}

fn character_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9]{1,32}$").expect("static pattern"))
}

fn check_input(roster: &Roster<'_>, character_name: &str, server: &str) -> Result<(), RosterError> {
    if !character_name_pattern().is_match(character_name) {
        return Err(RosterError::UserInput(format!(
            "Character name `{}` is invalid: use 1-32 letters or digits.",
            character_name
        )));
    }
    if roster.config.outfit(server).is_none() {
        return Err(RosterError::UserInput(format!(
            "Server `{}` is not supported by this community.",
            server
        )));
    }
    Ok(())
}

/// Every configured privilege for `server` must exist on the platform.
pub fn check_privileges(
    roster: &Roster<'_>,
    platform_guild_id: &str,
    server: &str,
) -> Result<(), RosterError> {
    for role in roster.config.roles_for(server) {
        if !roster.roles.privilege_exists(platform_guild_id, &role.id)? {
            let message = format!(
                "Configured role `{}` ({}) does not exist on the platform. Registrations are blocked until the role map is fixed.",
                role.name, role.id
            );
            tracing::error!(role = %role.name, privilege = %role.id, "configured privilege missing");
            notify_quietly(
                roster.notifier,
                roster.log_channel(),
                &format!("{} {}", roster.escalation(), message),
            );
            return Err(RosterError::Configuration(message));
        }
    }
    Ok(())
}

/// Reject when the character or the identity is already bound elsewhere.
fn check_duplicates(
    roster: &Roster<'_>,
    platform_guild_id: &str,
    character_name: &str,
    record: Option<&CharacterRecord>,
    identity_id: &str,
) -> Result<(), RosterError> {
    if let Some(record) = record {
        let owner = registry::find_registration(
            roster.root,
            &RegistrationFilter {
                guild_id: Some(roster.guild_id().to_string()),
                character_id: Some(record.id.clone()),
                ..Default::default()
            },
        )?;
        if let Some(owner) = owner.filter(|o| o.identity_id != identity_id) {
            let resolved =
                roster
                    .roles
                    .resolve_identity(platform_guild_id, &owner.identity_id, false)?;
            return Err(RosterError::ConsistencyViolation(match resolved {
                None => format!(
                    "Character `{}` is already registered to a user who has left the server (id {}). Ask {} to clear the stale registration.",
                    record.name, owner.identity_id, roster.escalation()
                ),
                Some(other) => format!(
                    "Character `{}` is already registered to {}. If this is your character, contact {}.",
                    record.name,
                    other.mention(),
                    roster.escalation()
                ),
            }));
        }
    }

    let existing = registry::find_registration(
        roster.root,
        &RegistrationFilter {
            guild_id: Some(roster.guild_id().to_string()),
            identity_id: Some(identity_id.to_string()),
            ..Default::default()
        },
    )?;
    if let Some(existing) = existing {
        let same = match record {
            Some(record) => existing.character_id == record.id,
            None => existing.character_name.eq_ignore_ascii_case(character_name),
        };
        if !same {
            return Err(RosterError::ConsistencyViolation(format!(
                "{} already has character `{}` registered. Deregister it before registering `{}`.",
                ports::mention(identity_id),
                existing.character_name,
                character_name
            )));
        }
    }
    Ok(())
}

fn pending_for_identity(
    roster: &Roster<'_>,
    identity_id: &str,
) -> Result<Option<RegistrationAttempt>, RosterError> {
    registry::find_attempt(
        roster.root,
        &AttemptFilter {
            guild_id: Some(roster.guild_id().to_string()),
            identity_id: Some(identity_id.to_string()),
            status: Some(AttemptStatus::Pending),
            ..Default::default()
        },
    )
}

/// Run the ordered registration checks.
///
/// With `skip_queue_checks` the queue ownership, rename and already-queued
/// checks are bypassed and a failed membership check never enqueues; the
/// retry queue uses this for attempts it is already processing.
pub fn validate(
    roster: &Roster<'_>,
    request: &RegistrationRequest,
    skip_queue_checks: bool,
    now: DateTime<Utc>,
) -> Result<Validation, RosterError> {
    let name = request.character_name.as_str();
    check_input(roster, name, &request.server)?;
    check_privileges(roster, &request.platform_guild_id, &request.server)?;

    let record = roster
        .source
        .lookup_character_by_name(name, &request.server)?;

    check_duplicates(
        roster,
        &request.platform_guild_id,
        name,
        record.as_ref(),
        &request.identity_id,
    )?;

    let ttl = Duration::hours(roster.config.queue.attempt_ttl_hours);

    if !skip_queue_checks {
        let queued_by_others = registry::find_attempts(
            roster.root,
            &AttemptFilter {
                guild_id: Some(roster.guild_id().to_string()),
                character_name: Some(name.to_string()),
                status: Some(AttemptStatus::Pending),
                ..Default::default()
            },
            None,
            registry::AttemptOrder::UpdatedAsc,
        )?;
        if let Some(other) = queued_by_others
            .iter()
            .find(|a| a.identity_id != request.identity_id)
        {
            return Err(RosterError::ConsistencyViolation(format!(
                "Character `{}` is already queued for registration by {}. If this is your character, contact {}.",
                name,
                ports::mention(&other.identity_id),
                roster.escalation()
            )));
        }

        if let Some(mut pending) = pending_for_identity(roster, &request.identity_id)? {
            if !pending.character_name.eq_ignore_ascii_case(name) {
                tracing::info!(
                    attempt = %pending.id,
                    from = %pending.character_name,
                    to = %name,
                    "requeue on rename"
                );
                pending.character_name = name.to_string();
                pending.server = request.server.clone();
                pending.channel_id = request.channel_id.clone();
                pending.platform_guild_id = request.platform_guild_id.clone();
                pending.expires_at = now + ttl;
                pending.attempts = 0;
                pending.last_error = None;
                pending.updated_at = now;
                registry::upsert_attempt(roster.root, &pending)?;
                return Ok(Validation::QueueUpdated(pending));
            }

            return Err(RosterError::UserInput(format!(
                "Character `{}` is already queued for registration by {}. It is retried automatically every hour until {}.",
                name,
                ports::mention(&request.identity_id),
                time::platform_timestamp(&pending.expires_at)
            )));
        }
    }

    let outfit = roster
        .config
        .outfit(&request.server)
        .ok_or_else(|| RosterError::UserInput(format!("Server `{}` is not supported.", request.server)))?;

    match record {
        Some(record) if record.is_in_guild(&outfit.external_guild_id) => Ok(Validation::Ready(record)),
        _ if skip_queue_checks => Err(RosterError::NotYetDetected(format!(
            "Character `{}` is still not detected in the guild.",
            name
        ))),
        _ => {
            let expires_at = now + ttl;
            let attempt = registry::enqueue_attempt(
                roster.root,
                &RegistrationAttempt {
                    id: Ulid::new().to_string(),
                    guild_id: roster.guild_id().to_string(),
                    platform_guild_id: request.platform_guild_id.clone(),
                    channel_id: request.channel_id.clone(),
                    identity_id: request.identity_id.clone(),
                    character_name: name.to_string(),
                    server: request.server.clone(),
                    status: AttemptStatus::Pending,
                    attempts: 0,
                    expires_at,
                    last_error: None,
                    created_at: now,
                    updated_at: now,
                },
            )?;
            tracing::info!(attempt = %attempt.id, character = %name, "registration queued");
            Err(RosterError::NotYetDetected(format!(
                "Character `{}` was not detected in the guild yet. Guild data can lag behind the game; the registration is queued and will be retried automatically every hour until {}.",
                name,
                time::platform_timestamp(&expires_at)
            )))
        }
    }
}

/// Grant the privileges a freshly registered identity is missing.
///
/// An identity without any ranked privilege is seeded with the bottom
/// level, then every `add` the hierarchy rule reports is applied. Removals
/// are left to the scan.
fn grant_registration_roles(
    roster: &Roster<'_>,
    platform_guild_id: &str,
    identity_id: &str,
    server: &str,
) -> Result<Vec<String>, RosterError> {
    let hierarchy = RoleHierarchy::for_server(roster.config, server);
    let mut held: HashSet<String> = HashSet::new();
    for entry in hierarchy.entries() {
        if roster
            .roles
            .identity_has_privilege(platform_guild_id, identity_id, &entry.id)?
        {
            held.insert(entry.id.clone());
        }
    }

    let mut granted = Vec::new();
    if hierarchy.held(&held).is_empty() {
        for entry in hierarchy.bottom() {
            roster
                .roles
                .grant_privilege(platform_guild_id, identity_id, &entry.id)?;
            held.insert(entry.id.clone());
            granted.push(entry.name.clone());
        }
    }
    for finding in hierarchy.evaluate(&held, true) {
        if finding.action == RoleAction::Add {
            roster
                .roles
                .grant_privilege(platform_guild_id, identity_id, &finding.privilege.id)?;
            granted.push(finding.privilege.name);
        }
    }
    Ok(granted)
}

fn complete(
    roster: &Roster<'_>,
    platform_guild_id: &str,
    identity_id: &str,
    record: &CharacterRecord,
    manual_created_by: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(Registration, Vec<String>), RosterError> {
    if roster
        .roles
        .resolve_identity(platform_guild_id, identity_id, false)?
        .is_none()
    {
        return Err(RosterError::UserInput(format!(
            "{} is not a member of the server, so `{}` cannot be registered to them.",
            ports::mention(identity_id),
            record.name
        )));
    }

    let previous = registry::find_registration(
        roster.root,
        &RegistrationFilter {
            guild_id: Some(roster.guild_id().to_string()),
            identity_id: Some(identity_id.to_string()),
            ..Default::default()
        },
    )?;
    let registration = Registration {
        guild_id: roster.guild_id().to_string(),
        identity_id: identity_id.to_string(),
        character_id: record.id.clone(),
        character_name: record.name.clone(),
        server: record.server.clone(),
        manual: manual_created_by.is_some(),
        manual_created_by: manual_created_by.map(str::to_string),
        created_at: previous.map(|p| p.created_at).unwrap_or(now),
        updated_at: now,
    };
    registry::upsert_registration(roster.root, &registration)?;

    let granted = grant_registration_roles(roster, platform_guild_id, identity_id, &record.server)?;
    tracing::info!(
        identity = identity_id,
        character = %record.name,
        manual = registration.manual,
        "registration confirmed"
    );
    Ok((registration, granted))
}

/// Validate and, when the character is confirmed, record the registration.
pub fn register(
    roster: &Roster<'_>,
    request: &RegistrationRequest,
    now: DateTime<Utc>,
) -> Result<RegistrationOutcome, RosterError> {
    register_with(roster, request, false, now)
}

pub fn register_with(
    roster: &Roster<'_>,
    request: &RegistrationRequest,
    skip_queue_checks: bool,
    now: DateTime<Utc>,
) -> Result<RegistrationOutcome, RosterError> {
    match validate(roster, request, skip_queue_checks, now)? {
        Validation::QueueUpdated(attempt) => {
            notify_quietly(
                roster.notifier,
                &request.channel_id,
                &format!(
                    "{} your queued registration was updated to character `{}`. It will be retried hourly until {}.",
                    ports::mention(&request.identity_id),
                    attempt.character_name,
                    time::platform_timestamp(&attempt.expires_at)
                ),
            );
            Ok(RegistrationOutcome::QueueUpdated { attempt })
        }
        Validation::Ready(record) => {
            let (registration, granted) = complete(
                roster,
                &request.platform_guild_id,
                &request.identity_id,
                &record,
                None,
                now,
            )?;
            notify_quietly(
                roster.notifier,
                &request.channel_id,
                &format!(
                    "{} is now registered as `{}`.{}",
                    ports::mention(&request.identity_id),
                    registration.character_name,
                    if granted.is_empty() {
                        String::new()
                    } else {
                        format!(" Granted: {}.", granted.join(", "))
                    }
                ),
            );
            Ok(RegistrationOutcome::Registered {
                registration,
                granted,
            })
        }
    }
}

/// Leadership binds a character without the membership check or the queue.
pub fn register_manual(
    roster: &Roster<'_>,
    character_name: &str,
    server: &str,
    identity_id: &str,
    created_by: &str,
    now: DateTime<Utc>,
) -> Result<RegistrationOutcome, RosterError> {
    check_input(roster, character_name, server)?;
    let platform_guild_id = roster.platform_guild_id();
    check_privileges(roster, platform_guild_id, server)?;

    let record = roster
        .source
        .lookup_character_by_name(character_name, server)?
        .ok_or_else(|| {
            RosterError::UserInput(format!(
                "Character `{}` does not exist on server `{}`.",
                character_name, server
            ))
        })?;
    check_duplicates(roster, platform_guild_id, character_name, Some(&record), identity_id)?;

    let (registration, granted) = complete(
        roster,
        platform_guild_id,
        identity_id,
        &record,
        Some(created_by),
        now,
    )?;
    notify_quietly(
        roster.notifier,
        roster.log_channel(),
        &format!(
            "{} manually registered `{}` to {}.",
            ports::mention(created_by),
            registration.character_name,
            ports::mention(identity_id)
        ),
    );
    Ok(RegistrationOutcome::Registered {
        registration,
        granted,
    })
}

/// Remove the identity's registration and strip its ranked privileges.
pub fn deregister(roster: &Roster<'_>, identity_id: &str) -> Result<Registration, RosterError> {
    let registration = registry::find_registration(
        roster.root,
        &RegistrationFilter {
            guild_id: Some(roster.guild_id().to_string()),
            identity_id: Some(identity_id.to_string()),
            ..Default::default()
        },
    )?
    .ok_or_else(|| {
        RosterError::NotFound(format!(
            "{} has no registered character",
            ports::mention(identity_id)
        ))
    })?;

    registry::delete_registration(roster.root, &registration)?;

    let platform_guild_id = roster.platform_guild_id();
    let mut stripped = Vec::new();
    if roster
        .roles
        .resolve_identity(platform_guild_id, identity_id, true)?
        .is_some()
    {
        for entry in RoleHierarchy::for_server(roster.config, &registration.server).entries() {
            if roster
                .roles
                .identity_has_privilege(platform_guild_id, identity_id, &entry.id)?
            {
                roster
                    .roles
                    .revoke_privilege(platform_guild_id, identity_id, &entry.id)?;
                stripped.push(entry.name.clone());
            }
        }
    }

    tracing::info!(identity = identity_id, character = %registration.character_name, "deregistered");
    notify_quietly(
        roster.notifier,
        roster.log_channel(),
        &format!(
            "{} deregistered from `{}`.{}",
            ports::mention(identity_id),
            registration.character_name,
            if stripped.is_empty() {
                String::new()
            } else {
                format!(" Removed: {}.", stripped.join(", "))
            }
        ),
    );
    Ok(registration)
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "registration",
        "version": "0.4.0",
        "description": "Bind platform identities to guild characters",
        "commands": [
            { "name": "register", "parameters": ["character", "server", "identity", "channel", "manual_by"] },
            { "name": "deregister", "parameters": ["identity"] },
            { "name": "registrations", "parameters": [] }
        ],
        "storage": ["roster.db"]
    })
}
