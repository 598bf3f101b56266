//! Retry queue processor.
//!
//! Each cycle drains the oldest-touched pending attempts and moves each one
//! through its state machine:
//!
//! ```text
//! PENDING --expires_at passed-------------------------> EXPIRED
//! PENDING --member confirmed, registration succeeds---> SUCCEEDED
//! PENDING --member confirmed, terminal error----------> FAILED
//! PENDING --not detected / lookup error / retryable---> PENDING (attempts + 1)
//! ```
//!
//! The membership probe runs before full registration so a character that
//! is still missing from the guild only costs one lookup per cycle. The
//! hourly trigger is the only backoff.

use crate::core::error::RosterError;
use crate::core::output;
use crate::core::ports::{self, notify_quietly};
use crate::core::registry::{self, AttemptFilter, AttemptOrder, AttemptStatus, RegistrationAttempt};
use crate::core::roster::Roster;
use crate::core::time;
use crate::plugins::registration::{self, RegistrationRequest};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;

const NOT_DETECTED: &str = "Character not yet detected in the guild";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "transition", rename_all = "snake_case")]
pub enum AttemptTransition {
    Expired,
    StillPending { reason: String },
    Succeeded,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptResult {
    pub attempt_id: String,
    pub identity_id: String,
    pub character_name: String,
    pub attempts: u32,
    pub transition: AttemptTransition,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueCycleReport {
    pub results: Vec<AttemptResult>,
}

impl QueueCycleReport {
    pub fn count(&self, pred: impl Fn(&AttemptTransition) -> bool) -> usize {
        self.results.iter().filter(|r| pred(&r.transition)).count()
    }
}

/// Run one processor cycle at `now`.
pub fn process_queue(
    roster: &Roster<'_>,
    now: DateTime<Utc>,
) -> Result<QueueCycleReport, RosterError> {
    let pending = registry::find_attempts(
        roster.root,
        &AttemptFilter {
            guild_id: Some(roster.guild_id().to_string()),
            status: Some(AttemptStatus::Pending),
            ..Default::default()
        },
        Some(roster.config.queue.batch_size),
        AttemptOrder::UpdatedAsc,
    )?;

    if pending.is_empty() {
        tracing::debug!("registration queue empty");
        return Ok(QueueCycleReport::default());
    }

    let lines: Vec<String> = pending
        .iter()
        .map(|a| {
            format!(
                "- `{}` for {} (attempt {}, expires {})",
                a.character_name,
                ports::mention(&a.identity_id),
                a.attempts + 1,
                time::platform_timestamp(&a.expires_at)
            )
        })
        .collect();
    let header = format!("Checking {} queued registration(s):", pending.len());
    for message in output::chunk_message(&header, &lines, output::MESSAGE_LIMIT) {
        notify_quietly(roster.notifier, roster.log_channel(), &message);
    }

    let mut report = QueueCycleReport::default();
    for attempt in pending {
        let result = process_attempt(roster, attempt, now)?;
        tracing::info!(
            attempt = %result.attempt_id,
            character = %result.character_name,
            transition = ?result.transition,
            "queue attempt processed"
        );
        report.results.push(result);
    }
    Ok(report)
}

fn result_of(attempt: &RegistrationAttempt, transition: AttemptTransition) -> AttemptResult {
    AttemptResult {
        attempt_id: attempt.id.clone(),
        identity_id: attempt.identity_id.clone(),
        character_name: attempt.character_name.clone(),
        attempts: attempt.attempts,
        transition,
    }
}

fn process_attempt(
    roster: &Roster<'_>,
    mut attempt: RegistrationAttempt,
    now: DateTime<Utc>,
) -> Result<AttemptResult, RosterError> {
    if attempt.is_expired(now) {
        let expired = RosterError::Expired(format!(
            "The queued registration of `{}` timed out after {} attempt(s) without the character appearing in the guild.",
            attempt.character_name, attempt.attempts
        ));
        attempt.status = AttemptStatus::Expired;
        attempt.last_error = Some(expired.to_string());
        attempt.updated_at = now;
        registry::upsert_attempt(roster.root, &attempt)?;
        notify_quietly(
            roster.notifier,
            &attempt.channel_id,
            &format!(
                "{} {} Check the name and register again, or contact {}.",
                ports::mention(&attempt.identity_id),
                expired,
                roster.escalation()
            ),
        );
        return Ok(result_of(&attempt, AttemptTransition::Expired));
    }

    let in_guild = match roster.config.outfit(&attempt.server) {
        None => Err(format!("Server `{}` is no longer configured", attempt.server)),
        Some(outfit) => match roster
            .source
            .lookup_character_by_name(&attempt.character_name, &attempt.server)
        {
            Ok(Some(record)) if record.is_in_guild(&outfit.external_guild_id) => Ok(()),
            Ok(_) => Err(NOT_DETECTED.to_string()),
            Err(e) => Err(e.to_string()),
        },
    };

    attempt.attempts += 1;
    attempt.updated_at = now;
    if let Err(reason) = in_guild {
        attempt.last_error = Some(output::compact_line(&reason, 300));
        registry::upsert_attempt(roster.root, &attempt)?;
        return Ok(result_of(&attempt, AttemptTransition::StillPending { reason }));
    }
    attempt.last_error = None;
    registry::upsert_attempt(roster.root, &attempt)?;

    let request = RegistrationRequest {
        character_name: attempt.character_name.clone(),
        server: attempt.server.clone(),
        identity_id: attempt.identity_id.clone(),
        platform_guild_id: attempt.platform_guild_id.clone(),
        channel_id: attempt.channel_id.clone(),
    };
    match registration::register_with(roster, &request, true, now) {
        Ok(_) => {
            attempt.status = AttemptStatus::Succeeded;
            registry::upsert_attempt(roster.root, &attempt)?;
            Ok(result_of(&attempt, AttemptTransition::Succeeded))
        }
        Err(e) if e.is_retryable() => {
            let reason = e.to_string();
            attempt.last_error = Some(output::compact_line(&reason, 300));
            registry::upsert_attempt(roster.root, &attempt)?;
            Ok(result_of(&attempt, AttemptTransition::StillPending { reason }))
        }
        Err(e) => {
            let reason = e.to_string();
            tracing::warn!(attempt = %attempt.id, error = %reason, "queued registration failed");
            attempt.status = AttemptStatus::Failed;
            attempt.last_error = Some(output::compact_line(&reason, 300));
            registry::upsert_attempt(roster.root, &attempt)?;
            notify_quietly(
                roster.notifier,
                &attempt.channel_id,
                &format!(
                    "{} the queued registration of `{}` failed: {} Please contact {} for help.",
                    ports::mention(&attempt.identity_id),
                    attempt.character_name,
                    reason,
                    roster.escalation()
                ),
            );
            Ok(result_of(&attempt, AttemptTransition::Failed { reason }))
        }
    }
}

/// Queue rows for operators, most recently touched first.
pub fn list_attempts(
    root: &Path,
    guild_id: &str,
    status: Option<AttemptStatus>,
) -> Result<Vec<RegistrationAttempt>, RosterError> {
    registry::find_attempts(
        root,
        &AttemptFilter {
            guild_id: Some(guild_id.to_string()),
            status,
            ..Default::default()
        },
        None,
        AttemptOrder::UpdatedDesc,
    )
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "queue",
        "version": "0.4.0",
        "description": "Retry queue for registrations awaiting guild membership",
        "commands": [
            { "name": "run", "parameters": [] },
            { "name": "list", "parameters": ["status"] }
        ],
        "storage": ["roster.db"]
    })
}
