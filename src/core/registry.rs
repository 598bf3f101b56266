//! Persisted roster records: confirmed registrations and the retry queue.
//!
//! All access goes through [`DbBroker`]. Writes that depend on a prior
//! read happen inside a single `with_conn` closure so they cannot
//! interleave with another writer in the same process.

use crate::core::broker::DbBroker;
use crate::core::db;
use crate::core::error::RosterError;
use crate::core::time;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params, types::ToSql};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

const ACTOR: &str = "rostersync";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub guild_id: String,
    pub identity_id: String,
    pub character_id: String,
    pub character_name: String,
    pub server: String,
    pub manual: bool,
    pub manual_created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Pending,
    Succeeded,
    Failed,
    Expired,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Pending => "pending",
            AttemptStatus::Succeeded => "succeeded",
            AttemptStatus::Failed => "failed",
            AttemptStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptStatus {
    type Err = RosterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(AttemptStatus::Pending),
            "succeeded" => Ok(AttemptStatus::Succeeded),
            "failed" => Ok(AttemptStatus::Failed),
            "expired" => Ok(AttemptStatus::Expired),
            other => Err(RosterError::UserInput(format!(
                "unknown attempt status `{}`",
                other
            ))),
        }
    }
}

/// One row of the retry queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationAttempt {
    pub id: String,
    pub guild_id: String,
    pub platform_guild_id: String,
    pub channel_id: String,
    pub identity_id: String,
    pub character_name: String,
    pub server: String,
    pub status: AttemptStatus,
    pub attempts: u32,
    pub expires_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RegistrationAttempt {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Default)]
pub struct RegistrationFilter {
    pub guild_id: Option<String>,
    pub identity_id: Option<String>,
    pub character_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AttemptFilter {
    pub guild_id: Option<String>,
    pub identity_id: Option<String>,
    /// Case-insensitive match.
    pub character_name: Option<String>,
    pub status: Option<AttemptStatus>,
}

#[derive(Debug, Clone, Copy, Default)]
pub enum AttemptOrder {
    /// Oldest-touched first; the queue processor's fairness order.
    #[default]
    UpdatedAsc,
    UpdatedDesc,
}

const REGISTRATION_COLUMNS: &str = "guild_id, identity_id, character_id, character_name, server, manual, manual_created_by, created_at, updated_at";

const ATTEMPT_COLUMNS: &str = "id, guild_id, platform_guild_id, channel_id, identity_id, character_name, server, status, attempts, expires_at, last_error, created_at, updated_at";

fn registration_from_row(row: &Row<'_>) -> rusqlite::Result<Registration> {
    Ok(Registration {
        guild_id: row.get(0)?,
        identity_id: row.get(1)?,
        character_id: row.get(2)?,
        character_name: row.get(3)?,
        server: row.get(4)?,
        manual: row.get::<_, i64>(5)? != 0,
        manual_created_by: row.get(6)?,
        created_at: time::from_db(&row.get::<_, String>(7)?)?,
        updated_at: time::from_db(&row.get::<_, String>(8)?)?,
    })
}

fn attempt_from_row(row: &Row<'_>) -> rusqlite::Result<RegistrationAttempt> {
    let status: String = row.get(7)?;
    Ok(RegistrationAttempt {
        id: row.get(0)?,
        guild_id: row.get(1)?,
        platform_guild_id: row.get(2)?,
        channel_id: row.get(3)?,
        identity_id: row.get(4)?,
        character_name: row.get(5)?,
        server: row.get(6)?,
        status: status.parse().map_err(|e: RosterError| {
            rusqlite::Error::FromSqlConversionFailure(
                7,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::other(e.to_string())),
            )
        })?,
        attempts: row.get(8)?,
        expires_at: time::from_db(&row.get::<_, String>(9)?)?,
        last_error: row.get(10)?,
        created_at: time::from_db(&row.get::<_, String>(11)?)?,
        updated_at: time::from_db(&row.get::<_, String>(12)?)?,
    })
}

fn query_registrations(
    conn: &Connection,
    filter: &RegistrationFilter,
) -> Result<Vec<Registration>, RosterError> {
    let mut query = format!("SELECT {} FROM registrations WHERE 1=1", REGISTRATION_COLUMNS);
    let mut params: Vec<Box<dyn ToSql>> = Vec::new();

    if let Some(g) = &filter.guild_id {
        query.push_str(" AND guild_id = ?");
        params.push(Box::new(g.clone()));
    }
    if let Some(i) = &filter.identity_id {
        query.push_str(" AND identity_id = ?");
        params.push(Box::new(i.clone()));
    }
    if let Some(c) = &filter.character_id {
        query.push_str(" AND character_id = ?");
        params.push(Box::new(c.clone()));
    }
    query.push_str(" ORDER BY created_at ASC");

    let mut stmt = conn.prepare(&query)?;
    let params_as_dyn: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let rows = stmt.query_map(&params_as_dyn[..], registration_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn query_attempts(
    conn: &Connection,
    filter: &AttemptFilter,
    limit: Option<usize>,
    order: AttemptOrder,
) -> Result<Vec<RegistrationAttempt>, RosterError> {
    let mut query = format!(
        "SELECT {} FROM registration_attempts WHERE 1=1",
        ATTEMPT_COLUMNS
    );
    let mut params: Vec<Box<dyn ToSql>> = Vec::new();

    if let Some(g) = &filter.guild_id {
        query.push_str(" AND guild_id = ?");
        params.push(Box::new(g.clone()));
    }
    if let Some(i) = &filter.identity_id {
        query.push_str(" AND identity_id = ?");
        params.push(Box::new(i.clone()));
    }
    if let Some(n) = &filter.character_name {
        query.push_str(" AND character_name = ? COLLATE NOCASE");
        params.push(Box::new(n.clone()));
    }
    if let Some(s) = filter.status {
        query.push_str(" AND status = ?");
        params.push(Box::new(s.as_str()));
    }

    match order {
        AttemptOrder::UpdatedAsc => query.push_str(" ORDER BY updated_at ASC, created_at ASC"),
        AttemptOrder::UpdatedDesc => query.push_str(" ORDER BY updated_at DESC, created_at DESC"),
    }
    if let Some(limit) = limit {
        query.push_str(" LIMIT ?");
        params.push(Box::new(limit as i64));
    }

    let mut stmt = conn.prepare(&query)?;
    let params_as_dyn: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let rows = stmt.query_map(&params_as_dyn[..], attempt_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn write_attempt(conn: &Connection, attempt: &RegistrationAttempt) -> Result<(), RosterError> {
    conn.execute(
        "INSERT INTO registration_attempts(id, guild_id, platform_guild_id, channel_id, identity_id, character_name, server, status, attempts, expires_at, last_error, created_at, updated_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
         ON CONFLICT(id) DO UPDATE SET
            platform_guild_id = excluded.platform_guild_id,
            channel_id = excluded.channel_id,
            character_name = excluded.character_name,
            server = excluded.server,
            status = excluded.status,
            attempts = excluded.attempts,
            expires_at = excluded.expires_at,
            last_error = excluded.last_error,
            updated_at = excluded.updated_at",
        params![
            attempt.id,
            attempt.guild_id,
            attempt.platform_guild_id,
            attempt.channel_id,
            attempt.identity_id,
            attempt.character_name,
            attempt.server,
            attempt.status.as_str(),
            attempt.attempts,
            time::to_db(&attempt.expires_at),
            attempt.last_error,
            time::to_db(&attempt.created_at),
            time::to_db(&attempt.updated_at),
        ],
    )?;
    Ok(())
}

pub fn find_registration(
    root: &Path,
    filter: &RegistrationFilter,
) -> Result<Option<Registration>, RosterError> {
    Ok(find_registrations(root, filter)?.into_iter().next())
}

pub fn find_registrations(
    root: &Path,
    filter: &RegistrationFilter,
) -> Result<Vec<Registration>, RosterError> {
    let broker = DbBroker::new(root);
    broker.with_conn(&db::roster_db_path(root), ACTOR, "registration.find", |conn| {
        query_registrations(conn, filter)
    })
}

/// Insert or replace the identity's registration, keeping `created_at`.
pub fn upsert_registration(root: &Path, registration: &Registration) -> Result<(), RosterError> {
    let broker = DbBroker::new(root);
    broker.with_conn(&db::roster_db_path(root), ACTOR, "registration.upsert", |conn| {
        conn.execute(
            "INSERT INTO registrations(guild_id, identity_id, character_id, character_name, server, manual, manual_created_by, created_at, updated_at)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(guild_id, identity_id) DO UPDATE SET
                character_id = excluded.character_id,
                character_name = excluded.character_name,
                server = excluded.server,
                manual = excluded.manual,
                manual_created_by = excluded.manual_created_by,
                updated_at = excluded.updated_at",
            params![
                registration.guild_id,
                registration.identity_id,
                registration.character_id,
                registration.character_name,
                registration.server,
                registration.manual as i64,
                registration.manual_created_by,
                time::to_db(&registration.created_at),
                time::to_db(&registration.updated_at),
            ],
        )?;
        Ok(())
    })
}

/// Returns whether a row was removed.
pub fn delete_registration(root: &Path, registration: &Registration) -> Result<bool, RosterError> {
    let broker = DbBroker::new(root);
    broker.with_conn(&db::roster_db_path(root), ACTOR, "registration.delete", |conn| {
        let n = conn.execute(
            "DELETE FROM registrations WHERE guild_id = ?1 AND identity_id = ?2",
            params![registration.guild_id, registration.identity_id],
        )?;
        Ok(n > 0)
    })
}

pub fn find_attempts(
    root: &Path,
    filter: &AttemptFilter,
    limit: Option<usize>,
    order: AttemptOrder,
) -> Result<Vec<RegistrationAttempt>, RosterError> {
    let broker = DbBroker::new(root);
    broker.with_conn(&db::roster_db_path(root), ACTOR, "attempt.find", |conn| {
        query_attempts(conn, filter, limit, order)
    })
}

pub fn find_attempt(
    root: &Path,
    filter: &AttemptFilter,
) -> Result<Option<RegistrationAttempt>, RosterError> {
    Ok(find_attempts(root, filter, Some(1), AttemptOrder::UpdatedDesc)?
        .into_iter()
        .next())
}

/// Persist an attempt by primary key.
pub fn upsert_attempt(root: &Path, attempt: &RegistrationAttempt) -> Result<(), RosterError> {
    let broker = DbBroker::new(root);
    broker.with_conn(&db::roster_db_path(root), ACTOR, "attempt.upsert", |conn| {
        write_attempt(conn, attempt)
    })
}

/// Queue a pending attempt, folding into the identity's existing pending row.
///
/// The lookup and the write share one broker closure, so two in-process
/// callers cannot both insert a pending row for the same identity.
pub fn enqueue_attempt(
    root: &Path,
    attempt: &RegistrationAttempt,
) -> Result<RegistrationAttempt, RosterError> {
    let broker = DbBroker::new(root);
    broker.with_conn(&db::roster_db_path(root), ACTOR, "attempt.enqueue", |conn| {
        let existing = conn
            .query_row(
                &format!(
                    "SELECT {} FROM registration_attempts WHERE guild_id = ?1 AND identity_id = ?2 AND status = 'pending'",
                    ATTEMPT_COLUMNS
                ),
                params![attempt.guild_id, attempt.identity_id],
                attempt_from_row,
            )
            .optional()?;

        let stored = match existing {
            Some(current) => RegistrationAttempt {
                id: current.id,
                created_at: current.created_at,
                ..attempt.clone()
            },
            None => attempt.clone(),
        };
        write_attempt(conn, &stored)?;
        Ok(stored)
    })
}
