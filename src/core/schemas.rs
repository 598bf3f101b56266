//! Database schema definitions for the roster store.
//!
//! One SQLite database holds both tables:
//! 1. `registrations`: confirmed character <-> identity bindings.
//! 2. `registration_attempts`: the retry queue of in-flight registrations.

pub const ROSTER_DB_NAME: &str = "roster.db";
pub const BROKER_EVENTS_NAME: &str = "broker.events.jsonl";

pub const ROSTER_DB_SCHEMA_REGISTRATIONS: &str = "
    CREATE TABLE IF NOT EXISTS registrations (
        guild_id TEXT NOT NULL,
        identity_id TEXT NOT NULL,
        character_id TEXT NOT NULL,
        character_name TEXT NOT NULL,
        server TEXT NOT NULL,
        manual INTEGER NOT NULL DEFAULT 0,
        manual_created_by TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY(guild_id, identity_id),
        UNIQUE(guild_id, character_id)
    )
";

pub const ROSTER_DB_SCHEMA_ATTEMPTS: &str = "
    CREATE TABLE IF NOT EXISTS registration_attempts (
        id TEXT PRIMARY KEY,
        guild_id TEXT NOT NULL,
        platform_guild_id TEXT NOT NULL,
        channel_id TEXT NOT NULL,
        identity_id TEXT NOT NULL,
        character_name TEXT NOT NULL,
        server TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending', -- pending, succeeded, failed, expired
        attempts INTEGER NOT NULL DEFAULT 0,
        expires_at TEXT NOT NULL,
        last_error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
";

// Terminal rows may repeat per identity; only one pending row may exist.
pub const ROSTER_DB_SCHEMA_ATTEMPTS_PENDING_INDEX: &str = "
    CREATE UNIQUE INDEX IF NOT EXISTS idx_attempts_one_pending
    ON registration_attempts(guild_id, identity_id) WHERE status = 'pending'
";

pub const ROSTER_DB_SCHEMA_ATTEMPTS_STATUS_INDEX: &str = "
    CREATE INDEX IF NOT EXISTS idx_attempts_status_updated
    ON registration_attempts(status, updated_at)
";

pub const ROSTER_DB_SCHEMA: &[&str] = &[
    ROSTER_DB_SCHEMA_REGISTRATIONS,
    ROSTER_DB_SCHEMA_ATTEMPTS,
    ROSTER_DB_SCHEMA_ATTEMPTS_PENDING_INDEX,
    ROSTER_DB_SCHEMA_ATTEMPTS_STATUS_INDEX,
];
