#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use rostersync::core::config::Config;
use rostersync::core::db::initialize_roster_db;
use rostersync::core::error::RosterError;
use rostersync::core::ports::{CharacterRecord, MembershipSource};
use rostersync::core::roster::Roster;
use rostersync::core::world::{World, WorldState};
use std::collections::HashMap;
use std::sync::Mutex;
use tempfile::TempDir;

pub const GUILD: &str = "dig";
pub const PLATFORM_GUILD: &str = "pg-1";
pub const LOG_CHANNEL: &str = "log";
pub const OUTFIT: &str = "outfit-1";
pub const SERVER: &str = "miller";

pub const LEADER: &str = "role-leader";
pub const OFFICER: &str = "role-officer";
pub const MEMBER: &str = "role-member";
pub const RECRUIT: &str = "role-recruit";
pub const REGISTERED: &str = "role-registered";

pub const TEST_CONFIG: &str = r#"[guild]
id = "dig"
platform_guild_id = "pg-1"
log_channel = "log"
leader_privileges = ["Leader"]

[[guild.outfits]]
server = "miller"
external_guild_id = "outfit-1"

[scan]
gather_attempts = 3
gather_backoff_secs = 0
progress_every = 100

[[roles]]
name = "Leader"
id = "role-leader"
priority = 1
server = "miller"

[[roles]]
name = "Officer"
id = "role-officer"
priority = 2
server = "miller"

[[roles]]
name = "Member"
id = "role-member"
priority = 3
server = "miller"

[[roles]]
name = "Recruit"
id = "role-recruit"
priority = 4
server = "miller"

[[roles]]
name = "Registered"
id = "role-registered"
priority = 5
keep = true
server = "miller"
"#;

pub struct Fixture {
    pub dir: TempDir,
    pub config: Config,
    pub world: World,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        initialize_roster_db(dir.path()).unwrap();
        let config = Config::from_toml(TEST_CONFIG).unwrap();
        let world = World::new(WorldState {
            privileges: [LEADER, OFFICER, MEMBER, RECRUIT, REGISTERED]
                .iter()
                .map(|p| p.to_string())
                .collect(),
            ..Default::default()
        });
        Self { dir, config, world }
    }

    pub fn roster(&self) -> Roster<'_> {
        self.roster_with(&self.world)
    }

    /// Same world for privileges and notifications, a different game API.
    pub fn roster_with<'a>(&'a self, source: &'a dyn MembershipSource) -> Roster<'a> {
        Roster {
            root: self.dir.path(),
            config: &self.config,
            source,
            roles: &self.world,
            notifier: &self.world,
        }
    }

    pub fn character(&self, id: &str, name: &str, in_guild: bool) {
        self.world.upsert_character(CharacterRecord {
            id: id.to_string(),
            name: name.to_string(),
            guild_id: in_guild.then(|| OUTFIT.to_string()),
            server: SERVER.to_string(),
        });
    }

    pub fn notifications_to(&self, channel: &str) -> Vec<String> {
        self.world
            .notifications()
            .into_iter()
            .filter(|n| n.channel_id == channel)
            .map(|n| n.content)
            .collect()
    }
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

/// Game API wrapper whose id lookups fail a set number of times per id.
pub struct FlakySource<'a> {
    pub inner: &'a World,
    pub failures_per_id: u32,
    seen: Mutex<HashMap<String, u32>>,
}

impl<'a> FlakySource<'a> {
    pub fn new(inner: &'a World, failures_per_id: u32) -> Self {
        Self {
            inner,
            failures_per_id,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn calls_for(&self, id: &str) -> u32 {
        self.seen.lock().unwrap().get(id).copied().unwrap_or(0)
    }
}

impl MembershipSource for FlakySource<'_> {
    fn lookup_character_by_name(
        &self,
        name: &str,
        server: &str,
    ) -> Result<Option<CharacterRecord>, RosterError> {
        self.inner.lookup_character_by_name(name, server)
    }

    fn lookup_character_by_id(
        &self,
        id: &str,
        server: &str,
    ) -> Result<Option<CharacterRecord>, RosterError> {
        let calls = {
            let mut seen = self.seen.lock().unwrap();
            let calls = seen.entry(id.to_string()).or_insert(0);
            *calls += 1;
            *calls
        };
        if calls <= self.failures_per_id {
            return Err(RosterError::TransientSource(format!(
                "census timeout for {}",
                id
            )));
        }
        self.inner.lookup_character_by_id(id, server)
    }

    fn list_guild_members(
        &self,
        external_guild_id: &str,
        server: &str,
    ) -> Result<Vec<CharacterRecord>, RosterError> {
        self.inner.list_guild_members(external_guild_id, server)
    }
}

/// Game API that is down for name lookups.
pub struct DownSource;

impl MembershipSource for DownSource {
    fn lookup_character_by_name(
        &self,
        _name: &str,
        _server: &str,
    ) -> Result<Option<CharacterRecord>, RosterError> {
        Err(RosterError::TransientSource("census unavailable".into()))
    }

    fn lookup_character_by_id(
        &self,
        _id: &str,
        _server: &str,
    ) -> Result<Option<CharacterRecord>, RosterError> {
        Err(RosterError::TransientSource("census unavailable".into()))
    }

    fn list_guild_members(
        &self,
        _external_guild_id: &str,
        _server: &str,
    ) -> Result<Vec<CharacterRecord>, RosterError> {
        Err(RosterError::TransientSource("census unavailable".into()))
    }
}

/// Game API that sees the character in the guild on the first name lookup
/// only; later lookups fall through to the world, where it is guildless.
pub struct FlickeringSource<'a> {
    pub inner: &'a World,
    name_lookups: Mutex<u32>,
}

impl<'a> FlickeringSource<'a> {
    pub fn new(inner: &'a World) -> Self {
        Self {
            inner,
            name_lookups: Mutex::new(0),
        }
    }
}

impl MembershipSource for FlickeringSource<'_> {
    fn lookup_character_by_name(
        &self,
        name: &str,
        server: &str,
    ) -> Result<Option<CharacterRecord>, RosterError> {
        let first = {
            let mut calls = self.name_lookups.lock().unwrap();
            *calls += 1;
            *calls == 1
        };
        let record = self.inner.lookup_character_by_name(name, server)?;
        Ok(if first {
            record.map(|r| CharacterRecord {
                guild_id: Some(OUTFIT.to_string()),
                ..r
            })
        } else {
            record
        })
    }

    fn lookup_character_by_id(
        &self,
        id: &str,
        server: &str,
    ) -> Result<Option<CharacterRecord>, RosterError> {
        self.inner.lookup_character_by_id(id, server)
    }

    fn list_guild_members(
        &self,
        external_guild_id: &str,
        server: &str,
    ) -> Result<Vec<CharacterRecord>, RosterError> {
        self.inner.list_guild_members(external_guild_id, server)
    }
}
