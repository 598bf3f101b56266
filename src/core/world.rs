//! Snapshot-backed implementation of every external capability.
//!
//! A `World` holds the game API's characters, the chat platform's members
//! and their privileges, and collects outgoing notifications. It can be
//! loaded from (and written back to) a JSON snapshot so the CLI can drive
//! the core offline, and it doubles as the collaborator fake in tests.
//! The snapshot models a single platform guild; platform guild ids are
//! accepted and ignored.

use crate::core::error::RosterError;
use crate::core::ports::{CharacterRecord, Identity, MembershipSource, Notifier, RoleAuthority};
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

pub const WORLD_FILE_NAME: &str = "world.json";
pub const OUTBOX_FILE_NAME: &str = "outbox.jsonl";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldMember {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub privileges: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorldState {
    #[serde(default)]
    pub characters: Vec<CharacterRecord>,
    #[serde(default)]
    pub members: Vec<WorldMember>,
    /// Privilege ids that exist on the platform.
    #[serde(default)]
    pub privileges: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentNotification {
    pub ts: String,
    pub channel_id: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivilegeCall {
    pub identity_id: String,
    pub privilege_id: String,
}

#[derive(Debug, Default)]
struct CallLog {
    grants: Vec<PrivilegeCall>,
    revokes: Vec<PrivilegeCall>,
    notifications: Vec<SentNotification>,
}

pub struct World {
    state: Mutex<WorldState>,
    calls: Mutex<CallLog>,
    snapshot_path: Option<PathBuf>,
    outbox_path: Option<PathBuf>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl World {
    pub fn new(state: WorldState) -> Self {
        Self {
            state: Mutex::new(state),
            calls: Mutex::new(CallLog::default()),
            snapshot_path: None,
            outbox_path: None,
        }
    }

    /// Load `world.json` from `dir`; privilege changes are written back and
    /// notifications appended to `outbox.jsonl` next to it.
    pub fn open(dir: &Path) -> Result<Self, RosterError> {
        let snapshot_path = dir.join(WORLD_FILE_NAME);
        let state = if snapshot_path.exists() {
            serde_json::from_str(&fs::read_to_string(&snapshot_path)?)?
        } else {
            WorldState::default()
        };
        Ok(Self {
            state: Mutex::new(state),
            calls: Mutex::new(CallLog::default()),
            snapshot_path: Some(snapshot_path),
            outbox_path: Some(dir.join(OUTBOX_FILE_NAME)),
        })
    }

    pub fn save(&self) -> Result<(), RosterError> {
        if let Some(path) = &self.snapshot_path {
            let body = serde_json::to_string_pretty(&*lock(&self.state))?;
            fs::write(path, body)?;
        }
        Ok(())
    }

    pub fn upsert_character(&self, record: CharacterRecord) {
        let mut state = lock(&self.state);
        state.characters.retain(|c| c.id != record.id);
        state.characters.push(record);
    }

    pub fn set_character_guild(&self, character_id: &str, guild_id: Option<&str>) {
        let mut state = lock(&self.state);
        if let Some(c) = state.characters.iter_mut().find(|c| c.id == character_id) {
            c.guild_id = guild_id.map(str::to_string);
        }
    }

    pub fn add_member(&self, id: &str, display_name: &str, privileges: &[&str]) {
        let mut state = lock(&self.state);
        state.members.retain(|m| m.id != id);
        state.members.push(WorldMember {
            id: id.to_string(),
            display_name: display_name.to_string(),
            privileges: privileges.iter().map(|p| p.to_string()).collect(),
        });
    }

    pub fn remove_member(&self, id: &str) {
        lock(&self.state).members.retain(|m| m.id != id);
    }

    pub fn add_privilege(&self, privilege_id: &str) {
        let mut state = lock(&self.state);
        if !state.privileges.iter().any(|p| p == privilege_id) {
            state.privileges.push(privilege_id.to_string());
        }
    }

    pub fn privileges_of(&self, identity_id: &str) -> Vec<String> {
        lock(&self.state)
            .members
            .iter()
            .find(|m| m.id == identity_id)
            .map(|m| m.privileges.clone())
            .unwrap_or_default()
    }

    pub fn grants(&self) -> Vec<PrivilegeCall> {
        lock(&self.calls).grants.clone()
    }

    pub fn revokes(&self) -> Vec<PrivilegeCall> {
        lock(&self.calls).revokes.clone()
    }

    pub fn notifications(&self) -> Vec<SentNotification> {
        lock(&self.calls).notifications.clone()
    }

    pub fn clear_calls(&self) {
        *lock(&self.calls) = CallLog::default();
    }

    fn member_mut<'a>(
        state: &'a mut WorldState,
        identity_id: &str,
    ) -> Result<&'a mut WorldMember, RosterError> {
        state
            .members
            .iter_mut()
            .find(|m| m.id == identity_id)
            .ok_or_else(|| RosterError::NotFound(format!("member {}", identity_id)))
    }
}

impl MembershipSource for World {
    fn lookup_character_by_name(
        &self,
        name: &str,
        server: &str,
    ) -> Result<Option<CharacterRecord>, RosterError> {
        Ok(lock(&self.state)
            .characters
            .iter()
            .find(|c| c.server == server && c.name.eq_ignore_ascii_case(name))
            .cloned())
    }

    fn lookup_character_by_id(
        &self,
        id: &str,
        server: &str,
    ) -> Result<Option<CharacterRecord>, RosterError> {
        Ok(lock(&self.state)
            .characters
            .iter()
            .find(|c| c.server == server && c.id == id)
            .cloned())
    }

    fn list_guild_members(
        &self,
        external_guild_id: &str,
        server: &str,
    ) -> Result<Vec<CharacterRecord>, RosterError> {
        Ok(lock(&self.state)
            .characters
            .iter()
            .filter(|c| c.server == server && c.is_in_guild(external_guild_id))
            .cloned()
            .collect())
    }
}

impl RoleAuthority for World {
    fn resolve_identity(
        &self,
        _platform_guild_id: &str,
        identity_id: &str,
        _force_refresh: bool,
    ) -> Result<Option<Identity>, RosterError> {
        Ok(lock(&self.state)
            .members
            .iter()
            .find(|m| m.id == identity_id)
            .map(|m| Identity {
                id: m.id.clone(),
                display_name: m.display_name.clone(),
            }))
    }

    fn privilege_exists(
        &self,
        _platform_guild_id: &str,
        privilege_id: &str,
    ) -> Result<bool, RosterError> {
        Ok(lock(&self.state).privileges.iter().any(|p| p == privilege_id))
    }

    fn privilege_holders(
        &self,
        _platform_guild_id: &str,
        privilege_id: &str,
    ) -> Result<Vec<String>, RosterError> {
        Ok(lock(&self.state)
            .members
            .iter()
            .filter(|m| m.privileges.iter().any(|p| p == privilege_id))
            .map(|m| m.id.clone())
            .collect())
    }

    fn identity_has_privilege(
        &self,
        _platform_guild_id: &str,
        identity_id: &str,
        privilege_id: &str,
    ) -> Result<bool, RosterError> {
        Ok(self.privileges_of(identity_id).iter().any(|p| p == privilege_id))
    }

    fn grant_privilege(
        &self,
        _platform_guild_id: &str,
        identity_id: &str,
        privilege_id: &str,
    ) -> Result<(), RosterError> {
        {
            let mut state = lock(&self.state);
            let member = Self::member_mut(&mut state, identity_id)?;
            if !member.privileges.iter().any(|p| p == privilege_id) {
                member.privileges.push(privilege_id.to_string());
            }
        }
        lock(&self.calls).grants.push(PrivilegeCall {
            identity_id: identity_id.to_string(),
            privilege_id: privilege_id.to_string(),
        });
        self.save()
    }

    fn revoke_privilege(
        &self,
        _platform_guild_id: &str,
        identity_id: &str,
        privilege_id: &str,
    ) -> Result<(), RosterError> {
        {
            let mut state = lock(&self.state);
            let member = Self::member_mut(&mut state, identity_id)?;
            member.privileges.retain(|p| p != privilege_id);
        }
        lock(&self.calls).revokes.push(PrivilegeCall {
            identity_id: identity_id.to_string(),
            privilege_id: privilege_id.to_string(),
        });
        self.save()
    }
}

impl Notifier for World {
    fn notify(&self, channel_id: &str, content: &str) -> Result<(), RosterError> {
        let sent = SentNotification {
            ts: time::now_epoch_z(),
            channel_id: channel_id.to_string(),
            content: content.to_string(),
        };
        if let Some(path) = &self.outbox_path {
            let mut f = OpenOptions::new().create(true).append(true).open(path)?;
            writeln!(f, "{}", serde_json::to_string(&sent)?)?;
        }
        lock(&self.calls).notifications.push(sent);
        Ok(())
    }
}
