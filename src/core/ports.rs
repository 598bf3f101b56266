//! Capabilities the roster core consumes from the outside world.
//!
//! The game API, the chat platform and the message sink are all behind
//! these traits. `Send + Sync` because the scan gather phase fans lookups
//! out across threads.

use crate::core::error::RosterError;
use serde::{Deserialize, Serialize};

/// A character as the game API reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterRecord {
    pub id: String,
    pub name: String,
    /// Current guild affiliation, `None` when guildless.
    pub guild_id: Option<String>,
    pub server: String,
}

impl CharacterRecord {
    pub fn is_in_guild(&self, external_guild_id: &str) -> bool {
        self.guild_id.as_deref() == Some(external_guild_id)
    }
}

/// A platform user that could still be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub display_name: String,
}

impl Identity {
    pub fn mention(&self) -> String {
        mention(&self.id)
    }
}

pub fn mention(identity_id: &str) -> String {
    format!("<@{}>", identity_id)
}

pub fn role_mention(privilege_id: &str) -> String {
    format!("<@&{}>", privilege_id)
}

pub trait MembershipSource: Send + Sync {
    fn lookup_character_by_name(
        &self,
        name: &str,
        server: &str,
    ) -> Result<Option<CharacterRecord>, RosterError>;

    fn lookup_character_by_id(
        &self,
        id: &str,
        server: &str,
    ) -> Result<Option<CharacterRecord>, RosterError>;

    fn list_guild_members(
        &self,
        external_guild_id: &str,
        server: &str,
    ) -> Result<Vec<CharacterRecord>, RosterError>;
}

pub trait RoleAuthority: Send + Sync {
    /// `force_refresh` bypasses any member cache.
    fn resolve_identity(
        &self,
        platform_guild_id: &str,
        identity_id: &str,
        force_refresh: bool,
    ) -> Result<Option<Identity>, RosterError>;

    fn privilege_exists(
        &self,
        platform_guild_id: &str,
        privilege_id: &str,
    ) -> Result<bool, RosterError>;

    /// Identity ids currently holding the privilege.
    fn privilege_holders(
        &self,
        platform_guild_id: &str,
        privilege_id: &str,
    ) -> Result<Vec<String>, RosterError>;

    fn identity_has_privilege(
        &self,
        platform_guild_id: &str,
        identity_id: &str,
        privilege_id: &str,
    ) -> Result<bool, RosterError>;

    fn grant_privilege(
        &self,
        platform_guild_id: &str,
        identity_id: &str,
        privilege_id: &str,
    ) -> Result<(), RosterError>;

    fn revoke_privilege(
        &self,
        platform_guild_id: &str,
        identity_id: &str,
        privilege_id: &str,
    ) -> Result<(), RosterError>;
}

pub trait Notifier: Send + Sync {
    fn notify(&self, channel_id: &str, content: &str) -> Result<(), RosterError>;
}

/// Fire-and-forget delivery: failures are logged, never returned.
pub fn notify_quietly(notifier: &dyn Notifier, channel_id: &str, content: &str) {
    if let Err(e) = notifier.notify(channel_id, content) {
        tracing::warn!(channel = channel_id, error = %e, "notification delivery failed");
    }
}
