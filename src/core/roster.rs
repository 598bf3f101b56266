use crate::core::config::Config;
use crate::core::ports::{MembershipSource, Notifier, RoleAuthority};
use std::path::Path;

/// Everything one registration, queue cycle or scan needs, borrowed for the
/// duration of that call.
#[derive(Clone, Copy)]
pub struct Roster<'a> {
    /// Store directory holding `roster.db`.
    pub root: &'a Path,
    pub config: &'a Config,
    pub source: &'a dyn MembershipSource,
    pub roles: &'a dyn RoleAuthority,
    pub notifier: &'a dyn Notifier,
}

impl<'a> Roster<'a> {
    pub fn guild_id(&self) -> &'a str {
        &self.config.guild.id
    }

    pub fn platform_guild_id(&self) -> &'a str {
        &self.config.guild.platform_guild_id
    }

    pub fn log_channel(&self) -> &'a str {
        &self.config.guild.log_channel
    }

    pub fn escalation(&self) -> &'a str {
        &self.config.guild.escalation_contact
    }
}
