//! `roster.toml`: the community, its outfits, queue/scan tuning and the role map.

use crate::core::error::RosterError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

pub const CONFIG_FILE_NAME: &str = "roster.toml";

/// One privilege in the rank hierarchy.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RoleMapEntry {
    pub name: String,
    /// Platform privilege id.
    pub id: String,
    /// Lower value = higher rank.
    pub priority: u32,
    /// Survives even when a higher-ranked privilege is held.
    #[serde(default)]
    pub keep: bool,
    pub server: String,
}

/// The external guild tracked on one game server.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct OutfitConfig {
    pub server: String,
    pub external_guild_id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GuildConfig {
    pub id: String,
    pub platform_guild_id: String,
    /// Operator channel for queue progress and scan reports.
    pub log_channel: String,
    /// Role names pinged after a live scan with findings.
    #[serde(default)]
    pub leader_privileges: Vec<String>,
    /// Who to contact when something needs a human.
    #[serde(default = "default_escalation_contact")]
    pub escalation_contact: String,
    #[serde(default)]
    pub outfits: Vec<OutfitConfig>,
}

fn default_escalation_contact() -> String {
    "a guild leader".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_attempt_ttl_hours")]
    pub attempt_ttl_hours: i64,
}

fn default_batch_size() -> usize {
    10
}

fn default_attempt_ttl_hours() -> i64 {
    72
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            attempt_ttl_hours: default_attempt_ttl_hours(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScanConfig {
    #[serde(default = "default_gather_attempts")]
    pub gather_attempts: u32,
    #[serde(default = "default_gather_backoff_secs")]
    pub gather_backoff_secs: u64,
    #[serde(default = "default_progress_every")]
    pub progress_every: usize,
}

fn default_gather_attempts() -> u32 {
    3
}

fn default_gather_backoff_secs() -> u64 {
    10
}

fn default_progress_every() -> usize {
    5
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            gather_attempts: default_gather_attempts(),
            gather_backoff_secs: default_gather_backoff_secs(),
            progress_every: default_progress_every(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub guild: GuildConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub roles: Vec<RoleMapEntry>,
}

impl Config {
    pub fn from_toml(content: &str) -> Result<Self, RosterError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the core cannot run against.
    pub fn validate(&self) -> Result<(), RosterError> {
        if self.guild.outfits.is_empty() {
            return Err(RosterError::Configuration(
                "no [[guild.outfits]] configured".to_string(),
            ));
        }
        if self.roles.is_empty() {
            return Err(RosterError::Configuration(
                "no [[roles]] configured".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for role in &self.roles {
            if !seen.insert((role.server.as_str(), role.name.as_str())) {
                return Err(RosterError::Configuration(format!(
                    "role `{}` is defined twice for server `{}`",
                    role.name, role.server
                )));
            }
            if self.outfit(&role.server).is_none() {
                return Err(RosterError::Configuration(format!(
                    "role `{}` refers to server `{}` which has no outfit",
                    role.name, role.server
                )));
            }
        }
        for leader in &self.guild.leader_privileges {
            if !self.roles.iter().any(|r| &r.name == leader) {
                return Err(RosterError::Configuration(format!(
                    "leader privilege `{}` is not in the role map",
                    leader
                )));
            }
        }
        if self.scan.gather_attempts == 0 {
            return Err(RosterError::Configuration(
                "scan.gather_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn outfit(&self, server: &str) -> Option<&OutfitConfig> {
        self.guild.outfits.iter().find(|o| o.server == server)
    }

    pub fn roles_for(&self, server: &str) -> Vec<RoleMapEntry> {
        self.roles
            .iter()
            .filter(|r| r.server == server)
            .cloned()
            .collect()
    }

    pub fn leader_roles(&self) -> Vec<&RoleMapEntry> {
        self.roles
            .iter()
            .filter(|r| self.guild.leader_privileges.contains(&r.name))
            .collect()
    }
}

/// Load `roster.toml` from `dir`.
pub fn load_config(dir: &Path) -> Result<Config, RosterError> {
    let config_path = dir.join(CONFIG_FILE_NAME);
    if !config_path.exists() {
        return Err(RosterError::Configuration(format!(
            "{} not found (run `rostersync init`)",
            config_path.display()
        )));
    }
    let content = fs::read_to_string(&config_path).map_err(RosterError::IoError)?;
    Config::from_toml(&content)
}

pub const STARTER_CONFIG: &str = r#"[guild]
id = "dig"
platform_guild_id = "100000000000000000"
log_channel = "100000000000000001"
leader_privileges = ["Leader", "Officer"]
escalation_contact = "the Leader role"

[[guild.outfits]]
server = "miller"
external_guild_id = "37509488620604883"

[queue]
batch_size = 10
attempt_ttl_hours = 72

[scan]
gather_attempts = 3
gather_backoff_secs = 10
progress_every = 5

[[roles]]
name = "Leader"
id = "200000000000000001"
priority = 1
server = "miller"

[[roles]]
name = "Officer"
id = "200000000000000002"
priority = 2
server = "miller"

[[roles]]
name = "Member"
id = "200000000000000003"
priority = 3
server = "miller"

[[roles]]
name = "Recruit"
id = "200000000000000004"
priority = 4
server = "miller"

[[roles]]
name = "Registered"
id = "200000000000000005"
priority = 5
keep = true
server = "miller"
"#;

/// Write the starter `roster.toml` unless one already exists.
pub fn write_starter_config(dir: &Path) -> Result<bool, RosterError> {
    let config_path = dir.join(CONFIG_FILE_NAME);
    if config_path.exists() {
        return Ok(false);
    }
    fs::create_dir_all(dir)?;
    fs::write(&config_path, STARTER_CONFIG)?;
    Ok(true)
}
