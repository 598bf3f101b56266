//! Rank hierarchy rules.
//!
//! The hierarchy is the configured role map for one server, ordered by
//! priority (lower value = higher rank). Everything that decides which
//! privileges an identity should or should not hold lives here as pure
//! functions so the scan and registration paths apply the same rule.

use crate::core::config::{Config, RoleMapEntry};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleHierarchy {
    entries: Vec<RoleMapEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleAction {
    Add,
    Remove,
}

impl fmt::Display for RoleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleAction::Add => f.write_str("add"),
            RoleAction::Remove => f.write_str("remove"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoleFinding {
    pub action: RoleAction,
    pub privilege: RoleMapEntry,
    pub reason: String,
}

impl RoleHierarchy {
    pub fn new(mut entries: Vec<RoleMapEntry>) -> Self {
        entries.sort_by_key(|e| e.priority);
        Self { entries }
    }

    pub fn for_server(config: &Config, server: &str) -> Self {
        Self::new(config.roles_for(server))
    }

    pub fn entries(&self) -> &[RoleMapEntry] {
        &self.entries
    }

    /// Hierarchy entries among `held` (privilege ids), highest rank first.
    pub fn held<'a>(&'a self, held: &HashSet<String>) -> Vec<&'a RoleMapEntry> {
        self.entries.iter().filter(|e| held.contains(&e.id)).collect()
    }

    pub fn highest_held_priority(&self, held: &HashSet<String>) -> Option<u32> {
        self.held(held).first().map(|e| e.priority)
    }

    /// Entries an identity whose highest held priority is `highest` must hold:
    /// everything tied with it plus every lower-ranked `keep` entry.
    pub fn required_set(&self, highest: u32) -> Vec<&RoleMapEntry> {
        self.entries
            .iter()
            .filter(|e| e.priority == highest || (e.priority > highest && e.keep))
            .collect()
    }

    /// Lower-ranked entries that a higher rank supersedes.
    pub fn forbidden_set(&self, highest: u32) -> Vec<&RoleMapEntry> {
        self.entries
            .iter()
            .filter(|e| e.priority > highest && !e.keep)
            .collect()
    }

    /// The lowest-ranked ("registered") level; several entries on a tie.
    pub fn bottom(&self) -> Vec<&RoleMapEntry> {
        match self.entries.last() {
            Some(last) => self
                .entries
                .iter()
                .filter(|e| e.priority == last.priority)
                .collect(),
            None => Vec::new(),
        }
    }

    /// The level directly above the bottom one.
    pub fn entry_above_bottom(&self) -> Vec<&RoleMapEntry> {
        let Some(bottom) = self.entries.last().map(|e| e.priority) else {
            return Vec::new();
        };
        let Some(above) = self
            .entries
            .iter()
            .rev()
            .map(|e| e.priority)
            .find(|p| *p < bottom)
        else {
            return Vec::new();
        };
        self.entries.iter().filter(|e| e.priority == above).collect()
    }

    /// Add/remove corrections for one identity.
    ///
    /// `held` is every privilege id the identity holds (non-hierarchy ids are
    /// ignored); `registered` says whether the registry binds the identity.
    pub fn evaluate(&self, held: &HashSet<String>, registered: bool) -> Vec<RoleFinding> {
        let held_entries = self.held(held);
        let mut findings: Vec<RoleFinding> = Vec::new();
        let Some(highest) = held_entries.first().copied() else {
            if registered {
                for entry in self.bottom() {
                    push_finding(
                        &mut findings,
                        RoleAction::Add,
                        entry,
                        format!(
                            "registered but holds no ranked role; entry level is `{}`",
                            entry.name
                        ),
                    );
                }
            }
            return findings;
        };

        for entry in self.required_set(highest.priority) {
            if !held.contains(&entry.id) {
                push_finding(
                    &mut findings,
                    RoleAction::Add,
                    entry,
                    format!(
                        "holds `{}` (priority {}), which requires `{}`",
                        highest.name, highest.priority, entry.name
                    ),
                );
            }
        }

        for entry in self.forbidden_set(highest.priority) {
            if held.contains(&entry.id) {
                push_finding(
                    &mut findings,
                    RoleAction::Remove,
                    entry,
                    format!(
                        "`{}` (priority {}) is superseded by `{}` (priority {})",
                        entry.name, entry.priority, highest.name, highest.priority
                    ),
                );
            }
        }

        let bottom = self.bottom();
        let only_bottom = held_entries
            .iter()
            .all(|h| bottom.iter().any(|b| b.id == h.id));
        if registered && only_bottom {
            for entry in self.entry_above_bottom() {
                if !held.contains(&entry.id) {
                    push_finding(
                        &mut findings,
                        RoleAction::Add,
                        entry,
                        format!("holds only the bottom level; missing entry role `{}`", entry.name),
                    );
                }
            }
        }

        findings
    }
}

fn push_finding(
    findings: &mut Vec<RoleFinding>,
    action: RoleAction,
    entry: &RoleMapEntry,
    reason: String,
) {
    if !findings
        .iter()
        .any(|f| f.action == action && f.privilege.id == entry.id)
    {
        findings.push(RoleFinding {
            action,
            privilege: entry.clone(),
            reason,
        });
    }
}
