//! Capability & Group service, §10 Supplemented Features. spec.md §2 lists
//! this as part of the 10%-share "Logging, Config, Capability, Group" line
//! item without giving it its own §4 subsection; this fills in the minimal
//! real contract consumed by chat/command dispatch (§4.8) to gate
//! `ModChat`/`SysopWarning`/privileged commands.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::error::CapabilityError;

/// A named bundle of capability strings (e.g. `"sysop"` → `{"cmd_kick",
/// "cmd_shutdown", "seechat_mod"}`).
#[derive(Default, Clone)]
pub struct Group {
    pub capabilities: HashSet<String>,
}

pub const DEFAULT_GROUP: &str = "default";

/// Tracks each player's group membership plus any per-player capability
/// overrides (grants that apply regardless of group).
#[derive(Default)]
pub struct Capabilities {
    groups: RwLock<HashMap<String, Group>>,
    player_group: RwLock<HashMap<u32, String>>,
    player_overrides: RwLock<HashMap<u32, HashSet<String>>>,
}

impl Capabilities {
    pub fn new() -> Self {
        let mut groups = HashMap::new();
        groups.insert(DEFAULT_GROUP.to_string(), Group::default());
        Self {
            groups: RwLock::new(groups),
            player_group: RwLock::new(HashMap::new()),
            player_overrides: RwLock::new(HashMap::new()),
        }
    }

    pub fn define_group(&self, name: &str, capabilities: impl IntoIterator<Item = String>) {
        self.groups.write().insert(
            name.to_string(),
            Group {
                capabilities: capabilities.into_iter().collect(),
            },
        );
    }

    /// Assigns `pid` to `group`. A player not yet assigned is implicitly
    /// `"default"`.
    pub fn set_player_group(&self, pid: u32, group: &str) -> Result<(), CapabilityError> {
        if !self.groups.read().contains_key(group) {
            return Err(CapabilityError::UnknownGroup(group.to_string()));
        }
        self.player_group.write().insert(pid, group.to_string());
        Ok(())
    }

    pub fn grant_override(&self, pid: u32, capability: &str) {
        self.player_overrides
            .write()
            .entry(pid)
            .or_default()
            .insert(capability.to_string());
    }

    /// True if `pid`'s group (or a per-player override) grants `capability`.
    pub fn has(&self, pid: u32, capability: &str) -> bool {
        if self
            .player_overrides
            .read()
            .get(&pid)
            .is_some_and(|s| s.contains(capability))
        {
            return true;
        }
        let group_name = self
            .player_group
            .read()
            .get(&pid)
            .cloned()
            .unwrap_or_else(|| DEFAULT_GROUP.to_string());
        self.groups
            .read()
            .get(&group_name)
            .is_some_and(|g| g.capabilities.contains(capability))
    }
}
