//! Chat & command dispatch, §4.8.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use crate::capability::Capabilities;
use crate::error::ChatError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatMessageType {
    Arena,
    Pub,
    PubMacro,
    Freq,
    EnemyFreq,
    Private,
    RemotePrivate,
    SysopWarning,
    Chat,
    ModChat,
    Command,
    BillerCommand,
}

const CHAT_TYPE_COUNT: usize = 12;

impl ChatMessageType {
    fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskExpiration {
    Never,
    /// Expires at an absolute instant ("timeout in seconds", §4.8).
    Timeout(Instant),
    /// Cleared on the player's next arena change rather than by time.
    Session,
}

/// Per-player or per-arena restriction bitset: a set bit mutes that
/// [`ChatMessageType`].
#[derive(Debug, Clone, Copy)]
pub struct ChatMask {
    muted: u16,
    expiration: MaskExpiration,
}

impl ChatMask {
    pub fn allow_all() -> Self {
        Self {
            muted: 0,
            expiration: MaskExpiration::Never,
        }
    }

    pub fn mute(&mut self, t: ChatMessageType, expiration: MaskExpiration) {
        self.muted |= t.bit();
        self.expiration = expiration;
    }

    pub fn unmute(&mut self, t: ChatMessageType) {
        self.muted &= !t.bit();
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expiration, MaskExpiration::Timeout(at) if now >= at)
    }

    /// Clears a `Session`-scoped mask; called on arena change (§4.8).
    pub fn clear_on_arena_change(&mut self) {
        if matches!(self.expiration, MaskExpiration::Session) {
            *self = Self::allow_all();
        }
    }

    pub fn is_allowed(&self, t: ChatMessageType, now: Instant) -> bool {
        if self.is_expired(now) {
            return true;
        }
        self.muted & t.bit() == 0
    }
}

impl Default for ChatMask {
    fn default() -> Self {
        Self::allow_all()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandTarget {
    Arena,
    Player(u32),
    Team(u16),
}

pub trait CommandHandler: Send + Sync {
    fn handle(&self, caller: u32, target: CommandTarget, params: &str);
}

struct ParsedCommand {
    force_default: bool,
    name: String,
    params: String,
}

/// Recognizes the leading `?`/`*` and optional forcing `\` prefix (§4.8).
fn parse_command(line: &str) -> Option<ParsedCommand> {
    let mut rest = line;
    let mut force_default = false;
    if let Some(stripped) = rest.strip_prefix('\\') {
        force_default = true;
        rest = stripped;
    }
    if !(rest.starts_with('?') || rest.starts_with('*')) {
        return None;
    }
    rest = &rest[1..];
    let (name, params) = match rest.find(' ') {
        Some(i) => (&rest[..i], rest[i + 1..].trim()),
        None => (rest, ""),
    };
    Some(ParsedCommand {
        force_default,
        name: name.to_lowercase(),
        params: params.to_string(),
    })
}

#[derive(Debug, Clone)]
pub struct LoggedCommand {
    pub caller: u32,
    pub name: String,
    /// `None` when the command name is in the unlogged set (§4.8:
    /// "parameters are redacted").
    pub params: Option<String>,
}

/// Command name → handler, scoped globally or per-arena, plus a
/// billing-registered "default" fallback for unknown commands. A command
/// registered with a required capability is gated through `capabilities`
/// before its handler ever runs (§9 Supplemented Features: Capability &
/// Group service).
pub struct CommandRegistry {
    global: RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
    per_arena: RwLock<HashMap<String, HashMap<String, Arc<dyn CommandHandler>>>>,
    default_handler: RwLock<Option<Arc<dyn CommandHandler>>>,
    unlogged: RwLock<HashSet<String>>,
    required_capability: RwLock<HashMap<String, String>>,
    log: Mutex<Vec<LoggedCommand>>,
    capabilities: Arc<Capabilities>,
}

impl CommandRegistry {
    pub fn new(capabilities: Arc<Capabilities>) -> Self {
        Self {
            global: RwLock::new(HashMap::new()),
            per_arena: RwLock::new(HashMap::new()),
            default_handler: RwLock::new(None),
            unlogged: RwLock::new(HashSet::new()),
            required_capability: RwLock::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
            capabilities,
        }
    }

    pub fn register_global(&self, name: &str, handler: Arc<dyn CommandHandler>) {
        self.global.write().insert(name.to_lowercase(), handler);
    }

    pub fn register_arena(&self, arena: &str, name: &str, handler: Arc<dyn CommandHandler>) {
        self.per_arena
            .write()
            .entry(arena.to_string())
            .or_default()
            .insert(name.to_lowercase(), handler);
    }

    pub fn set_default_handler(&self, handler: Arc<dyn CommandHandler>) {
        *self.default_handler.write() = Some(handler);
    }

    pub fn mark_unlogged(&self, name: &str) {
        self.unlogged.write().insert(name.to_lowercase());
    }

    /// Requires `capability` for every call to `name`, arena-scoped or
    /// global, checked against the caller's [`Capabilities`] before the
    /// handler runs.
    pub fn require_capability(&self, name: &str, capability: &str) {
        self.required_capability
            .write()
            .insert(name.to_lowercase(), capability.to_string());
    }

    pub fn log(&self) -> Vec<LoggedCommand> {
        self.log.lock().clone()
    }

    /// Dispatches `line` for `caller` within `arena` (if any). Precedence:
    /// a forcing `\` bypasses local lookups straight to the default
    /// handler; otherwise arena-scoped beats global, and an unmatched name
    /// falls through to the default handler. A command registered with
    /// `require_capability` is rejected before its handler runs if
    /// `caller` lacks that capability. Every attempt is recorded in the
    /// command log, redacted if the name is marked unlogged.
    pub fn dispatch(&self, arena: Option<&str>, caller: u32, target: CommandTarget, line: &str) -> Result<(), ChatError> {
        let parsed = match parse_command(line) {
            Some(p) => p,
            None => return Ok(()),
        };

        let handler = if parsed.force_default {
            self.default_handler.read().clone()
        } else {
            let arena_handler = arena.and_then(|a| {
                self.per_arena
                    .read()
                    .get(a)
                    .and_then(|m| m.get(&parsed.name))
                    .cloned()
            });
            arena_handler
                .or_else(|| self.global.read().get(&parsed.name).cloned())
                .or_else(|| self.default_handler.read().clone())
        };

        let redacted = self.unlogged.read().contains(&parsed.name);
        self.log.lock().push(LoggedCommand {
            caller,
            name: parsed.name.clone(),
            params: if redacted { None } else { Some(parsed.params.clone()) },
        });

        if let Some(required) = self.required_capability.read().get(&parsed.name).cloned() {
            if !self.capabilities.has(caller, &required) {
                return Err(ChatError::NoPermission(parsed.name, required));
            }
        }

        match handler {
            Some(h) => {
                h.handle(caller, target, &parsed.params);
                Ok(())
            }
            None => Err(ChatError::UnknownCommand(parsed.name)),
        }
    }
}
