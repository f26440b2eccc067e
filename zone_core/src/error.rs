//! One `thiserror` enum per module, grouped in a single file as zone_net
//! does — matching the teacher's per-subsystem error.rs convention.

use thiserror::Error;

/// Component Broker errors (§4.1).
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("interface still held by {refcount} caller(s)")]
    Busy { refcount: usize },
    #[error("an interface is already registered under name {0:?}")]
    DuplicateName(String),
    #[error("no interface of the requested type is registered")]
    NotFound,
}

/// Arena lifecycle and arena-manager errors (§4.2).
#[derive(Debug, Error)]
pub enum ArenaError {
    #[error("add_hold called outside a PreCreate/Create/Destroy callback window")]
    HoldOutsideWindow,
    #[error("arena {0:?} not found")]
    NotFound(String),
    #[error("arena {0:?} is not in Running state")]
    NotRunning(String),
}

/// Player lifecycle and player-store errors (§3, §4.2 sibling).
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("player {0} not found")]
    NotFound(u32),
    #[error("reconnect from {0} rate-limited, retry later")]
    ReconnectRateLimited(std::net::IpAddr),
    #[error("extra-data slot {0} not allocated on this owner")]
    SlotNotAllocated(usize),
}

/// Mainloop and timer-service errors (§4.3).
#[derive(Debug, Error)]
pub enum MainloopError {
    #[error("work item queue closed, mainloop already shut down")]
    QueueClosed,
}

/// Persistence executor errors (§4.7).
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("no persistent-data handler registered for interval {0:?}/key {1}")]
    NoHandler(String, String),
    #[error("datastore operation failed: {0}")]
    Store(String),
}

/// Auth pipeline errors (§4.6).
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("auth request already completed")]
    AlreadyDone,
    #[error("auth request abandoned: player disconnected before done()")]
    Abandoned,
}

/// Chat / command dispatch errors (§4.8).
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("message type {0:?} is masked for this player")]
    Masked(String),
    #[error("no command registered with name {0:?}")]
    UnknownCommand(String),
    #[error("caller lacks the {1:?} capability required for command {0:?}")]
    NoPermission(String, String),
}

/// Configuration errors (§6, §9.3).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config parse error at {file}:{line}: {message}")]
    Parse {
        file: String,
        line: usize,
        message: String,
    },
    #[error("config key {section}:{key} missing and no default supplied")]
    MissingKey { section: String, key: String },
    #[error("io error reading config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Capability/group-service errors (§9 Supplemented Features).
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("group {0:?} not defined")]
    UnknownGroup(String),
}
