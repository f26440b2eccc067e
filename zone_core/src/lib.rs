//! Core runtime substrate for a SubSpace/Continuum-compatible zone server:
//! component broker, player/arena lifecycle, mainloop and timers,
//! persistence executor, auth pipeline, and chat/command dispatch. Depends
//! on [`zone_net`] for connection/transport types only — no knowledge of
//! map data, game modes, or specific cipher implementations (§1 Non-goals).

pub mod arena;
pub mod auth;
pub mod broker;
pub mod capability;
pub mod chat;
pub mod config;
pub mod error;
pub mod logging;
pub mod mainloop;
pub mod persist;
pub mod player;
pub mod slot;

pub use arena::{Arena, ArenaEvent, ArenaLifecycle, ArenaManager, ArenaStatus};
pub use auth::{AuthCode, AuthRequest, AuthRequestPool, AuthResult, ChainedAuth, IAuth, IBillingFallback, LoginPacketView};
pub use broker::{AdvisorHandle, CallbackHandle, ComponentBroker, InterfaceHandle};
pub use capability::{Capabilities, Group, DEFAULT_GROUP};
pub use chat::{ChatMask, ChatMessageType, CommandHandler, CommandRegistry, CommandTarget, MaskExpiration};
pub use config::{ConfigChanged, ConfigManager, FileConfigManager};
pub use mainloop::{ExitCode, Mainloop, TimerAction, TimerHandle, TimerRegistry, WorkQueue};
pub use persist::{
    Datastore, Interval, PersistCompletion, PersistExecutor, PersistRequest, PersistScope, PersistentData, RowKey,
    ScoreGroupOverrides,
};
pub use player::{ClientType, Player, PlayerManager, PlayerPacketView, PlayerStatus};
pub use slot::{SlotKey, SlotRegistry, SlotTable};
