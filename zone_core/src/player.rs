//! Player data store, §3 Player / §5 shared-resource policy.
//!
//! `pid` allocation reuses freed ids (never reissues a live pid), and a
//! small reconnect-rate-limit map bounds pid-table churn from a reconnect
//! storm (§10 Supplemented Features).

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::error::PlayerError;
use crate::slot::{SlotRegistry, SlotTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientType {
    Vie,
    Continuum,
    Chat,
    Fake,
}

/// Player lifecycle status, §3. Advances only on the mainloop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerStatus {
    Connected,
    NeedAuth,
    NeedGlobalSync,
    LoggedIn,
    DoFreqAndArenaSync,
    ArenaRespAndCBS,
    Playing,
    LeavingArena,
    LeavingZone,
    WaitGlobalSync1,
    WaitArenaSync1,
    WaitGlobalSync2,
    WaitArenaSync2,
    TimeWait,
}

/// Fixed-layout record mirroring what's serialized to clients as the
/// player's visible entry (§3 `packet_view`).
#[derive(Debug, Clone, Copy, Default)]
pub struct PlayerPacketView {
    pub pid: u32,
    pub ship: u8,
    pub freq: u16,
}

pub struct Player {
    pub pid: u32,
    pub client_type: ClientType,
    pub status: PlayerStatus,
    pub arena: Option<String>,
    pub new_arena: Option<String>,
    pub ship: u8,
    pub freq: u16,
    pub address: SocketAddr,
    pub listen_slot: String,
    pub packet_view: PlayerPacketView,
    pub extra_data: SlotTable,
}

impl Player {
    /// Only valid inside `{Playing, LeavingArena}`, matching §8 property 4
    /// (population sweep counts exactly these statuses as "in an arena").
    pub fn counts_toward_population(&self) -> bool {
        matches!(self.status, PlayerStatus::Playing | PlayerStatus::LeavingArena)
    }
}

struct ReconnectGuard {
    window: Duration,
    last_attempt: HashMap<IpAddr, Instant>,
    order: VecDeque<IpAddr>,
    max_tracked: usize,
}

impl ReconnectGuard {
    fn new(window: Duration, max_tracked: usize) -> Self {
        Self {
            window,
            last_attempt: HashMap::new(),
            order: VecDeque::new(),
            max_tracked,
        }
    }

    /// Returns `Err` if `ip` connected within the rate-limit window; records
    /// the attempt either way (a rejected attempt still counts as "recent").
    fn check_and_record(&mut self, ip: IpAddr, now: Instant) -> Result<(), PlayerError> {
        if let Some(last) = self.last_attempt.get(&ip) {
            if now.duration_since(*last) < self.window {
                self.last_attempt.insert(ip, now);
                return Err(PlayerError::ReconnectRateLimited(ip));
            }
        }
        if !self.last_attempt.contains_key(&ip) {
            self.order.push_back(ip);
            if self.order.len() > self.max_tracked {
                if let Some(oldest) = self.order.pop_front() {
                    self.last_attempt.remove(&oldest);
                }
            }
        }
        self.last_attempt.insert(ip, now);
        Ok(())
    }
}

/// Owns the global player table. `players` is exposed via an explicit
/// reader/writer lock (§5: "multi-reader/one-writer locks ... for callers
/// iterating the collections") — the returned guard stands in for the
/// source's explicit `lock()`/`unlock()` pair, released on drop.
pub struct PlayerManager {
    players: RwLock<HashMap<u32, Player>>,
    free_pids: parking_lot::Mutex<Vec<u32>>,
    next_fresh_pid: std::sync::atomic::AtomicU32,
    slots: SlotRegistry,
    reconnect_guard: parking_lot::Mutex<ReconnectGuard>,
}

impl PlayerManager {
    pub fn new(reconnect_window: Duration) -> Self {
        Self {
            players: RwLock::new(HashMap::new()),
            free_pids: parking_lot::Mutex::new(Vec::new()),
            next_fresh_pid: std::sync::atomic::AtomicU32::new(1),
            slots: SlotRegistry::new(),
            reconnect_guard: parking_lot::Mutex::new(ReconnectGuard::new(reconnect_window, 4096)),
        }
    }

    pub fn slots(&self) -> &SlotRegistry {
        &self.slots
    }

    /// Read-lock over the player table for iteration.
    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, HashMap<u32, Player>> {
        self.players.read()
    }

    /// Write-lock over the player table for iteration/mutation.
    pub fn write(&self) -> parking_lot::RwLockWriteGuard<'_, HashMap<u32, Player>> {
        self.players.write()
    }

    /// Accepts a new connection from `address`, subject to the reconnect
    /// rate limiter, allocating a fresh (never-reused-while-live) pid (§3
    /// invariant: "a fresh connection reusing the same IP gets a new pid").
    pub fn accept_connection(
        &self,
        address: SocketAddr,
        client_type: ClientType,
        listen_slot: &str,
        now: Instant,
    ) -> Result<u32, PlayerError> {
        self.reconnect_guard.lock().check_and_record(address.ip(), now)?;

        let pid = self
            .free_pids
            .lock()
            .pop()
            .unwrap_or_else(|| self.next_fresh_pid.fetch_add(1, std::sync::atomic::Ordering::SeqCst));

        let player = Player {
            pid,
            client_type,
            status: PlayerStatus::Connected,
            arena: None,
            new_arena: None,
            ship: 0,
            freq: 0,
            address,
            listen_slot: listen_slot.to_string(),
            packet_view: PlayerPacketView {
                pid,
                ..Default::default()
            },
            extra_data: self.slots.create_owner_slots(),
        };
        self.players.write().insert(pid, player);
        Ok(pid)
    }

    /// Full teardown: disposes extra-data slots and frees the pid for
    /// reuse. Only call once the player has reached `TimeWait`.
    pub fn remove_player(&self, pid: u32) -> Result<(), PlayerError> {
        let player = self
            .players
            .write()
            .remove(&pid)
            .ok_or(PlayerError::NotFound(pid))?;
        self.slots.dispose_owner_slots(player.extra_data);
        self.free_pids.lock().push(pid);
        Ok(())
    }

    /// Population sweep per §4.2 `get_population`: returns
    /// `(total_in_arena, playing)` counts. Caller is expected to already
    /// hold the arena-side lock; this only reads the player table.
    pub fn sweep_population(&self, arena_name: &str) -> (usize, usize) {
        let players = self.players.read();
        let mut total = 0;
        let mut playing = 0;
        for p in players.values() {
            if p.arena.as_deref() == Some(arena_name) && p.counts_toward_population() {
                total += 1;
                if p.status == PlayerStatus::Playing {
                    playing += 1;
                }
            }
        }
        (total, playing)
    }
}
