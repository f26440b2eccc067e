//! Persistence executor, §4.7. A FIFO queue of requests drained by one
//! worker thread; every completion is marshalled back onto the mainloop's
//! [`crate::mainloop::WorkQueue`] rather than invoked on the worker thread
//! directly (§5: "Persistence workers block on the datastore; completions
//! are marshalled back").

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use log::error;

use crate::error::PersistError;
use crate::mainloop::WorkQueue;

/// Persistence scope (§3 Arena "holds an interval row"; §4.7 grouping).
/// Ordinal order matters: intervals with ordinal < 5 are eligible for
/// cross-arena base-name grouping, >= 5 are always per-arena (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Interval {
    Forever,
    Reset,
    MapRotation,
    Game,
    ForeverNotShared,
}

impl Interval {
    fn ordinal(self) -> u8 {
        match self {
            Interval::Forever => 0,
            Interval::Reset => 1,
            Interval::MapRotation => 2,
            Interval::Game => 3,
            Interval::ForeverNotShared => 4,
        }
    }

    fn groupable(self) -> bool {
        self.ordinal() < 5
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PersistScope {
    Global,
    PerArena,
}

/// `(owner_type, owner_id, arena_group, interval, key)` row identity (§6).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowKey {
    pub owner_is_player: bool,
    pub owner_id: u32,
    pub arena_group: String,
    pub interval: Interval,
    pub data_key: String,
}

/// Abstract datastore contract the executor drives. Out of scope per §1
/// ("SQLite storage backend" is an external collaborator); this trait is
/// the seam a concrete backend implements.
pub trait Datastore: Send + Sync {
    fn get(&self, key: &RowKey) -> Option<Vec<u8>>;
    fn put(&self, key: &RowKey, bytes: Vec<u8>);
    fn delete(&self, key: &RowKey);
    /// Atomically rotates `(group, interval)` to a fresh current row,
    /// returning the ordinal tag of the row that was current until now
    /// (§4.7 End-interval, §8 property 8).
    fn rotate_interval(&self, group: &str, interval: Interval) -> u64;
}

/// A registered handler for a given `(interval, scope)` pair. `get_data`
/// writes serialized bytes for `target` into `out`; writing zero bytes
/// means "delete this row" (§4.7).
pub trait PersistentData: Send + Sync {
    fn interval(&self) -> Interval;
    fn scope(&self) -> PersistScope;
    fn key(&self) -> &str;
    fn get_data(&self, owner_is_player: bool, owner_id: u32, out: &mut Vec<u8>);
    fn set_data(&self, owner_is_player: bool, owner_id: u32, bytes: &[u8]);
}

/// Per-arena override forcing an explicit persistence group instead of
/// `base_name`-derived grouping (§4.7 "A configuration override (per-arena
/// `ScoreGroup`) forces an explicit group").
#[derive(Default)]
pub struct ScoreGroupOverrides {
    overrides: Mutex<HashMap<String, String>>,
}

impl ScoreGroupOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, arena_name: &str, group: &str) {
        self.overrides.lock().unwrap().insert(arena_name.to_string(), group.to_string());
    }

    /// Resolves the arena-group key used in [`RowKey::arena_group`] for
    /// `(arena_name, base_name, interval)`: an explicit override always
    /// wins; otherwise `base_name` for groupable intervals, the full arena
    /// name for non-groupable ones (§4.7).
    pub fn resolve(&self, arena_name: &str, base_name: &str, interval: Interval) -> String {
        if let Some(group) = self.overrides.lock().unwrap().get(arena_name) {
            return group.clone();
        }
        if interval.groupable() {
            base_name.to_string()
        } else {
            arena_name.to_string()
        }
    }
}

pub enum PersistRequest {
    PutPlayer {
        pid: u32,
        /// The player's current arena group (§6 `(owner_id, arena_group,
        /// interval, key)`), so `EndInterval`/`rotate_interval` on that
        /// group also reaches per-player rows scoped to it.
        arena_group: String,
        interval: Interval,
        key: String,
        bytes: Vec<u8>,
    },
    GetPlayer {
        pid: u32,
        arena_group: String,
        interval: Interval,
        key: String,
    },
    PutArena {
        arena_name: String,
        arena_group: String,
        interval: Interval,
        key: String,
        bytes: Vec<u8>,
    },
    GetArena {
        arena_name: String,
        arena_group: String,
        interval: Interval,
        key: String,
    },
    /// Drives the whole `(interval, scope)` handler set for one owner —
    /// the shape `ArenaManager::tick` needs for `DoInit1`/`DoWriteData`
    /// (§4.2): load or save every registered handler in one pass.
    LoadArena {
        arena_name: String,
        arena_group: String,
        handlers: Arc<Vec<Arc<dyn PersistentData>>>,
    },
    SaveArena {
        arena_name: String,
        arena_group: String,
        handlers: Arc<Vec<Arc<dyn PersistentData>>>,
    },
    EndInterval {
        group: String,
        interval: Interval,
    },
    ResetGameInterval {
        group: String,
    },
    SaveAll {
        handlers: Arc<Vec<Arc<dyn PersistentData>>>,
        arena_groups: Vec<(String, String)>,
    },
}

/// Re-posted to the mainloop once a request has been processed (§4.7 "Each
/// queued item carries a completion continuation that is re-posted to the
/// mainloop when done").
pub enum PersistCompletion {
    PutPlayer { pid: u32 },
    GetPlayer { pid: u32, key: String, bytes: Option<Vec<u8>> },
    PutArena { arena_name: String },
    GetArena { arena_name: String, key: String, bytes: Option<Vec<u8>> },
    LoadArena { arena_name: String },
    SaveArena { arena_name: String },
    EndInterval { group: String, interval: Interval },
    ResetGameInterval { group: String },
    SaveAll,
}

struct QueueItem {
    request: PersistRequest,
    on_complete: Box<dyn FnOnce(PersistCompletion) + Send>,
}

/// One worker thread draining a FIFO queue (§4.7). Endpoints
/// (`PutPlayer`/`GetPlayer`/`PutArena`/`GetArena`/`EndInterval`/
/// `ResetGameInterval`/`SaveAll`) are all represented as [`PersistRequest`]
/// variants; `LoadArena`/`SaveArena` additionally fan a single request out
/// across every registered handler for that `(interval, scope)`, which is
/// what the arena lifecycle sweep actually needs at `DoInit1`/
/// `DoWriteData`.
pub struct PersistExecutor {
    sender: Mutex<Option<Sender<QueueItem>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PersistExecutor {
    /// Spawns the single worker thread. `work_queue` is where completions
    /// get marshalled; `store` is the concrete datastore backend.
    pub fn spawn(store: Arc<dyn Datastore>, work_queue: Arc<WorkQueue>, groups: Arc<ScoreGroupOverrides>) -> Self {
        let (sender, receiver): (Sender<QueueItem>, Receiver<QueueItem>) = crossbeam_channel::unbounded();

        let handle = std::thread::Builder::new()
            .name("zone-persist".to_string())
            .spawn(move || {
                // The loop ends once `shutdown` drops the sender and the
                // channel drains, rather than racing a flag against a
                // blocking recv.
                for item in receiver.iter() {
                    let completion = Self::process(&*store, &groups, item.request);
                    let on_complete = item.on_complete;
                    if work_queue.queue_main_work_item(move || on_complete(completion)).is_err() {
                        error!("persist executor: mainloop work queue closed, dropping completion");
                    }
                }
            })
            .expect("failed to spawn zone-persist worker thread");

        Self {
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn submit(
        &self,
        request: PersistRequest,
        on_complete: impl FnOnce(PersistCompletion) + Send + 'static,
    ) -> Result<(), PersistError> {
        let sender = self.sender.lock().unwrap();
        sender
            .as_ref()
            .ok_or_else(|| PersistError::Store("persist worker channel closed".to_string()))?
            .send(QueueItem {
                request,
                on_complete: Box::new(on_complete),
            })
            .map_err(|_| PersistError::Store("persist worker channel closed".to_string()))
    }

    /// Drops the submit channel so the worker's `receiver.iter()` ends
    /// once it has drained every already-queued request, then blocks
    /// until that worker thread exits. Call during zone_server shutdown
    /// after `quit()`.
    pub fn shutdown(&self) {
        self.sender.lock().unwrap().take();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn process(store: &dyn Datastore, groups: &ScoreGroupOverrides, request: PersistRequest) -> PersistCompletion {
        match request {
            PersistRequest::PutPlayer { pid, arena_group, interval, key, bytes } => {
                let row = RowKey {
                    owner_is_player: true,
                    owner_id: pid,
                    arena_group,
                    interval,
                    data_key: key,
                };
                if bytes.is_empty() {
                    store.delete(&row);
                } else {
                    store.put(&row, bytes);
                }
                PersistCompletion::PutPlayer { pid }
            }
            PersistRequest::GetPlayer { pid, arena_group, interval, key } => {
                let row = RowKey {
                    owner_is_player: true,
                    owner_id: pid,
                    arena_group,
                    interval,
                    data_key: key.clone(),
                };
                let bytes = store.get(&row);
                PersistCompletion::GetPlayer { pid, key, bytes }
            }
            PersistRequest::PutArena { arena_name, arena_group, interval, key, bytes } => {
                let row = RowKey {
                    owner_is_player: false,
                    owner_id: 0,
                    arena_group,
                    interval,
                    data_key: key,
                };
                if bytes.is_empty() {
                    store.delete(&row);
                } else {
                    store.put(&row, bytes);
                }
                PersistCompletion::PutArena { arena_name }
            }
            PersistRequest::GetArena { arena_name, arena_group, interval, key } => {
                let row = RowKey {
                    owner_is_player: false,
                    owner_id: 0,
                    arena_group,
                    interval,
                    data_key: key.clone(),
                };
                let bytes = store.get(&row);
                PersistCompletion::GetArena { arena_name, key, bytes }
            }
            PersistRequest::LoadArena { arena_name, arena_group, handlers } => {
                for handler in handlers.iter() {
                    if handler.scope() != PersistScope::PerArena {
                        continue;
                    }
                    let row = RowKey {
                        owner_is_player: false,
                        owner_id: 0,
                        arena_group: arena_group.clone(),
                        interval: handler.interval(),
                        data_key: handler.key().to_string(),
                    };
                    if let Some(bytes) = store.get(&row) {
                        handler.set_data(false, 0, &bytes);
                    }
                }
                PersistCompletion::LoadArena { arena_name }
            }
            PersistRequest::SaveArena { arena_name, arena_group, handlers } => {
                for handler in handlers.iter() {
                    if handler.scope() != PersistScope::PerArena {
                        continue;
                    }
                    let mut out = Vec::new();
                    handler.get_data(false, 0, &mut out);
                    let row = RowKey {
                        owner_is_player: false,
                        owner_id: 0,
                        arena_group: arena_group.clone(),
                        interval: handler.interval(),
                        data_key: handler.key().to_string(),
                    };
                    if out.is_empty() {
                        store.delete(&row);
                    } else {
                        store.put(&row, out);
                    }
                }
                PersistCompletion::SaveArena { arena_name }
            }
            PersistRequest::EndInterval { group, interval } => {
                store.rotate_interval(&group, interval);
                PersistCompletion::EndInterval { group, interval }
            }
            PersistRequest::ResetGameInterval { group } => {
                store.rotate_interval(&group, Interval::Game);
                PersistCompletion::ResetGameInterval { group }
            }
            PersistRequest::SaveAll { handlers, arena_groups } => {
                for handler in handlers.iter() {
                    match handler.scope() {
                        PersistScope::Global => {
                            let mut out = Vec::new();
                            handler.get_data(false, 0, &mut out);
                            let row = RowKey {
                                owner_is_player: false,
                                owner_id: 0,
                                arena_group: "global".to_string(),
                                interval: handler.interval(),
                                data_key: handler.key().to_string(),
                            };
                            if out.is_empty() {
                                store.delete(&row);
                            } else {
                                store.put(&row, out);
                            }
                        }
                        PersistScope::PerArena => {
                            for (_arena_name, arena_group) in &arena_groups {
                                let mut out = Vec::new();
                                handler.get_data(false, 0, &mut out);
                                let row = RowKey {
                                    owner_is_player: false,
                                    owner_id: 0,
                                    arena_group: arena_group.clone(),
                                    interval: handler.interval(),
                                    data_key: handler.key().to_string(),
                                };
                                if out.is_empty() {
                                    store.delete(&row);
                                } else {
                                    store.put(&row, out);
                                }
                            }
                        }
                    }
                }
                let _ = groups; // groups resolution happens at call sites building arena_groups
                PersistCompletion::SaveAll
            }
        }
    }
}
