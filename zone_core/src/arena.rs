//! Arena manager, §4.2. The lifecycle state machine is driven by periodic
//! calls to [`ArenaManager::tick`] from the mainloop; persistence
//! completion is signalled back in by [`ArenaManager::notify_persist_loaded`]
//! / [`ArenaManager::notify_persist_saved`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use log::{info, warn};
use parking_lot::{Mutex, RwLock};

use crate::broker::ComponentBroker;
use crate::error::ArenaError;
use crate::slot::{SlotRegistry, SlotTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaStatus {
    DoInit0,
    WaitHolds0,
    DoInit1,
    WaitSync1,
    DoInit2,
    WaitHolds1,
    Running,
    DoWriteData,
    WaitHolds2,
    DoDestroy1,
    WaitHolds3,
    DoDestroy2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleEvent {
    PreCreate,
    Create,
    Destroy,
}

/// Strips trailing digits from an arena name, per §3 `base_name` ("used for
/// data sharing" and arena-group persistence §4.7).
pub fn base_name_of(name: &str) -> String {
    name.trim_end_matches(|c: char| c.is_ascii_digit()).to_string()
}

pub struct Arena {
    pub name: String,
    pub base_name: String,
    pub broker: ComponentBroker,
    pub specfreq: RwLock<u16>,
    pub player_count: AtomicU32,
    pub playing_count: AtomicU32,
    pub extra_data: Mutex<SlotTable>,
    status: Mutex<ArenaStatus>,
    holds: AtomicU32,
    current_event: Mutex<Option<LifecycleEvent>>,
    persist_save_done: AtomicBool,
    recycle_requested: AtomicBool,
}

impl Arena {
    pub fn status(&self) -> ArenaStatus {
        *self.status.lock()
    }

    pub fn holds(&self) -> u32 {
        self.holds.load(Ordering::SeqCst)
    }
}

/// Emitted by [`ArenaManager::tick`] for the mainloop (and persistence
/// executor) to react to.
pub enum ArenaEvent {
    RequestPersistLoad(Arc<Arena>),
    RequestPersistSave(Arc<Arena>),
    Removed(String),
    Recreated(Arc<Arena>),
}

pub struct ArenaManager {
    global_broker: ComponentBroker,
    arenas: RwLock<HashMap<String, Arc<Arena>>>,
    slots: SlotRegistry,
}

impl ArenaManager {
    pub fn new(global_broker: ComponentBroker) -> Self {
        Self {
            global_broker,
            arenas: RwLock::new(HashMap::new()),
            slots: SlotRegistry::new(),
        }
    }

    pub fn slots(&self) -> &SlotRegistry {
        &self.slots
    }

    /// Case-insensitive lookup restricted to `Running` (§3 invariant,
    /// §8 property 3).
    pub fn find_arena(&self, name: &str) -> Option<Arc<Arena>> {
        self.arenas.read().values().find(|a| {
            a.name.eq_ignore_ascii_case(name) && a.status() == ArenaStatus::Running
        }).cloned()
    }

    /// All arenas currently in `Running`, for the mainloop's per-iteration
    /// population sweep (§4.2 `get_population`).
    pub fn find_running_arenas(&self) -> Vec<Arc<Arena>> {
        self.arenas
            .read()
            .values()
            .filter(|a| a.status() == ArenaStatus::Running)
            .cloned()
            .collect()
    }

    fn new_arena(&self, name: &str) -> Arc<Arena> {
        Arc::new(Arena {
            name: name.to_string(),
            base_name: base_name_of(name),
            broker: self.global_broker.new_child(),
            specfreq: RwLock::new(8100),
            player_count: AtomicU32::new(0),
            playing_count: AtomicU32::new(0),
            extra_data: Mutex::new(self.slots.create_owner_slots()),
            status: Mutex::new(ArenaStatus::DoInit0),
            holds: AtomicU32::new(0),
            current_event: Mutex::new(None),
            persist_save_done: AtomicBool::new(false),
            recycle_requested: AtomicBool::new(false),
        })
    }

    /// Requests (or reuses) an arena by name, creating it in `DoInit0` if
    /// it doesn't exist yet. Returns the arena handle regardless of its
    /// current lifecycle stage; callers that need a `Running` arena should
    /// use [`ArenaManager::find_arena`].
    pub fn get_or_create(&self, name: &str) -> Arc<Arena> {
        let mut arenas = self.arenas.write();
        arenas
            .entry(name.to_string())
            .or_insert_with(|| self.new_arena(name))
            .clone()
    }

    /// Marks the arena for destroy-then-recreate (§4.2 `recycle_arena`).
    pub fn recycle_arena(&self, name: &str) -> Result<(), ArenaError> {
        let arena = self
            .arenas
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ArenaError::NotFound(name.to_string()))?;
        arena.recycle_requested.store(true, Ordering::SeqCst);
        *arena.status.lock() = ArenaStatus::DoWriteData;
        Ok(())
    }

    /// Valid only while the arena is firing `PreCreate`, `Create`, or
    /// `Destroy` callbacks (checked at runtime, §4.2).
    pub fn add_hold(&self, arena: &Arena) -> Result<(), ArenaError> {
        if arena.current_event.lock().is_none() {
            warn!("add_hold on arena {:?} outside a callback window", arena.name);
            return Err(ArenaError::HoldOutsideWindow);
        }
        arena.holds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Callable from any thread, unlike `add_hold` (§4.2).
    pub fn remove_hold(&self, arena: &Arena) {
        arena.holds.fetch_sub(1, Ordering::SeqCst);
    }

    /// `(total, playing)` sweep across all arenas currently tracked,
    /// delegated to by the player manager's per-arena sweep.
    pub fn get_population(&self, arena: &Arena, sweep: impl Fn(&str) -> (usize, usize)) {
        let (total, playing) = sweep(&arena.name);
        arena.player_count.store(total as u32, Ordering::SeqCst);
        arena.playing_count.store(playing as u32, Ordering::SeqCst);
    }

    /// Signals that a queued `RequestPersistLoad` has completed.
    pub fn notify_persist_loaded(&self, name: &str) {
        if let Some(arena) = self.arenas.read().get(name) {
            let mut status = arena.status.lock();
            if *status == ArenaStatus::WaitSync1 {
                *status = ArenaStatus::DoInit2;
            }
        }
    }

    /// Signals that a queued `RequestPersistSave` has completed.
    pub fn notify_persist_saved(&self, name: &str) {
        if let Some(arena) = self.arenas.read().get(name) {
            arena.persist_save_done.store(true, Ordering::SeqCst);
        }
    }

    /// Advances every arena one lifecycle step, per the diagram in §4.2.
    /// Returns events the mainloop must act on (persistence requests,
    /// removal, recreation).
    pub fn tick(&self) -> Vec<ArenaEvent> {
        let mut events = Vec::new();
        let mut to_remove = Vec::new();
        let arenas: Vec<Arc<Arena>> = self.arenas.read().values().cloned().collect();

        for arena in arenas {
            let current = arena.status();
            match current {
                ArenaStatus::DoInit0 => {
                    *arena.current_event.lock() = Some(LifecycleEvent::PreCreate);
                    arena.broker.fire(&ArenaLifecycle::PreCreate(arena.name.clone()));
                    *arena.current_event.lock() = None;
                    *arena.status.lock() = ArenaStatus::WaitHolds0;
                }
                ArenaStatus::WaitHolds0 => {
                    if arena.holds() == 0 {
                        *arena.status.lock() = ArenaStatus::DoInit1;
                    }
                }
                ArenaStatus::DoInit1 => {
                    *arena.status.lock() = ArenaStatus::WaitSync1;
                    events.push(ArenaEvent::RequestPersistLoad(arena.clone()));
                }
                ArenaStatus::WaitSync1 => {}
                ArenaStatus::DoInit2 => {
                    *arena.current_event.lock() = Some(LifecycleEvent::Create);
                    arena.broker.fire(&ArenaLifecycle::Create(arena.name.clone()));
                    *arena.current_event.lock() = None;
                    *arena.status.lock() = ArenaStatus::WaitHolds1;
                }
                ArenaStatus::WaitHolds1 => {
                    if arena.holds() == 0 {
                        info!("arena {:?} entering Running", arena.name);
                        *arena.status.lock() = ArenaStatus::Running;
                    }
                }
                ArenaStatus::Running => {}
                ArenaStatus::DoWriteData => {
                    arena.persist_save_done.store(false, Ordering::SeqCst);
                    *arena.status.lock() = ArenaStatus::WaitHolds2;
                    events.push(ArenaEvent::RequestPersistSave(arena.clone()));
                }
                ArenaStatus::WaitHolds2 => {
                    if arena.holds() == 0 && arena.persist_save_done.load(Ordering::SeqCst) {
                        *arena.status.lock() = ArenaStatus::DoDestroy1;
                    }
                }
                ArenaStatus::DoDestroy1 => {
                    *arena.current_event.lock() = Some(LifecycleEvent::Destroy);
                    arena.broker.fire(&ArenaLifecycle::Destroy(arena.name.clone()));
                    *arena.current_event.lock() = None;
                    *arena.status.lock() = ArenaStatus::WaitHolds3;
                }
                ArenaStatus::WaitHolds3 => {
                    if arena.holds() == 0 {
                        *arena.status.lock() = ArenaStatus::DoDestroy2;
                    }
                }
                ArenaStatus::DoDestroy2 => {
                    self.slots.dispose_owner_slots(std::mem::replace(
                        &mut *arena.extra_data.lock(),
                        self.slots.create_owner_slots(),
                    ));
                    to_remove.push(arena.name.clone());
                    if arena.recycle_requested.load(Ordering::SeqCst) {
                        let fresh = self.new_arena(&arena.name);
                        events.push(ArenaEvent::Recreated(fresh));
                    } else {
                        events.push(ArenaEvent::Removed(arena.name.clone()));
                    }
                }
            }
        }

        if !to_remove.is_empty() {
            let mut arenas = self.arenas.write();
            for name in &to_remove {
                arenas.remove(name);
            }
        }
        for event in &events {
            if let ArenaEvent::Recreated(fresh) = event {
                self.arenas.write().insert(fresh.name.clone(), fresh.clone());
            }
        }
        events
    }
}

/// Fired on an arena's broker node during the three callback windows in
/// which `add_hold` is legal (§4.2).
pub enum ArenaLifecycle {
    PreCreate(String),
    Create(String),
    Destroy(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_name_strips_trailing_digits() {
        assert_eq!(base_name_of("turf42"), "turf");
        assert_eq!(base_name_of("0v0"), "0v0");
        assert_eq!(base_name_of("trench12"), "trench");
    }

    #[test]
    fn find_arena_only_sees_running() {
        let root = ComponentBroker::new_root();
        let mgr = ArenaManager::new(root);
        let arena = mgr.get_or_create("turf");
        assert!(mgr.find_arena("turf").is_none());
        *arena.status.lock() = ArenaStatus::Running;
        assert!(mgr.find_arena("TURF").is_some());
    }

    /// E3 — arena hold: a PreCreate handler adds a hold; the arena stays
    /// in WaitHolds0 across repeated ticks until the hold is removed.
    #[test]
    fn e3_hold_blocks_transition_until_removed() {
        let root = ComponentBroker::new_root();
        let mgr = ArenaManager::new(root);
        let arena = mgr.get_or_create("turf");
        arena.broker.register_callback::<ArenaLifecycle, _>({
            let mgr_holds: Arc<Arena> = arena.clone();
            move |event| {
                if matches!(event, ArenaLifecycle::PreCreate(_)) {
                    mgr_holds.holds.fetch_add(1, Ordering::SeqCst);
                }
            }
        });

        mgr.tick(); // DoInit0 -> fires PreCreate (adds hold) -> WaitHolds0
        assert_eq!(arena.status(), ArenaStatus::WaitHolds0);

        for _ in 0..5 {
            mgr.tick();
            assert_eq!(arena.status(), ArenaStatus::WaitHolds0, "stays blocked while held");
        }

        mgr.remove_hold(&arena);
        mgr.tick();
        assert_eq!(arena.status(), ArenaStatus::DoInit1);
    }

    #[test]
    fn add_hold_outside_window_is_rejected() {
        let root = ComponentBroker::new_root();
        let mgr = ArenaManager::new(root);
        let arena = mgr.get_or_create("turf");
        assert!(mgr.add_hold(&arena).is_err());
    }

    #[test]
    fn full_lifecycle_to_running_and_back_to_removed() {
        let root = ComponentBroker::new_root();
        let mgr = ArenaManager::new(root);
        let arena = mgr.get_or_create("turf");

        mgr.tick(); // DoInit0 -> WaitHolds0
        mgr.tick(); // WaitHolds0 -> DoInit1, emits RequestPersistLoad
        let events = mgr.tick();
        assert!(events.is_empty() || matches!(events[0], ArenaEvent::RequestPersistLoad(_)));
        mgr.notify_persist_loaded("turf");
        mgr.tick(); // DoInit2 -> WaitHolds1
        mgr.tick(); // WaitHolds1 -> Running
        assert_eq!(arena.status(), ArenaStatus::Running);

        *arena.status.lock() = ArenaStatus::DoWriteData;
        mgr.tick(); // DoWriteData -> WaitHolds2, emits RequestPersistSave
        mgr.notify_persist_saved("turf");
        mgr.tick(); // WaitHolds2 -> DoDestroy1
        mgr.tick(); // DoDestroy1 -> WaitHolds3
        mgr.tick(); // WaitHolds3 -> DoDestroy2
        let events = mgr.tick(); // DoDestroy2 -> removed
        assert!(events.iter().any(|e| matches!(e, ArenaEvent::Removed(n) if n == "turf")));
        assert!(mgr.find_arena("turf").is_none());
    }
}
