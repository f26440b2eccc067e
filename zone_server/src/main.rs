//! Zone server binary: wires the global component broker, arena manager,
//! player data store, persistence executor, and mainloop into a running
//! process (§2 SYSTEM OVERVIEW dependency order, leaves first).

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info};

use zone_core::{
    ArenaEvent, ArenaManager, Capabilities, CommandRegistry, ComponentBroker, ConfigChanged, ConfigManager, Datastore,
    ExitCode, FileConfigManager, Interval, Mainloop, PersistCompletion, PersistExecutor, PersistRequest, PlayerManager,
    RowKey, ScoreGroupOverrides, TimerAction,
};

/// In-process stand-in for the datastore backend. A real deployment swaps
/// this for a persistent backend (§1 Non-goals: "SQLite storage backend"
/// is an external collaborator, not part of this core); the core only
/// depends on the [`Datastore`] trait, so any backend plugs in here.
#[derive(Default)]
struct InMemoryStore {
    rows: parking_lot::RwLock<std::collections::HashMap<RowKey, Vec<u8>>>,
}

impl Datastore for InMemoryStore {
    fn get(&self, key: &RowKey) -> Option<Vec<u8>> {
        self.rows.read().get(key).cloned()
    }

    fn put(&self, key: &RowKey, bytes: Vec<u8>) {
        self.rows.write().insert(key.clone(), bytes);
    }

    fn delete(&self, key: &RowKey) {
        self.rows.write().remove(key);
    }

    fn rotate_interval(&self, group: &str, interval: Interval) -> u64 {
        self.rows
            .write()
            .retain(|k, _| !(k.arena_group == group && k.interval == interval));
        0
    }
}

fn init_logging(config: &dyn ConfigManager) {
    let level = config.get_str("server", "log_level", "info");
    let env = env_logger::Env::default().default_filter_or(level);
    env_logger::Builder::from_env(env).init();
}

fn config_path_from_args() -> PathBuf {
    std::env::args().nth(1).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("conf/zone.conf"))
}

fn main() {
    let config_path = config_path_from_args();
    let config = match FileConfigManager::load(&config_path, Some(PathBuf::from("conf/arenas"))) {
        Ok(c) => c,
        Err(e) => {
            // §7: a configuration error at load prevents module load and
            // surfaces at startup rather than crashing a running server —
            // there is no running server yet, so this is the terminal case.
            eprintln!("config error loading {}: {e}", config_path.display());
            std::process::exit(ExitCode::ConfigError as i32 + 1);
        }
    };
    let config = Arc::new(config);
    init_logging(&config);
    info!("zone_server starting, config={}", config_path.display());

    let global_broker = ComponentBroker::new_root();
    let arena_manager = Arc::new(ArenaManager::new(global_broker.clone()));
    let reconnect_window = Duration::from_secs(config.get_int("net", "reconnect_window_secs", 5) as u64);
    let player_manager = Arc::new(PlayerManager::new(reconnect_window));
    let capabilities = Arc::new(Capabilities::new());
    let score_groups = Arc::new(ScoreGroupOverrides::new());

    let mainloop = Arc::new(Mainloop::new());
    let store: Arc<dyn Datastore> = Arc::new(InMemoryStore::default());
    let persist = Arc::new(PersistExecutor::spawn(store, mainloop.work_queue.clone(), score_groups.clone()));

    // Built here so it owns the same `capabilities` handle the rest of the
    // server will share; nothing in this core's mainloop calls `dispatch`
    // directly since packet receipt and chat-line parsing are a network
    // layer concern out of scope for this binary (§1 Non-goals), but a
    // real deployment's packet-handling glue wires player chat lines
    // through this registry rather than building its own.
    let _command_registry = CommandRegistry::new(capabilities.clone());

    spawn_stdin_quit_listener(mainloop.clone());

    let arena_manager_tick = arena_manager.clone();
    let player_manager_tick = player_manager.clone();
    let persist_tick = persist.clone();
    let arena_manager_for_events = arena_manager.clone();

    let idle_sleep = Duration::from_millis(config.get_int("server", "mainloop_idle_ms", 10).max(1) as u64);

    // §6/§9.3: pick up config files edited externally and notify the rest
    // of the server via a broker event, on the same timer contract as any
    // other periodic mainloop work.
    let config_poll_interval =
        Duration::from_millis(config.get_int("server", "config_poll_ms", 5_000).max(1) as u64);
    let config_for_poll = config.clone();
    let broker_for_poll = global_broker.clone();
    mainloop.timers.set_timer(
        "config_poll",
        None,
        config_poll_interval,
        Some(config_poll_interval),
        Instant::now(),
        move || {
            for scope in config_for_poll.poll_for_changes() {
                info!("config: scope {scope} changed on disk");
                broker_for_poll.fire(&ConfigChanged { scope });
            }
            TimerAction::Continue
        },
        None,
    );

    loop {
        let now = Instant::now();
        let arena_manager_events = arena_manager_tick.clone();
        let persist_for_events = persist_tick.clone();
        let arena_manager_for_events = arena_manager_for_events.clone();

        let still_running = mainloop.run_iteration(
            now,
            move || {
                for event in arena_manager_events.tick() {
                    handle_arena_event(event, &persist_for_events, &arena_manager_for_events);
                }
            },
            || {
                // Player status-machine advancement is driven by the
                // network/auth layers posting work items; the mainloop
                // step itself only needs to run the population sweep so
                // each arena's counts stay current (§4.2 get_population).
                for arena in arena_manager_tick.find_running_arenas() {
                    arena_manager_tick.get_population(&arena, |name| player_manager_tick.sweep_population(name));
                }
            },
        );

        if !still_running {
            break;
        }
        std::thread::sleep(idle_sleep);
    }

    persist.shutdown();
    info!("zone_server exiting with code {:?}", mainloop.exit_code());
}

fn handle_arena_event(event: ArenaEvent, persist: &Arc<PersistExecutor>, arenas: &Arc<ArenaManager>) {
    match event {
        ArenaEvent::RequestPersistLoad(arena) => {
            let arenas = arenas.clone();
            let name = arena.name.clone();
            let handlers = Arc::new(Vec::new());
            if let Err(e) = persist.submit(
                PersistRequest::LoadArena {
                    arena_name: name.clone(),
                    arena_group: arena.base_name.clone(),
                    handlers,
                },
                move |completion| {
                    if let PersistCompletion::LoadArena { arena_name } = completion {
                        arenas.notify_persist_loaded(&arena_name);
                    }
                },
            ) {
                error!("arena={name}: failed to queue persist load: {e}");
                arenas.notify_persist_loaded(&name);
            }
        }
        ArenaEvent::RequestPersistSave(arena) => {
            let arenas = arenas.clone();
            let name = arena.name.clone();
            let handlers = Arc::new(Vec::new());
            if let Err(e) = persist.submit(
                PersistRequest::SaveArena {
                    arena_name: name.clone(),
                    arena_group: arena.base_name.clone(),
                    handlers,
                },
                move |completion| {
                    if let PersistCompletion::SaveArena { arena_name } = completion {
                        arenas.notify_persist_saved(&arena_name);
                    }
                },
            ) {
                error!("arena={name}: failed to queue persist save: {e}");
                arenas.notify_persist_saved(&name);
            }
        }
        ArenaEvent::Removed(name) => info!("arena={name}: removed"),
        ArenaEvent::Recreated(arena) => info!("arena={}: recreated after recycle", arena.name),
    }
}

/// Reads admin `quit`/`recycle` lines from stdin on a background thread
/// and posts the corresponding exit code, matching how real admin CLI
/// commands reach `Mainloop::quit` (§4.3) without this core depending on
/// any actual CLI/admin command implementation (§1 Non-goals).
fn spawn_stdin_quit_listener(mainloop: Arc<Mainloop>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines().map_while(Result::ok) {
            match line.trim() {
                "quit" => {
                    info!("stdin: quit requested");
                    mainloop.quit(ExitCode::Normal);
                    break;
                }
                "recycle" => {
                    info!("stdin: recycle requested");
                    mainloop.quit(ExitCode::Recycle);
                    break;
                }
                _ => {}
            }
        }
    });
}
