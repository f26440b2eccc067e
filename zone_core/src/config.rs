//! Configuration model, §6 / §9.3. A bespoke line-oriented
//! `section:key=value` parser — there is no crates.io crate that speaks
//! this exact dialect, so it is hand-rolled rather than forcing a
//! mismatched generic TOML/INI crate (see SPEC_FULL.md §9.3).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::SystemTime;

use chrono::Local;
use log::info;
use parking_lot::RwLock;

use crate::error::ConfigError;

/// One parsed `[section]` block's `key=value` pairs.
type Section = HashMap<String, String>;

/// Parses the `#`/`;`-comment, `[section]`-header, `key=value` dialect
/// from §6. Unknown/malformed lines outside a `[section]` header are
/// rejected with a `ConfigError::Parse` naming the offending line.
fn parse(text: &str, file: &str) -> Result<HashMap<String, Section>, ConfigError> {
    let mut sections: HashMap<String, Section> = HashMap::new();
    let mut current = String::from("general");

    for (lineno, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(stripped) = line.strip_prefix('[') {
            let name = stripped.strip_suffix(']').ok_or_else(|| ConfigError::Parse {
                file: file.to_string(),
                line: lineno + 1,
                message: "unterminated section header".to_string(),
            })?;
            current = name.trim().to_lowercase();
            sections.entry(current.clone()).or_default();
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| ConfigError::Parse {
            file: file.to_string(),
            line: lineno + 1,
            message: "expected key=value".to_string(),
        })?;
        sections
            .entry(current.clone())
            .or_default()
            .insert(key.trim().to_lowercase(), value.trim().to_string());
    }
    Ok(sections)
}

/// Settings consumer contract (§6): integers, strings, and enums with
/// defaults.
pub trait ConfigManager: Send + Sync {
    fn get_int(&self, section: &str, key: &str, default: i64) -> i64;
    fn get_str(&self, section: &str, key: &str, default: &str) -> String;
    /// `where Self: Sized` keeps this trait object-safe (`&dyn
    /// ConfigManager` is used at the `zone_server` call sites that only
    /// need `get_int`/`get_str`) while still letting concrete callers pull
    /// a typed enum out of config.
    fn get_enum<T: FromStr>(&self, section: &str, key: &str, default: T) -> T
    where
        Self: Sized;
}

struct Loaded {
    global: HashMap<String, Section>,
    arena_overrides: HashMap<String, HashMap<String, Section>>,
    global_mtime: Option<SystemTime>,
    arena_mtimes: HashMap<String, Option<SystemTime>>,
}

/// Merges a global config file with optional per-arena override files
/// (per-arena keys win). Tracks mtimes so `poll_for_changes` can detect
/// external edits (§6 "Change notifications fire when files are edited
/// externally").
pub struct FileConfigManager {
    global_path: PathBuf,
    arena_dir: Option<PathBuf>,
    active_arena: RwLock<Option<String>>,
    state: RwLock<Loaded>,
}

fn mtime_of(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

impl FileConfigManager {
    pub fn load(global_path: impl Into<PathBuf>, arena_dir: Option<PathBuf>) -> Result<Self, ConfigError> {
        let global_path = global_path.into();
        let global_text = fs::read_to_string(&global_path).map_err(|source| ConfigError::Io {
            path: global_path.display().to_string(),
            source,
        })?;
        let global = parse(&global_text, &global_path.display().to_string())?;
        let global_mtime = mtime_of(&global_path);

        Ok(Self {
            global_path,
            arena_dir,
            active_arena: RwLock::new(None),
            state: RwLock::new(Loaded {
                global,
                arena_overrides: HashMap::new(),
                global_mtime,
                arena_mtimes: HashMap::new(),
            }),
        })
    }

    /// Loads (or reuses the cached) override file for `arena_base_name` and
    /// makes it the active per-arena scope for subsequent `get_*` calls.
    pub fn activate_arena(&self, arena_base_name: &str) -> Result<(), ConfigError> {
        if let Some(dir) = &self.arena_dir {
            let path = dir.join(format!("{arena_base_name}.conf"));
            if path.exists() {
                let text = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                let parsed = parse(&text, &path.display().to_string())?;
                let mtime = mtime_of(&path);
                let mut state = self.state.write();
                state.arena_overrides.insert(arena_base_name.to_string(), parsed);
                state.arena_mtimes.insert(arena_base_name.to_string(), mtime);
            }
        }
        *self.active_arena.write() = Some(arena_base_name.to_string());
        Ok(())
    }

    fn lookup(&self, section: &str, key: &str) -> Option<String> {
        let section = section.to_lowercase();
        let key = key.to_lowercase();
        let state = self.state.read();
        if let Some(arena) = self.active_arena.read().as_ref() {
            if let Some(overrides) = state.arena_overrides.get(arena) {
                if let Some(v) = overrides.get(&section).and_then(|s| s.get(&key)) {
                    return Some(v.clone());
                }
            }
        }
        state.global.get(&section).and_then(|s| s.get(&key)).cloned()
    }

    /// Re-stats tracked files; returns the set of scopes (`"global"` or an
    /// arena base name) whose mtime advanced since the last poll, and
    /// reloads them. Intended to be called from a mainloop timer (§9.3).
    pub fn poll_for_changes(&self) -> Vec<String> {
        let mut changed = Vec::new();
        let mut state = self.state.write();

        let global_mtime = mtime_of(&self.global_path);
        if global_mtime != state.global_mtime {
            if let Ok(text) = fs::read_to_string(&self.global_path) {
                if let Ok(parsed) = parse(&text, &self.global_path.display().to_string()) {
                    state.global = parsed;
                    state.global_mtime = global_mtime;
                    info!(
                        "config: reloaded global {} at {}",
                        self.global_path.display(),
                        Local::now().format("%Y-%m-%d %H:%M:%S")
                    );
                    changed.push("global".to_string());
                }
            }
        }

        if let Some(dir) = &self.arena_dir {
            let arenas: Vec<String> = state.arena_overrides.keys().cloned().collect();
            for arena in arenas {
                let path = dir.join(format!("{arena}.conf"));
                let mtime = mtime_of(&path);
                if mtime != state.arena_mtimes.get(&arena).copied().flatten() {
                    if let Ok(text) = fs::read_to_string(&path) {
                        if let Ok(parsed) = parse(&text, &path.display().to_string()) {
                            state.arena_overrides.insert(arena.clone(), parsed);
                            state.arena_mtimes.insert(arena.clone(), mtime);
                            info!(
                                "config: reloaded arena override {} at {}",
                                path.display(),
                                Local::now().format("%Y-%m-%d %H:%M:%S")
                            );
                            changed.push(arena);
                        }
                    }
                }
            }
        }
        changed
    }
}

impl ConfigManager for FileConfigManager {
    fn get_int(&self, section: &str, key: &str, default: i64) -> i64 {
        self.lookup(section, key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn get_str(&self, section: &str, key: &str, default: &str) -> String {
        self.lookup(section, key).unwrap_or_else(|| default.to_string())
    }

    fn get_enum<T: FromStr>(&self, section: &str, key: &str, default: T) -> T {
        self.lookup(section, key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }
}

/// Fired on the broker when [`FileConfigManager::poll_for_changes`] finds a
/// changed scope (§6).
pub struct ConfigChanged {
    pub scope: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(name: &str, contents: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("zone_core_config_test_{name}_{:?}", std::thread::current().id()));
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn parses_sections_and_arena_override_wins() {
        let global = write_temp("global", "[net]\ndroptimeout=3000\n; comment\n[chat]\nfloodlimit=10\n");
        let dir = std::env::temp_dir();
        let mgr = FileConfigManager::load(&global, Some(dir.clone())).unwrap();
        assert_eq!(mgr.get_int("net", "droptimeout", 0), 3000);
        assert_eq!(mgr.get_int("chat", "floodlimit", 0), 10);

        let arena_conf = dir.join("turf.conf");
        fs::write(&arena_conf, "[net]\ndroptimeout=9000\n").unwrap();
        mgr.activate_arena("turf").unwrap();
        assert_eq!(mgr.get_int("net", "droptimeout", 0), 9000);
        assert_eq!(mgr.get_int("chat", "floodlimit", 0), 10, "non-overridden key falls back to global");

        fs::remove_file(global).ok();
        fs::remove_file(arena_conf).ok();
    }

    #[test]
    fn missing_key_uses_default() {
        let global = write_temp("defaults", "[net]\n");
        let mgr = FileConfigManager::load(&global, None).unwrap();
        assert_eq!(mgr.get_str("net", "bindaddress", "0.0.0.0"), "0.0.0.0");
        fs::remove_file(global).ok();
    }

    #[test]
    fn malformed_line_is_a_parse_error() {
        let err = parse("not a valid line", "test").unwrap_err();
        matches!(err, ConfigError::Parse { .. });
    }
}
