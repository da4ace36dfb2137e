//! Crash-recovery session journal.
//!
//! A single JSON record on disk. The journal treats the process as "unclean"
//! from session start until `mark_clean_shutdown`; a missing or corrupt file
//! reads as "no prior session".

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionState {
    pub version: u32,
    pub clean_shutdown: bool,
    pub was_bypass_active: bool,
    /// Unix seconds.
    pub updated_at_utc: u64,
    pub last_reason: String,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            version: 1,
            clean_shutdown: true,
            was_bypass_active: false,
            updated_at_utc: now_secs(),
            last_reason: "init".to_string(),
        }
    }
}

pub struct SessionJournal {
    path: PathBuf,
    write_lock: Mutex<()>,
    /// Captured once at construction: the previous run died with bypass active.
    startup_unclean_and_active: bool,
}

impl SessionJournal {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let startup_unclean_and_active = load(&path)
            .map(|s| s.was_bypass_active && !s.clean_shutdown)
            .unwrap_or(false);
        if startup_unclean_and_active {
            tracing::warn!("Session journal {} shows an unclean shutdown with bypass active", path.display());
        }
        Self {
            path,
            write_lock: Mutex::new(()),
            startup_unclean_and_active,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn startup_was_unclean_and_active(&self) -> bool {
        self.startup_unclean_and_active
    }

    /// Current on-disk record, if readable.
    pub fn read(&self) -> Option<SessionState> {
        load(&self.path)
    }

    pub fn mark_session_started(&self) {
        self.update(|s| {
            s.clean_shutdown = false;
            s.last_reason = "session_start".to_string();
        });
    }

    /// While the process runs the shutdown always counts as unclean.
    pub fn set_bypass_active(&self, active: bool, reason: &str) {
        self.update(|s| {
            s.was_bypass_active = active;
            s.clean_shutdown = false;
            s.last_reason = reason.to_string();
        });
    }

    pub fn touch_heartbeat(&self, reason: &str) {
        self.update(|s| s.last_reason = reason.to_string());
    }

    pub fn mark_clean_shutdown(&self, reason: &str) {
        self.update(|s| {
            s.clean_shutdown = true;
            s.last_reason = reason.to_string();
        });
    }

    fn update(&self, mutate: impl FnOnce(&mut SessionState)) {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut state = load(&self.path).unwrap_or_default();
        mutate(&mut state);
        state.updated_at_utc = now_secs();
        if let Err(e) = save(&self.path, &state) {
            tracing::warn!("Failed to write session journal {}: {e}", self.path.display());
        }
    }
}

fn load(path: &Path) -> Option<SessionState> {
    let raw = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(state) => Some(state),
        Err(e) => {
            tracing::warn!("Ignoring corrupt session journal {}: {e}", path.display());
            None
        }
    }
}

/// Write through a sibling temp file so a crash never leaves a torn record.
fn save(path: &Path, state: &SessionState) -> std::io::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    let json = serde_json::to_string_pretty(state).map_err(std::io::Error::other)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
