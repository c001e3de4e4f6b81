//! On-disk record of the locally running session, so `status`/`stop` can
//! find it without an IPC channel — the same role `session.toml` plays for
//! `freeq-tui`, just refreshed continuously by the running process instead
//! of only on exit.

use std::path::PathBuf;
use std::time::Duration;

use meshline_core::session::{SessionHandle, SessionState, StatusSnapshot};
use serde::{Deserialize, Serialize};

const REFRESH_INTERVAL: Duration = Duration::from_secs(5);

fn runtime_dir() -> PathBuf {
    dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join("meshline")
}

fn runtime_path() -> PathBuf {
    runtime_dir().join("runtime.json")
}

/// What gets written to `runtime.json` on every refresh tick.
#[derive(Debug, Serialize, Deserialize)]
pub struct RuntimeRecord {
    pub pid: u32,
    pub state: String,
    pub is_connected: bool,
    pub peer_id: Option<String>,
    pub connected_peers: usize,
    pub discovered_peers: usize,
    pub last_error: Option<String>,
}

impl From<StatusSnapshot> for RuntimeRecord {
    fn from(snapshot: StatusSnapshot) -> Self {
        Self {
            pid: std::process::id(),
            state: format!("{:?}", snapshot.state),
            is_connected: snapshot.is_connected,
            peer_id: snapshot.peer_id,
            connected_peers: snapshot.connected_peers,
            discovered_peers: snapshot.discovered_peers,
            last_error: snapshot.last_error,
        }
    }
}

pub fn write(record: &RuntimeRecord) {
    let path = runtime_path();
    if let Some(dir) = path.parent() {
        let _ = std::fs::create_dir_all(dir);
    }
    if let Ok(json) = serde_json::to_string_pretty(record) {
        let _ = std::fs::write(path, json);
    }
}

pub fn read() -> Option<RuntimeRecord> {
    let bytes = std::fs::read(runtime_path()).ok()?;
    serde_json::from_slice(&bytes).ok()
}

pub fn clear() {
    let _ = std::fs::remove_file(runtime_path());
}

/// Refresh `runtime.json` on a fixed interval until the session stops.
/// Spawned alongside the session so `status` always sees a recent snapshot.
pub async fn run_refresh_loop(handle: SessionHandle) {
    let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
    loop {
        ticker.tick().await;
        let snapshot = handle.status();
        let closed = snapshot.state == SessionState::Closed;
        write(&RuntimeRecord::from(snapshot));
        if closed {
            return;
        }
    }
}
