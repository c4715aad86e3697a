//! Shared SQLite connection setup for every store in this crate: WAL
//! journal mode, NORMAL synchronous, and a busy-timeout so concurrent
//! readers and writers back off instead of failing outright.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (creating parent directories as needed) a single-file SQLite
/// database with WAL journaling, `synchronous=NORMAL`, and a busy-timeout
/// so concurrent writers from other threads retry instead of erroring.
pub fn open(path: impl AsRef<Path>) -> rusqlite::Result<Connection> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let conn = Connection::open(path)?;
    conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
    conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
    conn.execute("PRAGMA synchronous = NORMAL", [])?;
    Ok(conn)
}

pub fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".novaadapt")
}

pub fn is_retryable_sqlite_error(err: &rusqlite::Error) -> bool {
    let message = err.to_string().to_lowercase();
    [
        "database is locked",
        "database is busy",
        "disk i/o error",
        "database schema is locked",
        "unable to open database file",
    ]
    .iter()
    .any(|fragment| message.contains(fragment))
}
