//! File-level backup/restore for the embedded stores, using
//! SQLite's own online backup API so a snapshot never blocks a concurrent
//! writer on the source connection.

use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::backup::Backup;
use rusqlite::Connection;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store file `{0}` does not exist")]
    MissingSource(PathBuf),
}

type Result<T> = std::result::Result<T, BackupError>;

/// Snapshots `source` (a store's SQLite file) into `backup_dir` with a
/// timestamped filename, via the engine's online backup API so the
/// source connection's writers are never blocked by the copy.
pub fn snapshot(source: impl AsRef<Path>, backup_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let source = source.as_ref();
    if !source.exists() {
        return Err(BackupError::MissingSource(source.to_path_buf()));
    }
    std::fs::create_dir_all(backup_dir.as_ref())?;

    let stem = source.file_stem().and_then(|s| s.to_str()).unwrap_or("store");
    let timestamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let dest = backup_dir.as_ref().join(format!("{stem}-{timestamp}.db"));

    let src_conn = Connection::open(source)?;
    let mut dst_conn = Connection::open(&dest)?;
    {
        let backup = Backup::new(&src_conn, &mut dst_conn)?;
        backup.run_to_completion(100, std::time::Duration::from_millis(10), None)?;
    }
    drop(dst_conn);
    drop(src_conn);
    Ok(dest)
}

/// Finds the most recent backup for `stem` (a store's file stem, e.g.
/// `plans`) under `backup_dir` by lexicographic filename order — safe
/// because the `YYYYMMDDTHHMMSSZ` suffix sorts chronologically. Used when
/// a restore is requested without an explicit backup path.
pub fn latest_backup(backup_dir: impl AsRef<Path>, stem: &str) -> Result<Option<PathBuf>> {
    let prefix = format!("{stem}-");
    let mut candidates: Vec<PathBuf> = match std::fs::read_dir(backup_dir.as_ref()) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .map(|name| name.starts_with(&prefix) && name.ends_with(".db"))
                    .unwrap_or(false)
            })
            .collect(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(err) => return Err(err.into()),
    };
    candidates.sort();
    Ok(candidates.pop())
}

/// Restores `store_path` from `backup_path`, first archiving the current
/// file under `<store_dir>/pre-restore/<timestamp>/<filename>` so a bad
/// restore can still be undone.
pub fn restore(store_path: impl AsRef<Path>, backup_path: impl AsRef<Path>) -> Result<Option<PathBuf>> {
    let store_path = store_path.as_ref();
    let backup_path = backup_path.as_ref();

    let archived = if store_path.exists() {
        let timestamp = Utc::now().format("%Y%m%dT%H%M%SZ");
        let archive_dir = store_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("pre-restore")
            .join(timestamp.to_string());
        std::fs::create_dir_all(&archive_dir)?;
        let file_name = store_path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("store.db"));
        let archive_path = archive_dir.join(file_name);
        std::fs::rename(store_path, &archive_path)?;
        Some(archive_path)
    } else {
        None
    };

    std::fs::copy(backup_path, store_path)?;
    Ok(archived)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_store(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        let conn = Connection::open(&path).unwrap();
        conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)", []).unwrap();
        conn.execute("INSERT INTO t (v) VALUES ('hello')", []).unwrap();
        path
    }

    #[test]
    fn snapshot_copies_data_into_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path(), "audit.db");
        let backup_dir = dir.path().join("backups");

        let snapshot_path = snapshot(&store, &backup_dir).unwrap();
        let conn = Connection::open(&snapshot_path).unwrap();
        let value: String = conn.query_row("SELECT v FROM t WHERE id = 1", [], |row| row.get(0)).unwrap();
        assert_eq!(value, "hello");
    }

    #[test]
    fn snapshot_of_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.db");
        let err = snapshot(&missing, dir.path().join("backups")).unwrap_err();
        assert!(matches!(err, BackupError::MissingSource(_)));
    }

    #[test]
    fn restore_archives_existing_file_before_replacing() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path(), "audit.db");
        let backup_dir = dir.path().join("backups");
        let snapshot_path = snapshot(&store, &backup_dir).unwrap();

        // Mutate the live store so restore has something to overwrite.
        {
            let conn = Connection::open(&store).unwrap();
            conn.execute("INSERT INTO t (v) VALUES ('second')", []).unwrap();
        }

        let archived = restore(&store, &snapshot_path).unwrap();
        assert!(archived.is_some());
        assert!(archived.unwrap().exists());

        let conn = Connection::open(&store).unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0)).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn restore_archives_under_pre_restore_timestamp_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path(), "audit.db");
        let backup_dir = dir.path().join("backups");
        let snapshot_path = snapshot(&store, &backup_dir).unwrap();

        let archived = restore(&store, &snapshot_path).unwrap().unwrap();
        assert!(archived.starts_with(dir.path().join("pre-restore")));
        assert_eq!(archived.file_name().unwrap().to_str().unwrap(), "audit.db");
    }

    #[test]
    fn latest_backup_picks_the_newest_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let backup_dir = dir.path().join("backups");
        std::fs::create_dir_all(&backup_dir).unwrap();
        for suffix in ["20250101T000000Z", "20260229T235959Z", "20260101T010101Z"] {
            std::fs::write(backup_dir.join(format!("plans-{suffix}.db")), b"x").unwrap();
        }
        let found = latest_backup(&backup_dir, "plans").unwrap().unwrap();
        assert_eq!(found.file_name().unwrap().to_str().unwrap(), "plans-20260229T235959Z.db");
    }

    #[test]
    fn latest_backup_returns_none_when_directory_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let found = latest_backup(dir.path().join("no-such-dir"), "plans").unwrap();
        assert!(found.is_none());
    }
}
