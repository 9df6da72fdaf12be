//! Shared SQLite connection tuning

use rusqlite::Connection;
use std::time::Duration;

/// Apply the PRAGMAs every PostFlow connection runs with.
///
/// - WAL journal so readers never block the single writer
/// - NORMAL sync (safe with WAL, far fewer fsyncs)
/// - foreign keys on (comment threads reference their parent)
/// - busy timeout so a concurrent writer waits instead of failing instantly
pub fn apply_optimized_pragmas(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pragmas_applied() {
        let temp_dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(temp_dir.path().join("pragma.db")).unwrap();

        apply_optimized_pragmas(&conn).unwrap();

        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");

        let fk: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);
    }
}
