use rusqlite::Connection;

use crate::error::StoreResult;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `tasks`, `leases` and `bootstrap` tables (idempotent). Time
/// slices are stored as epoch milliseconds, durations as whole minutes.
pub fn init_db(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS tasks (
            task_type   TEXT    NOT NULL,
            time_slice  INTEGER NOT NULL,   -- epoch millis
            segment     INTEGER NOT NULL,
            target      TEXT    NOT NULL,
            sources     TEXT    NOT NULL,   -- JSON array of strings
            interval_minutes INTEGER NOT NULL,  -- 0 = fire once
            window_minutes   INTEGER NOT NULL,
            PRIMARY KEY (task_type, time_slice, segment, target)
        ) STRICT;

        CREATE TABLE IF NOT EXISTS leases (
            time_slice      INTEGER NOT NULL,
            task_type       TEXT    NOT NULL,
            segment_offset  INTEGER NOT NULL,
            owner           TEXT,               -- NULL until acquired
            finished        INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (time_slice, task_type, segment_offset)
        ) STRICT;

        -- one row per one-time setup step already done by some node
        CREATE TABLE IF NOT EXISTS bootstrap (
            key         TEXT    PRIMARY KEY,
            claimed_at  INTEGER NOT NULL    -- epoch millis
        ) STRICT;
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('tasks', 'leases', 'bootstrap')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 3);
    }
}
