use crate::core::broker::DbBroker;
use crate::core::error;
use crate::core::schemas;
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};

pub fn db_connect(db_path: &str) -> Result<Connection, error::RosterError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(error::RosterError::RusqliteError)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
        .map_err(error::RosterError::RusqliteError)?;
    conn.execute("PRAGMA foreign_keys=ON;", [])
        .map_err(error::RosterError::RusqliteError)?;
    Ok(conn)
}

pub fn roster_db_path(root: &Path) -> PathBuf {
    root.join(schemas::ROSTER_DB_NAME)
}

/// Create the store directory and both roster tables if they are missing.
pub fn initialize_roster_db(root: &Path) -> Result<(), error::RosterError> {
    fs::create_dir_all(root).map_err(error::RosterError::IoError)?;
    let db_path = roster_db_path(root);

    let broker = DbBroker::new(root);
    broker.with_conn(&db_path, "rostersync", "roster.init", |conn| {
        for stmt in schemas::ROSTER_DB_SCHEMA {
            conn.execute(stmt, []).map_err(|e| {
                error::RosterError::DatabaseInitializationError(format!("{}: {}", stmt.trim(), e))
            })?;
        }
        Ok(())
    })?;

    tracing::debug!(path = %db_path.display(), "roster database ready");
    Ok(())
}
