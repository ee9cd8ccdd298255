use rusqlite::Connection;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{ChatError, ChatResult};

/// Local SQLite database holding the persisted identity key pair
pub struct Database(pub Mutex<Connection>);

impl Database {
    /// Open (or create) the database file and ensure the schema exists
    pub fn open(path: &Path) -> ChatResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                ChatError::StorageUnavailable(format!("Failed to create data directory: {}", e))
            })?;
        }

        let conn = Connection::open(path)?;
        // Several processes may race on first key generation
        conn.busy_timeout(Duration::from_secs(5))?;
        init_schema(&conn)?;
        Ok(Self(Mutex::new(conn)))
    }

    pub fn open_in_memory() -> ChatResult<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self(Mutex::new(conn)))
    }
}

fn init_schema(conn: &Connection) -> ChatResult<()> {
    conn.execute_batch(
        "
        -- Identity key pair per local user, written once on first generation
        CREATE TABLE IF NOT EXISTS identity_keys (
            user_id TEXT PRIMARY KEY,
            public_jwk TEXT NOT NULL,
            private_jwk TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );
        ",
    )?;
    Ok(())
}
