//! Database schema and migrations

use rusqlite::Connection;

use crate::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Initialize the database schema
///
/// # Errors
///
/// Returns error if migration fails
pub fn init(conn: &Connection) -> Result<()> {
    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .unwrap_or(0);

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Devices table (fleet roster)
        CREATE TABLE IF NOT EXISTS devices (
            id TEXT PRIMARY KEY,
            uuid TEXT NOT NULL UNIQUE,
            name TEXT,
            status TEXT NOT NULL DEFAULT 'OFFLINE'
                CHECK(status IN ('ONLINE', 'OFFLINE', 'BUSY', 'ERROR')),
            last_heartbeat TEXT,
            metadata TEXT NOT NULL DEFAULT '{}',
            group_id TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_devices_status ON devices(status);
        CREATE INDEX IF NOT EXISTS idx_devices_group ON devices(group_id);

        -- Commands table
        CREATE TABLE IF NOT EXISTS commands (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL CHECK(kind IN ('SINGLE', 'BROADCAST', 'SCHEDULED')),
            target_type TEXT NOT NULL DEFAULT 'DEVICE'
                CHECK(target_type IN ('DEVICE', 'GROUP', 'ALL')),
            target_device_id TEXT REFERENCES devices(id),
            target_group_id TEXT,
            command_name TEXT NOT NULL,
            params TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'QUEUED'
                CHECK(status IN ('PENDING', 'QUEUED', 'PROCESSING',
                                 'COMPLETED', 'FAILED', 'CANCELLED')),
            result TEXT,
            error TEXT,
            scheduled_at TEXT,
            executed_at TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            created_by TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_commands_status ON commands(status);
        CREATE INDEX IF NOT EXISTS idx_commands_device ON commands(target_device_id);

        PRAGMA user_version = 1;
        ",
    )?;

    tracing::info!("migrated to schema v1 (devices, commands)");
    Ok(())
}

fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Dispatch queue jobs: one row per queued delivery attempt chain
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            queue TEXT NOT NULL CHECK(queue IN ('commands', 'scheduled')),
            command_id TEXT NOT NULL REFERENCES commands(id),
            state TEXT NOT NULL DEFAULT 'waiting'
                CHECK(state IN ('waiting', 'active', 'done', 'dead')),
            run_at TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(queue, state, run_at);
        CREATE INDEX IF NOT EXISTS idx_jobs_command ON jobs(command_id);

        PRAGMA user_version = 2;
        ",
    )?;

    tracing::info!("migrated to schema v2 (dispatch jobs)");
    Ok(())
}
