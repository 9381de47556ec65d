pub mod requests;
pub mod runs;
pub mod sessions;
pub mod tasks;
pub mod types;

use anyhow::Result;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::info;

use crate::platform::{NativePlatform, Platform};

/// SQLite-backed store for sessions, messages, runs, scheduled tasks, and
/// permission requests. All components share one connection behind a mutex;
/// the run/session rows are the only cross-task synchronization point.
pub struct StateStore {
    db: Arc<Mutex<Connection>>,
}

impl StateStore {
    pub async fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        if !data_dir.exists() {
            fs::create_dir_all(data_dir).await?;
        }
        NativePlatform::restrict_dir_permissions(data_dir);

        let db_path = data_dir.join("drydock.db");
        let db = Connection::open(&db_path)?;
        NativePlatform::restrict_file_permissions(&db_path);

        db.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                status TEXT NOT NULL,
                kind TEXT NOT NULL,
                config TEXT NOT NULL DEFAULT '{}',
                state_patch TEXT NOT NULL DEFAULT '{}',
                container_mode TEXT NOT NULL DEFAULT 'ephemeral',
                container_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                text_preview TEXT,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS agent_runs (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                status TEXT NOT NULL,
                schedule_mode TEXT NOT NULL,
                scheduled_at TEXT,
                permission_mode TEXT NOT NULL DEFAULT 'default',
                config_snapshot TEXT,
                user_message_id TEXT,
                scheduled_task_id TEXT,
                progress INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS scheduled_tasks (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                cron TEXT NOT NULL,
                timezone TEXT NOT NULL DEFAULT 'UTC',
                prompt TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                reuse_session INTEGER NOT NULL DEFAULT 0,
                session_id TEXT,
                config_snapshot TEXT NOT NULL DEFAULT '{}',
                input_files TEXT,
                next_fire_at TEXT NOT NULL,
                claimed_at TEXT,
                last_run_id TEXT,
                last_run_status TEXT,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                deleted_at TEXT
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS permission_requests (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                run_id TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                tool_input TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                answers TEXT,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                answered_at TEXT
            )",
            [],
        )?;

        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_runs_session_status
             ON agent_runs (session_id, status)",
            [],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_due
             ON scheduled_tasks (enabled, next_fire_at)",
            [],
        )?;

        info!("State store ready at {:?}", db_path);

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }
}
