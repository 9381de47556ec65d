use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use uuid::Uuid;

use super::StateStore;
use super::types::{
    RunRecord, ScheduleMode, parse_id, parse_id_opt, parse_json_opt, parse_ts, parse_ts_opt, ts,
};
use crate::core::gate::PermissionMode;
use crate::core::run::RunState;

fn row_to_run(row: &Row) -> rusqlite::Result<RunRecord> {
    let id: String = row.get("id")?;
    let session_id: String = row.get("session_id")?;
    let status: String = row.get("status")?;
    let schedule_mode: String = row.get("schedule_mode")?;
    let permission_mode: String = row.get("permission_mode")?;
    let scheduled_at: Option<String> = row.get("scheduled_at")?;
    let config_snapshot: Option<String> = row.get("config_snapshot")?;
    let user_message_id: Option<String> = row.get("user_message_id")?;
    let scheduled_task_id: Option<String> = row.get("scheduled_task_id")?;
    let created_at: String = row.get("created_at")?;
    let started_at: Option<String> = row.get("started_at")?;
    let finished_at: Option<String> = row.get("finished_at")?;
    Ok(RunRecord {
        id: parse_id(&id)?,
        session_id: parse_id(&session_id)?,
        status: RunState::from_status(&status).unwrap_or(RunState::Failed),
        schedule_mode: ScheduleMode::parse(&schedule_mode).unwrap_or(ScheduleMode::Immediate),
        scheduled_at: parse_ts_opt(scheduled_at)?,
        permission_mode: PermissionMode::parse(&permission_mode),
        config_snapshot: parse_json_opt(config_snapshot)?,
        user_message_id: parse_id_opt(user_message_id)?,
        scheduled_task_id: parse_id_opt(scheduled_task_id)?,
        progress: row.get("progress")?,
        error: row.get("error")?,
        created_at: parse_ts(&created_at)?,
        started_at: parse_ts_opt(started_at)?,
        finished_at: parse_ts_opt(finished_at)?,
    })
}

pub struct NewRun {
    pub session_id: Uuid,
    pub schedule_mode: ScheduleMode,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub permission_mode: PermissionMode,
    pub config_snapshot: Option<serde_json::Value>,
    pub user_message_id: Option<Uuid>,
    pub scheduled_task_id: Option<Uuid>,
}

impl StateStore {
    pub async fn insert_run(&self, new_run: NewRun) -> Result<RunRecord> {
        let now = Utc::now();
        let record = RunRecord {
            id: Uuid::new_v4(),
            session_id: new_run.session_id,
            status: RunState::Queued,
            schedule_mode: new_run.schedule_mode,
            scheduled_at: new_run.scheduled_at,
            permission_mode: new_run.permission_mode,
            config_snapshot: new_run.config_snapshot,
            user_message_id: new_run.user_message_id,
            scheduled_task_id: new_run.scheduled_task_id,
            progress: 0,
            error: None,
            created_at: now,
            started_at: None,
            finished_at: None,
        };

        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO agent_runs
                (id, session_id, status, schedule_mode, scheduled_at, permission_mode,
                 config_snapshot, user_message_id, scheduled_task_id, progress, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.id.to_string(),
                record.session_id.to_string(),
                record.status.as_str(),
                record.schedule_mode.as_str(),
                record.scheduled_at.as_ref().map(ts),
                record.permission_mode.as_str(),
                record.config_snapshot.as_ref().map(|v| v.to_string()),
                record.user_message_id.map(|id| id.to_string()),
                record.scheduled_task_id.map(|id| id.to_string()),
                record.progress,
                ts(&record.created_at),
            ],
        )?;
        Ok(record)
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<Option<RunRecord>> {
        let db = self.db.lock().await;
        let record = db
            .query_row(
                "SELECT * FROM agent_runs WHERE id = ?1",
                params![run_id.to_string()],
                row_to_run,
            )
            .optional()?;
        Ok(record)
    }

    /// Compare-and-set status transition. Returns false when the run was not
    /// in `from` anymore, which callers treat as a lost claim race.
    pub async fn transition_run(&self, run_id: Uuid, from: RunState, to: RunState) -> Result<bool> {
        let now = Utc::now();
        let db = self.db.lock().await;
        let changed = if to == RunState::Running {
            db.execute(
                "UPDATE agent_runs SET status = ?3, started_at = ?4
                 WHERE id = ?1 AND status = ?2",
                params![run_id.to_string(), from.as_str(), to.as_str(), ts(&now)],
            )?
        } else {
            db.execute(
                "UPDATE agent_runs SET status = ?3 WHERE id = ?1 AND status = ?2",
                params![run_id.to_string(), from.as_str(), to.as_str()],
            )?
        };
        Ok(changed > 0)
    }

    pub async fn update_run_progress(&self, run_id: Uuid, progress: i64) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE agent_runs SET progress = ?2 WHERE id = ?1",
            params![run_id.to_string(), progress],
        )?;
        Ok(())
    }

    pub async fn finish_run(
        &self,
        run_id: Uuid,
        status: RunState,
        progress: i64,
        error: Option<&str>,
    ) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE agent_runs SET status = ?2, progress = ?3, error = ?4, finished_at = ?5
             WHERE id = ?1",
            params![
                run_id.to_string(),
                status.as_str(),
                progress,
                error,
                ts(&Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Runs for the session still in a non-terminal status, newest first.
    pub async fn active_runs(&self, session_id: Uuid) -> Result<Vec<RunRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT * FROM agent_runs
             WHERE session_id = ?1 AND status IN ('queued', 'claimed', 'running')
             ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![session_id.to_string()], row_to_run)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}
