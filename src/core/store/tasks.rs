use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{OptionalExtension, Row, params};
use serde_json::Value;
use uuid::Uuid;

use super::StateStore;
use super::types::{
    ScheduledTaskRecord, parse_id, parse_id_opt, parse_json, parse_json_opt, parse_ts, ts,
};

fn row_to_task(row: &Row) -> rusqlite::Result<ScheduledTaskRecord> {
    let id: String = row.get("id")?;
    let session_id: Option<String> = row.get("session_id")?;
    let config_snapshot: String = row.get("config_snapshot")?;
    let input_files: Option<String> = row.get("input_files")?;
    let next_fire_at: String = row.get("next_fire_at")?;
    let last_run_id: Option<String> = row.get("last_run_id")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    Ok(ScheduledTaskRecord {
        id: parse_id(&id)?,
        owner_id: row.get("owner_id")?,
        name: row.get("name")?,
        cron: row.get("cron")?,
        timezone: row.get("timezone")?,
        prompt: row.get("prompt")?,
        enabled: row.get("enabled")?,
        reuse_session: row.get("reuse_session")?,
        session_id: parse_id_opt(session_id)?,
        config_snapshot: parse_json(&config_snapshot)?,
        input_files: parse_json_opt(input_files)?,
        next_fire_at: parse_ts(&next_fire_at)?,
        last_run_id: parse_id_opt(last_run_id)?,
        last_run_status: row.get("last_run_status")?,
        last_error: row.get("last_error")?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

pub struct NewScheduledTask {
    pub owner_id: String,
    pub name: String,
    pub cron: String,
    pub timezone: String,
    pub prompt: String,
    pub enabled: bool,
    pub reuse_session: bool,
    pub session_id: Option<Uuid>,
    pub config_snapshot: Value,
    pub input_files: Option<Value>,
    pub next_fire_at: DateTime<Utc>,
}

impl StateStore {
    pub async fn insert_scheduled_task(
        &self,
        new_task: NewScheduledTask,
    ) -> Result<ScheduledTaskRecord> {
        let now = Utc::now();
        let record = ScheduledTaskRecord {
            id: Uuid::new_v4(),
            owner_id: new_task.owner_id,
            name: new_task.name,
            cron: new_task.cron,
            timezone: new_task.timezone,
            prompt: new_task.prompt,
            enabled: new_task.enabled,
            reuse_session: new_task.reuse_session,
            session_id: new_task.session_id,
            config_snapshot: new_task.config_snapshot,
            input_files: new_task.input_files,
            next_fire_at: new_task.next_fire_at,
            last_run_id: None,
            last_run_status: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };

        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO scheduled_tasks
                (id, owner_id, name, cron, timezone, prompt, enabled, reuse_session,
                 session_id, config_snapshot, input_files, next_fire_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                record.id.to_string(),
                record.owner_id,
                record.name,
                record.cron,
                record.timezone,
                record.prompt,
                record.enabled,
                record.reuse_session,
                record.session_id.map(|id| id.to_string()),
                record.config_snapshot.to_string(),
                record.input_files.as_ref().map(|v| v.to_string()),
                ts(&record.next_fire_at),
                ts(&record.created_at),
                ts(&record.updated_at),
            ],
        )?;
        Ok(record)
    }

    pub async fn get_scheduled_task(&self, task_id: Uuid) -> Result<Option<ScheduledTaskRecord>> {
        let db = self.db.lock().await;
        let record = db
            .query_row(
                "SELECT * FROM scheduled_tasks WHERE id = ?1 AND deleted_at IS NULL",
                params![task_id.to_string()],
                row_to_task,
            )
            .optional()?;
        Ok(record)
    }

    pub async fn list_scheduled_tasks(&self, owner_id: &str) -> Result<Vec<ScheduledTaskRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT * FROM scheduled_tasks
             WHERE owner_id = ?1 AND deleted_at IS NULL
             ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![owner_id], row_to_task)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub async fn update_scheduled_task_fields(
        &self,
        task: &ScheduledTaskRecord,
    ) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE scheduled_tasks
             SET name = ?2, cron = ?3, timezone = ?4, prompt = ?5, enabled = ?6,
                 next_fire_at = ?7, updated_at = ?8
             WHERE id = ?1 AND deleted_at IS NULL",
            params![
                task.id.to_string(),
                task.name,
                task.cron,
                task.timezone,
                task.prompt,
                task.enabled,
                ts(&task.next_fire_at),
                ts(&Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub async fn soft_delete_scheduled_task(&self, task_id: Uuid) -> Result<bool> {
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE scheduled_tasks SET deleted_at = ?2, updated_at = ?2
             WHERE id = ?1 AND deleted_at IS NULL",
            params![task_id.to_string(), ts(&Utc::now())],
        )?;
        Ok(changed > 0)
    }

    /// Claim up to `limit` due task definitions for this tick. The claim
    /// marker is written inside the same transaction that selects the rows,
    /// so an overlapping tick never claims the same firing: rows claimed
    /// within `claim_ttl` are excluded from selection.
    pub async fn claim_due_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        claim_ttl: Duration,
    ) -> Result<Vec<ScheduledTaskRecord>> {
        let claim_floor = now - claim_ttl;
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;

        let records = {
            let mut stmt = tx.prepare(
                "SELECT * FROM scheduled_tasks
                 WHERE enabled = 1 AND deleted_at IS NULL
                   AND next_fire_at <= ?1
                   AND (claimed_at IS NULL OR claimed_at < ?2)
                 ORDER BY next_fire_at ASC
                 LIMIT ?3",
            )?;
            let rows =
                stmt.query_map(params![ts(&now), ts(&claim_floor), limit as i64], row_to_task)?;

            let mut records = Vec::new();
            for row in rows {
                records.push(row?);
            }
            records
        };

        for task in &records {
            tx.execute(
                "UPDATE scheduled_tasks SET claimed_at = ?2 WHERE id = ?1",
                params![task.id.to_string(), ts(&now)],
            )?;
        }
        tx.commit()?;
        Ok(records)
    }

    /// Record a successful dispatch: last-run linkage, cleared error, and the
    /// advanced fire time. Releases the claim marker.
    pub async fn record_task_dispatched(
        &self,
        task_id: Uuid,
        run_id: Uuid,
        run_status: &str,
        next_fire_at: DateTime<Utc>,
    ) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE scheduled_tasks
             SET last_run_id = ?2, last_run_status = ?3, last_error = NULL,
                 next_fire_at = ?4, claimed_at = NULL, updated_at = ?5
             WHERE id = ?1",
            params![
                task_id.to_string(),
                run_id.to_string(),
                run_status,
                ts(&next_fire_at),
                ts(&Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Advance the fire time without dispatching (skip coalescing).
    pub async fn advance_task_schedule(
        &self,
        task_id: Uuid,
        next_fire_at: DateTime<Utc>,
    ) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE scheduled_tasks
             SET next_fire_at = ?2, claimed_at = NULL, updated_at = ?3
             WHERE id = ?1",
            params![task_id.to_string(), ts(&next_fire_at), ts(&Utc::now())],
        )?;
        Ok(())
    }

    /// Record a dispatch failure. The fire time is left alone so the task is
    /// retried next tick, unless `disable` is set (pinned session vanished).
    pub async fn record_task_error(&self, task_id: Uuid, error: &str, disable: bool) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE scheduled_tasks
             SET last_error = ?2, enabled = CASE WHEN ?3 THEN 0 ELSE enabled END,
                 claimed_at = NULL, updated_at = ?4
             WHERE id = ?1",
            params![task_id.to_string(), error, disable, ts(&Utc::now())],
        )?;
        Ok(())
    }

    /// Record the outcome of a manual trigger on the task row.
    pub async fn record_task_triggered(
        &self,
        task_id: Uuid,
        run_id: Uuid,
        run_status: &str,
    ) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE scheduled_tasks
             SET last_run_id = ?2, last_run_status = ?3, last_error = NULL, updated_at = ?4
             WHERE id = ?1",
            params![
                task_id.to_string(),
                run_id.to_string(),
                run_status,
                ts(&Utc::now()),
            ],
        )?;
        Ok(())
    }
}
