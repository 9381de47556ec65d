use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use serde_json::Value;
use uuid::Uuid;

use super::StateStore;
use super::types::{
    PermissionRequestRecord, RequestStatus, parse_id, parse_json, parse_json_opt, parse_ts,
    parse_ts_opt, ts,
};

fn row_to_request(row: &Row) -> rusqlite::Result<PermissionRequestRecord> {
    let id: String = row.get("id")?;
    let session_id: String = row.get("session_id")?;
    let run_id: String = row.get("run_id")?;
    let tool_input: String = row.get("tool_input")?;
    let status: String = row.get("status")?;
    let answers: Option<String> = row.get("answers")?;
    let created_at: String = row.get("created_at")?;
    let expires_at: String = row.get("expires_at")?;
    let answered_at: Option<String> = row.get("answered_at")?;
    Ok(PermissionRequestRecord {
        id: parse_id(&id)?,
        session_id: parse_id(&session_id)?,
        run_id: parse_id(&run_id)?,
        tool_name: row.get("tool_name")?,
        tool_input: parse_json(&tool_input)?,
        status: RequestStatus::parse(&status).unwrap_or(RequestStatus::Expired),
        answers: parse_json_opt(answers)?,
        created_at: parse_ts(&created_at)?,
        expires_at: parse_ts(&expires_at)?,
        answered_at: parse_ts_opt(answered_at)?,
    })
}

impl StateStore {
    pub async fn create_permission_request(
        &self,
        session_id: Uuid,
        run_id: Uuid,
        tool_name: &str,
        tool_input: &Value,
        expires_at: DateTime<Utc>,
    ) -> Result<PermissionRequestRecord> {
        let record = PermissionRequestRecord {
            id: Uuid::new_v4(),
            session_id,
            run_id,
            tool_name: tool_name.to_string(),
            tool_input: tool_input.clone(),
            status: RequestStatus::Pending,
            answers: None,
            created_at: Utc::now(),
            expires_at,
            answered_at: None,
        };

        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO permission_requests
                (id, session_id, run_id, tool_name, tool_input, status, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.id.to_string(),
                record.session_id.to_string(),
                record.run_id.to_string(),
                record.tool_name,
                record.tool_input.to_string(),
                record.status.as_str(),
                ts(&record.created_at),
                ts(&record.expires_at),
            ],
        )?;
        Ok(record)
    }

    pub async fn get_permission_request(
        &self,
        request_id: Uuid,
    ) -> Result<Option<PermissionRequestRecord>> {
        let db = self.db.lock().await;
        let record = db
            .query_row(
                "SELECT * FROM permission_requests WHERE id = ?1",
                params![request_id.to_string()],
                row_to_request,
            )
            .optional()?;
        Ok(record)
    }

    /// Resolve a pending, unexpired request with reviewer answers. Returns
    /// false when the request was already answered or has lapsed — requests
    /// resolve exactly once.
    pub async fn answer_permission_request(
        &self,
        request_id: Uuid,
        answers: &Value,
    ) -> Result<bool> {
        let now = Utc::now();
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE permission_requests
             SET status = 'answered', answers = ?2, answered_at = ?3
             WHERE id = ?1 AND status = 'pending' AND expires_at > ?3",
            params![request_id.to_string(), answers.to_string(), ts(&now)],
        )?;
        Ok(changed > 0)
    }

    pub async fn expire_permission_request(&self, request_id: Uuid) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE permission_requests SET status = 'expired'
             WHERE id = ?1 AND status = 'pending'",
            params![request_id.to_string()],
        )?;
        Ok(())
    }

    /// Pending requests for the review surface. Requests past their expiry
    /// are swept to `expired` first so they never show up as answerable.
    pub async fn list_pending_requests(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<PermissionRequestRecord>> {
        let now = Utc::now();
        let db = self.db.lock().await;
        db.execute(
            "UPDATE permission_requests SET status = 'expired'
             WHERE status = 'pending' AND expires_at <= ?1",
            params![ts(&now)],
        )?;

        let mut stmt = db.prepare(
            "SELECT * FROM permission_requests
             WHERE session_id = ?1 AND status = 'pending'
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![session_id.to_string()], row_to_request)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}
