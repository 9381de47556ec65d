use anyhow::Result;
use chrono::Utc;
use rusqlite::{OptionalExtension, Row, params};
use serde_json::Value;
use uuid::Uuid;

use super::StateStore;
use super::types::{
    MessageRecord, SessionKind, SessionRecord, parse_id, parse_json, parse_ts, ts,
};
use crate::core::sandbox::SandboxMode;

const TEXT_PREVIEW_LIMIT: usize = 500;

fn row_to_session(row: &Row) -> rusqlite::Result<SessionRecord> {
    let id: String = row.get("id")?;
    let kind: String = row.get("kind")?;
    let mode: String = row.get("container_mode")?;
    let config: String = row.get("config")?;
    let state_patch: String = row.get("state_patch")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    Ok(SessionRecord {
        id: parse_id(&id)?,
        owner_id: row.get("owner_id")?,
        status: row.get("status")?,
        kind: SessionKind::parse(&kind).unwrap_or(SessionKind::Chat),
        config: parse_json(&config)?,
        state_patch: parse_json(&state_patch)?,
        container_mode: SandboxMode::parse(&mode).unwrap_or(SandboxMode::Ephemeral),
        container_id: row.get("container_id")?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

impl StateStore {
    pub async fn create_session(
        &self,
        owner_id: &str,
        kind: SessionKind,
        config: Value,
        container_mode: SandboxMode,
    ) -> Result<SessionRecord> {
        let now = Utc::now();
        let record = SessionRecord {
            id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            status: "pending".to_string(),
            kind,
            config,
            state_patch: Value::Object(Default::default()),
            container_mode,
            container_id: None,
            created_at: now,
            updated_at: now,
        };

        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO sessions
                (id, owner_id, status, kind, config, state_patch, container_mode, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.id.to_string(),
                record.owner_id,
                record.status,
                record.kind.as_str(),
                record.config.to_string(),
                record.state_patch.to_string(),
                record.container_mode.as_str(),
                ts(&record.created_at),
                ts(&record.updated_at),
            ],
        )?;
        Ok(record)
    }

    pub async fn get_session(&self, session_id: Uuid) -> Result<Option<SessionRecord>> {
        let db = self.db.lock().await;
        let record = db
            .query_row(
                "SELECT * FROM sessions WHERE id = ?1",
                params![session_id.to_string()],
                row_to_session,
            )
            .optional()?;
        Ok(record)
    }

    /// Clear leftover execution state before a new run so viewers never see
    /// stale file changes from a prior firing.
    pub async fn reset_session_for_run(&self, session_id: Uuid) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE sessions SET state_patch = '{}', status = 'pending', updated_at = ?2
             WHERE id = ?1",
            params![session_id.to_string(), ts(&Utc::now())],
        )?;
        Ok(())
    }

    /// Mirror a run report onto the owning session: status always, the
    /// state patch only when the report carries one (overwrite, never merge).
    pub async fn apply_session_report(
        &self,
        session_id: Uuid,
        status: &str,
        state_patch: Option<&Value>,
    ) -> Result<()> {
        let db = self.db.lock().await;
        match state_patch {
            Some(patch) => {
                db.execute(
                    "UPDATE sessions SET status = ?2, state_patch = ?3, updated_at = ?4
                     WHERE id = ?1",
                    params![
                        session_id.to_string(),
                        status,
                        patch.to_string(),
                        ts(&Utc::now())
                    ],
                )?;
            }
            None => {
                db.execute(
                    "UPDATE sessions SET status = ?2, updated_at = ?3 WHERE id = ?1",
                    params![session_id.to_string(), status, ts(&Utc::now())],
                )?;
            }
        }
        Ok(())
    }

    /// Record (or clear) the container a persistent session resumes into.
    pub async fn set_session_container(
        &self,
        session_id: Uuid,
        container_id: Option<&str>,
    ) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE sessions SET container_id = ?2, updated_at = ?3 WHERE id = ?1",
            params![session_id.to_string(), container_id, ts(&Utc::now())],
        )?;
        Ok(())
    }

    pub async fn create_message(
        &self,
        session_id: Uuid,
        role: &str,
        content: Value,
        preview: &str,
    ) -> Result<MessageRecord> {
        let now = Utc::now();
        let preview: String = preview.chars().take(TEXT_PREVIEW_LIMIT).collect();
        let record = MessageRecord {
            id: Uuid::new_v4(),
            session_id,
            role: role.to_string(),
            content,
            text_preview: Some(preview),
            created_at: now,
        };

        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO messages (id, session_id, role, content, text_preview, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id.to_string(),
                record.session_id.to_string(),
                record.role,
                record.content.to_string(),
                record.text_preview,
                ts(&record.created_at),
            ],
        )?;
        Ok(record)
    }

    pub async fn get_message(&self, message_id: Uuid) -> Result<Option<MessageRecord>> {
        let db = self.db.lock().await;
        let record = db
            .query_row(
                "SELECT * FROM messages WHERE id = ?1",
                params![message_id.to_string()],
                |row| {
                    let id: String = row.get("id")?;
                    let session_id: String = row.get("session_id")?;
                    let content: String = row.get("content")?;
                    let created_at: String = row.get("created_at")?;
                    Ok(MessageRecord {
                        id: parse_id(&id)?,
                        session_id: parse_id(&session_id)?,
                        role: row.get("role")?,
                        content: parse_json(&content)?,
                        text_preview: row.get("text_preview")?,
                        created_at: parse_ts(&created_at)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }
}
