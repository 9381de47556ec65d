use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::core::gate::PermissionMode;
use crate::core::run::RunState;
use crate::core::sandbox::SandboxMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Chat,
    Scheduled,
}

impl SessionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionKind::Chat => "chat",
            SessionKind::Scheduled => "scheduled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "chat" => Some(SessionKind::Chat),
            "scheduled" => Some(SessionKind::Scheduled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleMode {
    Immediate,
    Scheduled,
}

impl ScheduleMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ScheduleMode::Immediate => "immediate",
            ScheduleMode::Scheduled => "scheduled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "immediate" => Some(ScheduleMode::Immediate),
            "scheduled" => Some(ScheduleMode::Scheduled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Answered,
    Expired,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Answered => "answered",
            RequestStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(RequestStatus::Pending),
            "answered" => Some(RequestStatus::Answered),
            "expired" => Some(RequestStatus::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: Uuid,
    pub owner_id: String,
    pub status: String,
    pub kind: SessionKind,
    pub config: Value,
    pub state_patch: Value,
    pub container_mode: SandboxMode,
    pub container_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    pub role: String,
    pub content: Value,
    pub text_preview: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    pub status: RunState,
    pub schedule_mode: ScheduleMode,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub permission_mode: PermissionMode,
    pub config_snapshot: Option<Value>,
    pub user_message_id: Option<Uuid>,
    pub scheduled_task_id: Option<Uuid>,
    pub progress: i64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ScheduledTaskRecord {
    pub id: Uuid,
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
    pub last_run_id: Option<Uuid>,
    pub last_run_status: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PermissionRequestRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    pub run_id: Uuid,
    pub tool_name: String,
    pub tool_input: Value,
    pub status: RequestStatus,
    pub answers: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
}

// --- Column conversion helpers ---
//
// Timestamps are RFC 3339 TEXT, ids are TEXT uuids, structured fields are
// JSON TEXT. Conversion failures surface as rusqlite errors so row-mapping
// closures stay plain `rusqlite::Result`.

fn conversion_error<E>(err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
}

pub(crate) fn ts(value: &DateTime<Utc>) -> String {
    value.to_rfc3339()
}

pub(crate) fn parse_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(conversion_error)
}

pub(crate) fn parse_ts_opt(raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(&s)).transpose()
}

pub(crate) fn parse_id(raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw).map_err(conversion_error)
}

pub(crate) fn parse_id_opt(raw: Option<String>) -> rusqlite::Result<Option<Uuid>> {
    raw.map(|s| parse_id(&s)).transpose()
}

pub(crate) fn parse_json(raw: &str) -> rusqlite::Result<Value> {
    serde_json::from_str(raw).map_err(conversion_error)
}

pub(crate) fn parse_json_opt(raw: Option<String>) -> rusqlite::Result<Option<Value>> {
    raw.map(|s| parse_json(&s)).transpose()
}
