//! Row mapping between the database and domain types
//!
//! Enums and participants are stored as their serde names, JSON documents
//! as TEXT, timestamps as RFC 3339 strings and booleans as BIGINT 0/1.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::any::AnyRow;
use sqlx::Row;

use crate::agents::domain::{AgentAction, AgentInstance, AgentMessage, ConversationTurn, WorkingMemory};
use crate::persistence::error::PersistenceError;

pub(crate) fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339()
}

pub(crate) fn flag(value: bool) -> i64 {
    i64::from(value)
}

/// Serde name of a unit enum variant, e.g. `AgentStatus::WaitingInput` -> `waiting_input`
pub(crate) fn enum_name<T: Serialize>(value: &T) -> Result<String, PersistenceError> {
    match serde_json::to_value(value)? {
        Value::String(name) => Ok(name),
        other => Ok(other.to_string()),
    }
}

fn parse_enum<T: DeserializeOwned>(row: &AnyRow, column: &str) -> Result<T, PersistenceError> {
    let raw: String = row.try_get(column)?;
    serde_json::from_value(Value::String(raw.clone()))
        .map_err(|_| PersistenceError::decode(column, format!("unknown value '{}'", raw)))
}

fn parse_json<T: DeserializeOwned>(row: &AnyRow, column: &str) -> Result<T, PersistenceError> {
    let raw: String = row.try_get(column)?;
    serde_json::from_str(&raw).map_err(|e| PersistenceError::decode(column, e))
}

fn parse_time(row: &AnyRow, column: &str) -> Result<DateTime<Utc>, PersistenceError> {
    let raw: String = row.try_get(column)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| PersistenceError::decode(column, e))
}

fn parse_count(row: &AnyRow, column: &str) -> Result<u64, PersistenceError> {
    let raw: i64 = row.try_get(column)?;
    u64::try_from(raw).map_err(|e| PersistenceError::decode(column, e))
}

fn parse_flag(row: &AnyRow, column: &str) -> Result<bool, PersistenceError> {
    let raw: i64 = row.try_get(column)?;
    Ok(raw != 0)
}

pub(crate) fn instance_from_row(row: &AnyRow) -> Result<AgentInstance, PersistenceError> {
    let memory: Value = parse_json(row, "working_memory")?;
    let history: Vec<ConversationTurn> = parse_json(row, "conversation_history")?;

    Ok(AgentInstance {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        role: parse_enum(row, "role")?,
        status: parse_enum(row, "status")?,
        working_memory: WorkingMemory::read(memory),
        conversation_history: history,
        tasks_completed: parse_count(row, "tasks_completed")?,
        errors_encountered: parse_count(row, "errors_encountered")?,
        tokens_used: parse_count(row, "tokens_used")?,
        is_active: parse_flag(row, "is_active")?,
        created_at: parse_time(row, "created_at")?,
        updated_at: parse_time(row, "updated_at")?,
    })
}

pub(crate) fn message_from_row(row: &AnyRow) -> Result<AgentMessage, PersistenceError> {
    let project_id: String = row.try_get("project_id")?;
    let mut message = AgentMessage::new(
        project_id,
        parse_json(row, "from_participant")?,
        parse_json(row, "to_participant")?,
        parse_enum(row, "message_type")?,
        parse_json(row, "content")?,
        parse_flag(row, "requires_response")?,
    );
    message.id = row.try_get("id")?;
    message.created_at = parse_time(row, "created_at")?;
    Ok(message.restore(parse_flag(row, "responded")?))
}

pub(crate) fn action_from_row(row: &AnyRow) -> Result<AgentAction, PersistenceError> {
    let finished_at: Option<String> = row.try_get("finished_at")?;
    let finished_at = match finished_at {
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(&raw)
                .map(|at| at.with_timezone(&Utc))
                .map_err(|e| PersistenceError::decode("finished_at", e))?,
        ),
        None => None,
    };

    Ok(AgentAction {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        instance_id: row.try_get("instance_id")?,
        role: parse_enum(row, "role")?,
        action_type: parse_enum(row, "action_type")?,
        name: row.try_get("name")?,
        payload: parse_json(row, "payload")?,
        is_reversible: parse_flag(row, "is_reversible")?,
        status: parse_enum(row, "status")?,
        created_at: parse_time(row, "created_at")?,
        finished_at,
    })
}
