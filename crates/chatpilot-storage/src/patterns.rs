use rusqlite::OptionalExtension;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use chatpilot_core::error::ChatPilotError;

use crate::db::{now_rfc3339, Database};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Click,
    Callback,
    Message,
    Like,
    Dislike,
    Wait,
    NextProfile,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Click => "click",
            ActionType::Callback => "callback",
            ActionType::Message => "message",
            ActionType::Like => "like",
            ActionType::Dislike => "dislike",
            ActionType::Wait => "wait",
            ActionType::NextProfile => "next_profile",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "click" => Some(ActionType::Click),
            "callback" => Some(ActionType::Callback),
            "message" => Some(ActionType::Message),
            "like" => Some(ActionType::Like),
            "dislike" => Some(ActionType::Dislike),
            "wait" => Some(ActionType::Wait),
            "next_profile" => Some(ActionType::NextProfile),
            _ => None,
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub button_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_bot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternAction {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    #[serde(default)]
    pub data: ActionData,
    pub sequence_order: i64,
    pub delay_after_ms: i64,
}

#[derive(Debug, Clone)]
pub struct Pattern {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub actions: Vec<PatternAction>,
    pub is_active: bool,
    pub repeat_count: i64,
    pub delay_between_ms: i64,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewPattern {
    pub name: String,
    pub description: Option<String>,
    pub actions: Vec<PatternAction>,
    pub repeat_count: i64,
    pub delay_between_ms: i64,
}

#[derive(Debug, Clone, Default)]
pub struct PatternUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_active: Option<bool>,
    pub repeat_count: Option<i64>,
    pub delay_between_ms: Option<i64>,
    /// Replaces the whole action list when set.
    pub actions: Option<Vec<PatternAction>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Paused => "paused",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "running" => ExecutionStatus::Running,
            "completed" => ExecutionStatus::Completed,
            "failed" => ExecutionStatus::Failed,
            "paused" => ExecutionStatus::Paused,
            _ => ExecutionStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct PatternExecution {
    pub id: i64,
    pub pattern_id: i64,
    pub account_id: i64,
    pub status: ExecutionStatus,
    /// 1-based index of the action in flight or last completed.
    pub current_action: i64,
    /// 0-based repeat pass that `current_action` belongs to.
    pub current_repeat: i64,
    pub error_message: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

fn row_to_execution(row: &Row<'_>) -> rusqlite::Result<PatternExecution> {
    let status: String = row.get(3)?;
    Ok(PatternExecution {
        id: row.get(0)?,
        pattern_id: row.get(1)?,
        account_id: row.get(2)?,
        status: ExecutionStatus::parse(&status),
        current_action: row.get(4)?,
        current_repeat: row.get(5)?,
        error_message: row.get(6)?,
        started_at: row.get(7)?,
        completed_at: row.get(8)?,
    })
}

const EXECUTION_COLUMNS: &str = "id, pattern_id, account_id, status, current_action,
     current_repeat, error_message, started_at, completed_at";

fn insert_actions(
    conn: &Connection,
    pattern_id: i64,
    actions: &[PatternAction],
) -> Result<(), ChatPilotError> {
    for action in actions {
        conn.execute(
            "INSERT INTO pattern_actions
                (pattern_id, action_type, action_data, sequence_order, delay_after_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                pattern_id,
                action.action_type.as_str(),
                serde_json::to_string(&action.data)?,
                action.sequence_order,
                action.delay_after_ms,
            ],
        )?;
    }
    Ok(())
}

fn load_actions(conn: &Connection, pattern_id: i64) -> Result<Vec<PatternAction>, ChatPilotError> {
    let mut stmt = conn.prepare(
        "SELECT action_type, action_data, sequence_order, delay_after_ms
         FROM pattern_actions
         WHERE pattern_id = ?1
         ORDER BY sequence_order ASC, id ASC",
    )?;
    let rows = stmt
        .query_map(params![pattern_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut actions = Vec::with_capacity(rows.len());
    for (raw_type, raw_data, sequence_order, delay_after_ms) in rows {
        let Some(action_type) = ActionType::parse(&raw_type) else {
            return Err(ChatPilotError::Config(format!(
                "pattern {pattern_id} has unknown action type '{raw_type}'"
            )));
        };
        actions.push(PatternAction {
            action_type,
            data: serde_json::from_str(&raw_data)?,
            sequence_order,
            delay_after_ms,
        });
    }
    Ok(actions)
}

/// Moves the legacy inline `patterns.actions` JSON array into `pattern_actions`.
pub(crate) fn migrate_inline_actions(conn: &Connection) -> Result<(), ChatPilotError> {
    let mut stmt = conn.prepare("SELECT id, actions FROM patterns WHERE actions IS NOT NULL")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);

    for (pattern_id, raw) in rows {
        let existing: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pattern_actions WHERE pattern_id = ?1",
            params![pattern_id],
            |row| row.get(0),
        )?;
        if existing > 0 {
            continue;
        }
        // Rows that no longer parse are left for the operator to fix.
        let Ok(actions) = serde_json::from_str::<Vec<PatternAction>>(&raw) else {
            continue;
        };
        insert_actions(conn, pattern_id, &actions)?;
    }
    Ok(())
}

impl Database {
    pub fn create_pattern(&self, pattern: &NewPattern) -> Result<i64, ChatPilotError> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO patterns (name, description, is_active, repeat_count, delay_between_ms, created_at)
             VALUES (?1, ?2, 1, ?3, ?4, ?5)",
            params![
                pattern.name,
                pattern.description,
                pattern.repeat_count,
                pattern.delay_between_ms,
                now_rfc3339(),
            ],
        )?;
        let id = tx.last_insert_rowid();
        insert_actions(&tx, id, &pattern.actions)?;
        tx.commit()?;
        Ok(id)
    }

    pub fn get_pattern(&self, id: i64) -> Result<Option<Pattern>, ChatPilotError> {
        let conn = self.lock_conn();
        let header = conn
            .query_row(
                "SELECT id, name, description, is_active, repeat_count, delay_between_ms, created_at
                 FROM patterns WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Pattern {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        description: row.get(2)?,
                        actions: Vec::new(),
                        is_active: row.get::<_, i64>(3)? != 0,
                        repeat_count: row.get(4)?,
                        delay_between_ms: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                },
            )
            .optional()?;
        let Some(mut pattern) = header else {
            return Ok(None);
        };
        pattern.actions = load_actions(&conn, id)?;
        Ok(Some(pattern))
    }

    pub fn list_patterns(&self) -> Result<Vec<Pattern>, ChatPilotError> {
        let ids: Vec<i64> = {
            let conn = self.lock_conn();
            let mut stmt = conn.prepare("SELECT id FROM patterns ORDER BY id ASC")?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };
        let mut patterns = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(pattern) = self.get_pattern(id)? {
                patterns.push(pattern);
            }
        }
        Ok(patterns)
    }

    pub fn update_pattern(&self, id: i64, update: &PatternUpdate) -> Result<bool, ChatPilotError> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE patterns SET
                name = COALESCE(?2, name),
                description = COALESCE(?3, description),
                is_active = COALESCE(?4, is_active),
                repeat_count = COALESCE(?5, repeat_count),
                delay_between_ms = COALESCE(?6, delay_between_ms)
             WHERE id = ?1",
            params![
                id,
                update.name,
                update.description,
                update.is_active.map(|v| v as i64),
                update.repeat_count,
                update.delay_between_ms,
            ],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        if let Some(actions) = &update.actions {
            tx.execute(
                "DELETE FROM pattern_actions WHERE pattern_id = ?1",
                params![id],
            )?;
            insert_actions(&tx, id, actions)?;
        }
        tx.commit()?;
        Ok(true)
    }

    pub fn delete_pattern(&self, id: i64) -> Result<bool, ChatPilotError> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM pattern_actions WHERE pattern_id = ?1",
            params![id],
        )?;
        tx.execute(
            "DELETE FROM pattern_executions WHERE pattern_id = ?1",
            params![id],
        )?;
        let deleted = tx.execute("DELETE FROM patterns WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(deleted > 0)
    }

    // ----- executions -----

    /// Creates an execution that is already `running` with `started_at` set.
    pub fn create_execution(&self, pattern_id: i64, account_id: i64) -> Result<i64, ChatPilotError> {
        let conn = self.lock_conn();
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO pattern_executions
                (pattern_id, account_id, status, current_action, started_at, created_at)
             VALUES (?1, ?2, 'running', 0, ?3, ?3)",
            params![pattern_id, account_id, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn set_execution_progress(
        &self,
        execution_id: i64,
        current_repeat: i64,
        current_action: i64,
    ) -> Result<(), ChatPilotError> {
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE pattern_executions SET current_repeat = ?2, current_action = ?3 WHERE id = ?1",
            params![execution_id, current_repeat, current_action],
        )?;
        Ok(())
    }

    pub fn complete_execution(&self, execution_id: i64) -> Result<(), ChatPilotError> {
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE pattern_executions
             SET status = 'completed', completed_at = ?2
             WHERE id = ?1",
            params![execution_id, now_rfc3339()],
        )?;
        Ok(())
    }

    pub fn fail_execution(&self, execution_id: i64, error_message: &str) -> Result<(), ChatPilotError> {
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE pattern_executions
             SET status = 'failed', error_message = ?2, completed_at = ?3
             WHERE id = ?1",
            params![execution_id, error_message, now_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_execution(&self, execution_id: i64) -> Result<Option<PatternExecution>, ChatPilotError> {
        let conn = self.lock_conn();
        let execution = conn
            .query_row(
                &format!("SELECT {EXECUTION_COLUMNS} FROM pattern_executions WHERE id = ?1"),
                params![execution_id],
                row_to_execution,
            )
            .optional()?;
        Ok(execution)
    }

    pub fn list_executions(
        &self,
        account_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<PatternExecution>, ChatPilotError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM pattern_executions
             WHERE (?1 IS NULL OR account_id = ?1)
             ORDER BY id DESC
             LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![account_id, limit as i64], row_to_execution)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_actions() -> Vec<PatternAction> {
        vec![
            PatternAction {
                action_type: ActionType::Like,
                data: ActionData::default(),
                sequence_order: 1,
                delay_after_ms: 500,
            },
            PatternAction {
                action_type: ActionType::Message,
                data: ActionData {
                    message_text: Some("hey".into()),
                    target_bot: Some("leomatchbot".into()),
                    ..Default::default()
                },
                sequence_order: 2,
                delay_after_ms: 0,
            },
        ]
    }

    fn new_pattern() -> NewPattern {
        NewPattern {
            name: "like and greet".into(),
            description: None,
            actions: sample_actions(),
            repeat_count: 2,
            delay_between_ms: 1000,
        }
    }

    #[test]
    fn test_action_data_wire_names() {
        let data = ActionData {
            button_text: Some("Yes".into()),
            wait_ms: Some(250),
            ..Default::default()
        };
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["buttonText"], "Yes");
        assert_eq!(json["waitMs"], 250);
        assert!(json.get("callbackData").is_none());

        let action: PatternAction = serde_json::from_str(
            r#"{"type":"next_profile","data":{},"sequenceOrder":3,"delayAfterMs":10}"#,
        )
        .unwrap();
        assert_eq!(action.action_type, ActionType::NextProfile);
        assert_eq!(action.sequence_order, 3);
    }

    #[test]
    fn test_pattern_crud() {
        let db = Database::open_in_memory().unwrap();
        let id = db.create_pattern(&new_pattern()).unwrap();

        let stored = db.get_pattern(id).unwrap().unwrap();
        assert_eq!(stored.actions, sample_actions());
        assert!(stored.is_active);
        assert_eq!(stored.repeat_count, 2);

        db.update_pattern(
            id,
            &PatternUpdate {
                is_active: Some(false),
                actions: Some(vec![sample_actions().remove(0)]),
                ..Default::default()
            },
        )
        .unwrap();
        let stored = db.get_pattern(id).unwrap().unwrap();
        assert!(!stored.is_active);
        assert_eq!(stored.actions.len(), 1);
        assert_eq!(stored.name, "like and greet");

        assert_eq!(db.list_patterns().unwrap().len(), 1);
        assert!(db.delete_pattern(id).unwrap());
        assert!(db.get_pattern(id).unwrap().is_none());
        assert!(!db.update_pattern(id, &PatternUpdate::default()).unwrap());
    }

    #[test]
    fn test_execution_lifecycle() {
        let db = Database::open_in_memory().unwrap();
        let pattern_id = db.create_pattern(&new_pattern()).unwrap();
        let exec_id = db.create_execution(pattern_id, 7).unwrap();

        let exec = db.get_execution(exec_id).unwrap().unwrap();
        assert_eq!(exec.status, ExecutionStatus::Running);
        assert!(exec.started_at.is_some());
        assert!(exec.completed_at.is_none());

        db.set_execution_progress(exec_id, 0, 2).unwrap();
        db.fail_execution(exec_id, "Action 2 (message) failed").unwrap();
        let exec = db.get_execution(exec_id).unwrap().unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert!(exec.status.is_terminal());
        assert_eq!(exec.current_action, 2);
        assert_eq!(exec.current_repeat, 0);
        assert_eq!(exec.error_message.as_deref(), Some("Action 2 (message) failed"));
        assert!(exec.completed_at.is_some());

        assert_eq!(db.list_executions(Some(7), 10).unwrap().len(), 1);
        assert!(db.list_executions(Some(8), 10).unwrap().is_empty());
    }

    #[test]
    fn test_legacy_inline_actions_are_migrated() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE patterns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                description TEXT,
                actions TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                repeat_count INTEGER NOT NULL DEFAULT 1,
                delay_between_ms INTEGER NOT NULL DEFAULT 1000,
                created_at TEXT NOT NULL
            );
            CREATE TABLE pattern_actions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pattern_id INTEGER NOT NULL,
                action_type TEXT NOT NULL,
                action_data TEXT NOT NULL,
                sequence_order INTEGER NOT NULL,
                delay_after_ms INTEGER NOT NULL DEFAULT 500
            );",
        )
        .unwrap();
        conn.execute(
            "INSERT INTO patterns (name, actions, created_at) VALUES ('old', ?1, 'now')",
            params![serde_json::to_string(&sample_actions()).unwrap()],
        )
        .unwrap();

        migrate_inline_actions(&conn).unwrap();
        migrate_inline_actions(&conn).unwrap();
        let actions = load_actions(&conn, 1).unwrap();
        assert_eq!(actions, sample_actions());
    }
}
