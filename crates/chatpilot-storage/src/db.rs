use rusqlite::OptionalExtension;
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chatpilot_core::error::ChatPilotError;

pub struct Database {
    conn: Mutex<Connection>,
}

pub async fn call_blocking<T, F>(db: std::sync::Arc<Database>, f: F) -> Result<T, ChatPilotError>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> Result<T, ChatPilotError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(db.as_ref()))
        .await
        .map_err(|e| ChatPilotError::Task(format!("DB task join error: {e}")))?
}

#[derive(Debug, Clone)]
pub struct Account {
    pub id: i64,
    pub session_id: String,
    pub phone: Option<String>,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub is_active: bool,
    pub ai_enabled: bool,
    pub system_prompt: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Partial account update; `None` leaves the stored column untouched.
#[derive(Debug, Clone, Default)]
pub struct AccountUpdate {
    pub is_active: Option<bool>,
    pub ai_enabled: Option<bool>,
    pub system_prompt: Option<String>,
    pub phone: Option<String>,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: i64,
    pub account_id: i64,
    pub chat_id: String,
    pub peer_user_id: Option<String>,
    pub peer_username: Option<String>,
    pub peer_first_name: Option<String>,
    pub peer_description: Option<String>,
    pub last_message_at: Option<String>,
    pub is_active: bool,
    pub ai_mode: bool,
}

/// Peer metadata merged into a conversation. Empty and `None` values keep
/// whatever is already stored.
#[derive(Debug, Clone, Default)]
pub struct PeerUpdate {
    pub peer_user_id: Option<String>,
    pub peer_username: Option<String>,
    pub peer_first_name: Option<String>,
    pub peer_description: Option<String>,
    pub ai_mode: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: i64,
    pub conversation_id: i64,
    pub role: String,
    pub content: String,
    pub raw_data: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct DatingProfile {
    pub id: i64,
    pub account_id: i64,
    pub target_user_id: String,
    pub name: Option<String>,
    pub age: Option<i64>,
    pub description: Option<String>,
    pub photos: Vec<String>,
    pub action_taken: Option<String>,
    pub matched: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub age: Option<i64>,
    pub description: Option<String>,
    pub photos: Option<Vec<String>>,
    pub action_taken: Option<String>,
    pub matched: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct LogRecord {
    pub id: i64,
    pub account_id: Option<i64>,
    pub level: String,
    pub category: String,
    pub message: String,
    pub data: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub account_id: Option<i64>,
    pub level: Option<String>,
    pub category: Option<String>,
    pub limit: Option<usize>,
}

pub(crate) const SCHEMA_VERSION_CURRENT: i64 = 3;

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub(crate) fn table_has_column(
    conn: &Connection,
    table: &str,
    column: &str,
) -> Result<bool, ChatPilotError> {
    if !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ChatPilotError::Config(format!(
            "invalid table name: {}",
            table
        )));
    }
    // PRAGMA does not support parameter binding.
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for col in rows {
        if col? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn get_schema_version(conn: &Connection) -> Result<i64, ChatPilotError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS db_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        [],
    )?;
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM db_meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(raw.and_then(|s| s.parse::<i64>().ok()).unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i64) -> Result<(), ChatPilotError> {
    conn.execute(
        "INSERT INTO db_meta(key, value) VALUES('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![version.to_string()],
    )?;
    Ok(())
}

fn apply_schema_migrations(conn: &Connection) -> Result<(), ChatPilotError> {
    let mut version = get_schema_version(conn)?;
    if version < 1 {
        set_schema_version(conn, 1)?;
        version = 1;
    }
    if version < 2 {
        // Databases created by the first dashboard kept actions as a JSON
        // array on the pattern row.
        if table_has_column(conn, "patterns", "actions")? {
            crate::patterns::migrate_inline_actions(conn)?;
        }
        set_schema_version(conn, 2)?;
        version = 2;
    }
    if version < 3 {
        if !table_has_column(conn, "pattern_executions", "current_repeat")? {
            conn.execute(
                "ALTER TABLE pattern_executions ADD COLUMN current_repeat INTEGER NOT NULL DEFAULT 0",
                [],
            )?;
        }
        set_schema_version(conn, 3)?;
        version = 3;
    }
    if version != SCHEMA_VERSION_CURRENT {
        set_schema_version(conn, SCHEMA_VERSION_CURRENT)?;
    }
    Ok(())
}

fn row_to_account(row: &Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        session_id: row.get(1)?,
        phone: row.get(2)?,
        username: row.get(3)?,
        first_name: row.get(4)?,
        last_name: row.get(5)?,
        is_active: row.get::<_, i64>(6)? != 0,
        ai_enabled: row.get::<_, i64>(7)? != 0,
        system_prompt: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

const ACCOUNT_COLUMNS: &str = "id, session_id, phone, username, first_name, last_name,
     is_active, ai_enabled, system_prompt, created_at, updated_at";

fn row_to_conversation(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        account_id: row.get(1)?,
        chat_id: row.get(2)?,
        peer_user_id: row.get(3)?,
        peer_username: row.get(4)?,
        peer_first_name: row.get(5)?,
        peer_description: row.get(6)?,
        last_message_at: row.get(7)?,
        is_active: row.get::<_, i64>(8)? != 0,
        ai_mode: row.get::<_, i64>(9)? != 0,
    })
}

const CONVERSATION_COLUMNS: &str = "id, account_id, chat_id, peer_user_id, peer_username,
     peer_first_name, peer_description, last_message_at, is_active, ai_mode";

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    Ok(StoredMessage {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role: row.get(2)?,
        content: row.get(3)?,
        raw_data: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn row_to_profile(row: &Row<'_>) -> rusqlite::Result<DatingProfile> {
    let photos: Option<String> = row.get(6)?;
    Ok(DatingProfile {
        id: row.get(0)?,
        account_id: row.get(1)?,
        target_user_id: row.get(2)?,
        name: row.get(3)?,
        age: row.get(4)?,
        description: row.get(5)?,
        photos: photos
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default(),
        action_taken: row.get(7)?,
        matched: row.get::<_, i64>(8)? != 0,
        created_at: row.get(9)?,
    })
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

impl Database {
    pub(crate) fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn new(data_dir: &str) -> Result<Self, ChatPilotError> {
        let db_path = Path::new(data_dir).join("chatpilot.db");
        std::fs::create_dir_all(data_dir)?;
        let conn = Connection::open(db_path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, ChatPilotError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, ChatPilotError> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT UNIQUE NOT NULL,
                phone TEXT,
                username TEXT,
                first_name TEXT,
                last_name TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                ai_enabled INTEGER NOT NULL DEFAULT 0,
                system_prompt TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS patterns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                description TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                repeat_count INTEGER NOT NULL DEFAULT 1,
                delay_between_ms INTEGER NOT NULL DEFAULT 1000,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS pattern_actions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pattern_id INTEGER NOT NULL,
                action_type TEXT NOT NULL,
                action_data TEXT NOT NULL,
                sequence_order INTEGER NOT NULL,
                delay_after_ms INTEGER NOT NULL DEFAULT 500,
                FOREIGN KEY (pattern_id) REFERENCES patterns(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_pattern_actions_pattern
                ON pattern_actions(pattern_id, sequence_order);

            CREATE TABLE IF NOT EXISTS conversations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL,
                chat_id TEXT NOT NULL,
                peer_user_id TEXT,
                peer_username TEXT,
                peer_first_name TEXT,
                peer_description TEXT,
                last_message_at TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                ai_mode INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                FOREIGN KEY (account_id) REFERENCES accounts(id) ON DELETE CASCADE,
                UNIQUE(account_id, chat_id)
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_account
                ON conversations(account_id);

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                raw_data TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_id, id);

            CREATE TABLE IF NOT EXISTS pattern_executions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pattern_id INTEGER NOT NULL,
                account_id INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                current_action INTEGER NOT NULL DEFAULT 0,
                current_repeat INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                started_at TEXT,
                completed_at TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (pattern_id) REFERENCES patterns(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_pattern_executions_status
                ON pattern_executions(status);

            CREATE TABLE IF NOT EXISTS logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER,
                level TEXT NOT NULL,
                category TEXT NOT NULL,
                message TEXT NOT NULL,
                data TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);
            CREATE INDEX IF NOT EXISTS idx_logs_account_created ON logs(account_id, created_at);

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS dating_profiles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL,
                target_user_id TEXT NOT NULL,
                name TEXT,
                age INTEGER,
                description TEXT,
                photos TEXT,
                action_taken TEXT,
                matched INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                FOREIGN KEY (account_id) REFERENCES accounts(id) ON DELETE CASCADE,
                UNIQUE(account_id, target_user_id)
            );",
        )?;
        apply_schema_migrations(&conn)?;

        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    // ----- accounts -----

    /// Insert an account for every session id not yet known; returns all of them.
    pub fn sync_accounts(&self, session_ids: &[String]) -> Result<Vec<Account>, ChatPilotError> {
        {
            let conn = self.lock_conn();
            let now = now_rfc3339();
            for session_id in session_ids {
                conn.execute(
                    "INSERT OR IGNORE INTO accounts (session_id, is_active, ai_enabled, created_at, updated_at)
                     VALUES (?1, 1, 0, ?2, ?2)",
                    params![session_id, now],
                )?;
            }
        }
        let mut accounts = Vec::with_capacity(session_ids.len());
        for session_id in session_ids {
            if let Some(account) = self.get_account_by_session(session_id)? {
                accounts.push(account);
            }
        }
        Ok(accounts)
    }

    pub fn list_accounts(&self) -> Result<Vec<Account>, ChatPilotError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY id ASC"
        ))?;
        let rows = stmt
            .query_map([], row_to_account)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_account(&self, id: i64) -> Result<Option<Account>, ChatPilotError> {
        let conn = self.lock_conn();
        let account = conn
            .query_row(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
                params![id],
                row_to_account,
            )
            .optional()?;
        Ok(account)
    }

    pub fn get_account_by_session(
        &self,
        session_id: &str,
    ) -> Result<Option<Account>, ChatPilotError> {
        let conn = self.lock_conn();
        let account = conn
            .query_row(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE session_id = ?1"),
                params![session_id],
                row_to_account,
            )
            .optional()?;
        Ok(account)
    }

    pub fn update_account(&self, id: i64, update: &AccountUpdate) -> Result<bool, ChatPilotError> {
        let conn = self.lock_conn();
        let changed = conn.execute(
            "UPDATE accounts SET
                is_active = COALESCE(?2, is_active),
                ai_enabled = COALESCE(?3, ai_enabled),
                system_prompt = COALESCE(?4, system_prompt),
                phone = COALESCE(?5, phone),
                username = COALESCE(?6, username),
                first_name = COALESCE(?7, first_name),
                last_name = COALESCE(?8, last_name),
                updated_at = ?9
             WHERE id = ?1",
            params![
                id,
                update.is_active.map(|v| v as i64),
                update.ai_enabled.map(|v| v as i64),
                update.system_prompt,
                update.phone,
                update.username,
                update.first_name,
                update.last_name,
                now_rfc3339(),
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_account(&self, id: i64) -> Result<bool, ChatPilotError> {
        let conn = self.lock_conn();
        Ok(conn.execute("DELETE FROM accounts WHERE id = ?1", params![id])? > 0)
    }

    // ----- conversations -----

    /// Create the conversation for (account, chat) or merge `peer` into it.
    pub fn upsert_conversation(
        &self,
        account_id: i64,
        chat_id: &str,
        peer: &PeerUpdate,
    ) -> Result<Conversation, ChatPilotError> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO conversations
                (account_id, chat_id, peer_user_id, peer_username, peer_first_name,
                 peer_description, ai_mode, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, COALESCE(?7, 1), ?8)
             ON CONFLICT(account_id, chat_id) DO UPDATE SET
                peer_user_id = COALESCE(excluded.peer_user_id, peer_user_id),
                peer_username = COALESCE(excluded.peer_username, peer_username),
                peer_first_name = COALESCE(excluded.peer_first_name, peer_first_name),
                peer_description = COALESCE(excluded.peer_description, peer_description),
                ai_mode = COALESCE(?7, ai_mode)",
            params![
                account_id,
                chat_id,
                non_empty(&peer.peer_user_id),
                non_empty(&peer.peer_username),
                non_empty(&peer.peer_first_name),
                non_empty(&peer.peer_description),
                peer.ai_mode.map(|v| v as i64),
                now_rfc3339(),
            ],
        )?;
        let conversation = conn.query_row(
            &format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations
                 WHERE account_id = ?1 AND chat_id = ?2"
            ),
            params![account_id, chat_id],
            row_to_conversation,
        )?;
        Ok(conversation)
    }

    pub fn get_conversation(&self, id: i64) -> Result<Option<Conversation>, ChatPilotError> {
        let conn = self.lock_conn();
        let conversation = conn
            .query_row(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                params![id],
                row_to_conversation,
            )
            .optional()?;
        Ok(conversation)
    }

    pub fn find_conversation(
        &self,
        account_id: i64,
        chat_id: &str,
    ) -> Result<Option<Conversation>, ChatPilotError> {
        let conn = self.lock_conn();
        let conversation = conn
            .query_row(
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations
                     WHERE account_id = ?1 AND chat_id = ?2"
                ),
                params![account_id, chat_id],
                row_to_conversation,
            )
            .optional()?;
        Ok(conversation)
    }

    pub fn list_conversations(&self, account_id: i64) -> Result<Vec<Conversation>, ChatPilotError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations
             WHERE account_id = ?1
             ORDER BY last_message_at DESC, id DESC"
        ))?;
        let rows = stmt
            .query_map(params![account_id], row_to_conversation)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn set_conversation_ai_mode(&self, id: i64, ai_mode: bool) -> Result<bool, ChatPilotError> {
        let conn = self.lock_conn();
        let changed = conn.execute(
            "UPDATE conversations SET ai_mode = ?2 WHERE id = ?1",
            params![id, ai_mode as i64],
        )?;
        Ok(changed > 0)
    }

    // ----- messages -----

    /// Append a message and bump the conversation's `last_message_at`.
    pub fn add_message(
        &self,
        conversation_id: i64,
        role: &str,
        content: &str,
        raw_data: Option<&str>,
    ) -> Result<i64, ChatPilotError> {
        let conn = self.lock_conn();
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO messages (conversation_id, role, content, raw_data, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![conversation_id, role, content, raw_data, now],
        )?;
        let id = conn.last_insert_rowid();
        conn.execute(
            "UPDATE conversations SET last_message_at = ?2 WHERE id = ?1",
            params![conversation_id, now],
        )?;
        Ok(id)
    }

    /// Most recent `limit` messages, oldest first.
    pub fn get_recent_messages(
        &self,
        conversation_id: i64,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, ChatPilotError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, role, content, raw_data, created_at
             FROM messages
             WHERE conversation_id = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;
        let mut messages = stmt
            .query_map(params![conversation_id, limit as i64], row_to_message)?
            .collect::<Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }

    pub fn clear_messages(&self, conversation_id: i64) -> Result<usize, ChatPilotError> {
        let conn = self.lock_conn();
        Ok(conn.execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
        )?)
    }

    // ----- dating profiles -----

    /// Upsert keyed by (account, target); non-null fields override stored ones.
    pub fn save_dating_profile(
        &self,
        account_id: i64,
        target_user_id: &str,
        update: &ProfileUpdate,
    ) -> Result<(), ChatPilotError> {
        let photos = match &update.photos {
            Some(list) => Some(serde_json::to_string(list)?),
            None => None,
        };
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO dating_profiles
                (account_id, target_user_id, name, age, description, photos, action_taken, matched, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, COALESCE(?8, 0), ?9)
             ON CONFLICT(account_id, target_user_id) DO UPDATE SET
                name = COALESCE(excluded.name, name),
                age = COALESCE(excluded.age, age),
                description = COALESCE(excluded.description, description),
                photos = COALESCE(excluded.photos, photos),
                action_taken = COALESCE(excluded.action_taken, action_taken),
                matched = COALESCE(?8, matched)",
            params![
                account_id,
                target_user_id,
                update.name,
                update.age,
                update.description,
                photos,
                update.action_taken,
                update.matched.map(|v| v as i64),
                now_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn list_dating_profiles(
        &self,
        account_id: i64,
        limit: usize,
    ) -> Result<Vec<DatingProfile>, ChatPilotError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, account_id, target_user_id, name, age, description, photos,
                    action_taken, matched, created_at
             FROM dating_profiles
             WHERE account_id = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![account_id, limit as i64], row_to_profile)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ----- settings -----

    /// Insert defaults without overwriting operator-edited values.
    pub fn seed_settings(&self, defaults: &[(&str, String)]) -> Result<(), ChatPilotError> {
        let conn = self.lock_conn();
        let now = now_rfc3339();
        for (key, value) in defaults {
            conn.execute(
                "INSERT OR IGNORE INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)",
                params![key, value, now],
            )?;
        }
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>, ChatPilotError> {
        let conn = self.lock_conn();
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<(), ChatPilotError> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now_rfc3339()],
        )?;
        Ok(())
    }

    // ----- logs -----

    pub fn log_event(
        &self,
        account_id: Option<i64>,
        level: &str,
        category: &str,
        message: &str,
        data: Option<&str>,
    ) -> Result<i64, ChatPilotError> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO logs (account_id, level, category, message, data, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![account_id, level, category, message, data, now_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_logs(&self, filter: &LogFilter) -> Result<Vec<LogRecord>, ChatPilotError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, account_id, level, category, message, data, created_at
             FROM logs
             WHERE (?1 IS NULL OR account_id = ?1)
               AND (?2 IS NULL OR level = ?2)
               AND (?3 IS NULL OR category = ?3)
             ORDER BY id DESC
             LIMIT ?4",
        )?;
        let rows = stmt
            .query_map(
                params![
                    filter.account_id,
                    filter.level,
                    filter.category,
                    filter.limit.unwrap_or(100) as i64
                ],
                log_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_log(&self, id: i64) -> Result<Option<LogRecord>, ChatPilotError> {
        let conn = self.lock_conn();
        let record = conn
            .query_row(
                "SELECT id, account_id, level, category, message, data, created_at
                 FROM logs WHERE id = ?1",
                params![id],
                log_from_row,
            )
            .optional()?;
        Ok(record)
    }
}

fn log_from_row(row: &Row<'_>) -> rusqlite::Result<LogRecord> {
    Ok(LogRecord {
        id: row.get(0)?,
        account_id: row.get(1)?,
        level: row.get(2)?,
        category: row.get(3)?,
        message: row.get(4)?,
        data: row.get(5)?,
        created_at: row.get(6)?,
    })
}
