use std::path::Path;
use std::sync::Arc;

use tracing::{error, info};

use crate::db::{call_blocking, Account, Database};
use crate::error::ChatPilotError;

pub const SESSION_FILE_SUFFIX: &str = "_telethon.session";

/// Session ids found in `dir`, sorted. An unreadable directory yields none.
pub fn discover_sessions(dir: &Path) -> Vec<String> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            error!("Error discovering sessions in {}: {e}", dir.display());
            return Vec::new();
        }
    };
    let mut sessions: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            name.strip_suffix(SESSION_FILE_SUFFIX)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
        })
        .collect();
    sessions.sort();
    sessions
}

/// Create accounts for newly found session files and return every account
/// matching a session on disk.
pub async fn sync_from_sessions(
    db: Arc<Database>,
    sessions_dir: &Path,
) -> Result<Vec<Account>, ChatPilotError> {
    let sessions = discover_sessions(sessions_dir);
    info!(count = sessions.len(), "Discovered session files");
    call_blocking(db, move |db| db.sync_accounts(&sessions)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("chatpilot_sessions_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_discover_sessions_filters_and_sorts() {
        let dir = temp_dir();
        for name in [
            "zed_telethon.session",
            "alice_telethon.session",
            "notes.txt",
            "bob.session",
            "_telethon.session",
        ] {
            std::fs::write(dir.join(name), b"").unwrap();
        }
        std::fs::create_dir_all(dir.join("dir_telethon.session")).unwrap();

        assert_eq!(discover_sessions(&dir), vec!["alice", "zed"]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_discover_sessions_missing_dir() {
        let dir = std::env::temp_dir().join(format!("chatpilot_missing_{}", uuid::Uuid::new_v4()));
        assert!(discover_sessions(&dir).is_empty());
    }

    #[tokio::test]
    async fn test_sync_from_sessions_is_idempotent() {
        let dir = temp_dir();
        std::fs::write(dir.join("acc1_telethon.session"), b"").unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());

        let first = sync_from_sessions(db.clone(), &dir).await.unwrap();
        let second = sync_from_sessions(db.clone(), &dir).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, second[0].id);
        assert!(first[0].is_active);
        assert!(!first[0].ai_enabled);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
