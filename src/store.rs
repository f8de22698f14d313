//! Session, command history and synthetic file-tree records.
//!
//! The [`Store`] trait is the CRUD surface the terminal core talks to. The
//! only implementation is [`MemStore`], which keeps everything in memory and
//! loses it on restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::executor::ExitCode;

/// Default number of commands returned by a history query.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub user_id: Option<String>,
    pub current_directory: String,
    pub environment_vars: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewSession {
    /// Record id; a v4 UUID is generated when absent.
    pub id: Option<String>,
    pub user_id: Option<String>,
    pub current_directory: String,
    pub environment_vars: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub current_directory: Option<String>,
    pub environment_vars: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    pub id: String,
    pub session_id: String,
    pub command: String,
    pub output: String,
    pub exit_code: ExitCode,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewCommand {
    pub session_id: String,
    pub command: String,
    pub output: String,
    pub exit_code: ExitCode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileNode {
    pub id: String,
    pub session_id: String,
    pub path: String,
    pub name: String,
    pub content: Option<String>,
    pub is_directory: bool,
    pub permissions: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewFile {
    pub session_id: String,
    pub path: String,
    pub name: String,
    pub content: Option<String>,
    pub is_directory: bool,
    /// Defaults to `644` when absent.
    pub permissions: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FileUpdate {
    pub content: Option<Option<String>>,
    pub permissions: Option<String>,
}

/// Persistence for session records, command history and the synthetic file
/// tree. The file methods form a full CRUD surface for collaborators; the
/// terminal itself only seeds and lists the tree.
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_session(&self, session: NewSession) -> SessionRecord;
    async fn get_session(&self, id: &str) -> Option<SessionRecord>;
    /// Insert the record, replacing any existing one with the same id but
    /// keeping its creation time.
    async fn upsert_session(&self, session: NewSession) -> SessionRecord;
    async fn update_session(&self, id: &str, update: SessionUpdate) -> Option<SessionRecord>;

    async fn add_command(&self, command: NewCommand) -> CommandRecord;
    /// The most recent `limit` commands of a session, oldest first.
    async fn command_history(&self, session_id: &str, limit: usize) -> Vec<CommandRecord>;

    async fn create_file(&self, file: NewFile) -> FileNode;
    async fn get_file(&self, session_id: &str, path: &str) -> Option<FileNode>;
    async fn files_under(&self, session_id: &str, parent_path: &str) -> Vec<FileNode>;
    async fn update_file(&self, id: &str, update: FileUpdate) -> Option<FileNode>;
    async fn delete_file(&self, id: &str) -> bool;
    /// Directories first, then by name.
    async fn file_tree(&self, session_id: &str) -> Vec<FileNode>;

    /// Seed the synthetic file tree shown for a freshly created session.
    async fn seed_file_tree(&self, session_id: &str) {
        for &(path, content, permissions) in SYNTHETIC_TREE {
            let name = path.rsplit('/').next().unwrap_or(path).to_string();
            self.create_file(NewFile {
                session_id: session_id.to_string(),
                path: path.to_string(),
                name,
                content: content.map(str::to_string),
                is_directory: content.is_none(),
                permissions: Some(permissions.to_string()),
            })
            .await;
        }
    }
}

#[derive(Debug, Default)]
struct Tables {
    sessions: HashMap<String, SessionRecord>,
    // Append-only; insertion order is history order.
    commands: Vec<CommandRecord>,
    files: Vec<FileNode>,
}

/// In-memory [`Store`].
#[derive(Debug, Default)]
pub struct MemStore {
    tables: RwLock<Tables>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// `(path, content, permissions)`; `None` content marks a directory.
const SYNTHETIC_TREE: &[(&str, Option<&str>, &str)] = &[
    ("/home", None, "755"),
    ("/home/user", None, "755"),
    ("/home/user/projects", None, "755"),
    ("/home/user/projects/webapp", None, "755"),
    (
        "/home/user/app.py",
        Some("#!/usr/bin/env python3\nimport os\nimport sys\n\ndef main():\n    print(\"Hello, WebTerminal!\")\n\nif __name__ == \"__main__\":\n    main()"),
        "755",
    ),
    (
        "/home/user/readme.txt",
        Some("Welcome to WebTerminal!\n\nThis is a real Linux environment running in your browser.\n\nTry running some commands:\n- ls -la\n- cat app.py\n- python3 app.py"),
        "644",
    ),
    (
        "/home/user/config.json",
        Some("{\n  \"terminal\": {\n    \"theme\": \"dark\",\n    \"fontSize\": 14,\n    \"fontFamily\": \"JetBrains Mono\"\n  },\n  \"environment\": {\n    \"shell\": \"/bin/bash\",\n    \"locale\": \"en_US.UTF-8\"\n  }\n}"),
        "644",
    ),
];

#[async_trait]
impl Store for MemStore {
    async fn create_session(&self, session: NewSession) -> SessionRecord {
        let now = Utc::now();
        let record = SessionRecord {
            id: session.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            user_id: session.user_id,
            current_directory: session.current_directory,
            environment_vars: session.environment_vars,
            created_at: now,
            last_activity: now,
        };
        self.tables
            .write()
            .await
            .sessions
            .insert(record.id.clone(), record.clone());
        record
    }

    async fn get_session(&self, id: &str) -> Option<SessionRecord> {
        self.tables.read().await.sessions.get(id).cloned()
    }

    async fn upsert_session(&self, session: NewSession) -> SessionRecord {
        let now = Utc::now();
        let id = session.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut tables = self.tables.write().await;
        let created_at = tables
            .sessions
            .get(&id)
            .map(|existing| existing.created_at)
            .unwrap_or(now);
        let record = SessionRecord {
            id: id.clone(),
            user_id: session.user_id,
            current_directory: session.current_directory,
            environment_vars: session.environment_vars,
            created_at,
            last_activity: now,
        };
        tables.sessions.insert(id, record.clone());
        record
    }

    async fn update_session(&self, id: &str, update: SessionUpdate) -> Option<SessionRecord> {
        let mut tables = self.tables.write().await;
        let record = tables.sessions.get_mut(id)?;
        if let Some(dir) = update.current_directory {
            record.current_directory = dir;
        }
        if let Some(env) = update.environment_vars {
            record.environment_vars = env;
        }
        record.last_activity = Utc::now();
        Some(record.clone())
    }

    async fn add_command(&self, command: NewCommand) -> CommandRecord {
        let record = CommandRecord {
            id: Uuid::new_v4().to_string(),
            session_id: command.session_id,
            command: command.command,
            output: command.output,
            exit_code: command.exit_code,
            timestamp: Utc::now(),
        };
        self.tables.write().await.commands.push(record.clone());
        record
    }

    async fn command_history(&self, session_id: &str, limit: usize) -> Vec<CommandRecord> {
        let tables = self.tables.read().await;
        let mut recent: Vec<CommandRecord> = tables
            .commands
            .iter()
            .rev()
            .filter(|c| c.session_id == session_id)
            .take(limit)
            .cloned()
            .collect();
        recent.reverse();
        recent
    }

    async fn create_file(&self, file: NewFile) -> FileNode {
        let now = Utc::now();
        let node = FileNode {
            id: Uuid::new_v4().to_string(),
            session_id: file.session_id,
            path: file.path,
            name: file.name,
            content: file.content,
            is_directory: file.is_directory,
            permissions: file.permissions.unwrap_or_else(|| "644".to_string()),
            created_at: now,
            updated_at: now,
        };
        self.tables.write().await.files.push(node.clone());
        node
    }

    async fn get_file(&self, session_id: &str, path: &str) -> Option<FileNode> {
        self.tables
            .read()
            .await
            .files
            .iter()
            .find(|f| f.session_id == session_id && f.path == path)
            .cloned()
    }

    async fn files_under(&self, session_id: &str, parent_path: &str) -> Vec<FileNode> {
        self.tables
            .read()
            .await
            .files
            .iter()
            .filter(|f| {
                f.session_id == session_id
                    && f.path.starts_with(parent_path)
                    && f.path != parent_path
            })
            .cloned()
            .collect()
    }

    async fn update_file(&self, id: &str, update: FileUpdate) -> Option<FileNode> {
        let mut tables = self.tables.write().await;
        let node = tables.files.iter_mut().find(|f| f.id == id)?;
        if let Some(content) = update.content {
            node.content = content;
        }
        if let Some(permissions) = update.permissions {
            node.permissions = permissions;
        }
        node.updated_at = Utc::now();
        Some(node.clone())
    }

    async fn delete_file(&self, id: &str) -> bool {
        let mut tables = self.tables.write().await;
        let before = tables.files.len();
        tables.files.retain(|f| f.id != id);
        tables.files.len() != before
    }

    async fn file_tree(&self, session_id: &str) -> Vec<FileNode> {
        let mut nodes: Vec<FileNode> = self
            .tables
            .read()
            .await
            .files
            .iter()
            .filter(|f| f.session_id == session_id)
            .cloned()
            .collect();
        nodes.sort_by(|a, b| {
            b.is_directory
                .cmp(&a.is_directory)
                .then_with(|| a.name.cmp(&b.name))
        });
        nodes
    }
}
