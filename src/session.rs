//! Session state and the registry binding live connections to sessions.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::SessionError;
use crate::sandbox;
use crate::store::{NewSession, Store};

pub const SESSION_USER: &str = "user";
pub const SESSION_HOSTNAME: &str = "webterminal";

const MAX_SESSION_ID_LEN: usize = 128;

/// Variables whose values always derive from the sandbox path, never from a
/// stored record.
const SANDBOX_SCOPED_VARS: &[&str] = &["HOME", "PWD", "PATH", "NPM_CONFIG_PREFIX", "NPM_CONFIG_CACHE"];

/// Handle identifying one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Working directory and environment of one terminal session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub sandbox_root: PathBuf,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Exclusively owned by the connection it is bound to.
pub type SessionHandle = Arc<Mutex<Session>>;

impl Session {
    /// `HOME` from the session environment, falling back to the sandbox root.
    pub fn home(&self) -> PathBuf {
        self.env
            .get("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| self.sandbox_root.clone())
    }

    /// Move to `new_path` if it is an existing directory. The session is left
    /// untouched on error.
    pub async fn update_directory(&mut self, new_path: PathBuf) -> Result<(), SessionError> {
        match tokio::fs::metadata(&new_path).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(SessionError::NotADirectory(new_path)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SessionError::NotFound(new_path))
            }
            Err(e) => return Err(SessionError::Io(e)),
        }

        self.env
            .insert("PWD".to_string(), new_path.to_string_lossy().into_owned());
        self.cwd = new_path;
        self.last_activity = Utc::now();
        Ok(())
    }

    /// Step back to an existing directory when the working directory was
    /// removed underneath the session. Returns whether the session moved.
    ///
    /// A cwd inside the sandbox only falls back to ancestors inside the
    /// sandbox; if the sandbox root itself is gone it is provisioned again.
    pub async fn restore_directory(&mut self) -> Result<bool, SessionError> {
        if is_dir(&self.cwd).await {
            return Ok(false);
        }

        let inside_sandbox = self.cwd.starts_with(&self.sandbox_root);
        let mut target = None;
        for ancestor in self.cwd.ancestors().skip(1) {
            if inside_sandbox && !ancestor.starts_with(&self.sandbox_root) {
                break;
            }
            if is_dir(ancestor).await {
                target = Some(ancestor.to_path_buf());
                break;
            }
        }

        let target = match target {
            Some(target) => target,
            None => {
                let root = self.sandbox_root.clone();
                tokio::task::spawn_blocking(move || sandbox::provision(&root))
                    .await
                    .map_err(io::Error::other)??;
                self.sandbox_root.clone()
            }
        };

        info!(session_id = %self.id, from = %self.cwd.display(), to = %target.display(), "Working directory vanished");
        self.update_directory(target).await?;
        Ok(true)
    }

    /// Final component of the working directory, shown by the init prompt.
    pub fn prompt_directory(&self) -> String {
        self.cwd
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".to_string())
    }

    /// Full working directory with `HOME` abbreviated to `~`.
    pub fn display_directory(&self) -> String {
        let home = self.home();
        match self.cwd.strip_prefix(&home) {
            Ok(rest) if rest.as_os_str().is_empty() => "~".to_string(),
            Ok(rest) => format!("~/{}", rest.display()),
            Err(_) => self.cwd.display().to_string(),
        }
    }
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false)
}

fn validate_session_id(session_id: &str) -> Result<(), SessionError> {
    let valid = !session_id.is_empty()
        && session_id.len() <= MAX_SESSION_ID_LEN
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SessionError::InvalidSessionId(session_id.to_string()))
    }
}

/// Environment handed to every command of a session rooted at `root`.
pub fn default_env(root: &Path) -> HashMap<String, String> {
    let root = root.to_string_lossy();
    [
        ("HOME", root.to_string()),
        ("USER", SESSION_USER.to_string()),
        (
            "PATH",
            format!(
                "{root}/.npm-global/bin:/usr/local/bin:/usr/bin:/bin:/usr/local/sbin:/usr/sbin:/sbin:/usr/local/node/bin"
            ),
        ),
        ("SHELL", "/bin/bash".to_string()),
        ("TERM", "xterm-256color".to_string()),
        ("PWD", root.to_string()),
        ("NODE_ENV", "development".to_string()),
        ("NPM_CONFIG_PREFIX", format!("{root}/.npm-global")),
        ("NPM_CONFIG_CACHE", format!("{root}/.npm-cache")),
        ("NPM_CONFIG_INIT_AUTHOR_NAME", SESSION_USER.to_string()),
        ("NPM_CONFIG_INIT_LICENSE", "MIT".to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

/// Owns sandbox creation and the connection → session bindings.
pub struct SessionRegistry {
    sandbox_base: PathBuf,
    store: Arc<dyn Store>,
    bindings: RwLock<HashMap<ConnectionId, SessionHandle>>,
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sandbox_base", &self.sandbox_base)
            .finish_non_exhaustive()
    }
}

impl SessionRegistry {
    pub fn new(sandbox_base: PathBuf, store: Arc<dyn Store>) -> Self {
        Self {
            sandbox_base,
            store,
            bindings: RwLock::new(HashMap::new()),
        }
    }

    pub fn sandbox_base(&self) -> &Path {
        &self.sandbox_base
    }

    /// Provision the sandbox for `session_id` and build its session state,
    /// resuming a stored record when one exists. Safe to call repeatedly.
    pub async fn init_session(&self, session_id: &str) -> Result<Session, SessionError> {
        validate_session_id(session_id)?;

        let sandbox_root = sandbox::sandbox_path(&self.sandbox_base, session_id);
        tokio::task::spawn_blocking({
            let sandbox_root = sandbox_root.clone();
            move || sandbox::provision(&sandbox_root)
        })
        .await
        .map_err(io::Error::other)??;

        let mut env = default_env(&sandbox_root);
        let mut cwd = sandbox_root.clone();
        let existing = self.store.get_session(session_id).await;

        if let Some(record) = &existing {
            for (key, value) in &record.environment_vars {
                if !SANDBOX_SCOPED_VARS.contains(&key.as_str()) {
                    env.insert(key.clone(), value.clone());
                }
            }
            let stored = PathBuf::from(&record.current_directory);
            if stored.starts_with(&sandbox_root) && stored.is_dir() {
                cwd = stored;
            }
        }
        env.insert("PWD".to_string(), cwd.to_string_lossy().into_owned());

        let record = self
            .store
            .upsert_session(NewSession {
                id: Some(session_id.to_string()),
                user_id: existing
                    .and_then(|r| r.user_id)
                    .or_else(|| Some(SESSION_USER.to_string())),
                current_directory: cwd.to_string_lossy().into_owned(),
                environment_vars: env.clone(),
            })
            .await;

        info!(session_id, sandbox_root = %sandbox_root.display(), "Session initialized");

        Ok(Session {
            id: session_id.to_string(),
            sandbox_root,
            cwd,
            env,
            created_at: record.created_at,
            last_activity: record.last_activity,
        })
    }

    /// Bind `session` to `connection`. Fails if the connection already owns one.
    pub async fn bind(
        &self,
        connection: ConnectionId,
        session: Session,
    ) -> Result<SessionHandle, SessionError> {
        let mut bindings = self.bindings.write().await;
        if bindings.contains_key(&connection) {
            return Err(SessionError::AlreadyBound(connection));
        }
        let handle = Arc::new(Mutex::new(session));
        bindings.insert(connection, handle.clone());
        debug!(%connection, "Session bound");
        Ok(handle)
    }

    /// Replace whatever `connection` is bound to with `session`.
    pub async fn rebind(&self, connection: ConnectionId, session: Session) -> SessionHandle {
        let handle = Arc::new(Mutex::new(session));
        self.bindings
            .write()
            .await
            .insert(connection, handle.clone());
        debug!(%connection, "Session rebound");
        handle
    }

    /// Drop the binding for `connection`, if any.
    pub async fn unbind(&self, connection: ConnectionId) -> Option<SessionHandle> {
        let removed = self.bindings.write().await.remove(&connection);
        if removed.is_some() {
            debug!(%connection, "Session unbound");
        }
        removed
    }

    pub async fn active_count(&self) -> usize {
        self.bindings.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    fn registry(base: &Path) -> (SessionRegistry, Arc<MemStore>) {
        let store = Arc::new(MemStore::new());
        (SessionRegistry::new(base.to_path_buf(), store.clone()), store)
    }

    #[tokio::test]
    async fn init_creates_existing_working_directory() {
        let base = tempfile::tempdir().unwrap();
        let (registry, _) = registry(base.path());

        let session = registry.init_session("abc123").await.unwrap();
        assert!(session.cwd.is_dir());
        assert_eq!(session.cwd, base.path().join("abc123"));
        assert_eq!(session.prompt_directory(), "abc123");
        assert_eq!(session.env["HOME"], session.cwd.to_string_lossy());
        assert!(session.cwd.join("welcome.txt").is_file());
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let base = tempfile::tempdir().unwrap();
        let (registry, _) = registry(base.path());

        let first = registry.init_session("same").await.unwrap();
        let entries = std::fs::read_dir(&first.cwd).unwrap().count();
        let second = registry.init_session("same").await.unwrap();

        assert_eq!(first.env, second.env);
        assert_eq!(first.cwd, second.cwd);
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(std::fs::read_dir(&second.cwd).unwrap().count(), entries);
    }

    #[tokio::test]
    async fn init_rejects_path_like_ids() {
        let base = tempfile::tempdir().unwrap();
        let (registry, _) = registry(base.path());

        for bad in ["", "../escape", "a/b", "dot.dot"] {
            let err = registry.init_session(bad).await.unwrap_err();
            assert!(matches!(err, SessionError::InvalidSessionId(_)), "{bad}");
        }
    }

    #[tokio::test]
    async fn init_resumes_stored_directory_inside_sandbox() {
        let base = tempfile::tempdir().unwrap();
        let (registry, store) = registry(base.path());

        let mut session = registry.init_session("resume").await.unwrap();
        let project = session.cwd.join("sample-project");
        session.update_directory(project.clone()).await.unwrap();
        store
            .update_session(
                "resume",
                crate::store::SessionUpdate {
                    current_directory: Some(project.to_string_lossy().into_owned()),
                    ..Default::default()
                },
            )
            .await;

        let resumed = registry.init_session("resume").await.unwrap();
        assert_eq!(resumed.cwd, project);
        assert_eq!(resumed.env["PWD"], project.to_string_lossy());
    }

    #[tokio::test]
    async fn init_ignores_stored_directory_outside_sandbox() {
        let base = tempfile::tempdir().unwrap();
        let (registry, store) = registry(base.path());

        let mut env = HashMap::new();
        env.insert("HOME".to_string(), "/home/user".to_string());
        env.insert("EDITOR".to_string(), "nano".to_string());
        store
            .create_session(NewSession {
                id: Some("rest".into()),
                user_id: Some("user".into()),
                current_directory: "/home/user".into(),
                environment_vars: env,
            })
            .await;

        let session = registry.init_session("rest").await.unwrap();
        assert_eq!(session.cwd, base.path().join("rest"));
        assert_eq!(session.env["HOME"], session.cwd.to_string_lossy());
        assert_eq!(session.env["EDITOR"], "nano");
    }

    #[tokio::test]
    async fn bind_twice_is_rejected_and_unbind_never_fails() {
        let base = tempfile::tempdir().unwrap();
        let (registry, _) = registry(base.path());
        let conn = ConnectionId::new();

        let session = registry.init_session("bind").await.unwrap();
        registry.bind(conn, session.clone()).await.unwrap();
        let err = registry.bind(conn, session).await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyBound(c) if c == conn));
        assert_eq!(registry.active_count().await, 1);

        assert!(registry.unbind(conn).await.is_some());
        assert!(registry.unbind(conn).await.is_none());
        assert!(registry.unbind(ConnectionId::new()).await.is_none());
        assert_eq!(registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn update_directory_validates_target() {
        let base = tempfile::tempdir().unwrap();
        let (registry, _) = registry(base.path());
        let mut session = registry.init_session("dirs").await.unwrap();
        let original = session.cwd.clone();

        let err = session.update_directory(original.join("missing")).await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
        let err = session.update_directory(original.join("welcome.txt")).await.unwrap_err();
        assert!(matches!(err, SessionError::NotADirectory(_)));
        assert_eq!(session.cwd, original);

        session.update_directory(original.join(".npm-cache")).await.unwrap();
        assert_eq!(session.cwd, original.join(".npm-cache"));
        assert_eq!(session.env["PWD"], original.join(".npm-cache").to_string_lossy());
    }

    #[test]
    fn prompt_directory_of_root() {
        let session = Session {
            id: "x".into(),
            sandbox_root: PathBuf::from("/"),
            cwd: PathBuf::from("/"),
            env: HashMap::new(),
            created_at: Utc::now(),
            last_activity: Utc::now(),
        };
        assert_eq!(session.prompt_directory(), "/");
        assert_eq!(session.home(), PathBuf::from("/"));
    }

    #[tokio::test]
    async fn display_directory_abbreviates_home() {
        let base = tempfile::tempdir().unwrap();
        let (registry, _) = registry(base.path());
        let mut session = registry.init_session("tilde").await.unwrap();
        assert_eq!(session.display_directory(), "~");

        let root = session.cwd.clone();
        session.update_directory(root.join("sample-project")).await.unwrap();
        assert_eq!(session.display_directory(), "~/sample-project");

        session.update_directory(base.path().to_path_buf()).await.unwrap();
        assert_eq!(session.display_directory(), base.path().display().to_string());
    }

    #[tokio::test]
    async fn restore_directory_falls_back_to_nearest_ancestor() {
        let base = tempfile::tempdir().unwrap();
        let (registry, _) = registry(base.path());
        let mut session = registry.init_session("vanish").await.unwrap();
        let root = session.cwd.clone();

        std::fs::create_dir_all(root.join("a/b")).unwrap();
        session.update_directory(root.join("a/b")).await.unwrap();
        assert!(!session.restore_directory().await.unwrap());

        std::fs::remove_dir(root.join("a/b")).unwrap();
        assert!(session.restore_directory().await.unwrap());
        assert_eq!(session.cwd, root.join("a"));
        assert_eq!(session.env["PWD"], root.join("a").to_string_lossy());
    }

    #[tokio::test]
    async fn restore_directory_reprovisions_a_deleted_sandbox() {
        let base = tempfile::tempdir().unwrap();
        let (registry, _) = registry(base.path());
        let mut session = registry.init_session("wiped").await.unwrap();
        let root = session.cwd.clone();
        session.update_directory(root.join("sample-project")).await.unwrap();

        std::fs::remove_dir_all(&root).unwrap();
        assert!(session.restore_directory().await.unwrap());
        assert_eq!(session.cwd, root);
        assert!(root.join("welcome.txt").is_file());
    }
}
