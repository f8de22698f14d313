//! Per-connection terminal protocol.
//!
//! Each WebSocket gets a reader loop driving a [`Connection`] state machine and
//! a writer task draining its outbound queue. Inbound frames are handled one
//! at a time, so replies leave in the order their requests arrived.

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::builtins;
use crate::executor::ExitCode;
use crate::protocol::{self, ClientMessage, ServerMessage, ERR_INIT_FAILED, ERR_NOT_INITIALIZED};
use crate::session::{ConnectionId, Session, SessionHandle, SESSION_HOSTNAME, SESSION_USER};
use crate::state::AppState;
use crate::store::NewCommand;

const OUTBOUND_CAPACITY: usize = 64;

/// Drive one upgraded socket until the peer goes away.
pub async fn handle_socket(socket: WebSocket, state: AppState) {
    let id = ConnectionId::new();
    info!(connection = %id, "Terminal connection established");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_CAPACITY);

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let json = match msg.to_json() {
                Ok(json) => json,
                Err(e) => {
                    warn!(connection = %id, error = %e, "Failed to encode message");
                    continue;
                }
            };
            if let Err(e) = ws_tx.send(Message::Text(json)).await {
                debug!(connection = %id, error = %e, "WebSocket send failed");
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let mut conn = Connection::new(id, state, out_tx);
    conn.emit(ServerMessage::Connected {}).await;

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => conn.handle_frame(&text).await,
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => conn.handle_frame(text).await,
                Err(_) => {
                    conn.emit(ServerMessage::error(protocol::ERR_MALFORMED)).await;
                }
            },
            Ok(Message::Close(frame)) => {
                info!(connection = %id, ?frame, "Terminal connection closed");
                break;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Err(e) => {
                warn!(connection = %id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    conn.close().await;
    drop(conn);
    let _ = writer.await;
}

/// Where a connection is in its lifecycle.
#[derive(Debug)]
pub enum Phase {
    Uninitialized,
    Active(SessionHandle),
    Closed,
}

/// Protocol state for one connection, independent of the socket so it can be
/// driven directly.
pub struct Connection {
    id: ConnectionId,
    state: AppState,
    phase: Phase,
    out: mpsc::Sender<ServerMessage>,
}

impl Connection {
    pub fn new(id: ConnectionId, state: AppState, out: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            id,
            state,
            phase: Phase::Uninitialized,
            out,
        }
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// Decode and dispatch one text frame.
    pub async fn handle_frame(&mut self, text: &str) {
        match protocol::decode(text) {
            Ok(msg) => self.handle_message(msg).await,
            Err(e) => {
                debug!(connection = %self.id, error = ?e, "Rejected frame");
                self.emit(ServerMessage::error(e.reply())).await;
            }
        }
    }

    pub async fn handle_message(&mut self, msg: ClientMessage) {
        if matches!(self.phase, Phase::Closed) {
            return;
        }

        let msg = match msg {
            ClientMessage::Init { session_id } => {
                self.init(&session_id).await;
                return;
            }
            other => other,
        };

        let handle = match &self.phase {
            Phase::Active(handle) => handle.clone(),
            _ => {
                self.emit(ServerMessage::error(ERR_NOT_INITIALIZED)).await;
                return;
            }
        };

        match msg {
            ClientMessage::Command { command } => self.command(&handle, &command).await,
            ClientMessage::Resize { cols, rows } => {
                self.emit(ServerMessage::ResizeAck { cols, rows }).await;
            }
            ClientMessage::Init { .. } => {}
        }
    }

    async fn init(&mut self, session_id: &str) {
        let session = match self.state.registry.init_session(session_id).await {
            Ok(session) => session,
            Err(e) => {
                warn!(connection = %self.id, session_id, error = %e, "Session init failed");
                self.emit(ServerMessage::error(ERR_INIT_FAILED)).await;
                return;
            }
        };

        let banner = welcome_banner(&session);
        let prompt = prompt_for(session.prompt_directory());

        let handle = match self.phase {
            Phase::Active(_) => self.state.registry.rebind(self.id, session).await,
            _ => match self.state.registry.bind(self.id, session).await {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(connection = %self.id, session_id, error = %e, "Session bind failed");
                    self.emit(ServerMessage::error(ERR_INIT_FAILED)).await;
                    return;
                }
            },
        };
        self.phase = Phase::Active(handle);
        info!(connection = %self.id, session_id, "Connection bound to session");

        self.emit(ServerMessage::Output {
            output: banner,
            exit_code: ExitCode::SUCCESS,
        })
        .await;
        self.emit(prompt).await;
    }

    async fn command(&mut self, handle: &SessionHandle, command: &str) {
        let line = command.trim();
        if line.is_empty() {
            return;
        }

        let mut session = handle.lock().await;
        session.last_activity = Utc::now();
        let session_id = session.id.clone();
        let verb = crate::executor::verb(line);

        let restored = match session.restore_directory().await {
            Ok(moved) => moved,
            Err(e) => {
                warn!(connection = %self.id, %session_id, error = %e, "Could not restore working directory");
                false
            }
        };

        let (output, exit_code, directory_changed) =
            match builtins::intercept(line, &mut session).await {
                Some(result) => {
                    debug!(connection = %self.id, verb, "Built-in command");
                    (result.output, result.exit_code, result.directory_changed)
                }
                None => {
                    let cwd = session.cwd.clone();
                    let env = session.env.clone();
                    match self.state.executor.execute(line, &cwd, &env).await {
                        Ok(result) => (result.output, result.exit_code, false),
                        Err(e) => {
                            warn!(connection = %self.id, verb, error = %e, "Executor failed");
                            let output = format!("bash: {line}: command not found\n");
                            (output, ExitCode::Numeric(127), false)
                        }
                    }
                }
            };

        let prompt = if restored || directory_changed {
            self.state
                .history
                .directory_changed(&session_id, session.cwd.to_string_lossy().into_owned())
                .await;
            Some(prompt_for(session.display_directory()))
        } else {
            None
        };
        drop(session);

        info!(connection = %self.id, %session_id, verb, %exit_code, "Command finished");

        self.state
            .history
            .record(NewCommand {
                session_id,
                command: command.to_string(),
                output: output.clone(),
                exit_code: exit_code.clone(),
            })
            .await;

        self.emit(ServerMessage::Output { output, exit_code }).await;
        if let Some(prompt) = prompt {
            self.emit(prompt).await;
        }
    }

    /// Unbind the session and wait for its history to land. Idempotent.
    pub async fn close(&mut self) {
        if matches!(self.phase, Phase::Closed) {
            return;
        }
        self.state.registry.unbind(self.id).await;
        self.state.history.flush().await;
        self.phase = Phase::Closed;
        debug!(connection = %self.id, "Connection closed");
    }

    /// Queue a message for the writer. Returns false once the writer is gone.
    pub async fn emit(&self, msg: ServerMessage) -> bool {
        if matches!(self.phase, Phase::Closed) {
            return false;
        }
        self.out.send(msg).await.is_ok()
    }
}

fn prompt_for(directory: String) -> ServerMessage {
    ServerMessage::Prompt {
        user: SESSION_USER.to_string(),
        hostname: SESSION_HOSTNAME.to_string(),
        directory,
    }
}

#[cfg(unix)]
fn os_description() -> String {
    match nix::sys::utsname::uname() {
        Ok(uts) => format!(
            "{} {}",
            uts.sysname().to_string_lossy(),
            uts.release().to_string_lossy()
        ),
        Err(_) => std::env::consts::OS.to_string(),
    }
}

#[cfg(not(unix))]
fn os_description() -> String {
    std::env::consts::OS.to_string()
}

fn welcome_banner(session: &Session) -> String {
    let short_id: String = session.id.chars().take(8).collect();
    let var = |key: &str| session.env.get(key).map(String::as_str).unwrap_or("");

    format!(
        "Welcome to WebTerminal v1.0 - Development Environment
Connected to {os} • Session: {short_id}
Working Directory: {cwd}

Environment:
  USER={user}  SHELL={shell}  TERM={term}
  HOME={home}
  NODE_ENV={node_env}
  npm prefix: {npm_prefix}

Quick Start:
- Try 'node hello.js' for Node.js demo
- Run 'python3 app.py' for Python demo
- Use 'cd sample-project' for a ready project
- Type 'help' for built-in commands

",
        os = os_description(),
        cwd = session.cwd.display(),
        user = var("USER"),
        shell = var("SHELL"),
        term = var("TERM"),
        home = var("HOME"),
        node_env = var("NODE_ENV"),
        npm_prefix = var("NPM_CONFIG_PREFIX"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use std::path::Path;
    use tokio::sync::mpsc::Receiver;

    struct Harness {
        conn: Connection,
        rx: Receiver<ServerMessage>,
        state: AppState,
        _base: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let base = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            sandbox_base: base.path().to_path_buf(),
            ..ServerConfig::default()
        };
        let (state, _task) = AppState::new(&config);
        let (tx, rx) = mpsc::channel(64);
        let conn = Connection::new(ConnectionId::new(), state.clone(), tx);
        Harness {
            conn,
            rx,
            state,
            _base: base,
        }
    }

    impl Harness {
        async fn send(&mut self, json: &str) -> Vec<ServerMessage> {
            self.conn.handle_frame(json).await;
            let mut replies = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                replies.push(msg);
            }
            replies
        }

        async fn init(&mut self, session_id: &str) -> Vec<ServerMessage> {
            self.send(&format!(r#"{{"type":"init","data":{{"sessionId":"{session_id}"}}}}"#))
                .await
        }

        async fn command(&mut self, command: &str) -> Vec<ServerMessage> {
            let frame = serde_json::json!({"type": "command", "data": {"command": command}});
            self.send(&frame.to_string()).await
        }

        fn sandbox(&self, session_id: &str) -> std::path::PathBuf {
            self.state.registry.sandbox_base().join(session_id)
        }
    }

    fn output_of(msg: &ServerMessage) -> (&str, &ExitCode) {
        match msg {
            ServerMessage::Output { output, exit_code } => (output, exit_code),
            other => panic!("expected output, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn command_before_init_is_rejected() {
        let mut h = harness();
        let replies = h.command("pwd").await;
        assert_eq!(replies, vec![ServerMessage::error(ERR_NOT_INITIALIZED)]);
        let replies = h.send(r#"{"type":"resize","data":{"cols":80,"rows":24}}"#).await;
        assert_eq!(replies, vec![ServerMessage::error(ERR_NOT_INITIALIZED)]);
        assert!(matches!(h.conn.phase(), Phase::Uninitialized));
    }

    #[tokio::test]
    async fn init_emits_banner_then_prompt() {
        let mut h = harness();
        let replies = h.init("abc123").await;
        assert_eq!(replies.len(), 2);

        let (banner, code) = output_of(&replies[0]);
        assert!(banner.starts_with("Welcome to WebTerminal"));
        assert!(banner.contains("Session: abc123"));
        assert_eq!(code, &ExitCode::SUCCESS);
        assert_eq!(
            replies[1],
            ServerMessage::Prompt {
                user: "user".into(),
                hostname: "webterminal".into(),
                directory: "abc123".into(),
            }
        );
        assert!(h.sandbox("abc123").is_dir());
        assert!(matches!(h.conn.phase(), Phase::Active(_)));
    }

    #[tokio::test]
    async fn reinit_while_active_is_idempotent() {
        let mut h = harness();
        h.init("again").await;
        let replies = h.init("again").await;
        assert_eq!(replies.len(), 2);
        assert_eq!(h.state.registry.active_count().await, 1);
    }

    #[tokio::test]
    async fn invalid_session_id_fails_init() {
        let mut h = harness();
        let replies = h.init("../../etc").await;
        assert_eq!(replies, vec![ServerMessage::error(ERR_INIT_FAILED)]);
        assert!(matches!(h.conn.phase(), Phase::Uninitialized));
    }

    #[tokio::test]
    async fn pwd_and_cd_scenarios() {
        let mut h = harness();
        h.init("abc123").await;
        let root = h.sandbox("abc123");

        let replies = h.command("pwd").await;
        assert_eq!(
            replies,
            vec![ServerMessage::Output {
                output: format!("{}\n", root.display()),
                exit_code: ExitCode::SUCCESS,
            }]
        );

        let replies = h.command("cd nonexistent").await;
        assert_eq!(
            replies,
            vec![ServerMessage::Output {
                output: "bash: cd: nonexistent: No such file or directory\n".into(),
                exit_code: ExitCode::FAILURE,
            }]
        );

        let replies = h.command("cd sample-project").await;
        assert_eq!(replies.len(), 2);
        assert_eq!(output_of(&replies[0]), ("", &ExitCode::SUCCESS));
        assert!(matches!(&replies[1], ServerMessage::Prompt { directory, .. } if directory == "~/sample-project"));

        let replies = h.command("cd").await;
        assert!(matches!(&replies[1], ServerMessage::Prompt { directory, .. } if directory == "~"));
        h.command("cd sample-project").await;

        let replies = h.command("ls").await;
        let (listing, _) = output_of(&replies[0]);
        assert!(listing.contains("index.js"));
    }

    #[tokio::test]
    async fn blocked_command_leaves_no_trace_on_disk() {
        let mut h = harness();
        h.init("blocked").await;

        let replies = h.command("sudo rm -rf /").await;
        let (output, code) = output_of(&replies[0]);
        assert_eq!(code, &ExitCode::FAILURE);
        assert!(output.contains("not permitted"));

        h.command("echo x > marker; sudo true").await;
        assert!(!h.sandbox("blocked").join("marker").exists());
    }

    #[tokio::test]
    async fn blank_commands_are_ignored() {
        let mut h = harness();
        h.init("blank").await;
        assert!(h.command("   ").await.is_empty());
        assert!(h.command("").await.is_empty());
    }

    #[tokio::test]
    async fn every_command_is_recorded_once() {
        let mut h = harness();
        h.init("recorded").await;
        h.command("pwd").await;
        h.command("cd nowhere").await;
        h.command("echo hi").await;
        h.command(" ").await;
        h.conn.close().await;

        let history = h.state.store.command_history("recorded", 50).await;
        let commands: Vec<&str> = history.iter().map(|c| c.command.as_str()).collect();
        assert_eq!(commands, ["pwd", "cd nowhere", "echo hi"]);
        assert_eq!(history[2].output, "hi\n");
    }

    #[tokio::test]
    async fn cd_is_persisted_on_session_record() {
        let mut h = harness();
        h.init("persist").await;
        h.command("cd sample-project").await;
        h.conn.close().await;

        let record = h.state.store.get_session("persist").await.unwrap();
        assert!(Path::new(&record.current_directory).ends_with("sample-project"));
    }

    #[tokio::test]
    async fn resize_unknown_and_malformed() {
        let mut h = harness();
        h.init("misc").await;

        let replies = h.send(r#"{"type":"resize","data":{"cols":100,"rows":30}}"#).await;
        assert_eq!(replies, vec![ServerMessage::ResizeAck { cols: 100, rows: 30 }]);

        let replies = h.send(r#"{"type":"cancel","data":{}}"#).await;
        assert_eq!(replies, vec![ServerMessage::error("Unknown message type")]);

        let replies = h.send("{not json").await;
        assert_eq!(replies, vec![ServerMessage::error("Failed to process message")]);

        assert!(matches!(h.conn.phase(), Phase::Active(_)));
    }

    #[tokio::test]
    async fn removed_working_directory_falls_back_to_sandbox() {
        let mut h = harness();
        h.init("gone").await;
        let root = h.sandbox("gone");
        h.command("cd sample-project").await;

        let replies = h.command("rm -r ../sample-project").await;
        assert_eq!(output_of(&replies[0]).1, &ExitCode::SUCCESS);

        let replies = h.command("ls").await;
        assert_eq!(replies.len(), 2);
        let (listing, code) = output_of(&replies[0]);
        assert_eq!(code, &ExitCode::SUCCESS);
        assert!(listing.contains("welcome.txt"));
        assert!(matches!(&replies[1], ServerMessage::Prompt { directory, .. } if directory == "~"));

        let replies = h.command("pwd").await;
        assert_eq!(output_of(&replies[0]).0, format!("{}\n", root.display()));

        h.conn.close().await;
        let record = h.state.store.get_session("gone").await.unwrap();
        assert_eq!(Path::new(&record.current_directory), root);
    }

    #[tokio::test]
    async fn close_unbinds_and_silences_connection() {
        let mut h = harness();
        h.init("closing").await;
        assert_eq!(h.state.registry.active_count().await, 1);

        h.conn.close().await;
        h.conn.close().await;
        assert_eq!(h.state.registry.active_count().await, 0);
        assert!(matches!(h.conn.phase(), Phase::Closed));
        assert!(h.command("pwd").await.is_empty());
        assert!(h.sandbox("closing").is_dir());
    }
}
