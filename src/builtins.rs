//! Commands answered from session state without spawning a process.

use std::path::{Component, Path, PathBuf};

use crate::error::SessionError;
use crate::executor::ExitCode;
use crate::session::Session;

/// Clears the screen and homes the cursor.
pub const CLEAR_SEQUENCE: &str = "\x1b[2J\x1b[H";

/// Recognized but always executed for real so output matches the filesystem.
pub const PASS_THROUGH_VERBS: &[&str] = &["ls", "cat", "mkdir", "touch"];

pub const HELP_TEXT: &str = "\
WebTerminal Commands:
Built-in commands:
  clear     - Clear the terminal screen
  pwd       - Print current directory
  cd        - Change directory
  help      - Show this help message

Filesystem commands (run in your sandbox):
  ls        - List directory contents
  cat       - Display file contents
  mkdir     - Create directories
  touch     - Create files

System information:
  whoami    - Current user
  uname     - System information
  date      - Current date and time
  env       - Environment variables

Development:
  node      - Run JavaScript (try: node hello.js)
  python3   - Run Python (try: python3 app.py)
  npm       - Node package manager
  git       - Version control

Commands run with a 30 second timeout and a 1MB output limit.
";

/// Outcome of a built-in command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltinResult {
    pub output: String,
    pub exit_code: ExitCode,
    /// Set when the working directory moved and the prompt must be refreshed.
    pub directory_changed: bool,
}

impl BuiltinResult {
    fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            exit_code: ExitCode::SUCCESS,
            directory_changed: false,
        }
    }
}

/// Answer `command_line` from session state, or return `None` to hand it to
/// the process executor.
pub async fn intercept(command_line: &str, session: &mut Session) -> Option<BuiltinResult> {
    let mut tokens = command_line.split_whitespace();
    let verb = tokens.next()?;

    match verb {
        "clear" => Some(BuiltinResult::ok(CLEAR_SEQUENCE)),
        "pwd" => Some(BuiltinResult::ok(format!("{}\n", session.cwd.display()))),
        "cd" => Some(change_directory(tokens.next(), session).await),
        "help" => Some(BuiltinResult::ok(HELP_TEXT)),
        v if PASS_THROUGH_VERBS.contains(&v) => None,
        _ => None,
    }
}

async fn change_directory(arg: Option<&str>, session: &mut Session) -> BuiltinResult {
    let home = session.home();
    let target = resolve_target(arg, &session.cwd, &home);
    let shown = arg.unwrap_or("~");

    match session.update_directory(target).await {
        Ok(()) => BuiltinResult {
            output: String::new(),
            exit_code: ExitCode::SUCCESS,
            directory_changed: true,
        },
        Err(SessionError::NotADirectory(_)) => BuiltinResult {
            output: format!("bash: cd: {shown}: Not a directory\n"),
            exit_code: ExitCode::FAILURE,
            directory_changed: false,
        },
        Err(_) => BuiltinResult {
            output: format!("bash: cd: {shown}: No such file or directory\n"),
            exit_code: ExitCode::FAILURE,
            directory_changed: false,
        },
    }
}

/// Resolve a `cd` argument against the current directory. Purely lexical;
/// existence is checked by the caller.
pub fn resolve_target(arg: Option<&str>, cwd: &Path, home: &Path) -> PathBuf {
    match arg {
        None | Some("~") => home.to_path_buf(),
        Some("..") => cwd.parent().unwrap_or(cwd).to_path_buf(),
        Some(path) => {
            if let Some(rest) = path.strip_prefix("~/") {
                normalize(&home.join(rest))
            } else {
                normalize(&cwd.join(path))
            }
        }
    }
}

/// Fold `.` and `..` components without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
