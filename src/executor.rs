//! Shell command execution with a blocklist, wall-clock timeout and output cap.
//!
//! The blocklist is a coarse substring filter, not an isolation boundary.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ExecError;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Substrings that reject a command line before anything is spawned.
pub const BLOCKLIST: &[&str] = &[
    "rm -rf /",
    "sudo",
    "su",
    "passwd",
    "useradd",
    "userdel",
    "reboot",
    "shutdown",
    "init",
    "systemctl",
];

/// Exit code reported for output-cap kills, kept textual like the status it mirrors.
pub const MAXBUFFER_EXIT_CODE: &str = "ERR_CHILD_PROCESS_STDIO_MAXBUFFER";

const READ_CHUNK: usize = 8192;

/// Exit status as reported to the client. Some failures carry a textual code
/// rather than a number, so both are representable; on the wire it is always
/// a JSON string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitCode {
    Numeric(i32),
    Raw(String),
}

impl ExitCode {
    pub const SUCCESS: ExitCode = ExitCode::Numeric(0);
    pub const FAILURE: ExitCode = ExitCode::Numeric(1);

    pub fn is_success(&self) -> bool {
        matches!(self, ExitCode::Numeric(0))
    }

    /// Best-effort numeric form, used as the process exit status of `webterm exec`.
    pub fn as_i32(&self) -> i32 {
        match self {
            ExitCode::Numeric(code) => *code,
            ExitCode::Raw(_) => 1,
        }
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitCode::Numeric(code) => write!(f, "{code}"),
            ExitCode::Raw(raw) => f.write_str(raw),
        }
    }
}

impl From<&str> for ExitCode {
    fn from(s: &str) -> Self {
        match s.parse::<i32>() {
            Ok(code) => ExitCode::Numeric(code),
            Err(_) => ExitCode::Raw(s.to_string()),
        }
    }
}

impl Serialize for ExitCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ExitCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(ExitCode::from(raw.as_str()))
    }
}

/// How a command run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited,
    Blocked,
    TimedOut,
    OutputTooLarge,
}

/// Result of running a command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub output: String,
    pub exit_code: ExitCode,
    pub termination: Termination,
}

/// Limits applied to every spawned command.
#[derive(Debug, Clone)]
pub struct ExecConfig {
    pub shell: PathBuf,
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            shell: PathBuf::from(DEFAULT_SHELL),
            timeout: DEFAULT_TIMEOUT,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

/// Runs command lines as shell children.
#[derive(Debug, Clone, Default)]
pub struct Executor {
    config: ExecConfig,
}

/// Returns the blocklist entry a command line trips, if any.
pub fn blocked_by(command_line: &str) -> Option<&'static str> {
    BLOCKLIST
        .iter()
        .copied()
        .find(|banned| command_line.contains(banned))
}

/// First whitespace-delimited token of the trimmed line.
pub fn verb(command_line: &str) -> &str {
    command_line.split_whitespace().next().unwrap_or("")
}

#[derive(Clone, Copy)]
enum Capture {
    Eof,
    TimedOut,
    Overflow,
}

impl Executor {
    pub fn new(config: ExecConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    /// Run `command_line` through the shell in `cwd` with `env` layered over
    /// the server's own environment.
    pub async fn execute(
        &self,
        command_line: &str,
        cwd: &Path,
        env: &HashMap<String, String>,
    ) -> Result<ExecOutput, ExecError> {
        let verb = verb(command_line);

        if let Some(banned) = blocked_by(command_line) {
            info!(verb, banned, "Command blocked");
            return Ok(ExecOutput {
                output: format!("bash: {verb}: Operation not permitted in sandboxed environment\n"),
                exit_code: ExitCode::FAILURE,
                termination: Termination::Blocked,
            });
        }

        let mut cmd = Command::new(&self.config.shell);
        cmd.arg("-c")
            .arg(command_line)
            .current_dir(cwd)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(ExecError::Spawn)?;
        debug!(verb, pid = ?child.id(), cwd = %cwd.display(), "Child spawned");

        let deadline = Instant::now() + self.config.timeout;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        let capture = match (child.stdout.take(), child.stderr.take()) {
            (Some(out), Some(err)) => {
                capture_output(
                    out,
                    err,
                    &mut stdout,
                    &mut stderr,
                    deadline,
                    self.config.max_output_bytes,
                )
                .await
            }
            _ => Capture::Eof,
        };

        let status = match capture {
            Capture::Eof => match tokio::time::timeout_at(deadline, child.wait()).await {
                Ok(status) => Some(status?),
                Err(_) => {
                    terminate(&mut child).await;
                    None
                }
            },
            Capture::TimedOut | Capture::Overflow => {
                terminate(&mut child).await;
                None
            }
        };

        let stdout = String::from_utf8_lossy(&stdout).into_owned();
        let stderr = String::from_utf8_lossy(&stderr).into_owned();

        let result = match (capture, status) {
            (Capture::Overflow, _) => {
                warn!(verb, limit = self.config.max_output_bytes, "Output cap exceeded, child killed");
                failure(
                    stdout,
                    stderr,
                    "stdout maxBuffer length exceeded".to_string(),
                    ExitCode::Raw(MAXBUFFER_EXIT_CODE.to_string()),
                    Termination::OutputTooLarge,
                )
            }
            (_, None) => {
                warn!(verb, timeout = ?self.config.timeout, "Command timed out, child killed");
                failure(
                    stdout,
                    stderr,
                    format!(
                        "Command timed out after {}s: {command_line}",
                        self.config.timeout.as_secs()
                    ),
                    ExitCode::FAILURE,
                    Termination::TimedOut,
                )
            }
            (_, Some(status)) if status.success() => ExecOutput {
                output: stdout + &stderr,
                exit_code: ExitCode::SUCCESS,
                termination: Termination::Exited,
            },
            (_, Some(status)) => {
                let exit_code = status.code().map(ExitCode::Numeric).unwrap_or(ExitCode::FAILURE);
                let message = if stderr.is_empty() {
                    format!("Command failed: {command_line}")
                } else {
                    format!("Command failed: {command_line}\n{stderr}")
                };
                failure(stdout, stderr, message, exit_code, Termination::Exited)
            }
        };

        debug!(verb, exit_code = %result.exit_code, bytes = result.output.len(), "Command finished");
        Ok(result)
    }
}

/// Output for a non-zero or killed run: the first non-empty of stdout, stderr
/// or `message`, newline terminated.
fn failure(
    stdout: String,
    stderr: String,
    message: String,
    exit_code: ExitCode,
    termination: Termination,
) -> ExecOutput {
    let best = if !stdout.is_empty() {
        stdout
    } else if !stderr.is_empty() {
        stderr
    } else {
        message
    };
    ExecOutput {
        output: best + "\n",
        exit_code,
        termination,
    }
}

/// Drain both pipes until EOF, the deadline, or the combined cap is passed.
async fn capture_output<O, E>(
    mut out: O,
    mut err: E,
    stdout: &mut Vec<u8>,
    stderr: &mut Vec<u8>,
    deadline: Instant,
    max_output_bytes: usize,
) -> Capture
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut out_buf = [0u8; READ_CHUNK];
    let mut err_buf = [0u8; READ_CHUNK];
    let mut out_open = true;
    let mut err_open = true;
    let sleep = tokio::time::sleep_until(deadline);
    tokio::pin!(sleep);

    while out_open || err_open {
        tokio::select! {
            read = out.read(&mut out_buf), if out_open => match read {
                Ok(0) | Err(_) => out_open = false,
                Ok(n) => stdout.extend_from_slice(&out_buf[..n]),
            },
            read = err.read(&mut err_buf), if err_open => match read {
                Ok(0) | Err(_) => err_open = false,
                Ok(n) => stderr.extend_from_slice(&err_buf[..n]),
            },
            _ = &mut sleep => return Capture::TimedOut,
        }

        let total = stdout.len() + stderr.len();
        if total > max_output_bytes {
            let keep_stdout = stdout.len().min(max_output_bytes);
            stdout.truncate(keep_stdout);
            stderr.truncate(max_output_bytes - keep_stdout);
            return Capture::Overflow;
        }
    }
    Capture::Eof
}

/// Kill the child's whole process group, then reap it.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            debug!(pid, error = %e, "killpg failed");
        }
    }
    if let Err(e) = child.kill().await {
        debug!(error = %e, "kill after killpg");
    }
}
