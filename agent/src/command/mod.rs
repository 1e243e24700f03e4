//! Command execution: validated shell commands and scripts, with
//! timeouts, process-tree kill, and a process-wide rate limit.
//!
//! Every request produces exactly one result. Validation and rate-limit
//! rejections come back as results with `exit_code = -1` and an error
//! kind; they never spawn a process or touch the filesystem.

pub mod rate_limit;
pub mod validator;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use sentinel_core::frames::{CommandResultPayload, ExecuteCommandPayload, ExecuteScriptPayload};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use self::rate_limit::TokenBucket;
use self::validator::Validator;

/// Error kinds carried in `command_result.error`.
pub mod error_kind {
    pub const TIMEOUT: &str = "timeout";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const VALIDATION_DENIED: &str = "validation_denied";
    pub const SPAWN_FAILED: &str = "spawn_failed";
    pub const UNSUPPORTED_LANGUAGE: &str = "unsupported_language";
    pub const ABORTED: &str = "aborted";
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_TIMEOUT: Duration = Duration::from_secs(3600);

/// Per-stream capture cap; anything beyond is read and discarded so the
/// child never blocks on a full pipe.
const MAX_CAPTURE: usize = 1_048_576;

/// Grace between the polite signal and the hard kill.
const TERM_GRACE: Duration = Duration::from_secs(2);

pub struct CommandEngine {
    validator: Validator,
    limiter: TokenBucket,
}

impl CommandEngine {
    pub fn new() -> Self {
        Self {
            validator: Validator::new(),
            limiter: TokenBucket::default(),
        }
    }

    #[cfg(test)]
    fn with_limiter(limiter: TokenBucket) -> Self {
        Self {
            validator: Validator::new(),
            limiter,
        }
    }

    /// Run a validated one-line command through the platform shell.
    pub async fn execute_command(
        &self,
        payload: ExecuteCommandPayload,
        shutdown: &CancellationToken,
    ) -> CommandResultPayload {
        let started = Instant::now();

        if let Err(e) = self.validator.validate_command(&payload.command) {
            debug!("Command {} denied: {e}", payload.command_id);
            return rejected(
                &payload.command_id,
                error_kind::VALIDATION_DENIED,
                e.to_string(),
                started,
            );
        }
        if !self.limiter.try_acquire() {
            return rejected(
                &payload.command_id,
                error_kind::RATE_LIMITED,
                "command rate limit exceeded".into(),
                started,
            );
        }

        let (program, args) = shell_invocation(&payload.command, payload.shell.as_deref());
        let timeout = resolve_timeout(payload.timeout_secs);
        let outcome = run_child(&program, &args, timeout, shutdown).await;
        outcome.into_result(&payload.command_id, started)
    }

    /// Run a validated script body through its interpreter via a
    /// restricted temp file.
    pub async fn execute_script(
        &self,
        payload: ExecuteScriptPayload,
        shutdown: &CancellationToken,
    ) -> CommandResultPayload {
        let started = Instant::now();

        if let Err(e) = self.validator.validate_script(&payload.body) {
            debug!("Script {} denied: {e}", payload.command_id);
            return rejected(
                &payload.command_id,
                error_kind::VALIDATION_DENIED,
                e.to_string(),
                started,
            );
        }
        if !self.limiter.try_acquire() {
            return rejected(
                &payload.command_id,
                error_kind::RATE_LIMITED,
                "command rate limit exceeded".into(),
                started,
            );
        }

        let interpreter = match script_interpreter(&payload.language) {
            Ok(interpreter) => interpreter,
            Err(message) => {
                return rejected(
                    &payload.command_id,
                    error_kind::UNSUPPORTED_LANGUAGE,
                    message,
                    started,
                );
            }
        };

        let script = match TempScript::create(interpreter.extension, &payload.body, interpreter.executable)
        {
            Ok(script) => script,
            Err(e) => {
                return rejected(
                    &payload.command_id,
                    error_kind::SPAWN_FAILED,
                    format!("failed to stage script: {e}"),
                    started,
                );
            }
        };

        let mut args = interpreter.args.clone();
        args.push(script.path.to_string_lossy().to_string());
        let timeout = resolve_timeout(payload.timeout_secs);
        let outcome = run_child(&interpreter.program, &args, timeout, shutdown).await;
        // `script` drops here, removing the temp file on every exit path.
        outcome.into_result(&payload.command_id, started)
    }
}

impl Default for CommandEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn rejected(
    command_id: &str,
    kind: &str,
    message: String,
    started: Instant,
) -> CommandResultPayload {
    CommandResultPayload {
        command_id: command_id.to_string(),
        exit_code: -1,
        stdout: String::new(),
        stderr: message,
        duration_ms: started.elapsed().as_millis() as u64,
        error: Some(kind.to_string()),
    }
}

fn resolve_timeout(timeout_secs: Option<u64>) -> Duration {
    match timeout_secs {
        Some(secs) if secs > 0 => Duration::from_secs(secs).min(MAX_TIMEOUT),
        _ => DEFAULT_TIMEOUT,
    }
}

// ── Interpreter selection ───────────────────────────────────────────

/// The shell invocation for `execute_command` on this platform.
fn shell_invocation(command: &str, shell: Option<&str>) -> (String, Vec<String>) {
    #[cfg(windows)]
    {
        if shell.is_some_and(|s| s.eq_ignore_ascii_case("powershell")) {
            (
                "powershell".to_string(),
                vec![
                    "-NoProfile".to_string(),
                    "-Command".to_string(),
                    command.to_string(),
                ],
            )
        } else {
            (
                "cmd".to_string(),
                vec!["/C".to_string(), command.to_string()],
            )
        }
    }
    #[cfg(not(windows))]
    {
        let _ = shell;
        let program = if Path::new("/bin/bash").exists() {
            "/bin/bash"
        } else if Path::new("/usr/bin/bash").exists() {
            "/usr/bin/bash"
        } else {
            "/bin/sh"
        };
        (
            program.to_string(),
            vec!["-c".to_string(), command.to_string()],
        )
    }
}

struct Interpreter {
    program: String,
    args: Vec<String>,
    extension: &'static str,
    executable: bool,
}

/// The interpreter table for `execute_script`.
fn script_interpreter(language: &str) -> Result<Interpreter, String> {
    match language.to_ascii_lowercase().as_str() {
        "powershell" => {
            if cfg!(windows) {
                Ok(Interpreter {
                    program: "powershell".into(),
                    args: vec![
                        "-NoProfile".into(),
                        "-ExecutionPolicy".into(),
                        "Bypass".into(),
                        "-File".into(),
                    ],
                    extension: "ps1",
                    executable: false,
                })
            } else {
                Err("powershell scripts are windows-only".into())
            }
        }
        "bash" => {
            if cfg!(windows) {
                Err("bash scripts are posix-only".into())
            } else {
                let program = if Path::new("/bin/bash").exists() {
                    "/bin/bash"
                } else {
                    "/bin/sh"
                };
                Ok(Interpreter {
                    program: program.into(),
                    args: vec![],
                    extension: "sh",
                    executable: true,
                })
            }
        }
        "python" => Ok(Interpreter {
            program: if cfg!(windows) { "python" } else { "python3" }.into(),
            args: vec![],
            extension: "py",
            executable: false,
        }),
        other => Err(format!("unsupported script language: {other}")),
    }
}

// ── Temp script files ───────────────────────────────────────────────

/// A staged script file, owner-only, removed on drop (all exit paths).
struct TempScript {
    path: PathBuf,
}

impl TempScript {
    fn create(extension: &str, body: &str, executable: bool) -> std::io::Result<Self> {
        let path = std::env::temp_dir().join(format!("sentinel-{}.{extension}", Uuid::new_v4()));
        std::fs::write(&path, body)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = if executable { 0o700 } else { 0o600 };
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))?;
        }
        #[cfg(not(unix))]
        let _ = executable;
        Ok(Self { path })
    }
}

impl Drop for TempScript {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove temp script {}: {e}", self.path.display());
            }
        }
    }
}

// ── Child process plumbing ──────────────────────────────────────────

struct ChildOutcome {
    exit_code: i32,
    stdout: String,
    stderr: String,
    error: Option<String>,
}

impl ChildOutcome {
    fn into_result(self, command_id: &str, started: Instant) -> CommandResultPayload {
        CommandResultPayload {
            command_id: command_id.to_string(),
            exit_code: self.exit_code,
            stdout: self.stdout,
            stderr: self.stderr,
            duration_ms: started.elapsed().as_millis() as u64,
            error: self.error,
        }
    }
}

async fn run_child(
    program: &str,
    args: &[String],
    timeout: Duration,
    shutdown: &CancellationToken,
) -> ChildOutcome {
    let mut command = std::process::Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    // Children get the agent's environment, never its descriptors; a
    // fresh process group makes the whole tree killable.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let mut child = match tokio::process::Command::from(command)
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            return ChildOutcome {
                exit_code: -1,
                stdout: String::new(),
                stderr: format!("failed to start {program}: {e}"),
                error: Some(error_kind::SPAWN_FAILED.to_string()),
            };
        }
    };

    let pid = child.id();
    let stdout_task = child
        .stdout
        .take()
        .map(|pipe| tokio::spawn(read_capped(pipe)));
    let stderr_task = child
        .stderr
        .take()
        .map(|pipe| tokio::spawn(read_capped(pipe)));

    let (exit_code, error) = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => (status.code().unwrap_or(-1), None),
            Err(e) => (-1, Some(format!("wait failed: {e}"))),
        },
        _ = tokio::time::sleep(timeout) => {
            terminate_tree(pid, &mut child).await;
            (-1, Some(error_kind::TIMEOUT.to_string()))
        }
        _ = shutdown.cancelled() => {
            terminate_tree(pid, &mut child).await;
            (-1, Some(error_kind::ABORTED.to_string()))
        }
    };

    let stdout = collect_capture(stdout_task).await;
    let stderr = collect_capture(stderr_task).await;

    ChildOutcome {
        exit_code,
        stdout,
        stderr,
        error,
    }
}

async fn collect_capture(
    task: Option<tokio::task::JoinHandle<Vec<u8>>>,
) -> String {
    match task {
        Some(task) => match task.await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => String::new(),
        },
        None => String::new(),
    }
}

/// Read up to the capture cap, then drain the remainder so the child is
/// never blocked writing to a full pipe.
async fn read_capped(pipe: impl tokio::io::AsyncRead + Unpin) -> Vec<u8> {
    let mut capped = pipe.take(MAX_CAPTURE as u64);
    let mut buf = Vec::new();
    let _ = capped.read_to_end(&mut buf).await;

    let mut rest = capped.into_inner();
    let mut scratch = [0u8; 8192];
    loop {
        match rest.read(&mut scratch).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
    buf
}

/// Polite signal to the process tree, then a hard kill after the grace
/// period.
async fn terminate_tree(pid: Option<u32>, child: &mut tokio::process::Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = pid {
            let pgid = Pid::from_raw(pid as i32);
            let _ = killpg(pgid, Signal::SIGTERM);
            if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_ok() {
                return;
            }
            let _ = killpg(pgid, Signal::SIGKILL);
            let _ = child.wait().await;
            return;
        }
    }
    #[cfg(windows)]
    {
        if let Some(pid) = pid {
            let _ = std::process::Command::new("taskkill")
                .args(["/PID", &pid.to_string(), "/T", "/F"])
                .output();
        }
    }
    let _ = child.kill().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command_payload(id: &str, command: &str, timeout_secs: Option<u64>) -> ExecuteCommandPayload {
        ExecuteCommandPayload {
            command_id: id.into(),
            command: command.into(),
            shell: None,
            timeout_secs,
        }
    }

    fn script_payload(id: &str, language: &str, body: &str, timeout_secs: Option<u64>) -> ExecuteScriptPayload {
        ExecuteScriptPayload {
            command_id: id.into(),
            language: language.into(),
            body: body.into(),
            timeout_secs,
        }
    }

    #[tokio::test]
    async fn denied_command_returns_without_spawning() {
        let engine = CommandEngine::new();
        let shutdown = CancellationToken::new();
        let started = Instant::now();
        let result = engine
            .execute_command(command_payload("c-1", "rm -rf /", None), &shutdown)
            .await;
        assert_eq!(result.exit_code, -1);
        assert_eq!(result.error.as_deref(), Some(error_kind::VALIDATION_DENIED));
        // Rejection is immediate: no process, no wait.
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn rate_limited_after_capacity() {
        let engine = CommandEngine::with_limiter(TokenBucket::new(1, 1));
        let shutdown = CancellationToken::new();
        let first = engine
            .execute_command(command_payload("c-1", "echo one", None), &shutdown)
            .await;
        assert!(first.error.is_none());
        let second = engine
            .execute_command(command_payload("c-2", "echo two", None), &shutdown)
            .await;
        assert_eq!(second.error.as_deref(), Some(error_kind::RATE_LIMITED));
        assert_eq!(second.exit_code, -1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn echo_captures_stdout() {
        let engine = CommandEngine::new();
        let shutdown = CancellationToken::new();
        let result = engine
            .execute_command(command_payload("c-1", "echo sentinel-ok", None), &shutdown)
            .await;
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.contains("sentinel-ok"));
        assert!(result.error.is_none());
        assert_eq!(result.command_id, "c-1");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_reports_exit_code_and_stderr() {
        let engine = CommandEngine::new();
        let shutdown = CancellationToken::new();
        let result = engine
            .execute_command(
                command_payload("c-2", "ls /nonexistent-sentinel-path", None),
                &shutdown,
            )
            .await;
        assert_ne!(result.exit_code, 0);
        assert!(!result.stderr.is_empty());
        assert!(result.error.is_none(), "nonzero exit is not an engine error");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn script_runs_and_temp_file_is_removed() {
        fn staged_scripts() -> std::collections::HashSet<String> {
            std::fs::read_dir(std::env::temp_dir())
                .unwrap()
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().to_string())
                .filter(|name| name.starts_with("sentinel-") && name.ends_with(".sh"))
                .collect()
        }

        let before = staged_scripts();
        let engine = CommandEngine::new();
        let shutdown = CancellationToken::new();
        let result = engine
            .execute_script(
                script_payload("s-1", "bash", "echo from-script-$((1+1))", None),
                &shutdown,
            )
            .await;
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.contains("from-script-2"));

        // Any script staged after the snapshot must disappear once its
        // run finishes; concurrently running tests converge within the
        // grace window.
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let new: Vec<String> = staged_scripts().difference(&before).cloned().collect();
            if new.is_empty() {
                break;
            }
            assert!(
                Instant::now() < deadline,
                "temp scripts not cleaned: {new:?}"
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn timeout_kills_and_reports_partial_output() {
        let engine = CommandEngine::new();
        let shutdown = CancellationToken::new();
        let started = Instant::now();
        let result = engine
            .execute_script(
                script_payload("s-2", "bash", "echo before-sleep\nsleep 30\necho after", Some(1)),
                &shutdown,
            )
            .await;
        assert_eq!(result.exit_code, -1);
        assert_eq!(result.error.as_deref(), Some(error_kind::TIMEOUT));
        assert!(result.stdout.contains("before-sleep"));
        assert!(!result.stdout.contains("after"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn oversized_script_rejected() {
        let engine = CommandEngine::new();
        let shutdown = CancellationToken::new();
        let body = "x".repeat(validator::MAX_SCRIPT_LEN + 1);
        let result = engine
            .execute_script(script_payload("s-3", "bash", &body, None), &shutdown)
            .await;
        assert_eq!(result.error.as_deref(), Some(error_kind::VALIDATION_DENIED));
    }

    #[tokio::test]
    async fn unknown_language_rejected() {
        let engine = CommandEngine::new();
        let shutdown = CancellationToken::new();
        let result = engine
            .execute_script(script_payload("s-4", "ruby", "puts 1", None), &shutdown)
            .await;
        assert_eq!(
            result.error.as_deref(),
            Some(error_kind::UNSUPPORTED_LANGUAGE)
        );
    }

    #[test]
    fn timeout_resolution_clamps() {
        assert_eq!(resolve_timeout(None), DEFAULT_TIMEOUT);
        assert_eq!(resolve_timeout(Some(0)), DEFAULT_TIMEOUT);
        assert_eq!(resolve_timeout(Some(5)), Duration::from_secs(5));
        assert_eq!(resolve_timeout(Some(1_000_000)), MAX_TIMEOUT);
    }
}
