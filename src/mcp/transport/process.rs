use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use super::pending::PendingRequests;
use super::Transport;
use crate::error::McpError;
use crate::mcp::protocol::{parse_response, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// Commands that are shell shims (`.cmd`/`.ps1`) rather than executables on Windows.
const PACKAGE_RUNNERS: &[&str] = &["npx", "npm", "pnpm", "yarn", "bunx"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Unix,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Unix
        }
    }
}

/// A concrete program and argument vector ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

/// Turns a configured command line into something the host can execute.
///
/// A command with embedded spaces is split into program plus leading
/// arguments. On Windows, package runners are resolved by PowerShell since
/// they are not directly executable there.
pub fn resolve_invocation(command: &str, args: &[String], platform: Platform) -> Invocation {
    let mut parts = command.split_whitespace().map(str::to_string);
    let program = parts.next().unwrap_or_default();
    let mut all_args: Vec<String> = parts.collect();
    all_args.extend(args.iter().cloned());

    let needs_shell = platform == Platform::Windows
        && PACKAGE_RUNNERS
            .iter()
            .any(|runner| program.eq_ignore_ascii_case(runner));

    if !needs_shell {
        return Invocation {
            program,
            args: all_args,
        };
    }

    let command_line = std::iter::once(program.as_str())
        .chain(all_args.iter().map(String::as_str))
        .map(quote_for_powershell)
        .collect::<Vec<_>>()
        .join(" ");

    Invocation {
        program: "powershell.exe".to_string(),
        args: vec!["-Command".to_string(), command_line],
    }
}

fn quote_for_powershell(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains(|c: char| c.is_whitespace() || "'\"`$;&|".contains(c)) {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', "''"))
}

struct RunningProcess {
    child: Child,
    stdin: ChildStdin,
}

/// Spawns the server as a child process and speaks newline-delimited
/// JSON-RPC over its stdin/stdout.
pub struct ProcessTransport {
    server_id: String,
    invocation: Invocation,
    cwd: Option<String>,
    env: HashMap<String, String>,
    process: Mutex<Option<RunningProcess>>,
    pending: Arc<PendingRequests>,
    tasks: SyncMutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ProcessTransport {
    pub fn new(
        server_id: String,
        invocation: Invocation,
        cwd: Option<String>,
        env: HashMap<String, String>,
    ) -> Self {
        Self {
            server_id,
            invocation,
            cwd,
            env,
            process: Mutex::new(None),
            pending: PendingRequests::new(),
            tasks: SyncMutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn spawn_stdout_reader(&self, stdout: ChildStdout) -> JoinHandle<()> {
        let pending = Arc::clone(&self.pending);
        let server_id = self.server_id.clone();
        tokio::spawn(async move {
            let mut lines = LinesStream::new(BufReader::new(stdout).lines());
            let reason = loop {
                match lines.next().await {
                    Some(Ok(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match parse_response(trimmed) {
                            Some(response) => {
                                debug!(server = %server_id, "Stdio received: {}", trimmed);
                                pending.resolve(response);
                            }
                            None => debug!(server = %server_id, "Stdio ignored: {}", trimmed),
                        }
                    }
                    Some(Err(e)) => break format!("failed reading server output: {}", e),
                    None => break "server closed stdout unexpectedly".to_string(),
                }
            };
            debug!(server = %server_id, "Stdout reader stopped: {}", reason);
            pending.fail_all(reason);
        })
    }

    fn spawn_stderr_drain(&self, stderr: ChildStderr) -> JoinHandle<()> {
        let server_id = self.server_id.clone();
        tokio::spawn(async move {
            let mut lines = LinesStream::new(BufReader::new(stderr).lines());
            while let Some(Ok(line)) = lines.next().await {
                debug!(server = %server_id, "stderr: {}", line);
            }
        })
    }

    async fn write_line(&self, payload: String) -> Result<(), McpError> {
        let mut guard = self.process.lock().await;
        let process = guard.as_mut().ok_or(McpError::SessionClosed)?;

        let written = async {
            process.stdin.write_all(payload.as_bytes()).await?;
            process.stdin.write_all(b"\n").await?;
            process.stdin.flush().await
        }
        .await;

        written.map_err(|e| {
            let reason = format!("failed writing to server stdin: {}", e);
            self.pending.fail_all(reason.clone());
            McpError::Transport(reason)
        })
    }

    /// Env overrides are applied verbatim; an empty value blanks the variable.
    fn command(&self) -> Command {
        let mut command = Command::new(&self.invocation.program);
        command
            .args(&self.invocation.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        command
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    async fn open(&self) -> Result<(), McpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::SessionClosed);
        }
        let mut guard = self.process.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        info!(
            server = %self.server_id,
            "Starting MCP server process: {} {:?}",
            self.invocation.program, self.invocation.args
        );

        let mut command = self.command();

        let mut child = command.spawn().map_err(|e| {
            McpError::Transport(format!(
                "failed to spawn '{}': {}",
                self.invocation.program, e
            ))
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (Some(stdin), Some(stdout), Some(stderr)) = (stdin, stdout, stderr) else {
            let _ = child.start_kill();
            return Err(McpError::Transport("failed to capture child stdio".into()));
        };

        let mut tasks = vec![self.spawn_stdout_reader(stdout), self.spawn_stderr_drain(stderr)];
        self.tasks.lock().append(&mut tasks);
        *guard = Some(RunningProcess { child, stdin });
        Ok(())
    }

    async fn send(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, McpError> {
        let payload = serde_json::to_string(&request)
            .map_err(|e| McpError::Protocol(e.to_string()))?;
        let waiter = self.pending.register(request.id)?;
        debug!(server = %self.server_id, "Stdio sending: {}", payload);
        self.write_line(payload).await?;
        waiter.wait().await
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), McpError> {
        let payload = serde_json::to_string(&notification)
            .map_err(|e| McpError::Protocol(e.to_string()))?;
        debug!(server = %self.server_id, "Stdio notifying: {}", payload);
        self.write_line(payload).await
    }

    async fn close(&self) -> Result<(), McpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pending.fail_all("transport closed");
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let Some(mut process) = self.process.lock().await.take() else {
            return Ok(());
        };
        drop(process.stdin);

        match process.child.try_wait() {
            Ok(Some(status)) => {
                debug!(server = %self.server_id, "Server process already exited: {}", status);
                Ok(())
            }
            _ => {
                info!(server = %self.server_id, "Killing MCP server process");
                process.child.kill().await.map_err(|e| {
                    warn!(server = %self.server_id, "Failed to kill server process: {}", e);
                    McpError::Transport(e.to_string())
                })
            }
        }
    }

    fn is_terminated(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.pending.failure().is_some()
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn plain_command_passes_through() {
        let invocation = resolve_invocation("echo-server", &args(&["--port", "0"]), Platform::Unix);
        assert_eq!(
            invocation,
            Invocation {
                program: "echo-server".into(),
                args: args(&["--port", "0"]),
            }
        );
    }

    #[test]
    fn command_with_spaces_is_split() {
        let invocation =
            resolve_invocation("uvx mcp-server-git", &args(&["--repo", "."]), Platform::Unix);
        assert_eq!(invocation.program, "uvx");
        assert_eq!(invocation.args, args(&["mcp-server-git", "--repo", "."]));
    }

    #[test]
    fn package_runner_is_direct_on_unix() {
        let invocation = resolve_invocation("npx", &args(&["-y", "server-fs"]), Platform::Unix);
        assert_eq!(invocation.program, "npx");
    }

    #[test]
    fn package_runner_goes_through_powershell_on_windows() {
        let invocation = resolve_invocation(
            "npx",
            &args(&["-y", "@scope/server-fs", "C:\\My Docs"]),
            Platform::Windows,
        );
        assert_eq!(invocation.program, "powershell.exe");
        assert_eq!(
            invocation.args,
            args(&["-Command", "npx -y @scope/server-fs 'C:\\My Docs'"])
        );
    }

    #[test]
    fn runner_embedded_in_command_is_resolved_on_windows() {
        let invocation = resolve_invocation("npx -y server-memory", &[], Platform::Windows);
        assert_eq!(
            invocation.args,
            args(&["-Command", "npx -y server-memory"])
        );
    }

    #[test]
    fn regular_executable_untouched_on_windows() {
        let invocation = resolve_invocation("python", &args(&["server.py"]), Platform::Windows);
        assert_eq!(invocation.program, "python");
        assert_eq!(invocation.args, args(&["server.py"]));
    }

    #[test]
    fn empty_env_values_are_passed_through() {
        let env = HashMap::from([
            ("BLANKED".to_string(), String::new()),
            ("TOKEN".to_string(), "abc".to_string()),
        ]);
        let transport = ProcessTransport::new(
            "env".into(),
            Invocation {
                program: "echo-server".into(),
                args: Vec::new(),
            },
            None,
            env,
        );

        let command = transport.command();
        let envs: HashMap<&OsStr, Option<&OsStr>> = command.as_std().get_envs().collect();
        assert_eq!(envs.get(OsStr::new("BLANKED")), Some(&Some(OsStr::new(""))));
        assert_eq!(envs.get(OsStr::new("TOKEN")), Some(&Some(OsStr::new("abc"))));
    }

    #[tokio::test]
    async fn spawn_failure_is_a_transport_error() {
        let transport = ProcessTransport::new(
            "missing".into(),
            Invocation {
                program: "definitely-not-a-real-binary-4d1f".into(),
                args: Vec::new(),
            },
            None,
            HashMap::new(),
        );
        assert!(matches!(transport.open().await, Err(McpError::Transport(_))));
        assert!(transport.close().await.is_ok());
        assert!(transport.is_terminated());
    }
}
