//! Terminal session service.
//!
//! Thread-safe registry of PTY terminals. Interactive I/O goes through the
//! PTY; [`TerminalService::execute`] runs one-shot commands as separate
//! subprocesses so their output never mixes with the interactive stream.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use super::pty::{Terminal, TerminalInfo};
use super::TerminalError;
use crate::config::TerminalConfig;

/// Result of a one-shot command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteResult {
    pub command: String,
    /// Merged stdout and stderr in arrival order.
    pub output: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

/// Owns every live terminal.
pub struct TerminalService {
    terminals: DashMap<String, Arc<Terminal>>,
    config: TerminalConfig,
    /// Serializes the limit check with insertion.
    create_lock: Mutex<()>,
}

impl TerminalService {
    pub fn new(config: TerminalConfig) -> Self {
        Self {
            terminals: DashMap::new(),
            config,
            create_lock: Mutex::new(()),
        }
    }

    /// Spawns a shell attached to a new PTY.
    ///
    /// Unset arguments fall back to the configured defaults. A spawn failure
    /// leaves nothing registered.
    pub fn create(
        &self,
        shell: Option<&str>,
        cols: Option<u16>,
        rows: Option<u16>,
        cwd: Option<&Path>,
    ) -> Result<TerminalInfo, TerminalError> {
        let shell = shell
            .filter(|s| !s.is_empty())
            .unwrap_or(self.config.default_shell.as_str());
        let cols = cols.unwrap_or(self.config.cols);
        let rows = rows.unwrap_or(self.config.rows);
        if cols == 0 || rows == 0 {
            return Err(TerminalError::InvalidSize { cols, rows });
        }
        if let Some(dir) = cwd {
            if !dir.is_dir() {
                return Err(TerminalError::InvalidCwd(dir.display().to_string()));
            }
        }

        let _guard = self
            .create_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if self.terminals.len() >= self.config.max_terminals {
            return Err(TerminalError::LimitReached(self.config.max_terminals));
        }

        let terminal = Terminal::spawn(shell, cols, rows, cwd.map(PathBuf::from))?;
        let info = terminal.info();
        self.terminals.insert(info.id.clone(), Arc::new(terminal));

        tracing::info!(
            terminal_id = %info.id,
            pid = ?info.pid,
            cols,
            rows,
            "Created terminal"
        );
        Ok(info)
    }

    fn lookup(&self, id: &str) -> Result<Arc<Terminal>, TerminalError> {
        self.terminals
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TerminalError::NotFound(id.to_string()))
    }

    fn lookup_active(&self, id: &str) -> Result<Arc<Terminal>, TerminalError> {
        let terminal = self.lookup(id)?;
        if terminal.is_active() {
            Ok(terminal)
        } else {
            Err(TerminalError::NotFound(id.to_string()))
        }
    }

    /// Returns a terminal's current state. Exited terminals stay visible
    /// until deleted.
    pub fn get(&self, id: &str) -> Result<TerminalInfo, TerminalError> {
        Ok(self.lookup(id)?.info())
    }

    /// Lists all terminals, oldest first.
    pub fn list(&self) -> Vec<TerminalInfo> {
        let mut terminals: Vec<TerminalInfo> = self
            .terminals
            .iter()
            .map(|entry| entry.value().info())
            .collect();
        terminals.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        terminals
    }

    /// Returns the number of registered terminals.
    pub fn count(&self) -> usize {
        self.terminals.len()
    }

    /// Returns the registered terminal IDs.
    pub fn ids(&self) -> Vec<String> {
        self.terminals.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Writes raw bytes to a terminal.
    pub async fn write(&self, id: &str, data: &[u8]) -> Result<(), TerminalError> {
        self.lookup_active(id)?.write(data).await
    }

    /// Reads up to `max` bytes of PTY output. An empty result means EOF.
    ///
    /// Blocks until output arrives; meant to be called only by the
    /// terminal's reader task.
    pub async fn read(&self, id: &str, max: usize) -> Result<Vec<u8>, TerminalError> {
        self.lookup_active(id)?.read(max).await
    }

    /// Changes a terminal's window size.
    pub async fn resize(&self, id: &str, rows: u16, cols: u16) -> Result<(), TerminalError> {
        self.lookup_active(id)?.resize(rows, cols).await
    }

    /// Runs `command` through the terminal's shell as a separate process.
    ///
    /// Stdout and stderr are merged. A command running past the configured
    /// timeout is killed and reported with exit code -1.
    pub async fn execute(&self, id: &str, command: &str) -> Result<ExecuteResult, TerminalError> {
        if command.trim().is_empty() {
            return Err(TerminalError::InvalidCommand);
        }

        let terminal = self.lookup_active(id)?;
        terminal.touch();

        let result = run_command(
            terminal.shell(),
            terminal.cwd().map(PathBuf::as_path),
            command,
            self.config.execute_timeout(),
        )
        .await?;

        tracing::debug!(
            terminal_id = %id,
            exit_code = result.exit_code,
            duration_ms = result.duration_ms,
            "Executed command"
        );
        Ok(result)
    }

    /// Records that a terminal's shell exited on its own.
    ///
    /// Returns the exit code when it could be determined.
    pub async fn mark_exited(&self, id: &str) -> Result<Option<i32>, TerminalError> {
        Ok(self.lookup(id)?.mark_exited().await)
    }

    /// Waits up to `timeout` for a terminal's shell to exit.
    pub async fn wait_exit(&self, id: &str, timeout: Duration) -> Result<Option<i32>, TerminalError> {
        Ok(self.lookup(id)?.wait_exit(timeout).await)
    }

    /// Removes a terminal, closing its PTY and killing its shell.
    pub async fn delete(&self, id: &str) -> Result<(), TerminalError> {
        let (_, terminal) = self
            .terminals
            .remove(id)
            .ok_or_else(|| TerminalError::NotFound(id.to_string()))?;

        terminal.close().await;
        tracing::info!(terminal_id = %id, "Deleted terminal");
        Ok(())
    }

    /// Deletes every terminal.
    pub async fn shutdown(&self) {
        for id in self.ids() {
            if let Err(e) = self.delete(&id).await {
                tracing::debug!(terminal_id = %id, error = %e, "Terminal already gone");
            }
        }
    }
}

async fn run_command(
    shell: &str,
    cwd: Option<&Path>,
    command: &str,
    timeout: Duration,
) -> Result<ExecuteResult, TerminalError> {
    let started = Instant::now();

    let mut cmd = Command::new(shell);
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| TerminalError::ExecuteFailed(e.to_string()))?;

    let mut output = Vec::new();
    let exit_code = match tokio::time::timeout(timeout, collect_output(&mut child, &mut output)).await
    {
        Ok(Ok(status)) => status.code().unwrap_or(-1),
        Ok(Err(e)) => return Err(TerminalError::ExecuteFailed(e.to_string())),
        Err(_) => {
            let _ = child.kill().await;
            output.extend_from_slice(
                format!("\n[command timed out after {}s]\n", timeout.as_secs()).as_bytes(),
            );
            -1
        }
    };

    Ok(ExecuteResult {
        command: command.to_string(),
        output: String::from_utf8_lossy(&output).into_owned(),
        exit_code,
        duration_ms: started.elapsed().as_millis() as u64,
    })
}

/// Drains stdout and stderr into `output` in arrival order, then waits.
async fn collect_output(
    child: &mut tokio::process::Child,
    output: &mut Vec<u8>,
) -> std::io::Result<std::process::ExitStatus> {
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut out_buf = [0u8; 4096];
    let mut err_buf = [0u8; 4096];

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            n = read_pipe(&mut stdout, &mut out_buf), if stdout.is_some() => match n? {
                0 => stdout = None,
                n => output.extend_from_slice(&out_buf[..n]),
            },
            n = read_pipe(&mut stderr, &mut err_buf), if stderr.is_some() => match n? {
                0 => stderr = None,
                n => output.extend_from_slice(&err_buf[..n]),
            },
        }
    }

    child.wait().await
}

async fn read_pipe<R: AsyncRead + Unpin>(
    pipe: &mut Option<R>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match pipe {
        Some(pipe) => pipe.read(buf).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::api::TerminalStatus;
    use tempfile::TempDir;

    fn service() -> TerminalService {
        TerminalService::new(TerminalConfig {
            default_shell: "/bin/sh".to_string(),
            ..TerminalConfig::default()
        })
    }

    #[tokio::test]
    async fn test_create_defaults() {
        let service = service();
        let info = service.create(None, None, None, None).unwrap();

        assert_eq!(info.status, TerminalStatus::Active);
        assert_eq!(info.shell, "/bin/sh");
        assert_eq!((info.cols, info.rows), (80, 24));
        assert_eq!(service.count(), 1);
        assert_eq!(service.get(&info.id).unwrap().id, info.id);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_unique_ids() {
        let service = service();
        let a = service.create(None, None, None, None).unwrap();
        let b = service.create(None, None, None, None).unwrap();
        assert_ne!(a.id, b.id);

        let listed: Vec<String> = service.list().into_iter().map(|t| t.id).collect();
        assert_eq!(listed.len(), 2);
        assert!(listed.contains(&a.id) && listed.contains(&b.id));

        service.shutdown().await;
        assert_eq!(service.count(), 0);
    }

    #[tokio::test]
    async fn test_limit() {
        let service = TerminalService::new(TerminalConfig {
            default_shell: "/bin/sh".to_string(),
            max_terminals: 1,
            ..TerminalConfig::default()
        });
        service.create(None, None, None, None).unwrap();
        assert!(matches!(
            service.create(None, None, None, None),
            Err(TerminalError::LimitReached(1))
        ));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_registers_nothing() {
        let service = service();
        let result = service.create(Some("/nonexistent/shell"), None, None, None);
        assert!(matches!(result, Err(TerminalError::SpawnFailed(_))));
        assert_eq!(service.count(), 0);
    }

    #[tokio::test]
    async fn test_execute_echo_repeatedly() {
        let service = service();
        let info = service.create(None, None, None, None).unwrap();

        for _ in 0..3 {
            let result = service.execute(&info.id, "echo hello").await.unwrap();
            assert_eq!(result.exit_code, 0);
            assert!(result.output.contains("hello"));
            assert_eq!(result.command, "echo hello");
        }

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_execute_merges_stderr_and_exit_code() {
        let service = service();
        let info = service.create(None, None, None, None).unwrap();

        let result = service
            .execute(&info.id, "echo out; echo err 1>&2; exit 3")
            .await
            .unwrap();
        assert_eq!(result.exit_code, 3);
        assert!(result.output.contains("out"));
        assert!(result.output.contains("err"));

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_execute_uses_cwd() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();

        let service = service();
        let info = service
            .create(None, None, None, Some(dir.path()))
            .unwrap();
        let result = service.execute(&info.id, "ls").await.unwrap();
        assert!(result.output.contains("marker.txt"));

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_execute_timeout() {
        let service = TerminalService::new(TerminalConfig {
            default_shell: "/bin/sh".to_string(),
            execute_timeout_secs: 1,
            ..TerminalConfig::default()
        });
        let info = service.create(None, None, None, None).unwrap();

        let result = service.execute(&info.id, "sleep 30").await.unwrap();
        assert_eq!(result.exit_code, -1);
        assert!(result.output.contains("timed out"));
        assert!(result.duration_ms < 10_000);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_execute_rejects_empty_command() {
        let service = service();
        let info = service.create(None, None, None, None).unwrap();
        assert!(matches!(
            service.execute(&info.id, "  ").await,
            Err(TerminalError::InvalidCommand)
        ));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_operations_after_delete() {
        let service = service();
        let info = service.create(None, None, None, None).unwrap();

        service.delete(&info.id).await.unwrap();

        assert!(matches!(service.get(&info.id), Err(TerminalError::NotFound(_))));
        assert!(matches!(
            service.write(&info.id, b"ls\n").await,
            Err(TerminalError::NotFound(_))
        ));
        assert!(matches!(
            service.resize(&info.id, 40, 100).await,
            Err(TerminalError::NotFound(_))
        ));
        assert!(matches!(
            service.execute(&info.id, "echo hi").await,
            Err(TerminalError::NotFound(_))
        ));
        assert!(matches!(
            service.delete(&info.id).await,
            Err(TerminalError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_exited_terminal_rejects_io_but_stays_listed() {
        let service = service();
        let info = service.create(None, None, None, None).unwrap();

        service.mark_exited(&info.id).await.unwrap();

        assert_eq!(service.get(&info.id).unwrap().status, TerminalStatus::Exited);
        assert!(matches!(
            service.write(&info.id, b"ls\n").await,
            Err(TerminalError::NotFound(_))
        ));

        service.delete(&info.id).await.unwrap();
        assert_eq!(service.count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_cwd() {
        let service = service();
        let result = service.create(None, None, None, Some(Path::new("/nonexistent/dir")));
        assert!(matches!(result, Err(TerminalError::InvalidCwd(_))));
    }
}
