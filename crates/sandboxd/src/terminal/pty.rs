//! PTY-backed terminal.
//!
//! A [`Terminal`] owns one pseudo-terminal and the shell attached to it.
//! I/O goes through a non-blocking duplicate of the PTY master registered
//! with the runtime, so closing the terminal also ends a pending read.

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{getsid, Pid};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use protocol::api::TerminalStatus;
use tokio::io::unix::AsyncFd;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::TerminalError;

/// How long to wait for a dead shell to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_millis(500);
const REAP_POLL: Duration = Duration::from_millis(10);

/// How long the session gets to exit after SIGHUP before SIGKILL.
const HANGUP_GRACE: Duration = Duration::from_millis(200);

/// Snapshot of a terminal's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalInfo {
    pub id: String,
    pub status: TerminalStatus,
    pub shell: String,
    pub pid: Option<u32>,
    pub cols: u16,
    pub rows: u16,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Meta {
    status: TerminalStatus,
    cols: u16,
    rows: u16,
    updated_at: DateTime<Utc>,
}

type PtyIo = Arc<AsyncFd<File>>;

/// A shell process attached to a pseudo-terminal.
pub struct Terminal {
    id: String,
    shell: String,
    cwd: Option<PathBuf>,
    pid: Option<u32>,
    created_at: DateTime<Utc>,

    /// `None` once the PTY has been released.
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    io: std::sync::Mutex<Option<PtyIo>>,
    write_lock: Mutex<()>,
    closed: CancellationToken,
    child: Mutex<Box<dyn Child + Send + Sync>>,

    active: AtomicBool,
    meta: std::sync::Mutex<Meta>,
}

impl Terminal {
    /// Spawns `shell` attached to a new PTY of the given size.
    ///
    /// Returns as soon as the process exists; nothing is read from it.
    /// Must be called from within a Tokio runtime.
    pub fn spawn(
        shell: &str,
        cols: u16,
        rows: u16,
        cwd: Option<PathBuf>,
    ) -> Result<Self, TerminalError> {
        let id = Uuid::new_v4().to_string();

        let pair = native_pty_system()
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TerminalError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(shell);
        cmd.env("TERM", "xterm-256color");
        if let Some(ref dir) = cwd {
            cmd.cwd(dir);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TerminalError::SpawnFailed(e.to_string()))?;
        // Our copy of the slave must go so the master sees EOF when the shell exits.
        drop(pair.slave);

        let pid = child.process_id();

        let io = match MasterPty::as_raw_fd(pair.master.as_ref()).map(nonblocking_dup) {
            Some(Ok(io)) => io,
            Some(Err(e)) => {
                let _ = child.kill();
                return Err(TerminalError::SpawnFailed(e.to_string()));
            }
            None => {
                let _ = child.kill();
                return Err(TerminalError::SpawnFailed(
                    "PTY master has no file descriptor".to_string(),
                ));
            }
        };

        let now = Utc::now();
        tracing::info!(terminal_id = %id, shell, pid = ?pid, "Spawned terminal");

        Ok(Self {
            id,
            shell: shell.to_string(),
            cwd,
            pid,
            created_at: now,
            master: Mutex::new(Some(pair.master)),
            io: std::sync::Mutex::new(Some(Arc::new(io))),
            write_lock: Mutex::new(()),
            closed: CancellationToken::new(),
            child: Mutex::new(child),
            active: AtomicBool::new(true),
            meta: std::sync::Mutex::new(Meta {
                status: TerminalStatus::Active,
                cols,
                rows,
                updated_at: now,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    pub fn cwd(&self) -> Option<&PathBuf> {
        self.cwd.as_ref()
    }

    /// Returns whether the terminal still accepts I/O.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn meta(&self) -> std::sync::MutexGuard<'_, Meta> {
        self.meta.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn io(&self) -> Option<PtyIo> {
        self.io
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn ensure_active(&self) -> Result<(), TerminalError> {
        if self.is_active() {
            Ok(())
        } else {
            Err(TerminalError::NotFound(self.id.clone()))
        }
    }

    /// Bumps `updated_at`.
    pub fn touch(&self) {
        self.meta().updated_at = Utc::now();
    }

    /// Returns a snapshot of the terminal.
    pub fn info(&self) -> TerminalInfo {
        let meta = self.meta();
        TerminalInfo {
            id: self.id.clone(),
            status: meta.status,
            shell: self.shell.clone(),
            pid: self.pid,
            cols: meta.cols,
            rows: meta.rows,
            created_at: self.created_at,
            updated_at: meta.updated_at,
        }
    }

    /// Writes raw bytes to the shell's input.
    pub async fn write(&self, data: &[u8]) -> Result<(), TerminalError> {
        self.ensure_active()?;
        let io = self
            .io()
            .ok_or_else(|| TerminalError::NotFound(self.id.clone()))?;

        {
            let _serial = self.write_lock.lock().await;
            let mut written = 0;
            while written < data.len() {
                let mut guard = tokio::select! {
                    biased;
                    _ = self.closed.cancelled() => {
                        return Err(TerminalError::NotFound(self.id.clone()));
                    }
                    ready = io.writable() => {
                        ready.map_err(|e| TerminalError::WriteFailed(e.to_string()))?
                    }
                };
                match guard.try_io(|inner| inner.get_ref().write(&data[written..])) {
                    Ok(Ok(0)) => {
                        return Err(TerminalError::WriteFailed("PTY closed".to_string()));
                    }
                    Ok(Ok(n)) => written += n,
                    Ok(Err(e)) if e.kind() == ErrorKind::Interrupted => {}
                    Ok(Err(e)) => return Err(TerminalError::WriteFailed(e.to_string())),
                    Err(_would_block) => {}
                }
            }
        }

        self.touch();
        Ok(())
    }

    /// Reads up to `max` bytes of output, waiting until data or EOF.
    ///
    /// An empty buffer means EOF. A closed terminal reads as EOF, including
    /// a read that was already waiting when it closed.
    pub async fn read(&self, max: usize) -> Result<Vec<u8>, TerminalError> {
        let Some(io) = self.io() else {
            return Ok(Vec::new());
        };
        let mut buffer = vec![0u8; max.max(1)];

        loop {
            let mut guard = tokio::select! {
                biased;
                _ = self.closed.cancelled() => return Ok(Vec::new()),
                ready = io.readable() => {
                    ready.map_err(|e| TerminalError::ReadFailed(e.to_string()))?
                }
            };
            match guard.try_io(|inner| inner.get_ref().read(&mut buffer)) {
                Ok(Ok(n)) => {
                    buffer.truncate(n);
                    return Ok(buffer);
                }
                // Linux reports a hung-up slave as EIO rather than EOF.
                Ok(Err(e)) if e.raw_os_error() == Some(Errno::EIO as i32) => {
                    return Ok(Vec::new());
                }
                Ok(Err(e)) if e.kind() == ErrorKind::Interrupted => {}
                Ok(Err(e)) => return Err(TerminalError::ReadFailed(e.to_string())),
                Err(_would_block) => {}
            }
        }
    }

    /// Propagates a window-size change to the PTY.
    pub async fn resize(&self, rows: u16, cols: u16) -> Result<(), TerminalError> {
        if rows == 0 || cols == 0 {
            return Err(TerminalError::InvalidSize { cols, rows });
        }
        self.ensure_active()?;

        let master = self.master.lock().await;
        let master = master
            .as_ref()
            .ok_or_else(|| TerminalError::NotFound(self.id.clone()))?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TerminalError::ResizeFailed(e.to_string()))?;

        let mut meta = self.meta();
        meta.cols = cols;
        meta.rows = rows;
        meta.updated_at = Utc::now();

        tracing::debug!(terminal_id = %self.id, cols, rows, "Resized terminal");
        Ok(())
    }

    /// Checks whether the shell has exited without blocking.
    pub async fn try_exit_code(&self) -> Option<i32> {
        let mut child = self.child.lock().await;
        match child.try_wait() {
            Ok(Some(status)) => Some(status.exit_code() as i32),
            _ => None,
        }
    }

    /// Polls for the shell's exit for up to `timeout`.
    pub async fn wait_exit(&self, timeout: Duration) -> Option<i32> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(code) = self.try_exit_code().await {
                return Some(code);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(REAP_POLL).await;
        }
    }

    /// Stops all I/O and closes every descriptor this terminal holds on the
    /// PTY master. Pending reads and writes return immediately.
    async fn release_pty(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.closed.cancel();
        self.io
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        self.master.lock().await.take();
    }

    /// Records that the shell exited on its own and releases the PTY.
    ///
    /// Returns the exit code if the process could be reaped.
    pub async fn mark_exited(&self) -> Option<i32> {
        self.release_pty().await;
        {
            let mut meta = self.meta();
            meta.status = TerminalStatus::Exited;
            meta.updated_at = Utc::now();
        }

        let code = self.wait_exit(REAP_TIMEOUT).await;
        tracing::info!(terminal_id = %self.id, exit_code = ?code, "Terminal exited");
        code
    }

    /// Closes the PTY, then terminates the shell and everything it started.
    ///
    /// The whole session gets SIGHUP, and SIGKILL if anything in it is still
    /// alive after a short grace period. Tolerates a shell that has already
    /// exited.
    pub async fn close(&self) -> Option<i32> {
        self.release_pty().await;
        self.meta().status = TerminalStatus::Exited;

        let Some(sid) = self.session_id() else {
            if let Err(e) = self.child.lock().await.kill() {
                tracing::debug!(terminal_id = %self.id, error = %e, "Kill failed, shell likely gone");
            }
            return self.wait_exit(REAP_TIMEOUT).await;
        };

        let exited = self.try_exit_code().await;
        signal_session(sid, Signal::SIGHUP, exited.is_none());

        let code = match exited {
            Some(code) => Some(code),
            None => self.wait_exit(HANGUP_GRACE).await,
        };
        if code.is_none() || !session_members(sid).is_empty() {
            tokio::time::sleep(REAP_POLL).await;
            signal_session(sid, Signal::SIGKILL, code.is_none());
        }

        let code = match code {
            Some(code) => Some(code),
            None => self.wait_exit(REAP_TIMEOUT).await,
        };
        tracing::info!(terminal_id = %self.id, exit_code = ?code, "Terminal closed");
        code
    }

    /// The shell leads its own session, so its pid is the session id.
    fn session_id(&self) -> Option<Pid> {
        self.pid
            .and_then(|pid| i32::try_from(pid).ok())
            .filter(|pid| *pid > 0)
            .map(Pid::from_raw)
    }
}

/// Duplicates the PTY master and registers the copy with the runtime.
fn nonblocking_dup(fd: std::os::fd::RawFd) -> std::io::Result<AsyncFd<File>> {
    // SAFETY: `fd` belongs to the master held by the caller for this whole call.
    let owned: OwnedFd = unsafe { BorrowedFd::borrow_raw(fd) }.try_clone_to_owned()?;

    let flags = fcntl(owned.as_raw_fd(), FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_retain(flags) | OFlag::O_NONBLOCK;
    fcntl(owned.as_raw_fd(), FcntlArg::F_SETFL(flags))?;

    AsyncFd::new(File::from(owned))
}

/// Processes other than the leader that belong to session `sid`.
///
/// Background jobs run in their own process groups, so a group signal to the
/// shell does not reach them. Empty where `/proc` is unavailable.
fn session_members(sid: Pid) -> Vec<Pid> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
        .map(Pid::from_raw)
        .filter(|pid| *pid != sid && getsid(Some(*pid)) == Ok(sid))
        .collect()
}

/// Sends `signal` to every process in session `sid`.
///
/// The leader's group is only signalled while the leader is unreaped, so a
/// recycled pid is never hit.
fn signal_session(sid: Pid, signal: Signal, leader_alive: bool) {
    if leader_alive {
        match killpg(sid, signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => tracing::debug!(sid = %sid, ?signal, error = %e, "Group signal failed"),
        }
    }
    for pid in session_members(sid) {
        match kill(pid, signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => tracing::debug!(pid = %pid, ?signal, error = %e, "Signal failed"),
        }
    }
}

impl std::fmt::Debug for Terminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Terminal")
            .field("id", &self.id)
            .field("shell", &self.shell)
            .field("pid", &self.pid)
            .field("active", &self.is_active())
            .finish()
    }
}
