//! Background removal service
//!
//! The segmentation model is an external tool. [`BackgroundRemovalService`]
//! is the seam the processor talks to; [`SubprocessRemover`] drives a
//! command-line tool such as `rembg i <input> <output>`.

use crate::{
    config::ServerConfig,
    error::{BgReplaceError, Result},
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, error, instrument, warn};

/// Bytes of stderr kept for diagnostics (the tail, where errors usually are)
const STDERR_TAIL_BYTES: usize = 4096;

/// How long to wait for the stderr pipe to close after the tool exits
const STDERR_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Something that turns an image into the same image with a transparent background
#[async_trait]
pub trait BackgroundRemovalService: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Read `input` and write a transparent-background PNG to `output`
    ///
    /// # Errors
    /// - `BackgroundRemovalTimeout` when the work exceeds its budget
    /// - `BackgroundRemovalFailed` for launch failures or unsuccessful exits
    async fn remove(&self, input: &Path, output: &Path) -> Result<()>;
}

/// Runs an external tool as `<program> <args..> <input> <output>`
#[derive(Debug, Clone)]
pub struct SubprocessRemover {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl SubprocessRemover {
    #[must_use]
    pub fn new<P: Into<PathBuf>>(program: P, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    #[must_use]
    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(
            config.remover_program.clone(),
            config.remover_args.clone(),
            config.removal_timeout,
        )
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn command(&self, input: &Path, output: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(input)
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            // dropping the request future (client gone) must not leave the tool running
            .kill_on_drop(true);
        // wrappers (shell scripts, venv shims, `uv run`) fork the real worker;
        // a group of its own lets the whole tree be signalled at once
        #[cfg(unix)]
        command.process_group(0);
        command
    }
}

/// Process group led by a spawned tool
///
/// Dropping it sends `SIGKILL` to every process still in the group, so
/// workers forked by the tool die with it on timeout, on completion and
/// when the request future is dropped.
#[derive(Debug)]
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self { pgid: child.id() }
    }

    fn kill(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        #[cfg(unix)]
        {
            use nix::{
                errno::Errno,
                sys::signal::{killpg, Signal},
                unistd::Pid,
            };

            let Ok(raw) = i32::try_from(pgid) else {
                return;
            };
            match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
                Ok(()) => debug!(pgid, "Killed tool process group"),
                // every member already exited
                Err(Errno::ESRCH) => {},
                Err(e) => warn!(pgid, error = %e, "Failed to kill tool process group"),
            }
        }
        #[cfg(not(unix))]
        let _ = pgid;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[async_trait]
impl BackgroundRemovalService for SubprocessRemover {
    fn name(&self) -> &str {
        self.program
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("subprocess")
    }

    #[instrument(skip(self), fields(tool = %self.program.display(), timeout_secs = self.timeout.as_secs()))]
    async fn remove(&self, input: &Path, output: &Path) -> Result<()> {
        let started = Instant::now();
        let mut child = self.command(input, output).spawn().map_err(|e| {
            BgReplaceError::removal_failed(format!(
                "failed to launch '{}': {}",
                self.program.display(),
                e
            ))
        })?;
        let pid = child.id();
        // declared after `child`, so it is dropped (and the group killed) first
        let mut group = ProcessGroup::of(&child);
        debug!(?pid, "Background removal tool started");

        let stderr_drain = child.stderr.take().map(|stderr| tokio::spawn(read_tail(stderr)));

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| {
                    BgReplaceError::removal_failed(format!("failed to wait for tool: {}", e))
                })?;
                // stray workers would otherwise keep stderr open past the tool's exit
                group.kill();
                let diagnostic = match stderr_drain {
                    Some(handle) => tokio::time::timeout(STDERR_DRAIN_GRACE, handle)
                        .await
                        .ok()
                        .and_then(std::result::Result::ok)
                        .unwrap_or_default(),
                    None => String::new(),
                };

                if status.success() {
                    debug!(
                        ?pid,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Background removal tool finished"
                    );
                    Ok(())
                } else {
                    Err(BgReplaceError::removal_failed(format!(
                        "'{}' exited with {}: {}",
                        self.program.display(),
                        status,
                        diagnostic.trim()
                    )))
                }
            }
            () = tokio::time::sleep(self.timeout) => {
                warn!(?pid, "Background removal tool timed out, killing it");
                group.kill();
                // kill() also reaps the child, so no zombie is left behind
                if let Err(e) = child.kill().await {
                    error!(?pid, error = %e, "Failed to kill background removal tool");
                }
                if let Some(handle) = stderr_drain {
                    handle.abort();
                }
                Err(BgReplaceError::BackgroundRemovalTimeout(self.timeout))
            }
        }
    }
}

/// Read a stream to EOF, keeping only the last `STDERR_TAIL_BYTES`
async fn read_tail<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut tail: Vec<u8> = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(buf.get(..n).unwrap_or_default());
                if tail.len() > STDERR_TAIL_BYTES {
                    let excess = tail.len() - STDERR_TAIL_BYTES;
                    tail.drain(..excess);
                }
            },
        }
    }
    String::from_utf8_lossy(&tail).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn script(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("tool.sh");
        std::fs::write(&path, body).unwrap();
        path
    }

    fn sh_remover(script: &Path, timeout: Duration) -> SubprocessRemover {
        SubprocessRemover::new(
            "/bin/sh",
            vec![script.to_string_lossy().into_owned()],
            timeout,
        )
    }

    #[tokio::test]
    async fn test_successful_tool_writes_output() {
        let dir = TempDir::new().unwrap();
        let tool = script(&dir, "cp \"$1\" \"$2\"\n");
        let input = dir.path().join("in.png");
        let output = dir.path().join("out.png");
        std::fs::write(&input, b"pixels").unwrap();

        sh_remover(&tool, Duration::from_secs(5))
            .remove(&input, &output)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), b"pixels");
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_stderr() {
        let dir = TempDir::new().unwrap();
        let tool = script(&dir, "echo 'model file missing' >&2\nexit 3\n");

        let err = sh_remover(&tool, Duration::from_secs(5))
            .remove(&dir.path().join("in.png"), &dir.path().join("out.png"))
            .await
            .unwrap_err();

        match &err {
            BgReplaceError::BackgroundRemovalFailed(detail) => {
                assert!(detail.contains("model file missing"), "{detail}");
            },
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.public_message(), "Background removal failed");
    }

    #[tokio::test]
    async fn test_launch_failure() {
        let dir = TempDir::new().unwrap();
        let remover = SubprocessRemover::new(
            dir.path().join("does-not-exist"),
            vec![],
            Duration::from_secs(1),
        );
        let err = remover
            .remove(&dir.path().join("in.png"), &dir.path().join("out.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, BgReplaceError::BackgroundRemovalFailed(_)));
    }

    #[tokio::test]
    async fn test_timeout_kills_tool() {
        let dir = TempDir::new().unwrap();
        let pid_file = dir.path().join("pid");
        // exec keeps the pid, so the recorded pid is the process we kill
        let tool = script(&dir, &format!("echo $$ > '{}'\nexec sleep 30\n", pid_file.display()));

        let started = Instant::now();
        let err = sh_remover(&tool, Duration::from_millis(300))
            .remove(&dir.path().join("in.png"), &dir.path().join("out.png"))
            .await
            .unwrap_err();

        assert!(matches!(err, BgReplaceError::BackgroundRemovalTimeout(_)));
        assert!(started.elapsed() < Duration::from_secs(10));

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        let proc_entry = PathBuf::from(format!("/proc/{}", pid.trim()));
        assert!(!proc_entry.exists(), "tool process still present");
    }

    /// Whether the process recorded in `pid_file` is still alive (zombies count as gone)
    #[cfg(target_os = "linux")]
    async fn still_running(pid_file: &Path) -> bool {
        let pid = std::fs::read_to_string(pid_file).unwrap();
        let stat = PathBuf::from(format!("/proc/{}/stat", pid.trim()));
        for _ in 0..40 {
            let alive = std::fs::read_to_string(&stat)
                .ok()
                .and_then(|line| {
                    let state = line.get(line.rfind(')')? + 1..)?.trim_start().chars().next()?;
                    Some(!matches!(state, 'Z' | 'X'))
                })
                .unwrap_or(false);
            if !alive {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_kills_forked_worker() {
        let dir = TempDir::new().unwrap();
        let pid_file = dir.path().join("worker.pid");
        // no exec: the shell stays the direct child and the worker is its child
        let tool = script(
            &dir,
            &format!("sleep 30 &\necho $! > '{}'\nwait\n", pid_file.display()),
        );

        let err = sh_remover(&tool, Duration::from_millis(500))
            .remove(&dir.path().join("in.png"), &dir.path().join("out.png"))
            .await
            .unwrap_err();

        assert!(matches!(err, BgReplaceError::BackgroundRemovalTimeout(_)));
        assert!(!still_running(&pid_file).await, "worker outlived the timeout");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_dropped_call_kills_forked_worker() {
        let dir = TempDir::new().unwrap();
        let pid_file = dir.path().join("worker.pid");
        let tool = script(
            &dir,
            &format!("sleep 30 &\necho $! > '{}'\nwait\n", pid_file.display()),
        );
        let remover = sh_remover(&tool, Duration::from_secs(30));
        let input = dir.path().join("in.png");
        let output = dir.path().join("out.png");

        // the caller gives up, as when the client disconnects
        let outcome =
            tokio::time::timeout(Duration::from_millis(500), remover.remove(&input, &output)).await;
        assert!(outcome.is_err());

        assert!(pid_file.exists());
        assert!(!still_running(&pid_file).await, "worker outlived the dropped call");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_worker_left_running_after_exit_is_killed() {
        let dir = TempDir::new().unwrap();
        let pid_file = dir.path().join("worker.pid");
        let tool = script(
            &dir,
            &format!(
                "sleep 30 &\necho $! > '{}'\ncp \"$1\" \"$2\"\n",
                pid_file.display()
            ),
        );
        let input = dir.path().join("in.png");
        std::fs::write(&input, b"x").unwrap();

        let started = Instant::now();
        sh_remover(&tool, Duration::from_secs(10))
            .remove(&input, &dir.path().join("out.png"))
            .await
            .unwrap();

        // the stray worker holds stderr open; it must not stall the call
        assert!(started.elapsed() < STDERR_DRAIN_GRACE);
        assert!(!still_running(&pid_file).await, "stray worker left running");
    }

    #[tokio::test]
    async fn test_chatty_tool_does_not_block_on_stderr() {
        let dir = TempDir::new().unwrap();
        // ~200 KiB of stderr, far beyond a pipe buffer
        let tool = script(
            &dir,
            "i=0\nwhile [ $i -lt 4000 ]; do echo 'progress progress progress progress progress' >&2; i=$((i+1)); done\ncp \"$1\" \"$2\"\n",
        );
        let input = dir.path().join("in.png");
        std::fs::write(&input, b"x").unwrap();

        sh_remover(&tool, Duration::from_secs(20))
            .remove(&input, &dir.path().join("out.png"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_read_tail_keeps_last_bytes() {
        let data = vec![b'a'; STDERR_TAIL_BYTES * 2]
            .into_iter()
            .chain(b"END".iter().copied())
            .collect::<Vec<u8>>();
        let tail = read_tail(std::io::Cursor::new(data)).await;
        assert_eq!(tail.len(), STDERR_TAIL_BYTES);
        assert!(tail.ends_with("END"));
    }

    #[test]
    fn test_name_from_program() {
        let remover = SubprocessRemover::new("/usr/local/bin/rembg", vec![], Duration::from_secs(1));
        assert_eq!(remover.name(), "rembg");
        assert_eq!(remover.timeout(), Duration::from_secs(1));
    }
}
