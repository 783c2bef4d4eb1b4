use crate::error::{HostplaneError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

/// One-shot shell invocation
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub command: String,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
    /// Run as this account instead of the daemon's own
    pub user: Option<String>,
    /// Captured output beyond this is cut from the front
    pub max_output_bytes: usize,
}

/// Result of a one-shot command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub output: String,
    pub timed_out: bool,
    pub duration_ms: u64,
}

/// Runs install, build, custom and provisioning commands
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutcome>;
}

/// Runs commands through `/bin/sh -c` in their own process group
#[derive(Debug, Default, Clone)]
pub struct ShellRunner;

impl ShellRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessRunner for ShellRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutcome> {
        let started = Instant::now();

        let mut command = Command::new("/bin/sh");
        command
            .arg("-c")
            .arg(&spec.command)
            .current_dir(&spec.cwd)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            command.process_group(0);
            if let Some(ref user) = spec.user {
                let (uid, gid) = lookup_user(user)?;
                command.uid(uid).gid(gid);
            }
        }

        let mut child = command.spawn().map_err(|e| {
            HostplaneError::Supervisor(
                spec.command.clone(),
                format!("Failed to spawn command: {}", e),
            )
        })?;
        let pid = child.id();

        let deadline = tokio::time::Instant::now() + spec.timeout;
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let mut output = TailBuffer::new(spec.max_output_bytes);
        let mut out_chunk = [0u8; 4096];
        let mut err_chunk = [0u8; 4096];
        let mut status = None;

        // The deadline covers the shell and anything still holding its pipes
        let timed_out = loop {
            if status.is_some() && stdout.is_none() && stderr.is_none() {
                break false;
            }

            tokio::select! {
                waited = child.wait(), if status.is_none() => {
                    let exited = waited.map_err(|e| {
                        HostplaneError::Supervisor(
                            spec.command.clone(),
                            format!("Wait failed: {}", e),
                        )
                    })?;
                    status = Some(exited);
                    // Background children left behind by the shell
                    kill_group(pid);
                }
                read = read_chunk(&mut stdout, &mut out_chunk), if stdout.is_some() => match read {
                    Ok(n) if n > 0 => output.push(&out_chunk[..n]),
                    _ => stdout = None,
                },
                read = read_chunk(&mut stderr, &mut err_chunk), if stderr.is_some() => match read {
                    Ok(n) if n > 0 => output.push(&err_chunk[..n]),
                    _ => stderr = None,
                },
                _ = tokio::time::sleep_until(deadline) => break true,
            }
        };

        if timed_out {
            tracing::warn!(
                "Command '{}' did not finish within {:?}, killing it",
                spec.command,
                spec.timeout
            );
            kill_group(pid);
            if status.is_none() {
                let _ = child.wait().await;
            }
        }

        let mut output = truncate_front(output.into_inner(), spec.max_output_bytes);
        if timed_out {
            output.push_str(&format!(
                "\ncommand timed out after {}s",
                spec.timeout.as_secs()
            ));
        }

        let exit_code = if timed_out {
            None
        } else {
            status.and_then(|s| s.code())
        };

        Ok(CommandOutcome {
            success: !timed_out && exit_code == Some(0),
            exit_code,
            output,
            timed_out,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

async fn read_chunk<R: AsyncRead + Unpin>(
    reader: &mut Option<R>,
    chunk: &mut [u8],
) -> std::io::Result<usize> {
    match reader {
        Some(reader) => reader.read(chunk).await,
        None => Ok(0),
    }
}

/// Keeps the most recent output, at most twice `max` bytes at any time
struct TailBuffer {
    bytes: Vec<u8>,
    max: usize,
}

impl TailBuffer {
    fn new(max: usize) -> Self {
        Self {
            bytes: Vec::new(),
            max,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
        if self.bytes.len() > self.max.saturating_mul(2) {
            let excess = self.bytes.len() - self.max;
            self.bytes.drain(..excess);
        }
    }

    fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

fn truncate_front(bytes: Vec<u8>, max: usize) -> String {
    let text = String::from_utf8_lossy(&bytes);
    if text.len() <= max {
        return text.into_owned();
    }
    let mut cut = text.len() - max;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    text[cut..].to_string()
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = pid {
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            tracing::debug!("killpg({}) failed: {}", pid, e);
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

/// Resolve an account name to uid/gid
#[cfg(unix)]
pub fn lookup_user(name: &str) -> Result<(u32, u32)> {
    use nix::unistd::User;

    let user = User::from_name(name)
        .map_err(|e| HostplaneError::Internal(format!("Failed to look up user {}: {}", name, e)))?
        .ok_or_else(|| HostplaneError::Validation(format!("Unknown system user: {}", name)))?;

    Ok((user.uid.as_raw(), user.gid.as_raw()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn spec(dir: &TempDir, command: &str) -> CommandSpec {
        CommandSpec {
            command: command.to_string(),
            cwd: dir.path().to_path_buf(),
            env: BTreeMap::new(),
            timeout: Duration::from_secs(5),
            user: None,
            max_output_bytes: 1024,
        }
    }

    #[tokio::test]
    async fn test_successful_command() {
        let dir = TempDir::new().unwrap();
        let outcome = ShellRunner::new()
            .run(&spec(&dir, "echo hello"))
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.output.trim(), "hello");
    }

    #[tokio::test]
    async fn test_failing_command_is_an_outcome() {
        let dir = TempDir::new().unwrap();
        let outcome = ShellRunner::new()
            .run(&spec(&dir, "echo broken >&2; exit 3"))
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, Some(3));
        assert!(outcome.output.contains("broken"));
    }

    #[tokio::test]
    async fn test_env_and_cwd() {
        let dir = TempDir::new().unwrap();
        let mut s = spec(&dir, "echo $GREETING; pwd");
        s.env.insert("GREETING".to_string(), "hi".to_string());
        let outcome = ShellRunner::new().run(&s).await.unwrap();
        assert!(outcome.output.contains("hi"));
        let dir_name = dir.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(outcome.output.contains(&dir_name));
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let dir = TempDir::new().unwrap();
        let mut s = spec(&dir, "sleep 30");
        s.timeout = Duration::from_millis(200);
        let outcome = ShellRunner::new().run(&s).await.unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.success);
        assert!(outcome.duration_ms < 10_000);
    }

    #[tokio::test]
    async fn test_background_child_cannot_hold_the_caller() {
        let dir = TempDir::new().unwrap();
        let mut s = spec(&dir, "sleep 6 & echo started");
        s.timeout = Duration::from_millis(500);

        let started = Instant::now();
        let outcome = ShellRunner::new().run(&s).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(outcome.output.contains("started"));
        assert!(outcome.success);
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn test_escaped_pipe_holder_times_out() {
        let dir = TempDir::new().unwrap();
        // A new session leaves the process group but keeps stdout open
        let mut s = spec(
            &dir,
            "perl -e 'use POSIX; POSIX::setsid(); sleep 6' 2>/dev/null & echo started",
        );
        s.timeout = Duration::from_millis(500);

        let started = Instant::now();
        let outcome = ShellRunner::new().run(&s).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(3));
        if outcome.timed_out {
            assert!(!outcome.success);
            assert_eq!(outcome.exit_code, None);
        }
    }

    #[tokio::test]
    async fn test_output_is_bounded_while_reading() {
        let dir = TempDir::new().unwrap();
        let mut s = spec(&dir, "head -c 200000 /dev/zero | tr '\\0' a; echo end");
        s.max_output_bytes = 64;
        let outcome = ShellRunner::new().run(&s).await.unwrap();
        assert!(outcome.success);
        assert!(outcome.output.len() <= 64);
        assert!(outcome.output.trim_end().ends_with("aend"));
    }

    #[test]
    fn test_tail_buffer_keeps_recent_bytes() {
        let mut buffer = TailBuffer::new(4);
        for chunk in [b"0123".as_slice(), b"4567", b"89"] {
            buffer.push(chunk);
            assert!(buffer.bytes.len() <= 8);
        }
        assert_eq!(truncate_front(buffer.into_inner(), 4), "6789");
    }

    #[test]
    fn test_truncate_front_keeps_tail() {
        let text = truncate_front(b"0123456789".to_vec(), 4);
        assert_eq!(text, "6789");
        assert_eq!(truncate_front(b"abc".to_vec(), 10), "abc");
    }
}
