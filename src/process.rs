//! Subprocess orchestration.
//!
//! Git pushes and fetches move arbitrarily large packfiles through the
//! child's pipes, so stdin and stdout are serviced by concurrent copy
//! tasks. Servicing them in sequence deadlocks as soon as either pipe
//! buffer fills while the child is blocked on the other end.

use std::borrow::Cow;
use std::io::{self, Write};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

/// Stderr is diagnostics only; anything past this is discarded.
pub const STDERR_CAP: usize = 8192;

/// How long a child gets to exit after SIGTERM before SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Outcome of a reaped subprocess.
pub struct Exit {
    pub status: ExitStatus,
    pub stderr: Vec<u8>,
}

impl Exit {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn stderr_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }
}

/// Spawn `cmd` and concurrently copy `stdin` into the child and the
/// child's stdout into `stdout`. The child's stdin pipe is closed once the
/// source is exhausted so the child can finalize its output; stderr is
/// captured up to [`STDERR_CAP`] bytes and drained past that so the child
/// never blocks on a full pipe.
///
/// Waits for the child and returns its exit status after all copies have
/// finished. On any copy failure the child is terminated and the error is
/// returned; callers decide how to surface it.
pub async fn run<R, W>(mut cmd: Command, stdin: Option<R>, stdout: &mut W) -> io::Result<Exit>
where
    R: AsyncRead + Unpin,
    W: Write + ?Sized,
{
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    let mut child = cmd.spawn()?;
    let child_in = child.stdin.take();
    let mut child_out = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("child stdout was not captured"))?;
    let mut child_err = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other("child stderr was not captured"))?;

    let feed = async {
        if let (Some(mut source), Some(mut sink)) = (stdin, child_in) {
            tokio::io::copy(&mut source, &mut sink).await?;
            sink.shutdown().await?;
        }
        Ok::<_, io::Error>(())
    };
    let drain = async {
        let mut buf = vec![0u8; 65536];
        loop {
            let n = child_out.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            stdout.write_all(&buf[..n])?;
        }
        Ok::<_, io::Error>(())
    };
    let errs = async {
        let mut kept = Vec::new();
        let mut buf = vec![0u8; 8192];
        loop {
            let n = child_err.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            if kept.len() < STDERR_CAP {
                let take = n.min(STDERR_CAP - kept.len());
                kept.extend_from_slice(&buf[..take]);
            }
        }
        Ok::<_, io::Error>(kept)
    };

    let stderr = match tokio::try_join!(feed, drain, errs) {
        Ok(((), (), stderr)) => stderr,
        Err(err) => {
            terminate(&mut child).await;
            return Err(err);
        }
    };
    let status = child.wait().await?;

    Ok(Exit { status, stderr })
}

/// Run a command with no stdin and discard its stdout. Used for the small
/// housekeeping invocations (`git init`, `git update-server-info`).
pub async fn call(cmd: Command) -> io::Result<Exit> {
    let mut sink = io::sink();
    run(cmd, None::<tokio::io::Empty>, &mut sink).await
}

/// Ask the child to exit, escalating to SIGKILL after a grace period.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        let _ = child.kill().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_round_trip_through_cat() {
        let input = b"0032want 0a53e9ddeaddad63ad106860237bbf53411d11a7\n".to_vec();
        let mut out = Vec::new();

        let exit = run(
            Command::new("cat"),
            Some(std::io::Cursor::new(input.clone())),
            &mut out,
        )
        .await
        .unwrap();

        assert!(exit.success());
        assert_eq!(out, input);
        assert!(exit.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_no_stdin_closes_immediately() {
        let mut out = Vec::new();
        let mut cmd = Command::new("cat");
        cmd.arg("-");

        let exit = run(cmd, None::<tokio::io::Empty>, &mut out).await.unwrap();

        assert!(exit.success());
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_failure_is_surfaced_with_stderr() {
        let mut cmd = Command::new("git");
        cmd.arg("definitely-not-a-subcommand");

        let exit = call(cmd).await.unwrap();

        assert!(!exit.success());
        assert!(!exit.stderr.is_empty());
        assert!(exit.stderr.len() <= STDERR_CAP);
    }
}
