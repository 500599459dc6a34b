use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::cancel::CancelToken;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("No command provided")]
    NoCommand,
    #[error("Failed to execute command '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("I/O error talking to '{command}': {source}")]
    Io {
        command: String,
        source: std::io::Error,
    },
    #[error("Command '{0}' was canceled")]
    Canceled(String),
}

/// What a piped command left behind
#[derive(Debug)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Execute a command, writing `input` to its stdin and collecting its stdout.
///
/// Stdin is written while stdout is read, and stderr is drained in a
/// separate task, so no pipe can fill up and stall the child. On
/// cancellation the child is killed and reaped before returning.
pub async fn execute_piped(
    command_args: &[String],
    input: &[u8],
    cancel: &CancelToken,
) -> Result<CommandOutput, CommandError> {
    let Some((command_name, args)) = command_args.split_first() else {
        return Err(CommandError::NoCommand);
    };

    tracing::debug!(command = %command_name, ?args, input_bytes = input.len(), "Executing command");

    let mut child = Command::new(command_name)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| CommandError::Spawn {
            command: command_name.clone(),
            source,
        })?;

    let io_error = |source| CommandError::Io {
        command: command_name.clone(),
        source,
    };
    let missing_pipe = || {
        io_error(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "child pipe not captured",
        ))
    };

    let mut stdin = child.stdin.take().ok_or_else(missing_pipe)?;
    let mut stdout = child.stdout.take().ok_or_else(missing_pipe)?;
    let mut stderr = child.stderr.take().ok_or_else(missing_pipe)?;

    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf).await;
        String::from_utf8_lossy(&buf).into_owned()
    });

    let exchange = async {
        let write = async {
            let written = stdin.write_all(input).await;
            // Close stdin to signal EOF
            let _ = stdin.shutdown().await;
            drop(stdin);
            written
        };
        let read = async {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).await.map(|_| buf)
        };
        let (written, read) = tokio::join!(write, read);
        match written {
            // The child may exit before consuming all input; its exit status decides
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                tracing::debug!(command = %command_name, "Command closed stdin early");
            }
            Err(e) => return Err(e),
            Ok(()) => {}
        }
        let out = read?;
        let status = child.wait().await?;
        Ok::<_, std::io::Error>((status, out))
    };

    let outcome = cancel.run(exchange).await;

    let Some(result) = outcome else {
        // `exchange` was dropped along with its borrows; reap the child now
        let _ = child.kill().await;
        stderr_task.abort();
        tracing::warn!(command = %command_name, "Command canceled, child process killed");
        return Err(CommandError::Canceled(command_name.clone()));
    };

    let (status, stdout) = result.map_err(io_error)?;
    let stderr = stderr_task.await.unwrap_or_default();
    let exit_code = status.code().unwrap_or(-1);

    tracing::debug!(
        command = %command_name,
        exit_code,
        stdout_bytes = stdout.len(),
        "Command completed"
    );

    Ok(CommandOutput {
        exit_code,
        stdout,
        stderr,
    })
}

/// Run a capability check: true iff the command exits 0 within `timeout`.
pub async fn probe(command_args: &[String], timeout: Duration) -> bool {
    let Some((command_name, args)) = command_args.split_first() else {
        return false;
    };

    let child = Command::new(command_name)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn();

    let mut child = match child {
        Ok(child) => child,
        Err(e) => {
            tracing::info!(
                command = %command_name,
                error = %e,
                "Capability probe could not spawn command"
            );
            return false;
        }
    };

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => status.success(),
        Ok(Err(e)) => {
            tracing::info!(command = %command_name, error = %e, "Capability probe failed");
            false
        }
        Err(_) => {
            tracing::info!(command = %command_name, ?timeout, "Capability probe timed out");
            let _ = child.kill().await;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{process_alive, wait_for_pid};
    use std::time::Instant;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test]
    async fn test_execute_piped_echoes_stdin() {
        let input = b"Hello, World!";
        let result = execute_piped(&args(&["cat"]), input, &CancelToken::new())
            .await
            .unwrap();

        assert!(result.success());
        assert_eq!(result.stdout, input);
    }

    #[tokio::test]
    async fn test_execute_piped_large_payload_does_not_deadlock() {
        // Far larger than any pipe buffer in both directions
        let input = vec![42u8; 4 * 1024 * 1024];
        let result = execute_piped(&args(&["cat"]), &input, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(result.stdout.len(), input.len());
    }

    #[tokio::test]
    async fn test_execute_piped_captures_stderr_and_exit_code() {
        let result = execute_piped(
            &args(&["sh", "-c", "echo oops >&2; exit 3"]),
            b"",
            &CancelToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(result.exit_code, 3);
        assert!(result.stderr.contains("oops"));
        assert!(result.stdout.is_empty());
    }

    #[tokio::test]
    async fn test_execute_piped_child_ignoring_stdin() {
        let input = vec![0u8; 1024 * 1024];
        let result = execute_piped(&args(&["false"]), &input, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(result.exit_code, 1);
    }

    #[tokio::test]
    async fn test_execute_piped_empty_command() {
        let result = execute_piped(&[], b"test", &CancelToken::new()).await;

        assert!(matches!(result, Err(CommandError::NoCommand)));
    }

    #[tokio::test]
    async fn test_execute_piped_nonexistent_command() {
        let result = execute_piped(
            &args(&["nonexistent_command_12345"]),
            b"test",
            &CancelToken::new(),
        )
        .await;

        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Failed to execute command"));
    }

    #[tokio::test]
    async fn test_cancel_mid_write_kills_child_promptly() {
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        // The child never reads, so the write blocks on a full pipe
        let input = vec![0u8; 8 * 1024 * 1024];
        let started = Instant::now();
        let result = execute_piped(&args(&["sh", "-c", "sleep 30"]), &input, &cancel).await;

        assert!(matches!(result, Err(CommandError::Canceled(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancel_reaps_child_process() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("child.pid");
        let script = format!("echo $$ > {}; exec sleep 30", pidfile.display());

        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let watched = pidfile.clone();
        let pid = tokio::spawn(async move {
            let pid = wait_for_pid(&watched).await;
            trigger.cancel();
            pid
        });

        let input = vec![0u8; 8 * 1024 * 1024];
        let result = execute_piped(&args(&["sh", "-c", &script]), &input, &cancel).await;
        let pid = pid.await.unwrap();

        assert!(matches!(result, Err(CommandError::Canceled(_))));
        assert!(!process_alive(pid), "child {} survived cancellation", pid);
    }

    #[tokio::test]
    async fn test_probe() {
        assert!(probe(&args(&["true"]), Duration::from_secs(2)).await);
        assert!(!probe(&args(&["false"]), Duration::from_secs(2)).await);
        assert!(!probe(&args(&["nonexistent_command_12345"]), Duration::from_secs(2)).await);
        assert!(!probe(&[], Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_probe_times_out() {
        let started = Instant::now();
        assert!(!probe(&args(&["sleep", "10"]), Duration::from_millis(200)).await);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
