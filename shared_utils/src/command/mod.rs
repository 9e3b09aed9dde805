//! Helpers for running system networking commands (`ip`, `ping`, ...).

use thiserror::Error;
use tokio::process::Command as TokioCommand;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("I/O error running `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("System command `{command}` failed: {stderr}")]
    Failure { command: String, stderr: String },
}

impl CommandError {
    /// Stderr of a failed command, empty for spawn errors.
    pub fn stderr(&self) -> &str {
        match self {
            CommandError::Failure { stderr, .. } => stderr,
            CommandError::Io { .. } => "",
        }
    }
}

fn render(command: &str, args: &[&str]) -> String {
    let mut rendered = command.to_string();
    for arg in args {
        rendered.push(' ');
        rendered.push_str(arg);
    }
    rendered
}

/// Run `command` to completion and return its trimmed stdout.
pub async fn run_command(command: &str, args: &[&str]) -> Result<String, CommandError> {
    debug!(cmd = command, ?args, "running network command");
    let output = TokioCommand::new(command)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| CommandError::Io {
            command: render(command, args),
            source,
        })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(CommandError::Failure {
            command: render(command, args),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Run `command` and report only whether it exited successfully.
///
/// Dropping the future before completion kills the child.
pub async fn command_succeeds(command: &str, args: &[&str]) -> Result<bool, CommandError> {
    let status = TokioCommand::new(command)
        .args(args)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|source| CommandError::Io {
            command: render(command, args),
            source,
        })?;
    Ok(status.success())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn captures_stdout() {
        let out = run_command("sh", &["-c", "echo '  hello  '"]).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn failure_carries_stderr() {
        let err = run_command("sh", &["-c", "echo 'RTNETLINK answers: File exists' >&2; exit 2"])
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Failure { .. }));
        assert_eq!(err.stderr(), "RTNETLINK answers: File exists");
        assert!(err.to_string().contains("sh -c"));
    }

    #[tokio::test]
    async fn missing_binary_is_io_error() {
        let err = run_command("veil-no-such-binary", &[]).await.unwrap_err();
        assert!(matches!(err, CommandError::Io { .. }));
        assert!(command_succeeds("veil-no-such-binary", &[]).await.is_err());
    }

    #[tokio::test]
    async fn exit_status_is_reported() {
        assert!(command_succeeds("true", &[]).await.unwrap());
        assert!(!command_succeeds("false", &[]).await.unwrap());
    }

    #[tokio::test]
    async fn abandoned_command_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("finished");
        let script = format!("sleep 1; touch {}", marker.display());

        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            command_succeeds("sh", &["-c", script.as_str()]),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }
}
