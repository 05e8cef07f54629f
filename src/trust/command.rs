//! External command execution with cancellation.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{program}` exited with {}: {output}", exit_description(.code))]
    Failed {
        program: String,
        code: Option<i32>,
        output: String,
    },
    #[error("`{program}` cancelled")]
    Cancelled { program: String },
}

fn exit_description(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "a signal".to_string(),
    }
}

/// Output of a command that exited successfully.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Stdout followed by stderr.
    pub combined: String,
}

/// Runs external programs. Abstracted so provisioning can be exercised
/// without touching the host.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Returns true if `program` resolves on `PATH`.
    fn exists(&self, program: &str) -> bool;

    /// Runs `program` to completion.
    ///
    /// A nonzero exit is [`CommandError::Failed`]. If `cancel` fires first
    /// the child is killed and [`CommandError::Cancelled`] is returned; a
    /// failure observed after cancellation is also reported as cancelled.
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, CommandError>;
}

/// Runs commands on the host with `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    fn exists(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }

    async fn run(
        &self,
        program: &str,
        args: &[String],
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, CommandError> {
        let cancelled = || CommandError::Cancelled {
            program: program.to_string(),
        };
        if cancel.is_cancelled() {
            return Err(cancelled());
        }

        debug!("running {} {:?}", program, args);

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::Spawn {
                program: program.to_string(),
                source,
            })?;

        // Dropping the wait future on cancellation kills the child.
        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled()),
            output = child.wait_with_output() => output.map_err(|source| CommandError::Spawn {
                program: program.to_string(),
                source,
            })?,
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            if cancel.is_cancelled() {
                return Err(cancelled());
            }
            return Err(CommandError::Failed {
                program: program.to_string(),
                code: output.status.code(),
                output: combined.trim().to_string(),
            });
        }

        Ok(CommandOutput { combined })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn successful_command_captures_both_streams() {
        let runner = SystemCommandRunner;
        let args = vec!["-c".to_string(), "echo out; echo err >&2".to_string()];
        let output = runner
            .run("sh", &args, &CancellationToken::new())
            .await
            .unwrap();
        assert!(output.combined.contains("out"));
        assert!(output.combined.contains("err"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_failure() {
        let runner = SystemCommandRunner;
        let args = vec!["-c".to_string(), "echo broken; exit 3".to_string()];
        let err = runner
            .run("sh", &args, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            CommandError::Failed { code, output, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(output, "broken");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    /// Cancelling a running command kills it and reports cancellation rather
    /// than the command's own failure.
    #[tokio::test]
    async fn cancellation_is_distinct_from_failure() {
        let runner = SystemCommandRunner;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let args = vec!["30".to_string()];
        let started = std::time::Instant::now();
        let err = runner.run("sleep", &args, &cancel).await.unwrap_err();
        assert!(matches!(err, CommandError::Cancelled { .. }));
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let runner = SystemCommandRunner;
        assert!(!runner.exists("definitely-not-a-real-program-xyz"));
        let err = runner
            .run("definitely-not-a-real-program-xyz", &[], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }
}
