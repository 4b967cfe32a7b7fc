//! Where scheduler commands run: locally or on the head node over ssh.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::SchedulerError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Runs one scheduler command given as an argv.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, argv: &[String]) -> Result<CommandOutput, SchedulerError>;
}

/// Lets the runner be picked at startup as `Box<dyn CommandRunner>`.
#[async_trait]
impl<T: CommandRunner + ?Sized> CommandRunner for Box<T> {
    async fn run(&self, argv: &[String]) -> Result<CommandOutput, SchedulerError> {
        (**self).run(argv).await
    }
}

/// Spawns the command on this host.
#[derive(Debug, Clone)]
pub struct LocalRunner {
    timeout: Duration,
}

impl LocalRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for LocalRunner {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn run(&self, argv: &[String]) -> Result<CommandOutput, SchedulerError> {
        spawn_and_wait(argv, self.timeout).await
    }
}

/// Runs the command on `user@host` through `ssh -T`.
#[derive(Debug, Clone)]
pub struct SshRunner {
    host: String,
    user: Option<String>,
    timeout: Duration,
}

impl SshRunner {
    pub fn new(host: impl Into<String>, user: Option<String>, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            user,
            timeout,
        }
    }

    /// Full local argv: ssh options, target, then the remote command as one
    /// shell-quoted string.
    pub fn wrap(&self, argv: &[String]) -> Vec<String> {
        let target = match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        };
        let remote = argv
            .iter()
            .map(|arg| shell_quote(arg))
            .collect::<Vec<_>>()
            .join(" ");
        vec!["ssh".into(), "-T".into(), target, remote]
    }
}

#[async_trait]
impl CommandRunner for SshRunner {
    async fn run(&self, argv: &[String]) -> Result<CommandOutput, SchedulerError> {
        spawn_and_wait(&self.wrap(argv), self.timeout).await
    }
}

async fn spawn_and_wait(argv: &[String], timeout: Duration) -> Result<CommandOutput, SchedulerError> {
    let Some((program, args)) = argv.split_first() else {
        return Err(SchedulerError::Spawn {
            program: String::new(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
        });
    };
    debug!(program = %program, ?args, "running scheduler command");

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| SchedulerError::Spawn {
            program: program.clone(),
            source,
        })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => {
            return Err(SchedulerError::Spawn {
                program: program.clone(),
                source,
            })
        }
        Err(_) => {
            warn!(program = %program, timeout_secs = timeout.as_secs(), "command timed out");
            return Err(SchedulerError::Timeout {
                program: program.clone(),
                timeout,
            });
        }
    };

    Ok(CommandOutput {
        status: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Quote one argument for a POSIX shell. Plain words pass through.
pub fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_=.,:/@%+".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn quoting_leaves_flags_alone() {
        assert_eq!(shell_quote("--job-name=123"), "--job-name=123");
        assert_eq!(shell_quote("runPipeline.sh -o 123"), "'runPipeline.sh -o 123'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn ssh_wraps_remote_command() {
        let runner = SshRunner::new("head01", Some("lofarsys".into()), DEFAULT_TIMEOUT);
        let wrapped = runner.wrap(&argv(&["scancel", "--jobname", "123"]));
        assert_eq!(
            wrapped,
            argv(&["ssh", "-T", "lofarsys@head01", "scancel --jobname 123"])
        );

        let runner = SshRunner::new("head01", None, DEFAULT_TIMEOUT);
        assert_eq!(runner.wrap(&argv(&["true"]))[2], "head01");
    }

    #[tokio::test]
    async fn local_runner_captures_output() {
        let runner = LocalRunner::default();
        let out = runner
            .run(&argv(&["sh", "-c", "echo hello; echo oops >&2; exit 3"]))
            .await
            .unwrap();
        assert_eq!(out.status, 3);
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert!(!out.success());
    }

    #[tokio::test]
    async fn local_runner_times_out() {
        let runner = LocalRunner::new(Duration::from_millis(100));
        let err = runner.run(&argv(&["sleep", "5"])).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Timeout { .. }));
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let err = LocalRunner::default()
            .run(&argv(&["definitely-not-a-real-binary-obsflow"]))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Spawn { .. }));
    }
}
