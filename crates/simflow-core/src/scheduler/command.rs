//! Subprocess invocation for scheduler CLIs.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::{SchedulerError, SchedulerResult};

/// Captured result of one scheduler command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Fail with a transient error unless the command exited cleanly.
    pub fn require_success(self, command: &str) -> SchedulerResult<Self> {
        if self.success() {
            return Ok(self);
        }
        let detail = self.stderr.trim();
        let reason = match self.code {
            Some(code) if detail.is_empty() => format!("exit status {code}"),
            Some(code) => format!("exit status {code}: {detail}"),
            None => "terminated by signal".to_string(),
        };
        Err(SchedulerError::transient(command, reason))
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, optionally inside `cwd`.
    ///
    /// Only spawn failures and timeouts are errors; the caller judges the
    /// exit status.
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> SchedulerResult<CommandOutput>;
}

/// Runs commands on the host, each bounded by a timeout.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    timeout: Duration,
}

impl SystemRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> SchedulerResult<CommandOutput> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        tracing::debug!(program, ?args, "running scheduler command");
        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(SchedulerError::transient(program, e.to_string())),
            Err(_) => {
                return Err(SchedulerError::transient(
                    program,
                    format!("timed out after {}s", self.timeout.as_secs()),
                ))
            }
        };

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    use super::*;

    /// A runner that replays canned output per program and records calls.
    #[derive(Default)]
    pub(crate) struct ScriptedRunner {
        replies: Mutex<HashMap<String, VecDeque<SchedulerResult<CommandOutput>>>>,
        calls: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl ScriptedRunner {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn reply(&self, program: &str, code: i32, stdout: &str, stderr: &str) {
            self.push(
                program,
                Ok(CommandOutput {
                    code: Some(code),
                    stdout: stdout.to_string(),
                    stderr: stderr.to_string(),
                }),
            );
        }

        pub(crate) fn fail(&self, program: &str, reason: &str) {
            self.push(program, Err(SchedulerError::transient(program, reason)));
        }

        fn push(&self, program: &str, reply: SchedulerResult<CommandOutput>) {
            self.replies
                .lock()
                .unwrap()
                .entry(program.to_string())
                .or_default()
                .push_back(reply);
        }

        pub(crate) fn calls(&self) -> Vec<(String, Vec<String>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(
            &self,
            program: &str,
            args: &[String],
            _cwd: Option<&Path>,
        ) -> SchedulerResult<CommandOutput> {
            self.calls
                .lock()
                .unwrap()
                .push((program.to_string(), args.to_vec()));
            self.replies
                .lock()
                .unwrap()
                .get_mut(program)
                .and_then(|q| q.pop_front())
                .unwrap_or_else(|| Err(SchedulerError::transient(program, "no scripted reply")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_success_reports_stderr() {
        let out = CommandOutput {
            code: Some(1),
            stdout: String::new(),
            stderr: "slurm_load_jobs error\n".into(),
        };
        let err = out.require_success("squeue").unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("slurm_load_jobs error"));
    }

    #[tokio::test]
    async fn system_runner_captures_output() {
        let runner = SystemRunner::new(Duration::from_secs(5));
        let out = runner
            .run("sh", &["-c".into(), "echo hello; echo oops >&2".into()], None)
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn system_runner_times_out() {
        let runner = SystemRunner::new(Duration::from_millis(100));
        let err = runner
            .run("sh", &["-c".into(), "sleep 5".into()], None)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn missing_program_is_transient() {
        let runner = SystemRunner::new(Duration::from_secs(1));
        let err = runner
            .run("simflow-no-such-command", &[], None)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
