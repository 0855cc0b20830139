//! External command execution behind a trait, so container and provisioning
//! logic can be driven by scripted runners in tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build from an argv vector (`["brew", "--version"]`).
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, rest) = argv.split_first()?;
        Some(Self::new(program.clone()).args(rest.iter().cloned()))
    }

    /// `program arg arg` for log and error messages.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Last non-empty line of stderr, falling back to stdout.
    pub fn error_summary(&self) -> String {
        let pick = |s: &str| {
            s.lines()
                .rev()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(str::to_string)
        };
        pick(&self.stderr)
            .or_else(|| pick(&self.stdout))
            .unwrap_or_else(|| match self.code {
                Some(code) => format!("exited with code {}", code),
                None => "terminated by signal".to_string(),
            })
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` timed out after {}", humantime::format_duration(*.timeout))]
    Timeout { command: String, timeout: Duration },
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError>;

    /// Run and hand each stdout line to `on_line` as it arrives.
    async fn run_streaming(
        &self,
        spec: &CommandSpec,
        on_line: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> Result<CommandOutput, ExecError> {
        let output = self.run(spec).await?;
        for line in output.stdout.lines() {
            on_line(line);
        }
        Ok(output)
    }
}

/// Runs real processes with a fixed environment.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    env: Option<BTreeMap<String, String>>,
}

impl SystemRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_env(env: BTreeMap<String, String>) -> Self {
        Self { env: Some(env) }
    }

    fn command(&self, spec: &CommandSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        if let Some(env) = &self.env {
            cmd.env_clear().envs(env);
        }
        cmd
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
        debug!(command = %spec.display(), "running command");
        let fut = self.command(spec).output();
        let output = tokio::time::timeout(spec.timeout, fut)
            .await
            .map_err(|_| ExecError::Timeout {
                command: spec.display(),
                timeout: spec.timeout,
            })?
            .map_err(|source| ExecError::Spawn {
                command: spec.display(),
                source,
            })?;
        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn run_streaming(
        &self,
        spec: &CommandSpec,
        on_line: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> Result<CommandOutput, ExecError> {
        debug!(command = %spec.display(), "running command (streaming)");
        let spawn_err = |source| ExecError::Spawn {
            command: spec.display(),
            source,
        };
        let mut child = self.command(spec).spawn().map_err(spawn_err)?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let work = async {
            // stderr is drained concurrently so a chatty tool cannot block on a
            // full pipe.
            let stderr_task = tokio::spawn(async move {
                let mut buf = String::new();
                if let Some(mut err) = stderr {
                    let _ = err.read_to_string(&mut buf).await;
                }
                buf
            });

            let mut collected = String::new();
            if let Some(out) = stdout {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    on_line(&line);
                    collected.push_str(&line);
                    collected.push('\n');
                }
            }
            let status = child.wait().await;
            let stderr = stderr_task.await.unwrap_or_default();
            (status, collected, stderr)
        };

        let (status, stdout, stderr) = tokio::time::timeout(spec.timeout, work)
            .await
            .map_err(|_| ExecError::Timeout {
                command: spec.display(),
                timeout: spec.timeout,
            })?;
        let status = status.map_err(spawn_err)?;
        Ok(CommandOutput {
            success: status.success(),
            code: status.code(),
            stdout,
            stderr,
        })
    }
}


#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn captures_output_and_status() {
        let runner = SystemRunner::new();
        let out = runner
            .run(&CommandSpec::new("sh").args(["-c", "echo hi; echo oops >&2; exit 2"]))
            .await
            .unwrap();
        assert!(!out.success);
        assert_eq!(out.code, Some(2));
        assert_eq!(out.stdout.trim(), "hi");
        assert_eq!(out.error_summary(), "oops");
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let err = SystemRunner::new()
            .run(&CommandSpec::new("definitely-not-a-real-binary-xyz"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }

    #[tokio::test]
    async fn times_out() {
        let spec = CommandSpec::new("sh")
            .args(["-c", "sleep 5"])
            .timeout(Duration::from_millis(100));
        let err = SystemRunner::new().run(&spec).await.unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));
    }

    #[tokio::test]
    async fn streams_lines_in_order() {
        let seen = Mutex::new(Vec::new());
        let spec = CommandSpec::new("sh").args(["-c", "echo one; echo two >&2; echo three"]);
        let out = SystemRunner::new()
            .run_streaming(&spec, &|line| seen.lock().unwrap().push(line.to_string()))
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(*seen.lock().unwrap(), vec!["one", "three"]);
        assert_eq!(out.stderr.trim(), "two");
    }

    #[test]
    fn from_argv_splits_program() {
        let spec = CommandSpec::from_argv(&["brew".into(), "--version".into()]).unwrap();
        assert_eq!(spec.program, "brew");
        assert_eq!(spec.display(), "brew --version");
        assert!(CommandSpec::from_argv(&[]).is_none());
    }
}
