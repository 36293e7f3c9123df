//! Subprocess execution for CLI-backed servers
//!
//! `sam`, `terraform`, `finch` and `aws` are all driven through the
//! [`CommandRunner`] trait so tool handlers can be tested against a
//! recording runner instead of real binaries.

use crate::core::service::ServiceError;
use async_trait::async_trait;
use regex::Regex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// A fully described command invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<String>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
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

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Human readable command line, quoting arguments with whitespace
    pub fn display(&self) -> String {
        let mut text = self.program.clone();
        for arg in &self.args {
            text.push(' ');
            if arg.chars().any(char::is_whitespace) || arg.is_empty() {
                text.push('"');
                text.push_str(&arg.replace('"', "\\\""));
                text.push('"');
            } else {
                text.push_str(arg);
            }
        }
        text
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into [`ServiceError::Command`]
    pub fn check(self, program: &str) -> Result<Self, ServiceError> {
        if self.success() {
            Ok(self)
        } else {
            let stderr = if self.stderr.trim().is_empty() {
                self.stdout.trim().to_string()
            } else {
                self.stderr.trim().to_string()
            };
            Err(ServiceError::Command {
                program: program.to_string(),
                exit_code: self.exit_code,
                stderr,
            })
        }
    }
}

/// Trait for running external commands
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion and capture its output
    ///
    /// A non-zero exit status is *not* an error at this level.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ServiceError>;
}

/// Runs commands as real child processes
pub struct ProcessRunner {
    default_timeout: Duration,
}

impl ProcessRunner {
    pub fn new(default_timeout_secs: u64) -> Self {
        Self {
            default_timeout: Duration::from_secs(default_timeout_secs),
        }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ServiceError> {
        debug!("Running: {}", spec.display());

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ServiceError::NotFound(format!(
                "'{}' was not found on PATH. Install it or configure its location.",
                spec.program
            )),
            _ => ServiceError::Io(e),
        })?;

        if let Some(input) = &spec.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(input.as_bytes()).await?;
                stdin.shutdown().await?;
            }
        }

        let timeout = spec.timeout.unwrap_or(self.default_timeout);
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("{} timed out after {:?}", spec.program, timeout);
                return Err(ServiceError::Timeout {
                    program: spec.program.clone(),
                    seconds: timeout.as_secs(),
                });
            }
        };

        let result = CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!("{} exited with {}", spec.program, result.exit_code);
        Ok(result)
    }
}

/// Remove ANSI escape sequences (colors, cursor movement) from CLI output
pub fn strip_ansi(text: &str) -> String {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    let re = ANSI.get_or_init(|| {
        Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07]*\x07").expect("valid ANSI regex")
    });
    re.replace_all(text, "").into_owned()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Records every command and replays canned outputs in order
    #[derive(Default)]
    pub struct MockRunner {
        calls: Mutex<Vec<CommandSpec>>,
        outputs: Mutex<VecDeque<CommandOutput>>,
    }

    impl MockRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_ok(&self, stdout: &str) -> &Self {
            self.outputs.lock().unwrap().push_back(CommandOutput {
                exit_code: 0,
                stdout: stdout.to_string(),
                stderr: String::new(),
            });
            self
        }

        pub fn push_err(&self, exit_code: i32, stderr: &str) -> &Self {
            self.outputs.lock().unwrap().push_back(CommandOutput {
                exit_code,
                stdout: String::new(),
                stderr: stderr.to_string(),
            });
            self
        }

        pub fn calls(&self) -> Vec<CommandSpec> {
            self.calls.lock().unwrap().clone()
        }

        /// Argument vector of the n-th call
        pub fn args(&self, n: usize) -> Vec<String> {
            self.calls()[n].args.clone()
        }
    }

    #[async_trait]
    impl CommandRunner for MockRunner {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ServiceError> {
            self.calls.lock().unwrap().push(spec.clone());
            Ok(self
                .outputs
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_quotes_whitespace() {
        let spec = CommandSpec::new("sam")
            .arg("deploy")
            .arg("--parameter-overrides")
            .arg("Key=a b");
        assert_eq!(spec.display(), "sam deploy --parameter-overrides \"Key=a b\"");
    }

    #[test]
    fn test_strip_ansi() {
        let colored = "\x1b[32mSuccess!\x1b[0m Plan: \x1b[1m1\x1b[0m to add";
        assert_eq!(strip_ansi(colored), "Success! Plan: 1 to add");
    }

    #[test]
    fn test_check_prefers_stderr() {
        let out = CommandOutput {
            exit_code: 2,
            stdout: "partial".into(),
            stderr: "fatal: boom\n".into(),
        };
        match out.check("terraform") {
            Err(ServiceError::Command {
                program,
                exit_code,
                stderr,
            }) => {
                assert_eq!(program, "terraform");
                assert_eq!(exit_code, 2);
                assert_eq!(stderr, "fatal: boom");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_not_found() {
        let runner = ProcessRunner::new(5);
        let err = runner
            .run(&CommandSpec::new("definitely-not-a-real-binary-4242"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_captures_output() {
        let runner = ProcessRunner::new(5);
        let out = runner
            .run(&CommandSpec::new("sh").arg("-c").arg("cat; echo err >&2; exit 3").stdin("hi"))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout, "hi");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_timeout() {
        let runner = ProcessRunner::new(5);
        let err = runner
            .run(&CommandSpec::new("sleep").arg("5").timeout(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Timeout { .. }));
    }
}
