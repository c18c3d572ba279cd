use crate::cancel::CancelToken;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::fs::File;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Exit code reported for a run we had to SIGKILL ourselves.
pub const KILLED_EXIT_CODE: i32 = 128 + Signal::SIGKILL as i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Unix-style exit code; a child killed by signal `n` reports `128 + n`.
    Exited(i32),
    Timeout,
    Cancelled,
}

impl ExecutionStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            ExecutionStatus::Exited(code) => *code,
            ExecutionStatus::Timeout | ExecutionStatus::Cancelled => KILLED_EXIT_CODE,
        }
    }
}

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to spawn command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Error waiting for child: {0}")]
    Wait(#[source] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct CommandExecutorConfig {
    /// Shell command line, run as `sh -c "exec <line>"` when `exec` is set
    /// and as `sh -c "<line>"` otherwise.
    pub command_line: String,
    pub exec: bool,
    pub timeout: Duration,
    pub hide_output: bool,
    pub envs: BTreeMap<String, String>,
    /// Redirects stdout into this file, whatever `hide_output` says.
    pub stdout_file: Option<PathBuf>,
}

impl CommandExecutorConfig {
    pub fn new(command_line: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command_line: command_line.into(),
            exec: true,
            timeout,
            hide_output: true,
            envs: BTreeMap::new(),
            stdout_file: None,
        }
    }
}

/// Runs one shell command line in its own process group and hard-kills the
/// whole group on timeout or cancellation.
pub struct CommandExecutor {
    config: CommandExecutorConfig,
    cancel: Option<CancelToken>,
}

impl CommandExecutor {
    pub fn new(config: CommandExecutorConfig) -> Self {
        Self {
            config,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn run(&self) -> Result<ExecutionStatus, ExecutorError> {
        let script = if self.config.exec {
            format!("exec {}", self.config.command_line)
        } else {
            self.config.command_line.clone()
        };
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(script)
            .envs(&self.config.envs)
            .stdin(Stdio::null())
            .process_group(0);

        if self.config.hide_output {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
        if let Some(path) = &self.config.stdout_file {
            let file = File::create(path).map_err(|source| ExecutorError::Spawn {
                command: self.config.command_line.clone(),
                source,
            })?;
            cmd.stdout(file);
        }

        log::debug!("Running command {}", self.config.command_line);
        let child = cmd.spawn().map_err(|source| ExecutorError::Spawn {
            command: self.config.command_line.clone(),
            source,
        })?;
        self.run_and_wait_with_timeout(child)
    }

    fn run_and_wait_with_timeout(&self, mut child: Child) -> Result<ExecutionStatus, ExecutorError> {
        let start_time = Instant::now();

        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(ExecutionStatus::Exited(unix_exit_code(status))),
                Ok(None) => {
                    if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                        log::debug!("Cancellation requested, killing target...");
                        kill_process_group(&mut child);
                        return Ok(ExecutionStatus::Cancelled);
                    }
                    if start_time.elapsed() > self.config.timeout {
                        log::info!(
                            "Terminating process after timeout ({}s)",
                            self.config.timeout.as_secs_f32()
                        );
                        kill_process_group(&mut child);
                        return Ok(ExecutionStatus::Timeout);
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    kill_process_group(&mut child);
                    return Err(ExecutorError::Wait(e));
                }
            }
        }
    }
}

fn unix_exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => KILLED_EXIT_CODE,
    }
}

fn kill_process_group(child: &mut Child) {
    if let Err(e) = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
        log::debug!("killpg failed ({e}), killing the direct child only");
        let _ = child.kill();
    }
    let _ = child.wait();
}

/// Shells out a pre/post/cleanup hook under the target's timeout. Failures
/// are logged, never fatal.
pub fn run_hook(
    kind: &str,
    command_line: &str,
    envs: &BTreeMap<String, String>,
    timeout: Duration,
    cancel: &CancelToken,
) {
    log::debug!("Running {kind} command {command_line}");
    let config = CommandExecutorConfig {
        exec: false,
        hide_output: false,
        envs: envs.clone(),
        ..CommandExecutorConfig::new(command_line, timeout)
    };
    match CommandExecutor::new(config).with_cancel(cancel.clone()).run() {
        Ok(ExecutionStatus::Exited(0)) => {}
        Ok(ExecutionStatus::Exited(code)) => {
            log::warn!("{kind} command '{command_line}' exited with {code}")
        }
        Ok(ExecutionStatus::Timeout) => log::warn!("{kind} command '{command_line}' timed out"),
        Ok(ExecutionStatus::Cancelled) => log::debug!("{kind} command '{command_line}' cancelled"),
        Err(e) => log::warn!("Failed to run {kind} command '{command_line}': {e}"),
    }
}
