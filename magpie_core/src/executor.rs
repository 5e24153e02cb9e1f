use crate::coverage::CoverageSignature;
use crate::input::Input;
use std::fs;
use std::io::Write;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Environment variable through which the target learns its per-run
/// coverage file path.
pub const DEFAULT_COVERAGE_ENV: &str = "MAGPIE_COVERAGE_FILE";

/// How often the child is polled while waiting for it to finish. Short
/// enough that even a 100 ms budget is honored promptly.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How one target run ended. A timeout or crash is an observation about the
/// input, not an error of the harness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Timeout,
    Crash(String),
}

/// Everything one execution tells us. Transient: consumed by the iteration
/// that requested it.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub outcome: Outcome,
    /// Coverage units this run touched.
    pub signature: CoverageSignature,
    pub wall_time: Duration,
    /// Signal that terminated the target, if any (Unix).
    pub exit_signal: Option<i32>,
}

/// Harness-side execution failures. Any of these is fatal to the campaign:
/// they mean we cannot run or supervise the target at all, which is a very
/// different thing from the target crashing on an input.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Execution setup failed: {0}")]
    Setup(String),
    #[error("Target supervision failed: {0}")]
    Supervision(String),
}

/// Runs candidate payloads against the target.
pub trait Executor<I: Input>: Send {
    /// Executes `input` under the given wall-clock budget.
    ///
    /// Implementations must return within the budget plus scheduling slack
    /// and must not leak the target process on a timeout.
    fn run(&mut self, input: &I, timeout: Duration) -> Result<ExecutionResult, ExecError>;
}

/// Executes a harness closure inside this process.
///
/// The harness returns the coverage signature of the run; a panic is
/// reported as a crash. In-process execution cannot be preempted, so the
/// budget is only checked after the fact. This executor exists for tests,
/// demos, and library targets; subprocess fuzzing goes through
/// [`CommandExecutor`].
pub struct InProcessExecutor<F>
where
    F: Fn(&[u8]) -> CoverageSignature,
{
    harness_fn: F,
}

impl<F> InProcessExecutor<F>
where
    F: Fn(&[u8]) -> CoverageSignature,
{
    pub fn new(harness_fn: F) -> Self {
        Self { harness_fn }
    }
}

impl<I: Input, F> Executor<I> for InProcessExecutor<F>
where
    F: Fn(&[u8]) -> CoverageSignature + Send,
{
    fn run(&mut self, input: &I, timeout: Duration) -> Result<ExecutionResult, ExecError> {
        let start = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(|| (self.harness_fn)(input.as_bytes())));
        let wall_time = start.elapsed();

        match result {
            Ok(signature) => {
                let outcome = if wall_time > timeout {
                    Outcome::Timeout
                } else {
                    Outcome::Ok
                };
                Ok(ExecutionResult {
                    outcome,
                    signature,
                    wall_time,
                    exit_signal: None,
                })
            }
            Err(panic_payload) => {
                let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic type".to_string()
                };
                // Whatever coverage the harness gathered died with the
                // unwind; a crash run reports an empty signature.
                Ok(ExecutionResult {
                    outcome: Outcome::Crash(msg),
                    signature: CoverageSignature::new(),
                    wall_time,
                    exit_signal: None,
                })
            }
        }
    }
}

/// How the payload reaches a subprocess target.
pub enum InputDelivery {
    /// Written to the target's stdin.
    StdIn,
    /// Written to a temp file whose path replaces `{}` in the template,
    /// e.g. `"--input={}"` or just `"{}"`.
    File(String),
}

pub struct CommandExecutorConfig {
    pub command: Vec<String>,
    pub input_delivery: InputDelivery,
    pub working_dir: Option<PathBuf>,
    /// Name of the environment variable carrying the coverage file path.
    pub coverage_env: String,
}

/// Runs the target as a subprocess.
///
/// Coverage is observed through a per-run temp file: the executor exports
/// its path in an environment variable, the target appends one decimal
/// unit id per line, and the file is parsed after the run. Uninstrumented
/// targets simply yield empty signatures.
///
/// On a blown budget the child is killed and reaped before the call
/// returns, so a timeout can never leak a process.
pub struct CommandExecutor {
    config: CommandExecutorConfig,
}

impl CommandExecutor {
    pub fn new(config: CommandExecutorConfig) -> Self {
        Self { config }
    }

    /// Polls the child until it exits or the budget runs out. Returns
    /// `Ok(None)` for a timeout, after the child has been killed and
    /// reaped.
    fn wait_with_deadline(
        &self,
        child: &mut Child,
        timeout: Duration,
    ) -> Result<Option<ExitStatus>, ExecError> {
        let start = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(Some(status)),
                Ok(None) => {
                    if start.elapsed() >= timeout {
                        match child.kill() {
                            Ok(()) => {
                                let _ = child.wait();
                                return Ok(None);
                            }
                            Err(kill_err) => {
                                // Usually means the child exited right at
                                // the deadline.
                                if let Ok(Some(status)) = child.try_wait() {
                                    return Ok(Some(status));
                                }
                                return Err(ExecError::Supervision(format!(
                                    "Failed to kill timed-out target: {kill_err}"
                                )));
                            }
                        }
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    return Err(ExecError::Supervision(format!(
                        "Error waiting for target: {e}"
                    )));
                }
            }
        }
    }
}

/// Parses the per-run coverage file: one decimal unit id per line, other
/// lines ignored. A missing or unreadable file means an uninstrumented
/// target and yields an empty signature.
fn read_coverage_file(path: &Path) -> CoverageSignature {
    match fs::read_to_string(path) {
        Ok(text) => text
            .lines()
            .filter_map(|line| line.trim().parse::<u64>().ok())
            .collect(),
        Err(_) => CoverageSignature::new(),
    }
}

impl<I: Input> Executor<I> for CommandExecutor {
    fn run(&mut self, input: &I, timeout: Duration) -> Result<ExecutionResult, ExecError> {
        if self.config.command.is_empty() {
            return Err(ExecError::Setup("No target command configured".to_string()));
        }
        let start = Instant::now();

        let mut cmd = Command::new(&self.config.command[0]);
        if self.config.command.len() > 1 {
            cmd.args(&self.config.command[1..]);
        }
        if let Some(cwd) = &self.config.working_dir {
            cmd.current_dir(cwd);
        }

        let coverage_file = tempfile::NamedTempFile::new()
            .map_err(|e| ExecError::Setup(format!("Failed to create coverage file: {e}")))?;
        cmd.env(&self.config.coverage_env, coverage_file.path());

        let mut input_file_handle: Option<tempfile::NamedTempFile> = None;
        match &self.config.input_delivery {
            InputDelivery::StdIn => {
                cmd.stdin(Stdio::piped());
            }
            InputDelivery::File(arg_template) => {
                let named_temp_file = tempfile::NamedTempFile::new()
                    .map_err(|e| ExecError::Setup(format!("Failed to create temp file: {e}")))?;
                fs::write(named_temp_file.path(), input.as_bytes()).map_err(|e| {
                    ExecError::Setup(format!(
                        "Failed to write to temp file {:?}: {}",
                        named_temp_file.path(),
                        e
                    ))
                })?;
                let path_str = named_temp_file.path().to_str().ok_or_else(|| {
                    ExecError::Setup("Temp file path is not valid UTF-8".to_string())
                })?;
                let final_arg = arg_template.replace("{}", path_str);
                for part in final_arg.split_whitespace() {
                    cmd.arg(part);
                }
                cmd.stdin(Stdio::null());
                input_file_handle = Some(named_temp_file);
            }
        }

        // The target's own output is not part of the contract; discarding
        // it also means a chatty target cannot fill a pipe and stall.
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());

        let mut child = cmd.spawn().map_err(|e| {
            ExecError::Setup(format!(
                "Failed to spawn command '{:?}': {}",
                self.config.command, e
            ))
        })?;

        // Feed stdin from a helper thread so a target that never reads
        // cannot stall this worker past the budget.
        let stdin_writer = if let InputDelivery::StdIn = self.config.input_delivery {
            let mut child_stdin = child.stdin.take().ok_or_else(|| {
                ExecError::Setup("Child stdin was not available after piping".to_string())
            })?;
            let payload = input.as_bytes().to_vec();
            Some(std::thread::spawn(move || {
                let _ = child_stdin.write_all(&payload);
            }))
        } else {
            None
        };

        let waited = self.wait_with_deadline(&mut child, timeout);
        if waited.is_err() {
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Some(handle) = stdin_writer {
            let _ = handle.join();
        }
        let exit_status = waited?;

        let wall_time = start.elapsed();
        let signature = read_coverage_file(coverage_file.path());
        drop(coverage_file);
        drop(input_file_handle);

        let result = match exit_status {
            None => {
                log::debug!("target timed out after {:?}, killed", wall_time);
                ExecutionResult {
                    outcome: Outcome::Timeout,
                    signature,
                    wall_time,
                    exit_signal: None,
                }
            }
            Some(status) => {
                #[cfg(unix)]
                let exit_signal = {
                    use std::os::unix::process::ExitStatusExt;
                    status.signal()
                };
                #[cfg(not(unix))]
                let exit_signal: Option<i32> = None;

                if status.success() {
                    ExecutionResult {
                        outcome: Outcome::Ok,
                        signature,
                        wall_time,
                        exit_signal,
                    }
                } else {
                    let desc = if let Some(code) = status.code() {
                        format!("Exited with code {code}")
                    } else if let Some(signal) = exit_signal {
                        format!("Terminated by signal {signal}")
                    } else {
                        "Exited abnormally".to_string()
                    };
                    ExecutionResult {
                        outcome: Outcome::Crash(desc),
                        signature,
                        wall_time,
                        exit_signal,
                    }
                }
            }
        };
        Ok(result)
    }
}


#[cfg(test)]
mod command_executor_tests {
    use super::*;

    fn get_test_target_path(name: &str) -> PathBuf {
        let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        manifest_dir.join("../test_targets").join(name)
    }

    fn config_for(name: &str, delivery: InputDelivery) -> CommandExecutorConfig {
        let target_path = get_test_target_path(name);
        if !target_path.exists() {
            panic!("Test target missing: {target_path:?}");
        }
        CommandExecutorConfig {
            command: vec![target_path.to_str().unwrap().to_string()],
            input_delivery: delivery,
            working_dir: None,
            coverage_env: DEFAULT_COVERAGE_ENV.to_string(),
        }
    }

    #[test]
    fn cmd_exec_successful_run_stdin() {
        let mut executor = CommandExecutor::new(config_for("test_target_ok.sh", InputDelivery::StdIn));
        let input: Vec<u8> = b"hello".to_vec();
        let result = executor.run(&input, Duration::from_secs(2)).unwrap();
        assert_eq!(result.outcome, Outcome::Ok);
        assert_eq!(result.exit_signal, None);
    }

    #[test]
    fn cmd_exec_crash_detection_via_signal() {
        let mut executor =
            CommandExecutor::new(config_for("test_target_crash.sh", InputDelivery::StdIn));
        let input: Vec<u8> = vec![];
        let result = executor.run(&input, Duration::from_secs(2)).unwrap();
        match result.outcome {
            Outcome::Crash(desc) => {
                assert!(
                    desc.contains("signal 11") || desc.contains("code 139"),
                    "Unexpected crash desc: {desc}"
                );
            }
            other => panic!("Expected Crash outcome, got {other:?}"),
        }
    }

    #[test]
    fn cmd_exec_timeout_kills_target_promptly() {
        let mut executor =
            CommandExecutor::new(config_for("test_target_timeout.sh", InputDelivery::StdIn));
        let input: Vec<u8> = vec![];
        let start = Instant::now();
        // Script sleeps 5 s; the 100 ms budget must win.
        let result = executor.run(&input, Duration::from_millis(100)).unwrap();
        let elapsed = start.elapsed();
        assert_eq!(result.outcome, Outcome::Timeout);
        assert!(
            elapsed < Duration::from_secs(2),
            "timeout not enforced promptly: {elapsed:?}"
        );
    }

    #[test]
    fn cmd_exec_input_via_file() {
        let mut executor = CommandExecutor::new(config_for(
            "test_target_file_check.sh",
            InputDelivery::File("{}".to_string()),
        ));

        let ok_input: Vec<u8> = b"OK_FILE".to_vec();
        let result_ok = executor.run(&ok_input, Duration::from_secs(2)).unwrap();
        assert_eq!(result_ok.outcome, Outcome::Ok);

        let crash_input: Vec<u8> = b"CRASHFILE".to_vec();
        let result_crash = executor.run(&crash_input, Duration::from_secs(2)).unwrap();
        match result_crash.outcome {
            Outcome::Crash(desc) => {
                assert!(desc.contains("code 1"), "Expected exit code 1, got: {desc}")
            }
            other => panic!("Expected Crash outcome for CRASHFILE, got {other:?}"),
        }
    }

    #[test]
    fn cmd_exec_collects_coverage_units() {
        let mut executor =
            CommandExecutor::new(config_for("test_target_coverage.sh", InputDelivery::StdIn));
        let input: Vec<u8> = b"abc".to_vec();
        let result = executor.run(&input, Duration::from_secs(2)).unwrap();
        assert_eq!(result.outcome, Outcome::Ok);
        // The script reports units 7, 11, 13 and one garbage line.
        assert_eq!(
            result.signature,
            CoverageSignature::from_units([7, 11, 13])
        );
    }

    #[test]
    fn cmd_exec_invalid_command_is_a_setup_error() {
        let config = CommandExecutorConfig {
            command: vec!["./this_command_does_not_exist_ever_12345.sh".to_string()],
            input_delivery: InputDelivery::StdIn,
            working_dir: None,
            coverage_env: DEFAULT_COVERAGE_ENV.to_string(),
        };
        let mut executor = CommandExecutor::new(config);
        let input: Vec<u8> = vec![];
        let err = <CommandExecutor as Executor<Vec<u8>>>::run(
            &mut executor,
            &input,
            Duration::from_secs(1),
        )
        .unwrap_err();
        match err {
            ExecError::Setup(msg) => assert!(msg.contains("Failed to spawn")),
            other => panic!("Expected Setup error, got {other:?}"),
        }
    }

    #[test]
    fn cmd_exec_empty_command_is_a_setup_error() {
        let config = CommandExecutorConfig {
            command: vec![],
            input_delivery: InputDelivery::StdIn,
            working_dir: None,
            coverage_env: DEFAULT_COVERAGE_ENV.to_string(),
        };
        let mut executor = CommandExecutor::new(config);
        let input: Vec<u8> = vec![1];
        let err = <CommandExecutor as Executor<Vec<u8>>>::run(
            &mut executor,
            &input,
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(matches!(err, ExecError::Setup(_)));
    }
}
