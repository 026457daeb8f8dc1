use crate::context::RunContext;
use crate::coverage::CoverageMap;
use anyhow::{Context as _, anyhow};
use log::{debug, warn};
use std::io::{Read, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Outcome of running the target once.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub coverage: Option<CoverageMap>,
    pub output: Vec<u8>,
    pub exit_code: i32,
    pub crashed: bool,
    pub timed_out: bool,
    pub duration: Duration,
}

/// Runs the target with one input. Injected into the feedback loop.
pub trait Executor: Send + Sync {
    fn execute(&self, ctx: &RunContext, input: &[u8]) -> anyhow::Result<ExecutionResult>;
}

/// Runs a Rust harness in the current process.
///
/// The harness records the edges it walks into the provided map. A panic is
/// reported as a crash with the panic message as output.
pub struct InProcessExecutor<F>
where
    F: Fn(&[u8], &mut CoverageMap) + Send + Sync,
{
    harness_fn: F,
    map_size: usize,
}

impl<F> InProcessExecutor<F>
where
    F: Fn(&[u8], &mut CoverageMap) + Send + Sync,
{
    pub fn new(harness_fn: F, map_size: usize) -> Self {
        Self {
            harness_fn,
            map_size,
        }
    }
}

impl<F> Executor for InProcessExecutor<F>
where
    F: Fn(&[u8], &mut CoverageMap) + Send + Sync,
{
    fn execute(&self, ctx: &RunContext, input: &[u8]) -> anyhow::Result<ExecutionResult> {
        if ctx.is_done() {
            return Err(anyhow!("Execution context already cancelled"));
        }
        let mut coverage = CoverageMap::new(self.map_size);
        let start = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(|| {
            (self.harness_fn)(input, &mut coverage);
        }));
        let duration = start.elapsed();

        let mut execution = ExecutionResult {
            coverage: Some(coverage),
            duration,
            ..ExecutionResult::default()
        };
        if let Err(panic_payload) = result {
            let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic type".to_string()
            };
            execution.crashed = true;
            execution.exit_code = -1;
            execution.output = msg.into_bytes();
        }
        Ok(execution)
    }
}

#[derive(Debug, Clone)]
pub enum InputDelivery {
    StdIn,
    /// Writes the input to a temp file and substitutes its path for `{}`.
    File(String),
}

#[derive(Debug, Clone)]
pub struct CommandExecutorConfig {
    pub command: Vec<String>,
    pub input_delivery: InputDelivery,
    pub timeout: Duration,
    pub working_dir: Option<PathBuf>,
}

/// Runs an external program once per input. Produces no coverage.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    config: CommandExecutorConfig,
}

enum WaitOutcome {
    Exited(ExitStatus),
    TimedOut,
}

impl CommandExecutor {
    pub fn new(config: CommandExecutorConfig) -> anyhow::Result<Self> {
        if config.command.is_empty() {
            return Err(anyhow!("Command executor requires a non-empty command"));
        }
        Ok(Self { config })
    }

    fn effective_timeout(&self, ctx: &RunContext) -> Duration {
        match ctx.remaining() {
            Some(remaining) if remaining < self.config.timeout => remaining,
            _ => self.config.timeout,
        }
    }

    fn run_and_wait_with_timeout(
        &self,
        child: &mut Child,
        ctx: &RunContext,
        timeout: Duration,
    ) -> anyhow::Result<WaitOutcome> {
        let start_time = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(WaitOutcome::Exited(status)),
                Ok(None) => {
                    if start_time.elapsed() > timeout || ctx.is_cancelled() {
                        debug!("Target timed out, killing...");
                        child
                            .kill()
                            .context("Failed to kill timed-out process")?;
                        let _ = child.wait();
                        return Ok(WaitOutcome::TimedOut);
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                Err(e) => return Err(anyhow!("Error waiting for child: {e}")),
            }
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut reader| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = reader.read_to_end(&mut buf);
            buf
        })
    })
}

/// Writes `input` to the child's stdin off the calling thread, so a target that
/// never reads cannot block past the timeout. The pipe closes when the write ends.
fn feed(stdin: Option<ChildStdin>, input: Vec<u8>) -> Option<JoinHandle<()>> {
    stdin.map(|mut pipe| {
        thread::spawn(move || {
            // A target that exits without reading stdin yields a broken pipe.
            if let Err(e) = pipe.write_all(&input) {
                debug!("Error writing to child stdin: {e}");
            }
        })
    })
}

fn collect(stdout: Option<JoinHandle<Vec<u8>>>, stderr: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    let mut output = Vec::new();
    for handle in [stdout, stderr].into_iter().flatten() {
        if let Ok(bytes) = handle.join() {
            output.extend_from_slice(&bytes);
        }
    }
    output
}

#[cfg(unix)]
fn terminated_by_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn terminated_by_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

impl Executor for CommandExecutor {
    fn execute(&self, ctx: &RunContext, input: &[u8]) -> anyhow::Result<ExecutionResult> {
        let mut cmd = Command::new(&self.config.command[0]);
        cmd.args(&self.config.command[1..]);
        if let Some(cwd) = &self.config.working_dir {
            cmd.current_dir(cwd);
        }

        let mut temp_file_handle: Option<tempfile::NamedTempFile> = None;
        match &self.config.input_delivery {
            InputDelivery::StdIn => {
                cmd.stdin(Stdio::piped());
            }
            InputDelivery::File(arg_template) => {
                let mut named_temp_file =
                    tempfile::NamedTempFile::new().context("Failed to create temp file")?;
                if let Err(e) = named_temp_file
                    .write_all(input)
                    .and_then(|_| named_temp_file.flush())
                {
                    return Err(anyhow!(
                        "Failed to write to temp file {:?}: {}",
                        named_temp_file.path(),
                        e
                    ));
                }
                let path_str = named_temp_file
                    .path()
                    .to_str()
                    .ok_or_else(|| anyhow!("Temp file path is not valid UTF-8"))?
                    .to_string();
                for part in arg_template.replace("{}", &path_str).split_whitespace() {
                    cmd.arg(part);
                }
                cmd.stdin(Stdio::null());
                temp_file_handle = Some(named_temp_file);
            }
        }
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let start = Instant::now();
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn command '{:?}'", self.config.command))?;

        let stdout = drain::<ChildStdout>(child.stdout.take());
        let stderr = drain::<ChildStderr>(child.stderr.take());

        let feeder = match self.config.input_delivery {
            InputDelivery::StdIn => feed(child.stdin.take(), input.to_vec()),
            InputDelivery::File(_) => None,
        };
        let timeout = self.effective_timeout(ctx);
        let outcome = self.run_and_wait_with_timeout(&mut child, ctx, timeout);
        if let Some(feeder) = feeder {
            let _ = feeder.join();
        }
        let output = collect(stdout, stderr);
        let duration = start.elapsed();
        drop(temp_file_handle);

        let mut result = ExecutionResult {
            output,
            duration,
            ..ExecutionResult::default()
        };
        match outcome? {
            WaitOutcome::TimedOut => {
                result.timed_out = true;
                result.exit_code = -1;
            }
            WaitOutcome::Exited(status) => {
                if let Some(code) = status.code() {
                    result.exit_code = code;
                    result.crashed = code != 0;
                } else if let Some(signal) = terminated_by_signal(&status) {
                    result.exit_code = 128 + signal;
                    result.crashed = true;
                } else {
                    warn!("Target exited abnormally without code or signal");
                    result.exit_code = -1;
                    result.crashed = true;
                }
            }
        }
        Ok(result)
    }
}


#[cfg(all(test, unix))]
mod command_executor_tests {
    use super::*;

    fn shell(script: &str, timeout: Duration) -> CommandExecutor {
        CommandExecutor::new(CommandExecutorConfig {
            command: vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
            input_delivery: InputDelivery::StdIn,
            timeout,
            working_dir: None,
        })
        .unwrap()
    }

    #[test]
    fn cmd_exec_captures_output_via_stdin() {
        let executor = shell("cat", Duration::from_secs(5));
        let result = executor.execute(&RunContext::new(), b"hello").unwrap();
        assert_eq!(result.output, b"hello");
        assert_eq!(result.exit_code, 0);
        assert!(!result.crashed);
        assert!(result.coverage.is_none());
    }

    #[test]
    fn cmd_exec_nonzero_exit_is_crash() {
        let executor = shell("exit 3", Duration::from_secs(5));
        let result = executor.execute(&RunContext::new(), b"").unwrap();
        assert!(result.crashed);
        assert_eq!(result.exit_code, 3);
    }

    #[test]
    fn cmd_exec_timeout() {
        let executor = shell("sleep 5", Duration::from_millis(100));
        let result = executor.execute(&RunContext::new(), b"").unwrap();
        assert!(result.timed_out);
        assert!(!result.crashed);
    }

    #[test]
    fn cmd_exec_timeout_holds_when_target_ignores_large_stdin() {
        let executor = CommandExecutor::new(CommandExecutorConfig {
            command: vec!["/bin/sleep".to_string(), "3".to_string()],
            input_delivery: InputDelivery::StdIn,
            timeout: Duration::from_millis(100),
            working_dir: None,
        })
        .unwrap();
        let input = vec![b'A'; 2 << 20];
        let start = Instant::now();
        let result = executor.execute(&RunContext::new(), &input).unwrap();
        assert!(result.timed_out);
        assert!(!result.crashed);
        assert!(start.elapsed() < Duration::from_secs(2), "took {:?}", start.elapsed());
    }

    #[test]
    fn cmd_exec_input_via_file() {
        let executor = CommandExecutor::new(CommandExecutorConfig {
            command: vec!["/bin/cat".to_string()],
            input_delivery: InputDelivery::File("{}".to_string()),
            timeout: Duration::from_secs(5),
            working_dir: None,
        })
        .unwrap();
        let result = executor.execute(&RunContext::new(), b"OK_FILE").unwrap();
        assert_eq!(result.output, b"OK_FILE");
    }

    #[test]
    fn cmd_exec_invalid_command_is_error() {
        let executor = CommandExecutor::new(CommandExecutorConfig {
            command: vec!["./this_command_does_not_exist_ever_12345.sh".to_string()],
            input_delivery: InputDelivery::StdIn,
            timeout: Duration::from_secs(1),
            working_dir: None,
        })
        .unwrap();
        let err = executor.execute(&RunContext::new(), b"").unwrap_err();
        assert!(format!("{err:#}").contains("Failed to spawn command"));
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(
            CommandExecutor::new(CommandExecutorConfig {
                command: vec![],
                input_delivery: InputDelivery::StdIn,
                timeout: Duration::from_secs(1),
                working_dir: None,
            })
            .is_err()
        );
    }
}
