//! `ToolRunner` backed by operating system processes

use super::{RunOutput, ToolCall, ToolRunner};
use crate::error::{CestError, CestResult};
use crate::app_log;
use crate::logger::LogLevel;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Spawns each call as a child process, optionally inside a working directory
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    current_dir: Option<PathBuf>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    fn collect<R: Read + Send + 'static>(stream: Option<R>) -> Option<JoinHandle<String>> {
        stream.map(|stream| {
            std::thread::spawn(move || {
                let reader = BufReader::new(stream);
                let mut text = String::new();
                for line in reader.lines().map_while(Result::ok) {
                    text.push_str(&line);
                    text.push('\n');
                }
                text
            })
        })
    }

    fn join(handle: Option<JoinHandle<String>>) -> String {
        handle.and_then(|h| h.join().ok()).unwrap_or_default()
    }

    /// Wait for the child, killing it once `timeout` has elapsed
    fn wait(
        child: &mut Child,
        program: &str,
        timeout: Option<Duration>,
    ) -> CestResult<std::process::ExitStatus> {
        let Some(timeout) = timeout else {
            return Ok(child.wait()?);
        };

        let started = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            if started.elapsed() >= timeout {
                app_log!(
                    LogLevel::Error,
                    "tools",
                    "{} exceeded {} s, terminating",
                    program,
                    timeout.as_secs()
                );
                child.kill()?;
                child.wait()?;
                return Err(CestError::ToolTimedOut {
                    tool: program.to_string(),
                    seconds: timeout.as_secs(),
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

impl ToolRunner for ProcessRunner {
    fn run(&self, call: &ToolCall, timeout: Option<Duration>) -> CestResult<RunOutput> {
        let mut cmd = Command::new(&call.program);
        cmd.args(call.command_line())
            .envs(&call.environ)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                CestError::ToolUnavailable(format!("can not locate {}", call.program))
            }
            _ => CestError::tool(&call.program, format!("failed to spawn: {}", e)),
        })?;

        let stdout = Self::collect(child.stdout.take());
        let stderr = Self::collect(child.stderr.take());

        let status = Self::wait(&mut child, &call.program, timeout)?;

        Ok(RunOutput {
            success: status.success(),
            code: status.code(),
            stdout: Self::join(stdout),
            stderr: Self::join(stderr),
        })
    }

    fn locate(&self, program: &str) -> Option<PathBuf> {
        let candidate = Path::new(program);
        if candidate.components().count() > 1 {
            return candidate.is_file().then(|| candidate.to_path_buf());
        }
        let search = std::env::var_os("PATH")?;
        std::env::split_paths(&search)
            .map(|dir| dir.join(program))
            .find(|path| path.is_file())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_run_captures_stdout() {
        let runner = ProcessRunner::new();
        let call = ToolCall::new("echo").arg("1250.5");
        let output = runner.run(&call, None).unwrap();
        assert!(output.success);
        assert_eq!(output.stdout.trim(), "1250.5");
    }

    #[test]
    fn test_run_reports_failure_status() {
        let runner = ProcessRunner::new();
        let call = ToolCall::new("sh").arg("-c").arg("echo boom >&2; exit 3");
        let output = runner.run(&call, None).unwrap();
        assert!(!output.success);
        assert_eq!(output.code, Some(3));
        assert!(output.stderr.contains("boom"));
    }

    #[test]
    fn test_run_passes_environment() {
        let runner = ProcessRunner::new();
        let mut environ = std::collections::BTreeMap::new();
        environ.insert("AFNI_DECONFLICT".to_string(), "OVERWRITE".to_string());
        let call = ToolCall::new("sh")
            .arg("-c")
            .arg("echo $AFNI_DECONFLICT")
            .environ(&environ);
        let output = runner.run(&call, None).unwrap();
        assert_eq!(output.stdout.trim(), "OVERWRITE");
    }

    #[test]
    fn test_timeout_kills_process() {
        let runner = ProcessRunner::new();
        let call = ToolCall::new("sleep").arg("5");
        let result = runner.run(&call, Some(Duration::from_millis(100)));
        assert!(matches!(result, Err(CestError::ToolTimedOut { .. })));
    }

    #[test]
    fn test_missing_program_is_unavailable() {
        let runner = ProcessRunner::new();
        let call = ToolCall::new("definitely-not-an-afni-program");
        let result = runner.run(&call, None);
        assert!(matches!(result, Err(CestError::ToolUnavailable(_))));
        assert!(runner.locate("definitely-not-an-afni-program").is_none());
    }

    #[test]
    fn test_locate_finds_shell() {
        let runner = ProcessRunner::new();
        assert!(runner.locate("sh").is_some());
        assert!(runner.locate("/bin/sh").is_some());
    }
}
