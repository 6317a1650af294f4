//! External tool invocation
//!
//! Every image-processing step is a `ToolCall`: a program name, ordered
//! arguments, the output files it promises to write and the environment it
//! runs under. A `ToolRunner` executes calls; the `ToolInvoker` layers the
//! optional invocation cache and output verification on top of it.
//!
//! # Example
//! ```ignore
//! use cestreg::tools::{ProcessRunner, ToolCall, ToolInvoker};
//! use std::sync::Arc;
//!
//! let invoker = ToolInvoker::new(Arc::new(ProcessRunner::new()), "/data/out");
//! let call = ToolCall::new("3dUnifize")
//!     .opt("-prefix", "/data/out/anat_unifized.nii")
//!     .opt("-input", "/data/out/anat.nii")
//!     .output("out_file", "/data/out/anat_unifized.nii");
//! let outputs = invoker.invoke(&call, false)?;
//! ```

pub mod cache;
pub mod mock;
pub mod process;

pub use cache::{CacheStore, InvocationRecord, JsonCacheStore, MemoryCacheStore};
pub use process::ProcessRunner;

use crate::config::Verbosity;
use crate::error::{CestError, CestResult};
use crate::app_log;
use crate::logger::LogLevel;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// One command-line argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolArg {
    /// Bare switch, e.g. `-quintic`
    Flag(String),
    /// Option followed by one or more values, e.g. `-dxyz 0.1 0.1 0.5`
    Opt(String, Vec<String>),
    /// Positional value
    Positional(String),
}

/// A single external processing request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub program: String,
    pub args: Vec<ToolArg>,
    /// Files the program must have written when it exits successfully
    pub outputs: BTreeMap<String, PathBuf>,
    pub environ: BTreeMap<String, String>,
    /// Write captured stdout to this file after a successful run
    pub stdout_to: Option<PathBuf>,
    /// Whether results may be served from the invocation cache
    pub cacheable: bool,
}

impl ToolCall {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            outputs: BTreeMap::new(),
            environ: BTreeMap::new(),
            stdout_to: None,
            cacheable: true,
        }
    }

    pub fn flag(mut self, name: impl Into<String>) -> Self {
        self.args.push(ToolArg::Flag(name.into()));
        self
    }

    pub fn opt(mut self, name: impl Into<String>, value: impl AsRef<std::ffi::OsStr>) -> Self {
        let value = value.as_ref().to_string_lossy().to_string();
        self.args.push(ToolArg::Opt(name.into(), vec![value]));
        self
    }

    pub fn opt_n<I, V>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: ToString,
    {
        let values = values.into_iter().map(|v| v.to_string()).collect();
        self.args.push(ToolArg::Opt(name.into(), values));
        self
    }

    pub fn arg(mut self, value: impl AsRef<std::ffi::OsStr>) -> Self {
        let value = value.as_ref().to_string_lossy().to_string();
        self.args.push(ToolArg::Positional(value));
        self
    }

    /// Declare an output file under a logical name
    pub fn output(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.outputs.insert(name.into(), path.into());
        self
    }

    pub fn environ(mut self, environ: &BTreeMap<String, String>) -> Self {
        self.environ
            .extend(environ.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn stdout_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout_to = Some(path.into());
        self
    }

    /// Always execute, e.g. for programs editing a file in place
    pub fn uncached(mut self) -> Self {
        self.cacheable = false;
        self
    }

    /// Arguments as passed to the process
    pub fn command_line(&self) -> Vec<String> {
        let mut line = Vec::new();
        for arg in &self.args {
            match arg {
                ToolArg::Flag(name) => line.push(name.clone()),
                ToolArg::Opt(name, values) => {
                    line.push(name.clone());
                    line.extend(values.iter().cloned());
                }
                ToolArg::Positional(value) => line.push(value.clone()),
            }
        }
        line
    }

    /// First value of an option
    pub fn option(&self, name: &str) -> Option<&str> {
        self.option_values(name).first().copied()
    }

    /// All values of the first occurrence of an option
    pub fn option_values(&self, name: &str) -> Vec<&str> {
        self.args
            .iter()
            .find_map(|arg| match arg {
                ToolArg::Opt(n, values) if n == name => {
                    Some(values.iter().map(String::as_str).collect())
                }
                _ => None,
            })
            .unwrap_or_default()
    }

    pub fn has_flag(&self, name: &str) -> bool {
        self.args
            .iter()
            .any(|arg| matches!(arg, ToolArg::Flag(n) if n == name))
    }

    pub fn positionals(&self) -> Vec<&str> {
        self.args
            .iter()
            .filter_map(|arg| match arg {
                ToolArg::Positional(value) => Some(value.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Every path-like value mentioned in the arguments
    pub fn argument_values(&self) -> Vec<&str> {
        self.args
            .iter()
            .flat_map(|arg| match arg {
                ToolArg::Flag(_) => Vec::new(),
                ToolArg::Opt(_, values) => values.iter().map(String::as_str).collect(),
                ToolArg::Positional(value) => vec![value.as_str()],
            })
            .collect()
    }
}

/// Raw result of running a process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Declared outputs of a finished call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutputs {
    pub files: BTreeMap<String, PathBuf>,
    pub stdout: String,
    /// True when served from the invocation cache
    pub cached: bool,
}

impl ToolOutputs {
    pub fn file(&self, name: &str) -> CestResult<&Path> {
        self.files.get(name).map(PathBuf::as_path).ok_or_else(|| {
            CestError::PipelineError(format!("no declared output named '{}'", name))
        })
    }
}

/// Executes tool calls
pub trait ToolRunner: Send + Sync {
    fn run(&self, call: &ToolCall, timeout: Option<Duration>) -> CestResult<RunOutput>;

    /// Location of an installed program, `None` when absent
    fn locate(&self, program: &str) -> Option<PathBuf>;
}

/// Runs tool calls, verifying outputs and consulting the cache
#[derive(Clone)]
pub struct ToolInvoker {
    runner: Arc<dyn ToolRunner>,
    cache: Option<Arc<dyn CacheStore>>,
    working_dir: PathBuf,
    timeout: Option<Duration>,
    verbosity: Verbosity,
}

impl ToolInvoker {
    pub fn new(runner: Arc<dyn ToolRunner>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            cache: None,
            working_dir: working_dir.into(),
            timeout: None,
            verbosity: Verbosity::Verbose,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn runner(&self) -> &dyn ToolRunner {
        self.runner.as_ref()
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Run `call`, or replay a recorded identical call when `caching` is set.
    ///
    /// # Errors
    /// `ToolExecution` when the process fails or a declared output is
    /// missing afterwards. Failures are never retried.
    pub fn invoke(&self, call: &ToolCall, caching: bool) -> CestResult<ToolOutputs> {
        let cache = match (&self.cache, caching && call.cacheable) {
            (Some(cache), true) => Some(cache),
            _ => None,
        };

        let fingerprint = match cache {
            Some(_) => Some(cache::fingerprint(&self.working_dir, call)?),
            None => None,
        };

        if let (Some(cache), Some(fp)) = (cache, fingerprint.as_deref()) {
            if let Some(record) = cache.get(fp)? {
                if record.outputs.values().all(|p| p.exists()) {
                    app_log!(
                        LogLevel::Debug,
                        "tools",
                        "Cache hit for {} ({})",
                        call.program,
                        &fp[..12]
                    );
                    if let Some(path) = &call.stdout_to {
                        if !path.exists() {
                            std::fs::write(path, &record.stdout)?;
                        }
                    }
                    return Ok(ToolOutputs {
                        files: record.outputs,
                        stdout: record.stdout,
                        cached: true,
                    });
                }
            }
        }

        app_log!(
            LogLevel::Info,
            "tools",
            "Running {} {}",
            call.program,
            call.command_line().join(" ")
        );

        let output = self.runner.run(call, self.timeout)?;
        self.forward_output(call, &output);

        if !output.success {
            let detail = output
                .stderr
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .unwrap_or("no error output");
            return Err(CestError::tool(
                &call.program,
                format!("exit status {:?}: {}", output.code, detail),
            ));
        }

        if let Some(path) = &call.stdout_to {
            std::fs::write(path, &output.stdout)?;
        }

        for (name, path) in &call.outputs {
            if !path.exists() {
                return Err(CestError::tool(
                    &call.program,
                    format!("declared output '{}' missing: {}", name, path.display()),
                ));
            }
        }

        if let (Some(cache), Some(fp)) = (cache, fingerprint) {
            cache.put(&InvocationRecord::new(fp, call, &output.stdout))?;
        }

        Ok(ToolOutputs {
            files: call.outputs.clone(),
            stdout: output.stdout,
            cached: false,
        })
    }

    fn forward_output(&self, call: &ToolCall, output: &RunOutput) {
        if self.verbosity == Verbosity::Quiet {
            return;
        }
        for line in output.stdout.lines() {
            app_log!(LogLevel::Debug, "tools", "{} stdout: {}", call.program, line);
        }
        for line in output.stderr.lines() {
            app_log!(LogLevel::Warn, "tools", "{} stderr: {}", call.program, line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Runner writing every declared output and counting runs
    struct TouchRunner {
        runs: Mutex<usize>,
        write_outputs: bool,
        succeed: bool,
    }

    impl TouchRunner {
        fn new(write_outputs: bool, succeed: bool) -> Self {
            Self {
                runs: Mutex::new(0),
                write_outputs,
                succeed,
            }
        }

        fn runs(&self) -> usize {
            *self.runs.lock().unwrap()
        }
    }

    impl ToolRunner for TouchRunner {
        fn run(&self, call: &ToolCall, _timeout: Option<Duration>) -> CestResult<RunOutput> {
            *self.runs.lock().unwrap() += 1;
            if self.write_outputs {
                for path in call.outputs.values() {
                    std::fs::write(path, b"out").unwrap();
                }
            }
            Ok(RunOutput {
                success: self.succeed,
                code: Some(if self.succeed { 0 } else { 1 }),
                stdout: "0.42\n".to_string(),
                stderr: if self.succeed { String::new() } else { "** FATAL ERROR".to_string() },
            })
        }

        fn locate(&self, _program: &str) -> Option<PathBuf> {
            None
        }
    }

    #[test]
    fn test_command_line_rendering() {
        let call = ToolCall::new("3dresample")
            .opt_n("-dxyz", [0.1, 0.1, 0.5])
            .opt("-rmode", "Cu")
            .flag("-overwrite")
            .arg("in.nii");
        assert_eq!(
            call.command_line(),
            vec!["-dxyz", "0.1", "0.1", "0.5", "-rmode", "Cu", "-overwrite", "in.nii"]
        );
        assert_eq!(call.option("-rmode"), Some("Cu"));
        assert_eq!(call.option_values("-dxyz").len(), 3);
        assert!(call.has_flag("-overwrite"));
        assert_eq!(call.positionals(), vec!["in.nii"]);
    }

    #[test]
    fn test_invoke_writes_stdout_and_checks_outputs() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(TouchRunner::new(true, true));
        let invoker = ToolInvoker::new(runner.clone(), dir.path());
        let clip = dir.path().join("clip.txt");
        let out = dir.path().join("out.nii");
        let call = ToolCall::new("3dClipLevel")
            .arg("in.nii")
            .output("out_file", &out)
            .stdout_to(&clip);

        let outputs = invoker.invoke(&call, false).unwrap();
        assert!(!outputs.cached);
        assert_eq!(outputs.file("out_file").unwrap(), out.as_path());
        assert_eq!(std::fs::read_to_string(&clip).unwrap(), "0.42\n");
    }

    #[test]
    fn test_missing_declared_output_fails() {
        let dir = TempDir::new().unwrap();
        let invoker = ToolInvoker::new(Arc::new(TouchRunner::new(false, true)), dir.path());
        let call = ToolCall::new("3dWarp").output("out_file", dir.path().join("never.nii"));

        let result = invoker.invoke(&call, false);
        assert!(matches!(result, Err(CestError::ToolExecution { .. })));
    }

    #[test]
    fn test_nonzero_exit_fails_with_stderr() {
        let dir = TempDir::new().unwrap();
        let invoker = ToolInvoker::new(Arc::new(TouchRunner::new(true, false)), dir.path());
        let call = ToolCall::new("3dQwarp");

        match invoker.invoke(&call, false) {
            Err(CestError::ToolExecution { tool, message }) => {
                assert_eq!(tool, "3dQwarp");
                assert!(message.contains("FATAL"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_caching_skips_second_run() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(TouchRunner::new(true, true));
        let cache = Arc::new(JsonCacheStore::new(dir.path()));
        let invoker = ToolInvoker::new(runner.clone(), dir.path()).with_cache(cache);
        let call = ToolCall::new("3dUnifize").output("out_file", dir.path().join("u.nii"));

        let first = invoker.invoke(&call, true).unwrap();
        let second = invoker.invoke(&call, true).unwrap();
        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(runner.runs(), 1);

        // Without the caching flag the tool always runs
        invoker.invoke(&call, false).unwrap();
        assert_eq!(runner.runs(), 2);
    }

    #[test]
    fn test_uncached_calls_always_run() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(TouchRunner::new(true, true));
        let cache = Arc::new(JsonCacheStore::new(dir.path()));
        let invoker = ToolInvoker::new(runner.clone(), dir.path()).with_cache(cache);
        let call = ToolCall::new("3drefit")
            .output("out_file", dir.path().join("r.nii"))
            .uncached();

        invoker.invoke(&call, true).unwrap();
        invoker.invoke(&call, true).unwrap();
        assert_eq!(runner.runs(), 2);
    }

    #[test]
    fn test_cache_reruns_when_outputs_vanish() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(TouchRunner::new(true, true));
        let cache = Arc::new(JsonCacheStore::new(dir.path()));
        let invoker = ToolInvoker::new(runner.clone(), dir.path()).with_cache(cache);
        let out = dir.path().join("u.nii");
        let call = ToolCall::new("3dUnifize").output("out_file", &out);

        invoker.invoke(&call, true).unwrap();
        std::fs::remove_file(&out).unwrap();
        let again = invoker.invoke(&call, true).unwrap();
        assert!(!again.cached);
        assert_eq!(runner.runs(), 2);
    }
}
