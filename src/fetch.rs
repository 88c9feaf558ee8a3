//! External commands and source refresh
//!
//! Network exports are produced by external programs that write a file. Each
//! program runs under a caller-enforced timeout; expiry kills the child and is
//! reported as a stage failure.

use crate::config::CommandSpec;
use crate::error::PipelineError;
use crate::retry::RetryPolicy;
use std::ffi::OsStr;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

/// `EX_TEMPFAIL`; exporters exit with it when the remote API rate limits them
pub const EXIT_TEMPFAIL: i32 = 75;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Captured output of a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// A program plus fixed arguments, run with a timeout
#[derive(Debug, Clone)]
pub struct ExternalCommand {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl From<&CommandSpec> for ExternalCommand {
    fn from(spec: &CommandSpec) -> Self {
        Self {
            program: spec.command.clone(),
            args: spec.args.clone(),
            timeout: Duration::from_secs(spec.timeout_secs),
        }
    }
}

impl ExternalCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    /// Run with `extra_args` appended
    ///
    /// Exit status 75 or a stderr mentioning `429` is reported as
    /// `RateLimited`; any other failure is `ExternalUnavailable` or `Timeout`.
    pub fn run<I, S>(&self, source_name: &str, extra_args: I) -> Result<CommandOutput, PipelineError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        debug!(source_name, program = %self.program, "running external command");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .args(extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| PipelineError::unavailable(source_name, format!("failed to start {}: {}", self.program, e)))?;

        // Drain pipes on their own threads so a chatty child cannot block
        let stdout_reader = drain(child.stdout.take());
        let stderr_reader = drain(child.stderr.take());

        let status = wait_with_timeout(&mut child, self.timeout, source_name)?;
        let output = CommandOutput {
            stdout: stdout_reader.join().unwrap_or_default(),
            stderr: stderr_reader.join().unwrap_or_default(),
        };

        if status.success() {
            return Ok(output);
        }
        if status.code() == Some(EXIT_TEMPFAIL) || output.stderr.contains("429") {
            return Err(PipelineError::RateLimited {
                source_name: source_name.to_string(),
                attempts: 1,
            });
        }
        let detail = output.stderr.trim().lines().last().unwrap_or("").to_string();
        Err(PipelineError::unavailable(
            source_name,
            format!("{} exited with {}: {}", self.program, status, detail),
        ))
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn wait_with_timeout(child: &mut Child, timeout: Duration, source_name: &str) -> Result<ExitStatus, PipelineError> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            warn!(source_name, timeout_secs = timeout.as_secs(), "external command timed out, killing");
            let _ = child.kill();
            let _ = child.wait();
            return Err(PipelineError::Timeout {
                source_name: source_name.to_string(),
                seconds: timeout.as_secs(),
            });
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Whether `path` exists and was modified within `max_age`
pub fn is_file_recent(path: &Path, max_age: Duration) -> bool {
    let Ok(modified) = path.metadata().and_then(|m| m.modified()) else {
        return false;
    };
    SystemTime::now()
        .duration_since(modified)
        .map(|age| age <= max_age)
        .unwrap_or(true)
}

/// How a source file was made available
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    /// Existing file was recent enough to reuse
    ReusedRecent,
    /// The fetch command wrote a fresh file
    Fetched,
    /// The fetch failed and the previous file is used
    ReusedAfterFailure,
    /// No fetch command configured; the file is used as found
    NotConfigured,
}

/// Refreshes source files by running their configured commands
#[derive(Debug, Clone)]
pub struct SourceFetcher {
    reuse_recent: Duration,
    retry: RetryPolicy,
}

impl SourceFetcher {
    pub fn new(reuse_recent: Duration, retry: RetryPolicy) -> Self {
        Self { reuse_recent, retry }
    }

    /// Make `target` available, fetching it with `spec` when needed
    pub fn refresh(
        &self,
        source_name: &str,
        target: &Path,
        spec: Option<&CommandSpec>,
    ) -> Result<FetchStatus, PipelineError> {
        if is_file_recent(target, self.reuse_recent) {
            info!(source_name, path = %target.display(), "using recent file");
            return Ok(FetchStatus::ReusedRecent);
        }
        let Some(spec) = spec else {
            return Ok(FetchStatus::NotConfigured);
        };

        let command = ExternalCommand::from(spec);
        let fetched = self
            .retry
            .run(source_name, |_| command.run(source_name, std::iter::empty::<&str>()))
            .and_then(|_| {
                if target.exists() {
                    Ok(())
                } else {
                    Err(PipelineError::unavailable(
                        source_name,
                        format!("command did not produce {}", target.display()),
                    ))
                }
            });

        match fetched {
            Ok(()) => {
                info!(source_name, path = %target.display(), "fetched source");
                Ok(FetchStatus::Fetched)
            }
            Err(e) if target.exists() => {
                warn!(source_name, error = %e, "fetch failed, reusing existing file");
                Ok(FetchStatus::ReusedAfterFailure)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::fs;

    fn sh(script: &str, timeout: Duration) -> ExternalCommand {
        ExternalCommand::new("sh", vec!["-c".into(), script.into()], timeout)
    }

    #[test]
    fn test_captures_stdout() {
        let output = sh("echo \"$0\"", Duration::from_secs(10))
            .run("test", ["hello"])
            .unwrap();
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[test]
    fn test_tempfail_is_rate_limited() {
        let err = sh("exit 75", Duration::from_secs(10))
            .run("qualtrics", std::iter::empty::<&str>())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimited);

        let err = sh("echo 'HTTP 429 Too Many Requests' >&2; exit 1", Duration::from_secs(10))
            .run("qualtrics", std::iter::empty::<&str>())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimited);
    }

    #[test]
    fn test_failure_is_unavailable() {
        let err = sh("echo boom >&2; exit 3", Duration::from_secs(10))
            .run("supabase", std::iter::empty::<&str>())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExternalUnavailable);
        assert!(err.to_string().contains("boom"));

        let err = ExternalCommand::new("/nonexistent/exporter", vec![], Duration::from_secs(1))
            .run("supabase", std::iter::empty::<&str>())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExternalUnavailable);
    }

    #[test]
    fn test_timeout_kills_child() {
        let started = Instant::now();
        let err = sh("sleep 5", Duration::from_millis(200))
            .run("slow", std::iter::empty::<&str>())
            .unwrap_err();
        assert!(matches!(err, PipelineError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_recent_file_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("diary.csv");
        fs::write(&target, "RANDOM_ID\n").unwrap();

        let fetcher = SourceFetcher::new(Duration::from_secs(600), RetryPolicy::default());
        let spec = CommandSpec {
            command: "false".into(),
            args: vec![],
            timeout_secs: 5,
        };
        assert_eq!(
            fetcher.refresh("diary", &target, Some(&spec)).unwrap(),
            FetchStatus::ReusedRecent
        );
    }

    #[test]
    fn test_failed_fetch_falls_back_to_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("contacts.csv");
        let spec = CommandSpec {
            command: "false".into(),
            args: vec![],
            timeout_secs: 5,
        };
        let fetcher = SourceFetcher::new(Duration::ZERO, RetryPolicy::default());

        let err = fetcher.refresh("contacts", &target, Some(&spec)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExternalUnavailable);

        fs::write(&target, "RANDOM_ID\n").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(
            fetcher.refresh("contacts", &target, Some(&spec)).unwrap(),
            FetchStatus::ReusedAfterFailure
        );
    }

    #[test]
    fn test_fetch_writes_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("uploads.csv");
        let spec = CommandSpec {
            command: "sh".into(),
            args: vec!["-c".into(), format!("echo id > '{}'", target.display())],
            timeout_secs: 5,
        };
        let fetcher = SourceFetcher::new(Duration::ZERO, RetryPolicy::default());

        assert_eq!(
            fetcher.refresh("uploads", &target, Some(&spec)).unwrap(),
            FetchStatus::Fetched
        );
    }
}
