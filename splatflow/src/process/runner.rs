//! Streaming supervisor for external commands.
//!
//! Standard output and error are merged and consumed line by line as they
//! are produced: each line is stripped of terminal escapes, forwarded to
//! the event sink tagged with the step name, appended to a per-invocation
//! log file, and scanned for a progress signal. Cancellation and timeouts
//! unwind the read loop and terminate the child; a failed subprocess is a
//! normal `false` return, never an error.

use super::progress::{extract_progress, strip_ansi};
use crate::cancellation::CancellationToken;
use crate::events::{EventLevel, EventSink};
use crate::utils::{iso_timestamp, run_timestamp, slug};
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Callback invoked as progress percentages are parsed from output:
/// `(step_name, percent)`.
pub type ProgressCallback = Arc<dyn Fn(&str, f64) + Send + Sync>;

/// Interval at which the read loop re-checks cancellation and timeout.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// How long a child gets to exit after SIGTERM before it is force-killed.
const GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Upper bound on the GPU capability probe.
const GPU_PROBE_TIMEOUT: Duration = Duration::from_secs(20);

/// Bounded line buffer between the stream readers and the supervisor loop.
const LINE_CHANNEL_CAPACITY: usize = 1024;

/// Runs external commands with logging, progress tracking and
/// cancellation support.
pub struct ProcessRunner {
    log_dir: Option<PathBuf>,
    sink: Arc<dyn EventSink>,
    cancel: Arc<CancellationToken>,
    progress_callback: Option<ProgressCallback>,
}

impl ProcessRunner {
    /// Creates a runner.
    ///
    /// With a log directory, every invocation writes a timestamped
    /// `<slug(step)>_<timestamp>.log` file there for the duration of the
    /// call. Without one, output still reaches the event sink.
    #[must_use]
    pub fn new(
        log_dir: Option<PathBuf>,
        sink: Arc<dyn EventSink>,
        cancel: Arc<CancellationToken>,
    ) -> Self {
        Self {
            log_dir,
            sink,
            cancel,
            progress_callback: None,
        }
    }

    /// Sets the progress callback.
    #[must_use]
    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    /// Executes a command, streaming its merged output.
    ///
    /// Returns `true` only when the process exits with code 0. A nonzero
    /// exit, spawn failure, timeout or cancellation all return `false`.
    pub async fn execute(
        &self,
        command: &[String],
        step_name: &str,
        timeout: Option<Duration>,
    ) -> bool {
        let Some((program, args)) = command.split_first() else {
            self.sink
                .emit(EventLevel::Error, step_name, "Empty command", None);
            return false;
        };

        self.sink.emit(
            EventLevel::Info,
            step_name,
            &format!("Starting: {}", command.join(" ")),
            None,
        );

        let mut log_file = self.open_log_file(step_name, command);

        let mut child = match Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                self.sink.emit(
                    EventLevel::Error,
                    step_name,
                    &format!("Failed to start process: {e}"),
                    None,
                );
                write_trailer(log_file.as_mut(), None);
                return false;
            }
        };

        // Merge stdout and stderr into one line stream.
        let (tx, mut rx) = mpsc::channel::<String>(LINE_CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, tx.clone());
        }
        drop(tx);

        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if self.cancel.is_cancelled() {
                return self
                    .abort_cancelled(&mut child, step_name, log_file.as_mut())
                    .await;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return self
                    .abort_timed_out(&mut child, step_name, timeout, log_file.as_mut())
                    .await;
            }

            match tokio::time::timeout(POLL_INTERVAL, rx.recv()).await {
                Ok(Some(line)) => self.handle_line(step_name, &line, log_file.as_mut()),
                Ok(None) => break, // both streams closed
                Err(_) => {}       // poll tick: re-check cancellation and deadline
            }
        }

        // Streams are closed; wait for the exit status under the same
        // cancellation and deadline rules.
        let status = loop {
            if self.cancel.is_cancelled() {
                return self
                    .abort_cancelled(&mut child, step_name, log_file.as_mut())
                    .await;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return self
                    .abort_timed_out(&mut child, step_name, timeout, log_file.as_mut())
                    .await;
            }

            match tokio::time::timeout(POLL_INTERVAL, child.wait()).await {
                Ok(Ok(status)) => break status,
                Ok(Err(e)) => {
                    self.sink.emit(
                        EventLevel::Error,
                        step_name,
                        &format!("Failed to reap process: {e}"),
                        None,
                    );
                    write_trailer(log_file.as_mut(), None);
                    return false;
                }
                Err(_) => {}
            }
        };

        write_trailer(log_file.as_mut(), status.code());

        if status.success() {
            self.sink
                .emit(EventLevel::Info, step_name, "Completed successfully", None);
            true
        } else {
            let code = status
                .code()
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            self.sink.emit(
                EventLevel::Error,
                step_name,
                &format!("Failed with exit code {code}"),
                Some(serde_json::json!({ "exit_code": status.code() })),
            );
            false
        }
    }

    fn handle_line(&self, step_name: &str, raw: &str, log_file: Option<&mut std::fs::File>) {
        let line = strip_ansi(raw);

        self.sink.emit(EventLevel::Info, step_name, &line, None);

        if let Some(file) = log_file {
            let _ = writeln!(file, "{line}");
        }

        if let Some(callback) = &self.progress_callback {
            if let Some(percent) = extract_progress(&line) {
                callback(step_name, percent);
            }
        }
    }

    async fn abort_cancelled(
        &self,
        child: &mut Child,
        step_name: &str,
        log_file: Option<&mut std::fs::File>,
    ) -> bool {
        self.sink.emit(
            EventLevel::Warn,
            step_name,
            "Interrupted. Stopping process...",
            self.cancel
                .reason()
                .map(|r| serde_json::json!({ "reason": r })),
        );
        let code = terminate_gracefully(child).await;
        write_trailer(log_file, code);
        false
    }

    async fn abort_timed_out(
        &self,
        child: &mut Child,
        step_name: &str,
        timeout: Option<Duration>,
        log_file: Option<&mut std::fs::File>,
    ) -> bool {
        self.sink.emit(
            EventLevel::Error,
            step_name,
            &format!(
                "Timeout after {} seconds",
                timeout.map_or(0, |t| t.as_secs())
            ),
            None,
        );
        let _ = child.kill().await;
        write_trailer(log_file, None);
        false
    }

    fn open_log_file(&self, step_name: &str, command: &[String]) -> Option<std::fs::File> {
        let dir = self.log_dir.as_ref()?;
        if let Err(e) = std::fs::create_dir_all(dir) {
            self.sink.emit(
                EventLevel::Warn,
                step_name,
                &format!("Could not create log directory: {e}"),
                None,
            );
            return None;
        }

        let path = dir.join(format!("{}_{}.log", slug(step_name), run_timestamp()));
        match std::fs::File::create(&path) {
            Ok(mut file) => {
                let _ = writeln!(file, "# Log started at {}", iso_timestamp());
                let _ = writeln!(file, "# Command: {}", command.join(" "));
                let _ = writeln!(file, "# {}", "=".repeat(50));
                let _ = writeln!(file);
                self.sink.emit(
                    EventLevel::Debug,
                    step_name,
                    &format!("Logging to {}", path.display()),
                    None,
                );
                Some(file)
            }
            Err(e) => {
                self.sink.emit(
                    EventLevel::Error,
                    step_name,
                    &format!("Failed to open log file: {e}"),
                    None,
                );
                None
            }
        }
    }
}

impl std::fmt::Debug for ProcessRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRunner")
            .field("log_dir", &self.log_dir)
            .field("has_progress_callback", &self.progress_callback.is_some())
            .finish_non_exhaustive()
    }
}

/// Probes whether the container runtime can grant accelerator access.
///
/// Runs a minimal `docker run --rm --gpus all alpine true` invocation;
/// only a clean exit means GPU support. On failure a lightweight host
/// check (`nvidia-smi`) shapes the emitted warning but the result is
/// still `false`. Unavailability is a normal boolean outcome, never an
/// error. The probe is not cached; each stage that needs acceleration
/// probes fresh.
pub async fn probe_gpu_support(sink: &dyn EventSink) -> bool {
    let mut probe = Command::new("docker");
    probe
        .args(["run", "--rm", "--gpus", "all", "alpine", "true"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    if let Ok(Ok(status)) = tokio::time::timeout(GPU_PROBE_TIMEOUT, probe.status()).await {
        if status.success() {
            return true;
        }
    }

    let mut host_check = Command::new("nvidia-smi");
    host_check
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let host_has_driver = matches!(
        tokio::time::timeout(Duration::from_secs(5), host_check.status()).await,
        Ok(Ok(status)) if status.success()
    );

    if host_has_driver {
        sink.emit(
            EventLevel::Warn,
            "GPU",
            "Host has an NVIDIA driver but the container runtime has no GPU access",
            None,
        );
    } else {
        sink.emit(
            EventLevel::Warn,
            "GPU",
            "GPU not available, falling back to CPU mode",
            None,
        );
    }
    false
}

fn spawn_line_reader<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
}

async fn terminate_gracefully(child: &mut Child) -> Option<i32> {
    #[cfg(unix)]
    if let Some(pid) = child.id().and_then(|p| i32::try_from(p).ok()) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
        if let Ok(Ok(status)) = tokio::time::timeout(GRACE_PERIOD, child.wait()).await {
            return status.code();
        }
    }

    let _ = child.kill().await;
    let _ = child.wait().await;
    None
}

fn write_trailer(log_file: Option<&mut std::fs::File>, exit_code: Option<i32>) {
    if let Some(file) = log_file {
        let _ = writeln!(file);
        match exit_code {
            Some(code) => {
                let _ = writeln!(file, "# Exit code: {code}");
            }
            None => {
                let _ = writeln!(file, "# Exit code: terminated");
            }
        }
        let _ = writeln!(file, "# Finished at {}", iso_timestamp());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use parking_lot::Mutex;
    use std::time::Instant as StdInstant;

    fn shell(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn runner(
        log_dir: Option<PathBuf>,
        sink: Arc<CollectingEventSink>,
        cancel: Arc<CancellationToken>,
    ) -> ProcessRunner {
        ProcessRunner::new(log_dir, sink, cancel)
    }

    #[tokio::test]
    async fn test_execute_success_emits_output_and_progress() {
        let sink = Arc::new(CollectingEventSink::new());
        let cancel = Arc::new(CancellationToken::new());
        let dir = tempfile::tempdir().expect("tempdir");

        let seen = Arc::new(Mutex::new(Vec::<f64>::new()));
        let seen_clone = seen.clone();
        let runner = runner(Some(dir.path().to_path_buf()), sink.clone(), cancel)
            .with_progress_callback(Arc::new(move |_step, pct| seen_clone.lock().push(pct)));

        let ok = runner
            .execute(
                &shell("echo 'Processing 25 of 50'; echo done"),
                "Echo Step",
                None,
            )
            .await;

        assert!(ok);
        assert!(seen.lock().contains(&50.0));
        assert_eq!(sink.events_matching("Completed successfully").len(), 1);
    }

    #[tokio::test]
    async fn test_log_file_has_header_and_trailer() {
        let sink = Arc::new(CollectingEventSink::new());
        let cancel = Arc::new(CancellationToken::new());
        let dir = tempfile::tempdir().expect("tempdir");

        let runner = runner(Some(dir.path().to_path_buf()), sink, cancel);
        assert!(runner.execute(&shell("echo hello"), "ODM/OpenSfM", None).await);

        let entry = std::fs::read_dir(dir.path())
            .expect("read_dir")
            .next()
            .expect("one log file")
            .expect("entry");
        let name = entry.file_name().to_string_lossy().into_owned();
        assert!(name.starts_with("odm_opensfm_"), "unexpected name: {name}");
        assert!(name.ends_with(".log"));

        let content = std::fs::read_to_string(entry.path()).expect("read log");
        assert!(content.contains("# Log started at "));
        assert!(content.contains("# Command: /bin/sh -c echo hello"));
        assert!(content.contains("hello"));
        assert!(content.contains("# Exit code: 0"));
        assert!(content.contains("# Finished at "));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_false_not_error() {
        let sink = Arc::new(CollectingEventSink::new());
        let cancel = Arc::new(CancellationToken::new());
        let runner = runner(None, sink.clone(), cancel);

        let ok = runner.execute(&shell("exit 3"), "Failing", None).await;
        assert!(!ok);
        assert_eq!(sink.events_matching("Failed with exit code 3").len(), 1);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_false() {
        let sink = Arc::new(CollectingEventSink::new());
        let cancel = Arc::new(CancellationToken::new());
        let runner = runner(None, sink.clone(), cancel);

        let command = vec!["/nonexistent/binary/xyz".to_string()];
        assert!(!runner.execute(&command, "Missing", None).await);
        assert!(!sink.events_matching("Failed to start process").is_empty());
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let sink = Arc::new(CollectingEventSink::new());
        let cancel = Arc::new(CancellationToken::new());
        let runner = runner(None, sink.clone(), cancel);

        let started = StdInstant::now();
        let ok = runner
            .execute(
                &shell("sleep 30"),
                "Sleeper",
                Some(Duration::from_millis(300)),
            )
            .await;

        assert!(!ok);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!sink.events_matching("Timeout after").is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_terminates_child_within_grace() {
        let sink = Arc::new(CollectingEventSink::new());
        let cancel = Arc::new(CancellationToken::new());
        let runner = runner(None, sink.clone(), cancel.clone());

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel("test interrupt");
        });

        let started = StdInstant::now();
        let ok = runner.execute(&shell("sleep 30"), "Sleeper", None).await;

        assert!(!ok);
        // sleep exits promptly on SIGTERM; well inside the grace period
        assert!(started.elapsed() < Duration::from_secs(15));
        assert!(!sink.events_matching("Interrupted").is_empty());
    }

    #[tokio::test]
    async fn test_empty_command() {
        let sink = Arc::new(CollectingEventSink::new());
        let cancel = Arc::new(CancellationToken::new());
        let runner = runner(None, sink.clone(), cancel);

        assert!(!runner.execute(&[], "Empty", None).await);
        assert!(!sink.events_matching("Empty command").is_empty());
    }
}
