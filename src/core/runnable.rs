//! Supervision of a single OS process under wall-clock and memory limits.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::constants::{DEFAULT_SAMPLE_INTERVAL_MS, PIPE_CHUNK_SIZE};
use crate::core::domain::{ExecutionLimits, RunOutcome, Termination};
use crate::core::traits::sampler::{ProcessSampler, SampleError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunError {
    #[error("command must contain at least an executable")]
    EmptyCommand,
}

/// What to start. A zero timeout or memory limit means unlimited.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunSpec {
    pub command: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
    pub memory_limit_bytes: u64,
}

impl RunSpec {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            cwd: None,
            timeout: Duration::ZERO,
            memory_limit_bytes: 0,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout_ms(self, ms: u64) -> Self {
        self.timeout(Duration::from_millis(ms))
    }

    pub fn memory_limit_mb(mut self, mb: u64) -> Self {
        self.memory_limit_bytes = mb.saturating_mul(1024 * 1024);
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn limits(mut self, limits: &ExecutionLimits) -> Self {
        self.timeout = Duration::from_millis(limits.time_ms.unwrap_or(0));
        self.memory_limit_bytes = limits.memory_bytes.unwrap_or(0);
        self
    }
}

/// Everything a run reports, in order: `Spawn`, then output chunks, then both
/// `*End` markers, then `Close`. `Error` may appear anywhere before `Close`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunEvent {
    Spawn { pid: u32 },
    Stdout(Bytes),
    Stderr(Bytes),
    StdoutEnd,
    StderrEnd,
    Error(String),
    Close(RunOutcome),
}

/// The event subscription of one run. A new run always gets a new
/// subscription, so nothing from an earlier run can leak into it.
#[derive(Debug)]
pub struct RunEvents {
    id: Uuid,
    rx: mpsc::UnboundedReceiver<RunEvent>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectedRun {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub outcome: RunOutcome,
}

impl RunEvents {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn recv(&mut self) -> Option<RunEvent> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> UnboundedReceiverStream<RunEvent> {
        UnboundedReceiverStream::new(self.rx)
    }

    /// Drains the run into output buffers and its outcome.
    pub async fn collect(mut self) -> CollectedRun {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut outcome = None;
        while let Some(event) = self.rx.recv().await {
            match event {
                RunEvent::Stdout(data) => stdout.extend_from_slice(&data),
                RunEvent::Stderr(data) => stderr.extend_from_slice(&data),
                RunEvent::Close(closed) => outcome = Some(closed),
                _ => {}
            }
        }
        CollectedRun {
            stdout,
            stderr,
            outcome: outcome.unwrap_or_else(|| RunOutcome::not_started(Termination::Failed)),
        }
    }
}

#[derive(Debug)]
enum StdinCommand {
    Write(Bytes),
    Close,
}

/// Cheap, clonable control surface of one run.
#[derive(Clone, Debug)]
pub struct RunHandle {
    id: Uuid,
    stop: CancellationToken,
    stdin: mpsc::UnboundedSender<StdinCommand>,
    spawned: watch::Receiver<Option<bool>>,
    done: watch::Receiver<Option<RunOutcome>>,
    pid: Arc<AtomicU32>,
}

impl RunHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Pid of the live process, `None` before spawn and after it was reaped.
    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Requests teardown. Idempotent; a no-op once the run has closed.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Queues data for the process's stdin. Data written before spawn is
    /// delivered once the process is up. Returns false if stdin is gone.
    pub fn write(&self, data: impl Into<Bytes>) -> bool {
        self.stdin.send(StdinCommand::Write(data.into())).is_ok()
    }

    pub fn close_stdin(&self) {
        let _ = self.stdin.send(StdinCommand::Close);
    }

    pub async fn spawned(&self) -> bool {
        let mut rx = self.spawned.clone();
        let spawned = match rx.wait_for(Option::is_some).await {
            Ok(state) => state.unwrap_or(false),
            Err(_) => false,
        };
        spawned
    }

    /// Resolves once both output streams closed. Never fails.
    pub async fn done(&self) -> RunOutcome {
        let mut rx = self.done.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(state) => state.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| RunOutcome::not_started(Termination::Failed))
    }

    pub fn is_done(&self) -> bool {
        self.done.borrow().is_some()
    }

    /// Requests teardown and signals the process group right away instead of
    /// waiting for the supervisor task to get scheduled.
    pub(crate) fn terminate(&self) {
        self.stop();
        if let Some(pid) = self.pid() {
            kill_process_group(pid);
        }
    }
}

/// A reusable supervision slot holding at most one live process.
#[derive(Debug)]
pub struct Runnable {
    label: String,
    sampler: Arc<dyn ProcessSampler>,
    sample_interval: Duration,
    current: Option<RunHandle>,
}

impl Runnable {
    pub fn new(label: impl Into<String>, sampler: Arc<dyn ProcessSampler>) -> Self {
        Self {
            label: label.into(),
            sampler,
            sample_interval: Duration::from_millis(DEFAULT_SAMPLE_INTERVAL_MS),
            current: None,
        }
    }

    /// Zero is raised to one millisecond.
    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn handle(&self) -> Option<&RunHandle> {
        self.current.as_ref()
    }

    pub fn stop(&self) {
        if let Some(handle) = &self.current {
            handle.stop();
        }
    }

    /// Starts a process and returns immediately. Any earlier run on this slot
    /// is stopped and detached first.
    pub fn run(&mut self, spec: RunSpec) -> Result<RunEvents, RunError> {
        if spec.command.is_empty() {
            return Err(RunError::EmptyCommand);
        }
        self.detach();

        let id = Uuid::new_v4();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let (spawned_tx, spawned_rx) = watch::channel(None);
        let (done_tx, done_rx) = watch::channel(None);
        let stop = CancellationToken::new();
        let pid = Arc::new(AtomicU32::new(0));

        tracing::debug!(label = %self.label, run = %id, command = ?spec.command, "starting run");

        let supervisor = Supervisor {
            spec,
            sampler: self.sampler.clone(),
            sample_interval: self.sample_interval,
            stop: stop.clone(),
            events: events_tx,
            spawned: spawned_tx,
            done: done_tx,
            pid: pid.clone(),
        };
        let span = tracing::debug_span!("run", label = %self.label, run = %id);
        tokio::spawn(supervisor.run(stdin_rx).instrument(span));

        self.current = Some(RunHandle {
            id,
            stop,
            stdin: stdin_tx,
            spawned: spawned_rx,
            done: done_rx,
            pid,
        });
        Ok(RunEvents { id, rx: events_rx })
    }

    fn detach(&mut self) {
        if let Some(previous) = self.current.take() {
            if !previous.is_done() {
                previous.terminate();
            }
        }
    }
}

impl Drop for Runnable {
    fn drop(&mut self) {
        self.detach();
    }
}

struct Supervisor {
    spec: RunSpec,
    sampler: Arc<dyn ProcessSampler>,
    sample_interval: Duration,
    stop: CancellationToken,
    events: mpsc::UnboundedSender<RunEvent>,
    spawned: watch::Sender<Option<bool>>,
    done: watch::Sender<Option<RunOutcome>>,
    pid: Arc<AtomicU32>,
}

/// What the watchdog observed while the process was alive.
#[derive(Debug, Default)]
struct Watch {
    status: Option<ExitStatus>,
    exited_at: Option<Instant>,
    timed_out: bool,
    memory_exceeded: bool,
    /// Whether a caller stop was pending when the process exited. A stop
    /// arriving after exit does not change the outcome.
    stop_requested: bool,
    /// Kernel start time of the process, when the sampler can tell it.
    os_started_at: Option<Instant>,
    peak_memory_bytes: u64,
}

impl Supervisor {
    async fn run(self, stdin_rx: mpsc::UnboundedReceiver<StdinCommand>) {
        if self.stop.is_cancelled() {
            tracing::debug!("stopped before spawn");
            self.spawned.send_replace(Some(false));
            self.finish(RunOutcome::not_started(Termination::Stopped));
            return;
        }

        let mut command = Command::new(&self.spec.command[0]);
        command
            .args(&self.spec.command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.spec.cwd {
            command.current_dir(cwd);
        }
        #[cfg(unix)]
        command.process_group(0);

        let started = Instant::now();
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(error = %e, command = ?self.spec.command, "failed to spawn");
                self.spawned.send_replace(Some(false));
                let _ = self.events.send(RunEvent::Error(format!(
                    "failed to spawn {}: {e}",
                    self.spec.command[0]
                )));
                let termination = if self.stop.is_cancelled() {
                    Termination::Stopped
                } else {
                    Termination::Failed
                };
                self.finish(RunOutcome::not_started(termination));
                return;
            }
        };

        let pid = child.id().unwrap_or(0);
        self.pid.store(pid, Ordering::SeqCst);
        self.spawned.send_replace(Some(true));
        let _ = self.events.send(RunEvent::Spawn { pid });
        tracing::debug!(pid, "spawned");

        let feeder = child
            .stdin
            .take()
            .map(|stdin| tokio::spawn(feed_stdin(stdin, stdin_rx)));
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (seen, (), ()) = tokio::join!(
            self.watch(&mut child, pid, started),
            pump(stdout, &self.events, RunEvent::Stdout, RunEvent::StdoutEnd),
            pump(stderr, &self.events, RunEvent::Stderr, RunEvent::StderrEnd),
        );
        let closed_at = Instant::now();

        if let Some(feeder) = feeder {
            feeder.abort();
        }
        self.pid.store(0, Ordering::SeqCst);

        let outcome = self.resolve(&seen, started, closed_at);
        tracing::debug!(
            termination = %outcome.termination,
            exit_code = ?outcome.exit_code,
            signal = ?outcome.signal,
            elapsed_ms = outcome.elapsed_ms(),
            peak_memory_bytes = outcome.peak_memory_bytes,
            "run closed"
        );
        self.finish(outcome);
    }

    /// Waits for the process to exit while enforcing the timeout, the memory
    /// ceiling and caller stops. Timeout and memory kills go through the same
    /// abort token as a caller stop and are told apart by flags.
    async fn watch(&self, child: &mut Child, pid: u32, started: Instant) -> Watch {
        let mut seen = Watch::default();
        let abort = self.stop.child_token();
        let has_deadline = !self.spec.timeout.is_zero();
        let deadline = tokio::time::sleep_until(started + self.spec.timeout);
        tokio::pin!(deadline);

        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.sample_interval,
            self.sample_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sampling = pid != 0;
        let mut dating = pid != 0;
        let mut age = self.sampler.elapsed(pid);
        let mut killed = false;

        loop {
            tokio::select! {
                biased;
                status = child.wait() => {
                    seen.exited_at = Some(Instant::now());
                    seen.stop_requested = self.stop.is_cancelled();
                    match status {
                        Ok(status) => seen.status = Some(status),
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to wait for process");
                            let _ = self.events.send(RunEvent::Error(format!(
                                "failed to wait for process: {e}"
                            )));
                        }
                    }
                    break;
                }
                _ = abort.cancelled(), if !killed => {
                    killed = true;
                    kill_process_group(pid);
                    if let Err(e) = child.start_kill() {
                        tracing::debug!(error = %e, "process already exited");
                    }
                }
                _ = &mut deadline, if has_deadline && !killed && !seen.timed_out => {
                    tracing::debug!(timeout_ms = self.spec.timeout.as_millis() as u64, "timed out");
                    seen.timed_out = true;
                    abort.cancel();
                }
                dated = &mut age, if dating => {
                    dating = false;
                    match dated {
                        Ok(age) => seen.os_started_at = Instant::now().checked_sub(age),
                        Err(e) => tracing::debug!(error = %e, "process start time unavailable"),
                    }
                }
                _ = ticker.tick(), if sampling && !killed => {
                    match self.sampler.sample(pid).await {
                        Ok(sample) => {
                            let high = sample.high_water_mark();
                            seen.peak_memory_bytes = seen.peak_memory_bytes.max(high);
                            let limit = self.spec.memory_limit_bytes;
                            if limit > 0 && high > limit {
                                tracing::debug!(used = high, limit, "memory limit exceeded");
                                seen.memory_exceeded = true;
                                abort.cancel();
                            }
                        }
                        Err(SampleError::Gone { .. }) => sampling = false,
                        Err(SampleError::Unsupported) => {
                            if self.spec.memory_limit_bytes > 0 {
                                tracing::warn!("memory limit cannot be enforced on this platform");
                            }
                            sampling = false;
                        }
                        Err(e) => tracing::debug!(error = %e, "memory sample failed"),
                    }
                }
            }
        }

        // Leftover members of the group would keep our pipes open.
        kill_process_group(pid);
        seen
    }

    fn resolve(&self, seen: &Watch, started: Instant, closed_at: Instant) -> RunOutcome {
        let exit_code = seen.status.and_then(|status| status.code());
        let signal = seen.status.and_then(exit_signal);
        let termination = if seen.timed_out {
            Termination::TimedOut
        } else if seen.memory_exceeded {
            Termination::MemoryExceeded
        } else if seen.stop_requested || (seen.status.is_none() && self.stop.is_cancelled()) {
            Termination::Stopped
        } else if signal.is_some() {
            Termination::Signaled
        } else if exit_code == Some(0) {
            Termination::Success
        } else {
            Termination::Failed
        };

        // Prefer the kernel's start time over our spawn bracket.
        let elapsed = match (seen.exited_at, seen.os_started_at) {
            (Some(exited_at), Some(os_started_at)) => {
                exited_at.saturating_duration_since(os_started_at)
            }
            (exited_at, _) => exited_at.unwrap_or(closed_at) - started,
        };

        RunOutcome {
            termination,
            exit_code,
            signal,
            elapsed,
            peak_memory_bytes: seen.peak_memory_bytes,
            spawned: true,
        }
    }

    fn finish(&self, outcome: RunOutcome) {
        self.done.send_replace(Some(outcome.clone()));
        let _ = self.events.send(RunEvent::Close(outcome));
    }
}

async fn feed_stdin(mut stdin: ChildStdin, mut commands: mpsc::UnboundedReceiver<StdinCommand>) {
    while let Some(command) = commands.recv().await {
        match command {
            StdinCommand::Write(data) => {
                if let Err(e) = stdin.write_all(&data).await {
                    tracing::debug!(error = %e, "stdin closed by process");
                    return;
                }
            }
            StdinCommand::Close => break,
        }
    }
    let _ = stdin.shutdown().await;
}

async fn pump<R>(
    reader: Option<R>,
    events: &mpsc::UnboundedSender<RunEvent>,
    chunk: fn(Bytes) -> RunEvent,
    end: RunEvent,
) where
    R: AsyncRead + Unpin,
{
    if let Some(mut reader) = reader {
        let mut buf = vec![0u8; PIPE_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let _ = events.send(chunk(Bytes::copy_from_slice(&buf[..n])));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read process output");
                    let _ = events.send(RunEvent::Error(format!("failed to read output: {e}")));
                    break;
                }
            }
        }
    }
    let _ = events.send(end);
}

#[cfg(unix)]
fn exit_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: ExitStatus) -> Option<i32> {
    None
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    if pid == 0 {
        return;
    }
    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pid, error = %e, "failed to kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::traits::sampler::{MemorySample, MockProcessSampler};

    fn undated(sampler: &mut MockProcessSampler) {
        sampler
            .expect_elapsed()
            .returning(|_| Err(SampleError::Unsupported));
    }

    fn quiet_sampler() -> Arc<dyn ProcessSampler> {
        let mut sampler = MockProcessSampler::new();
        sampler
            .expect_sample()
            .returning(|_| Ok(MemorySample::default()));
        undated(&mut sampler);
        Arc::new(sampler)
    }

    fn runnable() -> Runnable {
        Runnable::new("test", quiet_sampler()).with_sample_interval(Duration::from_millis(20))
    }

    fn sh(script: &str) -> RunSpec {
        RunSpec::new(["sh", "-c", script])
    }

    #[test]
    fn test_memory_limit_in_megabytes_saturates() {
        assert_eq!(
            RunSpec::new(["true"]).memory_limit_mb(3).memory_limit_bytes,
            3 * 1024 * 1024
        );
        assert_eq!(
            RunSpec::new(["true"]).memory_limit_mb(u64::MAX).memory_limit_bytes,
            u64::MAX
        );
    }

    #[tokio::test]
    async fn test_successful_run_collects_output() {
        let mut runnable = runnable();
        let run = runnable
            .run(sh("printf hello; printf oops >&2"))
            .unwrap()
            .collect()
            .await;

        assert_eq!(run.stdout, b"hello");
        assert_eq!(run.stderr, b"oops");
        assert_eq!(run.outcome.termination, Termination::Success);
        assert_eq!(run.outcome.exit_code, Some(0));
        assert!(run.outcome.spawned);
    }

    #[tokio::test]
    async fn test_stdin_is_forwarded() {
        let mut runnable = runnable();
        let events = runnable.run(RunSpec::new(["cat"])).unwrap();
        let handle = runnable.handle().unwrap().clone();
        assert!(handle.write("abc\n"));
        assert!(handle.write(Bytes::from_static(b"def\n")));
        handle.close_stdin();

        let run = events.collect().await;
        assert_eq!(run.stdout, b"abc\ndef\n");
        assert_eq!(run.outcome.termination, Termination::Success);
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_failure() {
        let mut runnable = runnable();
        let run = runnable.run(sh("exit 3")).unwrap().collect().await;

        assert_eq!(run.outcome.termination, Termination::Failed);
        assert_eq!(run.outcome.exit_code, Some(3));
        assert_eq!(run.outcome.signal, None);
    }

    #[tokio::test]
    async fn test_signal_is_reported() {
        let mut runnable = runnable();
        let run = runnable.run(sh("kill -9 $$")).unwrap().collect().await;

        assert_eq!(run.outcome.termination, Termination::Signaled);
        assert_eq!(run.outcome.signal, Some(9));
        assert!(run.outcome.is_abnormal_exit());
    }

    #[tokio::test]
    async fn test_timeout_kills_and_reports_timeout() {
        let mut runnable = runnable();
        let run = runnable
            .run(RunSpec::new(["sleep", "5"]).timeout_ms(1000))
            .unwrap()
            .collect()
            .await;

        assert_eq!(run.outcome.termination, Termination::TimedOut);
        assert!(run.outcome.elapsed >= Duration::from_millis(1000));
        assert!(run.outcome.elapsed < Duration::from_millis(3000));
    }

    #[tokio::test]
    async fn test_memory_limit_takes_precedence_over_signal() {
        let mut sampler = MockProcessSampler::new();
        sampler.expect_sample().returning(|_| {
            Ok(MemorySample {
                rss_bytes: 512 * 1024 * 1024,
                peak_rss_bytes: 600 * 1024 * 1024,
            })
        });
        undated(&mut sampler);
        let mut runnable = Runnable::new("memory", Arc::new(sampler))
            .with_sample_interval(Duration::from_millis(20));

        let run = runnable
            .run(RunSpec::new(["sleep", "5"]).memory_limit_mb(64))
            .unwrap()
            .collect()
            .await;

        assert_eq!(run.outcome.termination, Termination::MemoryExceeded);
        assert_eq!(run.outcome.signal, Some(9));
        assert_eq!(run.outcome.peak_memory_bytes, 600 * 1024 * 1024);
        assert!(run.outcome.elapsed < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_peak_memory_tracks_highest_sample() {
        let mut sampler = MockProcessSampler::new();
        let mut calls = 0u64;
        sampler.expect_sample().returning(move |_| {
            calls += 1;
            let rss = if calls == 2 { 3 * 1024 * 1024 } else { 1024 * 1024 };
            Ok(MemorySample {
                rss_bytes: rss,
                peak_rss_bytes: 0,
            })
        });
        undated(&mut sampler);
        let mut runnable = Runnable::new("peak", Arc::new(sampler))
            .with_sample_interval(Duration::from_millis(20));

        let run = runnable
            .run(RunSpec::new(["sleep", "0.3"]))
            .unwrap()
            .collect()
            .await;

        assert_eq!(run.outcome.termination, Termination::Success);
        assert_eq!(run.outcome.peak_memory_bytes, 3 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_kernel_start_time_wins_over_spawn_bracket() {
        let mut sampler = MockProcessSampler::new();
        sampler
            .expect_sample()
            .returning(|_| Ok(MemorySample::default()));
        sampler
            .expect_elapsed()
            .times(1)
            .returning(|_| Ok(Duration::from_secs(5)));
        let mut runnable = Runnable::new("aged", Arc::new(sampler))
            .with_sample_interval(Duration::from_millis(20));

        let run = runnable
            .run(RunSpec::new(["sleep", "0.2"]))
            .unwrap()
            .collect()
            .await;

        assert_eq!(run.outcome.termination, Termination::Success);
        assert!(run.outcome.elapsed >= Duration::from_secs(5));
        assert!(run.outcome.elapsed < Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_spawn_bracket_is_the_fallback() {
        let mut runnable = runnable();
        let run = runnable
            .run(RunSpec::new(["sleep", "0.2"]))
            .unwrap()
            .collect()
            .await;

        assert!(run.outcome.elapsed >= Duration::from_millis(200));
        assert!(run.outcome.elapsed < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_vanished_process_stops_sampling_quietly() {
        let mut sampler = MockProcessSampler::new();
        sampler
            .expect_sample()
            .times(1)
            .returning(|pid| Err(SampleError::Gone { pid }));
        undated(&mut sampler);
        let mut runnable = Runnable::new("gone", Arc::new(sampler))
            .with_sample_interval(Duration::from_millis(20));

        let run = runnable
            .run(RunSpec::new(["sleep", "0.2"]).memory_limit_mb(1))
            .unwrap()
            .collect()
            .await;

        assert_eq!(run.outcome.termination, Termination::Success);
        assert_eq!(run.outcome.peak_memory_bytes, 0);
    }

    #[tokio::test]
    async fn test_stop_before_spawn_never_starts_process() {
        let mut runnable = runnable();
        let mut events = runnable.run(RunSpec::new(["sleep", "5"])).unwrap();
        let handle = runnable.handle().unwrap().clone();
        handle.stop();

        assert!(!handle.spawned().await);
        let outcome = handle.done().await;
        assert_eq!(outcome.termination, Termination::Stopped);
        assert!(!outcome.spawned);

        assert_eq!(events.recv().await, Some(RunEvent::Close(outcome)));
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn test_stop_after_spawn_reports_stop() {
        let mut runnable = runnable();
        let events = runnable.run(RunSpec::new(["sleep", "5"])).unwrap();
        let handle = runnable.handle().unwrap().clone();
        assert!(handle.spawned().await);
        assert!(handle.pid().is_some());

        handle.stop();
        handle.stop();
        let run = events.collect().await;

        assert_eq!(run.outcome.termination, Termination::Stopped);
        assert!(run.outcome.elapsed < Duration::from_secs(4));
        assert_eq!(handle.pid(), None);
        handle.stop();
    }

    #[tokio::test]
    async fn test_spawn_failure_is_a_generic_outcome() {
        let mut runnable = runnable();
        let mut events = runnable
            .run(RunSpec::new(["/definitely/not/a/binary"]))
            .unwrap();
        let handle = runnable.handle().unwrap().clone();

        assert!(!handle.spawned().await);
        assert!(matches!(events.recv().await, Some(RunEvent::Error(_))));
        let outcome = handle.done().await;
        assert_eq!(outcome.termination, Termination::Failed);
        assert_eq!(outcome.exit_code, None);
    }

    #[tokio::test]
    async fn test_empty_command_is_rejected() {
        let mut runnable = runnable();
        assert_eq!(
            runnable.run(RunSpec::new(Vec::<String>::new())).unwrap_err(),
            RunError::EmptyCommand
        );
        assert!(runnable.handle().is_none());
    }

    #[tokio::test]
    async fn test_events_arrive_in_lifecycle_order() {
        let mut runnable = runnable();
        let mut events = runnable.run(sh("echo one; echo two >&2")).unwrap();

        let mut received = Vec::new();
        while let Some(event) = events.recv().await {
            received.push(event);
        }

        assert!(matches!(received.first(), Some(RunEvent::Spawn { .. })));
        assert!(matches!(received.last(), Some(RunEvent::Close(_))));
        let position = |wanted: &RunEvent| received.iter().position(|e| e == wanted).unwrap();
        let stdout_end = position(&RunEvent::StdoutEnd);
        let stderr_end = position(&RunEvent::StderrEnd);
        let last_chunk = received
            .iter()
            .rposition(|e| matches!(e, RunEvent::Stdout(_) | RunEvent::Stderr(_)))
            .unwrap();
        assert!(last_chunk < stdout_end.max(stderr_end));
        assert!(stdout_end < received.len() - 1);
        assert!(stderr_end < received.len() - 1);
    }

    #[tokio::test]
    async fn test_reuse_does_not_leak_events_between_runs() {
        let mut runnable = runnable();
        let first = runnable.run(sh("sleep 0.3; echo first")).unwrap();
        let first_handle = runnable.handle().unwrap().clone();
        assert!(first_handle.spawned().await);

        let second = runnable.run(sh("echo second")).unwrap();
        assert_ne!(first.id(), second.id());

        let second = second.collect().await;
        assert_eq!(second.stdout, b"second\n");
        assert_eq!(second.outcome.termination, Termination::Success);

        let first = first.collect().await;
        assert!(first.stdout.is_empty());
        assert_eq!(first.outcome.termination, Termination::Stopped);
    }

    #[tokio::test]
    async fn test_drop_kills_live_process() {
        let mut runnable = runnable();
        let events = runnable.run(RunSpec::new(["sleep", "5"])).unwrap();
        let handle = runnable.handle().unwrap().clone();
        assert!(handle.spawned().await);

        drop(runnable);
        let run = events.collect().await;
        assert_eq!(run.outcome.termination, Termination::Stopped);
    }

    #[tokio::test]
    async fn test_background_children_do_not_hold_the_run_open() {
        let mut runnable = runnable();
        let run = runnable
            .run(sh("sleep 5 & echo parent").timeout_ms(3000))
            .unwrap()
            .collect()
            .await;

        assert_eq!(run.stdout, b"parent\n");
        assert_eq!(run.outcome.termination, Termination::Success);
        assert!(run.outcome.elapsed < Duration::from_secs(2));
    }
}
