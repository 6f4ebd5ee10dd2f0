pub mod compiling;
pub(crate) mod conversation;
pub mod interactive;
pub mod relay;
pub mod standard;
pub mod stress;

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::core::runnable::{RunError, RunHandle};

#[derive(Debug, thiserror::Error)]
pub enum JudgeError {
    #[error(transparent)]
    Run(#[from] RunError),
    #[error("judging task failed: {0}")]
    Panicked(String),
}

/// Handles of the processes a controller's task has started, visible to the
/// session that owns the task.
#[derive(Clone, Debug)]
pub(crate) struct LiveRuns {
    handles: Arc<watch::Sender<Vec<RunHandle>>>,
}

impl LiveRuns {
    pub(crate) fn new() -> Self {
        let (handles, _) = watch::channel(Vec::new());
        Self {
            handles: Arc::new(handles),
        }
    }

    pub(crate) fn track(&self, handle: &RunHandle) {
        self.handles.send_modify(|live| {
            live.retain(|run| !run.is_done());
            live.push(handle.clone());
        });
    }

    /// Stops every tracked run and signals its process group before
    /// returning.
    pub(crate) fn terminate_all(&self) {
        for run in self.handles.borrow().iter() {
            if !run.is_done() {
                run.terminate();
            }
        }
    }
}

/// Owned by a session: dropping it stops the controller and kills whatever
/// it still runs, without waiting for the controller task to be polled.
#[derive(Debug)]
pub(crate) struct SessionGuard {
    stop: CancellationToken,
    live: LiveRuns,
}

impl SessionGuard {
    pub(crate) fn new() -> Self {
        Self {
            stop: CancellationToken::new(),
            live: LiveRuns::new(),
        }
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.stop
    }

    pub(crate) fn live(&self) -> &LiveRuns {
        &self.live
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.stop.cancel();
        self.live.terminate_all();
    }
}

#[cfg(all(test, target_os = "linux"))]
pub(crate) mod testing {
    use std::path::Path;
    use std::time::{Duration, Instant};

    /// Polls until the process writes its pid to `path`.
    pub(crate) async fn read_pid(path: &Path) -> u32 {
        for _ in 0..250 {
            if let Some(pid) = std::fs::read_to_string(path)
                .ok()
                .and_then(|content| content.trim().parse().ok())
            {
                return pid;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no pid in {}", path.display());
    }

    fn state(pid: u32) -> Option<char> {
        let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        let (_, rest) = stat.rsplit_once(')')?;
        rest.trim_start().chars().next()
    }

    /// Blocks the thread, never yielding to the runtime, until `pid` is dead
    /// or a zombie. Nothing can reap it meanwhile, so a zombie proves the
    /// signal went out synchronously.
    pub(crate) fn dies_without_yielding(pid: u32, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        while Instant::now() < deadline {
            match state(pid) {
                None | Some('Z') | Some('X') => return true,
                Some(_) => std::thread::sleep(Duration::from_millis(10)),
            }
        }
        false
    }

    pub(crate) fn is_alive(pid: u32) -> bool {
        matches!(state(pid), Some(state) if state != 'Z' && state != 'X')
    }
}
