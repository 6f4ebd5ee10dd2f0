use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tokio::process::Command;

use crate::core::traits::sampler::{MemorySample, ProcessSampler, SampleError};

/// Reads `VmRSS` and `VmHWM` from `/proc/<pid>/status`, and the process
/// start time from `/proc/<pid>/stat` against `/proc/uptime`.
#[derive(Debug, Clone)]
pub struct ProcfsSampler {
    root: PathBuf,
    ticks_per_second: u64,
}

impl ProcfsSampler {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ticks_per_second: clock_ticks(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.root.join("self").join("status").exists()
    }

    async fn read(&self, pid: u32, file: &str) -> Result<String, SampleError> {
        let path = self.root.join(pid.to_string()).join(file);
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(SampleError::Gone { pid }),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(unix)]
fn clock_ticks() -> u64 {
    use nix::unistd::{SysconfVar, sysconf};

    match sysconf(SysconfVar::CLK_TCK) {
        Ok(Some(ticks)) if ticks > 0 => ticks as u64,
        _ => 100,
    }
}

#[cfg(not(unix))]
fn clock_ticks() -> u64 {
    100
}

impl Default for ProcfsSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessSampler for ProcfsSampler {
    fn name(&self) -> &'static str {
        "procfs"
    }

    async fn sample(&self, pid: u32) -> Result<MemorySample, SampleError> {
        let status = self.read(pid, "status").await?;
        parse_status(pid, &status)
    }

    async fn elapsed(&self, pid: u32) -> Result<Duration, SampleError> {
        let stat = self.read(pid, "stat").await?;
        let uptime = fs::read_to_string(self.root.join("uptime")).await?;
        parse_elapsed(&stat, &uptime, self.ticks_per_second)
    }
}

fn parse_status(pid: u32, status: &str) -> Result<MemorySample, SampleError> {
    let mut rss = None;
    let mut peak = None;
    for line in status.lines() {
        if let Some(value) = line.strip_prefix("VmRSS:") {
            rss = Some(parse_kib(value)?);
        } else if let Some(value) = line.strip_prefix("VmHWM:") {
            peak = Some(parse_kib(value)?);
        }
    }

    // Zombies keep their status file but lose the memory lines.
    let Some(rss_bytes) = rss else {
        return Err(SampleError::Gone { pid });
    };
    Ok(MemorySample {
        rss_bytes,
        peak_rss_bytes: peak.unwrap_or(rss_bytes),
    })
}

/// Age of a process from its `stat` line and the system `uptime`.
fn parse_elapsed(
    stat: &str,
    uptime: &str,
    ticks_per_second: u64,
) -> Result<Duration, SampleError> {
    // The command name is parenthesised and may itself contain ')'.
    let fields = stat
        .rsplit_once(')')
        .map(|(_, rest)| rest)
        .ok_or_else(|| SampleError::Parse {
            msg: "stat line without command name".to_string(),
        })?;
    let start_ticks = fields
        .split_whitespace()
        .nth(19)
        .and_then(|value| value.parse::<u64>().ok())
        .ok_or_else(|| SampleError::Parse {
            msg: "stat line without start time".to_string(),
        })?;
    let uptime = uptime
        .split_whitespace()
        .next()
        .and_then(|value| value.parse::<f64>().ok())
        .ok_or_else(|| SampleError::Parse {
            msg: format!("unexpected uptime {:?}", uptime.trim()),
        })?;

    let started = start_ticks as f64 / ticks_per_second.max(1) as f64;
    Ok(Duration::from_secs_f64((uptime - started).max(0.0)))
}

fn parse_kib(value: &str) -> Result<u64, SampleError> {
    let number = value.trim().trim_end_matches("kB").trim();
    number
        .parse::<u64>()
        .map(|kib| kib * 1024)
        .map_err(|_| SampleError::Parse {
            msg: format!("unexpected memory value {:?}", value.trim()),
        })
}

/// Asks `ps` for the resident set size. Used where procfs is missing.
#[derive(Debug, Clone, Default)]
pub struct PsSampler;

#[async_trait]
impl ProcessSampler for PsSampler {
    fn name(&self) -> &'static str {
        "ps"
    }

    async fn sample(&self, pid: u32) -> Result<MemorySample, SampleError> {
        let output = Command::new("ps")
            .args(["-o", "rss=", "-p"])
            .arg(pid.to_string())
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let value = stdout.trim();
        if !output.status.success() || value.is_empty() {
            return Err(SampleError::Gone { pid });
        }
        let rss_bytes = parse_kib(value)?;
        Ok(MemorySample {
            rss_bytes,
            peak_rss_bytes: 0,
        })
    }

    /// `ps` reports whole seconds only, so callers keep their own clock.
    async fn elapsed(&self, _pid: u32) -> Result<Duration, SampleError> {
        Err(SampleError::Unsupported)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NoopSampler;

#[async_trait]
impl ProcessSampler for NoopSampler {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn sample(&self, _pid: u32) -> Result<MemorySample, SampleError> {
        Err(SampleError::Unsupported)
    }

    async fn elapsed(&self, _pid: u32) -> Result<Duration, SampleError> {
        Err(SampleError::Unsupported)
    }
}

/// Picks the best sampler this host supports.
pub fn detect_sampler() -> Arc<dyn ProcessSampler> {
    let procfs = ProcfsSampler::new();
    let sampler: Arc<dyn ProcessSampler> = if procfs.is_available() {
        Arc::new(procfs)
    } else if cfg!(unix) {
        Arc::new(PsSampler)
    } else {
        Arc::new(NoopSampler)
    };
    tracing::info!(sampler = sampler.name(), "process sampler selected");
    sampler
}
