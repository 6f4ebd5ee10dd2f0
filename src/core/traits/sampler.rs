use std::time::Duration;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemorySample {
    pub rss_bytes: u64,
    pub peak_rss_bytes: u64,
}

impl MemorySample {
    pub fn high_water_mark(&self) -> u64 {
        self.rss_bytes.max(self.peak_rss_bytes)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    #[error("process {pid} is gone")]
    Gone { pid: u32 },
    #[error("process metrics are not supported on this platform")]
    Unsupported,
    #[error("failed to read process metrics: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed process metrics: {msg}")]
    Parse { msg: String },
}

/// Best-effort reader of a live process's resident memory and age.
#[mockall::automock]
#[async_trait::async_trait]
pub trait ProcessSampler: std::fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    async fn sample(&self, pid: u32) -> Result<MemorySample, SampleError>;

    /// How long the process has existed according to the OS, measured from
    /// its kernel start time rather than from when we spawned it.
    async fn elapsed(&self, pid: u32) -> Result<Duration, SampleError>;
}
