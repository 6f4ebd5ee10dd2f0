use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use sha2::{Digest, Sha256};

use crate::constants::{DEFAULT_COMPILE_TIMEOUT_MS, DEFAULT_SAMPLE_INTERVAL_MS};
use crate::core::classify::classify_compile;
use crate::core::domain::{BuildStep, Verdict};
use crate::core::runnable::{RunSpec, Runnable};
use crate::core::traits::compiler::{CompileError, Compiler};
use crate::core::traits::sampler::ProcessSampler;

type CompileFuture = BoxFuture<'static, Result<(), CompileError>>;
type SharedCompile = Shared<CompileFuture>;

struct CacheEntry {
    fingerprint: String,
    command: Vec<String>,
    result: SharedCompile,
}

/// Compilations keyed by absolute source path. A source is rebuilt only
/// when its content or build command changes, concurrent requests for the
/// same build share one compiler process, and a rebuild never overlaps a
/// build of the same path that is still running.
#[derive(Default)]
pub struct CompileCache {
    entries: DashMap<PathBuf, CacheEntry>,
}

impl fmt::Debug for CompileCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompileCache")
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl CompileCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn invalidate(&self, source: &Path) {
        if let Ok(key) = std::path::absolute(source) {
            self.entries.remove(&key);
        }
    }

    /// Returns the in-flight or finished build for this exact source and
    /// command, or registers `build`. `build` must not start any work before
    /// it is first polled: a rebuild is queued behind a pending build of the
    /// same path.
    fn join_or_start<F>(
        &self,
        key: PathBuf,
        fingerprint: &str,
        command: &[String],
        build: F,
    ) -> SharedCompile
    where
        F: FnOnce() -> CompileFuture,
    {
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get();
                if entry.fingerprint == fingerprint && entry.command == command {
                    tracing::debug!(source = %occupied.key().display(), "reusing compilation");
                    return entry.result.clone();
                }
                let result = if entry.result.peek().is_none() {
                    tracing::debug!(
                        source = %occupied.key().display(),
                        "rebuild queued behind running compilation"
                    );
                    let pending = entry.result.clone();
                    let next = build();
                    async move {
                        let _ = pending.await;
                        next.await
                    }
                    .boxed()
                    .shared()
                } else {
                    build().shared()
                };
                occupied.insert(CacheEntry {
                    fingerprint: fingerprint.to_string(),
                    command: command.to_vec(),
                    result: result.clone(),
                });
                result
            }
            Entry::Vacant(vacant) => {
                let result = build().shared();
                vacant.insert(CacheEntry {
                    fingerprint: fingerprint.to_string(),
                    command: command.to_vec(),
                    result: result.clone(),
                });
                result
            }
        }
    }

    fn evict_failed(&self, key: &Path, fingerprint: &str, command: &[String]) {
        self.entries.remove_if(key, |_, entry| {
            entry.fingerprint == fingerprint && entry.command == command
        });
    }
}

/// Runs build commands through a supervised process, deduplicated by a
/// [`CompileCache`].
#[derive(Debug, Clone)]
pub struct CommandCompiler {
    cache: Arc<CompileCache>,
    sampler: Arc<dyn ProcessSampler>,
    timeout: Duration,
    sample_interval: Duration,
}

impl CommandCompiler {
    pub fn new(sampler: Arc<dyn ProcessSampler>) -> Self {
        Self {
            cache: Arc::new(CompileCache::new()),
            sampler,
            timeout: Duration::from_millis(DEFAULT_COMPILE_TIMEOUT_MS),
            sample_interval: Duration::from_millis(DEFAULT_SAMPLE_INTERVAL_MS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    pub fn with_cache(mut self, cache: Arc<CompileCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn cache(&self) -> &Arc<CompileCache> {
        &self.cache
    }

    /// The compiler process starts on first poll.
    fn build(&self, step: &BuildStep) -> CompileFuture {
        let mut spec = RunSpec::new(step.command.iter().cloned()).timeout(self.timeout);
        if let Some(cwd) = &step.cwd {
            spec = spec.cwd(cwd);
        }
        let mut runnable = Runnable::new("compiler", self.sampler.clone())
            .with_sample_interval(self.sample_interval);
        let source = step.source.clone();

        let compile = async move {
            let events = runnable
                .run(spec)
                .map_err(|e| CompileError::Internal { msg: e.to_string() })?;
            let run = events.collect().await;

            match classify_compile(&run.outcome) {
                None => {
                    tracing::info!(source = %source.display(), elapsed_ms = run.outcome.elapsed_ms(), "compiled");
                    Ok(())
                }
                Some(Verdict::NotApplicable) => Err(CompileError::Stopped),
                Some(verdict) => {
                    let mut output = String::from_utf8_lossy(&run.stdout).into_owned();
                    output.push_str(&String::from_utf8_lossy(&run.stderr));
                    tracing::info!(source = %source.display(), %verdict, "compilation failed");
                    Err(CompileError::Failed {
                        verdict,
                        outcome: run.outcome,
                        output,
                    })
                }
            }
        };

        async move {
            tokio::spawn(compile).await.unwrap_or_else(|e| {
                Err(CompileError::Internal {
                    msg: format!("compile task failed: {e}"),
                })
            })
        }
        .boxed()
    }
}

#[async_trait]
impl Compiler for CommandCompiler {
    async fn compile(&self, step: &BuildStep) -> Result<(), CompileError> {
        if step.command.is_empty() {
            return Err(CompileError::Internal {
                msg: "build command is empty".to_string(),
            });
        }
        let key = std::path::absolute(&step.source).map_err(|e| CompileError::Internal {
            msg: format!("invalid source path {}: {e}", step.source.display()),
        })?;
        let content = tokio::fs::read(&key)
            .await
            .map_err(|e| CompileError::Internal {
                msg: format!("failed to read {}: {e}", key.display()),
            })?;
        let fingerprint = hex::encode(Sha256::digest(&content));

        let result = self
            .cache
            .join_or_start(key.clone(), &fingerprint, &step.command, || self.build(step))
            .await;
        if result.is_err() {
            self.cache.evict_failed(&key, &fingerprint, &step.command);
        }
        result
    }
}
