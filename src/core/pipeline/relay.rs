use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::core::runnable::RunHandle;

/// One-shot "secret ready" signal. Clones share the same state, the first
/// `resolve` wins and later ones are ignored.
#[derive(Clone, Debug)]
pub struct SecretGate {
    tx: Arc<watch::Sender<Option<Bytes>>>,
}

impl Default for SecretGate {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretGate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn resolved(secret: impl Into<Bytes>) -> Self {
        let gate = Self::new();
        gate.resolve(secret);
        gate
    }

    /// Returns false if the gate was already open.
    pub fn resolve(&self, secret: impl Into<Bytes>) -> bool {
        let secret = secret.into();
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(secret);
            true
        })
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub async fn wait(&self) -> Bytes {
        let mut rx = self.tx.subscribe();
        let secret = match rx.wait_for(Option::is_some).await {
            Ok(secret) => secret.clone().unwrap_or_default(),
            // The sender lives in `self`, so the channel cannot close here.
            Err(_) => Bytes::new(),
        };
        secret
    }
}

#[derive(Debug)]
enum Feed {
    Data(Bytes),
    Close,
}

/// Stdin of a process that must not see anything before the gate opens.
///
/// Data pushed early is queued in order and released right after the secret
/// (when `lead_with_secret` is set) once the target has spawned.
#[derive(Debug)]
pub struct GatedInput {
    tx: mpsc::UnboundedSender<Feed>,
    task: JoinHandle<()>,
}

impl GatedInput {
    pub fn spawn(target: RunHandle, gate: SecretGate, lead_with_secret: bool) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let secret = gate.wait().await;
            if !target.spawned().await {
                return;
            }
            if lead_with_secret && !secret.is_empty() {
                tracing::debug!(bytes = secret.len(), "writing secret");
                target.write(secret);
            }
            while let Some(feed) = rx.recv().await {
                match feed {
                    Feed::Data(data) => {
                        if !target.write(data) {
                            break;
                        }
                    }
                    Feed::Close => {
                        target.close_stdin();
                        break;
                    }
                }
            }
        });
        Self { tx, task }
    }

    pub fn push(&self, data: impl Into<Bytes>) {
        let _ = self.tx.send(Feed::Data(data.into()));
    }

    pub fn close(&self) {
        let _ = self.tx.send(Feed::Close);
    }
}

impl Drop for GatedInput {
    fn drop(&mut self) {
        self.task.abort();
    }
}
