//! Layer Commit Coordination
//!
//! When the layers of one image are transferred by parallel workers, every
//! layer index must be committed exactly once, and the ordered layer chain
//! must come out the same no matter which transfer finishes first.
//!
//! Each index moves through `unregistered -> pending -> {committed, failed}`.
//! The first caller for an index owns the commit; callers arriving while it
//! is pending wait for the owner and adopt its outcome. Commits and
//! conflicts are kept so late callers see the same result. Any other failure
//! reaches the callers already waiting and returns the index to
//! `unregistered`, so the layer can be transferred again.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::blob::BlobInfo;
use crate::digest::Digest;
use crate::{Error, Result};

type Outcome = std::result::Result<BlobInfo, Arc<Error>>;

/// Observable state of one layer index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerStatus {
    Unregistered,
    Pending,
    Committed,
    Failed,
}

/// One applied entry of the ordered layer chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLink {
    pub index: usize,
    pub digest: Digest,
    #[serde(default)]
    pub empty: bool,
    /// Identity of the stack `0..=index`; `None` while only empty layers
    /// have been applied.
    pub chain_id: Option<Digest>,
}

#[derive(Debug)]
enum Slot {
    Pending {
        digest: Digest,
        empty: bool,
        conflict: Option<Digest>,
        done: watch::Receiver<Option<Outcome>>,
    },
    Committed {
        /// Digest the index was claimed with; `info` may describe a
        /// substitute with a different digest.
        key: Digest,
        info: BlobInfo,
        empty: bool,
    },
    Failed(Arc<Error>),
}

#[derive(Debug, Default)]
struct Inner {
    slots: HashMap<usize, Slot>,
    chain: Vec<ChainLink>,
}

enum Role {
    Owner(watch::Sender<Option<Outcome>>),
    Waiter(watch::Receiver<Option<Outcome>>),
}

/// What a caller gets when the index is already claimed.
enum Joined {
    Waiter(watch::Receiver<Option<Outcome>>),
    Done(BlobInfo),
}

/// Per-session record of layer commits.
#[derive(Debug, Default)]
pub struct LayerCommitCoordinator {
    inner: Mutex<Inner>,
}

impl LayerCommitCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Commit `digest` at `index`, running `work` only if no other caller
    /// has claimed the index.
    ///
    /// `work` performs the transfer or reuse and returns the final
    /// descriptor. Callers for an index that is already pending or committed
    /// with the same digest adopt that outcome; a different digest is a
    /// consistency failure.
    pub async fn commit<F, Fut>(
        &self,
        cancel: &CancellationToken,
        index: usize,
        digest: &Digest,
        empty: bool,
        work: F,
    ) -> Result<BlobInfo>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<BlobInfo>>,
    {
        let role = {
            let mut inner = self.lock();
            match inner.slots.get_mut(&index) {
                Some(slot) => match join_slot(index, slot, digest)? {
                    Joined::Done(info) => return Ok(info),
                    Joined::Waiter(rx) => Role::Waiter(rx),
                },
                None => {
                    let (tx, rx) = watch::channel(None);
                    inner.slots.insert(
                        index,
                        Slot::Pending {
                            digest: digest.clone(),
                            empty,
                            conflict: None,
                            done: rx,
                        },
                    );
                    Role::Owner(tx)
                }
            }
        };

        match role {
            Role::Owner(tx) => {
                let mut guard = PendingGuard {
                    coordinator: self,
                    index,
                    tx: Some(tx),
                };
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(Error::Cancelled),
                    r = work() => r,
                };
                guard.finish(result)
            }
            Role::Waiter(rx) => wait_for_owner(cancel, index, digest, rx).await,
        }
    }

    /// Adopt the outcome for `index` if some caller has claimed it, waiting
    /// while it is pending. Returns `None` for an unregistered index without
    /// claiming it.
    pub async fn join(
        &self,
        cancel: &CancellationToken,
        index: usize,
        digest: &Digest,
    ) -> Result<Option<BlobInfo>> {
        let joined = {
            let mut inner = self.lock();
            match inner.slots.get_mut(&index) {
                Some(slot) => join_slot(index, slot, digest)?,
                None => return Ok(None),
            }
        };
        match joined {
            Joined::Done(info) => Ok(Some(info)),
            Joined::Waiter(rx) => wait_for_owner(cancel, index, digest, rx).await.map(Some),
        }
    }

    fn resolve(&self, index: usize, result: Result<BlobInfo>) -> Result<BlobInfo> {
        let mut inner = self.lock();
        let (digest, empty, conflict) = match inner.slots.get(&index) {
            Some(Slot::Pending {
                digest,
                empty,
                conflict,
                ..
            }) => (digest.clone(), *empty, conflict.clone()),
            _ => {
                return Err(Error::Misuse(format!(
                    "layer {index} resolved without a pending commit"
                )))
            }
        };

        let result = match (result, conflict) {
            (Ok(_), Some(other)) => Err(Error::Consistency {
                index,
                existing: digest.to_string(),
                requested: other.to_string(),
            }),
            (r, _) => r,
        };

        match result {
            Ok(info) => {
                inner.slots.insert(
                    index,
                    Slot::Committed {
                        key: digest,
                        info: info.clone(),
                        empty,
                    },
                );
                info!(layer = index, digest = %info.digest, empty, "layer committed");
                inner.apply_ready();
                Ok(info)
            }
            Err(e @ Error::Consistency { .. }) => {
                warn!(layer = index, %digest, error = %e, "layer commit failed");
                inner
                    .slots
                    .insert(index, Slot::Failed(Arc::new(e.to_shared())));
                Err(e)
            }
            Err(e) => {
                warn!(layer = index, %digest, error = %e, "layer commit failed; index released");
                inner.slots.remove(&index);
                Err(e)
            }
        }
    }

    /// Current state of `index`.
    pub fn status(&self, index: usize) -> LayerStatus {
        match self.lock().slots.get(&index) {
            None => LayerStatus::Unregistered,
            Some(Slot::Pending { .. }) => LayerStatus::Pending,
            Some(Slot::Committed { .. }) => LayerStatus::Committed,
            Some(Slot::Failed(_)) => LayerStatus::Failed,
        }
    }

    /// Descriptor committed at `index`, if any.
    pub fn committed(&self, index: usize) -> Option<BlobInfo> {
        match self.lock().slots.get(&index) {
            Some(Slot::Committed { info, .. }) => Some(info.clone()),
            _ => None,
        }
    }

    /// Indices in `0..expected` that are not committed.
    pub fn uncommitted(&self, expected: usize) -> Vec<usize> {
        let inner = self.lock();
        (0..expected)
            .filter(|i| !matches!(inner.slots.get(i), Some(Slot::Committed { .. })))
            .collect()
    }

    /// The contiguous, in-order prefix of committed layers.
    pub fn layer_chain(&self) -> Vec<ChainLink> {
        self.lock().chain.clone()
    }
}

impl Inner {
    /// Append every committed layer that directly follows the applied prefix.
    fn apply_ready(&mut self) {
        loop {
            let next = self.chain.len();
            let Some(Slot::Committed { info, empty, .. }) = self.slots.get(&next) else {
                return;
            };
            let parent = self.chain.last().and_then(|l| l.chain_id.clone());
            let chain_id = match (parent, *empty) {
                (parent, true) => parent,
                (None, false) => Some(info.digest.clone()),
                (Some(p), false) => {
                    Some(Digest::sha256(format!("{} {}", p, info.digest).as_bytes()))
                }
            };
            debug!(layer = next, chain_id = ?chain_id.as_ref().map(|d| d.to_string()), "applied layer");
            self.chain.push(ChainLink {
                index: next,
                digest: info.digest.clone(),
                empty: *empty,
                chain_id,
            });
        }
    }
}

/// Attach to an already claimed slot, recording a conflict if `digest`
/// differs from the one the index was claimed with.
fn join_slot(index: usize, slot: &mut Slot, digest: &Digest) -> Result<Joined> {
    match slot {
        Slot::Pending {
            digest: pending,
            conflict,
            done,
            ..
        } => {
            if pending != digest {
                warn!(layer = index, existing = %pending, requested = %digest, "conflicting layer commit");
                *conflict = Some(digest.clone());
                return Err(Error::Consistency {
                    index,
                    existing: pending.to_string(),
                    requested: digest.to_string(),
                });
            }
            Ok(Joined::Waiter(done.clone()))
        }
        Slot::Committed { key, info, .. } => {
            if key != digest {
                return Err(Error::Consistency {
                    index,
                    existing: key.to_string(),
                    requested: digest.to_string(),
                });
            }
            debug!(layer = index, %digest, "layer already committed");
            Ok(Joined::Done(info.clone()))
        }
        Slot::Failed(source) => Err(Error::LayerFailed {
            index,
            source: source.clone(),
        }),
    }
}

async fn wait_for_owner(
    cancel: &CancellationToken,
    index: usize,
    digest: &Digest,
    mut rx: watch::Receiver<Option<Outcome>>,
) -> Result<BlobInfo> {
    debug!(layer = index, %digest, "waiting for in-flight layer commit");
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        r = rx.wait_for(|o| o.is_some()) => r.ok().and_then(|v| (*v).clone()),
    };
    match outcome {
        Some(Ok(info)) => Ok(info),
        Some(Err(source)) => Err(Error::LayerFailed { index, source }),
        None => Err(Error::LayerFailed {
            index,
            source: Arc::new(Error::Cancelled),
        }),
    }
}

/// Resolves the owner's pending slot, including when the owner's future is
/// dropped before finishing.
struct PendingGuard<'a> {
    coordinator: &'a LayerCommitCoordinator,
    index: usize,
    tx: Option<watch::Sender<Option<Outcome>>>,
}

impl PendingGuard<'_> {
    fn finish(&mut self, result: Result<BlobInfo>) -> Result<BlobInfo> {
        let out = self.coordinator.resolve(self.index, result);
        let shared: Outcome = match &out {
            Ok(info) => Ok(info.clone()),
            Err(e) => Err(Arc::new(e.to_shared())),
        };
        if let Some(tx) = self.tx.take() {
            tx.send_replace(Some(shared));
        }
        out
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            debug!(layer = self.index, "layer commit abandoned");
            let _ = self.finish(Err(Error::Cancelled));
        }
    }
}
