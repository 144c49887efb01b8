//! Per-owner concurrency quotas
//!
//! Claims are increment-then-check: the counter is bumped first and the
//! post-increment value compared against the owner's limit. A denied claim
//! has still incremented the counter, so it is released like any other.
//! [`QuotaClaim`] ties that release to scope.

pub mod store;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error};

use crate::error::OrchestratorResult;
use crate::model::{OwnerId, QuotaOwner};

pub use store::{InMemoryQuotaStore, QuotaStore, RedisQuotaStore};

#[async_trait]
pub trait ConcurrencyGate: Send + Sync {
    /// Add one to the owner's active count and report whether the new count
    /// is within its limit. Must be paired with [`ConcurrencyGate::release`]
    /// whatever the answer.
    async fn claim(&self, owner: &QuotaOwner) -> OrchestratorResult<bool>;

    async fn release(&self, owner_id: OwnerId) -> OrchestratorResult<()>;

    async fn active_count(&self, owner_id: OwnerId) -> OrchestratorResult<i64>;
}

/// Gate backed by a [`QuotaStore`].
pub struct QuotaGate {
    store: Arc<dyn QuotaStore>,
}

impl QuotaGate {
    pub fn new(store: Arc<dyn QuotaStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ConcurrencyGate for QuotaGate {
    async fn claim(&self, owner: &QuotaOwner) -> OrchestratorResult<bool> {
        let count = self.store.increment(owner.id).await?;
        let admitted = owner.admits(count);
        debug!(
            owner_id = owner.id,
            active = count,
            limit = owner.available_streams,
            admitted,
            "Quota claim"
        );
        Ok(admitted)
    }

    async fn release(&self, owner_id: OwnerId) -> OrchestratorResult<()> {
        let count = self.store.decrement(owner_id).await?;
        debug!(owner_id, active = count, "Quota released");
        Ok(())
    }

    async fn active_count(&self, owner_id: OwnerId) -> OrchestratorResult<i64> {
        self.store.get(owner_id).await
    }
}

/// A held quota claim.
///
/// Dropping an uncommitted claim schedules its release on the runtime, which
/// covers cancelled requests. [`QuotaClaim::commit`] hands the release duty
/// over to the session that now owns the stream.
pub struct QuotaClaim {
    gate: Arc<dyn ConcurrencyGate>,
    owner_id: OwnerId,
    armed: bool,
}

impl QuotaClaim {
    /// Claim one stream for `owner`. Returns `None` (already released) when
    /// the owner is at capacity.
    pub async fn acquire(
        gate: &Arc<dyn ConcurrencyGate>,
        owner: &QuotaOwner,
    ) -> OrchestratorResult<Option<Self>> {
        let mut claim = Self {
            gate: Arc::clone(gate),
            owner_id: owner.id,
            armed: true,
        };

        match gate.claim(owner).await {
            Ok(true) => Ok(Some(claim)),
            Ok(false) => {
                claim.release().await?;
                Ok(None)
            }
            Err(e) => {
                // the store never confirmed the increment
                claim.armed = false;
                Err(e)
            }
        }
    }

    #[must_use]
    pub const fn owner_id(&self) -> OwnerId {
        self.owner_id
    }

    pub async fn release(mut self) -> OrchestratorResult<()> {
        self.armed = false;
        self.gate.release(self.owner_id).await
    }

    /// Keep the claim for the lifetime of a session.
    #[must_use]
    pub fn commit(mut self) -> OwnerId {
        self.armed = false;
        self.owner_id
    }
}

impl Drop for QuotaClaim {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let gate = Arc::clone(&self.gate);
        let owner_id = self.owner_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = gate.release(owner_id).await {
                        error!(owner_id, error = %e, "Failed to release dropped quota claim");
                    }
                });
            }
            Err(_) => error!(owner_id, "Quota claim dropped outside a runtime, release lost"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> (Arc<dyn ConcurrencyGate>, Arc<InMemoryQuotaStore>) {
        let store = Arc::new(InMemoryQuotaStore::new());
        let gate: Arc<dyn ConcurrencyGate> = Arc::new(QuotaGate::new(store.clone()));
        (gate, store)
    }

    fn owner(limit: u32) -> QuotaOwner {
        QuotaOwner {
            id: 1,
            available_streams: limit,
        }
    }

    #[tokio::test]
    async fn test_limit_admits_nth_denies_n_plus_one() {
        let (gate, store) = gate();
        let owner = owner(2);

        assert!(gate.claim(&owner).await.unwrap());
        assert!(gate.claim(&owner).await.unwrap());
        // third claim is over the limit but still counted until released
        assert!(!gate.claim(&owner).await.unwrap());
        assert_eq!(store.get(1).await.unwrap(), 3);
        gate.release(1).await.unwrap();
        assert_eq!(gate.active_count(1).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unlimited_owner() {
        let (gate, _) = gate();
        let owner = owner(0);
        for _ in 0..100 {
            assert!(gate.claim(&owner).await.unwrap());
        }
        assert_eq!(gate.active_count(1).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_denied_claim_is_released_immediately() {
        let (gate, store) = gate();
        let owner = owner(1);

        let first = QuotaClaim::acquire(&gate, &owner).await.unwrap();
        assert!(first.is_some());
        let second = QuotaClaim::acquire(&gate, &owner).await.unwrap();
        assert!(second.is_none());
        assert_eq!(store.get(1).await.unwrap(), 1);

        first.unwrap().release().await.unwrap();
        assert_eq!(store.get(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_committed_claim_survives_drop() {
        let (gate, store) = gate();
        let claim = QuotaClaim::acquire(&gate, &owner(1)).await.unwrap().unwrap();
        assert_eq!(claim.commit(), 1);
        tokio::task::yield_now().await;
        assert_eq!(store.get(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dropped_claim_releases() {
        let (gate, store) = gate();
        {
            let _claim = QuotaClaim::acquire(&gate, &owner(1)).await.unwrap().unwrap();
            assert_eq!(store.get(1).await.unwrap(), 1);
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(store.get(1).await.unwrap(), 0);
    }
}
