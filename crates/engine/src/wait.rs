use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use farmstand_core::ProductId;
use farmstand_storage::KeyValueStore;
use tokio::sync::Notify;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::checkout::CheckoutItem;
use crate::config::VisibilityPolicy;
use crate::{CartStore, EngineError};

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cancellation handle for a pending wait. Clones share state; the view that
/// started the wait cancels it on teardown.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Wait until `product_id` shows up in the checkout projection, re-reading
/// storage on every poll.
///
/// Polls back off per `policy` up to its ceiling. Reaching the ceiling rolls
/// the overlay back and returns [`EngineError::WaitTimedOut`]; cancellation
/// returns [`EngineError::WaitCancelled`] and touches nothing.
pub async fn wait_for_checkout_item<D, S>(
    store: &mut CartStore<D, S>,
    product_id: &ProductId,
    policy: &VisibilityPolicy,
    cancel: &CancelToken,
) -> Result<Vec<CheckoutItem>, EngineError>
where
    D: KeyValueStore,
    S: KeyValueStore,
{
    let started = Instant::now();
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(EngineError::WaitCancelled);
        }

        store.rehydrate();
        let items = store.checkout_items();
        if items.iter().any(|i| &i.product_id == product_id) {
            debug!(%product_id, attempt, "checkout item visible");
            return Ok(items);
        }

        let waited = started.elapsed();
        if waited >= policy.max_wait {
            let waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX);
            warn!(%product_id, waited_ms, "checkout item never appeared, rolling back");
            store.rollback_overlay()?;
            return Err(EngineError::WaitTimedOut {
                product_id: product_id.to_string(),
                waited_ms,
            });
        }

        let delay = policy.delay_for(attempt).min(policy.max_wait - waited);
        attempt = attempt.saturating_add(1);
        tokio::select! {
            () = sleep(delay) => {}
            () = cancel.cancelled() => return Err(EngineError::WaitCancelled),
        }
    }
}
