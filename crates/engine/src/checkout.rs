use farmstand_core::{CartLine, EpisodeId, OrderId, ProductId, SellerId};
use farmstand_storage::KeyValueStore;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::{CartStore, EngineError};

/// One line of an order as the submission collaborator receives it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutItem {
    pub product_id: ProductId,
    pub seller_id: SellerId,
    pub quantity: u32,
    pub unit_price: Decimal,
}

impl CheckoutItem {
    pub fn line_total(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

impl From<&CartLine> for CheckoutItem {
    fn from(line: &CartLine) -> Self {
        Self {
            product_id: line.product_id.clone(),
            seller_id: line.metadata.seller_id.clone(),
            quantity: line.quantity,
            unit_price: line.metadata.unit_price,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderFailure {
    #[error("payment declined")]
    PaymentDeclined,

    #[error("{product_id} is out of stock")]
    OutOfStock { product_id: ProductId },

    #[error("order service unavailable: {0}")]
    Unavailable(String),
}

/// The order backend. Takes the checkout projection, returns an order id.
pub trait OrderSubmitter {
    fn submit(&mut self, items: &[CheckoutItem]) -> Result<OrderId, OrderFailure>;
}

impl<D: KeyValueStore, S: KeyValueStore> CartStore<D, S> {
    /// Lines the checkout must present. While a buy-now overlay is active only
    /// the overlaid lines are included; otherwise the whole effective cart.
    pub fn checkout_lines(&self) -> Vec<CartLine> {
        let lines = self.effective_lines();
        if lines.iter().any(|l| l.is_overlay_active) {
            lines.into_iter().filter(|l| l.is_overlay_active).collect()
        } else {
            lines
        }
    }

    pub fn checkout_items(&self) -> Vec<CheckoutItem> {
        self.checkout_lines().iter().map(CheckoutItem::from).collect()
    }

    pub fn checkout_total(&self) -> Decimal {
        self.checkout_lines().iter().map(CartLine::line_total).sum()
    }

    /// Freeze the projection into a checkout attempt.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::EmptyCheckout`] when there is nothing to buy.
    pub fn begin_checkout(&self) -> Result<CheckoutSession, EngineError> {
        let lines = self.checkout_lines();
        if lines.is_empty() {
            return Err(EngineError::EmptyCheckout);
        }
        let overlay = lines.iter().any(|l| l.is_overlay_active);
        let items: Vec<CheckoutItem> = lines.iter().map(CheckoutItem::from).collect();
        let total = items.iter().map(CheckoutItem::line_total).sum();
        let session = CheckoutSession {
            episode: EpisodeId::new(),
            items,
            total,
            overlay,
            status: CheckoutStatus::Open,
        };
        info!(episode = %session.episode, items = session.items.len(), overlay, "checkout started");
        Ok(session)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutStatus {
    Open,
    Committed { order_id: OrderId },
    RolledBack,
}

/// A single checkout attempt. Ends in exactly one commit or one rollback;
/// every call after that fails with [`EngineError::CheckoutClosed`].
#[derive(Debug)]
pub struct CheckoutSession {
    episode: EpisodeId,
    items: Vec<CheckoutItem>,
    total: Decimal,
    overlay: bool,
    status: CheckoutStatus,
}

impl CheckoutSession {
    pub fn episode(&self) -> EpisodeId {
        self.episode
    }

    pub fn items(&self) -> &[CheckoutItem] {
        &self.items
    }

    pub fn total(&self) -> Decimal {
        self.total
    }

    /// Whether this attempt is a buy-now purchase.
    pub fn is_overlay(&self) -> bool {
        self.overlay
    }

    pub fn status(&self) -> CheckoutStatus {
        self.status
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        match self.status {
            CheckoutStatus::Open => Ok(()),
            _ => Err(EngineError::CheckoutClosed(self.episode.to_string())),
        }
    }

    /// Submit the order. On success the overlays on the ordered products are
    /// committed and the session closes; a buy-now started after
    /// [`begin_checkout`](CartStore::begin_checkout) stays active. A rejected
    /// order leaves everything as it was so the shopper can retry.
    pub fn submit<D, S, O>(
        &mut self,
        store: &mut CartStore<D, S>,
        submitter: &mut O,
    ) -> Result<OrderId, EngineError>
    where
        D: KeyValueStore,
        S: KeyValueStore,
        O: OrderSubmitter + ?Sized,
    {
        self.ensure_open()?;
        let order_id = match submitter.submit(&self.items) {
            Ok(order_id) => order_id,
            Err(failure) => {
                warn!(episode = %self.episode, error = %failure, "order rejected");
                return Err(failure.into());
            }
        };
        // The order exists from here on, even if committing locally fails.
        self.status = CheckoutStatus::Committed { order_id };
        let committed = if self.overlay {
            let ordered: Vec<ProductId> = self.items.iter().map(|i| i.product_id.clone()).collect();
            store.commit_products(&ordered)?
        } else {
            0
        };
        info!(episode = %self.episode, %order_id, committed, "checkout completed");
        Ok(order_id)
    }

    /// Abandon the attempt and roll the overlay back.
    pub fn cancel<D, S>(&mut self, store: &mut CartStore<D, S>) -> Result<usize, EngineError>
    where
        D: KeyValueStore,
        S: KeyValueStore,
    {
        self.ensure_open()?;
        let affected = store.rollback_overlay()?;
        self.status = CheckoutStatus::RolledBack;
        info!(episode = %self.episode, affected, "checkout cancelled");
        Ok(affected)
    }
}
