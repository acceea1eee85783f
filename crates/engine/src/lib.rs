pub mod checkout;
pub mod config;
pub mod error;
pub mod overlay;
pub mod rehydrate;
pub mod wait;

pub use checkout::{CheckoutItem, CheckoutSession, CheckoutStatus, OrderFailure, OrderSubmitter};
pub use config::{CartConfig, ConfigError, VisibilityPolicy};
pub use error::EngineError;
pub use overlay::OverlayStore;
pub use rehydrate::{RehydrationReport, SnapshotSource};
pub use wait::{CancelToken, wait_for_checkout_item};

use std::sync::Arc;

use farmstand_core::{
    CartLine, CartSnapshot, Clock, LineMetadata, OverlayEntry, ProductId, SystemClock,
    clamp_quantity,
};
use farmstand_storage::KeyValueStore;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::rehydrate::{apply_overlays, choose_candidate, read_durable};

/// How `add_item` treats the requested quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddMode {
    /// Regular "add to cart": quantities accumulate.
    Accumulate,
    /// "Buy now": the quantity temporarily replaces the line's, until commit or rollback.
    Overlay,
}

/// The shopping cart of one browsing context.
///
/// Owns the working cart state, writes it wholesale to `durable` after every
/// mutation, and keeps buy-now entries in the tab's `session` storage.
/// Construct one per tab at startup and hand it to whatever renders the cart.
pub struct CartStore<D, S> {
    durable: D,
    overlays: OverlayStore<S>,
    state: CartSnapshot,
    config: CartConfig,
    clock: Arc<dyn Clock>,
}

impl<D: KeyValueStore, S: KeyValueStore> CartStore<D, S> {
    pub fn open(durable: D, session: S, config: CartConfig) -> Self {
        Self::with_clock(durable, session, config, Arc::new(SystemClock))
    }

    /// Build the store and run rehydration once.
    pub fn with_clock(durable: D, session: S, config: CartConfig, clock: Arc<dyn Clock>) -> Self {
        let overlays = OverlayStore::new(session, config.overlay_prefix.clone(), clock.clone());
        let mut store = Self {
            durable,
            overlays,
            state: CartSnapshot::default(),
            config,
            clock,
        };
        store.rehydrate();
        store
    }

    /// Tear down, handing back both storages (e.g. to reopen after a reload).
    pub fn close(self) -> (D, S) {
        (self.durable, self.overlays.into_storage())
    }

    pub fn config(&self) -> &CartConfig {
        &self.config
    }

    pub fn overlays(&self) -> &OverlayStore<S> {
        &self.overlays
    }

    pub fn durable(&self) -> &D {
        &self.durable
    }

    /// The working state as last persisted, before overlay reconciliation.
    pub fn snapshot(&self) -> &CartSnapshot {
        &self.state
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    // ========================================================================
    // Rehydration
    // ========================================================================

    /// Rebuild the working state from storage. Safe to call at any time; two
    /// runs over unchanged storage produce the same effective lines.
    pub fn rehydrate(&mut self) -> RehydrationReport {
        let (ground_truth, durable_unreadable) = read_durable(&self.durable, &self.config.storage_key);
        let (candidate, source) = choose_candidate(ground_truth, &self.state);
        let mut report = RehydrationReport::new(source, durable_unreadable);

        report.stale_purged = self
            .overlays
            .purge_stale(self.config.overlay_ttl_ms())
            .unwrap_or_else(|e| {
                warn!(error = %e, "overlay purge failed");
                0
            });

        let entries = match self.overlays.entries() {
            Ok(entries) => entries,
            Err(e) => {
                // Without the session view the persisted flags are the best guess.
                warn!(error = %e, "overlay entries unreadable, keeping persisted flags");
                self.state = candidate;
                return report;
            }
        };

        let view = apply_overlays(candidate, &entries, self.config.max_line_quantity);
        for product_id in &view.orphans {
            match self.overlays.clear_overlay(product_id) {
                Ok(()) => report.orphans_purged += 1,
                Err(e) => warn!(%product_id, error = %e, "could not purge orphan overlay"),
            }
        }
        report.overlays_applied = view.applied;
        report.synthesized = view.synthesized;
        report.recovered = view.recovered;
        self.state = view.snapshot;

        info!(
            source = ?report.source,
            lines = self.state.lines.len(),
            stale_purged = report.stale_purged,
            overlays = report.overlays_applied,
            synthesized = report.synthesized,
            recovered = report.recovered,
            "cart rehydrated"
        );
        report
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    fn persist(&mut self) -> Result<(), EngineError> {
        let raw = self.state.to_json()?;
        self.durable.set(&self.config.storage_key, &raw)?;
        Ok(())
    }

    /// Apply `f` to the working state and persist it; on a failed write the
    /// working state is left as it was.
    fn mutate<T>(&mut self, f: impl FnOnce(&mut CartSnapshot) -> T) -> Result<T, EngineError> {
        let before = self.state.clone();
        let out = f(&mut self.state);
        if let Err(e) = self.persist() {
            self.state = before;
            return Err(e);
        }
        Ok(out)
    }

    /// Put back session entries captured before a multi-store write that failed.
    fn restore_overlays(&mut self, saved: Vec<(ProductId, Option<OverlayEntry>)>) {
        for (product_id, entry) in saved {
            let result = match entry {
                Some(entry) => self.overlays.put_entry(&product_id, &entry),
                None => self.overlays.clear_overlay(&product_id),
            };
            if let Err(e) = result {
                warn!(%product_id, error = %e, "could not restore overlay entry");
            }
        }
    }

    fn overlay_entries_or_empty(&self) -> Vec<(ProductId, OverlayEntry)> {
        self.overlays.peek_entries().unwrap_or_else(|e| {
            warn!(error = %e, "overlay entries unreadable");
            Vec::new()
        })
    }

    pub fn add_item(
        &mut self,
        product_id: &ProductId,
        quantity: i64,
        metadata: LineMetadata,
        mode: AddMode,
    ) -> Result<(), EngineError> {
        match mode {
            AddMode::Accumulate => self.accumulate(product_id, quantity, metadata, None),
            AddMode::Overlay => self.apply_overlay(product_id, quantity, metadata, None),
        }
    }

    /// `add_item` for a product that declares a per-line maximum.
    pub fn add_capped_item(
        &mut self,
        product_id: &ProductId,
        quantity: i64,
        metadata: LineMetadata,
        max_quantity: u32,
        mode: AddMode,
    ) -> Result<(), EngineError> {
        let max_quantity = Some(max_quantity).filter(|m| *m > 0);
        match mode {
            AddMode::Accumulate => self.accumulate(product_id, quantity, metadata, max_quantity),
            AddMode::Overlay => self.apply_overlay(product_id, quantity, metadata, max_quantity),
        }
    }

    /// Start a buy-now episode for `product_id`.
    pub fn buy_now(
        &mut self,
        product_id: &ProductId,
        quantity: i64,
        metadata: LineMetadata,
    ) -> Result<(), EngineError> {
        self.add_item(product_id, quantity, metadata, AddMode::Overlay)
    }

    fn accumulate(
        &mut self,
        product_id: &ProductId,
        quantity: i64,
        metadata: LineMetadata,
        max_quantity: Option<u32>,
    ) -> Result<(), EngineError> {
        let requested = clamp_quantity(quantity);
        let cap = self.config.max_line_quantity;
        let active: Vec<ProductId> = self
            .overlay_entries_or_empty()
            .into_iter()
            .map(|(id, _)| id)
            .collect();

        let resulting = self.mutate(|state| {
            let original = state.original_quantities.get(product_id).copied();
            let (resulting, deferred) = match state.line_mut(product_id) {
                Some(line) => {
                    line.metadata = metadata;
                    if max_quantity.is_some() {
                        line.max_quantity = max_quantity;
                    }
                    if line.is_overlay_active {
                        // The overlay quantity stays in force; the addition lands
                        // on the quantity that comes back after rollback.
                        let base = original.unwrap_or(0);
                        (line.cap(base.saturating_add(requested), cap), true)
                    } else {
                        line.quantity = line.cap(line.quantity.saturating_add(requested), cap);
                        (line.quantity, false)
                    }
                }
                None => {
                    let mut line = CartLine::new(product_id.clone(), requested, metadata)
                        .with_max_quantity(max_quantity);
                    line.quantity = line.cap(requested, cap);
                    let resulting = line.quantity;
                    state.lines.push(line);
                    (resulting, false)
                }
            };
            if deferred {
                state.original_quantities.insert(product_id.clone(), resulting);
            }
            for line in &mut state.lines {
                line.is_overlay_active = active.contains(&line.product_id);
            }
            resulting
        })?;

        debug!(%product_id, requested, resulting, "item added");
        Ok(())
    }

    fn apply_overlay(
        &mut self,
        product_id: &ProductId,
        quantity: i64,
        metadata: LineMetadata,
        max_quantity: Option<u32>,
    ) -> Result<(), EngineError> {
        let cap = self.config.max_line_quantity;
        let existing = self.state.line(product_id).cloned();
        let max_quantity = max_quantity.or(existing.as_ref().and_then(|l| l.max_quantity));

        let mut line = match &existing {
            Some(line) => line.clone(),
            None => CartLine::new(product_id.clone(), 1, metadata.clone()),
        };
        line.metadata = metadata.clone();
        line.max_quantity = max_quantity;
        let overlay_quantity = line.cap(clamp_quantity(quantity), cap);

        let previous_entry = self.overlays.entry(product_id)?;
        self.overlays.set_overlay(
            product_id,
            i64::from(overlay_quantity),
            Some(metadata),
            max_quantity,
        )?;

        let result = self.mutate(|state| {
            match state.line(product_id).map(|l| (l.quantity, l.is_overlay_active)) {
                Some((current_quantity, already_overlaid)) => {
                    // Only a line that predates the overlay gets a snapshot.
                    if !already_overlaid && !state.original_quantities.contains_key(product_id) {
                        state
                            .original_quantities
                            .insert(product_id.clone(), current_quantity);
                    }
                    if let Some(current) = state.line_mut(product_id) {
                        current.metadata = line.metadata;
                        current.max_quantity = line.max_quantity;
                        current.quantity = overlay_quantity;
                        current.is_overlay_active = true;
                    }
                }
                None => {
                    line.quantity = overlay_quantity;
                    line.is_overlay_active = true;
                    state.lines.push(line);
                }
            }
        });

        if let Err(e) = result {
            self.restore_overlays(vec![(product_id.clone(), previous_entry)]);
            return Err(e);
        }
        info!(%product_id, quantity = overlay_quantity, pre_existing = existing.is_some(), "buy-now overlay applied");
        Ok(())
    }

    /// Delete the line outright, together with any overlay entry and snapshot.
    pub fn remove_item(&mut self, product_id: &ProductId) -> Result<(), EngineError> {
        let previous_entry = self.overlays.entry(product_id)?;
        if previous_entry.is_some() {
            self.overlays.clear_overlay(product_id)?;
        }
        let result = self.mutate(|state| {
            state.original_quantities.remove(product_id);
            state.remove_line(product_id).is_some()
        });
        match result {
            Ok(removed) => {
                debug!(%product_id, removed, "item removed");
                Ok(())
            }
            Err(e) => {
                if previous_entry.is_some() {
                    self.restore_overlays(vec![(product_id.clone(), previous_entry)]);
                }
                Err(e)
            }
        }
    }

    /// Set a line's quantity directly. Zero or less removes the line; unknown
    /// products are ignored. An active overlay entry is rewritten to match.
    pub fn update_quantity(&mut self, product_id: &ProductId, quantity: i64) -> Result<(), EngineError> {
        if quantity <= 0 {
            return self.remove_item(product_id);
        }
        let Some(line) = self.state.line(product_id) else {
            debug!(%product_id, "quantity update for absent line ignored");
            return Ok(());
        };
        let new_quantity = line.cap(clamp_quantity(quantity), self.config.max_line_quantity);

        let previous_entry = self.overlays.entry(product_id)?;
        if let Some(entry) = &previous_entry {
            let mut updated = entry.clone();
            updated.quantity = new_quantity;
            self.overlays.put_entry(product_id, &updated)?;
        }

        let result = self.mutate(|state| {
            if let Some(line) = state.line_mut(product_id) {
                line.quantity = new_quantity;
            }
        });
        if let Err(e) = result {
            if previous_entry.is_some() {
                self.restore_overlays(vec![(product_id.clone(), previous_entry)]);
            }
            return Err(e);
        }
        debug!(%product_id, quantity = new_quantity, "quantity updated");
        Ok(())
    }

    /// Make every overlay quantity permanent and end the episode.
    /// Returns how many lines were committed; 0 when no overlay was active.
    pub fn commit_overlay(&mut self) -> Result<usize, EngineError> {
        self.commit_scoped(None)
    }

    /// Commit only the overlays on `product_ids`, leaving any other buy-now
    /// entry active.
    pub fn commit_products(&mut self, product_ids: &[ProductId]) -> Result<usize, EngineError> {
        self.commit_scoped(Some(product_ids))
    }

    fn commit_scoped(&mut self, scope: Option<&[ProductId]>) -> Result<usize, EngineError> {
        let effective = self.effective_snapshot();
        let saved = self.drain_overlays(scope)?;

        let result = self.mutate(|state| {
            let mut committed = 0;
            let mut next = effective;
            for line in &mut next.lines {
                if line.is_overlay_active && in_scope(scope, &line.product_id) {
                    line.is_overlay_active = false;
                    committed += 1;
                }
            }
            next.original_quantities.retain(|id, _| !in_scope(scope, id));
            *state = next;
            committed
        });

        match result {
            Ok(committed) => {
                if committed > 0 {
                    info!(committed, "buy-now overlay committed");
                }
                Ok(committed)
            }
            Err(e) => {
                self.restore_overlays(saved);
                Err(e)
            }
        }
    }

    /// Abandon the episode: restore pre-overlay quantities and drop lines the
    /// overlay created. Returns how many lines were affected.
    pub fn rollback_overlay(&mut self) -> Result<usize, EngineError> {
        let active: Vec<ProductId> = self
            .effective_lines()
            .into_iter()
            .filter(|l| l.is_overlay_active)
            .map(|l| l.product_id)
            .collect();
        let saved = self.drain_overlays(None)?;

        let result = self.mutate(|state| {
            let originals = std::mem::take(&mut state.original_quantities);
            let mut affected = 0;
            state.lines.retain_mut(|line| {
                if !line.is_overlay_active && !active.contains(&line.product_id) {
                    return true;
                }
                affected += 1;
                match originals.get(&line.product_id) {
                    Some(original) => {
                        line.quantity = *original;
                        line.is_overlay_active = false;
                        true
                    }
                    None => false,
                }
            });
            affected
        });

        match result {
            Ok(affected) => {
                if affected > 0 {
                    info!(affected, "buy-now overlay rolled back");
                }
                Ok(affected)
            }
            Err(e) => {
                self.restore_overlays(saved);
                Err(e)
            }
        }
    }

    /// Remove the overlay entries in `scope` (all of them for `None`),
    /// returning what was there so a failed durable write can put it back.
    fn drain_overlays(
        &mut self,
        scope: Option<&[ProductId]>,
    ) -> Result<Vec<(ProductId, Option<OverlayEntry>)>, EngineError> {
        let saved: Vec<_> = self
            .overlays
            .entries()?
            .into_iter()
            .filter(|(id, _)| in_scope(scope, id))
            .map(|(id, entry)| (id, Some(entry)))
            .collect();
        match scope {
            None => {
                self.overlays.clear_all()?;
            }
            Some(_) => {
                for (product_id, _) in &saved {
                    self.overlays.clear_overlay(product_id)?;
                }
            }
        }
        Ok(saved)
    }

    /// Empty the cart: lines, snapshots and overlay entries.
    pub fn clear(&mut self) -> Result<(), EngineError> {
        let saved = self.drain_overlays(None)?;
        if let Err(e) = self.mutate(|state| *state = CartSnapshot::default()) {
            self.restore_overlays(saved);
            return Err(e);
        }
        info!("cart cleared");
        Ok(())
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// The canonical read path: durable lines with any overlay laid over them.
    pub fn effective_lines(&self) -> Vec<CartLine> {
        self.effective_snapshot().lines
    }

    fn effective_snapshot(&self) -> CartSnapshot {
        let entries = match self.overlays.peek_entries() {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "overlay entries unreadable, showing persisted lines");
                return self.state.clone();
            }
        };
        apply_overlays(self.state.clone(), &entries, self.config.max_line_quantity).snapshot
    }

    pub fn line(&self, product_id: &ProductId) -> Option<CartLine> {
        self.effective_lines()
            .into_iter()
            .find(|l| &l.product_id == product_id)
    }

    pub fn contains(&self, product_id: &ProductId) -> bool {
        self.line(product_id).is_some()
    }

    pub fn has_active_overlay(&self) -> bool {
        self.effective_lines().iter().any(|l| l.is_overlay_active)
    }

    pub fn distinct_count(&self) -> usize {
        self.effective_lines().len()
    }

    pub fn total_item_count(&self) -> u64 {
        self.effective_lines()
            .iter()
            .map(|l| u64::from(l.quantity))
            .sum()
    }

    pub fn total_price(&self) -> Decimal {
        self.effective_lines().iter().map(CartLine::line_total).sum()
    }
}

fn in_scope(scope: Option<&[ProductId]>, product_id: &ProductId) -> bool {
    scope.is_none_or(|ids| ids.contains(product_id))
}
