//! Startup reconciliation of the durable cart with the session overlay.
//!
//! Two sources compete for the working state: the raw durable snapshot read
//! straight from storage, and whatever the store already holds in memory. A
//! non-empty durable read always wins, because every mutation writes it
//! synchronously; the in-memory candidate only fills in when storage is empty
//! or unreadable. Across tabs this is last-writer-wins on the whole snapshot.

use std::collections::BTreeMap;

use farmstand_core::{CartLine, CartSnapshot, OverlayEntry, ProductId};
use farmstand_storage::KeyValueStore;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSource {
    Durable,
    InMemory,
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RehydrationReport {
    pub source: SnapshotSource,
    /// The durable entry existed but could not be read or parsed.
    pub durable_unreadable: bool,
    pub stale_purged: usize,
    pub overlays_applied: usize,
    pub synthesized: usize,
    /// Lines left behind by an abandoned overlay and rolled back.
    pub recovered: usize,
    /// Overlay entries with neither a cart line nor metadata to build one; purged.
    pub orphans_purged: usize,
}

impl RehydrationReport {
    pub(crate) fn new(source: SnapshotSource, durable_unreadable: bool) -> Self {
        Self {
            source,
            durable_unreadable,
            stale_purged: 0,
            overlays_applied: 0,
            synthesized: 0,
            recovered: 0,
            orphans_purged: 0,
        }
    }
}

/// Read the durable snapshot, bypassing anything cached in memory. Storage and
/// parse failures read as "no snapshot"; the flag reports that it happened.
pub(crate) fn read_durable<D: KeyValueStore>(durable: &D, key: &str) -> (Option<CartSnapshot>, bool) {
    let raw = match durable.get(key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return (None, false),
        Err(e) => {
            warn!(key, error = %e, "durable cart unreadable, treating as empty");
            return (None, true);
        }
    };
    match CartSnapshot::from_json(&raw) {
        Ok(snapshot) => (Some(snapshot), false),
        Err(e) => {
            warn!(key, error = %e, "durable cart malformed, treating as empty");
            (None, true)
        }
    }
}

pub(crate) fn choose_candidate(
    ground_truth: Option<CartSnapshot>,
    in_memory: &CartSnapshot,
) -> (CartSnapshot, SnapshotSource) {
    match ground_truth {
        Some(snapshot) if !snapshot.is_empty() => (snapshot, SnapshotSource::Durable),
        _ if !in_memory.is_empty() => (in_memory.clone(), SnapshotSource::InMemory),
        _ => (CartSnapshot::default(), SnapshotSource::Empty),
    }
}

pub(crate) struct OverlayView {
    pub snapshot: CartSnapshot,
    pub applied: usize,
    pub synthesized: usize,
    pub recovered: usize,
    /// Entries that could not be turned into a line.
    pub orphans: Vec<ProductId>,
}

/// Lay overlay entries over a durable snapshot to get the effective state.
///
/// - A line with an entry takes the entry's quantity and is flagged active.
///   If it was not flagged yet, its quantity becomes the original.
/// - A line persisted as overlay-active without an entry belonged to an
///   abandoned episode: restored to its original quantity, or dropped if the
///   overlay created it.
/// - An entry without a line is synthesized from its metadata, with no
///   original quantity, so rollback deletes it.
/// - Original quantities survive only for lines whose entry still exists.
pub(crate) fn apply_overlays(
    mut snapshot: CartSnapshot,
    entries: &[(ProductId, OverlayEntry)],
    global_cap: Option<u32>,
) -> OverlayView {
    let by_id: BTreeMap<&ProductId, &OverlayEntry> = entries.iter().map(|(id, e)| (id, e)).collect();
    let mut applied = 0;
    let mut recovered = 0;

    let mut lines = Vec::with_capacity(snapshot.lines.len());
    for mut line in std::mem::take(&mut snapshot.lines) {
        if let Some(entry) = by_id.get(&line.product_id) {
            // An unflagged line under an entry was written by a tab that never
            // saw the overlay, so its quantity is the pre-overlay one.
            if !line.is_overlay_active {
                snapshot
                    .original_quantities
                    .entry(line.product_id.clone())
                    .or_insert(line.quantity);
            }
            line.quantity = line.cap(entry.quantity, global_cap);
            line.is_overlay_active = true;
            applied += 1;
            lines.push(line);
        } else if line.is_overlay_active {
            recovered += 1;
            if let Some(original) = snapshot.original_quantities.get(&line.product_id) {
                line.quantity = *original;
                line.is_overlay_active = false;
                lines.push(line);
            }
        } else {
            lines.push(line);
        }
    }
    snapshot.lines = lines;
    snapshot
        .original_quantities
        .retain(|id, _| by_id.contains_key(id));

    let mut synthesized = 0;
    let mut orphans = Vec::new();
    for (product_id, entry) in entries {
        if snapshot.line(product_id).is_some() {
            continue;
        }
        match &entry.metadata {
            Some(metadata) => {
                let mut line = CartLine::new(product_id.clone(), entry.quantity, metadata.clone())
                    .with_max_quantity(entry.max_quantity);
                line.quantity = line.cap(entry.quantity, global_cap);
                line.is_overlay_active = true;
                snapshot.lines.push(line);
                synthesized += 1;
            }
            None => orphans.push(product_id.clone()),
        }
    }

    OverlayView {
        snapshot,
        applied,
        synthesized,
        recovered,
        orphans,
    }
}

#[cfg(test)]
mod tests {
    use farmstand_core::LineMetadata;
    use farmstand_storage::MemoryStorage;
    use rust_decimal::Decimal;

    use super::*;

    fn line(id: &str, quantity: u32) -> CartLine {
        CartLine::new(
            ProductId::new(id),
            quantity,
            LineMetadata::new(id, Decimal::ONE, "farm"),
        )
    }

    fn entry(quantity: u32, metadata: Option<LineMetadata>) -> OverlayEntry {
        OverlayEntry {
            quantity,
            created_at: 0,
            metadata,
            max_quantity: None,
        }
    }

    #[test]
    fn non_empty_durable_wins() {
        let mut durable = CartSnapshot::default();
        durable.lines.push(line("carrot", 1));
        let mut memory = CartSnapshot::default();
        memory.lines.push(line("beet", 4));

        let (chosen, source) = choose_candidate(Some(durable.clone()), &memory);
        assert_eq!(source, SnapshotSource::Durable);
        assert_eq!(chosen, durable);
    }

    #[test]
    fn empty_durable_falls_back_to_memory() {
        let mut memory = CartSnapshot::default();
        memory.lines.push(line("beet", 4));

        let (chosen, source) = choose_candidate(Some(CartSnapshot::default()), &memory);
        assert_eq!(source, SnapshotSource::InMemory);
        assert_eq!(chosen, memory);

        let (_, source) = choose_candidate(None, &memory);
        assert_eq!(source, SnapshotSource::InMemory);

        let (chosen, source) = choose_candidate(None, &CartSnapshot::default());
        assert_eq!(source, SnapshotSource::Empty);
        assert!(chosen.is_empty());
    }

    #[test]
    fn read_durable_absorbs_garbage() {
        let mut storage = MemoryStorage::new();
        assert_eq!(read_durable(&storage, "cart"), (None, false));

        storage.set("cart", "{not json").unwrap();
        assert_eq!(read_durable(&storage, "cart"), (None, true));

        storage.set("cart", r#"{"lines":[{"productId":"x","quantity":2}]}"#).unwrap();
        let (snapshot, unreadable) = read_durable(&storage, "cart");
        assert!(!unreadable);
        assert_eq!(snapshot.unwrap().lines[0].quantity, 2);
    }

    #[test]
    fn overlay_replaces_quantity_and_flags_line() {
        let mut snapshot = CartSnapshot::default();
        snapshot.lines.push(line("apple", 3));
        snapshot.lines.push(line("pear", 2));
        snapshot.original_quantities.insert(ProductId::new("apple"), 3);

        let entries = vec![(ProductId::new("apple"), entry(1, None))];
        let view = apply_overlays(snapshot, &entries, None);

        let apple = view.snapshot.line(&ProductId::new("apple")).unwrap();
        assert_eq!(apple.quantity, 1);
        assert!(apple.is_overlay_active);
        let pear = view.snapshot.line(&ProductId::new("pear")).unwrap();
        assert_eq!(pear.quantity, 2);
        assert!(!pear.is_overlay_active);
        assert_eq!(view.applied, 1);
        assert_eq!(view.snapshot.original_quantities.len(), 1);
    }

    #[test]
    fn unflagged_line_under_entry_keeps_its_quantity_as_original() {
        let mut snapshot = CartSnapshot::default();
        snapshot.lines.push(line("apple", 3));

        let entries = vec![(ProductId::new("apple"), entry(1, None))];
        let view = apply_overlays(snapshot, &entries, None);

        assert_eq!(view.snapshot.lines[0].quantity, 1);
        assert_eq!(
            view.snapshot.original_quantities.get(&ProductId::new("apple")),
            Some(&3)
        );
    }

    #[test]
    fn abandoned_overlay_lines_roll_back() {
        let mut snapshot = CartSnapshot::default();
        let mut apple = line("apple", 1);
        apple.is_overlay_active = true;
        let mut fig = line("fig", 2);
        fig.is_overlay_active = true;
        snapshot.lines.push(apple);
        snapshot.lines.push(fig);
        snapshot.original_quantities.insert(ProductId::new("apple"), 3);

        let view = apply_overlays(snapshot, &[], None);
        assert_eq!(view.recovered, 2);
        assert_eq!(view.snapshot.lines.len(), 1);
        let apple = &view.snapshot.lines[0];
        assert_eq!(apple.quantity, 3);
        assert!(!apple.is_overlay_active);
        assert!(view.snapshot.original_quantities.is_empty());
    }

    #[test]
    fn entry_without_line_is_synthesized_or_orphaned() {
        let meta = LineMetadata::new("Banana", Decimal::new(45, 2), "grove");
        let entries = vec![
            (ProductId::new("banana"), entry(2, Some(meta))),
            (ProductId::new("ghost"), entry(1, None)),
        ];
        let view = apply_overlays(CartSnapshot::default(), &entries, None);

        assert_eq!(view.synthesized, 1);
        assert_eq!(view.orphans, vec![ProductId::new("ghost")]);
        let banana = view.snapshot.line(&ProductId::new("banana")).unwrap();
        assert_eq!(banana.quantity, 2);
        assert!(banana.is_overlay_active);
        assert!(view.snapshot.original_quantities.is_empty());
    }

    #[test]
    fn overlay_quantity_respects_caps() {
        let mut snapshot = CartSnapshot::default();
        snapshot.lines.push(line("egg", 1).with_max_quantity(Some(6)));
        let entries = vec![(ProductId::new("egg"), entry(12, None))];
        let view = apply_overlays(snapshot, &entries, Some(100));
        assert_eq!(view.snapshot.lines[0].quantity, 6);
    }
}
