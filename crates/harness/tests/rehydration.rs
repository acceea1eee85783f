use std::time::Duration;

use farmstand_core::{Clock, OverlayEntry};
use farmstand_engine::SnapshotSource;
use farmstand_harness::{Product, TestBrowser};
use farmstand_storage::{KeyValueStore, SqliteStorage};

fn overlay_key(browser: &TestBrowser, product: &Product) -> String {
    format!("{}{}", browser.config.overlay_prefix, product.id)
}

// ============================================================================
// Cross-tab visibility
// ============================================================================

#[test]
fn second_tab_sees_write_made_after_it_opened() -> Result<(), Box<dyn std::error::Error>> {
    let browser = TestBrowser::new()?;
    let mut tab1 = browser.open_tab()?;
    let mut tab2 = browser.open_tab()?;
    let carrot = Product::carrot();
    assert_eq!(tab2.store.distinct_count(), 0);

    tab1.add(&carrot, 1)?;

    let report = tab2.store.rehydrate();
    assert_eq!(report.source, SnapshotSource::Durable);
    assert_eq!(tab2.quantity(&carrot), 1);
    Ok(())
}

#[test]
fn overlay_stays_in_its_own_tab() -> Result<(), Box<dyn std::error::Error>> {
    let browser = TestBrowser::new()?;
    let mut tab1 = browser.open_tab()?;
    let mut tab2 = browser.open_tab()?;
    let apple = Product::apple();
    tab1.add(&apple, 3)?;

    tab1.buy_now(&apple, 1)?;
    tab2.store.rehydrate();

    assert_eq!(tab1.quantity(&apple), 1);
    // The other tab has no session entry, so the persisted flag is an
    // abandoned episode from its point of view.
    assert_eq!(tab2.quantity(&apple), 3);
    assert!(!tab2.store.has_active_overlay());
    Ok(())
}

#[test]
fn rollback_after_foreign_write_restores_existing_line() -> Result<(), Box<dyn std::error::Error>> {
    let browser = TestBrowser::new()?;
    let mut tab1 = browser.open_tab()?;
    let apple = Product::apple();
    tab1.add(&apple, 3)?;
    let mut tab2 = browser.open_tab()?;

    tab1.buy_now(&apple, 1)?;
    // Tab 2 never saw the overlay and writes apple back unflagged.
    tab2.add(&Product::carrot(), 1)?;

    let mut tab1 = tab1.reload()?;
    let line = tab1.line(&apple).unwrap();
    assert_eq!(line.quantity, 1);
    assert!(line.is_overlay_active);
    assert_eq!(tab1.store.snapshot().original_quantities.get(&apple.id), Some(&3));

    tab1.store.rollback_overlay()?;
    assert_eq!(tab1.quantity(&apple), 3);
    assert_eq!(tab1.quantity(&Product::carrot()), 1);
    Ok(())
}

#[test]
fn unsynced_tab_overwrites_whole_snapshot() -> Result<(), Box<dyn std::error::Error>> {
    let browser = TestBrowser::new()?;
    let mut tab1 = browser.open_tab()?;
    let mut tab2 = browser.open_tab()?;

    tab1.add(&Product::apple(), 2)?;
    tab2.add(&Product::carrot(), 1)?;

    tab1.store.rehydrate();
    assert_eq!(tab1.quantity(&Product::apple()), 0);
    assert_eq!(tab1.quantity(&Product::carrot()), 1);
    Ok(())
}

#[test]
fn in_memory_state_fills_in_for_missing_durable_entry() -> Result<(), Box<dyn std::error::Error>> {
    let browser = TestBrowser::new()?;
    let mut tab = browser.open_tab()?;
    let apple = Product::apple();
    tab.add(&apple, 2)?;

    let mut other = SqliteStorage::open(&browser.durable_path())?;
    other.remove(&browser.config.storage_key)?;

    let report = tab.store.rehydrate();
    assert_eq!(report.source, SnapshotSource::InMemory);
    assert_eq!(tab.quantity(&apple), 2);
    Ok(())
}

// ============================================================================
// Overlay lifetime across reloads
// ============================================================================

#[test]
fn reload_keeps_overlay() -> Result<(), Box<dyn std::error::Error>> {
    let browser = TestBrowser::new()?;
    let mut tab = browser.open_tab()?;
    let apple = Product::apple();
    tab.add(&apple, 3)?;
    tab.buy_now(&apple, 1)?;

    let mut tab = tab.reload()?;
    let line = tab.line(&apple).unwrap();
    assert_eq!(line.quantity, 1);
    assert!(line.is_overlay_active);

    tab.store.rollback_overlay()?;
    assert_eq!(tab.quantity(&apple), 3);
    Ok(())
}

#[test]
fn reload_keeps_overlay_only_line() -> Result<(), Box<dyn std::error::Error>> {
    let browser = TestBrowser::new()?;
    let mut tab = browser.open_tab()?;
    let banana = Product::banana();
    tab.buy_now(&banana, 2)?;

    let tab = tab.reload()?;
    let line = tab.line(&banana).unwrap();
    assert_eq!(line.quantity, 2);
    assert!(line.is_overlay_active);
    Ok(())
}

#[test]
fn new_session_recovers_abandoned_overlay() -> Result<(), Box<dyn std::error::Error>> {
    let browser = TestBrowser::new()?;
    let mut tab = browser.open_tab()?;
    let apple = Product::apple();
    let banana = Product::banana();
    tab.add(&apple, 3)?;
    tab.buy_now(&apple, 1)?;
    tab.buy_now(&banana, 2)?;

    let mut tab = tab.reopen()?;
    assert_eq!(tab.quantity(&apple), 3);
    assert!(tab.line(&banana).is_none());
    assert!(!tab.store.has_active_overlay());

    // The next write persists the recovered state.
    tab.add(&Product::carrot(), 1)?;
    let tab = tab.reopen()?;
    assert_eq!(tab.quantity(&apple), 3);
    assert!(tab.store.snapshot().original_quantities.is_empty());
    assert!(tab.store.snapshot().lines.iter().all(|l| !l.is_overlay_active));
    Ok(())
}

#[test]
fn rehydration_is_idempotent() -> Result<(), Box<dyn std::error::Error>> {
    let browser = TestBrowser::new()?;
    let mut tab = browser.open_tab()?;
    tab.add(&Product::apple(), 3)?;
    tab.add(&Product::carrot(), 2)?;
    tab.buy_now(&Product::apple(), 1)?;
    tab.buy_now(&Product::grape(), 4)?;

    tab.store.rehydrate();
    let first = tab.store.effective_lines();
    tab.store.rehydrate();
    let second = tab.store.effective_lines();
    assert_eq!(first, second);
    assert_eq!(first.len(), 3);
    Ok(())
}

// ============================================================================
// Staleness and orphans
// ============================================================================

#[test]
fn stale_overlay_without_durable_line_disappears() -> Result<(), Box<dyn std::error::Error>> {
    let browser = TestBrowser::new()?;
    let mut tab = browser.open_tab()?;
    let grape = Product::grape();
    let entry = OverlayEntry {
        quantity: 2,
        created_at: browser.clock.now_ms(),
        metadata: Some(grape.metadata.clone()),
        max_quantity: None,
    };
    tab.session.set(&overlay_key(&browser, &grape), &entry.to_json()?)?;

    // Fresh, the entry is synthesized into a line.
    tab.store.rehydrate();
    assert_eq!(tab.quantity(&grape), 2);

    browser.clock.advance(browser.config.overlay_ttl + Duration::from_secs(1));
    let report = tab.store.rehydrate();
    assert_eq!(report.stale_purged, 1);
    assert!(tab.line(&grape).is_none());
    assert!(tab.session.is_empty());
    Ok(())
}

#[test]
fn stale_overlay_on_existing_line_restores_original() -> Result<(), Box<dyn std::error::Error>> {
    let browser = TestBrowser::new()?;
    let mut tab = browser.open_tab()?;
    let apple = Product::apple();
    tab.add(&apple, 3)?;
    tab.buy_now(&apple, 1)?;

    browser.clock.advance(browser.config.overlay_ttl + Duration::from_secs(1));
    let tab = tab.reload()?;

    let line = tab.line(&apple).unwrap();
    assert_eq!(line.quantity, 3);
    assert!(!line.is_overlay_active);
    Ok(())
}

#[test]
fn overlay_within_ttl_survives() -> Result<(), Box<dyn std::error::Error>> {
    let browser = TestBrowser::new()?;
    let mut tab = browser.open_tab()?;
    let apple = Product::apple();
    tab.buy_now(&apple, 2)?;

    browser.clock.advance(browser.config.overlay_ttl - Duration::from_secs(1));
    let report = tab.store.rehydrate();
    assert_eq!(report.stale_purged, 0);
    assert_eq!(tab.quantity(&apple), 2);
    Ok(())
}

#[test]
fn orphan_entry_without_metadata_is_purged() -> Result<(), Box<dyn std::error::Error>> {
    let browser = TestBrowser::new()?;
    let mut tab = browser.open_tab()?;
    let honey = Product::honey();
    let entry = OverlayEntry {
        quantity: 1,
        created_at: browser.clock.now_ms(),
        metadata: None,
        max_quantity: None,
    };
    tab.session.set(&overlay_key(&browser, &honey), &entry.to_json()?)?;

    let report = tab.store.rehydrate();
    assert_eq!(report.orphans_purged, 1);
    assert!(tab.line(&honey).is_none());
    assert!(tab.session.is_empty());
    Ok(())
}

#[test]
fn malformed_overlay_entry_is_dropped() -> Result<(), Box<dyn std::error::Error>> {
    let browser = TestBrowser::new()?;
    let mut tab = browser.open_tab()?;
    let apple = Product::apple();
    tab.add(&apple, 3)?;
    tab.session.set(&overlay_key(&browser, &apple), "{\"quantity\":\"lots\"}")?;

    assert_eq!(tab.quantity(&apple), 3);
    tab.store.rehydrate();
    assert!(tab.session.is_empty());
    assert_eq!(tab.quantity(&apple), 3);
    Ok(())
}

// ============================================================================
// Damaged durable storage
// ============================================================================

#[test]
fn malformed_durable_snapshot_reads_as_empty() -> Result<(), Box<dyn std::error::Error>> {
    let browser = TestBrowser::new()?;
    let mut writer = SqliteStorage::open(&browser.durable_path())?;
    writer.set(&browser.config.storage_key, "{\"lines\": [oops")?;

    let mut tab = browser.open_tab()?;
    assert_eq!(tab.store.distinct_count(), 0);
    let report = tab.store.rehydrate();
    assert!(report.durable_unreadable);
    assert_eq!(report.source, SnapshotSource::Empty);

    // The cart stays usable and the next write repairs storage.
    tab.add(&Product::apple(), 1)?;
    let tab = tab.reopen()?;
    assert_eq!(tab.quantity(&Product::apple()), 1);
    Ok(())
}

#[test]
fn torn_durable_write_reads_as_empty() -> Result<(), Box<dyn std::error::Error>> {
    let browser = TestBrowser::new()?;
    let mut tab = browser.open_tab()?;
    tab.add(&Product::apple(), 2)?;

    let other = SqliteStorage::open(&browser.durable_path())?;
    other.conn().execute(
        "UPDATE kv_entries SET value = '{\"lines\":[]}' WHERE key = ?1",
        [browser.config.storage_key.as_str()],
    )?;

    let tab = tab.reopen()?;
    assert_eq!(tab.store.distinct_count(), 0);
    Ok(())
}

#[test]
fn snapshot_written_by_older_build_still_loads() -> Result<(), Box<dyn std::error::Error>> {
    let browser = TestBrowser::new()?;
    let mut writer = SqliteStorage::open(&browser.durable_path())?;
    writer.set(
        &browser.config.storage_key,
        r#"{"lines":[{"productId":"apple","quantity":2},{"productId":"apple","quantity":4},{"productId":"pear","quantity":0}]}"#,
    )?;

    let tab = browser.open_tab()?;
    assert_eq!(tab.store.distinct_count(), 1);
    assert_eq!(tab.quantity(&Product::apple()), 4);
    Ok(())
}
