use farmstand_engine::CartConfig;
use farmstand_storage::{MemoryStorage, StorageError};
use tempfile::TempDir;

use crate::fixtures::ManualClock;
use crate::tab::TestTab;

/// A browser profile: one durable cart file shared by every tab, one clock.
pub struct TestBrowser {
    dir: TempDir,
    pub clock: ManualClock,
    pub config: CartConfig,
}

impl TestBrowser {
    pub fn new() -> Result<Self, StorageError> {
        Self::with_config(CartConfig::default())
    }

    pub fn with_config(config: CartConfig) -> Result<Self, StorageError> {
        crate::fixtures::init_tracing();
        let dir = tempfile::tempdir()
            .map_err(|e| StorageError::Unavailable(format!("tempdir: {e}")))?;
        Ok(Self {
            dir,
            clock: ManualClock::default(),
            config,
        })
    }

    pub fn durable_path(&self) -> String {
        self.dir.path().join("cart.db").to_string_lossy().into_owned()
    }

    pub fn open_tab(&self) -> Result<TestTab, StorageError> {
        TestTab::open(
            &self.durable_path(),
            MemoryStorage::new(),
            self.clock.clone(),
            self.config.clone(),
        )
    }
}
