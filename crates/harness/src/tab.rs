use std::sync::Arc;

use farmstand_core::CartLine;
use farmstand_engine::{AddMode, CartConfig, CartStore, EngineError};
use farmstand_storage::{MemoryStorage, SqliteStorage, StorageError};

use crate::fixtures::{ManualClock, Product};

pub type TabStore = CartStore<SqliteStorage, MemoryStorage>;

/// One browsing context: its own connection to the shared durable file and
/// its own session storage.
pub struct TestTab {
    pub store: TabStore,
    pub session: MemoryStorage,
    durable_path: String,
    clock: ManualClock,
}

impl TestTab {
    pub fn open(
        durable_path: &str,
        session: MemoryStorage,
        clock: ManualClock,
        config: CartConfig,
    ) -> Result<Self, StorageError> {
        let durable = SqliteStorage::open(durable_path)?;
        let store = CartStore::with_clock(durable, session.clone(), config, Arc::new(clock.clone()));
        Ok(Self {
            store,
            session,
            durable_path: durable_path.to_string(),
            clock,
        })
    }

    /// Reload the page: fresh connection and fresh store, same session storage.
    pub fn reload(self) -> Result<Self, StorageError> {
        let config = self.store.config().clone();
        let (_durable, session) = self.store.close();
        Self::open(&self.durable_path, session, self.clock, config)
    }

    /// Close the tab and open a new one: session storage does not survive.
    pub fn reopen(self) -> Result<Self, StorageError> {
        let config = self.store.config().clone();
        drop(self.store);
        Self::open(&self.durable_path, MemoryStorage::new(), self.clock, config)
    }

    pub fn add(&mut self, product: &Product, quantity: i64) -> Result<(), EngineError> {
        self.store
            .add_item(&product.id, quantity, product.metadata.clone(), AddMode::Accumulate)
    }

    pub fn buy_now(&mut self, product: &Product, quantity: i64) -> Result<(), EngineError> {
        self.store.buy_now(&product.id, quantity, product.metadata.clone())
    }

    pub fn line(&self, product: &Product) -> Option<CartLine> {
        self.store.line(&product.id)
    }

    /// Effective quantity of `product`, 0 when absent.
    pub fn quantity(&self, product: &Product) -> u32 {
        self.line(product).map_or(0, |l| l.quantity)
    }
}
