use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use farmstand_core::{Clock, LineMetadata, OrderId, ProductId};
use farmstand_engine::{CheckoutItem, OrderFailure, OrderSubmitter};
use rust_decimal::Decimal;

/// Route engine logs to the test writer. `RUST_LOG` picks the level.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Clone)]
pub struct ManualClock {
    now_ms: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let by = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.now_ms.fetch_add(by, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(1_700_000_000_000)
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct Product {
    pub id: ProductId,
    pub metadata: LineMetadata,
}

impl Product {
    pub fn new(id: &str, name: &str, cents: i64, farm: &str) -> Self {
        Self {
            id: ProductId::new(id),
            metadata: LineMetadata::new(name, Decimal::new(cents, 2), format!("seller-{farm}"))
                .with_farm(farm)
                .with_image(format!("/images/{id}.jpg")),
        }
    }

    pub fn apple() -> Self {
        Self::new("apple", "Honeycrisp Apple", 125, "hillside-orchard")
    }

    pub fn banana() -> Self {
        Self::new("banana", "Lady Finger Banana", 60, "river-grove")
    }

    pub fn carrot() -> Self {
        Self::new("carrot", "Rainbow Carrot Bunch", 350, "green-acres")
    }

    pub fn grape() -> Self {
        Self::new("grape", "Concord Grapes", 499, "hillside-orchard")
    }

    pub fn honey() -> Self {
        Self::new("honey", "Wildflower Honey", 1200, "bee-meadow")
    }
}

/// Order backend double: answers from a script, then succeeds.
#[derive(Default)]
pub struct ScriptedSubmitter {
    responses: VecDeque<Result<OrderId, OrderFailure>>,
    pub submitted: Vec<Vec<CheckoutItem>>,
}

impl ScriptedSubmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then_fail(mut self, failure: OrderFailure) -> Self {
        self.responses.push_back(Err(failure));
        self
    }
}

impl OrderSubmitter for ScriptedSubmitter {
    fn submit(&mut self, items: &[CheckoutItem]) -> Result<OrderId, OrderFailure> {
        self.submitted.push(items.to_vec());
        self.responses.pop_front().unwrap_or_else(|| Ok(OrderId::new()))
    }
}
