use farmstand_core::CoreError;
use farmstand_storage::StorageError;
use thiserror::Error;

use crate::checkout::OrderFailure;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// The one failure a shopper sees: there is nothing to check out.
    #[error("nothing to check out")]
    EmptyCheckout,

    #[error("checkout {0} already completed")]
    CheckoutClosed(String),

    #[error("order rejected: {0}")]
    OrderRejected(#[from] OrderFailure),

    #[error("checkout item {product_id} not visible after {waited_ms}ms")]
    WaitTimedOut { product_id: String, waited_ms: u64 },

    #[error("wait for checkout item cancelled")]
    WaitCancelled,
}
