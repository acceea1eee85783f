pub mod clock;
pub mod error;
pub mod ids;
pub mod model;

pub use clock::{Clock, SystemClock};
pub use error::CoreError;
pub use ids::*;
pub use model::{CartLine, CartSnapshot, LineMetadata, OverlayEntry, clamp_quantity};
