use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::CoreError;
use crate::ids::{ProductId, SellerId};

/// Clamp a caller-supplied quantity into the valid line range (>= 1).
pub fn clamp_quantity(requested: i64) -> u32 {
    requested.clamp(1, i64::from(u32::MAX)) as u32
}

/// Display data for a cart line. Opaque to the cart engine apart from
/// `unit_price` (totals) and `seller_id` (checkout submission).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LineMetadata {
    pub name: String,
    pub unit_price: Decimal,
    pub image: Option<String>,
    pub farm: Option<String>,
    pub seller_id: SellerId,
}

impl LineMetadata {
    pub fn new(name: impl Into<String>, unit_price: Decimal, seller_id: impl Into<SellerId>) -> Self {
        Self {
            name: name.into(),
            unit_price,
            image: None,
            farm: None,
            seller_id: seller_id.into(),
        }
    }

    pub fn with_farm(mut self, farm: impl Into<String>) -> Self {
        self.farm = Some(farm.into());
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartLine {
    pub product_id: ProductId,
    pub quantity: u32,
    #[serde(default)]
    pub metadata: LineMetadata,
    /// Derived on every read from the overlay store; the persisted value is a hint only.
    #[serde(default)]
    pub is_overlay_active: bool,
    #[serde(default)]
    pub max_quantity: Option<u32>,
}

impl CartLine {
    pub fn new(product_id: ProductId, quantity: u32, metadata: LineMetadata) -> Self {
        Self {
            product_id,
            quantity: quantity.max(1),
            metadata,
            is_overlay_active: false,
            max_quantity: None,
        }
    }

    pub fn with_max_quantity(mut self, max_quantity: Option<u32>) -> Self {
        self.max_quantity = max_quantity.filter(|m| *m > 0);
        self
    }

    /// Apply the line's own cap, falling back to `global_cap`. A cap of 0 means none.
    pub fn cap(&self, requested: u32, global_cap: Option<u32>) -> u32 {
        let cap = self
            .max_quantity
            .filter(|m| *m > 0)
            .or(global_cap.filter(|m| *m > 0));
        match cap {
            Some(cap) => requested.min(cap).max(1),
            None => requested.max(1),
        }
    }

    pub fn line_total(&self) -> Decimal {
        self.metadata.unit_price * Decimal::from(self.quantity)
    }
}

/// A "buy now" session entry. The product id is the storage key, not part of the value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayEntry {
    pub quantity: u32,
    pub created_at: u64,
    /// Lets rehydration synthesize a displayable line when the durable cart has none.
    #[serde(default)]
    pub metadata: Option<LineMetadata>,
    #[serde(default)]
    pub max_quantity: Option<u32>,
}

impl OverlayEntry {
    pub fn is_stale(&self, now_ms: u64, max_age_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_at) > max_age_ms
    }

    pub fn to_json(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, CoreError> {
        let entry: Self = serde_json::from_str(raw)?;
        if entry.quantity == 0 {
            return Err(CoreError::InvalidData("overlay quantity must be positive".into()));
        }
        Ok(entry)
    }
}

/// The durable unit: every line plus the pre-overlay quantities, written wholesale.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CartSnapshot {
    pub lines: Vec<CartLine>,
    pub original_quantities: BTreeMap<ProductId, u32>,
}

impl CartSnapshot {
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.original_quantities.is_empty()
    }

    pub fn line(&self, product_id: &ProductId) -> Option<&CartLine> {
        self.lines.iter().find(|l| &l.product_id == product_id)
    }

    pub fn line_mut(&mut self, product_id: &ProductId) -> Option<&mut CartLine> {
        self.lines.iter_mut().find(|l| &l.product_id == product_id)
    }

    pub fn remove_line(&mut self, product_id: &ProductId) -> Option<CartLine> {
        let index = self.lines.iter().position(|l| &l.product_id == product_id)?;
        Some(self.lines.remove(index))
    }

    pub fn to_json(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a persisted snapshot and repair what a well-formed writer would never
    /// produce: zero-quantity lines, duplicate product ids (last wins), and
    /// snapshots for products that have no line.
    pub fn from_json(raw: &str) -> Result<Self, CoreError> {
        let parsed: Self = serde_json::from_str(raw)?;
        let mut snapshot = Self::default();
        for line in parsed.lines {
            if line.quantity == 0 {
                continue;
            }
            snapshot.remove_line(&line.product_id);
            snapshot.lines.push(line);
        }
        snapshot.original_quantities = parsed
            .original_quantities
            .into_iter()
            .filter(|(id, qty)| *qty > 0 && snapshot.line(id).is_some())
            .collect();
        Ok(snapshot)
    }
}
