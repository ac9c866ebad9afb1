use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::cart_item::CartItem;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    pub quantity: u32,
    #[serde(default = "default_available")]
    pub available: bool,
}

fn default_available() -> bool {
    true
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductTypeStock {
    #[serde(default)]
    pub stock: BTreeMap<String, StockLevel>,
}

/// Whole stock document as published by the catalog:
/// `{types: {productType: {stock: {"size-color": {quantity, available}}}}}`.
/// Older documents carry a single flat `stock` map keyed by `"size-color"`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockSnapshot {
    #[serde(default)]
    pub types: BTreeMap<String, ProductTypeStock>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stock: BTreeMap<String, StockLevel>,
}

/// Flattened stock row, one per product type and variant key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StockEntry {
    pub product_type: String,
    pub size_color_key: String,
    pub quantity: u32,
    pub available: bool,
}

pub fn variant_key(size: &str, color: &str) -> String {
    format!("{}-{}", size, color)
}

impl StockSnapshot {
    /// Type-scoped lookup first, then the legacy flat map.
    pub fn level(&self, product_type: Option<&str>, key: &str) -> Option<&StockLevel> {
        let scoped = product_type.and_then(|ty| {
            self.types
                .get(ty)
                .or_else(|| {
                    self.types
                        .iter()
                        .find(|(name, _)| name.eq_ignore_ascii_case(ty))
                        .map(|(_, v)| v)
                })
                .and_then(|t| t.stock.get(key))
        });
        scoped.or_else(|| self.stock.get(key))
    }

    pub fn entries(&self) -> Vec<StockEntry> {
        let typed = self.types.iter().flat_map(|(ty, t)| {
            t.stock.iter().map(move |(key, level)| StockEntry {
                product_type: ty.clone(),
                size_color_key: key.clone(),
                quantity: level.quantity,
                available: level.available,
            })
        });
        let legacy = self.stock.iter().map(|(key, level)| StockEntry {
            product_type: String::new(),
            size_color_key: key.clone(),
            quantity: level.quantity,
            available: level.available,
        });
        typed.chain(legacy).collect()
    }
}

/// Quantity currently purchasable for a cart line.
///
/// `None` means the line is not stock-tracked because it carries no
/// size/color pair. A variant the snapshot does not list, or a row flagged
/// unavailable, counts as 0.
pub fn available_quantity(snapshot: &StockSnapshot, item: &CartItem) -> Option<u32> {
    let size = item.size()?;
    let color = item.color()?;
    let key = variant_key(&size, &color);
    Some(
        snapshot
            .level(item.category.as_deref(), &key)
            .map_or(0, |level| if level.available { level.quantity } else { 0 }),
    )
}
