use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

use super::money::parse_price;

/// Largest unit price accepted at checkout.
pub const MAX_UNIT_PRICE: i64 = 10_000_000;
/// Largest quantity accepted on a single line.
pub const MAX_LINE_QUANTITY: u32 = 10_000;

/// A line in a shopper's cart. `id` is the composite item+variant key, e.g.
/// `p1_Size:M|Color:Black`, so two variants of one product are distinct lines.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartItem {
    #[serde(default)]
    pub id: String,
    pub product_id: String,
    pub name: String,
    #[serde(
        serialize_with = "rust_decimal::serde::float::serialize",
        deserialize_with = "deserialize_price",
        alias = "price"
    )]
    pub unit_price: Decimal,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    #[serde(default = "default_in_stock")]
    pub in_stock: bool,
    #[serde(default)]
    pub variants: BTreeMap<String, String>,
}

fn default_quantity() -> u32 {
    1
}

fn default_in_stock() -> bool {
    true
}

fn deserialize_price<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    let raw = match &value {
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s.clone(),
        other => {
            return Err(serde::de::Error::custom(format!(
                "price must be a number or string, got {}",
                other
            )))
        }
    };
    parse_price(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("unparseable price '{}'", raw)))
}

/// Builds `productId_attr1:val1|attr2:val2` from the given attributes in order.
pub fn composite_id<'a, I>(product_id: &str, attributes: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let suffix: Vec<String> = attributes
        .into_iter()
        .map(|(k, v)| format!("{}:{}", k, v))
        .collect();
    if suffix.is_empty() {
        product_id.to_string()
    } else {
        format!("{}_{}", product_id, suffix.join("|"))
    }
}

impl CartItem {
    /// Fills in a missing `id` from the product id and variant attributes.
    pub fn normalized(mut self) -> Self {
        if self.id.trim().is_empty() {
            self.id = composite_id(
                &self.product_id,
                self.variants.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            );
        }
        self
    }

    /// Looks an attribute up case-insensitively in `variants`, then in the
    /// attribute suffix of the composite id.
    pub fn attribute(&self, name: &str) -> Option<String> {
        if let Some(v) = self
            .variants
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
        {
            return Some(v);
        }
        let suffix = self
            .id
            .strip_prefix(self.product_id.as_str())?
            .strip_prefix('_')?;
        suffix.split('|').find_map(|pair| {
            let (k, v) = pair.split_once(':')?;
            k.trim()
                .eq_ignore_ascii_case(name)
                .then(|| v.trim().to_string())
        })
    }

    pub fn size(&self) -> Option<String> {
        self.attribute("size").filter(|s| !s.is_empty())
    }

    pub fn color(&self) -> Option<String> {
        self.attribute("color").filter(|s| !s.is_empty())
    }

    /// Lines with both a size and a color are subject to stock checks.
    pub fn is_variant_bearing(&self) -> bool {
        self.size().is_some() && self.color().is_some()
    }

    /// `None` when the product does not fit in a `Decimal`.
    pub fn line_total(&self) -> Option<Decimal> {
        self.unit_price.checked_mul(Decimal::from(self.quantity))
    }

    pub fn price_in_range(&self) -> bool {
        self.unit_price >= Decimal::ZERO && self.unit_price <= Decimal::from(MAX_UNIT_PRICE)
    }

    pub fn quantity_in_range(&self) -> bool {
        self.quantity > 0 && self.quantity <= MAX_LINE_QUANTITY
    }
}

/// Sums line totals; `None` on overflow.
pub fn cart_subtotal(items: &[CartItem]) -> Option<Decimal> {
    items.iter().try_fold(Decimal::ZERO, |acc, item| {
        acc.checked_add(item.line_total()?)
    })
}

/// Adds `quantity` of a line, merging with an existing line of the same id.
/// A non-positive quantity leaves the cart untouched.
pub fn add_line(items: &mut Vec<CartItem>, item: CartItem, quantity: i64) {
    if quantity <= 0 {
        return;
    }
    let item = item.normalized();
    let quantity = u32::try_from(quantity).unwrap_or(u32::MAX);
    match items.iter_mut().find(|existing| existing.id == item.id) {
        Some(existing) => existing.quantity = existing.quantity.saturating_add(quantity),
        None => items.push(CartItem { quantity, ..item }),
    }
}

/// Sets a line's quantity; zero or negative removes it. Returns whether a
/// line with that id existed.
pub fn set_line_quantity(items: &mut Vec<CartItem>, id: &str, quantity: i64) -> bool {
    if quantity <= 0 {
        return remove_line(items, id);
    }
    match items.iter_mut().find(|existing| existing.id == id) {
        Some(existing) => {
            existing.quantity = u32::try_from(quantity).unwrap_or(u32::MAX);
            true
        }
        None => false,
    }
}

pub fn remove_line(items: &mut Vec<CartItem>, id: &str) -> bool {
    let before = items.len();
    items.retain(|existing| existing.id != id);
    items.len() != before
}
