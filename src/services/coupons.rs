use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::{
    entities::{coupon, order, OrderStatus},
    errors::ServiceError,
    models::{cart_subtotal, from_minor, CartItem},
};

/// Public shape of a coupon returned alongside a validation result.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CouponView {
    pub code: String,
    pub description: String,
    #[serde(with = "rust_decimal::serde::float_option")]
    pub discount_amount: Option<Decimal>,
    pub discount_percent: Option<i32>,
    #[serde(with = "rust_decimal::serde::float_option")]
    pub min_cart_total: Option<Decimal>,
    #[serde(with = "rust_decimal::serde::float_option")]
    pub max_discount: Option<Decimal>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<&coupon::Model> for CouponView {
    fn from(model: &coupon::Model) -> Self {
        Self {
            code: model.code.clone(),
            description: model.description.clone(),
            discount_amount: model.discount_amount_minor.map(from_minor),
            discount_percent: model.discount_percent,
            min_cart_total: model.min_cart_total_minor.map(from_minor),
            max_discount: model.max_discount_minor.map(from_minor),
            expires_at: model.expires_at,
        }
    }
}

/// Result of checking a code against a cart. Rejections are values, not errors.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CouponValidation {
    pub valid: bool,
    pub coupon: Option<CouponView>,
    #[serde(with = "rust_decimal::serde::float")]
    pub discount_amount: Decimal,
    pub message: String,
}

impl CouponValidation {
    fn rejected(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            coupon: None,
            discount_amount: Decimal::ZERO,
            message: message.into(),
        }
    }
}

pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Applies the coupon rules to a cart total. Pure; `already_used` is looked
/// up by the caller.
pub fn evaluate(
    coupon: &coupon::Model,
    cart_total: Decimal,
    now: DateTime<Utc>,
    already_used: bool,
) -> CouponValidation {
    if !coupon.active {
        return CouponValidation::rejected("This coupon is no longer active");
    }
    if coupon.valid_from.map_or(false, |from| now < from) {
        return CouponValidation::rejected("This coupon is not valid yet");
    }
    if coupon.expires_at.map_or(false, |exp| now >= exp) {
        return CouponValidation::rejected("This coupon has expired");
    }
    if let Some(min) = coupon.min_cart_total_minor.map(from_minor) {
        if cart_total < min {
            return CouponValidation::rejected(format!(
                "Add items worth {} more to use this coupon (minimum order {})",
                (min - cart_total).normalize(),
                min.normalize()
            ));
        }
    }
    if coupon.once_per_user && already_used {
        return CouponValidation::rejected("You have already used this coupon");
    }

    let raw = match (coupon.discount_percent, coupon.discount_amount_minor) {
        (Some(percent), _) => (cart_total * Decimal::from(percent) / Decimal::ONE_HUNDRED)
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero),
        (None, Some(amount)) => from_minor(amount),
        (None, None) => Decimal::ZERO,
    };
    let capped = coupon
        .max_discount_minor
        .map(from_minor)
        .map_or(raw, |cap| raw.min(cap));
    let discount = capped.min(cart_total).max(Decimal::ZERO);

    if discount <= Decimal::ZERO {
        return CouponValidation::rejected("This coupon does not apply to your cart");
    }

    CouponValidation {
        valid: true,
        coupon: Some(CouponView::from(coupon)),
        discount_amount: discount,
        message: format!("Coupon {} applied", coupon.code),
    }
}

#[derive(Clone)]
pub struct CouponService {
    db: DatabaseConnection,
}

impl CouponService {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Validates `code` against the given cart lines for `owner_id`.
    ///
    /// Only storage failures are returned as errors.
    #[instrument(skip(self, items), fields(item_count = items.len()))]
    pub async fn validate(
        &self,
        code: &str,
        items: &[CartItem],
        owner_id: &str,
    ) -> Result<CouponValidation, ServiceError> {
        let code = normalize_code(code);
        if code.is_empty() {
            return Ok(CouponValidation::rejected("Enter a coupon code"));
        }
        if items.is_empty() {
            return Ok(CouponValidation::rejected("Your cart is empty"));
        }

        let in_range = items
            .iter()
            .all(|item| item.price_in_range() && item.quantity_in_range());
        let Some(cart_total) = cart_subtotal(items).filter(|_| in_range) else {
            return Ok(CouponValidation::rejected("Cart total is out of range"));
        };

        let Some(model) = coupon::Entity::find_by_id(code.clone()).one(&self.db).await? else {
            debug!(%code, "unknown coupon");
            counter!("storefront.coupons.rejected", 1);
            return Ok(CouponValidation::rejected("Invalid coupon code"));
        };

        let already_used = if model.once_per_user {
            self.has_used(&code, owner_id).await?
        } else {
            false
        };

        let result = evaluate(&model, cart_total, Utc::now(), already_used);
        if result.valid {
            counter!("storefront.coupons.accepted", 1);
        } else {
            counter!("storefront.coupons.rejected", 1);
        }
        Ok(result)
    }

    /// Whether the identity has a non-cancelled order carrying this code.
    async fn has_used(&self, code: &str, owner_id: &str) -> Result<bool, ServiceError> {
        let count = order::Entity::find()
            .filter(order::Column::OwnerId.eq(owner_id))
            .filter(order::Column::CouponCode.eq(code))
            .filter(order::Column::Status.ne(OrderStatus::Cancelled))
            .count(&self.db)
            .await?;
        Ok(count > 0)
    }
}
