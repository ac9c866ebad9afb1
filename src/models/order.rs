use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use super::money::from_minor;
use crate::entities::{order, order_line, OrderStatus, PaymentMethod, PaymentStatus};

fn non_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        let mut err = ValidationError::new("required");
        err.message = Some("must not be empty".into());
        return Err(err);
    }
    Ok(())
}

/// Delivery address and contact details captured at checkout.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ShippingInfo {
    #[validate(custom(function = "non_blank", message = "fullName is required"))]
    pub full_name: String,
    #[validate(
        custom(function = "non_blank", message = "email is required"),
        email(message = "email must be a valid address")
    )]
    pub email: String,
    #[validate(custom(function = "non_blank", message = "phone is required"))]
    pub phone: String,
    #[validate(custom(function = "non_blank", message = "address is required"))]
    pub address: String,
    #[validate(custom(function = "non_blank", message = "city is required"))]
    pub city: String,
    #[validate(custom(function = "non_blank", message = "state is required"))]
    pub state: String,
    #[validate(custom(function = "non_blank", message = "postalCode is required"))]
    pub postal_code: String,
}

/// Computed money breakdown for an order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OrderTotals {
    pub subtotal: Decimal,
    pub coupon_discount: Decimal,
    pub shipping_cost: Decimal,
    pub total: Decimal,
}

impl OrderTotals {
    /// `total = subtotal - discount + shipping`, floored at zero with the
    /// discount clamped so the identity still holds.
    pub fn compute(subtotal: Decimal, coupon_discount: Decimal, shipping_cost: Decimal) -> Self {
        let coupon_discount = coupon_discount.max(Decimal::ZERO).min(subtotal + shipping_cost);
        Self {
            subtotal,
            coupon_discount,
            shipping_cost,
            total: subtotal - coupon_discount + shipping_cost,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLineView {
    pub product_id: String,
    pub variant_key: String,
    pub name: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    pub quantity: i32,
    pub image: Option<String>,
    pub category: Option<String>,
    pub size: Option<String>,
    pub color: Option<String>,
}

impl From<order_line::Model> for OrderLineView {
    fn from(line: order_line::Model) -> Self {
        Self {
            product_id: line.product_id,
            variant_key: line.variant_key,
            name: line.name,
            price: from_minor(line.price_minor),
            quantity: line.quantity,
            image: line.image,
            category: line.category,
            size: line.size,
            color: line.color,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderView {
    pub order_id: Uuid,
    pub order_number: String,
    pub owner_id: String,
    pub items: Vec<OrderLineView>,
    pub shipping_info: serde_json::Value,
    pub payment_method: PaymentMethod,
    #[serde(with = "rust_decimal::serde::float")]
    pub subtotal: Decimal,
    pub coupon_code: Option<String>,
    #[serde(with = "rust_decimal::serde::float")]
    pub coupon_discount: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub shipping_cost: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub total: Decimal,
    pub currency: String,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub merchant_transaction_id: Option<String>,
    pub tracking_number: Option<String>,
    pub notes: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderView {
    pub fn from_models(order: order::Model, mut lines: Vec<order_line::Model>) -> Self {
        lines.sort_by_key(|l| l.position);
        Self {
            order_id: order.id,
            order_number: order.order_number,
            owner_id: order.owner_id,
            items: lines.into_iter().map(OrderLineView::from).collect(),
            shipping_info: order.shipping_info,
            payment_method: order.payment_method,
            subtotal: from_minor(order.subtotal_minor),
            coupon_code: order.coupon_code,
            coupon_discount: from_minor(order.coupon_discount_minor),
            shipping_cost: from_minor(order.shipping_cost_minor),
            total: from_minor(order.total_minor),
            currency: order.currency,
            status: order.status,
            payment_status: order.payment_status,
            merchant_transaction_id: order.merchant_transaction_id,
            tracking_number: order.tracking_number,
            notes: order.notes,
            cancelled_at: order.cancelled_at,
            cancellation_reason: order.cancellation_reason,
            created_at: order.created_at,
            updated_at: order.updated_at,
        }
    }
}
