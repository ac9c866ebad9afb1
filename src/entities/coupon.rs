use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Coupon definition. Exactly one of `discount_amount_minor` or
/// `discount_percent` is expected to be set.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "coupons")]
pub struct Model {
    /// Stored upper-cased
    #[sea_orm(primary_key, auto_increment = false)]
    pub code: String,
    pub description: String,
    #[sea_orm(nullable)]
    pub discount_amount_minor: Option<i64>,
    /// Whole percent, 1..=100
    #[sea_orm(nullable)]
    pub discount_percent: Option<i32>,
    #[sea_orm(nullable)]
    pub min_cart_total_minor: Option<i64>,
    #[sea_orm(nullable)]
    pub max_discount_minor: Option<i64>,
    #[sea_orm(nullable)]
    pub valid_from: Option<DateTime<Utc>>,
    #[sea_orm(nullable)]
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub once_per_user: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
