use chrono::{DateTime, Utc};
use metrics::counter;
use rand::Rng;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set, SqlErr, TransactionTrait,
};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use super::coupons::{normalize_code, CouponService};
use super::gateway::GatewayError;
use super::payment_methods::PaymentMethodAvailability;
use super::stock::StockReader;
use crate::{
    auth::AuthUser,
    config::ShippingConfig,
    entities::{
        order, order_line, payment_transaction, OrderStatus, PaymentMethod, PaymentStatus,
        TransactionStatus,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    models::{
        available_quantity, cart_subtotal, to_minor, variant_key, CartItem, OrderTotals,
        OrderView, ShippingInfo, MAX_LINE_QUANTITY, MAX_UNIT_PRICE,
    },
};

const ORDER_NUMBER_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const ORDER_NUMBER_ATTEMPTS: usize = 3;
const MAX_TRANSACTION_ID_LEN: usize = 64;

/// Everything checkout submits to create an order.
#[derive(Debug, Clone)]
pub struct CreateOrderInput {
    pub items: Vec<CartItem>,
    pub shipping_info: ShippingInfo,
    pub payment_method: PaymentMethod,
    pub coupon_code: Option<String>,
    /// Total the client displayed; must match the server computation when present
    pub client_total: Option<Decimal>,
    /// Gateway path only; generated when absent
    pub merchant_transaction_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOrderInput {
    pub status: Option<OrderStatus>,
    #[validate(length(min = 1, max = 100, message = "trackingNumber must be 1-100 characters"))]
    pub tracking_number: Option<String>,
    #[validate(length(max = 2000, message = "notes must be at most 2000 characters"))]
    pub notes: Option<String>,
}

/// `ORD-YYYYMMDD-XXXXXX`
pub fn generate_order_number(now: DateTime<Utc>) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..6)
        .map(|_| ORDER_NUMBER_ALPHABET[rng.gen_range(0..ORDER_NUMBER_ALPHABET.len())] as char)
        .collect();
    format!("ORD-{}-{}", now.format("%Y%m%d"), suffix)
}

pub fn generate_merchant_transaction_id(now: DateTime<Utc>) -> String {
    let nonce: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("MT{}{:06}", now.timestamp_millis(), nonce)
}

fn camel_case(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut upper = false;
    for c in field.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

fn valid_transaction_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_TRANSACTION_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Conditionally moves an order out of `from`. Returns whether this call made
/// the transition; `false` means another writer got there first.
pub(crate) async fn transition_order<C: ConnectionTrait>(
    db: &C,
    order_id: Uuid,
    from: OrderStatus,
    to: OrderStatus,
    payment_status: Option<PaymentStatus>,
    cancellation_reason: Option<&str>,
) -> Result<bool, DbErr> {
    let now = Utc::now();
    let mut update = order::Entity::update_many()
        .col_expr(order::Column::Status, Expr::value(to))
        .col_expr(order::Column::UpdatedAt, Expr::value(now));
    if let Some(ps) = payment_status {
        update = update.col_expr(order::Column::PaymentStatus, Expr::value(ps));
    }
    if let Some(reason) = cancellation_reason {
        update = update
            .col_expr(order::Column::CancelledAt, Expr::value(Some(now)))
            .col_expr(
                order::Column::CancellationReason,
                Expr::value(Some(reason.to_string())),
            );
    }
    let result = update
        .filter(order::Column::Id.eq(order_id))
        .filter(order::Column::Status.eq(from))
        .exec(db)
        .await?;
    Ok(result.rows_affected == 1)
}

pub(crate) async fn load_lines<C: ConnectionTrait>(
    db: &C,
    order_ids: &[Uuid],
) -> Result<HashMap<Uuid, Vec<order_line::Model>>, DbErr> {
    if order_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let lines = order_line::Entity::find()
        .filter(order_line::Column::OrderId.is_in(order_ids.iter().copied()))
        .order_by_asc(order_line::Column::Position)
        .all(db)
        .await?;
    let mut grouped: HashMap<Uuid, Vec<order_line::Model>> = HashMap::new();
    for line in lines {
        grouped.entry(line.order_id).or_default().push(line);
    }
    Ok(grouped)
}

/// Order creation, queries and status management.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    stock: Arc<dyn StockReader>,
    coupons: CouponService,
    payment_methods: Arc<dyn PaymentMethodAvailability>,
    shipping: ShippingConfig,
    currency: String,
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        stock: Arc<dyn StockReader>,
        coupons: CouponService,
        payment_methods: Arc<dyn PaymentMethodAvailability>,
        shipping: ShippingConfig,
        currency: String,
    ) -> Self {
        Self {
            db,
            event_sender,
            stock,
            coupons,
            payment_methods,
            shipping,
            currency,
        }
    }

    /// Validates the checkout and persists a new order.
    ///
    /// COD orders are created `confirmed` with payment `cod_pending`; gateway
    /// orders are created `pending` together with an `initiated` payment
    /// transaction. Nothing is written when any precondition fails, and the
    /// caller's cart is left as it is.
    #[instrument(skip(self, input), fields(owner_id = %owner_id, method = %input.payment_method))]
    pub async fn create_order(
        &self,
        owner_id: &str,
        input: CreateOrderInput,
    ) -> Result<OrderView, ServiceError> {
        self.validate_request(&input)?;

        if input.payment_method == PaymentMethod::Gateway
            && !self.payment_methods.is_gateway_configured()
        {
            return Err(GatewayError::NotConfigured.into());
        }
        if !self.payment_methods.is_method_enabled(input.payment_method) {
            return Err(ServiceError::PaymentMethodDisabled(format!(
                "{} payments are currently unavailable",
                input.payment_method
            )));
        }

        self.verify_stock(&input.items).await?;

        let subtotal = cart_subtotal(&input.items).ok_or_else(|| {
            ServiceError::ValidationError("cart total is out of range".to_string())
        })?;
        let coupon_code = input
            .coupon_code
            .as_deref()
            .map(normalize_code)
            .filter(|c| !c.is_empty());
        let discount = match &coupon_code {
            Some(code) => {
                let result = self.coupons.validate(code, &input.items, owner_id).await?;
                if !result.valid {
                    return Err(ServiceError::CouponRejected(result.message));
                }
                result.discount_amount
            }
            None => Decimal::ZERO,
        };
        let totals = OrderTotals::compute(subtotal, discount, self.shipping.shipping_cost(subtotal));

        if let Some(client_total) = input.client_total {
            if to_minor(client_total) != to_minor(totals.total) {
                return Err(ServiceError::Conflict(format!(
                    "Order total changed to {}; please review your cart",
                    totals.total.normalize()
                )));
            }
        }

        let merchant_transaction_id = match input.payment_method {
            PaymentMethod::Cod => None,
            PaymentMethod::Gateway => Some(self.claim_transaction_id(&input).await?),
        };

        let mut last_err = None;
        for _ in 0..ORDER_NUMBER_ATTEMPTS {
            match self
                .persist(owner_id, &input, &coupon_code, &totals, &merchant_transaction_id)
                .await
            {
                Ok(view) => {
                    counter!("storefront.orders.created", 1, "method" => input.payment_method.as_str());
                    info!(
                        order_id = %view.order_id,
                        order_number = %view.order_number,
                        total = %view.total,
                        "order created"
                    );
                    self.event_sender
                        .send_or_log(Event::OrderCreated {
                            order_id: view.order_id,
                            order_number: view.order_number.clone(),
                            payment_method: input.payment_method.to_string(),
                            total: view.total,
                        })
                        .await;
                    return Ok(view);
                }
                Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                    warn!(error = %e, "order number collision, retrying");
                    last_err = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last_err
            .map(ServiceError::from)
            .unwrap_or_else(|| ServiceError::InternalError("order number exhausted".into())))
    }

    fn validate_request(&self, input: &CreateOrderInput) -> Result<(), ServiceError> {
        let mut fields: BTreeMap<String, Vec<String>> = BTreeMap::new();
        if let Err(errors) = input.shipping_info.validate() {
            if let ServiceError::FieldValidation(shipping) = ServiceError::from(errors) {
                for (field, messages) in shipping {
                    fields.insert(format!("shippingInfo.{}", camel_case(&field)), messages);
                }
            }
        }
        if input.items.is_empty() {
            fields.insert("items".into(), vec!["cart is empty".into()]);
        }
        for (idx, item) in input.items.iter().enumerate() {
            if item.quantity == 0 {
                fields.insert(
                    format!("items[{}].quantity", idx),
                    vec!["quantity must be greater than 0".into()],
                );
            } else if !item.quantity_in_range() {
                fields.insert(
                    format!("items[{}].quantity", idx),
                    vec![format!("quantity must be at most {}", MAX_LINE_QUANTITY)],
                );
            }
            if item.unit_price < Decimal::ZERO {
                fields.insert(
                    format!("items[{}].price", idx),
                    vec!["price must not be negative".into()],
                );
            } else if !item.price_in_range() {
                fields.insert(
                    format!("items[{}].price", idx),
                    vec![format!("price must be at most {}", MAX_UNIT_PRICE)],
                );
            }
        }
        if fields.is_empty() {
            Ok(())
        } else {
            Err(ServiceError::FieldValidation(fields))
        }
    }

    /// Re-reads stock for every size/color line. Requests for the same
    /// variant across lines are summed.
    async fn verify_stock(&self, items: &[CartItem]) -> Result<(), ServiceError> {
        let tracked: Vec<&CartItem> = items.iter().filter(|i| i.is_variant_bearing()).collect();
        if tracked.is_empty() {
            return Ok(());
        }
        let snapshot = self.stock.fetch_snapshot().await.ok_or_else(|| {
            ServiceError::ExternalServiceError("stock data is unavailable".to_string())
        })?;

        let mut requested: HashMap<(Option<String>, String), u64> = HashMap::new();
        for item in &tracked {
            let key = variant_key(
                &item.size().unwrap_or_default(),
                &item.color().unwrap_or_default(),
            );
            *requested
                .entry((item.category.clone(), key))
                .or_default() += u64::from(item.quantity);
        }

        for item in tracked {
            let available = available_quantity(&snapshot, item).unwrap_or(0);
            let key = variant_key(
                &item.size().unwrap_or_default(),
                &item.color().unwrap_or_default(),
            );
            let wanted = requested
                .get(&(item.category.clone(), key.clone()))
                .copied()
                .unwrap_or(u64::from(item.quantity));
            if wanted > u64::from(available) {
                counter!("storefront.orders.rejected_stock", 1);
                let message = if available == 0 {
                    format!("{} ({}) is out of stock", item.name, key)
                } else {
                    format!(
                        "Only {} left of {} ({}); requested {}",
                        available, item.name, key, wanted
                    )
                };
                return Err(ServiceError::InsufficientStock(message));
            }
        }
        Ok(())
    }

    async fn claim_transaction_id(&self, input: &CreateOrderInput) -> Result<String, ServiceError> {
        let id = match input.merchant_transaction_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => {
                if !valid_transaction_id(id) {
                    return Err(ServiceError::ValidationError(
                        "merchantTransactionId must be 1-64 characters of letters, digits, '-' or '_'"
                            .to_string(),
                    ));
                }
                id.to_string()
            }
            _ => generate_merchant_transaction_id(Utc::now()),
        };
        let taken = payment_transaction::Entity::find_by_id(id.clone())
            .one(&*self.db)
            .await?
            .is_some();
        if taken {
            return Err(ServiceError::Conflict(format!(
                "merchantTransactionId {} is already in use",
                id
            )));
        }
        Ok(id)
    }

    async fn persist(
        &self,
        owner_id: &str,
        input: &CreateOrderInput,
        coupon_code: &Option<String>,
        totals: &OrderTotals,
        merchant_transaction_id: &Option<String>,
    ) -> Result<OrderView, DbErr> {
        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let (status, payment_status) = match input.payment_method {
            PaymentMethod::Cod => (OrderStatus::Confirmed, PaymentStatus::CodPending),
            PaymentMethod::Gateway => (OrderStatus::Pending, PaymentStatus::Pending),
        };
        let shipping_info = serde_json::to_value(&input.shipping_info)
            .map_err(|e| DbErr::Custom(format!("shipping info: {}", e)))?;

        let txn = self.db.begin().await?;

        let order = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(generate_order_number(now)),
            owner_id: Set(owner_id.to_string()),
            status: Set(status),
            payment_method: Set(input.payment_method),
            payment_status: Set(payment_status),
            subtotal_minor: Set(to_minor(totals.subtotal)),
            coupon_discount_minor: Set(to_minor(totals.coupon_discount)),
            shipping_cost_minor: Set(to_minor(totals.shipping_cost)),
            total_minor: Set(to_minor(totals.total)),
            coupon_code: Set(coupon_code.clone()),
            currency: Set(self.currency.clone()),
            shipping_info: Set(shipping_info),
            merchant_transaction_id: Set(merchant_transaction_id.clone()),
            tracking_number: Set(None),
            notes: Set(None),
            cancelled_at: Set(None),
            cancellation_reason: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        let mut lines = Vec::with_capacity(input.items.len());
        for (position, item) in input.items.iter().enumerate() {
            let line = order_line::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                position: Set(position as i32),
                product_id: Set(item.product_id.clone()),
                name: Set(item.name.clone()),
                price_minor: Set(to_minor(item.unit_price)),
                quantity: Set(i32::try_from(item.quantity).unwrap_or(i32::MAX)),
                image: Set(item.image.clone()),
                category: Set(item.category.clone()),
                size: Set(item.size()),
                color: Set(item.color()),
                variant_key: Set(item.id.clone()),
            }
            .insert(&txn)
            .await?;
            lines.push(line);
        }

        if let Some(mtid) = merchant_transaction_id {
            payment_transaction::ActiveModel {
                merchant_transaction_id: Set(mtid.clone()),
                order_id: Set(order_id),
                owner_id: Set(owner_id.to_string()),
                amount_minor: Set(to_minor(totals.total)),
                status: Set(TransactionStatus::Initiated),
                gateway_reference: Set(None),
                reported_amount_minor: Set(None),
                refunded_amount_minor: Set(0),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(&txn)
            .await?;
        }

        txn.commit().await?;
        Ok(OrderView::from_models(order, lines))
    }

    /// Lists the caller's orders, newest first.
    #[instrument(skip(self))]
    pub async fn list_orders(
        &self,
        owner_id: &str,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<OrderView>, u64), ServiceError> {
        let per_page = per_page.clamp(1, 100);
        let paginator = order::Entity::find()
            .filter(order::Column::OwnerId.eq(owner_id))
            .order_by_desc(order::Column::CreatedAt)
            .paginate(&*self.db, per_page);
        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page.saturating_sub(1)).await?;

        let ids: Vec<Uuid> = orders.iter().map(|o| o.id).collect();
        let mut lines = load_lines(&*self.db, &ids).await?;
        let views = orders
            .into_iter()
            .map(|o| {
                let order_lines = lines.remove(&o.id).unwrap_or_default();
                OrderView::from_models(o, order_lines)
            })
            .collect();
        Ok((views, total))
    }

    /// Fetches an order visible to `user`: their own, or any for admins.
    /// Orders of other identities read as not found.
    #[instrument(skip(self, user), fields(user_id = %user.user_id))]
    pub async fn get_order(&self, user: &AuthUser, order_id: Uuid) -> Result<OrderView, ServiceError> {
        let order = self.find_visible(user, order_id).await?;
        let mut lines = load_lines(&*self.db, &[order.id]).await?;
        let order_lines = lines.remove(&order.id).unwrap_or_default();
        Ok(OrderView::from_models(order, order_lines))
    }

    pub(crate) async fn find_visible(
        &self,
        user: &AuthUser,
        order_id: Uuid,
    ) -> Result<order::Model, ServiceError> {
        order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .filter(|o| o.owner_id == user.user_id || user.is_admin())
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
    }

    /// Applies a status change and/or tracking and notes.
    ///
    /// Shoppers may cancel their own order and edit notes; every other status
    /// change and tracking numbers need the admin role.
    #[instrument(skip(self, user, input), fields(user_id = %user.user_id))]
    pub async fn update_order(
        &self,
        user: &AuthUser,
        order_id: Uuid,
        input: UpdateOrderInput,
    ) -> Result<OrderView, ServiceError> {
        input.validate()?;
        let current = self.find_visible(user, order_id).await?;

        if current.status.is_terminal() {
            return Err(ServiceError::InvalidStatus(format!(
                "order is {} and can no longer change",
                current.status
            )));
        }

        let customer_cancel = input.status == Some(OrderStatus::Cancelled)
            && current.owner_id == user.user_id;
        if (input.status.is_some() && !customer_cancel) || input.tracking_number.is_some() {
            user.require_admin()?;
        }

        if let Some(next) = input.status.filter(|s| *s != current.status) {
            if !current.status.can_transition_to(next) {
                return Err(ServiceError::InvalidStatus(format!(
                    "cannot move order from {} to {}",
                    current.status, next
                )));
            }
            let (payment_status, reason) = match next {
                OrderStatus::Cancelled => (
                    None,
                    Some(if user.is_admin() {
                        "cancelled_by_admin"
                    } else {
                        "cancelled_by_customer"
                    }),
                ),
                OrderStatus::Delivered if current.payment_method == PaymentMethod::Cod => {
                    (Some(PaymentStatus::Paid), None)
                }
                _ => (None, None),
            };
            let moved =
                transition_order(&*self.db, order_id, current.status, next, payment_status, reason)
                    .await?;
            if !moved {
                return Err(ServiceError::Conflict(
                    "order status changed concurrently; reload and retry".to_string(),
                ));
            }
            info!(%order_id, from = %current.status, to = %next, "order status changed");
            self.event_sender
                .send_or_log(Event::OrderStatusChanged {
                    order_id,
                    old_status: current.status.to_string(),
                    new_status: next.to_string(),
                })
                .await;
            if next == OrderStatus::Cancelled {
                self.event_sender
                    .send_or_log(Event::OrderCancelled {
                        order_id,
                        reason: reason.unwrap_or_default().to_string(),
                    })
                    .await;
            }
        }

        if input.tracking_number.is_some() || input.notes.is_some() {
            let mut update = order::Entity::update_many()
                .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()));
            if let Some(tracking) = input.tracking_number {
                update = update.col_expr(order::Column::TrackingNumber, Expr::value(Some(tracking)));
            }
            if let Some(notes) = input.notes {
                update = update.col_expr(order::Column::Notes, Expr::value(Some(notes)));
            }
            update
                .filter(order::Column::Id.eq(order_id))
                .exec(&*self.db)
                .await?;
        }

        self.get_order(user, order_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_numbers_are_date_prefixed() {
        let now = chrono::TimeZone::with_ymd_and_hms(&Utc, 2024, 3, 9, 10, 0, 0).unwrap();
        let number = generate_order_number(now);
        assert!(number.starts_with("ORD-20240309-"));
        assert_eq!(number.len(), "ORD-20240309-".len() + 6);
        assert!(number[13..]
            .bytes()
            .all(|b| ORDER_NUMBER_ALPHABET.contains(&b)));
    }

    #[test]
    fn field_names_match_the_wire_format() {
        assert_eq!(camel_case("postal_code"), "postalCode");
        assert_eq!(camel_case("email"), "email");
    }

    #[test]
    fn transaction_ids_are_restricted() {
        assert!(valid_transaction_id("MT1712345_ab-1"));
        assert!(!valid_transaction_id(""));
        assert!(!valid_transaction_id("has space"));
        assert!(!valid_transaction_id(&"x".repeat(65)));
        assert!(valid_transaction_id(&generate_merchant_transaction_id(Utc::now())));
    }
}
