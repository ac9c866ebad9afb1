use chrono::Utc;
use metrics::counter;
use rand::Rng;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::gateway::{
    verify_signature, GatewayError, GatewayPaymentState, GatewayStatus, InitiateRequest,
    PaymentGateway, RefundRequest, RefundState, RefundStatus,
};
use super::orders::{load_lines, transition_order};
use crate::{
    auth::AuthUser,
    config::GatewayConfig,
    entities::{
        order, payment_transaction, OrderStatus, PaymentMethod, PaymentStatus, TransactionStatus,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    models::{to_minor, OrderView},
};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiatePaymentInput {
    pub order_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiatePaymentResponse {
    pub order_id: Uuid,
    pub merchant_transaction_id: String,
    pub checkout_url: String,
}

/// What a gateway report did to the local records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// Gateway has no outcome yet.
    Pending,
    Confirmed,
    /// Success reported for an amount other than the order total.
    Flagged,
    Failed,
    /// Success arrived after the order left `pending`; needs a refund.
    Orphaned,
    /// Transaction already settled; the report was ignored.
    AlreadyProcessed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileResult {
    pub merchant_transaction_id: String,
    pub order_id: Uuid,
    pub outcome: ReconcileOutcome,
    pub transaction_status: TransactionStatus,
    pub order_status: OrderStatus,
    pub payment_status: PaymentStatus,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundInput {
    pub merchant_transaction_id: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    #[serde(default)]
    pub refund_id: Option<String>,
}

/// Gateway-path payments: initiation, callback and poll reconciliation, refunds.
#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    gateway: Arc<dyn PaymentGateway>,
    redirect_url: String,
    callback_url: String,
}

impl PaymentService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        gateway: Arc<dyn PaymentGateway>,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            db,
            event_sender,
            gateway,
            redirect_url: config.redirect_url.clone().unwrap_or_default(),
            callback_url: config.callback_url.clone().unwrap_or_default(),
        }
    }

    pub fn is_gateway_configured(&self) -> bool {
        self.gateway.is_configured()
    }

    /// Opens a gateway checkout for a pending gateway order. The amount sent is
    /// always the stored order total.
    #[instrument(skip(self, user), fields(user_id = %user.user_id, order_id = %input.order_id))]
    pub async fn initiate(
        &self,
        user: &AuthUser,
        input: InitiatePaymentInput,
    ) -> Result<InitiatePaymentResponse, ServiceError> {
        if !self.gateway.is_configured() {
            return Err(GatewayError::NotConfigured.into());
        }

        let order = order::Entity::find_by_id(input.order_id)
            .one(&*self.db)
            .await?
            .filter(|o| o.owner_id == user.user_id)
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", input.order_id)))?;

        if order.payment_method != PaymentMethod::Gateway {
            return Err(ServiceError::InvalidInput(
                "order is not a gateway order".to_string(),
            ));
        }
        if order.status != OrderStatus::Pending || order.payment_status == PaymentStatus::Flagged {
            return Err(ServiceError::InvalidStatus(format!(
                "order is {} ({}) and cannot be paid",
                order.status, order.payment_status
            )));
        }

        let mtid = order.merchant_transaction_id.clone().ok_or_else(|| {
            ServiceError::InternalError("gateway order has no transaction id".to_string())
        })?;
        let transaction = payment_transaction::Entity::find_by_id(mtid.clone())
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Transaction {} not found", mtid)))?;
        if transaction.status.is_terminal() {
            return Err(ServiceError::Conflict(format!(
                "transaction {} is already {}",
                mtid, transaction.status
            )));
        }

        let request = InitiateRequest {
            merchant_transaction_id: mtid.clone(),
            amount_minor: order.total_minor,
            order_ref: order.order_number.clone(),
            redirect_url: with_query(
                &self.redirect_url,
                &[("orderId", &order.id.to_string()), ("transactionId", &mtid)],
            ),
            callback_url: self.callback_url.clone(),
            customer_id: order.owner_id.clone(),
        };
        let response = self.gateway.initiate(&request).await.map_err(|e| {
            counter!("storefront.payments.initiate_failed", 1);
            warn!(error = %e, "gateway initiation failed");
            ServiceError::from(e)
        })?;

        if let Some(reference) = &response.gateway_reference {
            payment_transaction::Entity::update_many()
                .col_expr(
                    payment_transaction::Column::GatewayReference,
                    Expr::value(Some(reference.clone())),
                )
                .col_expr(payment_transaction::Column::UpdatedAt, Expr::value(Utc::now()))
                .filter(payment_transaction::Column::MerchantTransactionId.eq(mtid.as_str()))
                .exec(&*self.db)
                .await?;
        }

        counter!("storefront.payments.initiated", 1);
        self.event_sender
            .send_or_log(Event::PaymentInitiated {
                order_id: order.id,
                merchant_transaction_id: mtid.clone(),
            })
            .await;

        Ok(InitiatePaymentResponse {
            order_id: order.id,
            merchant_transaction_id: mtid,
            checkout_url: response.checkout_url,
        })
    }

    /// Handles the gateway's server-to-server notification. `body` must be the
    /// exact bytes received so the signature can be checked.
    #[instrument(skip(self, body, signature), fields(body_len = body.len()))]
    pub async fn handle_callback(
        &self,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<ReconcileResult, ServiceError> {
        let secret = self
            .gateway
            .callback_secret()
            .ok_or(GatewayError::NotConfigured)?;
        let signature = signature
            .ok_or_else(|| ServiceError::Unauthorized("missing callback signature".to_string()))?;
        if !verify_signature(secret, body, signature) {
            counter!("storefront.payments.callback_rejected", 1);
            warn!("callback signature mismatch");
            return Err(ServiceError::Unauthorized(
                "invalid callback signature".to_string(),
            ));
        }

        let status: GatewayStatus = serde_json::from_slice(body)
            .map_err(|e| ServiceError::InvalidInput(format!("malformed callback: {}", e)))?;
        self.reconcile(status).await
    }

    /// Polls the gateway for a transaction the caller owns and applies the result.
    #[instrument(skip(self, user), fields(user_id = %user.user_id))]
    pub async fn check_status(
        &self,
        user: &AuthUser,
        merchant_transaction_id: &str,
    ) -> Result<ReconcileResult, ServiceError> {
        let transaction = payment_transaction::Entity::find_by_id(merchant_transaction_id.to_string())
            .one(&*self.db)
            .await?
            .filter(|t| t.owner_id == user.user_id || user.is_admin())
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Transaction {} not found", merchant_transaction_id))
            })?;

        if transaction.status.is_terminal() {
            let order = self.find_order(transaction.order_id).await?;
            return Ok(result_for(&transaction, &order, ReconcileOutcome::AlreadyProcessed));
        }

        let status = self.gateway.check_status(merchant_transaction_id).await?;
        self.reconcile(status).await
    }

    /// Applies a gateway report to the transaction and its order.
    ///
    /// Settled transactions are left untouched, so replays are no-ops. The
    /// order moves `pending → confirmed` only when the reported amount equals
    /// the order total; a different amount flags the order for review.
    #[instrument(skip(self, status), fields(merchant_transaction_id = %status.merchant_transaction_id, state = ?status.state))]
    pub async fn reconcile(&self, status: GatewayStatus) -> Result<ReconcileResult, ServiceError> {
        let mtid = status.merchant_transaction_id.clone();
        let transaction = payment_transaction::Entity::find_by_id(mtid.clone())
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Transaction {} not found", mtid)))?;
        let order = self.find_order(transaction.order_id).await?;

        if transaction.status.is_terminal() {
            counter!("storefront.payments.replayed", 1);
            info!(status = %transaction.status, "transaction already settled; ignoring report");
            return Ok(result_for(&transaction, &order, ReconcileOutcome::AlreadyProcessed));
        }

        let (tx_status, outcome) = match status.state {
            GatewayPaymentState::Pending => {
                return Ok(result_for(&transaction, &order, ReconcileOutcome::Pending));
            }
            GatewayPaymentState::Success => {
                if status.amount_minor == Some(order.total_minor) {
                    (TransactionStatus::Success, ReconcileOutcome::Confirmed)
                } else {
                    (TransactionStatus::Success, ReconcileOutcome::Flagged)
                }
            }
            GatewayPaymentState::Failure => (TransactionStatus::Failure, ReconcileOutcome::Failed),
            GatewayPaymentState::Expired => (TransactionStatus::Expired, ReconcileOutcome::Failed),
        };

        let txn = self.db.begin().await?;
        let settled = payment_transaction::Entity::update_many()
            .col_expr(payment_transaction::Column::Status, Expr::value(tx_status))
            .col_expr(
                payment_transaction::Column::ReportedAmountMinor,
                Expr::value(status.amount_minor),
            )
            .col_expr(
                payment_transaction::Column::GatewayReference,
                Expr::value(
                    status
                        .gateway_reference
                        .clone()
                        .or_else(|| transaction.gateway_reference.clone()),
                ),
            )
            .col_expr(payment_transaction::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(payment_transaction::Column::MerchantTransactionId.eq(mtid.as_str()))
            .filter(payment_transaction::Column::Status.eq(TransactionStatus::Initiated))
            .exec(&txn)
            .await?;
        if settled.rows_affected == 0 {
            // A concurrent report settled it first.
            txn.rollback().await?;
            let transaction = self.find_transaction(&mtid).await?;
            let order = self.find_order(transaction.order_id).await?;
            return Ok(result_for(&transaction, &order, ReconcileOutcome::AlreadyProcessed));
        }

        let outcome = match outcome {
            ReconcileOutcome::Confirmed => {
                let moved = transition_order(
                    &txn,
                    order.id,
                    OrderStatus::Pending,
                    OrderStatus::Confirmed,
                    Some(PaymentStatus::Paid),
                    None,
                )
                .await?;
                if moved {
                    ReconcileOutcome::Confirmed
                } else {
                    ReconcileOutcome::Orphaned
                }
            }
            ReconcileOutcome::Flagged => {
                set_pending_payment_status(&txn, order.id, PaymentStatus::Flagged).await?;
                ReconcileOutcome::Flagged
            }
            other => {
                set_pending_payment_status(&txn, order.id, PaymentStatus::Failed).await?;
                other
            }
        };
        txn.commit().await?;

        self.announce(&order, &mtid, outcome, tx_status, status.amount_minor)
            .await;

        let transaction = self.find_transaction(&mtid).await?;
        let order = self.find_order(order.id).await?;
        Ok(result_for(&transaction, &order, outcome))
    }

    async fn announce(
        &self,
        order: &order::Model,
        mtid: &str,
        outcome: ReconcileOutcome,
        tx_status: TransactionStatus,
        reported: Option<i64>,
    ) {
        counter!("storefront.payments.reconciled", 1, "outcome" => outcome_label(outcome));
        match outcome {
            ReconcileOutcome::Confirmed => {
                info!(order_id = %order.id, "payment confirmed");
                self.event_sender
                    .send_or_log(Event::PaymentConfirmed {
                        order_id: order.id,
                        merchant_transaction_id: mtid.to_string(),
                    })
                    .await;
                self.event_sender
                    .send_or_log(Event::OrderStatusChanged {
                        order_id: order.id,
                        old_status: OrderStatus::Pending.to_string(),
                        new_status: OrderStatus::Confirmed.to_string(),
                    })
                    .await;
            }
            ReconcileOutcome::Flagged => {
                warn!(
                    order_id = %order.id,
                    expected_minor = order.total_minor,
                    reported_minor = ?reported,
                    "payment amount does not match order total; order flagged"
                );
                self.event_sender
                    .send_or_log(Event::PaymentAmountMismatch {
                        order_id: order.id,
                        merchant_transaction_id: mtid.to_string(),
                        expected_minor: order.total_minor,
                        reported_minor: reported.unwrap_or_default(),
                    })
                    .await;
            }
            ReconcileOutcome::Orphaned => {
                error!(
                    order_id = %order.id,
                    "payment succeeded for an order that is no longer pending; refund required"
                );
            }
            ReconcileOutcome::Failed => {
                self.event_sender
                    .send_or_log(Event::PaymentFailed {
                        order_id: order.id,
                        merchant_transaction_id: mtid.to_string(),
                        status: tx_status.to_string(),
                    })
                    .await;
            }
            ReconcileOutcome::Pending | ReconcileOutcome::AlreadyProcessed => {}
        }
    }

    /// Backs the post-payment landing page. Polls the gateway when the callback
    /// has not landed yet, then requires the order to be in a paid state.
    #[instrument(skip(self, user), fields(user_id = %user.user_id))]
    pub async fn validate_success(
        &self,
        user: &AuthUser,
        order_id: Uuid,
        transaction_id: &str,
    ) -> Result<OrderView, ServiceError> {
        let order = order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .filter(|o| o.owner_id == user.user_id)
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if order.merchant_transaction_id.as_deref() != Some(transaction_id) {
            return Err(ServiceError::InvalidInput(
                "transaction does not belong to this order".to_string(),
            ));
        }

        let order = if order.status == OrderStatus::Pending
            && order.payment_status == PaymentStatus::Pending
        {
            match self.check_status(user, transaction_id).await {
                Ok(_) => self.find_order(order_id).await?,
                Err(e) => {
                    warn!(error = %e, "gateway poll failed; using stored state");
                    order
                }
            }
        } else {
            order
        };

        let paid = matches!(
            order.status,
            OrderStatus::Confirmed | OrderStatus::Shipped | OrderStatus::Delivered
        ) && order.payment_status == PaymentStatus::Paid;
        if !paid {
            return Err(ServiceError::InvalidStatus(format!(
                "payment has not succeeded (order {}, payment {})",
                order.status, order.payment_status
            )));
        }

        let mut lines = load_lines(&*self.db, &[order.id]).await?;
        let order_lines = lines.remove(&order.id).unwrap_or_default();
        Ok(OrderView::from_models(order, order_lines))
    }

    /// Requests a refund against a successful transaction. The gateway's
    /// answer is returned as-is; failed refunds are not retried.
    ///
    /// Refunds are capped by what is left of the captured amount. The amount
    /// is reserved on the transaction before the gateway is called and
    /// released again if the gateway rejects it.
    #[instrument(skip(self, user, input), fields(merchant_transaction_id = %input.merchant_transaction_id))]
    pub async fn refund(
        &self,
        user: &AuthUser,
        input: RefundInput,
    ) -> Result<RefundStatus, ServiceError> {
        user.require_admin()?;
        let transaction = self.find_transaction(&input.merchant_transaction_id).await?;
        if transaction.status != TransactionStatus::Success {
            return Err(ServiceError::InvalidStatus(format!(
                "transaction is {}; only successful payments can be refunded",
                transaction.status
            )));
        }
        let captured = transaction
            .reported_amount_minor
            .unwrap_or(transaction.amount_minor);
        let already_refunded = transaction.refunded_amount_minor;
        let remaining = captured - already_refunded;
        if remaining <= 0 {
            return Err(ServiceError::InvalidStatus(
                "transaction is already fully refunded".to_string(),
            ));
        }
        let amount_minor = to_minor(input.amount);
        if amount_minor <= 0 || amount_minor > remaining {
            return Err(ServiceError::ValidationError(format!(
                "refund amount must be between 0.01 and {}",
                crate::models::from_minor(remaining)
            )));
        }

        let mtid = transaction.merchant_transaction_id.clone();
        let reserved = payment_transaction::Entity::update_many()
            .col_expr(
                payment_transaction::Column::RefundedAmountMinor,
                Expr::value(already_refunded + amount_minor),
            )
            .col_expr(payment_transaction::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(payment_transaction::Column::MerchantTransactionId.eq(mtid.as_str()))
            .filter(payment_transaction::Column::RefundedAmountMinor.eq(already_refunded))
            .exec(&*self.db)
            .await?;
        if reserved.rows_affected == 0 {
            return Err(ServiceError::Conflict(
                "another refund for this transaction was recorded concurrently; retry".to_string(),
            ));
        }

        let refund_id = input
            .refund_id
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| generate_refund_id(&mtid));
        let request = RefundRequest {
            merchant_transaction_id: mtid.clone(),
            refund_id: refund_id.clone(),
            amount_minor,
        };
        let status = match self.gateway.refund(&request).await {
            Ok(status) => status,
            Err(e) => {
                self.release_refund(&mtid, amount_minor).await;
                return Err(e.into());
            }
        };
        if status.state == RefundState::Failed {
            self.release_refund(&mtid, amount_minor).await;
        }

        info!(%refund_id, state = ?status.state, "refund requested");
        self.event_sender
            .send_or_log(Event::RefundRequested {
                merchant_transaction_id: mtid.clone(),
                refund_id,
                amount: input.amount,
            })
            .await;

        if status.state == RefundState::Completed && already_refunded + amount_minor == captured {
            order::Entity::update_many()
                .col_expr(order::Column::PaymentStatus, Expr::value(PaymentStatus::Refunded))
                .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
                .filter(order::Column::Id.eq(transaction.order_id))
                .exec(&*self.db)
                .await?;
        }
        Ok(status)
    }

    /// Gives back a reservation made by [`Self::refund`].
    async fn release_refund(&self, mtid: &str, amount_minor: i64) {
        let released = payment_transaction::Entity::update_many()
            .col_expr(
                payment_transaction::Column::RefundedAmountMinor,
                Expr::col(payment_transaction::Column::RefundedAmountMinor).sub(amount_minor),
            )
            .col_expr(payment_transaction::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(payment_transaction::Column::MerchantTransactionId.eq(mtid))
            .exec(&*self.db)
            .await;
        if let Err(e) = released {
            error!(error = %e, merchant_transaction_id = mtid, amount_minor, "failed to release refund reservation");
        }
    }

    #[instrument(skip(self, user))]
    pub async fn check_refund_status(
        &self,
        user: &AuthUser,
        refund_id: &str,
    ) -> Result<RefundStatus, ServiceError> {
        user.require_admin()?;
        Ok(self.gateway.check_refund_status(refund_id).await?)
    }

    async fn find_order(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
    }

    async fn find_transaction(
        &self,
        mtid: &str,
    ) -> Result<payment_transaction::Model, ServiceError> {
        payment_transaction::Entity::find_by_id(mtid.to_string())
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Transaction {} not found", mtid)))
    }
}

async fn set_pending_payment_status<C: sea_orm::ConnectionTrait>(
    db: &C,
    order_id: Uuid,
    payment_status: PaymentStatus,
) -> Result<(), sea_orm::DbErr> {
    order::Entity::update_many()
        .col_expr(order::Column::PaymentStatus, Expr::value(payment_status))
        .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(order::Column::Id.eq(order_id))
        .filter(order::Column::Status.eq(OrderStatus::Pending))
        .exec(db)
        .await?;
    Ok(())
}

fn result_for(
    transaction: &payment_transaction::Model,
    order: &order::Model,
    outcome: ReconcileOutcome,
) -> ReconcileResult {
    ReconcileResult {
        merchant_transaction_id: transaction.merchant_transaction_id.clone(),
        order_id: order.id,
        outcome,
        transaction_status: transaction.status,
        order_status: order.status,
        payment_status: order.payment_status,
    }
}

fn outcome_label(outcome: ReconcileOutcome) -> &'static str {
    match outcome {
        ReconcileOutcome::Pending => "pending",
        ReconcileOutcome::Confirmed => "confirmed",
        ReconcileOutcome::Flagged => "flagged",
        ReconcileOutcome::Failed => "failed",
        ReconcileOutcome::Orphaned => "orphaned",
        ReconcileOutcome::AlreadyProcessed => "already_processed",
    }
}

fn generate_refund_id(mtid: &str) -> String {
    let nonce: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("RF-{}-{:06}", mtid, nonce)
}

fn with_query(base: &str, params: &[(&str, &str)]) -> String {
    if base.is_empty() {
        return String::new();
    }
    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");
    let sep = if base.contains('?') { '&' } else { '?' };
    format!("{}{}{}", base, sep, query)
}
