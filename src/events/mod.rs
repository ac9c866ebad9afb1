use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the channel is closed.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!(error = %e, "dropping domain event");
        }
    }
}

/// Domain events emitted by the checkout and payment pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    CartUpdated {
        owner_id: String,
        item_count: usize,
    },
    CartCleared(String),

    OrderCreated {
        order_id: Uuid,
        order_number: String,
        payment_method: String,
        total: Decimal,
    },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: String,
        new_status: String,
    },
    OrderCancelled {
        order_id: Uuid,
        reason: String,
    },

    PaymentInitiated {
        order_id: Uuid,
        merchant_transaction_id: String,
    },
    PaymentConfirmed {
        order_id: Uuid,
        merchant_transaction_id: String,
    },
    PaymentFailed {
        order_id: Uuid,
        merchant_transaction_id: String,
        status: String,
    },
    /// Gateway reported success for an amount other than the order total.
    PaymentAmountMismatch {
        order_id: Uuid,
        merchant_transaction_id: String,
        expected_minor: i64,
        reported_minor: i64,
    },
    RefundRequested {
        merchant_transaction_id: String,
        refund_id: String,
        amount: Decimal,
    },

    PendingOrdersSwept {
        cancelled: u64,
        swept_at: DateTime<Utc>,
    },
}

/// Drains the event channel, logging each event. Ends when every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::PaymentAmountMismatch {
                order_id,
                merchant_transaction_id,
                expected_minor,
                reported_minor,
            } => {
                warn!(
                    %order_id,
                    %merchant_transaction_id,
                    expected_minor,
                    reported_minor,
                    "payment amount mismatch flagged for review"
                );
            }
            Event::PaymentFailed {
                order_id, status, ..
            } => {
                warn!(%order_id, %status, "payment failed");
            }
            Event::PendingOrdersSwept { cancelled, .. } if *cancelled > 0 => {
                info!(cancelled, "pending orders cancelled by sweep");
            }
            other => {
                info!(event = ?other, "event received");
            }
        }
    }

    warn!("Event processing loop has ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_delivers_to_receiver() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = EventSender::new(tx);
        sender.send(Event::CartCleared("u1".into())).await.unwrap();
        assert_eq!(rx.recv().await, Some(Event::CartCleared("u1".into())));
    }

    #[tokio::test]
    async fn send_or_log_swallows_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = EventSender::new(tx);
        assert!(sender.send(Event::CartCleared("u1".into())).await.is_err());
        sender.send_or_log(Event::CartCleared("u1".into())).await;
    }
}
