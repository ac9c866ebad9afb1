pub mod admin;
pub mod carts;
pub mod common;
pub mod coupons;
pub mod health;
pub mod orders;
pub mod payments;
pub mod stock;

use sea_orm::DatabaseConnection;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::events::EventSender;
use crate::services::{
    carts::CartService,
    coupons::CouponService,
    gateway::PaymentGateway,
    order_cleanup::OrderCleanupScheduler,
    orders::OrderService,
    payment_methods::{PaymentMethodAvailability, PaymentMethodFlags},
    payments::PaymentService,
    stock::StockReader,
};

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub carts: Arc<CartService>,
    pub coupons: Arc<CouponService>,
    pub stock: Arc<dyn StockReader>,
    pub orders: Arc<OrderService>,
    pub payments: Arc<PaymentService>,
    pub payment_methods: Arc<PaymentMethodFlags>,
    pub cleanup: Arc<OrderCleanupScheduler>,
}

impl AppServices {
    /// Wires the services. Stock and gateway adapters are passed in so callers
    /// can choose real or in-memory implementations.
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        config: &AppConfig,
        stock: Arc<dyn StockReader>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        let payment_methods = Arc::new(
            PaymentMethodFlags::from_config(&config.payment_methods)
                .with_gateway_configured(gateway.is_configured()),
        );
        let coupons = CouponService::new((*db).clone());
        let availability: Arc<dyn PaymentMethodAvailability> = payment_methods.clone();

        let orders = Arc::new(OrderService::new(
            db.clone(),
            event_sender.clone(),
            stock.clone(),
            coupons.clone(),
            availability,
            config.shipping.clone(),
            config.currency.clone(),
        ));
        let payments = Arc::new(PaymentService::new(
            db.clone(),
            event_sender.clone(),
            gateway,
            &config.gateway,
        ));
        let cleanup = Arc::new(OrderCleanupScheduler::from_config(
            db.clone(),
            event_sender.clone(),
            &config.cleanup,
        ));

        Self {
            carts: Arc::new(CartService::new(db, event_sender)),
            coupons: Arc::new(coupons),
            stock,
            orders,
            payments,
            payment_methods,
            cleanup,
        }
    }
}
