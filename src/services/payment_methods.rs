use chrono::Utc;
use sea_orm::{DatabaseConnection, EntityTrait, Set};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::config::PaymentMethodsConfig;
use crate::entities::{payment_setting, PaymentMethod};
use crate::errors::ServiceError;

/// Capability query consulted by checkout before acting on a payment method.
pub trait PaymentMethodAvailability: Send + Sync {
    fn is_method_enabled(&self, method: PaymentMethod) -> bool;

    /// Whether gateway credentials are present at all.
    fn is_gateway_configured(&self) -> bool {
        true
    }
}

/// Current enablement of each method, readable without blocking. The gateway
/// only counts as enabled when its credentials are configured.
#[derive(Debug)]
pub struct PaymentMethodFlags {
    cod: AtomicBool,
    gateway: AtomicBool,
    gateway_configured: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentMethodsView {
    pub cod: bool,
    pub gateway: bool,
}

impl PaymentMethodFlags {
    pub fn new(cod: bool, gateway: bool) -> Self {
        Self {
            cod: AtomicBool::new(cod),
            gateway: AtomicBool::new(gateway),
            gateway_configured: true,
        }
    }

    pub fn with_gateway_configured(mut self, configured: bool) -> Self {
        self.gateway_configured = configured;
        self
    }

    pub fn from_config(config: &PaymentMethodsConfig) -> Self {
        Self::new(config.cod_enabled, config.gateway_enabled)
    }

    pub fn set(&self, method: PaymentMethod, enabled: bool) {
        match method {
            PaymentMethod::Cod => self.cod.store(enabled, Ordering::Relaxed),
            PaymentMethod::Gateway => self.gateway.store(enabled, Ordering::Relaxed),
        }
    }

    pub fn view(&self) -> PaymentMethodsView {
        PaymentMethodsView {
            cod: self.is_method_enabled(PaymentMethod::Cod),
            gateway: self.is_method_enabled(PaymentMethod::Gateway),
        }
    }

    /// Re-reads the `payment_settings` rows; methods without a row keep their value.
    #[instrument(skip(self, db))]
    pub async fn refresh(&self, db: &DatabaseConnection) -> Result<(), ServiceError> {
        let rows = payment_setting::Entity::find().all(db).await?;
        for row in rows {
            match row.method.as_str() {
                "COD" => self.set(PaymentMethod::Cod, row.enabled),
                "GATEWAY" => self.set(PaymentMethod::Gateway, row.enabled),
                other => debug!(method = other, "ignoring unknown payment setting"),
            }
        }
        Ok(())
    }

    /// Spawns the background poll that keeps the flags current.
    pub fn spawn_refresher(
        self: Arc<Self>,
        db: Arc<DatabaseConnection>,
        every: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                if let Err(e) = self.refresh(&db).await {
                    warn!(error = %e, "payment method refresh failed; keeping last known flags");
                }
            }
        })
    }
}

impl PaymentMethodAvailability for PaymentMethodFlags {
    fn is_method_enabled(&self, method: PaymentMethod) -> bool {
        match method {
            PaymentMethod::Cod => self.cod.load(Ordering::Relaxed),
            PaymentMethod::Gateway => {
                self.gateway_configured && self.gateway.load(Ordering::Relaxed)
            }
        }
    }

    fn is_gateway_configured(&self) -> bool {
        self.gateway_configured
    }
}

/// Persists a method toggle; the refresher picks it up on its next tick.
pub async fn store_setting(
    db: &DatabaseConnection,
    method: PaymentMethod,
    enabled: bool,
) -> Result<(), ServiceError> {
    let model = payment_setting::ActiveModel {
        method: Set(method.as_str().to_string()),
        enabled: Set(enabled),
        updated_at: Set(Utc::now()),
    };
    payment_setting::Entity::insert(model)
        .on_conflict(
            sea_orm::sea_query::OnConflict::column(payment_setting::Column::Method)
                .update_columns([
                    payment_setting::Column::Enabled,
                    payment_setting::Column::UpdatedAt,
                ])
                .to_owned(),
        )
        .exec(db)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_reflect_updates() {
        let flags = PaymentMethodFlags::new(true, true);
        flags.set(PaymentMethod::Gateway, false);
        assert!(flags.is_method_enabled(PaymentMethod::Cod));
        assert!(!flags.is_method_enabled(PaymentMethod::Gateway));
        assert_eq!(
            flags.view(),
            PaymentMethodsView {
                cod: true,
                gateway: false
            }
        );
    }

    #[test]
    fn unconfigured_gateway_is_never_enabled() {
        let flags = PaymentMethodFlags::new(true, true).with_gateway_configured(false);
        assert!(!flags.is_method_enabled(PaymentMethod::Gateway));
        assert!(!flags.is_gateway_configured());

        flags.set(PaymentMethod::Gateway, true);
        assert_eq!(
            flags.view(),
            PaymentMethodsView {
                cod: true,
                gateway: false
            }
        );
    }
}
