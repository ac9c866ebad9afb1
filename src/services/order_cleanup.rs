use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use sea_orm::{sea_query::Expr, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, instrument, warn};

use crate::{
    config::CleanupConfig,
    entities::{order, OrderStatus, PaymentMethod, PaymentStatus},
    errors::ServiceError,
    events::{Event, EventSender},
};

pub const PAYMENT_TIMEOUT_REASON: &str = "payment_timeout";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub success: bool,
    pub cancelled_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub interval_secs: u64,
    pub pending_timeout_secs: u64,
    pub last_sweep_at: Option<DateTime<Utc>>,
    pub last_report: Option<SweepReport>,
}

#[derive(Debug, Default)]
struct LastSweep {
    at: Option<DateTime<Utc>>,
    report: Option<SweepReport>,
}

/// Cancels gateway orders left `pending` past the payment timeout. Flagged
/// orders are skipped; they wait for manual review.
#[instrument(skip(db))]
pub async fn cancel_expired_orders(
    db: &DatabaseConnection,
    cutoff: DateTime<Utc>,
) -> Result<u64, ServiceError> {
    let now = Utc::now();
    let result = order::Entity::update_many()
        .col_expr(order::Column::Status, Expr::value(OrderStatus::Cancelled))
        .col_expr(order::Column::CancelledAt, Expr::value(Some(now)))
        .col_expr(
            order::Column::CancellationReason,
            Expr::value(Some(PAYMENT_TIMEOUT_REASON.to_string())),
        )
        .col_expr(order::Column::UpdatedAt, Expr::value(now))
        .filter(order::Column::Status.eq(OrderStatus::Pending))
        .filter(order::Column::PaymentMethod.eq(PaymentMethod::Gateway))
        .filter(order::Column::PaymentStatus.ne(PaymentStatus::Flagged))
        .filter(order::Column::CreatedAt.lt(cutoff))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}

struct SweepContext {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    pending_timeout: Duration,
    sweep_lock: tokio::sync::Mutex<()>,
    last: Mutex<LastSweep>,
}

impl SweepContext {
    /// Timed and manual sweeps share `sweep_lock`, so they never overlap.
    async fn sweep(&self) -> SweepReport {
        let _guard = self.sweep_lock.lock().await;
        let now = Utc::now();
        let report = match chrono::Duration::from_std(self.pending_timeout) {
            Ok(timeout) => match cancel_expired_orders(&self.db, now - timeout).await {
                Ok(cancelled) => {
                    counter!("storefront.cleanup.cancelled", cancelled);
                    if cancelled > 0 {
                        info!(cancelled, "expired pending orders cancelled");
                    }
                    self.event_sender
                        .send_or_log(Event::PendingOrdersSwept {
                            cancelled,
                            swept_at: now,
                        })
                        .await;
                    SweepReport {
                        success: true,
                        cancelled_count: cancelled,
                    }
                }
                Err(e) => {
                    counter!("storefront.cleanup.failed", 1);
                    error!(error = %e, "pending order sweep failed");
                    SweepReport {
                        success: false,
                        cancelled_count: 0,
                    }
                }
            },
            Err(e) => {
                error!(error = %e, "pending timeout out of range");
                SweepReport {
                    success: false,
                    cancelled_count: 0,
                }
            }
        };
        if let Ok(mut last) = self.last.lock() {
            last.at = Some(now);
            last.report = Some(report);
        }
        report
    }
}

/// Owned lifecycle for the recurring sweep. `start` and `stop` are idempotent.
pub struct OrderCleanupScheduler {
    ctx: Arc<SweepContext>,
    interval: Duration,
    grace_delay: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl OrderCleanupScheduler {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        interval: Duration,
        pending_timeout: Duration,
        grace_delay: Duration,
    ) -> Self {
        Self {
            ctx: Arc::new(SweepContext {
                db,
                event_sender,
                pending_timeout,
                sweep_lock: tokio::sync::Mutex::new(()),
                last: Mutex::new(LastSweep::default()),
            }),
            interval,
            grace_delay,
            handle: Mutex::new(None),
        }
    }

    pub fn from_config(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        config: &CleanupConfig,
    ) -> Self {
        Self::new(
            db,
            event_sender,
            Duration::from_secs(config.interval_secs.max(1)),
            Duration::from_secs(config.pending_timeout_secs),
            Duration::from_secs(config.grace_delay_secs),
        )
    }

    /// Starts the recurring sweep. Returns `false` when it was already running.
    pub fn start(&self) -> bool {
        let Ok(mut handle) = self.handle.lock() else {
            warn!("cleanup scheduler lock poisoned");
            return false;
        };
        if handle.as_ref().map_or(false, |h| !h.is_finished()) {
            return false;
        }

        let ctx = Arc::clone(&self.ctx);
        let every = self.interval;
        let first = Instant::now() + self.grace_delay;
        *handle = Some(tokio::spawn(async move {
            let mut ticker = interval_at(first, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                ctx.sweep().await;
            }
        }));
        gauge!("storefront.cleanup.running", 1.0);
        info!(
            interval_secs = every.as_secs(),
            grace_secs = self.grace_delay.as_secs(),
            "order cleanup scheduler started"
        );
        true
    }

    /// Stops the recurring sweep. Returns `false` when it was not running.
    /// A sweep already in progress is aborted at its next await point; its
    /// update is a single statement so nothing is left half-applied.
    pub fn stop(&self) -> bool {
        let Ok(mut handle) = self.handle.lock() else {
            return false;
        };
        match handle.take() {
            Some(h) if !h.is_finished() => {
                h.abort();
                gauge!("storefront.cleanup.running", 0.0);
                info!("order cleanup scheduler stopped");
                true
            }
            _ => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .map(|h| h.as_ref().map_or(false, |h| !h.is_finished()))
            .unwrap_or(false)
    }

    pub fn status(&self) -> SchedulerStatus {
        let (last_sweep_at, last_report) = self
            .ctx
            .last
            .lock()
            .map(|l| (l.at, l.report))
            .unwrap_or((None, None));
        SchedulerStatus {
            state: if self.is_running() {
                SchedulerState::Running
            } else {
                SchedulerState::Stopped
            },
            interval_secs: self.interval.as_secs(),
            pending_timeout_secs: self.ctx.pending_timeout.as_secs(),
            last_sweep_at,
            last_report,
        }
    }

    /// Runs one sweep immediately, waiting for any sweep in progress.
    pub async fn run_now(&self) -> SweepReport {
        self.ctx.sweep().await
    }
}

impl Drop for OrderCleanupScheduler {
    fn drop(&mut self) {
        if let Ok(mut handle) = self.handle.lock() {
            if let Some(h) = handle.take() {
                h.abort();
            }
        }
    }
}
