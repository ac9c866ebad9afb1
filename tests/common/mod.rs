#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use chrono::{Duration as ChronoDuration, Utc};
use http_body_util::BodyExt;
use sea_orm::{sea_query::Expr, ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use serde_json::{json, Value};
use storefront_api::{
    auth::{Claims, JwtVerifier},
    config::AppConfig,
    db,
    entities::{coupon, order, payment_transaction},
    events::{self, EventSender},
    handlers::AppServices,
    models::{ProductTypeStock, StockLevel, StockSnapshot},
    services::{
        gateway::{
            sign_payload, GatewayError, GatewayPaymentState, GatewayStatus, InitiateRequest,
            InitiateResponse, PaymentGateway, RefundRequest, RefundState, RefundStatus,
        },
        stock::StaticStockReader,
    },
    AppState,
};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const JWT_SECRET: &str = "test_secret_key_for_testing_purposes_only_32chars";
pub const GATEWAY_SECRET: &str = "gateway_test_secret";
pub const SHOPPER: &str = "shopper-1";
pub const OTHER_SHOPPER: &str = "shopper-2";
pub const ADMIN: &str = "admin-1";

/// In-memory gateway. Records initiations and answers status polls from a
/// programmable table.
#[derive(Default)]
pub struct MockGateway {
    pub initiated: Mutex<Vec<InitiateRequest>>,
    pub statuses: Mutex<Vec<GatewayStatus>>,
    pub refunds: Mutex<Vec<RefundRequest>>,
    /// Outcome reported for refunds; `None` completes them.
    pub refund_state: Mutex<Option<RefundState>>,
    /// Behaves like a deployment without gateway credentials.
    pub unconfigured: bool,
}

impl MockGateway {
    pub fn set_status(&self, status: GatewayStatus) {
        let mut statuses = self.statuses.lock().unwrap();
        statuses.retain(|s| s.merchant_transaction_id != status.merchant_transaction_id);
        statuses.push(status);
    }

    pub fn set_refund_state(&self, state: RefundState) {
        *self.refund_state.lock().unwrap() = Some(state);
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    fn is_configured(&self) -> bool {
        !self.unconfigured
    }

    fn callback_secret(&self) -> Option<&str> {
        Some(GATEWAY_SECRET)
    }

    async fn initiate(&self, request: &InitiateRequest) -> Result<InitiateResponse, GatewayError> {
        self.initiated.lock().unwrap().push(request.clone());
        Ok(InitiateResponse {
            checkout_url: format!("https://pay.test/checkout/{}", request.merchant_transaction_id),
            gateway_reference: Some(format!("GW-{}", request.merchant_transaction_id)),
        })
    }

    async fn check_status(&self, id: &str) -> Result<GatewayStatus, GatewayError> {
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.merchant_transaction_id == id)
            .cloned()
            .unwrap_or(GatewayStatus {
                merchant_transaction_id: id.to_string(),
                state: GatewayPaymentState::Pending,
                amount_minor: None,
                gateway_reference: None,
            }))
    }

    async fn refund(&self, request: &RefundRequest) -> Result<RefundStatus, GatewayError> {
        self.refunds.lock().unwrap().push(request.clone());
        let state = self
            .refund_state
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(RefundState::Completed);
        Ok(RefundStatus {
            refund_id: request.refund_id.clone(),
            state,
            amount_minor: Some(request.amount_minor),
        })
    }

    async fn check_refund_status(&self, refund_id: &str) -> Result<RefundStatus, GatewayError> {
        Ok(RefundStatus {
            refund_id: refund_id.to_string(),
            state: RefundState::Pending,
            amount_minor: None,
        })
    }
}

/// Helper harness for spinning up an application backed by a throwaway SQLite file.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub gateway: Arc<MockGateway>,
    pub stock: Arc<StaticStockReader>,
    _event_task: tokio::task::JoinHandle<()>,
    _dir: tempfile::TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(adjust: impl FnOnce(&mut AppConfig)) -> Self {
        Self::build(adjust, MockGateway::default()).await
    }

    pub async fn with_gateway(gateway: MockGateway) -> Self {
        Self::build(|_| {}, gateway).await
    }

    async fn build(adjust: impl FnOnce(&mut AppConfig), gateway: MockGateway) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let db_path = dir.path().join("storefront_test.db");
        let mut cfg = AppConfig::new(
            format!("sqlite://{}?mode=rwc", db_path.display()),
            JWT_SECRET.to_string(),
            "test".to_string(),
        );
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        adjust(&mut cfg);

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");
        let db_arc = Arc::new(pool);

        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = Arc::new(EventSender::new(event_tx));
        let event_task = tokio::spawn(events::process_events(event_rx));

        let gateway = Arc::new(gateway);
        let stock = Arc::new(StaticStockReader::new(Some(default_stock())));
        let services = AppServices::new(
            db_arc.clone(),
            event_sender.clone(),
            &cfg,
            stock.clone(),
            gateway.clone(),
        );

        let state = AppState {
            db: db_arc,
            verifier: Arc::new(JwtVerifier::from_config(&cfg)),
            config: Arc::new(cfg),
            event_sender,
            services,
        };

        Self {
            router: storefront_api::app_router(state.clone()),
            state,
            gateway,
            stock,
            _event_task: event_task,
            _dir: dir,
        }
    }

    /// Send a request and decode the JSON body (Null when empty).
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&json).expect("serialize request body"))
            }
            None => Body::empty(),
        };
        self.send(builder.body(body).expect("build request")).await
    }

    pub async fn as_user(
        &self,
        user: &str,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let roles: &[&str] = if user == ADMIN { &["admin"] } else { &[] };
        self.request(method, uri, body, Some(&token(user, roles))).await
    }

    /// Posts a gateway callback. `signature: None` signs the body correctly.
    pub async fn callback(&self, body: &Value, signature: Option<&str>) -> (StatusCode, Value) {
        let raw = serde_json::to_vec(body).expect("serialize callback");
        let sig = signature
            .map(str::to_string)
            .unwrap_or_else(|| sign_payload(GATEWAY_SECRET, &raw));
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/payments/gateway/callback")
            .header("content-type", "application/json")
            .header("x-verify", sig)
            .body(Body::from(raw))
            .expect("build callback");
        self.send(request).await
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("read body")
            .to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::String(
                String::from_utf8_lossy(&bytes).into_owned(),
            ))
        };
        (status, value)
    }

    pub async fn seed_coupon(&self, model: coupon::Model) {
        coupon::ActiveModel {
            code: Set(model.code),
            description: Set(model.description),
            discount_amount_minor: Set(model.discount_amount_minor),
            discount_percent: Set(model.discount_percent),
            min_cart_total_minor: Set(model.min_cart_total_minor),
            max_discount_minor: Set(model.max_discount_minor),
            valid_from: Set(model.valid_from),
            expires_at: Set(model.expires_at),
            active: Set(model.active),
            once_per_user: Set(model.once_per_user),
            created_at: Set(model.created_at),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed coupon");
    }

    /// Moves an order's creation time into the past.
    pub async fn backdate_order(&self, order_id: Uuid, minutes: i64) {
        order::Entity::update_many()
            .col_expr(
                order::Column::CreatedAt,
                Expr::value(Utc::now() - ChronoDuration::minutes(minutes)),
            )
            .filter(order::Column::Id.eq(order_id))
            .exec(&*self.state.db)
            .await
            .expect("backdate order");
    }

    pub async fn load_order(&self, order_id: Uuid) -> order::Model {
        order::Entity::find_by_id(order_id)
            .one(&*self.state.db)
            .await
            .expect("query order")
            .expect("order exists")
    }

    pub async fn load_transaction(&self, merchant_transaction_id: &str) -> payment_transaction::Model {
        payment_transaction::Entity::find_by_id(merchant_transaction_id.to_string())
            .one(&*self.state.db)
            .await
            .expect("query transaction")
            .expect("transaction exists")
    }

    pub async fn order_count(&self) -> usize {
        order::Entity::find()
            .all(&*self.state.db)
            .await
            .expect("query orders")
            .len()
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

pub fn token(user: &str, roles: &[&str]) -> String {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: user.to_string(),
        name: None,
        email: Some(format!("{}@example.com", user)),
        roles: roles.iter().map(|r| r.to_string()).collect(),
        jti: Some(Uuid::new_v4().to_string()),
        iat: now,
        exp: now + 3600,
        iss: "storefront-auth".to_string(),
        aud: "storefront-api".to_string(),
    };
    jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .expect("encode access token")
}

/// Tees: M-Black has 3 left, L-White is sold out.
pub fn default_stock() -> StockSnapshot {
    let mut tees = ProductTypeStock::default();
    tees.stock.insert(
        "M-Black".into(),
        StockLevel {
            quantity: 3,
            available: true,
        },
    );
    tees.stock.insert(
        "L-White".into(),
        StockLevel {
            quantity: 0,
            available: false,
        },
    );
    let mut snapshot = StockSnapshot::default();
    snapshot.types.insert("tees".into(), tees);
    snapshot
}

pub fn tee(quantity: u32, price: &str) -> Value {
    json!({
        "id": "p1_Size:M|Color:Black",
        "productId": "p1",
        "name": "Classic Tee",
        "price": price,
        "category": "tees",
        "quantity": quantity,
        "variants": { "Size": "M", "Color": "Black" }
    })
}

pub fn mug(quantity: u32, price: &str) -> Value {
    json!({
        "id": "m1",
        "productId": "m1",
        "name": "Mug",
        "price": price,
        "category": "mugs",
        "quantity": quantity
    })
}

pub fn shipping_info() -> Value {
    json!({
        "fullName": "Asha Rao",
        "email": "asha@example.com",
        "phone": "+91 98765 43210",
        "address": "12 MG Road",
        "city": "Bengaluru",
        "state": "KA",
        "postalCode": "560001"
    })
}

pub fn order_id(body: &Value) -> Uuid {
    body["data"]["orderId"]
        .as_str()
        .and_then(|s| Uuid::parse_str(s).ok())
        .expect("order id in response")
}

pub fn coupon(code: &str) -> coupon::Model {
    coupon::Model {
        code: code.to_string(),
        description: format!("{} coupon", code),
        discount_amount_minor: None,
        discount_percent: None,
        min_cart_total_minor: None,
        max_discount_minor: None,
        valid_from: None,
        expires_at: None,
        active: true,
        once_per_user: false,
        created_at: Utc::now(),
    }
}
