//! Client-side cart synchronization: an in-memory cart backed by an
//! authoritative remote store with a per-identity local fallback cache.
//!
//! Mutations apply in memory first and are then pushed to the remote. A failed
//! push keeps the mutation, writes the local cache and moves the store into
//! [`SyncState::Degraded`] until a later push or reload succeeds. Loading for an
//! identity replaces local state with the remote cart wholesale.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::carts::CartService;
use crate::errors::ServiceError;
use crate::models::{add_line, remove_line, set_line_quantity, CartItem};

#[derive(Debug, Error)]
pub enum CartSyncError {
    #[error("remote cart store unavailable: {0}")]
    Unavailable(String),
    #[error("remote cart store rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// Authoritative cart storage.
#[async_trait]
pub trait RemoteCart: Send + Sync {
    async fn load(&self, owner_id: &str) -> Result<Vec<CartItem>, CartSyncError>;
    async fn save(&self, owner_id: &str, items: &[CartItem]) -> Result<(), CartSyncError>;
}

/// Best-effort per-identity fallback copy.
#[async_trait]
pub trait LocalCartCache: Send + Sync {
    async fn load(&self, owner_id: &str) -> Option<Vec<CartItem>>;
    async fn store(&self, owner_id: &str, items: &[CartItem]);
}

/// Remote tier backed directly by [`CartService`] in the same process.
pub struct ServiceRemoteCart {
    service: CartService,
}

impl ServiceRemoteCart {
    pub fn new(service: CartService) -> Self {
        Self { service }
    }
}

#[async_trait]
impl RemoteCart for ServiceRemoteCart {
    async fn load(&self, owner_id: &str) -> Result<Vec<CartItem>, CartSyncError> {
        Ok(self.service.get(owner_id).await?.items)
    }

    async fn save(&self, owner_id: &str, items: &[CartItem]) -> Result<(), CartSyncError> {
        self.service.replace(owner_id, items.to_vec()).await?;
        Ok(())
    }
}

/// Remote tier speaking to `/api/v1/cart` over HTTP with a bearer token.
pub struct HttpRemoteCart {
    client: reqwest::Client,
    base_url: String,
    bearer_token: String,
}

/// `/api/v1/cart` answers with the usual `{ success, data }` envelope.
#[derive(Deserialize)]
struct RemoteCartEnvelope {
    data: Option<RemoteCartBody>,
}

#[derive(Deserialize)]
struct RemoteCartBody {
    items: Vec<CartItem>,
}

impl HttpRemoteCart {
    pub fn new(base_url: impl Into<String>, bearer_token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bearer_token: bearer_token.into(),
        }
    }

    fn cart_url(&self) -> String {
        format!("{}/api/v1/cart", self.base_url)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, CartSyncError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(CartSyncError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl RemoteCart for HttpRemoteCart {
    async fn load(&self, _owner_id: &str) -> Result<Vec<CartItem>, CartSyncError> {
        let response = self
            .client
            .get(self.cart_url())
            .bearer_auth(&self.bearer_token)
            .send()
            .await?;
        let envelope: RemoteCartEnvelope = Self::check(response).await?.json().await?;
        envelope
            .data
            .map(|body| body.items)
            .ok_or_else(|| CartSyncError::Unavailable("cart response carried no data".to_string()))
    }

    async fn save(&self, _owner_id: &str, items: &[CartItem]) -> Result<(), CartSyncError> {
        let response = self
            .client
            .put(self.cart_url())
            .bearer_auth(&self.bearer_token)
            .json(&serde_json::json!({ "items": items }))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryCartCache {
    entries: DashMap<String, Vec<CartItem>>,
}

impl InMemoryCartCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalCartCache for InMemoryCartCache {
    async fn load(&self, owner_id: &str) -> Option<Vec<CartItem>> {
        self.entries.get(owner_id).map(|e| e.value().clone())
    }

    async fn store(&self, owner_id: &str, items: &[CartItem]) {
        self.entries.insert(owner_id.to_string(), items.to_vec());
    }
}

/// One JSON file per identity under `dir`; file names are the hex-encoded identity.
pub struct FileCartCache {
    dir: PathBuf,
}

impl FileCartCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, owner_id: &str) -> PathBuf {
        self.dir.join(format!("cart-{}.json", hex::encode(owner_id)))
    }
}

#[async_trait]
impl LocalCartCache for FileCartCache {
    async fn load(&self, owner_id: &str) -> Option<Vec<CartItem>> {
        let bytes = tokio::fs::read(self.path_for(owner_id)).await.ok()?;
        serde_json::from_slice(&bytes)
            .map_err(|e| warn!(error = %e, "discarding unreadable cart cache"))
            .ok()
    }

    async fn store(&self, owner_id: &str, items: &[CartItem]) {
        let result = async {
            tokio::fs::create_dir_all(&self.dir).await?;
            let body = serde_json::to_vec(items)?;
            tokio::fs::write(self.path_for(owner_id), body).await?;
            Ok::<_, anyhow::Error>(())
        }
        .await;
        if let Err(e) = result {
            warn!(error = %e, "failed to write cart cache");
        }
    }
}

/// Observable synchronization health of a [`CartStore`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncState {
    /// Memory matches the remote store.
    Synced,
    /// The remote could not be reached; memory and the local cache are ahead of it
    /// (or the cart was restored from the local cache).
    Degraded { reason: String, since: DateTime<Utc> },
}

impl SyncState {
    pub fn is_degraded(&self) -> bool {
        matches!(self, SyncState::Degraded { .. })
    }
}

struct StoreState {
    identity: Option<String>,
    items: Vec<CartItem>,
    sync: SyncState,
}

/// Two-tier cart with optimistic mutations.
pub struct CartStore {
    remote: Arc<dyn RemoteCart>,
    local: Arc<dyn LocalCartCache>,
    state: Mutex<StoreState>,
}

impl CartStore {
    pub fn new(remote: Arc<dyn RemoteCart>, local: Arc<dyn LocalCartCache>) -> Self {
        Self {
            remote,
            local,
            state: Mutex::new(StoreState {
                identity: None,
                items: Vec::new(),
                sync: SyncState::Synced,
            }),
        }
    }

    pub async fn items(&self) -> Vec<CartItem> {
        self.state.lock().await.items.clone()
    }

    pub async fn identity(&self) -> Option<String> {
        self.state.lock().await.identity.clone()
    }

    pub async fn sync_state(&self) -> SyncState {
        self.state.lock().await.sync.clone()
    }

    /// Login, logout or account switch. `None` wipes the in-memory cart.
    ///
    /// Remote state fully replaces whatever was in memory. When the remote
    /// load fails the per-identity local cache is used, then an empty cart.
    pub async fn switch_identity(&self, identity: Option<String>) {
        let mut state = self.state.lock().await;
        state.identity = identity.clone();
        state.items.clear();
        state.sync = SyncState::Synced;

        let Some(owner_id) = identity else {
            debug!("cart identity cleared");
            return;
        };

        match self.remote.load(&owner_id).await {
            Ok(items) => {
                info!(%owner_id, item_count = items.len(), "cart loaded from remote");
                self.local.store(&owner_id, &items).await;
                state.items = items;
            }
            Err(e) => {
                warn!(%owner_id, error = %e, "remote cart load failed; using local cache");
                counter!("storefront.cart_sync.degraded", 1);
                state.items = self.local.load(&owner_id).await.unwrap_or_default();
                state.sync = SyncState::Degraded {
                    reason: e.to_string(),
                    since: Utc::now(),
                };
            }
        }
    }

    pub async fn add(&self, item: CartItem, quantity: i64) -> Vec<CartItem> {
        self.mutate(|items| add_line(items, item, quantity)).await
    }

    pub async fn set_quantity(&self, id: &str, quantity: i64) -> Vec<CartItem> {
        self.mutate(|items| {
            set_line_quantity(items, id, quantity);
        })
        .await
    }

    pub async fn remove(&self, id: &str) -> Vec<CartItem> {
        self.mutate(|items| {
            remove_line(items, id);
        })
        .await
    }

    pub async fn clear(&self) -> Vec<CartItem> {
        self.mutate(|items| items.clear()).await
    }

    /// Pushes the in-memory cart again, leaving degraded mode on success.
    pub async fn resync(&self) -> SyncState {
        let mut state = self.state.lock().await;
        self.persist(&mut state).await;
        state.sync.clone()
    }

    async fn mutate<F>(&self, apply: F) -> Vec<CartItem>
    where
        F: FnOnce(&mut Vec<CartItem>),
    {
        let mut state = self.state.lock().await;
        apply(&mut state.items);
        self.persist(&mut state).await;
        state.items.clone()
    }

    async fn persist(&self, state: &mut StoreState) {
        let Some(owner_id) = state.identity.clone() else {
            return;
        };
        match self.remote.save(&owner_id, &state.items).await {
            Ok(()) => {
                self.local.store(&owner_id, &state.items).await;
                if state.sync.is_degraded() {
                    info!(%owner_id, "cart sync recovered");
                }
                state.sync = SyncState::Synced;
            }
            Err(e) => {
                warn!(%owner_id, error = %e, "cart sync failed; keeping local changes");
                counter!("storefront.cart_sync.degraded", 1);
                self.local.store(&owner_id, &state.items).await;
                if !state.sync.is_degraded() {
                    state.sync = SyncState::Degraded {
                        reason: e.to_string(),
                        since: Utc::now(),
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Remote that can be switched off, holding one cart per identity.
    #[derive(Default)]
    struct FlakyRemote {
        down: AtomicBool,
        carts: DashMap<String, Vec<CartItem>>,
    }

    #[async_trait]
    impl RemoteCart for FlakyRemote {
        async fn load(&self, owner_id: &str) -> Result<Vec<CartItem>, CartSyncError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(CartSyncError::Unavailable("down".into()));
            }
            Ok(self.carts.get(owner_id).map(|c| c.clone()).unwrap_or_default())
        }

        async fn save(&self, owner_id: &str, items: &[CartItem]) -> Result<(), CartSyncError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(CartSyncError::Unavailable("down".into()));
            }
            self.carts.insert(owner_id.to_string(), items.to_vec());
            Ok(())
        }
    }

    fn item(id: &str) -> CartItem {
        CartItem {
            id: id.to_string(),
            product_id: id.split('_').next().unwrap_or(id).to_string(),
            name: "Tee".into(),
            unit_price: dec!(500),
            image: None,
            category: None,
            quantity: 1,
            in_stock: true,
            variants: Default::default(),
        }
    }

    #[tokio::test]
    async fn failed_push_keeps_mutation_and_degrades() {
        let remote = Arc::new(FlakyRemote::default());
        let cache = Arc::new(InMemoryCartCache::new());
        let store = CartStore::new(remote.clone(), cache.clone());
        store.switch_identity(Some("u1".into())).await;

        remote.down.store(true, Ordering::SeqCst);
        let items = store.add(item("p1_Size:M|Color:Black"), 2).await;
        assert_eq!(items[0].quantity, 2);
        assert!(store.sync_state().await.is_degraded());
        assert_eq!(cache.load("u1").await.unwrap().len(), 1);

        remote.down.store(false, Ordering::SeqCst);
        assert_eq!(store.resync().await, SyncState::Synced);
        assert_eq!(remote.carts.get("u1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remote_load_replaces_local_state() {
        let remote = Arc::new(FlakyRemote::default());
        remote.carts.insert("u1".into(), vec![item("p2")]);
        let store = CartStore::new(remote, Arc::new(InMemoryCartCache::new()));

        store.add(item("p1"), 1).await;
        store.switch_identity(Some("u1".into())).await;

        let ids: Vec<String> = store.items().await.into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["p2".to_string()]);
    }

    #[tokio::test]
    async fn logout_wipes_memory() {
        let remote = Arc::new(FlakyRemote::default());
        let store = CartStore::new(remote, Arc::new(InMemoryCartCache::new()));
        store.switch_identity(Some("u1".into())).await;
        store.add(item("p1"), 1).await;
        store.switch_identity(None).await;
        assert!(store.items().await.is_empty());
        assert_eq!(store.identity().await, None);
    }

    #[tokio::test]
    async fn file_cache_round_trips_per_identity() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCartCache::new(dir.path());
        cache.store("user@example.com", &[item("p1")]).await;
        assert_eq!(cache.load("user@example.com").await.unwrap()[0].id, "p1");
        assert!(cache.load("someone-else").await.is_none());
    }
}
