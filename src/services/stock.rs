use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{instrument, warn};

use crate::config::StockConfig;
use crate::models::StockSnapshot;

/// Source of the current stock document. `None` means no snapshot could be
/// read right now; callers decide whether that blocks them.
#[async_trait]
pub trait StockReader: Send + Sync {
    async fn fetch_snapshot(&self) -> Option<StockSnapshot>;
}

/// Reads `GET {url}` from the catalog service.
pub struct HttpStockReader {
    client: reqwest::Client,
    url: String,
}

impl HttpStockReader {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl StockReader for HttpStockReader {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn fetch_snapshot(&self) -> Option<StockSnapshot> {
        let response = match self.client.get(&self.url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "stock fetch failed");
                return None;
            }
        };
        if !response.status().is_success() {
            warn!(status = %response.status(), "stock fetch returned non-success");
            return None;
        }
        match response.json::<StockSnapshot>().await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(error = %e, "stock document did not parse");
                None
            }
        }
    }
}

/// Reads a JSON stock document from disk on every call.
pub struct FileStockReader {
    path: PathBuf,
}

impl FileStockReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl StockReader for FileStockReader {
    #[instrument(skip(self), fields(path = %self.path.display()))]
    async fn fetch_snapshot(&self) -> Option<StockSnapshot> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "stock file unreadable");
                return None;
            }
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| warn!(error = %e, "stock file did not parse"))
            .ok()
    }
}

/// In-memory snapshot, replaceable at runtime. Used in tests and when no
/// catalog source is configured.
#[derive(Default)]
pub struct StaticStockReader {
    snapshot: RwLock<Option<StockSnapshot>>,
}

impl StaticStockReader {
    pub fn new(snapshot: Option<StockSnapshot>) -> Self {
        Self {
            snapshot: RwLock::new(snapshot),
        }
    }

    pub async fn replace(&self, snapshot: Option<StockSnapshot>) {
        *self.snapshot.write().await = snapshot;
    }
}

#[async_trait]
impl StockReader for StaticStockReader {
    async fn fetch_snapshot(&self) -> Option<StockSnapshot> {
        self.snapshot.read().await.clone()
    }
}

/// Picks a reader from configuration: URL, then file. Without either there is
/// no stock data, so checkouts with size/color lines are refused.
pub fn reader_from_config(config: &StockConfig) -> Arc<dyn StockReader> {
    if let Some(url) = config.url.as_deref().filter(|u| !u.trim().is_empty()) {
        return Arc::new(HttpStockReader::new(url));
    }
    if let Some(file) = config.file.as_deref().filter(|f| !f.trim().is_empty()) {
        return Arc::new(FileStockReader::new(file));
    }
    warn!("no stock source configured; variant checkouts will be refused");
    Arc::new(StaticStockReader::new(None))
}
