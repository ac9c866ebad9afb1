use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, DatabaseConnection, DatabaseTransaction, EntityTrait, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};

use crate::{
    entities::cart,
    errors::ServiceError,
    events::{Event, EventSender},
    models::{add_line, remove_line, set_line_quantity, CartItem},
};

/// A cart as stored for one identity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartDocument {
    pub owner_id: String,
    pub items: Vec<CartItem>,
    pub version: i64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl CartDocument {
    fn empty(owner_id: &str) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            items: Vec::new(),
            version: 0,
            updated_at: None,
        }
    }

    fn from_model(model: cart::Model) -> Result<Self, ServiceError> {
        let items: Vec<CartItem> = serde_json::from_value(model.items)?;
        Ok(Self {
            owner_id: model.owner_id,
            items,
            version: model.version,
            updated_at: Some(model.updated_at),
        })
    }
}

/// Durable per-identity cart documents. Every write replaces the whole
/// document and bumps its version; there is no field-level merge.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    #[instrument(skip(self))]
    pub async fn get(&self, owner_id: &str) -> Result<CartDocument, ServiceError> {
        match cart::Entity::find_by_id(owner_id.to_string())
            .one(&*self.db)
            .await?
        {
            Some(model) => CartDocument::from_model(model),
            None => Ok(CartDocument::empty(owner_id)),
        }
    }

    #[instrument(skip(self, items), fields(item_count = items.len()))]
    pub async fn replace(
        &self,
        owner_id: &str,
        items: Vec<CartItem>,
    ) -> Result<CartDocument, ServiceError> {
        let mut normalized = Vec::with_capacity(items.len());
        for item in items {
            let quantity = i64::from(item.quantity);
            add_line(&mut normalized, item, quantity);
        }
        self.mutate(owner_id, move |lines| {
            *lines = normalized;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, item), fields(item_id = %item.id))]
    pub async fn add(
        &self,
        owner_id: &str,
        item: CartItem,
        quantity: i64,
    ) -> Result<CartDocument, ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::ValidationError(
                "quantity must be greater than 0".to_string(),
            ));
        }
        self.mutate(owner_id, move |lines| {
            add_line(lines, item, quantity);
            Ok(())
        })
        .await
    }

    /// Quantity of zero or less removes the line.
    #[instrument(skip(self))]
    pub async fn set_quantity(
        &self,
        owner_id: &str,
        item_id: &str,
        quantity: i64,
    ) -> Result<CartDocument, ServiceError> {
        let id = item_id.to_string();
        self.mutate(owner_id, move |lines| {
            if set_line_quantity(lines, &id, quantity) {
                Ok(())
            } else {
                Err(ServiceError::NotFound(format!("Cart item {} not found", id)))
            }
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn remove(&self, owner_id: &str, item_id: &str) -> Result<CartDocument, ServiceError> {
        let id = item_id.to_string();
        self.mutate(owner_id, move |lines| {
            if remove_line(lines, &id) {
                Ok(())
            } else {
                Err(ServiceError::NotFound(format!("Cart item {} not found", id)))
            }
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn clear(&self, owner_id: &str) -> Result<CartDocument, ServiceError> {
        let doc = self
            .mutate(owner_id, |lines| {
                lines.clear();
                Ok(())
            })
            .await?;
        self.event_sender
            .send_or_log(Event::CartCleared(owner_id.to_string()))
            .await;
        Ok(doc)
    }

    async fn mutate<F>(&self, owner_id: &str, apply: F) -> Result<CartDocument, ServiceError>
    where
        F: FnOnce(&mut Vec<CartItem>) -> Result<(), ServiceError>,
    {
        let txn = self.db.begin().await?;
        let existing = cart::Entity::find_by_id(owner_id.to_string())
            .one(&txn)
            .await?;

        let mut doc = match existing.clone() {
            Some(model) => CartDocument::from_model(model)?,
            None => CartDocument::empty(owner_id),
        };
        apply(&mut doc.items)?;

        let saved = save(&txn, existing.is_some(), owner_id, &doc).await?;
        txn.commit().await?;

        info!(
            owner_id,
            version = saved.version,
            item_count = saved.items.len(),
            "cart saved"
        );
        self.event_sender
            .send_or_log(Event::CartUpdated {
                owner_id: owner_id.to_string(),
                item_count: saved.items.len(),
            })
            .await;
        Ok(saved)
    }
}

async fn save(
    txn: &DatabaseTransaction,
    exists: bool,
    owner_id: &str,
    doc: &CartDocument,
) -> Result<CartDocument, ServiceError> {
    let now = Utc::now();
    let version = doc.version + 1;
    let model = cart::ActiveModel {
        owner_id: Set(owner_id.to_string()),
        items: Set(serde_json::to_value(&doc.items)?),
        version: Set(version),
        updated_at: Set(now),
    };
    if exists {
        model.update(txn).await?;
    } else {
        model.insert(txn).await?;
    }
    Ok(CartDocument {
        owner_id: owner_id.to_string(),
        items: doc.items.clone(),
        version,
        updated_at: Some(now),
    })
}
