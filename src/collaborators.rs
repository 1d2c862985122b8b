//! Interfaces to services owned by the surrounding marketplace.
//!
//! The escrow core only needs to know who owns a delivery; it receives
//! already-resolved client and courier ids and never sees user types.

use crate::error::AppResult;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Parties attached to a delivery or announcement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryParties {
    pub client_id: Uuid,
    pub courier_id: Option<Uuid>,
}

/// Delivery/announcement service lookup
#[async_trait]
pub trait DeliveryDirectory: Send + Sync {
    /// `None` when the delivery does not exist
    async fn parties(&self, delivery_id: Uuid) -> AppResult<Option<DeliveryParties>>;
}

/// Directory backed by a map, for tests and single-process deployments
#[derive(Default)]
pub struct InMemoryDeliveryDirectory {
    deliveries: RwLock<HashMap<Uuid, DeliveryParties>>,
}

impl InMemoryDeliveryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, delivery_id: Uuid, client_id: Uuid) {
        self.deliveries.write().await.insert(
            delivery_id,
            DeliveryParties {
                client_id,
                courier_id: None,
            },
        );
    }

    pub async fn assign_courier(&self, delivery_id: Uuid, courier_id: Uuid) {
        if let Some(parties) = self.deliveries.write().await.get_mut(&delivery_id) {
            parties.courier_id = Some(courier_id);
        }
    }
}

#[async_trait]
impl DeliveryDirectory for InMemoryDeliveryDirectory {
    async fn parties(&self, delivery_id: Uuid) -> AppResult<Option<DeliveryParties>> {
        Ok(self.deliveries.read().await.get(&delivery_id).copied())
    }
}
