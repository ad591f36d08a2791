//! Order storage collaborator.
//!
//! Commits from backfill, upkeep, and the stream path all land here. Saves
//! upsert by order id, so replaying overlapping pages or receiving the same
//! event twice leaves the store unchanged.

use std::collections::HashMap;

use async_trait::async_trait;
use core_types::{FeedKind, OrderRecord};
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrderStoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Upsert-by-id order storage.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn save(&self, kind: FeedKind, order: OrderRecord) -> Result<(), OrderStoreError>;

    /// Upserts every record under one lock; callers may pass overlapping or
    /// duplicate batches.
    async fn save_bulk(
        &self,
        kind: FeedKind,
        orders: Vec<OrderRecord>,
    ) -> Result<(), OrderStoreError>;
}

/// In-memory store keyed by order id, one map per feed kind.
#[derive(Default)]
pub struct MemoryOrderStore {
    asks: Mutex<HashMap<String, OrderRecord>>,
    bids: Mutex<HashMap<String, OrderRecord>>,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, kind: FeedKind) -> &Mutex<HashMap<String, OrderRecord>> {
        match kind {
            FeedKind::Asks => &self.asks,
            FeedKind::Bids => &self.bids,
        }
    }

    pub fn len(&self, kind: FeedKind) -> usize {
        self.map(kind).lock().len()
    }

    pub fn is_empty(&self, kind: FeedKind) -> bool {
        self.len(kind) == 0
    }

    pub fn get(&self, kind: FeedKind, id: &str) -> Option<OrderRecord> {
        self.map(kind).lock().get(id).cloned()
    }

    pub fn ids(&self, kind: FeedKind) -> Vec<String> {
        let mut ids: Vec<String> = self.map(kind).lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn save(&self, kind: FeedKind, order: OrderRecord) -> Result<(), OrderStoreError> {
        self.map(kind).lock().insert(order.id.clone(), order);
        Ok(())
    }

    async fn save_bulk(
        &self,
        kind: FeedKind,
        orders: Vec<OrderRecord>,
    ) -> Result<(), OrderStoreError> {
        let mut map = self.map(kind).lock();
        for order in orders {
            map.insert(order.id.clone(), order);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use core_types::{OrderScope, OrderSide};

    fn order(id: &str, status: &str) -> OrderRecord {
        let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        OrderRecord {
            id: id.to_string(),
            side: OrderSide::Ask,
            maker: "0xmaker".to_string(),
            taker: "0x0000000000000000000000000000000000000000".to_string(),
            scope: OrderScope::Token {
                collection: "0xcollection".to_string(),
                token_id: "1".to_string(),
            },
            price_native: 1.25,
            price_decimal: 1.25,
            price_usd: Some(2400.0),
            price_currency: "0x0000000000000000000000000000000000000000".to_string(),
            quantity_filled: 0.0,
            quantity_remaining: 1.0,
            fee_bps: Some(50),
            status: status.to_string(),
            marketplace: Some("opensea.io".to_string()),
            valid_from: Some(ts),
            expires_at: None,
            created_at: ts,
            updated_at: ts,
        }
    }

    #[tokio::test]
    async fn saving_the_same_id_twice_is_idempotent() {
        let store = MemoryOrderStore::new();
        store
            .save(FeedKind::Asks, order("a", "ACTIVE"))
            .await
            .unwrap();
        store
            .save(FeedKind::Asks, order("a", "ACTIVE"))
            .await
            .unwrap();
        assert_eq!(store.len(FeedKind::Asks), 1);
        assert_eq!(
            store.get(FeedKind::Asks, "a").unwrap(),
            order("a", "ACTIVE")
        );
    }

    #[tokio::test]
    async fn bulk_save_upserts_latest_version() {
        let store = MemoryOrderStore::new();
        store
            .save_bulk(FeedKind::Bids, vec![order("a", "ACTIVE"), order("b", "ACTIVE")])
            .await
            .unwrap();
        store
            .save_bulk(FeedKind::Bids, vec![order("a", "FILLED")])
            .await
            .unwrap();
        assert_eq!(store.len(FeedKind::Bids), 2);
        assert_eq!(store.get(FeedKind::Bids, "a").unwrap().status, "FILLED");
    }

    #[tokio::test]
    async fn feeds_do_not_share_a_namespace() {
        let store = MemoryOrderStore::new();
        store
            .save(FeedKind::Asks, order("a", "ACTIVE"))
            .await
            .unwrap();
        assert!(store.is_empty(FeedKind::Bids));
    }
}
