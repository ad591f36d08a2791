//! Scriptable feed and store doubles for engine tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use core_types::{FeedKind, OrderRecord};
use order_store::{MemoryOrderStore, OrderStore, OrderStoreError};
use parking_lot::Mutex;
use reservoir_source::{
    OrderFeed, OrdersPage, PageQuery, RawOrder, SourceError,
    map::{map_ask, map_bid},
};
use tokio_util::sync::CancellationToken;

pub(crate) fn ts(rfc: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc).unwrap().with_timezone(&Utc)
}

pub(crate) fn raw_order(id: &str, updated_at: DateTime<Utc>) -> RawOrder {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "maker": "0xmaker",
        "taker": "0x0000000000000000000000000000000000000000",
        "contract": "0xcollection",
        "status": "active",
        "price": {
            "currency": {"contract": "0xweth"},
            "amount": {"decimal": 1.0, "usd": 2400.0, "native": 1.0}
        },
        "quantityFilled": 0,
        "quantityRemaining": 1,
        "criteria": {"kind": "token", "data": {"token": {"tokenId": "1"}}},
        "source": {"domain": "opensea.io"},
        "createdAt": updated_at.to_rfc3339(),
        "updatedAt": updated_at.to_rfc3339(),
    }))
    .unwrap()
}

pub(crate) fn page(orders: Vec<RawOrder>, continuation: Option<&str>) -> OrdersPage {
    OrdersPage {
        orders,
        continuation: continuation.map(String::from),
    }
}

type PageKey = (Option<i64>, Option<String>);
type ScriptedResponse = Result<OrdersPage, u16>;

/// Feed double keyed by `(startTimestamp, continuation)`. Each key holds a
/// queue of responses; the last response repeats once the queue drains. A
/// fallback page serves any unscripted key.
pub(crate) struct ScriptedFeed {
    kind: FeedKind,
    pages: Mutex<HashMap<PageKey, VecDeque<ScriptedResponse>>>,
    fallback: Mutex<Option<ScriptedResponse>>,
    fetches: AtomicUsize,
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
}

impl ScriptedFeed {
    pub(crate) fn new(kind: FeedKind) -> Self {
        Self {
            kind,
            pages: Mutex::new(HashMap::new()),
            fallback: Mutex::new(None),
            fetches: AtomicUsize::new(0),
            cancel_after: Mutex::new(None),
        }
    }

    /// Cancel `token` once `limit` pages have been requested, so perpetual
    /// loops can be driven a fixed number of steps.
    pub(crate) fn cancel_after(self, limit: usize, token: CancellationToken) -> Self {
        *self.cancel_after.lock() = Some((limit, token));
        self
    }

    pub(crate) fn script(
        &self,
        start_timestamp: Option<i64>,
        continuation: Option<&str>,
        response: ScriptedResponse,
    ) {
        self.pages
            .lock()
            .entry((start_timestamp, continuation.map(String::from)))
            .or_default()
            .push_back(response);
    }

    pub(crate) fn script_fallback(&self, response: ScriptedResponse) {
        *self.fallback.lock() = Some(response);
    }

    pub(crate) fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OrderFeed for ScriptedFeed {
    fn kind(&self) -> FeedKind {
        self.kind
    }

    async fn fetch_page(&self, query: &PageQuery) -> Result<OrdersPage, SourceError> {
        let count = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((limit, token)) = self.cancel_after.lock().as_ref() {
            if count >= *limit {
                token.cancel();
            }
        }
        let key = (query.start_timestamp, query.continuation.clone());
        let response = {
            let mut pages = self.pages.lock();
            match pages.get_mut(&key) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => self.fallback.lock().clone(),
            }
        };
        match response {
            Some(Ok(page)) => Ok(page),
            Some(Err(status)) => Err(SourceError::HttpStatus(status)),
            None => panic!("unscripted page request: {key:?}"),
        }
    }

    fn extract(&self, page: &OrdersPage) -> Vec<OrderRecord> {
        page.orders
            .iter()
            .filter_map(|raw| match self.kind {
                FeedKind::Asks => map_ask(raw),
                FeedKind::Bids => map_bid(raw),
            })
            .collect()
    }
}

/// Store double whose first N bulk saves fail.
pub(crate) struct FlakyStore {
    failures: AtomicUsize,
    inner: MemoryOrderStore,
}

impl FlakyStore {
    pub(crate) fn failing_once() -> Self {
        Self {
            failures: AtomicUsize::new(1),
            inner: MemoryOrderStore::new(),
        }
    }

    pub(crate) fn inner(&self) -> &MemoryOrderStore {
        &self.inner
    }

    fn should_fail(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                left.checked_sub(1)
            })
            .is_ok()
    }
}

#[async_trait]
impl OrderStore for FlakyStore {
    async fn save(&self, kind: FeedKind, order: OrderRecord) -> Result<(), OrderStoreError> {
        self.inner.save(kind, order).await
    }

    async fn save_bulk(
        &self,
        kind: FeedKind,
        orders: Vec<OrderRecord>,
    ) -> Result<(), OrderStoreError> {
        if self.should_fail() {
            return Err(OrderStoreError::Unavailable("injected failure".to_string()));
        }
        self.inner.save_bulk(kind, orders).await
    }
}
