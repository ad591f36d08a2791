//! REST source adapters for the marketplace aggregator order feeds.
//!
//! Each feed kind supplies the same capability record to the ingestion
//! engines: fetch one page, extract storage records from it, and read the
//! page's continuation token. Feed differences (endpoint, criteria
//! filtering) live entirely in the adapter implementations.

pub mod map;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use core_types::{FeedKind, OrderRecord};
use reqwest::{Client, Url};
use serde::Deserialize;
use thiserror::Error;

use crate::map::{map_ask, map_bid};

const ASKS_PATH: &str = "/orders/asks/v4";
const BIDS_PATH: &str = "/orders/bids/v5";
const SORT_FIELD: &str = "updatedAt";
const SORT_DIRECTION: &str = "asc";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
    #[error("http status {0}")]
    HttpStatus(u16),
}

/// Page request parameters. Timestamps are epoch seconds as the aggregator
/// expects; absent bounds leave the corresponding side open.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageQuery {
    pub start_timestamp: Option<i64>,
    pub end_timestamp: Option<i64>,
    pub continuation: Option<String>,
    pub limit: usize,
    pub status: Option<String>,
}

/// One page of the paginated orders endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrdersPage {
    #[serde(default)]
    pub orders: Vec<RawOrder>,
    #[serde(default)]
    pub continuation: Option<String>,
}

/// An order as it appears on the wire.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawOrder {
    pub id: String,
    #[serde(default)]
    pub maker: Option<String>,
    #[serde(default)]
    pub taker: Option<String>,
    #[serde(default)]
    pub contract: Option<String>,
    pub status: String,
    #[serde(default)]
    pub price: Option<RawPrice>,
    #[serde(default)]
    pub quantity_filled: Option<f64>,
    #[serde(default)]
    pub quantity_remaining: Option<f64>,
    #[serde(default)]
    pub fee_bps: Option<u64>,
    #[serde(default)]
    pub criteria: Option<RawCriteria>,
    #[serde(default)]
    pub source: Option<RawOrderSource>,
    #[serde(default)]
    pub valid_from: Option<i64>,
    #[serde(default)]
    pub valid_until: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPrice {
    #[serde(default)]
    pub currency: Option<RawCurrency>,
    #[serde(default)]
    pub amount: Option<RawAmount>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCurrency {
    #[serde(default)]
    pub contract: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAmount {
    #[serde(default)]
    pub decimal: Option<f64>,
    #[serde(default)]
    pub usd: Option<f64>,
    #[serde(default)]
    pub native: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCriteria {
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub data: Option<RawCriteriaData>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCriteriaData {
    #[serde(default)]
    pub token: Option<RawToken>,
    #[serde(default)]
    pub attribute: Option<RawAttribute>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawToken {
    #[serde(default)]
    pub token_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAttribute {
    #[serde(default)]
    pub attribute_key: Option<String>,
    #[serde(default)]
    pub attribute_value: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawOrderSource {
    #[serde(default)]
    pub domain: Option<String>,
}

/// Capability record consumed by every ingestion worker.
#[async_trait]
pub trait OrderFeed: Send + Sync + 'static {
    fn kind(&self) -> FeedKind;

    async fn fetch_page(&self, query: &PageQuery) -> Result<OrdersPage, SourceError>;

    /// Extract and shape the records of a page; feed-specific filtering
    /// happens here.
    fn extract(&self, page: &OrdersPage) -> Vec<OrderRecord>;

    fn continuation(&self, page: &OrdersPage) -> Option<String> {
        page.continuation.clone()
    }
}

/// Authenticated client for the aggregator REST API.
#[derive(Clone)]
pub struct ReservoirClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl ReservoirClient {
    pub fn new(client: Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    async fn get_orders(&self, path: &str, query: &PageQuery) -> Result<OrdersPage, SourceError> {
        let mut url = Url::parse(&self.base_url)?;
        url.set_path(path);
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("sortBy", SORT_FIELD)
                .append_pair("sortDirection", SORT_DIRECTION)
                .append_pair("limit", &query.limit.to_string());
            if let Some(start) = query.start_timestamp {
                pairs.append_pair("startTimestamp", &start.to_string());
            }
            if let Some(end) = query.end_timestamp {
                pairs.append_pair("endTimestamp", &end.to_string());
            }
            if let Some(status) = &query.status {
                pairs.append_pair("status", status);
            }
            if let Some(continuation) = &query.continuation {
                pairs.append_pair("continuation", continuation);
            }
        }
        let response = self
            .client
            .get(url)
            .header("x-api-key", &self.api_key)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::HttpStatus(status.as_u16()));
        }
        Ok(response.json::<OrdersPage>().await?)
    }
}

/// Ask orders, restricted to token-scoped listings.
pub struct AsksFeed {
    client: ReservoirClient,
}

impl AsksFeed {
    pub fn new(client: ReservoirClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl OrderFeed for AsksFeed {
    fn kind(&self) -> FeedKind {
        FeedKind::Asks
    }

    async fn fetch_page(&self, query: &PageQuery) -> Result<OrdersPage, SourceError> {
        self.client.get_orders(ASKS_PATH, query).await
    }

    fn extract(&self, page: &OrdersPage) -> Vec<OrderRecord> {
        page.orders
            .iter()
            .filter(|raw| {
                raw.criteria
                    .as_ref()
                    .and_then(|c| c.kind.as_deref())
                    .is_some_and(|kind| kind == "token")
            })
            .filter_map(|raw| match map_ask(raw) {
                Some(record) => Some(record),
                None => {
                    log::debug!("skipping unmappable ask {}", raw.id);
                    None
                }
            })
            .collect()
    }
}

/// Bid orders across token, attribute, and collection criteria.
pub struct BidsFeed {
    client: ReservoirClient,
}

impl BidsFeed {
    pub fn new(client: ReservoirClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl OrderFeed for BidsFeed {
    fn kind(&self) -> FeedKind {
        FeedKind::Bids
    }

    async fn fetch_page(&self, query: &PageQuery) -> Result<OrdersPage, SourceError> {
        self.client.get_orders(BIDS_PATH, query).await
    }

    fn extract(&self, page: &OrdersPage) -> Vec<OrderRecord> {
        page.orders
            .iter()
            .filter_map(|raw| match map_bid(raw) {
                Some(record) => Some(record),
                None => {
                    log::debug!("skipping unmappable bid {}", raw.id);
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn sample_ask(id: &str, criteria_kind: &str) -> serde_json::Value {
        json!({
            "id": id,
            "maker": "0xmaker",
            "taker": "0x0000000000000000000000000000000000000000",
            "contract": "0xcollection",
            "status": "active",
            "price": {
                "currency": {"contract": "0x0000000000000000000000000000000000000000"},
                "amount": {"decimal": 1.5, "usd": 3600.0, "native": 1.5}
            },
            "quantityFilled": 0,
            "quantityRemaining": 1,
            "feeBps": 250,
            "criteria": {
                "kind": criteria_kind,
                "data": {"token": {"tokenId": "42"}}
            },
            "source": {"domain": "opensea.io"},
            "validFrom": 1_700_000_000,
            "validUntil": 1_702_000_000,
            "createdAt": "2023-11-14T22:13:20Z",
            "updatedAt": "2023-11-15T00:00:00Z"
        })
    }

    #[tokio::test]
    async fn fetch_page_sends_sort_and_window_params() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/orders/asks/v4")
                    .header("x-api-key", "test-key")
                    .query_param("sortBy", "updatedAt")
                    .query_param("sortDirection", "asc")
                    .query_param("limit", "1000")
                    .query_param("startTimestamp", "1700000000")
                    .query_param("endTimestamp", "1700086400")
                    .query_param("status", "active")
                    .query_param("continuation", "cursor-1");
                then.status(200).json_body(json!({
                    "orders": [sample_ask("order-1", "token")],
                    "continuation": "cursor-2"
                }));
            })
            .await;

        let feed = AsksFeed::new(ReservoirClient::new(
            Client::new(),
            server.base_url(),
            "test-key",
        ));
        let page = feed
            .fetch_page(&PageQuery {
                start_timestamp: Some(1_700_000_000),
                end_timestamp: Some(1_700_086_400),
                continuation: Some("cursor-1".to_string()),
                limit: 1000,
                status: Some("active".to_string()),
            })
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(page.orders.len(), 1);
        assert_eq!(feed.continuation(&page), Some("cursor-2".to_string()));
    }

    #[tokio::test]
    async fn fetch_page_surfaces_http_errors() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/orders/bids/v5");
                then.status(429);
            })
            .await;

        let feed = BidsFeed::new(ReservoirClient::new(Client::new(), server.base_url(), "k"));
        let err = feed
            .fetch_page(&PageQuery {
                limit: 1000,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::HttpStatus(429)));
    }

    #[test]
    fn asks_extract_keeps_only_token_criteria() {
        let page: OrdersPage = serde_json::from_value(json!({
            "orders": [
                sample_ask("order-1", "token"),
                sample_ask("order-2", "collection"),
            ],
            "continuation": null
        }))
        .unwrap();
        let feed = AsksFeed::new(ReservoirClient::new(Client::new(), "http://localhost", "k"));
        let records = feed.extract(&page);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "order-1");
    }

    #[test]
    fn missing_continuation_ends_pagination() {
        let page: OrdersPage = serde_json::from_value(json!({"orders": []})).unwrap();
        let feed = BidsFeed::new(ReservoirClient::new(Client::new(), "http://localhost", "k"));
        assert_eq!(feed.continuation(&page), None);
    }
}
