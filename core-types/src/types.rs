use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The two order feeds served by the marketplace aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedKind {
    Asks,
    Bids,
}

impl FeedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedKind::Asks => "asks",
            FeedKind::Bids => "bids",
        }
    }
}

impl fmt::Display for FeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Ask,
    Bid,
}

/// What an order applies to. Asks are always token-scoped; bids may target a
/// single token, an attribute, or a whole collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrderScope {
    Token {
        collection: String,
        token_id: String,
    },
    Attribute {
        collection: String,
        key: String,
        value: String,
    },
    Collection {
        collection: String,
    },
    Other,
}

/// An order as committed to storage, shaped from the aggregator wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: String,
    pub side: OrderSide,
    pub maker: String,
    pub taker: String,
    pub scope: OrderScope,
    pub price_native: f64,
    pub price_decimal: f64,
    pub price_usd: Option<f64>,
    pub price_currency: String,
    pub quantity_filled: f64,
    pub quantity_remaining: f64,
    pub fee_bps: Option<u64>,
    /// Upper-cased status string, e.g. `ACTIVE`.
    pub status: String,
    /// Marketplace domain the order originated from.
    pub marketplace: Option<String>,
    pub valid_from: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_kind_labels() {
        assert_eq!(FeedKind::Asks.to_string(), "asks");
        assert_eq!(FeedKind::Bids.to_string(), "bids");
    }

    #[test]
    fn order_scope_serializes_with_kind_tag() {
        let scope = OrderScope::Token {
            collection: "0xabc".to_string(),
            token_id: "17".to_string(),
        };
        let value = serde_json::to_value(&scope).unwrap();
        assert_eq!(value["kind"], "token");
        assert_eq!(value["token_id"], "17");
    }
}
