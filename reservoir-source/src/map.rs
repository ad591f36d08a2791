//! Shaping of wire orders into storage records.

use chrono::{DateTime, TimeZone, Utc};
use core_types::{OrderRecord, OrderScope, OrderSide};

use crate::RawOrder;

/// Map an ask. Asks are token listings; an ask without token criteria or a
/// price cannot be stored and yields `None`.
pub fn map_ask(raw: &RawOrder) -> Option<OrderRecord> {
    let scope = token_scope(raw)?;
    map_order(raw, OrderSide::Ask, scope)
}

/// Map a bid, classifying its scope from the criteria kind. Unknown criteria
/// kinds are kept with `OrderScope::Other` rather than dropped.
pub fn map_bid(raw: &RawOrder) -> Option<OrderRecord> {
    let scope = bid_scope(raw);
    map_order(raw, OrderSide::Bid, scope)
}

fn map_order(raw: &RawOrder, side: OrderSide, scope: OrderScope) -> Option<OrderRecord> {
    let price = raw.price.as_ref()?;
    let amount = price.amount.as_ref()?;
    let currency = price
        .currency
        .as_ref()
        .and_then(|c| c.contract.clone())
        .unwrap_or_default();
    Some(OrderRecord {
        id: raw.id.clone(),
        side,
        maker: raw.maker.clone().unwrap_or_default(),
        taker: raw.taker.clone().unwrap_or_default(),
        scope,
        price_native: amount.native?,
        price_decimal: amount.decimal.or(amount.native)?,
        price_usd: amount.usd,
        price_currency: currency,
        quantity_filled: raw.quantity_filled.unwrap_or(0.0),
        quantity_remaining: raw.quantity_remaining.unwrap_or(0.0),
        fee_bps: raw.fee_bps,
        status: raw.status.to_uppercase(),
        marketplace: raw.source.as_ref().and_then(|s| s.domain.clone()),
        valid_from: raw.valid_from.and_then(epoch_seconds),
        expires_at: raw.valid_until.and_then(epoch_seconds),
        created_at: raw.created_at,
        updated_at: raw.updated_at,
    })
}

fn token_scope(raw: &RawOrder) -> Option<OrderScope> {
    let collection = raw.contract.clone()?;
    let token_id = raw
        .criteria
        .as_ref()?
        .data
        .as_ref()?
        .token
        .as_ref()?
        .token_id
        .clone()?;
    Some(OrderScope::Token {
        collection,
        token_id,
    })
}

fn bid_scope(raw: &RawOrder) -> OrderScope {
    let collection = raw.contract.clone().unwrap_or_default();
    let Some(criteria) = raw.criteria.as_ref() else {
        return OrderScope::Other;
    };
    match criteria.kind.as_deref() {
        Some("token") => match token_scope(raw) {
            Some(scope) => scope,
            None => OrderScope::Other,
        },
        Some("attribute") => {
            let attribute = criteria.data.as_ref().and_then(|d| d.attribute.as_ref());
            match attribute {
                Some(attr) => OrderScope::Attribute {
                    collection,
                    key: attr.attribute_key.clone().unwrap_or_default(),
                    value: attr.attribute_value.clone().unwrap_or_default(),
                },
                None => OrderScope::Other,
            }
        }
        Some("collection") => OrderScope::Collection { collection },
        _ => OrderScope::Other,
    }
}

fn epoch_seconds(secs: i64) -> Option<DateTime<Utc>> {
    // The aggregator uses 0 for "no bound".
    if secs == 0 {
        return None;
    }
    Utc.timestamp_opt(secs, 0).single()
}
