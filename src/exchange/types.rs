//! Canonical shapes returned by every exchange adapter.
//!
//! Venue wire formats never leave their adapter; everything is translated
//! into these types at the boundary.

use crate::domain::EntityStatus;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Acknowledgement of a submitted order.
///
/// `source_id` is the exchange-assigned identifier used for all later
/// queries. `open` reports whether the venue still considers the order
/// working; orders are always persisted as open and advanced by
/// reconciliation, so a fast-filling order closes on the next pass.
#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub source_id: String,
    pub open: bool,
}

/// Current venue-side state of a previously submitted order.
#[derive(Debug, Clone)]
pub struct ExchangeOrderState {
    pub source_id: String,
    /// The venue reports the order filled, cancelled, or otherwise done.
    pub closed: bool,
    /// Base-asset quantity executed so far, when the venue reports it.
    pub filled_quantity: Option<Decimal>,
}

/// One execution against an order, normalized to ledger terms.
///
/// `price` is the amount of the order's spending currency this fill
/// consumed; `quantity` is the amount of counter currency it produced.
/// Adapters perform the direction-aware conversion from venue rate/size
/// pairs.
#[derive(Debug, Clone)]
pub struct Fill {
    /// Venue-unique execution id; the reconciliation idempotency key.
    pub source_id: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub fee: Decimal,
    pub is_taker: bool,
    pub executed_at: DateTime<Utc>,
}

/// Best-price snapshot for one market symbol.
#[derive(Debug, Clone, Copy)]
pub struct Ticker {
    pub price: Decimal,
    pub bid: Decimal,
    pub ask: Decimal,
}

/// Exchange-reported wallet balance for one currency.
#[derive(Debug, Clone)]
pub struct ExchangeBalance {
    pub symbol: String,
    pub available: Decimal,
    pub total: Decimal,
}

/// A market listing as reported by the venue.
#[derive(Debug, Clone)]
pub struct ExchangeMarket {
    pub symbol: String,
    pub base_currency: String,
    pub quote_currency: String,
    pub min_trade_size: Decimal,
    pub status: EntityStatus,
    pub tags: Vec<String>,
}
