//! Canonical domain entities and enums.
//!
//! Every exchange-specific shape is translated into these types at the
//! adapter boundary; the ledger, orchestrator, and reconciliation engine
//! only ever see this model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Balances are stored with at most 8 decimal places.
pub const AMOUNT_DECIMAL_PLACES: u32 = 8;

/// Round a monetary amount to the ledger's precision.
pub fn round_amount(value: Decimal) -> Decimal {
    value.round_dp(AMOUNT_DECIMAL_PLACES)
}

/// Outcome of a fund ledger primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BudgetResult {
    Success,
    InsufficientFunds,
    InvalidAmount,
    NoRecord,
    InvalidFunctionParameter,
}

impl fmt::Display for BudgetResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Order direction (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderDirection {
    Buy,
    Sell,
}

impl fmt::Display for OrderDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl FromStr for OrderDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Buy" => Ok(OrderDirection::Buy),
            "Sell" => Ok(OrderDirection::Sell),
            other => Err(format!("unknown order direction: {other}")),
        }
    }
}

/// Canonical order type. Venue-specific variants (ceiling orders etc.)
/// are mapped by each adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    Market,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl FromStr for OrderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Limit" => Ok(OrderType::Limit),
            "Market" => Ok(OrderType::Market),
            other => Err(format!("unknown order type: {other}")),
        }
    }
}

/// Time in force for submitted orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderTimeInForce {
    GoodTilCancelled,
    ImmediateOrCancel,
    FillOrKill,
    PostOnly,
}

impl Default for OrderTimeInForce {
    fn default() -> Self {
        OrderTimeInForce::GoodTilCancelled
    }
}

impl fmt::Display for OrderTimeInForce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl FromStr for OrderTimeInForce {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GoodTilCancelled" => Ok(OrderTimeInForce::GoodTilCancelled),
            "ImmediateOrCancel" => Ok(OrderTimeInForce::ImmediateOrCancel),
            "FillOrKill" => Ok(OrderTimeInForce::FillOrKill),
            "PostOnly" => Ok(OrderTimeInForce::PostOnly),
            other => Err(format!("unknown time in force: {other}")),
        }
    }
}

/// Lifecycle status shared by orders, markets, exchanges, and strategies.
///
/// Order statuses only ever move forward:
/// New -> Active -> Complete -> Settled, or -> Error at any point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityStatus {
    New,
    Active,
    Complete,
    Settled,
    Error,
    /// Disabled by the venue (e.g. trading suspended on a market).
    Disabled,
    /// Permanently removed by the venue (delisted market).
    Delisted,
}

impl EntityStatus {
    /// Ordinal used to enforce monotonic order-status advancement.
    pub fn order_rank(self) -> u8 {
        match self {
            EntityStatus::New => 1,
            EntityStatus::Active => 2,
            EntityStatus::Complete => 3,
            EntityStatus::Settled => 4,
            // Error is terminal and reachable from anywhere.
            EntityStatus::Error => 5,
            EntityStatus::Disabled | EntityStatus::Delisted => 0,
        }
    }

    /// Whether an order in this status is still awaiting reconciliation.
    pub fn is_open(self) -> bool {
        matches!(self, EntityStatus::New | EntityStatus::Active)
    }
}

impl fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl FromStr for EntityStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "New" => Ok(EntityStatus::New),
            "Active" => Ok(EntityStatus::Active),
            "Complete" => Ok(EntityStatus::Complete),
            "Settled" => Ok(EntityStatus::Settled),
            "Error" => Ok(EntityStatus::Error),
            "Disabled" => Ok(EntityStatus::Disabled),
            "Delisted" => Ok(EntityStatus::Delisted),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

/// Supported exchange venues. Keys the adapter factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExchangeKind {
    Bittrex,
    Coinbase,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Bittrex => write!(f, "bittrex"),
            ExchangeKind::Coinbase => write!(f, "coinbase"),
        }
    }
}

impl FromStr for ExchangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bittrex" => Ok(ExchangeKind::Bittrex),
            "coinbase" => Ok(ExchangeKind::Coinbase),
            other => Err(format!("unknown exchange kind: {other}")),
        }
    }
}

/// A per-(currency, exchange, strategy) ledger row.
///
/// `available` is spendable, `reserved` is earmarked for open orders.
/// Mutated only through the four ledger primitives; never deleted.
#[derive(Debug, Clone, PartialEq)]
pub struct Budget {
    pub id: i64,
    pub currency: String,
    pub exchange_id: i64,
    pub strategy_id: i64,
    pub available: Decimal,
    pub reserved: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl Budget {
    /// Derived total: always available + reserved.
    pub fn total(&self) -> Decimal {
        self.available + self.reserved
    }
}

/// A request to place an order, produced by the reaction dispatcher or an
/// external caller. `order_guid` is the caller-generated idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub order_guid: Uuid,
    pub strategy_id: i64,
    pub market_id: i64,
    pub direction: OrderDirection,
    pub order_type: OrderType,
    /// Limit price. Required for Limit orders, never set for Market orders.
    pub price: Option<Decimal>,
    /// Amount of the spending currency this order commits. This is the
    /// amount locked against the budget (quote currency for buys, base
    /// currency for sells).
    pub quantity: Decimal,
    /// Advisory base-asset size for venues that require base-denominated
    /// order payloads. Derived from the limit price or a live ticker;
    /// never persisted as the order's price.
    pub base_quantity: Option<Decimal>,
    pub time_in_force: OrderTimeInForce,
}

impl OrderRequest {
    pub fn new(
        strategy_id: i64,
        market_id: i64,
        direction: OrderDirection,
        order_type: OrderType,
    ) -> Self {
        Self {
            order_guid: Uuid::new_v4(),
            strategy_id,
            market_id,
            direction,
            order_type,
            price: None,
            quantity: Decimal::ZERO,
            base_quantity: None,
            time_in_force: OrderTimeInForce::default(),
        }
    }
}

/// A persisted order. Created once by the orchestrator; status advanced by
/// the reconciliation engine; never deleted.
#[derive(Debug, Clone)]
pub struct Order {
    pub id: i64,
    pub order_guid: Uuid,
    /// Exchange-assigned identifier, set after submission.
    pub source_id: String,
    pub strategy_id: i64,
    pub market_id: i64,
    pub direction: OrderDirection,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub quantity: Decimal,
    pub time_in_force: OrderTimeInForce,
    pub status: EntityStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single exchange-reported execution, created exactly once per distinct
/// fill. `source_id` is the reconciliation idempotency key.
///
/// `price` is the amount of the spending currency consumed by the fill
/// (the credit leg); `quantity` is the amount of counter currency received
/// (the debit leg).
#[derive(Debug, Clone)]
pub struct Trade {
    pub id: i64,
    pub source_id: String,
    pub order_id: i64,
    pub is_taker: bool,
    pub price: Decimal,
    pub quantity: Decimal,
    pub fee: Decimal,
    pub executed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A tradable market on one exchange. Read-mostly; refreshed by market sync.
#[derive(Debug, Clone)]
pub struct Market {
    pub id: i64,
    pub exchange_id: i64,
    pub symbol: String,
    pub base_currency: String,
    pub quote_currency: String,
    pub min_trade_size: Decimal,
    pub status: EntityStatus,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Market {
    /// Currency spent when trading in `direction` on this market.
    pub fn spending_currency(&self, direction: OrderDirection) -> &str {
        match direction {
            // Buying spends quote currency to acquire base currency.
            OrderDirection::Buy => &self.quote_currency,
            // Selling spends base currency to acquire quote currency.
            OrderDirection::Sell => &self.base_currency,
        }
    }

    /// Currency received when trading in `direction` on this market.
    pub fn receiving_currency(&self, direction: OrderDirection) -> &str {
        match direction {
            OrderDirection::Buy => &self.base_currency,
            OrderDirection::Sell => &self.quote_currency,
        }
    }
}

/// A configured exchange account: venue kind, endpoint, and credentials.
/// Adapters are built from this record at the point of use and are never
/// stored on it.
#[derive(Debug, Clone)]
pub struct ExchangeAccount {
    pub id: i64,
    pub name: String,
    pub kind: ExchangeKind,
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    /// Required by Coinbase, unused by Bittrex.
    pub api_passphrase: Option<String>,
    pub user_id: i64,
    pub status: EntityStatus,
    pub created_at: DateTime<Utc>,
}

/// A trading strategy owning budgets and orders.
#[derive(Debug, Clone)]
pub struct Strategy {
    pub id: i64,
    pub name: String,
    pub guid: Uuid,
    pub user_id: i64,
    /// Currency the strategy accounts in (e.g. "USD").
    pub base_currency: String,
    pub status: EntityStatus,
    pub created_at: DateTime<Utc>,
}

/// An inbound alert from an external monitor. The core reads these but does
/// not own their lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub source_id: String,
    pub trigger_id: String,
    pub monitor_id: i64,
    pub severity: i32,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_results: i64,
    /// Restrict the reaction to one exchange kind.
    pub exchange: Option<ExchangeKind>,
    /// Currency symbol filter, e.g. "ETH".
    pub currency: Option<String>,
    /// Market symbol filter, e.g. "ETH-USD".
    pub market: Option<String>,
    /// When present the reaction places Limit orders at this price.
    pub price: Option<Decimal>,
}

/// A rule mapping an alert to an order: direction, percentage of the
/// available budget to commit (1-99), and time in force.
#[derive(Debug, Clone)]
pub struct Reaction {
    pub id: i64,
    pub monitor_id: i64,
    pub direction: OrderDirection,
    /// Percentage of available budget to commit, exclusive 0..100.
    pub amount: u8,
    pub time_in_force: OrderTimeInForce,
    pub status: EntityStatus,
    pub created_at: DateTime<Utc>,
}

/// Binds a monitor to a strategy and a reaction. Unique triple.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: i64,
    pub monitor_id: i64,
    pub strategy_id: i64,
    pub reaction_id: i64,
    pub created_at: DateTime<Utc>,
}

/// Exchange-reported balance snapshot for one currency. Informational;
/// the fund ledger never consults these.
#[derive(Debug, Clone)]
pub struct Balance {
    pub id: i64,
    pub currency: String,
    pub exchange_id: i64,
    pub available: Decimal,
    pub total: Decimal,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn budget_total_is_available_plus_reserved() {
        let budget = Budget {
            id: 1,
            currency: "USD".into(),
            exchange_id: 1,
            strategy_id: 1,
            available: dec!(60),
            reserved: dec!(40),
            updated_at: Utc::now(),
        };
        assert_eq!(budget.total(), dec!(100));
    }

    #[test]
    fn spending_currency_follows_direction() {
        let market = Market {
            id: 1,
            exchange_id: 1,
            symbol: "BTC-USD".into(),
            base_currency: "BTC".into(),
            quote_currency: "USD".into(),
            min_trade_size: dec!(0.0001),
            status: EntityStatus::Active,
            tags: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(market.spending_currency(OrderDirection::Buy), "USD");
        assert_eq!(market.receiving_currency(OrderDirection::Buy), "BTC");
        assert_eq!(market.spending_currency(OrderDirection::Sell), "BTC");
        assert_eq!(market.receiving_currency(OrderDirection::Sell), "USD");
    }

    #[test]
    fn order_status_rank_is_monotonic() {
        assert!(EntityStatus::New.order_rank() < EntityStatus::Active.order_rank());
        assert!(EntityStatus::Active.order_rank() < EntityStatus::Complete.order_rank());
        assert!(EntityStatus::Complete.order_rank() < EntityStatus::Settled.order_rank());
        assert!(EntityStatus::Settled.order_rank() < EntityStatus::Error.order_rank());
    }

    #[test]
    fn exchange_kind_round_trips_through_str() {
        assert_eq!(
            "bittrex".parse::<ExchangeKind>().unwrap(),
            ExchangeKind::Bittrex
        );
        assert_eq!(ExchangeKind::Coinbase.to_string(), "coinbase");
        assert!("kraken".parse::<ExchangeKind>().is_err());
    }

    #[test]
    fn round_amount_clamps_to_eight_places() {
        assert_eq!(round_amount(dec!(0.123456789)), dec!(0.12345679));
    }
}
