//! Exchange adapters: one capability interface, one implementation per venue.
//!
//! Adapters are cheap and stateless apart from an HTTP client; they are
//! built at the point of use from an [`ExchangeAccount`] record via
//! [`build_adapter`] and never stored on entities. The [`AdapterFactory`]
//! seam lets tests swap in the in-memory mock venue.

pub mod bittrex;
pub mod coinbase;
pub mod mock;
pub mod types;

use crate::domain::{
    round_amount, ExchangeAccount, ExchangeKind, Market, Order, OrderDirection, OrderRequest,
};
use crate::error::AdapterError;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

use types::{ExchangeBalance, ExchangeMarket, ExchangeOrderState, Fill, PlacedOrder, Ticker};

/// Capability interface implemented once per venue.
///
/// Reads (`get_*`) are idempotent and may be retried; `place_order` is
/// never retried by the adapter.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Submit an order. A failure means nothing was placed as far as the
    /// caller can tell; the caller is responsible for releasing any funds
    /// it locked for this order.
    async fn place_order(
        &self,
        request: &OrderRequest,
        market: &Market,
    ) -> Result<PlacedOrder, AdapterError>;

    /// Current state of a previously submitted order.
    async fn get_order(&self, order: &Order) -> Result<ExchangeOrderState, AdapterError>;

    /// All executions reported against a previously submitted order,
    /// normalized to spending/receiving amounts per the order's direction.
    async fn get_trades_by_order(&self, order: &Order) -> Result<Vec<Fill>, AdapterError>;

    /// Best-price snapshot for one market symbol.
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, AdapterError>;

    /// Wallet balances for every currency the account holds.
    async fn get_balances(&self) -> Result<Vec<ExchangeBalance>, AdapterError>;

    /// Every market the venue lists.
    async fn get_markets(&self) -> Result<Vec<ExchangeMarket>, AdapterError>;
}

/// Builds adapters from exchange records. Implemented by the live factory
/// and by test factories that hand out mock venues.
pub trait AdapterFactory: Send + Sync {
    fn build(&self, account: &ExchangeAccount) -> Result<Arc<dyn ExchangeAdapter>, AdapterError>;
}

/// Factory for the real venue adapters, keyed by [`ExchangeKind`].
pub struct LiveAdapterFactory;

impl AdapterFactory for LiveAdapterFactory {
    fn build(&self, account: &ExchangeAccount) -> Result<Arc<dyn ExchangeAdapter>, AdapterError> {
        build_adapter(account)
    }
}

/// Build the adapter for an exchange account.
pub fn build_adapter(
    account: &ExchangeAccount,
) -> Result<Arc<dyn ExchangeAdapter>, AdapterError> {
    match account.kind {
        ExchangeKind::Bittrex => Ok(Arc::new(bittrex::BittrexAdapter::new(account)?)),
        ExchangeKind::Coinbase => Ok(Arc::new(coinbase::CoinbaseAdapter::new(account)?)),
    }
}

/// Run an idempotent read, retrying once on transient failure.
pub(crate) async fn retry_read<T, F, Fut>(op: F) -> Result<T, AdapterError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, AdapterError>>,
{
    match op().await {
        Ok(value) => Ok(value),
        Err(err) if err.is_retryable() => {
            warn!(error = %err, "read failed, retrying once");
            op().await
        }
        Err(err) => Err(err),
    }
}

/// Convert a venue (rate, base size) execution into spending/receiving
/// amounts for the given order direction.
///
/// Buying consumes `rate * size` of the quote currency and produces `size`
/// of the base; selling consumes `size` of the base and produces
/// `rate * size` of the quote.
pub(crate) fn spend_receive(
    direction: OrderDirection,
    rate: Decimal,
    size: Decimal,
) -> (Decimal, Decimal) {
    let notional = round_amount(rate * size);
    match direction {
        OrderDirection::Buy => (notional, size),
        OrderDirection::Sell => (size, notional),
    }
}
