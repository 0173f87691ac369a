//! Scripted in-memory venue for engine tests.
//!
//! State lives behind an `RwLock` so tests can script responses and then
//! inspect what the engines did. The mock honors the adapter contract:
//! a scripted placement failure leaves no venue-side state behind.

use crate::domain::{Market, Order, OrderRequest};
use crate::error::AdapterError;
use crate::exchange::types::{
    ExchangeBalance, ExchangeMarket, ExchangeOrderState, Fill, PlacedOrder, Ticker,
};
use crate::exchange::{AdapterFactory, ExchangeAdapter};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

#[derive(Default)]
struct MockState {
    tickers: HashMap<String, Ticker>,
    balances: Vec<ExchangeBalance>,
    markets: Vec<ExchangeMarket>,
    /// source_id -> scripted fills
    fills: HashMap<String, Vec<Fill>>,
    /// source_id -> venue considers the order closed
    closed: HashMap<String, bool>,
    /// requests accepted by place_order, in submission order
    placed: Vec<OrderRequest>,
    fail_place_order: bool,
    fail_reads: bool,
}

/// In-memory exchange with scriptable responses.
#[derive(Default)]
pub struct MockExchange {
    state: RwLock<MockState>,
    next_order_id: AtomicU64,
}

impl MockExchange {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::RwLockWriteGuard<'_, MockState> {
        self.state.write().expect("mock state poisoned")
    }

    pub fn set_ticker(&self, symbol: &str, ticker: Ticker) {
        self.lock().tickers.insert(symbol.to_string(), ticker);
    }

    pub fn set_balances(&self, balances: Vec<ExchangeBalance>) {
        self.lock().balances = balances;
    }

    pub fn set_markets(&self, markets: Vec<ExchangeMarket>) {
        self.lock().markets = markets;
    }

    /// Script the fills returned for an order's source_id.
    pub fn set_fills(&self, source_id: &str, fills: Vec<Fill>) {
        self.lock().fills.insert(source_id.to_string(), fills);
    }

    /// Script whether the venue reports the order closed.
    pub fn set_order_closed(&self, source_id: &str, closed: bool) {
        self.lock().closed.insert(source_id.to_string(), closed);
    }

    /// Make every subsequent place_order call fail.
    pub fn fail_place_order(&self, fail: bool) {
        self.lock().fail_place_order = fail;
    }

    /// Make every subsequent read call fail.
    pub fn fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    /// Requests accepted so far, in submission order.
    pub fn placed_orders(&self) -> Vec<OrderRequest> {
        self.state
            .read()
            .expect("mock state poisoned")
            .placed
            .clone()
    }
}

#[async_trait]
impl ExchangeAdapter for MockExchange {
    async fn place_order(
        &self,
        request: &OrderRequest,
        _market: &Market,
    ) -> Result<PlacedOrder, AdapterError> {
        let mut state = self.lock();
        if state.fail_place_order {
            return Err(AdapterError::Timeout {
                endpoint: "orders".into(),
            });
        }
        state.placed.push(request.clone());
        let n = self.next_order_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(PlacedOrder {
            source_id: format!("mock-{n}"),
            open: true,
        })
    }

    async fn get_order(&self, order: &Order) -> Result<ExchangeOrderState, AdapterError> {
        let state = self.state.read().expect("mock state poisoned");
        if state.fail_reads {
            return Err(AdapterError::Timeout {
                endpoint: "orders".into(),
            });
        }
        Ok(ExchangeOrderState {
            source_id: order.source_id.clone(),
            closed: state.closed.get(&order.source_id).copied().unwrap_or(false),
            filled_quantity: None,
        })
    }

    async fn get_trades_by_order(&self, order: &Order) -> Result<Vec<Fill>, AdapterError> {
        let state = self.state.read().expect("mock state poisoned");
        if state.fail_reads {
            return Err(AdapterError::Timeout {
                endpoint: "fills".into(),
            });
        }
        Ok(state.fills.get(&order.source_id).cloned().unwrap_or_default())
    }

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, AdapterError> {
        let state = self.state.read().expect("mock state poisoned");
        if state.fail_reads {
            return Err(AdapterError::Timeout {
                endpoint: "ticker".into(),
            });
        }
        state
            .tickers
            .get(symbol)
            .copied()
            .ok_or_else(|| AdapterError::Response(format!("no scripted ticker for {symbol}")))
    }

    async fn get_balances(&self) -> Result<Vec<ExchangeBalance>, AdapterError> {
        let state = self.state.read().expect("mock state poisoned");
        if state.fail_reads {
            return Err(AdapterError::Timeout {
                endpoint: "balances".into(),
            });
        }
        Ok(state.balances.clone())
    }

    async fn get_markets(&self) -> Result<Vec<ExchangeMarket>, AdapterError> {
        let state = self.state.read().expect("mock state poisoned");
        if state.fail_reads {
            return Err(AdapterError::Timeout {
                endpoint: "markets".into(),
            });
        }
        Ok(state.markets.clone())
    }
}

/// Factory that hands every exchange the same mock venue.
pub struct MockAdapterFactory {
    venue: Arc<MockExchange>,
}

impl MockAdapterFactory {
    pub fn new(venue: Arc<MockExchange>) -> Self {
        Self { venue }
    }
}

impl AdapterFactory for MockAdapterFactory {
    fn build(
        &self,
        _account: &crate::domain::ExchangeAccount,
    ) -> Result<Arc<dyn ExchangeAdapter>, AdapterError> {
        Ok(Arc::clone(&self.venue) as Arc<dyn ExchangeAdapter>)
    }
}
