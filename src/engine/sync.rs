//! Exchange sync: refresh balance snapshots and market listings.
//!
//! Both refreshes are bulk upserts; a single bad item is logged and
//! counted, never fatal to the rest of the batch.

use crate::error::{CoreError, CoreResult};
use crate::exchange::AdapterFactory;
use crate::store::{MarketSpec, Store};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Counts for one sync batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncReport {
    pub updated: usize,
    pub failed: usize,
}

impl SyncReport {
    fn absorb(&mut self, other: SyncReport) {
        self.updated += other.updated;
        self.failed += other.failed;
    }
}

pub struct ExchangeSync {
    store: Arc<Store>,
    adapters: Arc<dyn AdapterFactory>,
}

impl ExchangeSync {
    pub fn new(store: Arc<Store>, adapters: Arc<dyn AdapterFactory>) -> Self {
        Self { store, adapters }
    }

    /// Pull wallet balances and upsert one snapshot row per currency.
    #[instrument(skip(self))]
    pub async fn refresh_exchange_balances(&self, exchange_id: i64) -> CoreResult<SyncReport> {
        let exchange = self
            .store
            .exchange_by_id(exchange_id)?
            .ok_or_else(|| CoreError::not_found("exchange", exchange_id))?;
        let adapter = self.adapters.build(&exchange)?;
        let balances = adapter.get_balances().await?;

        let mut report = SyncReport::default();
        for balance in balances {
            match self.store.upsert_balance(
                &balance.symbol,
                exchange.id,
                balance.available,
                balance.total,
            ) {
                Ok(()) => report.updated += 1,
                Err(err) => {
                    warn!(symbol = %balance.symbol, error = %err, "balance upsert failed");
                    report.failed += 1;
                }
            }
        }
        info!(exchange_id, updated = report.updated, failed = report.failed, "balances refreshed");
        Ok(report)
    }

    /// Pull the venue's market list and upsert rows keyed by
    /// (exchange, symbol), carrying the venue-mapped status.
    #[instrument(skip(self))]
    pub async fn refresh_exchange_markets(&self, exchange_id: i64) -> CoreResult<SyncReport> {
        let exchange = self
            .store
            .exchange_by_id(exchange_id)?
            .ok_or_else(|| CoreError::not_found("exchange", exchange_id))?;
        let adapter = self.adapters.build(&exchange)?;
        let markets = adapter.get_markets().await?;

        let mut report = SyncReport::default();
        for market in markets {
            let spec = MarketSpec {
                exchange_id: exchange.id,
                symbol: market.symbol.clone(),
                base_currency: market.base_currency,
                quote_currency: market.quote_currency,
                min_trade_size: market.min_trade_size,
                status: market.status,
                tags: market.tags,
            };
            match self.store.upsert_market(&spec) {
                Ok(_) => report.updated += 1,
                Err(err) => {
                    warn!(symbol = %spec.symbol, error = %err, "market upsert failed");
                    report.failed += 1;
                }
            }
        }
        info!(exchange_id, updated = report.updated, failed = report.failed, "markets refreshed");
        Ok(report)
    }

    /// Refresh markets for every active exchange. A whole exchange failing
    /// counts as one failure; the walk continues.
    #[instrument(skip(self))]
    pub async fn refresh_all_markets(&self) -> CoreResult<SyncReport> {
        let mut report = SyncReport::default();
        for exchange in self.store.all_active_exchanges()? {
            match self.refresh_exchange_markets(exchange.id).await {
                Ok(batch) => report.absorb(batch),
                Err(err) => {
                    warn!(exchange_id = exchange.id, error = %err, "market refresh failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}
