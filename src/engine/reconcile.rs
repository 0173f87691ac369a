//! Reconciliation engine: pull fills for open orders and settle them
//! exactly once.
//!
//! Each pass walks every order with status New or Active, fetches venue
//! state and executions, and settles each fill atomically through the
//! ledger. Per-order failures are isolated; the pass reports a per-order
//! outcome instead of stopping.

use crate::domain::{EntityStatus, Market, Order};
use crate::error::{CoreError, CoreResult};
use crate::exchange::AdapterFactory;
use crate::ledger::{FillSettlement, FundLedger, SettleOutcome};
use crate::store::Store;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// What happened to one order during a reconciliation pass.
#[derive(Debug, Clone)]
pub struct OrderOutcome {
    pub order_id: i64,
    pub applied: usize,
    pub duplicates: usize,
    pub failed: usize,
    /// The order advanced to Complete in this pass.
    pub completed: bool,
    /// The order could not be reconciled at all.
    pub error: Option<String>,
}

impl OrderOutcome {
    fn new(order_id: i64) -> Self {
        Self {
            order_id,
            applied: 0,
            duplicates: 0,
            failed: 0,
            completed: false,
            error: None,
        }
    }

    fn errored(order_id: i64, error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::new(order_id)
        }
    }
}

/// Per-order outcomes of one reconciliation pass.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub orders: Vec<OrderOutcome>,
}

impl ReconcileReport {
    pub fn total_applied(&self) -> usize {
        self.orders.iter().map(|o| o.applied).sum()
    }

    pub fn total_failed(&self) -> usize {
        self.orders
            .iter()
            .map(|o| o.failed + usize::from(o.error.is_some()))
            .sum()
    }
}

pub struct ReconciliationEngine {
    store: Arc<Store>,
    ledger: Arc<FundLedger>,
    adapters: Arc<dyn AdapterFactory>,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<Store>,
        ledger: Arc<FundLedger>,
        adapters: Arc<dyn AdapterFactory>,
    ) -> Self {
        Self {
            store,
            ledger,
            adapters,
        }
    }

    /// Reconcile every open order. One order's failure never blocks the
    /// rest of the pass.
    #[instrument(skip(self))]
    pub async fn refresh_open_orders(&self) -> CoreResult<ReconcileReport> {
        let orders = self.store.open_orders()?;
        let mut report = ReconcileReport::default();
        for order in orders {
            let outcome = match self.reconcile_order(&order).await {
                Ok(outcome) => outcome,
                Err(CoreError::Consistency(message)) => {
                    // a corrupted ledger row is fatal for this order; park it
                    // in Error so no further pass touches it automatically
                    error!(order_id = order.id, %message, "consistency violation, halting order");
                    self.store
                        .advance_order_status(order.id, EntityStatus::Error)?;
                    OrderOutcome::errored(order.id, message)
                }
                Err(err) => {
                    warn!(order_id = order.id, error = %err, "order reconciliation failed");
                    OrderOutcome::errored(order.id, err.to_string())
                }
            };
            report.orders.push(outcome);
        }
        info!(
            orders = report.orders.len(),
            applied = report.total_applied(),
            failed = report.total_failed(),
            "reconciliation pass finished"
        );
        Ok(report)
    }

    async fn reconcile_order(&self, order: &Order) -> CoreResult<OrderOutcome> {
        let market = self
            .store
            .market_by_id(order.market_id)?
            .ok_or_else(|| CoreError::not_found("market", order.market_id))?;
        let exchange = self
            .store
            .exchange_by_id(market.exchange_id)?
            .ok_or_else(|| CoreError::not_found("exchange", market.exchange_id))?;
        let adapter = self.adapters.build(&exchange)?;

        let state = adapter.get_order(order).await?;
        let fills = adapter.get_trades_by_order(order).await?;

        let mut outcome = OrderOutcome::new(order.id);
        if !fills.is_empty() {
            let (credit_budget, debit_budget) =
                self.settlement_budgets(order, &market, exchange.id)?;
            for fill in &fills {
                let settlement = FillSettlement {
                    source_id: fill.source_id.clone(),
                    order_id: order.id,
                    is_taker: fill.is_taker,
                    spent: fill.price,
                    received: fill.quantity,
                    fee: fill.fee,
                    executed_at: fill.executed_at,
                };
                match self
                    .ledger
                    .settle_fill(credit_budget, debit_budget, &settlement)?
                {
                    SettleOutcome::Applied => outcome.applied += 1,
                    SettleOutcome::Duplicate => outcome.duplicates += 1,
                    SettleOutcome::Rejected(result) => {
                        warn!(
                            order_id = order.id,
                            source_id = %fill.source_id,
                            %result,
                            "fill rejected, left unprocessed for retry"
                        );
                        outcome.failed += 1;
                    }
                }
            }
        }

        if outcome.failed == 0 && state.closed {
            self.store
                .advance_order_status(order.id, EntityStatus::Complete)?;
            outcome.completed = true;
        } else if !state.closed && order.status == EntityStatus::New {
            // the venue acknowledged the order as working
            self.store
                .advance_order_status(order.id, EntityStatus::Active)?;
        }
        Ok(outcome)
    }

    /// Budgets for the two legs of this order's fills: the spending
    /// currency's reserve is credited, the receiving currency's balance is
    /// debited. Both are created lazily.
    fn settlement_budgets(
        &self,
        order: &Order,
        market: &Market,
        exchange_id: i64,
    ) -> CoreResult<(i64, i64)> {
        let credit = self.ledger.ensure_budget(
            market.spending_currency(order.direction),
            exchange_id,
            order.strategy_id,
        )?;
        let debit = self.ledger.ensure_budget(
            market.receiving_currency(order.direction),
            exchange_id,
            order.strategy_id,
        )?;
        Ok((credit.id, debit.id))
    }
}
