//! Reaction dispatcher: turn an inbound alert plus a reaction rule into
//! sized orders across candidate exchanges.
//!
//! Sizing is a percentage of the spending budget's available funds. Market
//! orders consult the live ticker only to derive an advisory base-asset
//! size; the ticker price is never stored as the order's price.

use crate::domain::{
    round_amount, Alert, EntityStatus, ExchangeAccount, Market, Order, OrderRequest, OrderType,
    Reaction, Strategy,
};
use crate::engine::orders::OrderOrchestrator;
use crate::error::{CoreError, CoreResult};
use crate::exchange::AdapterFactory;
use crate::store::Store;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// What happened on one candidate exchange.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// An order was submitted and persisted.
    Placed(Order),
    /// No order belongs on this exchange (no matching market, nothing to
    /// commit); not an error.
    Skipped(String),
    /// The attempt failed; other candidates still proceed.
    Failed(String),
}

/// Per-exchange outcomes of one reaction dispatch.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub outcomes: Vec<(i64, DispatchOutcome)>,
}

impl DispatchReport {
    pub fn placed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, DispatchOutcome::Placed(_)))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, DispatchOutcome::Failed(_)))
            .count()
    }
}

pub struct ReactionDispatcher {
    store: Arc<Store>,
    orchestrator: Arc<OrderOrchestrator>,
    adapters: Arc<dyn AdapterFactory>,
}

impl ReactionDispatcher {
    pub fn new(
        store: Arc<Store>,
        orchestrator: Arc<OrderOrchestrator>,
        adapters: Arc<dyn AdapterFactory>,
    ) -> Self {
        Self {
            store,
            orchestrator,
            adapters,
        }
    }

    /// Dispatch one reaction against one alert for one strategy. Candidate
    /// exchanges are the alert's exchange when given, otherwise every
    /// active exchange of the strategy's owner. Failures are recorded per
    /// candidate and never stop the rest.
    #[instrument(skip(self, alert))]
    pub async fn handle_reaction(
        &self,
        reaction_id: i64,
        strategy_id: i64,
        alert: &Alert,
    ) -> CoreResult<DispatchReport> {
        let reaction = self
            .store
            .reaction_by_id(reaction_id)?
            .ok_or_else(|| CoreError::not_found("reaction", reaction_id))?;
        if reaction.status != EntityStatus::Active {
            return Err(CoreError::Validation(format!(
                "reaction {reaction_id} is not active"
            )));
        }
        let strategy = self
            .store
            .strategy_by_id(strategy_id)?
            .ok_or_else(|| CoreError::not_found("strategy", strategy_id))?;
        self.store.create_alert(alert)?;

        let exchanges: Vec<ExchangeAccount> = match alert.exchange {
            Some(kind) => self
                .store
                .active_exchange_by_user_kind(strategy.user_id, kind)?
                .into_iter()
                .collect(),
            None => self.store.active_exchanges_by_user(strategy.user_id)?,
        };
        if exchanges.is_empty() {
            return Err(CoreError::not_found("exchange", "no active candidates"));
        }

        let mut report = DispatchReport::default();
        for exchange in exchanges {
            let outcome = match self
                .dispatch_one(&exchange, &strategy, &reaction, alert)
                .await
            {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(exchange_id = exchange.id, error = %err, "dispatch failed");
                    DispatchOutcome::Failed(err.to_string())
                }
            };
            report.outcomes.push((exchange.id, outcome));
        }
        info!(
            placed = report.placed(),
            failed = report.failed(),
            candidates = report.outcomes.len(),
            "reaction dispatched"
        );
        Ok(report)
    }

    async fn dispatch_one(
        &self,
        exchange: &ExchangeAccount,
        strategy: &Strategy,
        reaction: &Reaction,
        alert: &Alert,
    ) -> CoreResult<DispatchOutcome> {
        let Some(market) = self.resolve_market(exchange, strategy, alert)? else {
            return Ok(DispatchOutcome::Skipped(
                "no matching market on this exchange".into(),
            ));
        };

        let order_type = if alert.price.is_some() {
            OrderType::Limit
        } else {
            OrderType::Market
        };
        let spending = market.spending_currency(reaction.direction);
        let Some(budget) = self
            .store
            .budget_by_key(spending, exchange.id, strategy.id)?
        else {
            return Ok(DispatchOutcome::Skipped(format!(
                "no {spending} budget on this exchange"
            )));
        };

        let quantity =
            round_amount(budget.available * Decimal::from(reaction.amount) / Decimal::from(100u8));
        if quantity <= Decimal::ZERO {
            return Ok(DispatchOutcome::Skipped(format!(
                "no available {spending} to commit"
            )));
        }

        let mut request = OrderRequest::new(
            strategy.id,
            market.id,
            reaction.direction,
            order_type,
        );
        request.quantity = quantity;
        request.price = alert.price;
        request.time_in_force = reaction.time_in_force;
        request.base_quantity = self
            .advisory_base_quantity(exchange, &market, &request)
            .await?;

        let order = self.orchestrator.place_order(&request).await?;
        Ok(DispatchOutcome::Placed(order))
    }

    /// Market buys need a base-asset size for venues that cannot take a
    /// quote amount; derive it from the live ticker. The result is advisory
    /// only and never becomes the order's price.
    async fn advisory_base_quantity(
        &self,
        exchange: &ExchangeAccount,
        market: &Market,
        request: &OrderRequest,
    ) -> CoreResult<Option<Decimal>> {
        if request.order_type != OrderType::Market
            || request.direction != crate::domain::OrderDirection::Buy
        {
            return Ok(None);
        }
        let adapter = self.adapters.build(exchange)?;
        let ticker = adapter.get_ticker(&market.symbol).await?;
        if ticker.price.is_zero() {
            return Err(CoreError::Validation(format!(
                "ticker price for {} is zero",
                market.symbol
            )));
        }
        Ok(Some(round_amount(request.quantity / ticker.price)))
    }

    fn resolve_market(
        &self,
        exchange: &ExchangeAccount,
        strategy: &Strategy,
        alert: &Alert,
    ) -> CoreResult<Option<Market>> {
        if let Some(symbol) = &alert.market {
            return self.store.market_by_exchange_symbol(exchange.id, symbol);
        }
        if let Some(currency) = &alert.currency {
            return self
                .store
                .market_by_base_quote(exchange.id, currency, &strategy.base_currency);
        }
        Err(CoreError::Validation(
            "alert names neither a market nor a currency".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExchangeKind, OrderDirection, OrderTimeInForce};
    use crate::exchange::mock::{MockAdapterFactory, MockExchange};
    use crate::exchange::types::Ticker;
    use crate::ledger::FundLedger;
    use crate::store::{MarketSpec, NewExchange};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    struct Fixture {
        store: Arc<Store>,
        ledger: Arc<FundLedger>,
        venue: Arc<MockExchange>,
        dispatcher: ReactionDispatcher,
        exchange_id: i64,
        strategy_id: i64,
        reaction_id: i64,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(Store::in_memory().unwrap());
        let exchange = store
            .create_exchange(&NewExchange {
                name: "mock".into(),
                kind: ExchangeKind::Coinbase,
                base_url: "https://api.example.test".into(),
                api_key: "k".into(),
                api_secret: "s".into(),
                api_passphrase: Some("p".into()),
                user_id: 1,
            })
            .unwrap();
        let strategy = store.create_strategy("momentum", 1, "USD").unwrap();
        store
            .upsert_market(&MarketSpec {
                exchange_id: exchange.id,
                symbol: "ETH-USD".into(),
                base_currency: "ETH".into(),
                quote_currency: "USD".into(),
                min_trade_size: dec!(0.001),
                status: EntityStatus::Active,
                tags: vec![],
            })
            .unwrap();
        let reaction = store
            .create_reaction(
                7,
                OrderDirection::Buy,
                50,
                OrderTimeInForce::GoodTilCancelled,
            )
            .unwrap();
        let ledger = Arc::new(FundLedger::new(Arc::clone(&store)));
        let venue = MockExchange::new();
        let factory: Arc<dyn AdapterFactory> =
            Arc::new(MockAdapterFactory::new(Arc::clone(&venue)));
        let orchestrator = Arc::new(OrderOrchestrator::new(
            Arc::clone(&store),
            Arc::clone(&ledger),
            Arc::clone(&factory),
        ));
        let dispatcher =
            ReactionDispatcher::new(Arc::clone(&store), orchestrator, Arc::clone(&factory));
        Fixture {
            store,
            ledger,
            venue,
            dispatcher,
            exchange_id: exchange.id,
            strategy_id: strategy.id,
            reaction_id: reaction.id,
        }
    }

    fn alert(currency: Option<&str>, price: Option<rust_decimal::Decimal>) -> Alert {
        Alert {
            source_id: "alert-1".into(),
            trigger_id: "trigger-1".into(),
            monitor_id: 7,
            severity: 3,
            period_start: Utc::now(),
            period_end: Utc::now(),
            total_results: 12,
            exchange: None,
            currency: currency.map(|c| c.to_string()),
            market: None,
            price,
        }
    }

    fn fund_usd(f: &Fixture, amount: rust_decimal::Decimal) -> i64 {
        let budget = f
            .ledger
            .ensure_budget("USD", f.exchange_id, f.strategy_id)
            .unwrap();
        f.ledger.debit(budget.id, amount).unwrap();
        budget.id
    }

    #[tokio::test]
    async fn market_order_sized_from_budget_at_live_ticker() {
        let f = fixture();
        fund_usd(&f, dec!(1000));
        f.venue.set_ticker(
            "ETH-USD",
            Ticker {
                price: dec!(2000),
                bid: dec!(1999),
                ask: dec!(2001),
            },
        );

        // reaction commits 50% of the available 1000 USD
        let report = f
            .dispatcher
            .handle_reaction(f.reaction_id, f.strategy_id, &alert(Some("ETH"), None))
            .await
            .unwrap();
        assert_eq!(report.placed(), 1);

        let placed = f.venue.placed_orders();
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].quantity, dec!(500));
        assert_eq!(placed[0].order_type, OrderType::Market);
        // advisory size from the ticker: 500 USD / 2000 = 0.25 ETH
        assert_eq!(placed[0].base_quantity, Some(dec!(0.25)));
        // the ticker price is never stored as the order's price
        assert_eq!(placed[0].price, None);
        let order = f.store.open_orders().unwrap().pop().unwrap();
        assert_eq!(order.price, None);
        assert_eq!(order.quantity, dec!(500));
    }

    #[tokio::test]
    async fn alert_price_makes_it_a_limit_order() {
        let f = fixture();
        fund_usd(&f, dec!(1000));

        let report = f
            .dispatcher
            .handle_reaction(
                f.reaction_id,
                f.strategy_id,
                &alert(Some("ETH"), Some(dec!(1800))),
            )
            .await
            .unwrap();
        assert_eq!(report.placed(), 1);
        let placed = f.venue.placed_orders();
        assert_eq!(placed[0].order_type, OrderType::Limit);
        assert_eq!(placed[0].price, Some(dec!(1800)));
        // no ticker was needed for the limit path
    }

    #[tokio::test]
    async fn exchange_without_the_market_is_skipped() {
        let f = fixture();
        fund_usd(&f, dec!(1000));

        let report = f
            .dispatcher
            .handle_reaction(f.reaction_id, f.strategy_id, &alert(Some("DOGE"), None))
            .await
            .unwrap();
        assert_eq!(report.placed(), 0);
        assert!(matches!(
            report.outcomes[0].1,
            DispatchOutcome::Skipped(_)
        ));
        assert!(f.venue.placed_orders().is_empty());
    }

    #[tokio::test]
    async fn empty_budget_commits_nothing() {
        let f = fixture();
        fund_usd(&f, dec!(0));

        let report = f
            .dispatcher
            .handle_reaction(f.reaction_id, f.strategy_id, &alert(Some("ETH"), None))
            .await
            .unwrap();
        assert!(matches!(
            report.outcomes[0].1,
            DispatchOutcome::Skipped(_)
        ));
        assert!(f.venue.placed_orders().is_empty());
    }

    #[tokio::test]
    async fn candidate_failure_is_recorded_not_fatal() {
        let f = fixture();
        fund_usd(&f, dec!(1000));
        // no scripted ticker: the market-buy sizing read will fail
        let report = f
            .dispatcher
            .handle_reaction(f.reaction_id, f.strategy_id, &alert(Some("ETH"), None))
            .await
            .unwrap();
        assert_eq!(report.failed(), 1);
        assert!(f.venue.placed_orders().is_empty());
    }
}
