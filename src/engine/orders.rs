//! Order orchestrator: budget lock, venue submission, persistence.
//!
//! Placement is all-or-nothing from the caller's perspective: funds are
//! locked before the venue is called, and a venue failure releases the
//! lock before the error propagates. No Order row exists unless the venue
//! accepted the order.

use crate::domain::{BudgetResult, EntityStatus, Order, OrderRequest, OrderType};
use crate::error::{CoreError, CoreResult};
use crate::exchange::AdapterFactory;
use crate::ledger::FundLedger;
use crate::store::Store;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

pub struct OrderOrchestrator {
    store: Arc<Store>,
    ledger: Arc<FundLedger>,
    adapters: Arc<dyn AdapterFactory>,
}

impl OrderOrchestrator {
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

    /// Place an order: resolve market, exchange, and spending budget, lock
    /// the committed amount, submit to the venue, persist the order.
    ///
    /// Placement is idempotent by `order_guid`: a replayed request returns
    /// the already-placed order without locking funds or contacting the
    /// venue again.
    ///
    /// A refused lock aborts before the venue is contacted. A venue failure
    /// releases the lock before returning, so funds are never left reserved
    /// against an order that does not exist.
    #[instrument(skip(self, request), fields(order_guid = %request.order_guid))]
    pub async fn place_order(&self, request: &OrderRequest) -> CoreResult<Order> {
        if request.quantity <= Decimal::ZERO {
            return Err(CoreError::Validation(format!(
                "order quantity must be positive, got {}",
                request.quantity
            )));
        }
        if request.order_type == OrderType::Limit && request.price.is_none() {
            return Err(CoreError::Validation("limit order needs a price".into()));
        }

        // replayed work items carry the same order_guid; the first successful
        // placement wins and every replay returns it untouched
        if let Some(existing) = self.store.order_by_guid(request.order_guid)? {
            info!(
                order_id = existing.id,
                source_id = %existing.source_id,
                "request already placed, returning existing order"
            );
            return Ok(existing);
        }

        let market = self
            .store
            .market_by_id(request.market_id)?
            .ok_or_else(|| CoreError::not_found("market", request.market_id))?;
        let exchange = self
            .store
            .exchange_by_id(market.exchange_id)?
            .ok_or_else(|| CoreError::not_found("exchange", market.exchange_id))?;

        let currency = market.spending_currency(request.direction);
        let budget = self
            .store
            .budget_by_key(currency, exchange.id, request.strategy_id)?
            .ok_or_else(|| {
                CoreError::not_found(
                    "budget",
                    format!("{currency}/{}/{}", exchange.id, request.strategy_id),
                )
            })?;

        let lock = self.ledger.lock(budget.id, request.quantity)?;
        if lock != BudgetResult::Success {
            warn!(budget_id = budget.id, %lock, "lock refused, aborting placement");
            return Err(CoreError::Ledger(lock));
        }

        let adapter = self.adapters.build(&exchange)?;
        let placed = match adapter.place_order(request, &market).await {
            Ok(placed) => placed,
            Err(err) => {
                // the venue has nothing; the lock must not outlive this call
                match self.ledger.unlock(budget.id, request.quantity) {
                    Ok(BudgetResult::Success) => {
                        warn!(budget_id = budget.id, "placement failed, lock released");
                    }
                    Ok(other) => {
                        error!(
                            budget_id = budget.id,
                            result = %other,
                            "compensating unlock refused, funds may remain reserved"
                        );
                    }
                    Err(storage) => {
                        error!(
                            budget_id = budget.id,
                            error = %storage,
                            "compensating unlock failed, funds may remain reserved"
                        );
                    }
                }
                return Err(err.into());
            }
        };

        let order = match self
            .store
            .create_order(request, &placed.source_id, EntityStatus::New)
        {
            Ok(order) => order,
            Err(err) => {
                error!(
                    source_id = %placed.source_id,
                    error = %err,
                    "venue accepted the order but persisting it failed"
                );
                if let Err(unlock_err) = self.ledger.unlock(budget.id, request.quantity) {
                    error!(
                        budget_id = budget.id,
                        error = %unlock_err,
                        "compensating unlock failed, funds may remain reserved"
                    );
                }
                return Err(err);
            }
        };
        info!(
            order_id = order.id,
            source_id = %order.source_id,
            market = %market.symbol,
            %currency,
            quantity = %request.quantity,
            "order placed"
        );
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExchangeKind, OrderDirection};
    use crate::exchange::mock::{MockAdapterFactory, MockExchange};
    use crate::store::{MarketSpec, NewExchange};
    use rust_decimal_macros::dec;

    struct Fixture {
        store: Arc<Store>,
        venue: Arc<MockExchange>,
        orchestrator: OrderOrchestrator,
        market_id: i64,
        strategy_id: i64,
        usd_budget: i64,
    }

    fn fixture(usd_available: Decimal) -> Fixture {
        let store = Arc::new(Store::in_memory().unwrap());
        let exchange = store
            .create_exchange(&NewExchange {
                name: "mock".into(),
                kind: ExchangeKind::Bittrex,
                base_url: "https://api.example.test".into(),
                api_key: "k".into(),
                api_secret: "s".into(),
                api_passphrase: None,
                user_id: 1,
            })
            .unwrap();
        let strategy = store.create_strategy("s", 1, "USD").unwrap();
        let market = store
            .upsert_market(&MarketSpec {
                exchange_id: exchange.id,
                symbol: "BTC-USD".into(),
                base_currency: "BTC".into(),
                quote_currency: "USD".into(),
                min_trade_size: dec!(0.0001),
                status: EntityStatus::Active,
                tags: vec![],
            })
            .unwrap();
        let ledger = Arc::new(FundLedger::new(Arc::clone(&store)));
        let budget = ledger
            .ensure_budget("USD", exchange.id, strategy.id)
            .unwrap();
        if usd_available > Decimal::ZERO {
            ledger.debit(budget.id, usd_available).unwrap();
        }
        let venue = MockExchange::new();
        let orchestrator = OrderOrchestrator::new(
            Arc::clone(&store),
            Arc::clone(&ledger),
            Arc::new(MockAdapterFactory::new(Arc::clone(&venue))),
        );
        Fixture {
            store,
            venue,
            orchestrator,
            market_id: market.id,
            strategy_id: strategy.id,
            usd_budget: budget.id,
        }
    }

    fn buy_request(f: &Fixture, quantity: Decimal, price: Option<Decimal>) -> OrderRequest {
        let order_type = if price.is_some() {
            OrderType::Limit
        } else {
            OrderType::Market
        };
        let mut request =
            OrderRequest::new(f.strategy_id, f.market_id, OrderDirection::Buy, order_type);
        request.quantity = quantity;
        request.price = price;
        request
    }

    fn budget_state(f: &Fixture) -> (Decimal, Decimal) {
        let b = f.store.budget_by_id(f.usd_budget).unwrap().unwrap();
        (b.available, b.reserved)
    }

    #[tokio::test]
    async fn placement_locks_funds_and_persists_order() {
        let f = fixture(dec!(500));
        let request = buy_request(&f, dec!(300), Some(dec!(30000)));

        let order = f.orchestrator.place_order(&request).await.unwrap();
        assert_eq!(order.source_id, "mock-1");
        assert_eq!(order.status, EntityStatus::New);
        assert_eq!(budget_state(&f), (dec!(200), dec!(300)));
        assert_eq!(f.venue.placed_orders().len(), 1);
    }

    #[tokio::test]
    async fn replaying_the_same_request_places_nothing_twice() {
        let f = fixture(dec!(500));
        let request = buy_request(&f, dec!(300), Some(dec!(30000)));

        let first = f.orchestrator.place_order(&request).await.unwrap();
        // a re-enqueued work item carries the identical request
        let second = f.orchestrator.place_order(&request).await.unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.source_id, first.source_id);
        assert_eq!(f.venue.placed_orders().len(), 1);
        assert_eq!(f.store.open_orders().unwrap().len(), 1);
        // the replay locked nothing on top of the original
        assert_eq!(budget_state(&f), (dec!(200), dec!(300)));
    }

    #[tokio::test]
    async fn insufficient_funds_aborts_before_the_venue() {
        // buy of 0.01 BTC at 30000 needs 300 USD locked; only 250 available
        let f = fixture(dec!(250));
        let request = buy_request(&f, dec!(300), Some(dec!(30000)));

        let err = f.orchestrator.place_order(&request).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::Ledger(BudgetResult::InsufficientFunds)
        ));
        assert!(f.venue.placed_orders().is_empty());
        assert!(f.store.open_orders().unwrap().is_empty());
        assert_eq!(budget_state(&f), (dec!(250), dec!(0)));
    }

    #[tokio::test]
    async fn venue_failure_releases_the_lock() {
        let f = fixture(dec!(500));
        f.venue.fail_place_order(true);
        let request = buy_request(&f, dec!(300), Some(dec!(30000)));

        let err = f.orchestrator.place_order(&request).await.unwrap_err();
        assert!(matches!(err, CoreError::Adapter(_)));
        assert!(f.store.open_orders().unwrap().is_empty());
        // the compensating unlock restored the budget exactly
        assert_eq!(budget_state(&f), (dec!(500), dec!(0)));
    }

    #[tokio::test]
    async fn missing_budget_aborts_with_not_found() {
        let f = fixture(dec!(500));
        // sells spend BTC and no BTC budget exists
        let mut request = OrderRequest::new(
            f.strategy_id,
            f.market_id,
            OrderDirection::Sell,
            OrderType::Market,
        );
        request.quantity = dec!(1);

        let err = f.orchestrator.place_order(&request).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound { entity: "budget", .. }));
        assert!(f.venue.placed_orders().is_empty());
    }

    #[tokio::test]
    async fn malformed_requests_are_rejected_before_any_mutation() {
        let f = fixture(dec!(500));
        let request = buy_request(&f, dec!(0), Some(dec!(30000)));
        assert!(matches!(
            f.orchestrator.place_order(&request).await.unwrap_err(),
            CoreError::Validation(_)
        ));

        let request = buy_request(&f, dec!(100), None);
        let mut limit_without_price = request.clone();
        limit_without_price.order_type = OrderType::Limit;
        assert!(matches!(
            f.orchestrator
                .place_order(&limit_without_price)
                .await
                .unwrap_err(),
            CoreError::Validation(_)
        ));
        assert_eq!(budget_state(&f), (dec!(500), dec!(0)));
    }
}
