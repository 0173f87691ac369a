//! Fund ledger: atomic budget primitives and trade-fill settlement.
//!
//! Budgets track `available` (spendable) and `reserved` (earmarked for open
//! orders) per (currency, exchange, strategy) triple. The four primitives:
//!
//! - `lock`: available -> reserved, earmarking funds for an order
//! - `unlock`: reserved -> available, reversing a lock
//! - `credit`: reserved shrinks, recording locked funds actually spent
//! - `debit`: available grows, recording counter-currency received
//!
//! Each primitive is a single read-check-write transaction. After every
//! call: available >= 0, reserved >= 0, total = available + reserved.
//!
//! `settle_fill` applies the credit leg, the debit leg, and the Trade insert
//! of one exchange fill in ONE transaction; either everything lands or
//! nothing does. Duplicate fills (same `source_id`) are detected inside the
//! same transaction and reported without effect.

use crate::domain::{round_amount, Budget, BudgetResult};
use crate::error::{CoreError, CoreResult};
use crate::store::{budget_from_row, Store};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// One exchange-reported fill, reduced to its ledger effect.
///
/// `spent` is the amount of spending currency consumed (credit leg),
/// `received` the amount of counter currency produced (debit leg).
#[derive(Debug, Clone)]
pub struct FillSettlement {
    pub source_id: String,
    pub order_id: i64,
    pub is_taker: bool,
    pub spent: Decimal,
    pub received: Decimal,
    pub fee: Decimal,
    pub executed_at: DateTime<Utc>,
}

/// Result of attempting to settle one fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    /// Both ledger legs and the Trade row were committed.
    Applied,
    /// A Trade with this source_id already exists; nothing was changed.
    Duplicate,
    /// A ledger leg refused the fill; the whole fill was rolled back.
    Rejected(BudgetResult),
}

enum Primitive {
    Lock,
    Unlock,
    Credit,
    Debit,
}

impl Primitive {
    fn name(&self) -> &'static str {
        match self {
            Primitive::Lock => "lock",
            Primitive::Unlock => "unlock",
            Primitive::Credit => "credit",
            Primitive::Debit => "debit",
        }
    }
}

/// Atomic budget operations over the shared store.
pub struct FundLedger {
    store: Arc<Store>,
}

impl FundLedger {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Move `amount` from available to reserved, earmarking it for an order.
    #[instrument(skip(self))]
    pub fn lock(&self, budget_id: i64, amount: Decimal) -> CoreResult<BudgetResult> {
        self.mutate(budget_id, amount, Primitive::Lock)
    }

    /// Reverse a prior lock: reserved back to available. Used when an order
    /// is cancelled or was never accepted by the exchange.
    #[instrument(skip(self))]
    pub fn unlock(&self, budget_id: i64, amount: Decimal) -> CoreResult<BudgetResult> {
        self.mutate(budget_id, amount, Primitive::Unlock)
    }

    /// Record that previously locked funds were spent: reserved -= amount.
    #[instrument(skip(self))]
    pub fn credit(&self, budget_id: i64, amount: Decimal) -> CoreResult<BudgetResult> {
        self.mutate(budget_id, amount, Primitive::Credit)
    }

    /// Record newly received funds: available += amount. Succeeds for any
    /// amount >= 0.
    #[instrument(skip(self))]
    pub fn debit(&self, budget_id: i64, amount: Decimal) -> CoreResult<BudgetResult> {
        self.mutate(budget_id, amount, Primitive::Debit)
    }

    fn mutate(
        &self,
        budget_id: i64,
        amount: Decimal,
        primitive: Primitive,
    ) -> CoreResult<BudgetResult> {
        if budget_id <= 0 {
            return Ok(BudgetResult::InvalidFunctionParameter);
        }
        let amount = round_amount(amount);
        // debit of zero is a harmless no-op; the other primitives require a
        // strictly positive amount
        let zero_ok = matches!(primitive, Primitive::Debit);
        if amount < Decimal::ZERO || (amount == Decimal::ZERO && !zero_ok) {
            return Ok(BudgetResult::InvalidAmount);
        }

        let mut conn = self.store.lock_conn();
        let tx = conn.transaction()?;
        let result = apply_primitive(&tx, budget_id, amount, &primitive)?;
        if result == BudgetResult::Success {
            tx.commit()?;
            debug!(budget_id, %amount, op = primitive.name(), "budget updated");
        } else {
            warn!(budget_id, %amount, op = primitive.name(), %result, "budget operation refused");
        }
        Ok(result)
    }

    /// Fetch the budget for the triple, creating a zeroed row on first
    /// reference.
    pub fn ensure_budget(
        &self,
        currency: &str,
        exchange_id: i64,
        strategy_id: i64,
    ) -> CoreResult<Budget> {
        let conn = self.store.lock_conn();
        conn.execute(
            "INSERT INTO budgets (currency, exchange_id, strategy_id, available, reserved, updated_at)
             VALUES (?1, ?2, ?3, '0', '0', ?4)
             ON CONFLICT(currency, exchange_id, strategy_id) DO NOTHING",
            params![currency, exchange_id, strategy_id, Utc::now().to_rfc3339()],
        )?;
        let budget = conn
            .query_row(
                "SELECT id, currency, exchange_id, strategy_id, available, reserved, updated_at
                 FROM budgets WHERE currency = ?1 AND exchange_id = ?2 AND strategy_id = ?3",
                params![currency, exchange_id, strategy_id],
                budget_from_row,
            )
            .optional()?;
        budget.ok_or_else(|| {
            CoreError::not_found("budget", format!("{currency}/{exchange_id}/{strategy_id}"))
        })
    }

    /// Settle one fill: credit the spending budget, debit the receiving
    /// budget, and insert the Trade row, all in one transaction.
    ///
    /// A fill whose `source_id` already has a Trade row is a duplicate and
    /// leaves everything untouched. If either leg is refused the transaction
    /// rolls back and the refusal is reported, leaving the fill unprocessed
    /// so a later reconciliation pass can retry it.
    #[instrument(skip(self, fill), fields(source_id = %fill.source_id, order_id = fill.order_id))]
    pub fn settle_fill(
        &self,
        credit_budget_id: i64,
        debit_budget_id: i64,
        fill: &FillSettlement,
    ) -> CoreResult<SettleOutcome> {
        let spent = round_amount(fill.spent);
        let received = round_amount(fill.received);

        let mut conn = self.store.lock_conn();
        let tx = conn.transaction()?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM trades WHERE source_id = ?1",
                params![fill.source_id],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            debug!("fill already settled");
            return Ok(SettleOutcome::Duplicate);
        }

        let credit = apply_primitive(&tx, credit_budget_id, spent, &Primitive::Credit)?;
        if credit != BudgetResult::Success {
            warn!(%credit, "credit leg refused, rolling back fill");
            return Ok(SettleOutcome::Rejected(credit));
        }
        let debit = apply_primitive(&tx, debit_budget_id, received, &Primitive::Debit)?;
        if debit != BudgetResult::Success {
            warn!(%debit, "debit leg refused, rolling back fill");
            return Ok(SettleOutcome::Rejected(debit));
        }

        tx.execute(
            "INSERT INTO trades (source_id, order_id, is_taker, price, quantity, fee,
                                 executed_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                fill.source_id,
                fill.order_id,
                fill.is_taker,
                spent.to_string(),
                received.to_string(),
                round_amount(fill.fee).to_string(),
                fill.executed_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        debug!(%spent, %received, "fill settled");
        Ok(SettleOutcome::Applied)
    }
}

fn read_budget(tx: &Transaction<'_>, budget_id: i64) -> CoreResult<Option<(Decimal, Decimal)>> {
    let row: Option<(String, String)> = tx
        .query_row(
            "SELECT available, reserved FROM budgets WHERE id = ?1",
            params![budget_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    match row {
        None => Ok(None),
        Some((available, reserved)) => {
            let available = Decimal::from_str(&available)
                .map_err(|e| CoreError::Consistency(format!("budget {budget_id}: {e}")))?;
            let reserved = Decimal::from_str(&reserved)
                .map_err(|e| CoreError::Consistency(format!("budget {budget_id}: {e}")))?;
            Ok(Some((available, reserved)))
        }
    }
}

fn write_budget(
    tx: &Transaction<'_>,
    budget_id: i64,
    available: Decimal,
    reserved: Decimal,
) -> CoreResult<()> {
    tx.execute(
        "UPDATE budgets SET available = ?1, reserved = ?2, updated_at = ?3 WHERE id = ?4",
        params![
            available.to_string(),
            reserved.to_string(),
            Utc::now().to_rfc3339(),
            budget_id,
        ],
    )?;
    Ok(())
}

/// Read-check-write for one primitive inside an open transaction. Callers
/// decide whether to commit.
fn apply_primitive(
    tx: &Transaction<'_>,
    budget_id: i64,
    amount: Decimal,
    primitive: &Primitive,
) -> CoreResult<BudgetResult> {
    if budget_id <= 0 {
        return Ok(BudgetResult::InvalidFunctionParameter);
    }
    if amount < Decimal::ZERO {
        return Ok(BudgetResult::InvalidAmount);
    }
    let Some((available, reserved)) = read_budget(tx, budget_id)? else {
        return Ok(BudgetResult::NoRecord);
    };

    let (available, reserved) = match primitive {
        Primitive::Lock => {
            if available < amount {
                return Ok(BudgetResult::InsufficientFunds);
            }
            (available - amount, reserved + amount)
        }
        Primitive::Unlock => {
            if reserved < amount {
                return Ok(BudgetResult::InsufficientFunds);
            }
            (available + amount, reserved - amount)
        }
        Primitive::Credit => {
            if reserved < amount {
                return Ok(BudgetResult::InsufficientFunds);
            }
            (available, reserved - amount)
        }
        Primitive::Debit => (available + amount, reserved),
    };
    write_budget(tx, budget_id, available, reserved)?;
    Ok(BudgetResult::Success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EntityStatus, ExchangeKind, OrderDirection, OrderRequest, OrderType};
    use crate::store::NewExchange;
    use rust_decimal_macros::dec;

    fn ledger_with_budget(available: Decimal) -> (FundLedger, Arc<Store>, i64) {
        let store = Arc::new(Store::in_memory().unwrap());
        let exchange = store
            .create_exchange(&NewExchange {
                name: "test".into(),
                kind: ExchangeKind::Bittrex,
                base_url: "https://api.example.test".into(),
                api_key: "k".into(),
                api_secret: "s".into(),
                api_passphrase: None,
                user_id: 1,
            })
            .unwrap();
        let strategy = store.create_strategy("s", 1, "USD").unwrap();
        let ledger = FundLedger::new(Arc::clone(&store));
        let budget = ledger
            .ensure_budget("USD", exchange.id, strategy.id)
            .unwrap();
        if available > Decimal::ZERO {
            assert_eq!(
                ledger.debit(budget.id, available).unwrap(),
                BudgetResult::Success
            );
        }
        (ledger, store, budget.id)
    }

    fn budget_state(store: &Store, id: i64) -> (Decimal, Decimal) {
        let b = store.budget_by_id(id).unwrap().unwrap();
        (b.available, b.reserved)
    }

    #[test]
    fn lock_moves_available_to_reserved() {
        let (ledger, store, budget) = ledger_with_budget(dec!(100));
        assert_eq!(ledger.lock(budget, dec!(40)).unwrap(), BudgetResult::Success);
        assert_eq!(budget_state(&store, budget), (dec!(60), dec!(40)));
    }

    #[test]
    fn lock_beyond_available_is_refused_without_effect() {
        let (ledger, store, budget) = ledger_with_budget(dec!(100));
        assert_eq!(ledger.lock(budget, dec!(40)).unwrap(), BudgetResult::Success);
        assert_eq!(
            ledger.lock(budget, dec!(200)).unwrap(),
            BudgetResult::InsufficientFunds
        );
        assert_eq!(budget_state(&store, budget), (dec!(60), dec!(40)));
    }

    #[test]
    fn lock_then_unlock_restores_exactly() {
        let (ledger, store, budget) = ledger_with_budget(dec!(123.45678901));
        let before = budget_state(&store, budget);
        assert_eq!(
            ledger.lock(budget, dec!(23.45678901)).unwrap(),
            BudgetResult::Success
        );
        assert_eq!(
            ledger.unlock(budget, dec!(23.45678901)).unwrap(),
            BudgetResult::Success
        );
        assert_eq!(budget_state(&store, budget), before);
    }

    #[test]
    fn invariant_holds_across_mixed_sequence() {
        let (ledger, store, budget) = ledger_with_budget(dec!(1000));
        let total_effect = |store: &Store| {
            let (a, r) = budget_state(store, budget);
            assert!(a >= Decimal::ZERO);
            assert!(r >= Decimal::ZERO);
            a + r
        };
        ledger.lock(budget, dec!(400)).unwrap();
        assert_eq!(total_effect(&store), dec!(1000));
        ledger.credit(budget, dec!(150)).unwrap();
        assert_eq!(total_effect(&store), dec!(850));
        ledger.debit(budget, dec!(50)).unwrap();
        assert_eq!(total_effect(&store), dec!(900));
        ledger.unlock(budget, dec!(250)).unwrap();
        assert_eq!(total_effect(&store), dec!(900));
        // reserved is now 0; further credits must be refused
        assert_eq!(
            ledger.credit(budget, dec!(1)).unwrap(),
            BudgetResult::InsufficientFunds
        );
    }

    #[test]
    fn non_positive_amounts_are_invalid() {
        let (ledger, _, budget) = ledger_with_budget(dec!(10));
        assert_eq!(
            ledger.lock(budget, dec!(0)).unwrap(),
            BudgetResult::InvalidAmount
        );
        assert_eq!(
            ledger.lock(budget, dec!(-5)).unwrap(),
            BudgetResult::InvalidAmount
        );
        assert_eq!(
            ledger.debit(budget, dec!(-5)).unwrap(),
            BudgetResult::InvalidAmount
        );
        // zero debit is explicitly allowed
        assert_eq!(ledger.debit(budget, dec!(0)).unwrap(), BudgetResult::Success);
    }

    #[test]
    fn unknown_and_malformed_budget_ids() {
        let (ledger, _, _) = ledger_with_budget(dec!(10));
        assert_eq!(
            ledger.lock(9999, dec!(1)).unwrap(),
            BudgetResult::NoRecord
        );
        assert_eq!(
            ledger.lock(-1, dec!(1)).unwrap(),
            BudgetResult::InvalidFunctionParameter
        );
    }

    #[test]
    fn ensure_budget_is_lazy_and_stable() {
        let (ledger, _, _) = ledger_with_budget(dec!(0));
        let first = ledger.ensure_budget("BTC", 1, 1).unwrap();
        assert_eq!(first.available, Decimal::ZERO);
        assert_eq!(first.reserved, Decimal::ZERO);
        let second = ledger.ensure_budget("BTC", 1, 1).unwrap();
        assert_eq!(first.id, second.id);
    }

    fn settled_order(store: &Store) -> i64 {
        let market = store
            .upsert_market(&crate::store::MarketSpec {
                exchange_id: 1,
                symbol: "BTC-USD".into(),
                base_currency: "BTC".into(),
                quote_currency: "USD".into(),
                min_trade_size: dec!(0.0001),
                status: EntityStatus::Active,
                tags: vec![],
            })
            .unwrap();
        let request = OrderRequest::new(1, market.id, OrderDirection::Buy, OrderType::Limit);
        store
            .create_order(&request, "ex-1", EntityStatus::New)
            .unwrap()
            .id
    }

    fn fill(source_id: &str, spent: Decimal, received: Decimal, order_id: i64) -> FillSettlement {
        FillSettlement {
            source_id: source_id.into(),
            order_id,
            is_taker: true,
            spent,
            received,
            fee: dec!(0.1),
            executed_at: Utc::now(),
        }
    }

    #[test]
    fn settle_fill_applies_both_legs_and_trade_atomically() {
        let (ledger, store, usd) = ledger_with_budget(dec!(500));
        let order_id = settled_order(&store);
        ledger.lock(usd, dec!(300)).unwrap();
        let btc = ledger.ensure_budget("BTC", 1, 1).unwrap();

        let outcome = ledger
            .settle_fill(usd, btc.id, &fill("t-1", dec!(300), dec!(0.01), order_id))
            .unwrap();
        assert_eq!(outcome, SettleOutcome::Applied);
        assert_eq!(budget_state(&store, usd), (dec!(200), dec!(0)));
        assert_eq!(budget_state(&store, btc.id), (dec!(0.01), dec!(0)));

        let trade = store.trade_by_source_id("t-1").unwrap().unwrap();
        assert_eq!(trade.price, dec!(300));
        assert_eq!(trade.quantity, dec!(0.01));
        assert_eq!(trade.order_id, order_id);
    }

    #[test]
    fn settle_fill_same_source_id_twice_is_a_noop() {
        let (ledger, store, usd) = ledger_with_budget(dec!(500));
        let order_id = settled_order(&store);
        ledger.lock(usd, dec!(300)).unwrap();
        let btc = ledger.ensure_budget("BTC", 1, 1).unwrap();

        let f = fill("t-dup", dec!(300), dec!(0.01), order_id);
        assert_eq!(
            ledger.settle_fill(usd, btc.id, &f).unwrap(),
            SettleOutcome::Applied
        );
        assert_eq!(
            ledger.settle_fill(usd, btc.id, &f).unwrap(),
            SettleOutcome::Duplicate
        );
        assert_eq!(budget_state(&store, usd), (dec!(200), dec!(0)));
        assert_eq!(budget_state(&store, btc.id), (dec!(0.01), dec!(0)));
        assert_eq!(store.trades_by_order(order_id).unwrap().len(), 1);
    }

    #[test]
    fn settle_fill_rolls_back_completely_when_a_leg_fails() {
        let (ledger, store, usd) = ledger_with_budget(dec!(500));
        let order_id = settled_order(&store);
        ledger.lock(usd, dec!(100)).unwrap();
        let btc = ledger.ensure_budget("BTC", 1, 1).unwrap();

        // credit leg needs 300 reserved but only 100 is locked
        let outcome = ledger
            .settle_fill(usd, btc.id, &fill("t-fail", dec!(300), dec!(0.01), order_id))
            .unwrap();
        assert_eq!(
            outcome,
            SettleOutcome::Rejected(BudgetResult::InsufficientFunds)
        );
        assert_eq!(budget_state(&store, usd), (dec!(400), dec!(100)));
        assert_eq!(budget_state(&store, btc.id), (dec!(0), dec!(0)));
        assert!(store.trade_by_source_id("t-fail").unwrap().is_none());

        // debit leg failure (unknown budget) must also undo the credit leg
        let outcome = ledger
            .settle_fill(usd, 9999, &fill("t-fail2", dec!(100), dec!(0.01), order_id))
            .unwrap();
        assert_eq!(outcome, SettleOutcome::Rejected(BudgetResult::NoRecord));
        assert_eq!(budget_state(&store, usd), (dec!(400), dec!(100)));
        assert!(store.trade_by_source_id("t-fail2").unwrap().is_none());
    }
}
