//! SQLite-backed persistence for the trading core.
//!
//! Entities use TEXT columns for decimals (exact round-tripping through
//! `rust_decimal`) and RFC 3339 timestamps. The connection sits behind a
//! mutex so independent worker tasks can share one handle; every ledger
//! mutation runs inside a single transaction on that handle.
//!
//! Uniqueness constraints the core relies on:
//! - `budgets(currency, exchange_id, strategy_id)`: one ledger row per triple
//! - `orders(order_guid)`: caller idempotency key
//! - `trades(source_id)`: reconciliation idempotency key
//! - `markets(exchange_id, symbol)`: market sync upsert key
//! - `subscriptions(monitor_id, strategy_id, reaction_id)`: unique binding

use crate::domain::{
    Alert, Balance, Budget, EntityStatus, ExchangeAccount, ExchangeKind, Market, Order,
    OrderRequest, Reaction, Strategy, Subscription, Trade,
};
use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

/// Persistence handle shared by the ledger and engines.
pub struct Store {
    conn: Mutex<Connection>,
}

/// Market fields produced by exchange market sync, keyed by
/// (exchange_id, symbol) for upsert.
#[derive(Debug, Clone)]
pub struct MarketSpec {
    pub exchange_id: i64,
    pub symbol: String,
    pub base_currency: String,
    pub quote_currency: String,
    pub min_trade_size: Decimal,
    pub status: EntityStatus,
    pub tags: Vec<String>,
}

/// Fields for registering an exchange account.
#[derive(Debug, Clone)]
pub struct NewExchange {
    pub name: String,
    pub kind: ExchangeKind,
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub api_passphrase: Option<String>,
    pub user_id: i64,
}

impl Store {
    /// Open (or create) the database at `path` and initialize the schema.
    pub fn open<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        info!(path = %path.as_ref().display(), "store opened");
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn in_memory() -> CoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Lock the underlying connection. Used by the ledger to run multi-row
    /// mutations inside one transaction.
    pub(crate) fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("store mutex poisoned")
    }

    fn init_schema(&self) -> CoreResult<()> {
        let conn = self.lock_conn();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS exchanges (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                base_url TEXT NOT NULL,
                api_key TEXT NOT NULL,
                api_secret TEXT NOT NULL,
                api_passphrase TEXT,
                user_id INTEGER NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS strategies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                guid TEXT NOT NULL UNIQUE,
                user_id INTEGER NOT NULL,
                base_currency TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS markets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                exchange_id INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                base_currency TEXT NOT NULL,
                quote_currency TEXT NOT NULL,
                min_trade_size TEXT NOT NULL,
                status TEXT NOT NULL,
                tags TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(exchange_id, symbol)
            );

            CREATE TABLE IF NOT EXISTS budgets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                currency TEXT NOT NULL,
                exchange_id INTEGER NOT NULL,
                strategy_id INTEGER NOT NULL,
                available TEXT NOT NULL,
                reserved TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(currency, exchange_id, strategy_id)
            );

            CREATE TABLE IF NOT EXISTS orders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                order_guid TEXT NOT NULL UNIQUE,
                source_id TEXT NOT NULL,
                strategy_id INTEGER NOT NULL,
                market_id INTEGER NOT NULL,
                direction TEXT NOT NULL,
                order_type TEXT NOT NULL,
                price TEXT,
                quantity TEXT NOT NULL,
                time_in_force TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);

            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_id TEXT NOT NULL UNIQUE,
                order_id INTEGER NOT NULL,
                is_taker INTEGER NOT NULL,
                price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                fee TEXT NOT NULL,
                executed_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trades_order ON trades(order_id);

            CREATE TABLE IF NOT EXISTS alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_id TEXT NOT NULL,
                trigger_id TEXT NOT NULL,
                monitor_id INTEGER NOT NULL,
                severity INTEGER NOT NULL,
                period_start TEXT NOT NULL,
                period_end TEXT NOT NULL,
                total_results INTEGER NOT NULL,
                exchange TEXT,
                currency TEXT,
                market TEXT,
                price TEXT,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS reactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                monitor_id INTEGER NOT NULL,
                direction TEXT NOT NULL,
                amount INTEGER NOT NULL,
                time_in_force TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS subscriptions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                monitor_id INTEGER NOT NULL,
                strategy_id INTEGER NOT NULL,
                reaction_id INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(monitor_id, strategy_id, reaction_id)
            );

            CREATE TABLE IF NOT EXISTS balances (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                currency TEXT NOT NULL,
                exchange_id INTEGER NOT NULL,
                available TEXT NOT NULL,
                total TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(currency, exchange_id)
            );
            "#,
        )?;
        debug!("schema initialized");
        Ok(())
    }

    // ==================== Budgets ====================

    /// Create a zeroed budget row for the triple. Fails on duplicates; use
    /// the ledger's `ensure_budget` for lazy creation.
    pub fn create_budget(
        &self,
        currency: &str,
        exchange_id: i64,
        strategy_id: i64,
    ) -> CoreResult<Budget> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO budgets (currency, exchange_id, strategy_id, available, reserved, updated_at)
             VALUES (?1, ?2, ?3, '0', '0', ?4)",
            params![currency, exchange_id, strategy_id, Utc::now().to_rfc3339()],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.budget_by_id(id)?
            .ok_or_else(|| CoreError::not_found("budget", id))
    }

    pub fn budget_by_id(&self, id: i64) -> CoreResult<Option<Budget>> {
        let conn = self.lock_conn();
        let budget = conn
            .query_row(
                "SELECT id, currency, exchange_id, strategy_id, available, reserved, updated_at
                 FROM budgets WHERE id = ?1",
                params![id],
                budget_from_row,
            )
            .optional()?;
        Ok(budget)
    }

    pub fn budget_by_key(
        &self,
        currency: &str,
        exchange_id: i64,
        strategy_id: i64,
    ) -> CoreResult<Option<Budget>> {
        let conn = self.lock_conn();
        let budget = conn
            .query_row(
                "SELECT id, currency, exchange_id, strategy_id, available, reserved, updated_at
                 FROM budgets WHERE currency = ?1 AND exchange_id = ?2 AND strategy_id = ?3",
                params![currency, exchange_id, strategy_id],
                budget_from_row,
            )
            .optional()?;
        Ok(budget)
    }

    pub fn strategy_budgets(&self, strategy_id: i64) -> CoreResult<Vec<Budget>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, currency, exchange_id, strategy_id, available, reserved, updated_at
             FROM budgets WHERE strategy_id = ?1 ORDER BY currency",
        )?;
        let budgets = stmt
            .query_map(params![strategy_id], budget_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(budgets)
    }

    // ==================== Orders ====================

    /// Persist a submitted order. Called exactly once per order by the
    /// orchestrator, after the exchange has assigned a source id.
    pub fn create_order(
        &self,
        request: &OrderRequest,
        source_id: &str,
        status: EntityStatus,
    ) -> CoreResult<Order> {
        let now = Utc::now().to_rfc3339();
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO orders (order_guid, source_id, strategy_id, market_id, direction,
                                 order_type, price, quantity, time_in_force, status,
                                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
            params![
                request.order_guid.to_string(),
                source_id,
                request.strategy_id,
                request.market_id,
                request.direction.to_string(),
                request.order_type.to_string(),
                request.price.map(|p| p.to_string()),
                request.quantity.to_string(),
                request.time_in_force.to_string(),
                status.to_string(),
                now,
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.order_by_id(id)?
            .ok_or_else(|| CoreError::not_found("order", id))
    }

    pub fn order_by_id(&self, id: i64) -> CoreResult<Option<Order>> {
        let conn = self.lock_conn();
        let order = conn
            .query_row(
                &format!("{ORDER_SELECT} WHERE id = ?1"),
                params![id],
                order_from_row,
            )
            .optional()?;
        Ok(order)
    }

    pub fn order_by_guid(&self, guid: Uuid) -> CoreResult<Option<Order>> {
        let conn = self.lock_conn();
        let order = conn
            .query_row(
                &format!("{ORDER_SELECT} WHERE order_guid = ?1"),
                params![guid.to_string()],
                order_from_row,
            )
            .optional()?;
        Ok(order)
    }

    /// Orders awaiting reconciliation (status New or Active).
    pub fn open_orders(&self) -> CoreResult<Vec<Order>> {
        let conn = self.lock_conn();
        let mut stmt =
            conn.prepare(&format!("{ORDER_SELECT} WHERE status IN ('New', 'Active')"))?;
        let orders = stmt
            .query_map([], order_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(orders)
    }

    /// Advance an order's status. Transitions are monotonic: a write that
    /// would move the status backwards is ignored and reported as `false`.
    /// The check and the write hold the connection for their whole duration
    /// so concurrent passes cannot interleave a regression between them.
    pub fn advance_order_status(&self, order_id: i64, status: EntityStatus) -> CoreResult<bool> {
        let conn = self.lock_conn();
        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM orders WHERE id = ?1",
                params![order_id],
                |row| row.get(0),
            )
            .optional()?;
        let current = current
            .ok_or_else(|| CoreError::not_found("order", order_id))?
            .parse::<EntityStatus>()
            .map_err(|e| CoreError::Consistency(format!("order {order_id}: {e}")))?;
        if status.order_rank() <= current.order_rank() {
            return Ok(false);
        }
        conn.execute(
            "UPDATE orders SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.to_string(), Utc::now().to_rfc3339(), order_id],
        )?;
        Ok(true)
    }

    // ==================== Trades ====================

    pub fn trade_by_source_id(&self, source_id: &str) -> CoreResult<Option<Trade>> {
        let conn = self.lock_conn();
        let trade = conn
            .query_row(
                "SELECT id, source_id, order_id, is_taker, price, quantity, fee,
                        executed_at, created_at
                 FROM trades WHERE source_id = ?1",
                params![source_id],
                trade_from_row,
            )
            .optional()?;
        Ok(trade)
    }

    pub fn trades_by_order(&self, order_id: i64) -> CoreResult<Vec<Trade>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, source_id, order_id, is_taker, price, quantity, fee,
                    executed_at, created_at
             FROM trades WHERE order_id = ?1 ORDER BY executed_at",
        )?;
        let trades = stmt
            .query_map(params![order_id], trade_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(trades)
    }

    // ==================== Markets ====================

    pub fn market_by_id(&self, id: i64) -> CoreResult<Option<Market>> {
        let conn = self.lock_conn();
        let market = conn
            .query_row(
                &format!("{MARKET_SELECT} WHERE id = ?1"),
                params![id],
                market_from_row,
            )
            .optional()?;
        Ok(market)
    }

    pub fn market_by_exchange_symbol(
        &self,
        exchange_id: i64,
        symbol: &str,
    ) -> CoreResult<Option<Market>> {
        let conn = self.lock_conn();
        let market = conn
            .query_row(
                &format!("{MARKET_SELECT} WHERE exchange_id = ?1 AND symbol = ?2"),
                params![exchange_id, symbol],
                market_from_row,
            )
            .optional()?;
        Ok(market)
    }

    /// Find the market pairing `base` against `quote` on one exchange.
    pub fn market_by_base_quote(
        &self,
        exchange_id: i64,
        base_currency: &str,
        quote_currency: &str,
    ) -> CoreResult<Option<Market>> {
        let conn = self.lock_conn();
        let market = conn
            .query_row(
                &format!(
                    "{MARKET_SELECT} WHERE exchange_id = ?1 AND base_currency = ?2
                     AND quote_currency = ?3"
                ),
                params![exchange_id, base_currency, quote_currency],
                market_from_row,
            )
            .optional()?;
        Ok(market)
    }

    /// Create or refresh a market row from exchange sync, keyed by
    /// (exchange_id, symbol).
    pub fn upsert_market(&self, spec: &MarketSpec) -> CoreResult<Market> {
        let now = Utc::now().to_rfc3339();
        let tags = serde_json::to_string(&spec.tags)
            .map_err(|e| CoreError::Validation(format!("market tags: {e}")))?;
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO markets (exchange_id, symbol, base_currency, quote_currency,
                                  min_trade_size, status, tags, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
             ON CONFLICT(exchange_id, symbol) DO UPDATE SET
                 base_currency = ?3,
                 quote_currency = ?4,
                 min_trade_size = ?5,
                 status = ?6,
                 tags = ?7,
                 updated_at = ?8",
            params![
                spec.exchange_id,
                spec.symbol,
                spec.base_currency,
                spec.quote_currency,
                spec.min_trade_size.to_string(),
                spec.status.to_string(),
                tags,
                now,
            ],
        )?;
        drop(conn);
        self.market_by_exchange_symbol(spec.exchange_id, &spec.symbol)?
            .ok_or_else(|| CoreError::not_found("market", &spec.symbol))
    }

    // ==================== Exchanges ====================

    pub fn create_exchange(&self, new: &NewExchange) -> CoreResult<ExchangeAccount> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO exchanges (name, kind, base_url, api_key, api_secret,
                                    api_passphrase, user_id, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                new.name,
                new.kind.to_string(),
                new.base_url,
                new.api_key,
                new.api_secret,
                new.api_passphrase,
                new.user_id,
                EntityStatus::Active.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.exchange_by_id(id)?
            .ok_or_else(|| CoreError::not_found("exchange", id))
    }

    pub fn exchange_by_id(&self, id: i64) -> CoreResult<Option<ExchangeAccount>> {
        let conn = self.lock_conn();
        let exchange = conn
            .query_row(
                &format!("{EXCHANGE_SELECT} WHERE id = ?1"),
                params![id],
                exchange_from_row,
            )
            .optional()?;
        Ok(exchange)
    }

    pub fn active_exchanges_by_user(&self, user_id: i64) -> CoreResult<Vec<ExchangeAccount>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(&format!(
            "{EXCHANGE_SELECT} WHERE user_id = ?1 AND status = 'Active'"
        ))?;
        let exchanges = stmt
            .query_map(params![user_id], exchange_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(exchanges)
    }

    pub fn active_exchange_by_user_kind(
        &self,
        user_id: i64,
        kind: ExchangeKind,
    ) -> CoreResult<Option<ExchangeAccount>> {
        let conn = self.lock_conn();
        let exchange = conn
            .query_row(
                &format!(
                    "{EXCHANGE_SELECT} WHERE user_id = ?1 AND kind = ?2 AND status = 'Active'"
                ),
                params![user_id, kind.to_string()],
                exchange_from_row,
            )
            .optional()?;
        Ok(exchange)
    }

    pub fn all_active_exchanges(&self) -> CoreResult<Vec<ExchangeAccount>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(&format!("{EXCHANGE_SELECT} WHERE status = 'Active'"))?;
        let exchanges = stmt
            .query_map([], exchange_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(exchanges)
    }

    // ==================== Strategies ====================

    pub fn create_strategy(
        &self,
        name: &str,
        user_id: i64,
        base_currency: &str,
    ) -> CoreResult<Strategy> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO strategies (name, guid, user_id, base_currency, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                name,
                Uuid::new_v4().to_string(),
                user_id,
                base_currency,
                EntityStatus::Active.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.strategy_by_id(id)?
            .ok_or_else(|| CoreError::not_found("strategy", id))
    }

    pub fn strategy_by_id(&self, id: i64) -> CoreResult<Option<Strategy>> {
        let conn = self.lock_conn();
        let strategy = conn
            .query_row(
                "SELECT id, name, guid, user_id, base_currency, status, created_at
                 FROM strategies WHERE id = ?1",
                params![id],
                strategy_from_row,
            )
            .optional()?;
        Ok(strategy)
    }

    // ==================== Reactions & subscriptions ====================

    pub fn create_reaction(
        &self,
        monitor_id: i64,
        direction: crate::domain::OrderDirection,
        amount: u8,
        time_in_force: crate::domain::OrderTimeInForce,
    ) -> CoreResult<Reaction> {
        if amount == 0 || amount >= 100 {
            return Err(CoreError::Validation(format!(
                "reaction amount must be 1-99, got {amount}"
            )));
        }
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO reactions (monitor_id, direction, amount, time_in_force, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                monitor_id,
                direction.to_string(),
                amount,
                time_in_force.to_string(),
                EntityStatus::Active.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.reaction_by_id(id)?
            .ok_or_else(|| CoreError::not_found("reaction", id))
    }

    pub fn reaction_by_id(&self, id: i64) -> CoreResult<Option<Reaction>> {
        let conn = self.lock_conn();
        let reaction = conn
            .query_row(
                "SELECT id, monitor_id, direction, amount, time_in_force, status, created_at
                 FROM reactions WHERE id = ?1",
                params![id],
                reaction_from_row,
            )
            .optional()?;
        Ok(reaction)
    }

    pub fn create_subscription(
        &self,
        monitor_id: i64,
        strategy_id: i64,
        reaction_id: i64,
    ) -> CoreResult<Subscription> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO subscriptions (monitor_id, strategy_id, reaction_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![monitor_id, strategy_id, reaction_id, Utc::now().to_rfc3339()],
        )?;
        let id = conn.last_insert_rowid();
        let subscription = conn.query_row(
            "SELECT id, monitor_id, strategy_id, reaction_id, created_at
             FROM subscriptions WHERE id = ?1",
            params![id],
            subscription_from_row,
        )?;
        Ok(subscription)
    }

    pub fn subscriptions_by_monitor(&self, monitor_id: i64) -> CoreResult<Vec<Subscription>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, monitor_id, strategy_id, reaction_id, created_at
             FROM subscriptions WHERE monitor_id = ?1",
        )?;
        let subscriptions = stmt
            .query_map(params![monitor_id], subscription_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(subscriptions)
    }

    // ==================== Alerts ====================

    /// Record an inbound alert. Returns the stored row id.
    pub fn create_alert(&self, alert: &Alert) -> CoreResult<i64> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO alerts (source_id, trigger_id, monitor_id, severity, period_start,
                                 period_end, total_results, exchange, currency, market, price,
                                 status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                alert.source_id,
                alert.trigger_id,
                alert.monitor_id,
                alert.severity,
                alert.period_start.to_rfc3339(),
                alert.period_end.to_rfc3339(),
                alert.total_results,
                alert.exchange.map(|k| k.to_string()),
                alert.currency,
                alert.market,
                alert.price.map(|p| p.to_string()),
                EntityStatus::Active.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    // ==================== Balances ====================

    /// Upsert an exchange-reported balance snapshot.
    pub fn upsert_balance(
        &self,
        currency: &str,
        exchange_id: i64,
        available: Decimal,
        total: Decimal,
    ) -> CoreResult<()> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO balances (currency, exchange_id, available, total, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(currency, exchange_id) DO UPDATE SET
                 available = ?3, total = ?4, updated_at = ?5",
            params![
                currency,
                exchange_id,
                available.to_string(),
                total.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn balance_by_currency_exchange(
        &self,
        currency: &str,
        exchange_id: i64,
    ) -> CoreResult<Option<Balance>> {
        let conn = self.lock_conn();
        let balance = conn
            .query_row(
                "SELECT id, currency, exchange_id, available, total, updated_at
                 FROM balances WHERE currency = ?1 AND exchange_id = ?2",
                params![currency, exchange_id],
                balance_from_row,
            )
            .optional()?;
        Ok(balance)
    }
}

const ORDER_SELECT: &str = "SELECT id, order_guid, source_id, strategy_id, market_id, direction,
        order_type, price, quantity, time_in_force, status, created_at, updated_at FROM orders";

const MARKET_SELECT: &str = "SELECT id, exchange_id, symbol, base_currency, quote_currency,
        min_trade_size, status, tags, created_at, updated_at FROM markets";

const EXCHANGE_SELECT: &str = "SELECT id, name, kind, base_url, api_key, api_secret,
        api_passphrase, user_id, status, created_at FROM exchanges";

// ==================== Row mapping ====================

/// Parse a TEXT column into any `FromStr` type, surfacing a conversion
/// failure at the right column index.
fn parse_text<T>(value: String, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, format!("{e}").into())
    })
}

fn parse_opt_text<T>(value: Option<String>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value.map(|v| parse_text(v, idx)).transpose()
}

pub(crate) fn budget_from_row(row: &Row<'_>) -> rusqlite::Result<Budget> {
    Ok(Budget {
        id: row.get(0)?,
        currency: row.get(1)?,
        exchange_id: row.get(2)?,
        strategy_id: row.get(3)?,
        available: parse_text(row.get(4)?, 4)?,
        reserved: parse_text(row.get(5)?, 5)?,
        updated_at: parse_text::<DateTime<Utc>>(row.get(6)?, 6)?,
    })
}

fn order_from_row(row: &Row<'_>) -> rusqlite::Result<Order> {
    Ok(Order {
        id: row.get(0)?,
        order_guid: parse_text(row.get(1)?, 1)?,
        source_id: row.get(2)?,
        strategy_id: row.get(3)?,
        market_id: row.get(4)?,
        direction: parse_text(row.get(5)?, 5)?,
        order_type: parse_text(row.get(6)?, 6)?,
        price: parse_opt_text(row.get(7)?, 7)?,
        quantity: parse_text(row.get(8)?, 8)?,
        time_in_force: parse_text(row.get(9)?, 9)?,
        status: parse_text(row.get(10)?, 10)?,
        created_at: parse_text::<DateTime<Utc>>(row.get(11)?, 11)?,
        updated_at: parse_text::<DateTime<Utc>>(row.get(12)?, 12)?,
    })
}

fn trade_from_row(row: &Row<'_>) -> rusqlite::Result<Trade> {
    Ok(Trade {
        id: row.get(0)?,
        source_id: row.get(1)?,
        order_id: row.get(2)?,
        is_taker: row.get(3)?,
        price: parse_text(row.get(4)?, 4)?,
        quantity: parse_text(row.get(5)?, 5)?,
        fee: parse_text(row.get(6)?, 6)?,
        executed_at: parse_text::<DateTime<Utc>>(row.get(7)?, 7)?,
        created_at: parse_text::<DateTime<Utc>>(row.get(8)?, 8)?,
    })
}

fn market_from_row(row: &Row<'_>) -> rusqlite::Result<Market> {
    let tags: String = row.get(7)?;
    Ok(Market {
        id: row.get(0)?,
        exchange_id: row.get(1)?,
        symbol: row.get(2)?,
        base_currency: row.get(3)?,
        quote_currency: row.get(4)?,
        min_trade_size: parse_text(row.get(5)?, 5)?,
        status: parse_text(row.get(6)?, 6)?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        created_at: parse_text::<DateTime<Utc>>(row.get(8)?, 8)?,
        updated_at: parse_text::<DateTime<Utc>>(row.get(9)?, 9)?,
    })
}

fn exchange_from_row(row: &Row<'_>) -> rusqlite::Result<ExchangeAccount> {
    Ok(ExchangeAccount {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: parse_text(row.get(2)?, 2)?,
        base_url: row.get(3)?,
        api_key: row.get(4)?,
        api_secret: row.get(5)?,
        api_passphrase: row.get(6)?,
        user_id: row.get(7)?,
        status: parse_text(row.get(8)?, 8)?,
        created_at: parse_text::<DateTime<Utc>>(row.get(9)?, 9)?,
    })
}

fn strategy_from_row(row: &Row<'_>) -> rusqlite::Result<Strategy> {
    Ok(Strategy {
        id: row.get(0)?,
        name: row.get(1)?,
        guid: parse_text(row.get(2)?, 2)?,
        user_id: row.get(3)?,
        base_currency: row.get(4)?,
        status: parse_text(row.get(5)?, 5)?,
        created_at: parse_text::<DateTime<Utc>>(row.get(6)?, 6)?,
    })
}

fn reaction_from_row(row: &Row<'_>) -> rusqlite::Result<Reaction> {
    Ok(Reaction {
        id: row.get(0)?,
        monitor_id: row.get(1)?,
        direction: parse_text(row.get(2)?, 2)?,
        amount: row.get(3)?,
        time_in_force: parse_text(row.get(4)?, 4)?,
        status: parse_text(row.get(5)?, 5)?,
        created_at: parse_text::<DateTime<Utc>>(row.get(6)?, 6)?,
    })
}

fn subscription_from_row(row: &Row<'_>) -> rusqlite::Result<Subscription> {
    Ok(Subscription {
        id: row.get(0)?,
        monitor_id: row.get(1)?,
        strategy_id: row.get(2)?,
        reaction_id: row.get(3)?,
        created_at: parse_text::<DateTime<Utc>>(row.get(4)?, 4)?,
    })
}

fn balance_from_row(row: &Row<'_>) -> rusqlite::Result<Balance> {
    Ok(Balance {
        id: row.get(0)?,
        currency: row.get(1)?,
        exchange_id: row.get(2)?,
        available: parse_text(row.get(3)?, 3)?,
        total: parse_text(row.get(4)?, 4)?,
        updated_at: parse_text::<DateTime<Utc>>(row.get(5)?, 5)?,
    })
}
