//! Coinbase Exchange (pro) REST adapter.
//!
//! Authenticated requests carry `CB-ACCESS-KEY`, `CB-ACCESS-TIMESTAMP`
//! (unix seconds), `CB-ACCESS-PASSPHRASE`, and `CB-ACCESS-SIGN`: a
//! base64-encoded HMAC-SHA256 over timestamp + method + request path +
//! body, keyed with the base64-decoded API secret.

use crate::domain::{
    round_amount, EntityStatus, ExchangeAccount, Market, Order, OrderDirection, OrderRequest,
    OrderTimeInForce, OrderType,
};
use crate::error::AdapterError;
use crate::exchange::types::{
    ExchangeBalance, ExchangeMarket, ExchangeOrderState, Fill, PlacedOrder, Ticker,
};
use crate::exchange::{retry_read, spend_receive, ExchangeAdapter};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct CoinbaseAdapter {
    http: Client,
    base_url: String,
    api_key: String,
    /// Raw HMAC key, base64-decoded from the account secret at build time.
    signing_key: Vec<u8>,
    api_passphrase: String,
}

#[derive(Debug, Serialize)]
struct CoinbaseNewOrder {
    client_oid: Uuid,
    product_id: String,
    side: &'static str,
    #[serde(rename = "type")]
    order_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    price: Option<Decimal>,
    /// Base-asset size. Limit orders and market sells.
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<Decimal>,
    /// Quote-currency amount to spend. Market buys only.
    #[serde(skip_serializing_if = "Option::is_none")]
    funds: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    time_in_force: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
struct CoinbaseOrder {
    id: String,
    status: String,
    #[serde(default)]
    filled_size: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct CoinbaseFill {
    trade_id: i64,
    price: Decimal,
    size: Decimal,
    fee: Decimal,
    created_at: DateTime<Utc>,
    liquidity: String,
}

#[derive(Debug, Deserialize)]
struct CoinbaseTicker {
    price: Decimal,
    bid: Decimal,
    ask: Decimal,
}

#[derive(Debug, Deserialize)]
struct CoinbaseAccount {
    currency: String,
    balance: Decimal,
    available: Decimal,
}

#[derive(Debug, Deserialize)]
struct CoinbaseProduct {
    id: String,
    base_currency: String,
    quote_currency: String,
    base_min_size: Decimal,
    status: String,
}

fn direction_to_venue(direction: OrderDirection) -> &'static str {
    match direction {
        OrderDirection::Buy => "buy",
        OrderDirection::Sell => "sell",
    }
}

fn time_in_force_to_venue(tif: OrderTimeInForce) -> Option<&'static str> {
    match tif {
        OrderTimeInForce::GoodTilCancelled => Some("GTC"),
        OrderTimeInForce::ImmediateOrCancel => Some("IOC"),
        OrderTimeInForce::FillOrKill => Some("FOK"),
        // expressed through the post_only flag on this venue; GTC semantics
        OrderTimeInForce::PostOnly => Some("GTC"),
    }
}

fn market_status_from_venue(status: &str) -> EntityStatus {
    match status {
        "online" => EntityStatus::Active,
        "offline" => EntityStatus::Disabled,
        "delisted" => EntityStatus::Delisted,
        other => {
            warn!(status = other, "unrecognized product status, treating as disabled");
            EntityStatus::Disabled
        }
    }
}

impl CoinbaseAdapter {
    pub fn new(account: &ExchangeAccount) -> Result<Self, AdapterError> {
        let signing_key = BASE64
            .decode(account.api_secret.as_bytes())
            .map_err(|e| AdapterError::Response(format!("api secret is not base64: {e}")))?;
        let api_passphrase = account
            .api_passphrase
            .clone()
            .ok_or_else(|| AdapterError::Response("coinbase requires an api passphrase".into()))?;
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AdapterError::Transport {
                endpoint: "client".into(),
                message: e.to_string(),
            })?;
        Ok(Self {
            http,
            base_url: account.base_url.trim_end_matches('/').to_string(),
            api_key: account.api_key.clone(),
            signing_key,
            api_passphrase,
        })
    }

    fn sign(&self, timestamp: i64, method: &Method, request_path: &str, body: &str) -> String {
        let message = format!("{timestamp}{method}{request_path}{body}");
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.signing_key)
            .expect("HMAC can take key of any size");
        mac.update(message.as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }

    /// `endpoint` includes any query string; the signature covers the full
    /// request path.
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<String>,
        authenticate: bool,
    ) -> Result<T, AdapterError> {
        let endpoint = endpoint.trim_start_matches('/');
        let url = format!("{}/{endpoint}", self.base_url);
        let mut builder = self.http.request(method.clone(), &url);

        if authenticate {
            let timestamp = Utc::now().timestamp();
            let request_path = format!("/{endpoint}");
            let signature =
                self.sign(timestamp, &method, &request_path, body.as_deref().unwrap_or(""));
            builder = builder
                .header("CB-ACCESS-KEY", &self.api_key)
                .header("CB-ACCESS-SIGN", signature)
                .header("CB-ACCESS-TIMESTAMP", timestamp.to_string())
                .header("CB-ACCESS-PASSPHRASE", &self.api_passphrase);
        }
        if let Some(body) = body {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| AdapterError::from_reqwest(endpoint, e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AdapterError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        response
            .json()
            .await
            .map_err(|e| AdapterError::from_reqwest(endpoint, e))
    }

    fn order_payload(
        request: &OrderRequest,
        market: &Market,
    ) -> Result<CoinbaseNewOrder, AdapterError> {
        let mut payload = CoinbaseNewOrder {
            client_oid: request.order_guid,
            product_id: market.symbol.clone(),
            side: direction_to_venue(request.direction),
            order_type: match request.order_type {
                OrderType::Limit => "limit",
                OrderType::Market => "market",
            },
            price: None,
            size: None,
            funds: None,
            time_in_force: None,
        };
        match request.order_type {
            OrderType::Limit => {
                let price = request.price.ok_or_else(|| {
                    AdapterError::Response("limit order needs a price".into())
                })?;
                let size = match request.direction {
                    OrderDirection::Sell => request.quantity,
                    OrderDirection::Buy => request
                        .base_quantity
                        .unwrap_or_else(|| round_amount(request.quantity / price)),
                };
                payload.price = Some(price);
                payload.size = Some(size);
                payload.time_in_force = time_in_force_to_venue(request.time_in_force);
            }
            OrderType::Market => match request.direction {
                // market buys spend a quote amount directly
                OrderDirection::Buy => payload.funds = Some(request.quantity),
                OrderDirection::Sell => payload.size = Some(request.quantity),
            },
        }
        Ok(payload)
    }
}

#[async_trait]
impl ExchangeAdapter for CoinbaseAdapter {
    #[instrument(skip(self, request, market), fields(order_guid = %request.order_guid))]
    async fn place_order(
        &self,
        request: &OrderRequest,
        market: &Market,
    ) -> Result<PlacedOrder, AdapterError> {
        let payload = Self::order_payload(request, market)?;
        let body = serde_json::to_string(&payload)
            .map_err(|e| AdapterError::Response(format!("order serialization: {e}")))?;
        debug!(market = %market.symbol, "submitting order");
        let order: CoinbaseOrder = self
            .request(Method::POST, "orders", Some(body), true)
            .await?;
        Ok(PlacedOrder {
            source_id: order.id,
            open: order.status != "done",
        })
    }

    #[instrument(skip(self, order), fields(source_id = %order.source_id))]
    async fn get_order(&self, order: &Order) -> Result<ExchangeOrderState, AdapterError> {
        let endpoint = format!("orders/{}", urlencoding::encode(&order.source_id));
        let venue: CoinbaseOrder =
            retry_read(|| self.request(Method::GET, &endpoint, None, true)).await?;
        Ok(ExchangeOrderState {
            source_id: venue.id,
            closed: venue.status == "done",
            filled_quantity: venue.filled_size,
        })
    }

    #[instrument(skip(self, order), fields(source_id = %order.source_id))]
    async fn get_trades_by_order(&self, order: &Order) -> Result<Vec<Fill>, AdapterError> {
        let endpoint = format!("fills?order_id={}", urlencoding::encode(&order.source_id));
        let fills: Vec<CoinbaseFill> =
            retry_read(|| self.request(Method::GET, &endpoint, None, true)).await?;
        Ok(fills
            .into_iter()
            .map(|f| {
                let (price, quantity) = spend_receive(order.direction, f.price, f.size);
                Fill {
                    source_id: f.trade_id.to_string(),
                    price,
                    quantity,
                    fee: f.fee,
                    is_taker: f.liquidity == "T",
                    executed_at: f.created_at,
                }
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, AdapterError> {
        let endpoint = format!("products/{symbol}/ticker");
        let ticker: CoinbaseTicker =
            retry_read(|| self.request(Method::GET, &endpoint, None, false)).await?;
        Ok(Ticker {
            price: ticker.price,
            bid: ticker.bid,
            ask: ticker.ask,
        })
    }

    #[instrument(skip(self))]
    async fn get_balances(&self) -> Result<Vec<ExchangeBalance>, AdapterError> {
        let accounts: Vec<CoinbaseAccount> =
            retry_read(|| self.request(Method::GET, "accounts", None, true)).await?;
        Ok(accounts
            .into_iter()
            .map(|a| ExchangeBalance {
                symbol: a.currency,
                available: a.available,
                total: a.balance,
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn get_markets(&self) -> Result<Vec<ExchangeMarket>, AdapterError> {
        let products: Vec<CoinbaseProduct> =
            retry_read(|| self.request(Method::GET, "products", None, false)).await?;
        Ok(products
            .into_iter()
            .map(|p| ExchangeMarket {
                symbol: p.id,
                base_currency: p.base_currency,
                quote_currency: p.quote_currency,
                min_trade_size: p.base_min_size,
                status: market_status_from_venue(&p.status),
                tags: vec![],
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn account(base_url: &str) -> ExchangeAccount {
        ExchangeAccount {
            id: 2,
            name: "coinbase-test".into(),
            kind: crate::domain::ExchangeKind::Coinbase,
            base_url: base_url.into(),
            api_key: "test-key".into(),
            // base64 of "test-secret"
            api_secret: "dGVzdC1zZWNyZXQ=".into(),
            api_passphrase: Some("test-pass".into()),
            user_id: 1,
            status: EntityStatus::Active,
            created_at: Utc::now(),
        }
    }

    fn market() -> Market {
        Market {
            id: 2,
            exchange_id: 2,
            symbol: "ETH-USD".into(),
            base_currency: "ETH".into(),
            quote_currency: "USD".into(),
            min_trade_size: dec!(0.001),
            status: EntityStatus::Active,
            tags: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn sell_order(source_id: &str) -> Order {
        Order {
            id: 2,
            order_guid: Uuid::new_v4(),
            source_id: source_id.into(),
            strategy_id: 1,
            market_id: 2,
            direction: OrderDirection::Sell,
            order_type: OrderType::Market,
            price: None,
            quantity: dec!(2),
            time_in_force: OrderTimeInForce::GoodTilCancelled,
            status: EntityStatus::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn adapter_requires_a_passphrase() {
        let mut acct = account("https://api.example.test");
        acct.api_passphrase = None;
        assert!(CoinbaseAdapter::new(&acct).is_err());
    }

    #[test]
    fn adapter_rejects_non_base64_secret() {
        let mut acct = account("https://api.example.test");
        acct.api_secret = "not base64 !!!".into();
        assert!(CoinbaseAdapter::new(&acct).is_err());
    }

    #[tokio::test]
    async fn market_buy_spends_quote_funds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders"))
            .and(header_exists("CB-ACCESS-KEY"))
            .and(header_exists("CB-ACCESS-SIGN"))
            .and(header_exists("CB-ACCESS-TIMESTAMP"))
            .and(header_exists("CB-ACCESS-PASSPHRASE"))
            .and(body_partial_json(json!({
                "product_id": "ETH-USD",
                "side": "buy",
                "type": "market",
                "funds": "500"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "cb-order-1",
                "status": "pending"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = CoinbaseAdapter::new(&account(&server.uri())).unwrap();
        let mut request = OrderRequest::new(1, 2, OrderDirection::Buy, OrderType::Market);
        request.quantity = dec!(500);

        let placed = adapter.place_order(&request, &market()).await.unwrap();
        assert_eq!(placed.source_id, "cb-order-1");
        assert!(placed.open);
    }

    #[tokio::test]
    async fn fills_query_by_order_and_normalize_for_sells() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fills"))
            .and(query_param("order_id", "cb-order-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                "trade_id": 741,
                "price": "2000",
                "size": "2",
                "fee": "4.0",
                "created_at": "2024-05-01T12:00:00Z",
                "liquidity": "M"
            }])))
            .mount(&server)
            .await;

        let adapter = CoinbaseAdapter::new(&account(&server.uri())).unwrap();
        let fills = adapter
            .get_trades_by_order(&sell_order("cb-order-2"))
            .await
            .unwrap();
        assert_eq!(fills.len(), 1);
        // sell of 2 ETH at 2000: 2 ETH spent, 4000 USD received
        assert_eq!(fills[0].source_id, "741");
        assert_eq!(fills[0].price, dec!(2));
        assert_eq!(fills[0].quantity, dec!(4000));
        assert!(!fills[0].is_taker);
    }

    #[tokio::test]
    async fn order_state_reports_done_as_closed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/orders/cb-order-3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "cb-order-3",
                "status": "done",
                "filled_size": "2"
            })))
            .mount(&server)
            .await;

        let adapter = CoinbaseAdapter::new(&account(&server.uri())).unwrap();
        let state = adapter.get_order(&sell_order("cb-order-3")).await.unwrap();
        assert!(state.closed);
        assert_eq!(state.filled_quantity, Some(dec!(2)));
    }

    #[tokio::test]
    async fn products_map_venue_statuses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/products"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {
                    "id": "ETH-USD",
                    "base_currency": "ETH",
                    "quote_currency": "USD",
                    "base_min_size": "0.001",
                    "status": "online"
                },
                {
                    "id": "XRP-USD",
                    "base_currency": "XRP",
                    "quote_currency": "USD",
                    "base_min_size": "1",
                    "status": "delisted"
                }
            ])))
            .mount(&server)
            .await;

        let adapter = CoinbaseAdapter::new(&account(&server.uri())).unwrap();
        let markets = adapter.get_markets().await.unwrap();
        assert_eq!(markets[0].status, EntityStatus::Active);
        assert_eq!(markets[1].status, EntityStatus::Delisted);
    }
}
