//! Bittrex v3 REST adapter.
//!
//! Authenticated requests carry four headers: `Api-Key`, `Api-Timestamp`
//! (unix millis), `Api-Content-Hash` (SHA-512 of the body, hex), and
//! `Api-Signature` (HMAC-SHA512 over timestamp + url + method +
//! content-hash, hex).

use crate::domain::{
    EntityStatus, ExchangeAccount, Order, OrderDirection, OrderRequest, OrderTimeInForce,
    OrderType, Market, round_amount,
};
use crate::error::AdapterError;
use crate::exchange::types::{
    ExchangeBalance, ExchangeMarket, ExchangeOrderState, Fill, PlacedOrder, Ticker,
};
use crate::exchange::{retry_read, spend_receive, ExchangeAdapter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::time::Duration;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct BittrexAdapter {
    http: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BittrexNewOrder {
    market_symbol: String,
    direction: &'static str,
    #[serde(rename = "type")]
    order_type: &'static str,
    quantity: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<Decimal>,
    time_in_force: &'static str,
    client_order_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BittrexOrder {
    id: String,
    status: String,
    #[serde(default)]
    fill_quantity: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BittrexExecution {
    id: String,
    quantity: Decimal,
    rate: Decimal,
    commission: Decimal,
    is_taker: bool,
    executed_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BittrexTicker {
    last_trade_rate: Decimal,
    bid_rate: Decimal,
    ask_rate: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BittrexBalance {
    currency_symbol: String,
    total: Decimal,
    available: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BittrexMarket {
    symbol: String,
    base_currency_symbol: String,
    quote_currency_symbol: String,
    min_trade_size: Decimal,
    status: String,
    #[serde(default)]
    tags: Vec<String>,
}

fn direction_to_venue(direction: OrderDirection) -> &'static str {
    match direction {
        OrderDirection::Buy => "BUY",
        OrderDirection::Sell => "SELL",
    }
}

fn order_type_to_venue(order_type: OrderType) -> &'static str {
    match order_type {
        OrderType::Market => "MARKET",
        OrderType::Limit => "LIMIT",
    }
}

fn time_in_force_to_venue(tif: OrderTimeInForce) -> &'static str {
    match tif {
        OrderTimeInForce::GoodTilCancelled => "GOOD_TIL_CANCELLED",
        OrderTimeInForce::ImmediateOrCancel => "IMMEDIATE_OR_CANCEL",
        OrderTimeInForce::FillOrKill => "FILL_OR_KILL",
        OrderTimeInForce::PostOnly => "POST_ONLY_GOOD_TIL_CANCELLED",
    }
}

fn market_status_from_venue(status: &str) -> EntityStatus {
    match status {
        "ONLINE" => EntityStatus::Active,
        "OFFLINE" => EntityStatus::Disabled,
        other => {
            warn!(status = other, "unrecognized market status, treating as disabled");
            EntityStatus::Disabled
        }
    }
}

impl BittrexAdapter {
    pub fn new(account: &ExchangeAccount) -> Result<Self, AdapterError> {
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
            api_secret: account.api_secret.clone(),
        })
    }

    fn content_hash(body: &str) -> String {
        let mut hasher = Sha512::new();
        hasher.update(body.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn sign(&self, timestamp: i64, url: &str, method: &Method, content_hash: &str) -> String {
        let pre_sign = format!("{timestamp}{url}{method}{content_hash}");
        let mut mac = Hmac::<Sha512>::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(pre_sign.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<String>,
        authenticate: bool,
    ) -> Result<T, AdapterError> {
        let url = format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'));
        let mut builder = self.http.request(method.clone(), &url);

        if authenticate {
            let body_str = body.as_deref().unwrap_or("");
            let timestamp = Utc::now().timestamp_millis();
            let content_hash = Self::content_hash(body_str);
            let signature = self.sign(timestamp, &url, &method, &content_hash);
            builder = builder
                .header("Api-Key", &self.api_key)
                .header("Api-Timestamp", timestamp.to_string())
                .header("Api-Content-Hash", content_hash)
                .header("Api-Signature", signature);
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

    /// Bittrex order payloads are base-asset denominated. Sells already
    /// spend the base; buys need the advisory base quantity, or derive it
    /// from the limit price.
    fn base_quantity(request: &OrderRequest) -> Result<Decimal, AdapterError> {
        match request.direction {
            OrderDirection::Sell => Ok(request.quantity),
            OrderDirection::Buy => request
                .base_quantity
                .or_else(|| {
                    request
                        .price
                        .filter(|p| !p.is_zero())
                        .map(|p| round_amount(request.quantity / p))
                })
                .ok_or_else(|| {
                    AdapterError::Response(
                        "buy order needs a base quantity or a limit price".into(),
                    )
                }),
        }
    }
}

#[async_trait]
impl ExchangeAdapter for BittrexAdapter {
    #[instrument(skip(self, request, market), fields(order_guid = %request.order_guid))]
    async fn place_order(
        &self,
        request: &OrderRequest,
        market: &Market,
    ) -> Result<PlacedOrder, AdapterError> {
        let payload = BittrexNewOrder {
            market_symbol: market.symbol.clone(),
            direction: direction_to_venue(request.direction),
            order_type: order_type_to_venue(request.order_type),
            quantity: Self::base_quantity(request)?,
            limit: request.price,
            time_in_force: time_in_force_to_venue(request.time_in_force),
            client_order_id: request.order_guid,
        };
        let body = serde_json::to_string(&payload)
            .map_err(|e| AdapterError::Response(format!("order serialization: {e}")))?;
        debug!(market = %market.symbol, "submitting order");
        let order: BittrexOrder = self
            .request(Method::POST, "orders", Some(body), true)
            .await?;
        Ok(PlacedOrder {
            source_id: order.id,
            open: order.status != "CLOSED",
        })
    }

    #[instrument(skip(self, order), fields(source_id = %order.source_id))]
    async fn get_order(&self, order: &Order) -> Result<ExchangeOrderState, AdapterError> {
        let endpoint = format!("orders/{}", urlencoding::encode(&order.source_id));
        let venue: BittrexOrder = retry_read(|| {
            self.request(Method::GET, &endpoint, None, true)
        })
        .await?;
        Ok(ExchangeOrderState {
            source_id: venue.id,
            closed: venue.status == "CLOSED",
            filled_quantity: venue.fill_quantity,
        })
    }

    #[instrument(skip(self, order), fields(source_id = %order.source_id))]
    async fn get_trades_by_order(&self, order: &Order) -> Result<Vec<Fill>, AdapterError> {
        let endpoint = format!("orders/{}/executions", urlencoding::encode(&order.source_id));
        let executions: Vec<BittrexExecution> = retry_read(|| {
            self.request(Method::GET, &endpoint, None, true)
        })
        .await?;
        Ok(executions
            .into_iter()
            .map(|e| {
                let (price, quantity) = spend_receive(order.direction, e.rate, e.quantity);
                Fill {
                    source_id: e.id,
                    price,
                    quantity,
                    fee: e.commission,
                    is_taker: e.is_taker,
                    executed_at: e.executed_at,
                }
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, AdapterError> {
        let endpoint = format!("markets/{symbol}/ticker");
        let ticker: BittrexTicker = retry_read(|| {
            self.request(Method::GET, &endpoint, None, false)
        })
        .await?;
        Ok(Ticker {
            price: ticker.last_trade_rate,
            bid: ticker.bid_rate,
            ask: ticker.ask_rate,
        })
    }

    #[instrument(skip(self))]
    async fn get_balances(&self) -> Result<Vec<ExchangeBalance>, AdapterError> {
        let balances: Vec<BittrexBalance> = retry_read(|| {
            self.request(Method::GET, "balances", None, true)
        })
        .await?;
        Ok(balances
            .into_iter()
            .map(|b| ExchangeBalance {
                symbol: b.currency_symbol,
                available: b.available,
                total: b.total,
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn get_markets(&self) -> Result<Vec<ExchangeMarket>, AdapterError> {
        let markets: Vec<BittrexMarket> = retry_read(|| {
            self.request(Method::GET, "markets", None, false)
        })
        .await?;
        Ok(markets
            .into_iter()
            .map(|m| ExchangeMarket {
                symbol: m.symbol,
                base_currency: m.base_currency_symbol,
                quote_currency: m.quote_currency_symbol,
                min_trade_size: m.min_trade_size,
                status: market_status_from_venue(&m.status),
                tags: m.tags,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn account(base_url: &str) -> ExchangeAccount {
        ExchangeAccount {
            id: 1,
            name: "bittrex-test".into(),
            kind: crate::domain::ExchangeKind::Bittrex,
            base_url: base_url.into(),
            api_key: "test-key".into(),
            api_secret: "test-secret".into(),
            api_passphrase: None,
            user_id: 1,
            status: EntityStatus::Active,
            created_at: Utc::now(),
        }
    }

    fn market() -> Market {
        Market {
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
        }
    }

    fn buy_order(source_id: &str) -> Order {
        Order {
            id: 1,
            order_guid: Uuid::new_v4(),
            source_id: source_id.into(),
            strategy_id: 1,
            market_id: 1,
            direction: OrderDirection::Buy,
            order_type: OrderType::Limit,
            price: Some(dec!(30000)),
            quantity: dec!(300),
            time_in_force: OrderTimeInForce::GoodTilCancelled,
            status: EntityStatus::New,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn place_order_sends_signed_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders"))
            .and(header_exists("Api-Key"))
            .and(header_exists("Api-Timestamp"))
            .and(header_exists("Api-Content-Hash"))
            .and(header_exists("Api-Signature"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "a8a2b56a-0000-0000-0000-000000000001",
                "status": "OPEN"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = BittrexAdapter::new(&account(&server.uri())).unwrap();
        let mut request = OrderRequest::new(1, 1, OrderDirection::Buy, OrderType::Limit);
        request.price = Some(dec!(30000));
        request.quantity = dec!(300);

        let placed = adapter.place_order(&request, &market()).await.unwrap();
        assert_eq!(placed.source_id, "a8a2b56a-0000-0000-0000-000000000001");
        assert!(placed.open);
    }

    #[tokio::test]
    async fn place_order_is_never_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders"))
            .respond_with(ResponseTemplate::new(500).set_body_string("venue exploded"))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = BittrexAdapter::new(&account(&server.uri())).unwrap();
        let mut request = OrderRequest::new(1, 1, OrderDirection::Sell, OrderType::Market);
        request.quantity = dec!(0.5);

        let err = adapter.place_order(&request, &market()).await.unwrap_err();
        assert!(matches!(err, AdapterError::Status { status: 500, .. }));
    }

    #[tokio::test]
    async fn buy_without_price_or_base_quantity_is_rejected_locally() {
        let server = MockServer::start().await;
        // no mock mounted: the adapter must fail before any request
        let adapter = BittrexAdapter::new(&account(&server.uri())).unwrap();
        let mut request = OrderRequest::new(1, 1, OrderDirection::Buy, OrderType::Market);
        request.quantity = dec!(300);

        let err = adapter.place_order(&request, &market()).await.unwrap_err();
        assert!(matches!(err, AdapterError::Response(_)));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ticker_read_retries_transient_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/markets/BTC-USD/ticker"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/markets/BTC-USD/ticker"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "lastTradeRate": "30000.5",
                "bidRate": "30000.1",
                "askRate": "30000.9"
            })))
            .mount(&server)
            .await;

        let adapter = BittrexAdapter::new(&account(&server.uri())).unwrap();
        let ticker = adapter.get_ticker("BTC-USD").await.unwrap();
        assert_eq!(ticker.price, dec!(30000.5));
        assert_eq!(ticker.bid, dec!(30000.1));
        assert_eq!(ticker.ask, dec!(30000.9));
    }

    #[tokio::test]
    async fn executions_normalize_to_spend_and_receive() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/orders/src-1/executions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                "id": "exec-1",
                "quantity": "0.01",
                "rate": "30000",
                "commission": "0.75",
                "isTaker": true,
                "executedAt": "2024-05-01T12:00:00Z"
            }])))
            .mount(&server)
            .await;

        let adapter = BittrexAdapter::new(&account(&server.uri())).unwrap();
        let fills = adapter
            .get_trades_by_order(&buy_order("src-1"))
            .await
            .unwrap();
        assert_eq!(fills.len(), 1);
        // buy of 0.01 BTC at 30000: 300 USD spent, 0.01 BTC received
        assert_eq!(fills[0].price, dec!(300));
        assert_eq!(fills[0].quantity, dec!(0.01));
        assert_eq!(fills[0].fee, dec!(0.75));
        assert!(fills[0].is_taker);
    }

    #[tokio::test]
    async fn markets_map_venue_statuses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/markets"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {
                    "symbol": "BTC-USD",
                    "baseCurrencySymbol": "BTC",
                    "quoteCurrencySymbol": "USD",
                    "minTradeSize": "0.0001",
                    "status": "ONLINE",
                    "tags": ["spot"]
                },
                {
                    "symbol": "DOGE-USD",
                    "baseCurrencySymbol": "DOGE",
                    "quoteCurrencySymbol": "USD",
                    "minTradeSize": "1",
                    "status": "OFFLINE",
                    "tags": []
                }
            ])))
            .mount(&server)
            .await;

        let adapter = BittrexAdapter::new(&account(&server.uri())).unwrap();
        let markets = adapter.get_markets().await.unwrap();
        assert_eq!(markets[0].status, EntityStatus::Active);
        assert_eq!(markets[1].status, EntityStatus::Disabled);
    }
}
