//! Bybit v5 adapter
//!
//! REST: unified v5 endpoints (market data public; order/account signed with
//! HMAC-SHA256 over timestamp + key + recv_window + payload, hex-encoded in
//! the X-BAPI-SIGN header).
//! WS: public orderbook.1 channel per category; depth-1 pushes snapshots,
//! deeper books push snapshot + deltas.

use super::{
    AssetBalance, ExchangeAdapter, OrderAck, OrderParams, Position, TickerSubscription,
};
use crate::config::VenueCredentials;
use crate::error::EngineError;
use crate::market_data::BookUpdate;
use crate::types::{InstrumentType, OrderBookSnapshot, OrderSide, PriceLevel, TopOfBook};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde_json::{json, Value};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

const BYBIT_REST_URL: &str = "https://api.bybit.com";
const BYBIT_WS_PUBLIC_BASE: &str = "wss://stream.bybit.com/v5/public";
const RECV_WINDOW: &str = "5000";
const VENUE: &str = "bybit";

pub struct BybitAdapter {
    credentials: Option<VenueCredentials>,
    client: Client,
}

impl BybitAdapter {
    pub fn new(credentials: Option<VenueCredentials>) -> Self {
        Self {
            credentials,
            client: Client::new(),
        }
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// HMAC-SHA256(timestamp + api_key + recv_window + payload), hex-encoded
    fn sign(secret: &str, timestamp: u64, api_key: &str, payload: &str) -> String {
        let message = format!("{}{}{}{}", timestamp, api_key, RECV_WINDOW, payload);
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(message.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn credentials_for(&self, operation: &str) -> Result<&VenueCredentials, EngineError> {
        self.credentials
            .as_ref()
            .ok_or_else(|| EngineError::not_authenticated(VENUE, operation))
    }

    async fn public_get(&self, operation: &str, path: &str, query: &str) -> Result<Value, EngineError> {
        let url = format!("{}{}?{}", BYBIT_REST_URL, path, query);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::connection(VENUE, operation, e))?;
        let data: Value = response
            .json()
            .await
            .map_err(|e| EngineError::connection(VENUE, operation, e))?;
        Self::check_envelope(operation, data)
    }

    async fn signed_get(&self, operation: &str, path: &str, query: &str) -> Result<Value, EngineError> {
        let creds = self.credentials_for(operation)?;
        let timestamp = Self::timestamp_ms();
        let signature = Self::sign(&creds.api_secret, timestamp, &creds.api_key, query);

        let url = format!("{}{}?{}", BYBIT_REST_URL, path, query);
        let response = self
            .client
            .get(&url)
            .header("X-BAPI-API-KEY", &creds.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("X-BAPI-SIGN", signature)
            .send()
            .await
            .map_err(|e| EngineError::connection(VENUE, operation, e))?;
        let data: Value = response
            .json()
            .await
            .map_err(|e| EngineError::connection(VENUE, operation, e))?;
        Self::check_envelope(operation, data)
    }

    async fn signed_post(&self, operation: &str, path: &str, body: &Value) -> Result<Value, EngineError> {
        let creds = self.credentials_for(operation)?;
        let body_str = body.to_string();
        let timestamp = Self::timestamp_ms();
        let signature = Self::sign(&creds.api_secret, timestamp, &creds.api_key, &body_str);

        let url = format!("{}{}", BYBIT_REST_URL, path);
        let response = self
            .client
            .post(&url)
            .header("X-BAPI-API-KEY", &creds.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("X-BAPI-SIGN", signature)
            .header("Content-Type", "application/json")
            .body(body_str)
            .send()
            .await
            .map_err(|e| EngineError::connection(VENUE, operation, e))?;
        let data: Value = response
            .json()
            .await
            .map_err(|e| EngineError::connection(VENUE, operation, e))?;
        Self::check_envelope(operation, data)
    }

    /// Bybit wraps every response in {retCode, retMsg, result}
    fn check_envelope(operation: &str, data: Value) -> Result<Value, EngineError> {
        let ret_code = data.get("retCode").and_then(|v| v.as_i64()).unwrap_or(-1);
        if ret_code != 0 {
            let ret_msg = data
                .get("retMsg")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            return Err(EngineError::api(VENUE, operation, ret_code, ret_msg));
        }
        Ok(data.get("result").cloned().unwrap_or(Value::Null))
    }

    fn category_str(category: InstrumentType) -> &'static str {
        match category {
            InstrumentType::Spot => "spot",
            InstrumentType::Linear => "linear",
            InstrumentType::Inverse => "inverse",
        }
    }

    fn side_str(side: OrderSide) -> &'static str {
        match side {
            OrderSide::Buy => "Buy",
            OrderSide::Sell => "Sell",
        }
    }

    /// Levels come as arrays of ["price", "qty"] strings
    fn parse_levels(value: Option<&Value>) -> Vec<PriceLevel> {
        value
            .and_then(|v| v.as_array())
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| {
                        let price = row.get(0)?.as_str()?.parse::<f64>().ok()?;
                        let qty = row.get(1)?.as_str()?.parse::<f64>().ok()?;
                        Some(PriceLevel { price, qty })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn parse_price_field(value: &Value, field: &str) -> Option<f64> {
        value.get(field).and_then(|v| v.as_str()).and_then(|s| s.parse().ok())
    }
}

#[async_trait]
impl ExchangeAdapter for BybitAdapter {
    fn venue(&self) -> &str {
        VENUE
    }

    fn is_authenticated(&self) -> bool {
        self.credentials.is_some()
    }

    async fn initialize(&self) -> Result<(), EngineError> {
        if !self.test_connection().await? {
            return Err(EngineError::connection(
                VENUE,
                "initialize",
                "server time check failed",
            ));
        }
        match &self.credentials {
            Some(creds) if creds.api_key.is_empty() || creds.api_secret.is_empty() => {
                Err(EngineError::Config(
                    "bybit credentials present but empty".to_string(),
                ))
            }
            Some(_) => {
                // Round-trip a signed call so bad keys fail here, not mid-trade
                self.get_balance().await?;
                info!("Bybit adapter initialized (authenticated)");
                Ok(())
            }
            None => {
                info!("Bybit adapter initialized (public data only)");
                Ok(())
            }
        }
    }

    async fn get_top_of_book(
        &self,
        symbol: &str,
        category: InstrumentType,
    ) -> Result<TopOfBook, EngineError> {
        let query = format!(
            "category={}&symbol={}",
            Self::category_str(category),
            symbol
        );
        let result = self
            .public_get("get_top_of_book", "/v5/market/tickers", &query)
            .await?;

        let ticker = result
            .get("list")
            .and_then(|l| l.as_array())
            .and_then(|l| l.first())
            .ok_or_else(|| {
                EngineError::api(VENUE, "get_top_of_book", -1, "empty ticker list")
            })?;

        let bid = match (
            Self::parse_price_field(ticker, "bid1Price"),
            Self::parse_price_field(ticker, "bid1Size"),
        ) {
            (Some(price), Some(qty)) if price > 0.0 => Some(PriceLevel { price, qty }),
            _ => None,
        };
        let ask = match (
            Self::parse_price_field(ticker, "ask1Price"),
            Self::parse_price_field(ticker, "ask1Size"),
        ) {
            (Some(price), Some(qty)) if price > 0.0 => Some(PriceLevel { price, qty }),
            _ => None,
        };

        Ok(TopOfBook {
            venue: VENUE.to_string(),
            symbol: symbol.to_string(),
            bid,
            ask,
            observed_at: Utc::now(),
        })
    }

    async fn get_order_book(
        &self,
        symbol: &str,
        category: InstrumentType,
        depth: u32,
    ) -> Result<OrderBookSnapshot, EngineError> {
        let query = format!(
            "category={}&symbol={}&limit={}",
            Self::category_str(category),
            symbol,
            depth
        );
        let result = self
            .public_get("get_order_book", "/v5/market/orderbook", &query)
            .await?;

        Ok(OrderBookSnapshot {
            venue: VENUE.to_string(),
            symbol: symbol.to_string(),
            bids: Self::parse_levels(result.get("b")),
            asks: Self::parse_levels(result.get("a")),
            sequence: result.get("u").and_then(|v| v.as_u64()).unwrap_or(0),
            observed_at: Utc::now(),
        })
    }

    async fn place_order(&self, params: &OrderParams) -> Result<OrderAck, EngineError> {
        let mut body = json!({
            "category": Self::category_str(params.category),
            "symbol": params.symbol,
            "side": Self::side_str(params.side),
            "orderType": "Market",
            "qty": params.qty.to_string(),
        });
        if params.category == InstrumentType::Spot {
            // Quantity is in base coin; margin spot requires the leverage flag
            body["marketUnit"] = json!("baseCoin");
            body["isLeverage"] = json!(1);
        }
        if let Some(link_id) = &params.client_order_id {
            body["orderLinkId"] = json!(link_id);
        }

        let result = self
            .signed_post("place_order", "/v5/order/create", &body)
            .await?;

        let order_id = result
            .get("orderId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::api(VENUE, "place_order", -1, "missing orderId"))?
            .to_string();

        debug!(symbol = %params.symbol, side = %params.side, order_id = %order_id, "bybit order accepted");

        // Market order acks carry no fill price
        Ok(OrderAck {
            order_id,
            price: Self::parse_price_field(&result, "avgPrice"),
        })
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
        category: InstrumentType,
    ) -> Result<(), EngineError> {
        let body = json!({
            "category": Self::category_str(category),
            "symbol": symbol,
            "orderId": order_id,
        });
        self.signed_post("cancel_order", "/v5/order/cancel", &body)
            .await?;
        Ok(())
    }

    async fn get_balance(&self) -> Result<Vec<AssetBalance>, EngineError> {
        let result = self
            .signed_get(
                "get_balance",
                "/v5/account/wallet-balance",
                "accountType=UNIFIED",
            )
            .await?;

        let coins = result
            .get("list")
            .and_then(|l| l.as_array())
            .and_then(|l| l.first())
            .and_then(|acct| acct.get("coin"))
            .and_then(|c| c.as_array())
            .cloned()
            .unwrap_or_default();

        Ok(coins
            .iter()
            .filter_map(|coin| {
                Some(AssetBalance {
                    asset: coin.get("coin")?.as_str()?.to_string(),
                    free: Self::parse_price_field(coin, "walletBalance")?,
                })
            })
            .collect())
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<Position>, EngineError> {
        let query = format!("category=linear&symbol={}", symbol);
        let result = self
            .signed_get("get_position", "/v5/position/list", &query)
            .await?;

        let entry = result
            .get("list")
            .and_then(|l| l.as_array())
            .and_then(|l| l.first())
            .cloned();

        Ok(entry.and_then(|pos| {
            let size = Self::parse_price_field(&pos, "size")?;
            if size == 0.0 {
                return None;
            }
            let side = match pos.get("side").and_then(|v| v.as_str()) {
                Some("Buy") => OrderSide::Buy,
                _ => OrderSide::Sell,
            };
            Some(Position {
                symbol: symbol.to_string(),
                side,
                size,
                entry_price: Self::parse_price_field(&pos, "avgPrice").unwrap_or(0.0),
            })
        }))
    }

    async fn test_connection(&self) -> Result<bool, EngineError> {
        let result = self.public_get("test_connection", "/v5/market/time", "").await?;
        Ok(result.get("timeSecond").is_some() || result.get("timeNano").is_some())
    }

    async fn cleanup(&self) -> Result<(), EngineError> {
        // No venue-side session state to release
        Ok(())
    }

    fn ws_endpoint(&self, category: InstrumentType) -> String {
        format!("{}/{}", BYBIT_WS_PUBLIC_BASE, Self::category_str(category))
    }

    fn subscribe_tickers(&self, items: &[TickerSubscription]) -> Vec<String> {
        if items.is_empty() {
            return Vec::new();
        }
        let args: Vec<String> = items
            .iter()
            .map(|item| format!("orderbook.1.{}", item.symbol))
            .collect();
        vec![json!({ "op": "subscribe", "args": args }).to_string()]
    }

    fn unsubscribe_tickers(&self, items: &[TickerSubscription]) -> Vec<String> {
        if items.is_empty() {
            return Vec::new();
        }
        let args: Vec<String> = items
            .iter()
            .map(|item| format!("orderbook.1.{}", item.symbol))
            .collect();
        vec![json!({ "op": "unsubscribe", "args": args }).to_string()]
    }

    fn heartbeat_frame(&self) -> Option<String> {
        Some(json!({ "op": "ping" }).to_string())
    }

    fn parse_ws_message(&self, category: InstrumentType, text: &str) -> Option<BookUpdate> {
        let message: Value = serde_json::from_str(text).ok()?;
        let topic = message.get("topic")?.as_str()?;
        // topic: orderbook.{depth}.{symbol}
        let mut parts = topic.splitn(3, '.');
        if parts.next() != Some("orderbook") {
            return None;
        }
        let _depth = parts.next()?;
        let symbol = parts.next()?.to_string();

        let is_snapshot = match message.get("type").and_then(|v| v.as_str()) {
            Some("snapshot") => true,
            Some("delta") => false,
            _ => {
                warn!(topic = %topic, "bybit book message without type");
                return None;
            }
        };

        let data = message.get("data")?;
        Some(BookUpdate {
            symbol,
            category,
            bids: Self::parse_levels(data.get("b")),
            asks: Self::parse_levels(data.get("a")),
            sequence: data.get("u").and_then(|v| v.as_u64()).unwrap_or(0),
            is_snapshot,
        })
    }
}
