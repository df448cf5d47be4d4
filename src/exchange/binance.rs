//! Binance spot adapter
//!
//! REST: api/v3 endpoints; signed calls append an HMAC-SHA256 hex signature
//! over the query string and carry the key in X-MBX-APIKEY.
//! WS: bookTicker stream (top-of-book only). Linear/inverse categories are
//! not offered on this adapter; legs requesting them fail validation.

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
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

type HmacSha256 = Hmac<Sha256>;

const BINANCE_REST_URL: &str = "https://api.binance.com";
const BINANCE_WS_URL: &str = "wss://stream.binance.com:9443/ws";
const VENUE: &str = "binance";

pub struct BinanceAdapter {
    credentials: Option<VenueCredentials>,
    client: Client,
    /// Stream subscribe requests need unique ids
    request_id: AtomicU64,
}

impl BinanceAdapter {
    pub fn new(credentials: Option<VenueCredentials>) -> Self {
        Self {
            credentials,
            client: Client::new(),
            request_id: AtomicU64::new(1),
        }
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn sign(secret: &str, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn credentials_for(&self, operation: &str) -> Result<&VenueCredentials, EngineError> {
        self.credentials
            .as_ref()
            .ok_or_else(|| EngineError::not_authenticated(VENUE, operation))
    }

    fn spot_only(category: InstrumentType, operation: &str) -> Result<(), EngineError> {
        if category != InstrumentType::Spot {
            return Err(EngineError::Validation(format!(
                "binance adapter supports spot only, {} requested for {}",
                category, operation
            )));
        }
        Ok(())
    }

    async fn parse_response(operation: &str, response: reqwest::Response) -> Result<Value, EngineError> {
        let status = response.status();
        let data: Value = response
            .json()
            .await
            .map_err(|e| EngineError::connection(VENUE, operation, e))?;
        // Binance errors come as {"code": -1121, "msg": "..."} with a 4xx status
        if let Some(code) = data.get("code").and_then(|v| v.as_i64()) {
            if code != 0 && data.get("msg").is_some() {
                let msg = data.get("msg").and_then(|v| v.as_str()).unwrap_or("");
                return Err(EngineError::api(VENUE, operation, code, msg));
            }
        }
        if !status.is_success() {
            return Err(EngineError::api(
                VENUE,
                operation,
                status.as_u16() as i64,
                "HTTP error",
            ));
        }
        Ok(data)
    }

    async fn public_get(&self, operation: &str, path: &str, query: &str) -> Result<Value, EngineError> {
        let url = if query.is_empty() {
            format!("{}{}", BINANCE_REST_URL, path)
        } else {
            format!("{}{}?{}", BINANCE_REST_URL, path, query)
        };
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::connection(VENUE, operation, e))?;
        Self::parse_response(operation, response).await
    }

    async fn signed_request(
        &self,
        operation: &str,
        method: reqwest::Method,
        path: &str,
        query: &str,
    ) -> Result<Value, EngineError> {
        let creds = self.credentials_for(operation)?;
        let query_with_ts = if query.is_empty() {
            format!("timestamp={}", Self::timestamp_ms())
        } else {
            format!("{}&timestamp={}", query, Self::timestamp_ms())
        };
        let signature = Self::sign(&creds.api_secret, &query_with_ts);
        let url = format!(
            "{}{}?{}&signature={}",
            BINANCE_REST_URL, path, query_with_ts, signature
        );

        let response = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &creds.api_key)
            .send()
            .await
            .map_err(|e| EngineError::connection(VENUE, operation, e))?;
        Self::parse_response(operation, response).await
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
impl ExchangeAdapter for BinanceAdapter {
    fn venue(&self) -> &str {
        VENUE
    }

    fn is_authenticated(&self) -> bool {
        self.credentials.is_some()
    }

    fn supports_category(&self, category: InstrumentType) -> bool {
        category == InstrumentType::Spot
    }

    async fn initialize(&self) -> Result<(), EngineError> {
        if !self.test_connection().await? {
            return Err(EngineError::connection(VENUE, "initialize", "ping failed"));
        }
        match &self.credentials {
            Some(creds) if creds.api_key.is_empty() || creds.api_secret.is_empty() => {
                Err(EngineError::Config(
                    "binance credentials present but empty".to_string(),
                ))
            }
            Some(_) => {
                self.get_balance().await?;
                info!("Binance adapter initialized (authenticated)");
                Ok(())
            }
            None => {
                info!("Binance adapter initialized (public data only)");
                Ok(())
            }
        }
    }

    async fn get_top_of_book(
        &self,
        symbol: &str,
        category: InstrumentType,
    ) -> Result<TopOfBook, EngineError> {
        Self::spot_only(category, "get_top_of_book")?;
        let query = format!("symbol={}", symbol);
        let data = self
            .public_get("get_top_of_book", "/api/v3/ticker/bookTicker", &query)
            .await?;

        let bid = match (
            Self::parse_price_field(&data, "bidPrice"),
            Self::parse_price_field(&data, "bidQty"),
        ) {
            (Some(price), Some(qty)) if price > 0.0 => Some(PriceLevel { price, qty }),
            _ => None,
        };
        let ask = match (
            Self::parse_price_field(&data, "askPrice"),
            Self::parse_price_field(&data, "askQty"),
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
        Self::spot_only(category, "get_order_book")?;
        let query = format!("symbol={}&limit={}", symbol, depth);
        let data = self.public_get("get_order_book", "/api/v3/depth", &query).await?;

        Ok(OrderBookSnapshot {
            venue: VENUE.to_string(),
            symbol: symbol.to_string(),
            bids: Self::parse_levels(data.get("bids")),
            asks: Self::parse_levels(data.get("asks")),
            sequence: data.get("lastUpdateId").and_then(|v| v.as_u64()).unwrap_or(0),
            observed_at: Utc::now(),
        })
    }

    async fn place_order(&self, params: &OrderParams) -> Result<OrderAck, EngineError> {
        Self::spot_only(params.category, "place_order")?;
        let side = match params.side {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        };
        let mut query = format!(
            "symbol={}&side={}&type=MARKET&quantity={}",
            params.symbol, side, params.qty
        );
        if let Some(client_id) = &params.client_order_id {
            query.push_str(&format!("&newClientOrderId={}", client_id));
        }

        let data = self
            .signed_request("place_order", reqwest::Method::POST, "/api/v3/order", &query)
            .await?;

        let order_id = data
            .get("orderId")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| EngineError::api(VENUE, "place_order", -1, "missing orderId"))?
            .to_string();

        // Average the fills for a realized price
        let price = data
            .get("fills")
            .and_then(|f| f.as_array())
            .and_then(|fills| {
                let mut notional = 0.0;
                let mut qty = 0.0;
                for fill in fills {
                    let p = Self::parse_price_field(fill, "price")?;
                    let q = Self::parse_price_field(fill, "qty")?;
                    notional += p * q;
                    qty += q;
                }
                if qty > 0.0 {
                    Some(notional / qty)
                } else {
                    None
                }
            });

        debug!(symbol = %params.symbol, side = %params.side, order_id = %order_id, "binance order accepted");

        Ok(OrderAck { order_id, price })
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
        category: InstrumentType,
    ) -> Result<(), EngineError> {
        Self::spot_only(category, "cancel_order")?;
        let query = format!("symbol={}&orderId={}", symbol, order_id);
        self.signed_request("cancel_order", reqwest::Method::DELETE, "/api/v3/order", &query)
            .await?;
        Ok(())
    }

    async fn get_balance(&self) -> Result<Vec<AssetBalance>, EngineError> {
        let data = self
            .signed_request("get_balance", reqwest::Method::GET, "/api/v3/account", "")
            .await?;

        Ok(data
            .get("balances")
            .and_then(|b| b.as_array())
            .map(|balances| {
                balances
                    .iter()
                    .filter_map(|bal| {
                        let free = Self::parse_price_field(bal, "free")?;
                        if free <= 0.0 {
                            return None;
                        }
                        Some(AssetBalance {
                            asset: bal.get("asset")?.as_str()?.to_string(),
                            free,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_position(&self, _symbol: &str) -> Result<Option<Position>, EngineError> {
        // Spot venue: no derivatives positions
        Ok(None)
    }

    async fn test_connection(&self) -> Result<bool, EngineError> {
        let data = self.public_get("test_connection", "/api/v3/ping", "").await?;
        Ok(data.is_object())
    }

    async fn cleanup(&self) -> Result<(), EngineError> {
        Ok(())
    }

    fn ws_endpoint(&self, _category: InstrumentType) -> String {
        BINANCE_WS_URL.to_string()
    }

    fn subscribe_tickers(&self, items: &[TickerSubscription]) -> Vec<String> {
        if items.is_empty() {
            return Vec::new();
        }
        let params: Vec<String> = items
            .iter()
            .map(|item| format!("{}@bookTicker", item.symbol.to_lowercase()))
            .collect();
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        vec![json!({ "method": "SUBSCRIBE", "params": params, "id": id }).to_string()]
    }

    fn unsubscribe_tickers(&self, items: &[TickerSubscription]) -> Vec<String> {
        if items.is_empty() {
            return Vec::new();
        }
        let params: Vec<String> = items
            .iter()
            .map(|item| format!("{}@bookTicker", item.symbol.to_lowercase()))
            .collect();
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        vec![json!({ "method": "UNSUBSCRIBE", "params": params, "id": id }).to_string()]
    }

    fn parse_ws_message(&self, category: InstrumentType, text: &str) -> Option<BookUpdate> {
        let message: Value = serde_json::from_str(text).ok()?;
        // bookTicker payload: {"u": id, "s": symbol, "b": bid, "B": bidQty, "a": ask, "A": askQty}
        let symbol = message.get("s")?.as_str()?.to_string();
        let bid_price = Self::parse_price_field(&message, "b")?;
        let bid_qty = Self::parse_price_field(&message, "B")?;
        let ask_price = Self::parse_price_field(&message, "a")?;
        let ask_qty = Self::parse_price_field(&message, "A")?;

        Some(BookUpdate {
            symbol,
            category,
            bids: vec![PriceLevel { price: bid_price, qty: bid_qty }],
            asks: vec![PriceLevel { price: ask_price, qty: ask_qty }],
            sequence: message.get("u").and_then(|v| v.as_u64()).unwrap_or(0),
            is_snapshot: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_matches_known_vector() {
        // From the Binance API documentation signature example
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        let signature = BinanceAdapter::sign(secret, query);
        assert_eq!(
            signature,
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn test_subscribe_frame_format() {
        let adapter = BinanceAdapter::new(None);
        let frames = adapter.subscribe_tickers(&[TickerSubscription {
            symbol: "BTCUSDT".to_string(),
            category: InstrumentType::Spot,
        }]);
        assert_eq!(frames.len(), 1);
        let parsed: Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(parsed["method"], "SUBSCRIBE");
        assert_eq!(parsed["params"][0], "btcusdt@bookTicker");
    }

    #[test]
    fn test_parse_book_ticker() {
        let adapter = BinanceAdapter::new(None);
        let text = r#"{"u":400900217,"s":"BTCUSDT","b":"50000.10","B":"31.21","a":"50000.20","A":"40.66"}"#;
        let update = adapter
            .parse_ws_message(InstrumentType::Spot, text)
            .expect("should parse");
        assert_eq!(update.symbol, "BTCUSDT");
        assert!(update.is_snapshot);
        assert_eq!(update.bids[0].price, 50000.10);
        assert_eq!(update.asks[0].qty, 40.66);
    }

    #[test]
    fn test_parse_ignores_acks() {
        let adapter = BinanceAdapter::new(None);
        assert!(adapter
            .parse_ws_message(InstrumentType::Spot, r#"{"result":null,"id":1}"#)
            .is_none());
    }

    #[test]
    fn test_non_spot_rejected() {
        let err = BinanceAdapter::spot_only(InstrumentType::Linear, "get_order_book").unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_supported_categories() {
        let adapter = BinanceAdapter::new(None);
        assert!(adapter.supports_category(InstrumentType::Spot));
        assert!(!adapter.supports_category(InstrumentType::Linear));
        assert!(!adapter.supports_category(InstrumentType::Inverse));
    }
}
