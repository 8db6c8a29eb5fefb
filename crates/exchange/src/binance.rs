use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, info};

use common::models::{Credentials, ExchangeId, OrderType, Side};

use crate::error::ExchangeError;
use crate::{Exchange, Market, OrderRequest, OrderState, Position, SubmittedOrder};

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_BASE_URL: &str = "https://fapi.binance.com";

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    symbol: String,
    status: String,
    #[serde(rename = "quantityPrecision")]
    quantity_precision: u32,
    #[serde(rename = "pricePrecision")]
    price_precision: u32,
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    #[serde(rename = "orderId")]
    order_id: u64,
}

#[derive(Debug, Deserialize)]
struct OrderQuery {
    status: String,
    #[serde(rename = "avgPrice", default)]
    avg_price: String,
    #[serde(rename = "executedQty", default)]
    executed_qty: String,
}

#[derive(Debug, Deserialize)]
struct PositionRisk {
    symbol: String,
    #[serde(rename = "positionAmt")]
    position_amt: String,
    #[serde(rename = "entryPrice")]
    entry_price: String,
}

#[derive(Debug, Deserialize)]
struct AssetBalance {
    asset: String,
    #[serde(rename = "availableBalance")]
    available_balance: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    msg: String,
}

/// USDT-margined futures session. Market metadata is loaded once at
/// connect and credentials are validated with one signed call.
pub struct BinanceFutures {
    client: Client,
    base_url: String,
    api_key: String,
    secret_key: String,
    markets: HashMap<String, Market>,
}

impl BinanceFutures {
    pub async fn connect(
        credentials: Credentials,
        base_url: Option<String>,
    ) -> Result<Self, ExchangeError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ExchangeError::Network(e.to_string()))?;

        let mut session = Self {
            client,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key: credentials.api_key,
            secret_key: credentials.api_secret,
            markets: HashMap::new(),
        };

        let info: ExchangeInfo = session.public_get("/fapi/v1/exchangeInfo", &[]).await?;
        for symbol in info.symbols {
            if symbol.status != "TRADING" {
                continue;
            }
            session.markets.insert(
                symbol.symbol.clone(),
                Market {
                    symbol: symbol.symbol,
                    quantity_precision: symbol.quantity_precision,
                    price_precision: symbol.price_precision,
                },
            );
        }
        debug!("loaded {} binance futures markets", session.markets.len());

        // One signed call so bad credentials fail at session creation.
        let _: Vec<AssetBalance> = session
            .signed_request(Method::GET, "/fapi/v2/balance", Vec::new())
            .await?;

        Ok(session)
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    async fn public_get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.client.get(&url).query(query).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify(status, &body));
        }
        resp.json::<T>()
            .await
            .map_err(|e| ExchangeError::MarketData(e.to_string()))
    }

    async fn signed_request<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: Vec<(&str, String)>,
    ) -> Result<T, ExchangeError> {
        let mut query: String = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!("timestamp={}", Self::timestamp_ms()));

        let signature = self.sign(&query);
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        let resp = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify(status, &body));
        }
        resp.json::<T>()
            .await
            .map_err(|e| ExchangeError::Network(e.to_string()))
    }
}

fn classify(status: StatusCode, body: &str) -> ExchangeError {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return ExchangeError::Auth(body.to_string());
    }
    if let Ok(api) = serde_json::from_str::<ApiError>(body) {
        // -2014 bad api key format, -2015 rejected key/ip, -1022 bad signature
        if matches!(api.code, -2014 | -2015 | -1022) {
            return ExchangeError::Auth(api.msg);
        }
        if status.is_client_error() {
            return ExchangeError::Rejected(format!("{} ({})", api.msg, api.code));
        }
    }
    if status.is_server_error() {
        return ExchangeError::Network(format!("HTTP {status}: {body}"));
    }
    ExchangeError::Rejected(format!("HTTP {status}: {body}"))
}

fn parse_price(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok().filter(|p| *p > 0.0)
}

#[async_trait]
impl Exchange for BinanceFutures {
    fn venue(&self) -> ExchangeId {
        ExchangeId::Binance
    }

    fn market(&self, symbol: &str) -> Result<Market, ExchangeError> {
        self.markets
            .get(symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::MarketUnknown(symbol.to_string()))
    }

    async fn last_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let ticker: TickerPrice = self
            .public_get("/fapi/v1/ticker/price", &[("symbol", symbol.to_string())])
            .await?;
        parse_price(&ticker.price)
            .ok_or_else(|| ExchangeError::MarketData(format!("no last price for {symbol}")))
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("leverage", leverage.to_string()),
        ];
        let _: serde_json::Value = self
            .signed_request(Method::POST, "/fapi/v1/leverage", params)
            .await?;
        Ok(())
    }

    async fn submit_order(&self, order: &OrderRequest) -> Result<SubmittedOrder, ExchangeError> {
        let side = match order.side {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        };
        let mut params = vec![
            ("symbol", order.symbol.clone()),
            ("side", side.to_string()),
        ];

        match (order.order_type, order.stop_price) {
            (_, Some(stop)) => {
                params.push(("type", "STOP_MARKET".to_string()));
                params.push(("stopPrice", stop.to_string()));
                params.push(("quantity", order.quantity.to_string()));
            }
            (OrderType::Market, None) => {
                params.push(("type", "MARKET".to_string()));
                params.push(("quantity", order.quantity.to_string()));
            }
            (OrderType::Limit, None) => {
                let price = order.price.ok_or_else(|| {
                    ExchangeError::Rejected("limit order without a price".to_string())
                })?;
                params.push(("type", "LIMIT".to_string()));
                params.push(("timeInForce", "GTC".to_string()));
                params.push(("quantity", order.quantity.to_string()));
                params.push(("price", price.to_string()));
            }
        }
        if order.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        info!(
            "binance order: {} {} {} qty={}",
            side,
            order.order_type.as_str(),
            order.symbol,
            order.quantity
        );

        let raw: serde_json::Value = self
            .signed_request(Method::POST, "/fapi/v1/order", params)
            .await?;
        let parsed: OrderResponse = serde_json::from_value(raw.clone())
            .map_err(|e| ExchangeError::Rejected(format!("unexpected order response: {e}")))?;

        Ok(SubmittedOrder {
            order_id: parsed.order_id.to_string(),
            raw,
        })
    }

    async fn confirm_order(
        &self,
        order_id: &str,
        symbol: &str,
    ) -> Result<OrderState, ExchangeError> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        let raw: serde_json::Value = self
            .signed_request(Method::GET, "/fapi/v1/order", params)
            .await?;
        let parsed: OrderQuery = serde_json::from_value(raw.clone())
            .map_err(|e| ExchangeError::Rejected(format!("unexpected order state: {e}")))?;

        Ok(OrderState {
            status: parsed.status,
            avg_price: parse_price(&parsed.avg_price),
            filled_qty: parsed.executed_qty.parse().unwrap_or(0.0),
            raw,
        })
    }

    async fn positions<'a>(&self, symbol: Option<&'a str>) -> Result<Vec<Position>, ExchangeError> {
        let mut params = Vec::new();
        if let Some(symbol) = symbol {
            params.push(("symbol", symbol.to_string()));
        }
        let rows: Vec<PositionRisk> = self
            .signed_request(Method::GET, "/fapi/v2/positionRisk", params)
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let amount: f64 = row.position_amt.parse().ok()?;
                if amount == 0.0 {
                    return None;
                }
                Some(Position {
                    symbol: row.symbol,
                    side: if amount > 0.0 { Side::Buy } else { Side::Sell },
                    size: amount.abs(),
                    entry_price: row.entry_price.parse().unwrap_or(0.0),
                })
            })
            .collect())
    }

    async fn balance(&self, asset: &str) -> Result<f64, ExchangeError> {
        let rows: Vec<AssetBalance> = self
            .signed_request(Method::GET, "/fapi/v2/balance", Vec::new())
            .await?;
        Ok(rows
            .into_iter()
            .find(|row| row.asset == asset)
            .and_then(|row| row.available_balance.parse().ok())
            .unwrap_or(0.0))
    }
}
