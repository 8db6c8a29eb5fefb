use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use tracing::{debug, info, warn};

use common::models::{Credentials, ExchangeId, OrderType, Side};

use crate::error::ExchangeError;
use crate::{Exchange, Market, OrderRequest, OrderState, Position, SubmittedOrder};

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_BASE_URL: &str = "https://api.bybit.com";
const RECV_WINDOW: &str = "5000";
const CATEGORY: &str = "linear";
// One-way position mode; hedge accounts would route 1/2 here.
const POSITION_IDX: u32 = 0;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg", default)]
    ret_msg: String,
    #[serde(default)]
    result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct InstrumentList {
    list: Vec<Instrument>,
}

#[derive(Debug, Deserialize)]
struct Instrument {
    symbol: String,
    #[serde(default)]
    status: String,
    #[serde(rename = "lotSizeFilter")]
    lot_size_filter: LotSizeFilter,
    #[serde(rename = "priceFilter")]
    price_filter: PriceFilter,
}

#[derive(Debug, Deserialize)]
struct LotSizeFilter {
    #[serde(rename = "qtyStep")]
    qty_step: String,
}

#[derive(Debug, Deserialize)]
struct PriceFilter {
    #[serde(rename = "tickSize")]
    tick_size: String,
}

#[derive(Debug, Deserialize)]
struct TickerList {
    list: Vec<Ticker>,
}

#[derive(Debug, Deserialize)]
struct Ticker {
    #[serde(rename = "lastPrice")]
    last_price: String,
}

#[derive(Debug, Deserialize)]
struct OrderResult {
    #[serde(rename = "orderId")]
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct OrderList {
    list: Vec<OrderRow>,
}

#[derive(Debug, Deserialize)]
struct OrderRow {
    #[serde(rename = "orderStatus")]
    order_status: String,
    #[serde(rename = "avgPrice", default)]
    avg_price: String,
    #[serde(rename = "cumExecQty", default)]
    cum_exec_qty: String,
}

#[derive(Debug, Deserialize)]
struct PositionList {
    list: Vec<PositionRow>,
}

#[derive(Debug, Deserialize)]
struct PositionRow {
    symbol: String,
    side: String,
    size: String,
    #[serde(rename = "avgPrice", default)]
    avg_price: String,
}

#[derive(Debug, Deserialize)]
struct WalletList {
    list: Vec<WalletAccount>,
}

#[derive(Debug, Deserialize)]
struct WalletAccount {
    coin: Vec<WalletCoin>,
}

#[derive(Debug, Deserialize)]
struct WalletCoin {
    coin: String,
    #[serde(rename = "walletBalance", default)]
    wallet_balance: String,
}

/// Bybit v5 linear perpetual session. Isolated margin plus one-way
/// position index are set up before the first order on a symbol.
pub struct BybitFutures {
    client: Client,
    base_url: String,
    api_key: String,
    secret_key: String,
    markets: HashMap<String, Market>,
}

impl BybitFutures {
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

        let instruments: InstrumentList = session
            .public_get(
                "/v5/market/instruments-info",
                &[("category", CATEGORY), ("limit", "1000")],
            )
            .await?;
        for instrument in instruments.list {
            if instrument.status != "Trading" {
                continue;
            }
            session.markets.insert(
                instrument.symbol.clone(),
                Market {
                    symbol: instrument.symbol,
                    quantity_precision: decimals_of(&instrument.lot_size_filter.qty_step),
                    price_precision: decimals_of(&instrument.price_filter.tick_size),
                },
            );
        }
        debug!("loaded {} bybit linear markets", session.markets.len());

        // Signed call up front so bad credentials fail at session creation.
        let _: WalletList = session
            .signed_get(
                "/v5/account/wallet-balance",
                &[("accountType", "UNIFIED")],
            )
            .await?;

        Ok(session)
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(payload.as_bytes());
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
        query: &[(&str, &str)],
    ) -> Result<T, ExchangeError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.client.get(&url).query(query).send().await?;
        let envelope = resp.json::<Envelope>().await
            .map_err(|e| ExchangeError::MarketData(e.to_string()))?;
        unwrap_envelope(envelope)
    }

    async fn signed_get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ExchangeError> {
        let query_string = query
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let timestamp = Self::timestamp_ms().to_string();
        let signature = self.sign(&format!(
            "{timestamp}{}{RECV_WINDOW}{query_string}",
            self.api_key
        ));

        let url = format!("{}{}?{}", self.base_url, path, query_string);
        let resp = self
            .client
            .get(&url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", &timestamp)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("X-BAPI-SIGN", &signature)
            .send()
            .await?;
        let envelope = resp.json::<Envelope>().await?;
        unwrap_envelope(envelope)
    }

    async fn signed_post(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<Envelope, ExchangeError> {
        let payload = body.to_string();
        let timestamp = Self::timestamp_ms().to_string();
        let signature = self.sign(&format!(
            "{timestamp}{}{RECV_WINDOW}{payload}",
            self.api_key
        ));

        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", &timestamp)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("X-BAPI-SIGN", &signature)
            .header("Content-Type", "application/json")
            .body(payload)
            .send()
            .await?;
        Ok(resp.json::<Envelope>().await?)
    }
}

fn unwrap_envelope<T: serde::de::DeserializeOwned>(envelope: Envelope) -> Result<T, ExchangeError> {
    if envelope.ret_code != 0 {
        return Err(classify(envelope.ret_code, &envelope.ret_msg));
    }
    serde_json::from_value(envelope.result)
        .map_err(|e| ExchangeError::Rejected(format!("unexpected response shape: {e}")))
}

fn classify(ret_code: i64, ret_msg: &str) -> ExchangeError {
    match ret_code {
        // invalid key, bad signature, permission denied, expired key
        10003 | 10004 | 10005 | 33004 => {
            ExchangeError::Auth(format!("{ret_msg} ({ret_code})"))
        }
        // system-level errors the venue reports as temporarily unavailable
        10002 | 10006 | 10016 => ExchangeError::Network(format!("{ret_msg} ({ret_code})")),
        _ => ExchangeError::Rejected(format!("{ret_msg} ({ret_code})")),
    }
}

/// Decimal places implied by a filter step like "0.001".
fn decimals_of(step: &str) -> u32 {
    match step.split_once('.') {
        Some((_, frac)) => frac.trim_end_matches('0').len() as u32,
        None => 0,
    }
}

fn format_qty(value: f64) -> String {
    value.to_string()
}

#[async_trait]
impl Exchange for BybitFutures {
    fn venue(&self) -> ExchangeId {
        ExchangeId::Bybit
    }

    fn market(&self, symbol: &str) -> Result<Market, ExchangeError> {
        self.markets
            .get(symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::MarketUnknown(symbol.to_string()))
    }

    async fn last_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let tickers: TickerList = self
            .public_get(
                "/v5/market/tickers",
                &[("category", CATEGORY), ("symbol", symbol)],
            )
            .await?;
        tickers
            .list
            .first()
            .and_then(|t| t.last_price.parse::<f64>().ok())
            .filter(|p| *p > 0.0)
            .ok_or_else(|| ExchangeError::MarketData(format!("no last price for {symbol}")))
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        let leverage = leverage.to_string();

        // Isolated margin first; the venue rejects leverage changes on the
        // wrong trade mode.
        let envelope = self
            .signed_post(
                "/v5/position/switch-isolated",
                json!({
                    "category": CATEGORY,
                    "symbol": symbol,
                    "tradeMode": 1,
                    "buyLeverage": leverage,
                    "sellLeverage": leverage,
                }),
            )
            .await?;
        // 110026/110027: margin mode already as requested
        if !matches!(envelope.ret_code, 0 | 110026 | 110027) {
            return Err(classify(envelope.ret_code, &envelope.ret_msg));
        }

        let envelope = self
            .signed_post(
                "/v5/position/set-leverage",
                json!({
                    "category": CATEGORY,
                    "symbol": symbol,
                    "buyLeverage": leverage,
                    "sellLeverage": leverage,
                }),
            )
            .await?;
        // 110043: leverage not modified
        if !matches!(envelope.ret_code, 0 | 110043) {
            return Err(classify(envelope.ret_code, &envelope.ret_msg));
        }
        Ok(())
    }

    async fn submit_order(&self, order: &OrderRequest) -> Result<SubmittedOrder, ExchangeError> {
        let side = match order.side {
            Side::Buy => "Buy",
            Side::Sell => "Sell",
        };
        let mut body = json!({
            "category": CATEGORY,
            "symbol": order.symbol,
            "side": side,
            "qty": format_qty(order.quantity),
            "reduceOnly": order.reduce_only,
            "positionIdx": POSITION_IDX,
        });

        match (order.order_type, order.stop_price) {
            (_, Some(stop)) => {
                // Stop-market leg: market order armed by a trigger price.
                body["orderType"] = json!("Market");
                body["triggerPrice"] = json!(stop.to_string());
                // Sell stops arm below the market, buy stops above.
                body["triggerDirection"] = match order.side {
                    Side::Sell => json!(2),
                    Side::Buy => json!(1),
                };
            }
            (OrderType::Market, None) => {
                body["orderType"] = json!("Market");
            }
            (OrderType::Limit, None) => {
                let price = order.price.ok_or_else(|| {
                    ExchangeError::Rejected("limit order without a price".to_string())
                })?;
                body["orderType"] = json!("Limit");
                body["price"] = json!(price.to_string());
                body["timeInForce"] = json!("GTC");
            }
        }

        info!(
            "bybit order: {} {} {} qty={}",
            side,
            order.order_type.as_str(),
            order.symbol,
            order.quantity
        );

        let envelope = self.signed_post("/v5/order/create", body).await?;
        if envelope.ret_code != 0 {
            return Err(classify(envelope.ret_code, &envelope.ret_msg));
        }
        let raw = envelope.result.clone();
        let parsed: OrderResult = serde_json::from_value(envelope.result)
            .map_err(|e| ExchangeError::Rejected(format!("unexpected order response: {e}")))?;

        Ok(SubmittedOrder {
            order_id: parsed.order_id,
            raw,
        })
    }

    async fn confirm_order(
        &self,
        order_id: &str,
        symbol: &str,
    ) -> Result<OrderState, ExchangeError> {
        let orders: OrderList = self
            .signed_get(
                "/v5/order/realtime",
                &[
                    ("category", CATEGORY),
                    ("symbol", symbol),
                    ("orderId", order_id),
                ],
            )
            .await?;
        let Some(row) = orders.list.into_iter().next() else {
            warn!("order {order_id} not yet visible on bybit, reporting as open");
            return Ok(OrderState {
                status: "New".to_string(),
                avg_price: None,
                filled_qty: 0.0,
                raw: serde_json::Value::Null,
            });
        };

        let raw = serde_json::json!({
            "orderStatus": row.order_status,
            "avgPrice": row.avg_price,
            "cumExecQty": row.cum_exec_qty,
        });
        Ok(OrderState {
            status: row.order_status,
            avg_price: row.avg_price.parse::<f64>().ok().filter(|p| *p > 0.0),
            filled_qty: row.cum_exec_qty.parse().unwrap_or(0.0),
            raw,
        })
    }

    async fn positions<'a>(&self, symbol: Option<&'a str>) -> Result<Vec<Position>, ExchangeError> {
        let query: Vec<(&str, &str)> = match symbol {
            Some(symbol) => vec![("category", CATEGORY), ("symbol", symbol)],
            None => vec![("category", CATEGORY), ("settleCoin", "USDT")],
        };
        let positions: PositionList = self.signed_get("/v5/position/list", &query).await?;

        Ok(positions
            .list
            .into_iter()
            .filter_map(|row| {
                let size: f64 = row.size.parse().ok()?;
                if size <= 0.0 {
                    return None;
                }
                let side = match row.side.as_str() {
                    "Buy" => Side::Buy,
                    "Sell" => Side::Sell,
                    _ => return None,
                };
                Some(Position {
                    symbol: row.symbol,
                    side,
                    size,
                    entry_price: row.avg_price.parse().unwrap_or(0.0),
                })
            })
            .collect())
    }

    async fn balance(&self, asset: &str) -> Result<f64, ExchangeError> {
        let wallets: WalletList = self
            .signed_get(
                "/v5/account/wallet-balance",
                &[("accountType", "UNIFIED")],
            )
            .await?;
        Ok(wallets
            .list
            .first()
            .and_then(|account| account.coin.iter().find(|c| c.coin == asset))
            .and_then(|c| c.wallet_balance.parse().ok())
            .unwrap_or(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_decimals() {
        assert_eq!(decimals_of("0.001"), 3);
        assert_eq!(decimals_of("0.10"), 1);
        assert_eq!(decimals_of("1"), 0);
        assert_eq!(decimals_of("0.5"), 1);
    }

    #[test]
    fn auth_codes_map_to_auth_errors() {
        assert!(matches!(classify(10003, "invalid key"), ExchangeError::Auth(_)));
        assert!(matches!(classify(10004, "bad sign"), ExchangeError::Auth(_)));
        assert!(classify(10016, "service restarting").is_transient());
        assert!(matches!(
            classify(110007, "insufficient balance"),
            ExchangeError::Rejected(_)
        ));
    }
}
