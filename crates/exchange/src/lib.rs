use async_trait::async_trait;

use common::models::{ExchangeId, OrderType, Side};

pub mod binance;
pub mod bybit;
pub mod connector;
pub mod error;
pub mod retry;

pub use connector::{Connector, LiveConnector};
pub use error::ExchangeError;

/// Market metadata loaded once per session.
#[derive(Debug, Clone)]
pub struct Market {
    pub symbol: String,
    pub quantity_precision: u32,
    pub price_precision: u32,
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    pub reduce_only: bool,
    /// Set for stop-triggered legs; the adapter maps it to the venue's
    /// stop-market order form.
    pub stop_price: Option<f64>,
}

impl OrderRequest {
    pub fn market(symbol: impl Into<String>, side: Side, quantity: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            reduce_only: false,
            stop_price: None,
        }
    }

    pub fn limit(symbol: impl Into<String>, side: Side, quantity: f64, price: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
            reduce_only: false,
            stop_price: None,
        }
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }

    pub fn stop_at(mut self, trigger: f64) -> Self {
        self.stop_price = Some(trigger);
        self
    }
}

#[derive(Debug, Clone)]
pub struct SubmittedOrder {
    pub order_id: String,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct OrderState {
    pub status: String,
    pub avg_price: Option<f64>,
    pub filled_qty: f64,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
}

/// Uniform view of one remote exchange. A value of this trait is a live
/// session: construction has already loaded market metadata and validated
/// credentials. No method retries internally; retry policy belongs to the
/// caller.
#[async_trait]
pub trait Exchange: Send + Sync {
    fn venue(&self) -> ExchangeId;

    fn market(&self, symbol: &str) -> Result<Market, ExchangeError>;

    async fn last_price(&self, symbol: &str) -> Result<f64, ExchangeError>;

    /// Idempotent. Implementations perform any required margin-mode call
    /// before the leverage call.
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError>;

    async fn submit_order(&self, order: &OrderRequest) -> Result<SubmittedOrder, ExchangeError>;

    /// Market fills are asynchronous from the caller's perspective; query
    /// once after submission for the terminal/partial state.
    async fn confirm_order(&self, order_id: &str, symbol: &str)
    -> Result<OrderState, ExchangeError>;

    /// Only positions with non-zero size.
    async fn positions<'a>(&self, symbol: Option<&'a str>) -> Result<Vec<Position>, ExchangeError>;

    /// Available balance of one asset.
    async fn balance(&self, asset: &str) -> Result<f64, ExchangeError>;
}
