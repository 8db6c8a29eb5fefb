use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::signal::{OrderType, Side};
use super::tenant::ExchangeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Closed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Open => "open",
            OrderStatus::Closed => "closed",
        }
    }
}

/// One persisted order. Created at submission, mutated only by the close
/// path, retained for audit.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRecord {
    pub id: i64,
    pub tenant_id: Uuid,
    pub exchange: ExchangeId,
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub amount: f64,
    pub price: Option<f64>,
    pub status: OrderStatus,
    pub profit: Option<f64>,
    pub layer: Option<u32>,
    pub raw: serde_json::Value,
    pub raw_close: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Insert form of [`OrderRecord`]; the store assigns id and created_at.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub tenant_id: Uuid,
    pub exchange: ExchangeId,
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub amount: f64,
    pub price: Option<f64>,
    pub layer: Option<u32>,
    pub raw: serde_json::Value,
}
