use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeId {
    Binance,
    Bybit,
}

impl ExchangeId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeId::Binance => "binance",
            ExchangeId::Bybit => "bybit",
        }
    }
}

impl FromStr for ExchangeId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "binance" => Ok(Self::Binance),
            "bybit" => Ok(Self::Bybit),
            other => Err(format!("unsupported exchange: {other}")),
        }
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// API key pair as persisted. Values stay opaque until the cipher reveals
/// them at session-creation time.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.api_key.trim().is_empty() || self.api_secret.trim().is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

/// Decryption boundary. The core never persists plaintext; whatever wrote
/// the tenant row decides what `decrypt` has to undo.
pub trait CredentialCipher: Send + Sync {
    fn decrypt(&self, value: &str) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreferredSide {
    #[serde(rename = "long")]
    Long,
    #[serde(rename = "short")]
    Short,
    #[serde(rename = "longShort")]
    LongShort,
}

impl PreferredSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PreferredSide::Long => "long",
            PreferredSide::Short => "short",
            PreferredSide::LongShort => "longShort",
        }
    }
}

impl FromStr for PreferredSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "long" => Ok(Self::Long),
            "short" => Ok(Self::Short),
            "longShort" => Ok(Self::LongShort),
            other => Err(format!("unsupported preferred side: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalParams {
    pub preferred_side: PreferredSide,
    pub long_size: f64,
    pub short_size: f64,
    pub leverage: u32,
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    pub bracket_enabled: bool,
}

impl SignalParams {
    /// USDT notional for an open, derived from the preferred side. The side
    /// actually traded always comes from the signal payload.
    pub fn notional(&self) -> f64 {
        match self.preferred_side {
            PreferredSide::Long => self.long_size,
            PreferredSide::Short => self.short_size,
            PreferredSide::LongShort => (self.long_size + self.short_size) / 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DcaParams {
    pub pair: String,
    pub order_size: f64,
    pub max_layers: u32,
}

impl DcaParams {
    pub fn is_configured(&self) -> bool {
        !self.pair.trim().is_empty() && self.order_size > 0.0 && self.max_layers > 0
    }
}

/// Exactly one strategy mode is authoritative per tenant; the inactive
/// mode's parameters do not exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum StrategyConfig {
    Signal(SignalParams),
    Dca(DcaParams),
}

impl StrategyConfig {
    pub fn mode(&self) -> &'static str {
        match self {
            StrategyConfig::Signal(_) => "signal",
            StrategyConfig::Dca(_) => "dca",
        }
    }

    pub fn as_signal(&self) -> Option<&SignalParams> {
        match self {
            StrategyConfig::Signal(params) => Some(params),
            StrategyConfig::Dca(_) => None,
        }
    }

    pub fn as_dca(&self) -> Option<&DcaParams> {
        match self {
            StrategyConfig::Dca(params) => Some(params),
            StrategyConfig::Signal(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TenantConfig {
    pub id: Uuid,
    pub enabled: bool,
    pub credit: i64,
    pub exchange: ExchangeId,
    pub credentials: Credentials,
    pub strategy: StrategyConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notional_follows_preferred_side() {
        let mut params = SignalParams {
            preferred_side: PreferredSide::LongShort,
            long_size: 6.0,
            short_size: 6.0,
            leverage: 1,
            take_profit_pct: 0.5,
            stop_loss_pct: 0.0,
            bracket_enabled: false,
        };
        assert_eq!(params.notional(), 6.0);

        params.preferred_side = PreferredSide::Long;
        params.short_size = 10.0;
        assert_eq!(params.notional(), 6.0);

        params.preferred_side = PreferredSide::Short;
        assert_eq!(params.notional(), 10.0);

        params.preferred_side = PreferredSide::LongShort;
        assert_eq!(params.notional(), 8.0);
    }

    #[test]
    fn strategy_tag_round_trips() {
        let dca = StrategyConfig::Dca(DcaParams {
            pair: "BTCUSDT".into(),
            order_size: 15.0,
            max_layers: 5,
        });
        let json = serde_json::to_value(&dca).unwrap();
        assert_eq!(json["strategy"], "dca");
        let back: StrategyConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back.mode(), "dca");
        assert!(back.as_signal().is_none());
    }

    #[test]
    fn credentials_debug_is_redacted() {
        let creds = Credentials::new("AKIDEXAMPLE", "sekrit-value");
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("AKIDEXAMPLE"));
        assert!(!rendered.contains("sekrit-value"));
        assert!(rendered.contains("<redacted>"));
    }
}
