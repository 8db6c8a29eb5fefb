use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Bad or missing credentials. Fatal for the tenant's action.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Transport-level failure. Safe to retry a bounded number of times.
    #[error("network failure: {0}")]
    Network(String),

    /// Quote or market metadata unavailable. Also transient.
    #[error("market data unavailable: {0}")]
    MarketData(String),

    #[error("market {0} not found")]
    MarketUnknown(String),

    /// The venue understood the request and said no.
    #[error("order rejected: {0}")]
    Rejected(String),
}

impl ExchangeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::MarketData(_))
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}
