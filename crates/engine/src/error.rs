use thiserror::Error;

use crate::sizing::SizingError;
use exchange::ExchangeError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Sizing(#[from] SizingError),

    #[error("no open position for {symbol}")]
    NoOpenPosition { symbol: String },

    #[error("position already open for {symbol}")]
    PositionAlreadyOpen { symbol: String },

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("storage failure: {0}")]
    Storage(#[from] sqlx::Error),
}
