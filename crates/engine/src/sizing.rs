use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SizingError {
    #[error("last price unavailable for sizing")]
    PriceUnavailable,

    #[error("quantity rounds to zero at precision {0}")]
    RoundsToZero(u32),
}

pub fn round_to_precision(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (value * factor).round() / factor
}

/// Convert a USDT notional into an executable base quantity at the venue's
/// quantity precision. Explicitly-sized limit orders bypass this and pass
/// their quantity through unchanged.
pub fn to_quantity(notional: f64, last_price: f64, precision: u32) -> Result<f64, SizingError> {
    if !last_price.is_finite() || last_price <= 0.0 {
        return Err(SizingError::PriceUnavailable);
    }
    let quantity = round_to_precision(notional / last_price, precision);
    if quantity <= 0.0 {
        return Err(SizingError::RoundsToZero(precision));
    }
    Ok(quantity)
}
