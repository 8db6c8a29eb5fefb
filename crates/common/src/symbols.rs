/// Normalize chart-style symbols like "BTC/USDT:USDT" or "BTC/USDT" to the
/// native venue form "BTCUSDT". Already-native input passes through.
pub fn normalize_symbol(raw: &str) -> String {
    let without_settle = match raw.split_once(':') {
        Some((head, _)) => head,
        None => raw,
    };
    without_settle.replace('/', "").trim().to_uppercase()
}

const KNOWN_QUOTES: &[&str] = &["USDT", "USDC", "BUSD", "USD"];

/// Split a native pair into (base, quote). "BTCUSDT" -> ("BTC", "USDT").
/// Unknown quotes fall back to a four-character suffix.
pub fn split_pair(symbol: &str) -> (String, String) {
    for quote in KNOWN_QUOTES {
        if symbol.len() > quote.len() && symbol.ends_with(quote) {
            let base = &symbol[..symbol.len() - quote.len()];
            return (base.to_string(), quote.to_string());
        }
    }
    let cut = symbol.len().saturating_sub(4);
    (symbol[..cut].to_string(), symbol[cut..].to_string())
}
