//! Symbol normalization
//!
//! Canonical form is uppercase base + "USDT" (e.g. BTCUSDT). Each adapter
//! round-trips to its venue format via `normalize` / its own convert-out.

/// Normalize any venue spelling to the canonical BASEUSDT form.
///
/// Idempotent: normalizing an already-canonical symbol is a no-op.
pub fn normalize(raw: &str) -> String {
    let mut s = raw.trim().to_uppercase();

    // Separator formats: BTC/USDT, BTC-USDT, BTC_USDT
    s = s.replace(['/', '-', '_'], "");

    // Perp suffixes
    if let Some(stripped) = s.strip_suffix("PERP") {
        s = stripped.to_string();
    }

    // KuCoin-futures style XBTUSDTM / ETHUSDTM
    if s.len() > 5 && s.ends_with("USDTM") {
        s.truncate(s.len() - 1);
    }

    // USDC-margined spellings collapse onto the canonical USDT symbol
    if let Some(stripped) = s.strip_suffix("USDC") {
        s = format!("{}USDT", stripped);
    }

    // Venue ticker aliases
    if s.starts_with("XBT") {
        s = s.replacen("XBT", "BTC", 1);
    }

    if !s.ends_with("USDT") {
        s.push_str("USDT");
    }

    s
}

/// Base asset of a canonical symbol (BTCUSDT -> BTC).
pub fn base_asset(canonical: &str) -> &str {
    canonical.strip_suffix("USDT").unwrap_or(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_venue_spellings() {
        assert_eq!(normalize("BTCUSDT"), "BTCUSDT");
        assert_eq!(normalize("btc"), "BTCUSDT");
        assert_eq!(normalize("BTC/USDT"), "BTCUSDT");
        assert_eq!(normalize("BTC_USDT"), "BTCUSDT");
        assert_eq!(normalize("BTC-PERP"), "BTCUSDT");
        assert_eq!(normalize("XBTUSDTM"), "BTCUSDT");
        assert_eq!(normalize("ETHUSDTM"), "ETHUSDT");
        assert_eq!(normalize("SOL/USDC"), "SOLUSDT");
    }

    #[test]
    fn normalize_is_idempotent() {
        for raw in ["BTC", "XBTUSDTM", "eth-perp", "SOL/USDC", "DOGEUSDT"] {
            let once = normalize(raw);
            assert_eq!(normalize(&once), once, "not idempotent for {}", raw);
        }
    }

    #[test]
    fn base_asset_strips_quote() {
        assert_eq!(base_asset("BTCUSDT"), "BTC");
        assert_eq!(base_asset("DOGEUSDT"), "DOGE");
    }
}
