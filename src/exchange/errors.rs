//! Adapter error taxonomy
//!
//! Callers branch on kinds: transient errors are retried with backoff,
//! precondition violations are recorded and the scan continues, auth errors
//! surface immediately with a remediation hint.

use thiserror::Error;

pub type ExchangeResult<T> = Result<T, ExchangeError>;

#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Timeout, 5xx, rate limit. Retried by the caller with backoff.
    #[error("transient venue error: {0}")]
    Transient(String),

    /// Invalid signature, API-key mismatch, expired token.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Quantity rounded to zero or below the venue minimum.
    #[error("invalid quantity for {symbol}: {reason}")]
    InvalidQuantity { symbol: String, reason: String },

    /// Close requested but the venue holds no position.
    #[error("no position on venue for {0}")]
    NoPosition(String),

    #[error("insufficient available margin: need {needed:.2}, have {available:.2}")]
    InsufficientMargin { needed: f64, available: f64 },

    #[error("same-side position already exists for {symbol} {side}")]
    PositionExists { symbol: String, side: String },

    #[error("leverage {requested} out of bounds for {symbol} (max {max})")]
    LeverageOutOfBounds {
        symbol: String,
        requested: u32,
        max: u32,
    },

    #[error("position limit exceeded: {0}")]
    PositionLimit(String),

    /// Symbol is unknown to the venue. Fatal for the current strategy tick.
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    /// Operation the venue cannot express (e.g. per-order cancel on an
    /// emulated grid). Never silently downgraded.
    #[error("operation not supported by this venue: {0}")]
    Unsupported(&'static str),

    /// Any other venue-reported failure, with the venue's own code.
    #[error("venue error {code}: {message}")]
    Venue { code: i64, message: String },
}

impl ExchangeError {
    pub fn transient(msg: impl Into<String>) -> Self {
        ExchangeError::Transient(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Transient(_))
    }

    /// Precondition violations are recorded as failed actions; the
    /// orchestrator continues with the next decision.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            ExchangeError::InvalidQuantity { .. }
                | ExchangeError::NoPosition(_)
                | ExchangeError::InsufficientMargin { .. }
                | ExchangeError::PositionExists { .. }
                | ExchangeError::LeverageOutOfBounds { .. }
                | ExchangeError::PositionLimit(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ExchangeError::UnknownSymbol(_))
    }
}

/// Venue responses that mean "already in the requested state". Swallowed as
/// success by every adapter.
pub fn is_idempotent_ok(message: &str) -> bool {
    let m = message.to_lowercase();
    m.contains("no need to change")
        || m.contains("not modified")
        || m.contains("leverage not changed")
        || m.contains("already") && (m.contains("margin") || m.contains("mode"))
}

/// Venue responses that indicate a request-timestamp drift; the adapter
/// resyncs server time once and retries.
pub fn is_timestamp_error(message: &str) -> bool {
    let m = message.to_lowercase();
    m.contains("timestamp") && (m.contains("ahead") || m.contains("outside") || m.contains("recvwindow") || m.contains("-1021"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotent_classification() {
        assert!(is_idempotent_ok("No need to change margin type."));
        assert!(is_idempotent_ok("leverage not modified"));
        assert!(!is_idempotent_ok("insufficient margin"));
    }

    #[test]
    fn precondition_kinds() {
        assert!(ExchangeError::NoPosition("BTCUSDT".into()).is_precondition());
        assert!(ExchangeError::InvalidQuantity {
            symbol: "BTCUSDT".into(),
            reason: "rounded to zero".into()
        }
        .is_precondition());
        assert!(!ExchangeError::Transient("timeout".into()).is_precondition());
        assert!(ExchangeError::UnknownSymbol("FOO".into()).is_fatal());
    }
}
