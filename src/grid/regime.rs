//! Volatility regime classification
//!
//! Bollinger width % and ATR14 % map the market into four coarse regimes,
//! each carrying a leverage cap and a position-size cap.

use serde::{Deserialize, Serialize};

use crate::models::{GridConfig, RegimeCaps};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    Narrow,
    Standard,
    Wide,
    Volatile,
}

impl Regime {
    pub fn as_str(&self) -> &str {
        match self {
            Regime::Narrow => "narrow",
            Regime::Standard => "standard",
            Regime::Wide => "wide",
            Regime::Volatile => "volatile",
        }
    }
}

/// Threshold ladder: narrow {2%, 1%}, standard {3%, 2%}, wide {4%, 3%},
/// anything beyond is volatile.
pub fn classify(bb_width_pct: f64, atr_pct: f64) -> Regime {
    if bb_width_pct < 2.0 && atr_pct < 1.0 {
        Regime::Narrow
    } else if bb_width_pct < 3.0 && atr_pct < 2.0 {
        Regime::Standard
    } else if bb_width_pct < 4.0 && atr_pct < 3.0 {
        Regime::Wide
    } else {
        Regime::Volatile
    }
}

pub fn caps_for(config: &GridConfig, regime: Regime) -> RegimeCaps {
    match regime {
        Regime::Narrow => config.narrow_caps,
        Regime::Standard => config.standard_caps,
        Regime::Wide => config.wide_caps,
        Regime::Volatile => config.volatile_caps,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_ladder() {
        assert_eq!(classify(1.5, 0.8), Regime::Narrow);
        assert_eq!(classify(2.5, 1.5), Regime::Standard);
        assert_eq!(classify(3.5, 2.5), Regime::Wide);
        assert_eq!(classify(5.0, 4.0), Regime::Volatile);
        // One dimension out of band bumps the regime
        assert_eq!(classify(1.5, 1.5), Regime::Standard);
        assert_eq!(classify(4.5, 0.5), Regime::Volatile);
    }
}
