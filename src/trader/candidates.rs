//! Candidate selection
//!
//! Explicit trading coins win, then the trader's default coins, then the
//! merged external pool. Every candidate is tagged with the pool(s) that
//! nominated it.

use std::collections::BTreeMap;

use crate::exchange::symbols;
use crate::models::TraderConfig;
use crate::oracle::Candidate;

/// External symbol pools merged as the last-resort candidate source.
#[derive(Debug, Clone, Default)]
pub struct ExternalPools {
    pub ai500: Vec<String>,
    pub oi_top: Vec<String>,
}

pub fn select_candidates(trader: &TraderConfig, pools: &ExternalPools) -> Vec<Candidate> {
    if !trader.trading_coins.is_empty() {
        return tag(&trader.trading_coins, "trading_coins");
    }
    if !trader.default_coins.is_empty() {
        return tag(&trader.default_coins, "default_coins");
    }

    // Union of the external pools, keeping every source tag
    let mut merged: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for coin in &pools.ai500 {
        merged
            .entry(symbols::normalize(coin))
            .or_default()
            .push("ai500".to_string());
    }
    for coin in &pools.oi_top {
        let sources = merged.entry(symbols::normalize(coin)).or_default();
        if !sources.contains(&"oi_top".to_string()) {
            sources.push("oi_top".to_string());
        }
    }

    merged
        .into_iter()
        .map(|(symbol, sources)| Candidate {
            symbol,
            sources,
            snapshot: None,
        })
        .collect()
}

fn tag(coins: &[String], source: &str) -> Vec<Candidate> {
    coins
        .iter()
        .map(|coin| Candidate {
            symbol: symbols::normalize(coin),
            sources: vec![source.to_string()],
            snapshot: None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StrategyKind;

    fn trader(trading: Vec<&str>, default: Vec<&str>) -> TraderConfig {
        TraderConfig {
            id: 1,
            name: "t".to_string(),
            exchange_id: "binance".to_string(),
            strategy: StrategyKind::Directional,
            scan_interval_secs: 60,
            btc_eth_leverage: 10,
            altcoin_leverage: 5,
            is_cross_margin: true,
            system_prompt_template: String::new(),
            default_coins: default.into_iter().map(String::from).collect(),
            trading_coins: trading.into_iter().map(String::from).collect(),
            grid: None,
        }
    }

    #[test]
    fn explicit_coins_win() {
        let pools = ExternalPools {
            ai500: vec!["SOLUSDT".to_string()],
            oi_top: vec![],
        };
        let candidates = select_candidates(&trader(vec!["btc"], vec!["ETHUSDT"]), &pools);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].symbol, "BTCUSDT");
        assert_eq!(candidates[0].sources, vec!["trading_coins"]);
    }

    #[test]
    fn merged_pool_keeps_both_tags() {
        let pools = ExternalPools {
            ai500: vec!["BTCUSDT".to_string(), "SOLUSDT".to_string()],
            oi_top: vec!["BTCUSDT".to_string(), "DOGEUSDT".to_string()],
        };
        let candidates = select_candidates(&trader(vec![], vec![]), &pools);
        assert_eq!(candidates.len(), 3);
        let btc = candidates.iter().find(|c| c.symbol == "BTCUSDT").unwrap();
        assert_eq!(btc.sources, vec!["ai500", "oi_top"]);
        let doge = candidates.iter().find(|c| c.symbol == "DOGEUSDT").unwrap();
        assert_eq!(doge.sources, vec!["oi_top"]);
    }
}
