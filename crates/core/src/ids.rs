use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Truncated-hex digest of arbitrary bytes, used as the deterministic
/// backbone for every generated identifier. Production deployments may
/// swap this for a random generator (per the seeded-vs-random note in the
/// design); tests rely on it being a pure function of its input.
fn truncated_hex(bytes: &[u8], len: usize) -> String {
    let digest = Sha256::digest(bytes);
    let full = hex::encode(digest);
    full[..len.min(full.len())].to_string()
}

/// Canonical JSON of a value, serialised with sorted object keys. Relies on
/// `serde_json::Map`'s default `BTreeMap` backing (the `preserve_order`
/// feature is not enabled anywhere in this workspace) so key order is
/// already deterministic without extra sorting.
pub fn canonical_json(value: &serde_json::Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// 16 lowercase hex characters, derived from the canonical JSON of the
/// task's defining fields (strategy index, predictor, resolved params).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BacktestId(pub String);

impl BacktestId {
    pub fn from_seed(seed: &serde_json::Value) -> Self {
        BacktestId(truncated_hex(canonical_json(seed).as_bytes(), 16))
    }
}

impl std::fmt::Display for BacktestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `"T" + 8 lowercase hex chars`, unique per open/close round trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TradeGroupId(pub String);

impl TradeGroupId {
    pub fn from_seed(backtest_id: &BacktestId, open_bar_index: usize) -> Self {
        let seed = format!("{}:{}", backtest_id, open_bar_index);
        TradeGroupId(format!("T{}", truncated_hex(seed.as_bytes(), 8)))
    }
}

impl std::fmt::Display for TradeGroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Human-readable identifier: `"MA1(10)+MA4(110)"`, exit slots (if any)
/// appended after a literal `_` separator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParameterSetId(pub String);

impl std::fmt::Display for ParameterSetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn backtest_id_is_deterministic_and_sized() {
        let seed = json!({"strategyIndex": 1, "predictor": "Close", "ma_period": 10});
        let a = BacktestId::from_seed(&seed);
        let b = BacktestId::from_seed(&seed);
        assert_eq!(a, b);
        assert_eq!(a.0.len(), 16);
        assert!(a.0.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));
    }

    #[test]
    fn backtest_id_ignores_key_order() {
        let a = BacktestId::from_seed(&json!({"a": 1, "b": 2}));
        let b = BacktestId::from_seed(&json!({"b": 2, "a": 1}));
        assert_eq!(a, b);
    }

    #[test]
    fn trade_group_id_format() {
        let backtest_id = BacktestId::from_seed(&json!({"x": 1}));
        let group = TradeGroupId::from_seed(&backtest_id, 4);
        assert!(group.0.starts_with('T'));
        assert_eq!(group.0.len(), 9);
    }
}
