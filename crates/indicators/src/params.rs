use std::collections::BTreeMap;

use qbt_core::error::Error;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// A single resolved scalar from a range-spec expansion.
#[derive(Debug, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResolvedValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl ResolvedValue {
    pub fn as_usize(&self) -> Option<usize> {
        match self {
            ResolvedValue::Int(i) if *i >= 0 => Some(*i as usize),
            ResolvedValue::Float(f) if f.fract() == 0.0 && *f >= 0.0 => Some(*f as usize),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ResolvedValue::Int(i) => Some(*i as f64),
            ResolvedValue::Float(f) => Some(*f),
            ResolvedValue::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ResolvedValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResolvedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolvedValue::Int(i) => write!(f, "{i}"),
            ResolvedValue::Float(x) => write!(f, "{x}"),
            ResolvedValue::Text(s) => write!(f, "{s}"),
        }
    }
}

/// Parse one range-spec string into its resolved scalar list.
///
/// Grammar (spec.md §4.1):
/// - `"start:end:step"` → inclusive arithmetic sequence (int if all three
///   parts are integral, float otherwise); step must be non-zero and its
///   sign consistent with `end - start`.
/// - `"v1,v2,...,vk"` → explicit comma list, whitespace tolerated.
/// - bare scalar → singleton list (a bare integer `n` behaves as `"n:n:1"`).
pub fn parse_range_spec(spec: &str) -> Result<Vec<ResolvedValue>, Error> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err(Error::InvalidConfig("empty range-spec".to_string()));
    }

    if let Some(values) = try_parse_arithmetic(spec)? {
        return Ok(values);
    }

    if spec.contains(',') {
        return spec
            .split(',')
            .map(|part| parse_scalar(part.trim()))
            .collect();
    }

    Ok(vec![parse_scalar(spec)?])
}

fn try_parse_arithmetic(spec: &str) -> Result<Option<Vec<ResolvedValue>>, Error> {
    let parts: Vec<&str> = spec.split(':').collect();
    if parts.len() != 3 {
        return Ok(None);
    }
    let (start, end, step) = (parts[0].trim(), parts[1].trim(), parts[2].trim());
    let (start_f, start_is_int) = parse_numeric(start)?;
    let (end_f, end_is_int) = parse_numeric(end)?;
    let (step_f, step_is_int) = parse_numeric(step)?;

    if step_f == 0.0 {
        return Err(Error::InvalidConfig(
            "range-spec step must be non-zero".to_string(),
        ));
    }
    if (end_f - start_f) * step_f < 0.0 && end_f != start_f {
        return Err(Error::InvalidConfig(
            "range-spec step direction inconsistent with start/end".to_string(),
        ));
    }

    let all_int = start_is_int && end_is_int && step_is_int;
    let mut values = Vec::new();
    let mut current = start_f;
    let max_steps = 100_000;
    for _ in 0..max_steps {
        if step_f > 0.0 && current > end_f + 1e-9 {
            break;
        }
        if step_f < 0.0 && current < end_f - 1e-9 {
            break;
        }
        values.push(if all_int {
            ResolvedValue::Int(current.round() as i64)
        } else {
            ResolvedValue::Float(current)
        });
        current += step_f;
        if start_f == end_f {
            break;
        }
    }
    Ok(Some(values))
}

fn parse_numeric(s: &str) -> Result<(f64, bool), Error> {
    if let Ok(i) = s.parse::<i64>() {
        return Ok((i as f64, true));
    }
    s.parse::<f64>()
        .map(|f| (f, false))
        .map_err(|_| Error::InvalidConfig(format!("invalid numeric range-spec part: '{s}'")))
}

fn parse_scalar(s: &str) -> Result<ResolvedValue, Error> {
    if s.is_empty() {
        return Err(Error::InvalidConfig("empty scalar in range-spec".to_string()));
    }
    if let Ok(i) = s.parse::<i64>() {
        return Ok(ResolvedValue::Int(i));
    }
    if let Ok(f) = s.parse::<f64>() {
        return Ok(ResolvedValue::Float(f));
    }
    Ok(ResolvedValue::Text(s.to_string()))
}

/// The six indicator families named in the data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndicatorKind {
    Ma,
    Boll,
    Hl,
    Perc,
    Value,
    NDayCycle,
}

impl IndicatorKind {
    fn family_prefix(&self) -> &'static str {
        match self {
            IndicatorKind::Ma => "MA",
            IndicatorKind::Boll => "BOLL",
            IndicatorKind::Hl => "HL",
            IndicatorKind::Perc => "PERC",
            IndicatorKind::Value => "VALUE",
            IndicatorKind::NDayCycle => "NDayCycle",
        }
    }
}

/// A parsed alias like `MA7` or `NDayCycle1`: family + 1-based ordinal,
/// from which the strategy variant `k` is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alias {
    pub kind: IndicatorKind,
    pub ordinal: u32,
}

pub fn parse_alias(alias: &str) -> Result<Alias, Error> {
    const FAMILIES: &[(&str, IndicatorKind)] = &[
        ("NDayCycle", IndicatorKind::NDayCycle),
        ("MA", IndicatorKind::Ma),
        ("BOLL", IndicatorKind::Boll),
        ("HL", IndicatorKind::Hl),
        ("PERC", IndicatorKind::Perc),
        ("VALUE", IndicatorKind::Value),
    ];
    for (prefix, kind) in FAMILIES {
        if let Some(rest) = alias.strip_prefix(prefix) {
            if !rest.is_empty() {
                if let Ok(ordinal) = rest.parse::<u32>() {
                    return Ok(Alias { kind: *kind, ordinal });
                }
            }
        }
    }
    Err(Error::InvalidConfig(format!("unrecognised indicator alias: '{alias}'")))
}

/// Tagged record `(indicatorType, params, strategyIndex)`. Equality and the
/// stable hash are defined over `(kind, alias, params)` only — strategy
/// index is assigned later when an enumerated instance is bound to a
/// concrete `ConditionPair` slot and does not participate in identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorParams {
    pub kind: IndicatorKind,
    pub alias: String,
    pub strategy_variant: u32,
    pub params: BTreeMap<String, ResolvedValue>,
    #[serde(default)]
    pub strategy_index: usize,
}

impl PartialEq for IndicatorParams {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.alias == other.alias && self.params == other.params
    }
}
impl Eq for IndicatorParams {}

impl IndicatorParams {
    pub fn with_strategy_index(mut self, strategy_index: usize) -> Self {
        self.strategy_index = strategy_index;
        self
    }

    pub fn get(&self, key: &str) -> Option<&ResolvedValue> {
        self.params.get(key)
    }

    /// Canonical-JSON-derived stable hash, 16 lowercase hex chars. Mirrors
    /// the original implementation's `get_param_hash` (canonical sorted-key
    /// JSON, truncated digest).
    pub fn param_hash(&self) -> String {
        let value = json!({
            "indicator_type": self.kind.family_prefix(),
            "alias": self.alias,
            "params": self.params,
        });
        qbt_core::BacktestId::from_seed(&value).0
    }

    /// Human-readable fragment of a `ParameterSetId`, e.g. `MA1(10)`.
    pub fn label(&self) -> String {
        let inner: Vec<String> = self
            .params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        format!("{}({})", self.alias, inner.join(","))
    }
}

/// Whether `values`' resolved list has more than one distinct value (the
/// "variable parameter" concept used by the WFA optimiser's ≤2 restriction).
pub fn is_variable(values: &[ResolvedValue]) -> bool {
    let mut seen: Vec<&ResolvedValue> = Vec::new();
    for v in values {
        if !seen.iter().any(|s| **s == *v) {
            seen.push(v);
        }
    }
    seen.len() > 1
}

type Config = BTreeMap<String, String>;

fn required_spec(config: &Config, key: &str) -> Result<Vec<ResolvedValue>, Error> {
    let raw = config
        .get(key)
        .ok_or_else(|| Error::InvalidConfig(format!("missing required range key '{key}'")))?;
    parse_range_spec(raw)
}

fn optional_spec(config: &Config, key: &str, default: &str) -> Result<Vec<ResolvedValue>, Error> {
    match config.get(key) {
        Some(raw) => parse_range_spec(raw),
        None => parse_range_spec(default),
    }
}

/// Cartesian product of named resolved-value lists, each combination
/// becoming one `BTreeMap<String, ResolvedValue>`.
fn cartesian(named_lists: Vec<(&str, Vec<ResolvedValue>)>) -> Vec<BTreeMap<String, ResolvedValue>> {
    let mut combos: Vec<BTreeMap<String, ResolvedValue>> = vec![BTreeMap::new()];
    for (name, values) in named_lists {
        let mut next = Vec::with_capacity(combos.len() * values.len());
        for combo in &combos {
            for v in &values {
                let mut c = combo.clone();
                c.insert(name.to_string(), v.clone());
                next.push(c);
            }
        }
        combos = next;
    }
    combos
}

/// Expand one alias against its configuration map into the full list of
/// concrete `IndicatorParams` (the cartesian product of its recognised
/// range keys). `config` maps recognised keys (see spec.md §4.1 table) to
/// raw range-spec strings.
pub fn enumerate(alias: &str, config: &Config) -> Result<Vec<IndicatorParams>, Error> {
    let parsed = parse_alias(alias)?;
    let kind = parsed.kind;
    let k = parsed.ordinal;

    let combos = match kind {
        IndicatorKind::Ma if k >= 1 && k <= 4 => {
            let period = required_spec(config, "ma_range")?;
            let ma_type = optional_spec(config, "ma_type", "SMA")?;
            cartesian(vec![("period", period), ("ma_type", ma_type)])
        }
        IndicatorKind::Ma if k >= 5 && k <= 8 => {
            let short = required_spec(config, "short_range")?;
            let long = required_spec(config, "long_range")?;
            let ma_type = optional_spec(config, "ma_type", "SMA")?;
            cartesian(vec![("short", short), ("long", long), ("ma_type", ma_type)])
                .into_iter()
                .filter(|c| {
                    match (c["short"].as_f64(), c["long"].as_f64()) {
                        (Some(s), Some(l)) => s < l,
                        _ => true,
                    }
                })
                .collect()
        }
        IndicatorKind::Ma if k >= 9 && k <= 12 => {
            let m = required_spec(config, "m_range")?;
            let n = required_spec(config, "n_range")?;
            let ma_type = optional_spec(config, "ma_type", "SMA")?;
            cartesian(vec![("m", m), ("n", n), ("ma_type", ma_type)])
        }
        IndicatorKind::Ma => {
            return Err(Error::InvalidConfig(format!("MA alias out of range: {alias}")))
        }
        IndicatorKind::Boll if k >= 1 && k <= 4 => {
            let period = required_spec(config, "ma_range")?;
            let sd_multi = required_spec(config, "sd_multi")?;
            cartesian(vec![("period", period), ("sd_multi", sd_multi)])
        }
        IndicatorKind::Boll => {
            return Err(Error::InvalidConfig(format!("BOLL alias out of range: {alias}")))
        }
        IndicatorKind::Hl if k >= 1 && k <= 4 => {
            let n = required_spec(config, "n_range")?;
            let m = required_spec(config, "m_range")?;
            cartesian(vec![("n", n), ("m", m)])
                .into_iter()
                .map(|c| {
                    match (c["n"].as_usize(), c["m"].as_usize()) {
                        (Some(nv), Some(mv)) if nv > mv => Err(Error::InvalidConfig(format!(
                            "HL requires n <= m, got n={nv} m={mv}"
                        ))),
                        _ => Ok(c),
                    }
                })
                .collect::<Result<Vec<_>, _>>()?
        }
        IndicatorKind::Hl => {
            return Err(Error::InvalidConfig(format!("HL alias out of range: {alias}")))
        }
        IndicatorKind::Perc if k >= 1 && k <= 4 => {
            let window = required_spec(config, "window_range")?;
            let percentile = required_spec(config, "percentile_range")?;
            cartesian(vec![("window", window), ("percentile", percentile)])
        }
        IndicatorKind::Perc if k == 5 || k == 6 => {
            let window = required_spec(config, "window_range")?;
            let m1 = required_spec(config, "m1_range")?;
            let m2 = required_spec(config, "m2_range")?;
            cartesian(vec![("window", window), ("m1", m1), ("m2", m2)])
                .into_iter()
                .map(|c| match (c["m1"].as_f64(), c["m2"].as_f64()) {
                    (Some(a), Some(b)) if a >= b => Err(Error::InvalidConfig(format!(
                        "PERC requires m1 < m2, got m1={a} m2={b}"
                    ))),
                    _ => Ok(c),
                })
                .collect::<Result<Vec<_>, _>>()?
        }
        IndicatorKind::Perc => {
            return Err(Error::InvalidConfig(format!("PERC alias out of range: {alias}")))
        }
        IndicatorKind::Value if k >= 1 && k <= 4 => {
            let n = required_spec(config, "n_range")?;
            let m = required_spec(config, "m_range")?;
            cartesian(vec![("n", n), ("m", m)])
        }
        IndicatorKind::Value if k == 5 || k == 6 => {
            let m1 = required_spec(config, "m1_range")?;
            let m2 = required_spec(config, "m2_range")?;
            cartesian(vec![("m1", m1), ("m2", m2)])
                .into_iter()
                .map(|c| match (c["m1"].as_f64(), c["m2"].as_f64()) {
                    (Some(a), Some(b)) if a >= b => Err(Error::InvalidConfig(format!(
                        "VALUE requires m1 < m2, got m1={a} m2={b}"
                    ))),
                    _ => Ok(c),
                })
                .collect::<Result<Vec<_>, _>>()?
        }
        IndicatorKind::Value => {
            return Err(Error::InvalidConfig(format!("VALUE alias out of range: {alias}")))
        }
        IndicatorKind::NDayCycle if k == 1 || k == 2 => {
            let n = required_spec(config, "n_range")?;
            cartesian(vec![("n", n)])
        }
        IndicatorKind::NDayCycle => {
            return Err(Error::InvalidConfig(format!(
                "NDayCycle alias out of range: {alias}"
            )))
        }
    };

    Ok(combos
        .into_iter()
        .map(|params| IndicatorParams {
            kind,
            alias: alias.to_string(),
            strategy_variant: k,
            params,
            strategy_index: 0,
        })
        .collect())
}
