//! Dispatcher configuration.

use serde::{Deserialize, Serialize};

use crate::index::{DEFAULT_ESTIMATED_COST, DEFAULT_ESTIMATED_ROWS};

/// Knobs for the dispatch boundary and the plan prober.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Convert module panics into [`BridgeError::Panic`](vtbridge_error::BridgeError::Panic).
    /// When false a panic unwinds through the dispatcher.
    pub catch_panics: bool,
    /// Row estimate placed in each fresh `IndexInfo`.
    pub default_estimated_rows: i64,
    /// Cost estimate placed in each fresh `IndexInfo`.
    pub default_estimated_cost: f64,
    /// Upper bound on `best_index` calls per probe.
    pub max_probe_candidates: usize,
    /// Reject out-of-order calls with `Misuse`. When false, violations that
    /// cannot corrupt state are logged and skipped.
    pub strict_protocol: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            catch_panics: true,
            default_estimated_rows: DEFAULT_ESTIMATED_ROWS,
            default_estimated_cost: DEFAULT_ESTIMATED_COST,
            max_probe_candidates: 64,
            strict_protocol: true,
        }
    }
}

impl DispatchConfig {
    /// Parse from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
