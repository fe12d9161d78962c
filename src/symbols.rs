// =============================================================================
// Symbol Registry — immutable contract specifications
// =============================================================================
//
// Loaded once at startup (built-in defaults or a JSON file) and never mutated
// afterwards, so lookups need no synchronization. Hot-reload is a restart
// between trading sessions.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::CoreError;

/// Broad instrument class, used for display and routing policy only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetClass {
    Forex,
    Metals,
    Indices,
    Crypto,
}

impl Default for AssetClass {
    fn default() -> Self {
        Self::Forex
    }
}

/// Contract specification for one tradable symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolSpec {
    /// Ticker, e.g. `EURUSD`.
    pub symbol: String,
    /// Price decimal places.
    pub digits: u32,
    /// Smallest standard price increment (0.0001 for most pairs, 0.01 JPY).
    pub pip_size: f64,
    /// Account-currency value of one pip for one lot.
    pub pip_value: f64,
    /// Units of base currency per lot (100 000 in forex).
    pub contract_size: f64,
    pub min_lot: f64,
    pub max_lot: f64,
    pub lot_step: f64,
    /// Commission charged per lot per side.
    pub commission_per_lot: f64,
    /// Daily swap for long positions, account currency per lot.
    pub swap_long: f64,
    /// Daily swap for short positions, account currency per lot.
    pub swap_short: f64,
    /// Fraction of notional required as margin.
    pub margin_rate: f64,
    #[serde(default)]
    pub asset_class: AssetClass,
    #[serde(default = "default_tradable")]
    pub tradable: bool,
}

fn default_tradable() -> bool {
    true
}

impl SymbolSpec {
    /// A standard forex major with 5-digit pricing.
    fn forex_major(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            digits: 5,
            pip_size: 0.0001,
            pip_value: 10.0,
            contract_size: 100_000.0,
            min_lot: 0.01,
            max_lot: 100.0,
            lot_step: 0.01,
            commission_per_lot: 5.0,
            swap_long: -2.5,
            swap_short: 0.5,
            margin_rate: 1.0,
            asset_class: AssetClass::Forex,
            tradable: true,
        }
    }

    /// A JPY-quoted pair (3-digit pricing, pip of 0.01).
    fn forex_jpy(symbol: &str) -> Self {
        Self {
            digits: 3,
            pip_size: 0.01,
            ..Self::forex_major(symbol)
        }
    }

    /// Price difference expressed in pips.
    pub fn price_to_pips(&self, delta: f64) -> f64 {
        delta / self.pip_size
    }

    /// Validate a requested volume against min/max/step.
    pub fn validate_volume(&self, volume: f64) -> Result<(), CoreError> {
        if !volume.is_finite() || volume <= 0.0 {
            return Err(CoreError::InvalidVolume {
                volume,
                reason: "volume must be positive".into(),
            });
        }
        if volume < self.min_lot - 1e-9 {
            return Err(CoreError::InvalidVolume {
                volume,
                reason: format!("below minimum lot {}", self.min_lot),
            });
        }
        if volume > self.max_lot + 1e-9 {
            return Err(CoreError::InvalidVolume {
                volume,
                reason: format!("above maximum lot {}", self.max_lot),
            });
        }
        let steps = volume / self.lot_step;
        if (steps - steps.round()).abs() > 1e-6 {
            return Err(CoreError::InvalidVolume {
                volume,
                reason: format!("not a multiple of lot step {}", self.lot_step),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Immutable post-load symbol table.
pub struct SymbolRegistry {
    specs: HashMap<String, SymbolSpec>,
}

impl SymbolRegistry {
    /// Registry with built-in specs for the usual majors.
    pub fn builtin() -> Self {
        let mut specs = HashMap::new();
        for sym in ["EURUSD", "GBPUSD", "AUDUSD", "NZDUSD", "USDCHF", "USDCAD"] {
            specs.insert(sym.to_string(), SymbolSpec::forex_major(sym));
        }
        for sym in ["USDJPY", "EURJPY", "GBPJPY"] {
            specs.insert(sym.to_string(), SymbolSpec::forex_jpy(sym));
        }
        // Gold trades with 2-digit pricing and a smaller contract.
        specs.insert(
            "XAUUSD".to_string(),
            SymbolSpec {
                symbol: "XAUUSD".into(),
                digits: 2,
                pip_size: 0.01,
                pip_value: 1.0,
                contract_size: 100.0,
                min_lot: 0.01,
                max_lot: 50.0,
                lot_step: 0.01,
                commission_per_lot: 5.0,
                swap_long: -4.0,
                swap_short: 1.0,
                margin_rate: 1.0,
                asset_class: AssetClass::Metals,
                tradable: true,
            },
        );
        Self { specs }
    }

    /// Load specs from a JSON array file, replacing the built-ins entirely.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read symbol file {}", path.display()))?;
        let list: Vec<SymbolSpec> = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse symbol file {}", path.display()))?;

        let mut specs = HashMap::new();
        for spec in list {
            if spec.pip_size <= 0.0 || spec.lot_step <= 0.0 || spec.contract_size <= 0.0 {
                anyhow::bail!("symbol {} has non-positive contract fields", spec.symbol);
            }
            specs.insert(spec.symbol.clone(), spec);
        }
        info!(path = %path.display(), count = specs.len(), "symbol registry loaded");
        Ok(Self { specs })
    }

    pub fn get(&self, symbol: &str) -> Option<&SymbolSpec> {
        self.specs.get(symbol)
    }

    /// Spec lookup that maps a miss to the domain error.
    pub fn require(&self, symbol: &str) -> Result<&SymbolSpec, CoreError> {
        self.specs
            .get(symbol)
            .ok_or_else(|| CoreError::UnknownSymbol(symbol.to_string()))
    }

    /// Spec lookup that also enforces the tradable flag.
    pub fn require_tradable(&self, symbol: &str) -> Result<&SymbolSpec, CoreError> {
        let spec = self.require(symbol)?;
        if !spec.tradable {
            return Err(CoreError::SymbolSuspended(symbol.to_string()));
        }
        Ok(spec)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.specs.contains_key(symbol)
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut out: Vec<String> = self.specs.keys().cloned().collect();
        out.sort();
        out
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_has_majors() {
        let reg = SymbolRegistry::builtin();
        assert!(reg.contains("EURUSD"));
        assert!(reg.contains("USDJPY"));
        assert!(reg.contains("XAUUSD"));
        let eur = reg.get("EURUSD").unwrap();
        assert_eq!(eur.digits, 5);
        assert!((eur.pip_size - 0.0001).abs() < f64::EPSILON);
        assert!((eur.pip_value - 10.0).abs() < f64::EPSILON);
        let jpy = reg.get("USDJPY").unwrap();
        assert_eq!(jpy.digits, 3);
        assert!((jpy.pip_size - 0.01).abs() < f64::EPSILON);
    }

    #[test]
    fn volume_validation() {
        let reg = SymbolRegistry::builtin();
        let spec = reg.get("EURUSD").unwrap();
        assert!(spec.validate_volume(0.10).is_ok());
        assert!(spec.validate_volume(1.0).is_ok());
        assert!(spec.validate_volume(0.0).is_err());
        assert!(spec.validate_volume(-0.1).is_err());
        assert!(spec.validate_volume(0.005).is_err()); // below min
        assert!(spec.validate_volume(500.0).is_err()); // above max
        assert!(spec.validate_volume(0.015).is_err()); // off step
    }

    #[test]
    fn require_tradable_maps_errors() {
        let mut reg = SymbolRegistry::builtin();
        assert!(matches!(
            reg.require("NOPE"),
            Err(CoreError::UnknownSymbol(_))
        ));
        reg.specs.get_mut("EURUSD").unwrap().tradable = false;
        assert!(matches!(
            reg.require_tradable("EURUSD"),
            Err(CoreError::SymbolSuspended(_))
        ));
    }

    #[test]
    fn pip_conversion() {
        let reg = SymbolRegistry::builtin();
        let spec = reg.get("EURUSD").unwrap();
        let pips = spec.price_to_pips(1.0950 - 1.0902);
        assert!((pips - 48.0).abs() < 1e-6);
    }
}
