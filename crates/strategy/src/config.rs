use serde::{Deserialize, Serialize};

use crate::strategies::Params;

/// One `[[strategy]]` table of the trading config file.
///
/// ```toml
/// [[strategy]]
/// type = "rsi"
/// name = "rsi 14"
/// enabled = true
///
/// [strategy.params]
/// period = 14
/// overbought = 70.0
/// oversold = 30.0
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StrategyConfig {
    /// Strategy type identifier, a key of `STRATEGY_TABLE`.
    #[serde(rename = "type")]
    pub strategy_type: String,
    /// Name used in signals and logs. Defaults to the type.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Rule-specific parameters; missing keys take the rule's defaults.
    #[serde(default)]
    pub params: Params,
}

fn default_enabled() -> bool {
    true
}

impl StrategyConfig {
    pub fn new(strategy_type: impl Into<String>) -> Self {
        Self {
            strategy_type: strategy_type.into(),
            name: None,
            enabled: true,
            params: Params::new(),
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.strategy_type)
    }
}
