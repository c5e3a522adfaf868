//! Configuration: a TOML document overridden by environment variables.
//!
//! The document describes the deployment (database path, enabled venues and
//! pairs, strategy directory, risk caps); credentials and per-host tweaks
//! come from the environment so they never land in a checked-in file.

use crate::domain::errors::CoreError;
use crate::domain::market::Interval;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::str::FromStr;

/// Risk caps handed to the risk gate; every field has a settings-store
/// override at runtime.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Max order value as a fraction of portfolio value.
    pub max_position_size: Decimal,
    /// Max daily realized loss as a fraction of portfolio value.
    pub max_daily_loss: Decimal,
    /// Max cumulative daily order value as a fraction of portfolio value.
    pub max_daily_volume: Decimal,
    /// Max cumulative daily risk budget as a fraction of portfolio value.
    pub max_daily_risk: Decimal,
    /// Max fractional drawdown from the portfolio high-water mark.
    pub max_drawdown: Decimal,
    pub max_open_positions: u32,
    pub max_leverage: Decimal,
    pub max_daily_trades: u32,
    pub max_hourly_trades: u32,
    /// Absolute VaR95 ceiling, quote currency.
    pub var_limit: Decimal,
    /// Max single-position share of portfolio value.
    pub concentration_limit: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        RiskConfig {
            max_position_size: Decimal::new(10, 2),   // 0.10
            max_daily_loss: Decimal::new(5, 2),       // 0.05
            max_daily_volume: Decimal::new(50, 2),    // 0.50
            max_daily_risk: Decimal::new(20, 2),      // 0.20
            max_drawdown: Decimal::new(15, 2),        // 0.15
            max_open_positions: 10,
            max_leverage: Decimal::new(3, 0),
            max_daily_trades: 100,
            max_hourly_trades: 20,
            var_limit: Decimal::new(10_000, 0),
            concentration_limit: Decimal::new(25, 2), // 0.25
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VenueConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub pairs: Vec<String>,
    /// Not deserialized; injected from `{VENUE}_API_KEY` etc.
    #[serde(skip)]
    pub api_key: String,
    #[serde(skip)]
    pub api_secret: String,
    #[serde(default)]
    pub testnet: bool,
    /// Rescale OHLC by index/last ratio. Some testnets publish badly scaled
    /// local prices; never enable on production venues.
    #[serde(default)]
    pub price_sanity_adjustment: bool,
    /// REST token bucket size per second.
    #[serde(default = "default_rest_rate")]
    pub rest_rate_per_sec: u32,
}

fn default_rest_rate() -> u32 {
    10
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StrategiesConfig {
    pub directory: String,
    pub default_interval: String,
    pub max_concurrent: u32,
    /// Rolling kline window length per strategy instance.
    pub window: usize,
}

impl Default for StrategiesConfig {
    fn default() -> Self {
        StrategiesConfig {
            directory: "strategies".to_string(),
            default_interval: "1m".to_string(),
            max_concurrent: 16,
            window: 500,
        }
    }
}

impl StrategiesConfig {
    pub fn default_interval(&self) -> Result<Interval, CoreError> {
        self.default_interval.parse()
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct Document {
    database: DatabaseSection,
    api: ApiSection,
    ui: UiSection,
    logging: LoggingSection,
    exchanges: BTreeMap<String, VenueConfig>,
    strategies: StrategiesConfig,
    risk: RiskConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct DatabaseSection {
    path: String,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        DatabaseSection {
            path: "data/helmsman.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct ApiSection {
    port: u16,
    timeout: u64,
}

impl Default for ApiSection {
    fn default() -> Self {
        ApiSection {
            port: 8_080,
            timeout: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct UiSection {
    port: u16,
}

impl Default for UiSection {
    fn default() -> Self {
        UiSection { port: 8_081 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct LoggingSection {
    level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        LoggingSection {
            level: "info".to_string(),
        }
    }
}

/// Fully resolved application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub api_port: u16,
    pub api_timeout_secs: u64,
    pub ui_port: u16,
    pub log_level: String,
    pub exchanges: BTreeMap<String, VenueConfig>,
    pub strategies: StrategiesConfig,
    pub risk: RiskConfig,
}

impl Config {
    /// Load the TOML document (when present) and apply env overrides.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let document = match path {
            Some(p) => {
                let text = std::fs::read_to_string(p)
                    .with_context(|| format!("failed to read config file {}", p.display()))?;
                toml::from_str::<Document>(&text)
                    .with_context(|| format!("failed to parse config file {}", p.display()))?
            }
            None => Document::default(),
        };
        Self::from_document(document)
    }

    fn from_document(mut document: Document) -> Result<Config> {
        let database_path = env_or("DATABASE_PATH", document.database.path);
        let api_port = env_parsed("API_PORT", document.api.port)?;
        let api_timeout_secs = env_parsed("API_TIMEOUT_SECONDS", document.api.timeout)?;
        let ui_port = env_parsed("UI_PORT", document.ui.port)?;
        let log_level = env_or("LOG_LEVEL", document.logging.level);

        for (venue, venue_config) in document.exchanges.iter_mut() {
            let prefix = venue.to_ascii_uppercase();
            venue_config.api_key = env::var(format!("{}_API_KEY", prefix)).unwrap_or_default();
            venue_config.api_secret = env::var(format!("{}_SECRET", prefix)).unwrap_or_default();
            if let Ok(raw) = env::var(format!("{}_TESTNET", prefix)) {
                venue_config.testnet = parse_bool(&raw)
                    .with_context(|| format!("invalid {}_TESTNET value '{}'", prefix, raw))?;
            }
            if venue_config.enabled && venue_config.api_key.is_empty() {
                anyhow::bail!(
                    "exchange '{}' is enabled but {}_API_KEY is not set",
                    venue,
                    prefix
                );
            }
        }

        // Fail early on an unparsable default interval.
        document
            .strategies
            .default_interval()
            .map_err(|e| anyhow::anyhow!("{}", e))?;

        Ok(Config {
            database_path,
            api_port,
            api_timeout_secs,
            ui_port,
            log_level,
            exchanges: document.exchanges,
            strategies: document.strategies,
            risk: document.risk,
        })
    }

    pub fn enabled_exchanges(&self) -> impl Iterator<Item = (&String, &VenueConfig)> {
        self.exchanges.iter().filter(|(_, v)| v.enabled)
    }
}

fn env_or(key: &str, fallback: String) -> String {
    env::var(key).unwrap_or(fallback)
}

fn env_parsed<T>(key: &str, fallback: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {} value '{}': {}", key, raw, e)),
        Err(_) => Ok(fallback),
    }
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => anyhow::bail!("expected 'true' or 'false', got '{}'", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn defaults_without_document() {
        let config = Config::from_document(Document::default()).unwrap();
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.strategies.window, 500);
        assert_eq!(config.risk.max_position_size, dec!(0.10));
        assert!(config.exchanges.is_empty());
    }

    #[test]
    fn document_sections_parse() {
        let text = r#"
            [database]
            path = "/tmp/bot.db"

            [api]
            port = 9000
            timeout = 10

            [logging]
            level = "debug"

            [exchanges.bybit]
            enabled = false
            pairs = ["BTCUSDT", "ETHUSDT"]
            testnet = true
            price_sanity_adjustment = true

            [strategies]
            directory = "scripts"
            default_interval = "5m"
            max_concurrent = 4

            [risk]
            max_position_size = 0.2
            max_drawdown = 0.1
        "#;
        let document: Document = toml::from_str(text).unwrap();
        let config = Config::from_document(document).unwrap();
        assert_eq!(config.database_path, "/tmp/bot.db");
        assert_eq!(config.api_port, 9000);
        assert_eq!(config.log_level, "debug");
        let bybit = &config.exchanges["bybit"];
        assert!(bybit.testnet);
        assert!(bybit.price_sanity_adjustment);
        assert_eq!(bybit.pairs.len(), 2);
        assert_eq!(config.strategies.default_interval().unwrap(), Interval::M5);
        assert_eq!(config.risk.max_position_size, dec!(0.2));
        // Unset sections keep their defaults.
        assert_eq!(config.risk.max_open_positions, 10);
    }

    #[test]
    fn enabled_exchange_requires_credentials() {
        let text = r#"
            [exchanges.bybit]
            enabled = true
        "#;
        let document: Document = toml::from_str(text).unwrap();
        // No BYBIT_API_KEY in the environment for this test.
        unsafe { std::env::remove_var("BYBIT_API_KEY") };
        assert!(Config::from_document(document).is_err());
    }
}
