//! Application configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use sigex_core::{InstrumentId, InstrumentSpec, Price, RetryPolicy, Size};
use sigex_executor::{
    BuilderConfig, MachineConfig, PayloadVariation, ProbeConfig, ProtectionParams, TransportConfig,
    VariationPolicy,
};
use sigex_gate::GateConfig;
use sigex_persistence::RecorderConfig;

use crate::error::{AppError, AppResult};

/// Upper bound (%) for the STOP trigger buffer and the TP reference offset.
const MAX_PRICE_OFFSET_PCT: u32 = 5;

/// Operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    /// In-process simulated exchange.
    #[default]
    Paper,
    /// Real exchange; the transport must be supplied by the embedding program.
    Live,
}

/// One instrument the scan loop polls for signals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchlistEntry {
    pub instrument: String,
    pub tick_size: Decimal,
    pub lot_size: Decimal,
    /// Entry quantity per approved signal, rounded down to `lot_size`.
    pub order_qty: Decimal,
    /// When set, only signals from this strategy are traded.
    #[serde(default)]
    pub strategy_key: Option<String>,
}

impl WatchlistEntry {
    pub fn instrument_id(&self) -> InstrumentId {
        InstrumentId::new(self.instrument.clone())
    }

    pub fn spec(&self) -> InstrumentSpec {
        InstrumentSpec::new(
            self.instrument_id(),
            Price::new(self.tick_size),
            Size::new(self.lot_size),
        )
    }

    pub fn quantity(&self) -> Size {
        Size::new(self.order_qty)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Price move (percent) that overrides the cooldown.
    #[serde(default = "default_min_price_change_pct")]
    pub min_price_change_pct: Decimal,
}

fn default_cooldown_secs() -> u64 {
    300
}

fn default_min_price_change_pct() -> Decimal {
    Decimal::ONE
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            min_price_change_pct: default_min_price_change_pct(),
        }
    }
}

/// SL/TP distances and construction buffers, all in percent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtectionConfig {
    #[serde(flatten)]
    pub targets: ProtectionParams,
    #[serde(flatten)]
    pub builder: BuilderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSettings {
    #[serde(default = "default_verify_delay_ms")]
    pub verify_delay_ms: u64,
    /// Ordered request shapes. Missing means the built-in list.
    #[serde(default)]
    pub variations: Option<Vec<PayloadVariation>>,
}

fn default_verify_delay_ms() -> u64 {
    250
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            verify_delay_ms: default_verify_delay_ms(),
            variations: None,
        }
    }
}

/// Storage call bounds: per-call timeout plus backoff for unavailability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
    #[serde(flatten)]
    pub retry: RetryPolicy,
}

fn default_op_timeout_ms() -> u64 {
    5_000
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            op_timeout_ms: default_op_timeout_ms(),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Directory for the decision trace fallback file.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Absent means log-only notifications.
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_webhook_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_webhook_timeout_ms() -> u64 {
    5_000
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_ms: default_webhook_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperConfig {
    /// JSON Lines file of signals to replay, one per scan tick and instrument.
    #[serde(default)]
    pub signals_path: Option<PathBuf>,
    /// Delay between entry acceptance and the simulated fill.
    #[serde(default = "default_fill_delay_ms")]
    pub fill_delay_ms: u64,
}

fn default_fill_delay_ms() -> u64 {
    500
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            signals_path: None,
            fill_delay_ms: default_fill_delay_ms(),
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub mode: OperatingMode,
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    #[serde(default = "default_fill_timeout_ms")]
    pub fill_timeout_ms: u64,
    #[serde(default)]
    pub watchlist: Vec<WatchlistEntry>,
    #[serde(default)]
    pub throttle: ThrottleConfig,
    #[serde(default)]
    pub protection: ProtectionConfig,
    #[serde(default)]
    pub probe: ProbeSettings,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub notification: NotificationConfig,
    #[serde(default)]
    pub paper: PaperConfig,
}

fn default_scan_interval_ms() -> u64 {
    1_000
}

fn default_fill_timeout_ms() -> u64 {
    30_000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: OperatingMode::default(),
            scan_interval_ms: default_scan_interval_ms(),
            fill_timeout_ms: default_fill_timeout_ms(),
            watchlist: Vec::new(),
            throttle: ThrottleConfig::default(),
            protection: ProtectionConfig::default(),
            probe: ProbeSettings::default(),
            transport: TransportConfig::default(),
            storage: StorageConfig::default(),
            persistence: PersistenceConfig::default(),
            notification: NotificationConfig::default(),
            paper: PaperConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load and validate from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read config {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> AppResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.scan_interval_ms == 0 {
            return Err(AppError::Config("scan_interval_ms must be positive".to_string()));
        }
        if self.watchlist.is_empty() {
            return Err(AppError::Config("watchlist is empty".to_string()));
        }
        for entry in &self.watchlist {
            if entry.instrument.trim().is_empty() {
                return Err(AppError::Config("watchlist entry without instrument".to_string()));
            }
            if entry.tick_size <= Decimal::ZERO || entry.lot_size <= Decimal::ZERO {
                return Err(AppError::Config(format!(
                    "{}: tick_size and lot_size must be positive",
                    entry.instrument
                )));
            }
            if entry.quantity().round_to_lot(Size::new(entry.lot_size)).is_zero() {
                return Err(AppError::Config(format!(
                    "{}: order_qty {} is below lot size {}",
                    entry.instrument, entry.order_qty, entry.lot_size
                )));
            }
        }
        let targets = &self.protection.targets;
        if targets.stop_loss_pct <= Decimal::ZERO || targets.stop_loss_pct >= Decimal::ONE_HUNDRED {
            return Err(AppError::Config(format!(
                "stop_loss_pct must be in (0, 100): {}",
                targets.stop_loss_pct
            )));
        }
        if targets.take_profit_pct <= Decimal::ZERO {
            return Err(AppError::Config(format!(
                "take_profit_pct must be positive: {}",
                targets.take_profit_pct
            )));
        }
        let builder = &self.protection.builder;
        let max_offset = Decimal::from(MAX_PRICE_OFFSET_PCT);
        for (name, pct) in [
            ("stop_trigger_buffer_pct", builder.stop_trigger_buffer_pct),
            ("tp_reference_offset_pct", builder.tp_reference_offset_pct),
        ] {
            if pct <= Decimal::ZERO || pct > max_offset {
                return Err(AppError::Config(format!(
                    "{name} must be in (0, {max_offset}]: {pct}"
                )));
            }
        }
        self.variation_policy()?;
        Ok(())
    }

    pub fn is_paper_mode(&self) -> bool {
        self.mode == OperatingMode::Paper
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn instruments(&self) -> Vec<InstrumentSpec> {
        self.watchlist.iter().map(WatchlistEntry::spec).collect()
    }

    pub fn variation_policy(&self) -> AppResult<VariationPolicy> {
        match &self.probe.variations {
            Some(list) => Ok(VariationPolicy::new(list.clone())?),
            None => Ok(VariationPolicy::default()),
        }
    }

    pub fn gate_config(&self) -> GateConfig {
        GateConfig {
            cooldown_secs: self.throttle.cooldown_secs,
            min_price_change_pct: self.throttle.min_price_change_pct,
            op_timeout_ms: self.storage.op_timeout_ms,
            retry: self.storage.retry,
        }
    }

    pub fn recorder_config(&self) -> RecorderConfig {
        RecorderConfig {
            retry: self.storage.retry,
            op_timeout_ms: self.storage.op_timeout_ms,
        }
    }

    pub fn machine_config(&self) -> MachineConfig {
        MachineConfig {
            fill_timeout_ms: self.fill_timeout_ms,
            storage_retry: self.storage.retry,
            op_timeout_ms: self.storage.op_timeout_ms,
            builder: self.protection.builder.clone(),
            protection: self.protection.targets.clone(),
            probe: ProbeConfig {
                verify_delay_ms: self.probe.verify_delay_ms,
                storage_retry: self.storage.retry,
                op_timeout_ms: self.storage.op_timeout_ms,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use sigex_executor::SideField;

    const MINIMAL: &str = r#"
        [[watchlist]]
        instrument = "BTC-USDT-SWAP"
        tick_size = "0.1"
        lot_size = "0.001"
        order_qty = "0.01"
    "#;

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config = AppConfig::from_toml(MINIMAL).unwrap();
        assert!(config.is_paper_mode());
        assert_eq!(config.scan_interval_ms, 1_000);
        assert_eq!(config.fill_timeout_ms, 30_000);
        assert_eq!(config.throttle.cooldown_secs, 300);
        assert_eq!(config.throttle.min_price_change_pct, dec!(1));
        assert_eq!(config.protection.targets.stop_loss_pct, dec!(3));
        assert_eq!(config.protection.targets.take_profit_pct, dec!(6));
        assert_eq!(config.protection.builder.stop_trigger_buffer_pct, dec!(0.75));
        assert_eq!(config.probe.verify_delay_ms, 250);
        assert_eq!(config.transport.request_timeout_ms, 8_000);
        assert_eq!(config.storage.op_timeout_ms, 5_000);
        assert_eq!(config.storage.retry.max_attempts, 3);
        assert!(config.notification.webhook_url.is_none());
        assert_eq!(config.variation_policy().unwrap().len(), 4);
    }

    #[test]
    fn test_full_config_parses() {
        let toml = r#"
            mode = "live"
            scan_interval_ms = 250
            fill_timeout_ms = 10000

            [[watchlist]]
            instrument = "X"
            tick_size = "0.01"
            lot_size = "1"
            order_qty = "5"
            strategy_key = "rsi"

            [throttle]
            cooldown_secs = 60
            min_price_change_pct = "0.5"

            [protection]
            stop_loss_pct = "2"
            take_profit_pct = "4"
            stop_trigger_buffer_pct = "0.5"

            [probe]
            verify_delay_ms = 0

            [[probe.variations]]
            id = "omit_first"
            side_field = "omit"

            [[probe.variations]]
            id = "explicit_num"
            side_field = "explicit"
            numeric_encoding = "number"

            [storage]
            op_timeout_ms = 1000
            max_attempts = 5

            [notification]
            webhook_url = "https://hooks.example.com/alerts"
        "#;
        let config = AppConfig::from_toml(toml).unwrap();
        assert_eq!(config.mode, OperatingMode::Live);
        assert_eq!(config.gate_config().cooldown_secs, 60);
        assert_eq!(config.gate_config().retry.max_attempts, 5);
        assert_eq!(config.gate_config().retry.base_delay_ms, 50);

        let machine = config.machine_config();
        assert_eq!(machine.fill_timeout_ms, 10_000);
        assert_eq!(machine.protection.stop_loss_pct, dec!(2));
        assert_eq!(machine.builder.stop_trigger_buffer_pct, dec!(0.5));
        assert_eq!(machine.builder.tp_reference_offset_pct, dec!(0.1));
        assert_eq!(machine.probe.verify_delay_ms, 0);

        let policy = config.variation_policy().unwrap();
        assert_eq!(policy.variations()[0].id, "omit_first");
        assert_eq!(policy.variations()[0].side_field, SideField::Omit);
        assert_eq!(config.instruments()[0].tick_size, Price::new(dec!(0.01)));
    }

    #[test]
    fn test_price_offsets_are_bounded() {
        let with = |buffer: &str, offset: &str| {
            format!(
                "{MINIMAL}\n[protection]\nstop_trigger_buffer_pct = \"{buffer}\"\ntp_reference_offset_pct = \"{offset}\"\n"
            )
        };
        assert!(AppConfig::from_toml(&with("5", "0.1")).is_ok());

        let err = AppConfig::from_toml(&with("50", "0.1")).unwrap_err();
        assert!(err.to_string().contains("stop_trigger_buffer_pct"));
        assert!(AppConfig::from_toml(&with("0", "0.1")).is_err());
        assert!(AppConfig::from_toml(&with("0.75", "7")).is_err());
    }

    #[test]
    fn test_rejects_invalid_config() {
        assert!(AppConfig::from_toml("").is_err());

        let dup = format!(
            "{MINIMAL}\n[[probe.variations]]\nid = \"a\"\n[[probe.variations]]\nid = \"a\"\n"
        );
        assert!(AppConfig::from_toml(&dup).is_err());

        let tiny_qty = MINIMAL.replace("order_qty = \"0.01\"", "order_qty = \"0.0001\"");
        assert!(AppConfig::from_toml(&tiny_qty).is_err());
    }
}
