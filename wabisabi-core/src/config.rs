//! Coordinator configuration.
//!
//! The configuration is a single JSON document. Every field has a default, so
//! a partial file is completed on load and written back normalized. The live
//! value sits behind [`SharedConfig`] and is re-read by every consumer on use,
//! which lets [`ConfigWatcher`] apply edits without a restart.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bitcoin::ScriptBuf;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::constants::{COIN_SATS, RISK_API_RETRY_STEP};
use crate::error::{CoordinatorError, Result};
use crate::types::ScriptType;

/// Live configuration handle shared by all components.
pub type SharedConfig = Arc<RwLock<WabiSabiConfig>>;

const DAY_SECONDS: u64 = 24 * 60 * 60;

// ═══════════════════════════════════════════════════════════════════════════════
// ROOT CONFIG
// ═══════════════════════════════════════════════════════════════════════════════

/// Coordinator configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WabiSabiConfig {
    /// Period of the arena tick.
    pub arena_period_seconds: u64,
    pub input_registration_timeout_seconds: u64,
    pub connection_confirmation_timeout_seconds: u64,
    pub output_registration_timeout_seconds: u64,
    pub transaction_signing_timeout_seconds: u64,
    /// How long an ended round stays visible in status before removal.
    pub ended_round_retention_seconds: u64,
    /// Upper bound on the time spent on one UTXO lookup.
    pub utxo_lookup_timeout_seconds: u64,

    pub max_input_count_by_round: usize,
    pub min_input_count_by_round_multiplier: f64,
    pub max_inputs_per_alice: usize,

    /// Smallest amount a single Alice may register, also the smallest output.
    pub min_registrable_amount_sats: u64,
    /// Largest amount a single Alice may register, also the largest output.
    pub max_registrable_amount_sats: u64,
    /// Virtual size budget of one Alice: her inputs plus the outputs she pays for.
    pub max_vsize_allocation_per_alice: u64,
    pub mining_fee_rate_sat_per_vb: u64,
    pub coordination_fee_rate: CoordinationFeeRate,
    /// Hex encoded script receiving coordination fees. Fees go to miners if unset.
    pub coordinator_script_pubkey: Option<String>,

    pub allowed_input_types: Vec<ScriptType>,
    pub allowed_output_types: Vec<ScriptType>,
    /// Whether inputs carrying a note (soft punishment) may register.
    pub allow_noted_input_registration: bool,

    pub prison: PrisonConfig,
    pub coin_verifier: CoinVerifierConfig,
    pub rpc: BitcoinRpcConfig,
}

impl Default for WabiSabiConfig {
    fn default() -> Self {
        Self {
            arena_period_seconds: 2,
            input_registration_timeout_seconds: 60 * 60,
            connection_confirmation_timeout_seconds: 60,
            output_registration_timeout_seconds: 60,
            transaction_signing_timeout_seconds: 60,
            ended_round_retention_seconds: 60,
            utxo_lookup_timeout_seconds: 10,
            max_input_count_by_round: 100,
            min_input_count_by_round_multiplier: 0.5,
            max_inputs_per_alice: 10,
            min_registrable_amount_sats: 5_000,
            max_registrable_amount_sats: 43_000 * COIN_SATS,
            max_vsize_allocation_per_alice: 255,
            mining_fee_rate_sat_per_vb: 2,
            coordination_fee_rate: CoordinationFeeRate::default(),
            coordinator_script_pubkey: None,
            allowed_input_types: vec![ScriptType::P2wpkh, ScriptType::Taproot],
            allowed_output_types: vec![ScriptType::P2wpkh, ScriptType::Taproot],
            allow_noted_input_registration: true,
            prison: PrisonConfig::default(),
            coin_verifier: CoinVerifierConfig::default(),
            rpc: BitcoinRpcConfig::default(),
        }
    }
}

impl WabiSabiConfig {
    /// Minimum number of inputs a round needs to proceed.
    ///
    /// `max(1, trunc(max_input_count_by_round * multiplier))`.
    pub fn min_input_count_by_round(&self) -> usize {
        let min = (self.max_input_count_by_round as f64 * self.min_input_count_by_round_multiplier).trunc();
        (min as usize).max(1)
    }

    pub fn arena_period(&self) -> Duration {
        Duration::from_secs(self.arena_period_seconds.max(1))
    }

    pub fn input_registration_timeout(&self) -> chrono::Duration {
        seconds(self.input_registration_timeout_seconds)
    }

    pub fn connection_confirmation_timeout(&self) -> chrono::Duration {
        seconds(self.connection_confirmation_timeout_seconds)
    }

    pub fn output_registration_timeout(&self) -> chrono::Duration {
        seconds(self.output_registration_timeout_seconds)
    }

    pub fn transaction_signing_timeout(&self) -> chrono::Duration {
        seconds(self.transaction_signing_timeout_seconds)
    }

    pub fn ended_round_retention(&self) -> chrono::Duration {
        seconds(self.ended_round_retention_seconds)
    }

    pub fn utxo_lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.utxo_lookup_timeout_seconds.max(1))
    }

    /// Weight budget of one Alice.
    pub fn max_weight_allocation_per_alice(&self) -> u64 {
        self.max_vsize_allocation_per_alice * crate::constants::WITNESS_SCALE_FACTOR
    }

    /// Decodes the coordinator script, if configured.
    pub fn coordinator_script(&self) -> Result<Option<ScriptBuf>> {
        match self.coordinator_script_pubkey.as_deref() {
            None | Some("") => Ok(None),
            Some(hex_script) => Ok(Some(ScriptBuf::from_bytes(hex::decode(hex_script)?))),
        }
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.max_input_count_by_round == 0 {
            return Err(CoordinatorError::ConfigError(
                "max_input_count_by_round must be positive".into(),
            ));
        }
        if !(self.min_input_count_by_round_multiplier > 0.0 && self.min_input_count_by_round_multiplier <= 1.0) {
            return Err(CoordinatorError::ConfigError(
                "min_input_count_by_round_multiplier must be in (0, 1]".into(),
            ));
        }
        if self.max_inputs_per_alice == 0 {
            return Err(CoordinatorError::ConfigError("max_inputs_per_alice must be positive".into()));
        }
        if self.min_registrable_amount_sats > self.max_registrable_amount_sats {
            return Err(CoordinatorError::ConfigError(
                "min_registrable_amount_sats exceeds max_registrable_amount_sats".into(),
            ));
        }
        if self.allowed_input_types.is_empty() || self.allowed_output_types.is_empty() {
            return Err(CoordinatorError::ConfigError("allowed script type lists must not be empty".into()));
        }
        if self.coin_verifier.enabled && self.coin_verifier.api_url.trim().is_empty() {
            return Err(CoordinatorError::ConfigError("coin verifier is enabled without an api_url".into()));
        }
        self.coordinator_script()?;
        Ok(())
    }

    /// Loads the configuration at `path`, creating or repairing the file.
    ///
    /// A missing file is created with defaults. A partial file is completed
    /// with defaults and rewritten. A file that does not parse or validate is
    /// replaced by defaults. None of these cases is an error; only failing to
    /// write the file is.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn load_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let (config, original) = match tokio::fs::read_to_string(path).await {
            Ok(contents) => match Self::parse(&contents) {
                Ok(config) => (config, Some(contents)),
                Err(e) => {
                    warn!(error = %e, "Config file is corrupt, falling back to defaults");
                    (Self::default(), None)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Config file not found, creating it with defaults");
                (Self::default(), None)
            }
            Err(e) => return Err(e.into()),
        };

        let normalized = serde_json::to_string_pretty(&config)?;
        if original.as_deref().map(str::trim_end) != Some(normalized.as_str()) {
            config.save(path).await?;
        }

        Ok(config)
    }

    /// Parses and validates a configuration document.
    pub fn parse(contents: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration atomically (temp file then rename).
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let json = serde_json::to_string_pretty(self)?;
        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, json).await?;
        tokio::fs::rename(&temp_path, path).await?;

        debug!(path = %path.display(), "Saved config");
        Ok(())
    }

    /// Wraps the configuration in a shared handle.
    pub fn into_shared(self) -> SharedConfig {
        Arc::new(RwLock::new(self))
    }
}

fn seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
}

// ═══════════════════════════════════════════════════════════════════════════════
// FEES
// ═══════════════════════════════════════════════════════════════════════════════

/// Coordination fee charged on registered inputs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationFeeRate {
    /// Fraction of the input amount, e.g. 0.003 for 0.3%.
    pub rate: f64,
    /// Inputs at or below this amount pay no coordination fee.
    pub plebs_dont_pay_threshold_sats: u64,
}

impl Default for CoordinationFeeRate {
    fn default() -> Self {
        Self {
            rate: 0.003,
            plebs_dont_pay_threshold_sats: COIN_SATS / 100,
        }
    }
}

impl CoordinationFeeRate {
    /// Fee owed on an input of `amount` sats.
    pub fn fee_for(&self, amount: u64) -> u64 {
        if amount <= self.plebs_dont_pay_threshold_sats || self.rate <= 0.0 {
            return 0;
        }
        (amount as f64 * self.rate).floor() as u64
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PRISON
// ═══════════════════════════════════════════════════════════════════════════════

/// Punishment policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrisonConfig {
    /// Length of a note (soft punishment).
    pub release_utxo_from_prison_after_seconds: u64,
    /// Cap on any computed disruption ban.
    pub release_utxo_from_prison_after_long_ban_seconds: u64,
    /// Coin value at which a disruption ban lasts one hour at factor 1.
    pub dos_severity_sats: u64,
    pub min_time_for_failed_to_verify_seconds: u64,
    pub min_time_for_cheating_seconds: u64,
    pub penalty_factor_for_disrupting_confirmation: f64,
    pub penalty_factor_for_disrupting_signal_ready_to_sign: f64,
    pub penalty_factor_for_disrupting_signing: f64,
    pub penalty_factor_for_disrupting_by_double_spending: f64,
    /// Coins at or above this value are only noted on their first offense.
    pub large_coin_threshold_sats: u64,
    /// How often the warden purges expired inmates.
    pub release_check_interval_seconds: u64,
}

impl Default for PrisonConfig {
    fn default() -> Self {
        Self {
            release_utxo_from_prison_after_seconds: 3 * 60 * 60,
            release_utxo_from_prison_after_long_ban_seconds: 180 * DAY_SECONDS,
            dos_severity_sats: COIN_SATS / 10,
            min_time_for_failed_to_verify_seconds: 31 * DAY_SECONDS,
            min_time_for_cheating_seconds: DAY_SECONDS,
            penalty_factor_for_disrupting_confirmation: 0.2,
            penalty_factor_for_disrupting_signal_ready_to_sign: 1.0,
            penalty_factor_for_disrupting_signing: 1.0,
            penalty_factor_for_disrupting_by_double_spending: 3.0,
            large_coin_threshold_sats: COIN_SATS,
            release_check_interval_seconds: 60,
        }
    }
}

impl PrisonConfig {
    pub fn note_duration(&self) -> chrono::Duration {
        seconds(self.release_utxo_from_prison_after_seconds)
    }

    pub fn long_ban_duration(&self) -> chrono::Duration {
        seconds(self.release_utxo_from_prison_after_long_ban_seconds)
    }

    pub fn failed_to_verify_duration(&self) -> chrono::Duration {
        seconds(self.min_time_for_failed_to_verify_seconds)
    }

    pub fn cheating_duration(&self) -> chrono::Duration {
        seconds(self.min_time_for_cheating_seconds)
    }

    pub fn release_check_interval(&self) -> Duration {
        Duration::from_secs(self.release_check_interval_seconds.max(1))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// COIN VERIFIER
// ═══════════════════════════════════════════════════════════════════════════════

/// External risk-scoring settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoinVerifierConfig {
    pub enabled: bool,
    /// Base URL; the coin's address is appended as the last path segment.
    pub api_url: String,
    /// Network used to render scripts as addresses for the API.
    pub network: bitcoin::Network,
    pub api_token: String,
    pub api_timeout_seconds: u64,
    pub max_attempts: u32,
    /// Coins with fewer confirmations are not sent to the API.
    pub required_confirmations: u32,
    /// Delay before a scheduled check is sent.
    pub start_delay_seconds: u64,
    /// Risk flags that do not make a coin naughty.
    pub harmless_risk_flags: Vec<u32>,
    pub release_from_whitelist_after_seconds: u64,
}

impl Default for CoinVerifierConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_url: String::new(),
            network: bitcoin::Network::Bitcoin,
            api_token: String::new(),
            api_timeout_seconds: 30,
            max_attempts: 3,
            required_confirmations: 3,
            start_delay_seconds: 0,
            harmless_risk_flags: vec![100],
            release_from_whitelist_after_seconds: 31 * DAY_SECONDS,
        }
    }
}

impl CoinVerifierConfig {
    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_seconds.max(1))
    }

    pub fn start_delay(&self) -> Duration {
        Duration::from_secs(self.start_delay_seconds)
    }

    /// Longest a scheduled check can take: the start delay, every attempt
    /// timing out, and the backoff between attempts.
    pub fn verification_timeout(&self) -> Duration {
        let attempts = self.max_attempts.max(1);
        let backoff = RISK_API_RETRY_STEP * (attempts * (attempts - 1) / 2);
        self.start_delay() + self.api_timeout() * attempts + backoff
    }

    pub fn release_from_whitelist_after(&self) -> chrono::Duration {
        seconds(self.release_from_whitelist_after_seconds)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BITCOIND RPC
// ═══════════════════════════════════════════════════════════════════════════════

/// bitcoind JSON-RPC endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BitcoinRpcConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
    pub timeout_seconds: u64,
    pub mempool_poll_interval_seconds: u64,
}

impl Default for BitcoinRpcConfig {
    fn default() -> Self {
        Self {
            uri: "http://127.0.0.1:8332".into(),
            user: String::new(),
            password: String::new(),
            timeout_seconds: 10,
            mempool_poll_interval_seconds: 5,
        }
    }
}

impl BitcoinRpcConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }

    pub fn mempool_poll_interval(&self) -> Duration {
        Duration::from_secs(self.mempool_poll_interval_seconds.max(1))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WATCHER
// ═══════════════════════════════════════════════════════════════════════════════

/// Polls the configuration file and hot-reloads it into the shared handle.
#[derive(Debug)]
pub struct ConfigWatcher {
    path: PathBuf,
    config: SharedConfig,
    poll_interval: Duration,
    last_modified: Mutex<Option<SystemTime>>,
}

impl ConfigWatcher {
    /// Loads (or creates) the file and starts tracking it.
    pub async fn open(path: impl Into<PathBuf>, poll_interval: Duration) -> Result<Self> {
        let path = path.into();
        let config = WabiSabiConfig::load_or_create(&path).await?;
        let last_modified = modified_at(&path).await;

        Ok(Self {
            path,
            config: config.into_shared(),
            poll_interval,
            last_modified: Mutex::new(last_modified),
        })
    }

    /// Returns the live configuration handle.
    pub fn config(&self) -> SharedConfig {
        Arc::clone(&self.config)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reloads the file if its modification time changed.
    ///
    /// A file that fails to parse keeps the previous configuration in force.
    /// Returns true if a new configuration was applied.
    pub async fn check_for_changes(&self) -> Result<bool> {
        let modified = modified_at(&self.path).await;
        if modified == *self.last_modified.lock() {
            return Ok(false);
        }
        *self.last_modified.lock() = modified;

        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) => {
                warn!(error = %e, path = %self.path.display(), "Config file unreadable, keeping current config");
                return Ok(false);
            }
        };

        match WabiSabiConfig::parse(&contents) {
            Ok(new_config) => {
                let mut current = self.config.write();
                if *current == new_config {
                    return Ok(false);
                }
                *current = new_config;
                info!(path = %self.path.display(), "Config reloaded");
                Ok(true)
            }
            Err(e) => {
                warn!(error = %e, path = %self.path.display(), "Config file invalid, keeping current config");
                Ok(false)
            }
        }
    }

    /// Polls until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.check_for_changes().await {
                        warn!(error = %e, "Config reload failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("Config watcher stopped");
                        return;
                    }
                }
            }
        }
    }
}

async fn modified_at(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok().and_then(|m| m.modified().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use test_case::test_case;

    #[test_case(100, 0.5, 50 ; "default")]
    #[test_case(4, 0.5, 2 ; "scenario b")]
    #[test_case(3, 0.5, 1 ; "truncates")]
    #[test_case(1, 0.1, 1 ; "at least one")]
    fn test_min_input_count(max: usize, multiplier: f64, expected: usize) {
        let config = WabiSabiConfig {
            max_input_count_by_round: max,
            min_input_count_by_round_multiplier: multiplier,
            ..Default::default()
        };
        assert_eq!(config.min_input_count_by_round(), expected);
    }

    #[test]
    fn test_verification_timeout_covers_retries() {
        let config = CoinVerifierConfig {
            api_timeout_seconds: 30,
            max_attempts: 3,
            start_delay_seconds: 5,
            ..Default::default()
        };
        // 5 s delay, 3 attempts of 30 s, 1 s + 2 s backoff
        assert_eq!(config.verification_timeout(), Duration::from_secs(98));

        let single = CoinVerifierConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert_eq!(single.verification_timeout(), single.api_timeout());
    }

    #[test]
    fn test_coordination_fee() {
        let fee = CoordinationFeeRate::default();
        assert_eq!(fee.fee_for(COIN_SATS / 100), 0);
        assert_eq!(fee.fee_for(COIN_SATS), 300_000);
    }

    #[tokio::test]
    async fn test_missing_file_is_created() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = WabiSabiConfig::load_or_create(&path).await.unwrap();
        assert_eq!(config, WabiSabiConfig::default());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_partial_file_is_completed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, r#"{ "max_input_count_by_round": 7 }"#).await.unwrap();

        let config = WabiSabiConfig::load_or_create(&path).await.unwrap();
        assert_eq!(config.max_input_count_by_round, 7);
        assert_eq!(config.arena_period_seconds, 2);

        let rewritten = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(rewritten.contains("\"connection_confirmation_timeout_seconds\": 60"));
    }

    #[tokio::test]
    async fn test_corrupt_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();

        let config = WabiSabiConfig::load_or_create(&path).await.unwrap();
        assert_eq!(config, WabiSabiConfig::default());

        let rewritten = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(WabiSabiConfig::parse(&rewritten).is_ok());
    }

    #[tokio::test]
    async fn test_watcher_reloads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let watcher = ConfigWatcher::open(&path, Duration::from_millis(10)).await.unwrap();
        assert_eq!(watcher.config().read().max_input_count_by_round, 100);

        let updated = WabiSabiConfig {
            max_input_count_by_round: 3,
            ..Default::default()
        };
        updated.save(&path).await.unwrap();
        // Force a different mtime on filesystems with coarse timestamps.
        *watcher.last_modified.lock() = None;

        assert!(watcher.check_for_changes().await.unwrap());
        assert_eq!(watcher.config().read().max_input_count_by_round, 3);
    }

    #[tokio::test]
    async fn test_watcher_keeps_config_on_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let watcher = ConfigWatcher::open(&path, Duration::from_millis(10)).await.unwrap();

        tokio::fs::write(&path, "garbage").await.unwrap();
        *watcher.last_modified.lock() = None;

        assert!(!watcher.check_for_changes().await.unwrap());
        assert_eq!(*watcher.config().read(), WabiSabiConfig::default());
    }

    #[test]
    fn test_validate_rejects_bad_multiplier() {
        let config = WabiSabiConfig {
            min_input_count_by_round_multiplier: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
