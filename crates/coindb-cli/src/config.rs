//! CLI configuration, parsed from a TOML file plus environment variable overrides.
//!
//! Priority: environment variables > config file > defaults.
//! The lock passphrase is only ever read from `COINDB_LOCK_KEY`.

use anyhow::{Context, Result};
use coindb_core::LockParams;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Environment variable holding the lock passphrase
pub const LOCK_KEY_ENV: &str = "COINDB_LOCK_KEY";

/// Top-level CLI configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliConfig {
    /// Wallet database settings
    #[serde(default)]
    pub wallet: WalletSection,

    /// Argon2id cost parameters for sealing keychains
    #[serde(default)]
    pub lock: LockSection,
}

/// Wallet database settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletSection {
    /// SQLite database file
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Network used for extended key export: "bitcoin", "testnet", "signet", "regtest"
    #[serde(default = "default_network")]
    pub network: String,

    /// Lookahead pool size for new accounts
    #[serde(default = "default_pool_size")]
    pub unused_pool_size: u32,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for WalletSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            network: default_network(),
            unused_pool_size: default_pool_size(),
            log_level: default_log_level(),
        }
    }
}

/// Argon2id cost parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSection {
    /// Memory cost in KiB (default: 64 MiB)
    #[serde(default = "default_m_cost")]
    pub m_cost_kib: u32,

    /// Iterations
    #[serde(default = "default_t_cost")]
    pub t_cost: u32,

    /// Lanes
    #[serde(default = "default_p_cost")]
    pub p_cost: u32,
}

impl Default for LockSection {
    fn default() -> Self {
        Self {
            m_cost_kib: default_m_cost(),
            t_cost: default_t_cost(),
            p_cost: default_p_cost(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_db_path() -> PathBuf {
    PathBuf::from("coindb.sqlite")
}

fn default_network() -> String {
    "bitcoin".to_string()
}

fn default_pool_size() -> u32 {
    coindb_core::account::DEFAULT_UNUSED_POOL_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_m_cost() -> u32 {
    LockParams::default().m_cost_kib
}

fn default_t_cost() -> u32 {
    LockParams::default().t_cost
}

fn default_p_cost() -> u32 {
    LockParams::default().p_cost
}

// ============================================================================
// Loading & environment override
// ============================================================================

impl CliConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: CliConfig =
            toml::from_str(&contents).with_context(|| "Failed to parse TOML config")?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise start from defaults; then apply
    /// environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            Self::from_file(path)?
        } else {
            log::debug!("no config at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// Supported env vars:
    /// - `COINDB_DB_PATH`
    /// - `COINDB_NETWORK`
    /// - `COINDB_LOG_LEVEL`
    /// - `COINDB_POOL_SIZE`
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("COINDB_DB_PATH") {
            self.wallet.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("COINDB_NETWORK") {
            self.wallet.network = v;
        }
        if let Ok(v) = std::env::var("COINDB_LOG_LEVEL") {
            self.wallet.log_level = v;
        }
        if let Ok(v) = std::env::var("COINDB_POOL_SIZE") {
            if let Ok(size) = v.parse::<u32>() {
                self.wallet.unused_pool_size = size;
            }
        }
    }

    /// Parse the network string to a `bitcoin::Network`.
    pub fn network(&self) -> Result<bitcoin::Network> {
        match self.wallet.network.as_str() {
            "bitcoin" | "mainnet" => Ok(bitcoin::Network::Bitcoin),
            "testnet" | "testnet3" => Ok(bitcoin::Network::Testnet),
            "signet" => Ok(bitcoin::Network::Signet),
            "regtest" => Ok(bitcoin::Network::Regtest),
            other => anyhow::bail!("Unknown network: {}", other),
        }
    }

    pub fn lock_params(&self) -> LockParams {
        LockParams {
            m_cost_kib: self.lock.m_cost_kib,
            t_cost: self.lock.t_cost,
            p_cost: self.lock.p_cost,
        }
    }

    /// Validate that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.wallet.db_path.as_os_str().is_empty(),
            "wallet.db_path must not be empty"
        );
        self.network().context("wallet.network is invalid")?;

        anyhow::ensure!(self.lock.m_cost_kib > 0, "lock.m_cost_kib must be > 0");
        anyhow::ensure!(self.lock.t_cost > 0, "lock.t_cost must be > 0");
        anyhow::ensure!(self.lock.p_cost > 0, "lock.p_cost must be > 0");

        Ok(())
    }
}

/// Read the lock passphrase from the environment.
pub fn lock_key() -> Result<Zeroizing<String>> {
    let key = std::env::var(LOCK_KEY_ENV)
        .map(Zeroizing::new)
        .with_context(|| format!("{} must be set", LOCK_KEY_ENV))?;
    anyhow::ensure!(!key.is_empty(), "{} must not be empty", LOCK_KEY_ENV);
    Ok(key)
}

// ============================================================================
// Tests
// ============================================================================
