//! CoinDB command-line front end for the multisig wallet store
//!
//! # Usage
//!
//! ```bash
//! coindb init
//! COINDB_LOCK_KEY=... coindb keychain new alice
//! coindb keychain import bob xpub6...
//! COINDB_LOCK_KEY=... coindb account new vault 2 alice bob carol
//! COINDB_LOCK_KEY=... coindb script issue vault @default "invoice 42"
//! coindb script list vault
//! ```

mod config;

use anyhow::{Context, Result};
use bitcoin::bip32::Xpub;
use coindb_core::account::DEFAULT_BIN_NAME;
use coindb_core::{
    generate_mnemonic, derive_seed, Argon2Cipher, Keychain, ScriptFilter, Store, Wallet,
};
use config::CliConfig;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

fn main() -> Result<()> {
    // Parse CLI args (minimal, no clap)
    let args: Vec<String> = std::env::args().collect();

    let mut config_path = PathBuf::from("coindb.toml");
    let mut command = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                if i < args.len() {
                    config_path = PathBuf::from(&args[i]);
                } else {
                    anyhow::bail!("--config requires a path argument");
                }
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "--version" | "-V" => {
                println!("coindb {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            _ => command.push(args[i].clone()),
        }
        i += 1;
    }

    // Load config
    let config = CliConfig::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    config.validate().context("Configuration validation failed")?;

    // Init logger
    std::env::set_var("RUST_LOG", &config.wallet.log_level);
    env_logger::init();

    let command: Vec<&str> = command.iter().map(String::as_str).collect();
    run(&config, &command)
}

struct Session<'a> {
    config: &'a CliConfig,
    store: Store,
    wallet: Wallet,
}

impl<'a> Session<'a> {
    fn open(config: &'a CliConfig) -> Result<Self> {
        let store = Store::open(&config.wallet.db_path)
            .with_context(|| format!("Failed to open {}", config.wallet.db_path.display()))?;
        let wallet = store.load().context("Failed to load wallet")?;
        Ok(Self {
            config,
            store,
            wallet,
        })
    }

    fn cipher(&self) -> Argon2Cipher {
        Argon2Cipher::new(self.config.lock_params())
    }

    fn unlock(&mut self) -> Result<()> {
        let key = config::lock_key()?;
        let cipher = self.cipher();
        self.wallet
            .unlock_keychains(&cipher, key.as_bytes())
            .context("Failed to unlock keychains (wrong lock key?)")
    }

    /// Seal any new cleartext and write the snapshot back.
    fn commit(&mut self) -> Result<()> {
        let key = config::lock_key()?;
        let cipher = self.cipher();
        self.wallet
            .set_lock_key(&cipher, key.as_bytes())
            .context("Failed to seal keychains")?;
        self.store.save(&self.wallet).context("Failed to save wallet")?;
        self.wallet.lock_keychains();
        Ok(())
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn filter(account: Option<&str>, bin: Option<&str>) -> ScriptFilter {
    let mut filter = ScriptFilter::default();
    if let Some(account) = account {
        filter = filter.account(account);
    }
    if let Some(bin) = bin {
        filter = filter.bin(bin);
    }
    filter
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn run(config: &CliConfig, command: &[&str]) -> Result<()> {
    match command {
        ["init"] => {
            Store::open(&config.wallet.db_path)
                .with_context(|| format!("Failed to create {}", config.wallet.db_path.display()))?;
            println!("Initialized {}", config.wallet.db_path.display());
        }

        ["keychain", "new", name] => {
            let mut session = Session::open(config)?;
            let mnemonic = generate_mnemonic(24)?;
            let seed = derive_seed(&mnemonic, "");
            session.wallet.new_keychain(name, &seed[..])?;
            session.commit()?;

            println!("Keychain {:?} created. Write down the mnemonic, it is shown only once:\n", name);
            println!("{}", mnemonic);
        }

        ["keychain", "import", name, xpub] => {
            let mut session = Session::open(config)?;
            let xpub = Xpub::from_str(xpub).context("Invalid extended public key")?;
            session
                .wallet
                .import_keychain(Keychain::from_xpub(name, &xpub)?)?;
            session.commit()?;
            println!("Imported public keychain {:?}", name);
        }

        ["keychain", "export", name, rest @ ..] => {
            let want_private = match rest {
                [] => false,
                ["--private"] => true,
                _ => anyhow::bail!("Usage: coindb keychain export <name> [--private]"),
            };
            let mut session = Session::open(config)?;
            let id = session.wallet.keychain_id(name)?;
            let key = config::lock_key()?;
            let cipher = session.cipher();
            let keychain = session
                .wallet
                .keychains_mut()
                .get_mut(id)
                .context("Keychain vanished")?;
            keychain.unlock_chain_code(&cipher, key.as_bytes())?;
            if want_private {
                keychain.unlock_private_key(&cipher, key.as_bytes())?;
            }
            println!("{}", keychain.extkey(want_private, config.network()?)?.as_str());
        }

        ["account", "new", name, minsigs, keychains @ ..] => {
            let minsigs: u32 = minsigs.parse().context("minsigs must be a number")?;
            let mut session = Session::open(config)?;
            session.unlock()?;
            let id = session.wallet.new_account(
                name,
                minsigs,
                keychains,
                config.wallet.unused_pool_size,
                now(),
            )?;
            let info = session.wallet.account_info(id)?;
            session.commit()?;
            print_json(&info)?;
        }

        ["account", "info", name] => {
            let session = Session::open(config)?;
            let id = session.wallet.account_id(name)?;
            print_json(&session.wallet.account_info(id)?)?;
        }

        ["bin", "new", account, name] => {
            let mut session = Session::open(config)?;
            session.unlock()?;
            let account = session.wallet.account_id(account)?;
            session.wallet.add_account_bin(account, name)?;
            session.commit()?;
            println!("Added bin {:?}", name);
        }

        ["bin", "list"] => {
            let store = Store::open(&config.wallet.db_path)?;
            print_json(&store.account_bin_views()?)?;
        }

        ["script", "issue", account, rest @ ..] => {
            let (bin_name, label) = match rest {
                [] => (DEFAULT_BIN_NAME, ""),
                [bin] => (*bin, ""),
                [bin, label] => (*bin, *label),
                _ => anyhow::bail!("Usage: coindb script issue <account> [bin] [label]"),
            };
            let mut session = Session::open(config)?;
            session.unlock()?;
            let account_id = session.wallet.account_id(account)?;
            let bin_index = session
                .wallet
                .account(account_id)
                .and_then(|a| a.bin_by_name(bin_name))
                .map(|bin| bin.index())
                .with_context(|| format!("Account {:?} has no bin {:?}", account, bin_name))?;

            let issued = session.wallet.issue_script(account_id, bin_index, label)?;
            session.commit()?;

            let script = session.wallet.script(issued).context("Issued script vanished")?;
            let address = bitcoin::Address::from_script(script.txoutscript(), config.network()?)?;
            print_json(&serde_json::json!({
                "id": issued,
                "account": account,
                "bin": bin_name,
                "index": script.index(),
                "label": script.label(),
                "address": address.to_string(),
            }))?;
        }

        ["script", "list", rest @ ..] | ["script", "count", rest @ ..] => {
            let (account, bin) = match rest {
                [] => (None, None),
                [account] => (Some(*account), None),
                [account, bin] => (Some(*account), Some(*bin)),
                _ => anyhow::bail!("Usage: coindb script {} [account] [bin]", command[1]),
            };
            let store = Store::open(&config.wallet.db_path)?;
            let filter = filter(account, bin);
            if command[1] == "count" {
                println!("{}", store.script_count(&filter)?);
            } else {
                print_json(&store.signing_script_views(&filter)?)?;
            }
        }

        [] => {
            print_help();
        }

        other => anyhow::bail!("Unknown command: {}", other.join(" ")),
    }
    Ok(())
}

fn print_help() {
    println!(
        r#"CoinDB: HD multisig wallet store

USAGE:
    coindb [OPTIONS] <COMMAND>

OPTIONS:
    -c, --config <PATH>   Config file path (default: coindb.toml)
    -h, --help            Show this help message
    -V, --version         Show version

COMMANDS:
    init                                     Create the database
    keychain new <name>                      New root keychain from a fresh mnemonic
    keychain import <name> <xpub>            Add a cosigner's public keychain
    keychain export <name> [--private]       Print the extended key
    account new <name> <minsigs> <keychain>...
    account info <name>
    bin new <account> <name>
    bin list
    script issue <account> [bin] [label]     Hand out the next address of a bin
    script list [account] [bin]
    script count [account] [bin]

ENVIRONMENT VARIABLES (override config file):
    COINDB_DB_PATH      SQLite database path
    COINDB_NETWORK      Network (bitcoin/testnet/signet/regtest)
    COINDB_LOG_LEVEL    Log level (error/warn/info/debug/trace)
    COINDB_POOL_SIZE    Lookahead pool size for new accounts
    COINDB_LOCK_KEY     Passphrase sealing keychain secrets
"#
    );
}
