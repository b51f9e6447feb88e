//! CoinDB Core
//!
//! Domain model of an HD multisig wallet.
//!
//! # Keys
//!
//! BIP-32 keychains form a tree rooted at a seed. Chain codes and private
//! keys can be locked (dropped from memory) and restored from sealed copies
//! made with a lock key (Argon2id + AES-256-GCM).
//!
//! # Addresses
//!
//! An account is an M-of-N policy over keychains. Each account bin derives
//! child `bin` of every keychain; signing script `i` of the bin is the
//! P2SH multisig over leaf `i` of those children, keys sorted. A lookahead
//! pool of unused scripts is kept per bin.
//!
//! # Transactions
//!
//! A transaction is identified by its unsigned hash (input scripts blanked),
//! which is stable while signatures are added. The final txid is known only
//! once every input is fully signed.
//!
//! # Storage
//!
//! [`Wallet`] owns every entity in memory; [`Store`] saves and loads it
//! through SQLite.

pub mod account;
pub mod block;
pub mod crypto;
pub mod flags;
pub mod ids;
pub mod key;
pub mod keychain;
pub mod script;
pub mod seed;
pub mod signing_script;
pub mod store;
pub mod tx;
pub mod views;
pub mod wallet;

pub use account::{Account, AccountBin, AccountError, AccountInfo};
pub use block::{BlockError, BlockHeader, MerkleBlock};
pub use crypto::{Argon2Cipher, LockCipher, LockError, LockParams, Sealed};
pub use flags::{Flag, FlagSet};
pub use ids::*;
pub use key::Key;
pub use keychain::{Keychain, KeychainError, Keychains};
pub use script::{InputScriptMode, MultisigScript, ScriptError};
pub use seed::*;
pub use signing_script::{ScriptStatus, SigningScript};
pub use store::{Store, StoreError};
pub use tx::{Tx, TxError, TxIn, TxOut, TxOutType, TxStatus};
pub use views::{AccountBinView, ScriptFilter, SigningScriptView};
pub use wallet::{Wallet, WalletError};
