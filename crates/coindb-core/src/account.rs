//! Multisig accounts and their bins
//!
//! An account is an M-of-N policy over a set of keychains. Its bins are
//! address namespaces: bin `i` derives child `i` of every account keychain,
//! and each signing script of the bin takes the next leaf index under those
//! children.

use crate::ids::{AccountBinId, AccountId, KeychainId};
use crate::key::Key;
use crate::keychain::{is_valid_name, Keychain, KeychainError, Keychains};
use crate::script::{InputScriptMode, MultisigScript, ScriptError, MAX_MULTISIG_KEYS};
use crate::signing_script::{ScriptStatus, SigningScript};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

/// Lookahead pool size for new accounts.
pub const DEFAULT_UNUSED_POOL_SIZE: u32 = 25;

/// Bin index reserved for change addresses.
pub const CHANGE_BIN: u32 = 1;
/// Bin index reserved for receiving addresses.
pub const DEFAULT_BIN: u32 = 2;

pub const CHANGE_BIN_NAME: &str = "@change";
pub const DEFAULT_BIN_NAME: &str = "@default";

#[derive(Error, Debug)]
pub enum AccountError {
    #[error("Invalid name: {0:?}")]
    InvalidName(String),
    #[error("Account needs at least one keychain")]
    NoKeychains,
    #[error("Account can use at most 15 keychains, got {0}")]
    TooManyKeychains(usize),
    #[error("Minimum signatures {minsigs} invalid for {keychains} keychains")]
    InvalidMinSigs { minsigs: u32, keychains: usize },
    #[error("Unknown bin index {0}")]
    UnknownBin(u32),
    #[error(transparent)]
    Keychain(#[from] KeychainError),
    #[error(transparent)]
    Script(#[from] ScriptError),
}

#[derive(Debug, Clone)]
pub struct Account {
    id: Option<AccountId>,
    name: String,
    minsigs: u32,
    keychains: BTreeSet<KeychainId>,
    unused_pool_size: u32,
    time_created: u64,
    bins: Vec<AccountBin>,
}

impl Account {
    /// `time_created` is unix seconds, supplied by the caller.
    pub fn new(
        name: &str,
        minsigs: u32,
        keychains: impl IntoIterator<Item = KeychainId>,
        unused_pool_size: u32,
        time_created: u64,
    ) -> Result<Self, AccountError> {
        if !is_valid_name(name) {
            return Err(AccountError::InvalidName(name.to_string()));
        }
        let keychains: BTreeSet<KeychainId> = keychains.into_iter().collect();
        if keychains.is_empty() {
            return Err(AccountError::NoKeychains);
        }
        if keychains.len() > MAX_MULTISIG_KEYS {
            return Err(AccountError::TooManyKeychains(keychains.len()));
        }
        if minsigs == 0 || minsigs as usize > keychains.len() {
            return Err(AccountError::InvalidMinSigs {
                minsigs,
                keychains: keychains.len(),
            });
        }

        Ok(Self {
            id: None,
            name: name.to_string(),
            minsigs,
            keychains,
            unused_pool_size,
            time_created,
            bins: Vec::new(),
        })
    }

    /// Add a user bin at the next index.
    pub fn add_bin(&mut self, name: &str) -> Result<&mut AccountBin, AccountError> {
        if !is_valid_name(name) {
            return Err(AccountError::InvalidName(name.to_string()));
        }
        Ok(self.push_bin(name))
    }

    /// Add the `@change` and `@default` bins, in that order.
    pub(crate) fn add_reserved_bins(&mut self) {
        self.push_bin(CHANGE_BIN_NAME);
        self.push_bin(DEFAULT_BIN_NAME);
    }

    fn push_bin(&mut self, name: &str) -> &mut AccountBin {
        let index = self.bins.len() as u32 + 1;
        let position = self.bins.len();
        self.bins.push(AccountBin::new(self.id, index, name));
        &mut self.bins[position]
    }

    fn resolve_keychains<'a>(&self, keychains: &'a Keychains) -> Result<Vec<&'a Keychain>, AccountError> {
        self.keychains
            .iter()
            .map(|id| keychains.get(*id).ok_or(KeychainError::UnknownKeychain(*id)))
            .collect::<Result<Vec<_>, _>>()
            .map_err(AccountError::from)
    }

    /// Generate the next signing script of bin `bin_index`.
    pub fn new_signing_script(
        &mut self,
        bin_index: u32,
        keychains: &Keychains,
        label: &str,
    ) -> Result<SigningScript, AccountError> {
        let account_keychains = self.resolve_keychains(keychains)?;
        let minsigs = self.minsigs as usize;
        let bin = self
            .bins
            .iter_mut()
            .find(|bin| bin.index == bin_index)
            .ok_or(AccountError::UnknownBin(bin_index))?;
        bin.new_signing_script(minsigs, &account_keychains, keychains, label)
    }

    pub fn account_info(&self, keychains: &Keychains) -> Result<AccountInfo, AccountError> {
        let mut keychain_names: Vec<String> = self
            .resolve_keychains(keychains)?
            .into_iter()
            .map(|k| k.name().to_string())
            .collect();
        keychain_names.sort();

        Ok(AccountInfo {
            id: self.id,
            name: self.name.clone(),
            minsigs: self.minsigs,
            keychain_names,
            unused_pool_size: self.unused_pool_size,
            time_created: self.time_created,
            bin_names: self.bins.iter().map(|b| b.name.clone()).collect(),
        })
    }

    pub(crate) fn set_id(&mut self, id: AccountId) {
        self.id = Some(id);
        for bin in &mut self.bins {
            bin.account = Some(id);
        }
    }

    pub(crate) fn bins_mut(&mut self) -> &mut [AccountBin] {
        &mut self.bins
    }

    pub(crate) fn restore_bin(&mut self, bin: AccountBin) {
        self.bins.push(bin);
        self.bins.sort_by_key(|b| b.index);
    }

    pub(crate) fn from_parts(
        id: AccountId,
        name: String,
        minsigs: u32,
        keychains: BTreeSet<KeychainId>,
        unused_pool_size: u32,
        time_created: u64,
    ) -> Self {
        Self {
            id: Some(id),
            name,
            minsigs,
            keychains,
            unused_pool_size,
            time_created,
            bins: Vec::new(),
        }
    }

    pub fn id(&self) -> Option<AccountId> {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn minsigs(&self) -> u32 {
        self.minsigs
    }

    pub fn keychains(&self) -> &BTreeSet<KeychainId> {
        &self.keychains
    }

    pub fn unused_pool_size(&self) -> u32 {
        self.unused_pool_size
    }

    pub fn time_created(&self) -> u64 {
        self.time_created
    }

    pub fn bins(&self) -> &[AccountBin] {
        &self.bins
    }

    pub fn bin(&self, index: u32) -> Option<&AccountBin> {
        self.bins.iter().find(|b| b.index == index)
    }

    pub fn bin_by_name(&self, name: &str) -> Option<&AccountBin> {
        self.bins.iter().find(|b| b.name == name)
    }

    pub fn bin_count(&self) -> u32 {
        self.bins.len() as u32
    }
}

#[derive(Debug, Clone)]
pub struct AccountBin {
    id: Option<AccountBinId>,
    account: Option<AccountId>,
    index: u32,
    name: String,
    script_count: u32,
    keychains: Vec<Keychain>,
}

impl AccountBin {
    fn new(account: Option<AccountId>, index: u32, name: &str) -> Self {
        Self {
            id: None,
            account,
            index,
            name: name.to_string(),
            script_count: 0,
            keychains: Vec::new(),
        }
    }

    pub(crate) fn from_parts(
        id: AccountBinId,
        account: AccountId,
        index: u32,
        name: String,
        script_count: u32,
    ) -> Self {
        Self {
            id: Some(id),
            account: Some(account),
            index,
            name,
            script_count,
            keychains: Vec::new(),
        }
    }

    /// Derive the public child at this bin's index for every account keychain.
    ///
    /// Returns `Ok(false)` without touching the cache if already loaded.
    pub fn load_keychains(&mut self, account_keychains: &[&Keychain]) -> Result<bool, KeychainError> {
        if !self.keychains.is_empty() {
            return Ok(false);
        }
        self.keychains = account_keychains
            .iter()
            .map(|keychain| keychain.child(self.index, false))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(
            "loaded {} keychains for bin {:?} (index {})",
            self.keychains.len(),
            self.name,
            self.index
        );
        Ok(true)
    }

    /// Build the script at index `script_count`, then advance the counter.
    fn new_signing_script(
        &mut self,
        minsigs: usize,
        account_keychains: &[&Keychain],
        keychains: &Keychains,
        label: &str,
    ) -> Result<SigningScript, AccountError> {
        self.load_keychains(account_keychains)?;
        let index = self.script_count;

        let mut keys = self
            .keychains
            .iter()
            .map(|keychain| Key::new(keychains, keychain, index))
            .collect::<Result<Vec<_>, _>>()?;
        keys.sort_by_key(|key| key.pubkey().serialize());

        let multisig = MultisigScript::new(minsigs, keys.iter().map(|k| *k.pubkey()).collect())?;
        let script = SigningScript::new(
            self.account,
            self.id,
            index,
            label,
            ScriptStatus::Unused,
            multisig.txinscript(InputScriptMode::Edit)?,
            multisig.txoutscript(),
            keys,
        );

        self.script_count += 1;
        debug!("bin {:?}: new signing script {}", self.name, index);
        Ok(script)
    }

    pub(crate) fn set_id(&mut self, id: AccountBinId) {
        self.id = Some(id);
    }

    pub fn id(&self) -> Option<AccountBinId> {
        self.id
    }

    pub fn account(&self) -> Option<AccountId> {
        self.account
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn script_count(&self) -> u32 {
        self.script_count
    }

    pub fn is_change(&self) -> bool {
        self.index == CHANGE_BIN
    }

    pub fn keychains(&self) -> &[Keychain] {
        &self.keychains
    }
}

/// Read-only account summary with keychain names sorted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub id: Option<AccountId>,
    pub name: String,
    pub minsigs: u32,
    pub keychain_names: Vec<String>,
    pub unused_pool_size: u32,
    pub time_created: u64,
    pub bin_names: Vec<String>,
}
