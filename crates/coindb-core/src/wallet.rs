//! In-memory entity arena
//!
//! [`Wallet`] owns every entity and hands out typed ids. Owning edges
//! (account → bins, tx → inputs/outputs) are held directly; everything else
//! is an id resolved through the maps here. It also enforces the unique
//! constraints the store declares, so a wallet that saves cleanly in memory
//! saves cleanly to SQLite.

use crate::account::{
    Account, AccountBin, AccountError, AccountInfo, CHANGE_BIN, DEFAULT_BIN,
};
use crate::block::{BlockError, BlockHeader, MerkleBlock, UNKNOWN_HEIGHT};
use crate::crypto::LockCipher;
use crate::ids::{
    AccountBinId, AccountId, BlockHeaderId, IdAllocator, KeyId, KeychainId, MerkleBlockId,
    SigningScriptId, TxInId, TxOutId, TxRecordId,
};
use crate::keychain::{Keychain, KeychainError, Keychains};
use crate::signing_script::{ScriptStatus, SigningScript};
use crate::tx::{Tx, TxError, TxOutType, TxStatus};
use crate::views::{AccountBinView, ScriptFilter, SigningScriptView};
use bitcoin::{BlockHash, Txid};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Keychain {0:?} already exists")]
    DuplicateKeychain(String),
    #[error("Account {0:?} already exists")]
    DuplicateAccount(String),
    #[error("Account already has a bin named {0:?}")]
    DuplicateBin(String),
    #[error("Height {0} already has a different block")]
    DuplicateHeight(u32),
    #[error("Unknown keychain {0:?}")]
    UnknownKeychain(String),
    #[error("Unknown account {0:?}")]
    UnknownAccount(String),
    #[error("Unknown account id {0}")]
    UnknownAccountId(AccountId),
    #[error("Unknown bin {0}")]
    UnknownBin(u32),
    #[error("Unknown transaction {0}")]
    UnknownTx(TxRecordId),
    #[error("Unknown block header {0}")]
    UnknownBlockHeader(BlockHeaderId),
    #[error("Transaction has no unsigned hash; call set() first")]
    MissingUnsignedHash,
    #[error(transparent)]
    Keychain(#[from] KeychainError),
    #[error(transparent)]
    Account(#[from] AccountError),
    #[error(transparent)]
    Tx(#[from] TxError),
    #[error(transparent)]
    Block(#[from] BlockError),
}

#[derive(Debug, Clone, Default)]
struct Allocators {
    account: IdAllocator,
    bin: IdAllocator,
    script: IdAllocator,
    key: IdAllocator,
    tx: IdAllocator,
    txin: IdAllocator,
    txout: IdAllocator,
    header: IdAllocator,
    merkle_block: IdAllocator,
}

#[derive(Debug, Clone, Default)]
pub struct Wallet {
    keychains: Keychains,
    accounts: BTreeMap<AccountId, Account>,
    scripts: BTreeMap<SigningScriptId, SigningScript>,
    txs: BTreeMap<TxRecordId, Tx>,
    headers: BTreeMap<BlockHeaderId, BlockHeader>,
    merkle_blocks: BTreeMap<MerkleBlockId, MerkleBlock>,
    ids: Allocators,
}

impl Wallet {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- keychains ----

    pub fn keychains(&self) -> &Keychains {
        &self.keychains
    }

    pub fn keychains_mut(&mut self) -> &mut Keychains {
        &mut self.keychains
    }

    fn ensure_keychain_name_free(&self, name: &str) -> Result<(), WalletError> {
        match self.keychains.find(name) {
            Some(_) => Err(WalletError::DuplicateKeychain(name.to_string())),
            None => Ok(()),
        }
    }

    /// Create and register a root keychain from entropy.
    pub fn new_keychain(&mut self, name: &str, entropy: &[u8]) -> Result<KeychainId, WalletError> {
        self.ensure_keychain_name_free(name)?;
        let keychain = Keychain::new(name, entropy)?;
        Ok(self.keychains.insert(keychain))
    }

    pub fn import_keychain(&mut self, keychain: Keychain) -> Result<KeychainId, WalletError> {
        self.ensure_keychain_name_free(keychain.name())?;
        let name = keychain.name().to_string();
        let id = self.keychains.insert(keychain);
        info!("imported keychain {:?} as {}", name, id);
        Ok(id)
    }

    pub fn derive_keychain(
        &mut self,
        parent: KeychainId,
        index: u32,
        want_private: bool,
        name: &str,
    ) -> Result<KeychainId, WalletError> {
        self.ensure_keychain_name_free(name)?;
        Ok(self.keychains.derive(parent, index, want_private, name)?)
    }

    pub fn keychain_id(&self, name: &str) -> Result<KeychainId, WalletError> {
        self.keychains
            .id_of(name)
            .ok_or_else(|| WalletError::UnknownKeychain(name.to_string()))
    }

    /// Seal every keychain that still holds cleartext.
    pub fn set_lock_key(&mut self, cipher: &dyn LockCipher, lock_key: &[u8]) -> Result<(), WalletError> {
        for keychain in self.keychains.iter_mut() {
            if !keychain.is_chain_code_locked() {
                keychain.set_chain_code_lock_key(cipher, lock_key)?;
            }
            if keychain.is_private() && !keychain.is_private_key_locked()? {
                keychain.set_private_key_lock_key(cipher, lock_key)?;
            }
        }
        Ok(())
    }

    pub fn lock_keychains(&mut self) {
        for keychain in self.keychains.iter_mut() {
            keychain.lock_all();
        }
    }

    /// Unlock every keychain; fails on the first one the key doesn't open.
    pub fn unlock_keychains(&mut self, cipher: &dyn LockCipher, lock_key: &[u8]) -> Result<(), WalletError> {
        for keychain in self.keychains.iter_mut() {
            keychain.unlock_all(cipher, lock_key)?;
        }
        Ok(())
    }

    // ---- accounts and bins ----

    pub fn accounts(&self) -> impl Iterator<Item = &Account> {
        self.accounts.values()
    }

    pub fn account(&self, id: AccountId) -> Option<&Account> {
        self.accounts.get(&id)
    }

    pub fn account_id(&self, name: &str) -> Result<AccountId, WalletError> {
        self.accounts
            .iter()
            .find(|(_, account)| account.name() == name)
            .map(|(id, _)| *id)
            .ok_or_else(|| WalletError::UnknownAccount(name.to_string()))
    }

    fn account_ref(&self, id: AccountId) -> Result<&Account, WalletError> {
        self.accounts.get(&id).ok_or(WalletError::UnknownAccountId(id))
    }

    /// Create an account with the `@change` and `@default` bins and fill
    /// their lookahead pools.
    pub fn new_account(
        &mut self,
        name: &str,
        minsigs: u32,
        keychain_names: &[&str],
        unused_pool_size: u32,
        time_created: u64,
    ) -> Result<AccountId, WalletError> {
        if self.account_id(name).is_ok() {
            return Err(WalletError::DuplicateAccount(name.to_string()));
        }
        let keychains = keychain_names
            .iter()
            .map(|name| self.keychain_id(name))
            .collect::<Result<Vec<_>, _>>()?;

        let mut account = Account::new(name, minsigs, keychains, unused_pool_size, time_created)?;
        let mut ids = self.ids.clone();
        let id = AccountId(ids.account.next());
        account.set_id(id);
        account.add_reserved_bins();
        for bin in account.bins_mut() {
            bin.set_id(AccountBinId(ids.bin.next()));
        }

        let mut scripts = Vec::new();
        for bin_index in [CHANGE_BIN, DEFAULT_BIN] {
            scripts.extend(self.top_up(&mut account, bin_index)?);
        }

        info!("created account {:?} ({}-of-{})", name, minsigs, account.keychains().len());
        self.ids = ids;
        self.accounts.insert(id, account);
        self.commit_scripts(scripts);
        Ok(id)
    }

    pub fn add_account_bin(&mut self, account_id: AccountId, name: &str) -> Result<AccountBinId, WalletError> {
        let mut account = self.account_ref(account_id)?.clone();
        if account.bin_by_name(name).is_some() {
            return Err(WalletError::DuplicateBin(name.to_string()));
        }

        let bin_id = AccountBinId(self.ids.bin.next());
        let bin = account.add_bin(name)?;
        bin.set_id(bin_id);
        let bin_index = bin.index();

        let scripts = self.top_up(&mut account, bin_index)?;
        self.accounts.insert(account_id, account);
        self.commit_scripts(scripts);
        debug!("account {}: new bin {:?} at index {}", account_id, name, bin_index);
        Ok(bin_id)
    }

    pub fn account_info(&self, account_id: AccountId) -> Result<AccountInfo, WalletError> {
        Ok(self.account_ref(account_id)?.account_info(&self.keychains)?)
    }

    // ---- signing scripts ----

    pub fn scripts(&self) -> impl Iterator<Item = &SigningScript> {
        self.scripts.values()
    }

    pub fn script(&self, id: SigningScriptId) -> Option<&SigningScript> {
        self.scripts.get(&id)
    }

    fn unused_in_bin(&self, bin: AccountBinId) -> impl Iterator<Item = &SigningScript> {
        self.scripts
            .values()
            .filter(move |s| s.account_bin() == Some(bin) && s.status() == ScriptStatus::Unused)
    }

    /// Generate scripts until the bin has `unused_pool_size` unused ones.
    fn top_up(&self, account: &mut Account, bin_index: u32) -> Result<Vec<SigningScript>, WalletError> {
        let bin_id = account
            .bin(bin_index)
            .and_then(AccountBin::id)
            .ok_or(WalletError::UnknownBin(bin_index))?;
        let unused = self.unused_in_bin(bin_id).count();
        let target = account.unused_pool_size() as usize;

        let mut scripts = Vec::new();
        for _ in unused..target {
            scripts.push(account.new_signing_script(bin_index, &self.keychains, "")?);
        }
        Ok(scripts)
    }

    fn commit_scripts(&mut self, scripts: Vec<SigningScript>) -> Vec<SigningScriptId> {
        let mut ids = Vec::with_capacity(scripts.len());
        for mut script in scripts {
            let id = SigningScriptId(self.ids.script.next());
            script.set_id(id);
            for key in script.keys_mut() {
                key.set_id(KeyId(self.ids.key.next()));
            }
            self.scripts.insert(id, script);
            ids.push(id);
        }
        ids
    }

    /// Generate scripts until every bin of the account has its full pool.
    ///
    /// Returns how many scripts were added.
    pub fn refill_pool(&mut self, account_id: AccountId) -> Result<usize, WalletError> {
        let mut account = self.account_ref(account_id)?.clone();
        let bin_indices: Vec<u32> = account.bins().iter().map(AccountBin::index).collect();

        let mut scripts = Vec::new();
        for bin_index in bin_indices {
            scripts.extend(self.top_up(&mut account, bin_index)?);
        }

        let added = scripts.len();
        self.accounts.insert(account_id, account);
        self.commit_scripts(scripts);
        if added > 0 {
            debug!("account {}: refilled pool with {} scripts", account_id, added);
        }
        Ok(added)
    }

    /// Hand out the lowest unused script of a bin and refill its pool.
    ///
    /// The script is marked [`ScriptStatus::Change`] in the change bin and
    /// [`ScriptStatus::Pending`] elsewhere. A script is generated on the spot
    /// only when the pool is empty; a refill that fails afterwards (locked
    /// chain codes) is logged and the issued script is still returned.
    pub fn issue_script(
        &mut self,
        account_id: AccountId,
        bin_index: u32,
        label: &str,
    ) -> Result<SigningScriptId, WalletError> {
        let bin_id = self
            .account_ref(account_id)?
            .bin(bin_index)
            .and_then(AccountBin::id)
            .ok_or(WalletError::UnknownBin(bin_index))?;

        let existing = self
            .unused_in_bin(bin_id)
            .min_by_key(|s| s.index())
            .and_then(SigningScript::id);

        let issued = match existing {
            Some(id) => id,
            None => {
                let mut account = self.account_ref(account_id)?.clone();
                let script = account.new_signing_script(bin_index, &self.keychains, "")?;
                self.accounts.insert(account_id, account);
                self.commit_scripts(vec![script])
                    .first()
                    .copied()
                    .ok_or(WalletError::UnknownBin(bin_index))?
            }
        };

        if let Some(script) = self.scripts.get_mut(&issued) {
            script.set_label(label);
            script.set_status(if bin_index == CHANGE_BIN {
                ScriptStatus::Change
            } else {
                ScriptStatus::Pending
            });
            debug!("issued script {} (bin {}, index {})", issued, bin_index, script.index());
        }

        if let Err(e) = self.refill_bin(account_id, bin_index) {
            warn!("account {}: could not refill bin {}: {}", account_id, bin_index, e);
        }
        Ok(issued)
    }

    fn refill_bin(&mut self, account_id: AccountId, bin_index: u32) -> Result<usize, WalletError> {
        let mut account = self.account_ref(account_id)?.clone();
        let scripts = self.top_up(&mut account, bin_index)?;
        let added = scripts.len();
        self.accounts.insert(account_id, account);
        self.commit_scripts(scripts);
        Ok(added)
    }

    // ---- transactions ----

    pub fn txs(&self) -> impl Iterator<Item = &Tx> {
        self.txs.values()
    }

    pub fn tx(&self, id: TxRecordId) -> Option<&Tx> {
        self.txs.get(&id)
    }

    pub fn tx_by_unsigned_hash(&self, unsigned_hash: Txid) -> Option<&Tx> {
        self.txs.values().find(|tx| tx.unsigned_hash() == Some(unsigned_hash))
    }

    /// Store a transaction, or fold it into the stored one with the same
    /// unsigned hash.
    ///
    /// A known transaction picks up any inputs carrying more signatures and
    /// moves forward to the incoming status. A new one gets ids, has the
    /// outputs paying our scripts tagged, and is linked with the outputs it
    /// spends or that spend it.
    pub fn insert_tx(&mut self, mut tx: Tx) -> Result<TxRecordId, WalletError> {
        let unsigned_hash = tx.unsigned_hash().ok_or(WalletError::MissingUnsignedHash)?;

        if let Some(id) = self.tx_by_unsigned_hash(unsigned_hash).and_then(Tx::id) {
            let mut merged = self.txs.get(&id).ok_or(WalletError::UnknownTx(id))?.clone();
            let previous_hash = merged.hash();
            merged.merge_signatures(&tx)?;
            if tx.status() > merged.status() && merged.missing_sig_count() == 0 {
                merged.set_status(tx.status())?;
            } else if tx.status() < merged.status() {
                debug!("tx {}: keeping status {:?} over {:?}", id, merged.status(), tx.status());
            }
            // a final hash makes the outputs reachable by outpoint
            if merged.hash() != previous_hash {
                self.link_spends(&mut merged);
            }
            self.txs.insert(id, merged);
            return Ok(id);
        }

        let id = TxRecordId(self.ids.tx.next());
        tx.set_id(id);
        for txin in tx.txins_mut() {
            txin.set_id(TxInId(self.ids.txin.next()));
        }
        for txout in tx.txouts_mut() {
            txout.set_id(TxOutId(self.ids.txout.next()));
        }

        let touched = self.tag_outputs(&mut tx);
        self.link_spends(&mut tx);
        self.txs.insert(id, tx);
        debug!("inserted tx {} ({})", id, unsigned_hash);

        for account_id in touched {
            if let Err(e) = self.refill_pool(account_id) {
                warn!("account {}: could not refill pool: {}", account_id, e);
            }
        }
        Ok(id)
    }

    fn tag_outputs(&mut self, tx: &mut Tx) -> BTreeSet<AccountId> {
        let mut touched = BTreeSet::new();
        for txout in tx.txouts_mut() {
            let Some(script) = self
                .scripts
                .values_mut()
                .find(|s| s.txoutscript() == txout.script())
            else {
                continue;
            };

            let is_change = script.status() == ScriptStatus::Change
                || script.account().and_then(|a| self.accounts.get(&a)).is_some_and(|account| {
                    account
                        .bins()
                        .iter()
                        .any(|bin| bin.id() == script.account_bin() && bin.is_change())
                });

            txout.set_signing_script(script.id());
            txout.set_account(script.account());
            txout.set_kind(if is_change { TxOutType::Change } else { TxOutType::Credit });

            if matches!(script.status(), ScriptStatus::Unused | ScriptStatus::Pending) {
                script.set_status(ScriptStatus::Received);
                touched.extend(script.account());
            }
        }
        touched
    }

    fn link_spends(&mut self, tx: &mut Tx) {
        // stored outputs this transaction spends
        for txin in tx.txins() {
            let outpoint = txin.outpoint();
            let spent = self
                .txs
                .values_mut()
                .filter(|stored| stored.hash() == Some(outpoint.txid))
                .flat_map(|stored| stored.txouts_mut().iter_mut())
                .find(|txout| txout.txindex() == outpoint.vout);
            if let Some(txout) = spent {
                txout.set_spent(txin.id());
            }
        }

        // stored inputs that spend this transaction's outputs
        let Some(hash) = tx.hash() else {
            return;
        };
        for txout in tx.txouts_mut() {
            let spender = self
                .txs
                .values()
                .flat_map(|stored| stored.txins())
                .find(|txin| txin.outpoint().txid == hash && txin.outpoint().vout == txout.txindex())
                .and_then(|txin| txin.id());
            if spender.is_some() {
                txout.set_spent(spender);
            }
        }
    }

    /// Attach the transaction to a stored block and mark it confirmed.
    pub fn confirm_tx(
        &mut self,
        tx_id: TxRecordId,
        header: BlockHeaderId,
        index: u32,
    ) -> Result<(), WalletError> {
        if !self.headers.contains_key(&header) {
            return Err(WalletError::UnknownBlockHeader(header));
        }
        let tx = self.txs.get_mut(&tx_id).ok_or(WalletError::UnknownTx(tx_id))?;
        tx.set_status(TxStatus::Confirmed)?;
        tx.set_block(header, index);
        Ok(())
    }

    /// Reorg rollback: detach from its block and move back to `status`.
    pub fn unconfirm_tx(&mut self, tx_id: TxRecordId, status: TxStatus) -> Result<(), WalletError> {
        let tx = self.txs.get_mut(&tx_id).ok_or(WalletError::UnknownTx(tx_id))?;
        tx.set_status(status)?;
        tx.clear_block();
        Ok(())
    }

    // ---- blocks ----

    pub fn headers(&self) -> impl Iterator<Item = &BlockHeader> {
        self.headers.values()
    }

    pub fn header(&self, id: BlockHeaderId) -> Option<&BlockHeader> {
        self.headers.get(&id)
    }

    pub fn header_by_hash(&self, hash: BlockHash) -> Option<&BlockHeader> {
        self.headers.values().find(|h| h.hash() == hash)
    }

    pub fn merkle_blocks(&self) -> impl Iterator<Item = &MerkleBlock> {
        self.merkle_blocks.values()
    }

    /// Store a header. Inserting a known block again returns its id.
    pub fn insert_block_header(&mut self, mut header: BlockHeader) -> Result<BlockHeaderId, WalletError> {
        if let Some(id) = self.header_by_hash(header.hash()).and_then(BlockHeader::id) {
            return Ok(id);
        }
        let height = header.height();
        if height != UNKNOWN_HEIGHT && self.headers.values().any(|h| h.height() == height) {
            return Err(WalletError::DuplicateHeight(height));
        }

        let id = BlockHeaderId(self.ids.header.next());
        header.set_id(id);
        self.headers.insert(id, header);
        Ok(id)
    }

    pub fn insert_merkle_block(
        &mut self,
        header: BlockHeader,
        mut merkle_block: MerkleBlock,
    ) -> Result<MerkleBlockId, WalletError> {
        let header_id = self.insert_block_header(header)?;
        merkle_block.set_blockheader(header_id);
        let id = MerkleBlockId(self.ids.merkle_block.next());
        merkle_block.set_id(id);
        self.merkle_blocks.insert(id, merkle_block);
        Ok(id)
    }

    // ---- views ----

    pub fn account_bin_views(&self) -> Vec<AccountBinView> {
        self.accounts
            .values()
            .flat_map(|account| {
                account.bins().iter().filter_map(move |bin| {
                    Some(AccountBinView {
                        account_id: account.id()?,
                        account_name: account.name().to_string(),
                        bin_id: bin.id()?,
                        bin_name: bin.name().to_string(),
                    })
                })
            })
            .collect()
    }

    pub fn signing_script_views(&self, filter: &ScriptFilter) -> Vec<SigningScriptView> {
        self.scripts
            .values()
            .filter_map(|script| {
                let account = self.accounts.get(&script.account()?)?;
                let bin = account.bins().iter().find(|b| b.id() == script.account_bin())?;
                if !filter.matches(account.name(), bin.name(), script.status()) {
                    return None;
                }
                Some(SigningScriptView {
                    account_id: account.id()?,
                    account_name: account.name().to_string(),
                    account_bin_id: bin.id()?,
                    account_bin_name: bin.name().to_string(),
                    id: script.id()?,
                    label: script.label().to_string(),
                    status: script.status(),
                    txinscript: script.txinscript().clone(),
                    txoutscript: script.txoutscript().clone(),
                })
            })
            .collect()
    }

    pub fn script_count(&self, filter: &ScriptFilter) -> usize {
        self.signing_script_views(filter).len()
    }

    // ---- restore from storage ----

    pub(crate) fn restore_keychain(&mut self, keychain: Keychain) -> Result<KeychainId, WalletError> {
        Ok(self.keychains.restore(keychain)?)
    }

    pub(crate) fn restore_account(&mut self, account: Account) -> Result<(), WalletError> {
        let id = account.id().ok_or(WalletError::UnknownAccount(account.name().to_string()))?;
        self.ids.account.observe(id.0);
        for bin in account.bins() {
            if let Some(bin_id) = bin.id() {
                self.ids.bin.observe(bin_id.0);
            }
        }
        self.accounts.insert(id, account);
        Ok(())
    }

    pub(crate) fn restore_script(&mut self, script: SigningScript) {
        if let Some(id) = script.id() {
            self.ids.script.observe(id.0);
            for key in script.keys() {
                if let Some(key_id) = key.id() {
                    self.ids.key.observe(key_id.0);
                }
            }
            self.scripts.insert(id, script);
        }
    }

    pub(crate) fn restore_tx(&mut self, tx: Tx) {
        if let Some(id) = tx.id() {
            self.ids.tx.observe(id.0);
            for txin in tx.txins() {
                if let Some(txin_id) = txin.id() {
                    self.ids.txin.observe(txin_id.0);
                }
            }
            for txout in tx.txouts() {
                if let Some(txout_id) = txout.id() {
                    self.ids.txout.observe(txout_id.0);
                }
            }
            self.txs.insert(id, tx);
        }
    }

    pub(crate) fn restore_header(&mut self, header: BlockHeader) {
        if let Some(id) = header.id() {
            self.ids.header.observe(id.0);
            self.headers.insert(id, header);
        }
    }

    pub(crate) fn restore_merkle_block(&mut self, merkle_block: MerkleBlock) {
        if let Some(id) = merkle_block.id() {
            self.ids.merkle_block.observe(id.0);
            self.merkle_blocks.insert(id, merkle_block);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_cipher;
    use crate::flags::FlagSet;
    use crate::script::{InputScriptMode, MultisigScript};
    use crate::tx::{TxIn, TxOut, UNKNOWN_TIMESTAMP};
    use bitcoin::hashes::Hash;
    use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence};

    fn wallet_2_of_3(pool: u32) -> (Wallet, AccountId) {
        let mut wallet = Wallet::new();
        for (i, name) in ["alice", "bob", "carol"].iter().enumerate() {
            wallet.new_keychain(name, &[i as u8 + 1; 32]).unwrap();
        }
        let account = wallet
            .new_account("vault", 2, &["alice", "bob", "carol"], pool, 1_700_000_000)
            .unwrap();
        (wallet, account)
    }

    fn receiving_tx(script: &ScriptBuf, prev: u8) -> Tx {
        let mut tx = Tx::default();
        tx.set(
            2,
            vec![TxIn::new(
                OutPoint::new(Txid::from_byte_array([prev; 32]), 0),
                ScriptBuf::new(),
                Sequence::MAX,
            )],
            vec![TxOut::new(Amount::from_sat(100_000), script.clone())],
            0,
            UNKNOWN_TIMESTAMP,
            TxStatus::Received,
        );
        tx
    }

    fn first_multisig(wallet: &Wallet) -> MultisigScript {
        let keys = wallet.scripts().next().unwrap().keys().iter().map(|k| *k.pubkey()).collect();
        MultisigScript::new(2, keys).unwrap()
    }

    /// One-input spend carrying signatures from the keys at `signers`.
    fn signed_spend(multisig: &MultisigScript, signers: &[usize], status: TxStatus) -> Tx {
        let mut script = multisig.clone();
        for &i in signers {
            let pubkey = script.pubkeys()[i];
            script.add_signature(&pubkey, vec![0x30; 71]).unwrap();
        }
        let mut tx = Tx::default();
        tx.set(
            1,
            vec![TxIn::new(
                OutPoint::new(Txid::from_byte_array([7u8; 32]), 1),
                script.txinscript(InputScriptMode::Edit).unwrap(),
                Sequence::MAX,
            )],
            vec![TxOut::new(Amount::from_sat(1_000), ScriptBuf::new())],
            0,
            UNKNOWN_TIMESTAMP,
            status,
        );
        tx
    }

    #[test]
    fn test_new_account_fills_pools() {
        let (wallet, account_id) = wallet_2_of_3(5);
        let account = wallet.account(account_id).unwrap();
        assert_eq!(account.bins().len(), 2);
        assert_eq!(account.bin(CHANGE_BIN).unwrap().script_count(), 5);
        assert_eq!(account.bin(DEFAULT_BIN).unwrap().script_count(), 5);
        assert_eq!(wallet.scripts().count(), 10);
        assert_eq!(wallet.script_count(&ScriptFilter::default().bin("@default")), 5);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let (mut wallet, _) = wallet_2_of_3(1);
        assert!(matches!(
            wallet.new_keychain("alice", &[9u8; 32]),
            Err(WalletError::DuplicateKeychain(_))
        ));
        assert!(matches!(
            wallet.new_account("vault", 1, &["alice"], 1, 0),
            Err(WalletError::DuplicateAccount(_))
        ));
        assert!(matches!(
            wallet.new_account("other", 1, &["nobody"], 1, 0),
            Err(WalletError::UnknownKeychain(_))
        ));
    }

    #[test]
    fn test_issue_script_marks_and_refills() {
        let (mut wallet, account_id) = wallet_2_of_3(3);

        let issued = wallet.issue_script(account_id, DEFAULT_BIN, "invoice 1").unwrap();
        let script = wallet.script(issued).unwrap();
        assert_eq!(script.index(), 0);
        assert_eq!(script.status(), ScriptStatus::Pending);
        assert_eq!(script.label(), "invoice 1");

        let unused = ScriptFilter::default().bin("@default").status(ScriptStatus::Unused);
        assert_eq!(wallet.script_count(&unused), 3);
        assert_eq!(wallet.account(account_id).unwrap().bin(DEFAULT_BIN).unwrap().script_count(), 4);

        let change = wallet.issue_script(account_id, CHANGE_BIN, "").unwrap();
        assert_eq!(wallet.script(change).unwrap().status(), ScriptStatus::Change);
    }

    #[test]
    fn test_issue_with_empty_pool_generates() {
        let (mut wallet, account_id) = wallet_2_of_3(0);
        assert_eq!(wallet.scripts().count(), 0);
        let first = wallet.issue_script(account_id, DEFAULT_BIN, "").unwrap();
        let second = wallet.issue_script(account_id, DEFAULT_BIN, "").unwrap();
        assert_eq!(wallet.script(first).unwrap().index(), 0);
        assert_eq!(wallet.script(second).unwrap().index(), 1);
    }

    #[test]
    fn test_user_bins() {
        let (mut wallet, account_id) = wallet_2_of_3(2);
        wallet.add_account_bin(account_id, "savings").unwrap();
        assert!(matches!(
            wallet.add_account_bin(account_id, "savings"),
            Err(WalletError::DuplicateBin(_))
        ));
        assert!(matches!(
            wallet.add_account_bin(account_id, "@mine"),
            Err(WalletError::Account(AccountError::InvalidName(_)))
        ));

        let views = wallet.account_bin_views();
        let names: Vec<&str> = views.iter().map(|v| v.bin_name.as_str()).collect();
        assert_eq!(names, vec!["@change", "@default", "savings"]);
        assert_eq!(wallet.script_count(&ScriptFilter::default().bin("savings")), 2);
        assert_eq!(
            wallet.account_info(account_id).unwrap().bin_names,
            vec!["@change", "@default", "savings"]
        );
    }

    #[test]
    fn test_insert_tx_tags_outputs() {
        let (mut wallet, account_id) = wallet_2_of_3(2);
        let issued = wallet.issue_script(account_id, DEFAULT_BIN, "").unwrap();
        let txoutscript = wallet.script(issued).unwrap().txoutscript().clone();

        let tx_id = wallet.insert_tx(receiving_tx(&txoutscript, 1)).unwrap();
        let txout = &wallet.tx(tx_id).unwrap().txouts()[0];
        assert_eq!(txout.signing_script(), Some(issued));
        assert_eq!(txout.account(), Some(account_id));
        assert_eq!(txout.kind(), TxOutType::Credit);
        assert_eq!(wallet.script(issued).unwrap().status(), ScriptStatus::Received);

        let received = ScriptFilter::default().status(ScriptStatus::Received);
        assert_eq!(wallet.signing_script_views(&received).len(), 1);
    }

    #[test]
    fn test_payment_to_unused_change_script() {
        let (mut wallet, account_id) = wallet_2_of_3(2);
        let change_view = wallet
            .signing_script_views(&ScriptFilter::default().bin("@change"))
            .remove(0);

        let tx_id = wallet.insert_tx(receiving_tx(&change_view.txoutscript, 1)).unwrap();
        assert_eq!(wallet.tx(tx_id).unwrap().txouts()[0].kind(), TxOutType::Change);
        // pool topped back up
        let unused = ScriptFilter::default()
            .account("vault")
            .bin("@change")
            .status(ScriptStatus::Unused);
        assert_eq!(wallet.script_count(&unused), 2);
        assert_eq!(wallet.account(account_id).unwrap().bin(CHANGE_BIN).unwrap().script_count(), 3);
    }

    #[test]
    fn test_insert_tx_is_idempotent_and_merges() {
        let (mut wallet, _) = wallet_2_of_3(1);
        let multisig = first_multisig(&wallet);
        let spend = |signers: &[usize], status| signed_spend(&multisig, signers, status);

        let id = wallet.insert_tx(spend(&[0], TxStatus::Unsent)).unwrap();
        assert_eq!(wallet.tx(id).unwrap().status(), TxStatus::Unsigned);

        let again = wallet.insert_tx(spend(&[0, 2], TxStatus::Unsent)).unwrap();
        assert_eq!(again, id);
        assert_eq!(wallet.txs().count(), 1);
        let stored = wallet.tx(id).unwrap();
        assert_eq!(stored.status(), TxStatus::Unsent);
        assert!(stored.hash().is_some());

        // a less signed copy never regresses it
        wallet.insert_tx(spend(&[1], TxStatus::Unsent)).unwrap();
        assert_eq!(wallet.tx(id).unwrap().status(), TxStatus::Unsent);
        assert_eq!(wallet.tx(id).unwrap().missing_sig_count(), 0);
    }

    #[test]
    fn test_spends_linked_both_ways() {
        let (mut wallet, _) = wallet_2_of_3(1);
        let funding = receiving_tx(&ScriptBuf::new(), 1);
        let funding_hash = funding.hash().unwrap();

        let mut spending = Tx::default();
        spending.set(
            1,
            vec![TxIn::new(OutPoint::new(funding_hash, 0), ScriptBuf::new(), Sequence::MAX)],
            Vec::new(),
            0,
            UNKNOWN_TIMESTAMP,
            TxStatus::Received,
        );

        // spender first, funding second
        let spending_id = wallet.insert_tx(spending).unwrap();
        let funding_id = wallet.insert_tx(funding).unwrap();

        let txin_id = wallet.tx(spending_id).unwrap().txins()[0].id();
        assert_eq!(wallet.tx(funding_id).unwrap().txouts()[0].spent(), txin_id);
    }

    #[test]
    fn test_spend_linked_once_merge_completes_signing() {
        let (mut wallet, _) = wallet_2_of_3(1);
        let multisig = first_multisig(&wallet);
        let signed = signed_spend(&multisig, &[0, 2], TxStatus::Unsent);
        let final_hash = signed.hash().unwrap();

        let parent_id = wallet.insert_tx(signed_spend(&multisig, &[0], TxStatus::Unsent)).unwrap();
        assert!(wallet.tx(parent_id).unwrap().hash().is_none());

        let mut child = Tx::default();
        child.set(
            1,
            vec![TxIn::new(OutPoint::new(final_hash, 0), ScriptBuf::new(), Sequence::MAX)],
            Vec::new(),
            0,
            UNKNOWN_TIMESTAMP,
            TxStatus::Received,
        );
        let child_id = wallet.insert_tx(child).unwrap();
        assert_eq!(wallet.tx(parent_id).unwrap().txouts()[0].spent(), None);

        assert_eq!(wallet.insert_tx(signed).unwrap(), parent_id);
        let parent = wallet.tx(parent_id).unwrap();
        assert_eq!(parent.hash(), Some(final_hash));
        assert_eq!(
            parent.txouts()[0].spent(),
            wallet.tx(child_id).unwrap().txins()[0].id()
        );
    }

    #[test]
    fn test_confirm_and_reorg() {
        let (mut wallet, _) = wallet_2_of_3(1);
        let tx_id = wallet.insert_tx(receiving_tx(&ScriptBuf::new(), 3)).unwrap();

        let header = crate::block::BlockHeader::from_header(
            &bitcoin::block::Header {
                version: bitcoin::block::Version::ONE,
                prev_blockhash: BlockHash::all_zeros(),
                merkle_root: bitcoin::TxMerkleNode::all_zeros(),
                time: 0,
                bits: bitcoin::CompactTarget::from_consensus(0x1d00_ffff),
                nonce: 0,
            },
            100,
        );
        assert!(matches!(
            wallet.confirm_tx(tx_id, BlockHeaderId(99), 0),
            Err(WalletError::UnknownBlockHeader(_))
        ));

        let header_id = wallet.insert_block_header(header.clone()).unwrap();
        assert_eq!(wallet.insert_block_header(header).unwrap(), header_id);

        wallet.confirm_tx(tx_id, header_id, 1).unwrap();
        let tx = wallet.tx(tx_id).unwrap();
        assert_eq!(tx.status(), TxStatus::Confirmed);
        assert_eq!(tx.block().unwrap().header, header_id);

        wallet.unconfirm_tx(tx_id, TxStatus::Received).unwrap();
        let tx = wallet.tx(tx_id).unwrap();
        assert_eq!(tx.status(), TxStatus::Received);
        assert!(tx.block().is_none());
    }

    #[test]
    fn test_duplicate_height_rejected() {
        let mut wallet = Wallet::new();
        let make = |nonce| {
            crate::block::BlockHeader::from_header(
                &bitcoin::block::Header {
                    version: bitcoin::block::Version::ONE,
                    prev_blockhash: BlockHash::all_zeros(),
                    merkle_root: bitcoin::TxMerkleNode::all_zeros(),
                    time: 0,
                    bits: bitcoin::CompactTarget::from_consensus(0x1d00_ffff),
                    nonce,
                },
                7,
            )
        };
        wallet.insert_block_header(make(1)).unwrap();
        assert!(matches!(
            wallet.insert_block_header(make(2)),
            Err(WalletError::DuplicateHeight(7))
        ));
    }

    /// Rebuild `wallet` the way a store load does: locked keychains and
    /// bins without cached keychains.
    fn locked_copy(wallet: &Wallet, account_id: AccountId, keep_scripts: bool) -> Wallet {
        let mut reloaded = Wallet::new();
        for keychain in wallet.keychains().iter() {
            let mut keychain = keychain.clone();
            keychain.lock_all();
            reloaded.restore_keychain(keychain).unwrap();
        }
        let original = wallet.account(account_id).unwrap();
        let mut account = Account::from_parts(
            account_id,
            original.name().to_string(),
            original.minsigs(),
            original.keychains().clone(),
            original.unused_pool_size(),
            original.time_created(),
        );
        for b in original.bins() {
            account.restore_bin(AccountBin::from_parts(
                b.id().unwrap(),
                account_id,
                b.index(),
                b.name().to_string(),
                b.script_count(),
            ));
        }
        reloaded.restore_account(account).unwrap();
        if keep_scripts {
            for script in wallet.scripts() {
                reloaded.restore_script(script.clone());
            }
        }
        reloaded
    }

    #[test]
    fn test_locked_wallet_cannot_grow_pool() {
        let cipher = test_cipher();
        let (mut wallet, account_id) = wallet_2_of_3(1);
        wallet.set_lock_key(&cipher, b"pw").unwrap();
        let mut reloaded = locked_copy(&wallet, account_id, false);

        assert!(matches!(
            reloaded.issue_script(account_id, DEFAULT_BIN, ""),
            Err(WalletError::Account(AccountError::Keychain(KeychainError::ChainCodeLocked)))
        ));
        assert_eq!(reloaded.account(account_id).unwrap().bin(DEFAULT_BIN).unwrap().script_count(), 1);

        reloaded.unlock_keychains(&cipher, b"pw").unwrap();
        reloaded.issue_script(account_id, DEFAULT_BIN, "").unwrap();
        assert_eq!(
            reloaded.script_count(&ScriptFilter::default().status(FlagSet::all())),
            2
        );
    }

    #[test]
    fn test_locked_wallet_issues_from_pool() {
        let cipher = test_cipher();
        let (mut wallet, account_id) = wallet_2_of_3(2);
        wallet.set_lock_key(&cipher, b"pw").unwrap();
        let mut locked = locked_copy(&wallet, account_id, true);

        let first = locked.issue_script(account_id, DEFAULT_BIN, "one").unwrap();
        let script = locked.script(first).unwrap();
        assert_eq!(script.index(), 0);
        assert_eq!(script.status(), ScriptStatus::Pending);
        assert_eq!(script.label(), "one");

        let second = locked.issue_script(account_id, DEFAULT_BIN, "two").unwrap();
        assert_eq!(locked.script(second).unwrap().index(), 1);
        // the refills failed, nothing new was generated
        assert_eq!(locked.account(account_id).unwrap().bin(DEFAULT_BIN).unwrap().script_count(), 2);

        assert!(matches!(
            locked.issue_script(account_id, DEFAULT_BIN, "three"),
            Err(WalletError::Account(AccountError::Keychain(KeychainError::ChainCodeLocked)))
        ));

        locked.unlock_keychains(&cipher, b"pw").unwrap();
        locked.issue_script(account_id, DEFAULT_BIN, "three").unwrap();
        let unused = ScriptFilter::default().bin("@default").status(ScriptStatus::Unused);
        assert_eq!(locked.script_count(&unused), 2);
    }

    #[test]
    fn test_account_counts_distinct_keychains() {
        let (mut wallet, _) = wallet_2_of_3(1);
        let id = wallet.new_account("pair", 2, &["alice", "alice", "bob"], 1, 0).unwrap();
        assert_eq!(wallet.account(id).unwrap().keychains().len(), 2);
        assert_eq!(wallet.account_info(id).unwrap().keychain_names, vec!["alice", "bob"]);
    }
}
