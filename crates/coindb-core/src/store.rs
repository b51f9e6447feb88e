//! SQLite persistence layer.
//!
//! The store saves a full [`Wallet`] snapshot inside one SQLite transaction
//! and loads it back with every id intact. Keychain secrets are written only
//! as sealed blobs, so loaded keychains come back locked.
//!
//! The query views are also available as SQL so that listings do not need
//! the whole wallet in memory.

use crate::account::{Account, AccountBin};
use crate::block::{BlockHeader, MerkleBlock, UNKNOWN_HEIGHT};
use crate::crypto::{LockError, Sealed};
use crate::flags::Flag;
use crate::ids::{AccountBinId, AccountId, KeychainId};
use crate::key::Key;
use crate::keychain::{Keychain, KeychainRecord};
use crate::signing_script::{ScriptStatus, SigningScript};
use crate::tx::{BlockRef, Tx, TxIn, TxOut, TxOutType, TxStatus};
use crate::views::{AccountBinView, ScriptFilter, SigningScriptView};
use crate::wallet::{Wallet, WalletError};
use bitcoin::bip32::Fingerprint;
use bitcoin::hashes::{hash160, Hash};
use bitcoin::secp256k1::PublicKey;
use bitcoin::{Amount, BlockHash, OutPoint, ScriptBuf, Sequence, TxMerkleNode, Txid};
use log::{debug, info};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Schema version written by this build.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Database schema version {0} is newer than supported ({SCHEMA_VERSION})")]
    UnsupportedVersion(u32),
    #[error("Keychain {0:?} holds unsealed secrets; set a lock key before saving")]
    UnsealedKeychain(String),
    #[error("Cannot save an entity without an id: {0}")]
    Unregistered(&'static str),
    #[error(transparent)]
    Wallet(#[from] WalletError),
}

#[derive(Error, Debug)]
#[error("Unknown flag bit {0}")]
struct UnknownBit(u32);

/// Map a decoding failure of column `idx` into a rusqlite error.
fn decode<T, E>(idx: usize, result: Result<T, E>) -> rusqlite::Result<T>
where
    E: std::error::Error + Send + Sync + 'static,
{
    result.map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Blob, Box::new(e)))
}

fn flag<F: Flag>(idx: usize, bit: u32) -> rusqlite::Result<F> {
    decode(idx, F::from_bit(bit).ok_or(UnknownBit(bit)))
}

fn txid(row: &Row, idx: usize) -> rusqlite::Result<Txid> {
    decode(idx, Txid::from_slice(&row.get::<_, Vec<u8>>(idx)?))
}

fn opt_txid(row: &Row, idx: usize) -> rusqlite::Result<Option<Txid>> {
    row.get::<_, Option<Vec<u8>>>(idx)?
        .map(|bytes| decode(idx, Txid::from_slice(&bytes)))
        .transpose()
}

fn block_hash(row: &Row, idx: usize) -> rusqlite::Result<BlockHash> {
    decode(idx, BlockHash::from_slice(&row.get::<_, Vec<u8>>(idx)?))
}

fn pubkey(row: &Row, idx: usize) -> rusqlite::Result<PublicKey> {
    decode(idx, PublicKey::from_slice(&row.get::<_, Vec<u8>>(idx)?))
}

fn script(row: &Row, idx: usize) -> rusqlite::Result<ScriptBuf> {
    Ok(ScriptBuf::from_bytes(row.get(idx)?))
}

fn sealed(row: &Row, idx: usize) -> rusqlite::Result<Option<Sealed>> {
    row.get::<_, Option<Vec<u8>>>(idx)?
        .map(|bytes| decode::<_, LockError>(idx, Sealed::from_bytes(&bytes)))
        .transpose()
}

/// Derivation paths are stored as `/`-separated child numbers.
fn path_to_text(path: &[u32]) -> String {
    path.iter().map(u32::to_string).collect::<Vec<_>>().join("/")
}

fn path_from_text(idx: usize, text: &str) -> rusqlite::Result<Vec<u32>> {
    if text.is_empty() {
        return Ok(Vec::new());
    }
    text.split('/')
        .map(|part| decode(idx, part.parse::<u32>()))
        .collect()
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // WAL mode for better concurrent read performance
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let store = Self { conn };
        store.migrate()?;
        info!("opened store at {}", path.display());
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS version (
                version INTEGER NOT NULL
            );",
        )?;

        let stored: Option<u32> = self
            .conn
            .query_row("SELECT MAX(version) FROM version", [], |row| row.get(0))
            .optional()?
            .flatten();
        match stored {
            Some(version) if version > SCHEMA_VERSION => {
                return Err(StoreError::UnsupportedVersion(version));
            }
            Some(version) if version == SCHEMA_VERSION => return Ok(()),
            _ => {}
        }

        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS keychains (
                id                    INTEGER PRIMARY KEY,
                name                  TEXT NOT NULL UNIQUE,
                depth                 INTEGER NOT NULL,
                parent_fp             TEXT NOT NULL,
                child_num             INTEGER NOT NULL,
                pubkey                BLOB NOT NULL,
                chain_code_ciphertext BLOB,
                privkey_ciphertext    BLOB,
                is_private            INTEGER NOT NULL,
                parent_id             INTEGER REFERENCES keychains(id),
                derivation_path       TEXT NOT NULL,
                hash                  BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS accounts (
                id               INTEGER PRIMARY KEY,
                name             TEXT NOT NULL UNIQUE,
                minsigs          INTEGER NOT NULL,
                unused_pool_size INTEGER NOT NULL,
                time_created     INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS account_keychains (
                account_id  INTEGER NOT NULL REFERENCES accounts(id),
                keychain_id INTEGER NOT NULL REFERENCES keychains(id),
                PRIMARY KEY (account_id, keychain_id)
            );

            CREATE TABLE IF NOT EXISTS account_bins (
                id           INTEGER PRIMARY KEY,
                account_id   INTEGER NOT NULL REFERENCES accounts(id),
                bin_index    INTEGER NOT NULL,
                name         TEXT NOT NULL,
                script_count INTEGER NOT NULL,
                UNIQUE (account_id, bin_index),
                UNIQUE (account_id, name)
            );

            CREATE TABLE IF NOT EXISTS signing_scripts (
                id             INTEGER PRIMARY KEY,
                account_id     INTEGER NOT NULL REFERENCES accounts(id),
                account_bin_id INTEGER NOT NULL REFERENCES account_bins(id),
                script_index   INTEGER NOT NULL,
                label          TEXT NOT NULL,
                status         INTEGER NOT NULL,
                txinscript     BLOB NOT NULL,
                txoutscript    BLOB NOT NULL,
                UNIQUE (account_bin_id, script_index)
            );
            CREATE INDEX IF NOT EXISTS signing_scripts_txoutscript
                ON signing_scripts (txoutscript);

            CREATE TABLE IF NOT EXISTS keys (
                id                INTEGER PRIMARY KEY,
                signing_script_id INTEGER NOT NULL REFERENCES signing_scripts(id),
                position          INTEGER NOT NULL,
                root_keychain_id  INTEGER NOT NULL REFERENCES keychains(id),
                derivation_path   TEXT NOT NULL,
                key_index         INTEGER NOT NULL,
                pubkey            BLOB NOT NULL,
                is_private        INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS blockheaders (
                id         INTEGER PRIMARY KEY,
                hash       BLOB NOT NULL UNIQUE,
                height     INTEGER UNIQUE,
                version    INTEGER NOT NULL,
                prevhash   BLOB NOT NULL,
                merkleroot BLOB NOT NULL,
                timestamp  INTEGER NOT NULL,
                bits       INTEGER NOT NULL,
                nonce      INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS merkleblocks (
                id             INTEGER PRIMARY KEY,
                blockheader_id INTEGER NOT NULL REFERENCES blockheaders(id),
                txcount        INTEGER NOT NULL,
                hashes         BLOB NOT NULL,
                flags          BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS txs (
                id             INTEGER PRIMARY KEY,
                hash           BLOB,
                unsigned_hash  BLOB NOT NULL UNIQUE,
                version        INTEGER NOT NULL,
                locktime       INTEGER NOT NULL,
                timestamp      INTEGER NOT NULL,
                status         INTEGER NOT NULL,
                fee            INTEGER,
                blockheader_id INTEGER REFERENCES blockheaders(id),
                block_index    INTEGER
            );

            CREATE TABLE IF NOT EXISTS txins (
                id       INTEGER PRIMARY KEY,
                tx_id    INTEGER NOT NULL REFERENCES txs(id),
                txindex  INTEGER NOT NULL,
                outhash  BLOB NOT NULL,
                outindex INTEGER NOT NULL,
                script   BLOB NOT NULL,
                sequence INTEGER NOT NULL,
                UNIQUE (tx_id, txindex)
            );

            CREATE TABLE IF NOT EXISTS txouts (
                id                INTEGER PRIMARY KEY,
                tx_id             INTEGER NOT NULL REFERENCES txs(id),
                txindex           INTEGER NOT NULL,
                value             INTEGER NOT NULL,
                script            BLOB NOT NULL,
                spent_txin_id     INTEGER REFERENCES txins(id),
                signing_script_id INTEGER REFERENCES signing_scripts(id),
                account_id        INTEGER REFERENCES accounts(id),
                type              INTEGER NOT NULL,
                UNIQUE (tx_id, txindex)
            );
            ",
        )?;

        self.conn.execute("DELETE FROM version", [])?;
        self.conn
            .execute("INSERT INTO version (version) VALUES (?1)", params![SCHEMA_VERSION])?;
        debug!("schema migrated to version {}", SCHEMA_VERSION);
        Ok(())
    }

    pub fn schema_version(&self) -> Result<u32, StoreError> {
        Ok(self
            .conn
            .query_row("SELECT MAX(version) FROM version", [], |row| row.get(0))?)
    }

    // ============================================================================
    // Save
    // ============================================================================

    /// Replace the stored snapshot with `wallet`.
    ///
    /// Everything is written in one transaction; any failure leaves the
    /// previous snapshot untouched.
    pub fn save(&mut self, wallet: &Wallet) -> Result<(), StoreError> {
        if let Some(keychain) = wallet.keychains().iter().find(|k| !k.is_sealed()) {
            return Err(StoreError::UnsealedKeychain(keychain.name().to_string()));
        }

        let tx = self.conn.transaction()?;
        tx.execute_batch(
            "DELETE FROM txouts;
             DELETE FROM txins;
             DELETE FROM txs;
             DELETE FROM merkleblocks;
             DELETE FROM blockheaders;
             DELETE FROM keys;
             DELETE FROM signing_scripts;
             DELETE FROM account_bins;
             DELETE FROM account_keychains;
             DELETE FROM accounts;
             DELETE FROM keychains;",
        )?;

        for keychain in wallet.keychains().iter() {
            save_keychain(&tx, keychain)?;
        }
        for account in wallet.accounts() {
            save_account(&tx, account)?;
        }
        for script in wallet.scripts() {
            save_script(&tx, script)?;
        }
        for header in wallet.headers() {
            save_header(&tx, header)?;
        }
        for merkle_block in wallet.merkle_blocks() {
            save_merkle_block(&tx, merkle_block)?;
        }
        for record in wallet.txs() {
            save_tx(&tx, record)?;
        }

        tx.commit()?;
        info!(
            "saved {} keychains, {} accounts, {} scripts, {} transactions",
            wallet.keychains().len(),
            wallet.accounts().count(),
            wallet.scripts().count(),
            wallet.txs().count()
        );
        Ok(())
    }

    // ============================================================================
    // Load
    // ============================================================================

    /// Rebuild the stored wallet. Keychains come back locked.
    pub fn load(&self) -> Result<Wallet, StoreError> {
        let mut wallet = Wallet::new();

        for keychain in self.load_keychains()? {
            wallet.restore_keychain(keychain)?;
        }
        for account in self.load_accounts()? {
            wallet.restore_account(account)?;
        }
        for script in self.load_scripts()? {
            wallet.restore_script(script);
        }
        for header in self.load_headers()? {
            wallet.restore_header(header);
        }
        for merkle_block in self.load_merkle_blocks()? {
            wallet.restore_merkle_block(merkle_block);
        }
        for record in self.load_txs()? {
            wallet.restore_tx(record);
        }

        info!(
            "loaded {} keychains, {} accounts, {} scripts, {} transactions",
            wallet.keychains().len(),
            wallet.accounts().count(),
            wallet.scripts().count(),
            wallet.txs().count()
        );
        Ok(wallet)
    }

    fn load_keychains(&self) -> Result<Vec<Keychain>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, depth, parent_fp, child_num, pubkey, chain_code_ciphertext,
                    privkey_ciphertext, is_private, parent_id, derivation_path, hash
             FROM keychains ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            let parent_fp: String = row.get(3)?;
            let path: String = row.get(10)?;
            Ok(KeychainRecord {
                id: Some(KeychainId::from(row.get::<_, i64>(0)?)),
                name: row.get(1)?,
                depth: row.get(2)?,
                parent_fp: decode(3, Fingerprint::from_str(&parent_fp))?,
                child_num: row.get(4)?,
                pubkey: pubkey(row, 5)?,
                chain_code_ciphertext: sealed(row, 6)?,
                privkey_ciphertext: sealed(row, 7)?,
                private: row.get(8)?,
                parent: row.get::<_, Option<i64>>(9)?.map(KeychainId::from),
                derivation_path: path_from_text(10, &path)?,
                hash: decode(11, hash160::Hash::from_slice(&row.get::<_, Vec<u8>>(11)?))?,
            })
        })?;
        Ok(rows
            .map(|record| record.map(Keychain::from_record))
            .collect::<Result<_, _>>()?)
    }

    fn load_accounts(&self) -> Result<Vec<Account>, StoreError> {
        let mut members: BTreeMap<i64, BTreeSet<KeychainId>> = BTreeMap::new();
        let mut stmt = self
            .conn
            .prepare("SELECT account_id, keychain_id FROM account_keychains")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (account, keychain) = row?;
            members.entry(account).or_default().insert(KeychainId::from(keychain));
        }

        let mut stmt = self.conn.prepare(
            "SELECT id, name, minsigs, unused_pool_size, time_created FROM accounts ORDER BY id",
        )?;
        let mut accounts = stmt
            .query_map([], |row| {
                let id: i64 = row.get(0)?;
                Ok(Account::from_parts(
                    AccountId::from(id),
                    row.get(1)?,
                    row.get(2)?,
                    members.get(&id).cloned().unwrap_or_default(),
                    row.get(3)?,
                    row.get::<_, i64>(4)? as u64,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = self.conn.prepare(
            "SELECT id, account_id, bin_index, name, script_count FROM account_bins ORDER BY bin_index",
        )?;
        let bins = stmt.query_map([], |row| {
            Ok(AccountBin::from_parts(
                AccountBinId::from(row.get::<_, i64>(0)?),
                AccountId::from(row.get::<_, i64>(1)?),
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
            ))
        })?;
        for bin in bins {
            let bin = bin?;
            if let Some(account) = accounts.iter_mut().find(|a| a.id() == bin.account()) {
                account.restore_bin(bin);
            }
        }
        Ok(accounts)
    }

    fn load_scripts(&self) -> Result<Vec<SigningScript>, StoreError> {
        let mut keys: BTreeMap<i64, Vec<Key>> = BTreeMap::new();
        let mut stmt = self.conn.prepare(
            "SELECT signing_script_id, id, root_keychain_id, derivation_path, key_index, pubkey, is_private
             FROM keys ORDER BY signing_script_id, position",
        )?;
        let rows = stmt.query_map([], |row| {
            let path: String = row.get(3)?;
            let key = Key::from_parts(
                Some(row.get::<_, i64>(1)?.into()),
                KeychainId::from(row.get::<_, i64>(2)?),
                path_from_text(3, &path)?,
                row.get(4)?,
                pubkey(row, 5)?,
                row.get(6)?,
            );
            Ok((row.get::<_, i64>(0)?, key))
        })?;
        for row in rows {
            let (script, key) = row?;
            keys.entry(script).or_default().push(key);
        }

        let mut stmt = self.conn.prepare(
            "SELECT id, account_id, account_bin_id, script_index, label, status, txinscript, txoutscript
             FROM signing_scripts ORDER BY id",
        )?;
        let scripts = stmt
            .query_map([], |row| {
                let id: i64 = row.get(0)?;
                let mut signing_script = SigningScript::new(
                    Some(AccountId::from(row.get::<_, i64>(1)?)),
                    Some(AccountBinId::from(row.get::<_, i64>(2)?)),
                    row.get(3)?,
                    &row.get::<_, String>(4)?,
                    flag::<ScriptStatus>(5, row.get(5)?)?,
                    script(row, 6)?,
                    script(row, 7)?,
                    keys.remove(&id).unwrap_or_default(),
                );
                signing_script.set_id(id.into());
                Ok(signing_script)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(scripts)
    }

    fn load_headers(&self) -> Result<Vec<BlockHeader>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, hash, height, version, prevhash, merkleroot, timestamp, bits, nonce
             FROM blockheaders ORDER BY id",
        )?;
        let headers = stmt
            .query_map([], |row| {
                Ok(BlockHeader::from_parts(
                    row.get::<_, i64>(0)?.into(),
                    block_hash(row, 1)?,
                    row.get::<_, Option<u32>>(2)?.unwrap_or(UNKNOWN_HEIGHT),
                    row.get(3)?,
                    block_hash(row, 4)?,
                    decode(5, TxMerkleNode::from_slice(&row.get::<_, Vec<u8>>(5)?))?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(headers)
    }

    fn load_merkle_blocks(&self) -> Result<Vec<MerkleBlock>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, blockheader_id, txcount, hashes, flags FROM merkleblocks ORDER BY id",
        )?;
        let merkle_blocks = stmt
            .query_map([], |row| {
                let packed: Vec<u8> = row.get(3)?;
                let hashes = packed
                    .chunks(32)
                    .map(|chunk| decode(3, TxMerkleNode::from_slice(chunk)))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(MerkleBlock::from_parts(
                    row.get::<_, i64>(0)?.into(),
                    row.get::<_, i64>(1)?.into(),
                    row.get(2)?,
                    hashes,
                    row.get(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(merkle_blocks)
    }

    fn load_txs(&self) -> Result<Vec<Tx>, StoreError> {
        let mut txins: BTreeMap<i64, Vec<TxIn>> = BTreeMap::new();
        let mut stmt = self.conn.prepare(
            "SELECT tx_id, id, outhash, outindex, script, sequence FROM txins ORDER BY tx_id, txindex",
        )?;
        let rows = stmt.query_map([], |row| {
            let txin = TxIn::from_parts(
                row.get::<_, i64>(1)?.into(),
                OutPoint::new(txid(row, 2)?, row.get(3)?),
                script(row, 4)?,
                Sequence(row.get(5)?),
            );
            Ok((row.get::<_, i64>(0)?, txin))
        })?;
        for row in rows {
            let (tx_id, txin) = row?;
            txins.entry(tx_id).or_default().push(txin);
        }

        let mut txouts: BTreeMap<i64, Vec<TxOut>> = BTreeMap::new();
        let mut stmt = self.conn.prepare(
            "SELECT tx_id, id, value, script, spent_txin_id, signing_script_id, account_id, type
             FROM txouts ORDER BY tx_id, txindex",
        )?;
        let rows = stmt.query_map([], |row| {
            let txout = TxOut::from_parts(
                row.get::<_, i64>(1)?.into(),
                Amount::from_sat(row.get::<_, i64>(2)? as u64),
                script(row, 3)?,
                row.get::<_, Option<i64>>(4)?.map(Into::into),
                row.get::<_, Option<i64>>(5)?.map(Into::into),
                row.get::<_, Option<i64>>(6)?.map(Into::into),
                flag::<TxOutType>(7, row.get(7)?)?,
            );
            Ok((row.get::<_, i64>(0)?, txout))
        })?;
        for row in rows {
            let (tx_id, txout) = row?;
            txouts.entry(tx_id).or_default().push(txout);
        }

        let mut stmt = self.conn.prepare(
            "SELECT id, hash, unsigned_hash, version, locktime, timestamp, status, fee,
                    blockheader_id, block_index
             FROM txs ORDER BY id",
        )?;
        let txs = stmt
            .query_map([], |row| {
                let id: i64 = row.get(0)?;
                let block = match (row.get::<_, Option<i64>>(8)?, row.get::<_, Option<u32>>(9)?) {
                    (Some(header), Some(index)) => Some(BlockRef {
                        header: header.into(),
                        index,
                    }),
                    _ => None,
                };
                Ok(Tx::from_parts(
                    id.into(),
                    opt_txid(row, 1)?,
                    Some(txid(row, 2)?),
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    flag::<TxStatus>(6, row.get(6)?)?,
                    row.get::<_, Option<i64>>(7)?.map(|fee| Amount::from_sat(fee as u64)),
                    block,
                    txins.remove(&id).unwrap_or_default(),
                    txouts.remove(&id).unwrap_or_default(),
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(txs)
    }

    // ============================================================================
    // Views
    // ============================================================================

    pub fn account_bin_views(&self) -> Result<Vec<AccountBinView>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT a.id, a.name, b.id, b.name
             FROM account_bins b JOIN accounts a ON a.id = b.account_id
             ORDER BY a.id, b.bin_index",
        )?;
        let views = stmt
            .query_map([], |row| {
                Ok(AccountBinView {
                    account_id: row.get::<_, i64>(0)?.into(),
                    account_name: row.get(1)?,
                    bin_id: row.get::<_, i64>(2)?.into(),
                    bin_name: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(views)
    }

    pub fn signing_script_views(&self, filter: &ScriptFilter) -> Result<Vec<SigningScriptView>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT a.id, a.name, b.id, b.name, s.id, s.label, s.status, s.txinscript, s.txoutscript
             FROM signing_scripts s
             JOIN account_bins b ON b.id = s.account_bin_id
             JOIN accounts a ON a.id = s.account_id
             WHERE (?1 IS NULL OR a.name = ?1)
               AND (?2 IS NULL OR b.name = ?2)
               AND (s.status & ?3) != 0
             ORDER BY s.id",
        )?;
        let views = stmt
            .query_map(
                params![filter.account, filter.bin, filter.status.bits()],
                |row| {
                    Ok(SigningScriptView {
                        account_id: row.get::<_, i64>(0)?.into(),
                        account_name: row.get(1)?,
                        account_bin_id: row.get::<_, i64>(2)?.into(),
                        account_bin_name: row.get(3)?,
                        id: row.get::<_, i64>(4)?.into(),
                        label: row.get(5)?,
                        status: flag(6, row.get(6)?)?,
                        txinscript: script(row, 7)?,
                        txoutscript: script(row, 8)?,
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(views)
    }

    pub fn script_count(&self, filter: &ScriptFilter) -> Result<usize, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*)
             FROM signing_scripts s
             JOIN account_bins b ON b.id = s.account_bin_id
             JOIN accounts a ON a.id = s.account_id
             WHERE (?1 IS NULL OR a.name = ?1)
               AND (?2 IS NULL OR b.name = ?2)
               AND (s.status & ?3) != 0",
            params![filter.account, filter.bin, filter.status.bits()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

// ============================================================================
// Row writers
// ============================================================================

fn save_keychain(conn: &Connection, keychain: &Keychain) -> Result<(), StoreError> {
    let record = keychain.to_record();
    let id = record.id.ok_or(StoreError::Unregistered("keychain"))?;
    conn.execute(
        "INSERT INTO keychains (id, name, depth, parent_fp, child_num, pubkey, chain_code_ciphertext,
                               privkey_ciphertext, is_private, parent_id, derivation_path, hash)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            i64::from(id),
            record.name,
            record.depth,
            record.parent_fp.to_string(),
            record.child_num,
            record.pubkey.serialize().as_slice(),
            record.chain_code_ciphertext.as_ref().map(Sealed::to_bytes),
            record.privkey_ciphertext.as_ref().map(Sealed::to_bytes),
            record.private,
            record.parent.map(i64::from),
            path_to_text(&record.derivation_path),
            record.hash.to_byte_array().as_slice(),
        ],
    )?;
    Ok(())
}

fn save_account(conn: &Connection, account: &Account) -> Result<(), StoreError> {
    let id = i64::from(account.id().ok_or(StoreError::Unregistered("account"))?);
    conn.execute(
        "INSERT INTO accounts (id, name, minsigs, unused_pool_size, time_created)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            id,
            account.name(),
            account.minsigs(),
            account.unused_pool_size(),
            account.time_created() as i64
        ],
    )?;
    for keychain in account.keychains() {
        conn.execute(
            "INSERT INTO account_keychains (account_id, keychain_id) VALUES (?1, ?2)",
            params![id, i64::from(*keychain)],
        )?;
    }
    for bin in account.bins() {
        let bin_id = bin.id().ok_or(StoreError::Unregistered("account bin"))?;
        conn.execute(
            "INSERT INTO account_bins (id, account_id, bin_index, name, script_count)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![i64::from(bin_id), id, bin.index(), bin.name(), bin.script_count()],
        )?;
    }
    Ok(())
}

fn save_script(conn: &Connection, script: &SigningScript) -> Result<(), StoreError> {
    let id = i64::from(script.id().ok_or(StoreError::Unregistered("signing script"))?);
    let account = script.account().ok_or(StoreError::Unregistered("account"))?;
    let bin = script.account_bin().ok_or(StoreError::Unregistered("account bin"))?;
    conn.execute(
        "INSERT INTO signing_scripts (id, account_id, account_bin_id, script_index, label, status,
                                      txinscript, txoutscript)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            id,
            i64::from(account),
            i64::from(bin),
            script.index(),
            script.label(),
            script.status().bit(),
            script.txinscript().as_bytes(),
            script.txoutscript().as_bytes(),
        ],
    )?;
    for (position, key) in script.keys().iter().enumerate() {
        let key_id = key.id().ok_or(StoreError::Unregistered("key"))?;
        conn.execute(
            "INSERT INTO keys (id, signing_script_id, position, root_keychain_id, derivation_path,
                               key_index, pubkey, is_private)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                i64::from(key_id),
                id,
                position as i64,
                i64::from(key.root_keychain()),
                path_to_text(key.derivation_path()),
                key.index(),
                key.pubkey().serialize().as_slice(),
                key.is_private(),
            ],
        )?;
    }
    Ok(())
}

fn save_header(conn: &Connection, header: &BlockHeader) -> Result<(), StoreError> {
    let id = header.id().ok_or(StoreError::Unregistered("block header"))?;
    let height = (header.height() != UNKNOWN_HEIGHT).then_some(header.height());
    conn.execute(
        "INSERT INTO blockheaders (id, hash, height, version, prevhash, merkleroot, timestamp, bits, nonce)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            i64::from(id),
            header.hash().to_byte_array().as_slice(),
            height,
            header.version(),
            header.prevhash().to_byte_array().as_slice(),
            header.merkleroot().to_byte_array().as_slice(),
            header.timestamp(),
            header.bits(),
            header.nonce(),
        ],
    )?;
    Ok(())
}

fn save_merkle_block(conn: &Connection, merkle_block: &MerkleBlock) -> Result<(), StoreError> {
    let id = merkle_block.id().ok_or(StoreError::Unregistered("merkle block"))?;
    let header = merkle_block
        .blockheader()
        .ok_or(StoreError::Unregistered("block header"))?;
    let hashes: Vec<u8> = merkle_block
        .hashes()
        .iter()
        .flat_map(|hash| hash.to_byte_array())
        .collect();
    conn.execute(
        "INSERT INTO merkleblocks (id, blockheader_id, txcount, hashes, flags)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            i64::from(id),
            i64::from(header),
            merkle_block.txcount(),
            hashes,
            merkle_block.flags(),
        ],
    )?;
    Ok(())
}

fn save_tx(conn: &Connection, record: &Tx) -> Result<(), StoreError> {
    let id = i64::from(record.id().ok_or(StoreError::Unregistered("transaction"))?);
    let unsigned_hash = record
        .unsigned_hash()
        .ok_or(StoreError::Wallet(WalletError::MissingUnsignedHash))?;
    conn.execute(
        "INSERT INTO txs (id, hash, unsigned_hash, version, locktime, timestamp, status, fee,
                          blockheader_id, block_index)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            id,
            record.hash().map(|hash| hash.to_byte_array().to_vec()),
            unsigned_hash.to_byte_array().as_slice(),
            record.version(),
            record.locktime(),
            record.timestamp(),
            record.status().bit(),
            record.fee().map(|fee| fee.to_sat() as i64),
            record.block().map(|block| i64::from(block.header)),
            record.block().map(|block| block.index),
        ],
    )?;

    for txin in record.txins() {
        let txin_id = txin.id().ok_or(StoreError::Unregistered("transaction input"))?;
        let outpoint = txin.outpoint();
        conn.execute(
            "INSERT INTO txins (id, tx_id, txindex, outhash, outindex, script, sequence)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                i64::from(txin_id),
                id,
                txin.txindex(),
                outpoint.txid.to_byte_array().as_slice(),
                outpoint.vout,
                txin.script().as_bytes(),
                txin.sequence().0,
            ],
        )?;
    }

    for txout in record.txouts() {
        let txout_id = txout.id().ok_or(StoreError::Unregistered("transaction output"))?;
        conn.execute(
            "INSERT INTO txouts (id, tx_id, txindex, value, script, spent_txin_id, signing_script_id,
                                 account_id, type)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                i64::from(txout_id),
                id,
                txout.txindex(),
                txout.value().to_sat() as i64,
                txout.script().as_bytes(),
                txout.spent().map(i64::from),
                txout.signing_script().map(i64::from),
                txout.account().map(i64::from),
                txout.kind().bit(),
            ],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::DEFAULT_BIN;
    use crate::crypto::test_cipher;
    use crate::tx::UNKNOWN_TIMESTAMP;
    use tempfile::TempDir;

    fn sealed_wallet() -> Wallet {
        let cipher = test_cipher();
        let mut wallet = Wallet::new();
        wallet.new_keychain("alice", &[1u8; 32]).unwrap();
        wallet.new_keychain("bob", &[2u8; 32]).unwrap();
        let account = wallet
            .new_account("joint", 2, &["alice", "bob"], 3, 1_700_000_000)
            .unwrap();
        wallet.add_account_bin(account, "savings").unwrap();
        let issued = wallet.issue_script(account, DEFAULT_BIN, "rent").unwrap();
        let txoutscript = wallet.script(issued).unwrap().txoutscript().clone();

        let mut tx = Tx::default();
        tx.set(
            2,
            vec![TxIn::new(
                OutPoint::new(Txid::from_byte_array([5u8; 32]), 1),
                ScriptBuf::new(),
                Sequence::MAX,
            )],
            vec![TxOut::new(Amount::from_sat(50_000), txoutscript)],
            0,
            UNKNOWN_TIMESTAMP,
            TxStatus::Received,
        );
        wallet.insert_tx(tx).unwrap();

        wallet.set_lock_key(&cipher, b"hunter2").unwrap();
        wallet
    }

    #[test]
    fn test_fresh_store_has_current_version() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.schema_version().unwrap(), SCHEMA_VERSION);
        assert_eq!(SCHEMA_VERSION, 1);
        assert!(store.load().unwrap().keychains().is_empty());
    }

    #[test]
    fn test_unsealed_keychain_refused() {
        let mut wallet = Wallet::new();
        wallet.new_keychain("plain", &[3u8; 32]).unwrap();
        let mut store = Store::open_in_memory().unwrap();
        assert!(matches!(
            store.save(&wallet),
            Err(StoreError::UnsealedKeychain(name)) if name == "plain"
        ));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let wallet = sealed_wallet();
        let mut store = Store::open_in_memory().unwrap();
        store.save(&wallet).unwrap();
        let loaded = store.load().unwrap();

        assert_eq!(loaded.keychains().len(), 2);
        for keychain in loaded.keychains().iter() {
            assert!(keychain.is_chain_code_locked());
            assert!(keychain.is_private_key_locked().unwrap());
            let original = wallet.keychains().get(keychain.id().unwrap()).unwrap();
            assert_eq!(keychain.hash(), original.hash());
            assert_eq!(keychain.pubkey(), original.pubkey());
        }

        let scripts: Vec<_> = wallet.scripts().cloned().collect();
        let loaded_scripts: Vec<_> = loaded.scripts().cloned().collect();
        assert_eq!(scripts, loaded_scripts);

        let original: Vec<_> = wallet.txs().cloned().collect();
        let restored: Vec<_> = loaded.txs().cloned().collect();
        assert_eq!(original, restored);

        let filter = ScriptFilter::default();
        assert_eq!(loaded.signing_script_views(&filter), wallet.signing_script_views(&filter));
        assert_eq!(loaded.account_bin_views(), wallet.account_bin_views());
    }

    #[test]
    fn test_sql_views_match_memory() {
        let wallet = sealed_wallet();
        let mut store = Store::open_in_memory().unwrap();
        store.save(&wallet).unwrap();

        assert_eq!(store.account_bin_views().unwrap(), wallet.account_bin_views());
        let filters = [
            ScriptFilter::default(),
            ScriptFilter::default().bin("savings"),
            ScriptFilter::default().account("joint").status(ScriptStatus::Received),
            ScriptFilter::default().account("nobody"),
        ];
        for filter in &filters {
            assert_eq!(
                store.signing_script_views(filter).unwrap(),
                wallet.signing_script_views(filter)
            );
            assert_eq!(store.script_count(filter).unwrap(), wallet.script_count(filter));
        }
    }

    #[test]
    fn test_loaded_wallet_unlocks_and_grows() {
        let cipher = test_cipher();
        let wallet = sealed_wallet();
        let mut store = Store::open_in_memory().unwrap();
        store.save(&wallet).unwrap();

        let mut loaded = store.load().unwrap();
        let account = loaded.account_id("joint").unwrap();
        assert!(loaded.unlock_keychains(&cipher, b"wrong").is_err());
        loaded.unlock_keychains(&cipher, b"hunter2").unwrap();

        let before = loaded.scripts().count();
        let last_id = loaded.scripts().filter_map(SigningScript::id).max();
        loaded.issue_script(account, DEFAULT_BIN, "").unwrap();
        assert_eq!(loaded.scripts().count(), before + 1);
        // ids keep counting past the restored ones
        assert!(loaded.scripts().filter_map(SigningScript::id).max() > last_id);
    }

    #[test]
    fn test_file_store_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("coindb.sqlite");
        let wallet = sealed_wallet();

        {
            let mut store = Store::open(&path).unwrap();
            store.save(&wallet).unwrap();
        }

        let store = Store::open(&path).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.accounts().count(), 1);
        assert_eq!(
            loaded.account_info(loaded.account_id("joint").unwrap()).unwrap(),
            wallet.account_info(wallet.account_id("joint").unwrap()).unwrap()
        );
    }

    #[test]
    fn test_newer_schema_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("future.sqlite");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("CREATE TABLE version (version INTEGER NOT NULL); INSERT INTO version VALUES (99);")
                .unwrap();
        }
        assert!(matches!(
            Store::open(&path),
            Err(StoreError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn test_block_records_roundtrip() {
        let mut wallet = Wallet::new();
        let header = bitcoin::block::Header {
            version: bitcoin::block::Version::TWO,
            prev_blockhash: BlockHash::from_byte_array([1u8; 32]),
            merkle_root: TxMerkleNode::from_byte_array([2u8; 32]),
            time: 1_700_000_000,
            bits: bitcoin::CompactTarget::from_consensus(0x1d00_ffff),
            nonce: 9,
        };
        let unknown = BlockHeader::from_header(&header, UNKNOWN_HEIGHT);
        let tree = MerkleBlock::new(3, vec![TxMerkleNode::from_byte_array([4u8; 32])], vec![0b101]);
        wallet.insert_merkle_block(unknown, tree).unwrap();

        let mut store = Store::open_in_memory().unwrap();
        store.save(&wallet).unwrap();
        let loaded = store.load().unwrap();

        let header_record = loaded.headers().next().unwrap();
        assert_eq!(header_record.height(), UNKNOWN_HEIGHT);
        assert_eq!(header_record.to_header(), header);
        let merkle_block = loaded.merkle_blocks().next().unwrap();
        assert_eq!(merkle_block.blockheader(), header_record.id());
        assert_eq!(merkle_block.hashes(), &[TxMerkleNode::from_byte_array([4u8; 32])]);
        assert_eq!(merkle_block.flags(), &[0b101]);
    }
}
