//! Transactions and their signing state
//!
//! A [`Tx`] owns its inputs and outputs. It carries two hashes:
//!
//! - `unsigned_hash`: txid of the transaction with every input script
//!   cleared. It does not change while signatures are added, so it is the
//!   identity used to recognise a transaction across its signing process.
//! - `hash`: the real txid. It stays empty while the status is
//!   [`TxStatus::Unsigned`].
//!
//! Statuses move forward in table order. The only way back is out of
//! [`TxStatus::Confirmed`] when a block is reorganised away.

use crate::flags::Flag;
use crate::ids::{AccountId, BlockHeaderId, SigningScriptId, TxInId, TxOutId, TxRecordId};
use crate::script::{self, ScriptError};
use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode::{self, deserialize, serialize};
use bitcoin::secp256k1::PublicKey;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, Txid, Witness};
use log::{debug, warn};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

/// Timestamp of a transaction whose time is not known yet.
pub const UNKNOWN_TIMESTAMP: u32 = u32::MAX;

#[derive(Error, Debug)]
pub enum TxError {
    #[error("Invalid transaction encoding: {0}")]
    Decode(#[from] encode::Error),
    #[error("Cannot move transaction from {from:?} to {to:?}")]
    InvalidTransition { from: TxStatus, to: TxStatus },
    #[error("{0} signatures still missing")]
    MissingSignatures(usize),
    #[error("Transactions have different unsigned hashes")]
    UnsignedHashMismatch,
    #[error(transparent)]
    Script(#[from] ScriptError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxStatus {
    /// Still missing signatures
    Unsigned,
    /// Signed but not yet broadcast
    Unsent,
    /// Sent to at least one peer
    Sent,
    /// Received from at least one peer
    Received,
    /// Unconfirmed and spends an output another transaction spends
    Conflicted,
    /// Will never be broadcast or never confirm
    Canceled,
    /// In the best chain
    Confirmed,
}

impl Flag for TxStatus {
    const TABLE: &'static [(Self, u32, &'static str)] = &[
        (TxStatus::Unsigned, 1, "UNSIGNED"),
        (TxStatus::Unsent, 1 << 1, "UNSENT"),
        (TxStatus::Sent, 1 << 2, "SENT"),
        (TxStatus::Received, 1 << 3, "RECEIVED"),
        (TxStatus::Conflicted, 1 << 4, "CONFLICTED"),
        (TxStatus::Canceled, 1 << 5, "CANCELED"),
        (TxStatus::Confirmed, 1 << 6, "CONFIRMED"),
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxOutType {
    None,
    Change,
    Debit,
    Credit,
}

impl Flag for TxOutType {
    const TABLE: &'static [(Self, u32, &'static str)] = &[
        (TxOutType::None, 1, "NONE"),
        (TxOutType::Change, 2, "CHANGE"),
        (TxOutType::Debit, 4, "DEBIT"),
        (TxOutType::Credit, 8, "CREDIT"),
    ];
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIn {
    id: Option<TxInId>,
    outpoint: OutPoint,
    script: ScriptBuf,
    sequence: Sequence,
    tx: Option<TxRecordId>,
    txindex: u32,
}

impl TxIn {
    pub fn new(outpoint: OutPoint, script: ScriptBuf, sequence: Sequence) -> Self {
        Self {
            id: None,
            outpoint,
            script,
            sequence,
            tx: None,
            txindex: 0,
        }
    }

    pub fn from_raw(raw: &[u8]) -> Result<Self, TxError> {
        let txin: bitcoin::TxIn = deserialize(raw)?;
        Ok(Self::from(&txin))
    }

    pub fn raw(&self) -> Vec<u8> {
        serialize(&self.to_txin())
    }

    pub fn to_txin(&self) -> bitcoin::TxIn {
        bitcoin::TxIn {
            previous_output: self.outpoint,
            script_sig: self.script.clone(),
            sequence: self.sequence,
            witness: Witness::default(),
        }
    }

    pub(crate) fn set_id(&mut self, id: TxInId) {
        self.id = Some(id);
    }

    pub(crate) fn set_position(&mut self, tx: Option<TxRecordId>, txindex: u32) {
        self.tx = tx;
        self.txindex = txindex;
    }

    pub fn id(&self) -> Option<TxInId> {
        self.id
    }

    pub fn outpoint(&self) -> OutPoint {
        self.outpoint
    }

    pub fn script(&self) -> &ScriptBuf {
        &self.script
    }

    pub fn set_script(&mut self, script: ScriptBuf) {
        self.script = script;
    }

    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    pub fn tx(&self) -> Option<TxRecordId> {
        self.tx
    }

    pub fn txindex(&self) -> u32 {
        self.txindex
    }
}

impl From<&bitcoin::TxIn> for TxIn {
    fn from(txin: &bitcoin::TxIn) -> Self {
        Self::new(txin.previous_output, txin.script_sig.clone(), txin.sequence)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    id: Option<TxOutId>,
    value: Amount,
    script: ScriptBuf,
    tx: Option<TxRecordId>,
    txindex: u32,
    spent: Option<TxInId>,
    signing_script: Option<SigningScriptId>,
    account: Option<AccountId>,
    kind: TxOutType,
}

impl TxOut {
    pub fn new(value: Amount, script: ScriptBuf) -> Self {
        Self {
            id: None,
            value,
            script,
            tx: None,
            txindex: 0,
            spent: None,
            signing_script: None,
            account: None,
            kind: TxOutType::None,
        }
    }

    pub fn from_raw(raw: &[u8]) -> Result<Self, TxError> {
        let txout: bitcoin::TxOut = deserialize(raw)?;
        Ok(Self::from(&txout))
    }

    pub fn raw(&self) -> Vec<u8> {
        serialize(&self.to_txout())
    }

    pub fn to_txout(&self) -> bitcoin::TxOut {
        bitcoin::TxOut {
            value: self.value,
            script_pubkey: self.script.clone(),
        }
    }

    pub(crate) fn set_id(&mut self, id: TxOutId) {
        self.id = Some(id);
    }

    pub(crate) fn set_position(&mut self, tx: Option<TxRecordId>, txindex: u32) {
        self.tx = tx;
        self.txindex = txindex;
    }

    pub fn id(&self) -> Option<TxOutId> {
        self.id
    }

    pub fn value(&self) -> Amount {
        self.value
    }

    pub fn script(&self) -> &ScriptBuf {
        &self.script
    }

    pub fn tx(&self) -> Option<TxRecordId> {
        self.tx
    }

    pub fn txindex(&self) -> u32 {
        self.txindex
    }

    /// Input that spends this output, once known.
    pub fn spent(&self) -> Option<TxInId> {
        self.spent
    }

    pub fn set_spent(&mut self, txin: Option<TxInId>) {
        self.spent = txin;
    }

    pub fn signing_script(&self) -> Option<SigningScriptId> {
        self.signing_script
    }

    pub fn set_signing_script(&mut self, script: Option<SigningScriptId>) {
        self.signing_script = script;
    }

    pub fn account(&self) -> Option<AccountId> {
        self.account
    }

    pub fn set_account(&mut self, account: Option<AccountId>) {
        self.account = account;
    }

    pub fn kind(&self) -> TxOutType {
        self.kind
    }

    pub fn set_kind(&mut self, kind: TxOutType) {
        self.kind = kind;
    }
}

impl From<&bitcoin::TxOut> for TxOut {
    fn from(txout: &bitcoin::TxOut) -> Self {
        Self::new(txout.value, txout.script_pubkey.clone())
    }
}

/// Block a transaction was confirmed in, and its position there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    pub header: BlockHeaderId,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tx {
    id: Option<TxRecordId>,
    hash: Option<Txid>,
    unsigned_hash: Option<Txid>,
    version: i32,
    locktime: u32,
    timestamp: u32,
    status: TxStatus,
    fee: Option<Amount>,
    block: Option<BlockRef>,
    txins: Vec<TxIn>,
    txouts: Vec<TxOut>,
}

impl Default for Tx {
    fn default() -> Self {
        Self::new(1, 0, UNKNOWN_TIMESTAMP, TxStatus::Received)
    }
}

impl Tx {
    /// An empty transaction. Call one of the `set` methods to fill it.
    pub fn new(version: i32, locktime: u32, timestamp: u32, status: TxStatus) -> Self {
        Self {
            id: None,
            hash: None,
            unsigned_hash: None,
            version,
            locktime,
            timestamp,
            status,
            fee: None,
            block: None,
            txins: Vec::new(),
            txouts: Vec::new(),
        }
    }

    /// Replace the contents, then recompute status and both hashes.
    pub fn set(
        &mut self,
        version: i32,
        txins: Vec<TxIn>,
        txouts: Vec<TxOut>,
        locktime: u32,
        timestamp: u32,
        status: TxStatus,
    ) {
        self.version = version;
        self.txins = txins;
        self.txouts = txouts;
        self.locktime = locktime;
        self.timestamp = timestamp;
        self.status = status;
        self.stamp_children();
        self.refresh();
    }

    pub fn set_from_transaction(&mut self, tx: &Transaction, timestamp: u32, status: TxStatus) {
        self.set(
            tx.version.0,
            tx.input.iter().map(TxIn::from).collect(),
            tx.output.iter().map(TxOut::from).collect(),
            tx.lock_time.to_consensus_u32(),
            timestamp,
            status,
        );
    }

    pub fn set_from_raw(&mut self, raw: &[u8], timestamp: u32, status: TxStatus) -> Result<(), TxError> {
        let tx: Transaction = deserialize(raw)?;
        self.set_from_transaction(&tx, timestamp, status);
        Ok(())
    }

    fn stamp_children(&mut self) {
        let id = self.id;
        for (i, txin) in self.txins.iter_mut().enumerate() {
            txin.set_position(id, i as u32);
        }
        for (i, txout) in self.txouts.iter_mut().enumerate() {
            txout.set_position(id, i as u32);
        }
    }

    fn refresh(&mut self) {
        self.update_status();
        self.update_unsigned_hash();
        self.update_hash();
    }

    pub fn to_transaction(&self) -> Transaction {
        Transaction {
            version: Version(self.version),
            lock_time: LockTime::from_consensus(self.locktime),
            input: self.txins.iter().map(TxIn::to_txin).collect(),
            output: self.txouts.iter().map(TxOut::to_txout).collect(),
        }
    }

    pub fn raw(&self) -> Vec<u8> {
        serialize(&self.to_transaction())
    }

    /// Force [`TxStatus::Unsigned`] while any input still needs signatures.
    pub fn update_status(&mut self) {
        if self.missing_sig_count() > 0 {
            self.status = TxStatus::Unsigned;
        }
    }

    pub fn update_unsigned_hash(&mut self) {
        let mut tx = self.to_transaction();
        for input in &mut tx.input {
            input.script_sig = ScriptBuf::new();
        }
        self.unsigned_hash = Some(tx.compute_txid());
    }

    pub fn update_hash(&mut self) {
        self.hash = match self.status {
            TxStatus::Unsigned => None,
            _ => Some(self.to_transaction().compute_txid()),
        };
        debug!(
            "tx {:?}: status {:?}, hash {:?}",
            self.unsigned_hash, self.status, self.hash
        );
    }

    /// Largest number of signatures any single input still needs.
    ///
    /// This treats every input as governed by one policy. Use
    /// [`Tx::missing_sigs_per_input`] for exact per-input counts.
    pub fn missing_sig_count(&self) -> usize {
        self.missing_sigs_per_input().into_iter().max().unwrap_or(0)
    }

    pub fn missing_sigs_per_input(&self) -> Vec<usize> {
        self.txins.iter().map(|txin| script::sigs_needed(&txin.script)).collect()
    }

    /// Every public key, across all inputs, whose signature is still missing.
    pub fn missing_sig_pubkeys(&self) -> BTreeSet<PublicKey> {
        self.txins
            .iter()
            .flat_map(|txin| script::missing_sigs(&txin.script))
            .collect()
    }

    /// Move to `status`.
    ///
    /// Moves are forward in table order, except out of
    /// [`TxStatus::Confirmed`]. Leaving [`TxStatus::Unsigned`] needs every
    /// signature in place.
    pub fn set_status(&mut self, status: TxStatus) -> Result<(), TxError> {
        if status == self.status {
            return Ok(());
        }
        if status < self.status && self.status != TxStatus::Confirmed {
            return Err(TxError::InvalidTransition {
                from: self.status,
                to: status,
            });
        }
        let missing = self.missing_sig_count();
        if status != TxStatus::Unsigned && missing > 0 {
            return Err(TxError::MissingSignatures(missing));
        }

        self.status = status;
        self.update_hash();
        Ok(())
    }

    /// Take, per input, whichever script needs fewer signatures.
    ///
    /// Returns whether any input changed.
    pub fn merge_signatures(&mut self, other: &Tx) -> Result<bool, TxError> {
        if self.unsigned_hash != other.unsigned_hash {
            return Err(TxError::UnsignedHashMismatch);
        }

        let mut changed = false;
        for (ours, theirs) in self.txins.iter_mut().zip(&other.txins) {
            let needed = script::sigs_needed(&ours.script);
            let offered = script::sigs_needed(&theirs.script);
            if offered < needed {
                ours.script = theirs.script.clone();
                changed = true;
            } else if offered > needed {
                warn!("ignoring input {} with fewer signatures", ours.txindex);
            }
        }

        if changed {
            self.update_status();
            self.update_hash();
        }
        Ok(changed)
    }

    /// Randomly reorder inputs and re-stamp positions.
    pub fn shuffle_txins<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.txins.shuffle(rng);
        self.stamp_children();
        self.update_unsigned_hash();
        self.update_hash();
    }

    /// Randomly reorder outputs and re-stamp positions.
    pub fn shuffle_txouts<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.txouts.shuffle(rng);
        self.stamp_children();
        self.update_unsigned_hash();
        self.update_hash();
    }

    pub fn set_block(&mut self, header: BlockHeaderId, index: u32) {
        self.block = Some(BlockRef { header, index });
    }

    pub fn clear_block(&mut self) {
        self.block = None;
    }

    pub(crate) fn set_id(&mut self, id: TxRecordId) {
        self.id = Some(id);
        self.stamp_children();
    }

    pub(crate) fn txins_mut(&mut self) -> &mut [TxIn] {
        &mut self.txins
    }

    pub(crate) fn txouts_mut(&mut self) -> &mut [TxOut] {
        &mut self.txouts
    }

    /// Rebuild a stored transaction without recomputing anything.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        id: TxRecordId,
        hash: Option<Txid>,
        unsigned_hash: Option<Txid>,
        version: i32,
        locktime: u32,
        timestamp: u32,
        status: TxStatus,
        fee: Option<Amount>,
        block: Option<BlockRef>,
        txins: Vec<TxIn>,
        txouts: Vec<TxOut>,
    ) -> Self {
        let mut tx = Self {
            id: Some(id),
            hash,
            unsigned_hash,
            version,
            locktime,
            timestamp,
            status,
            fee,
            block,
            txins,
            txouts,
        };
        tx.stamp_children();
        tx
    }

    pub fn id(&self) -> Option<TxRecordId> {
        self.id
    }

    /// Final txid, empty until fully signed.
    pub fn hash(&self) -> Option<Txid> {
        self.hash
    }

    pub fn unsigned_hash(&self) -> Option<Txid> {
        self.unsigned_hash
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn locktime(&self) -> u32 {
        self.locktime
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: u32) {
        self.timestamp = timestamp;
    }

    pub fn status(&self) -> TxStatus {
        self.status
    }

    pub fn fee(&self) -> Option<Amount> {
        self.fee
    }

    pub fn set_fee(&mut self, fee: Amount) {
        self.fee = Some(fee);
    }

    pub fn block(&self) -> Option<BlockRef> {
        self.block
    }

    pub fn txins(&self) -> &[TxIn] {
        &self.txins
    }

    pub fn txouts(&self) -> &[TxOut] {
        &self.txouts
    }
}

impl TxIn {
    pub(crate) fn from_parts(
        id: TxInId,
        outpoint: OutPoint,
        script: ScriptBuf,
        sequence: Sequence,
    ) -> Self {
        let mut txin = Self::new(outpoint, script, sequence);
        txin.id = Some(id);
        txin
    }
}

impl TxOut {
    pub(crate) fn from_parts(
        id: TxOutId,
        value: Amount,
        script: ScriptBuf,
        spent: Option<TxInId>,
        signing_script: Option<SigningScriptId>,
        account: Option<AccountId>,
        kind: TxOutType,
    ) -> Self {
        Self {
            id: Some(id),
            value,
            script,
            tx: None,
            txindex: 0,
            spent,
            signing_script,
            account,
            kind,
        }
    }
}
