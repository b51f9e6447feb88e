//! Generated multisig script pairs

use crate::flags::{Flag, FlagSet};
use crate::ids::{AccountBinId, AccountId, SigningScriptId};
use crate::key::Key;
use bitcoin::ScriptBuf;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScriptStatus {
    /// In the lookahead pool
    Unused,
    /// Handed out as a change address
    Change,
    /// Handed out, waiting for a payment
    Pending,
    /// Seen in a transaction output
    Received,
    Canceled,
}

impl Flag for ScriptStatus {
    const TABLE: &'static [(Self, u32, &'static str)] = &[
        (ScriptStatus::Unused, 1, "UNUSED"),
        (ScriptStatus::Change, 2, "CHANGE"),
        (ScriptStatus::Pending, 4, "PENDING"),
        (ScriptStatus::Received, 8, "RECEIVED"),
        (ScriptStatus::Canceled, 16, "CANCELED"),
    ];
}

impl ScriptStatus {
    /// `"UNUSED | PENDING"`, or `"UNKNOWN"` if no known bit is set.
    pub fn status_string(bits: u32) -> String {
        FlagSet::<Self>::from_bits(bits).to_string()
    }

    pub fn status_flags(bits: u32) -> Vec<Self> {
        FlagSet::<Self>::from_bits(bits).flags()
    }
}

/// The script pair for one (bin, index) coordinate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningScript {
    id: Option<SigningScriptId>,
    account: Option<AccountId>,
    account_bin: Option<AccountBinId>,
    index: u32,
    label: String,
    status: ScriptStatus,
    txinscript: ScriptBuf,
    txoutscript: ScriptBuf,
    keys: Vec<Key>,
}

impl SigningScript {
    /// `keys` must already be in canonical (sorted) order.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        account: Option<AccountId>,
        account_bin: Option<AccountBinId>,
        index: u32,
        label: &str,
        status: ScriptStatus,
        txinscript: ScriptBuf,
        txoutscript: ScriptBuf,
        keys: Vec<Key>,
    ) -> Self {
        Self {
            id: None,
            account,
            account_bin,
            index,
            label: label.to_string(),
            status,
            txinscript,
            txoutscript,
            keys,
        }
    }

    pub(crate) fn set_id(&mut self, id: SigningScriptId) {
        self.id = Some(id);
    }

    pub(crate) fn keys_mut(&mut self) -> &mut [Key] {
        &mut self.keys
    }

    pub fn id(&self) -> Option<SigningScriptId> {
        self.id
    }

    pub fn account(&self) -> Option<AccountId> {
        self.account
    }

    pub fn account_bin(&self) -> Option<AccountBinId> {
        self.account_bin
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn set_label(&mut self, label: &str) {
        self.label = label.to_string();
    }

    pub fn status(&self) -> ScriptStatus {
        self.status
    }

    pub fn set_status(&mut self, status: ScriptStatus) {
        self.status = status;
    }

    /// Unsigned edit-form input script (empty signature slots).
    pub fn txinscript(&self) -> &ScriptBuf {
        &self.txinscript
    }

    pub fn txoutscript(&self) -> &ScriptBuf {
        &self.txoutscript
    }

    pub fn keys(&self) -> &[Key] {
        &self.keys
    }
}
