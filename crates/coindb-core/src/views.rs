//! Flattened read-only projections for listings

use crate::flags::FlagSet;
use crate::ids::{AccountBinId, AccountId, SigningScriptId};
use crate::signing_script::ScriptStatus;
use bitcoin::ScriptBuf;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountBinView {
    pub account_id: AccountId,
    pub account_name: String,
    pub bin_id: AccountBinId,
    pub bin_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SigningScriptView {
    pub account_id: AccountId,
    pub account_name: String,
    pub account_bin_id: AccountBinId,
    pub account_bin_name: String,
    pub id: SigningScriptId,
    pub label: String,
    pub status: ScriptStatus,
    pub txinscript: ScriptBuf,
    pub txoutscript: ScriptBuf,
}

/// Selects signing scripts by account name, bin name and status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptFilter {
    pub account: Option<String>,
    pub bin: Option<String>,
    pub status: FlagSet<ScriptStatus>,
}

impl Default for ScriptFilter {
    fn default() -> Self {
        Self {
            account: None,
            bin: None,
            status: FlagSet::all(),
        }
    }
}

impl ScriptFilter {
    pub fn account(mut self, name: &str) -> Self {
        self.account = Some(name.to_string());
        self
    }

    pub fn bin(mut self, name: &str) -> Self {
        self.bin = Some(name.to_string());
        self
    }

    pub fn status(mut self, status: impl Into<FlagSet<ScriptStatus>>) -> Self {
        self.status = status.into();
        self
    }

    pub fn matches(&self, account_name: &str, bin_name: &str, status: ScriptStatus) -> bool {
        self.account.as_deref().map_or(true, |a| a == account_name)
            && self.bin.as_deref().map_or(true, |b| b == bin_name)
            && self.status.contains(status)
    }
}
