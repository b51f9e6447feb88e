//! Stable identifiers for stored entities
//!
//! Owning edges are held directly; every back-reference (keychain parent,
//! bin → account, txin/txout → tx, ...) is one of these ids and is resolved
//! through the [`crate::Wallet`] arena or the store.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! entity_id {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
            #[serde(transparent)]
            pub struct $name(pub u64);

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }

            impl From<$name> for i64 {
                fn from(id: $name) -> i64 {
                    id.0 as i64
                }
            }

            impl From<i64> for $name {
                fn from(raw: i64) -> Self {
                    Self(raw as u64)
                }
            }
        )*
    };
}

entity_id!(
    KeychainId,
    KeyId,
    AccountId,
    AccountBinId,
    SigningScriptId,
    /// Row id of a stored transaction (not its txid)
    TxRecordId,
    TxInId,
    TxOutId,
    BlockHeaderId,
    MerkleBlockId,
);

/// Monotonic id source, one per entity kind.
#[derive(Debug, Clone, Default)]
pub(crate) struct IdAllocator {
    last: u64,
}

impl IdAllocator {
    pub(crate) fn next(&mut self) -> u64 {
        self.last += 1;
        self.last
    }

    /// Make sure ids handed out later never collide with a restored one.
    pub(crate) fn observe(&mut self, id: u64) {
        self.last = self.last.max(id);
    }
}
