//! HD keychains
//!
//! A [`Keychain`] is one BIP-32 node: a public key plus a chain code and,
//! for private keychains, a private key. The chain code and private key are
//! *lockable*: the cleartext can be dropped from memory and later restored
//! from the sealed copy made with a lock key.
//!
//! Keychains reference their parent by id. The tree itself lives in the
//! [`Keychains`] registry, which assigns ids on insert and wires each new
//! node into its parent's children.

use crate::crypto::{LockCipher, LockError, Sealed};
use crate::ids::{IdAllocator, KeychainId};
use bitcoin::bip32::{self, ChainCode, ChildNumber, Fingerprint, Xpriv, Xpub};
use bitcoin::hashes::{hash160, Hash};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::NetworkKind;
use log::debug;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use zeroize::Zeroizing;

/// Names starting with this are reserved for internal use.
pub const RESERVED_NAME_PREFIX: char = '@';

#[derive(Error, Debug)]
pub enum KeychainError {
    #[error("Invalid keychain name: {0:?}")]
    InvalidName(String),
    #[error("Keychain is not private")]
    NotPrivate,
    #[error("Private key is locked")]
    PrivateKeyLocked,
    #[error("Chain code is locked")]
    ChainCodeLocked,
    #[error("No sealed copy stored; set a lock key first")]
    NoCiphertext,
    #[error("Unlocked material does not belong to this keychain")]
    MaterialMismatch,
    #[error("Derivation failed: {0}")]
    Derivation(#[from] bip32::Error),
    #[error("Unknown keychain: {0}")]
    UnknownKeychain(KeychainId),
    #[error("Keychain has not been registered")]
    Unregistered,
    #[error(transparent)]
    Lock(#[from] LockError),
}

/// Non-empty and not starting with [`RESERVED_NAME_PREFIX`].
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with(RESERVED_NAME_PREFIX)
}

/// ripemd160(sha256(pubkey || chain_code))
fn identity_hash(pubkey: &PublicKey, chain_code: &[u8; 32]) -> hash160::Hash {
    let mut data = Vec::with_capacity(33 + 32);
    data.extend_from_slice(&pubkey.serialize());
    data.extend_from_slice(chain_code);
    hash160::Hash::hash(&data)
}

fn chain_code_bytes(chain_code: &ChainCode) -> [u8; 32] {
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(AsRef::<[u8]>::as_ref(chain_code));
    bytes
}

#[derive(Clone)]
pub struct Keychain {
    id: Option<KeychainId>,
    name: String,
    depth: u8,
    parent_fp: Fingerprint,
    child_num: u32,
    pubkey: PublicKey,
    chain_code: Option<Zeroizing<[u8; 32]>>,
    chain_code_ciphertext: Option<Sealed>,
    privkey: Option<Zeroizing<[u8; 32]>>,
    privkey_ciphertext: Option<Sealed>,
    private: bool,
    parent: Option<KeychainId>,
    derivation_path: Vec<u32>,
    children: Vec<KeychainId>,
    hash: hash160::Hash,
}

impl Keychain {
    /// Create a root keychain from seed entropy.
    ///
    /// The same entropy always yields a byte-identical keychain.
    pub fn new(name: &str, entropy: &[u8]) -> Result<Self, KeychainError> {
        if !is_valid_name(name) {
            return Err(KeychainError::InvalidName(name.to_string()));
        }
        let master = Xpriv::new_master(NetworkKind::Main, entropy)?;
        let keychain = Self::from_hd_private(name.to_string(), &Secp256k1::new(), &master);
        debug!("created root keychain {:?} ({})", keychain.name, keychain.hash);
        Ok(keychain)
    }

    /// Import a private extended key as a root keychain.
    pub fn from_xpriv(name: &str, xpriv: &Xpriv) -> Result<Self, KeychainError> {
        if !is_valid_name(name) {
            return Err(KeychainError::InvalidName(name.to_string()));
        }
        Ok(Self::from_hd_private(name.to_string(), &Secp256k1::new(), xpriv))
    }

    /// Import a public extended key (a cosigner) as a public-only root keychain.
    pub fn from_xpub(name: &str, xpub: &Xpub) -> Result<Self, KeychainError> {
        if !is_valid_name(name) {
            return Err(KeychainError::InvalidName(name.to_string()));
        }
        Ok(Self::from_hd_public(name.to_string(), xpub))
    }

    fn from_hd_private<C: bitcoin::secp256k1::Signing>(
        name: String,
        secp: &Secp256k1<C>,
        xpriv: &Xpriv,
    ) -> Self {
        let chain_code = chain_code_bytes(&xpriv.chain_code);
        let pubkey = PublicKey::from_secret_key(secp, &xpriv.private_key);
        Self {
            id: None,
            name,
            depth: xpriv.depth,
            parent_fp: xpriv.parent_fingerprint,
            child_num: u32::from(xpriv.child_number),
            pubkey,
            chain_code: Some(Zeroizing::new(chain_code)),
            chain_code_ciphertext: None,
            privkey: Some(Zeroizing::new(xpriv.private_key.secret_bytes())),
            privkey_ciphertext: None,
            private: true,
            parent: None,
            derivation_path: Vec::new(),
            children: Vec::new(),
            hash: identity_hash(&pubkey, &chain_code),
        }
    }

    fn from_hd_public(name: String, xpub: &Xpub) -> Self {
        let chain_code = chain_code_bytes(&xpub.chain_code);
        Self {
            id: None,
            name,
            depth: xpub.depth,
            parent_fp: xpub.parent_fingerprint,
            child_num: u32::from(xpub.child_number),
            pubkey: xpub.public_key,
            chain_code: Some(Zeroizing::new(chain_code)),
            chain_code_ciphertext: None,
            privkey: None,
            privkey_ciphertext: None,
            private: false,
            parent: None,
            derivation_path: Vec::new(),
            children: Vec::new(),
            hash: identity_hash(&xpub.public_key, &chain_code),
        }
    }

    fn xpub_with(&self, chain_code: &[u8; 32]) -> Xpub {
        Xpub {
            network: NetworkKind::Main,
            depth: self.depth,
            parent_fingerprint: self.parent_fp,
            child_number: ChildNumber::from(self.child_num),
            public_key: self.pubkey,
            chain_code: ChainCode::from(*chain_code),
        }
    }

    fn xpriv_with(&self, privkey: &[u8; 32], chain_code: &[u8; 32]) -> Result<Xpriv, KeychainError> {
        let private_key = SecretKey::from_slice(privkey).map_err(bip32::Error::Secp256k1)?;
        Ok(Xpriv {
            network: NetworkKind::Main,
            depth: self.depth,
            parent_fingerprint: self.parent_fp,
            child_number: ChildNumber::from(self.child_num),
            private_key,
            chain_code: ChainCode::from(*chain_code),
        })
    }

    /// Derive the child at `index`.
    ///
    /// A public child of a private keychain has the same public key as the
    /// private child at the same index.
    pub fn child(&self, index: u32, want_private: bool) -> Result<Keychain, KeychainError> {
        if want_private && !self.private {
            return Err(KeychainError::NotPrivate);
        }
        let chain_code = self.chain_code.as_ref().ok_or(KeychainError::ChainCodeLocked)?;

        let secp = Secp256k1::new();
        let mut child = if want_private {
            let privkey = self.privkey.as_ref().ok_or(KeychainError::PrivateKeyLocked)?;
            let xpriv = self
                .xpriv_with(privkey, chain_code)?
                .derive_priv(&secp, &[ChildNumber::from(index)])?;
            Self::from_hd_private(String::new(), &secp, &xpriv)
        } else {
            let xpub = self.xpub_with(chain_code).ckd_pub(&secp, ChildNumber::from(index))?;
            Self::from_hd_public(String::new(), &xpub)
        };

        child.parent = self.id;
        child.derivation_path = self.derivation_path.clone();
        child.derivation_path.push(index);
        debug!(
            "derived {} child {:?} of keychain {:?}",
            if want_private { "private" } else { "public" },
            child.derivation_path,
            self.name
        );
        Ok(child)
    }

    // ---- lock keys ----

    /// Seal the current private key under `lock_key`.
    pub fn set_private_key_lock_key(
        &mut self,
        cipher: &dyn LockCipher,
        lock_key: &[u8],
    ) -> Result<(), KeychainError> {
        if !self.private {
            return Err(KeychainError::NotPrivate);
        }
        let privkey = self.privkey.as_ref().ok_or(KeychainError::PrivateKeyLocked)?;
        self.privkey_ciphertext = Some(cipher.seal(lock_key, &privkey[..])?);
        Ok(())
    }

    /// Seal the current chain code under `lock_key`.
    pub fn set_chain_code_lock_key(
        &mut self,
        cipher: &dyn LockCipher,
        lock_key: &[u8],
    ) -> Result<(), KeychainError> {
        let chain_code = self.chain_code.as_ref().ok_or(KeychainError::ChainCodeLocked)?;
        self.chain_code_ciphertext = Some(cipher.seal(lock_key, &chain_code[..])?);
        Ok(())
    }

    /// Seal the chain code, and the private key if there is one.
    pub fn set_lock_key(&mut self, cipher: &dyn LockCipher, lock_key: &[u8]) -> Result<(), KeychainError> {
        self.set_chain_code_lock_key(cipher, lock_key)?;
        if self.private {
            self.set_private_key_lock_key(cipher, lock_key)?;
        }
        Ok(())
    }

    pub fn lock_private_key(&mut self) {
        self.privkey = None;
    }

    pub fn lock_chain_code(&mut self) {
        self.chain_code = None;
    }

    pub fn lock_all(&mut self) {
        self.lock_private_key();
        self.lock_chain_code();
    }

    pub fn is_private_key_locked(&self) -> Result<bool, KeychainError> {
        if !self.private {
            return Err(KeychainError::NotPrivate);
        }
        Ok(self.privkey.is_none())
    }

    pub fn is_chain_code_locked(&self) -> bool {
        self.chain_code.is_none()
    }

    /// Restore the private key from its sealed copy. No-op if already unlocked.
    pub fn unlock_private_key(
        &mut self,
        cipher: &dyn LockCipher,
        lock_key: &[u8],
    ) -> Result<(), KeychainError> {
        if !self.private {
            return Err(KeychainError::NotPrivate);
        }
        if self.privkey.is_some() {
            return Ok(());
        }
        let sealed = self.privkey_ciphertext.as_ref().ok_or(KeychainError::NoCiphertext)?;
        let plaintext = cipher.open(lock_key, sealed)?;

        let bytes: [u8; 32] = plaintext
            .as_slice()
            .try_into()
            .map_err(|_| KeychainError::MaterialMismatch)?;
        let secret = SecretKey::from_slice(&bytes).map_err(|_| KeychainError::MaterialMismatch)?;
        if PublicKey::from_secret_key(&Secp256k1::signing_only(), &secret) != self.pubkey {
            return Err(KeychainError::MaterialMismatch);
        }

        self.privkey = Some(Zeroizing::new(bytes));
        Ok(())
    }

    /// Restore the chain code from its sealed copy. No-op if already unlocked.
    pub fn unlock_chain_code(
        &mut self,
        cipher: &dyn LockCipher,
        lock_key: &[u8],
    ) -> Result<(), KeychainError> {
        if self.chain_code.is_some() {
            return Ok(());
        }
        let sealed = self.chain_code_ciphertext.as_ref().ok_or(KeychainError::NoCiphertext)?;
        let plaintext = cipher.open(lock_key, sealed)?;

        let bytes: [u8; 32] = plaintext
            .as_slice()
            .try_into()
            .map_err(|_| KeychainError::MaterialMismatch)?;
        if identity_hash(&self.pubkey, &bytes) != self.hash {
            return Err(KeychainError::MaterialMismatch);
        }

        self.chain_code = Some(Zeroizing::new(bytes));
        Ok(())
    }

    /// Unlock the chain code, and the private key if there is one.
    pub fn unlock_all(&mut self, cipher: &dyn LockCipher, lock_key: &[u8]) -> Result<(), KeychainError> {
        self.unlock_chain_code(cipher, lock_key)?;
        if self.private {
            self.unlock_private_key(cipher, lock_key)?;
        }
        Ok(())
    }

    // ---- signing keys ----

    /// Walk `path` from this node, then return the private key of child `leaf`.
    pub fn get_signing_private_key(&self, leaf: u32, path: &[u32]) -> Result<SecretKey, KeychainError> {
        if !self.private {
            return Err(KeychainError::NotPrivate);
        }
        let privkey = self.privkey.as_ref().ok_or(KeychainError::PrivateKeyLocked)?;
        let chain_code = self.chain_code.as_ref().ok_or(KeychainError::ChainCodeLocked)?;

        let secp = Secp256k1::new();
        let xpriv = self
            .xpriv_with(privkey, chain_code)?
            .derive_priv(&secp, &leaf_path(path, leaf))?;
        Ok(xpriv.private_key)
    }

    /// Walk `path` from this node, then return the public key of child `leaf`.
    pub fn get_signing_public_key(&self, leaf: u32, path: &[u32]) -> Result<PublicKey, KeychainError> {
        let chain_code = self.chain_code.as_ref().ok_or(KeychainError::ChainCodeLocked)?;

        let secp = Secp256k1::verification_only();
        let xpub = self
            .xpub_with(chain_code)
            .derive_pub(&secp, &leaf_path(path, leaf))?;
        Ok(xpub.public_key)
    }

    /// Base58check extended key (`xpub…`/`xprv…`, `tpub…`/`tprv…` off mainnet).
    pub fn extkey(
        &self,
        want_private: bool,
        network: impl Into<NetworkKind>,
    ) -> Result<Zeroizing<String>, KeychainError> {
        if want_private && !self.private {
            return Err(KeychainError::NotPrivate);
        }
        if want_private && self.privkey.is_none() {
            return Err(KeychainError::PrivateKeyLocked);
        }
        let chain_code = self.chain_code.as_ref().ok_or(KeychainError::ChainCodeLocked)?;
        let network = network.into();

        let encoded = match self.privkey.as_ref().filter(|_| want_private) {
            Some(privkey) => {
                let mut xpriv = self.xpriv_with(privkey, chain_code)?;
                xpriv.network = network;
                xpriv.to_string()
            }
            None => {
                let mut xpub = self.xpub_with(chain_code);
                xpub.network = network;
                xpub.to_string()
            }
        };
        Ok(Zeroizing::new(encoded))
    }

    // ---- accessors ----

    pub fn id(&self) -> Option<KeychainId> {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) -> Result<(), KeychainError> {
        if !is_valid_name(name) {
            return Err(KeychainError::InvalidName(name.to_string()));
        }
        self.name = name.to_string();
        Ok(())
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn parent_fp(&self) -> Fingerprint {
        self.parent_fp
    }

    pub fn child_num(&self) -> u32 {
        self.child_num
    }

    pub fn pubkey(&self) -> &PublicKey {
        &self.pubkey
    }

    /// ripemd160(sha256(pubkey || chain_code))
    pub fn hash(&self) -> hash160::Hash {
        self.hash
    }

    pub fn is_private(&self) -> bool {
        self.private
    }

    pub fn parent(&self) -> Option<KeychainId> {
        self.parent
    }

    pub fn children(&self) -> &[KeychainId] {
        &self.children
    }

    pub fn derivation_path(&self) -> &[u32] {
        &self.derivation_path
    }

    pub fn privkey(&self) -> Result<SecretKey, KeychainError> {
        if !self.private {
            return Err(KeychainError::NotPrivate);
        }
        let privkey = self.privkey.as_ref().ok_or(KeychainError::PrivateKeyLocked)?;
        Ok(SecretKey::from_slice(&privkey[..]).map_err(bip32::Error::Secp256k1)?)
    }

    pub fn chain_code(&self) -> Result<ChainCode, KeychainError> {
        let chain_code = self.chain_code.as_ref().ok_or(KeychainError::ChainCodeLocked)?;
        Ok(ChainCode::from(**chain_code))
    }

    pub fn privkey_ciphertext(&self) -> Option<&Sealed> {
        self.privkey_ciphertext.as_ref()
    }

    pub fn chain_code_ciphertext(&self) -> Option<&Sealed> {
        self.chain_code_ciphertext.as_ref()
    }

    /// Whether every cleartext field present also has a sealed copy.
    pub fn is_sealed(&self) -> bool {
        let chain_code_ok = self.chain_code.is_none() || self.chain_code_ciphertext.is_some();
        let privkey_ok = self.privkey.is_none() || self.privkey_ciphertext.is_some();
        chain_code_ok && privkey_ok
    }

    pub(crate) fn to_record(&self) -> KeychainRecord {
        KeychainRecord {
            id: self.id,
            name: self.name.clone(),
            depth: self.depth,
            parent_fp: self.parent_fp,
            child_num: self.child_num,
            pubkey: self.pubkey,
            chain_code_ciphertext: self.chain_code_ciphertext.clone(),
            privkey_ciphertext: self.privkey_ciphertext.clone(),
            private: self.private,
            parent: self.parent,
            derivation_path: self.derivation_path.clone(),
            hash: self.hash,
        }
    }

    /// Rebuild a stored keychain. It comes back locked.
    pub(crate) fn from_record(record: KeychainRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            depth: record.depth,
            parent_fp: record.parent_fp,
            child_num: record.child_num,
            pubkey: record.pubkey,
            chain_code: None,
            chain_code_ciphertext: record.chain_code_ciphertext,
            privkey: None,
            privkey_ciphertext: record.privkey_ciphertext,
            private: record.private,
            parent: record.parent,
            derivation_path: record.derivation_path,
            children: Vec::new(),
            hash: record.hash,
        }
    }
}

impl fmt::Debug for Keychain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keychain")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("depth", &self.depth)
            .field("child_num", &self.child_num)
            .field("pubkey", &self.pubkey)
            .field("private", &self.private)
            .field("chain_code_locked", &self.chain_code.is_none())
            .field("privkey_locked", &self.privkey.is_none())
            .field("derivation_path", &self.derivation_path)
            .field("hash", &self.hash)
            .finish_non_exhaustive()
    }
}

/// Persistent fields of a keychain (no cleartext secrets).
#[derive(Debug, Clone)]
pub(crate) struct KeychainRecord {
    pub id: Option<KeychainId>,
    pub name: String,
    pub depth: u8,
    pub parent_fp: Fingerprint,
    pub child_num: u32,
    pub pubkey: PublicKey,
    pub chain_code_ciphertext: Option<Sealed>,
    pub privkey_ciphertext: Option<Sealed>,
    pub private: bool,
    pub parent: Option<KeychainId>,
    pub derivation_path: Vec<u32>,
    pub hash: hash160::Hash,
}

/// Registry of keychains addressed by id.
#[derive(Debug, Clone, Default)]
pub struct Keychains {
    ids: IdAllocator,
    nodes: BTreeMap<KeychainId, Keychain>,
}

impl Keychains {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign an id and link the keychain under its parent, if any.
    pub fn insert(&mut self, mut keychain: Keychain) -> KeychainId {
        let id = KeychainId(self.ids.next());
        keychain.id = Some(id);
        keychain.children.clear();
        self.link(id, keychain);
        id
    }

    /// Put back a keychain that already has an id.
    pub(crate) fn restore(&mut self, mut keychain: Keychain) -> Result<KeychainId, KeychainError> {
        let id = keychain.id.ok_or(KeychainError::Unregistered)?;
        self.ids.observe(id.0);
        keychain.children.clear();
        self.link(id, keychain);
        Ok(id)
    }

    fn link(&mut self, id: KeychainId, keychain: Keychain) {
        if let Some(parent) = keychain.parent.and_then(|p| self.nodes.get_mut(&p)) {
            parent.children.push(id);
        }
        self.nodes.insert(id, keychain);
    }

    /// Derive a child of a registered keychain, name it and register it.
    pub fn derive(
        &mut self,
        parent: KeychainId,
        index: u32,
        want_private: bool,
        name: &str,
    ) -> Result<KeychainId, KeychainError> {
        let mut child = self
            .get(parent)
            .ok_or(KeychainError::UnknownKeychain(parent))?
            .child(index, want_private)?;
        child.set_name(name)?;
        Ok(self.insert(child))
    }

    pub fn get(&self, id: KeychainId) -> Option<&Keychain> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: KeychainId) -> Option<&mut Keychain> {
        self.nodes.get_mut(&id)
    }

    pub fn find(&self, name: &str) -> Option<&Keychain> {
        self.nodes.values().find(|k| k.name == name)
    }

    pub fn id_of(&self, name: &str) -> Option<KeychainId> {
        self.find(name).and_then(Keychain::id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Keychain> {
        self.nodes.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Keychain> {
        self.nodes.values_mut()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Follow parent links up to the tree root.
    ///
    /// `keychain` itself does not need to be registered (bin keychains are
    /// not), but every ancestor does.
    pub fn root_id(&self, keychain: &Keychain) -> Result<KeychainId, KeychainError> {
        let mut current = keychain;
        while let Some(parent) = current.parent {
            current = self
                .nodes
                .get(&parent)
                .ok_or(KeychainError::UnknownKeychain(parent))?;
        }
        current.id.ok_or(KeychainError::Unregistered)
    }

    pub fn root(&self, keychain: &Keychain) -> Result<&Keychain, KeychainError> {
        let id = self.root_id(keychain)?;
        self.get(id).ok_or(KeychainError::UnknownKeychain(id))
    }
}

fn leaf_path(path: &[u32], leaf: u32) -> Vec<ChildNumber> {
    path.iter()
        .chain(std::iter::once(&leaf))
        .map(|&index| ChildNumber::from(index))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_cipher;
    use std::str::FromStr;

    /// BIP-32 test vector 1 seed
    const SEED_1: &str = "000102030405060708090a0b0c0d0e0f";

    fn root(name: &str, seed: &str) -> Keychain {
        Keychain::new(name, &hex::decode(seed).unwrap()).unwrap()
    }

    #[test]
    fn test_bip32_vector_1_master() {
        let keychain = root("vector1", SEED_1);
        assert_eq!(
            keychain.extkey(true, NetworkKind::Main).unwrap().as_str(),
            "xprv9s21ZrQH143K3QTDL4LXw2F7HEK3wJUD2nW2nRk4stbPy6cq3jPPqjiChkVvvNKmPGJxWUtg6LnF5kejMRNNU3TGtRBeJgk33yuGBxrMPHi"
        );
        assert_eq!(
            keychain.extkey(false, NetworkKind::Main).unwrap().as_str(),
            "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8"
        );
        assert_eq!(keychain.depth(), 0);
        assert_eq!(keychain.child_num(), 0);
        assert!(keychain.derivation_path().is_empty());
    }

    #[test]
    fn test_bip32_vector_1_hardened_child() {
        let child = root("vector1", SEED_1).child(0x8000_0000, true).unwrap();
        assert_eq!(
            child.extkey(true, NetworkKind::Main).unwrap().as_str(),
            "xprv9uHRZZhk6KAJC1avXpDAp4MDc3sQKNxDiPvvkX8Br5ngLNv1TxvUxt4cV1rGL5hj6KCesnDYUhd7oWgT11eZG7XnxHrnYeSvkzY7d2bhkJ7"
        );
        assert_eq!(
            child.extkey(false, NetworkKind::Main).unwrap().as_str(),
            "xpub68Gmy5EdvgibQVfPdqkBBCHxA5htiqg55crXYuXoQRKfDBFA1WEjWgP6LHhwBZeNK1VTsfTFUHCdrfp1bgwQ9xv5ski8PX9rL2dZXvgGDnw"
        );
        assert_eq!(child.depth(), 1);
    }

    #[test]
    fn test_same_entropy_same_keychain() {
        let a = Keychain::new("a", &[7u8; 32]).unwrap();
        let b = Keychain::new("b", &[7u8; 32]).unwrap();

        assert_eq!(a.pubkey(), b.pubkey());
        assert_eq!(a.chain_code().unwrap(), b.chain_code().unwrap());
        assert_eq!(a.hash(), b.hash());

        let c = Keychain::new("c", &[8u8; 32]).unwrap();
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn test_identity_hash_covers_pubkey_and_chain_code() {
        let keychain = Keychain::new("k", &[1u8; 32]).unwrap();
        let mut data = keychain.pubkey().serialize().to_vec();
        data.extend_from_slice(AsRef::<[u8]>::as_ref(&keychain.chain_code().unwrap()));
        assert_eq!(keychain.hash(), hash160::Hash::hash(&data));
    }

    #[test]
    fn test_invalid_names_rejected() {
        assert!(matches!(
            Keychain::new("", &[1u8; 32]),
            Err(KeychainError::InvalidName(_))
        ));
        assert!(matches!(
            Keychain::new("@x", &[1u8; 32]),
            Err(KeychainError::InvalidName(_))
        ));
        assert!(Keychain::new("x@", &[1u8; 32]).is_ok());
    }

    #[test]
    fn test_public_and_private_children_agree() {
        let parent = Keychain::new("p", &[3u8; 32]).unwrap();
        for index in [0u32, 1, 2, 17, 0x7fff_ffff] {
            let private = parent.child(index, true).unwrap();
            let public = parent.child(index, false).unwrap();
            assert_eq!(private.pubkey(), public.pubkey());
            assert_eq!(private.hash(), public.hash());
            assert!(private.is_private());
            assert!(!public.is_private());
            assert_eq!(public.derivation_path(), &[index]);
        }
    }

    #[test]
    fn test_hardened_child_needs_private_key() {
        let parent = Keychain::new("p", &[3u8; 32]).unwrap();
        let hardened = 0x8000_0000;
        assert!(parent.child(hardened, true).is_ok());
        assert!(matches!(
            parent.child(hardened, false),
            Err(KeychainError::Derivation(_))
        ));
    }

    #[test]
    fn test_derivation_path_accumulates() {
        let root = Keychain::new("r", &[4u8; 32]).unwrap();
        let grandchild = root.child(5, true).unwrap().child(9, false).unwrap();
        assert_eq!(grandchild.derivation_path(), &[5, 9]);
        assert_eq!(grandchild.depth(), 2);
        assert_eq!(grandchild.child_num(), 9);
    }

    #[test]
    fn test_child_errors_on_locked_or_public() {
        let cipher = test_cipher();
        let mut keychain = Keychain::new("k", &[5u8; 32]).unwrap();
        keychain.set_lock_key(&cipher, b"pw").unwrap();

        keychain.lock_private_key();
        assert!(matches!(
            keychain.child(0, true),
            Err(KeychainError::PrivateKeyLocked)
        ));
        assert!(keychain.child(0, false).is_ok());

        keychain.lock_chain_code();
        assert!(matches!(
            keychain.child(0, false),
            Err(KeychainError::ChainCodeLocked)
        ));

        let public = Keychain::new("p", &[5u8; 32]).unwrap().child(0, false).unwrap();
        assert!(matches!(public.child(0, true), Err(KeychainError::NotPrivate)));
    }

    #[test]
    fn test_lock_unlock_roundtrip() {
        let cipher = test_cipher();
        let mut keychain = Keychain::new("k", &[6u8; 32]).unwrap();
        let privkey = keychain.privkey().unwrap();
        let chain_code = keychain.chain_code().unwrap();

        keychain.set_lock_key(&cipher, b"lock key").unwrap();
        keychain.lock_all();
        keychain.lock_all(); // idempotent
        assert!(keychain.is_private_key_locked().unwrap());
        assert!(keychain.is_chain_code_locked());

        keychain.unlock_all(&cipher, b"lock key").unwrap();
        assert_eq!(keychain.privkey().unwrap(), privkey);
        assert_eq!(keychain.chain_code().unwrap(), chain_code);

        // already unlocked: no-op even with a wrong key
        keychain.unlock_all(&cipher, b"not the key").unwrap();
    }

    #[test]
    fn test_unlock_with_wrong_key_stays_locked() {
        let cipher = test_cipher();
        let mut keychain = Keychain::new("k", &[6u8; 32]).unwrap();
        keychain.set_lock_key(&cipher, b"right").unwrap();
        keychain.lock_all();

        assert!(matches!(
            keychain.unlock_chain_code(&cipher, b"wrong"),
            Err(KeychainError::Lock(LockError::DecryptionFailed(_)))
        ));
        assert!(keychain.is_chain_code_locked());
    }

    #[test]
    fn test_unlock_without_ciphertext() {
        let cipher = test_cipher();
        let mut keychain = Keychain::new("k", &[6u8; 32]).unwrap();
        keychain.lock_private_key();
        assert!(matches!(
            keychain.unlock_private_key(&cipher, b"pw"),
            Err(KeychainError::NoCiphertext)
        ));
    }

    #[test]
    fn test_foreign_ciphertext_detected() {
        let cipher = test_cipher();
        let mut a = Keychain::new("a", &[1u8; 32]).unwrap();
        let mut b = Keychain::new("b", &[2u8; 32]).unwrap();
        a.set_lock_key(&cipher, b"pw").unwrap();
        b.set_lock_key(&cipher, b"pw").unwrap();

        b.privkey_ciphertext = a.privkey_ciphertext.clone();
        b.lock_private_key();
        assert!(matches!(
            b.unlock_private_key(&cipher, b"pw"),
            Err(KeychainError::MaterialMismatch)
        ));
    }

    #[test]
    fn test_public_keychain_private_operations_fail() {
        let cipher = test_cipher();
        let xpub = Xpub::from_str(
            "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8",
        )
        .unwrap();
        let mut keychain = Keychain::from_xpub("cosigner", &xpub).unwrap();

        assert!(!keychain.is_private());
        assert!(matches!(keychain.privkey(), Err(KeychainError::NotPrivate)));
        assert!(matches!(keychain.is_private_key_locked(), Err(KeychainError::NotPrivate)));
        assert!(matches!(keychain.extkey(true, NetworkKind::Main), Err(KeychainError::NotPrivate)));
        assert!(matches!(
            keychain.set_private_key_lock_key(&cipher, b"pw"),
            Err(KeychainError::NotPrivate)
        ));
        assert!(matches!(
            keychain.get_signing_private_key(0, &[]),
            Err(KeychainError::NotPrivate)
        ));

        // same public keys as the private vector-1 master
        let private = root("vector1", SEED_1);
        assert_eq!(keychain.hash(), private.hash());
        assert_eq!(
            keychain.get_signing_public_key(3, &[1]).unwrap(),
            private.get_signing_public_key(3, &[1]).unwrap()
        );
    }

    #[test]
    fn test_signing_keys_match_along_path() {
        let keychain = Keychain::new("k", &[9u8; 32]).unwrap();
        let secp = Secp256k1::new();

        let secret = keychain.get_signing_private_key(4, &[2, 3]).unwrap();
        let public = keychain.get_signing_public_key(4, &[2, 3]).unwrap();
        assert_eq!(PublicKey::from_secret_key(&secp, &secret), public);

        let via_children = keychain.child(2, false).unwrap().child(3, false).unwrap();
        assert_eq!(via_children.get_signing_public_key(4, &[]).unwrap(), public);
    }

    #[test]
    fn test_testnet_extkey_prefix() {
        let keychain = root("vector1", SEED_1);
        assert!(keychain.extkey(false, NetworkKind::Test).unwrap().starts_with("tpub"));
        assert!(keychain.extkey(true, NetworkKind::Test).unwrap().starts_with("tprv"));
    }

    #[test]
    fn test_registry_links_parent_and_children() {
        let mut keychains = Keychains::new();
        let root_id = keychains.insert(Keychain::new("root", &[1u8; 32]).unwrap());
        let child_id = keychains.derive(root_id, 0, true, "child").unwrap();
        let grandchild_id = keychains.derive(child_id, 1, false, "grandchild").unwrap();

        assert_eq!(keychains.get(root_id).unwrap().children(), &[child_id]);
        assert_eq!(keychains.get(grandchild_id).unwrap().parent(), Some(child_id));
        assert_eq!(keychains.id_of("grandchild"), Some(grandchild_id));

        let grandchild = keychains.get(grandchild_id).unwrap();
        assert_eq!(keychains.root_id(grandchild).unwrap(), root_id);

        // an unregistered derived node still resolves through its parent
        let transient = grandchild.child(7, false).unwrap();
        assert_eq!(keychains.root_id(&transient).unwrap(), root_id);

        assert!(matches!(
            keychains.derive(root_id, 2, true, "@reserved"),
            Err(KeychainError::InvalidName(_))
        ));
    }
}
