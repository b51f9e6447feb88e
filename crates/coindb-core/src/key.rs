//! Single derived signing keys

use crate::ids::{KeyId, KeychainId};
use crate::keychain::{KeychainError, Keychain, Keychains};
use bitcoin::secp256k1::{PublicKey, SecretKey};

/// One leaf key of a signing script.
///
/// The public key is fixed at construction. The private key is never held:
/// [`Key::privkey`] re-derives it through the root keychain on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    id: Option<KeyId>,
    root_keychain: KeychainId,
    derivation_path: Vec<u32>,
    index: u32,
    pubkey: PublicKey,
    is_private: bool,
}

impl Key {
    /// Snapshot the key at `index` under `keychain`.
    ///
    /// `keychain` may be transient (a bin keychain), but its ancestors must be
    /// registered in `keychains`.
    pub fn new(keychains: &Keychains, keychain: &Keychain, index: u32) -> Result<Self, KeychainError> {
        let root = keychains.root(keychain)?;
        let root_keychain = root.id().ok_or(KeychainError::Unregistered)?;
        let pubkey = keychain.get_signing_public_key(index, &[])?;
        Ok(Self {
            id: None,
            root_keychain,
            derivation_path: keychain.derivation_path().to_vec(),
            index,
            pubkey,
            is_private: root.is_private(),
        })
    }

    pub(crate) fn from_parts(
        id: Option<KeyId>,
        root_keychain: KeychainId,
        derivation_path: Vec<u32>,
        index: u32,
        pubkey: PublicKey,
        is_private: bool,
    ) -> Self {
        Self {
            id,
            root_keychain,
            derivation_path,
            index,
            pubkey,
            is_private,
        }
    }

    pub(crate) fn set_id(&mut self, id: KeyId) {
        self.id = Some(id);
    }

    pub fn id(&self) -> Option<KeyId> {
        self.id
    }

    pub fn root_keychain(&self) -> KeychainId {
        self.root_keychain
    }

    pub fn derivation_path(&self) -> &[u32] {
        &self.derivation_path
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn pubkey(&self) -> &PublicKey {
        &self.pubkey
    }

    pub fn is_private(&self) -> bool {
        self.is_private
    }

    /// Re-derive the private key through the root keychain.
    pub fn privkey(&self, keychains: &Keychains) -> Result<SecretKey, KeychainError> {
        let root = keychains
            .get(self.root_keychain)
            .ok_or(KeychainError::UnknownKeychain(self.root_keychain))?;
        root.get_signing_private_key(self.index, &self.derivation_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_cipher;
    use bitcoin::secp256k1::Secp256k1;
    use std::str::FromStr;

    #[test]
    fn test_private_key_rederived_through_root() {
        let mut keychains = Keychains::new();
        let root_id = keychains.insert(Keychain::new("root", &[11u8; 32]).unwrap());
        let bin_keychain = keychains.get(root_id).unwrap().child(2, false).unwrap();

        let key = Key::new(&keychains, &bin_keychain, 5).unwrap();
        assert_eq!(key.root_keychain(), root_id);
        assert_eq!(key.derivation_path(), &[2]);
        assert_eq!(key.index(), 5);
        assert!(!bin_keychain.is_private());
        assert!(key.is_private());

        let secret = key.privkey(&keychains).unwrap();
        assert_eq!(
            PublicKey::from_secret_key(&Secp256k1::new(), &secret),
            *key.pubkey()
        );
    }

    #[test]
    fn test_public_root_gives_public_key() {
        let mut keychains = Keychains::new();
        let private = Keychain::new("seed", &[14u8; 32]).unwrap();
        let xpub = bitcoin::bip32::Xpub::from_str(&private.extkey(false, bitcoin::NetworkKind::Main).unwrap()).unwrap();
        let root_id = keychains.insert(Keychain::from_xpub("cosigner", &xpub).unwrap());
        let bin_keychain = keychains.get(root_id).unwrap().child(2, false).unwrap();

        let key = Key::new(&keychains, &bin_keychain, 0).unwrap();
        assert_eq!(key.root_keychain(), root_id);
        assert!(!key.is_private());
        assert!(matches!(key.privkey(&keychains), Err(KeychainError::NotPrivate)));
    }

    #[test]
    fn test_private_key_fails_while_root_locked() {
        let cipher = test_cipher();
        let mut keychains = Keychains::new();
        let root_id = keychains.insert(Keychain::new("root", &[12u8; 32]).unwrap());
        let bin_keychain = keychains.get(root_id).unwrap().child(1, false).unwrap();
        let key = Key::new(&keychains, &bin_keychain, 0).unwrap();

        let root = keychains.get_mut(root_id).unwrap();
        root.set_lock_key(&cipher, b"pw").unwrap();
        root.lock_private_key();
        assert!(matches!(
            key.privkey(&keychains),
            Err(KeychainError::PrivateKeyLocked)
        ));

        // pubkey needs nothing from the root
        assert_eq!(key.pubkey(), &bin_keychain.get_signing_public_key(0, &[]).unwrap());
    }

    #[test]
    fn test_unregistered_root_rejected() {
        let keychains = Keychains::new();
        let orphan = Keychain::new("orphan", &[13u8; 32]).unwrap();
        assert!(matches!(
            Key::new(&keychains, &orphan, 0),
            Err(KeychainError::Unregistered)
        ));
    }
}
