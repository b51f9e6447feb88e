//! BIP-39 entropy for root keychains
//!
//! A root keychain is built from raw entropy. This module turns a mnemonic
//! (new or recovered) into the 64-byte seed fed to [`crate::Keychain::new`].

use bip39::{Language, Mnemonic};
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Error, Debug)]
pub enum SeedError {
    #[error("Invalid mnemonic: {0}")]
    InvalidMnemonic(String),
    #[error("Unsupported word count: {0}")]
    UnsupportedWordCount(usize),
}

/// Generate a new English mnemonic with 12, 15, 18, 21 or 24 words
pub fn generate_mnemonic(word_count: usize) -> Result<Mnemonic, SeedError> {
    if !matches!(word_count, 12 | 15 | 18 | 21 | 24) {
        return Err(SeedError::UnsupportedWordCount(word_count));
    }
    Mnemonic::generate_in(Language::English, word_count)
        .map_err(|e| SeedError::InvalidMnemonic(e.to_string()))
}

/// Parse a mnemonic from words
pub fn parse_mnemonic(words: &str) -> Result<Mnemonic, SeedError> {
    Mnemonic::parse_in(Language::English, words)
        .map_err(|e| SeedError::InvalidMnemonic(e.to_string()))
}

/// Derive seed bytes from mnemonic (with optional passphrase)
pub fn derive_seed(mnemonic: &Mnemonic, passphrase: &str) -> Zeroizing<[u8; 64]> {
    Zeroizing::new(mnemonic.to_seed(passphrase))
}
