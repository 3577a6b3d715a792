//! BIP-39 mnemonic handling
//!
//! Mnemonics exist only at first boot and during manual recovery; the
//! derived 64-byte seed is what the vault actually stores.

use bip39::Mnemonic;

use crate::error::CryptoError;
use crate::secret::SecretBuffer;
use crate::Result;

const VALID_WORD_COUNTS: [usize; 5] = [12, 15, 18, 21, 24];

/// Generate a fresh mnemonic with the requested word count.
pub fn generate_mnemonic(word_count: usize) -> Result<Mnemonic> {
    if !VALID_WORD_COUNTS.contains(&word_count) {
        return Err(CryptoError::MnemonicWordCount(word_count));
    }
    Mnemonic::generate(word_count).map_err(|e| CryptoError::Mnemonic(e.to_string()))
}

/// Parse and checksum-validate a phrase.
pub fn parse_mnemonic(phrase: &str) -> Result<Mnemonic> {
    Mnemonic::parse(phrase).map_err(|e| CryptoError::Mnemonic(e.to_string()))
}

/// Extract the 64-byte seed (empty passphrase, per the recovery contract).
pub fn mnemonic_to_seed(mnemonic: &Mnemonic) -> SecretBuffer {
    SecretBuffer::from_vec(mnemonic.to_seed("").to_vec())
}
