//! Encryption configuration.
//!
//! The repository passphrase is stretched into a 256-bit key once per
//! backup; workers share the resulting config by reference.

use anyhow::{bail, Error};
use openssl::hash::MessageDigest;
use openssl::pkcs5::pbkdf2_hmac;
use openssl::symm::{Cipher, Crypter, Mode};

use crate::config::CipherType;

const KEY_DERIVATION_ROUNDS: usize = 10000;
const KEY_DERIVATION_SALT: &[u8] = b"pgbackup-repo-cipher";

pub struct CryptConfig {
    cipher: Cipher,
    enc_key: [u8; 32],
}

impl CryptConfig {
    pub fn new(cipher_type: CipherType, passphrase: &str) -> Result<Self, Error> {
        let cipher = match cipher_type {
            CipherType::Aes256Cbc => Cipher::aes_256_cbc(),
            CipherType::None => bail!("cannot build a crypt config without a cipher"),
        };

        let mut enc_key = [0u8; 32];
        pbkdf2_hmac(
            passphrase.as_bytes(),
            KEY_DERIVATION_SALT,
            KEY_DERIVATION_ROUNDS,
            MessageDigest::sha256(),
            &mut enc_key,
        )?;

        Ok(Self { cipher, enc_key })
    }

    pub fn cipher(&self) -> &Cipher {
        &self.cipher
    }

    pub fn data_crypter(&self, iv: &[u8; 16], mode: Mode) -> Result<Crypter, Error> {
        let crypter = Crypter::new(self.cipher, mode, &self.enc_key, Some(iv))?;
        Ok(crypter)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_key_derivation_is_deterministic() -> Result<(), Error> {
        let a = CryptConfig::new(CipherType::Aes256Cbc, "secret")?;
        let b = CryptConfig::new(CipherType::Aes256Cbc, "secret")?;
        let c = CryptConfig::new(CipherType::Aes256Cbc, "other")?;
        assert_eq!(a.enc_key, b.enc_key);
        assert_ne!(a.enc_key, c.enc_key);
        Ok(())
    }

    #[test]
    fn test_no_cipher_is_rejected() {
        assert!(CryptConfig::new(CipherType::None, "secret").is_err());
    }
}
