//! Proof-of-Possession Cryptography
//!
//! The handshake's asymmetric primitive: the client performs its private-key
//! operation over a plaintext only the server can predict, and the server
//! recovers that plaintext with the bare public operation and compares
//! byte-exact. Recovery (rather than a verify-only signature scheme) is what
//! makes the diagnostic field-by-field mismatch breakdown possible.
//!
//! Key material arrives as X.509 `SubjectPublicKeyInfo` DER. Nonces come
//! from the OS CSPRNG; a momentarily unavailable random source is surfaced
//! as an error for that connection, never a process crash.

use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPublicKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::NONCE_LEN;

/// Minimum padding bytes in a recovered proof block (PKCS#1 v1.5).
const MIN_PAD_LEN: usize = 8;

/// Cryptographic failures during the handshake.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Submitted key material did not parse as an RSA public key.
    #[error("invalid public key: {0}")]
    InvalidKey(String),

    /// Ciphertext length does not match the key's modulus size.
    #[error("ciphertext length {actual} does not match key size {expected}")]
    CiphertextLength {
        /// Modulus size in bytes.
        expected: usize,
        /// Submitted ciphertext length.
        actual: usize,
    },

    /// Ciphertext value is not below the modulus.
    #[error("ciphertext out of range for key")]
    OutOfRange,

    /// Recovered block does not carry valid proof padding.
    #[error("invalid proof padding")]
    BadPadding,

    /// The OS random source was unavailable.
    #[error("secure random source unavailable: {0}")]
    RngUnavailable(String),
}

/// Parse X.509 (`SubjectPublicKeyInfo`) DER into an RSA public key.
pub fn parse_public_key(der: &[u8]) -> Result<RsaPublicKey, CryptoError> {
    RsaPublicKey::from_public_key_der(der).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

/// SHA-256 fingerprint of submitted key material, used as the stable
/// identity of an enhanced-protocol client.
pub fn key_fingerprint(der: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"netwarden-client-key:");
    hasher.update(der);
    let digest = hasher.finalize();

    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Generate a fresh challenge nonce from the OS CSPRNG.
pub fn generate_nonce() -> Result<[u8; NONCE_LEN], CryptoError> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng
        .try_fill_bytes(&mut nonce)
        .map_err(|e| CryptoError::RngUnavailable(e.to_string()))?;
    Ok(nonce)
}

/// Recover the proof plaintext from a client ciphertext.
///
/// Applies the raw RSA public operation (`c^e mod n`) and strips a PKCS#1
/// v1.5 block-type-1 envelope: `00 01 FF..FF 00 | message`, requiring at
/// least [`MIN_PAD_LEN`] padding bytes. Only the holder of the matching
/// private key can produce a ciphertext that survives this.
pub fn recover_proof(key: &RsaPublicKey, cipher: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let k = key.size();
    if cipher.len() != k {
        return Err(CryptoError::CiphertextLength {
            expected: k,
            actual: cipher.len(),
        });
    }

    let c = BigUint::from_bytes_be(cipher);
    if &c >= key.n() {
        return Err(CryptoError::OutOfRange);
    }

    let m = c.modpow(key.e(), key.n());
    let em = m.to_bytes_be();
    if em.len() > k {
        return Err(CryptoError::BadPadding);
    }

    // Left-pad to the modulus size; leading zeros are dropped by the
    // big-integer conversion.
    let mut block = vec![0u8; k];
    block[k - em.len()..].copy_from_slice(&em);

    if block[0] != 0x00 || block[1] != 0x01 {
        return Err(CryptoError::BadPadding);
    }

    let mut i = 2;
    while i < block.len() && block[i] == 0xff {
        i += 1;
    }
    if i < 2 + MIN_PAD_LEN || i >= block.len() || block[i] != 0x00 {
        return Err(CryptoError::BadPadding);
    }

    Ok(block[i + 1..].to_vec())
}

#[cfg(test)]
pub(crate) mod testing {
    //! Client-side emulation for the test suite: the private-key operation
    //! a real enhanced client performs over the expected plaintext.

    use rsa::traits::PrivateKeyParts;
    use rsa::RsaPrivateKey;

    use super::*;

    /// Generate a test keypair. 1024-bit keys keep the suite fast; key
    /// strength is not under test.
    pub fn test_keypair() -> RsaPrivateKey {
        RsaPrivateKey::new(&mut OsRng, 1024).expect("test keypair generation")
    }

    /// Apply the client's private-key operation with block-type-1 padding.
    pub fn sign_proof(key: &RsaPrivateKey, msg: &[u8]) -> Vec<u8> {
        let k = key.size();
        assert!(msg.len() <= k - 3 - MIN_PAD_LEN, "message too long for test key");

        let mut block = vec![0xffu8; k];
        block[0] = 0x00;
        block[1] = 0x01;
        let sep = k - msg.len() - 1;
        block[sep] = 0x00;
        block[sep + 1..].copy_from_slice(msg);

        let m = BigUint::from_bytes_be(&block);
        let c = m.modpow(key.d(), key.n());
        let raw = c.to_bytes_be();

        let mut out = vec![0u8; k];
        out[k - raw.len()..].copy_from_slice(&raw);
        out
    }
}
