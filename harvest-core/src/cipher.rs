//! Blockwise RSA-OAEP body encryption.
//!
//! RSA-OAEP/SHA-256 with an empty label, applied block by block: the
//! plaintext is split into chunks of `modulus − 2·hash − 2` bytes on the
//! encrypting side, and the ciphertext into chunks of exactly the modulus
//! size on the decrypting side. Keys travel as PEM, PKCS#1 for the private
//! key and SPKI for the public one.

use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::error::{HarvestError, Result};

/// Load a PKCS#1 PEM private key from disk.
pub async fn load_private_key(path: &Path) -> Result<RsaPrivateKey> {
    let pem = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| HarvestError::Io { path: path.to_path_buf(), source })?;
    RsaPrivateKey::from_pkcs1_pem(&pem).map_err(|e| HarvestError::Cipher(e.to_string()))
}

/// Load an SPKI PEM public key from disk.
pub async fn load_public_key(path: &Path) -> Result<RsaPublicKey> {
    let pem = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| HarvestError::Io { path: path.to_path_buf(), source })?;
    RsaPublicKey::from_public_key_pem(&pem).map_err(|e| HarvestError::Cipher(e.to_string()))
}

/// Encrypt `msg` block by block under `public`.
pub fn encrypt(public: &RsaPublicKey, msg: &[u8]) -> Result<Vec<u8>> {
    let step = public.size() - 2 * Sha256::output_size() - 2;
    let mut rng = rand::thread_rng();
    let mut out = Vec::with_capacity(msg.len() + public.size());

    for chunk in msg.chunks(step) {
        let block = public
            .encrypt(&mut rng, Oaep::new::<Sha256>(), chunk)
            .map_err(|e| HarvestError::Cipher(e.to_string()))?;
        out.extend_from_slice(&block);
    }

    Ok(out)
}

/// Decrypt `msg` block by block under `private`. The ciphertext length must
/// be a whole number of modulus-sized blocks.
pub fn decrypt(private: &RsaPrivateKey, msg: &[u8]) -> Result<Vec<u8>> {
    let step = private.size();
    let mut out = Vec::with_capacity(msg.len());

    for chunk in msg.chunks(step) {
        let block = private
            .decrypt(Oaep::new::<Sha256>(), chunk)
            .map_err(|e| HarvestError::Cipher(e.to_string()))?;
        out.extend_from_slice(&block);
    }

    Ok(out)
}

/// Generate a fresh keypair and return it as `(public_pem, private_pem)`.
pub fn generate_keypair(bits: usize) -> Result<(String, String)> {
    let mut rng = rand::thread_rng();
    let private =
        RsaPrivateKey::new(&mut rng, bits).map_err(|e| HarvestError::Cipher(e.to_string()))?;

    let public_pem = RsaPublicKey::from(&private)
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| HarvestError::Cipher(e.to_string()))?;
    let private_pem = private
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| HarvestError::Cipher(e.to_string()))?
        .to_string();

    Ok((public_pem, private_pem))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> (RsaPublicKey, RsaPrivateKey) {
        let (public_pem, private_pem) = generate_keypair(2048).unwrap();
        let public = RsaPublicKey::from_public_key_pem(&public_pem).unwrap();
        let private = RsaPrivateKey::from_pkcs1_pem(&private_pem).unwrap();
        (public, private)
    }

    #[test]
    fn round_trip_short() {
        let (public, private) = keypair();
        let msg = b"hello metrics";
        let sealed = encrypt(&public, msg).unwrap();
        assert_eq!(decrypt(&private, &sealed).unwrap(), msg);
    }

    #[test]
    fn round_trip_multi_block() {
        let (public, private) = keypair();
        // Longer than one OAEP chunk for a 2048-bit key (256 − 64 − 2 = 190).
        let msg: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let sealed = encrypt(&public, &msg).unwrap();
        assert!(sealed.len() > 256);
        assert_eq!(sealed.len() % 256, 0);
        assert_eq!(decrypt(&private, &sealed).unwrap(), msg);
    }

    #[test]
    fn rejects_wrong_key() {
        let (public, _) = keypair();
        let (_, other_private) = keypair();
        let sealed = encrypt(&public, b"payload").unwrap();
        assert!(decrypt(&other_private, &sealed).is_err());
    }
}
