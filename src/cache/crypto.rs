use crate::errors::{AppError, AppResult};
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::{Digest, Sha256};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const SALT_LEN: usize = 16;
const KEY_LEN: usize = 32;
const PBKDF2_ROUNDS: u32 = 100_000;
const DIGEST_LEN: usize = 32;

/// Derives the at-rest encryption key for one folder's cache files.
///
/// The same 16-byte salt doubles as the CBC initialization vector, matching
/// the on-disk envelope `salt(16) || ciphertext || sha256(plaintext)` that
/// has room for exactly one 16-byte value per blob.
fn derive_key(password: &str, salt: &[u8; SALT_LEN]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    key
}

/// Seals `plaintext` under `password`, generating a fresh random salt.
/// Returns `salt || ciphertext || sha256(plaintext)`.
pub fn seal(password: &str, plaintext: &[u8]) -> Vec<u8> {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let key = derive_key(password, &salt);

    let digest = Sha256::digest(plaintext);
    let ciphertext =
        Aes256CbcEnc::new(&key.into(), &salt.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut out = Vec::with_capacity(SALT_LEN + ciphertext.len() + DIGEST_LEN);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&ciphertext);
    out.extend_from_slice(&digest);
    out
}

/// Opens an envelope produced by [`seal`]. Any malformed envelope, wrong
/// password, or integrity mismatch is reported as a cache error; callers
/// treat that uniformly as a cache miss per the failure semantics in the
/// cache store's contract.
pub fn open(password: &str, envelope: &[u8]) -> AppResult<Vec<u8>> {
    if envelope.len() < SALT_LEN + DIGEST_LEN {
        return Err(AppError::Cache("encrypted envelope too short".into()));
    }
    let (salt, rest) = envelope.split_at(SALT_LEN);
    let (ciphertext, digest) = rest.split_at(rest.len() - DIGEST_LEN);
    let salt: [u8; SALT_LEN] = salt.try_into().expect("split_at guarantees length");
    let key = derive_key(password, &salt);

    let plaintext = Aes256CbcDec::new(&key.into(), &salt.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|e| AppError::Cache(format!("decrypt failed: {e}")))?;

    if Sha256::digest(&plaintext).as_slice() != digest {
        return Err(AppError::Cache("integrity check failed".into()));
    }
    Ok(plaintext)
}

/// SHA-256 of a folder name, used as the directory basename under `cache/`.
pub fn folder_hash(folder: &str) -> String {
    hex::encode(Sha256::digest(folder.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_with_correct_password() {
        let sealed = seal("hunter2", b"hello folder cache");
        let opened = open("hunter2", &sealed).unwrap();
        assert_eq!(opened, b"hello folder cache");
    }

    #[test]
    fn wrong_password_fails() {
        let sealed = seal("hunter2", b"hello folder cache");
        assert!(open("not-it", &sealed).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails_integrity_check() {
        let mut sealed = seal("hunter2", b"hello folder cache");
        let mid = sealed.len() / 2;
        sealed[mid] ^= 0xFF;
        assert!(open("hunter2", &sealed).is_err());
    }

    #[test]
    fn folder_hash_is_stable_and_distinguishing() {
        let a = folder_hash("INBOX");
        assert_eq!(a.len(), 64);
        assert_eq!(a, folder_hash("INBOX"));
        assert_ne!(a, folder_hash("Trash"));
    }
}
