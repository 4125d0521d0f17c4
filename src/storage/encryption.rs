//! Page-level encryption: AES-256-GCM with an Argon2id password KDF.
//!
//! Encrypted files begin with a fixed prelude holding the plaintext page
//! size, the KDF parameters, and a key verifier, so `open` can reject a wrong
//! password before touching anything else on disk.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use zeroize::Zeroizing;

use crate::config::{EncryptionOptions, KdfParams};
use crate::errors::{DbError, DbResult};

pub const ENC_MAGIC: &[u8; 4] = b"QDBE";
pub const ENC_PRELUDE_LEN: usize = 128;
pub const ENC_FORMAT_VERSION: u8 = 1;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Bytes of each stored page consumed by the nonce and the GCM tag.
pub const PAGE_CRYPTO_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

fn derive_key(password: &str, salt: &[u8], params: &KdfParams) -> DbResult<Zeroizing<[u8; 32]>> {
    use argon2::{Algorithm, Argon2, Params, Version};
    let p = Params::new(params.m_cost_kib, params.t_cost, params.lanes, Some(32))
        .map_err(|e| DbError::Io(std::io::Error::other(format!("argon2 params: {e}"))))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, p);
    let mut out: Zeroizing<[u8; 32]> = Zeroizing::new([0u8; 32]);
    argon
        .hash_password_into(password.as_bytes(), salt, &mut *out)
        .map_err(|e| DbError::Io(std::io::Error::other(format!("argon2: {e}"))))?;
    Ok(out)
}

fn verifier_of(key: &[u8; 32]) -> [u8; 32] {
    use sha2::Digest;
    let mut h: sha2::Sha256 = Default::default();
    h.update(b"quilldb-key-verifier");
    h.update(key);
    let r = h.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&r);
    out
}

pub struct PageCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for PageCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCipher").finish_non_exhaustive()
    }
}

impl PageCipher {
    /// Derives a fresh cipher and builds the file prelude for a new database.
    ///
    /// # Errors
    /// Returns an error when the KDF parameters are rejected or entropy is
    /// unavailable.
    pub fn create(opts: &EncryptionOptions, page_size: u32) -> DbResult<(Self, Vec<u8>)> {
        let mut salt = [0u8; 16];
        getrandom::fill(&mut salt)
            .map_err(|e| DbError::Io(std::io::Error::other(format!("entropy: {e}"))))?;
        let key = derive_key(&opts.password, &salt, &opts.kdf)?;
        let verifier = verifier_of(&key);

        let mut prelude = vec![0u8; ENC_PRELUDE_LEN];
        prelude[0..4].copy_from_slice(ENC_MAGIC);
        prelude[4] = ENC_FORMAT_VERSION;
        prelude[8..12].copy_from_slice(&page_size.to_le_bytes());
        prelude[12..28].copy_from_slice(&salt);
        prelude[28..32].copy_from_slice(&opts.kdf.t_cost.to_le_bytes());
        prelude[32..36].copy_from_slice(&opts.kdf.m_cost_kib.to_le_bytes());
        prelude[36..40].copy_from_slice(&opts.kdf.lanes.to_le_bytes());
        prelude[40..72].copy_from_slice(&verifier);

        let cipher = Aes256Gcm::new_from_slice(&*key)
            .map_err(|e| DbError::Io(std::io::Error::other(format!("aes key: {e}"))))?;
        Ok((Self { cipher }, prelude))
    }

    /// Re-derives the cipher from an existing prelude, verifying the
    /// password against the stored key verifier.
    ///
    /// # Errors
    /// `InvalidPassword` when the verifier does not match,
    /// `EncryptionMismatch`/`UnsupportedVersion` for malformed preludes.
    pub fn open(opts: &EncryptionOptions, prelude: &[u8]) -> DbResult<(Self, u32)> {
        if prelude.len() < ENC_PRELUDE_LEN || &prelude[0..4] != ENC_MAGIC {
            return Err(DbError::EncryptionMismatch("missing encryption prelude".into()));
        }
        if prelude[4] != ENC_FORMAT_VERSION {
            return Err(DbError::UnsupportedVersion(u32::from(prelude[4])));
        }
        let page_size = u32::from_le_bytes(prelude[8..12].try_into().expect("4 bytes"));
        let salt = &prelude[12..28];
        let kdf = KdfParams {
            t_cost: u32::from_le_bytes(prelude[28..32].try_into().expect("4 bytes")),
            m_cost_kib: u32::from_le_bytes(prelude[32..36].try_into().expect("4 bytes")),
            lanes: u32::from_le_bytes(prelude[36..40].try_into().expect("4 bytes")),
        };
        let key = derive_key(&opts.password, salt, &kdf)?;
        if verifier_of(&key) != prelude[40..72] {
            return Err(DbError::InvalidPassword);
        }
        let cipher = Aes256Gcm::new_from_slice(&*key)
            .map_err(|e| DbError::Io(std::io::Error::other(format!("aes key: {e}"))))?;
        Ok((Self { cipher }, page_size))
    }

    /// Reads the stored page size without deriving a key.
    ///
    /// # Errors
    /// Returns `EncryptionMismatch` if the prelude is not an encryption
    /// prelude.
    pub fn read_page_size(prelude: &[u8]) -> DbResult<u32> {
        if prelude.len() < 12 || &prelude[0..4] != ENC_MAGIC {
            return Err(DbError::EncryptionMismatch("missing encryption prelude".into()));
        }
        Ok(u32::from_le_bytes(prelude[8..12].try_into().expect("4 bytes")))
    }

    /// Seals a logical page into its stored form: `nonce ‖ ciphertext ‖ tag`.
    ///
    /// # Errors
    /// Returns an error when entropy is unavailable or encryption fails.
    pub fn seal(&self, plain: &[u8], out: &mut [u8]) -> DbResult<()> {
        debug_assert_eq!(out.len(), plain.len() + PAGE_CRYPTO_OVERHEAD);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        getrandom::fill(&mut nonce_bytes)
            .map_err(|e| DbError::Io(std::io::Error::other(format!("entropy: {e}"))))?;
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ct = self
            .cipher
            .encrypt(nonce, plain)
            .map_err(|e| DbError::Io(std::io::Error::other(format!("encrypt: {e}"))))?;
        out[0..NONCE_LEN].copy_from_slice(&nonce_bytes);
        out[NONCE_LEN..].copy_from_slice(&ct);
        Ok(())
    }

    /// Opens a stored page back into its logical form.
    ///
    /// # Errors
    /// `ChecksumMismatch` when the tag fails to authenticate (corruption or
    /// foreign key material).
    pub fn unseal(&self, stored: &[u8], out: &mut [u8]) -> DbResult<()> {
        debug_assert_eq!(stored.len(), out.len() + PAGE_CRYPTO_OVERHEAD);
        let nonce = Nonce::from_slice(&stored[0..NONCE_LEN]);
        let plain = self
            .cipher
            .decrypt(nonce, &stored[NONCE_LEN..])
            .map_err(|_| DbError::ChecksumMismatch("page authentication failed".into()))?;
        out.copy_from_slice(&plain);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_opts(password: &str) -> EncryptionOptions {
        EncryptionOptions {
            password: password.into(),
            kdf: KdfParams { t_cost: 1, m_cost_kib: 8, lanes: 1 },
        }
    }

    #[test]
    fn seal_unseal_round_trip() {
        let (cipher, _prelude) = PageCipher::create(&fast_opts("hunter2"), 4096).unwrap();
        let plain = vec![7u8; 4096 - PAGE_CRYPTO_OVERHEAD];
        let mut stored = vec![0u8; 4096];
        cipher.seal(&plain, &mut stored).unwrap();
        let mut back = vec![0u8; plain.len()];
        cipher.unseal(&stored, &mut back).unwrap();
        assert_eq!(plain, back);
    }

    #[test]
    fn wrong_password_is_rejected_by_the_verifier() {
        let (_, prelude) = PageCipher::create(&fast_opts("right"), 4096).unwrap();
        let err = PageCipher::open(&fast_opts("wrong"), &prelude).unwrap_err();
        assert!(matches!(err, DbError::InvalidPassword));
    }

    #[test]
    fn prelude_carries_page_size() {
        let (_, prelude) = PageCipher::create(&fast_opts("pw"), 8192).unwrap();
        assert_eq!(PageCipher::read_page_size(&prelude).unwrap(), 8192);
    }
}
