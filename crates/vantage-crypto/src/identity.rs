//! Platform identity keypair.
//!
//! Each deployment has a long-lived Ed25519 signing keypair whose seed is
//! persisted PEM-wrapped in the data directory. The signing key itself is
//! not used to sign agent credentials; it anchors the public fingerprint
//! and leaves room for a later migration to post-quantum signatures
//! without reissuing identities. Credentials are signed with a 64-byte
//! symmetric key derived from the seed via HKDF-SHA-512.

use std::path::{Path, PathBuf};

use ed25519_dalek::{SigningKey, VerifyingKey};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroize;

use crate::error::CryptoError;

/// HKDF salt for credential-key derivation.
const HKDF_SALT: &[u8] = b"rmm-credential-v1";

/// HKDF info string for credential-key derivation.
const HKDF_INFO: &[u8] = b"agent-authentication";

/// File name of the persisted identity seed inside the data directory.
const KEY_FILE: &str = "platform.key";

/// PEM tag wrapping the 32-byte seed.
const PEM_TAG: &str = "PRIVATE KEY";

/// The server's identity: Ed25519 keypair plus the derived symmetric key
/// used for HMAC credential signing.
pub struct Platform {
    verifying_key: VerifyingKey,
    signing_key: SigningKey,
    pub(crate) cred_key: [u8; 64],
}

impl std::fmt::Debug for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform")
            .field("fingerprint", &self.fingerprint())
            .field("signing_key", &"[REDACTED]")
            .field("cred_key", &"[REDACTED]")
            .finish()
    }
}

impl Drop for Platform {
    fn drop(&mut self) {
        self.cred_key.zeroize();
    }
}

impl Platform {
    /// Load the identity seed from `<data_dir>/platform.key`, or generate
    /// and persist a fresh one on first start.
    pub fn load_or_generate(data_dir: &Path) -> Result<Self, CryptoError> {
        let path = data_dir.join(KEY_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            let platform = Self::generate();
            platform.save(&path)?;
            Ok(platform)
        }
    }

    /// Generate a new random identity (not persisted).
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        let platform = Self::from_seed(seed);
        seed.zeroize();
        platform
    }

    /// Reconstruct the identity from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&seed);
        let verifying_key = signing_key.verifying_key();

        // Derive a separate symmetric key for HMAC credential signing.
        let hk = Hkdf::<Sha512>::new(Some(HKDF_SALT), &seed);
        let mut cred_key = [0u8; 64];
        // A 64-byte output cannot exceed the HKDF-SHA-512 expand limit.
        hk.expand(HKDF_INFO, &mut cred_key)
            .unwrap_or_else(|_| unreachable!("64 bytes is within HKDF-SHA-512 output bounds"));

        Self {
            verifying_key,
            signing_key,
            cred_key,
        }
    }

    /// SHA-256 hex fingerprint of the public key. Uniquely identifies the
    /// deployment; agents pin it at enrollment.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.verifying_key.as_bytes()))
    }

    fn load(path: &Path) -> Result<Self, CryptoError> {
        check_owner_only(path)?;

        let data = std::fs::read(path)?;
        let block = pem::parse(&data)
            .map_err(|e| CryptoError::InvalidKeyFile(e.to_string()))?;
        if block.tag() != PEM_TAG {
            return Err(CryptoError::InvalidKeyFile(format!(
                "unexpected PEM tag: {}",
                block.tag()
            )));
        }

        let contents = block.contents();
        if contents.len() != 32 {
            return Err(CryptoError::InvalidKeyFile(format!(
                "seed is {} bytes, expected 32",
                contents.len()
            )));
        }

        let mut seed = [0u8; 32];
        seed.copy_from_slice(contents);
        let platform = Self::from_seed(seed);
        seed.zeroize();
        Ok(platform)
    }

    fn save(&self, path: &Path) -> Result<(), CryptoError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut seed = self.signing_key.to_bytes();
        let block = pem::Pem::new(PEM_TAG, seed.to_vec());
        std::fs::write(path, pem::encode(&block))?;
        seed.zeroize();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    /// Path of the key file inside a data directory.
    pub fn key_path(data_dir: &Path) -> PathBuf {
        data_dir.join(KEY_FILE)
    }
}

/// Refuse to read a key file readable by anyone but the owner.
#[cfg(unix)]
fn check_owner_only(path: &Path) -> Result<(), CryptoError> {
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::metadata(path)?.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(CryptoError::InsecureKeyPermissions { mode });
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_owner_only(_path: &Path) -> Result<(), CryptoError> {
    Ok(())
}
