//! Local secret key storage, keyed by account, device and purpose.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;
use zeroize::Zeroizing;

use rg_crypto::ids::normalize_device_id;
use rg_crypto::keys::{EncryptionKeypair, SigningKeypair};

use crate::store::StoreError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Purpose {
    Signing,
    Encryption,
}

impl Purpose {
    fn file_suffix(self) -> &'static str {
        match self {
            Purpose::Signing => "sig.key",
            Purpose::Encryption => "enc.key",
        }
    }
}

/// Source of the local device's secret keys.
#[async_trait]
pub trait SecretKeyStore: Send + Sync {
    /// Load the signing keypair, generating and persisting one on first use.
    async fn get_or_create_signing_keypair(
        &self,
        account: &str,
        device_id: &str,
    ) -> Result<SigningKeypair, StoreError>;

    /// Load the encryption keypair, generating and persisting one on first use.
    async fn get_or_create_encryption_keypair(
        &self,
        account: &str,
        device_id: &str,
    ) -> Result<EncryptionKeypair, StoreError>;

    /// Forget both keypairs. The next `get_or_create_*` makes new ones.
    async fn reset_keys(&self, account: &str, device_id: &str) -> Result<(), StoreError>;
}

// ============================================================================
// In-Memory Implementation
// ============================================================================

type SlotKey = (String, String, Purpose);

#[derive(Default)]
pub struct InMemorySecretKeyStore {
    seeds: Mutex<HashMap<SlotKey, Zeroizing<[u8; 32]>>>,
}

impl InMemorySecretKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn seed(&self, account: &str, device_id: &str, purpose: Purpose) -> Zeroizing<[u8; 32]> {
        let slot = (account.to_string(), normalize_device_id(Some(device_id)), purpose);
        let mut seeds = self.seeds.lock().await;
        seeds
            .entry(slot)
            .or_insert_with(|| match purpose {
                Purpose::Signing => SigningKeypair::generate().seed(),
                Purpose::Encryption => EncryptionKeypair::generate().secret_bytes(),
            })
            .clone()
    }
}

#[async_trait]
impl SecretKeyStore for InMemorySecretKeyStore {
    async fn get_or_create_signing_keypair(
        &self,
        account: &str,
        device_id: &str,
    ) -> Result<SigningKeypair, StoreError> {
        let seed = self.seed(account, device_id, Purpose::Signing).await;
        Ok(SigningKeypair::from_seed(&seed))
    }

    async fn get_or_create_encryption_keypair(
        &self,
        account: &str,
        device_id: &str,
    ) -> Result<EncryptionKeypair, StoreError> {
        let seed = self.seed(account, device_id, Purpose::Encryption).await;
        Ok(EncryptionKeypair::from_secret_bytes(&seed))
    }

    async fn reset_keys(&self, account: &str, device_id: &str) -> Result<(), StoreError> {
        let device = normalize_device_id(Some(device_id));
        self.seeds
            .lock()
            .await
            .retain(|(a, d, _), _| !(a == account && *d == device));
        Ok(())
    }
}

// ============================================================================
// File Implementation
// ============================================================================

/// Hex-encoded 32-byte secrets at `<dir>/<account>/<device>.{sig,enc}.key`.
pub struct FileSecretKeyStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl FileSecretKeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    fn path_for(&self, account: &str, device_id: &str, purpose: Purpose) -> Result<PathBuf, StoreError> {
        let device = normalize_device_id(Some(device_id));
        check_component(account)?;
        check_component(&device)?;
        Ok(self
            .dir
            .join(account)
            .join(format!("{}.{}", device, purpose.file_suffix())))
    }

    async fn load_or_create(
        &self,
        account: &str,
        device_id: &str,
        purpose: Purpose,
    ) -> Result<Zeroizing<[u8; 32]>, StoreError> {
        let path = self.path_for(account, device_id, purpose)?;
        let _guard = self.lock.lock().await;
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => decode_secret(&path, &Zeroizing::new(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let seed = match purpose {
                    Purpose::Signing => SigningKeypair::generate().seed(),
                    Purpose::Encryption => EncryptionKeypair::generate().secret_bytes(),
                };
                write_secret(&path, &seed).await?;
                info!(account, device = device_id, ?purpose, "generated new device key");
                Ok(seed)
            }
            Err(e) => Err(StoreError::OperationFailed(format!("{}: {}", path.display(), e))),
        }
    }
}

#[async_trait]
impl SecretKeyStore for FileSecretKeyStore {
    async fn get_or_create_signing_keypair(
        &self,
        account: &str,
        device_id: &str,
    ) -> Result<SigningKeypair, StoreError> {
        let seed = self.load_or_create(account, device_id, Purpose::Signing).await?;
        Ok(SigningKeypair::from_seed(&seed))
    }

    async fn get_or_create_encryption_keypair(
        &self,
        account: &str,
        device_id: &str,
    ) -> Result<EncryptionKeypair, StoreError> {
        let seed = self.load_or_create(account, device_id, Purpose::Encryption).await?;
        Ok(EncryptionKeypair::from_secret_bytes(&seed))
    }

    async fn reset_keys(&self, account: &str, device_id: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        for purpose in [Purpose::Signing, Purpose::Encryption] {
            let path = self.path_for(account, device_id, purpose)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(StoreError::OperationFailed(format!("{}: {}", path.display(), e)))
                }
            }
        }
        info!(account, device = device_id, "device keys reset");
        Ok(())
    }
}

fn check_component(name: &str) -> Result<(), StoreError> {
    let ok = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0']);
    if ok {
        Ok(())
    } else {
        Err(StoreError::OperationFailed(format!("invalid path component: {:?}", name)))
    }
}

fn decode_secret(path: &Path, text: &str) -> Result<Zeroizing<[u8; 32]>, StoreError> {
    let bytes = Zeroizing::new(
        hex::decode(text.trim())
            .map_err(|e| StoreError::DataCorruption(format!("{}: {}", path.display(), e)))?,
    );
    let mut out = Zeroizing::new([0u8; 32]);
    if bytes.len() != out.len() {
        return Err(StoreError::DataCorruption(format!(
            "{}: expected 32 bytes, found {}",
            path.display(),
            bytes.len()
        )));
    }
    out.copy_from_slice(&bytes);
    Ok(out)
}

async fn write_secret(path: &Path, seed: &[u8; 32]) -> Result<(), StoreError> {
    let io_err = |e: std::io::Error| StoreError::OperationFailed(format!("{}: {}", path.display(), e));
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let text = Zeroizing::new(hex::encode(seed));
    tokio::fs::write(path, text.as_bytes()).await.map_err(io_err)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(io_err)?;
    }
    Ok(())
}
