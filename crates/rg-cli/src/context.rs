//! Local state behind every command: configuration, device keys, keyring.

use std::sync::Arc;

use anyhow::Context;
use tracing::debug;

use rg_core::config::Config;
use rg_core::keyring::KeyringStore;
use rg_core::keystore::{FileSecretKeyStore, SecretKeyStore};
use rg_core::replay_cache::{JsonFileReplayPersistence, ReplayCache};
use rg_core::sqlite_store::SqliteKeyringRepository;
use rg_crypto::keycard::KeyCard;
use rg_crypto::keys::{EncryptionKeypair, SigningKeypair};

pub struct AppContext {
    pub config: Config,
    keys: FileSecretKeyStore,
    pub keyring: Arc<KeyringStore>,
}

impl AppContext {
    /// Open the keyring database and key directory under `config.data_dir`.
    pub fn open(config: Config) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("cannot create {}", config.data_dir.display()))?;
        let db = config.keyring_db_path();
        let repo = SqliteKeyringRepository::new(&db)
            .with_context(|| format!("cannot open keyring {}", db.display()))?;
        debug!(db = %db.display(), "keyring opened");
        Ok(Self {
            keys: FileSecretKeyStore::new(config.keys_dir()),
            keyring: Arc::new(KeyringStore::new(Arc::new(repo))),
            config,
        })
    }

    pub async fn signing_keypair(&self) -> anyhow::Result<SigningKeypair> {
        Ok(self
            .keys
            .get_or_create_signing_keypair(&self.config.account, &self.config.device_id)
            .await?)
    }

    pub async fn encryption_keypair(&self) -> anyhow::Result<EncryptionKeypair> {
        Ok(self
            .keys
            .get_or_create_encryption_keypair(&self.config.account, &self.config.device_id)
            .await?)
    }

    pub async fn reset_keys(&self) -> anyhow::Result<()> {
        Ok(self
            .keys
            .reset_keys(&self.config.account, &self.config.device_id)
            .await?)
    }

    /// This device's signed key card.
    pub async fn own_card(&self) -> anyhow::Result<KeyCard> {
        let signing = self.signing_keypair().await?;
        let encryption = self.encryption_keypair().await?;
        Ok(KeyCard::create(
            &signing,
            &encryption,
            Some(&self.config.device_id),
        )?)
    }

    pub fn replay_cache(&self) -> ReplayCache {
        ReplayCache::new(
            self.config.replay_capacity,
            Arc::new(JsonFileReplayPersistence::new(self.config.replay_dir())),
        )
    }
}
