//! SQLite keyring backend.
//!
//! The revocation sweep of an import runs in the same transaction as the
//! upsert.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;

use crate::store::{
    EntryKey, KeyringEntry, KeyringRepository, SignatureState, StoreError, TrustState,
};

// ============================================================================
// Schema Version
// ============================================================================

/// Current schema version for migrations.
/// Increment this when adding new migrations.
const SCHEMA_VERSION: i32 = 1;

const SELECT_COLUMNS: &str = "SELECT peer_id, device_id, signing_key_id, encryption_key_id,
        signing_kid, encryption_kid, signing_keyset, encryption_keyset,
        trust_state, signature_state, created_at_ms, updated_at_ms
 FROM keyring_entries";

const ORDER_NEWEST: &str =
    "ORDER BY updated_at_ms DESC, device_id, signing_key_id, encryption_key_id";

fn db_err(what: &str) -> impl Fn(rusqlite::Error) -> StoreError + '_ {
    move |e| StoreError::OperationFailed(format!("{}: {}", what, e))
}

/// Column values as stored, before enum and range checks.
struct RawRow {
    peer_id: String,
    device_id: String,
    signing_key_id: i64,
    encryption_key_id: i64,
    signing_kid: String,
    encryption_kid: String,
    signing_keyset: String,
    encryption_keyset: String,
    trust_state: i32,
    signature_state: i32,
    created_at_ms: i64,
    updated_at_ms: i64,
}

impl RawRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            peer_id: row.get(0)?,
            device_id: row.get(1)?,
            signing_key_id: row.get(2)?,
            encryption_key_id: row.get(3)?,
            signing_kid: row.get(4)?,
            encryption_kid: row.get(5)?,
            signing_keyset: row.get(6)?,
            encryption_keyset: row.get(7)?,
            trust_state: row.get(8)?,
            signature_state: row.get(9)?,
            created_at_ms: row.get(10)?,
            updated_at_ms: row.get(11)?,
        })
    }

    fn into_entry(self) -> Result<KeyringEntry, StoreError> {
        let corrupt = |what: &str| {
            StoreError::DataCorruption(format!("{} in row for peer {}", what, self.peer_id))
        };
        let signing_key_id = u32::try_from(self.signing_key_id).map_err(|_| corrupt("signing_key_id"))?;
        let encryption_key_id =
            u32::try_from(self.encryption_key_id).map_err(|_| corrupt("encryption_key_id"))?;
        let trust_state = TrustState::from_i32(self.trust_state).ok_or_else(|| corrupt("trust_state"))?;
        let signature_state =
            SignatureState::from_i32(self.signature_state).ok_or_else(|| corrupt("signature_state"))?;
        Ok(KeyringEntry {
            key: EntryKey {
                peer_id: self.peer_id,
                device_id: self.device_id,
                signing_key_id,
                encryption_key_id,
            },
            signing_kid: self.signing_kid,
            encryption_kid: self.encryption_kid,
            signing_keyset: self.signing_keyset,
            encryption_keyset: self.encryption_keyset,
            trust_state,
            signature_state,
            created_at_ms: self.created_at_ms,
            updated_at_ms: self.updated_at_ms,
        })
    }
}

// ============================================================================
// SQLite Keyring Implementation
// ============================================================================

/// SQLite-based persistent keyring.
pub struct SqliteKeyringRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteKeyringRepository {
    /// Open (or create) the database at `path` and run migrations.
    ///
    /// # Returns
    /// * `Ok(SqliteKeyringRepository)` on success
    /// * `Err(StoreError)` if database creation or migration fails
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(db_err("failed to open database"))?;

        // Enable WAL mode for better concurrent access
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err("failed to set pragmas"))?;

        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests.
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let conn =
            Connection::open_in_memory().map_err(db_err("failed to open in-memory database"))?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            [],
        )
        .map_err(db_err("failed to create schema_version"))?;

        let current_version: i32 = conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
                row.get(0)
            })
            .map_err(db_err("failed to read schema version"))?;

        if current_version > SCHEMA_VERSION {
            return Err(StoreError::DataCorruption(format!(
                "database schema {} is newer than supported {}",
                current_version, SCHEMA_VERSION
            )));
        }
        if current_version < 1 {
            Self::migrate_v1(conn)?;
        }
        Ok(())
    }

    /// Migration to schema version 1 - initial schema.
    fn migrate_v1(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS keyring_entries (
                peer_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                signing_key_id INTEGER NOT NULL,
                encryption_key_id INTEGER NOT NULL,
                signing_kid TEXT NOT NULL,
                encryption_kid TEXT NOT NULL,
                signing_keyset TEXT NOT NULL,
                encryption_keyset TEXT NOT NULL,
                trust_state INTEGER NOT NULL,
                signature_state INTEGER NOT NULL,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL,
                PRIMARY KEY (peer_id, device_id, signing_key_id, encryption_key_id)
            );
            CREATE INDEX IF NOT EXISTS idx_keyring_peer_signing_kid
                ON keyring_entries(peer_id, signing_kid);
            CREATE INDEX IF NOT EXISTS idx_keyring_peer_device
                ON keyring_entries(peer_id, device_id);

            INSERT INTO schema_version (version) VALUES (1);
            "#,
        )
        .map_err(db_err("migration v1 failed"))
    }

    fn query_entries(
        conn: &Connection,
        filter: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<KeyringEntry>, StoreError> {
        let sql = format!("{} WHERE {} {}", SELECT_COLUMNS, filter, ORDER_NEWEST);
        let mut stmt = conn.prepare(&sql).map_err(db_err("failed to prepare query"))?;
        let raw = stmt
            .query_map(args, RawRow::read)
            .map_err(db_err("failed to query keyring"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err("failed to collect keyring rows"))?;
        raw.into_iter().map(RawRow::into_entry).collect()
    }
}

// ============================================================================
// Repository Trait Implementation
// ============================================================================

#[async_trait]
impl KeyringRepository for SqliteKeyringRepository {
    async fn get(&self, key: &EntryKey) -> Result<Option<KeyringEntry>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "{} WHERE peer_id = ?1 AND device_id = ?2 AND signing_key_id = ?3 AND encryption_key_id = ?4",
            SELECT_COLUMNS
        );
        let raw = conn
            .query_row(
                &sql,
                params![
                    key.peer_id,
                    key.device_id,
                    i64::from(key.signing_key_id),
                    i64::from(key.encryption_key_id)
                ],
                RawRow::read,
            )
            .optional()
            .map_err(db_err("failed to load keyring entry"))?;
        raw.map(RawRow::into_entry).transpose()
    }

    async fn upsert_superseding(&self, entry: KeyringEntry) -> Result<Vec<EntryKey>, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(db_err("failed to begin transaction"))?;

        tx.execute(
            "INSERT OR REPLACE INTO keyring_entries (
                peer_id, device_id, signing_key_id, encryption_key_id,
                signing_kid, encryption_kid, signing_keyset, encryption_keyset,
                trust_state, signature_state, created_at_ms, updated_at_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                entry.key.peer_id,
                entry.key.device_id,
                i64::from(entry.key.signing_key_id),
                i64::from(entry.key.encryption_key_id),
                entry.signing_kid,
                entry.encryption_kid,
                entry.signing_keyset,
                entry.encryption_keyset,
                entry.trust_state.as_i32(),
                entry.signature_state.as_i32(),
                entry.created_at_ms,
                entry.updated_at_ms,
            ],
        )
        .map_err(db_err("failed to upsert keyring entry"))?;

        let superseded = "peer_id = ?1 AND device_id = ?2
                 AND NOT (signing_kid = ?3 AND encryption_kid = ?4)
                 AND trust_state != ?5";
        let revoked: Vec<EntryKey> = Self::query_entries(
            &tx,
            superseded,
            params![
                entry.key.peer_id,
                entry.key.device_id,
                entry.signing_kid,
                entry.encryption_kid,
                TrustState::Revoked.as_i32(),
            ],
        )?
        .into_iter()
        .map(|e| e.key)
        .collect();

        tx.execute(
            &format!(
                "UPDATE keyring_entries SET trust_state = ?5, updated_at_ms = ?6 WHERE {}",
                superseded
            ),
            params![
                entry.key.peer_id,
                entry.key.device_id,
                entry.signing_kid,
                entry.encryption_kid,
                TrustState::Revoked.as_i32(),
                entry.updated_at_ms,
            ],
        )
        .map_err(db_err("failed to revoke superseded keys"))?;

        tx.commit().map_err(db_err("failed to commit import"))?;
        Ok(revoked)
    }

    async fn list_for_peer(&self, peer_id: &str) -> Result<Vec<KeyringEntry>, StoreError> {
        let conn = self.conn.lock().await;
        Self::query_entries(&conn, "peer_id = ?1", params![peer_id])
    }

    async fn find_by_signing_kid(
        &self,
        peer_id: &str,
        signing_kid: &str,
    ) -> Result<Vec<KeyringEntry>, StoreError> {
        let conn = self.conn.lock().await;
        Self::query_entries(
            &conn,
            "peer_id = ?1 AND signing_kid = ?2",
            params![peer_id, signing_kid],
        )
    }

    async fn find_by_signing_key_id(
        &self,
        peer_id: &str,
        signing_key_id: u32,
    ) -> Result<Vec<KeyringEntry>, StoreError> {
        let conn = self.conn.lock().await;
        Self::query_entries(
            &conn,
            "peer_id = ?1 AND signing_key_id = ?2",
            params![peer_id, i64::from(signing_key_id)],
        )
    }

    async fn find_by_kids(
        &self,
        peer_id: &str,
        signing_kid: &str,
        encryption_kid: &str,
    ) -> Result<Vec<KeyringEntry>, StoreError> {
        let conn = self.conn.lock().await;
        Self::query_entries(
            &conn,
            "peer_id = ?1 AND signing_kid = ?2 AND encryption_kid = ?3",
            params![peer_id, signing_kid, encryption_kid],
        )
    }

    async fn update_trust_state(
        &self,
        key: &EntryKey,
        state: TrustState,
        now_ms: i64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        // a revoked row only accepts REVOKED again
        let rows_affected = conn
            .execute(
                "UPDATE keyring_entries SET trust_state = ?1, updated_at_ms = ?2
                 WHERE peer_id = ?3 AND device_id = ?4 AND signing_key_id = ?5 AND encryption_key_id = ?6
                   AND (trust_state != ?7 OR ?1 = ?7)",
                params![
                    state.as_i32(),
                    now_ms,
                    key.peer_id,
                    key.device_id,
                    i64::from(key.signing_key_id),
                    i64::from(key.encryption_key_id),
                    TrustState::Revoked.as_i32(),
                ],
            )
            .map_err(db_err("failed to update trust state"))?;
        if rows_affected > 0 {
            return Ok(());
        }
        let exists: Option<i32> = conn
            .query_row(
                "SELECT trust_state FROM keyring_entries
                 WHERE peer_id = ?1 AND device_id = ?2 AND signing_key_id = ?3 AND encryption_key_id = ?4",
                params![
                    key.peer_id,
                    key.device_id,
                    i64::from(key.signing_key_id),
                    i64::from(key.encryption_key_id)
                ],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err("failed to load trust state"))?;
        match exists {
            Some(_) => Err(StoreError::InvalidTransition {
                from: TrustState::Revoked,
                to: state,
            }),
            None => Err(StoreError::NotFound(key.to_string())),
        }
    }

    async fn update_signature_state(
        &self,
        key: &EntryKey,
        state: SignatureState,
        now_ms: i64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let rows_affected = conn
            .execute(
                "UPDATE keyring_entries SET signature_state = ?1, updated_at_ms = ?2
                 WHERE peer_id = ?3 AND device_id = ?4 AND signing_key_id = ?5 AND encryption_key_id = ?6",
                params![
                    state.as_i32(),
                    now_ms,
                    key.peer_id,
                    key.device_id,
                    i64::from(key.signing_key_id),
                    i64::from(key.encryption_key_id)
                ],
            )
            .map_err(db_err("failed to update signature state"))?;
        if rows_affected == 0 {
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(())
    }

    async fn delete(&self, key: &EntryKey) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let n = conn
            .execute(
                "DELETE FROM keyring_entries
                 WHERE peer_id = ?1 AND device_id = ?2 AND signing_key_id = ?3 AND encryption_key_id = ?4",
                params![
                    key.peer_id,
                    key.device_id,
                    i64::from(key.signing_key_id),
                    i64::from(key.encryption_key_id)
                ],
            )
            .map_err(db_err("failed to delete keyring entry"))?;
        Ok(n > 0)
    }

    async fn delete_peer(&self, peer_id: &str) -> Result<usize, StoreError> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM keyring_entries WHERE peer_id = ?1", params![peer_id])
            .map_err(db_err("failed to delete peer"))
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM keyring_entries", [])
            .map_err(db_err("failed to clear keyring"))?;
        Ok(())
    }

    async fn list_peers(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT DISTINCT peer_id FROM keyring_entries ORDER BY peer_id")
            .map_err(db_err("failed to prepare query"))?;
        let peers = stmt
            .query_map([], |row| row.get(0))
            .map_err(db_err("failed to list peers"))?
            .collect::<Result<Vec<String>, _>>()
            .map_err(db_err("failed to collect peers"))?;
        Ok(peers)
    }
}
