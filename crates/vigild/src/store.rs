use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;
use vigil_core::{FaceEncoding, IdentityStore, KnownIdentity, StoreError};

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum SqliteStoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("identity '{0}' already exists")]
    Duplicate(String),
    #[error("encoding encryption failed")]
    EncryptionFailed,
    #[error("encoding decryption failed: key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("invalid encoding blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("invalid encoding dimension: {got} (expected {expected})")]
    InvalidEncodingDim { got: usize, expected: usize },
    #[error("invalid encoding value (NaN/Inf)")]
    InvalidEncodingValue,
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
}

/// SQLite-backed identity storage with AES-256-GCM encrypted encodings.
///
/// One row per identity; `name` is the primary key, so the name/encoding
/// pairing cannot drift. A per-installation 32-byte key is generated at first
/// use and stored at `{db_dir}/.key` (mode 0600).
#[derive(Clone)]
pub struct SqliteIdentityStore {
    conn: Connection,
    enc_key: [u8; 32],
    encoding_dim: usize,
}

impl SqliteIdentityStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path, encoding_dim: usize) -> Result<Self, SqliteStoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let enc_key = if db_path == Path::new(":memory:") {
            // In-memory DB (tests): use a fixed all-zeros key
            [0u8; 32]
        } else {
            let key_path = db_path
                .parent()
                .unwrap_or(Path::new("/var/lib/vigil"))
                .join(".key");
            load_or_generate_key(&key_path)?
        };

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS identities (
                     name TEXT PRIMARY KEY,
                     encoding BLOB NOT NULL,
                     dim INTEGER NOT NULL,
                     created_at TEXT NOT NULL
                 );",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self {
            conn,
            enc_key,
            encoding_dim,
        })
    }

    pub fn encoding_dim(&self) -> usize {
        self.encoding_dim
    }

    /// Insert one identity. Fails with [`SqliteStoreError::Duplicate`] if the
    /// name is taken; check and insert run as one unit on the connection.
    pub async fn insert(&self, identity: &KnownIdentity) -> Result<(), SqliteStoreError> {
        let blob = self.encrypt_encoding(identity.encoding.values())?;
        let name = identity.name.clone();
        let dim = identity.encoding.dim() as i64;
        let created_at = chrono::Utc::now().to_rfc3339();

        let inserted = self
            .conn
            .call(move |conn| {
                let exists: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM identities WHERE name = ?1)",
                    [&name],
                    |row| row.get(0),
                )?;
                if exists {
                    return Ok(false);
                }
                conn.execute(
                    "INSERT INTO identities (name, encoding, dim, created_at) VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![name, blob, dim, created_at],
                )?;
                Ok(true)
            })
            .await?;

        if inserted {
            Ok(())
        } else {
            Err(SqliteStoreError::Duplicate(identity.name.clone()))
        }
    }

    /// All identities, in insertion order, decrypted.
    pub async fn load_all(&self) -> Result<Vec<KnownIdentity>, SqliteStoreError> {
        let rows: Vec<(String, Vec<u8>)> = self
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT name, encoding FROM identities ORDER BY rowid")?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        let mut identities = Vec::with_capacity(rows.len());
        for (name, blob) in rows {
            let values = self.decrypt_encoding(&blob)?;
            let encoding =
                FaceEncoding::new(values).map_err(|_| SqliteStoreError::InvalidEncodingValue)?;
            identities.push(KnownIdentity { name, encoding });
        }
        Ok(identities)
    }

    /// Replace every row in one transaction.
    pub async fn replace_all(&self, identities: &[KnownIdentity]) -> Result<(), SqliteStoreError> {
        if let Some(dup) = vigil_core::types::find_duplicate(identities) {
            return Err(SqliteStoreError::Duplicate(dup.to_string()));
        }

        let created_at = chrono::Utc::now().to_rfc3339();
        let mut rows = Vec::with_capacity(identities.len());
        for identity in identities {
            let blob = self.encrypt_encoding(identity.encoding.values())?;
            rows.push((identity.name.clone(), blob, identity.encoding.dim() as i64));
        }

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM identities", [])?;
                for (name, blob, dim) in &rows {
                    tx.execute(
                        "INSERT INTO identities (name, encoding, dim, created_at) VALUES (?1, ?2, ?3, ?4)",
                        rusqlite::params![name, blob, dim, created_at],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Remove an identity by name.
    pub async fn remove(&self, name: &str) -> Result<bool, SqliteStoreError> {
        let name = name.to_string();
        self.conn
            .call(move |conn| {
                let affected = conn.execute("DELETE FROM identities WHERE name = ?1", [&name])?;
                Ok(affected > 0)
            })
            .await
            .map_err(SqliteStoreError::from)
    }

    /// List identities (metadata only, no encodings).
    pub async fn list(&self) -> Result<Vec<IdentityInfo>, SqliteStoreError> {
        self.conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT name, dim, created_at FROM identities ORDER BY rowid")?;
                let rows = stmt.query_map([], |row| {
                    Ok(IdentityInfo {
                        name: row.get(0)?,
                        dim: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(SqliteStoreError::from)
    }

    /// Count registered identities.
    pub async fn count_all(&self) -> Result<u64, SqliteStoreError> {
        self.conn
            .call(|conn| {
                let count: u64 =
                    conn.query_row("SELECT COUNT(*) FROM identities", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(SqliteStoreError::from)
    }

    // ── Encryption helpers ────────────────────────────────────────────────────

    /// Encrypt encoding values with AES-256-GCM.
    ///
    /// Output: 12-byte random nonce || ciphertext || 16-byte GCM tag.
    fn encrypt_encoding(&self, values: &[f64]) -> Result<Vec<u8>, SqliteStoreError> {
        validate_encoding_values(values, self.encoding_dim)?;
        let plaintext = encoding_to_bytes(values);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| SqliteStoreError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn decrypt_encoding(&self, blob: &[u8]) -> Result<Vec<f64>, SqliteStoreError> {
        if blob.len() <= NONCE_LEN {
            return Err(SqliteStoreError::InvalidBlob(blob.len()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| SqliteStoreError::DecryptionFailed)?;

        bytes_to_encoding_strict(&plaintext, self.encoding_dim)
    }
}

/// Core [`IdentityStore`] view of a [`SqliteIdentityStore`] for synchronous
/// callers (the engine thread).
///
/// Must not be used from inside the tokio runtime: every call blocks on the
/// runtime handle.
pub struct BlockingIdentityStore {
    store: SqliteIdentityStore,
    runtime: tokio::runtime::Handle,
}

impl BlockingIdentityStore {
    pub fn new(store: SqliteIdentityStore, runtime: tokio::runtime::Handle) -> Self {
        Self { store, runtime }
    }
}

fn to_store_error(err: SqliteStoreError) -> StoreError {
    match err {
        SqliteStoreError::Duplicate(name) => StoreError::DuplicateName(name),
        other => StoreError::backend(other),
    }
}

impl IdentityStore for BlockingIdentityStore {
    fn load(&self) -> Result<Vec<KnownIdentity>, StoreError> {
        self.runtime
            .block_on(self.store.load_all())
            .map_err(to_store_error)
    }

    fn save(&self, identities: &[KnownIdentity]) -> Result<(), StoreError> {
        self.runtime
            .block_on(self.store.replace_all(identities))
            .map_err(to_store_error)
    }

    fn insert(&self, identity: KnownIdentity) -> Result<(), StoreError> {
        self.runtime
            .block_on(self.store.insert(&identity))
            .map_err(to_store_error)
    }

    fn remove(&self, name: &str) -> Result<bool, StoreError> {
        self.runtime
            .block_on(self.store.remove(name))
            .map_err(to_store_error)
    }
}

// ── Key management ────────────────────────────────────────────────────────────

/// Load the encryption key from disk, or generate and persist a new one.
/// Written with mode 0600 (owner-readable only).
fn load_or_generate_key(key_path: &Path) -> Result<[u8; 32], SqliteStoreError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(SqliteStoreError::KeyIo)?;
        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            SqliteStoreError::KeyIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "encryption key file has wrong length ({} bytes, expected 32)",
                    bytes.len()
                ),
            ))
        })?;
        tracing::debug!(path = %key_path.display(), "loaded encryption key");
        Ok(key)
    } else {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);

        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(key_path)
            .map_err(SqliteStoreError::KeyIo)?;
        f.write_all(&key).map_err(SqliteStoreError::KeyIo)?;

        tracing::info!(path = %key_path.display(), "generated new AES-256 encryption key");
        Ok(key)
    }
}

// ── Serialization helpers ─────────────────────────────────────────────────────

fn encoding_to_bytes(values: &[f64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 8);
    for &v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

fn bytes_to_encoding_strict(bytes: &[u8], dim: usize) -> Result<Vec<f64>, SqliteStoreError> {
    if bytes.len() != dim * 8 {
        return Err(SqliteStoreError::InvalidBlob(bytes.len()));
    }

    let mut values = Vec::with_capacity(dim);
    for chunk in bytes.chunks_exact(8) {
        let arr: [u8; 8] = chunk
            .try_into()
            .map_err(|_| SqliteStoreError::InvalidBlob(bytes.len()))?;
        let v = f64::from_le_bytes(arr);
        if !v.is_finite() {
            return Err(SqliteStoreError::InvalidEncodingValue);
        }
        values.push(v);
    }
    Ok(values)
}

fn validate_encoding_values(values: &[f64], dim: usize) -> Result<(), SqliteStoreError> {
    if values.len() != dim {
        return Err(SqliteStoreError::InvalidEncodingDim {
            got: values.len(),
            expected: dim,
        });
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(SqliteStoreError::InvalidEncodingValue);
    }
    Ok(())
}

// ── Public types ──────────────────────────────────────────────────────────────

/// Metadata about a registered identity (no encoding data).
#[derive(Debug, Clone, serde::Serialize)]
pub struct IdentityInfo {
    pub name: String,
    pub dim: u32,
    pub created_at: String,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
