//! Faceprint vector store
//!
//! `VectorStore` is the keyed nearest-neighbor capability the matcher
//! consumes. `LocalFileStore` keeps a small collection in one JSON file:
//! owner ids and timestamps in clear, faceprints sealed with
//! XChaCha20-Poly1305, the record list covered by a SHA-256 checksum.

use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    XChaCha20Poly1305, XNonce,
};
use chrono::{SecondsFormat, Utc};
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use zeroize::Zeroizing;

use super::{cosine_similarity, normalize, recognition_vector};
use crate::device::Faceprints;

const FILE_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("No records were found with user_id {0}")]
    NotFound(String),

    #[error("A template for user_id {0} already exists")]
    Duplicate(String),

    #[error("DB integrity error: {count} records found for user_id {user_id}")]
    Integrity { user_id: String, count: usize },

    #[error("Vector store is corrupt: {0}")]
    Corrupt(String),

    #[error("Vector store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Vector store serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Vector store encryption failed: {0}")]
    Crypto(String),
}

/// A persisted template with its owner
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredTemplate {
    /// Random hex key of the record
    pub id: String,
    pub user_id: String,
    pub faceprints: Faceprints,
    pub created_at: String,
    pub updated_at: Option<String>,
}

/// Nearest-neighbor hit
#[derive(Debug, Clone)]
pub struct ScoredTemplate {
    pub template: StoredTemplate,
    pub score: f32,
}

/// Keyed nearest-neighbor store over faceprints
///
/// Implementations hold at most one template per user id; callers treat
/// more than one as an integrity violation.
pub trait VectorStore: Send + Sync {
    /// Add a template; `Duplicate` if the user already has one
    fn insert(&self, user_id: &str, faceprints: &Faceprints)
        -> Result<StoredTemplate, StoreError>;

    /// Replace the faceprints of the user's single template (keeps `created_at`)
    fn update_faceprints(&self, user_id: &str, faceprints: &Faceprints)
        -> Result<(), StoreError>;

    fn list_user_ids(&self) -> Result<Vec<String>, StoreError>;

    /// Every template, in storage order
    fn list_all(&self) -> Result<Vec<StoredTemplate>, StoreError>;

    /// Templates whose cosine score against `query` is at least
    /// `score_threshold`, best first, at most `max_results`
    fn nearest(
        &self,
        query: &[f32],
        max_results: usize,
        score_threshold: f32,
    ) -> Result<Vec<ScoredTemplate>, StoreError>;

    fn delete_user(&self, user_id: &str) -> Result<(), StoreError>;

    /// Returns the number of removed templates
    fn delete_all(&self) -> Result<usize, StoreError>;
}

/// Sealed record as written to disk
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SealedRecord {
    id: String,
    user_id: String,
    created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    updated_at: Option<String>,
    /// XChaCha20-Poly1305 nonce (192-bit)
    nonce: Vec<u8>,
    ciphertext: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    checksum: String,
    records: Vec<SealedRecord>,
}

/// In-memory view of one record
struct Entry {
    sealed: SealedRecord,
    faceprints: Faceprints,
    vector: Vec<f32>,
}

impl Entry {
    fn template(&self) -> StoredTemplate {
        StoredTemplate {
            id: self.sealed.id.clone(),
            user_id: self.sealed.user_id.clone(),
            faceprints: self.faceprints.clone(),
            created_at: self.sealed.created_at.clone(),
            updated_at: self.sealed.updated_at.clone(),
        }
    }
}

/// Single-file encrypted store
pub struct LocalFileStore {
    path: PathBuf,
    encryption_key: Zeroizing<[u8; 32]>,
    entries: Mutex<Vec<Entry>>,
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn random_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn checksum(records: &[SealedRecord]) -> Result<String, StoreError> {
    let bytes = serde_json::to_vec(records)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

fn search_vector(faceprints: &Faceprints) -> Vec<f32> {
    let mut vector = recognition_vector(&faceprints.enroll_descriptor);
    normalize(&mut vector);
    vector
}

impl LocalFileStore {
    /// Open (or create) the store at `path`; the key lives next to it as `<path>.key`
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let encryption_key = Self::get_or_create_encryption_key(&Self::key_path(path))?;

        let mut store = Self {
            path: path.to_path_buf(),
            encryption_key,
            entries: Mutex::new(Vec::new()),
        };

        let entries = if path.exists() {
            store.load()?
        } else {
            Vec::new()
        };
        log::info!(
            "Vector store {} opened - {} records",
            path.display(),
            entries.len()
        );
        store.entries = Mutex::new(entries);
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn key_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".key");
        PathBuf::from(name)
    }

    /// Get or create the encryption key for template storage
    fn get_or_create_encryption_key(key_path: &Path) -> Result<Zeroizing<[u8; 32]>, StoreError> {
        if key_path.exists() {
            let key_bytes = Zeroizing::new(fs::read(key_path)?);
            if key_bytes.len() != 32 {
                return Err(StoreError::Crypto("Invalid encryption key length".into()));
            }
            let mut key_array = Zeroizing::new([0u8; 32]);
            key_array.copy_from_slice(&key_bytes);
            return Ok(key_array);
        }

        let mut key_array = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut *key_array);
        fs::write(key_path, &*key_array)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(key_path, fs::Permissions::from_mode(0o600))?;
        }

        log::info!("Generated new vector store key");
        Ok(key_array)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn seal(&self, faceprints: &Faceprints) -> Result<(Vec<u8>, Vec<u8>), StoreError> {
        let cipher = XChaCha20Poly1305::new((&*self.encryption_key).into());

        let mut nonce_bytes = [0u8; 24];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from(nonce_bytes);

        let plaintext = Zeroizing::new(serde_json::to_vec(faceprints)?);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|e| StoreError::Crypto(format!("Encryption failed: {:?}", e)))?;

        Ok((nonce_bytes.to_vec(), ciphertext))
    }

    fn open_sealed(&self, sealed: &SealedRecord) -> Result<Faceprints, StoreError> {
        let cipher = XChaCha20Poly1305::new((&*self.encryption_key).into());

        let nonce: &XNonce = sealed
            .nonce
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Corrupt(format!("Invalid nonce length in {}", sealed.id)))?;

        let plaintext = Zeroizing::new(
            cipher
                .decrypt(nonce, sealed.ciphertext.as_slice())
                .map_err(|e| StoreError::Crypto(format!("Decryption failed: {:?}", e)))?,
        );
        Ok(serde_json::from_slice(&plaintext)?)
    }

    fn load(&self) -> Result<Vec<Entry>, StoreError> {
        let bytes = fs::read(&self.path)?;
        let file: StoreFile = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Corrupt(format!("Unreadable store file: {}", e)))?;

        if file.version != FILE_VERSION {
            return Err(StoreError::Corrupt(format!(
                "Unsupported store version {}",
                file.version
            )));
        }
        if checksum(&file.records)? != file.checksum {
            return Err(StoreError::Corrupt("Checksum mismatch".into()));
        }

        file.records
            .into_iter()
            .map(|sealed| {
                let faceprints = self.open_sealed(&sealed)?;
                let vector = search_vector(&faceprints);
                Ok(Entry {
                    sealed,
                    faceprints,
                    vector,
                })
            })
            .collect()
    }

    /// Write the whole collection atomically (temp file + rename)
    fn persist(&self, entries: &[Entry]) -> Result<(), StoreError> {
        let records: Vec<SealedRecord> = entries.iter().map(|e| e.sealed.clone()).collect();
        let file = StoreFile {
            version: FILE_VERSION,
            checksum: checksum(&records)?,
            records,
        };

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        fs::write(&tmp_path, serde_json::to_vec_pretty(&file)?)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Index of the only record owned by `user_id`
    fn locate_single(entries: &[Entry], user_id: &str) -> Result<usize, StoreError> {
        let matches: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.sealed.user_id == user_id)
            .map(|(i, _)| i)
            .collect();

        match matches.as_slice() {
            [index] => Ok(*index),
            [] => {
                log::error!("No records were found with user_id {}", user_id);
                Err(StoreError::NotFound(user_id.to_string()))
            }
            many => {
                log::error!(
                    "DB integrity error: {} records found with user_id {}",
                    many.len(),
                    user_id
                );
                Err(StoreError::Integrity {
                    user_id: user_id.to_string(),
                    count: many.len(),
                })
            }
        }
    }

    fn new_entry(&self, user_id: &str, faceprints: &Faceprints) -> Result<Entry, StoreError> {
        let (nonce, ciphertext) = self.seal(faceprints)?;
        Ok(Entry {
            sealed: SealedRecord {
                id: random_id(),
                user_id: user_id.to_string(),
                created_at: timestamp(),
                updated_at: None,
                nonce,
                ciphertext,
            },
            faceprints: faceprints.clone(),
            vector: search_vector(faceprints),
        })
    }

    /// Append a record without the duplicate check
    #[cfg(test)]
    fn push_unchecked(&self, user_id: &str, faceprints: &Faceprints) -> Result<(), StoreError> {
        let mut entries = self.lock();
        let entry = self.new_entry(user_id, faceprints)?;
        entries.push(entry);
        self.persist(&entries)
    }
}

impl VectorStore for LocalFileStore {
    fn insert(
        &self,
        user_id: &str,
        faceprints: &Faceprints,
    ) -> Result<StoredTemplate, StoreError> {
        let mut entries = self.lock();
        log::info!("Before insert: {} records", entries.len());

        if entries.iter().any(|e| e.sealed.user_id == user_id) {
            return Err(StoreError::Duplicate(user_id.to_string()));
        }

        let entry = self.new_entry(user_id, faceprints)?;
        let template = entry.template();
        entries.push(entry);
        if let Err(e) = self.persist(&entries) {
            entries.pop();
            return Err(e);
        }

        log::info!("After insert: {} records", entries.len());
        Ok(template)
    }

    fn update_faceprints(
        &self,
        user_id: &str,
        faceprints: &Faceprints,
    ) -> Result<(), StoreError> {
        let mut entries = self.lock();
        let index = Self::locate_single(&entries, user_id)?;

        let (nonce, ciphertext) = self.seal(faceprints)?;
        let replacement = Entry {
            sealed: SealedRecord {
                nonce,
                ciphertext,
                updated_at: Some(timestamp()),
                ..entries[index].sealed.clone()
            },
            faceprints: faceprints.clone(),
            vector: search_vector(faceprints),
        };
        let previous = std::mem::replace(&mut entries[index], replacement);
        if let Err(e) = self.persist(&entries) {
            entries[index] = previous;
            return Err(e);
        }

        log::info!("Updated faceprints for {}", user_id);
        Ok(())
    }

    fn list_user_ids(&self) -> Result<Vec<String>, StoreError> {
        let entries = self.lock();
        log::info!("Vector store - {} records", entries.len());
        Ok(entries.iter().map(|e| e.sealed.user_id.clone()).collect())
    }

    fn list_all(&self) -> Result<Vec<StoredTemplate>, StoreError> {
        let entries = self.lock();
        log::info!("Vector store - {} records", entries.len());
        Ok(entries.iter().map(Entry::template).collect())
    }

    fn nearest(
        &self,
        query: &[f32],
        max_results: usize,
        score_threshold: f32,
    ) -> Result<Vec<ScoredTemplate>, StoreError> {
        let mut query = query.to_vec();
        normalize(&mut query);

        let entries = self.lock();
        let mut hits: Vec<ScoredTemplate> = entries
            .iter()
            .filter_map(|e| {
                let score = cosine_similarity(&query, &e.vector);
                (score >= score_threshold).then(|| ScoredTemplate {
                    template: e.template(),
                    score,
                })
            })
            .collect();

        // stable: equal scores keep storage order
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(max_results);
        log::debug!(
            "Nearest search over {} records returned {} hits",
            entries.len(),
            hits.len()
        );
        Ok(hits)
    }

    fn delete_user(&self, user_id: &str) -> Result<(), StoreError> {
        let mut entries = self.lock();
        let index = Self::locate_single(&entries, user_id)?;
        let removed = entries.remove(index);
        if let Err(e) = self.persist(&entries) {
            entries.insert(index, removed);
            return Err(e);
        }
        log::info!("Removed {} - {} records left", user_id, entries.len());
        Ok(())
    }

    fn delete_all(&self) -> Result<usize, StoreError> {
        let mut entries = self.lock();
        let removed = std::mem::take(&mut *entries);
        if let Err(e) = self.persist(&entries) {
            *entries = removed;
            return Err(e);
        }
        log::info!("Removed all {} records", removed.len());
        Ok(removed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FEATURES_ALLOC_SIZE;

    fn faceprints(seed: i16) -> Faceprints {
        let features: Vec<i16> = (0..FEATURES_ALLOC_SIZE as i16)
            .map(|i| ((i * seed) % 97) - 48)
            .collect();
        Faceprints {
            version: 1,
            features_type: 0,
            flags: 0,
            adaptive_descriptor_nomask: features.clone(),
            adaptive_descriptor_withmask: vec![0; FEATURES_ALLOC_SIZE],
            enroll_descriptor: features,
        }
    }

    fn open_store() -> (tempfile::TempDir, LocalFileStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalFileStore::open(&tmp.path().join("vectors.db")).unwrap();
        (tmp, store)
    }

    #[test]
    fn test_insert_and_reload() {
        let (tmp, store) = open_store();
        let stored = store.insert("alice", &faceprints(3)).unwrap();
        assert_eq!(stored.id.len(), 32);
        assert!(stored.updated_at.is_none());
        drop(store);

        let reopened = LocalFileStore::open(&tmp.path().join("vectors.db")).unwrap();
        let all = reopened.list_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].user_id, "alice");
        assert_eq!(all[0].faceprints, faceprints(3));
    }

    #[test]
    fn test_faceprints_not_stored_in_clear() {
        let (_tmp, store) = open_store();
        store.insert("alice", &faceprints(3)).unwrap();
        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("alice"));
        assert!(!raw.contains("enroll_descriptor"));
    }

    #[test]
    fn test_duplicate_rejected() {
        let (_tmp, store) = open_store();
        store.insert("alice", &faceprints(3)).unwrap();
        assert!(matches!(
            store.insert("alice", &faceprints(5)),
            Err(StoreError::Duplicate(_))
        ));
        assert_eq!(store.list_user_ids().unwrap(), vec!["alice".to_string()]);
    }

    #[test]
    fn test_update_missing_user_is_not_found() {
        let (_tmp, store) = open_store();
        assert!(matches!(
            store.update_faceprints("ghost", &faceprints(3)),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.delete_user("ghost"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_update_with_two_records_is_integrity_error() {
        let (_tmp, store) = open_store();
        store.push_unchecked("bob", &faceprints(3)).unwrap();
        store.push_unchecked("bob", &faceprints(5)).unwrap();

        assert!(matches!(
            store.update_faceprints("bob", &faceprints(7)),
            Err(StoreError::Integrity { count: 2, .. })
        ));
        assert!(matches!(
            store.delete_user("bob"),
            Err(StoreError::Integrity { count: 2, .. })
        ));
    }

    #[test]
    fn test_update_keeps_created_at() {
        let (_tmp, store) = open_store();
        let stored = store.insert("alice", &faceprints(3)).unwrap();
        store.update_faceprints("alice", &faceprints(11)).unwrap();

        let all = store.list_all().unwrap();
        assert_eq!(all[0].created_at, stored.created_at);
        assert_eq!(all[0].id, stored.id);
        assert!(all[0].updated_at.is_some());
        assert_eq!(all[0].faceprints, faceprints(11));
    }

    #[test]
    fn test_nearest_orders_and_filters() {
        let (_tmp, store) = open_store();
        store.insert("alice", &faceprints(3)).unwrap();
        store.insert("bob", &faceprints(29)).unwrap();

        let query = recognition_vector(&faceprints(3).enroll_descriptor);
        let hits = store.nearest(&query, 10, -1.0).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].template.user_id, "alice");
        assert!((hits[0].score - 1.0).abs() < 1e-4);
        assert!(hits[0].score >= hits[1].score);

        let hits = store.nearest(&query, 1, -1.0).unwrap();
        assert_eq!(hits.len(), 1);

        let hits = store.nearest(&query, 10, 0.999).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_delete_user_and_all() {
        let (_tmp, store) = open_store();
        store.insert("alice", &faceprints(3)).unwrap();
        store.insert("bob", &faceprints(5)).unwrap();
        store.insert("carol", &faceprints(7)).unwrap();

        store.delete_user("bob").unwrap();
        assert_eq!(
            store.list_user_ids().unwrap(),
            vec!["alice".to_string(), "carol".to_string()]
        );
        assert_eq!(store.delete_all().unwrap(), 2);
        assert!(store.list_all().unwrap().is_empty());
    }

    #[test]
    fn test_tampered_file_is_corrupt() {
        let (tmp, store) = open_store();
        store.insert("alice", &faceprints(3)).unwrap();
        drop(store);

        let path = tmp.path().join("vectors.db");
        let raw = fs::read_to_string(&path).unwrap();
        fs::write(&path, raw.replace("alice", "mallory")).unwrap();

        assert!(matches!(
            LocalFileStore::open(&path),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let (tmp, _store) = open_store();
        let key = tmp.path().join("vectors.db.key");
        let mode = fs::metadata(&key).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
