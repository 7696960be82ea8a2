//! # Account Storage
//!
//! Each account is one blob in the data directory, named by
//! [`crate::crypto::account_filename`]. The blob is a bincode
//! [`AccountRecord`] followed by an HMAC-SHA512 tag keyed from the master
//! secret, so a server without the client's secret can neither read the
//! entries nor forge a record.
//!
//! Entries are serialized [`SecretInfoBlock`]s. Their fields are encrypted
//! with the account's [`KeyHandler`] and carry their own tag.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bincode::Options;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::crypto::{expand_key, hmac_sha512, MasterSecret};
use crate::error::{ProtocolError, ProtocolResult};
use crate::infoblock::{codec, SecretInfoBlock};
use crate::keyhandler::KeyHandler;
use crate::{INTEGRITY_TAG_SIZE, MAX_ENTRY_FIELDS};

/// Decrypted secret entry as returned by a search
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Index in the account
    pub index: u32,
    /// Field values, field 0 names the entry type
    pub fields: Vec<String>,
}

impl Entry {
    /// Whether any field contains `pattern`
    pub fn matches(&self, pattern: &str) -> bool {
        pattern.is_empty() || self.fields.iter().any(|f| f.contains(pattern))
    }
}

/// Persistent state of one account
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    /// Layer suite text, set by the first configuration
    pub configuration: Option<String>,
    /// Index handed to the next stored entry
    pub next_index: u32,
    /// Serialized entry blocks
    pub entries: BTreeMap<u32, Vec<u8>>,
}

fn record_key(ms: &MasterSecret) -> ProtocolResult<[u8; INTEGRITY_TAG_SIZE]> {
    expand_key::<INTEGRITY_TAG_SIZE>(ms.as_bytes(), b"mnemo account record")
}

impl AccountRecord {
    /// Serialize and tag the record
    pub fn seal(&self, ms: &MasterSecret) -> ProtocolResult<Vec<u8>> {
        let mut out = codec().serialize(self)?;
        let tag = hmac_sha512(&record_key(ms)?, &[&out]);
        out.extend_from_slice(&tag);
        Ok(out)
    }

    /// Verify the tag and decode the record
    pub fn open(bytes: &[u8], ms: &MasterSecret) -> ProtocolResult<Self> {
        if bytes.len() < INTEGRITY_TAG_SIZE {
            tracing::error!("Account record shorter than its tag");
            return Err(ProtocolError::IntegrityViolation(
                "account record truncated".to_string(),
            ));
        }
        let (body, tag) = bytes.split_at(bytes.len() - INTEGRITY_TAG_SIZE);

        let expected = hmac_sha512(&record_key(ms)?, &[body]);
        if !constant_time_eq::constant_time_eq(&expected, tag) {
            tracing::error!("Account record tag mismatch");
            return Err(ProtocolError::IntegrityViolation(
                "account record tag mismatch".to_string(),
            ));
        }

        codec().deserialize(body).map_err(|e| {
            tracing::error!("Tagged account record does not decode: {}", e);
            ProtocolError::IntegrityViolation(format!("account record undecodable: {}", e))
        })
    }

    /// Encrypt `fields` into a new entry and return its index
    pub fn add_entry<T: AsRef<str>>(&mut self, keys: &KeyHandler, fields: &[T]) -> ProtocolResult<u32> {
        if fields.is_empty() || fields.len() > MAX_ENTRY_FIELDS {
            return Err(ProtocolError::InvalidConfiguration(format!(
                "An entry holds 1 to {} fields, got {}",
                MAX_ENTRY_FIELDS,
                fields.len()
            )));
        }

        let raw: Vec<&[u8]> = fields.iter().map(|f| f.as_ref().as_bytes()).collect();
        let block = SecretInfoBlock::from_fields(&raw[..], keys)?;

        let index = self.next_index;
        self.entries.insert(index, block.serialize()?);
        self.next_index = self.next_index.checked_add(1).ok_or_else(|| {
            ProtocolError::InvalidConfiguration("Entry index space exhausted".to_string())
        })?;
        Ok(index)
    }

    /// Remove an entry, false when absent
    pub fn remove_entry(&mut self, index: u32) -> bool {
        self.entries.remove(&index).is_some()
    }

    /// Decrypt one entry
    pub fn entry(&self, keys: &KeyHandler, index: u32) -> ProtocolResult<Option<Entry>> {
        let Some(blob) = self.entries.get(&index) else {
            return Ok(None);
        };
        let block = SecretInfoBlock::deserialize(blob, keys)?;
        let fields = block
            .fields()?
            .into_iter()
            .map(|f| String::from_utf8_lossy(&f.unwrap_or_default()).into_owned())
            .collect();
        Ok(Some(Entry { index, fields }))
    }

    /// Decrypt every entry with a field containing `pattern`
    ///
    /// An empty pattern returns all entries. One tampered entry fails the
    /// whole search.
    pub fn search(&self, keys: &KeyHandler, pattern: &str) -> ProtocolResult<Vec<Entry>> {
        let mut found = Vec::new();
        for &index in self.entries.keys() {
            if let Some(entry) = self.entry(keys, index)? {
                if entry.matches(pattern) {
                    found.push(entry);
                }
            }
        }
        Ok(found)
    }
}

/// Directory of account blobs shared by all connections
///
/// Creation and updates hold a store-wide lock from the read to the write,
/// so two connections on the same account cannot both create it or
/// overwrite each other's changes. Every write goes to a temporary file
/// first and is renamed into place.
#[derive(Clone)]
pub struct AccountStore {
    dir: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl AccountStore {
    /// Open (and create if needed) the store directory
    pub async fn open(dir: impl AsRef<Path>) -> ProtocolResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        tracing::info!("Account store at {}", dir.display());
        Ok(Self {
            dir,
            lock: Arc::new(Mutex::new(())),
        })
    }

    /// Store directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, filename: &str) -> ProtocolResult<PathBuf> {
        if filename.is_empty()
            || !filename
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(ProtocolError::Malformed(format!(
                "Invalid account filename: {}",
                filename
            )));
        }
        Ok(self.dir.join(filename))
    }

    /// Whether an account blob exists
    pub async fn exists(&self, filename: &str) -> ProtocolResult<bool> {
        Ok(fs::try_exists(self.path(filename)?).await?)
    }

    /// Read an account blob
    pub async fn load(&self, filename: &str) -> ProtocolResult<Option<Vec<u8>>> {
        match fs::read(self.path(filename)?).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Create an account blob, false if it already exists
    pub async fn create(&self, filename: &str, data: &[u8]) -> ProtocolResult<bool> {
        let path = self.path(filename)?;
        let _guard = self.lock.lock().await;

        if fs::try_exists(&path).await? {
            return Ok(false);
        }
        self.write_atomic(&path, data).await?;
        Ok(true)
    }

    /// Load and verify the current record of an existing account
    pub async fn load_record(&self, filename: &str, ms: &MasterSecret) -> ProtocolResult<AccountRecord> {
        let blob = self
            .load(filename)
            .await?
            .ok_or_else(|| ProtocolError::IntegrityViolation("account record missing".to_string()))?;
        let ms = ms.clone();
        tokio::task::spawn_blocking(move || AccountRecord::open(&blob, &ms)).await?
    }

    /// Apply `change` to the stored record and write the result back
    ///
    /// The record is reloaded and verified under the store lock, and
    /// `change` runs on the blocking pool. Nothing is written when `change`
    /// fails. Returns the record as written along with `change`'s value.
    pub async fn update<T, F>(
        &self,
        filename: &str,
        ms: &MasterSecret,
        change: F,
    ) -> ProtocolResult<(AccountRecord, T)>
    where
        F: FnOnce(&mut AccountRecord) -> ProtocolResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.path(filename)?;
        let _guard = self.lock.lock().await;

        let blob = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProtocolError::IntegrityViolation(
                    "account record missing".to_string(),
                ))
            }
            Err(e) => return Err(e.into()),
        };

        let ms = ms.clone();
        let (record, value, sealed) = tokio::task::spawn_blocking(move || {
            let mut record = AccountRecord::open(&blob, &ms)?;
            let value = change(&mut record)?;
            let sealed = record.seal(&ms)?;
            Ok::<_, ProtocolError>((record, value, sealed))
        })
        .await??;

        self.write_atomic(&path, &sealed).await?;
        Ok((record, value))
    }

    async fn write_atomic(&self, path: &Path, data: &[u8]) -> ProtocolResult<()> {
        let tmp = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}
