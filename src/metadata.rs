//! The file-backed catalog pattern shared by the layer, image and container
//! stores.
//!
//! Each store is a directory holding one JSON array index, one lock file,
//! and a subdirectory per record for "big data" blobs. The in-memory copy
//! of the index is a cache: every lock acquisition compares the lock file's
//! last-writer token against the one observed at the previous load, and
//! re-reads the index only when another process has written since.
//!
//! A store is constructed read-write or read-only. `is_read_write` is the
//! runtime capability check; every mutating operation on a read-only store
//! fails with [`StoreError::StoreIsReadOnly`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::{Result, StoreError};
use crate::lockfile::{LastWrite, LockFile};

/// A record kind stored in a catalog.
pub trait Entity: Clone + Serialize + DeserializeOwned {
    /// Record kind name, used in log messages.
    const KIND: &'static str;

    fn id(&self) -> &str;
    fn names(&self) -> &[String];
    fn set_names(&mut self, names: Vec<String>);

    /// The "not known" error for this kind.
    fn unknown(what: &str) -> StoreError;
}

/// How `update_names` combines the supplied names with the existing ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameOperation {
    Set,
    Add,
    Remove,
}

/// Deduplicate while preserving first occurrence order.
pub fn dedup_names(names: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    names
        .iter()
        .filter(|n| seen.insert(n.as_str()))
        .cloned()
        .collect()
}

/// The in-memory copy of one store's index.
///
/// Mutating accessors mark the catalog dirty; the owning
/// [`MetadataStore`] persists it after a successful write closure.
#[derive(Debug)]
pub struct Catalog<T: Entity> {
    entities: Vec<T>,
    modified: bool,
}

impl<T: Entity> Catalog<T> {
    fn new(entities: Vec<T>) -> Self {
        Self {
            entities,
            modified: false,
        }
    }

    pub fn all(&self) -> &[T] {
        &self.entities
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Mark the catalog dirty without going through a mutating accessor.
    pub fn touch(&mut self) {
        self.modified = true;
    }

    /// Resolve an ID, name, or unambiguous ID prefix.
    pub fn lookup(&self, term: &str) -> Option<&T> {
        if let Some(e) = self.entities.iter().find(|e| e.id() == term) {
            return Some(e);
        }
        if let Some(e) = self
            .entities
            .iter()
            .find(|e| e.names().iter().any(|n| n == term))
        {
            return Some(e);
        }
        let mut matches = self.entities.iter().filter(|e| e.id().starts_with(term));
        match (matches.next(), matches.next()) {
            (Some(e), None) => Some(e),
            _ => None, // no match, or ambiguous prefix
        }
    }

    pub fn contains(&self, term: &str) -> bool {
        self.lookup(term).is_some()
    }

    pub fn get(&self, term: &str) -> Result<&T> {
        self.lookup(term).ok_or_else(|| T::unknown(term))
    }

    /// Mutable resolution; marks the catalog dirty.
    pub fn get_mut(&mut self, term: &str) -> Result<&mut T> {
        let id = self.get(term)?.id().to_string();
        self.modified = true;
        self.entities
            .iter_mut()
            .find(|e| e.id() == id)
            .ok_or_else(|| T::unknown(term))
    }

    /// Add a record, rejecting duplicate IDs and names already in use.
    pub fn insert(&mut self, entity: T) -> Result<()> {
        if self.entities.iter().any(|e| e.id() == entity.id()) {
            return Err(StoreError::DuplicateId(entity.id().to_string()));
        }
        for name in entity.names() {
            if self
                .entities
                .iter()
                .any(|e| e.names().iter().any(|n| n == name))
            {
                return Err(StoreError::DuplicateName(name.clone()));
            }
        }
        self.entities.push(entity);
        self.modified = true;
        Ok(())
    }

    /// Remove a record by exact ID.
    pub fn remove(&mut self, id: &str) -> Result<T> {
        let idx = self
            .entities
            .iter()
            .position(|e| e.id() == id)
            .ok_or_else(|| T::unknown(id))?;
        self.modified = true;
        Ok(self.entities.remove(idx))
    }

    /// Detach `name` from whichever record currently holds it.
    fn steal_name(&mut self, name: &str, keep_id: &str) {
        for e in &mut self.entities {
            if e.id() != keep_id && e.names().iter().any(|n| n == name) {
                let kept: Vec<String> =
                    e.names().iter().filter(|n| *n != name).cloned().collect();
                e.set_names(kept);
                self.modified = true;
            }
        }
    }

    /// Apply a name update. Added names are prepended; in every mode a name
    /// is first detached from any other record that held it.
    pub fn update_names(
        &mut self,
        id: &str,
        names: &[String],
        op: NameOperation,
    ) -> Result<()> {
        let entity = self.get(id)?;
        let id = entity.id().to_string();
        let old = entity.names().to_vec();
        let new = match op {
            NameOperation::Set => dedup_names(names),
            NameOperation::Add => {
                let mut combined = names.to_vec();
                combined.extend(old.clone());
                dedup_names(&combined)
            }
            NameOperation::Remove => old
                .iter()
                .filter(|n| !names.contains(n))
                .cloned()
                .collect(),
        };
        if op != NameOperation::Remove {
            for name in &new {
                self.steal_name(name, &id);
            }
        }
        let entity = self.get_mut(&id)?;
        entity.set_names(new);
        Ok(())
    }
}

/// File names the caller's big-data keys mangle into.
///
/// Keys made only of safe characters are kept readable; anything else is
/// hex-mangled behind a `=` prefix so arbitrary keys stay on one filename.
pub fn big_data_base_name(key: &str) -> String {
    let safe = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || ".-_:".contains(c);
    if !key.is_empty() && key.chars().all(safe) {
        key.to_string()
    } else {
        format!("={}", hex::encode(key.as_bytes()))
    }
}

/// One store directory: JSON index + lock file + per-record data dirs.
#[derive(Debug)]
pub struct MetadataStore<T: Entity> {
    dir: PathBuf,
    index_path: PathBuf,
    lockfile: Arc<LockFile>,
    read_only: bool,
    state: Mutex<CachedState<T>>,
}

#[derive(Debug)]
struct CachedState<T: Entity> {
    catalog: Catalog<T>,
    last_write: LastWrite,
    /// False forces a reload on the next lock acquisition.
    valid: bool,
}

impl<T: Entity> MetadataStore<T> {
    /// Open (creating if needed) a writable store directory.
    pub fn open(dir: &Path, index_name: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let lockfile = Arc::new(LockFile::open(dir.join(format!("{index_name}.lock")))?);
        Self::finish_open(dir, index_name, lockfile, false)
    }

    /// Open an existing store directory without write access.
    pub fn open_read_only(dir: &Path, index_name: &str) -> Result<Self> {
        let lock_path = dir.join(format!("{index_name}.lock"));
        // The lock file may not be writable to us; fall back to read-only.
        let lockfile = match LockFile::open(&lock_path) {
            Ok(lf) => Arc::new(lf),
            Err(_) => Arc::new(LockFile::open_read_only(&lock_path)?),
        };
        Self::finish_open(dir, index_name, lockfile, true)
    }

    fn finish_open(
        dir: &Path,
        index_name: &str,
        lockfile: Arc<LockFile>,
        read_only: bool,
    ) -> Result<Self> {
        let store = Self {
            dir: dir.to_path_buf(),
            index_path: dir.join(format!("{index_name}.json")),
            lockfile,
            read_only,
            state: Mutex::new(CachedState {
                catalog: Catalog::new(Vec::new()),
                last_write: LastWrite::default(),
                valid: false,
            }),
        };
        Ok(store)
    }

    pub fn data_dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_read_write(&self) -> bool {
        !self.read_only
    }

    pub fn lockfile(&self) -> &Arc<LockFile> {
        &self.lockfile
    }

    /// Where a record's big-data blobs and userdata live.
    pub fn record_dir(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    pub fn big_data_path(&self, id: &str, key: &str) -> PathBuf {
        self.record_dir(id).join(big_data_base_name(key))
    }

    fn load_locked(&self, state: &mut CachedState<T>) -> Result<()> {
        let (current, modified) = self.lockfile.modified_since(&state.last_write)?;
        if state.valid && !modified {
            return Ok(());
        }
        let entities: Vec<T> = match std::fs::read(&self.index_path) {
            Ok(bytes) if !bytes.is_empty() => serde_json::from_slice(&bytes)?,
            Ok(_) => Vec::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        state.catalog = Catalog::new(entities);
        state.last_write = current;
        state.valid = true;
        Ok(())
    }

    fn save_locked(&self, state: &mut CachedState<T>) -> Result<()> {
        let bytes = serde_json::to_vec(&state.catalog.entities)?;
        // Write-then-rename keeps readers in other processes off a torn file.
        let tmp = self.index_path.with_extension("tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, &self.index_path)?;
        state.last_write = self.lockfile.record_write()?;
        state.catalog.modified = false;
        Ok(())
    }

    /// Run a closure with a shared lock and a fresh view of the catalog.
    pub fn read<R>(&self, f: impl FnOnce(&Catalog<T>) -> Result<R>) -> Result<R> {
        let _guard = self.lockfile.rlock();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.load_locked(&mut state)?;
        f(&state.catalog)
    }

    /// Run a closure with the exclusive lock; persist the catalog and record
    /// a write if the closure modified it.
    ///
    /// # Errors
    ///
    /// [`StoreError::StoreIsReadOnly`] on a read-only store, before taking
    /// any lock.
    pub fn write<R>(&self, f: impl FnOnce(&mut Catalog<T>) -> Result<R>) -> Result<R> {
        if self.read_only {
            return Err(StoreError::StoreIsReadOnly(self.dir.clone()));
        }
        let _guard = self.lockfile.lock();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.load_locked(&mut state)?;
        match f(&mut state.catalog) {
            Ok(r) => {
                if state.catalog.is_modified() {
                    self.save_locked(&mut state)?;
                }
                Ok(r)
            }
            Err(e) => {
                // The closure may have half-applied changes; drop the cache.
                state.valid = false;
                Err(e)
            }
        }
    }

    /// Read one big-data blob; the record must exist.
    pub fn big_data(&self, id: &str, key: &str) -> Result<Vec<u8>> {
        self.read(|catalog| {
            let entity = catalog.get(id)?;
            Ok(std::fs::read(self.big_data_path(entity.id(), key))?)
        })
    }

    /// Size of one big-data blob on disk.
    pub fn big_data_size_on_disk(&self, id: &str, key: &str) -> Result<i64> {
        self.read(|catalog| {
            let entity = catalog.get(id)?;
            match std::fs::metadata(self.big_data_path(entity.id(), key)) {
                Ok(m) => Ok(m.len() as i64),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(StoreError::SizeUnknown)
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Write one big-data blob. Callers run this inside a `write` closure's
    /// scope by passing the resolved exact ID.
    pub fn write_big_data_file(&self, id: &str, key: &str, data: &[u8]) -> Result<()> {
        let dir = self.record_dir(id);
        std::fs::create_dir_all(&dir)?;
        let path = self.big_data_path(id, key);
        let tmp = dir.join(format!(".tmp-{}", big_data_base_name(key)));
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Delete a record's data directory, if present.
    pub fn remove_record_dir(&self, id: &str) -> Result<()> {
        match std::fs::remove_dir_all(self.record_dir(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Generate a fresh 64-hex-character record ID.
pub fn generate_id() -> String {
    use rand::RngCore;
    let mut buf = [0u8; 32];
    rand::rng().fill_bytes(&mut buf);
    hex::encode(buf)
}
