//! The layer store.
//!
//! Layers are copy-on-write filesystem snapshots managed by a
//! [`Driver`](crate::drivers::Driver). The store keeps the metadata records
//! (parentage, digests, mappings) and retains each applied diff stream
//! verbatim, so `diff` replays the exact bytes that were applied and the
//! consistency checker can re-verify them against the recorded digest.
//!
//! Mount bookkeeping (reference counts and mount points) lives under the run
//! root, so a reboot implicitly resets it.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::digest::{Digest, DigestWriter};
use crate::drivers::{set_mtime, CreateOptions, Driver, MountOptions};
use crate::errors::{Result, StoreError};
use crate::idset::IdMap;
use crate::metadata::{dedup_names, Entity, MetadataStore, NameOperation};

/// Prefix marking a deletion in a diff stream.
pub const WHITEOUT_PREFIX: &str = ".wh.";
/// Name marking "hide everything below from lower layers" in a directory.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// A copy-on-write layer record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layer {
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(
        default,
        rename = "mount-label",
        skip_serializing_if = "Option::is_none"
    )]
    pub mount_label: Option<String>,
    pub created: SystemTime,
    #[serde(
        default,
        rename = "compressed-digest",
        skip_serializing_if = "Option::is_none"
    )]
    pub compressed_digest: Option<Digest>,
    #[serde(
        default,
        rename = "compressed-size",
        skip_serializing_if = "Option::is_none"
    )]
    pub compressed_size: Option<i64>,
    #[serde(
        default,
        rename = "diff-digest",
        skip_serializing_if = "Option::is_none"
    )]
    pub uncompressed_digest: Option<Digest>,
    #[serde(default, rename = "diff-size", skip_serializing_if = "Option::is_none")]
    pub uncompressed_size: Option<i64>,
    #[serde(default, rename = "uidmap", skip_serializing_if = "Vec::is_empty")]
    pub uid_map: Vec<IdMap>,
    #[serde(default, rename = "gidmap", skip_serializing_if = "Vec::is_empty")]
    pub gid_map: Vec<IdMap>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub volatile: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub flags: HashMap<String, serde_json::Value>,
    #[serde(
        default,
        rename = "big-data-names",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub big_data_names: Vec<String>,
}

impl Entity for Layer {
    const KIND: &'static str = "layer";

    fn id(&self) -> &str {
        &self.id
    }

    fn names(&self) -> &[String] {
        &self.names
    }

    fn set_names(&mut self, names: Vec<String>) {
        self.names = names;
    }

    fn unknown(what: &str) -> StoreError {
        StoreError::LayerUnknown(what.to_string())
    }
}

/// Caller-supplied knobs for creating a layer.
#[derive(Debug, Clone, Default)]
pub struct LayerOptions {
    pub mount_label: Option<String>,
    pub uid_maps: Vec<IdMap>,
    pub gid_maps: Vec<IdMap>,
    pub volatile: bool,
    pub flags: HashMap<String, serde_json::Value>,
    /// Digest/size of the compressed form the diff arrived in, as the caller
    /// observed them; recorded verbatim.
    pub original_digest: Option<Digest>,
    pub original_size: Option<i64>,
    /// Expected uncompressed digest; mismatch with the applied stream fails
    /// the create.
    pub uncompressed_digest: Option<Digest>,
}

/// Mount bookkeeping for one layer, persisted under the run root.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MountState {
    count: u32,
    path: PathBuf,
}

/// A store of layer records backed by one directory and one driver.
pub struct LayerStore {
    store: MetadataStore<Layer>,
    run_dir: PathBuf,
    driver: Arc<dyn Driver>,
}

impl LayerStore {
    /// Open (creating if needed) the writable layer store.
    pub fn open(data_dir: &Path, run_dir: &Path, driver: Arc<dyn Driver>) -> Result<Self> {
        std::fs::create_dir_all(run_dir)?;
        Ok(Self {
            store: MetadataStore::open(data_dir, "layers")?,
            run_dir: run_dir.to_path_buf(),
            driver,
        })
    }

    /// Open an additional layer store without write access.
    pub fn open_read_only(
        data_dir: &Path,
        run_dir: &Path,
        driver: Arc<dyn Driver>,
    ) -> Result<Self> {
        Ok(Self {
            store: MetadataStore::open_read_only(data_dir, "layers")?,
            run_dir: run_dir.to_path_buf(),
            driver,
        })
    }

    pub fn is_read_write(&self) -> bool {
        self.store.is_read_write()
    }

    pub fn data_dir(&self) -> &Path {
        self.store.data_dir()
    }

    fn diff_path(&self, id: &str) -> PathBuf {
        self.store.data_dir().join(format!("{id}.diff.tar"))
    }

    fn mounts_path(&self) -> PathBuf {
        self.run_dir.join("mounts.json")
    }

    fn load_mounts(&self) -> Result<HashMap<String, MountState>> {
        match std::fs::read(self.mounts_path()) {
            Ok(bytes) if !bytes.is_empty() => Ok(serde_json::from_slice(&bytes)?),
            Ok(_) => Ok(HashMap::new()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save_mounts(&self, mounts: &HashMap<String, MountState>) -> Result<()> {
        let bytes = serde_json::to_vec(mounts)?;
        let tmp = self.run_dir.join("mounts.tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, self.mounts_path())?;
        Ok(())
    }

    /// Create a layer, applying `diff` through the driver when given.
    ///
    /// Returns the new record and the uncompressed diff size (-1 when no
    /// diff was supplied). A diff that fails to apply, or whose digest does
    /// not match `options.uncompressed_digest`, aborts the create and tears
    /// the driver layer down again.
    pub fn create(
        &self,
        id: Option<String>,
        parent: Option<&str>,
        names: &[String],
        writable: bool,
        options: &LayerOptions,
        diff: Option<&mut dyn Read>,
    ) -> Result<(Layer, i64)> {
        let id = id.unwrap_or_else(crate::metadata::generate_id);
        let names = dedup_names(names);
        let parent = parent.map(str::to_string);

        self.store.write(|catalog| {
            let layer = Layer {
                id: id.clone(),
                names: names.clone(),
                parent: parent.clone(),
                mount_label: options.mount_label.clone(),
                created: SystemTime::now(),
                compressed_digest: options.original_digest.clone(),
                compressed_size: options.original_size,
                uncompressed_digest: None,
                uncompressed_size: None,
                uid_map: options.uid_maps.clone(),
                gid_map: options.gid_maps.clone(),
                volatile: options.volatile,
                flags: options.flags.clone(),
                big_data_names: Vec::new(),
            };
            catalog.insert(layer)?;

            self.driver.create(
                &id,
                parent.as_deref(),
                &CreateOptions {
                    mount_label: options.mount_label.clone(),
                    writable,
                    uid_maps: options.uid_maps.clone(),
                    gid_maps: options.gid_maps.clone(),
                },
            )?;

            let mut size = -1i64;
            if let Some(diff) = diff {
                match self.apply_diff_locked(&id, diff) {
                    Ok((digest, applied_size)) => {
                        if let Some(expected) = &options.uncompressed_digest {
                            if *expected != digest {
                                self.discard_driver_layer(&id);
                                return Err(StoreError::InvalidDigest(format!(
                                    "expected {expected}, applied diff was {digest}"
                                )));
                            }
                        }
                        let entry = catalog.get_mut(&id)?;
                        entry.uncompressed_digest = Some(digest);
                        entry.uncompressed_size = Some(applied_size);
                        size = applied_size;
                    }
                    Err(e) => {
                        warn!("applying diff to new layer {id}: {e}; deleting it again");
                        self.discard_driver_layer(&id);
                        return Err(e);
                    }
                }
            }
            let layer = catalog.get(&id)?.clone();
            Ok((layer, size))
        })
    }

    fn discard_driver_layer(&self, id: &str) {
        if let Err(e) = self.driver.remove(id) {
            warn!("cleaning up driver layer {id}: {e}");
        }
        let _ = std::fs::remove_file(self.diff_path(id));
    }

    /// Stream the diff into a retained copy while hashing it, then unpack
    /// the copy through the driver.
    fn apply_diff_locked(&self, id: &str, diff: &mut dyn Read) -> Result<(Digest, i64)> {
        let blob_path = self.diff_path(id);
        let tmp_path = self.store.data_dir().join(format!("{id}.diff.tmp"));
        let mut blob = std::fs::File::create(&tmp_path)?;
        let mut hasher = DigestWriter::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = diff.read(&mut buf)?;
            if n == 0 {
                break;
            }
            blob.write_all(&buf[..n])?;
            hasher.write_all(&buf[..n])?;
        }
        blob.flush()?;
        drop(blob);
        std::fs::rename(&tmp_path, &blob_path)?;

        let size = hasher.count() as i64;
        let digest = hasher.digest();

        let mount = self.driver.get(id, &MountOptions::default())?;
        let applied = apply_tar(&mount, std::fs::File::open(&blob_path)?);
        self.driver.put(id)?;
        applied?;

        Ok((digest, size))
    }

    /// Where a layer's retained diff stream lives, if one was recorded.
    pub fn diff_blob_path(&self, id: &str) -> Option<PathBuf> {
        let path = self.diff_path(id);
        path.is_file().then_some(path)
    }

    /// Create an ID-mapped copy of `template` for consumers whose driver
    /// cannot shift IDs at mount time.
    ///
    /// The copy shares the template's parent and content; its retained diff
    /// stream (and with it the recorded digests) carries over only when
    /// `template_blob` points at one.
    pub fn create_mapped_copy(
        &self,
        template: &Layer,
        template_blob: Option<&Path>,
        uid_maps: &[IdMap],
        gid_maps: &[IdMap],
    ) -> Result<Layer> {
        let id = crate::metadata::generate_id();
        self.store.write(|catalog| {
            let carry_diff = template_blob.is_some();
            let layer = Layer {
                id: id.clone(),
                names: Vec::new(),
                parent: template.parent.clone(),
                mount_label: template.mount_label.clone(),
                created: SystemTime::now(),
                compressed_digest: template.compressed_digest.clone().filter(|_| carry_diff),
                compressed_size: template.compressed_size.filter(|_| carry_diff),
                uncompressed_digest: template.uncompressed_digest.clone().filter(|_| carry_diff),
                uncompressed_size: template.uncompressed_size.filter(|_| carry_diff),
                uid_map: uid_maps.to_vec(),
                gid_map: gid_maps.to_vec(),
                volatile: false,
                flags: HashMap::new(),
                big_data_names: Vec::new(),
            };
            catalog.insert(layer)?;

            self.driver.create(
                &id,
                Some(&template.id),
                &CreateOptions {
                    mount_label: template.mount_label.clone(),
                    writable: false,
                    uid_maps: uid_maps.to_vec(),
                    gid_maps: gid_maps.to_vec(),
                },
            )?;
            if let Some(blob) = template_blob {
                if let Err(e) = std::fs::copy(blob, self.diff_path(&id)) {
                    self.discard_driver_layer(&id);
                    return Err(e.into());
                }
            }
            Ok(catalog.get(&id)?.clone())
        })
    }

    /// Replace a layer's content with a new diff, rewriting digests.
    pub fn apply_diff(&self, id: &str, diff: &mut dyn Read) -> Result<i64> {
        self.store.write(|catalog| {
            let id = catalog.get(id)?.id().to_string();
            let (digest, size) = self.apply_diff_locked(&id, diff)?;
            let entry = catalog.get_mut(&id)?;
            entry.uncompressed_digest = Some(digest);
            entry.uncompressed_size = Some(size);
            Ok(size)
        })
    }

    /// Replay the exact diff stream that was applied to a layer.
    pub fn diff(&self, id: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.store.read(|catalog| {
            let layer = catalog.get(id)?;
            Ok(self.diff_path(layer.id()))
        })?;
        match std::fs::File::open(&path) {
            Ok(f) => Ok(Box::new(f)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(
                StoreError::NotSupported(format!("layer {id} has no recorded diff")),
            ),
            Err(e) => Err(e.into()),
        }
    }

    /// Uncompressed size of a layer's diff.
    pub fn diff_size(&self, id: &str) -> Result<i64> {
        self.store.read(|catalog| {
            let layer = catalog.get(id)?;
            match layer.uncompressed_size {
                Some(size) => Ok(size),
                None => Err(StoreError::SizeUnknown),
            }
        })
    }

    /// Mount a layer, bumping its reference count.
    pub fn mount(&self, id: &str, options: &MountOptions) -> Result<PathBuf> {
        self.store.write(|catalog| {
            let layer = catalog.get(id)?;
            let id = layer.id().to_string();
            let mut options = options.clone();
            if options.mount_label.is_none() {
                options.mount_label = layer.mount_label.clone();
            }
            if options.uid_maps.is_empty() {
                options.uid_maps = layer.uid_map.clone();
            }
            if options.gid_maps.is_empty() {
                options.gid_maps = layer.gid_map.clone();
            }
            let mut mounts = self.load_mounts()?;
            if let Some(state) = mounts.get_mut(&id) {
                state.count += 1;
                let path = state.path.clone();
                self.save_mounts(&mounts)?;
                return Ok(path);
            }
            let path = self.driver.get(&id, &options)?;
            mounts.insert(
                id,
                MountState {
                    count: 1,
                    path: path.clone(),
                },
            );
            self.save_mounts(&mounts)?;
            Ok(path)
        })
    }

    /// Unmount a layer. With `force`, the reference count is ignored.
    ///
    /// Returns whether the layer is still mounted afterwards.
    pub fn unmount(&self, id: &str, force: bool) -> Result<bool> {
        self.store.write(|catalog| {
            // Resolve through the catalog when possible, but let a mount
            // entry for an already-deleted record still be torn down.
            let id = match catalog.lookup(id) {
                Some(layer) => layer.id().to_string(),
                None => id.to_string(),
            };
            let mut mounts = self.load_mounts()?;
            let Some(state) = mounts.get_mut(&id) else {
                return Err(StoreError::LayerNotMounted(id));
            };
            if !force && state.count > 1 {
                state.count -= 1;
                self.save_mounts(&mounts)?;
                return Ok(true);
            }
            mounts.remove(&id);
            self.save_mounts(&mounts)?;
            self.driver.put(&id)?;
            Ok(false)
        })
    }

    /// How many times a layer is currently mounted, and where.
    pub fn mounted(&self, id: &str) -> Result<(u32, Option<PathBuf>)> {
        self.store.read(|catalog| {
            let id = match catalog.lookup(id) {
                Some(layer) => layer.id().to_string(),
                None => id.to_string(),
            };
            let mounts = self.load_mounts()?;
            Ok(match mounts.get(&id) {
                Some(state) => (state.count, Some(state.path.clone())),
                None => (0, None),
            })
        })
    }

    /// IDs of every mounted layer.
    pub fn mounted_layers(&self) -> Result<Vec<String>> {
        self.store
            .read(|_| Ok(self.load_mounts()?.keys().cloned().collect()))
    }

    /// Delete a layer record and its driver content.
    ///
    /// Dependency checks (children, images, containers) are the caller's
    /// business; this store only refuses while the layer is mounted, unless
    /// `force` unmounts it first.
    pub fn delete(&self, id: &str, force: bool) -> Result<()> {
        self.store.write(|catalog| {
            let id = catalog.get(id)?.id().to_string();
            let mut mounts = self.load_mounts()?;
            if mounts.remove(&id).is_some() {
                if !force {
                    return Err(StoreError::LayerUsedByContainer(format!(
                        "layer {id} is still mounted"
                    )));
                }
                self.save_mounts(&mounts)?;
                self.driver.put(&id)?;
            }
            catalog.remove(&id)?;
            self.driver.remove(&id)?;
            let _ = std::fs::remove_file(self.diff_path(&id));
            self.store.remove_record_dir(&id)?;
            Ok(())
        })
    }

    /// Remove every layer.
    pub fn wipe(&self) -> Result<()> {
        let ids: Vec<String> = self.store.read(|catalog| {
            Ok(catalog.all().iter().map(|l| l.id.clone()).collect())
        })?;
        for id in ids {
            self.delete(&id, true)?;
        }
        Ok(())
    }

    // Record accessors.

    pub fn get(&self, id: &str) -> Result<Layer> {
        self.store.read(|catalog| Ok(catalog.get(id)?.clone()))
    }

    pub fn exists(&self, id: &str) -> bool {
        self.store
            .read(|catalog| Ok(catalog.contains(id)))
            .unwrap_or(false)
    }

    pub fn all(&self) -> Result<Vec<Layer>> {
        self.store.read(|catalog| Ok(catalog.all().to_vec()))
    }

    pub fn update_names(&self, id: &str, names: &[String], op: NameOperation) -> Result<()> {
        self.store
            .write(|catalog| catalog.update_names(id, names, op))
    }

    pub fn by_compressed_digest(&self, digest: &Digest) -> Result<Vec<Layer>> {
        self.by_digest(|l| l.compressed_digest.as_ref() == Some(digest))
    }

    pub fn by_uncompressed_digest(&self, digest: &Digest) -> Result<Vec<Layer>> {
        self.by_digest(|l| l.uncompressed_digest.as_ref() == Some(digest))
    }

    fn by_digest(&self, pred: impl Fn(&Layer) -> bool) -> Result<Vec<Layer>> {
        self.store.read(|catalog| {
            Ok(catalog.all().iter().filter(|l| pred(l)).cloned().collect())
        })
    }

    /// IDs of the direct children of a layer.
    pub fn children(&self, id: &str) -> Result<Vec<String>> {
        self.store.read(|catalog| {
            let id = catalog.get(id)?.id().to_string();
            Ok(catalog
                .all()
                .iter()
                .filter(|l| l.parent.as_deref() == Some(id.as_str()))
                .map(|l| l.id.clone())
                .collect())
        })
    }

    // Big data.

    pub fn big_data(&self, id: &str, key: &str) -> Result<Vec<u8>> {
        self.store.big_data(id, key)
    }

    pub fn big_data_names(&self, id: &str) -> Result<Vec<String>> {
        self.store
            .read(|catalog| Ok(catalog.get(id)?.big_data_names.clone()))
    }

    pub fn set_big_data(&self, id: &str, key: &str, data: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(StoreError::IncompleteOptions(
                "data item name is empty".into(),
            ));
        }
        self.store.write(|catalog| {
            let id = catalog.get(id)?.id().to_string();
            self.store.write_big_data_file(&id, key, data)?;
            let entry = catalog.get_mut(&id)?;
            if !entry.big_data_names.iter().any(|n| n == key) {
                entry.big_data_names.push(key.to_string());
            }
            Ok(())
        })
    }

}

/// Unpack a diff stream into a directory, honouring whiteouts.
pub fn apply_tar(root: &Path, reader: impl Read) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);
    let mut directory_times: Vec<(PathBuf, SystemTime)> = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let rel = entry.path()?.into_owned();
        let file_name = rel
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if file_name == OPAQUE_WHITEOUT {
            let dir = match rel.parent() {
                Some(parent) => root.join(parent),
                None => root.to_path_buf(),
            };
            if dir.is_dir() {
                for child in std::fs::read_dir(&dir)? {
                    let child = child?;
                    if child.file_type()?.is_dir() {
                        std::fs::remove_dir_all(child.path())?;
                    } else {
                        std::fs::remove_file(child.path())?;
                    }
                }
            }
            continue;
        }
        if let Some(target) = file_name.strip_prefix(WHITEOUT_PREFIX) {
            let victim = match rel.parent() {
                Some(parent) => root.join(parent).join(target),
                None => root.join(target),
            };
            match std::fs::symlink_metadata(&victim) {
                Ok(m) if m.is_dir() => std::fs::remove_dir_all(&victim)?,
                Ok(_) => std::fs::remove_file(&victim)?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            continue;
        }

        let header = entry.header();
        let is_dir = header.entry_type().is_dir();
        let mtime = header.mtime().unwrap_or(0);
        let uid = header.uid().unwrap_or(0) as u32;
        let gid = header.gid().unwrap_or(0) as u32;
        entry.unpack_in(root)?;

        let dest = root.join(&rel);
        // Ownership application is best-effort; unprivileged callers keep
        // their own IDs.
        let _ = rustix::fs::chownat(
            rustix::fs::CWD,
            &dest,
            Some(rustix::fs::Uid::from_raw(uid)),
            Some(rustix::fs::Gid::from_raw(gid)),
            rustix::fs::AtFlags::SYMLINK_NOFOLLOW,
        );
        if is_dir {
            directory_times.push((
                dest,
                std::time::UNIX_EPOCH + std::time::Duration::from_secs(mtime),
            ));
        }
    }

    // Writing children bumped the parents' mtimes; restore them deepest
    // first.
    directory_times.sort_by(|a, b| b.0.components().count().cmp(&a.0.components().count()));
    for (dir, mtime) in directory_times {
        if dir.is_dir() {
            set_mtime(&dir, mtime)?;
        }
    }
    Ok(())
}
