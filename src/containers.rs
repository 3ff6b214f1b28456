//! The container store.
//!
//! A container pairs an image with a private writable layer, plus the ID
//! mappings that layer was created under and two userdata directories (one
//! persistent, one under the run root).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::errors::{Result, StoreError};
use crate::idset::IdMap;
use crate::metadata::{dedup_names, Entity, MetadataStore, NameOperation};

/// A container record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
    pub image: String,
    pub layer: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub metadata: String,
    pub created: SystemTime,
    #[serde(default, rename = "uidmap", skip_serializing_if = "Vec::is_empty")]
    pub uid_map: Vec<IdMap>,
    #[serde(default, rename = "gidmap", skip_serializing_if = "Vec::is_empty")]
    pub gid_map: Vec<IdMap>,
    #[serde(
        default,
        rename = "mount-opts",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub mount_opts: Vec<String>,
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
    #[serde(
        default,
        rename = "big-data-sizes",
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub big_data_sizes: HashMap<String, i64>,
    #[serde(
        default,
        rename = "big-data-digests",
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub big_data_digests: HashMap<String, Digest>,
}

impl Entity for Container {
    const KIND: &'static str = "container";

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
        StoreError::ContainerUnknown(what.to_string())
    }
}

/// Caller-supplied knobs for creating a container record.
#[derive(Debug, Clone, Default)]
pub struct ContainerOptions {
    pub metadata: String,
    pub uid_map: Vec<IdMap>,
    pub gid_map: Vec<IdMap>,
    pub mount_opts: Vec<String>,
    pub volatile: bool,
    pub flags: HashMap<String, serde_json::Value>,
}

/// A store of container records backed by one directory.
pub struct ContainerStore {
    store: MetadataStore<Container>,
    run_dir: PathBuf,
}

impl ContainerStore {
    pub fn open(data_dir: &Path, run_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(run_dir)?;
        Ok(Self {
            store: MetadataStore::open(data_dir, "containers")?,
            run_dir: run_dir.to_path_buf(),
        })
    }

    pub fn data_dir(&self) -> &Path {
        self.store.data_dir()
    }

    /// Create a container record over an existing image and layer.
    pub fn create(
        &self,
        id: Option<String>,
        names: &[String],
        image: &str,
        layer: &str,
        options: &ContainerOptions,
    ) -> Result<Container> {
        let id = id.unwrap_or_else(crate::metadata::generate_id);
        let names = dedup_names(names);
        self.store.write(|catalog| {
            let container = Container {
                id: id.clone(),
                names: names.clone(),
                image: image.to_string(),
                layer: layer.to_string(),
                metadata: options.metadata.clone(),
                created: SystemTime::now(),
                uid_map: options.uid_map.clone(),
                gid_map: options.gid_map.clone(),
                mount_opts: options.mount_opts.clone(),
                volatile: options.volatile,
                flags: options.flags.clone(),
                big_data_names: Vec::new(),
                big_data_sizes: HashMap::new(),
                big_data_digests: HashMap::new(),
            };
            catalog.insert(container)?;
            Ok(catalog.get(&id)?.clone())
        })
    }

    pub fn get(&self, id: &str) -> Result<Container> {
        self.store.read(|catalog| Ok(catalog.get(id)?.clone()))
    }

    pub fn exists(&self, id: &str) -> bool {
        self.store
            .read(|catalog| Ok(catalog.contains(id)))
            .unwrap_or(false)
    }

    pub fn all(&self) -> Result<Vec<Container>> {
        self.store.read(|catalog| Ok(catalog.all().to_vec()))
    }

    pub fn update_names(&self, id: &str, names: &[String], op: NameOperation) -> Result<()> {
        self.store
            .write(|catalog| catalog.update_names(id, names, op))
    }

    pub fn set_metadata(&self, id: &str, metadata: &str) -> Result<()> {
        self.store.write(|catalog| {
            catalog.get_mut(id)?.metadata = metadata.to_string();
            Ok(())
        })
    }

    /// The container whose private layer is `layer`, if any.
    pub fn by_layer(&self, layer: &str) -> Result<Option<Container>> {
        self.store.read(|catalog| {
            Ok(catalog
                .all()
                .iter()
                .find(|c| c.layer == layer)
                .cloned())
        })
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        self.store.write(|catalog| {
            let id = catalog.get(id)?.id().to_string();
            catalog.remove(&id)?;
            self.store.remove_record_dir(&id)?;
            let run_dir = self.run_dir.join(&id);
            match std::fs::remove_dir_all(&run_dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            Ok(())
        })
    }

    pub fn wipe(&self) -> Result<()> {
        let ids: Vec<String> = self
            .store
            .read(|catalog| Ok(catalog.all().iter().map(|c| c.id.clone()).collect()))?;
        for id in ids {
            self.delete(&id)?;
        }
        Ok(())
    }

    // Userdata directories.

    /// The container's persistent userdata directory, created on demand.
    pub fn directory(&self, id: &str) -> Result<PathBuf> {
        let id = self.store.read(|catalog| Ok(catalog.get(id)?.id().to_string()))?;
        let dir = self.store.record_dir(&id).join("userdata");
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// The container's run-root userdata directory, created on demand.
    pub fn run_directory(&self, id: &str) -> Result<PathBuf> {
        let id = self.store.read(|catalog| Ok(catalog.get(id)?.id().to_string()))?;
        let dir = self.run_dir.join(id).join("userdata");
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    // Big data.

    pub fn big_data(&self, id: &str, key: &str) -> Result<Vec<u8>> {
        self.store.big_data(id, key)
    }

    pub fn big_data_names(&self, id: &str) -> Result<Vec<String>> {
        self.store
            .read(|catalog| Ok(catalog.get(id)?.big_data_names.clone()))
    }

    pub fn big_data_size(&self, id: &str, key: &str) -> Result<i64> {
        self.store.read(|catalog| {
            catalog
                .get(id)?
                .big_data_sizes
                .get(key)
                .copied()
                .ok_or(StoreError::SizeUnknown)
        })
    }

    pub fn big_data_digest(&self, id: &str, key: &str) -> Result<Digest> {
        self.store.read(|catalog| {
            catalog
                .get(id)?
                .big_data_digests
                .get(key)
                .cloned()
                .ok_or(StoreError::DigestUnknown)
        })
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
            entry.big_data_sizes.insert(key.to_string(), data.len() as i64);
            entry
                .big_data_digests
                .insert(key.to_string(), Digest::sha256(data));
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(tmp: &Path) -> ContainerStore {
        ContainerStore::open(&tmp.join("dir-containers"), &tmp.join("run-containers"))
            .unwrap()
    }

    #[test]
    fn test_create_lookup_by_layer() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path());

        let c = store
            .create(
                None,
                &["webserver".to_string()],
                "image-id",
                "layer-id",
                &ContainerOptions::default(),
            )
            .unwrap();

        assert_eq!(store.get("webserver").unwrap().id, c.id);
        assert_eq!(store.by_layer("layer-id").unwrap().unwrap().id, c.id);
        assert!(store.by_layer("nope").unwrap().is_none());
    }

    #[test]
    fn test_userdata_directories_removed_on_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path());

        let c = store
            .create(None, &[], "img", "layer", &ContainerOptions::default())
            .unwrap();
        let dir = store.directory(&c.id).unwrap();
        let run_dir = store.run_directory(&c.id).unwrap();
        std::fs::write(dir.join("hosts"), b"127.0.0.1").unwrap();
        std::fs::write(run_dir.join("pidfile"), b"1234").unwrap();

        store.delete(&c.id).unwrap();
        assert!(!dir.exists());
        assert!(!run_dir.exists());
        assert!(!store.exists(&c.id));
    }

    #[test]
    fn test_big_data_records_size_and_digest() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path());

        let c = store
            .create(None, &[], "img", "layer", &ContainerOptions::default())
            .unwrap();
        store.set_big_data(&c.id, "config", b"{}").unwrap();
        assert_eq!(store.big_data(&c.id, "config").unwrap(), b"{}");
        assert_eq!(store.big_data_size(&c.id, "config").unwrap(), 2);
        assert_eq!(
            store.big_data_digest(&c.id, "config").unwrap(),
            Digest::sha256(b"{}")
        );
    }
}
