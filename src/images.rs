//! The image store.
//!
//! An image names a top layer plus metadata and big-data blobs (manifests,
//! configs). Big-data digests the caller records feed the by-digest index,
//! so an image is findable by its manifest digest regardless of which key
//! the manifest was stored under.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::errors::{Result, StoreError};
use crate::metadata::{dedup_names, Entity, MetadataStore, NameOperation};

/// An image record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,
    /// Digests the caller explicitly associated with this image, beyond the
    /// recorded big-data digests.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub digests: Vec<Digest>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
    #[serde(
        default,
        rename = "names-history",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub names_history: Vec<String>,
    #[serde(default, rename = "layer", skip_serializing_if = "Option::is_none")]
    pub top_layer: Option<String>,
    #[serde(
        default,
        rename = "mapped-layers",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub mapped_top_layers: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub metadata: String,
    pub created: SystemTime,
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
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub flags: HashMap<String, serde_json::Value>,
}

impl Image {
    /// Every digest this image is known by.
    pub fn all_digests(&self) -> Vec<&Digest> {
        let mut out: Vec<&Digest> = Vec::new();
        if let Some(d) = &self.digest {
            out.push(d);
        }
        for d in &self.digests {
            if !out.contains(&d) {
                out.push(d);
            }
        }
        for d in self.big_data_digests.values() {
            if !out.contains(&d) {
                out.push(d);
            }
        }
        out
    }
}

impl Entity for Image {
    const KIND: &'static str = "image";

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
        StoreError::ImageUnknown(what.to_string())
    }
}

/// Caller-supplied knobs for creating an image.
#[derive(Debug, Clone, Default)]
pub struct ImageOptions {
    pub created: Option<SystemTime>,
    pub digest: Option<Digest>,
    pub digests: Vec<Digest>,
    pub metadata: String,
    pub flags: HashMap<String, serde_json::Value>,
}

/// A store of image records backed by one directory.
pub struct ImageStore {
    store: MetadataStore<Image>,
}

impl ImageStore {
    pub fn open(data_dir: &Path) -> Result<Self> {
        Ok(Self {
            store: MetadataStore::open(data_dir, "images")?,
        })
    }

    pub fn open_read_only(data_dir: &Path) -> Result<Self> {
        Ok(Self {
            store: MetadataStore::open_read_only(data_dir, "images")?,
        })
    }

    pub fn is_read_write(&self) -> bool {
        self.store.is_read_write()
    }

    pub fn data_dir(&self) -> &Path {
        self.store.data_dir()
    }

    /// Create an image record.
    ///
    /// `searchable_digest` semantics: the digest in `options.digest` is the
    /// image's canonical one; `options.digests` extend the searchable set.
    pub fn create(
        &self,
        id: Option<String>,
        names: &[String],
        top_layer: Option<&str>,
        options: &ImageOptions,
    ) -> Result<Image> {
        let id = id.unwrap_or_else(crate::metadata::generate_id);
        let names = dedup_names(names);
        self.store.write(|catalog| {
            let image = Image {
                id: id.clone(),
                digest: options.digest.clone(),
                digests: options.digests.clone(),
                names: names.clone(),
                names_history: names.clone(),
                top_layer: top_layer.map(str::to_string),
                mapped_top_layers: Vec::new(),
                metadata: options.metadata.clone(),
                created: options.created.unwrap_or_else(SystemTime::now),
                big_data_names: Vec::new(),
                big_data_sizes: HashMap::new(),
                big_data_digests: HashMap::new(),
                flags: options.flags.clone(),
            };
            catalog.insert(image)?;
            Ok(catalog.get(&id)?.clone())
        })
    }

    pub fn get(&self, id: &str) -> Result<Image> {
        self.store.read(|catalog| Ok(catalog.get(id)?.clone()))
    }

    pub fn exists(&self, id: &str) -> bool {
        self.store
            .read(|catalog| Ok(catalog.contains(id)))
            .unwrap_or(false)
    }

    pub fn all(&self) -> Result<Vec<Image>> {
        self.store.read(|catalog| Ok(catalog.all().to_vec()))
    }

    /// Update names; new and stolen names are also appended to the record's
    /// name history.
    pub fn update_names(&self, id: &str, names: &[String], op: NameOperation) -> Result<()> {
        self.store.write(|catalog| {
            catalog.update_names(id, names, op)?;
            if op != NameOperation::Remove {
                let entry = catalog.get_mut(id)?;
                for name in names {
                    if !entry.names_history.contains(name) {
                        entry.names_history.push(name.clone());
                    }
                }
            }
            Ok(())
        })
    }

    pub fn set_metadata(&self, id: &str, metadata: &str) -> Result<()> {
        self.store.write(|catalog| {
            catalog.get_mut(id)?.metadata = metadata.to_string();
            Ok(())
        })
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        self.store.write(|catalog| {
            let id = catalog.get(id)?.id().to_string();
            catalog.remove(&id)?;
            self.store.remove_record_dir(&id)?;
            Ok(())
        })
    }

    pub fn wipe(&self) -> Result<()> {
        let ids: Vec<String> = self
            .store
            .read(|catalog| Ok(catalog.all().iter().map(|i| i.id.clone()).collect()))?;
        for id in ids {
            self.delete(&id)?;
        }
        Ok(())
    }

    /// All images findable by a digest.
    pub fn by_digest(&self, digest: &Digest) -> Result<Vec<Image>> {
        self.store.read(|catalog| {
            Ok(catalog
                .all()
                .iter()
                .filter(|i| i.all_digests().contains(&digest))
                .cloned()
                .collect())
        })
    }

    /// All images whose top layer (canonical or mapped) is `layer`.
    pub fn by_top_layer(&self, layer: &str) -> Result<Vec<Image>> {
        self.store.read(|catalog| {
            Ok(catalog
                .all()
                .iter()
                .filter(|i| {
                    i.top_layer.as_deref() == Some(layer)
                        || i.mapped_top_layers.iter().any(|l| l == layer)
                })
                .cloned()
                .collect())
        })
    }

    pub fn add_mapped_top_layer(&self, id: &str, layer: &str) -> Result<()> {
        self.store.write(|catalog| {
            let entry = catalog.get_mut(id)?;
            if !entry.mapped_top_layers.iter().any(|l| l == layer) {
                entry.mapped_top_layers.push(layer.to_string());
            }
            Ok(())
        })
    }

    pub fn remove_mapped_top_layer(&self, id: &str, layer: &str) -> Result<()> {
        self.store.write(|catalog| {
            let entry = catalog.get_mut(id)?;
            entry.mapped_top_layers.retain(|l| l != layer);
            Ok(())
        })
    }

    /// The image's persistent userdata directory, created on demand.
    pub fn directory(&self, id: &str) -> Result<PathBuf> {
        let id = self.store.read(|catalog| Ok(catalog.get(id)?.id().to_string()))?;
        let dir = self.store.record_dir(&id).join("userdata");
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

    /// Store a big-data blob; `digest` is the caller's digest of `data` and
    /// makes the image findable by it.
    pub fn set_big_data(
        &self,
        id: &str,
        key: &str,
        data: &[u8],
        digest: Option<Digest>,
    ) -> Result<()> {
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
            match digest {
                Some(d) => {
                    entry.big_data_digests.insert(key.to_string(), d);
                }
                None => {
                    entry.big_data_digests.remove(key);
                }
            }
            Ok(())
        })
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(tmp: &Path) -> ImageStore {
        ImageStore::open(&tmp.join("dir-images")).unwrap()
    }

    #[test]
    fn test_create_and_lookup_by_digest() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path());

        let manifest = br#"{"schemaVersion":2}"#;
        let digest = Digest::sha256(manifest);
        let image = store
            .create(
                None,
                &["registry.example.com/app:latest".to_string()],
                Some("toplayer"),
                &ImageOptions::default(),
            )
            .unwrap();
        store
            .set_big_data(&image.id, "manifest", manifest, Some(digest.clone()))
            .unwrap();

        let found = store.by_digest(&digest).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, image.id);
        assert_eq!(store.big_data(&image.id, "manifest").unwrap(), manifest);
        assert_eq!(
            store.big_data_size(&image.id, "manifest").unwrap(),
            manifest.len() as i64
        );
        assert_eq!(store.big_data_digest(&image.id, "manifest").unwrap(), digest);
    }

    #[test]
    fn test_mapped_top_layers() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path());

        let image = store
            .create(None, &[], Some("top"), &ImageOptions::default())
            .unwrap();
        store.add_mapped_top_layer(&image.id, "mapped1").unwrap();
        store.add_mapped_top_layer(&image.id, "mapped1").unwrap();
        assert_eq!(
            store.get(&image.id).unwrap().mapped_top_layers,
            vec!["mapped1"]
        );

        assert_eq!(store.by_top_layer("mapped1").unwrap().len(), 1);
        store.remove_mapped_top_layer(&image.id, "mapped1").unwrap();
        assert!(store.by_top_layer("mapped1").unwrap().is_empty());
    }

    #[test]
    fn test_names_history_accumulates() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path());

        let image = store
            .create(None, &["first".to_string()], None, &ImageOptions::default())
            .unwrap();
        store
            .update_names(
                &image.id,
                &["second".to_string()],
                NameOperation::Set,
            )
            .unwrap();
        let image = store.get(&image.id).unwrap();
        assert_eq!(image.names, vec!["second"]);
        assert_eq!(image.names_history, vec!["first", "second"]);
    }
}
